//! Request/reply client for interpreters and auxiliary processors.
//!
//! # Thread Safety
//!
//! The connection sits behind a tokio `Mutex`, so one request is in flight
//! at a time and its reply is the next frame read. Concurrent callers queue.

use super::channel::Channel;
use crate::config::{AccessConfig, Endpoint};
use crate::identity::ProcessorIdentity;
use crate::svar::{ControlMask, Coupling, SvarEvents, SvarKey, SvarState};
use crate::wire::Signal;
use crate::{DatabaseFormat, Result, SvpError};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

fn unexpected(expected: &'static str, actual: &Signal) -> SvpError {
    SvpError::UnexpectedReply {
        expected,
        actual: actual.kind().to_string(),
    }
}

/// A command connection to the broker.
#[derive(Debug)]
pub struct SvpClient {
    channel: Mutex<Channel>,
    endpoint: Endpoint,
    identity: ProcessorIdentity,
    reply_timeout: Duration,
}

impl SvpClient {
    /// Connect and register as `identity`.
    pub async fn connect(endpoint: &Endpoint, identity: ProcessorIdentity) -> Result<Self> {
        let mut client = Self::connect_anonymous(endpoint).await?;
        client.register(identity).await?;
        Ok(client)
    }

    /// Connect without registering. Only identity-free requests will
    /// succeed until [`SvpClient::register`] is called.
    pub async fn connect_anonymous(endpoint: &Endpoint) -> Result<Self> {
        let channel = Channel::open(endpoint).await?;
        Ok(Self {
            channel: Mutex::new(channel),
            endpoint: endpoint.clone(),
            identity: ProcessorIdentity::NONE,
            reply_timeout: AccessConfig::REPLY_TIMEOUT,
        })
    }

    /// Override how long [`SvpClient::call`] waits for a reply.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn identity(&self) -> ProcessorIdentity {
        self.identity
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Register this connection as `identity`.
    pub async fn register(&mut self, identity: ProcessorIdentity) -> Result<()> {
        let request = Signal::RegisterProcessor {
            identity,
            pid: std::process::id(),
        };
        match self.call(request).await? {
            Signal::YesNo { yes: true } => {
                self.identity = identity;
                Ok(())
            }
            Signal::YesNo { yes: false } => Err(SvpError::AlreadyRegistered(identity)),
            other => Err(unexpected("YesNo", &other)),
        }
    }

    /// Send one request and wait for its reply.
    ///
    /// An `Error` reply becomes [`SvpError::Remote`]; a missing reply is a
    /// retryable [`SvpError::Timeout`]. The reply to a timed-out request is
    /// discarded when it arrives, so a retry on the same client gets its own
    /// answer.
    pub async fn call(&self, request: Signal) -> Result<Signal> {
        let kind = request.kind();
        let mut channel = self.channel.lock().await;
        channel.send_request(&request).await?;

        let received = tokio::time::timeout(self.reply_timeout, channel.recv_reply()).await;
        let reply = received
            .map_err(|_| SvpError::Timeout(self.reply_timeout))??
            .ok_or_else(|| SvpError::ConnectionLost {
                peer: channel.peer().to_string(),
            })?;
        debug!("{} answered with {}", kind, reply.kind());

        match reply {
            Signal::Error { code, location } => Err(SvpError::from_remote(code, location)),
            reply => Ok(reply),
        }
    }

    async fn yes_no(&self, request: Signal) -> Result<bool> {
        match self.call(request).await? {
            Signal::YesNo { yes } => Ok(yes),
            other => Err(unexpected("YesNo", &other)),
        }
    }

    pub async fn is_registered(&self, identity: ProcessorIdentity) -> Result<bool> {
        self.yes_no(Signal::IsRegistered { identity }).await
    }

    /// Offer `name` to `to`, or accept a matching offer.
    ///
    /// A null key means the broker could not record the offer.
    pub async fn match_or_make(
        &self,
        name: &str,
        to: ProcessorIdentity,
    ) -> Result<(SvarKey, Coupling)> {
        let request = Signal::MatchOrMake {
            name: name.to_string(),
            to,
            from: self.identity,
        };
        match self.call(request).await? {
            Signal::MatchOrMakeResult { key, coupling } => Ok((key, coupling)),
            other => Err(unexpected("MatchOrMakeResult", &other)),
        }
    }

    /// Withdraw this processor's side; returns the coupling before.
    pub async fn retract(&self, key: SvarKey) -> Result<Coupling> {
        match self.call(Signal::RetractOffer { key }).await? {
            Signal::RetractResult { old_coupling, .. } => Ok(old_coupling),
            other => Err(unexpected("RetractResult", &other)),
        }
    }

    pub async fn may_use(&self, key: SvarKey, attempt: u32) -> Result<bool> {
        self.yes_no(Signal::MayUse { key, attempt }).await
    }

    pub async fn may_set(&self, key: SvarKey, attempt: u32) -> Result<bool> {
        self.yes_no(Signal::MaySet { key, attempt }).await
    }

    pub async fn set_state(&self, key: SvarKey, used: bool) -> Result<SvarState> {
        match self.call(Signal::SetState { key, used }).await? {
            Signal::StateIs { state, .. } => Ok(state),
            other => Err(unexpected("StateIs", &other)),
        }
    }

    pub async fn get_state(&self, key: SvarKey) -> Result<SvarState> {
        match self.call(Signal::GetState { key }).await? {
            Signal::StateIs { state, .. } => Ok(state),
            other => Err(unexpected("StateIs", &other)),
        }
    }

    /// Replace this side's restrictions; returns the effective control.
    pub async fn set_control(&self, key: SvarKey, control: ControlMask) -> Result<ControlMask> {
        match self.call(Signal::SetControl { key, control }).await? {
            Signal::ControlIs { control, .. } => Ok(control),
            other => Err(unexpected("ControlIs", &other)),
        }
    }

    pub async fn get_control(&self, key: SvarKey) -> Result<ControlMask> {
        match self.call(Signal::GetControl { key }).await? {
            Signal::ControlIs { control, .. } => Ok(control),
            other => Err(unexpected("ControlIs", &other)),
        }
    }

    pub async fn get_coupling(&self, key: SvarKey) -> Result<Coupling> {
        match self.call(Signal::GetCoupling { key }).await? {
            Signal::CouplingIs { coupling, .. } => Ok(coupling),
            other => Err(unexpected("CouplingIs", &other)),
        }
    }

    pub async fn get_varname(&self, key: SvarKey) -> Result<String> {
        match self.call(Signal::GetVarname { key }).await? {
            Signal::VarnameIs { name, .. } => Ok(name),
            other => Err(unexpected("VarnameIs", &other)),
        }
    }

    /// Fetch the current payload. Does not check or change the access
    /// state; see [`crate::client::read_value`].
    pub async fn get_value(&self, key: SvarKey) -> Result<Vec<u8>> {
        match self.call(Signal::GetValue { key }).await? {
            Signal::ValueIs {
                error: 0, payload, ..
            } => Ok(payload),
            Signal::ValueIs {
                error, error_loc, ..
            } => Err(SvpError::from_remote(error, error_loc)),
            other => Err(unexpected("ValueIs", &other)),
        }
    }

    pub async fn assign_value(&self, key: SvarKey, payload: Vec<u8>) -> Result<()> {
        match self.call(Signal::AssignValue { key, payload }).await? {
            Signal::AssignWas { error: 0, .. } => Ok(()),
            Signal::AssignWas {
                error, error_loc, ..
            } => Err(SvpError::from_remote(error, error_loc)),
            other => Err(unexpected("AssignWas", &other)),
        }
    }

    /// The first variable with events pending for `identity`.
    pub async fn get_events(
        &self,
        identity: ProcessorIdentity,
    ) -> Result<Option<(SvarKey, SvarEvents)>> {
        match self.call(Signal::GetEvents { identity }).await? {
            Signal::EventsAre { key, .. } if key.is_null() => Ok(None),
            Signal::EventsAre { key, events } => Ok(Some((key, events))),
            other => Err(unexpected("EventsAre", &other)),
        }
    }

    pub async fn clear_all_events(&self, identity: ProcessorIdentity) -> Result<SvarEvents> {
        match self.call(Signal::ClearAllEvents { identity }).await? {
            Signal::AllEventsCleared { events } => Ok(events),
            other => Err(unexpected("AllEventsCleared", &other)),
        }
    }

    pub async fn add_event(
        &self,
        key: SvarKey,
        identity: ProcessorIdentity,
        events: SvarEvents,
    ) -> Result<bool> {
        self.yes_no(Signal::AddEvent {
            key,
            identity,
            events,
        })
        .await
    }

    pub async fn find_offering_id(&self, key: SvarKey) -> Result<Option<ProcessorIdentity>> {
        match self.call(Signal::FindOfferingId { key }).await? {
            Signal::OfferingIdIs { identity, .. } if identity.is_none() => Ok(None),
            Signal::OfferingIdIs { identity, .. } => Ok(Some(identity)),
            other => Err(unexpected("OfferingIdIs", &other)),
        }
    }

    pub async fn offering_processors(
        &self,
        target: ProcessorIdentity,
    ) -> Result<Vec<ProcessorIdentity>> {
        match self.call(Signal::GetOfferingProcs { target }).await? {
            Signal::OfferingProcsAre { procs } => Ok(procs),
            other => Err(unexpected("OfferingProcsAre", &other)),
        }
    }

    pub async fn offered_variables(
        &self,
        target: ProcessorIdentity,
        from: ProcessorIdentity,
    ) -> Result<Vec<String>> {
        match self.call(Signal::GetOfferedVars { target, from }).await? {
            Signal::OfferedVarsAre { names } => Ok(names),
            other => Err(unexpected("OfferedVarsAre", &other)),
        }
    }

    pub async fn find_pairing_key(&self, key: SvarKey) -> Result<Option<SvarKey>> {
        match self.call(Signal::FindPairingKey { key }).await? {
            Signal::PairingKeyIs { pairing, .. } if pairing.is_null() => Ok(None),
            Signal::PairingKeyIs { pairing, .. } => Ok(Some(pairing)),
            other => Err(unexpected("PairingKeyIs", &other)),
        }
    }

    pub async fn print_database(&self, format: DatabaseFormat) -> Result<String> {
        let request = Signal::PrintDatabase {
            format: format.as_u8(),
        };
        match self.call(request).await? {
            Signal::DatabasePrinted { text } => Ok(text),
            other => Err(unexpected("DatabasePrinted", &other)),
        }
    }
}
