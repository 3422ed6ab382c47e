//! Listening for pushed notifications.

use super::channel::Channel;
use crate::config::{AccessConfig, Endpoint};
use crate::identity::ProcessorIdentity;
use crate::svar::{SvarEvents, SvarKey};
use crate::wire::Signal;
use crate::{Result, SvpError};
use tracing::warn;

/// A notification pushed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// `from` offered `name` to this processor.
    OfferMade {
        key: SvarKey,
        name: String,
        from: ProcessorIdentity,
    },
    /// An offer made by this processor was accepted by `by`.
    OfferMatched { key: SvarKey, by: ProcessorIdentity },
    /// The partner `by` retracted or went away.
    OfferRetracted { key: SvarKey, by: ProcessorIdentity },
    EventsPending { key: SvarKey, events: SvarEvents },
}

impl Notification {
    pub fn key(&self) -> SvarKey {
        match self {
            Notification::OfferMade { key, .. }
            | Notification::OfferMatched { key, .. }
            | Notification::OfferRetracted { key, .. }
            | Notification::EventsPending { key, .. } => *key,
        }
    }
}

impl TryFrom<Signal> for Notification {
    type Error = Signal;

    fn try_from(signal: Signal) -> std::result::Result<Self, Signal> {
        match signal {
            Signal::OfferMade { key, name, from } => Ok(Notification::OfferMade { key, name, from }),
            Signal::OfferMatched { key, by } => Ok(Notification::OfferMatched { key, by }),
            Signal::OfferRetracted { key, by } => Ok(Notification::OfferRetracted { key, by }),
            Signal::EventsPending { key, events } => Ok(Notification::EventsPending { key, events }),
            other => Err(other),
        }
    }
}

/// The event channel of one registered processor.
#[derive(Debug)]
pub struct EventListener {
    channel: Channel,
    identity: ProcessorIdentity,
}

impl EventListener {
    /// Open a second connection and make it `identity`'s event channel.
    ///
    /// `identity` must already be registered on a command connection.
    pub async fn connect(endpoint: &Endpoint, identity: ProcessorIdentity) -> Result<Self> {
        let mut channel = Channel::open(endpoint).await?;
        channel
            .send_request(&Signal::RegisterEventChannel { identity })
            .await?;

        let received = tokio::time::timeout(AccessConfig::REPLY_TIMEOUT, channel.recv_reply())
            .await
            .map_err(|_| SvpError::Timeout(AccessConfig::REPLY_TIMEOUT))??;
        match received {
            Some(Signal::YesNo { yes: true }) => Ok(Self { channel, identity }),
            Some(Signal::YesNo { yes: false }) => Err(SvpError::NotRegistered(identity)),
            Some(other) => Err(SvpError::UnexpectedReply {
                expected: "YesNo",
                actual: other.kind().to_string(),
            }),
            None => Err(SvpError::ConnectionLost {
                peer: channel.peer().to_string(),
            }),
        }
    }

    pub fn identity(&self) -> ProcessorIdentity {
        self.identity
    }

    /// Wait for the next notification; `None` once the broker hung up.
    ///
    /// Cancel safe: a notification still arriving when the caller stops
    /// waiting is returned by the next call.
    pub async fn next(&mut self) -> Result<Option<Notification>> {
        loop {
            let Some(signal) = self.channel.recv().await? else {
                return Ok(None);
            };
            match Notification::try_from(signal) {
                Ok(notification) => return Ok(Some(notification)),
                Err(other) => warn!("Ignoring {} on event channel of {}", other.kind(), self.identity),
            }
        }
    }
}
