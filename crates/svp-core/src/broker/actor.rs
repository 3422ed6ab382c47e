//! The broker task.
//!
//! One task owns the shared-variable table and the connection registry.
//! Connection tasks only move frames; everything they read arrives here as a
//! [`BrokerEvent`] and is handled to completion before the next one, so
//! requests on one connection are answered in order and every request gets
//! exactly one reply.

use super::registry::{ConnRole, ConnectionEntry, ConnectionRegistry, ConnectionSnapshot};
use crate::config::{BrokerConfig, SvpConfig};
use crate::identity::{ConnId, ProcessorIdentity};
use crate::svar::{
    ControlMask, Coupling, MatchOutcome, RecordSnapshot, Side, SvarDb, SvarEvents, SvarKey,
    SvarName, SvarRecord, SvarState,
};
use crate::wire::{Signal, SignalKind};
use crate::{Result, SvpError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Everything a connection task reports to the broker.
#[derive(Debug)]
pub(crate) enum BrokerEvent {
    Connected {
        conn: ConnId,
        peer: String,
        outbound: mpsc::Sender<Signal>,
        close: oneshot::Sender<()>,
    },
    Request {
        conn: ConnId,
        signal: Signal,
    },
    /// A frame arrived but did not decode.
    Malformed {
        conn: ConnId,
        error: SvpError,
    },
    Disconnected {
        conn: ConnId,
    },
}

/// Output format of `PrintDatabase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseFormat {
    Text,
    Json,
}

impl DatabaseFormat {
    pub fn as_u8(self) -> u8 {
        match self {
            DatabaseFormat::Text => 0,
            DatabaseFormat::Json => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DatabaseFormat::Text),
            1 => Some(DatabaseFormat::Json),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct DatabaseDump {
    started_at: DateTime<Utc>,
    variables: Vec<RecordSnapshot>,
    connections: Vec<ConnectionSnapshot>,
}

/// The owner of all broker state.
#[derive(Debug)]
pub struct Broker {
    db: SvarDb,
    registry: ConnectionRegistry,
    started_at: DateTime<Utc>,
}

impl Broker {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            db: SvarDb::new(config.max_variables),
            registry: ConnectionRegistry::new(),
            started_at: Utc::now(),
        }
    }

    pub fn db(&self) -> &SvarDb {
        &self.db
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Process events until every sender is gone.
    pub(crate) async fn run(mut self, mut events: mpsc::Receiver<BrokerEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!(
            "Broker task finished with {} variables and {} connections",
            self.db.len(),
            self.registry.len()
        );
    }

    fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected {
                conn,
                peer,
                outbound,
                close,
            } => {
                self.registry
                    .insert(ConnectionEntry::new(conn, peer, outbound, close));
            }
            BrokerEvent::Request { conn, signal } => {
                let reply = self.dispatch(conn, signal);
                if !self.registry.send(conn, reply) {
                    debug!("Reply to {} dropped, connection gone", conn);
                }
            }
            BrokerEvent::Malformed { conn, error } => {
                warn!("Undecodable frame from {}: {}", conn, error);
                self.registry.send(conn, Signal::error(&error, "decode"));
            }
            BrokerEvent::Disconnected { conn } => self.disconnect(conn),
        }
    }

    /// Handle one request and build its reply.
    ///
    /// Failures never escape: each request kind has a zero-valued answer
    /// that is sent instead.
    pub fn dispatch(&mut self, conn: ConnId, signal: Signal) -> Signal {
        let kind = signal.kind();
        let key = request_key(&signal);
        match self.handle(conn, signal) {
            Ok(reply) => reply,
            Err(err) => {
                warn!("{} from {} failed: {}", kind, conn, err);
                refusal(kind, key, &err)
            }
        }
    }

    fn caller(&self, conn: ConnId) -> Result<ProcessorIdentity> {
        self.registry
            .identity_of(conn)
            .ok_or(SvpError::NotRegistered(ProcessorIdentity::NONE))
    }

    fn handle(&mut self, conn: ConnId, signal: Signal) -> Result<Signal> {
        match signal {
            Signal::RegisterProcessor { identity, pid } => {
                self.registry.register(conn, identity, pid)?;
                info!("Processor {} (pid {}) registered on {}", identity, pid, conn);
                Ok(Signal::YesNo { yes: true })
            }
            Signal::RegisterEventChannel { identity } => {
                self.registry.register_event_channel(conn, identity)?;
                Ok(Signal::YesNo { yes: true })
            }
            Signal::IsRegistered { identity } => Ok(Signal::YesNo {
                yes: self.registry.is_registered(&identity),
            }),

            Signal::MatchOrMake { name, to, from } => self.match_or_make(conn, name, to, from),
            Signal::RetractOffer { key } => self.retract(conn, key),
            Signal::FindPairingKey { key } => Ok(Signal::PairingKeyIs {
                key,
                pairing: self.db.find_pairing_key(key).unwrap_or(SvarKey::NULL),
            }),

            Signal::MayUse { key, attempt } => {
                let caller = self.caller(conn)?;
                let (rec, side) = active_partner(&mut self.db, key, &caller)?;
                Ok(Signal::YesNo {
                    yes: rec.may_use(side, attempt),
                })
            }
            Signal::MaySet { key, attempt } => {
                let caller = self.caller(conn)?;
                let (rec, side) = active_partner(&mut self.db, key, &caller)?;
                Ok(Signal::YesNo {
                    yes: rec.may_set(side, attempt),
                })
            }
            Signal::SetState { key, used } => {
                let caller = self.caller(conn)?;
                let (rec, side) = active_partner(&mut self.db, key, &caller)?;
                let state = rec.set_state(used, side);
                notify_partner(&self.registry, rec, side.other());
                Ok(Signal::StateIs { key, state })
            }
            Signal::GetState { key } => {
                let rec = self.record(key)?;
                Ok(Signal::StateIs {
                    key,
                    state: rec.state,
                })
            }
            Signal::SetControl { key, control } => {
                let caller = self.caller(conn)?;
                let (rec, side) = active_partner(&mut self.db, key, &caller)?;
                let control = rec.set_control(side, control);
                notify_partner(&self.registry, rec, side.other());
                Ok(Signal::ControlIs { key, control })
            }
            Signal::GetControl { key } => Ok(Signal::ControlIs {
                key,
                control: self.record(key)?.control(),
            }),
            Signal::GetCoupling { key } => Ok(Signal::CouplingIs {
                key,
                coupling: self.record(key)?.coupling(),
            }),
            Signal::GetVarname { key } => Ok(Signal::VarnameIs {
                key,
                name: self.record(key)?.name.to_string(),
            }),

            Signal::GetValue { key } => {
                let caller = self.caller(conn)?;
                let (rec, _) = active_partner(&mut self.db, key, &caller)?;
                let payload = rec.value.clone().ok_or(SvpError::NoValue(key.0))?;
                Ok(Signal::ValueIs {
                    key,
                    error: 0,
                    error_loc: String::new(),
                    payload,
                })
            }
            Signal::AssignValue { key, payload } => {
                let caller = self.caller(conn)?;
                let (rec, _) = active_partner(&mut self.db, key, &caller)?;
                debug!("{} assigned {} bytes to {}", caller, payload.len(), rec.name);
                rec.value = Some(payload);
                Ok(Signal::AssignWas {
                    key,
                    error: 0,
                    error_loc: String::new(),
                })
            }

            Signal::GetEvents { identity } => {
                let (key, events) = self
                    .db
                    .get_events(&identity)
                    .unwrap_or((SvarKey::NULL, SvarEvents::empty()));
                Ok(Signal::EventsAre { key, events })
            }
            Signal::ClearAllEvents { identity } => Ok(Signal::AllEventsCleared {
                events: self.db.clear_all_events(&identity),
            }),
            Signal::AddEvent {
                key,
                identity,
                events,
            } => {
                self.db.add_event(key, &identity, events)?;
                if let Some(rec) = self.db.get(key) {
                    if let Some(side) = rec.active_side_of(&identity) {
                        notify_partner(&self.registry, rec, side);
                    }
                }
                Ok(Signal::YesNo { yes: true })
            }

            Signal::FindOfferingId { key } => Ok(Signal::OfferingIdIs {
                key,
                identity: self
                    .db
                    .find_offering_id(key)
                    .ok_or(SvpError::UnknownKey(key.0))?,
            }),
            Signal::GetOfferingProcs { target } => Ok(Signal::OfferingProcsAre {
                procs: self.db.offering_processors(&target),
            }),
            Signal::GetOfferedVars { target, from } => Ok(Signal::OfferedVarsAre {
                names: self
                    .db
                    .offered_variables(&target, &from)
                    .iter()
                    .map(SvarName::to_string)
                    .collect(),
            }),
            Signal::PrintDatabase { format } => {
                let format = DatabaseFormat::from_u8(format).ok_or_else(|| SvpError::Malformed {
                    kind: SignalKind::PrintDatabase.name().to_string(),
                    message: format!("unknown format {}", format),
                })?;
                Ok(Signal::DatabasePrinted {
                    text: self.print_database(format)?,
                })
            }

            other => Err(SvpError::Malformed {
                kind: other.kind().name().to_string(),
                message: "not a request".to_string(),
            }),
        }
    }

    fn record(&self, key: SvarKey) -> Result<&SvarRecord> {
        self.db.get(key).ok_or(SvpError::UnknownKey(key.0))
    }

    fn match_or_make(
        &mut self,
        conn: ConnId,
        name: String,
        to: ProcessorIdentity,
        from: ProcessorIdentity,
    ) -> Result<Signal> {
        let caller = self.caller(conn)?;
        if from != caller {
            warn!("{} on {} tried to offer as {}", caller, conn, from);
            return Err(SvpError::NotPartner {
                key: 0,
                identity: from,
            });
        }
        let name = SvarName::new(name)?;

        let outcome = self.db.match_or_make(&name, &to, &from, conn);
        match &outcome {
            MatchOutcome::Matched { key, offerer } => {
                self.registry
                    .push(offerer, Signal::OfferMatched { key: *key, by: from });
            }
            MatchOutcome::Created { key, target } => {
                if !target.is_general() {
                    self.registry.push(
                        target,
                        Signal::OfferMade {
                            key: *key,
                            name: name.to_string(),
                            from,
                        },
                    );
                }
            }
            MatchOutcome::TableFull => {
                return Err(SvpError::TableFull {
                    capacity: self.db.capacity().unwrap_or(self.db.len()),
                });
            }
        }
        Ok(Signal::MatchOrMakeResult {
            key: outcome.key(),
            coupling: outcome.coupling(),
        })
    }

    fn retract(&mut self, conn: ConnId, key: SvarKey) -> Result<Signal> {
        let caller = self.caller(conn)?;
        let release = self.db.retract(key, &caller)?;
        info!("{} retracted {} ({})", caller, release.name, key);
        if let Some(remaining) = release.remaining {
            self.announce_retraction(key, &remaining, &caller);
        }
        Ok(Signal::RetractResult {
            key,
            old_coupling: release.old_coupling,
        })
    }

    /// Auxiliary processors learn about retractions by polling.
    fn announce_retraction(
        &self,
        key: SvarKey,
        remaining: &ProcessorIdentity,
        by: &ProcessorIdentity,
    ) {
        if !remaining.is_ap() {
            self.registry
                .push(remaining, Signal::OfferRetracted { key, by: *by });
        }
    }

    /// Clean up after a connection that went away.
    ///
    /// Sides held over a departing command connection are released, and
    /// every processor descending from the departing identity is
    /// disconnected too.
    fn disconnect(&mut self, conn: ConnId) {
        let mut pending = vec![conn];
        while let Some(conn) = pending.pop() {
            let Some(entry) = self.registry.remove(conn) else {
                continue;
            };
            entry.close();
            let Some(identity) = entry.identity else {
                debug!("Unregistered {} from {} closed", conn, entry.peer);
                continue;
            };
            if entry.role == ConnRole::Events {
                debug!("Event channel of {} closed", identity);
                continue;
            }

            let releases = self.db.disconnect(conn);
            info!(
                "Processor {} disconnected, released {} variables",
                identity,
                releases.len()
            );
            for release in &releases {
                if let Some(remaining) = release.remaining {
                    self.announce_retraction(release.key, &remaining, &identity);
                }
            }

            if let Some(events) = self.registry.event_channel_of(&identity) {
                pending.push(events);
            }
            for (dep_conn, dep) in self.registry.dependents_of(&identity) {
                info!("Disconnecting {} along with {}", dep, identity);
                pending.push(dep_conn);
            }
        }
    }

    /// Render the table and the connections, cut to fit one string field.
    pub fn print_database(&self, format: DatabaseFormat) -> Result<String> {
        let text = match format {
            DatabaseFormat::Json => serde_json::to_string_pretty(&DatabaseDump {
                started_at: self.started_at,
                variables: self.db.snapshot(),
                connections: self.registry.snapshot(),
            })?,
            DatabaseFormat::Text => self.render_text(),
        };
        Ok(truncate_utf8(text, SvpConfig::MAX_STRING_FIELD))
    }

    fn render_text(&self) -> String {
        let mut out = format!(
            "SVP database: {} variables, {} connections, up since {}\n",
            self.db.len(),
            self.registry.len(),
            self.started_at.format("%Y-%m-%d %H:%M:%S")
        );
        out.push_str(&format!(
            "  {:<12} {:<16} {:<9} {:<17} {:<5} {:<16} {:<16} {}\n",
            "KEY", "NAME", "COUPLING", "STATE", "CTL", "OFFERING", "ACCEPTING", "CREATED"
        ));
        for rec in self.db.snapshot() {
            let partner = |active: bool, id: &ProcessorIdentity| {
                format!("{}{}", id, if active { "*" } else { "" })
            };
            out.push_str(&format!(
                "  {:<12} {:<16} {:<9} {:<17} {:04b}  {:<16} {:<16} {}\n",
                rec.key.to_string(),
                rec.name.as_str(),
                rec.coupling.to_string(),
                rec.state.to_string(),
                rec.control,
                partner(rec.offering.active, &rec.offering.id),
                partner(rec.accepting.active, &rec.accepting.id),
                rec.created_at.format("%H:%M:%S")
            ));
        }
        out.push_str("connections:\n");
        for c in self.registry.snapshot() {
            let identity = c
                .identity
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());
            let role = match c.role {
                ConnRole::Command => "command",
                ConnRole::Events => "events",
            };
            out.push_str(&format!(
                "  {:<8} {:<22} {:<16} {:<8} pid {}\n",
                c.conn.to_string(),
                c.peer,
                identity,
                role,
                c.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
            ));
        }
        out
    }
}

/// The side `caller` plays in `key`, which must be active.
fn active_partner<'a>(
    db: &'a mut SvarDb,
    key: SvarKey,
    caller: &ProcessorIdentity,
) -> Result<(&'a mut SvarRecord, Side)> {
    let (rec, side) = db.partner_of(key, caller)?;
    if !rec.partner(side).is_active() {
        return Err(SvpError::NotPartner {
            key: key.0,
            identity: *caller,
        });
    }
    Ok((rec, side))
}

/// Push the pending events of `side` to its event channel.
fn notify_partner(registry: &ConnectionRegistry, rec: &SvarRecord, side: Side) {
    let partner = rec.partner(side);
    if partner.is_active() && !partner.events.is_empty() {
        registry.push(
            &partner.id,
            Signal::EventsPending {
                key: rec.key,
                events: partner.events,
            },
        );
    }
}

fn request_key(signal: &Signal) -> SvarKey {
    match signal {
        Signal::RetractOffer { key }
        | Signal::FindPairingKey { key }
        | Signal::MayUse { key, .. }
        | Signal::MaySet { key, .. }
        | Signal::SetState { key, .. }
        | Signal::GetState { key }
        | Signal::SetControl { key, .. }
        | Signal::GetControl { key }
        | Signal::GetCoupling { key }
        | Signal::GetVarname { key }
        | Signal::GetValue { key }
        | Signal::AssignValue { key, .. }
        | Signal::AddEvent { key, .. }
        | Signal::FindOfferingId { key } => *key,
        _ => SvarKey::NULL,
    }
}

/// The "not found" answer to a request of `kind` that failed.
fn refusal(kind: SignalKind, key: SvarKey, err: &SvpError) -> Signal {
    let code = err.error_code();
    let location = kind.name().to_string();
    match kind {
        SignalKind::RegisterProcessor
        | SignalKind::RegisterEventChannel
        | SignalKind::IsRegistered
        | SignalKind::MayUse
        | SignalKind::MaySet
        | SignalKind::AddEvent => Signal::YesNo { yes: false },
        SignalKind::MatchOrMake => Signal::MatchOrMakeResult {
            key: SvarKey::NULL,
            coupling: Coupling::None,
        },
        SignalKind::RetractOffer => Signal::RetractResult {
            key,
            old_coupling: Coupling::None,
        },
        SignalKind::FindPairingKey => Signal::PairingKeyIs {
            key,
            pairing: SvarKey::NULL,
        },
        SignalKind::SetState | SignalKind::GetState => Signal::StateIs {
            key,
            state: SvarState::NotShared,
        },
        SignalKind::SetControl | SignalKind::GetControl => Signal::ControlIs {
            key,
            control: ControlMask::empty(),
        },
        SignalKind::GetCoupling => Signal::CouplingIs {
            key,
            coupling: Coupling::None,
        },
        SignalKind::GetVarname => Signal::VarnameIs {
            key,
            name: String::new(),
        },
        SignalKind::GetValue => Signal::ValueIs {
            key,
            error: code,
            error_loc: location,
            payload: Vec::new(),
        },
        SignalKind::AssignValue => Signal::AssignWas {
            key,
            error: code,
            error_loc: location,
        },
        SignalKind::GetEvents => Signal::EventsAre {
            key: SvarKey::NULL,
            events: SvarEvents::empty(),
        },
        SignalKind::ClearAllEvents => Signal::AllEventsCleared {
            events: SvarEvents::empty(),
        },
        SignalKind::FindOfferingId => Signal::OfferingIdIs {
            key,
            identity: ProcessorIdentity::NONE,
        },
        SignalKind::GetOfferingProcs => Signal::OfferingProcsAre { procs: Vec::new() },
        SignalKind::GetOfferedVars => Signal::OfferedVarsAre { names: Vec::new() },
        SignalKind::PrintDatabase => Signal::DatabasePrinted {
            text: String::new(),
        },
        _ => Signal::Error { code, location },
    }
}

fn truncate_utf8(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}
