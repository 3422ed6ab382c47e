//! The shared-variable table and the offer matching engine.
//!
//! The table is owned by exactly one task (the broker actor), so nothing in
//! here locks. Callers get keys and copies back, never references that
//! outlive a call.

use super::control::{Coupling, Side, SvarEvents, SvarState};
use super::pairing;
use super::record::{Partner, SvarKey, SvarName, SvarRecord};
use crate::identity::{ConnId, ProcessorIdentity};
use crate::{Result, SvpError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Sequence bits kept below the processor number; the rest go above it.
const KEY_LOW_BITS: u32 = 16;
const KEY_LOW_MASK: u64 = (1 << KEY_LOW_BITS) - 1;
/// Bit offset of the high sequence bits, past the 32-bit processor number.
const KEY_HIGH_SHIFT: u32 = KEY_LOW_BITS + 32;
/// Sequence numbers available before a key would repeat.
const KEY_SEQUENCE_LIMIT: u64 = 1 << (KEY_LOW_BITS + (64 - KEY_HIGH_SHIFT));

/// Result of [`SvarDb::match_or_make`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// A pending offer was coupled; its offerer should hear about it.
    Matched {
        key: SvarKey,
        offerer: ProcessorIdentity,
    },
    /// No offer matched, so a new one was recorded for `target`.
    Created {
        key: SvarKey,
        target: ProcessorIdentity,
    },
    /// The table is at capacity.
    TableFull,
}

impl MatchOutcome {
    /// The key to report to the requester; null when the table is full.
    pub fn key(&self) -> SvarKey {
        match self {
            MatchOutcome::Matched { key, .. } | MatchOutcome::Created { key, .. } => *key,
            MatchOutcome::TableFull => SvarKey::NULL,
        }
    }

    pub fn coupling(&self) -> Coupling {
        match self {
            MatchOutcome::Matched { .. } => Coupling::Coupled,
            MatchOutcome::Created { .. } => Coupling::Offered,
            MatchOutcome::TableFull => Coupling::None,
        }
    }
}

/// One side leaving a shared variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub key: SvarKey,
    pub name: SvarName,
    pub old_coupling: Coupling,
    /// The partner that is still active, if any.
    pub remaining: Option<ProcessorIdentity>,
    /// True if the record was removed because nobody is left.
    pub removed: bool,
}

/// Serializable view of one partner.
#[derive(Debug, Clone, Serialize)]
pub struct PartnerSnapshot {
    pub id: ProcessorIdentity,
    pub active: bool,
    pub control: u8,
    pub events: u32,
}

/// Serializable view of one record.
#[derive(Debug, Clone, Serialize)]
pub struct RecordSnapshot {
    pub key: SvarKey,
    pub name: SvarName,
    pub coupling: Coupling,
    pub state: SvarState,
    pub control: u8,
    pub offering: PartnerSnapshot,
    pub accepting: PartnerSnapshot,
    pub value_len: Option<usize>,
    pub created_at: DateTime<Utc>,
}

impl From<&Partner> for PartnerSnapshot {
    fn from(p: &Partner) -> Self {
        Self {
            id: p.id,
            active: p.is_active(),
            control: p.control.bits(),
            events: p.events.bits(),
        }
    }
}

impl From<&SvarRecord> for RecordSnapshot {
    fn from(rec: &SvarRecord) -> Self {
        Self {
            key: rec.key,
            name: rec.name.clone(),
            coupling: rec.coupling(),
            state: rec.state,
            control: rec.control().bits(),
            offering: PartnerSnapshot::from(&rec.offering),
            accepting: PartnerSnapshot::from(&rec.accepting),
            value_len: rec.value.as_ref().map(Vec::len),
            created_at: rec.created_at,
        }
    }
}

/// Can the pending offer `rec` be accepted by a request `(to, from)`?
fn offer_matches(rec: &SvarRecord, to: &ProcessorIdentity, from: &ProcessorIdentity) -> bool {
    let offered_to = &rec.accepting.id;
    if rec.offering.id == *from {
        // a processor never couples with itself
        return false;
    }
    if to.is_general() && offered_to.is_general() {
        return false;
    }
    if offered_to.is_general() {
        return rec.offering.id == *to;
    }
    if to.is_general() {
        return offered_to.proc == from.proc;
    }
    rec.offering.id == *to && *offered_to == *from
}

/// The shared-variable table.
#[derive(Debug, Default)]
pub struct SvarDb {
    records: HashMap<SvarKey, SvarRecord>,
    capacity: Option<usize>,
    /// Next key sequence number; only ever increases.
    sequence: u64,
    /// Creation counter for oldest-first ordering.
    serial: u64,
}

impl SvarDb {
    /// Create an empty table, optionally bounded to `capacity` records.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            records: HashMap::new(),
            capacity,
            sequence: 0,
            serial: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn get(&self, key: SvarKey) -> Option<&SvarRecord> {
        self.records.get(&key)
    }

    pub fn get_mut(&mut self, key: SvarKey) -> Option<&mut SvarRecord> {
        self.records.get_mut(&key)
    }

    /// Look up `key` and the side `caller` plays in it.
    pub fn partner_of(
        &mut self,
        key: SvarKey,
        caller: &ProcessorIdentity,
    ) -> Result<(&mut SvarRecord, Side)> {
        let rec = self
            .records
            .get_mut(&key)
            .ok_or(SvpError::UnknownKey(key.0))?;
        let side = rec.side_of(caller).ok_or(SvpError::NotPartner {
            key: key.0,
            identity: *caller,
        })?;
        Ok((rec, side))
    }

    /// Records in creation order.
    fn ordered(&self) -> Vec<&SvarRecord> {
        let mut recs: Vec<&SvarRecord> = self.records.values().collect();
        recs.sort_by_key(|r| r.serial);
        recs
    }

    /// The oldest pending offer named `name` that a request `(to, from)`
    /// would accept.
    pub fn find_pending_offer(
        &self,
        name: &SvarName,
        to: &ProcessorIdentity,
        from: &ProcessorIdentity,
    ) -> Option<SvarKey> {
        self.records
            .values()
            .filter(|r| r.is_pending_offer() && r.name == *name)
            .filter(|r| offer_matches(r, to, from))
            .min_by_key(|r| r.serial)
            .map(|r| r.key)
    }

    /// Couple with a pending offer, or record a new one.
    pub fn match_or_make(
        &mut self,
        name: &SvarName,
        to: &ProcessorIdentity,
        from: &ProcessorIdentity,
        conn: ConnId,
    ) -> MatchOutcome {
        if let Some(key) = self.find_pending_offer(name, to, from) {
            if let Some(rec) = self.records.get_mut(&key) {
                rec.couple(*from, conn);
                info!("{} coupled {} with {} (key {})", name, rec.offering.id, from, key);
                return MatchOutcome::Matched {
                    key,
                    offerer: rec.offering.id,
                };
            }
        }

        match self.create_offer(name, to, from, conn) {
            Some(key) => MatchOutcome::Created { key, target: *to },
            None => MatchOutcome::TableFull,
        }
    }

    /// Record a new offer from `from` to `to`.
    ///
    /// Returns `None` when the table is at capacity or no unused key is left
    /// for `from`.
    pub fn create_offer(
        &mut self,
        name: &SvarName,
        to: &ProcessorIdentity,
        from: &ProcessorIdentity,
        conn: ConnId,
    ) -> Option<SvarKey> {
        if let Some(capacity) = self.capacity {
            if self.records.len() >= capacity {
                warn!("Cannot offer {}: table full ({} entries)", name, capacity);
                return None;
            }
        }

        let key = self.next_key(from)?;
        let mut accepting = Partner::inactive(*to);
        if !to.is_general() {
            accepting.events |= SvarEvents::OFFER_MADE;
        }
        let serial = self.serial;
        self.serial += 1;

        let rec = SvarRecord::new(
            key,
            name.clone(),
            Partner::active(*from, conn),
            accepting,
            serial,
        );
        self.records.insert(key, rec);
        info!("{} offered {} to {} (key {})", from, name, to, key);
        Some(key)
    }

    /// `(from.proc << 16) | seq` while the sequence fits in 16 bits. Later
    /// sequence bits move above the processor number, so no key is handed
    /// out twice.
    fn next_key(&mut self, from: &ProcessorIdentity) -> Option<SvarKey> {
        loop {
            let seq = self.sequence;
            if seq >= KEY_SEQUENCE_LIMIT {
                warn!("Key sequence exhausted, refusing offer from {}", from);
                return None;
            }
            self.sequence += 1;
            let key = SvarKey(
                ((seq >> KEY_LOW_BITS) << KEY_HIGH_SHIFT)
                    | (u64::from(from.proc) << KEY_LOW_BITS)
                    | (seq & KEY_LOW_MASK),
            );
            if !key.is_null() {
                return Some(key);
            }
        }
    }

    /// Withdraw `caller`'s side of `key`.
    pub fn retract(&mut self, key: SvarKey, caller: &ProcessorIdentity) -> Result<Release> {
        let (rec, side) = self.partner_of(key, caller)?;
        if !rec.partner(side).is_active() {
            return Err(SvpError::NotPartner {
                key: key.0,
                identity: *caller,
            });
        }
        let release = Self::release_side(rec, side);
        debug!(
            "{} retracted {} (key {}, was {})",
            caller, release.name, key, release.old_coupling
        );
        Ok(self.reap_if_empty(release))
    }

    fn release_side(rec: &mut SvarRecord, side: Side) -> Release {
        let old_coupling = rec.release(side);
        let other = rec.partner(side.other());
        Release {
            key: rec.key,
            name: rec.name.clone(),
            old_coupling,
            remaining: other.is_active().then_some(other.id),
            removed: false,
        }
    }

    fn reap_if_empty(&mut self, mut release: Release) -> Release {
        let empty = self
            .records
            .get(&release.key)
            .is_some_and(|r| r.coupling() == Coupling::None);
        if empty {
            self.records.remove(&release.key);
            release.removed = true;
            debug!("Removed {} (key {})", release.name, release.key);
        }
        release
    }

    /// Release every side held over connection `conn`.
    pub fn disconnect(&mut self, conn: ConnId) -> Vec<Release> {
        let mut releases = Vec::new();
        for rec in self.records.values_mut() {
            for side in [Side::Offering, Side::Accepting] {
                if rec.partner(side).conn == Some(conn) {
                    releases.push(Self::release_side(rec, side));
                }
            }
        }
        let releases: Vec<Release> = releases
            .into_iter()
            .map(|release| self.reap_if_empty(release))
            .collect();
        self.reap();
        releases
    }

    /// Remove every record nobody is attached to. Returns how many went.
    pub fn reap(&mut self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.coupling() != Coupling::None);
        before - self.records.len()
    }

    /// The AP210 partner channel of `key`: a record with the paired name
    /// shared between the same two processors.
    pub fn find_pairing_key(&self, key: SvarKey) -> Option<SvarKey> {
        let rec = self.records.get(&key)?;
        let wanted = pairing::paired_name(rec.name.as_str())?;
        let ids = [rec.offering.id, rec.accepting.id];
        self.ordered()
            .into_iter()
            .filter(|r| r.key != key && r.name.as_str() == wanted)
            .find(|r| {
                let other = [r.offering.id, r.accepting.id];
                other == ids || other == [ids[1], ids[0]]
            })
            .map(|r| r.key)
    }

    /// The first record with events pending for `id`.
    pub fn get_events(&self, id: &ProcessorIdentity) -> Option<(SvarKey, SvarEvents)> {
        self.ordered().into_iter().find_map(|r| {
            let side = r.side_of(id)?;
            let events = r.partner(side).events;
            (!events.is_empty()).then_some((r.key, events))
        })
    }

    /// Drain the events pending for `id` on every record that names it.
    pub fn clear_all_events(&mut self, id: &ProcessorIdentity) -> SvarEvents {
        let mut drained = SvarEvents::empty();
        for rec in self.records.values_mut() {
            for side in [Side::Offering, Side::Accepting] {
                let partner = rec.partner_mut(side);
                if partner.id == *id {
                    drained |= partner.events;
                    partner.events = SvarEvents::empty();
                }
            }
        }
        drained
    }

    /// Add `events` to the side `id` plays in `key`.
    pub fn add_event(
        &mut self,
        key: SvarKey,
        id: &ProcessorIdentity,
        events: SvarEvents,
    ) -> Result<()> {
        let (rec, side) = self.partner_of(key, id)?;
        rec.add_event(side, events);
        Ok(())
    }

    pub fn find_offering_id(&self, key: SvarKey) -> Option<ProcessorIdentity> {
        self.records.get(&key).map(|r| r.offering.id)
    }

    /// Processors with pending offers addressed to `target` or general
    /// offers `target` could accept.
    pub fn offering_processors(&self, target: &ProcessorIdentity) -> Vec<ProcessorIdentity> {
        let mut procs: Vec<ProcessorIdentity> = Vec::new();
        for rec in self.ordered() {
            let to = &rec.accepting.id;
            let addressed = to.proc == target.proc || to.is_general();
            if rec.is_pending_offer()
                && addressed
                && rec.offering.id != *target
                && !procs.contains(&rec.offering.id)
            {
                procs.push(rec.offering.id);
            }
        }
        procs
    }

    /// Names of pending offers from `from` that `target` could accept.
    pub fn offered_variables(
        &self,
        target: &ProcessorIdentity,
        from: &ProcessorIdentity,
    ) -> Vec<SvarName> {
        self.ordered()
            .into_iter()
            .filter(|r| r.is_pending_offer() && r.offering.id.proc == from.proc)
            .filter(|r| r.accepting.id.proc == target.proc || r.accepting.id.is_general())
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<RecordSnapshot> {
        self.ordered().into_iter().map(RecordSnapshot::from).collect()
    }
}
