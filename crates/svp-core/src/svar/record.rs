//! The shared-variable record and its two partner slots.

use super::control::{ControlMask, Coupling, Side, SvarEvents, SvarState};
use crate::config::SvpConfig;
use crate::identity::{ConnId, ProcessorIdentity};
use crate::{Result, SvpError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Opaque handle of one shared variable, identical for both partners.
///
/// Zero is never a valid key; it is the "no variable" answer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SvarKey(pub u64);

impl SvarKey {
    pub const NULL: SvarKey = SvarKey(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SvarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A validated shared variable name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SvarName(String);

impl SvarName {
    /// Validate a name: 1 to [`SvpConfig::MAX_SVAR_NAMELEN`] code points,
    /// no NUL and no whitespace.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let invalid = |message: &str| SvpError::InvalidName {
            name: name.clone(),
            message: message.to_string(),
        };

        let len = name.chars().count();
        if len == 0 {
            return Err(invalid("name is empty"));
        }
        if len > SvpConfig::MAX_SVAR_NAMELEN {
            return Err(invalid(&format!(
                "name has {} characters, maximum is {}",
                len,
                SvpConfig::MAX_SVAR_NAMELEN
            )));
        }
        if name.chars().any(|c| c == '\0' || c.is_whitespace()) {
            return Err(invalid("name contains NUL or whitespace"));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SvarName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One side of a shared variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partner {
    pub id: ProcessorIdentity,
    /// Live connection of this partner; `None` while inactive.
    pub conn: Option<ConnId>,
    /// Restrictions this partner imposes (its ⎕SVC contribution).
    pub control: ControlMask,
    pub events: SvarEvents,
}

impl Partner {
    pub fn active(id: ProcessorIdentity, conn: ConnId) -> Self {
        Self {
            id,
            conn: Some(conn),
            control: ControlMask::empty(),
            events: SvarEvents::empty(),
        }
    }

    pub fn inactive(id: ProcessorIdentity) -> Self {
        Self {
            id,
            conn: None,
            control: ControlMask::empty(),
            events: SvarEvents::empty(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.conn.is_some()
    }

    /// Drop the connection and everything tied to it. The identity stays so
    /// that the same processor can couple again.
    pub fn deactivate(&mut self) {
        self.conn = None;
        self.control = ControlMask::empty();
        self.events = SvarEvents::empty();
    }
}

/// One shared variable.
#[derive(Debug, Clone)]
pub struct SvarRecord {
    pub key: SvarKey,
    pub name: SvarName,
    pub offering: Partner,
    pub accepting: Partner,
    pub state: SvarState,
    /// Last assigned payload, opaque to the broker.
    pub value: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    /// Creation order, used to pick the oldest pending offer.
    pub(crate) serial: u64,
}

impl SvarRecord {
    pub fn new(
        key: SvarKey,
        name: SvarName,
        offering: Partner,
        accepting: Partner,
        serial: u64,
    ) -> Self {
        Self {
            key,
            name,
            offering,
            accepting,
            state: SvarState::NotShared,
            value: None,
            created_at: Utc::now(),
            serial,
        }
    }

    pub fn coupling(&self) -> Coupling {
        let active = [&self.offering, &self.accepting]
            .iter()
            .filter(|p| p.is_active())
            .count();
        Coupling::from_active(active)
    }

    /// An offer still waiting for its acceptor.
    pub fn is_pending_offer(&self) -> bool {
        self.offering.is_active() && !self.accepting.is_active()
    }

    pub fn partner(&self, side: Side) -> &Partner {
        match side {
            Side::Offering => &self.offering,
            Side::Accepting => &self.accepting,
        }
    }

    pub fn partner_mut(&mut self, side: Side) -> &mut Partner {
        match side {
            Side::Offering => &mut self.offering,
            Side::Accepting => &mut self.accepting,
        }
    }

    /// The side `id` plays in this record, if any.
    pub fn side_of(&self, id: &ProcessorIdentity) -> Option<Side> {
        if self.offering.id == *id {
            Some(Side::Offering)
        } else if self.accepting.id == *id {
            Some(Side::Accepting)
        } else {
            None
        }
    }

    /// The side `id` plays, but only while that side is active.
    pub fn active_side_of(&self, id: &ProcessorIdentity) -> Option<Side> {
        self.side_of(id)
            .filter(|side| self.partner(*side).is_active())
    }

    /// Effective control: the union of both partners' restrictions.
    pub fn control(&self) -> ControlMask {
        self.offering.control | self.accepting.control
    }

    pub fn may_use(&self, side: Side, attempt: u32) -> bool {
        let allowed = self.state.permits_use(self.control(), side);
        if !allowed && attempt > 0 {
            debug!(
                "{} may not use {} yet (attempt {}, state {})",
                self.partner(side).id,
                self.name,
                attempt,
                self.state
            );
        }
        allowed
    }

    pub fn may_set(&self, side: Side, attempt: u32) -> bool {
        let allowed = self.state.permits_set(self.control(), side);
        if !allowed && attempt > 0 {
            debug!(
                "{} may not set {} yet (attempt {}, state {})",
                self.partner(side).id,
                self.name,
                attempt,
                self.state
            );
        }
        allowed
    }

    /// Record a completed access by `side`.
    ///
    /// A use returns the variable to `IDLE`, a set leaves it in the acting
    /// side's `HAS_SET` state. The acting side's pending events are cleared
    /// and the other side is told what happened.
    pub fn set_state(&mut self, used: bool, side: Side) -> SvarState {
        let old = self.state;
        let (new, event) = if used {
            let new = if old == SvarState::NotShared {
                SvarState::NotShared
            } else {
                SvarState::Idle
            };
            (new, SvarEvents::USE_BY_PARTNER)
        } else {
            (SvarState::has_set(side), SvarEvents::SET_BY_PARTNER)
        };

        self.state = new;
        self.partner_mut(side).events = SvarEvents::empty();
        if !used || old != new {
            self.partner_mut(side.other()).events |= event;
        }
        debug!(
            "{} state {} -> {} ({} by {:?})",
            self.name,
            old,
            new,
            if used { "use" } else { "set" },
            side
        );
        new
    }

    /// Replace `side`'s restrictions; returns the effective control.
    pub fn set_control(&mut self, side: Side, mask: ControlMask) -> ControlMask {
        self.partner_mut(side).control = mask;
        self.partner_mut(side.other()).events |= SvarEvents::CONTROL_CHANGED;
        self.control()
    }

    pub fn add_event(&mut self, side: Side, events: SvarEvents) {
        self.partner_mut(side).events |= events;
    }

    /// Attach an acceptor to a pending offer.
    pub fn couple(&mut self, acceptor: ProcessorIdentity, conn: ConnId) {
        self.accepting = Partner::active(acceptor, conn);
        self.offering.events |= SvarEvents::OFFER_MATCHED;
        if self.state == SvarState::NotShared {
            self.state = SvarState::Idle;
        }
    }

    /// Deactivate `side`. Returns the coupling before the change.
    pub fn release(&mut self, side: Side) -> Coupling {
        let old = self.coupling();
        self.partner_mut(side).deactivate();
        if self.coupling() != Coupling::Coupled {
            self.state = SvarState::NotShared;
        }
        let other = self.partner_mut(side.other());
        if other.is_active() {
            other.events |= SvarEvents::OFFER_RETRACTED;
        }
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coupled_record() -> SvarRecord {
        let mut rec = SvarRecord::new(
            SvarKey(0x7d1_0000),
            SvarName::new("FOO").unwrap(),
            Partner::active(ProcessorIdentity::top_level(2001), ConnId(1)),
            Partner::inactive(ProcessorIdentity::top_level(2002)),
            0,
        );
        rec.couple(ProcessorIdentity::top_level(2002), ConnId(2));
        rec
    }

    #[test]
    fn test_name_validation() {
        assert!(SvarName::new("CTL210").is_ok());
        assert!(SvarName::new("").is_err());
        assert!(SvarName::new("A B").is_err());
        assert!(SvarName::new("X".repeat(SvpConfig::MAX_SVAR_NAMELEN)).is_ok());
        assert!(SvarName::new("X".repeat(SvpConfig::MAX_SVAR_NAMELEN + 1)).is_err());
        // code points, not bytes
        assert!(SvarName::new("∆".repeat(SvpConfig::MAX_SVAR_NAMELEN)).is_ok());
    }

    #[test]
    fn test_coupling_counts_active_partners() {
        let mut rec = coupled_record();
        assert_eq!(rec.coupling(), Coupling::Coupled);
        assert_eq!(rec.state, SvarState::Idle);
        assert!(rec.offering.events.contains(SvarEvents::OFFER_MATCHED));

        assert_eq!(rec.release(Side::Accepting), Coupling::Coupled);
        assert_eq!(rec.coupling(), Coupling::Offered);
        assert_eq!(rec.release(Side::Offering), Coupling::Offered);
        assert_eq!(rec.coupling(), Coupling::None);
    }

    #[test]
    fn test_use_of_acceptor_value_returns_to_idle() {
        let mut rec = coupled_record();
        rec.state = SvarState::AcceptorHasSet;
        rec.accepting.events = SvarEvents::SET_BY_PARTNER;

        assert_eq!(rec.set_state(true, Side::Accepting), SvarState::Idle);
        assert!(rec.accepting.events.is_empty());
        assert!(rec.offering.events.contains(SvarEvents::USE_BY_PARTNER));
    }

    #[test]
    fn test_set_moves_to_has_set_and_notifies_partner() {
        let mut rec = coupled_record();
        assert_eq!(rec.set_state(false, Side::Offering), SvarState::OffererHasSet);
        assert!(rec.accepting.events.contains(SvarEvents::SET_BY_PARTNER));
        assert!(rec.offering.events.is_empty());
    }

    #[test]
    fn test_may_use_is_idempotent() {
        let mut rec = coupled_record();
        rec.set_control(Side::Offering, ControlMask::all());
        rec.set_state(false, Side::Offering);

        let first = rec.may_use(Side::Offering, 0);
        for attempt in 1..5 {
            assert_eq!(rec.may_use(Side::Offering, attempt), first);
            assert!(rec.may_use(Side::Accepting, attempt));
            assert!(!rec.may_set(Side::Offering, attempt));
        }
        assert!(!first);
    }

    #[test]
    fn test_control_is_union_of_partners() {
        let mut rec = coupled_record();
        rec.set_control(Side::Offering, ControlMask::SET_BY_OFFERER);
        let effective = rec.set_control(Side::Accepting, ControlMask::USE_BY_ACCEPTOR);
        assert_eq!(
            effective,
            ControlMask::SET_BY_OFFERER | ControlMask::USE_BY_ACCEPTOR
        );
        assert!(rec.offering.events.contains(SvarEvents::CONTROL_CHANGED));

        // an empty mask withdraws only the caller's own restrictions
        let effective = rec.set_control(Side::Offering, ControlMask::empty());
        assert_eq!(effective, ControlMask::USE_BY_ACCEPTOR);
    }

    #[test]
    fn test_release_notifies_remaining_partner() {
        let mut rec = coupled_record();
        rec.release(Side::Offering);
        assert!(rec.accepting.events.contains(SvarEvents::OFFER_RETRACTED));
        assert_eq!(rec.accepting.id, ProcessorIdentity::top_level(2002));
        assert_eq!(rec.accepting.conn, Some(ConnId(2)));
        assert_eq!(rec.state, SvarState::NotShared);
    }
}
