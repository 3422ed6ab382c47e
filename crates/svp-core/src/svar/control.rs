//! Access control bits, access state and event flags of a shared variable.
//!
//! Control and state share one 4-bit layout. A control bit that is set
//! forbids the matching access while the same state bit is set, so with all
//! control bits clear every access is permitted.

use bitflags::bitflags;
use serde::Serialize;
use std::fmt;

bitflags! {
    /// Per-partner access restrictions (the ⎕SVC vector).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ControlMask: u8 {
        /// Offerer may not set twice without an intervening access by the acceptor.
        const SET_BY_OFFERER = 0b1000;
        /// Acceptor may not set twice without an intervening access by the offerer.
        const SET_BY_ACCEPTOR = 0b0100;
        /// Offerer may not use twice without an intervening set by the acceptor.
        const USE_BY_OFFERER = 0b0010;
        /// Acceptor may not use twice without an intervening set by the offerer.
        const USE_BY_ACCEPTOR = 0b0001;
    }
}

bitflags! {
    /// Pending notifications for one partner of a shared variable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SvarEvents: u32 {
        /// An offer made by this partner was accepted.
        const OFFER_MATCHED = 0x0001;
        /// The other partner retracted or disconnected.
        const OFFER_RETRACTED = 0x0002;
        /// Another processor offered a variable to this partner.
        const OFFER_MADE = 0x0004;
        /// The other partner assigned a new value.
        const SET_BY_PARTNER = 0x0008;
        /// The other partner used the current value.
        const USE_BY_PARTNER = 0x0010;
        /// The other partner changed its access control.
        const CONTROL_CHANGED = 0x0020;
    }
}

/// One side of a shared variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Offering,
    Accepting,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Offering => Side::Accepting,
            Side::Accepting => Side::Offering,
        }
    }

    /// The SET bit that restricts this side.
    pub fn set_bit(self) -> ControlMask {
        match self {
            Side::Offering => ControlMask::SET_BY_OFFERER,
            Side::Accepting => ControlMask::SET_BY_ACCEPTOR,
        }
    }

    /// The USE bit that restricts this side.
    pub fn use_bit(self) -> ControlMask {
        match self {
            Side::Offering => ControlMask::USE_BY_OFFERER,
            Side::Accepting => ControlMask::USE_BY_ACCEPTOR,
        }
    }
}

/// Access state of a shared variable (the ⎕SVS vector).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SvarState {
    #[default]
    NotShared,
    /// No unread value on either side.
    Idle,
    /// The offerer set a value the acceptor has not used yet.
    OffererHasSet,
    /// The acceptor set a value the offerer has not used yet.
    AcceptorHasSet,
}

impl SvarState {
    pub fn bits(self) -> ControlMask {
        match self {
            SvarState::NotShared => ControlMask::empty(),
            SvarState::Idle => ControlMask::USE_BY_OFFERER | ControlMask::USE_BY_ACCEPTOR,
            SvarState::OffererHasSet => ControlMask::SET_BY_OFFERER | ControlMask::USE_BY_OFFERER,
            SvarState::AcceptorHasSet => {
                ControlMask::SET_BY_ACCEPTOR | ControlMask::USE_BY_ACCEPTOR
            }
        }
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        [
            SvarState::NotShared,
            SvarState::Idle,
            SvarState::OffererHasSet,
            SvarState::AcceptorHasSet,
        ]
        .into_iter()
        .find(|state| state.bits().bits() == bits)
    }

    /// The state after `side` set a new value.
    pub fn has_set(side: Side) -> Self {
        match side {
            Side::Offering => SvarState::OffererHasSet,
            Side::Accepting => SvarState::AcceptorHasSet,
        }
    }

    /// Whether `side` may use the value under the combined `control`.
    pub fn permits_use(self, control: ControlMask, side: Side) -> bool {
        !(control & self.bits()).contains(side.use_bit())
    }

    /// Whether `side` may set the value under the combined `control`.
    pub fn permits_set(self, control: ControlMask, side: Side) -> bool {
        !(control & self.bits()).contains(side.set_bit())
    }
}

impl fmt::Display for SvarState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SvarState::NotShared => "NOT_SHARED",
            SvarState::Idle => "IDLE",
            SvarState::OffererHasSet => "OFFERER_HAS_SET",
            SvarState::AcceptorHasSet => "ACCEPTOR_HAS_SET",
        };
        f.write_str(label)
    }
}

/// Number of active partners of a shared variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Coupling {
    None = 0,
    Offered = 1,
    Coupled = 2,
}

impl Coupling {
    pub fn from_active(count: usize) -> Self {
        match count {
            0 => Coupling::None,
            1 => Coupling::Offered,
            _ => Coupling::Coupled,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Coupling::None),
            1 => Some(Coupling::Offered),
            2 => Some(Coupling::Coupled),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Coupling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Coupling::None => "NONE",
            Coupling::Offered => "OFFERED",
            Coupling::Coupled => "COUPLED",
        };
        f.write_str(label)
    }
}
