//! Processor identities and connection handles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Processor number of a general (untargeted) offer.
pub const AP_GENERAL: u32 = 0;

/// Marks an unused processor slot.
pub const NO_AP: u32 = u32::MAX;

/// Processor numbers at or above this value are APL interpreters; below it
/// they are auxiliary processors.
pub const AP_FIRST_USER: u32 = 1000;

/// A processor and its ancestry: `(proc, parent, grand)`.
///
/// Top-level interpreters use `parent == grand == 0`. A processor started on
/// behalf of another names it as its parent, and the parent's parent as its
/// grandparent, which is what makes it a dependent for disconnect cascading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessorIdentity {
    pub proc: u32,
    pub parent: u32,
    pub grand: u32,
}

impl ProcessorIdentity {
    /// The unused identity.
    pub const NONE: Self = Self {
        proc: NO_AP,
        parent: NO_AP,
        grand: NO_AP,
    };

    /// The general-offer target.
    pub const GENERAL: Self = Self {
        proc: AP_GENERAL,
        parent: AP_GENERAL,
        grand: AP_GENERAL,
    };

    pub const fn new(proc: u32, parent: u32, grand: u32) -> Self {
        Self {
            proc,
            parent,
            grand,
        }
    }

    /// A top-level processor with no ancestry.
    pub const fn top_level(proc: u32) -> Self {
        Self::new(proc, 0, 0)
    }

    pub fn is_general(&self) -> bool {
        self.proc == AP_GENERAL
    }

    pub fn is_none(&self) -> bool {
        self.proc == NO_AP
    }

    /// True for auxiliary processors.
    pub fn is_ap(&self) -> bool {
        !self.is_general() && !self.is_none() && self.proc < AP_FIRST_USER
    }

    /// True for APL interpreters.
    pub fn is_interpreter(&self) -> bool {
        !self.is_none() && self.proc >= AP_FIRST_USER
    }

    /// True if `ancestor` is this processor's parent or grandparent.
    ///
    /// A parent must match on both levels it shares with this identity:
    /// `ancestor.proc == parent` and `ancestor.parent == grand`.
    pub fn depends_on(&self, ancestor: &ProcessorIdentity) -> bool {
        if ancestor.is_general() || ancestor.is_none() || self == ancestor {
            return false;
        }
        let child = self.parent == ancestor.proc && self.grand == ancestor.parent;
        let grandchild = self.grand == ancestor.proc;
        child || grandchild
    }
}

impl Default for ProcessorIdentity {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for ProcessorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("-");
        }
        write!(f, "{}.{}.{}", self.proc, self.parent, self.grand)
    }
}

/// Broker-assigned handle of one live peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}
