//! Shared variables: the record model, its access state machine and the
//! table that matches offers.
//!
//! Everything in here is synchronous and owned by a single task. The broker
//! feeds it decoded requests and turns the results into replies and pushes.

pub mod control;
pub mod db;
pub mod pairing;
pub mod record;

pub use control::{ControlMask, Coupling, Side, SvarEvents, SvarState};
pub use db::{MatchOutcome, RecordSnapshot, Release, SvarDb};
pub use record::{Partner, SvarKey, SvarName, SvarRecord};
