//! Peer-side access to the broker.
//!
//! - **stub**: [`SvpClient`], one request and its reply at a time
//! - **access**: [`read_value`]/[`write_value`], the poll-then-access contract
//! - **events**: [`EventListener`] for pushed notifications

mod channel;

pub mod access;
pub mod events;
pub mod stub;

pub use access::{read_value, write_value, AccessPolicy, SvarAccess};
pub use events::{EventListener, Notification};
pub use stub::SvpClient;
