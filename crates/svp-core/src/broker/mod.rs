//! The SVP broker.
//!
//! # Architecture
//!
//! - **actor**: the single task that owns the shared-variable table and the
//!   connection registry, and answers every request
//! - **registry**: live connections, their identities and event channels
//! - **server**: listener, accept loop and per-connection frame tasks

pub mod actor;
pub mod registry;
pub mod server;

pub use actor::{Broker, DatabaseFormat};
pub use registry::{ConnRole, ConnectionEntry, ConnectionRegistry, ConnectionSnapshot};
pub use server::{BrokerHandle, BrokerServer};
