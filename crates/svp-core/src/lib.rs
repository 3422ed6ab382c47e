//! SVP Core - Shared Variable Processor for coupling APL variables across
//! processes.
//!
//! Interpreters and auxiliary processors connect to one broker, register an
//! identity and offer named variables to each other. When two complementary
//! offers meet, both sides hold the same key and exchange opaque payloads
//! through the broker, gated by the per-variable access state machine.
//!
//! # Example
//!
//! ```rust,ignore
//! use svp_core::{BrokerConfig, BrokerServer, ProcessorIdentity, SvpClient};
//!
//! #[tokio::main]
//! async fn main() -> svp_core::Result<()> {
//!     let handle = BrokerServer::start(BrokerConfig::builder().tcp("127.0.0.1", 0).build()?).await?;
//!
//!     let a = SvpClient::connect(handle.endpoint(), ProcessorIdentity::top_level(1001)).await?;
//!     let b = SvpClient::connect(handle.endpoint(), ProcessorIdentity::top_level(1002)).await?;
//!
//!     let (key, _) = a.match_or_make("FOO", b.identity()).await?;
//!     let (same, coupling) = b.match_or_make("FOO", a.identity()).await?;
//!     assert_eq!(key, same);
//!     println!("coupled: {}", coupling);
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod svar;
pub mod wire;

pub use broker::{Broker, BrokerHandle, BrokerServer, DatabaseFormat};
pub use client::{
    read_value, write_value, AccessPolicy, EventListener, Notification, SvarAccess, SvpClient,
};
pub use config::{AccessConfig, BrokerConfig, BrokerConfigBuilder, BrokerLimits, Endpoint, SvpConfig};
pub use error::{Result, SvpError};
pub use identity::{ConnId, ProcessorIdentity, AP_FIRST_USER, AP_GENERAL, NO_AP};
pub use svar::{
    ControlMask, Coupling, MatchOutcome, Side, SvarDb, SvarEvents, SvarKey, SvarName, SvarRecord,
    SvarState,
};
pub use wire::{Signal, SignalKind};
