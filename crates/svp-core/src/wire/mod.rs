//! The binary wire protocol.
//!
//! ```text
//! [u32 BE: len][u16 BE: kind][kind-specific fields]
//! ```
//!
//! - **fields**: big-endian integers and 2-byte-length-prefixed strings
//! - **signal**: the closed set of signal kinds, one encode/decode pair
//! - **frame**: the 4-byte length prefix used on stream connections

pub mod fields;
pub mod frame;
pub mod signal;

pub use fields::{FieldReader, FieldWriter};
pub use frame::{read_frame, take_frame, write_frame};
pub use signal::{Signal, SignalKind, WireField};
