//! Signal kinds and their field layouts.
//!
//! Every signal is a 2-byte kind tag followed by a fixed, ordered tuple of
//! fields. Tags below `0x8000` are requests, `0x8000..0xC000` are replies and
//! tags from `0xC000` up are unsolicited pushes on an event channel.
//!
//! Lists travel inside a single byte-string field: identity lists as
//! concatenated 12-byte triples, name lists as NUL-separated names.

use super::fields::{FieldReader, FieldWriter};
use crate::identity::ProcessorIdentity;
use crate::svar::{ControlMask, Coupling, SvarEvents, SvarKey, SvarState};
use crate::{Result, SvpError};
use bytes::Bytes;
use std::fmt;

/// A value that knows its own wire layout.
pub trait WireField: Sized {
    fn put(&self, w: &mut FieldWriter) -> Result<()>;
    fn get(r: &mut FieldReader<'_>, field: &'static str) -> Result<Self>;
}

fn malformed(field: &'static str, message: String) -> SvpError {
    SvpError::Malformed {
        kind: field.to_string(),
        message,
    }
}

impl WireField for u8 {
    fn put(&self, w: &mut FieldWriter) -> Result<()> {
        w.put_u8(*self);
        Ok(())
    }
    fn get(r: &mut FieldReader<'_>, field: &'static str) -> Result<Self> {
        r.get_u8(field)
    }
}

impl WireField for u32 {
    fn put(&self, w: &mut FieldWriter) -> Result<()> {
        w.put_u32(*self);
        Ok(())
    }
    fn get(r: &mut FieldReader<'_>, field: &'static str) -> Result<Self> {
        r.get_u32(field)
    }
}

impl WireField for bool {
    fn put(&self, w: &mut FieldWriter) -> Result<()> {
        w.put_u8(u8::from(*self));
        Ok(())
    }
    fn get(r: &mut FieldReader<'_>, field: &'static str) -> Result<Self> {
        Ok(r.get_u8(field)? != 0)
    }
}

impl WireField for String {
    fn put(&self, w: &mut FieldWriter) -> Result<()> {
        w.put_str(self)
    }
    fn get(r: &mut FieldReader<'_>, field: &'static str) -> Result<Self> {
        r.get_string(field)
    }
}

impl WireField for Vec<u8> {
    fn put(&self, w: &mut FieldWriter) -> Result<()> {
        w.put_bytes(self)
    }
    fn get(r: &mut FieldReader<'_>, field: &'static str) -> Result<Self> {
        r.get_bytes(field)
    }
}

impl WireField for SvarKey {
    fn put(&self, w: &mut FieldWriter) -> Result<()> {
        w.put_u64(self.0);
        Ok(())
    }
    fn get(r: &mut FieldReader<'_>, field: &'static str) -> Result<Self> {
        Ok(SvarKey(r.get_u64(field)?))
    }
}

impl WireField for ProcessorIdentity {
    fn put(&self, w: &mut FieldWriter) -> Result<()> {
        w.put_u32(self.proc);
        w.put_u32(self.parent);
        w.put_u32(self.grand);
        Ok(())
    }
    fn get(r: &mut FieldReader<'_>, field: &'static str) -> Result<Self> {
        Ok(ProcessorIdentity::new(
            r.get_u32(field)?,
            r.get_u32(field)?,
            r.get_u32(field)?,
        ))
    }
}

impl WireField for ControlMask {
    fn put(&self, w: &mut FieldWriter) -> Result<()> {
        w.put_u8(self.bits());
        Ok(())
    }
    fn get(r: &mut FieldReader<'_>, field: &'static str) -> Result<Self> {
        let bits = r.get_u8(field)?;
        ControlMask::from_bits(bits)
            .ok_or_else(|| malformed(field, format!("invalid control mask {bits:#06b}")))
    }
}

impl WireField for SvarEvents {
    fn put(&self, w: &mut FieldWriter) -> Result<()> {
        w.put_u32(self.bits());
        Ok(())
    }
    fn get(r: &mut FieldReader<'_>, field: &'static str) -> Result<Self> {
        Ok(SvarEvents::from_bits_truncate(r.get_u32(field)?))
    }
}

impl WireField for SvarState {
    fn put(&self, w: &mut FieldWriter) -> Result<()> {
        w.put_u8(self.bits().bits());
        Ok(())
    }
    fn get(r: &mut FieldReader<'_>, field: &'static str) -> Result<Self> {
        let bits = r.get_u8(field)?;
        SvarState::from_bits(bits)
            .ok_or_else(|| malformed(field, format!("invalid state {bits:#06b}")))
    }
}

impl WireField for Coupling {
    fn put(&self, w: &mut FieldWriter) -> Result<()> {
        w.put_u8(self.as_u8());
        Ok(())
    }
    fn get(r: &mut FieldReader<'_>, field: &'static str) -> Result<Self> {
        let v = r.get_u8(field)?;
        Coupling::from_u8(v).ok_or_else(|| malformed(field, format!("invalid coupling {v}")))
    }
}

const IDENTITY_WIRE_SIZE: usize = 12;

impl WireField for Vec<ProcessorIdentity> {
    fn put(&self, w: &mut FieldWriter) -> Result<()> {
        let mut inner = FieldWriter::new();
        for id in self {
            id.put(&mut inner)?;
        }
        w.put_bytes(&inner.finish())
    }
    fn get(r: &mut FieldReader<'_>, field: &'static str) -> Result<Self> {
        let raw = r.get_bytes(field)?;
        if raw.len() % IDENTITY_WIRE_SIZE != 0 {
            return Err(malformed(
                field,
                format!("{} bytes is not a whole number of identities", raw.len()),
            ));
        }
        let mut inner = FieldReader::new(&raw);
        let mut ids = Vec::with_capacity(raw.len() / IDENTITY_WIRE_SIZE);
        while inner.remaining() > 0 {
            ids.push(ProcessorIdentity::get(&mut inner, field)?);
        }
        Ok(ids)
    }
}

impl WireField for Vec<String> {
    fn put(&self, w: &mut FieldWriter) -> Result<()> {
        w.put_bytes(self.join("\0").as_bytes())
    }
    fn get(r: &mut FieldReader<'_>, field: &'static str) -> Result<Self> {
        let joined = r.get_string(field)?;
        if joined.is_empty() {
            return Ok(Vec::new());
        }
        Ok(joined.split('\0').map(str::to_string).collect())
    }
}

macro_rules! signals {
    ($(
        $(#[$meta:meta])*
        $name:ident = $tag:literal { $($field:ident : $ty:ty),* $(,)? }
    ),* $(,)?) => {
        /// Wire discriminant of a [`Signal`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum SignalKind {
            $($name),*
        }

        impl SignalKind {
            pub const ALL: &'static [SignalKind] = &[$(SignalKind::$name),*];

            pub const fn to_u16(self) -> u16 {
                match self {
                    $(SignalKind::$name => $tag),*
                }
            }

            /// Parse a wire tag; `None` for unknown kinds.
            pub const fn from_u16(tag: u16) -> Option<Self> {
                match tag {
                    $($tag => Some(SignalKind::$name),)*
                    _ => None,
                }
            }

            pub const fn name(self) -> &'static str {
                match self {
                    $(SignalKind::$name => stringify!($name)),*
                }
            }
        }

        /// One decoded signal.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Signal {
            $(
                $(#[$meta])*
                $name { $($field: $ty),* }
            ),*
        }

        impl Signal {
            pub fn kind(&self) -> SignalKind {
                match self {
                    $(Signal::$name { .. } => SignalKind::$name),*
                }
            }

            /// Encode as kind tag plus fields, without the frame prefix.
            pub fn encode(&self) -> Result<Bytes> {
                let mut w = FieldWriter::new();
                w.put_u16(self.kind().to_u16());
                match self {
                    $(Signal::$name { $($field),* } => {
                        $(WireField::put($field, &mut w)?;)*
                    })*
                }
                Ok(w.finish())
            }

            /// Decode one signal. Unknown tags, short bodies and trailing
            /// bytes are errors.
            pub fn decode(buf: &[u8]) -> Result<Signal> {
                let mut r = FieldReader::new(buf);
                let tag = r.get_u16("kind")?;
                let kind = SignalKind::from_u16(tag).ok_or(SvpError::UnknownKind(tag))?;
                let signal = match kind {
                    $(SignalKind::$name => Signal::$name {
                        $($field: <$ty as WireField>::get(&mut r, stringify!($field))?),*
                    },)*
                };
                r.finish()?;
                Ok(signal)
            }
        }
    };
}

signals! {
    // registration
    RegisterProcessor = 0x0101 { identity: ProcessorIdentity, pid: u32 },
    /// Marks the sending connection as the push channel of `identity`.
    RegisterEventChannel = 0x0102 { identity: ProcessorIdentity },
    IsRegistered = 0x0103 { identity: ProcessorIdentity },

    // matching
    MatchOrMake = 0x0201 { name: String, to: ProcessorIdentity, from: ProcessorIdentity },
    RetractOffer = 0x0202 { key: SvarKey },
    FindPairingKey = 0x0203 { key: SvarKey },

    // record access, always on behalf of the sender's identity
    MayUse = 0x0301 { key: SvarKey, attempt: u32 },
    MaySet = 0x0302 { key: SvarKey, attempt: u32 },
    SetState = 0x0303 { key: SvarKey, used: bool },
    GetState = 0x0304 { key: SvarKey },
    SetControl = 0x0305 { key: SvarKey, control: ControlMask },
    GetControl = 0x0306 { key: SvarKey },
    GetCoupling = 0x0307 { key: SvarKey },
    GetVarname = 0x0308 { key: SvarKey },

    // values
    GetValue = 0x0401 { key: SvarKey },
    AssignValue = 0x0402 { key: SvarKey, payload: Vec<u8> },

    // events
    GetEvents = 0x0501 { identity: ProcessorIdentity },
    ClearAllEvents = 0x0502 { identity: ProcessorIdentity },
    AddEvent = 0x0503 { key: SvarKey, identity: ProcessorIdentity, events: SvarEvents },

    // queries
    FindOfferingId = 0x0601 { key: SvarKey },
    GetOfferingProcs = 0x0602 { target: ProcessorIdentity },
    GetOfferedVars = 0x0603 { target: ProcessorIdentity, from: ProcessorIdentity },
    /// `format` 0 is a text table, 1 is JSON.
    PrintDatabase = 0x0604 { format: u8 },

    // replies
    YesNo = 0x8001 { yes: bool },
    /// `key` is null when no offer could be recorded.
    MatchOrMakeResult = 0x8002 { key: SvarKey, coupling: Coupling },
    RetractResult = 0x8003 { key: SvarKey, old_coupling: Coupling },
    StateIs = 0x8004 { key: SvarKey, state: SvarState },
    ControlIs = 0x8005 { key: SvarKey, control: ControlMask },
    CouplingIs = 0x8006 { key: SvarKey, coupling: Coupling },
    VarnameIs = 0x8007 { key: SvarKey, name: String },
    ValueIs = 0x8008 { key: SvarKey, error: u32, error_loc: String, payload: Vec<u8> },
    AssignWas = 0x8009 { key: SvarKey, error: u32, error_loc: String },
    EventsAre = 0x800a { key: SvarKey, events: SvarEvents },
    AllEventsCleared = 0x800b { events: SvarEvents },
    OfferingIdIs = 0x800c { key: SvarKey, identity: ProcessorIdentity },
    OfferingProcsAre = 0x800d { procs: Vec<ProcessorIdentity> },
    OfferedVarsAre = 0x800e { names: Vec<String> },
    PairingKeyIs = 0x800f { key: SvarKey, pairing: SvarKey },
    DatabasePrinted = 0x8010 { text: String },
    /// Answer to a request that could not be decoded or handled.
    Error = 0x80ff { code: u32, location: String },

    // pushes
    OfferMade = 0xc001 { key: SvarKey, name: String, from: ProcessorIdentity },
    OfferMatched = 0xc002 { key: SvarKey, by: ProcessorIdentity },
    OfferRetracted = 0xc003 { key: SvarKey, by: ProcessorIdentity },
    EventsPending = 0xc004 { key: SvarKey, events: SvarEvents },
}

const REPLY_TAGS: u16 = 0x8000;
const PUSH_TAGS: u16 = 0xc000;

impl SignalKind {
    pub fn is_request(self) -> bool {
        self.to_u16() < REPLY_TAGS
    }

    pub fn is_reply(self) -> bool {
        (REPLY_TAGS..PUSH_TAGS).contains(&self.to_u16())
    }

    pub fn is_push(self) -> bool {
        self.to_u16() >= PUSH_TAGS
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Signal {
    /// Build an `Error` reply from a failed request.
    pub fn error(err: &SvpError, location: impl Into<String>) -> Self {
        Signal::Error {
            code: err.error_code(),
            location: location.into(),
        }
    }
}
