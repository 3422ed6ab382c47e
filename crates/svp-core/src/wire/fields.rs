//! Typed field encoding.
//!
//! Integers are big-endian and 1, 2, 3, 4, 6 or 8 bytes wide. Strings carry a
//! 2-byte length prefix followed by raw bytes, with no terminator.

use crate::config::SvpConfig;
use crate::{Result, SvpError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const VALID_WIDTHS: [usize; 6] = [1, 2, 3, 4, 6, 8];

fn check_width(width: usize) {
    debug_assert!(
        VALID_WIDTHS.contains(&width),
        "unsupported integer width {width}"
    );
}

/// Appends fields to a signal body.
#[derive(Debug, Default)]
pub struct FieldWriter {
    buf: BytesMut,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the low `width` bytes of `value`.
    ///
    /// Fails if `value` does not fit.
    pub fn put_uint(&mut self, value: u64, width: usize) -> Result<()> {
        check_width(width);
        if width < 8 && value >> (width * 8) != 0 {
            return Err(SvpError::Malformed {
                kind: "field".to_string(),
                message: format!("value {value} does not fit in {width} bytes"),
            });
        }
        self.buf.put_uint(value, width);
        Ok(())
    }

    /// Write a two's-complement integer in `width` bytes.
    pub fn put_int(&mut self, value: i64, width: usize) -> Result<()> {
        check_width(width);
        let bits = (width * 8) as u32;
        if width < 8 {
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            if value < min || value > max {
                return Err(SvpError::Malformed {
                    kind: "field".to_string(),
                    message: format!("value {value} does not fit in {width} signed bytes"),
                });
            }
        }
        self.buf.put_int(value, width);
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    /// Write a length-prefixed byte string.
    pub fn put_bytes(&mut self, value: &[u8]) -> Result<()> {
        if value.len() > SvpConfig::MAX_STRING_FIELD {
            return Err(SvpError::Malformed {
                kind: "field".to_string(),
                message: format!(
                    "string of {} bytes exceeds {} byte limit",
                    value.len(),
                    SvpConfig::MAX_STRING_FIELD
                ),
            });
        }
        self.buf.put_u16(value.len() as u16);
        self.buf.put_slice(value);
        Ok(())
    }

    pub fn put_str(&mut self, value: &str) -> Result<()> {
        self.put_bytes(value.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads fields from a signal body.
///
/// Every getter names the field it reads so that a short body reports which
/// field ran out of bytes.
#[derive(Debug)]
pub struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, field: &'static str, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(SvpError::Truncated {
                field,
                needed: n - self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_uint(&mut self, field: &'static str, width: usize) -> Result<u64> {
        check_width(width);
        self.need(field, width)?;
        Ok(self.buf.get_uint(width))
    }

    pub fn get_int(&mut self, field: &'static str, width: usize) -> Result<i64> {
        check_width(width);
        self.need(field, width)?;
        Ok(self.buf.get_int(width))
    }

    pub fn get_u8(&mut self, field: &'static str) -> Result<u8> {
        self.need(field, 1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self, field: &'static str) -> Result<u16> {
        self.need(field, 2)?;
        Ok(self.buf.get_u16())
    }

    pub fn get_u32(&mut self, field: &'static str) -> Result<u32> {
        self.need(field, 4)?;
        Ok(self.buf.get_u32())
    }

    pub fn get_u64(&mut self, field: &'static str) -> Result<u64> {
        self.need(field, 8)?;
        Ok(self.buf.get_u64())
    }

    pub fn get_bytes(&mut self, field: &'static str) -> Result<Vec<u8>> {
        let len = self.get_u16(field)? as usize;
        self.need(field, len)?;
        let value = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(value)
    }

    pub fn get_string(&mut self, field: &'static str) -> Result<String> {
        let bytes = self.get_bytes(field)?;
        String::from_utf8(bytes).map_err(|_| SvpError::Malformed {
            kind: "field".to_string(),
            message: format!("field '{field}' is not valid UTF-8"),
        })
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Fail if bytes are left over after the last field.
    pub fn finish(self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(SvpError::Malformed {
                kind: "field".to_string(),
                message: format!("{} trailing bytes after last field", self.buf.remaining()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_odd_widths_are_big_endian() {
        let mut w = FieldWriter::new();
        w.put_uint(0x01_0203, 3).unwrap();
        w.put_uint(0x0102_0304_0506, 6).unwrap();
        let bytes = w.finish();
        assert_eq!(&bytes[..], &[1, 2, 3, 1, 2, 3, 4, 5, 6]);

        let mut r = FieldReader::new(&bytes);
        assert_eq!(r.get_uint("a", 3).unwrap(), 0x01_0203);
        assert_eq!(r.get_uint("b", 6).unwrap(), 0x0102_0304_0506);
        r.finish().unwrap();
    }

    #[test]
    fn test_signed_values_sign_extend() {
        let mut w = FieldWriter::new();
        w.put_int(-2, 3).unwrap();
        w.put_int(-70_000, 6).unwrap();
        let bytes = w.finish();
        assert_eq!(&bytes[..3], &[0xff, 0xff, 0xfe]);

        let mut r = FieldReader::new(&bytes);
        assert_eq!(r.get_int("a", 3).unwrap(), -2);
        assert_eq!(r.get_int("b", 6).unwrap(), -70_000);
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let mut w = FieldWriter::new();
        assert!(w.put_uint(0x1_0000, 2).is_err());
        assert!(w.put_int(128, 1).is_err());
        assert!(w.put_int(-129, 1).is_err());
        assert!(w.is_empty());
    }

    #[test]
    fn test_string_layout() {
        let mut w = FieldWriter::new();
        w.put_str("FOO").unwrap();
        assert_eq!(&w.finish()[..], &[0, 3, b'F', b'O', b'O']);
    }

    #[test]
    fn test_oversized_string_rejected() {
        let mut w = FieldWriter::new();
        let big = vec![0u8; SvpConfig::MAX_STRING_FIELD + 1];
        assert!(w.put_bytes(&big).is_err());
    }

    #[test]
    fn test_short_string_reports_field() {
        // declares 10 bytes, delivers 2
        let bytes = [0u8, 10, b'a', b'b'];
        let mut r = FieldReader::new(&bytes);
        match r.get_bytes("payload") {
            Err(SvpError::Truncated { field, needed }) => {
                assert_eq!(field, "payload");
                assert_eq!(needed, 8);
            }
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let bytes = [0u8, 1, 2];
        let mut r = FieldReader::new(&bytes);
        r.get_u16("x").unwrap();
        assert!(r.finish().is_err());
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let bytes = [0u8, 2, 0xff, 0xfe];
        let mut r = FieldReader::new(&bytes);
        assert!(r.get_string("name").is_err());
    }
}
