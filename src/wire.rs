//! Primitive wire (de)serialization.
//!
//! Every message and descriptor in the protocol is built out of the handful
//! of primitives here: big-endian fixed-width integers, UUIDs as two 64-bit
//! halves, `u32`-length-prefixed UTF-8 strings and byte arrays, and counted
//! arrays with a configurable length-field width.

use bytes::Bytes;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Initial capacity for a fresh [`Writer`].
const INITIAL_CAPACITY: usize = 256;

/// Beyond this size the buffer grows by flat increments instead of
/// doubling, bounding worst-case reallocation cost.
const FLAT_GROWTH_THRESHOLD: usize = 1 << 20; // 1MiB

/// Accumulates primitive values into a growable buffer.
///
/// Growth is geometric until [`FLAT_GROWTH_THRESHOLD`], then linear.
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer {
            buf: Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn ensure(&mut self, additional: usize) {
        let needed = self.buf.len() + additional;
        if needed <= self.buf.capacity() {
            return;
        }

        let grown = if self.buf.capacity() < FLAT_GROWTH_THRESHOLD {
            (self.buf.capacity() * 2).max(INITIAL_CAPACITY)
        } else {
            self.buf.capacity() + FLAT_GROWTH_THRESHOLD
        };
        self.buf.reserve_exact(grown.max(needed) - self.buf.len());
    }

    pub fn write_u8(&mut self, value: u8) {
        self.ensure(1);
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.write_raw(&value.to_be_bytes());
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_raw(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_raw(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_raw(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_raw(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_raw(&value.to_be_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_raw(&value.to_be_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_raw(&value.to_be_bytes());
    }

    /// Writes a UUID as two big-endian 64-bit halves.
    pub fn write_uuid(&mut self, value: Uuid) {
        self.write_raw(value.as_bytes());
    }

    /// Writes a `u32`-length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.write_raw(value.as_bytes());
    }

    /// Writes a `u32`-length-prefixed byte array.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.write_raw(value);
    }

    pub fn write_raw(&mut self, value: &[u8]) {
        self.ensure(value.len());
        self.buf.extend_from_slice(value);
    }

    /// Reserves a 32-bit length slot, runs `f`, then backfills the slot with
    /// the number of bytes `f` produced.
    pub fn write_with_length<F: FnOnce(&mut Writer)>(&mut self, f: F) {
        let at = self.position();
        self.write_i32(0);
        f(self);
        let len = (self.position() - at - 4) as i32;
        self.buf[at..at + 4].copy_from_slice(&len.to_be_bytes());
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumes primitives from a fixed byte span.
///
/// A reader constructed over a message payload must be fully consumed by its
/// decoder; leftover bytes indicate a decoder/version mismatch. Decoders
/// surface that through [`Reader::finish`], which warns instead of failing:
/// some descriptor and annotation kinds are intentionally ignorable, but the
/// signal matters for detecting format drift.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.take(count).map(|_| ())
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remaining() < count {
            return Err(Error::Protocol(format!(
                "unexpected end of payload: needed {count} byte(s), {} left",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Reads a UUID stored as two big-endian 64-bit halves.
    pub fn read_uuid(&mut self) -> Result<Uuid> {
        Ok(Uuid::from_bytes(self.take(16)?.try_into().unwrap()))
    }

    /// Reads a `u32`-length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Protocol(format!("invalid UTF-8 in string: {e}")))
    }

    /// Reads a `u32`-length-prefixed byte array. A zero or negative declared
    /// length yields an empty slice.
    pub fn read_byte_array(&mut self) -> Result<&'a [u8]> {
        let len = self.read_i32()?;
        if len <= 0 {
            return Ok(&[]);
        }
        self.take(len as usize)
    }

    /// Reads `len` bytes and returns a sub-reader scoped to them.
    pub fn read_scoped(&mut self, len: usize) -> Result<Reader<'a>> {
        Ok(Reader::new(self.take(len)?))
    }

    /// The unread remainder of the span, without consuming it.
    pub fn peek_rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Reads a counted array whose length field width is chosen by `L`.
    pub fn read_array_of<T, L, F>(&mut self, read_len: L, mut element: F) -> Result<Vec<T>>
    where
        L: FnOnce(&mut Reader<'a>) -> Result<usize>,
        F: FnMut(&mut Reader<'a>) -> Result<T>,
    {
        let len = read_len(self)?;
        let mut out = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            out.push(element(self)?);
        }
        Ok(out)
    }

    pub fn read_u16_counted<T, F>(&mut self, element: F) -> Result<Vec<T>>
    where
        F: FnMut(&mut Reader<'a>) -> Result<T>,
    {
        self.read_array_of(|r| Ok(r.read_u16()? as usize), element)
    }

    pub fn read_u32_counted<T, F>(&mut self, element: F) -> Result<Vec<T>>
    where
        F: FnMut(&mut Reader<'a>) -> Result<T>,
    {
        self.read_array_of(|r| Ok(r.read_u32()? as usize), element)
    }

    /// Marks the end of decoding. Leftover bytes are a format-drift signal:
    /// logged as a warning, not an error.
    pub fn finish(&self, what: &str) {
        if !self.is_empty() {
            tracing::warn!(
                leftover = self.remaining(),
                "{what}: payload not fully consumed, client and server may disagree on the format"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trip() {
        let mut w = Writer::new();
        w.write_u8(0x42);
        w.write_bool(true);
        w.write_i16(-5);
        w.write_u16(65535);
        w.write_i32(-100_000);
        w.write_u32(3_000_000_000);
        w.write_i64(i64::MIN);
        w.write_u64(u64::MAX);
        w.write_f32(1.5);
        w.write_f64(-2.25);

        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 0x42);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_i16().unwrap(), -5);
        assert_eq!(r.read_u16().unwrap(), 65535);
        assert_eq!(r.read_i32().unwrap(), -100_000);
        assert_eq!(r.read_u32().unwrap(), 3_000_000_000);
        assert_eq!(r.read_i64().unwrap(), i64::MIN);
        assert_eq!(r.read_u64().unwrap(), u64::MAX);
        assert_eq!(r.read_f32().unwrap(), 1.5);
        assert_eq!(r.read_f64().unwrap(), -2.25);
        assert!(r.is_empty());
    }

    #[test]
    fn test_uuid_round_trip() {
        let id = Uuid::from_u128(0x00000000_0000_0000_0000_000000000105);
        let mut w = Writer::new();
        w.write_uuid(id);

        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 16);
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_uuid().unwrap(), id);
    }

    #[test]
    fn test_string_round_trip() {
        let mut w = Writer::new();
        w.write_str("héllo");

        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_str().unwrap(), "héllo");
        assert!(r.is_empty());
    }

    #[test]
    fn test_byte_array_round_trip() {
        let mut w = Writer::new();
        w.write_bytes(&[1, 2, 3, 4]);
        w.write_i32(-1); // absent array

        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_byte_array().unwrap(), &[1, 2, 3, 4]);
        assert_eq!(r.read_byte_array().unwrap(), &[] as &[u8]);
    }

    #[test]
    fn test_counted_array() {
        let mut w = Writer::new();
        w.write_u16(3);
        for v in [10i32, 20, 30] {
            w.write_i32(v);
        }

        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        let values = r.read_u16_counted(|r| r.read_i32()).unwrap();
        assert_eq!(values, vec![10, 20, 30]);
    }

    #[test]
    fn test_write_with_length_backfills() {
        let mut w = Writer::new();
        w.write_with_length(|w| w.write_raw(b"abcd"));

        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_i32().unwrap(), 4);
        assert_eq!(r.remaining(), 4);
        let mut scoped = r.read_scoped(4).unwrap();
        assert_eq!(scoped.read_u8().unwrap(), b'a');
    }

    #[test]
    fn test_short_read_is_error() {
        let mut r = Reader::new(&[0, 1]);
        assert!(r.read_i32().is_err());
    }

    #[test]
    fn test_skip_and_remaining() {
        let mut r = Reader::new(&[0, 1, 2, 3, 4]);
        r.skip(2).unwrap();
        assert_eq!(r.remaining(), 3);
        assert_eq!(r.position(), 2);
        assert!(r.skip(4).is_err());
    }
}
