//! Little-endian buffer read/write helpers
//!
//! Thin wrappers over `byteorder` used by the header codec, the node
//! store, and the changeset framing.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Result, TideError};

pub fn read_u16_at(buf: &[u8], offset: usize) -> u16 {
  LittleEndian::read_u16(&buf[offset..offset + 2])
}

pub fn read_u32_at(buf: &[u8], offset: usize) -> u32 {
  LittleEndian::read_u32(&buf[offset..offset + 4])
}

pub fn read_u64_at(buf: &[u8], offset: usize) -> u64 {
  LittleEndian::read_u64(&buf[offset..offset + 8])
}

pub fn write_u32_at(buf: &mut [u8], offset: usize, value: u32) {
  LittleEndian::write_u32(&mut buf[offset..offset + 4], value);
}

pub fn write_u64_at(buf: &mut [u8], offset: usize, value: u64) {
  LittleEndian::write_u64(&mut buf[offset..offset + 8], value);
}

// ============================================================================
// Cursor-style reader for decoding variable-length payloads
// ============================================================================

/// Bounds-checked sequential reader over a byte slice
pub struct Reader<'a> {
  buf: &'a [u8],
  pos: usize,
}

impl<'a> Reader<'a> {
  pub fn new(buf: &'a [u8]) -> Self {
    Self { buf, pos: 0 }
  }

  pub fn remaining(&self) -> usize {
    self.buf.len() - self.pos
  }

  fn take(&mut self, len: usize) -> Result<&'a [u8]> {
    if self.remaining() < len {
      return Err(TideError::BadChangeset(format!(
        "truncated payload: wanted {len} bytes, {} left",
        self.remaining()
      )));
    }
    let out = &self.buf[self.pos..self.pos + len];
    self.pos += len;
    Ok(out)
  }

  pub fn read_u8(&mut self) -> Result<u8> {
    Ok(self.take(1)?[0])
  }

  pub fn read_u16(&mut self) -> Result<u16> {
    Ok(LittleEndian::read_u16(self.take(2)?))
  }

  pub fn read_u32(&mut self) -> Result<u32> {
    Ok(LittleEndian::read_u32(self.take(4)?))
  }

  pub fn read_u64(&mut self) -> Result<u64> {
    Ok(LittleEndian::read_u64(self.take(8)?))
  }

  pub fn read_i64(&mut self) -> Result<i64> {
    Ok(self.read_u64()? as i64)
  }

  pub fn read_f32(&mut self) -> Result<f32> {
    Ok(f32::from_bits(self.read_u32()?))
  }

  pub fn read_f64(&mut self) -> Result<f64> {
    Ok(f64::from_bits(self.read_u64()?))
  }

  pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
    let len = self.read_u32()? as usize;
    Ok(self.take(len)?.to_vec())
  }

  pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(self.take(N)?);
    Ok(out)
  }

  pub fn read_string(&mut self) -> Result<String> {
    let bytes = self.read_bytes()?;
    String::from_utf8(bytes)
      .map_err(|_| TideError::BadChangeset("string read fails: invalid utf-8".into()))
  }
}

// ============================================================================
// Writer
// ============================================================================

/// Sequential little-endian writer
#[derive(Default)]
pub struct Writer {
  buf: Vec<u8>,
}

impl Writer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn into_bytes(self) -> Vec<u8> {
    self.buf
  }

  pub fn len(&self) -> usize {
    self.buf.len()
  }

  pub fn is_empty(&self) -> bool {
    self.buf.is_empty()
  }

  pub fn write_u8(&mut self, value: u8) {
    self.buf.push(value);
  }

  pub fn write_u16(&mut self, value: u16) {
    self.buf.extend_from_slice(&value.to_le_bytes());
  }

  pub fn write_u32(&mut self, value: u32) {
    self.buf.extend_from_slice(&value.to_le_bytes());
  }

  pub fn write_u64(&mut self, value: u64) {
    self.buf.extend_from_slice(&value.to_le_bytes());
  }

  pub fn write_i64(&mut self, value: i64) {
    self.write_u64(value as u64);
  }

  pub fn write_f32(&mut self, value: f32) {
    self.write_u32(value.to_bits());
  }

  pub fn write_f64(&mut self, value: f64) {
    self.write_u64(value.to_bits());
  }

  pub fn write_bytes(&mut self, value: &[u8]) {
    self.write_u32(value.len() as u32);
    self.buf.extend_from_slice(value);
  }

  pub fn write_array(&mut self, value: &[u8]) {
    self.buf.extend_from_slice(value);
  }

  pub fn write_string(&mut self, value: &str) {
    self.write_bytes(value.as_bytes());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trip_scalars() {
    let mut w = Writer::new();
    w.write_u8(7);
    w.write_u32(0xdead_beef);
    w.write_i64(-42);
    w.write_string("tide");
    let bytes = w.into_bytes();

    let mut r = Reader::new(&bytes);
    assert_eq!(r.read_u8().unwrap(), 7);
    assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
    assert_eq!(r.read_i64().unwrap(), -42);
    assert_eq!(r.read_string().unwrap(), "tide");
    assert_eq!(r.remaining(), 0);
  }

  #[test]
  fn truncated_read_reports_error() {
    let bytes = [1u8, 2];
    let mut r = Reader::new(&bytes);
    assert!(r.read_u64().is_err());
  }
}
