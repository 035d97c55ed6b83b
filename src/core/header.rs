//! File header and streaming footer codec
//!
//! Layout (little-endian):
//!
//! ```text
//! offset  size  field
//! 0       16    top_ref[2]    : 8-byte slots
//! 16       4    mnemonic      : 'T','-','D','B'
//! 20       2    file_format[2]: one byte per slot
//! 22       1    reserved      : bit0 = encrypted marker
//! 23       1    flags         : bit0 = select bit
//! ```
//!
//! A streaming-form file carries the sentinel in slot 0 and its real
//! top ref in a footer `{magic_cookie, top_ref}` placed at end-of-file.

use std::path::Path;

use bitflags::bitflags;

use crate::constants::{
  CURRENT_FILE_FORMAT, FOOTER_MAGIC_COOKIE, FOOTER_SIZE, HEADER_SIZE,
  MIN_SUPPORTED_FILE_FORMAT, MNEMONIC, STREAMING_SENTINEL,
};
use crate::error::{Result, TideError};
use crate::types::Ref;
use crate::util::binary::{read_u64_at, write_u64_at};

bitflags! {
  /// Header flags byte
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct HeaderFlags: u8 {
    /// Which top-ref slot is authoritative
    const SELECT_BIT = 0b0000_0001;
  }
}

bitflags! {
  /// Reserved byte, used for engine-local markers
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct ReservedFlags: u8 {
    /// File was created under an encryption key
    const ENCRYPTED = 0b0000_0001;
  }
}

/// Decoded 24-byte file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
  pub top_ref: [u64; 2],
  pub file_format: [u8; 2],
  pub reserved: ReservedFlags,
  pub flags: HeaderFlags,
}

impl FileHeader {
  /// Header written into a brand new (empty) file
  pub fn new_empty() -> Self {
    Self {
      top_ref: [0, 0],
      file_format: [0, 0],
      reserved: ReservedFlags::empty(),
      flags: HeaderFlags::empty(),
    }
  }

  /// Header of a streaming-form file (real top ref lives in the footer)
  pub fn new_streaming() -> Self {
    Self {
      top_ref: [STREAMING_SENTINEL, 0],
      file_format: [CURRENT_FILE_FORMAT, 0],
      reserved: ReservedFlags::empty(),
      flags: HeaderFlags::empty(),
    }
  }

  pub fn parse(buf: &[u8]) -> Result<Self> {
    assert!(buf.len() >= HEADER_SIZE);
    Ok(Self {
      top_ref: [read_u64_at(buf, 0), read_u64_at(buf, 8)],
      file_format: [buf[20], buf[21]],
      reserved: ReservedFlags::from_bits_truncate(buf[22]),
      flags: HeaderFlags::from_bits_truncate(buf[23]),
    })
  }

  pub fn serialize(&self) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    write_u64_at(&mut buf, 0, self.top_ref[0]);
    write_u64_at(&mut buf, 8, self.top_ref[1]);
    buf[16..20].copy_from_slice(&MNEMONIC);
    buf[20] = self.file_format[0];
    buf[21] = self.file_format[1];
    buf[22] = self.reserved.bits();
    buf[23] = self.flags.bits();
    buf
  }

  /// Index of the authoritative top-ref slot
  pub fn selected_slot(&self) -> usize {
    usize::from(self.flags.contains(HeaderFlags::SELECT_BIT))
  }

  /// Slot the next commit must write into
  pub fn inactive_slot(&self) -> usize {
    1 - self.selected_slot()
  }

  pub fn is_streaming_form(&self) -> bool {
    self.selected_slot() == 0 && self.top_ref[0] == STREAMING_SENTINEL
  }

  pub fn selected_file_format(&self) -> u8 {
    self.file_format[self.selected_slot()]
  }
}

/// Streaming-form footer, placed immediately before end-of-file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingFooter {
  pub magic_cookie: u64,
  pub top_ref: Ref,
}

impl StreamingFooter {
  pub fn new(top_ref: Ref) -> Self {
    Self {
      magic_cookie: FOOTER_MAGIC_COOKIE,
      top_ref,
    }
  }

  pub fn parse(buf: &[u8]) -> Self {
    assert!(buf.len() >= FOOTER_SIZE);
    Self {
      magic_cookie: read_u64_at(buf, 0),
      top_ref: read_u64_at(buf, 8),
    }
  }

  pub fn serialize(&self) -> [u8; FOOTER_SIZE] {
    let mut buf = [0u8; FOOTER_SIZE];
    write_u64_at(&mut buf, 0, self.magic_cookie);
    write_u64_at(&mut buf, 8, self.top_ref);
    buf
  }
}

/// Validate a mapped buffer and extract the effective top ref.
///
/// Checks size sanity, the mnemonic, footer magic for streaming-form
/// files, and that the top ref is 8-aligned and inside the buffer.
pub fn validate_buffer(data: &[u8], size: u64, path: &Path) -> Result<Ref> {
  if size < HEADER_SIZE as u64 || size % 8 != 0 {
    return Err(TideError::invalid_database(path, "file has bad size"));
  }
  if data[16..20] != MNEMONIC {
    return Err(TideError::invalid_database(path, "not a TideDB file"));
  }
  let header = FileHeader::parse(data)?;
  let top_ref = if header.is_streaming_form() {
    if size < (HEADER_SIZE + FOOTER_SIZE) as u64 {
      return Err(TideError::invalid_database(
        path,
        "streaming-form file has bad size",
      ));
    }
    let footer_offset = size as usize - FOOTER_SIZE;
    let footer = StreamingFooter::parse(&data[footer_offset..]);
    if footer.magic_cookie != FOOTER_MAGIC_COOKIE {
      return Err(TideError::invalid_database(path, "bad streaming footer"));
    }
    footer.top_ref
  } else {
    header.top_ref[header.selected_slot()]
  };
  if top_ref % 8 != 0 {
    return Err(TideError::invalid_database(path, "misaligned top ref"));
  }
  if top_ref >= size {
    return Err(TideError::invalid_database(path, "top ref out of bounds"));
  }
  // Format byte 0 means "undecided" (file never committed to).
  let format = header.selected_file_format();
  if format != 0 && format < MIN_SUPPORTED_FILE_FORMAT {
    return Err(TideError::invalid_database(
      path,
      format!("file format {format} is too old to open"),
    ));
  }
  Ok(top_ref)
}

/// Extract the top ref without validation (used with `skip_validate`)
pub fn get_top_ref(data: &[u8], size: u64) -> Result<Ref> {
  let header = FileHeader::parse(data)?;
  if header.is_streaming_form() {
    let footer_offset = size as usize - FOOTER_SIZE;
    Ok(StreamingFooter::parse(&data[footer_offset..]).top_ref)
  } else {
    Ok(header.top_ref[header.selected_slot()])
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::PathBuf;

  fn path() -> PathBuf {
    PathBuf::from("/tmp/t.tidedb")
  }

  #[test]
  fn select_bit_picks_the_slot() {
    let mut header = FileHeader::new_empty();
    header.top_ref = [24, 48];
    assert_eq!(header.selected_slot(), 0);
    header.flags |= HeaderFlags::SELECT_BIT;
    assert_eq!(header.selected_slot(), 1);
    assert_eq!(header.inactive_slot(), 0);
  }

  #[test]
  fn header_round_trips() {
    let mut header = FileHeader::new_streaming();
    header.flags = HeaderFlags::SELECT_BIT;
    header.reserved = ReservedFlags::ENCRYPTED;
    let parsed = FileHeader::parse(&header.serialize()).unwrap();
    assert_eq!(parsed, header);
  }

  #[test]
  fn validate_rejects_bad_mnemonic() {
    let buf = vec![0u8; 4096];
    assert!(matches!(
      validate_buffer(&buf, 4096, &path()),
      Err(TideError::InvalidDatabase { .. })
    ));
  }

  #[test]
  fn validate_reads_streaming_footer() {
    let mut buf = FileHeader::new_streaming().serialize().to_vec();
    buf.resize(4096 - FOOTER_SIZE, 0);
    buf.extend_from_slice(&StreamingFooter::new(128).serialize());
    assert_eq!(validate_buffer(&buf, 4096, &path()).unwrap(), 128);
  }

  #[test]
  fn validate_rejects_bad_cookie() {
    let mut buf = FileHeader::new_streaming().serialize().to_vec();
    buf.resize(4096, 0);
    assert!(validate_buffer(&buf, 4096, &path()).is_err());
  }

  #[test]
  fn validate_rejects_out_of_bounds_top_ref() {
    let mut header = FileHeader::new_empty();
    header.top_ref = [8192, 0];
    let mut buf = header.serialize().to_vec();
    buf.resize(4096, 0);
    assert!(validate_buffer(&buf, 4096, &path()).is_err());
  }
}
