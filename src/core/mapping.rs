//! Mapped file management
//!
//! One `MappedFile` record exists per absolute path in the process,
//! shared by refcount across every allocator attached to that path.
//! The record owns the file handle, the initial read-only mapping and a
//! growable vector of per-section mappings. Mappings are created under
//! the record's mutex but read without locking: once published, a
//! mapping's address is immutable until global detach.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use fs2::FileExt as _;
use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::debug;

use crate::constants::{FOOTER_SIZE, HEADER_SIZE, PAGE_SIZE};
use crate::core::header::{
  get_top_ref, validate_buffer, FileHeader, HeaderFlags, ReservedFlags, StreamingFooter,
};
use crate::core::section::{matches_boundary, section_base, section_index_of, upper_boundary};
use crate::error::{Result, TideError};
use crate::types::Ref;

// ============================================================================
// Attach configuration
// ============================================================================

/// Options controlling how a file is attached
#[derive(Debug, Clone, Default)]
pub struct AttachConfig {
  /// Open read-only; reject a missing file when `no_create` is also set
  pub read_only: bool,
  /// Do not create the file if absent
  pub no_create: bool,
  /// Open under lock-file discipline for multi-process safety
  pub is_shared: bool,
  /// This process opens first; may upgrade streaming form and extend
  /// the file to a section boundary
  pub session_initiator: bool,
  /// Truncate and reinitialize the header (requires `session_initiator`)
  pub clear_file: bool,
  /// 64-byte key; required if the file was created encrypted
  pub encryption_key: Option<[u8; 64]>,
  /// Bypass header/footer checks
  pub skip_validate: bool,
}

impl AttachConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn read_only(mut self, value: bool) -> Self {
    self.read_only = value;
    self
  }

  pub fn no_create(mut self, value: bool) -> Self {
    self.no_create = value;
    self
  }

  pub fn is_shared(mut self, value: bool) -> Self {
    self.is_shared = value;
    self
  }

  pub fn session_initiator(mut self, value: bool) -> Self {
    self.session_initiator = value;
    self
  }

  pub fn clear_file(mut self, value: bool) -> Self {
    self.clear_file = value;
    self
  }

  pub fn encryption_key(mut self, key: Option<[u8; 64]>) -> Self {
    self.encryption_key = key;
    self
  }

  pub fn skip_validate(mut self, value: bool) -> Self {
    self.skip_validate = value;
    self
  }
}

// ============================================================================
// Global by-path registry
// ============================================================================

fn all_files() -> &'static Mutex<HashMap<PathBuf, Weak<MappedFile>>> {
  static ALL_FILES: OnceLock<Mutex<HashMap<PathBuf, Weak<MappedFile>>>> = OnceLock::new();
  ALL_FILES.get_or_init(|| Mutex::new(HashMap::new()))
}

// ============================================================================
// MappedFile
// ============================================================================

#[derive(Debug)]
struct MappedFileState {
  file: Option<File>,
  /// Advisory lock held for the lifetime of a shared attach
  lock_file: Option<File>,
  initial_mapping: Option<Arc<Mmap>>,
  initial_size: u64,
  /// Section index of the first mapping beyond the initial one
  first_additional: usize,
  /// Per-section mappings beyond the initial one; grows monotonically
  additional: Vec<Arc<Mmap>>,
  encryption_key: Option<[u8; 64]>,
  /// Set once attach completed; later attachers reuse the mapping
  success: bool,
}

/// Process-shared mapped file record
#[derive(Debug)]
pub struct MappedFile {
  path: PathBuf,
  state: Mutex<MappedFileState>,
}

/// Snapshot of the mapping state handed to an attaching allocator
#[derive(Debug)]
pub struct MappingView {
  pub top_ref: Ref,
  pub file_size: u64,
  pub initial_mapping: Arc<Mmap>,
  pub initial_size: u64,
  pub first_additional: usize,
  pub additional: Vec<Arc<Mmap>>,
}

impl MappedFile {
  /// Attach to `path`, creating or reusing the process-global record.
  ///
  /// Returns the shared record together with a consistent view of the
  /// current mappings and the effective top ref.
  pub fn attach(path: &Path, cfg: &AttachConfig) -> Result<(Arc<MappedFile>, MappingView)> {
    assert!(
      !(cfg.is_shared && cfg.read_only),
      "shared access must go through a read-write session"
    );
    assert!(cfg.is_shared || !cfg.session_initiator);
    assert!(cfg.session_initiator || !cfg.clear_file);

    let path = path.to_path_buf();
    let record = {
      let mut files = all_files().lock();
      let existing = files.get(&path).and_then(Weak::upgrade);
      // A session initiator always starts from a fresh record: a stale
      // one can only be observed if the lock file was deleted while
      // handles were still open.
      match existing {
        Some(record) if !cfg.session_initiator => record,
        _ => {
          let record = Arc::new(MappedFile {
            path: path.clone(),
            state: Mutex::new(MappedFileState {
              file: None,
              lock_file: None,
              initial_mapping: None,
              initial_size: 0,
              first_additional: 0,
              additional: Vec::new(),
              encryption_key: None,
              success: false,
            }),
          });
          files.insert(path.clone(), Arc::downgrade(&record));
          record
        }
      }
    };

    let mut state = record.state.lock();
    if state.success {
      Self::check_key_match(&path, state.encryption_key.as_ref(), cfg.encryption_key.as_ref())?;
      let initial = state.initial_mapping.clone().expect("successful record has mapping");
      let top_ref = get_top_ref(&initial, state.initial_size)?;
      let view = MappingView {
        top_ref,
        file_size: state.initial_size,
        initial_mapping: initial,
        initial_size: state.initial_size,
        first_additional: state.first_additional,
        additional: state.additional.clone(),
      };
      drop(state);
      return Ok((record.clone(), view));
    }

    let view = record.do_first_attach(&mut state, cfg)?;
    drop(state);
    Ok((record.clone(), view))
  }

  fn check_key_match(
    path: &Path,
    earlier: Option<&[u8; 64]>,
    now: Option<&[u8; 64]>,
  ) -> Result<()> {
    match (earlier, now) {
      (None, None) => Ok(()),
      (None, Some(_)) => Err(TideError::DecryptionFailed {
        path: path.to_path_buf(),
        reason: "encryption key provided, but file already opened as non-encrypted".into(),
      }),
      (Some(_), None) => Err(TideError::DecryptionFailed {
        path: path.to_path_buf(),
        reason: "missing encryption key, but file already opened with one".into(),
      }),
      (Some(a), Some(b)) if a != b => Err(TideError::DecryptionFailed {
        path: path.to_path_buf(),
        reason: "encryption key mismatch".into(),
      }),
      _ => Ok(()),
    }
  }

  fn do_first_attach(&self, state: &mut MappedFileState, cfg: &AttachConfig) -> Result<MappingView> {
    let file = OpenOptions::new()
      .read(true)
      .write(!cfg.read_only)
      .create(!cfg.read_only && !cfg.no_create)
      .open(&self.path)
      .map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
          TideError::invalid_database(&self.path, "file does not exist")
        } else {
          TideError::Io(e)
        }
      })?;

    // Lock-file discipline for multi-process opens. The lock is held
    // exclusively while the initiator rewrites the header, shared
    // otherwise, and released at global detach.
    if cfg.is_shared {
      let lock_path = self.path.with_extension("tlock");
      let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&lock_path)?;
      if cfg.session_initiator {
        lock_file.lock_exclusive()?;
      } else {
        lock_file.lock_shared()?;
      }
      state.lock_file = Some(lock_file);
    }

    let physical_size = file.metadata()?.len();
    let mut size = physical_size;

    if cfg.encryption_key.is_some() && size > 0 && size < HEADER_SIZE as u64 {
      // The file holds data but is too small to have been created with
      // an encryption header.
      return Err(TideError::DecryptionFailed {
        path: self.path.clone(),
        reason: "attempt to open unencrypted file with encryption key".into(),
      });
    }

    if size == 0 || cfg.clear_file {
      if cfg.read_only {
        return Err(TideError::invalid_database(
          &self.path,
          "read-only access to empty file",
        ));
      }
      let mut header = FileHeader::new_empty();
      if cfg.encryption_key.is_some() {
        header.reserved |= ReservedFlags::ENCRYPTED;
      }
      file.set_len(0)?;
      file.write_at(&header.serialize(), 0)?;
      file.allocate(PAGE_SIZE as u64)?;
      file.sync_all()?;
      size = PAGE_SIZE as u64;
    } else {
      // Encryption markers must agree with the caller-supplied key.
      let mut header_buf = [0u8; HEADER_SIZE];
      file.read_exact_at(&mut header_buf, 0).map_err(|_| {
        TideError::invalid_database(&self.path, "file too small to hold a header")
      })?;
      if let Ok(header) = FileHeader::parse(&header_buf) {
        let encrypted = header.reserved.contains(ReservedFlags::ENCRYPTED);
        if encrypted && cfg.encryption_key.is_none() {
          return Err(TideError::DecryptionFailed {
            path: self.path.clone(),
            reason: "file is encrypted but no key was supplied".into(),
          });
        }
        if !encrypted && cfg.encryption_key.is_some() {
          return Err(TideError::DecryptionFailed {
            path: self.path.clone(),
            reason: "attempt to open unencrypted file with encryption key".into(),
          });
        }
      }
    }

    let mapping = unsafe { Mmap::map(&file) }
      .map_err(|_| TideError::AddressSpaceExhausted(size as usize))?;

    if !cfg.skip_validate {
      validate_buffer(&mapping[..size as usize], size, &self.path)?;
    }
    let mut top_ref = get_top_ref(&mapping, size)?;

    // Convert a streaming-form file to two-slot form before any mapping
    // is returned. A later commit would otherwise have to coordinate the
    // rewrite with every concurrent session member.
    let header = FileHeader::parse(&mapping)?;
    if cfg.session_initiator && header.is_streaming_form() {
      let footer_offset = size as usize - FOOTER_SIZE;
      let footer = StreamingFooter::parse(&mapping[footer_offset..]);
      let mut writable = header;
      writable.top_ref[1] = footer.top_ref;
      writable.file_format[1] = writable.file_format[0];
      file.write_at(&writable.serialize(), 0)?;
      file.sync_all()?;
      writable.flags |= HeaderFlags::SELECT_BIT;
      file.write_at(&writable.serialize(), 0)?;
      file.sync_all()?;
      top_ref = footer.top_ref;
      debug!(path = %self.path.display(), top_ref, "upgraded streaming-form file");
    }

    // The file can only be safely mapped in sections if its size falls
    // on a section boundary. Extending after mmap is fine here because
    // the initial mapping is re-created below.
    let mapping = if !matches_boundary(size) {
      if cfg.read_only {
        // A read-only file is assumed not to change underneath us; map
        // it as-is.
        Arc::new(mapping)
      } else if cfg.session_initiator || !cfg.is_shared {
        drop(mapping);
        size = upper_boundary(size);
        file.allocate(size)?;
        file.sync_all()?;
        let remapped = unsafe { Mmap::map(&file) }
          .map_err(|_| TideError::AddressSpaceExhausted(size as usize))?;
        Arc::new(remapped)
      } else {
        // A concurrent commit is extending the file and we observed it
        // part-way. The caller must back off and retry the open.
        return Err(TideError::Retry);
      }
    } else {
      Arc::new(mapping)
    };

    if cfg.session_initiator {
      if let Some(lock_file) = state.lock_file.as_ref() {
        lock_file.unlock()?;
        lock_file.lock_shared()?;
      }
    }

    state.file = Some(file);
    state.initial_mapping = Some(mapping.clone());
    state.initial_size = size;
    state.first_additional = section_index_of(size);
    state.encryption_key = cfg.encryption_key;
    state.success = true;

    Ok(MappingView {
      top_ref,
      file_size: size,
      initial_mapping: mapping,
      initial_size: size,
      first_additional: state.first_additional,
      additional: Vec::new(),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Grow the global mapping set to cover `file_size` and return a
  /// snapshot of the per-section mappings.
  ///
  /// The number of global mappings only ever increases; concurrent
  /// growers race to a maximum, not to a specific size.
  pub fn extend_mappings(&self, file_size: u64) -> Result<(usize, Vec<Arc<Mmap>>)> {
    let mut state = self.state.lock();
    let file = state
      .file
      .as_ref()
      .ok_or_else(|| TideError::LogicError("mapped file already closed".into()))?;
    let needed = section_index_of(file_size).saturating_sub(state.first_additional);
    let mut new_mappings = Vec::new();
    for k in state.additional.len()..needed {
      let section = k + state.first_additional;
      let start = section_base(section);
      let len = (section_base(section + 1) - start) as usize;
      let mapping = unsafe { memmap2::MmapOptions::new().offset(start).len(len).map(file) }
        .map_err(|_| TideError::AddressSpaceExhausted(len))?;
      new_mappings.push(Arc::new(mapping));
    }
    state.additional.extend(new_mappings);
    Ok((state.first_additional, state.additional.clone()))
  }

  /// Current physical size of the underlying file
  pub fn file_size(&self) -> Result<u64> {
    let state = self.state.lock();
    let file = state
      .file
      .as_ref()
      .ok_or_else(|| TideError::LogicError("mapped file already closed".into()))?;
    Ok(file.metadata()?.len())
  }

  /// Extend the file to `new_size` (a section boundary) with real blocks
  pub fn resize_file(&self, new_size: u64) -> Result<()> {
    let state = self.state.lock();
    assert!(matches_boundary(new_size));
    let file = state
      .file
      .as_ref()
      .ok_or_else(|| TideError::LogicError("mapped file already closed".into()))?;
    file.allocate(new_size)?;
    Ok(())
  }

  /// Write raw bytes at a file offset (commit promotion path)
  pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
    let state = self.state.lock();
    let file = state
      .file
      .as_ref()
      .ok_or_else(|| TideError::LogicError("mapped file already closed".into()))?;
    file.write_at(bytes, offset)?;
    Ok(())
  }

  /// Read the current header straight from the file handle
  pub fn read_header(&self) -> Result<FileHeader> {
    let state = self.state.lock();
    let file = state
      .file
      .as_ref()
      .ok_or_else(|| TideError::LogicError("mapped file already closed".into()))?;
    let mut buf = [0u8; HEADER_SIZE];
    file.read_exact_at(&mut buf, 0)?;
    FileHeader::parse(&buf)
  }

  /// Write the header and optionally flush
  pub fn write_header(&self, header: &FileHeader, sync: bool) -> Result<()> {
    let state = self.state.lock();
    let file = state
      .file
      .as_ref()
      .ok_or_else(|| TideError::LogicError("mapped file already closed".into()))?;
    file.write_at(&header.serialize(), 0)?;
    if sync {
      file.sync_all()?;
    }
    Ok(())
  }

  /// Flush file contents to stable storage
  pub fn sync(&self) -> Result<()> {
    let state = self.state.lock();
    let file = state
      .file
      .as_ref()
      .ok_or_else(|| TideError::LogicError("mapped file already closed".into()))?;
    file.sync_all()?;
    Ok(())
  }
}

impl Drop for MappedFile {
  fn drop(&mut self) {
    let mut files = all_files().lock();
    if let Some(existing) = files.get(&self.path) {
      if existing.strong_count() == 0 {
        files.remove(&self.path);
      }
    }
    // File handle and advisory lock close with the state.
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::constants::STREAMING_SENTINEL;

  fn tmp(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(name);
    (dir, path)
  }

  #[test]
  fn attach_creates_and_initializes_file() {
    let (_dir, path) = tmp("fresh.tidedb");
    let (_mf, view) = MappedFile::attach(&path, &AttachConfig::new()).expect("attach");
    assert_eq!(view.top_ref, 0);
    assert_eq!(view.file_size, PAGE_SIZE as u64);
    let header = FileHeader::parse(&view.initial_mapping).unwrap();
    assert!(!header.is_streaming_form());
  }

  #[test]
  fn attach_missing_file_with_no_create_fails() {
    let (_dir, path) = tmp("missing.tidedb");
    let cfg = AttachConfig::new().no_create(true).read_only(true);
    assert!(matches!(
      MappedFile::attach(&path, &cfg),
      Err(TideError::InvalidDatabase { .. })
    ));
  }

  #[test]
  fn same_path_shares_the_record() {
    let (_dir, path) = tmp("shared.tidedb");
    let (a, _) = MappedFile::attach(&path, &AttachConfig::new()).unwrap();
    let (b, _) = MappedFile::attach(&path, &AttachConfig::new()).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
  }

  #[test]
  fn key_mismatch_on_shared_record_fails() {
    let (_dir, path) = tmp("keyed.tidedb");
    let key = [7u8; 64];
    let (_a, _) =
      MappedFile::attach(&path, &AttachConfig::new().encryption_key(Some(key))).unwrap();
    let err = MappedFile::attach(&path, &AttachConfig::new()).unwrap_err();
    assert!(matches!(err, TideError::DecryptionFailed { .. }));
    let err =
      MappedFile::attach(&path, &AttachConfig::new().encryption_key(Some([8u8; 64]))).unwrap_err();
    assert!(matches!(err, TideError::DecryptionFailed { .. }));
  }

  #[test]
  fn encrypted_file_requires_key_across_sessions() {
    let (_dir, path) = tmp("enc.tidedb");
    let key = [9u8; 64];
    {
      let (_mf, _) =
        MappedFile::attach(&path, &AttachConfig::new().encryption_key(Some(key))).unwrap();
    }
    // Record dropped; a fresh session without the key must fail.
    let err = MappedFile::attach(&path, &AttachConfig::new()).unwrap_err();
    assert!(matches!(err, TideError::DecryptionFailed { .. }));
  }

  #[test]
  fn streaming_form_is_promoted_by_session_initiator() {
    let (_dir, path) = tmp("stream.tidedb");
    // Build a streaming-form file by hand: header + padding + footer.
    let mut bytes = FileHeader::new_streaming().serialize().to_vec();
    bytes.resize(PAGE_SIZE - FOOTER_SIZE, 0);
    bytes.extend_from_slice(&StreamingFooter::new(64).serialize());
    std::fs::write(&path, &bytes).unwrap();

    let cfg = AttachConfig::new().is_shared(true).session_initiator(true);
    let (_mf, view) = MappedFile::attach(&path, &cfg).expect("attach streaming");
    assert_eq!(view.top_ref, 64);

    let header = FileHeader::parse(&view.initial_mapping).unwrap();
    assert_eq!(header.top_ref[1], 64);
    assert_eq!(header.selected_slot(), 1);
    assert_eq!(header.top_ref[0], STREAMING_SENTINEL);
  }

  #[test]
  fn non_boundary_size_without_initiator_retries() {
    let (_dir, path) = tmp("ragged.tidedb");
    // Simulate a partially extended file from a concurrent commit.
    let mut bytes = FileHeader::new_empty().serialize().to_vec();
    bytes.resize(PAGE_SIZE + 512, 0);
    std::fs::write(&path, &bytes).unwrap();

    let cfg = AttachConfig::new().is_shared(true).skip_validate(true);
    let err = MappedFile::attach(&path, &cfg).unwrap_err();
    assert!(matches!(err, TideError::Retry));
  }
}
