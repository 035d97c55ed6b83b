//! Error types for TideDB
//!
//! Every public operation either succeeds or fails with one of the kinds
//! below; internal state stays usable or the realm is closed.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, TideError>;

/// Crate-wide error enum
#[derive(Debug, Error)]
pub enum TideError {
  /// Bad size, missing/malformed header, bad top-ref, bad footer
  #[error("invalid database file {path}: {reason}")]
  InvalidDatabase { path: PathBuf, reason: String },

  /// Encryption key mismatch or corrupted ciphertext
  #[error("decryption failed for {path}: {reason}")]
  DecryptionFailed { path: PathBuf, reason: String },

  /// Ref-space overflow during alloc or slab extension
  #[error("maximum file size exceeded: {0}")]
  MaximumFileSizeExceeded(String),

  /// Free-list push failed; allocator poisoned until reset
  #[error("free space tracking was lost; allocations disabled until reset")]
  InvalidFreeSpace,

  /// mmap failed for lack of virtual address space
  #[error("address space exhausted mapping {0} bytes")]
  AddressSpaceExhausted(usize),

  /// Second open disagrees on immutable/in-memory/encryption/schema/sync
  #[error("mismatched configuration for realm at '{path}': {reason}")]
  MismatchedConfig { path: PathBuf, reason: String },

  /// Cached schema differs from caller-supplied schema
  #[error("mismatched schema: {0}")]
  MismatchedSchema(String),

  /// Sync instruction failed path/type/size checks
  #[error("bad changeset: {0}")]
  BadChangeset(String),

  /// Destructive schema diff, cycle detected, or recovery disallowed
  #[error("client reset failed: {0}")]
  ClientResetFailed(String),

  /// Transient race with a concurrent writer during open; caller should retry
  #[error("transient race while opening the file; retry the open")]
  Retry,

  /// API misuse
  #[error("logic error: {0}")]
  LogicError(String),

  /// Underlying I/O failure
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl TideError {
  pub fn invalid_database(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
    TideError::InvalidDatabase {
      path: path.into(),
      reason: reason.into(),
    }
  }

  pub fn mismatched_config(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
    TideError::MismatchedConfig {
      path: path.into(),
      reason: reason.into(),
    }
  }

  /// True for errors that a bounded open-retry loop may absorb
  pub fn is_transient(&self) -> bool {
    matches!(self, TideError::Retry)
  }
}
