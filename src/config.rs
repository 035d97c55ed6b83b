//! Realm configuration

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::db::schema::{Schema, SchemaMode, NOT_VERSIONED};
use crate::db::transaction::Transaction;
use crate::error::Result;
use crate::sync::config::SyncConfig;

/// Delivery target for notifications.
///
/// The default scheduler invokes callbacks inline on the calling
/// thread; bindings install loop-aware schedulers. Two handles share a
/// cached realm iff they carry the same scheduler instance.
pub trait Scheduler: Send + Sync {
  fn invoke(&self, work: Box<dyn FnOnce() + Send>);
}

/// Runs callbacks immediately on the calling thread
#[derive(Default)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
  fn invoke(&self, work: Box<dyn FnOnce() + Send>) {
    work();
  }
}

/// Migration callback invoked for explicit-mutable schema modes
pub type MigrationFunction = Arc<dyn Fn(&mut Transaction, &Schema) -> Result<()> + Send + Sync>;

/// One-time initializer invoked on a fresh file
pub type InitializationFunction = Arc<dyn Fn(&mut Transaction) -> Result<()> + Send + Sync>;

/// Consulted on open with `(total_bytes, used_bytes)`
pub type ShouldCompactOnLaunch = Arc<dyn Fn(u64, u64) -> bool + Send + Sync>;

/// External audit sink configuration (opaque to the engine)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditConfig {
  pub partition_prefix: String,
}

/// Options for an opened realm
#[derive(Clone, Default)]
pub struct RealmConfig {
  pub path: Option<PathBuf>,
  pub in_memory: bool,
  pub encryption_key: Option<[u8; 64]>,
  pub schema: Option<Schema>,
  pub schema_version: Option<u64>,
  pub schema_mode: SchemaMode,
  pub migration_function: Option<MigrationFunction>,
  pub initialization_function: Option<InitializationFunction>,
  pub should_compact_on_launch: Option<ShouldCompactOnLaunch>,
  /// Use client replication history even without a sync config
  pub force_sync_history: bool,
  pub sync_config: Option<SyncConfig>,
  /// Whether this handle participates in the shared realm cache
  pub cache: bool,
  pub scheduler: Option<Arc<dyn Scheduler>>,
  pub audit_config: Option<AuditConfig>,
}

impl fmt::Debug for RealmConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RealmConfig")
      .field("path", &self.path)
      .field("in_memory", &self.in_memory)
      .field("encrypted", &self.encryption_key.is_some())
      .field("schema_version", &self.schema_version)
      .field("schema_mode", &self.schema_mode)
      .field("sync", &self.sync_config.is_some())
      .field("cache", &self.cache)
      .finish_non_exhaustive()
  }
}

impl RealmConfig {
  pub fn for_path(path: impl Into<PathBuf>) -> Self {
    Self {
      path: Some(path.into()),
      ..Self::default()
    }
  }

  pub fn immutable(&self) -> bool {
    self.schema_mode == SchemaMode::Immutable
  }

  pub fn effective_schema_version(&self) -> u64 {
    self.schema_version.unwrap_or(NOT_VERSIONED)
  }

  pub fn sync_history_enabled(&self) -> bool {
    self.force_sync_history || self.sync_config.is_some()
  }
}
