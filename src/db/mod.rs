//! Database handle: snapshot versions, the writer lock, commit
//! promotion and history.
//!
//! One `Db` exists per opened file (owned by the coordinator). Write
//! transactions serialize through the writer lock; commits promote the
//! transaction's slabs to file bytes, flip the header select bit, and
//! advance the version registry. Readers pin their version; retired
//! nodes are reclaimed only once no pinned version can still see them.

pub mod group;
pub mod history;
pub mod schema;
pub mod transaction;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use crate::constants::{CURRENT_FILE_FORMAT, HEADER_SIZE};
use crate::core::alloc::SlabAllocator;
use crate::core::header::{FileHeader, HeaderFlags, ReservedFlags};
use crate::core::mapping::AttachConfig;
use crate::core::section::upper_boundary;
use crate::db::group::Group;
use crate::db::history::{ChangeSummary, HistoryEntry, HistoryLog};
use crate::db::transaction::{Transaction, TransactionStage};
use crate::error::{Result, TideError};
use crate::types::{Ref, Version};

// ============================================================================
// Options
// ============================================================================

/// How a database file is opened
#[derive(Debug, Clone, Default)]
pub struct DbOptions {
  pub path: Option<PathBuf>,
  pub in_memory: bool,
  pub read_only: bool,
  pub no_create: bool,
  pub is_shared: bool,
  pub session_initiator: bool,
  pub clear_file: bool,
  pub encryption_key: Option<[u8; 64]>,
  pub skip_validate: bool,
  /// Record instruction changesets on commit (sync client history)
  pub sync_history: bool,
}

impl DbOptions {
  pub fn for_path(path: impl Into<PathBuf>) -> Self {
    Self {
      path: Some(path.into()),
      ..Self::default()
    }
  }

  pub fn in_memory() -> Self {
    Self {
      in_memory: true,
      ..Self::default()
    }
  }
}

// ============================================================================
// Version registry
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct VersionInfo {
  top_ref: Ref,
  file_size: u64,
  pins: usize,
}

#[derive(Debug, Default)]
struct Registry {
  versions: BTreeMap<Version, VersionInfo>,
  latest: Version,
}

impl Registry {
  fn min_live(&self) -> Version {
    self
      .versions
      .iter()
      .filter(|(_, info)| info.pins > 0)
      .map(|(v, _)| *v)
      .next()
      .unwrap_or(self.latest)
  }

  /// Drop unpinned versions older than the latest
  fn prune(&mut self) {
    let latest = self.latest;
    self
      .versions
      .retain(|v, info| *v == latest || info.pins > 0);
  }
}

// ============================================================================
// Db
// ============================================================================

pub struct Db {
  options: DbOptions,
  alloc: RwLock<SlabAllocator>,
  registry: Mutex<Registry>,
  history: Mutex<HistoryLog>,
  /// `(version, refs)`: nodes superseded by `version`, freeable once no
  /// pinned snapshot is older than it
  garbage: Mutex<Vec<(Version, Vec<Ref>)>>,
  writer_busy: Mutex<bool>,
  writer_cv: Condvar,
  /// Invoked after every commit with the new version (notifier wakeup)
  commit_hook: Mutex<Option<Box<dyn Fn(Version) + Send + Sync>>>,
  /// Server-side version most recently integrated by the sync client
  last_integrated_remote: Mutex<Version>,
  /// Local version whose changeset the server has acknowledged; on
  /// sync realms the history is only trimmed up to this watermark
  uploaded: Mutex<Version>,
}

impl std::fmt::Debug for Db {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Db").finish()
  }
}

impl Db {
  pub fn open(options: DbOptions) -> Result<Arc<Db>> {
    let mut alloc = SlabAllocator::new();
    let (top_ref, file_size) = if options.in_memory {
      if options.encryption_key.is_some() {
        return Err(TideError::LogicError(
          "encryption is not supported for in-memory realms".into(),
        ));
      }
      alloc.attach_empty();
      (0, alloc.baseline())
    } else {
      let path = options.path.as_deref().ok_or_else(|| {
        TideError::LogicError("a path is required unless in_memory is set".into())
      })?;
      let cfg = AttachConfig {
        read_only: options.read_only,
        no_create: options.no_create,
        is_shared: options.is_shared,
        session_initiator: options.session_initiator,
        clear_file: options.clear_file,
        encryption_key: options.encryption_key,
        skip_validate: options.skip_validate,
      };
      let top_ref = alloc.attach_file(path, &cfg)?;
      (top_ref, alloc.baseline())
    };
    alloc.reset_free_space_tracking();

    let mut registry = Registry::default();
    registry.latest = 1;
    registry.versions.insert(
      1,
      VersionInfo {
        top_ref,
        file_size,
        pins: 0,
      },
    );

    Ok(Arc::new(Db {
      options,
      alloc: RwLock::new(alloc),
      registry: Mutex::new(registry),
      history: Mutex::new(HistoryLog::new()),
      garbage: Mutex::new(Vec::new()),
      writer_busy: Mutex::new(false),
      writer_cv: Condvar::new(),
      commit_hook: Mutex::new(None),
      last_integrated_remote: Mutex::new(0),
      uploaded: Mutex::new(0),
    }))
  }

  pub fn path(&self) -> Option<&Path> {
    self.options.path.as_deref()
  }

  pub fn is_in_memory(&self) -> bool {
    self.options.in_memory
  }

  pub fn is_read_only(&self) -> bool {
    self.options.read_only
  }

  pub fn sync_history_enabled(&self) -> bool {
    self.options.sync_history
  }

  pub fn latest_version(&self) -> Version {
    self.registry.lock().latest
  }

  pub fn number_of_live_versions(&self) -> usize {
    self.registry.lock().versions.len()
  }

  /// Register the post-commit callback (coordinator wakeup)
  pub fn set_commit_hook(&self, hook: Box<dyn Fn(Version) + Send + Sync>) {
    *self.commit_hook.lock() = Some(hook);
  }

  pub fn last_integrated_remote_version(&self) -> Version {
    *self.last_integrated_remote.lock()
  }

  pub fn set_last_integrated_remote_version(&self, version: Version) {
    *self.last_integrated_remote.lock() = version;
  }

  // ==========================================================================
  // Transactions
  // ==========================================================================

  /// Begin a read transaction, at `version` if given, else at latest
  pub fn begin_read(self: &Arc<Self>, version: Option<Version>) -> Result<Transaction> {
    self.begin_at(version, TransactionStage::Reading)
  }

  /// Begin a frozen transaction pinning `version`
  pub fn begin_frozen(self: &Arc<Self>, version: Version) -> Result<Transaction> {
    self.begin_at(Some(version), TransactionStage::Frozen)
  }

  pub(crate) fn begin_read_at(
    self: &Arc<Self>,
    version: Version,
    stage: TransactionStage,
  ) -> Result<Transaction> {
    self.begin_at(Some(version), stage)
  }

  fn begin_at(
    self: &Arc<Self>,
    version: Option<Version>,
    stage: TransactionStage,
  ) -> Result<Transaction> {
    // Picking the version and pinning it happen under one registry
    // lock: resolving "latest" first would race with a commit pruning
    // the version it returned.
    let (version, top_ref) = {
      let mut registry = self.registry.lock();
      let version = version.unwrap_or(registry.latest);
      let info = registry.versions.get_mut(&version).ok_or_else(|| {
        TideError::LogicError(format!("snapshot version {version} is no longer available"))
      })?;
      info.pins += 1;
      (version, info.top_ref)
    };
    // Registry lock is released before the allocator is taken; the pin
    // keeps the snapshot's nodes from being reclaimed underneath us.
    let group = {
      let alloc = self.alloc.read();
      Group::read_from(&alloc, top_ref)
    };
    match group {
      Ok(group) => Ok(Transaction::new(self.clone(), stage, version, group)),
      Err(e) => {
        self.unpin(version);
        Err(e)
      }
    }
  }

  /// Begin a write transaction at the latest version. Blocks until the
  /// writer lock is available.
  pub fn begin_write(self: &Arc<Self>) -> Result<Transaction> {
    if self.options.read_only {
      return Err(TideError::LogicError(
        "cannot write to a read-only realm".into(),
      ));
    }
    {
      let mut busy = self.writer_busy.lock();
      while *busy {
        self.writer_cv.wait(&mut busy);
      }
      *busy = true;
    }
    match self.begin_at(None, TransactionStage::Writing) {
      Ok(tx) => Ok(tx),
      Err(e) => {
        self.release_writer();
        Err(e)
      }
    }
  }

  fn release_writer(&self) {
    let mut busy = self.writer_busy.lock();
    *busy = false;
    self.writer_cv.notify_one();
  }

  pub(crate) fn unpin(&self, version: Version) {
    let mut registry = self.registry.lock();
    if let Some(info) = registry.versions.get_mut(&version) {
      debug_assert!(info.pins > 0);
      info.pins = info.pins.saturating_sub(1);
    }
    registry.prune();
    let min_live = registry.min_live();
    drop(registry);
    self.history.lock().trim_below(self.trim_floor(min_live));
  }

  /// Oldest history version that must be retained. Sync realms keep
  /// everything not yet acknowledged by the server for upload and
  /// client-reset recovery.
  fn trim_floor(&self, min_live: Version) -> Version {
    if self.options.sync_history {
      min_live.min(*self.uploaded.lock() + 1)
    } else {
      min_live
    }
  }

  /// Record that the server has integrated every local changeset up to
  /// `version`; older history entries become trimmable.
  pub fn mark_uploaded(&self, version: Version) {
    {
      let mut uploaded = self.uploaded.lock();
      *uploaded = (*uploaded).max(version);
    }
    let min_live = self.registry.lock().min_live();
    self.history.lock().trim_below(self.trim_floor(min_live));
  }

  pub(crate) fn rollback_transaction(&self, version: Version) {
    self.release_writer();
    self.unpin(version);
  }

  /// Pin `target` (or, if it has been pruned, the current latest, which
  /// is never older) and decode its graph. The caller owns the new pin.
  pub(crate) fn pin_and_read(&self, target: Version) -> Result<(Version, Group)> {
    let (version, top_ref) = {
      let mut registry = self.registry.lock();
      let version = if registry.versions.contains_key(&target) {
        target
      } else {
        debug_assert!(registry.latest >= target);
        registry.latest
      };
      let info = registry
        .versions
        .get_mut(&version)
        .expect("the latest version is always live");
      info.pins += 1;
      (version, info.top_ref)
    };
    let group = {
      let alloc = self.alloc.read();
      Group::read_from(&alloc, top_ref)
    };
    match group {
      Ok(group) => Ok((version, group)),
      Err(e) => {
        self.unpin(version);
        Err(e)
      }
    }
  }

  // ==========================================================================
  // Commit
  // ==========================================================================

  pub(crate) fn commit_transaction(
    self: &Arc<Self>,
    tx: &mut Transaction,
    summary: ChangeSummary,
    changeset: Option<Vec<u8>>,
    to_disk: bool,
  ) -> Result<Version> {
    let old_version = tx.version();
    let mut retired = Vec::new();

    let (top_ref, file_size) = {
      let mut alloc = self.alloc.write();
      self.collect_garbage(&mut alloc);

      let top_ref = tx.group_mut().write_to(&mut alloc, &mut retired)?;

      if self.options.in_memory {
        // MemOnly durability: the slabs are the storage.
        (top_ref, alloc.total_ref_end())
      } else {
        let mapped = alloc
          .mapped_file()
          .cloned()
          .expect("file-backed allocator");
        let ref_end = alloc.total_ref_end();
        let new_size = upper_boundary(ref_end);
        if new_size > alloc.baseline() {
          mapped.resize_file(new_size)?;
        }
        for (start, bytes) in alloc.slab_contents() {
          mapped.write_at(start, bytes)?;
        }
        if to_disk {
          mapped.sync()?;
        }

        // Two-phase header update: fill the inactive slot, then flip
        // the select bit to make it authoritative.
        let mut header = mapped.read_header()?;
        let slot = header.inactive_slot();
        header.top_ref[slot] = top_ref;
        header.file_format[slot] = CURRENT_FILE_FORMAT;
        mapped.write_header(&header, to_disk)?;
        header.flags.toggle(HeaderFlags::SELECT_BIT);
        mapped.write_header(&header, to_disk)?;

        alloc.consolidate_free_readonly()?;
        alloc.reset_free_space_tracking();
        alloc.update_reader_view(new_size)?;
        (top_ref, new_size)
      }
    };

    let new_version = {
      let mut registry = self.registry.lock();
      let new_version = registry.latest + 1;
      registry.versions.insert(
        new_version,
        VersionInfo {
          top_ref,
          file_size,
          pins: 1, // inherited by the committing transaction
        },
      );
      registry.latest = new_version;
      if let Some(info) = registry.versions.get_mut(&old_version) {
        debug_assert!(info.pins > 0);
        info.pins = info.pins.saturating_sub(1);
      }
      registry.prune();
      new_version
    };

    if !retired.is_empty() {
      self.garbage.lock().push((new_version, retired));
    }

    self.history.lock().append(HistoryEntry {
      version: new_version,
      summary: Arc::new(summary),
      changeset: changeset.map(Arc::new),
      top_ref,
      file_size,
    });

    self.release_writer();
    debug!(version = new_version, top_ref, file_size, "committed");

    let hook = self.commit_hook.lock();
    if let Some(hook) = hook.as_ref() {
      hook(new_version);
    }
    Ok(new_version)
  }

  /// Free retired nodes whose superseding commit is now the oldest live
  /// version. Called with the allocator write lock held.
  fn collect_garbage(&self, alloc: &mut SlabAllocator) {
    let min_live = self.registry.lock().min_live();
    let mut garbage = self.garbage.lock();
    let mut i = 0;
    while i < garbage.len() {
      if garbage[i].0 <= min_live {
        let (_, refs) = garbage.swap_remove(i);
        for r in refs {
          alloc.free(r);
        }
      } else {
        i += 1;
      }
    }
  }

  // ==========================================================================
  // History access
  // ==========================================================================

  pub fn history_summary(&self, from: Version, to: Version) -> ChangeSummary {
    self.history.lock().summarize(from, to)
  }

  pub fn changesets_after(&self, from: Version) -> Vec<(Version, Arc<Vec<u8>>)> {
    self.history.lock().changesets_after(from)
  }

  // ==========================================================================
  // Compaction and copies
  // ==========================================================================

  /// Rewrite the file with all free space removed.
  ///
  /// Fails while any transaction is live on this handle.
  pub fn compact(self: &Arc<Self>) -> Result<bool> {
    if self.options.in_memory || self.options.read_only {
      return Ok(false);
    }
    {
      let registry = self.registry.lock();
      if registry.versions.values().any(|info| info.pins > 0) {
        return Err(TideError::LogicError(
          "cannot compact while transactions are open".into(),
        ));
      }
    }
    {
      let mut busy = self.writer_busy.lock();
      if *busy {
        return Err(TideError::LogicError(
          "cannot compact while a write is in progress".into(),
        ));
      }
      *busy = true;
    }
    let result = self.compact_locked();
    self.release_writer();
    result.map(|_| true)
  }

  fn compact_locked(&self) -> Result<()> {
    let path = self
      .options
      .path
      .clone()
      .expect("compact requires a file-backed realm");

    // The registry stays locked across the swap: a reader that pinned
    // the old snapshot before this point makes the compact abort, and
    // one arriving later observes the rewritten file's top ref.
    let mut alloc = self.alloc.write();
    let mut registry = self.registry.lock();
    if registry.versions.values().any(|info| info.pins > 0) {
      return Err(TideError::LogicError(
        "cannot compact while transactions are open".into(),
      ));
    }
    let latest = registry.latest;
    let top_ref = registry.versions[&latest].top_ref;

    let mut group = Group::read_from(&alloc, top_ref)?;
    group.reset_for_full_write();

    let tmp_path = path.with_extension("tcompact");
    let (new_top_ref, new_size) =
      write_group_to_file(&mut group, &tmp_path, self.options.encryption_key)?;

    // Swap in the rewritten file and re-attach.
    alloc.detach();
    std::fs::rename(&tmp_path, &path)?;
    let cfg = AttachConfig {
      read_only: false,
      no_create: true,
      is_shared: self.options.is_shared,
      session_initiator: self.options.session_initiator,
      clear_file: false,
      encryption_key: self.options.encryption_key,
      skip_validate: false,
    };
    let reopened_top = alloc.attach_file(&path, &cfg)?;
    debug_assert_eq!(reopened_top, new_top_ref);
    alloc.reset_free_space_tracking();
    self.garbage.lock().clear();

    registry.versions.insert(
      latest,
      VersionInfo {
        top_ref: new_top_ref,
        file_size: new_size.max(alloc.baseline()),
        pins: 0,
      },
    );
    debug!(path = %path.display(), new_size, "compacted");
    Ok(())
  }

  /// `(total_bytes, used_bytes)` of the latest snapshot, consulted by
  /// the compact-on-launch predicate
  pub fn storage_footprint(&self) -> Result<(u64, u64)> {
    let (top_ref, file_size) = {
      let registry = self.registry.lock();
      let info = registry.versions[&registry.latest];
      (info.top_ref, info.file_size)
    };
    let alloc = self.alloc.read();
    let group = Group::read_from(&alloc, top_ref)?;
    let used = group.live_node_bytes(&alloc) + HEADER_SIZE as u64;
    Ok((file_size.max(used), used))
  }

  /// Write a standalone copy of the latest snapshot to `path`
  pub fn write_copy(self: &Arc<Self>, path: &Path, key: Option<[u8; 64]>) -> Result<()> {
    let top_ref = {
      let registry = self.registry.lock();
      registry.versions[&registry.latest].top_ref
    };
    let alloc = self.alloc.read();
    let mut group = Group::read_from(&alloc, top_ref)?;
    drop(alloc);
    group.reset_for_full_write();
    write_group_to_file(&mut group, path, key)?;
    Ok(())
  }
}

/// Serialize a group into a fresh standalone file: header, then nodes.
/// Returns the top ref and the file size.
fn write_group_to_file(
  group: &mut Group,
  path: &Path,
  key: Option<[u8; 64]>,
) -> Result<(Ref, u64)> {
  let mut scratch = SlabAllocator::new();
  scratch.attach_empty();
  scratch.reset_free_space_tracking();
  let top_ref = group.write_to(&mut scratch, &mut Vec::new())?;

  // Pad to a section boundary so any later attach mode can map the
  // file without extending it first.
  let end = upper_boundary(scratch.total_ref_end());
  let mut bytes = vec![0u8; end as usize];
  let mut header = FileHeader::new_empty();
  header.top_ref[0] = top_ref;
  header.file_format[0] = CURRENT_FILE_FORMAT;
  if key.is_some() {
    header.reserved |= ReservedFlags::ENCRYPTED;
  }
  bytes[..HEADER_SIZE].copy_from_slice(&header.serialize());
  for (start, slab) in scratch.slab_contents() {
    let start = start as usize;
    let len = slab.len().min(bytes.len() - start);
    bytes[start..start + len].copy_from_slice(&slab[..len]);
  }

  std::fs::write(path, &bytes)?;
  Ok((top_ref, bytes.len() as u64))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{DataType, Value};

  fn open_tmp(name: &str) -> (tempfile::TempDir, Arc<Db>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Db::open(DbOptions::for_path(dir.path().join(name))).expect("open");
    (dir, db)
  }

  #[test]
  fn fresh_file_commits_and_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("basic.tidedb");
    {
      let db = Db::open(DbOptions::for_path(&path)).unwrap();
      let mut tx = db.begin_write().unwrap();
      let table = tx
        .add_table_with_primary_key("person", DataType::Int, "id", false)
        .unwrap();
      tx.create_object_with_pk(table, Value::Int(7)).unwrap();
      tx.commit().unwrap();
    }
    {
      let db = Db::open(DbOptions::for_path(&path)).unwrap();
      let tx = db.begin_read(None).unwrap();
      let table = tx.group().table_by_name("person").unwrap();
      assert_eq!(table.size(), 1);
      assert!(table.find_by_pk(&Value::Int(7)).is_some());
    }
  }

  #[test]
  fn readers_pin_their_snapshot() {
    let (_dir, db) = open_tmp("pin.tidedb");
    let mut tx = db.begin_write().unwrap();
    let table = tx.add_table("log").unwrap();
    tx.create_object(table).unwrap();
    let v1 = tx.commit().unwrap();

    let reader = db.begin_read(Some(v1)).unwrap();
    assert_eq!(reader.group().table_by_name("log").unwrap().size(), 1);

    // Writer advances twice while the reader stays pinned.
    for _ in 0..2 {
      let mut tx = db.begin_write().unwrap();
      let table = tx.group().key_of("log").unwrap();
      tx.create_object(table).unwrap();
      tx.commit().unwrap();
    }

    assert_eq!(reader.version(), v1);
    assert_eq!(reader.group().table_by_name("log").unwrap().size(), 1);
    let latest = db.begin_read(None).unwrap();
    assert_eq!(latest.group().table_by_name("log").unwrap().size(), 3);
  }

  #[test]
  fn advance_refreshes_to_latest() {
    let (_dir, db) = open_tmp("advance.tidedb");
    let mut tx = db.begin_write().unwrap();
    let table = tx.add_table("events").unwrap();
    tx.create_object(table).unwrap();
    tx.commit().unwrap();

    let mut reader = db.begin_read(None).unwrap();
    let before = reader.version();

    let mut tx = db.begin_write().unwrap();
    let table = tx.group().key_of("events").unwrap();
    tx.create_object(table).unwrap();
    tx.commit().unwrap();

    assert!(reader.refresh().unwrap());
    assert!(reader.version() > before);
    assert_eq!(reader.group().table_by_name("events").unwrap().size(), 2);
    assert!(!reader.refresh().unwrap());
  }

  #[test]
  fn writer_lock_serializes_writers() {
    let (_dir, db) = open_tmp("serial.tidedb");
    {
      let mut tx = db.begin_write().unwrap();
      tx.add_table("a").unwrap();
      tx.commit().unwrap();
    }
    let db2 = db.clone();
    let t = std::thread::spawn(move || {
      let mut tx = db2.begin_write().unwrap();
      let key = tx.add_table("b").unwrap();
      tx.create_object(key).unwrap();
      tx.commit().unwrap()
    });
    let v = t.join().unwrap();
    assert!(v >= 2);
    let tx = db.begin_read(None).unwrap();
    assert!(tx.group().table_by_name("b").is_some());
  }

  #[test]
  fn rollback_discards_changes() {
    let (_dir, db) = open_tmp("rollback.tidedb");
    {
      let mut tx = db.begin_write().unwrap();
      tx.add_table("kept").unwrap();
      tx.commit().unwrap();
    }
    {
      let mut tx = db.begin_write().unwrap();
      tx.add_table("dropped").unwrap();
      tx.rollback().unwrap();
    }
    let tx = db.begin_read(None).unwrap();
    assert!(tx.group().table_by_name("kept").is_some());
    assert!(tx.group().table_by_name("dropped").is_none());
  }

  #[test]
  fn in_memory_realm_round_trips_without_a_file() {
    let db = Db::open(DbOptions::in_memory()).unwrap();
    let mut tx = db.begin_write().unwrap();
    let table = tx
      .add_table_with_primary_key("kv", DataType::String, "k", false)
      .unwrap();
    tx.create_object_with_pk(table, Value::String("x".into()))
      .unwrap();
    tx.commit().unwrap();

    let tx = db.begin_read(None).unwrap();
    assert_eq!(tx.group().table_by_name("kv").unwrap().size(), 1);
  }

  #[test]
  fn in_memory_rejects_encryption() {
    let mut options = DbOptions::in_memory();
    options.encryption_key = Some([1u8; 64]);
    assert!(matches!(
      Db::open(options),
      Err(TideError::LogicError(_))
    ));
  }

  #[test]
  fn compact_preserves_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("compact.tidedb");
    let db = Db::open(DbOptions::for_path(&path)).unwrap();
    {
      let mut tx = db.begin_write().unwrap();
      let table = tx
        .add_table_with_primary_key("person", DataType::Int, "id", false)
        .unwrap();
      for i in 0..50 {
        tx.create_object_with_pk(table, Value::Int(i)).unwrap();
      }
      tx.commit().unwrap();
    }
    for _ in 0..10 {
      let mut tx = db.begin_write().unwrap();
      let table = tx.group().key_of("person").unwrap();
      let existing = tx
        .group()
        .table(table)
        .unwrap()
        .column_by_name("bump")
        .map(|c| c.key);
      let col = match existing {
        Some(key) => key,
        None => tx
          .add_column(
            table,
            "bump",
            DataType::Int,
            true,
            crate::types::CollectionKind::Single,
            None,
          )
          .unwrap(),
      };
      let obj = tx.group().table(table).unwrap().find_by_pk(&Value::Int(1)).unwrap();
      tx.set_value(table, obj, col, Value::Int(42)).unwrap();
      tx.commit().unwrap();
    }

    let before = std::fs::metadata(&path).unwrap().len();
    assert!(db.compact().unwrap());
    let after = std::fs::metadata(&path).unwrap().len();
    assert!(after <= before);

    let tx = db.begin_read(None).unwrap();
    assert_eq!(tx.group().table_by_name("person").unwrap().size(), 50);
  }

  #[test]
  fn write_copy_reopens_standalone() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(DbOptions::for_path(dir.path().join("orig.tidedb"))).unwrap();
    {
      let mut tx = db.begin_write().unwrap();
      let table = tx.add_table("notes").unwrap();
      tx.create_object(table).unwrap();
      tx.commit().unwrap();
    }
    let copy_path = dir.path().join("copy.tidedb");
    db.write_copy(&copy_path, None).unwrap();

    let copy = Db::open(DbOptions::for_path(&copy_path)).unwrap();
    let tx = copy.begin_read(None).unwrap();
    assert_eq!(tx.group().table_by_name("notes").unwrap().size(), 1);
  }
}
