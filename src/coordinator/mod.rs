//! Realm coordinator
//!
//! One coordinator exists per absolute path in the process, shared by
//! every realm instance on that file via a global weak map. It owns the
//! database handle, the realm registry, the schema cache, the notifier
//! lists and the background notifier worker.
//!
//! Lock order, outermost first: the global coordinator map, the realm
//! registry, a realm's transaction, the notifier state, the
//! running-notifiers guard. The schema cache and mapping mutexes are
//! orthogonal. No coordinator lock is held while user callbacks run.

pub mod async_open;
pub mod notifier;
pub mod worker;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{ImmediateScheduler, RealmConfig, Scheduler};
use crate::constants::{OPEN_RETRY_BACKOFF_MS, OPEN_RETRY_LIMIT};
use crate::db::schema::{Schema, SchemaMode, NOT_VERSIONED};
use crate::db::transaction::Transaction;
use crate::db::{Db, DbOptions};
use crate::error::{Result, TideError};
use crate::types::{ObjKey, TableKey, Version};

use self::notifier::{
  CollectionChangeSet, CollectionNotifier, NotificationCallback, NotificationToken,
};
use self::worker::NotifierWorker;

static NEXT_REALM_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Binding context
// ============================================================================

/// Hooks for the language binding. Callbacks may re-enter the engine
/// and may close the realm; the engine performs no member access on the
/// realm after invoking one.
pub trait BindingContext: Send {
  fn changes_available(&self) {}
  fn did_change(&self) {}
  fn will_send_notifications(&self) {}
  fn did_send_notifications(&self) {}
}

// ============================================================================
// Realm
// ============================================================================

/// A realm instance: one handle on the database bound to a scheduler
pub struct Realm {
  id: u64,
  coordinator: Arc<Coordinator>,
  config: RealmConfig,
  scheduler: Arc<dyn Scheduler>,
  frozen: bool,
  auto_refresh: AtomicBool,
  closed: AtomicBool,
  tx: Mutex<Option<Transaction>>,
  binding_context: Mutex<Option<Box<dyn BindingContext>>>,
}

impl std::fmt::Debug for Realm {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Realm")
      .field("id", &self.id)
      .field("frozen", &self.frozen)
      .field("auto_refresh", &self.auto_refresh)
      .field("closed", &self.closed)
      .finish()
  }
}

impl Realm {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn coordinator(&self) -> &Arc<Coordinator> {
    &self.coordinator
  }

  pub fn config(&self) -> &RealmConfig {
    &self.config
  }

  pub fn is_frozen(&self) -> bool {
    self.frozen
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  pub fn set_auto_refresh(&self, value: bool) {
    self.auto_refresh.store(value, Ordering::Release);
  }

  pub fn set_binding_context(&self, context: Box<dyn BindingContext>) {
    *self.binding_context.lock() = Some(context);
  }

  /// Version of the current read transaction
  pub fn read_version(&self) -> Result<Version> {
    let guard = self.tx.lock();
    guard
      .as_ref()
      .map(|tx| tx.version())
      .ok_or_else(|| TideError::LogicError("realm is closed".into()))
  }

  pub fn is_in_transaction(&self) -> bool {
    self
      .tx
      .lock()
      .as_ref()
      .is_some_and(|tx| tx.is_writing())
  }

  /// Run a closure against the current transaction
  pub fn read<R>(&self, f: impl FnOnce(&Transaction) -> R) -> Result<R> {
    let guard = self.tx.lock();
    let tx = guard
      .as_ref()
      .ok_or_else(|| TideError::LogicError("realm is closed".into()))?;
    Ok(f(tx))
  }

  /// Run a closure against the current transaction, mutably. The realm
  /// must be in a write transaction for mutations to succeed.
  pub fn with_transaction<R>(&self, f: impl FnOnce(&mut Transaction) -> R) -> Result<R> {
    let mut guard = self.tx.lock();
    let tx = guard
      .as_mut()
      .ok_or_else(|| TideError::LogicError("realm is closed".into()))?;
    Ok(f(tx))
  }

  /// Promote this realm to a write transaction (blocks on the writer)
  pub fn begin_transaction(&self) -> Result<()> {
    if self.frozen {
      return Err(TideError::LogicError(
        "can't begin a write transaction on a frozen realm".into(),
      ));
    }
    if self.is_in_transaction() {
      return Err(TideError::LogicError(
        "the realm is already in a write transaction".into(),
      ));
    }
    self.coordinator.promote_to_write(self)
  }

  /// Commit the active write transaction
  pub fn commit_transaction(self: &Arc<Self>) -> Result<Version> {
    self.coordinator.clone().commit_write(self, true)
  }

  /// Roll back the active write transaction
  pub fn cancel_transaction(&self) -> Result<()> {
    let mut guard = self.tx.lock();
    let tx = guard
      .take()
      .ok_or_else(|| TideError::LogicError("realm is closed".into()))?;
    if !tx.is_writing() {
      *guard = Some(tx);
      return Err(TideError::LogicError("no write transaction to cancel".into()));
    }
    let db = tx.db().clone();
    tx.rollback()?;
    *guard = Some(db.begin_read(None)?);
    Ok(())
  }

  /// Advance to the latest version, delivering ready notifications
  pub fn refresh(self: &Arc<Self>) -> Result<bool> {
    if self.frozen {
      return Ok(false);
    }
    self.coordinator.clone().advance_to_latest(self)
  }

  /// Register a change-set notifier on a table (or one object in it)
  pub fn add_notification_callback(
    self: &Arc<Self>,
    table: TableKey,
    object: Option<ObjKey>,
    callback: NotificationCallback,
  ) -> Result<NotificationToken> {
    if self.frozen {
      return Err(TideError::LogicError(
        "frozen realms do not deliver notifications".into(),
      ));
    }
    self.coordinator.register_notifier(self, table, object, callback)
  }

  /// Called by the coordinator when new versions may be available
  fn notify(self: &Arc<Self>) {
    if self.is_closed() || self.frozen {
      return;
    }
    if let Some(context) = self.binding_context.lock().as_ref() {
      context.changes_available();
    }
    if self.auto_refresh.load(Ordering::Acquire) {
      let realm = self.clone();
      self.scheduler.invoke(Box::new(move || {
        let coordinator = realm.coordinator.clone();
        let _ = coordinator.advance_to_ready(&realm);
      }));
    }
  }

  /// Close this realm instance; further use fails with `LogicError`
  pub fn close(self: &Arc<Self>) {
    if self.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    let tx = self.tx.lock().take();
    drop(tx);
    self.coordinator.unregister_realm(self.id);
  }
}

impl Drop for Realm {
  fn drop(&mut self) {
    self.closed.store(true, Ordering::Release);
    // Unregistration happens via close() or coordinator GC of weak refs.
  }
}

// ============================================================================
// Schema cache
// ============================================================================

#[derive(Default)]
struct SchemaCache {
  schema: Option<Schema>,
  schema_version: u64,
  /// Commit-version interval over which the cached schema is valid
  min_tr: Version,
  max_tr: Version,
}

// ============================================================================
// Notifier shared state
// ============================================================================

#[derive(Default)]
struct NotifierSharedState {
  new_notifiers: Vec<Arc<CollectionNotifier>>,
  notifiers: Vec<Arc<CollectionNotifier>>,
  /// Version whose self-originated changes are being suppressed, plus
  /// a pin keeping it decodable
  skip: Option<(Version, Transaction)>,
  /// Version the shared notifier view has been advanced to
  notifier_version: Version,
  /// Version of the packaged handover, pinned against trimming
  handover_version: Option<Version>,
  handover_pin: Option<Transaction>,
}

// ============================================================================
// Coordinator
// ============================================================================

fn coordinators() -> &'static Mutex<HashMap<PathBuf, Weak<Coordinator>>> {
  static COORDINATORS: OnceLock<Mutex<HashMap<PathBuf, Weak<Coordinator>>>> = OnceLock::new();
  COORDINATORS.get_or_init(|| Mutex::new(HashMap::new()))
}

struct RealmEntry {
  realm: Weak<Realm>,
  realm_id: u64,
  scheduler: Arc<dyn Scheduler>,
  cached: bool,
}

/// Process-wide singleton per file path
pub struct Coordinator {
  path: PathBuf,
  db: Arc<Db>,
  base_config: Mutex<RealmConfig>,
  realms: Mutex<Vec<RealmEntry>>,
  schema_cache: Mutex<SchemaCache>,
  notifier_state: Mutex<NotifierSharedState>,
  /// Serializes notifier worker execution
  running_notifiers: Mutex<()>,
  worker: OnceLock<NotifierWorker>,
}

impl Coordinator {
  // ==========================================================================
  // Lookup and creation
  // ==========================================================================

  /// Fetch or create the coordinator for `path`
  pub fn get_coordinator(path: &Path, config: &RealmConfig) -> Result<Arc<Coordinator>> {
    let path = path.to_path_buf();
    let mut map = coordinators().lock();
    if let Some(existing) = map.get(&path).and_then(Weak::upgrade) {
      drop(map);
      existing.set_config(config)?;
      return Ok(existing);
    }

    let db = Self::open_db(&path, config)?;
    let coordinator = Arc::new_cyclic(|weak: &Weak<Coordinator>| {
      let hook_weak = weak.clone();
      db.set_commit_hook(Box::new(move |_version| {
        if let Some(c) = hook_weak.upgrade() {
          c.wake_up_notifier_worker();
        }
      }));
      Coordinator {
        path: path.clone(),
        db,
        base_config: Mutex::new(strip_instance_options(config)),
        realms: Mutex::new(Vec::new()),
        schema_cache: Mutex::new(SchemaCache::default()),
        notifier_state: Mutex::new(NotifierSharedState::default()),
        running_notifiers: Mutex::new(()),
        worker: OnceLock::new(),
      }
    });
    let _ = coordinator
      .worker
      .set(NotifierWorker::spawn(Arc::downgrade(&coordinator)));
    map.insert(path, Arc::downgrade(&coordinator));
    Ok(coordinator)
  }

  /// Coordinator for `path` if one is already alive
  pub fn get_existing_coordinator(path: &Path) -> Option<Arc<Coordinator>> {
    coordinators().lock().get(path).and_then(Weak::upgrade)
  }

  fn open_db(path: &Path, config: &RealmConfig) -> Result<Arc<Db>> {
    validate_config(config)?;
    let options = DbOptions {
      path: (!config.in_memory).then(|| path.to_path_buf()),
      in_memory: config.in_memory,
      read_only: config.immutable(),
      no_create: config.immutable(),
      is_shared: false,
      session_initiator: false,
      clear_file: false,
      encryption_key: config.encryption_key,
      skip_validate: false,
      sync_history: config.sync_history_enabled(),
    };

    // Opens can race with a concurrent writer extending the file; back
    // off briefly and retry a bounded number of times.
    let mut last_err = None;
    for _ in 0..OPEN_RETRY_LIMIT {
      match Db::open(options.clone()) {
        Ok(db) => return Ok(db),
        Err(e) if e.is_transient() => {
          last_err = Some(e);
          std::thread::sleep(std::time::Duration::from_millis(OPEN_RETRY_BACKOFF_MS));
        }
        Err(e) => return Err(e),
      }
    }
    Err(last_err.unwrap_or(TideError::Retry))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn db(&self) -> &Arc<Db> {
    &self.db
  }

  // ==========================================================================
  // Configuration compatibility
  // ==========================================================================

  fn set_config(&self, config: &RealmConfig) -> Result<()> {
    validate_config(config)?;
    let mut base = self.base_config.lock();
    let any_realm_alive = {
      let realms = self.realms.lock();
      realms.iter().any(|entry| entry.realm.strong_count() > 0)
    };
    if !any_realm_alive {
      *base = strip_instance_options(config);
      return Ok(());
    }

    if base.immutable() != config.immutable() {
      return Err(TideError::mismatched_config(
        &self.path,
        "already opened with different read permissions",
      ));
    }
    if base.in_memory != config.in_memory {
      return Err(TideError::mismatched_config(
        &self.path,
        "already opened with different inMemory settings",
      ));
    }
    if base.encryption_key != config.encryption_key {
      return Err(TideError::mismatched_config(
        &self.path,
        "already opened with a different encryption key",
      ));
    }
    if base.schema_mode != config.schema_mode {
      return Err(TideError::mismatched_config(
        &self.path,
        "already opened with a different schema mode",
      ));
    }
    {
      let cache = self.schema_cache.lock();
      if config.schema.is_some()
        && cache.schema_version != NOT_VERSIONED
        && config.schema_version.is_some()
        && cache.schema_version != config.effective_schema_version()
      {
        return Err(TideError::mismatched_config(
          &self.path,
          "already opened with a different schema version",
        ));
      }
    }
    match (&base.sync_config, &config.sync_config) {
      (None, None) => {}
      (Some(a), Some(b)) if a.matches(b) => {}
      _ => {
        return Err(TideError::mismatched_config(
          &self.path,
          "already opened with a different sync configuration",
        ));
      }
    }
    // Mixing cached and uncached realms is allowed.
    base.cache = config.cache;
    Ok(())
  }

  // ==========================================================================
  // Realm lifecycle
  // ==========================================================================

  /// Open (or fetch from cache) a realm for `config`. Passing a version
  /// yields a frozen realm pinned to that snapshot.
  pub fn get_realm(config: RealmConfig, version: Option<Version>) -> Result<Arc<Realm>> {
    let path = config
      .path
      .clone()
      .ok_or_else(|| TideError::LogicError("a realm configuration requires a path".into()))?;
    let coordinator = Self::get_coordinator(&path, &config)?;
    coordinator.do_get_realm(config, version)
  }

  fn do_get_realm(self: &Arc<Self>, config: RealmConfig, version: Option<Version>) -> Result<Arc<Realm>> {
    let scheduler = config
      .scheduler
      .clone()
      .unwrap_or_else(|| Arc::new(ImmediateScheduler));

    if version.is_none() {
      if let Some(cached) = self.get_cached_realm(&config, &scheduler)? {
        return Ok(cached);
      }
    }

    let frozen = version.is_some();
    let tx = match version {
      Some(v) => self.db.begin_frozen(v)?,
      None => self.db.begin_read(None)?,
    };

    let realm = Arc::new(Realm {
      id: NEXT_REALM_ID.fetch_add(1, Ordering::Relaxed),
      coordinator: self.clone(),
      config: config.clone(),
      scheduler: scheduler.clone(),
      frozen,
      auto_refresh: AtomicBool::new(true),
      closed: AtomicBool::new(false),
      tx: Mutex::new(Some(tx)),
      binding_context: Mutex::new(None),
    });

    if !frozen {
      self.apply_schema_on_open(&realm)?;
    }

    self.realms.lock().push(RealmEntry {
      realm: Arc::downgrade(&realm),
      realm_id: realm.id,
      scheduler,
      cached: config.cache && !frozen,
    });

    if let Some(predicate) = config.should_compact_on_launch.as_ref() {
      if !config.in_memory && !config.immutable() {
        let (total, used) = self.db.storage_footprint()?;
        if predicate(total, used) {
          // Compaction needs the realm's pin released; only attempt
          // when nothing else holds the file.
          let tx = realm.tx.lock().take();
          drop(tx);
          let compacted = self.db.compact();
          *realm.tx.lock() = Some(self.db.begin_read(None)?);
          if let Err(e) = compacted {
            debug!(error = %e, "compact-on-launch skipped");
          }
        }
      }
    }

    Ok(realm)
  }

  fn get_cached_realm(
    &self,
    config: &RealmConfig,
    scheduler: &Arc<dyn Scheduler>,
  ) -> Result<Option<Arc<Realm>>> {
    if !config.cache {
      return Ok(None);
    }
    let realms = self.realms.lock();
    for entry in realms.iter() {
      if !entry.cached || !Arc::ptr_eq(&entry.scheduler, scheduler) {
        continue;
      }
      if let Some(realm) = entry.realm.upgrade() {
        if realm.is_closed() {
          continue;
        }
        // A cached realm must agree exactly on the schema.
        if let Some(wanted) = &config.schema {
          let current = realm.read(|tx| tx.group().derive_schema())?;
          if !current.is_empty() && current != *wanted {
            return Err(TideError::mismatched_config(
              &self.path,
              "already opened on this scheduler with a different schema",
            ));
          }
        }
        return Ok(Some(realm));
      }
    }
    Ok(None)
  }

  /// Produce a frozen realm pinned at the source realm's version
  pub fn freeze(self: &Arc<Self>, source: &Arc<Realm>) -> Result<Arc<Realm>> {
    let version = source.read_version()?;
    let tx = {
      let guard = source.tx.lock();
      let tx = guard
        .as_ref()
        .ok_or_else(|| TideError::LogicError("realm is closed".into()))?;
      tx.freeze()?
    };
    let realm = Arc::new(Realm {
      id: NEXT_REALM_ID.fetch_add(1, Ordering::Relaxed),
      coordinator: self.clone(),
      config: source.config.clone(),
      scheduler: source.scheduler.clone(),
      frozen: true,
      auto_refresh: AtomicBool::new(false),
      closed: AtomicBool::new(false),
      tx: Mutex::new(Some(tx)),
      binding_context: Mutex::new(None),
    });
    debug_assert_eq!(realm.read_version()?, version);
    self.realms.lock().push(RealmEntry {
      realm: Arc::downgrade(&realm),
      realm_id: realm.id,
      scheduler: realm.scheduler.clone(),
      cached: false,
    });
    Ok(realm)
  }

  /// Remove a realm from the registry and kill its notifiers
  pub fn unregister_realm(&self, realm_id: u64) {
    self
      .realms
      .lock()
      .retain(|entry| entry.realm_id != realm_id);
    let state = self.notifier_state.lock();
    for n in state
      .notifiers
      .iter()
      .chain(state.new_notifiers.iter())
    {
      if n.is_for_realm(realm_id) {
        n.mark_dead();
      }
    }
  }

  /// Close every cached realm
  pub fn clear_cache(&self) {
    let realms: Vec<Arc<Realm>> = {
      let entries = self.realms.lock();
      entries
        .iter()
        .filter(|e| e.cached)
        .filter_map(|e| e.realm.upgrade())
        .collect()
    };
    for realm in realms {
      realm.close();
    }
  }

  /// Close every cached realm of every live coordinator
  pub fn clear_all_caches() {
    let all: Vec<Arc<Coordinator>> = coordinators()
      .lock()
      .values()
      .filter_map(Weak::upgrade)
      .collect();
    for c in all {
      c.clear_cache();
    }
  }

  // ==========================================================================
  // Schema cache
  // ==========================================================================

  pub fn get_schema_version(&self) -> u64 {
    self.schema_cache.lock().schema_version
  }

  /// Cached schema valid at `version`, if known
  pub fn get_cached_schema(&self, version: Version) -> Option<(Schema, u64)> {
    let cache = self.schema_cache.lock();
    let schema = cache.schema.as_ref()?;
    (cache.min_tr <= version && version <= cache.max_tr)
      .then(|| (schema.clone(), cache.schema_version))
  }

  /// Install a schema observed at commit version `tr`. Only overwrites
  /// with a non-empty schema at a later version.
  pub fn cache_schema(&self, new_schema: Schema, new_schema_version: u64, tr: Version) {
    let mut cache = self.schema_cache.lock();
    if new_schema.is_empty() || tr <= cache.max_tr {
      return;
    }
    cache.schema = Some(new_schema);
    cache.schema_version = new_schema_version;
    cache.min_tr = tr;
    cache.max_tr = tr;
  }

  /// Widen the validity interval: the schema did not change over
  /// `(previous, next]`.
  pub fn advance_schema_cache(&self, previous: Version, next: Version) {
    let mut cache = self.schema_cache.lock();
    if cache.schema.is_none() {
      return;
    }
    // Intervals that don't touch the cached one can't extend it.
    if previous > cache.max_tr || next < cache.min_tr {
      return;
    }
    cache.min_tr = cache.min_tr.min(previous.max(1));
    cache.max_tr = cache.max_tr.max(next);
  }

  pub fn clear_schema_cache_and_set_schema_version(&self, new_version: u64) {
    let mut cache = self.schema_cache.lock();
    cache.schema = None;
    cache.schema_version = new_version;
    cache.min_tr = 0;
    cache.max_tr = 0;
  }

  /// Create missing tables and columns for the configured schema, run
  /// initializers/migrations, and seed the schema cache.
  fn apply_schema_on_open(self: &Arc<Self>, realm: &Arc<Realm>) -> Result<()> {
    let Some(wanted) = realm.config.schema.clone() else {
      // Schemaless open still seeds the cache from the file.
      let (version, schema, stored_version) = realm.read(|tx| {
        (
          tx.version(),
          tx.group().derive_schema(),
          tx.group().schema_version,
        )
      })?;
      self.cache_schema(schema, stored_version, version);
      return Ok(());
    };

    let mode = realm.config.schema_mode;
    let target_version = realm.config.effective_schema_version();
    let (current, stored_version) =
      realm.read(|tx| (tx.group().derive_schema(), tx.group().schema_version))?;

    if mode == SchemaMode::Immutable || mode == SchemaMode::ReadOnly {
      if !current.is_empty() && current != wanted {
        return Err(TideError::MismatchedSchema(format!(
          "realm at '{}' was opened read-only with a different schema",
          self.path.display()
        )));
      }
      return Ok(());
    }

    let fresh = current.is_empty();
    let needs_migration =
      !fresh && stored_version != NOT_VERSIONED && stored_version != target_version;
    if current == wanted && !needs_migration {
      let version = realm.read_version()?;
      self.cache_schema(wanted, target_version, version);
      return Ok(());
    }

    self.promote_to_write(realm)?;
    let result: Result<()> = realm.with_transaction(|tx| {
      apply_schema_additively(tx, &wanted)?;
      if needs_migration {
        if let Some(migration) = realm.config.migration_function.clone() {
          migration(tx, &wanted)?;
        }
      }
      tx.group_mut().schema_version = target_version;
      if fresh {
        if let Some(init) = realm.config.initialization_function.clone() {
          init(tx)?;
        }
      }
      Ok(())
    })?;
    if let Err(e) = result {
      let _ = realm.cancel_transaction();
      return Err(e);
    }
    let version = self.clone().commit_write(realm, true)?;
    self.cache_schema(wanted, target_version, version);
    Ok(())
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  /// Upgrade the realm's read transaction to a write transaction
  pub fn promote_to_write(self: &Arc<Self>, realm: &Realm) -> Result<()> {
    if realm.frozen {
      return Err(TideError::LogicError(
        "can't begin a write transaction on a frozen realm".into(),
      ));
    }
    // Bring the notifiers up to date first so that a skip version set
    // by the coming commit is exactly one commit ahead of them.
    {
      let _running = self.running_notifiers.lock();
      self.run_async_notifiers();
    }
    let write_tx = self.db.begin_write()?;
    let mut guard = realm.tx.lock();
    if guard.is_none() {
      drop(write_tx);
      return Err(TideError::LogicError("realm is closed".into()));
    }
    *guard = Some(write_tx);
    Ok(())
  }

  /// Commit a realm's write transaction, arranging for the committing
  /// realm's own notifiers to skip this version.
  pub fn commit_write(self: Arc<Self>, realm: &Arc<Realm>, to_disk: bool) -> Result<Version> {
    if realm.config.immutable() {
      return Err(TideError::LogicError(
        "can't commit on an immutable realm".into(),
      ));
    }
    let new_version;
    {
      let mut tx_guard = realm.tx.lock();
      let tx = tx_guard
        .as_mut()
        .ok_or_else(|| TideError::LogicError("realm is closed".into()))?;
      if !tx.is_writing() {
        return Err(TideError::LogicError("not in a write transaction".into()));
      }

      // The notifier mutex must be held across the commit: otherwise a
      // concurrent worker pass could observe the new version before the
      // skip version is set and deliver a self-notification.
      let mut state = self.notifier_state.lock();
      new_version = tx.commit_and_continue_as_read(to_disk)?;

      let have_notifiers = state
        .notifiers
        .iter()
        .any(|n| n.is_for_realm(realm.id) && n.have_callbacks());
      if have_notifiers {
        debug_assert!(state.skip.is_none());
        let pin = tx.duplicate()?;
        for n in &state.notifiers {
          if n.is_for_realm(realm.id) && n.have_callbacks() {
            n.set_skip_version(new_version);
          }
        }
        state.skip = Some((new_version, pin));
      }
    }

    // did_change may close the realm; nothing else is touched after.
    let context = realm.binding_context.lock();
    if let Some(context) = context.as_ref() {
      context.did_change();
    }
    Ok(new_version)
  }

  pub fn compact(&self) -> Result<bool> {
    self.db.compact()
  }

  pub fn write_copy(&self, path: &Path, key: Option<[u8; 64]>) -> Result<()> {
    self.db.write_copy(path, key)
  }

  // ==========================================================================
  // Notifiers
  // ==========================================================================

  /// Register a notifier; it starts in the staging list and is picked
  /// up by the worker on its next pass.
  pub fn register_notifier(
    self: &Arc<Self>,
    realm: &Arc<Realm>,
    table: TableKey,
    object: Option<ObjKey>,
    callback: NotificationCallback,
  ) -> Result<NotificationToken> {
    let version = realm.read_version()?;
    let notifier = CollectionNotifier::new(realm.id, table, object, version);
    notifier.add_callback(callback);
    {
      let mut state = self.notifier_state.lock();
      state.new_notifiers.push(notifier.clone());
    }
    self.wake_up_notifier_worker();
    Ok(NotificationToken::new(notifier))
  }

  pub fn wake_up_notifier_worker(&self) {
    if let Some(worker) = self.worker.get() {
      worker.wake();
    }
  }

  /// Worker entry point: run the notifiers, then poke every realm
  pub(crate) fn on_change(self: &Arc<Self>) {
    {
      let _running = self.running_notifiers.lock();
      self.run_async_notifiers();
    }
    let realms: Vec<Arc<Realm>> = {
      let entries = self.realms.lock();
      entries.iter().filter_map(|e| e.realm.upgrade()).collect()
    };
    for realm in realms {
      realm.notify();
    }
  }

  fn clean_up_dead_notifiers(state: &mut NotifierSharedState) {
    state.notifiers.retain(|n| n.is_alive());
    state.new_notifiers.retain(|n| n.is_alive());
    if state.notifiers.is_empty() && state.new_notifiers.is_empty() {
      state.notifier_version = 0;
      state.handover_version = None;
      state.handover_pin = None;
      state.skip = None;
    }
  }

  /// Re-run registered notifiers against the newest snapshot. The
  /// caller holds the running-notifiers guard.
  fn run_async_notifiers(&self) {
    let mut state = self.notifier_state.lock();
    Self::clean_up_dead_notifiers(&mut state);

    if state.notifiers.is_empty() && state.new_notifiers.is_empty() {
      return;
    }

    let latest = self.db.latest_version();
    if state.notifier_version == 0 {
      debug_assert!(state.notifiers.is_empty());
      state.notifier_version = latest;
    }
    let notifier_version = state.notifier_version;
    let skip = state.skip.take();

    // Existing notifiers only re-run when the version moved; running
    // them on a spurious wakeup could race a concurrent skip request.
    let run_existing = latest != notifier_version && !state.notifiers.is_empty();
    if !run_existing && state.new_notifiers.is_empty() {
      debug_assert!(skip.is_none());
      return;
    }

    let new: Vec<Arc<CollectionNotifier>> = state.new_notifiers.drain(..).collect();
    let pre_existing: Vec<Arc<CollectionNotifier>> = state.notifiers.clone();
    state.notifiers.extend(new.iter().cloned());
    drop(state);

    // Advance the new notifiers from their registration versions.
    for n in &new {
      let from = n.version();
      if from < latest {
        let summary = self.db.history_summary(from, latest);
        n.run(&summary, latest);
      }
    }

    // If a skip version is set and more versions follow it, process the
    // skip version first in isolation so suppressed observers see an
    // empty change set for it without missing later changes.
    let mut from = notifier_version;
    if let Some((skip_version, _pin)) = &skip {
      if run_existing && *skip_version < latest {
        let summary = self.db.history_summary(from, *skip_version);
        for n in &pre_existing {
          n.run(&summary, *skip_version);
        }
        let mut state = self.notifier_state.lock();
        for n in &pre_existing {
          n.prepare_handover(*skip_version);
        }
        state.notifier_version = *skip_version;
        drop(state);
        from = *skip_version;
      }
    }

    if run_existing {
      let summary = self.db.history_summary(from, latest);
      for n in &pre_existing {
        n.run(&summary, latest);
      }
    }

    // Multiple observers of the same collection share one change-set
    // computation: the per-commit summaries are parsed once and each
    // duplicate slices the same data, so no copy pass is needed here.

    let mut state = self.notifier_state.lock();
    for n in new.iter().chain(pre_existing.iter()) {
      n.prepare_handover(latest);
    }
    state.notifier_version = latest;
    state.handover_version = Some(latest);
    // Pin the handover version so advancing realms can still decode it.
    state.handover_pin = self.db.begin_read(Some(latest)).ok();
    Self::clean_up_dead_notifiers(&mut state);
    drop(skip);
  }

  fn notifiers_for_realm(&self, realm_id: u64) -> Vec<Arc<CollectionNotifier>> {
    let state = self.notifier_state.lock();
    state
      .new_notifiers
      .iter()
      .chain(state.notifiers.iter())
      .filter(|n| n.is_for_realm(realm_id))
      .cloned()
      .collect()
  }

  // ==========================================================================
  // Delivery
  // ==========================================================================

  /// Deliver ready notifications: if every notifier of this realm has
  /// run and the handover is not older than the realm, advance exactly
  /// to the handover version and deliver. Otherwise do nothing.
  pub fn advance_to_ready(self: &Arc<Self>, realm: &Arc<Realm>) -> Result<()> {
    // A realm that is mid-write (or delivering on another thread) is
    // left alone; the next notify will try again.
    let Some(mut tx_guard) = realm.tx.try_lock() else {
      return Ok(());
    };
    let Some(tx) = tx_guard.as_mut() else {
      return Ok(());
    };
    if tx.is_writing() || realm.frozen {
      return Ok(());
    }
    let current = tx.version();

    let mut deliveries: Vec<(Arc<CollectionNotifier>, Version, CollectionChangeSet)> = Vec::new();
    let handover_version = {
      let state = self.notifier_state.lock();
      for n in &state.new_notifiers {
        if n.is_for_realm(realm.id) {
          // Not yet run; not ready.
          return Ok(());
        }
      }
      for n in &state.notifiers {
        if !n.is_for_realm(realm.id) || !n.is_alive() {
          continue;
        }
        if !n.has_run() {
          return Ok(());
        }
        if let Some((version, changes)) = n.package_for_delivery() {
          deliveries.push((n.clone(), version, changes));
        }
      }
      state.handover_version
    };

    if deliveries.is_empty() {
      // No notifiers for this realm: just advance to latest.
      tx.refresh()?;
      return Ok(());
    }
    let Some(handover_version) = handover_version else {
      return Ok(());
    };
    if deliveries.iter().any(|(_, v, _)| *v != handover_version) {
      // A notifier is still mid-processing; the next pass will deliver.
      return Ok(());
    }
    if handover_version < current {
      // The most recent write came from this realm instance; there is
      // nothing to advance to.
      return Ok(());
    }
    if handover_version > current {
      tx.advance_to(handover_version)?;
    }
    drop(tx_guard);

    // Deliver without holding the transaction: callbacks may close the
    // realm or start new work.
    let context_guard = realm.binding_context.lock();
    if let Some(context) = context_guard.as_ref() {
      context.will_send_notifications();
    }
    drop(context_guard);
    if realm.is_closed() {
      return Ok(());
    }
    for (notifier, _, changes) in deliveries {
      notifier.deliver(&changes);
    }
    if realm.is_closed() {
      return Ok(());
    }
    let context_guard = realm.binding_context.lock();
    if let Some(context) = context_guard.as_ref() {
      context.did_send_notifications();
    }
    Ok(())
  }

  /// Advance the realm to (at least) the latest version, blocking until
  /// the worker has processed it for every notifier with callbacks.
  /// Returns whether the version changed.
  pub fn advance_to_latest(self: Arc<Self>, realm: &Arc<Realm>) -> Result<bool> {
    let target = self.db.latest_version();
    let mut notifiers = self.notifiers_for_realm(realm.id);
    let handover = self.package_notifiers(&mut notifiers, target);

    let prev;
    let reached;
    {
      let mut tx_guard = realm.tx.lock();
      let tx = tx_guard
        .as_mut()
        .ok_or_else(|| TideError::LogicError("realm is closed".into()))?;
      if tx.is_writing() {
        return Err(TideError::LogicError(
          "can't advance within a write transaction".into(),
        ));
      }
      prev = tx.version();
      let next = handover.unwrap_or(target).max(target);
      if next > prev {
        tx.advance_to(next)?;
      }
      reached = tx.version();
    }

    for n in &notifiers {
      if let Some((version, changes)) = n.package_for_delivery() {
        if version == reached {
          n.deliver(&changes);
        }
      }
    }
    Ok(!realm.is_closed() && prev != reached)
  }

  /// Block until the worker has processed `target_version` for every
  /// notifier with callbacks. Notifiers without callbacks never block
  /// the caller; they are dropped from the list instead.
  fn package_notifiers(
    &self,
    notifiers: &mut Vec<Arc<CollectionNotifier>>,
    target_version: Version,
  ) -> Option<Version> {
    let ready = || {
      let state = self.notifier_state.lock();
      let up_to_date = state.handover_version.is_some_and(|v| v >= target_version);
      notifiers
        .iter()
        .all(|n| !n.have_callbacks() || (n.has_run() && up_to_date))
    };

    if !ready() {
      let _running = self.running_notifiers.lock();
      // The worker may have run what we need while we waited for the
      // guard, so re-check before running inline.
      if !ready() {
        self.run_async_notifiers();
      }
    }

    let state = self.notifier_state.lock();
    let handover = state.handover_version;
    if !handover.is_some_and(|v| v >= target_version) {
      // Still out of date: none of them have callbacks, so don't block.
      notifiers.clear();
      return None;
    }
    notifiers.retain(|n| n.has_run() && n.package_for_delivery().is_some());
    handover
  }
}

impl Drop for Coordinator {
  fn drop(&mut self) {
    // Only clear the slot if it still refers to this (dead) instance;
    // a newer coordinator may have taken the path over already.
    let mut map = coordinators().lock();
    if let Some(entry) = map.get(&self.path) {
      if entry.strong_count() == 0 {
        map.remove(&self.path);
      }
    }
  }
}

// ============================================================================
// Config validation helpers
// ============================================================================

/// Options that are per-handle rather than per-file
fn strip_instance_options(config: &RealmConfig) -> RealmConfig {
  let mut base = config.clone();
  base.scheduler = None;
  base
}

fn validate_config(config: &RealmConfig) -> Result<()> {
  if let Some(key) = &config.encryption_key {
    debug_assert_eq!(key.len(), 64);
  }
  let illegal = |reason: &str| -> Result<()> {
    Err(TideError::LogicError(format!(
      "illegal configuration: {reason}"
    )))
  };
  if config.schema_mode == SchemaMode::Immutable && config.sync_config.is_some() {
    return illegal("synchronized realms cannot be opened in immutable mode");
  }
  if matches!(
    config.schema_mode,
    SchemaMode::AdditiveDiscovered | SchemaMode::AdditiveExplicit
  ) && config.migration_function.is_some()
  {
    return illegal("additive-only schema modes do not use a migration function");
  }
  if matches!(config.schema_mode, SchemaMode::Immutable | SchemaMode::ReadOnly) {
    if config.migration_function.is_some() {
      return illegal("read-only realms do not use a migration function");
    }
    if config.initialization_function.is_some() {
      return illegal("read-only realms do not use an initialization function");
    }
  }
  if config.schema.is_some() && config.schema_version.is_none() {
    return illegal("a schema version must be specified when the schema is specified");
  }
  if config.in_memory && config.encryption_key.is_some() {
    return illegal("encryption is not supported for in-memory realms");
  }
  Ok(())
}

/// Create the tables and columns of `schema` that are missing; fail on
/// incompatible existing declarations.
fn apply_schema_additively(tx: &mut Transaction, schema: &Schema) -> Result<()> {
  use crate::types::DataType;

  // Tables first so link targets resolve regardless of declaration order.
  for object in &schema.objects {
    if tx.group().table_by_name(&object.name).is_some() {
      continue;
    }
    match (&object.primary_key, object.embedded) {
      (Some(pk_name), false) => {
        let pk = object.property(pk_name).ok_or_else(|| {
          TideError::MismatchedSchema(format!(
            "class '{}' names a missing primary key property '{pk_name}'",
            object.name
          ))
        })?;
        tx.add_table_with_primary_key(&object.name, pk.data_type, pk_name, pk.nullable)?;
      }
      (None, false) => {
        tx.add_table(&object.name)?;
      }
      (None, true) => {
        tx.add_embedded_table(&object.name)?;
      }
      (Some(_), true) => {
        return Err(TideError::MismatchedSchema(format!(
          "embedded class '{}' cannot have a primary key",
          object.name
        )));
      }
    }
  }

  for object in &schema.objects {
    let table_key = tx.group().key_of(&object.name).expect("created above");
    for property in &object.properties {
      if object.primary_key.as_deref() == Some(property.name.as_str()) {
        continue;
      }
      if let Some(existing) = tx
        .group()
        .table(table_key)
        .and_then(|t| t.column_by_name(&property.name))
      {
        if existing.data_type != property.data_type
          || existing.collection != property.collection
          || existing.nullable != property.nullable
          || existing.target != property.target
        {
          return Err(TideError::MismatchedSchema(format!(
            "property '{}.{}' already exists with a different type",
            object.name, property.name
          )));
        }
        continue;
      }
      if property.data_type == DataType::Link && property.target.is_none() {
        return Err(TideError::MismatchedSchema(format!(
          "link property '{}.{}' has no target class",
          object.name, property.name
        )));
      }
      let col = tx.add_column(
        table_key,
        &property.name,
        property.data_type,
        property.nullable,
        property.collection,
        property.target.as_deref(),
      )?;
      if property.indexed {
        if let Some(table) = tx.group_mut().table_mut(table_key) {
          table.set_indexed(col, true);
        }
      }
    }
  }
  Ok(())
}
