//! Collection notifiers
//!
//! A notifier observes one table (or one object within it) on behalf of
//! a realm instance. The background worker computes each notifier's
//! change set when new commits arrive and packages it for handover; the
//! realm's thread later advances and delivers the packaged changes to
//! the registered callbacks.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::history::ChangeSummary;
use crate::types::{ColKey, ObjKey, TableKey, Version};

static NEXT_NOTIFIER_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Change sets
// ============================================================================

/// Object-level changes delivered to one notifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionChangeSet {
  pub insertions: BTreeSet<ObjKey>,
  pub deletions: BTreeSet<ObjKey>,
  pub modifications: BTreeSet<(ObjKey, ColKey)>,
  pub schema_changed: bool,
}

impl CollectionChangeSet {
  pub fn is_empty(&self) -> bool {
    !self.schema_changed
      && self.insertions.is_empty()
      && self.deletions.is_empty()
      && self.modifications.is_empty()
  }

  /// Slice a commit summary down to what one notifier observes
  pub fn from_summary(summary: &ChangeSummary, table: TableKey, object: Option<ObjKey>) -> Self {
    let mut out = CollectionChangeSet {
      schema_changed: summary.schema_changed,
      ..Self::default()
    };
    if let Some(changes) = summary.tables.get(&table) {
      match object {
        None => {
          out.insertions = changes.insertions.clone();
          out.deletions = changes.deletions.clone();
          out.modifications = changes.modifications.clone();
        }
        Some(obj) => {
          if changes.deletions.contains(&obj) {
            out.deletions.insert(obj);
          }
          for m in &changes.modifications {
            if m.0 == obj {
              out.modifications.insert(*m);
            }
          }
        }
      }
    }
    out
  }

  /// Fold a later change set into this one
  pub fn merge(&mut self, later: &CollectionChangeSet) {
    self.schema_changed |= later.schema_changed;
    for obj in &later.deletions {
      if self.insertions.remove(obj) {
        self.modifications.retain(|(o, _)| o != obj);
        continue;
      }
      self.modifications.retain(|(o, _)| o != obj);
      self.deletions.insert(*obj);
    }
    self.insertions.extend(later.insertions.iter().copied());
    for m in &later.modifications {
      if !self.insertions.contains(&m.0) {
        self.modifications.insert(*m);
      }
    }
  }
}

// ============================================================================
// Notifier
// ============================================================================

/// Registration lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierState {
  NotYetRun,
  HasRun,
  Delivered,
  Dead,
}

pub type NotificationCallback = Box<dyn FnMut(&CollectionChangeSet) + Send>;

struct NotifierInner {
  state: NotifierState,
  /// Version this notifier has been computed up to
  version: Version,
  /// Changes accumulated by the worker since the last handover
  pending: CollectionChangeSet,
  /// Packaged `(version, changes)` ready for delivery
  handover: Option<(Version, CollectionChangeSet)>,
  /// Deliveries for exactly this version report no changes
  skip_version: Option<Version>,
  callbacks: Vec<NotificationCallback>,
}

/// One observer registration
pub struct CollectionNotifier {
  id: u64,
  realm_id: u64,
  table: TableKey,
  object: Option<ObjKey>,
  alive: AtomicBool,
  inner: Mutex<NotifierInner>,
}

impl CollectionNotifier {
  pub fn new(
    realm_id: u64,
    table: TableKey,
    object: Option<ObjKey>,
    registration_version: Version,
  ) -> Arc<Self> {
    Arc::new(Self {
      id: NEXT_NOTIFIER_ID.fetch_add(1, Ordering::Relaxed),
      realm_id,
      table,
      object,
      alive: AtomicBool::new(true),
      inner: Mutex::new(NotifierInner {
        state: NotifierState::NotYetRun,
        version: registration_version,
        pending: CollectionChangeSet::default(),
        handover: None,
        skip_version: None,
        callbacks: Vec::new(),
      }),
    })
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn table(&self) -> TableKey {
    self.table
  }

  pub fn object(&self) -> Option<ObjKey> {
    self.object
  }

  /// Identity of the observed collection (duplicate-merge key)
  pub fn observed(&self) -> (TableKey, Option<ObjKey>) {
    (self.table, self.object)
  }

  pub fn is_for_realm(&self, realm_id: u64) -> bool {
    self.realm_id == realm_id
  }

  pub fn is_alive(&self) -> bool {
    self.alive.load(Ordering::Acquire)
  }

  pub fn mark_dead(&self) {
    self.alive.store(false, Ordering::Release);
    let mut inner = self.inner.lock();
    inner.state = NotifierState::Dead;
    inner.callbacks.clear();
    inner.pending = CollectionChangeSet::default();
    inner.handover = None;
  }

  pub fn add_callback(&self, callback: NotificationCallback) {
    self.inner.lock().callbacks.push(callback);
  }

  pub fn have_callbacks(&self) -> bool {
    !self.inner.lock().callbacks.is_empty()
  }

  pub fn state(&self) -> NotifierState {
    self.inner.lock().state
  }

  pub fn version(&self) -> Version {
    self.inner.lock().version
  }

  pub fn has_run(&self) -> bool {
    matches!(
      self.inner.lock().state,
      NotifierState::HasRun | NotifierState::Delivered
    )
  }

  /// Suppress delivery of changes attributable to `version`
  pub fn set_skip_version(&self, version: Version) {
    self.inner.lock().skip_version = Some(version);
  }

  /// Worker: fold in the changes of `(current, to]` and advance
  pub fn run(&self, summary: &ChangeSummary, to: Version) {
    if !self.is_alive() {
      return;
    }
    let mut inner = self.inner.lock();
    if to <= inner.version {
      return;
    }
    let changes = CollectionChangeSet::from_summary(summary, self.table, self.object);
    inner.pending.merge(&changes);
    inner.version = to;
  }

  /// Worker (under the notifier mutex): package accumulated changes
  /// for delivery at `version`.
  pub fn prepare_handover(&self, version: Version) {
    if !self.is_alive() {
      return;
    }
    let mut inner = self.inner.lock();
    if inner.version < version {
      inner.version = version;
    }
    let changes = std::mem::take(&mut inner.pending);
    let changes = if inner.skip_version == Some(version) {
      // The observer's own commit; it asked not to hear about it.
      inner.skip_version = None;
      CollectionChangeSet::default()
    } else {
      changes
    };
    inner.handover = Some((version, changes));
    if inner.state == NotifierState::NotYetRun {
      inner.state = NotifierState::HasRun;
    }
  }

  /// Version of the packaged handover, if any
  pub fn handover_version(&self) -> Option<Version> {
    self.inner.lock().handover.as_ref().map(|(v, _)| *v)
  }

  /// Take the packaged changes for delivery; `None` if nothing is ready
  pub fn package_for_delivery(&self) -> Option<(Version, CollectionChangeSet)> {
    if !self.is_alive() {
      return None;
    }
    self.inner.lock().handover.clone()
  }

  /// Deliver `changes` to every callback and mark the registration
  pub fn deliver(&self, changes: &CollectionChangeSet) {
    let mut inner = self.inner.lock();
    if inner.state == NotifierState::Dead {
      return;
    }
    for cb in inner.callbacks.iter_mut() {
      cb(changes);
    }
    inner.state = NotifierState::Delivered;
  }
}

/// Unregisters its notifier when dropped
pub struct NotificationToken {
  notifier: Arc<CollectionNotifier>,
}

impl NotificationToken {
  pub fn new(notifier: Arc<CollectionNotifier>) -> Self {
    Self { notifier }
  }

  pub fn notifier(&self) -> &Arc<CollectionNotifier> {
    &self.notifier
  }
}

impl Drop for NotificationToken {
  fn drop(&mut self) {
    self.notifier.mark_dead();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn skip_version_packages_an_empty_change_set() {
    let notifier = CollectionNotifier::new(1, TableKey(1), None, 1);
    let mut summary = ChangeSummary::default();
    summary.record_insert(TableKey(1), ObjKey(5));
    notifier.set_skip_version(2);
    notifier.run(&summary, 2);
    notifier.prepare_handover(2);
    let (version, changes) = notifier.package_for_delivery().unwrap();
    assert_eq!(version, 2);
    assert!(changes.is_empty());

    // A later commit is delivered normally.
    notifier.run(&summary, 3);
    notifier.prepare_handover(3);
    let (version, changes) = notifier.package_for_delivery().unwrap();
    assert_eq!(version, 3);
    assert!(changes.insertions.contains(&ObjKey(5)));
  }

  #[test]
  fn object_scoped_notifier_filters_changes() {
    let notifier = CollectionNotifier::new(1, TableKey(1), Some(ObjKey(1)), 1);
    let mut summary = ChangeSummary::default();
    summary.record_modify(TableKey(1), ObjKey(1), ColKey(2));
    summary.record_modify(TableKey(1), ObjKey(9), ColKey(2));
    notifier.run(&summary, 2);
    notifier.prepare_handover(2);
    let (_, changes) = notifier.package_for_delivery().unwrap();
    assert_eq!(changes.modifications.len(), 1);
    assert!(changes.modifications.contains(&(ObjKey(1), ColKey(2))));
  }

  #[test]
  fn dead_notifier_stops_reporting() {
    let notifier = CollectionNotifier::new(1, TableKey(1), None, 1);
    let token = NotificationToken::new(notifier.clone());
    assert!(notifier.is_alive());
    drop(token);
    assert!(!notifier.is_alive());
    assert_eq!(notifier.state(), NotifierState::Dead);
    assert!(notifier.package_for_delivery().is_none());
  }
}
