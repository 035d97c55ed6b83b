//! Per-commit history
//!
//! Every commit appends one entry holding the object-level change
//! summary (consumed by the notifier machinery when advancing readers)
//! and, for sync-enabled realms, the serialized instruction changeset
//! (consumed by upload and by client-reset recovery).

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::types::{ColKey, ObjKey, Ref, TableKey, Version};

// ============================================================================
// Change summaries
// ============================================================================

/// Object-level changes of one table in one commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectChanges {
  pub insertions: BTreeSet<ObjKey>,
  pub deletions: BTreeSet<ObjKey>,
  pub modifications: BTreeSet<(ObjKey, ColKey)>,
}

impl ObjectChanges {
  pub fn is_empty(&self) -> bool {
    self.insertions.is_empty() && self.deletions.is_empty() && self.modifications.is_empty()
  }
}

/// Object-level changes of one commit, keyed by table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSummary {
  pub tables: BTreeMap<TableKey, ObjectChanges>,
  pub schema_changed: bool,
}

impl ChangeSummary {
  pub fn is_empty(&self) -> bool {
    !self.schema_changed && self.tables.values().all(ObjectChanges::is_empty)
  }

  pub fn record_insert(&mut self, table: TableKey, obj: ObjKey) {
    self.tables.entry(table).or_default().insertions.insert(obj);
  }

  pub fn record_delete(&mut self, table: TableKey, obj: ObjKey) {
    let changes = self.tables.entry(table).or_default();
    // An object created and deleted in the same commit nets out.
    if changes.insertions.remove(&obj) {
      changes.modifications.retain(|(o, _)| *o != obj);
      return;
    }
    changes.modifications.retain(|(o, _)| *o != obj);
    changes.deletions.insert(obj);
  }

  pub fn record_modify(&mut self, table: TableKey, obj: ObjKey, col: ColKey) {
    self
      .tables
      .entry(table)
      .or_default()
      .modifications
      .insert((obj, col));
  }

  pub fn record_schema_change(&mut self) {
    self.schema_changed = true;
  }

  /// Fold a later commit's changes into this one
  pub fn merge(&mut self, later: &ChangeSummary) {
    self.schema_changed |= later.schema_changed;
    for (table, changes) in &later.tables {
      let into = self.tables.entry(*table).or_default();
      for obj in &changes.deletions {
        if into.insertions.remove(obj) {
          into.modifications.retain(|(o, _)| o != obj);
          continue;
        }
        into.modifications.retain(|(o, _)| o != obj);
        into.deletions.insert(*obj);
      }
      into.insertions.extend(changes.insertions.iter().copied());
      for m in &changes.modifications {
        if !into.insertions.contains(&m.0) {
          into.modifications.insert(*m);
        }
      }
    }
  }
}

// ============================================================================
// History log
// ============================================================================

/// One committed version
#[derive(Debug, Clone)]
pub struct HistoryEntry {
  pub version: Version,
  pub summary: Arc<ChangeSummary>,
  /// Serialized sync changeset; present on sync-enabled realms
  pub changeset: Option<Arc<Vec<u8>>>,
  pub top_ref: Ref,
  pub file_size: u64,
}

/// In-process per-commit changeset store
#[derive(Debug, Default)]
pub struct HistoryLog {
  entries: VecDeque<HistoryEntry>,
}

impl HistoryLog {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn append(&mut self, entry: HistoryEntry) {
    debug_assert!(self
      .entries
      .back()
      .is_none_or(|last| last.version < entry.version));
    self.entries.push_back(entry);
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Accumulated object-level changes over `(from, to]`
  pub fn summarize(&self, from: Version, to: Version) -> ChangeSummary {
    let mut out = ChangeSummary::default();
    for entry in &self.entries {
      if entry.version > from && entry.version <= to {
        out.merge(&entry.summary);
      }
    }
    out
  }

  /// Serialized changesets of all commits after `from`, in commit order
  pub fn changesets_after(&self, from: Version) -> Vec<(Version, Arc<Vec<u8>>)> {
    self
      .entries
      .iter()
      .filter(|e| e.version > from)
      .filter_map(|e| e.changeset.clone().map(|c| (e.version, c)))
      .collect()
  }

  pub fn entry(&self, version: Version) -> Option<&HistoryEntry> {
    self.entries.iter().find(|e| e.version == version)
  }

  /// Drop entries older than `oldest_pinned`. The coordinator refuses
  /// to call this with a version below the oldest frozen pin.
  pub fn trim_below(&mut self, oldest_pinned: Version) {
    while self
      .entries
      .front()
      .is_some_and(|e| e.version < oldest_pinned)
    {
      self.entries.pop_front();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(version: Version, summary: ChangeSummary) -> HistoryEntry {
    HistoryEntry {
      version,
      summary: Arc::new(summary),
      changeset: None,
      top_ref: 0,
      file_size: 0,
    }
  }

  #[test]
  fn summarize_covers_half_open_range() {
    let mut log = HistoryLog::new();
    for v in 2..=5 {
      let mut s = ChangeSummary::default();
      s.record_insert(TableKey(1), ObjKey(v));
      log.append(entry(v, s));
    }
    let summary = log.summarize(2, 4);
    let changes = summary.tables.get(&TableKey(1)).unwrap();
    assert_eq!(changes.insertions.len(), 2);
    assert!(changes.insertions.contains(&ObjKey(3)));
    assert!(changes.insertions.contains(&ObjKey(4)));
  }

  #[test]
  fn insert_then_delete_nets_out_on_merge() {
    let mut first = ChangeSummary::default();
    first.record_insert(TableKey(1), ObjKey(9));
    let mut second = ChangeSummary::default();
    second.record_delete(TableKey(1), ObjKey(9));
    first.merge(&second);
    assert!(first.is_empty());
  }

  #[test]
  fn trim_respects_pins() {
    let mut log = HistoryLog::new();
    for v in 1..=6 {
      log.append(entry(v, ChangeSummary::default()));
    }
    log.trim_below(4);
    assert_eq!(log.len(), 3);
    assert!(log.entry(3).is_none());
    assert!(log.entry(4).is_some());
  }
}
