//! Client-reset recovery
//!
//! Replays the local offline changesets against the freshly transferred
//! server state. List operations are translated index-by-index through
//! a per-list tracker: an operation on an index the recovery did not
//! itself create cannot be translated safely, so the whole list is
//! queued for a verbatim copy from the frozen pre-reset snapshot.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::db::group::Field;
use crate::db::transaction::Transaction;
use crate::error::{Result, TideError};
use crate::sync::applier::InstructionApplier;
use crate::sync::client_reset::{convert_value, EmbeddedTracker};
use crate::sync::instruction::{
  Changeset, Instruction, PathElement, PathInstruction, Payload, PrimaryKey,
};
use crate::types::{CollectionKind, ColKey, ObjKey, TableKey, Value, Version};

// ============================================================================
// List paths
// ============================================================================

/// Canonical identifier for one list nested anywhere in the graph
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListPath {
  pub table: String,
  pub object: PrimaryKey,
  pub field: String,
  pub path: Vec<ListPathElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListPathElement {
  Index(u32),
  Key(String),
  Field(String),
}

impl ListPath {
  /// The list a path-carrying instruction addresses: the instruction's
  /// path minus any trailing index element.
  pub fn from_instruction_path(path: &PathInstruction) -> Self {
    let mut elements: Vec<ListPathElement> = path
      .path
      .iter()
      .map(|e| match e {
        PathElement::Index(i) => ListPathElement::Index(*i),
        PathElement::Key(k) => ListPathElement::Key(k.clone()),
        PathElement::Field(f) => ListPathElement::Field(f.clone()),
      })
      .collect();
    if matches!(elements.last(), Some(ListPathElement::Index(_))) {
      elements.pop();
    }
    Self {
      table: path.table.clone(),
      object: path.object.clone(),
      field: path.field.clone(),
      path: elements,
    }
  }
}

impl std::fmt::Display for ListPath {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}[{}].{}", self.table, self.object, self.field)?;
    for e in &self.path {
      match e {
        ListPathElement::Index(i) => write!(f, "[{i}]")?,
        ListPathElement::Key(k) => write!(f, "[{k:?}]")?,
        ListPathElement::Field(name) => write!(f, ".{name}")?,
      }
    }
    Ok(())
  }
}

// ============================================================================
// ListTracker
// ============================================================================

/// One tracked index: where it sits in the local (pre-reset) list and
/// in the remote (recovered) list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossListIndex {
  pub local: u32,
  pub remote: u32,
}

/// Tracks which indices of a list are known to recovery (inserted by
/// earlier recovered instructions) and maps local to remote positions.
#[derive(Debug, Default)]
pub struct ListTracker {
  indices_allowed: Vec<CrossListIndex>,
  requires_manual_copy: bool,
  has_been_copied: bool,
}

impl ListTracker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Local insert at `local_index`: clamp to the remote size, shift
  /// every known index at or above it, and record the new mapping.
  pub fn insert(&mut self, local_index: u32, remote_list_size: usize) -> Option<CrossListIndex> {
    if self.requires_manual_copy {
      return None;
    }
    let remote_index = (local_index as usize).min(remote_list_size) as u32;
    for ndx in &mut self.indices_allowed {
      if ndx.local >= local_index {
        ndx.local += 1;
        ndx.remote += 1;
      }
    }
    let inserted = CrossListIndex {
      local: local_index,
      remote: remote_index,
    };
    self.indices_allowed.push(inserted);
    Some(inserted)
  }

  /// A set-at-index is allowed only on a known index
  pub fn update(&mut self, index: u32) -> Option<CrossListIndex> {
    if self.requires_manual_copy {
      return None;
    }
    if let Some(found) = self.indices_allowed.iter().find(|ndx| ndx.local == index) {
      return Some(*found);
    }
    self.queue_for_manual_copy();
    None
  }

  /// A clear erases everything, so later operations touch only locally
  /// added elements: tracking can start over.
  pub fn clear(&mut self) {
    self.requires_manual_copy = false;
    self.indices_allowed.clear();
  }

  /// Translate a local move; both endpoints must be known
  pub fn do_move(&mut self, from: u32, to: u32, list_size: usize) -> Option<(u32, u32)> {
    if self.requires_manual_copy {
      return None;
    }
    if from == to {
      // Not expected from a well-formed changeset, but harmless.
      return Some((from, to));
    }

    let mut target_from = None;
    let mut target_to = None;
    for (i, ndx) in self.indices_allowed.iter().enumerate() {
      if ndx.local == from {
        debug_assert!(target_from.is_none());
        target_from = Some(i);
      } else if ndx.local == to {
        debug_assert!(target_to.is_none());
        target_to = Some(i);
      }
    }
    let (Some(from_i), Some(to_i)) = (target_from, target_to) else {
      self.queue_for_manual_copy();
      return None;
    };
    let remote_from = self.indices_allowed[from_i].remote;
    let remote_to_base = self.indices_allowed[to_i].remote;
    debug_assert!((remote_from as usize) <= list_size);
    debug_assert!((remote_to_base as usize) <= list_size);

    if from < to {
      for ndx in &mut self.indices_allowed {
        if ndx.local > from && ndx.local <= to {
          ndx.local -= 1;
          ndx.remote -= 1;
        }
      }
      let remote_to = self.indices_allowed[to_i].remote + 1;
      self.indices_allowed[from_i].local = self.indices_allowed[to_i].local + 1;
      self.indices_allowed[from_i].remote = remote_to;
      Some((remote_from, remote_to))
    } else {
      for ndx in &mut self.indices_allowed {
        if ndx.local < from && ndx.local >= to {
          ndx.local += 1;
          ndx.remote += 1;
        }
      }
      let remote_to = self.indices_allowed[to_i].remote - 1;
      self.indices_allowed[from_i].local = self.indices_allowed[to_i].local - 1;
      self.indices_allowed[from_i].remote = remote_to;
      Some((remote_from, remote_to))
    }
  }

  /// Translate a local erase; the index must be known
  pub fn remove(&mut self, index: u32) -> Option<u32> {
    if self.requires_manual_copy {
      return None;
    }
    let mut remote = None;
    let mut i = 0;
    while i < self.indices_allowed.len() {
      let ndx = self.indices_allowed[i];
      if ndx.local == index {
        remote = Some(ndx.remote);
        self.indices_allowed.remove(i);
        continue;
      }
      if ndx.local > index {
        self.indices_allowed[i].local -= 1;
        self.indices_allowed[i].remote -= 1;
      }
      i += 1;
    }
    if remote.is_none() {
      self.queue_for_manual_copy();
    }
    remote
  }

  /// A list only ever needs one verbatim copy: recovery goes straight
  /// to the final state.
  pub fn requires_manual_copy(&self) -> bool {
    self.requires_manual_copy && !self.has_been_copied
  }

  pub fn queue_for_manual_copy(&mut self) {
    self.requires_manual_copy = true;
    self.indices_allowed.clear();
  }

  pub fn mark_as_copied(&mut self) {
    self.has_been_copied = true;
  }
}

// ============================================================================
// Recovery applier
// ============================================================================

/// Replays local changesets against the recovered state
pub struct RecoveryApplier<'a> {
  tx: &'a mut Transaction,
  /// Pre-reset local state; manual copies read from here
  frozen: &'a Transaction,
  lists: IndexMap<ListPath, ListTracker>,
}

impl<'a> RecoveryApplier<'a> {
  pub fn new(tx: &'a mut Transaction, frozen: &'a Transaction) -> Self {
    debug_assert!(frozen.is_frozen());
    Self {
      tx,
      frozen,
      lists: IndexMap::new(),
    }
  }

  /// Apply all changesets in commit order, then resolve the lists whose
  /// mutations could not be translated.
  pub fn process_changesets(&mut self, changesets: &[(Version, Arc<Vec<u8>>)]) -> Result<()> {
    for (version, bytes) in changesets {
      let changeset = Changeset::decode(bytes)?;
      trace!(
        version = *version,
        count = changeset.instructions.len(),
        "recovering changeset"
      );
      for instr in &changeset.instructions {
        self.apply_with_degradation(instr)?;
      }
    }
    self.copy_lists_with_unrecoverable_changes()
  }

  /// Apply one instruction, silently discarding those the fresh server
  /// state can no longer accept. Destructive schema operations abort
  /// the whole recovery instead.
  fn apply_with_degradation(&mut self, instr: &Instruction) -> Result<()> {
    match instr {
      Instruction::EraseTable { table } => {
        return Err(TideError::ClientResetFailed(format!(
          "cannot recover a local schema change that removed class '{table}'"
        )));
      }
      Instruction::EraseColumn { table, field } => {
        return Err(TideError::ClientResetFailed(format!(
          "cannot recover a local schema change that removed property '{table}.{field}'"
        )));
      }
      Instruction::AddTable { .. }
      | Instruction::AddColumn { .. }
      | Instruction::CreateObject { .. }
      | Instruction::EraseObject { .. } => {
        // Recovery shares the applier with remote integration; the
        // remove semantics of EraseObject avoid dangling null entries
        // in mixed lists. Unlike remote changesets, recovered
        // instructions re-record so they are uploaded again.
        let result = InstructionApplier::new(self.tx).apply_instruction(instr);
        self.discard_on_bad(instr, result)
      }
      Instruction::Update { path, value, is_default } => {
        if let Some(PathElement::Index(local_index)) = path.path.last() {
          return self.recover_list_update(path, *local_index, value, *is_default);
        }
        let result =
          InstructionApplier::new(self.tx).apply_instruction(instr);
        self.discard_on_bad(instr, result)
      }
      Instruction::AddInteger { .. } => {
        let result = InstructionApplier::new(self.tx).apply_instruction(instr);
        self.discard_on_bad(instr, result)
      }
      Instruction::ArrayInsert {
        path,
        index,
        value,
        prior_size: _,
      } => self.recover_array_insert(path, *index, value),
      Instruction::ArrayMove {
        path,
        from,
        to,
        prior_size: _,
      } => self.recover_array_move(path, *from, *to),
      Instruction::ArrayErase {
        path,
        index,
        prior_size: _,
      } => self.recover_array_erase(path, *index),
      Instruction::Clear { path } => self.recover_clear(path),
      Instruction::SetInsert { .. } | Instruction::SetErase { .. } => {
        let result = InstructionApplier::new(self.tx).apply_instruction(instr);
        self.discard_on_bad(instr, result)
      }
    }
  }

  /// Translate a changeset failure into a silent discard
  fn discard_on_bad(&self, instr: &Instruction, result: Result<()>) -> Result<()> {
    match result {
      Ok(()) => Ok(()),
      Err(TideError::BadChangeset(reason)) => {
        debug!(table = instr.table_name(), %reason, "discarding unrecoverable instruction");
        Ok(())
      }
      Err(other) => Err(other),
    }
  }

  fn tracker(&mut self, path: &PathInstruction) -> &mut ListTracker {
    let key = ListPath::from_instruction_path(path);
    self.lists.entry(key).or_default()
  }

  /// Resolve the list a path addresses in `tx`; `None` degrades the
  /// instruction instead of failing.
  fn resolve_list(tx: &Transaction, path: &ListPath) -> Option<(TableKey, ObjKey, ColKey)> {
    let table = tx.group().table_by_name(&path.table)?;
    let mut cur_table = table.key;
    let mut cur_obj = match &path.object {
      PrimaryKey::GlobalKey(raw) => {
        let key = ObjKey(*raw);
        table.contains(key).then_some(key)?
      }
      pk => table.find_by_pk(&pk.to_value()?)?,
    };
    let mut cur_col = table.column_by_name(&path.field)?.key;

    let enter = |link: &Value, field: &str| -> Option<(TableKey, ObjKey, ColKey)> {
      let Value::Link(link) = link else {
        return None;
      };
      let target = tx.group().table(link.table)?;
      target.get(link.obj)?;
      Some((link.table, link.obj, target.column_by_name(field)?.key))
    };

    let mut i = 0;
    while i < path.path.len() {
      let t = tx.group().table(cur_table)?;
      let obj = t.get(cur_obj)?;
      match &path.path[i] {
        ListPathElement::Field(name) => {
          let Some(Field::Single(v)) = obj.fields.get(&cur_col) else {
            return None;
          };
          (cur_table, cur_obj, cur_col) = enter(v, name)?;
          i += 1;
        }
        ListPathElement::Index(idx) => {
          let Some(Field::List(vs)) = obj.fields.get(&cur_col) else {
            return None;
          };
          let value = vs.get(*idx as usize)?.clone();
          let ListPathElement::Field(name) = path.path.get(i + 1)? else {
            return None;
          };
          (cur_table, cur_obj, cur_col) = enter(&value, name)?;
          i += 2;
        }
        ListPathElement::Key(key) => {
          let Some(Field::Dict(map)) = obj.fields.get(&cur_col) else {
            return None;
          };
          let value = map.get(key)?.clone();
          let ListPathElement::Field(name) = path.path.get(i + 1)? else {
            return None;
          };
          (cur_table, cur_obj, cur_col) = enter(&value, name)?;
          i += 2;
        }
      }
    }

    let spec = tx.group().table(cur_table)?.column(cur_col)?;
    (spec.collection == CollectionKind::List).then_some((cur_table, cur_obj, cur_col))
  }

  fn remote_list_size(&self, path: &PathInstruction) -> Option<usize> {
    let key = ListPath::from_instruction_path(path);
    let (table, obj, col) = Self::resolve_list(self.tx, &key)?;
    self.tx.list_size(table, obj, col).ok()
  }

  fn recover_list_update(
    &mut self,
    path: &PathInstruction,
    local_index: u32,
    value: &Payload,
    is_default: bool,
  ) -> Result<()> {
    let tracker = self.tracker(path);
    let Some(cross) = tracker.update(local_index) else {
      trace!(%path, local_index, "list update on unknown index; list queued for copy");
      return Ok(());
    };
    let mut translated = path.clone();
    if let Some(PathElement::Index(i)) = translated.path.last_mut() {
      *i = cross.remote;
    }
    let result = InstructionApplier::new(self.tx).apply_instruction(&Instruction::Update {
      path: translated,
      value: value.clone(),
      is_default,
    });
    self.discard_on_bad_list(path, result)
  }

  fn recover_array_insert(
    &mut self,
    path: &PathInstruction,
    local_index: u32,
    value: &Payload,
  ) -> Result<()> {
    let Some(remote_size) = self.remote_list_size(path) else {
      // The list's object or column no longer exists.
      trace!(%path, "list insert on unresolvable path; discarded");
      return Ok(());
    };
    let tracker = self.tracker(path);
    let Some(cross) = tracker.insert(local_index, remote_size) else {
      return Ok(());
    };
    let result = InstructionApplier::new(self.tx).apply_instruction(&Instruction::ArrayInsert {
      path: path.clone(),
      index: cross.remote,
      value: value.clone(),
      prior_size: remote_size as u32,
    });
    self.discard_on_bad_list(path, result)
  }

  fn recover_array_move(&mut self, path: &PathInstruction, from: u32, to: u32) -> Result<()> {
    let Some(remote_size) = self.remote_list_size(path) else {
      trace!(%path, "list move on unresolvable path; discarded");
      return Ok(());
    };
    let tracker = self.tracker(path);
    let Some((remote_from, remote_to)) = tracker.do_move(from, to, remote_size) else {
      return Ok(());
    };
    if remote_from == remote_to {
      return Ok(());
    }
    let result = InstructionApplier::new(self.tx).apply_instruction(&Instruction::ArrayMove {
      path: path.clone(),
      from: remote_from,
      to: remote_to.min(remote_size.saturating_sub(1) as u32),
      prior_size: remote_size as u32,
    });
    self.discard_on_bad_list(path, result)
  }

  fn recover_array_erase(&mut self, path: &PathInstruction, local_index: u32) -> Result<()> {
    let Some(remote_size) = self.remote_list_size(path) else {
      trace!(%path, "list erase on unresolvable path; discarded");
      return Ok(());
    };
    let tracker = self.tracker(path);
    let Some(remote_index) = tracker.remove(local_index) else {
      return Ok(());
    };
    let result = InstructionApplier::new(self.tx).apply_instruction(&Instruction::ArrayErase {
      path: path.clone(),
      index: remote_index,
      prior_size: remote_size as u32,
    });
    self.discard_on_bad_list(path, result)
  }

  fn recover_clear(&mut self, path: &PathInstruction) -> Result<()> {
    // After a clear every surviving element is locally added, so index
    // tracking can start from scratch.
    self.tracker(path).clear();
    let result = InstructionApplier::new(self.tx).apply_instruction(&Instruction::Clear {
      path: path.clone(),
    });
    self.discard_on_bad(
      &Instruction::Clear { path: path.clone() },
      result,
    )
  }

  /// A translated list operation that still fails marks the list for
  /// manual copy rather than failing the recovery.
  fn discard_on_bad_list(&mut self, path: &PathInstruction, result: Result<()>) -> Result<()> {
    match result {
      Ok(()) => Ok(()),
      Err(TideError::BadChangeset(reason)) => {
        debug!(%path, %reason, "translated list operation failed; list queued for copy");
        self.tracker(path).queue_for_manual_copy();
        Ok(())
      }
      Err(other) => Err(other),
    }
  }

  // ==========================================================================
  // Manual copies
  // ==========================================================================

  /// Replace every list whose recovered mutations could not be
  /// translated with its value from the frozen pre-reset snapshot.
  fn copy_lists_with_unrecoverable_changes(&mut self) -> Result<()> {
    let paths: Vec<ListPath> = self
      .lists
      .iter()
      .filter(|(_, tracker)| tracker.requires_manual_copy())
      .map(|(path, _)| path.clone())
      .collect();
    debug!(count = paths.len(), "lists requiring manual copy");

    for list_path in paths {
      let copied = self.copy_list_verbatim(&list_path)?;
      if let Some(tracker) = self.lists.get_mut(&list_path) {
        if copied {
          tracker.mark_as_copied();
        }
        // Either way the mark is cleared; a list is only copied once.
        tracker.clear();
      }
    }
    Ok(())
  }

  fn copy_list_verbatim(&mut self, path: &ListPath) -> Result<bool> {
    let Some((src_table, src_obj, src_col)) = Self::resolve_list(self.frozen, path) else {
      debug!(%path, "list no longer resolves in the pre-reset state; skipped");
      return Ok(false);
    };
    let Some((dst_table, dst_obj, dst_col)) = Self::resolve_list(self.tx, path) else {
      debug!(%path, "list no longer resolves in the recovered state; skipped");
      return Ok(false);
    };

    let src_values: Vec<Value> = self
      .frozen
      .group()
      .table(src_table)
      .and_then(|t| t.get(src_obj))
      .and_then(|o| o.fields.get(&src_col))
      .map(|f| match f {
        Field::List(vs) => vs.clone(),
        _ => Vec::new(),
      })
      .unwrap_or_default();

    self.tx.clear_collection(dst_table, dst_obj, dst_col)?;

    let mut embedded = EmbeddedTracker::default();
    for (i, value) in src_values.iter().enumerate() {
      let is_embedded = matches!(value, Value::Link(link)
        if self.frozen.group().table(link.table).is_some_and(|t| t.is_embedded()));
      if is_embedded {
        let Value::Link(src_link) = value else {
          unreachable!()
        };
        let dst_link = self
          .tx
          .create_embedded_in_list(dst_table, dst_obj, dst_col, i)?;
        embedded.track(*src_link, dst_link);
      } else {
        let converted = convert_value(self.frozen, self.tx, value)?;
        self
          .tx
          .list_insert(dst_table, dst_obj, dst_col, i, converted)?;
      }
    }
    embedded.process_pending(self.frozen, self.tx)?;
    debug!(%path, count = src_values.len(), "list copied verbatim from the pre-reset state");
    Ok(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn insert_clamps_and_shifts() {
    // Remote list of size 3; local insert(0), insert(2), erase(1).
    let mut tracker = ListTracker::new();
    let first = tracker.insert(0, 3).unwrap();
    assert_eq!(first, CrossListIndex { local: 0, remote: 0 });

    let second = tracker.insert(2, 4).unwrap();
    assert_eq!(second, CrossListIndex { local: 2, remote: 2 });

    // Erasing unknown local index 1 poisons the list.
    assert!(tracker.remove(1).is_none());
    assert!(tracker.requires_manual_copy());
  }

  #[test]
  fn insert_beyond_remote_size_is_clamped() {
    let mut tracker = ListTracker::new();
    let cross = tracker.insert(10, 3).unwrap();
    assert_eq!(cross.local, 10);
    assert_eq!(cross.remote, 3);
  }

  #[test]
  fn known_index_round_trips_through_erase() {
    let mut tracker = ListTracker::new();
    tracker.insert(0, 0).unwrap();
    tracker.insert(1, 1).unwrap();
    // Erase the first known element; the second shifts down.
    assert_eq!(tracker.remove(0), Some(0));
    assert_eq!(tracker.update(0).map(|c| c.remote), Some(0));
  }

  #[test]
  fn update_on_unknown_index_queues_copy() {
    let mut tracker = ListTracker::new();
    tracker.insert(0, 5).unwrap();
    assert!(tracker.update(3).is_none());
    assert!(tracker.requires_manual_copy());
    // Once queued, every further operation is ignored.
    assert!(tracker.insert(0, 5).is_none());
    assert!(tracker.remove(0).is_none());
  }

  #[test]
  fn clear_resets_tracking() {
    let mut tracker = ListTracker::new();
    tracker.insert(0, 5).unwrap();
    assert!(tracker.update(4).is_none());
    assert!(tracker.requires_manual_copy());
    tracker.clear();
    assert!(!tracker.requires_manual_copy());
    assert!(tracker.insert(0, 0).is_some());
  }

  #[test]
  fn move_requires_both_endpoints_known() {
    let mut tracker = ListTracker::new();
    tracker.insert(0, 0).unwrap();
    tracker.insert(1, 1).unwrap();
    let (from, to) = tracker.do_move(0, 1, 2).unwrap();
    assert_eq!(from, 0);
    assert_eq!(to, 1);

    let mut poisoned = ListTracker::new();
    poisoned.insert(0, 0).unwrap();
    assert!(poisoned.do_move(0, 3, 1).is_none());
    assert!(poisoned.requires_manual_copy());
  }

  #[test]
  fn copied_lists_are_not_copied_twice() {
    let mut tracker = ListTracker::new();
    tracker.queue_for_manual_copy();
    assert!(tracker.requires_manual_copy());
    tracker.mark_as_copied();
    assert!(!tracker.requires_manual_copy());
  }
}
