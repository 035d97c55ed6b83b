//! Client reset
//!
//! When the server declares the client's sync history unusable, the
//! local file must be rebuilt from a fresh server-provided snapshot.
//! Three behaviors exist: surface the failure (Manual), adopt the
//! remote state wholesale (DiscardLocal), or replay local offline
//! changes on top of it (Recover / RecoverOrDiscard).
//!
//! A reserved metadata table records the attempt so that a reset that
//! did not stick cannot loop forever.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{META_RESET_TABLE, META_RESET_VERSION, RESET_MANIFEST_FILE};
use crate::db::group::Field;
use crate::db::transaction::Transaction;
use crate::db::Db;
use crate::error::{Result, TideError};
use crate::sync::config::ClientResyncMode;
use crate::sync::recovery::RecoveryApplier;
use crate::types::{
  CollectionKind, ColKey, DataType, FileIdent, ObjKey, ObjLink, ObjectId, TableKey, Timestamp,
  Value, Version,
};

// ============================================================================
// Reset metadata
// ============================================================================

const META_PK_COL: &str = "id";
const META_VERSION_COL: &str = "version";
const META_TIME_COL: &str = "event_time";
const META_TYPE_COL: &str = "type_of_reset";

/// A previously recorded, not-yet-confirmed reset attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReset {
  pub time: Timestamp,
  pub mode: ClientResyncMode,
}

fn now_timestamp() -> Timestamp {
  let since_epoch = std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .unwrap_or_default();
  Timestamp {
    seconds: since_epoch.as_secs() as i64,
    nanoseconds: since_epoch.subsec_nanos(),
  }
}

/// Read the pending-reset row, if one exists
pub fn has_pending_reset(tx: &Transaction) -> Result<Option<PendingReset>> {
  let Some(table) = tx.group().table_by_name(META_RESET_TABLE) else {
    return Ok(None);
  };
  let Some(obj) = table.objects().next() else {
    return Ok(None);
  };
  let version_col = table.column_by_name(META_VERSION_COL);
  let time_col = table.column_by_name(META_TIME_COL);
  let type_col = table.column_by_name(META_TYPE_COL);
  let (Some(version_col), Some(time_col), Some(type_col)) = (version_col, time_col, type_col)
  else {
    return Err(TideError::ClientResetFailed(
      "malformed client_reset_metadata table".into(),
    ));
  };

  let version = match obj.fields.get(&version_col.key) {
    Some(Field::Single(Value::Int(v))) => *v,
    _ => 0,
  };
  if version != META_RESET_VERSION {
    return Err(TideError::ClientResetFailed(format!(
      "unsupported client_reset_metadata version {version}"
    )));
  }
  let time = match obj.fields.get(&time_col.key) {
    Some(Field::Single(Value::Timestamp(t))) => *t,
    _ => Timestamp::default(),
  };
  let mode = match obj.fields.get(&type_col.key) {
    Some(Field::Single(Value::Int(1))) => ClientResyncMode::Recover,
    _ => ClientResyncMode::DiscardLocal,
  };
  Ok(Some(PendingReset { time, mode }))
}

/// Drop all recorded reset attempts (called once a reset has stuck)
pub fn remove_pending_client_resets(tx: &mut Transaction) -> Result<usize> {
  let Some(table) = tx.group().table_by_name(META_RESET_TABLE) else {
    return Ok(0);
  };
  let table_key = table.key;
  let keys = table.object_keys();
  let count = keys.len();
  for key in keys {
    tx.erase_object(table_key, key)?;
  }
  Ok(count)
}

/// Record the reset being attempted. At most one row exists.
pub fn track_reset(tx: &mut Transaction, mode: ClientResyncMode) -> Result<()> {
  assert!(mode != ClientResyncMode::Manual);
  let table_key = match tx.group().key_of(META_RESET_TABLE) {
    Some(key) => key,
    None => {
      let key =
        tx.add_table_with_primary_key(META_RESET_TABLE, DataType::ObjectId, META_PK_COL, false)?;
      tx.add_column(key, META_VERSION_COL, DataType::Int, false, CollectionKind::Single, None)?;
      tx.add_column(
        key,
        META_TIME_COL,
        DataType::Timestamp,
        false,
        CollectionKind::Single,
        None,
      )?;
      tx.add_column(key, META_TYPE_COL, DataType::Int, false, CollectionKind::Single, None)?;
      key
    }
  };

  // The row id only needs to be unique within this table.
  let mut id = ObjectId::default();
  let now = now_timestamp();
  id.0[..8].copy_from_slice(&(now.seconds as u64).to_be_bytes());
  id.0[8..].copy_from_slice(&now.nanoseconds.to_be_bytes());

  let mode_val = match mode {
    ClientResyncMode::Recover | ClientResyncMode::RecoverOrDiscard => 1,
    _ => 0,
  };
  let (obj, _) = tx.create_object_with_pk(table_key, Value::ObjectId(id))?;
  let version_col = col_key(tx, table_key, META_VERSION_COL)?;
  let time_col = col_key(tx, table_key, META_TIME_COL)?;
  let type_col = col_key(tx, table_key, META_TYPE_COL)?;
  tx.set_value(table_key, obj, version_col, Value::Int(META_RESET_VERSION))?;
  tx.set_value(table_key, obj, time_col, Value::Timestamp(now))?;
  tx.set_value(table_key, obj, type_col, Value::Int(mode_val))?;
  Ok(())
}

fn col_key(tx: &Transaction, table: TableKey, name: &str) -> Result<ColKey> {
  tx.group()
    .table(table)
    .and_then(|t| t.column_by_name(name))
    .map(|c| c.key)
    .ok_or_else(|| TideError::ClientResetFailed(format!("missing metadata column '{name}'")))
}

/// Enforce the cycle-prevention matrix, then record this attempt.
/// Returns the (possibly downgraded) effective mode.
fn reset_precheck_guard(
  tx: &mut Transaction,
  mut mode: ClientResyncMode,
  recovery_is_allowed: bool,
) -> Result<ClientResyncMode> {
  if let Some(previous) = has_pending_reset(tx)? {
    match previous.mode {
      ClientResyncMode::DiscardLocal => {
        return Err(TideError::ClientResetFailed(format!(
          "a previous '{}' mode reset from {} did not succeed, giving up on '{mode}' mode to \
           prevent a cycle",
          previous.mode, previous.time
        )));
      }
      ClientResyncMode::Recover => match mode {
        ClientResyncMode::Recover => {
          return Err(TideError::ClientResetFailed(format!(
            "a previous '{}' mode reset from {} did not succeed, giving up on '{mode}' mode to \
             prevent a cycle",
            previous.mode, previous.time
          )));
        }
        ClientResyncMode::RecoverOrDiscard => {
          mode = ClientResyncMode::DiscardLocal;
          info!(
            previous_time = %previous.time,
            "previous recovery attempt downgrades this reset to DiscardLocal"
          );
        }
        // Recover followed by an explicit discard is not a cycle yet.
        ClientResyncMode::DiscardLocal => {}
        ClientResyncMode::Manual => unreachable!("manual resets never reach the guard"),
      },
      _ => {
        return Err(TideError::ClientResetFailed(format!(
          "unexpected previous '{}' mode reset from {} did not succeed",
          previous.mode, previous.time
        )));
      }
    }
  }

  if !recovery_is_allowed {
    match mode {
      ClientResyncMode::Recover => {
        return Err(TideError::ClientResetFailed(
          "client reset mode is set to 'Recover' but the server does not allow recovery for \
           this client"
            .into(),
        ));
      }
      ClientResyncMode::RecoverOrDiscard => {
        mode = ClientResyncMode::DiscardLocal;
        info!("recovery disallowed by the server; downgrading to DiscardLocal");
      }
      _ => {}
    }
  }

  // Metadata rows are engine bookkeeping, never uploaded.
  tx.set_instruction_recording(false);
  let tracked = track_reset(tx, mode);
  tx.set_instruction_recording(true);
  tracked?;
  Ok(mode)
}

// ============================================================================
// Recovery-directory manifest
// ============================================================================

/// Written as JSON into the recovery directory before the local file is
/// touched, so an interrupted reset can be diagnosed.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResetManifest {
  pub mode: String,
  pub unix_time_seconds: i64,
  pub source_path: String,
}

fn write_reset_manifest(dir: &Path, mode: ClientResyncMode, source: &Path) -> Result<()> {
  std::fs::create_dir_all(dir)?;
  let manifest = ResetManifest {
    mode: mode.to_string(),
    unix_time_seconds: now_timestamp().seconds,
    source_path: source.display().to_string(),
  };
  let json = serde_json::to_string_pretty(&manifest)
    .map_err(|e| TideError::ClientResetFailed(format!("manifest serialization failed: {e}")))?;
  std::fs::write(dir.join(RESET_MANIFEST_FILE), json)?;
  Ok(())
}

// ============================================================================
// Schema & object transfer
// ============================================================================

/// Tables owned by the engine itself are not transferred
fn should_skip_table(name: &str) -> bool {
  name == META_RESET_TABLE
}

/// Bi-directional reconciliation of `src` into `dst`: additive schema
/// changes are applied to `dst`, destructive ones fail the reset, then
/// every surviving object's value is copied field by field.
pub fn transfer_group(src: &Transaction, dst: &mut Transaction) -> Result<()> {
  debug!(
    src_tables = src.group().table_count(),
    dst_tables = dst.group().table_count(),
    "transfer_group"
  );

  // Tables in dst that are absent in src would require destructive
  // schema changes to reconcile; give up before touching anything.
  let mut tables_to_remove: Vec<String> = Vec::new();
  for table in dst.group().tables() {
    if should_skip_table(&table.name) {
      continue;
    }
    let Some(table_src) = src.group().table_by_name(&table.name) else {
      tables_to_remove.push(table.name.clone());
      continue;
    };
    match (&table_src.pk, &table.pk) {
      (None, None) => {}
      (Some(pk_src), Some(pk_dst)) => {
        if pk_src.data_type != pk_dst.data_type {
          return Err(TideError::ClientResetFailed(format!(
            "found incompatible primary key types ({} vs {}) on '{}'",
            pk_src.data_type, pk_dst.data_type, table.name
          )));
        }
        if pk_src.nullable != pk_dst.nullable {
          return Err(TideError::ClientResetFailed(format!(
            "found incompatible primary key attributes on '{}'",
            table.name
          )));
        }
        if pk_src.name != pk_dst.name {
          return Err(TideError::ClientResetFailed(format!(
            "requires equal pk column names but '{}' != '{}' on '{}'",
            pk_src.name, pk_dst.name, table.name
          )));
        }
      }
      (src_pk, _) => {
        return Err(TideError::ClientResetFailed(format!(
          "requires a primary key column in {} table '{}'",
          if src_pk.is_some() { "dest" } else { "source" },
          table.name
        )));
      }
    }
  }
  if !tables_to_remove.is_empty() {
    return Err(TideError::ClientResetFailed(format!(
      "cannot recover when classes have been removed: {{{}}}",
      tables_to_remove.join(", ")
    )));
  }

  // Create tables that only exist in src.
  for table_src in collect_table_names(src) {
    let src_table = src.group().table_by_name(&table_src).expect("listed");
    if dst.group().table_by_name(&table_src).is_some() {
      continue;
    }
    if src_table.is_embedded() {
      dst.add_embedded_table(&table_src)?;
    } else if let Some(pk) = &src_table.pk {
      dst.add_table_with_primary_key(&table_src, pk.data_type, &pk.name, pk.nullable)?;
    } else {
      dst.add_table(&table_src)?;
    }
  }

  // Columns removed from src are destructive; columns added in src are
  // created in dst; everything else must match (ignoring indexes).
  for table_name in collect_table_names(src) {
    let dst_key = dst.group().key_of(&table_name).expect("created above");
    let mut removed: Vec<String> = Vec::new();
    {
      let table_src = src.group().table_by_name(&table_name).expect("listed");
      let table_dst = dst.group().table(dst_key).expect("created above");
      for col in table_dst.columns() {
        if table_src.column_by_name(&col.name).is_none() {
          removed.push(col.name.clone());
        }
      }
    }
    if !removed.is_empty() {
      return Err(TideError::ClientResetFailed(format!(
        "cannot recover when columns have been removed from '{table_name}': {{{}}}",
        removed.join(", ")
      )));
    }

    let src_cols: Vec<crate::db::group::ColumnSpec> = src
      .group()
      .table_by_name(&table_name)
      .expect("listed")
      .columns()
      .cloned()
      .collect();
    for col in src_cols {
      let existing = dst
        .group()
        .table(dst_key)
        .and_then(|t| t.column_by_name(&col.name))
        .cloned();
      match existing {
        None => {
          debug!(table = %table_name, column = %col.name, "creating column");
          let new_col = dst.add_column(
            dst_key,
            &col.name,
            col.data_type,
            col.nullable,
            col.collection,
            col.target.as_deref(),
          )?;
          if col.indexed {
            if let Some(table) = dst.group_mut().table_mut(dst_key) {
              table.set_indexed(new_col, true);
            }
          }
        }
        Some(dst_col) => {
          if !dst_col.attrs_match(&col) {
            return Err(TideError::ClientResetFailed(format!(
              "incompatible column change detected during client reset for '{table_name}.{}' \
               ({} {} vs {} {})",
              col.name, col.collection, col.data_type, dst_col.collection, dst_col.data_type
            )));
          }
        }
      }
    }
  }

  // Remove objects in dst whose primary key is absent in src.
  for table_name in collect_table_names(src) {
    let src_table = src.group().table_by_name(&table_name).expect("listed");
    if src_table.is_embedded() {
      // Embedded lifetimes are tied to their owners.
      continue;
    }
    let dst_key = dst.group().key_of(&table_name).expect("created above");
    let stale: Vec<ObjKey> = {
      let table_dst = dst.group().table(dst_key).expect("created above");
      table_dst
        .objects()
        .filter(|obj| src_table.find_by_pk(&obj.pk).is_none())
        .map(|obj| obj.key)
        .collect()
    };
    for obj in stale {
      debug!(table = %table_name, %obj, "removing object absent on the server");
      dst.erase_object(dst_key, obj)?;
    }
  }

  // Diff every surviving object's values, creating missing objects on
  // the fly. Embedded instances go through the work queue so each is
  // visited exactly once.
  let mut tracker = EmbeddedTracker::default();
  for table_name in collect_table_names(src) {
    let src_table_key = src.group().key_of(&table_name).expect("listed");
    if src.group().table(src_table_key).expect("listed").is_embedded() {
      continue;
    }
    let dst_key = dst.group().key_of(&table_name).expect("created above");
    let src_objs: Vec<(ObjKey, Value)> = src
      .group()
      .table(src_table_key)
      .expect("listed")
      .objects()
      .map(|o| (o.key, o.pk.clone()))
      .collect();
    for (src_obj, pk) in src_objs {
      let (dst_obj, created) = dst.create_object_with_pk(dst_key, pk.clone())?;
      if created {
        debug!(table = %table_name, %pk, "creating object from the server state");
      }
      copy_object(src, dst, src_table_key, src_obj, dst_key, dst_obj, &mut tracker)?;
    }
    tracker.process_pending(src, dst)?;
  }
  Ok(())
}

fn collect_table_names(tx: &Transaction) -> Vec<String> {
  tx.group()
    .tables()
    .filter(|t| !should_skip_table(&t.name))
    .map(|t| t.name.clone())
    .collect()
}

// ============================================================================
// Object copying
// ============================================================================

/// Work queue ensuring every embedded instance is copied exactly once
#[derive(Default)]
pub(crate) struct EmbeddedTracker {
  pending: Vec<(ObjLink, ObjLink)>,
  seen: HashSet<ObjLink>,
}

impl EmbeddedTracker {
  pub(crate) fn track(&mut self, src: ObjLink, dst: ObjLink) {
    if self.seen.insert(src) {
      self.pending.push((src, dst));
    }
  }

  pub(crate) fn process_pending(&mut self, src: &Transaction, dst: &mut Transaction) -> Result<()> {
    while let Some((src_link, dst_link)) = self.pending.pop() {
      copy_object(
        src,
        dst,
        src_link.table,
        src_link.obj,
        dst_link.table,
        dst_link.obj,
        self,
      )?;
    }
    Ok(())
  }
}

/// Copy one object's fields from `src` to `dst`, column by column
pub(crate) fn copy_object(
  src: &Transaction,
  dst: &mut Transaction,
  src_table: TableKey,
  src_obj: ObjKey,
  dst_table: TableKey,
  dst_obj: ObjKey,
  tracker: &mut EmbeddedTracker,
) -> Result<()> {
  let columns: Vec<crate::db::group::ColumnSpec> = {
    let t = src
      .group()
      .table(src_table)
      .ok_or_else(|| TideError::ClientResetFailed("source table vanished mid-copy".into()))?;
    let pk_name = t.pk.as_ref().map(|pk| pk.name.clone());
    t.columns()
      .filter(|c| Some(c.name.as_str()) != pk_name.as_deref())
      .cloned()
      .collect()
  };

  for col in columns {
    let dst_col = dst
      .group()
      .table(dst_table)
      .and_then(|t| t.column_by_name(&col.name))
      .map(|c| c.key)
      .ok_or_else(|| {
        TideError::ClientResetFailed(format!("column '{}' missing after schema transfer", col.name))
      })?;

    match col.collection {
      CollectionKind::Single => {
        let src_value = src_field_single(src, src_table, src_obj, col.key);
        copy_single_value(src, dst, src_value, dst_table, dst_obj, dst_col, tracker)?;
      }
      CollectionKind::List => {
        copy_list(src, dst, &col, src_table, src_obj, dst_table, dst_obj, dst_col, tracker)?;
      }
      CollectionKind::Set => {
        copy_set(src, dst, &col, src_table, src_obj, dst_table, dst_obj, dst_col)?;
      }
      CollectionKind::Dictionary => {
        copy_dict(src, dst, &col, src_table, src_obj, dst_table, dst_obj, dst_col, tracker)?;
      }
    }
  }
  Ok(())
}

fn src_field_single(tx: &Transaction, table: TableKey, obj: ObjKey, col: ColKey) -> Value {
  tx.group()
    .table(table)
    .and_then(|t| t.get(obj))
    .and_then(|o| o.fields.get(&col))
    .and_then(|f| match f {
      Field::Single(v) => Some(v.clone()),
      _ => None,
    })
    .unwrap_or(Value::Null)
}

fn src_field_values(tx: &Transaction, table: TableKey, obj: ObjKey, col: ColKey) -> Vec<Value> {
  tx.group()
    .table(table)
    .and_then(|t| t.get(obj))
    .and_then(|o| o.fields.get(&col))
    .map(|f| match f {
      Field::List(vs) | Field::Set(vs) => vs.clone(),
      Field::Single(v) => vec![v.clone()],
      Field::Dict(map) => map.values().cloned().collect(),
    })
    .unwrap_or_default()
}

fn src_field_dict(
  tx: &Transaction,
  table: TableKey,
  obj: ObjKey,
  col: ColKey,
) -> Vec<(String, Value)> {
  tx.group()
    .table(table)
    .and_then(|t| t.get(obj))
    .and_then(|o| o.fields.get(&col))
    .map(|f| match f {
      Field::Dict(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
      _ => Vec::new(),
    })
    .unwrap_or_default()
}

fn is_embedded_link(tx: &Transaction, value: &Value) -> bool {
  matches!(value, Value::Link(link)
    if tx.group().table(link.table).is_some_and(|t| t.is_embedded()))
}

/// Translate a non-embedded source value into the destination realm.
/// Links resolve through the primary key of their target.
pub(crate) fn convert_value(src: &Transaction, dst: &mut Transaction, value: &Value) -> Result<Value> {
  let Value::Link(link) = value else {
    return Ok(value.clone());
  };
  let (target_name, pk) = {
    let t = src
      .group()
      .table(link.table)
      .ok_or_else(|| TideError::ClientResetFailed("dangling link in source".into()))?;
    let obj = t
      .get(link.obj)
      .ok_or_else(|| TideError::ClientResetFailed("dangling link in source".into()))?;
    (t.name.clone(), obj.pk.clone())
  };
  let dst_table = dst.group().key_of(&target_name).ok_or_else(|| {
    TideError::ClientResetFailed(format!("link target class '{target_name}' missing"))
  })?;
  let (dst_obj, _) = dst.create_object_with_pk(dst_table, pk)?;
  Ok(Value::Link(ObjLink {
    table: dst_table,
    obj: dst_obj,
  }))
}

fn copy_single_value(
  src: &Transaction,
  dst: &mut Transaction,
  src_value: Value,
  dst_table: TableKey,
  dst_obj: ObjKey,
  dst_col: ColKey,
  tracker: &mut EmbeddedTracker,
) -> Result<()> {
  if is_embedded_link(src, &src_value) {
    let Value::Link(src_link) = src_value else {
      unreachable!()
    };
    // Reuse the existing embedded object if there is one.
    let existing = dst.get_value(dst_table, dst_obj, dst_col).ok();
    let dst_link = match existing {
      Some(Value::Link(l)) if dst.group().table(l.table).is_some_and(|t| t.is_embedded()) => l,
      _ => dst.create_embedded(dst_table, dst_obj, dst_col)?,
    };
    tracker.track(src_link, dst_link);
    return Ok(());
  }

  let converted = convert_value(src, dst, &src_value)?;
  let current = dst.get_value(dst_table, dst_obj, dst_col).ok();
  if current.as_ref() != Some(&converted) {
    dst.set_value(dst_table, dst_obj, dst_col, converted)?;
  }
  Ok(())
}

/// Lists are reconciled with a prefix/suffix diff: the shared prefix
/// and suffix are left untouched and only the differing middle is
/// rewritten.
#[allow(clippy::too_many_arguments)]
fn copy_list(
  src: &Transaction,
  dst: &mut Transaction,
  col: &crate::db::group::ColumnSpec,
  src_table: TableKey,
  src_obj: ObjKey,
  dst_table: TableKey,
  dst_obj: ObjKey,
  dst_col: ColKey,
  tracker: &mut EmbeddedTracker,
) -> Result<()> {
  let src_values = src_field_values(src, src_table, src_obj, col.key);

  let embedded = src_values.iter().any(|v| is_embedded_link(src, v));
  if embedded {
    // Embedded lists are rebuilt element-wise; each instance is copied
    // exactly once through the tracker.
    dst.clear_collection(dst_table, dst_obj, dst_col)?;
    for (i, v) in src_values.iter().enumerate() {
      let Value::Link(src_link) = v else {
        return Err(TideError::ClientResetFailed(
          "mixed embedded and plain values in one list".into(),
        ));
      };
      let dst_link = dst.create_embedded_in_list(dst_table, dst_obj, dst_col, i)?;
      tracker.track(*src_link, dst_link);
    }
    return Ok(());
  }

  let mut converted = Vec::with_capacity(src_values.len());
  for v in &src_values {
    converted.push(convert_value(src, dst, v)?);
  }

  let dst_len = dst.list_size(dst_table, dst_obj, dst_col)?;
  let mut dst_values = Vec::with_capacity(dst_len);
  for i in 0..dst_len {
    dst_values.push(dst.list_get(dst_table, dst_obj, dst_col, i)?);
  }

  let prefix = converted
    .iter()
    .zip(dst_values.iter())
    .take_while(|(a, b)| a == b)
    .count();
  let suffix = converted[prefix..]
    .iter()
    .rev()
    .zip(dst_values[prefix..].iter().rev())
    .take_while(|(a, b)| a == b)
    .count();

  // Overwrite the differing middle, then fix up the length.
  let src_mid = converted.len() - suffix;
  let dst_mid = dst_values.len() - suffix;
  for i in prefix..src_mid.min(dst_mid) {
    dst.list_set(dst_table, dst_obj, dst_col, i, converted[i].clone())?;
  }
  if src_mid > dst_mid {
    for i in dst_mid..src_mid {
      dst.list_insert(dst_table, dst_obj, dst_col, i, converted[i].clone())?;
    }
  } else {
    for _ in src_mid..dst_mid {
      dst.list_erase(dst_table, dst_obj, dst_col, src_mid)?;
    }
  }
  Ok(())
}

/// Sets are reconciled by membership
#[allow(clippy::too_many_arguments)]
fn copy_set(
  src: &Transaction,
  dst: &mut Transaction,
  col: &crate::db::group::ColumnSpec,
  src_table: TableKey,
  src_obj: ObjKey,
  dst_table: TableKey,
  dst_obj: ObjKey,
  dst_col: ColKey,
) -> Result<()> {
  let src_values = src_field_values(src, src_table, src_obj, col.key);
  let mut wanted = Vec::with_capacity(src_values.len());
  for v in &src_values {
    wanted.push(convert_value(src, dst, v)?);
  }

  let current: Vec<Value> = dst
    .group()
    .table(dst_table)
    .and_then(|t| t.get(dst_obj))
    .and_then(|o| o.fields.get(&dst_col))
    .map(|f| match f {
      Field::Set(vs) => vs.clone(),
      _ => Vec::new(),
    })
    .unwrap_or_default();

  for v in &current {
    if !wanted.iter().any(|w| w.total_cmp(v).is_eq()) {
      dst.set_erase(dst_table, dst_obj, dst_col, v.clone())?;
    }
  }
  for w in wanted {
    dst.set_insert(dst_table, dst_obj, dst_col, w)?;
  }
  Ok(())
}

/// Dictionaries are reconciled with a key-sorted merge
#[allow(clippy::too_many_arguments)]
fn copy_dict(
  src: &Transaction,
  dst: &mut Transaction,
  col: &crate::db::group::ColumnSpec,
  src_table: TableKey,
  src_obj: ObjKey,
  dst_table: TableKey,
  dst_obj: ObjKey,
  dst_col: ColKey,
  tracker: &mut EmbeddedTracker,
) -> Result<()> {
  let src_entries = src_field_dict(src, src_table, src_obj, col.key);
  let dst_keys: Vec<String> = dst
    .group()
    .table(dst_table)
    .and_then(|t| t.get(dst_obj))
    .and_then(|o| o.fields.get(&dst_col))
    .map(|f| match f {
      Field::Dict(map) => map.keys().cloned().collect(),
      _ => Vec::new(),
    })
    .unwrap_or_default();

  for key in &dst_keys {
    if !src_entries.iter().any(|(k, _)| k == key) {
      dst.dict_erase(dst_table, dst_obj, dst_col, key)?;
    }
  }
  for (key, value) in src_entries {
    if is_embedded_link(src, &value) {
      let Value::Link(src_link) = value else {
        unreachable!()
      };
      let dst_link = dst.create_embedded_in_dict(dst_table, dst_obj, dst_col, &key)?;
      tracker.track(src_link, dst_link);
      continue;
    }
    let converted = convert_value(src, dst, &value)?;
    if dst.dict_get(dst_table, dst_obj, dst_col, &key)?.as_ref() != Some(&converted) {
      dst.dict_insert(dst_table, dst_obj, dst_col, &key, converted)?;
    }
  }
  Ok(())
}

// ============================================================================
// Reset driver
// ============================================================================

/// Everything a reset needs beyond the two databases
pub struct ClientResetParams {
  pub mode: ClientResyncMode,
  /// Server-granted permission to replay local changes
  pub recovery_is_allowed: bool,
  /// Identity to install once the reset fully succeeds
  pub new_file_ident: FileIdent,
  /// Local version the server has already integrated; changesets after
  /// it are candidates for recovery
  pub recover_after_version: Version,
  pub recovery_directory: Option<std::path::PathBuf>,
  /// Flexible-sync hook: runs inside the first commit to mark the
  /// active subscription set complete. Its presence selects the
  /// two-stage commit protocol.
  pub flx_subscription_hook: Option<Box<dyn FnMut(&mut Transaction) -> Result<()> + Send>>,
}

/// Perform a client reset: install the fresh server state from
/// `db_remote` into `db_local`, optionally replaying local changes.
/// Returns whether local changes were recovered.
pub fn perform_client_reset_diff(
  db_local: &Arc<Db>,
  db_remote: &Arc<Db>,
  mut params: ClientResetParams,
) -> Result<bool> {
  assert!(params.mode != ClientResyncMode::Manual);
  info!(
    mode = %params.mode,
    recovery_is_allowed = params.recovery_is_allowed,
    ident = params.new_file_ident.ident,
    "client reset"
  );

  // Freeze the pre-reset state first: manual list copies and diagnostics
  // read from this snapshot.
  let pre_reset = {
    let read = db_local.begin_read(None)?;
    read.freeze()?
  };

  let mut wt_local = db_local.begin_write()?;
  let mode = reset_precheck_guard(&mut wt_local, params.mode, params.recovery_is_allowed)?;
  let recover_local =
    matches!(mode, ClientResyncMode::Recover | ClientResyncMode::RecoverOrDiscard);

  if let (Some(dir), Some(path)) = (params.recovery_directory.as_deref(), db_local.path()) {
    write_reset_manifest(dir, mode, path)?;
  }

  let local_changes = if recover_local {
    db_local.changesets_after(params.recover_after_version)
  } else {
    Vec::new()
  };
  debug!(count = local_changes.len(), "local changesets considered for recovery");

  let rt_remote = db_remote.begin_read(None)?;

  // Remote instructions must not be re-recorded as local uploads.
  wt_local.set_instruction_recording(false);
  let transfer = transfer_group(&rt_remote, &mut wt_local);
  wt_local.set_instruction_recording(true);
  transfer?;

  let two_stage = params.flx_subscription_hook.is_some() && recover_local;
  if let Some(hook) = params.flx_subscription_hook.as_mut() {
    hook(&mut wt_local)?;
  }

  if two_stage {
    // Stage one keeps the old file identity so that an interrupted
    // recovery restarts from the top instead of resuming half-applied.
    wt_local.commit_and_continue_as_read(true)?;
    let mut stage_two = db_local.begin_write()?;
    let recovered = {
      let mut applier = RecoveryApplier::new(&mut stage_two, &pre_reset);
      applier.process_changesets(&local_changes)?;
      true
    };
    stage_two.set_file_ident(params.new_file_ident)?;
    stage_two.commit()?;
    return Ok(recovered);
  }

  let recovered = if recover_local {
    let mut applier = RecoveryApplier::new(&mut wt_local, &pre_reset);
    applier.process_changesets(&local_changes)?;
    true
  } else {
    false
  };

  wt_local.set_file_ident(params.new_file_ident)?;
  wt_local.commit()?;
  Ok(recovered)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::DbOptions;

  fn mem_db() -> Arc<Db> {
    Db::open(DbOptions::in_memory()).unwrap()
  }

  #[test]
  fn track_and_read_pending_reset() {
    let db = mem_db();
    let mut tx = db.begin_write().unwrap();
    assert!(has_pending_reset(&tx).unwrap().is_none());
    track_reset(&mut tx, ClientResyncMode::Recover).unwrap();
    let pending = has_pending_reset(&tx).unwrap().unwrap();
    assert_eq!(pending.mode, ClientResyncMode::Recover);
    assert_eq!(remove_pending_client_resets(&mut tx).unwrap(), 1);
    assert!(has_pending_reset(&tx).unwrap().is_none());
  }

  #[test]
  fn discard_local_cycle_is_detected() {
    let db = mem_db();
    let mut tx = db.begin_write().unwrap();
    track_reset(&mut tx, ClientResyncMode::DiscardLocal).unwrap();
    let err = reset_precheck_guard(&mut tx, ClientResyncMode::DiscardLocal, true).unwrap_err();
    let TideError::ClientResetFailed(msg) = err else {
      panic!("expected ClientResetFailed");
    };
    assert!(msg.contains("DiscardLocal"), "{msg}");
    assert!(msg.contains("cycle"), "{msg}");
  }

  #[test]
  fn recover_then_recover_aborts_and_downgrades() {
    let db = mem_db();
    {
      let mut tx = db.begin_write().unwrap();
      track_reset(&mut tx, ClientResyncMode::Recover).unwrap();
      assert!(reset_precheck_guard(&mut tx, ClientResyncMode::Recover, true).is_err());
      tx.rollback().unwrap();
    }
    {
      let mut tx = db.begin_write().unwrap();
      track_reset(&mut tx, ClientResyncMode::Recover).unwrap();
      let mode = reset_precheck_guard(&mut tx, ClientResyncMode::RecoverOrDiscard, true).unwrap();
      assert_eq!(mode, ClientResyncMode::DiscardLocal);
    }
  }

  #[test]
  fn recovery_disallowed_downgrades_or_aborts() {
    let db = mem_db();
    {
      let mut tx = db.begin_write().unwrap();
      assert!(reset_precheck_guard(&mut tx, ClientResyncMode::Recover, false).is_err());
      tx.rollback().unwrap();
    }
    let mut tx = db.begin_write().unwrap();
    let mode = reset_precheck_guard(&mut tx, ClientResyncMode::RecoverOrDiscard, false).unwrap();
    assert_eq!(mode, ClientResyncMode::DiscardLocal);
  }
}
