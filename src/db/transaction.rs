//! Transactions
//!
//! A transaction is a read or write handle on the database at one
//! snapshot version. Read transactions pin their version; write
//! transactions additionally hold the per-file writer lock. Frozen
//! transactions pin a version forever and reject promotion.
//!
//! Every mutation flows through this type so that the object-level
//! change summary (for notifiers) and, on sync-enabled realms, the
//! instruction changeset (for upload and recovery) are recorded as a
//! side effect.

use std::sync::Arc;

use crate::db::group::{Field, Group, Parent, TableType};
use crate::db::history::ChangeSummary;
use crate::db::Db;
use crate::error::{Result, TideError};
use crate::sync::instruction::{
  Changeset, Instruction, PathElement, PathInstruction, Payload, PrimaryKey, TableSpec,
};
use crate::types::{
  CollectionKind, ColKey, DataType, FileIdent, ObjKey, ObjLink, TableKey, Value, Version,
};

// ============================================================================
// Stage
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStage {
  Reading,
  Writing,
  Frozen,
}

// ============================================================================
// Transaction
// ============================================================================

pub struct Transaction {
  db: Arc<Db>,
  stage: TransactionStage,
  version: Version,
  group: Group,
  /// Object-level changes recorded since the write began
  summary: ChangeSummary,
  /// Instruction stream recorded since the write began
  instructions: Vec<Instruction>,
  /// Cleared while a remote changeset is being applied
  record_instructions: bool,
  /// Unpin on drop; write transactions also release the writer lock
  finished: bool,
}

impl Transaction {
  pub(crate) fn new(db: Arc<Db>, stage: TransactionStage, version: Version, group: Group) -> Self {
    Self {
      db,
      stage,
      version,
      group,
      summary: ChangeSummary::default(),
      instructions: Vec::new(),
      record_instructions: true,
      finished: false,
    }
  }

  pub fn db(&self) -> &Arc<Db> {
    &self.db
  }

  pub fn stage(&self) -> TransactionStage {
    self.stage
  }

  pub fn version(&self) -> Version {
    self.version
  }

  pub fn is_frozen(&self) -> bool {
    self.stage == TransactionStage::Frozen
  }

  pub fn is_writing(&self) -> bool {
    self.stage == TransactionStage::Writing
  }

  pub fn group(&self) -> &Group {
    &self.group
  }

  /// Direct group access for engine-internal surgery (client reset)
  pub(crate) fn group_mut(&mut self) -> &mut Group {
    &mut self.group
  }

  pub fn change_summary(&self) -> &ChangeSummary {
    &self.summary
  }

  /// Suspend or resume instruction recording (remote changesets are
  /// applied without re-recording themselves)
  pub(crate) fn set_instruction_recording(&mut self, on: bool) {
    self.record_instructions = on;
  }

  fn require_writing(&self) -> Result<()> {
    match self.stage {
      TransactionStage::Writing => Ok(()),
      TransactionStage::Frozen => Err(TideError::LogicError(
        "cannot mutate a frozen transaction".into(),
      )),
      TransactionStage::Reading => Err(TideError::LogicError(
        "cannot mutate outside a write transaction".into(),
      )),
    }
  }

  fn record(&mut self, instr: Instruction) {
    if self.record_instructions && self.db.sync_history_enabled() {
      self.instructions.push(instr);
    }
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Commit and return the new version, consuming the handle
  pub fn commit(mut self) -> Result<Version> {
    // The handle continues as a read transaction at the new version and
    // unpins it on drop.
    self.commit_and_continue_as_read(true)
  }

  /// Commit, then continue as a read transaction at the new version
  pub fn commit_and_continue_as_read(&mut self, to_disk: bool) -> Result<Version> {
    self.require_writing()?;
    let version = self.commit_internal(to_disk)?;
    self.stage = TransactionStage::Reading;
    self.version = version;
    Ok(version)
  }

  fn commit_internal(&mut self, to_disk: bool) -> Result<Version> {
    let summary = std::mem::take(&mut self.summary);
    let instructions = std::mem::take(&mut self.instructions);
    let changeset = if self.db.sync_history_enabled() {
      let cs = Changeset {
        version: self.version + 1,
        last_integrated_remote_version: self.db.last_integrated_remote_version(),
        origin_file_ident: self.group.file_ident.ident,
        origin_timestamp: 0,
        instructions,
      };
      Some(cs.encode())
    } else {
      None
    };
    let version = self
      .db
      .clone()
      .commit_transaction(self, summary, changeset, to_disk)?;
    Ok(version)
  }

  /// Roll back a write transaction, discarding all buffered changes
  pub fn rollback(mut self) -> Result<()> {
    self.require_writing()?;
    self.finished = true;
    self.db.clone().rollback_transaction(self.version);
    Ok(())
  }

  /// Clone this read transaction at the same version (skip-version use)
  pub fn duplicate(&self) -> Result<Transaction> {
    if self.is_writing() {
      return Err(TideError::LogicError(
        "cannot duplicate a write transaction".into(),
      ));
    }
    self.db.clone().begin_read_at(self.version, self.stage)
  }

  /// Pin this transaction's version in a frozen handle
  pub fn freeze(&self) -> Result<Transaction> {
    self
      .db
      .clone()
      .begin_read_at(self.version, TransactionStage::Frozen)
  }

  /// Re-decode the graph at `target`, which must not be older than the
  /// current version. Returns true if the version changed.
  pub fn advance_to(&mut self, target: Version) -> Result<bool> {
    if self.is_writing() {
      return Err(TideError::LogicError(
        "cannot advance a write transaction".into(),
      ));
    }
    if self.is_frozen() {
      return Err(TideError::LogicError(
        "cannot advance a frozen transaction".into(),
      ));
    }
    if target < self.version {
      return Err(TideError::LogicError(format!(
        "cannot advance backwards from version {} to {target}",
        self.version
      )));
    }
    if target == self.version {
      return Ok(false);
    }
    // The target may have been pruned by a concurrent commit; in that
    // case the advance lands on the newer latest version instead.
    let (version, group) = self.db.pin_and_read(target)?;
    self.db.unpin(self.version);
    self.version = version;
    self.group = group;
    Ok(true)
  }

  /// Advance to the latest committed version
  pub fn refresh(&mut self) -> Result<bool> {
    self.advance_to(self.db.latest_version())
  }

  // ==========================================================================
  // Schema operations
  // ==========================================================================

  pub fn add_table(&mut self, name: &str) -> Result<TableKey> {
    self.require_writing()?;
    let key = self.group.add_table(name, TableType::TopLevel)?;
    self.summary.record_schema_change();
    self.record(Instruction::AddTable {
      table: name.to_string(),
      spec: TableSpec::GlobalKey,
    });
    Ok(key)
  }

  pub fn add_embedded_table(&mut self, name: &str) -> Result<TableKey> {
    self.require_writing()?;
    let key = self.group.add_table(name, TableType::Embedded)?;
    self.summary.record_schema_change();
    self.record(Instruction::AddTable {
      table: name.to_string(),
      spec: TableSpec::Embedded,
    });
    Ok(key)
  }

  pub fn add_table_with_primary_key(
    &mut self,
    name: &str,
    pk_type: DataType,
    pk_field: &str,
    nullable: bool,
  ) -> Result<TableKey> {
    self.require_writing()?;
    let key = self
      .group
      .add_table_with_primary_key(name, pk_type, pk_field, nullable)?;
    self.summary.record_schema_change();
    self.record(Instruction::AddTable {
      table: name.to_string(),
      spec: TableSpec::PrimaryKey {
        field: pk_field.to_string(),
        key_type: pk_type,
        nullable,
      },
    });
    Ok(key)
  }

  pub fn erase_table(&mut self, name: &str) -> Result<()> {
    self.require_writing()?;
    let key = self
      .group
      .key_of(name)
      .ok_or_else(|| TideError::LogicError(format!("table '{name}' does not exist")))?;
    self.group.erase_table(key)?;
    self.summary.record_schema_change();
    self.record(Instruction::EraseTable {
      table: name.to_string(),
    });
    Ok(())
  }

  pub fn add_column(
    &mut self,
    table: TableKey,
    field: &str,
    data_type: DataType,
    nullable: bool,
    collection: CollectionKind,
    link_target: Option<&str>,
  ) -> Result<ColKey> {
    self.require_writing()?;
    let table_name = self.table_name(table)?;
    let t = self
      .group
      .table_mut(table)
      .ok_or_else(|| TideError::LogicError(format!("no table {table}")))?;
    let key = t.add_column(
      field,
      data_type,
      nullable,
      collection,
      link_target.map(str::to_string),
    )?;
    self.summary.record_schema_change();
    self.record(Instruction::AddColumn {
      table: table_name,
      field: field.to_string(),
      data_type,
      nullable,
      collection,
      link_target: link_target.map(str::to_string),
    });
    Ok(key)
  }

  pub fn erase_column(&mut self, table: TableKey, field: &str) -> Result<()> {
    self.require_writing()?;
    let table_name = self.table_name(table)?;
    let t = self
      .group
      .table_mut(table)
      .ok_or_else(|| TideError::LogicError(format!("no table {table}")))?;
    let key = t
      .column_by_name(field)
      .ok_or_else(|| {
        TideError::LogicError(format!("no column '{field}' in '{table_name}'"))
      })?
      .key;
    t.erase_column(key)?;
    self.summary.record_schema_change();
    self.record(Instruction::EraseColumn {
      table: table_name,
      field: field.to_string(),
    });
    Ok(())
  }

  // ==========================================================================
  // Object operations
  // ==========================================================================

  pub fn create_object(&mut self, table: TableKey) -> Result<ObjKey> {
    self.require_writing()?;
    let table_name = self.table_name(table)?;
    let t = self
      .group
      .table_mut(table)
      .ok_or_else(|| TideError::LogicError(format!("no table {table}")))?;
    if t.pk.is_some() {
      return Err(TideError::LogicError(format!(
        "table '{table_name}' requires a primary key"
      )));
    }
    let key = t.create_object();
    self.summary.record_insert(table, key);
    self.record(Instruction::CreateObject {
      table: table_name,
      object: PrimaryKey::GlobalKey(key.0),
    });
    Ok(key)
  }

  /// Create an object under a replicated global key
  pub(crate) fn create_object_with_global_key(
    &mut self,
    table: TableKey,
    key: ObjKey,
  ) -> Result<bool> {
    self.require_writing()?;
    let table_name = self.table_name(table)?;
    let t = self
      .group
      .table_mut(table)
      .ok_or_else(|| TideError::LogicError(format!("no table {table}")))?;
    let created = t.create_object_with_key(key);
    if created {
      self.summary.record_insert(table, key);
      self.record(Instruction::CreateObject {
        table: table_name,
        object: PrimaryKey::GlobalKey(key.0),
      });
    }
    Ok(created)
  }

  pub fn create_object_with_pk(&mut self, table: TableKey, pk: Value) -> Result<(ObjKey, bool)> {
    self.require_writing()?;
    let table_name = self.table_name(table)?;
    {
      let t = self
        .group
        .table(table)
        .ok_or_else(|| TideError::LogicError(format!("no table {table}")))?;
      let spec = t.pk.as_ref().ok_or_else(|| {
        TideError::LogicError(format!("table '{table_name}' has no primary key column"))
      })?;
      if pk.is_null() {
        if !spec.nullable {
          return Err(TideError::LogicError(format!(
            "null primary key on non-nullable pk column of '{table_name}'"
          )));
        }
      } else if pk.data_type() != Some(spec.data_type) {
        return Err(TideError::LogicError(format!(
          "primary key type mismatch on '{table_name}': expected {}, got {}",
          spec.data_type,
          pk.data_type().map(|t| t.to_string()).unwrap_or_else(|| "?".into())
        )));
      }
    }
    let instr_pk = match &pk {
      Value::Null => PrimaryKey::Null,
      Value::Int(v) => PrimaryKey::Int(*v),
      Value::String(v) => PrimaryKey::String(v.clone()),
      Value::ObjectId(v) => PrimaryKey::ObjectId(*v),
      Value::Uuid(v) => PrimaryKey::Uuid(*v),
      other => {
        return Err(TideError::LogicError(format!(
          "value {other} is not usable as a primary key"
        )));
      }
    };
    let (key, created) = self
      .group
      .table_mut(table)
      .expect("checked above")
      .create_object_with_pk(pk)?;
    if created {
      self.summary.record_insert(table, key);
      self.record(Instruction::CreateObject {
        table: table_name,
        object: instr_pk,
      });
    }
    Ok((key, created))
  }

  /// Remove an object; missing objects are a no-op (idempotent)
  pub fn erase_object(&mut self, table: TableKey, obj: ObjKey) -> Result<bool> {
    self.require_writing()?;
    let table_name = self.table_name(table)?;
    let pk = self.pk_of(table, obj);
    let removed = self.group.remove_object(table, obj)?;
    if removed {
      self.summary.record_delete(table, obj);
      if let Some(pk) = pk {
        self.record(Instruction::EraseObject {
          table: table_name,
          object: pk,
        });
      }
    }
    Ok(removed)
  }

  /// Instruction-level identity of an object
  pub fn pk_of(&self, table: TableKey, obj: ObjKey) -> Option<PrimaryKey> {
    let t = self.group.table(table)?;
    let o = t.get(obj)?;
    if t.pk.is_none() {
      return Some(PrimaryKey::GlobalKey(obj.0));
    }
    match &o.pk {
      Value::Null => Some(PrimaryKey::Null),
      Value::Int(v) => Some(PrimaryKey::Int(*v)),
      Value::String(v) => Some(PrimaryKey::String(v.clone())),
      Value::ObjectId(v) => Some(PrimaryKey::ObjectId(*v)),
      Value::Uuid(v) => Some(PrimaryKey::Uuid(*v)),
      _ => None,
    }
  }

  fn table_name(&self, table: TableKey) -> Result<String> {
    self
      .group
      .table(table)
      .map(|t| t.name.clone())
      .ok_or_else(|| TideError::LogicError(format!("no table {table}")))
  }

  // ==========================================================================
  // Field access
  // ==========================================================================

  fn check_value(&self, table: TableKey, col: ColKey, value: &Value) -> Result<()> {
    let t = self
      .group
      .table(table)
      .ok_or_else(|| TideError::LogicError(format!("no table {table}")))?;
    let spec = t
      .column(col)
      .ok_or_else(|| TideError::LogicError(format!("no column {col} in '{}'", t.name)))?;
    if value.is_null() {
      if spec.nullable || spec.data_type == DataType::Mixed {
        return Ok(());
      }
      return Err(TideError::LogicError(format!(
        "null in non-nullable field '{}.{}'",
        t.name, spec.name
      )));
    }
    if spec.data_type == DataType::Mixed {
      return Ok(());
    }
    if value.data_type() != Some(spec.data_type) {
      return Err(TideError::LogicError(format!(
        "type mismatch in '{}.{}': expected {}, got {}",
        t.name,
        spec.name,
        spec.data_type,
        value.data_type().map(|t| t.to_string()).unwrap_or_else(|| "null".into())
      )));
    }
    if let Value::Link(link) = value {
      let target_name = spec.target.as_deref().ok_or_else(|| {
        TideError::LogicError(format!("column '{}.{}' has no link target", t.name, spec.name))
      })?;
      let target_key = self.group.key_of(target_name).ok_or_else(|| {
        TideError::LogicError(format!("link target table '{target_name}' missing"))
      })?;
      if link.table != target_key {
        return Err(TideError::LogicError(format!(
          "link target mismatch on '{}.{}'",
          t.name, spec.name
        )));
      }
    }
    Ok(())
  }

  fn field_mut(&mut self, table: TableKey, obj: ObjKey, col: ColKey) -> Result<&mut Field> {
    let kind = {
      let t = self
        .group
        .table(table)
        .ok_or_else(|| TideError::LogicError(format!("no table {table}")))?;
      if t.get(obj).is_none() {
        return Err(TideError::LogicError(format!(
          "no object {obj} in '{}'",
          t.name
        )));
      }
      t.column(col)
        .ok_or_else(|| TideError::LogicError(format!("no column {col} in '{}'", t.name)))?
        .collection
    };
    let t = self.group.table_mut(table).expect("checked above");
    let o = t.get_mut(obj).expect("checked above");
    Ok(o.fields.entry(col).or_insert_with(|| Field::empty_for(kind)))
  }

  /// Current value of a single-valued field (Null when never written)
  pub fn get_value(&self, table: TableKey, obj: ObjKey, col: ColKey) -> Result<Value> {
    let t = self
      .group
      .table(table)
      .ok_or_else(|| TideError::LogicError(format!("no table {table}")))?;
    let o = t
      .get(obj)
      .ok_or_else(|| TideError::LogicError(format!("no object {obj} in '{}'", t.name)))?;
    match o.fields.get(&col) {
      Some(Field::Single(v)) => Ok(v.clone()),
      Some(_) => Err(TideError::LogicError(format!(
        "field {col} of '{}' is a collection",
        t.name
      ))),
      None => Ok(Value::Null),
    }
  }

  /// The payload form of a stored value (links become pk references)
  fn value_to_payload(&self, value: &Value) -> Payload {
    match value {
      Value::Null => Payload::Null,
      Value::Int(v) => Payload::Int(*v),
      Value::Bool(v) => Payload::Bool(*v),
      Value::String(v) => Payload::String(v.clone()),
      Value::Binary(v) => Payload::Binary(v.clone()),
      Value::Float(v) => Payload::Float(*v),
      Value::Double(v) => Payload::Double(*v),
      Value::Timestamp(v) => Payload::Timestamp(*v),
      Value::ObjectId(v) => Payload::ObjectId(*v),
      Value::Uuid(v) => Payload::Uuid(*v),
      Value::Link(link) => {
        let target_table = self
          .group
          .table(link.table)
          .map(|t| t.name.clone())
          .unwrap_or_default();
        let target = self
          .pk_of(link.table, link.obj)
          .unwrap_or(PrimaryKey::GlobalKey(link.obj.0));
        Payload::Link {
          target_table,
          target,
        }
      }
    }
  }

  /// Build the sync path of `(table, obj).field`, walking embedded
  /// parents up to a top-level object.
  fn path_to(&self, table: TableKey, obj: ObjKey, field: &str) -> Result<PathInstruction> {
    let mut elements: Vec<PathElement> = vec![];
    let mut cur_table = table;
    let mut cur_obj = obj;

    loop {
      let t = self
        .group
        .table(cur_table)
        .ok_or_else(|| TideError::LogicError(format!("no table {cur_table}")))?;
      let o = t
        .get(cur_obj)
        .ok_or_else(|| TideError::LogicError(format!("no object {cur_obj}")))?;
      let Some(parent) = o.parent else {
        let mut path = PathInstruction {
          table: t.name.clone(),
          object: self
            .pk_of(cur_table, cur_obj)
            .unwrap_or(PrimaryKey::GlobalKey(cur_obj.0)),
          field: String::new(),
          path: vec![],
        };
        elements.reverse();
        // The first element is the top-level field name.
        match elements.first() {
          Some(PathElement::Field(name)) => {
            path.field = name.clone();
            path.path = elements[1..].to_vec();
          }
          _ => {
            path.field = field.to_string();
            path.path = elements;
          }
        }
        if cur_table != table {
          path.path.push(PathElement::Field(field.to_string()));
        }
        return Ok(path);
      };

      // Locate this object's position inside its parent field.
      let parent_table = self
        .group
        .table(parent.table)
        .ok_or_else(|| TideError::LogicError("embedded parent table missing".into()))?;
      let parent_obj = parent_table
        .get(parent.obj)
        .ok_or_else(|| TideError::LogicError("embedded parent object missing".into()))?;
      let col_name = parent_table
        .column(parent.col)
        .map(|c| c.name.clone())
        .unwrap_or_default();
      let me = ObjLink {
        table: cur_table,
        obj: cur_obj,
      };
      match parent_obj.fields.get(&parent.col) {
        Some(Field::List(vs)) => {
          let idx = vs
            .iter()
            .position(|v| *v == Value::Link(me))
            .ok_or_else(|| TideError::LogicError("embedded object not in parent list".into()))?;
          elements.push(PathElement::Index(idx as u32));
          elements.push(PathElement::Field(col_name));
        }
        Some(Field::Dict(map)) => {
          let key = map
            .iter()
            .find(|(_, v)| **v == Value::Link(me))
            .map(|(k, _)| k.clone())
            .ok_or_else(|| {
              TideError::LogicError("embedded object not in parent dictionary".into())
            })?;
          elements.push(PathElement::Key(key));
          elements.push(PathElement::Field(col_name));
        }
        _ => {
          elements.push(PathElement::Field(col_name));
        }
      }
      cur_table = parent.table;
      cur_obj = parent.obj;
    }
  }

  /// Set a single-valued field
  pub fn set_value(&mut self, table: TableKey, obj: ObjKey, col: ColKey, value: Value) -> Result<()> {
    self.require_writing()?;
    self.check_value(table, col, &value)?;
    let (field_name, collection) = self
      .group
      .table(table)
      .and_then(|t| t.column(col))
      .map(|c| (c.name.clone(), c.collection))
      .unwrap_or_default();
    if collection != CollectionKind::Single {
      return Err(TideError::LogicError(format!(
        "field '{field_name}' is a {collection}, not a plain value"
      )));
    }
    let payload = self.value_to_payload(&value);
    let path = self.path_to(table, obj, &field_name)?;
    {
      let slot = self.field_mut(table, obj, col)?;
      *slot = Field::Single(value);
    }
    self.summary.record_modify(table, obj, col);
    self.record(Instruction::Update {
      path,
      value: payload,
      is_default: false,
    });
    Ok(())
  }

  /// Add to an integer field in place
  pub fn add_integer(&mut self, table: TableKey, obj: ObjKey, col: ColKey, delta: i64) -> Result<()> {
    self.require_writing()?;
    let current = self.get_value(table, obj, col)?;
    let base = match current {
      Value::Int(v) => v,
      Value::Null => {
        return Err(TideError::LogicError(
          "AddInteger on a null value".into(),
        ));
      }
      other => {
        return Err(TideError::LogicError(format!(
          "AddInteger on non-integer value {other}"
        )));
      }
    };
    let field_name = self
      .group
      .table(table)
      .and_then(|t| t.column(col))
      .map(|c| c.name.clone())
      .unwrap_or_default();
    let path = self.path_to(table, obj, &field_name)?;
    {
      let slot = self.field_mut(table, obj, col)?;
      *slot = Field::Single(Value::Int(base.wrapping_add(delta)));
    }
    self.summary.record_modify(table, obj, col);
    self.record(Instruction::AddInteger { path, value: delta });
    Ok(())
  }

  // ==========================================================================
  // Lists
  // ==========================================================================

  pub fn list_size(&self, table: TableKey, obj: ObjKey, col: ColKey) -> Result<usize> {
    let t = self
      .group
      .table(table)
      .ok_or_else(|| TideError::LogicError(format!("no table {table}")))?;
    match t.get(obj).and_then(|o| o.fields.get(&col)) {
      Some(Field::List(vs)) => Ok(vs.len()),
      None => Ok(0),
      Some(_) => Err(TideError::LogicError("field is not a list".into())),
    }
  }

  pub fn list_get(&self, table: TableKey, obj: ObjKey, col: ColKey, index: usize) -> Result<Value> {
    let t = self
      .group
      .table(table)
      .ok_or_else(|| TideError::LogicError(format!("no table {table}")))?;
    match t.get(obj).and_then(|o| o.fields.get(&col)) {
      Some(Field::List(vs)) => vs
        .get(index)
        .cloned()
        .ok_or_else(|| TideError::LogicError(format!("list index {index} out of bounds"))),
      _ => Err(TideError::LogicError("field is not a list".into())),
    }
  }

  pub fn list_insert(
    &mut self,
    table: TableKey,
    obj: ObjKey,
    col: ColKey,
    index: usize,
    value: Value,
  ) -> Result<()> {
    self.require_writing()?;
    self.check_value(table, col, &value)?;
    let field_name = self
      .group
      .table(table)
      .and_then(|t| t.column(col))
      .map(|c| c.name.clone())
      .unwrap_or_default();
    let payload = self.value_to_payload(&value);
    let path = self.path_to(table, obj, &field_name)?;
    let prior_size = {
      let slot = self.field_mut(table, obj, col)?;
      let Field::List(vs) = slot else {
        return Err(TideError::LogicError("field is not a list".into()));
      };
      if index > vs.len() {
        return Err(TideError::LogicError(format!(
          "list insert index {index} beyond size {}",
          vs.len()
        )));
      }
      let prior = vs.len();
      vs.insert(index, value);
      prior
    };
    self.summary.record_modify(table, obj, col);
    self.record(Instruction::ArrayInsert {
      path,
      index: index as u32,
      value: payload,
      prior_size: prior_size as u32,
    });
    Ok(())
  }

  pub fn list_set(
    &mut self,
    table: TableKey,
    obj: ObjKey,
    col: ColKey,
    index: usize,
    value: Value,
  ) -> Result<()> {
    self.require_writing()?;
    self.check_value(table, col, &value)?;
    let field_name = self
      .group
      .table(table)
      .and_then(|t| t.column(col))
      .map(|c| c.name.clone())
      .unwrap_or_default();
    let payload = self.value_to_payload(&value);
    let mut path = self.path_to(table, obj, &field_name)?;
    {
      let slot = self.field_mut(table, obj, col)?;
      let Field::List(vs) = slot else {
        return Err(TideError::LogicError("field is not a list".into()));
      };
      let Some(slot) = vs.get_mut(index) else {
        return Err(TideError::LogicError(format!(
          "list index {index} out of bounds"
        )));
      };
      *slot = value;
    }
    path.path.push(PathElement::Index(index as u32));
    self.summary.record_modify(table, obj, col);
    self.record(Instruction::Update {
      path,
      value: payload,
      is_default: false,
    });
    Ok(())
  }

  pub fn list_move(
    &mut self,
    table: TableKey,
    obj: ObjKey,
    col: ColKey,
    from: usize,
    to: usize,
  ) -> Result<()> {
    self.require_writing()?;
    let field_name = self
      .group
      .table(table)
      .and_then(|t| t.column(col))
      .map(|c| c.name.clone())
      .unwrap_or_default();
    let path = self.path_to(table, obj, &field_name)?;
    let prior_size = {
      let slot = self.field_mut(table, obj, col)?;
      let Field::List(vs) = slot else {
        return Err(TideError::LogicError("field is not a list".into()));
      };
      if from >= vs.len() || to >= vs.len() {
        return Err(TideError::LogicError("list move out of bounds".into()));
      }
      let v = vs.remove(from);
      vs.insert(to, v);
      vs.len()
    };
    self.summary.record_modify(table, obj, col);
    self.record(Instruction::ArrayMove {
      path,
      from: from as u32,
      to: to as u32,
      prior_size: prior_size as u32,
    });
    Ok(())
  }

  pub fn list_erase(&mut self, table: TableKey, obj: ObjKey, col: ColKey, index: usize) -> Result<()> {
    self.require_writing()?;
    let field_name = self
      .group
      .table(table)
      .and_then(|t| t.column(col))
      .map(|c| c.name.clone())
      .unwrap_or_default();
    let path = self.path_to(table, obj, &field_name)?;
    let (prior_size, removed) = {
      let slot = self.field_mut(table, obj, col)?;
      let Field::List(vs) = slot else {
        return Err(TideError::LogicError("field is not a list".into()));
      };
      if index >= vs.len() {
        return Err(TideError::LogicError(format!(
          "list erase index {index} out of bounds"
        )));
      }
      let prior = vs.len();
      (prior, vs.remove(index))
    };
    // Erasing an embedded link removes the owned object as well.
    if let Value::Link(link) = removed {
      if self
        .group
        .table(link.table)
        .is_some_and(|t| t.is_embedded())
      {
        self.group.remove_object(link.table, link.obj)?;
      }
    }
    self.summary.record_modify(table, obj, col);
    self.record(Instruction::ArrayErase {
      path,
      index: index as u32,
      prior_size: prior_size as u32,
    });
    Ok(())
  }

  /// Clear any collection field
  pub fn clear_collection(&mut self, table: TableKey, obj: ObjKey, col: ColKey) -> Result<()> {
    self.require_writing()?;
    let field_name = self
      .group
      .table(table)
      .and_then(|t| t.column(col))
      .map(|c| c.name.clone())
      .unwrap_or_default();
    let path = self.path_to(table, obj, &field_name)?;
    let removed_links: Vec<ObjLink> = {
      let slot = self.field_mut(table, obj, col)?;
      let values: Vec<Value> = match slot {
        Field::List(vs) | Field::Set(vs) => std::mem::take(vs),
        Field::Dict(map) => std::mem::take(map).into_values().collect(),
        Field::Single(_) => {
          return Err(TideError::LogicError("field is not a collection".into()));
        }
      };
      values
        .into_iter()
        .filter_map(|v| match v {
          Value::Link(l) => Some(l),
          _ => None,
        })
        .collect()
    };
    for link in removed_links {
      if self
        .group
        .table(link.table)
        .is_some_and(|t| t.is_embedded())
      {
        self.group.remove_object(link.table, link.obj)?;
      }
    }
    self.summary.record_modify(table, obj, col);
    self.record(Instruction::Clear { path });
    Ok(())
  }

  // ==========================================================================
  // Sets
  // ==========================================================================

  pub fn set_insert(&mut self, table: TableKey, obj: ObjKey, col: ColKey, value: Value) -> Result<bool> {
    self.require_writing()?;
    self.check_value(table, col, &value)?;
    let field_name = self
      .group
      .table(table)
      .and_then(|t| t.column(col))
      .map(|c| c.name.clone())
      .unwrap_or_default();
    let payload = self.value_to_payload(&value);
    let path = self.path_to(table, obj, &field_name)?;
    let inserted = {
      let slot = self.field_mut(table, obj, col)?;
      let Field::Set(vs) = slot else {
        return Err(TideError::LogicError("field is not a set".into()));
      };
      match vs.binary_search_by(|v| v.total_cmp(&value)) {
        Ok(_) => false,
        Err(pos) => {
          vs.insert(pos, value);
          true
        }
      }
    };
    if inserted {
      self.summary.record_modify(table, obj, col);
      self.record(Instruction::SetInsert {
        path,
        value: payload,
      });
    }
    Ok(inserted)
  }

  pub fn set_erase(&mut self, table: TableKey, obj: ObjKey, col: ColKey, value: Value) -> Result<bool> {
    self.require_writing()?;
    let field_name = self
      .group
      .table(table)
      .and_then(|t| t.column(col))
      .map(|c| c.name.clone())
      .unwrap_or_default();
    let payload = self.value_to_payload(&value);
    let path = self.path_to(table, obj, &field_name)?;
    let erased = {
      let slot = self.field_mut(table, obj, col)?;
      let Field::Set(vs) = slot else {
        return Err(TideError::LogicError("field is not a set".into()));
      };
      match vs.binary_search_by(|v| v.total_cmp(&value)) {
        Ok(pos) => {
          vs.remove(pos);
          true
        }
        Err(_) => false,
      }
    };
    if erased {
      self.summary.record_modify(table, obj, col);
      self.record(Instruction::SetErase {
        path,
        value: payload,
      });
    }
    Ok(erased)
  }

  // ==========================================================================
  // Dictionaries
  // ==========================================================================

  pub fn dict_get(&self, table: TableKey, obj: ObjKey, col: ColKey, key: &str) -> Result<Option<Value>> {
    let t = self
      .group
      .table(table)
      .ok_or_else(|| TideError::LogicError(format!("no table {table}")))?;
    match t.get(obj).and_then(|o| o.fields.get(&col)) {
      Some(Field::Dict(map)) => Ok(map.get(key).cloned()),
      None => Ok(None),
      Some(_) => Err(TideError::LogicError("field is not a dictionary".into())),
    }
  }

  /// Insert-or-assign a dictionary entry
  pub fn dict_insert(
    &mut self,
    table: TableKey,
    obj: ObjKey,
    col: ColKey,
    key: &str,
    value: Value,
  ) -> Result<()> {
    self.require_writing()?;
    self.check_value(table, col, &value)?;
    let field_name = self
      .group
      .table(table)
      .and_then(|t| t.column(col))
      .map(|c| c.name.clone())
      .unwrap_or_default();
    let payload = self.value_to_payload(&value);
    let mut path = self.path_to(table, obj, &field_name)?;
    let replaced = {
      let slot = self.field_mut(table, obj, col)?;
      let Field::Dict(map) = slot else {
        return Err(TideError::LogicError("field is not a dictionary".into()));
      };
      map.insert(key.to_string(), value)
    };
    // Replacing an embedded link drops the owned object.
    if let Some(Value::Link(link)) = replaced {
      if self
        .group
        .table(link.table)
        .is_some_and(|t| t.is_embedded())
      {
        self.group.remove_object(link.table, link.obj)?;
      }
    }
    path.path.push(PathElement::Key(key.to_string()));
    self.summary.record_modify(table, obj, col);
    self.record(Instruction::Update {
      path,
      value: payload,
      is_default: false,
    });
    Ok(())
  }

  pub fn dict_erase(&mut self, table: TableKey, obj: ObjKey, col: ColKey, key: &str) -> Result<bool> {
    self.require_writing()?;
    let field_name = self
      .group
      .table(table)
      .and_then(|t| t.column(col))
      .map(|c| c.name.clone())
      .unwrap_or_default();
    let mut path = self.path_to(table, obj, &field_name)?;
    let removed = {
      let slot = self.field_mut(table, obj, col)?;
      let Field::Dict(map) = slot else {
        return Err(TideError::LogicError("field is not a dictionary".into()));
      };
      map.remove(key)
    };
    let Some(removed) = removed else {
      return Ok(false);
    };
    if let Value::Link(link) = removed {
      if self
        .group
        .table(link.table)
        .is_some_and(|t| t.is_embedded())
      {
        self.group.remove_object(link.table, link.obj)?;
      }
    }
    path.path.push(PathElement::Key(key.to_string()));
    self.summary.record_modify(table, obj, col);
    self.record(Instruction::Update {
      path,
      value: Payload::Erased,
      is_default: false,
    });
    Ok(true)
  }

  // ==========================================================================
  // Embedded objects
  // ==========================================================================

  /// Create an embedded object behind a single link field
  pub fn create_embedded(&mut self, table: TableKey, obj: ObjKey, col: ColKey) -> Result<ObjLink> {
    self.require_writing()?;
    let (target_key, field_name) = self.embedded_target(table, col)?;
    let link = self.group.create_embedded(
      target_key,
      Parent {
        table,
        obj,
        col,
      },
    )?;
    {
      let slot = self.field_mut(table, obj, col)?;
      *slot = Field::Single(Value::Link(link));
    }
    self.summary.record_modify(table, obj, col);
    self.summary.record_insert(target_key, link.obj);
    let path = self.path_to(table, obj, &field_name)?;
    self.record(Instruction::Update {
      path,
      value: Payload::ObjectValue,
      is_default: false,
    });
    Ok(link)
  }

  /// Insert an embedded object into a list of embedded links
  pub fn create_embedded_in_list(
    &mut self,
    table: TableKey,
    obj: ObjKey,
    col: ColKey,
    index: usize,
  ) -> Result<ObjLink> {
    self.require_writing()?;
    let (target_key, field_name) = self.embedded_target(table, col)?;
    let link = self.group.create_embedded(
      target_key,
      Parent {
        table,
        obj,
        col,
      },
    )?;
    let path = self.path_to(table, obj, &field_name)?;
    let prior_size = {
      let slot = self.field_mut(table, obj, col)?;
      let Field::List(vs) = slot else {
        return Err(TideError::LogicError("field is not a list".into()));
      };
      if index > vs.len() {
        return Err(TideError::LogicError(format!(
          "list insert index {index} beyond size {}",
          vs.len()
        )));
      }
      let prior = vs.len();
      vs.insert(index, Value::Link(link));
      prior
    };
    self.summary.record_modify(table, obj, col);
    self.summary.record_insert(target_key, link.obj);
    self.record(Instruction::ArrayInsert {
      path,
      index: index as u32,
      value: Payload::ObjectValue,
      prior_size: prior_size as u32,
    });
    Ok(link)
  }

  /// Insert an embedded object under a dictionary key
  pub fn create_embedded_in_dict(
    &mut self,
    table: TableKey,
    obj: ObjKey,
    col: ColKey,
    key: &str,
  ) -> Result<ObjLink> {
    self.require_writing()?;
    let (target_key, field_name) = self.embedded_target(table, col)?;
    let link = self.group.create_embedded(
      target_key,
      Parent {
        table,
        obj,
        col,
      },
    )?;
    let mut path = self.path_to(table, obj, &field_name)?;
    let replaced = {
      let slot = self.field_mut(table, obj, col)?;
      let Field::Dict(map) = slot else {
        return Err(TideError::LogicError("field is not a dictionary".into()));
      };
      map.insert(key.to_string(), Value::Link(link))
    };
    if let Some(Value::Link(old)) = replaced {
      if self.group.table(old.table).is_some_and(|t| t.is_embedded()) {
        self.group.remove_object(old.table, old.obj)?;
      }
    }
    path.path.push(PathElement::Key(key.to_string()));
    self.summary.record_modify(table, obj, col);
    self.summary.record_insert(target_key, link.obj);
    self.record(Instruction::Update {
      path,
      value: Payload::ObjectValue,
      is_default: false,
    });
    Ok(link)
  }

  fn embedded_target(&self, table: TableKey, col: ColKey) -> Result<(TableKey, String)> {
    let t = self
      .group
      .table(table)
      .ok_or_else(|| TideError::LogicError(format!("no table {table}")))?;
    let spec = t
      .column(col)
      .ok_or_else(|| TideError::LogicError(format!("no column {col} in '{}'", t.name)))?;
    let target_name = spec.target.as_deref().ok_or_else(|| {
      TideError::LogicError(format!("column '{}.{}' is not a link", t.name, spec.name))
    })?;
    let target = self
      .group
      .key_of(target_name)
      .ok_or_else(|| TideError::LogicError(format!("no table '{target_name}'")))?;
    if !self.group.table(target).is_some_and(|t| t.is_embedded()) {
      return Err(TideError::LogicError(format!(
        "table '{target_name}' is not embedded"
      )));
    }
    Ok((target, spec.name.clone()))
  }

  // ==========================================================================
  // Sync identity
  // ==========================================================================

  pub fn file_ident(&self) -> FileIdent {
    self.group.file_ident
  }

  pub fn set_file_ident(&mut self, ident: FileIdent) -> Result<()> {
    self.require_writing()?;
    self.group.file_ident = ident;
    // The root is rewritten on every commit, no table is dirtied.
    Ok(())
  }
}

impl Drop for Transaction {
  fn drop(&mut self) {
    if self.finished {
      return;
    }
    match self.stage {
      TransactionStage::Writing => self.db.rollback_transaction(self.version),
      TransactionStage::Reading | TransactionStage::Frozen => self.db.unpin(self.version),
    }
  }
}
