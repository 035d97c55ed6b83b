//! Sync instruction applier
//!
//! Interprets a parsed changeset, instruction by instruction, against an
//! open write transaction. Path and type validation failures surface as
//! `BadChangeset` with the exact table/field and the expected and found
//! types; the transaction is left as-is up to the failing instruction.

use tracing::trace;

use crate::db::transaction::Transaction;
use crate::error::{Result, TideError};
use crate::sync::instruction::{
  Changeset, Instruction, PathElement, PathInstruction, Payload, PrimaryKey, TableSpec,
};
use crate::types::{CollectionKind, ColKey, DataType, ObjKey, TableKey, Value};

fn bad(msg: impl Into<String>) -> TideError {
  TideError::BadChangeset(msg.into())
}

// ============================================================================
// Resolved positions
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Target {
  table: TableKey,
  obj: ObjKey,
  col: ColKey,
}

#[derive(Debug, Clone)]
enum Position {
  /// A plain object field
  Field(Target),
  /// One list slot
  ListIndex(Target, u32),
  /// One dictionary entry (which may not exist yet)
  DictKey(Target, String),
}

// ============================================================================
// Applier
// ============================================================================

/// Applies remote changesets to a write transaction
pub struct InstructionApplier<'a> {
  tx: &'a mut Transaction,
}

impl<'a> InstructionApplier<'a> {
  pub fn new(tx: &'a mut Transaction) -> Self {
    Self { tx }
  }

  /// Apply every instruction of `changeset` in order
  pub fn apply(&mut self, changeset: &Changeset) -> Result<()> {
    // Remote instructions must not re-record themselves into the local
    // upload history.
    self.tx.set_instruction_recording(false);
    let result = changeset
      .instructions
      .iter()
      .try_for_each(|instr| self.apply_instruction(instr));
    self.tx.set_instruction_recording(true);
    result
  }

  pub fn apply_instruction(&mut self, instr: &Instruction) -> Result<()> {
    trace!(?instr, "applying instruction");
    match instr {
      Instruction::AddTable { table, spec } => self.add_table(table, spec),
      Instruction::EraseTable { table } => self.erase_table(table),
      Instruction::AddColumn {
        table,
        field,
        data_type,
        nullable,
        collection,
        link_target,
      } => self.add_column(table, field, *data_type, *nullable, *collection, link_target.as_deref()),
      Instruction::EraseColumn { table, field } => self.erase_column(table, field),
      Instruction::CreateObject { table, object } => {
        self.create_object(table, object).map(|_| ())
      }
      Instruction::EraseObject { table, object } => self.erase_object(table, object),
      Instruction::Update {
        path,
        value,
        is_default: _,
      } => self.update(path, value),
      Instruction::AddInteger { path, value } => self.add_integer(path, *value),
      Instruction::ArrayInsert {
        path,
        index,
        value,
        prior_size,
      } => self.array_insert(path, *index, value, *prior_size),
      Instruction::ArrayMove {
        path,
        from,
        to,
        prior_size,
      } => self.array_move(path, *from, *to, *prior_size),
      Instruction::ArrayErase {
        path,
        index,
        prior_size,
      } => self.array_erase(path, *index, *prior_size),
      Instruction::Clear { path } => self.clear(path),
      Instruction::SetInsert { path, value } => self.set_insert(path, value),
      Instruction::SetErase { path, value } => self.set_erase(path, value),
    }
  }

  // ==========================================================================
  // Schema instructions
  // ==========================================================================

  fn add_table(&mut self, table: &str, spec: &TableSpec) -> Result<()> {
    match spec {
      TableSpec::PrimaryKey {
        field,
        key_type,
        nullable,
      } => {
        if !key_type.allowed_as_primary_key() {
          return Err(bad(format!(
            "AddTable '{table}': invalid primary key type {key_type}"
          )));
        }
        if let Some(existing) = self.tx.group().table_by_name(table) {
          let pk = existing
            .pk
            .as_ref()
            .ok_or_else(|| bad(format!("AddTable: existing table '{table}' has no primary key")))?;
          if pk.name != *field || pk.data_type != *key_type || pk.nullable != *nullable {
            return Err(bad(format!(
              "AddTable: existing table '{table}' has incompatible primary key '{}' ({})",
              pk.name, pk.data_type
            )));
          }
          return Ok(());
        }
        self
          .tx
          .add_table_with_primary_key(table, *key_type, field, *nullable)
          .map(|_| ())
          .map_err(into_bad)
      }
      TableSpec::GlobalKey => {
        if let Some(existing) = self.tx.group().table_by_name(table) {
          if existing.pk.is_some() || existing.is_embedded() {
            return Err(bad(format!(
              "AddTable: existing table '{table}' is not a GlobalKey table"
            )));
          }
          return Ok(());
        }
        self.tx.add_table(table).map(|_| ()).map_err(into_bad)
      }
      TableSpec::Embedded => {
        if let Some(existing) = self.tx.group().table_by_name(table) {
          if !existing.is_embedded() {
            return Err(bad(format!(
              "AddTable: the existing table '{table}' is not embedded"
            )));
          }
          return Ok(());
        }
        self.tx.add_embedded_table(table).map(|_| ()).map_err(into_bad)
      }
    }
  }

  fn erase_table(&mut self, table: &str) -> Result<()> {
    if self.tx.group().table_by_name(table).is_none() {
      return Err(bad(format!("EraseTable: table '{table}' does not exist")));
    }
    self.tx.erase_table(table).map_err(into_bad)
  }

  fn add_column(
    &mut self,
    table: &str,
    field: &str,
    data_type: DataType,
    nullable: bool,
    collection: CollectionKind,
    link_target: Option<&str>,
  ) -> Result<()> {
    let table_key = self.table_key(table)?;
    if let Some(existing) = self
      .tx
      .group()
      .table(table_key)
      .and_then(|t| t.column_by_name(field))
    {
      // Idempotent when the declarations agree exactly.
      if existing.data_type == data_type
        && existing.nullable == nullable
        && existing.collection == collection
        && existing.target.as_deref() == link_target
      {
        return Ok(());
      }
      return Err(bad(format!(
        "AddColumn: column '{table}.{field}' already exists with a different shape \
         (expected {data_type}, got {})",
        existing.data_type
      )));
    }
    if data_type == DataType::Link {
      let target = link_target
        .ok_or_else(|| bad(format!("AddColumn: link column '{table}.{field}' without target")))?;
      if self.tx.group().table_by_name(target).is_none() {
        return Err(bad(format!(
          "AddColumn: link with invalid target table '{target}'"
        )));
      }
    }
    self
      .tx
      .add_column(table_key, field, data_type, nullable, collection, link_target)
      .map(|_| ())
      .map_err(into_bad)
  }

  fn erase_column(&mut self, table: &str, field: &str) -> Result<()> {
    let table_key = self.table_key(table)?;
    if self
      .tx
      .group()
      .table(table_key)
      .and_then(|t| t.column_by_name(field))
      .is_none()
    {
      return Err(bad(format!(
        "EraseColumn: column '{table}.{field}' does not exist"
      )));
    }
    self.tx.erase_column(table_key, field).map_err(into_bad)
  }

  // ==========================================================================
  // Object instructions
  // ==========================================================================

  fn create_object(&mut self, table: &str, object: &PrimaryKey) -> Result<ObjKey> {
    let table_key = self.table_key(table)?;
    let (pk_spec, has_pk) = {
      let t = self.tx.group().table(table_key).expect("resolved above");
      (t.pk.clone(), t.pk.is_some())
    };
    match object {
      PrimaryKey::GlobalKey(raw) => {
        if has_pk {
          return Err(bad(format!(
            "CreateObject(GlobalKey) on table '{table}' with a primary key"
          )));
        }
        let key = ObjKey(*raw);
        self
          .tx
          .create_object_with_global_key(table_key, key)
          .map_err(into_bad)?;
        Ok(key)
      }
      PrimaryKey::Null => {
        let spec = pk_spec.ok_or_else(|| {
          bad(format!("CreateObject(NULL) on table '{table}' without a primary key"))
        })?;
        if !spec.nullable {
          return Err(bad(format!(
            "CreateObject(NULL) on table '{table}' with a non-nullable primary key"
          )));
        }
        let (key, _) = self
          .tx
          .create_object_with_pk(table_key, Value::Null)
          .map_err(into_bad)?;
        Ok(key)
      }
      other => {
        let spec = pk_spec.ok_or_else(|| {
          bad(format!(
            "CreateObject({}) on table '{table}' without a primary key",
            other.type_name()
          ))
        })?;
        let value = other.to_value().expect("non-global key carries a value");
        if value.data_type() != Some(spec.data_type) {
          return Err(bad(format!(
            "CreateObject({}) on table '{table}' with primary key type {}",
            other.type_name(),
            spec.data_type
          )));
        }
        let (key, _) = self
          .tx
          .create_object_with_pk(table_key, value)
          .map_err(into_bad)?;
        Ok(key)
      }
    }
  }

  fn erase_object(&mut self, table: &str, object: &PrimaryKey) -> Result<()> {
    let table_key = self.table_key(table)?;
    // Missing objects make this a no-op: erases are idempotent under
    // at-least-once delivery.
    let Some(obj) = self.lookup_object(table_key, object) else {
      return Ok(());
    };
    self.tx.erase_object(table_key, obj).map_err(into_bad)?;
    Ok(())
  }

  // ==========================================================================
  // Mutation instructions
  // ==========================================================================

  fn update(&mut self, path: &PathInstruction, payload: &Payload) -> Result<()> {
    let position = self.resolve(path)?;
    match position {
      Position::Field(t) => match payload {
        Payload::Erased => Err(bad(format!(
          "Update: dictionary erase at object field '{path}'"
        ))),
        Payload::ObjectValue => {
          // Creates the embedded object if the link is null, else the
          // existing embedded object is kept.
          let current = self.tx.get_value(t.table, t.obj, t.col).map_err(into_bad)?;
          if current.is_null() {
            self
              .tx
              .create_embedded(t.table, t.obj, t.col)
              .map_err(into_bad)?;
          }
          Ok(())
        }
        _ => {
          let value = self.payload_to_value(path, t.table, t.col, payload)?;
          self.check_target_value(path, t.table, t.col, &value)?;
          self.tx.set_value(t.table, t.obj, t.col, value).map_err(into_bad)
        }
      },
      Position::ListIndex(t, index) => {
        let size = self.tx.list_size(t.table, t.obj, t.col).map_err(into_bad)?;
        if index as usize >= size {
          return Err(bad(format!(
            "Update: list index {index} out of bounds (size {size}) at '{path}'"
          )));
        }
        match payload {
          Payload::Erased => Err(bad(format!(
            "Update: dictionary erase at list position '{path}'"
          ))),
          Payload::ObjectValue => {
            self
              .tx
              .list_erase(t.table, t.obj, t.col, index as usize)
              .map_err(into_bad)?;
            self
              .tx
              .create_embedded_in_list(t.table, t.obj, t.col, index as usize)
              .map_err(into_bad)?;
            Ok(())
          }
          _ => {
            let value = self.payload_to_value(path, t.table, t.col, payload)?;
            self.check_target_value(path, t.table, t.col, &value)?;
            self
              .tx
              .list_set(t.table, t.obj, t.col, index as usize, value)
              .map_err(into_bad)
          }
        }
      }
      Position::DictKey(t, key) => match payload {
        Payload::Erased => {
          self
            .tx
            .dict_erase(t.table, t.obj, t.col, &key)
            .map_err(into_bad)?;
          Ok(())
        }
        Payload::ObjectValue => {
          self
            .tx
            .create_embedded_in_dict(t.table, t.obj, t.col, &key)
            .map_err(into_bad)?;
          Ok(())
        }
        _ => {
          let value = self.payload_to_value(path, t.table, t.col, payload)?;
          self.check_target_value(path, t.table, t.col, &value)?;
          self
            .tx
            .dict_insert(t.table, t.obj, t.col, &key, value)
            .map_err(into_bad)
        }
      },
    }
  }

  fn add_integer(&mut self, path: &PathInstruction, delta: i64) -> Result<()> {
    let position = self.resolve(path)?;
    let Position::Field(t) = position else {
      return Err(bad(format!("AddInteger: '{path}' is not an object field")));
    };
    let spec_type = self
      .tx
      .group()
      .table(t.table)
      .and_then(|tb| tb.column(t.col))
      .map(|c| c.data_type)
      .expect("resolved column");
    if spec_type != DataType::Int && spec_type != DataType::Mixed {
      return Err(bad(format!(
        "AddInteger: type mismatch at '{path}' (expected Int, got {spec_type})"
      )));
    }
    self
      .tx
      .add_integer(t.table, t.obj, t.col, delta)
      .map_err(into_bad)
  }

  fn array_insert(
    &mut self,
    path: &PathInstruction,
    index: u32,
    payload: &Payload,
    prior_size: u32,
  ) -> Result<()> {
    let t = self.resolve_collection(path, CollectionKind::List)?;
    let size = self.tx.list_size(t.table, t.obj, t.col).map_err(into_bad)? as u32;
    if size != prior_size {
      return Err(bad(format!(
        "ArrayInsert: prior size mismatch at '{path}' (expected {prior_size}, got {size})"
      )));
    }
    if index > prior_size {
      return Err(bad(format!(
        "ArrayInsert: index {index} beyond prior size {prior_size} at '{path}'"
      )));
    }
    match payload {
      Payload::ObjectValue => {
        self
          .tx
          .create_embedded_in_list(t.table, t.obj, t.col, index as usize)
          .map_err(into_bad)?;
        Ok(())
      }
      Payload::Erased => Err(bad(format!(
        "ArrayInsert: dictionary erase in list at '{path}'"
      ))),
      _ => {
        let value = self.payload_to_value(path, t.table, t.col, payload)?;
        self.check_target_value(path, t.table, t.col, &value)?;
        self
          .tx
          .list_insert(t.table, t.obj, t.col, index as usize, value)
          .map_err(into_bad)
      }
    }
  }

  fn array_move(&mut self, path: &PathInstruction, from: u32, to: u32, prior_size: u32) -> Result<()> {
    let t = self.resolve_collection(path, CollectionKind::List)?;
    let size = self.tx.list_size(t.table, t.obj, t.col).map_err(into_bad)? as u32;
    if size != prior_size {
      return Err(bad(format!(
        "ArrayMove: prior size mismatch at '{path}' (expected {prior_size}, got {size})"
      )));
    }
    if from >= prior_size || to >= prior_size {
      return Err(bad(format!(
        "ArrayMove: move {from} -> {to} out of range (size {prior_size}) at '{path}'"
      )));
    }
    self
      .tx
      .list_move(t.table, t.obj, t.col, from as usize, to as usize)
      .map_err(into_bad)
  }

  fn array_erase(&mut self, path: &PathInstruction, index: u32, prior_size: u32) -> Result<()> {
    let t = self.resolve_collection(path, CollectionKind::List)?;
    let size = self.tx.list_size(t.table, t.obj, t.col).map_err(into_bad)? as u32;
    if size != prior_size {
      return Err(bad(format!(
        "ArrayErase: prior size mismatch at '{path}' (expected {prior_size}, got {size})"
      )));
    }
    if index >= prior_size {
      return Err(bad(format!(
        "ArrayErase: index {index} out of bounds (size {prior_size}) at '{path}'"
      )));
    }
    self
      .tx
      .list_erase(t.table, t.obj, t.col, index as usize)
      .map_err(into_bad)
  }

  fn clear(&mut self, path: &PathInstruction) -> Result<()> {
    let position = self.resolve(path)?;
    let Position::Field(t) = position else {
      return Err(bad(format!("Clear: '{path}' is not a collection field")));
    };
    let collection = self
      .tx
      .group()
      .table(t.table)
      .and_then(|tb| tb.column(t.col))
      .map(|c| c.collection)
      .expect("resolved column");
    if collection == CollectionKind::Single {
      return Err(bad(format!(
        "Clear: field '{path}' is a plain value, not a collection"
      )));
    }
    self
      .tx
      .clear_collection(t.table, t.obj, t.col)
      .map_err(into_bad)
  }

  fn set_insert(&mut self, path: &PathInstruction, payload: &Payload) -> Result<()> {
    let t = self.resolve_collection(path, CollectionKind::Set)?;
    let value = self.payload_to_value(path, t.table, t.col, payload)?;
    self.check_target_value(path, t.table, t.col, &value)?;
    self
      .tx
      .set_insert(t.table, t.obj, t.col, value)
      .map_err(into_bad)?;
    Ok(())
  }

  fn set_erase(&mut self, path: &PathInstruction, payload: &Payload) -> Result<()> {
    let t = self.resolve_collection(path, CollectionKind::Set)?;
    let value = self.payload_to_value(path, t.table, t.col, payload)?;
    self
      .tx
      .set_erase(t.table, t.obj, t.col, value)
      .map_err(into_bad)?;
    Ok(())
  }

  // ==========================================================================
  // Resolution helpers
  // ==========================================================================

  fn table_key(&self, table: &str) -> Result<TableKey> {
    self
      .tx
      .group()
      .key_of(table)
      .ok_or_else(|| bad(format!("table '{table}' does not exist")))
  }

  fn lookup_object(&self, table: TableKey, object: &PrimaryKey) -> Option<ObjKey> {
    let t = self.tx.group().table(table)?;
    match object {
      PrimaryKey::GlobalKey(raw) => {
        let key = ObjKey(*raw);
        t.contains(key).then_some(key)
      }
      other => t.find_by_pk(&other.to_value()?),
    }
  }

  /// Resolve an instruction path down to its target position
  fn resolve(&self, path: &PathInstruction) -> Result<Position> {
    let table = self.table_key(&path.table)?;
    let obj = self.lookup_object(table, &path.object).ok_or_else(|| {
      bad(format!(
        "object '{}' in table '{}' does not exist",
        path.object, path.table
      ))
    })?;
    let col = self
      .tx
      .group()
      .table(table)
      .and_then(|t| t.column_by_name(&path.field))
      .map(|c| c.key)
      .ok_or_else(|| {
        bad(format!(
          "field '{}.{}' does not exist",
          path.table, path.field
        ))
      })?;

    let mut cur = Target { table, obj, col };
    let mut i = 0;
    while i < path.path.len() {
      let last = i == path.path.len() - 1;
      match &path.path[i] {
        PathElement::Index(index) => {
          if last {
            self.expect_collection(path, &cur, CollectionKind::List)?;
            return Ok(Position::ListIndex(cur, *index));
          }
          let PathElement::Field(next_field) = &path.path[i + 1] else {
            return Err(bad(format!(
              "malformed path '{path}': embedded object must be followed by a field"
            )));
          };
          cur = self.descend_list(path, &cur, *index, next_field)?;
          i += 2;
        }
        PathElement::Key(key) => {
          if last {
            self.expect_collection(path, &cur, CollectionKind::Dictionary)?;
            return Ok(Position::DictKey(cur, key.clone()));
          }
          let PathElement::Field(next_field) = &path.path[i + 1] else {
            return Err(bad(format!(
              "malformed path '{path}': embedded object must be followed by a field"
            )));
          };
          cur = self.descend_dict(path, &cur, key, next_field)?;
          i += 2;
        }
        PathElement::Field(name) => {
          // Descend through a single embedded link field.
          let value = self
            .tx
            .get_value(cur.table, cur.obj, cur.col)
            .map_err(|_| {
              bad(format!(
                "path '{path}' continues through a collection without an index or key"
              ))
            })?;
          cur = self.enter_link(path, value, name)?;
          i += 1;
        }
      }
    }
    Ok(Position::Field(cur))
  }

  /// Resolve a path that must end at a collection of kind `kind`
  fn resolve_collection(&self, path: &PathInstruction, kind: CollectionKind) -> Result<Target> {
    match self.resolve(path)? {
      Position::Field(t) => {
        self.expect_collection(path, &t, kind)?;
        Ok(t)
      }
      _ => Err(bad(format!("'{path}' does not address a {kind} field"))),
    }
  }

  fn expect_collection(&self, path: &PathInstruction, t: &Target, kind: CollectionKind) -> Result<()> {
    let spec = self
      .tx
      .group()
      .table(t.table)
      .and_then(|tb| tb.column(t.col))
      .expect("resolved column");
    if spec.collection != kind {
      return Err(bad(format!(
        "path '{path}' expects a {kind}, but the column is a {} {}",
        spec.collection, spec.data_type
      )));
    }
    Ok(())
  }

  /// Step through `list[index]` into an embedded object, then select
  /// the following field
  fn descend_list(
    &self,
    path: &PathInstruction,
    cur: &Target,
    index: u32,
    next_field: &str,
  ) -> Result<Target> {
    self.expect_collection(path, cur, CollectionKind::List)?;
    let value = self
      .tx
      .list_get(cur.table, cur.obj, cur.col, index as usize)
      .map_err(|_| bad(format!("intermediate list index {index} out of bounds at '{path}'")))?;
    self.enter_link(path, value, next_field)
  }

  /// Step through `dict[key]`; the key must exist on a non-insert path
  fn descend_dict(
    &self,
    path: &PathInstruction,
    cur: &Target,
    key: &str,
    next_field: &str,
  ) -> Result<Target> {
    self.expect_collection(path, cur, CollectionKind::Dictionary)?;
    let value = self
      .tx
      .dict_get(cur.table, cur.obj, cur.col, key)
      .map_err(into_bad)?
      .ok_or_else(|| bad(format!("dictionary key {key:?} missing at '{path}'")))?;
    self.enter_link(path, value, next_field)
  }

  fn enter_link(&self, path: &PathInstruction, value: Value, field: &str) -> Result<Target> {
    let link = match value {
      Value::Link(link) => link,
      Value::Null => {
        return Err(bad(format!(
          "path '{path}' continues through a null link"
        )));
      }
      other => {
        return Err(bad(format!(
          "path '{path}' continues through a non-link value ({other})"
        )));
      }
    };
    let t = self
      .tx
      .group()
      .table(link.table)
      .ok_or_else(|| bad(format!("dangling link in path '{path}'")))?;
    if t.get(link.obj).is_none() {
      return Err(bad(format!("dangling link in path '{path}'")));
    }
    let col = t
      .column_by_name(field)
      .ok_or_else(|| bad(format!("field '{}.{field}' does not exist", t.name)))?
      .key;
    Ok(Target {
      table: link.table,
      obj: link.obj,
      col,
    })
  }

  // ==========================================================================
  // Payload reconciliation
  // ==========================================================================

  /// Convert an instruction payload to a stored value, resolving link
  /// payloads by primary key (creating the target if it is new).
  fn payload_to_value(
    &mut self,
    path: &PathInstruction,
    table: TableKey,
    col: ColKey,
    payload: &Payload,
  ) -> Result<Value> {
    Ok(match payload {
      Payload::Null => Value::Null,
      Payload::Int(v) => Value::Int(*v),
      Payload::Bool(v) => Value::Bool(*v),
      Payload::String(v) => Value::String(v.clone()),
      Payload::Binary(v) => Value::Binary(v.clone()),
      Payload::Float(v) => Value::Float(*v),
      Payload::Double(v) => Value::Double(*v),
      Payload::Timestamp(v) => Value::Timestamp(*v),
      Payload::ObjectId(v) => Value::ObjectId(*v),
      Payload::Uuid(v) => Value::Uuid(*v),
      Payload::Link {
        target_table,
        target,
      } => {
        let spec = self
          .tx
          .group()
          .table(table)
          .and_then(|t| t.column(col))
          .expect("resolved column")
          .clone();
        let target_key = self.tx.group().key_of(target_table).ok_or_else(|| {
          bad(format!(
            "link with invalid target table '{target_table}' at '{path}'"
          ))
        })?;
        if self
          .tx
          .group()
          .table(target_key)
          .is_some_and(|t| t.is_embedded())
        {
          return Err(bad(format!(
            "link to embedded table '{target_table}' at '{path}'"
          )));
        }
        if spec.data_type == DataType::Link {
          if let Some(expected) = spec.target.as_deref() {
            if expected != target_table {
              return Err(bad(format!(
                "Update: target table mismatch at '{path}' (expected '{expected}', got '{target_table}')"
              )));
            }
          }
        }
        // Links may arrive before their target object; creation by
        // primary key is idempotent.
        let obj = self.create_object(target_table, target)?;
        Value::Link(crate::types::ObjLink {
          table: target_key,
          obj,
        })
      }
      Payload::ObjectValue | Payload::Erased => {
        return Err(bad(format!(
          "payload {} is not a value at '{path}'",
          payload.type_name()
        )));
      }
    })
  }

  /// Reconcile a converted value against the target column's declared
  /// type and nullability.
  fn check_target_value(
    &self,
    path: &PathInstruction,
    table: TableKey,
    col: ColKey,
    value: &Value,
  ) -> Result<()> {
    let (table_name, spec) = {
      let t = self.tx.group().table(table).expect("resolved table");
      (t.name.clone(), t.column(col).expect("resolved column").clone())
    };
    if value.is_null() {
      if spec.nullable || spec.data_type == DataType::Mixed {
        return Ok(());
      }
      return Err(bad(format!(
        "Update: NULL in non-nullable field '{table_name}.{}' at '{path}'",
        spec.name
      )));
    }
    if spec.data_type == DataType::Mixed {
      return Ok(());
    }
    if value.data_type() != Some(spec.data_type) {
      return Err(bad(format!(
        "type mismatch in '{table_name}.{}' (expected {}, got {}) at '{path}'",
        spec.name,
        spec.data_type,
        value
          .data_type()
          .map(|t| t.to_string())
          .unwrap_or_else(|| "NULL".into())
      )));
    }
    Ok(())
  }
}

/// Local-API misuse surfacing through the applier is a changeset fault
fn into_bad(err: TideError) -> TideError {
  match err {
    TideError::LogicError(msg) => TideError::BadChangeset(msg),
    other => other,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::group::Field;
  use crate::db::{Db, DbOptions};
  use crate::sync::instruction::TableSpec;

  fn open_db() -> std::sync::Arc<Db> {
    Db::open(DbOptions::in_memory()).unwrap()
  }

  fn path(table: &str, pk: PrimaryKey, field: &str) -> PathInstruction {
    PathInstruction {
      table: table.into(),
      object: pk,
      field: field.into(),
      path: vec![],
    }
  }

  fn seed_schema(tx: &mut Transaction) {
    let mut applier = InstructionApplier::new(tx);
    for instr in [
      Instruction::AddTable {
        table: "person".into(),
        spec: TableSpec::PrimaryKey {
          field: "id".into(),
          key_type: DataType::Int,
          nullable: false,
        },
      },
      Instruction::AddColumn {
        table: "person".into(),
        field: "name".into(),
        data_type: DataType::String,
        nullable: false,
        collection: CollectionKind::Single,
        link_target: None,
      },
      Instruction::AddColumn {
        table: "person".into(),
        field: "tags".into(),
        data_type: DataType::String,
        nullable: false,
        collection: CollectionKind::List,
        link_target: None,
      },
      Instruction::CreateObject {
        table: "person".into(),
        object: PrimaryKey::Int(1),
      },
    ] {
      applier.apply_instruction(&instr).unwrap();
    }
  }

  #[test]
  fn applies_schema_and_updates() {
    let db = open_db();
    let mut tx = db.begin_write().unwrap();
    seed_schema(&mut tx);
    let mut applier = InstructionApplier::new(&mut tx);
    applier
      .apply_instruction(&Instruction::Update {
        path: path("person", PrimaryKey::Int(1), "name"),
        value: Payload::String("ada".into()),
        is_default: false,
      })
      .unwrap();

    let table = tx.group().table_by_name("person").unwrap();
    let obj = table.find_by_pk(&Value::Int(1)).unwrap();
    let col = table.column_by_name("name").unwrap().key;
    assert_eq!(
      tx.get_value(table.key, obj, col).unwrap(),
      Value::String("ada".into())
    );
  }

  #[test]
  fn update_missing_table_is_bad_changeset() {
    let db = open_db();
    let mut tx = db.begin_write().unwrap();
    let mut applier = InstructionApplier::new(&mut tx);
    let err = applier
      .apply_instruction(&Instruction::Update {
        path: path("ghost", PrimaryKey::Int(1), "name"),
        value: Payload::Int(1),
        is_default: false,
      })
      .unwrap_err();
    assert!(matches!(err, TideError::BadChangeset(_)));
  }

  #[test]
  fn type_mismatch_is_bad_changeset() {
    let db = open_db();
    let mut tx = db.begin_write().unwrap();
    seed_schema(&mut tx);
    let mut applier = InstructionApplier::new(&mut tx);
    let err = applier
      .apply_instruction(&Instruction::Update {
        path: path("person", PrimaryKey::Int(1), "name"),
        value: Payload::Int(3),
        is_default: false,
      })
      .unwrap_err();
    let TideError::BadChangeset(msg) = err else {
      panic!("expected BadChangeset");
    };
    assert!(msg.contains("person.name"), "message names the field: {msg}");
    assert!(msg.contains("string"), "message names the expected type: {msg}");
  }

  #[test]
  fn array_ops_check_prior_size() {
    let db = open_db();
    let mut tx = db.begin_write().unwrap();
    seed_schema(&mut tx);
    let mut applier = InstructionApplier::new(&mut tx);
    applier
      .apply_instruction(&Instruction::ArrayInsert {
        path: path("person", PrimaryKey::Int(1), "tags"),
        index: 0,
        value: Payload::String("x".into()),
        prior_size: 0,
      })
      .unwrap();
    let err = applier
      .apply_instruction(&Instruction::ArrayInsert {
        path: path("person", PrimaryKey::Int(1), "tags"),
        index: 0,
        value: Payload::String("y".into()),
        prior_size: 0, // stale
      })
      .unwrap_err();
    assert!(matches!(err, TideError::BadChangeset(_)));
  }

  #[test]
  fn erase_object_is_idempotent() {
    let db = open_db();
    let mut tx = db.begin_write().unwrap();
    seed_schema(&mut tx);
    let mut applier = InstructionApplier::new(&mut tx);
    let erase = Instruction::EraseObject {
      table: "person".into(),
      object: PrimaryKey::Int(1),
    };
    applier.apply_instruction(&erase).unwrap();
    // Second erase of the now-missing object is a no-op.
    applier.apply_instruction(&erase).unwrap();
    assert_eq!(tx.group().table_by_name("person").unwrap().size(), 0);
  }

  #[test]
  fn add_table_twice_with_equal_arguments_succeeds() {
    let db = open_db();
    let mut tx = db.begin_write().unwrap();
    let mut applier = InstructionApplier::new(&mut tx);
    let add = Instruction::AddTable {
      table: "person".into(),
      spec: TableSpec::PrimaryKey {
        field: "id".into(),
        key_type: DataType::Int,
        nullable: false,
      },
    };
    applier.apply_instruction(&add).unwrap();
    applier.apply_instruction(&add).unwrap();

    let incompatible = Instruction::AddTable {
      table: "person".into(),
      spec: TableSpec::PrimaryKey {
        field: "id".into(),
        key_type: DataType::String,
        nullable: false,
      },
    };
    assert!(applier.apply_instruction(&incompatible).is_err());
  }

  #[test]
  fn embedded_object_created_through_object_value() {
    let db = open_db();
    let mut tx = db.begin_write().unwrap();
    seed_schema(&mut tx);
    let mut applier = InstructionApplier::new(&mut tx);
    for instr in [
      Instruction::AddTable {
        table: "address".into(),
        spec: TableSpec::Embedded,
      },
      Instruction::AddColumn {
        table: "address".into(),
        field: "street".into(),
        data_type: DataType::String,
        nullable: true,
        collection: CollectionKind::Single,
        link_target: None,
      },
      Instruction::AddColumn {
        table: "person".into(),
        field: "address".into(),
        data_type: DataType::Link,
        nullable: true,
        collection: CollectionKind::Single,
        link_target: Some("address".into()),
      },
      Instruction::Update {
        path: path("person", PrimaryKey::Int(1), "address"),
        value: Payload::ObjectValue,
        is_default: false,
      },
      // Nested write continues through the embedded link.
      Instruction::Update {
        path: PathInstruction {
          table: "person".into(),
          object: PrimaryKey::Int(1),
          field: "address".into(),
          path: vec![PathElement::Field("street".into())],
        },
        value: Payload::String("downing st".into()),
        is_default: false,
      },
    ] {
      applier.apply_instruction(&instr).unwrap();
    }

    let address = tx.group().table_by_name("address").unwrap();
    assert_eq!(address.size(), 1);
    let obj = address.objects().next().unwrap();
    let street = address.column_by_name("street").unwrap().key;
    assert_eq!(
      obj.fields.get(&street),
      Some(&Field::Single(Value::String("downing st".into())))
    );
  }
}
