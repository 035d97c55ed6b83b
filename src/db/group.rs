//! Object graph
//!
//! A group is the decoded object graph of one snapshot: named tables
//! holding objects whose fields are single values, lists, sets or
//! dictionaries. Tables serialize to individual nodes; the group
//! rewrites only dirty tables at commit (copy-on-write at table
//! granularity) plus a root directory node that the top ref points at.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use indexmap::IndexMap;

use crate::core::alloc::SlabAllocator;
use crate::core::node::{read_node, write_node};
use crate::db::schema::{ObjectSchema, Property, Schema};
use crate::error::{Result, TideError};
use crate::types::{
  CollectionKind, ColKey, DataType, FileIdent, ObjKey, ObjLink, ObjectId, PkKey, Ref, TableKey,
  Timestamp, Uuid, Value,
};
use crate::util::binary::{Reader, Writer};

// ============================================================================
// Columns
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
  TopLevel,
  Embedded,
}

/// Declared shape of one column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
  pub key: ColKey,
  pub name: String,
  pub data_type: DataType,
  pub nullable: bool,
  pub collection: CollectionKind,
  /// Link target table name
  pub target: Option<String>,
  pub indexed: bool,
}

impl ColumnSpec {
  /// Attributes compared during schema reconciliation; the index flag
  /// deliberately does not participate.
  pub fn attrs_match(&self, other: &ColumnSpec) -> bool {
    self.data_type == other.data_type
      && self.nullable == other.nullable
      && self.collection == other.collection
      && self.target == other.target
  }
}

/// Primary key column description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkSpec {
  pub name: String,
  pub data_type: DataType,
  pub nullable: bool,
}

// ============================================================================
// Fields and objects
// ============================================================================

/// Stored shape of one field
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
  Single(Value),
  List(Vec<Value>),
  Set(Vec<Value>),
  Dict(BTreeMap<String, Value>),
}

impl Field {
  pub fn empty_for(kind: CollectionKind) -> Field {
    match kind {
      CollectionKind::Single => Field::Single(Value::Null),
      CollectionKind::List => Field::List(Vec::new()),
      CollectionKind::Set => Field::Set(Vec::new()),
      CollectionKind::Dictionary => Field::Dict(BTreeMap::new()),
    }
  }
}

/// Who owns an embedded object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parent {
  pub table: TableKey,
  pub obj: ObjKey,
  pub col: ColKey,
}

/// One stored object
#[derive(Debug, Clone, PartialEq)]
pub struct Obj {
  pub key: ObjKey,
  /// Null for tables without a primary key column
  pub pk: Value,
  pub fields: IndexMap<ColKey, Field>,
  /// Set iff this object lives in an embedded table
  pub parent: Option<Parent>,
}

// ============================================================================
// Tables
// ============================================================================

/// One table: schema plus objects
#[derive(Debug, Clone)]
pub struct Table {
  pub key: TableKey,
  pub name: String,
  pub table_type: TableType,
  pub pk: Option<PkSpec>,
  columns: IndexMap<ColKey, ColumnSpec>,
  col_names: HashMap<String, ColKey>,
  next_col: u32,
  objects: IndexMap<ObjKey, Obj>,
  pk_index: BTreeMap<PkKey, ObjKey>,
  next_obj: u64,
}

impl Table {
  fn new(key: TableKey, name: String, table_type: TableType, pk: Option<PkSpec>) -> Self {
    Self {
      key,
      name,
      table_type,
      pk,
      columns: IndexMap::new(),
      col_names: HashMap::new(),
      next_col: crate::constants::INITIAL_COLUMN_KEY,
      objects: IndexMap::new(),
      pk_index: BTreeMap::new(),
      next_obj: crate::constants::INITIAL_OBJECT_KEY,
    }
  }

  pub fn is_embedded(&self) -> bool {
    self.table_type == TableType::Embedded
  }

  pub fn size(&self) -> usize {
    self.objects.len()
  }

  // ==========================================================================
  // Columns
  // ==========================================================================

  pub fn columns(&self) -> impl Iterator<Item = &ColumnSpec> {
    self.columns.values()
  }

  pub fn column(&self, key: ColKey) -> Option<&ColumnSpec> {
    self.columns.get(&key)
  }

  pub fn column_by_name(&self, name: &str) -> Option<&ColumnSpec> {
    self.col_names.get(name).and_then(|k| self.columns.get(k))
  }

  pub fn add_column(
    &mut self,
    name: &str,
    data_type: DataType,
    nullable: bool,
    collection: CollectionKind,
    target: Option<String>,
  ) -> Result<ColKey> {
    if let Some(existing) = self.column_by_name(name) {
      return Err(TideError::LogicError(format!(
        "column '{}.{name}' already exists as {}",
        self.name, existing.data_type
      )));
    }
    let key = ColKey(self.next_col);
    self.next_col += 1;
    let spec = ColumnSpec {
      key,
      name: name.to_string(),
      data_type,
      nullable,
      collection,
      target,
      indexed: false,
    };
    self.col_names.insert(spec.name.clone(), key);
    self.columns.insert(key, spec);
    Ok(key)
  }

  pub fn erase_column(&mut self, key: ColKey) -> Result<()> {
    let spec = self
      .columns
      .shift_remove(&key)
      .ok_or_else(|| TideError::LogicError(format!("no column {key} in '{}'", self.name)))?;
    self.col_names.remove(&spec.name);
    for obj in self.objects.values_mut() {
      obj.fields.shift_remove(&key);
    }
    Ok(())
  }

  pub fn set_indexed(&mut self, key: ColKey, indexed: bool) {
    if let Some(spec) = self.columns.get_mut(&key) {
      spec.indexed = indexed;
    }
  }

  // ==========================================================================
  // Objects
  // ==========================================================================

  pub fn objects(&self) -> impl Iterator<Item = &Obj> {
    self.objects.values()
  }

  pub fn object_keys(&self) -> Vec<ObjKey> {
    self.objects.keys().copied().collect()
  }

  pub fn get(&self, key: ObjKey) -> Option<&Obj> {
    self.objects.get(&key)
  }

  pub fn get_mut(&mut self, key: ObjKey) -> Option<&mut Obj> {
    self.objects.get_mut(&key)
  }

  pub fn contains(&self, key: ObjKey) -> bool {
    self.objects.contains_key(&key)
  }

  pub fn find_by_pk(&self, pk: &Value) -> Option<ObjKey> {
    let key = PkKey::from_value(pk)?;
    self.pk_index.get(&key).copied()
  }

  /// Insert an object under a caller-chosen key (replicated GlobalKey
  /// objects keep their originating key). Returns false if present.
  pub fn create_object_with_key(&mut self, key: ObjKey) -> bool {
    if self.objects.contains_key(&key) {
      return false;
    }
    self.next_obj = self.next_obj.max(key.0 + 1);
    self.objects.insert(
      key,
      Obj {
        key,
        pk: Value::Null,
        fields: IndexMap::new(),
        parent: None,
      },
    );
    true
  }

  /// Insert an object without a primary key (GlobalKey and embedded)
  pub fn create_object(&mut self) -> ObjKey {
    let key = ObjKey(self.next_obj);
    self.next_obj += 1;
    self.objects.insert(
      key,
      Obj {
        key,
        pk: Value::Null,
        fields: IndexMap::new(),
        parent: None,
      },
    );
    key
  }

  /// Insert or fetch the object with primary key `pk`.
  /// Returns `(key, created)`.
  pub fn create_object_with_pk(&mut self, pk: Value) -> Result<(ObjKey, bool)> {
    let pk_key = PkKey::from_value(&pk).ok_or_else(|| {
      TideError::LogicError(format!("value {pk} is not usable as a primary key"))
    })?;
    if let Some(existing) = self.pk_index.get(&pk_key) {
      return Ok((*existing, false));
    }
    let key = ObjKey(self.next_obj);
    self.next_obj += 1;
    self.pk_index.insert(pk_key, key);
    self.objects.insert(
      key,
      Obj {
        key,
        pk,
        fields: IndexMap::new(),
        parent: None,
      },
    );
    Ok((key, true))
  }

  fn remove_object_local(&mut self, key: ObjKey) -> Option<Obj> {
    let obj = self.objects.shift_remove(&key)?;
    if self.pk.is_some() {
      if let Some(pk_key) = PkKey::from_value(&obj.pk) {
        self.pk_index.remove(&pk_key);
      }
    }
    Some(obj)
  }
}

// ============================================================================
// Group
// ============================================================================

/// The decoded object graph of one snapshot
#[derive(Debug, Clone, Default)]
pub struct Group {
  tables: IndexMap<TableKey, Table>,
  names: HashMap<String, TableKey>,
  next_table: u32,
  /// Sync identity; persisted in the root node
  pub file_ident: FileIdent,
  /// Caller-declared schema version; `u64::MAX` until first set
  pub schema_version: u64,

  /// Committed node per table; absent for tables created this tx
  refs: HashMap<TableKey, Ref>,
  root_ref: Ref,
  dirty: HashSet<TableKey>,
  /// Nodes of erased tables, freed on the next flush
  erased_refs: Vec<Ref>,
}

impl Group {
  pub fn new() -> Self {
    Self {
      next_table: crate::constants::INITIAL_TABLE_KEY,
      schema_version: u64::MAX,
      ..Self::default()
    }
  }

  pub fn table_count(&self) -> usize {
    self.tables.len()
  }

  pub fn tables(&self) -> impl Iterator<Item = &Table> {
    self.tables.values()
  }

  pub fn table_keys(&self) -> Vec<TableKey> {
    self.tables.keys().copied().collect()
  }

  pub fn table(&self, key: TableKey) -> Option<&Table> {
    self.tables.get(&key)
  }

  pub fn table_by_name(&self, name: &str) -> Option<&Table> {
    self.names.get(name).and_then(|k| self.tables.get(k))
  }

  pub fn key_of(&self, name: &str) -> Option<TableKey> {
    self.names.get(name).copied()
  }

  /// Mutable table access; marks the table dirty
  pub fn table_mut(&mut self, key: TableKey) -> Option<&mut Table> {
    if self.tables.contains_key(&key) {
      self.dirty.insert(key);
    }
    self.tables.get_mut(&key)
  }

  pub fn mark_dirty(&mut self, key: TableKey) {
    if self.tables.contains_key(&key) {
      self.dirty.insert(key);
    }
  }

  // ==========================================================================
  // Table lifecycle
  // ==========================================================================

  pub fn add_table(&mut self, name: &str, table_type: TableType) -> Result<TableKey> {
    self.add_table_inner(name, table_type, None)
  }

  pub fn add_table_with_primary_key(
    &mut self,
    name: &str,
    pk_type: DataType,
    pk_name: &str,
    pk_nullable: bool,
  ) -> Result<TableKey> {
    if !pk_type.allowed_as_primary_key() {
      return Err(TideError::LogicError(format!(
        "type {pk_type} is not allowed as a primary key"
      )));
    }
    self.add_table_inner(
      name,
      TableType::TopLevel,
      Some(PkSpec {
        name: pk_name.to_string(),
        data_type: pk_type,
        nullable: pk_nullable,
      }),
    )
  }

  fn add_table_inner(
    &mut self,
    name: &str,
    table_type: TableType,
    pk: Option<PkSpec>,
  ) -> Result<TableKey> {
    if self.names.contains_key(name) {
      return Err(TideError::LogicError(format!(
        "table '{name}' already exists"
      )));
    }
    debug_assert!(
      !(table_type == TableType::Embedded && pk.is_some()),
      "embedded tables cannot have a primary key"
    );
    let key = TableKey(self.next_table);
    self.next_table += 1;
    self.names.insert(name.to_string(), key);
    self
      .tables
      .insert(key, Table::new(key, name.to_string(), table_type, pk));
    self.dirty.insert(key);
    Ok(key)
  }

  pub fn erase_table(&mut self, key: TableKey) -> Result<()> {
    let table = self
      .tables
      .shift_remove(&key)
      .ok_or_else(|| TideError::LogicError(format!("no table {key}")))?;
    self.names.remove(&table.name);
    self.dirty.remove(&key);
    if let Some(r) = self.refs.remove(&key) {
      // The node is freed on the next commit; remember it as garbage.
      self.erased_refs.push(r);
    }
    Ok(())
  }

  // ==========================================================================
  // Object removal with embedded cascade
  // ==========================================================================

  /// Remove one object, cascading into embedded children
  pub fn remove_object(&mut self, table: TableKey, obj: ObjKey) -> Result<bool> {
    let mut queue = VecDeque::new();
    queue.push_back((table, obj));
    let mut removed_any = false;

    while let Some((tk, ok)) = queue.pop_front() {
      let Some(t) = self.tables.get_mut(&tk) else {
        continue;
      };
      let Some(removed) = t.remove_object_local(ok) else {
        continue;
      };
      self.dirty.insert(tk);
      removed_any = true;

      // Collect embedded children reachable from the removed fields.
      for field in removed.fields.values() {
        let mut collect = |v: &Value| {
          if let Value::Link(link) = v {
            if self
              .tables
              .get(&link.table)
              .is_some_and(|t| t.is_embedded())
            {
              queue.push_back((link.table, link.obj));
            }
          }
        };
        match field {
          Field::Single(v) => collect(v),
          Field::List(vs) | Field::Set(vs) => vs.iter().for_each(&mut collect),
          Field::Dict(map) => map.values().for_each(&mut collect),
        }
      }
    }
    Ok(removed_any)
  }

  /// Remove every object of a table, cascading into embedded children
  pub fn clear_table(&mut self, table: TableKey) -> Result<()> {
    let keys = self
      .tables
      .get(&table)
      .map(|t| t.object_keys())
      .unwrap_or_default();
    for key in keys {
      self.remove_object(table, key)?;
    }
    Ok(())
  }

  /// Create an embedded object owned by `(parent, col)`
  pub fn create_embedded(&mut self, target: TableKey, parent: Parent) -> Result<ObjLink> {
    let table = self
      .tables
      .get_mut(&target)
      .ok_or_else(|| TideError::LogicError(format!("no table {target}")))?;
    if !table.is_embedded() {
      return Err(TideError::LogicError(format!(
        "table '{}' is not embedded",
        table.name
      )));
    }
    let key = table.create_object();
    table.get_mut(key).expect("just created").parent = Some(parent);
    self.dirty.insert(target);
    Ok(ObjLink {
      table: target,
      obj: key,
    })
  }

  // ==========================================================================
  // Schema derivation
  // ==========================================================================

  /// Build the declarative schema of the current graph.
  /// The reset metadata table is engine-internal and not reported.
  pub fn derive_schema(&self) -> Schema {
    let mut objects = Vec::new();
    for table in self.tables.values() {
      if table.name == crate::constants::META_RESET_TABLE {
        continue;
      }
      let mut properties: Vec<Property> = Vec::new();
      for col in table.columns() {
        properties.push(Property {
          name: col.name.clone(),
          data_type: col.data_type,
          collection: col.collection,
          nullable: col.nullable,
          indexed: col.indexed,
          target: col.target.clone(),
        });
      }
      objects.push(ObjectSchema {
        name: table.name.clone(),
        embedded: table.is_embedded(),
        primary_key: table.pk.as_ref().map(|pk| pk.name.clone()),
        properties,
      });
    }
    Schema::new(objects)
  }

  // ==========================================================================
  // Serialization
  // ==========================================================================

  /// Write dirty tables and the root directory through the allocator.
  ///
  /// Superseded nodes are pushed onto `retired` rather than freed:
  /// older snapshots may still be pinned by readers, so reclamation is
  /// deferred until the commit that freed them is the oldest live one.
  /// Returns the new top ref.
  pub fn write_to(&mut self, alloc: &mut SlabAllocator, retired: &mut Vec<Ref>) -> Result<Ref> {
    retired.append(&mut self.erased_refs);
    let dirty: Vec<TableKey> = self.dirty.iter().copied().collect();
    for key in dirty {
      let Some(table) = self.tables.get(&key) else {
        continue;
      };
      let payload = encode_table(table);
      if let Some(old) = self.refs.remove(&key) {
        retired.push(old);
      }
      let r = write_node(alloc, &payload)?;
      self.refs.insert(key, r);
    }
    self.dirty.clear();

    // The root is rewritten on every commit.
    let mut w = Writer::new();
    w.write_u32(self.next_table);
    w.write_u64(self.file_ident.ident);
    w.write_u64(self.file_ident.salt);
    w.write_u64(self.schema_version);
    w.write_u32(self.tables.len() as u32);
    for (key, table) in &self.tables {
      w.write_u32(key.0);
      w.write_string(&table.name);
      w.write_u64(*self.refs.get(key).expect("every table has a node after flush"));
    }
    if self.root_ref != 0 {
      retired.push(self.root_ref);
    }
    self.root_ref = write_node(alloc, &w.into_bytes())?;
    Ok(self.root_ref)
  }

  /// Forget all committed node refs and mark everything dirty, so the
  /// next flush writes a complete fresh copy (compaction, write-copy).
  pub fn reset_for_full_write(&mut self) {
    self.refs.clear();
    self.root_ref = 0;
    self.erased_refs.clear();
    self.dirty = self.tables.keys().copied().collect();
  }

  /// Decode the graph rooted at `top_ref`; a zero ref yields an empty group
  pub fn read_from(alloc: &SlabAllocator, top_ref: Ref) -> Result<Group> {
    let mut group = Group::new();
    if top_ref == 0 {
      return Ok(group);
    }
    group.root_ref = top_ref;
    let root = read_node(alloc, top_ref)?;
    let mut r = Reader::new(&root);
    group.next_table = r.read_u32()?;
    group.file_ident = FileIdent {
      ident: r.read_u64()?,
      salt: r.read_u64()?,
    };
    group.schema_version = r.read_u64()?;
    let count = r.read_u32()?;
    for _ in 0..count {
      let key = TableKey(r.read_u32()?);
      let name = r.read_string()?;
      let table_ref = r.read_u64()?;
      let payload = read_node(alloc, table_ref)?;
      let table = decode_table(key, name.clone(), &payload)?;
      group.names.insert(name, key);
      group.refs.insert(key, table_ref);
      group.tables.insert(key, table);
    }
    Ok(group)
  }

  pub fn has_dirty_tables(&self) -> bool {
    !self.dirty.is_empty() || !self.erased_refs.is_empty()
  }

  /// Bytes occupied by the live nodes of this snapshot (compaction
  /// heuristics). Only meaningful right after decode or flush.
  pub fn live_node_bytes(&self, alloc: &SlabAllocator) -> u64 {
    let mut total = 0u64;
    if self.root_ref != 0 {
      total += crate::core::node::get_byte_size_from_header(alloc.translate(self.root_ref));
    }
    for r in self.refs.values() {
      total += crate::core::node::get_byte_size_from_header(alloc.translate(*r));
    }
    total
  }
}

// ============================================================================
// Value codec
// ============================================================================

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_BOOL: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_BINARY: u8 = 4;
const TAG_FLOAT: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_TIMESTAMP: u8 = 7;
const TAG_OBJECT_ID: u8 = 8;
const TAG_UUID: u8 = 9;
const TAG_LINK: u8 = 10;

pub fn encode_value(w: &mut Writer, value: &Value) {
  match value {
    Value::Null => w.write_u8(TAG_NULL),
    Value::Int(v) => {
      w.write_u8(TAG_INT);
      w.write_i64(*v);
    }
    Value::Bool(v) => {
      w.write_u8(TAG_BOOL);
      w.write_u8(u8::from(*v));
    }
    Value::String(v) => {
      w.write_u8(TAG_STRING);
      w.write_string(v);
    }
    Value::Binary(v) => {
      w.write_u8(TAG_BINARY);
      w.write_bytes(v);
    }
    Value::Float(v) => {
      w.write_u8(TAG_FLOAT);
      w.write_f32(*v);
    }
    Value::Double(v) => {
      w.write_u8(TAG_DOUBLE);
      w.write_f64(*v);
    }
    Value::Timestamp(v) => {
      w.write_u8(TAG_TIMESTAMP);
      w.write_i64(v.seconds);
      w.write_u32(v.nanoseconds);
    }
    Value::ObjectId(v) => {
      w.write_u8(TAG_OBJECT_ID);
      w.write_array(&v.0);
    }
    Value::Uuid(v) => {
      w.write_u8(TAG_UUID);
      w.write_array(&v.0);
    }
    Value::Link(v) => {
      w.write_u8(TAG_LINK);
      w.write_u32(v.table.0);
      w.write_u64(v.obj.0);
    }
  }
}

pub fn decode_value(r: &mut Reader<'_>) -> Result<Value> {
  Ok(match r.read_u8()? {
    TAG_NULL => Value::Null,
    TAG_INT => Value::Int(r.read_i64()?),
    TAG_BOOL => Value::Bool(r.read_u8()? != 0),
    TAG_STRING => Value::String(r.read_string()?),
    TAG_BINARY => Value::Binary(r.read_bytes()?),
    TAG_FLOAT => Value::Float(r.read_f32()?),
    TAG_DOUBLE => Value::Double(r.read_f64()?),
    TAG_TIMESTAMP => Value::Timestamp(Timestamp {
      seconds: r.read_i64()?,
      nanoseconds: r.read_u32()?,
    }),
    TAG_OBJECT_ID => Value::ObjectId(ObjectId(r.read_array()?)),
    TAG_UUID => Value::Uuid(Uuid(r.read_array()?)),
    TAG_LINK => Value::Link(ObjLink {
      table: TableKey(r.read_u32()?),
      obj: ObjKey(r.read_u64()?),
    }),
    tag => {
      return Err(TideError::BadChangeset(format!("unknown value tag {tag}")));
    }
  })
}

fn encode_data_type(t: DataType) -> u8 {
  match t {
    DataType::Int => 0,
    DataType::Bool => 1,
    DataType::String => 2,
    DataType::Binary => 3,
    DataType::Float => 4,
    DataType::Double => 5,
    DataType::Timestamp => 6,
    DataType::ObjectId => 7,
    DataType::Uuid => 8,
    DataType::Mixed => 9,
    DataType::Link => 10,
  }
}

pub fn decode_data_type(tag: u8) -> Result<DataType> {
  Ok(match tag {
    0 => DataType::Int,
    1 => DataType::Bool,
    2 => DataType::String,
    3 => DataType::Binary,
    4 => DataType::Float,
    5 => DataType::Double,
    6 => DataType::Timestamp,
    7 => DataType::ObjectId,
    8 => DataType::Uuid,
    9 => DataType::Mixed,
    10 => DataType::Link,
    _ => {
      return Err(TideError::BadChangeset(format!(
        "unknown data type tag {tag}"
      )));
    }
  })
}

fn encode_collection(kind: CollectionKind) -> u8 {
  match kind {
    CollectionKind::Single => 0,
    CollectionKind::List => 1,
    CollectionKind::Set => 2,
    CollectionKind::Dictionary => 3,
  }
}

fn decode_collection(tag: u8) -> Result<CollectionKind> {
  Ok(match tag {
    0 => CollectionKind::Single,
    1 => CollectionKind::List,
    2 => CollectionKind::Set,
    3 => CollectionKind::Dictionary,
    _ => {
      return Err(TideError::BadChangeset(format!(
        "unknown collection tag {tag}"
      )));
    }
  })
}

// ============================================================================
// Table codec
// ============================================================================

fn encode_field(w: &mut Writer, field: &Field) {
  match field {
    Field::Single(v) => {
      w.write_u8(0);
      encode_value(w, v);
    }
    Field::List(vs) => {
      w.write_u8(1);
      w.write_u32(vs.len() as u32);
      for v in vs {
        encode_value(w, v);
      }
    }
    Field::Set(vs) => {
      w.write_u8(2);
      w.write_u32(vs.len() as u32);
      for v in vs {
        encode_value(w, v);
      }
    }
    Field::Dict(map) => {
      w.write_u8(3);
      w.write_u32(map.len() as u32);
      for (k, v) in map {
        w.write_string(k);
        encode_value(w, v);
      }
    }
  }
}

fn decode_field(r: &mut Reader<'_>) -> Result<Field> {
  Ok(match r.read_u8()? {
    0 => Field::Single(decode_value(r)?),
    1 => {
      let n = r.read_u32()?;
      let mut vs = Vec::with_capacity(n as usize);
      for _ in 0..n {
        vs.push(decode_value(r)?);
      }
      Field::List(vs)
    }
    2 => {
      let n = r.read_u32()?;
      let mut vs = Vec::with_capacity(n as usize);
      for _ in 0..n {
        vs.push(decode_value(r)?);
      }
      Field::Set(vs)
    }
    3 => {
      let n = r.read_u32()?;
      let mut map = BTreeMap::new();
      for _ in 0..n {
        let k = r.read_string()?;
        map.insert(k, decode_value(r)?);
      }
      Field::Dict(map)
    }
    tag => {
      return Err(TideError::BadChangeset(format!("unknown field tag {tag}")));
    }
  })
}

fn encode_table(table: &Table) -> Vec<u8> {
  let mut w = Writer::new();
  w.write_u8(match table.table_type {
    TableType::TopLevel => 0,
    TableType::Embedded => 1,
  });
  match &table.pk {
    Some(pk) => {
      w.write_u8(1);
      w.write_string(&pk.name);
      w.write_u8(encode_data_type(pk.data_type));
      w.write_u8(u8::from(pk.nullable));
    }
    None => w.write_u8(0),
  }
  w.write_u32(table.next_col);
  w.write_u32(table.columns.len() as u32);
  for col in table.columns.values() {
    w.write_u32(col.key.0);
    w.write_string(&col.name);
    w.write_u8(encode_data_type(col.data_type));
    w.write_u8(u8::from(col.nullable));
    w.write_u8(encode_collection(col.collection));
    w.write_u8(u8::from(col.indexed));
    match &col.target {
      Some(target) => {
        w.write_u8(1);
        w.write_string(target);
      }
      None => w.write_u8(0),
    }
  }
  w.write_u64(table.next_obj);
  w.write_u64(table.objects.len() as u64);
  for obj in table.objects.values() {
    w.write_u64(obj.key.0);
    encode_value(&mut w, &obj.pk);
    match &obj.parent {
      Some(p) => {
        w.write_u8(1);
        w.write_u32(p.table.0);
        w.write_u64(p.obj.0);
        w.write_u32(p.col.0);
      }
      None => w.write_u8(0),
    }
    w.write_u32(obj.fields.len() as u32);
    for (col, field) in &obj.fields {
      w.write_u32(col.0);
      encode_field(&mut w, field);
    }
  }
  w.into_bytes()
}

fn decode_table(key: TableKey, name: String, payload: &[u8]) -> Result<Table> {
  let mut r = Reader::new(payload);
  let table_type = match r.read_u8()? {
    0 => TableType::TopLevel,
    1 => TableType::Embedded,
    tag => {
      return Err(TideError::BadChangeset(format!(
        "unknown table type tag {tag}"
      )));
    }
  };
  let pk = if r.read_u8()? != 0 {
    Some(PkSpec {
      name: r.read_string()?,
      data_type: decode_data_type(r.read_u8()?)?,
      nullable: r.read_u8()? != 0,
    })
  } else {
    None
  };
  let mut table = Table::new(key, name, table_type, pk);
  table.next_col = r.read_u32()?;
  let col_count = r.read_u32()?;
  for _ in 0..col_count {
    let col_key = ColKey(r.read_u32()?);
    let col_name = r.read_string()?;
    let data_type = decode_data_type(r.read_u8()?)?;
    let nullable = r.read_u8()? != 0;
    let collection = decode_collection(r.read_u8()?)?;
    let indexed = r.read_u8()? != 0;
    let target = if r.read_u8()? != 0 {
      Some(r.read_string()?)
    } else {
      None
    };
    let spec = ColumnSpec {
      key: col_key,
      name: col_name.clone(),
      data_type,
      nullable,
      collection,
      target,
      indexed,
    };
    table.col_names.insert(col_name, col_key);
    table.columns.insert(col_key, spec);
  }
  table.next_obj = r.read_u64()?;
  let obj_count = r.read_u64()?;
  for _ in 0..obj_count {
    let obj_key = ObjKey(r.read_u64()?);
    let pk = decode_value(&mut r)?;
    let parent = if r.read_u8()? != 0 {
      Some(Parent {
        table: TableKey(r.read_u32()?),
        obj: ObjKey(r.read_u64()?),
        col: ColKey(r.read_u32()?),
      })
    } else {
      None
    };
    let field_count = r.read_u32()?;
    let mut fields = IndexMap::with_capacity(field_count as usize);
    for _ in 0..field_count {
      let col = ColKey(r.read_u32()?);
      fields.insert(col, decode_field(&mut r)?);
    }
    if let Some(pk_key) = PkKey::from_value(&pk) {
      if table.pk.is_some() {
        table.pk_index.insert(pk_key, obj_key);
      }
    }
    table.objects.insert(
      obj_key,
      Obj {
        key: obj_key,
        pk,
        fields,
        parent,
      },
    );
  }
  Ok(table)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn scratch() -> SlabAllocator {
    let mut alloc = SlabAllocator::new();
    alloc.attach_empty();
    alloc.reset_free_space_tracking();
    alloc
  }

  fn sample_group() -> Group {
    let mut g = Group::new();
    let people = g
      .add_table_with_primary_key("person", DataType::Int, "id", false)
      .unwrap();
    {
      let t = g.table_mut(people).unwrap();
      t.add_column("name", DataType::String, false, CollectionKind::Single, None)
        .unwrap();
      t.add_column("tags", DataType::String, false, CollectionKind::List, None)
        .unwrap();
      let (alice, created) = t.create_object_with_pk(Value::Int(1)).unwrap();
      assert!(created);
      let name_col = t.column_by_name("name").unwrap().key;
      let tags_col = t.column_by_name("tags").unwrap().key;
      let obj = t.get_mut(alice).unwrap();
      obj
        .fields
        .insert(name_col, Field::Single(Value::String("alice".into())));
      obj.fields.insert(
        tags_col,
        Field::List(vec![Value::String("a".into()), Value::String("b".into())]),
      );
    }
    g
  }

  #[test]
  fn group_round_trips_through_nodes() {
    let mut alloc = scratch();
    let mut g = sample_group();
    let top = g.write_to(&mut alloc, &mut Vec::new()).unwrap();
    assert_ne!(top, 0);

    let decoded = Group::read_from(&alloc, top).unwrap();
    let table = decoded.table_by_name("person").unwrap();
    assert_eq!(table.size(), 1);
    let obj_key = table.find_by_pk(&Value::Int(1)).unwrap();
    let obj = table.get(obj_key).unwrap();
    let name_col = table.column_by_name("name").unwrap().key;
    assert_eq!(
      obj.fields.get(&name_col),
      Some(&Field::Single(Value::String("alice".into())))
    );
  }

  #[test]
  fn only_dirty_tables_are_rewritten() {
    let mut alloc = scratch();
    let mut g = sample_group();
    g.add_table("log", TableType::TopLevel).unwrap();
    let mut retired = Vec::new();
    let _top1 = g.write_to(&mut alloc, &mut retired).unwrap();

    let person_ref = *g.refs.get(&g.key_of("person").unwrap()).unwrap();
    let log_key = g.key_of("log").unwrap();
    g.table_mut(log_key).unwrap();
    let _top2 = g.write_to(&mut alloc, &mut retired).unwrap();

    // person untouched, its node ref unchanged
    assert_eq!(*g.refs.get(&g.key_of("person").unwrap()).unwrap(), person_ref);
    assert_ne!(*g.refs.get(&log_key).unwrap(), 0);
  }

  #[test]
  fn pk_upsert_returns_existing_object() {
    let mut g = sample_group();
    let key = g.key_of("person").unwrap();
    let t = g.table_mut(key).unwrap();
    let (first, created) = t.create_object_with_pk(Value::Int(7)).unwrap();
    assert!(created);
    let (second, created) = t.create_object_with_pk(Value::Int(7)).unwrap();
    assert!(!created);
    assert_eq!(first, second);
  }

  #[test]
  fn removing_parent_removes_embedded_children() {
    let mut g = Group::new();
    let owners = g
      .add_table_with_primary_key("owner", DataType::Int, "id", false)
      .unwrap();
    let addresses = g.add_table("address", TableType::Embedded).unwrap();
    let addr_col = {
      let t = g.table_mut(owners).unwrap();
      t.add_column(
        "address",
        DataType::Link,
        true,
        CollectionKind::Single,
        Some("address".into()),
      )
      .unwrap()
    };
    let (owner, _) = g
      .table_mut(owners)
      .unwrap()
      .create_object_with_pk(Value::Int(1))
      .unwrap();
    let link = g
      .create_embedded(
        addresses,
        Parent {
          table: owners,
          obj: owner,
          col: addr_col,
        },
      )
      .unwrap();
    g.table_mut(owners)
      .unwrap()
      .get_mut(owner)
      .unwrap()
      .fields
      .insert(addr_col, Field::Single(Value::Link(link)));

    assert_eq!(g.table(addresses).unwrap().size(), 1);
    g.remove_object(owners, owner).unwrap();
    assert_eq!(g.table(addresses).unwrap().size(), 0);
  }
}
