//! Core identifier and value types shared across the engine

use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// Reference space
// ============================================================================

/// Unsigned offset identifying a node in the unified file/scratch space.
///
/// A ref `r` is file-resident iff `r < baseline` and scratch-resident
/// otherwise. Refs are multiples of 8 and never point into the header.
pub type Ref = u64;

/// Snapshot version assigned at each commit
pub type Version = u64;

/// Null/absent ref
pub const NULL_REF: Ref = 0;

// ============================================================================
// Graph keys
// ============================================================================

/// Key of a table within a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableKey(pub u32);

/// Key of a column within a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColKey(pub u32);

/// Key of an object within a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjKey(pub u64);

impl fmt::Display for TableKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "tk({})", self.0)
  }
}

impl fmt::Display for ColKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ck({})", self.0)
  }
}

impl fmt::Display for ObjKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ok({})", self.0)
  }
}

// ============================================================================
// Data types
// ============================================================================

/// Declared type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
  Int,
  Bool,
  String,
  Binary,
  Float,
  Double,
  Timestamp,
  ObjectId,
  Uuid,
  Mixed,
  Link,
}

impl DataType {
  /// Types permitted as a primary key column
  pub fn allowed_as_primary_key(self) -> bool {
    matches!(
      self,
      DataType::Int | DataType::String | DataType::ObjectId | DataType::Uuid
    )
  }
}

impl fmt::Display for DataType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      DataType::Int => "int",
      DataType::Bool => "bool",
      DataType::String => "string",
      DataType::Binary => "binary",
      DataType::Float => "float",
      DataType::Double => "double",
      DataType::Timestamp => "timestamp",
      DataType::ObjectId => "objectId",
      DataType::Uuid => "uuid",
      DataType::Mixed => "mixed",
      DataType::Link => "link",
    };
    f.write_str(name)
  }
}

/// Collection kind of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CollectionKind {
  #[default]
  Single,
  List,
  Set,
  Dictionary,
}

impl fmt::Display for CollectionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      CollectionKind::Single => "single",
      CollectionKind::List => "list",
      CollectionKind::Set => "set",
      CollectionKind::Dictionary => "dictionary",
    };
    f.write_str(name)
  }
}

// ============================================================================
// Scalar wrappers
// ============================================================================

/// 12-byte BSON-style object id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId(pub [u8; 12]);

impl fmt::Display for ObjectId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for b in &self.0 {
      write!(f, "{b:02x}")?;
    }
    Ok(())
  }
}

/// 16-byte UUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Uuid(pub [u8; 16]);

impl fmt::Display for Uuid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, b) in self.0.iter().enumerate() {
      if matches!(i, 4 | 6 | 8 | 10) {
        f.write_str("-")?;
      }
      write!(f, "{b:02x}")?;
    }
    Ok(())
  }
}

/// Seconds + nanoseconds timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Timestamp {
  pub seconds: i64,
  pub nanoseconds: u32,
}

impl fmt::Display for Timestamp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{:09}", self.seconds, self.nanoseconds)
  }
}

/// Link to an object in another (or the same) table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjLink {
  pub table: TableKey,
  pub obj: ObjKey,
}

impl fmt::Display for ObjLink {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}->{}", self.table, self.obj)
  }
}

// ============================================================================
// Mixed value
// ============================================================================

/// A dynamically typed value as stored in the object graph
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
  #[default]
  Null,
  Int(i64),
  Bool(bool),
  String(String),
  Binary(Vec<u8>),
  Float(f32),
  Double(f64),
  Timestamp(Timestamp),
  ObjectId(ObjectId),
  Uuid(Uuid),
  Link(ObjLink),
}

impl Value {
  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  /// Declared type this value satisfies, if any (Null satisfies all
  /// nullable columns; Mixed columns accept everything)
  pub fn data_type(&self) -> Option<DataType> {
    match self {
      Value::Null => None,
      Value::Int(_) => Some(DataType::Int),
      Value::Bool(_) => Some(DataType::Bool),
      Value::String(_) => Some(DataType::String),
      Value::Binary(_) => Some(DataType::Binary),
      Value::Float(_) => Some(DataType::Float),
      Value::Double(_) => Some(DataType::Double),
      Value::Timestamp(_) => Some(DataType::Timestamp),
      Value::ObjectId(_) => Some(DataType::ObjectId),
      Value::Uuid(_) => Some(DataType::Uuid),
      Value::Link(_) => Some(DataType::Link),
    }
  }

  fn type_rank(&self) -> u8 {
    match self {
      Value::Null => 0,
      Value::Int(_) => 1,
      Value::Bool(_) => 2,
      Value::String(_) => 3,
      Value::Binary(_) => 4,
      Value::Float(_) => 5,
      Value::Double(_) => 6,
      Value::Timestamp(_) => 7,
      Value::ObjectId(_) => 8,
      Value::Uuid(_) => 9,
      Value::Link(_) => 10,
    }
  }

  /// Total order over all values; used by sets and sorted merges.
  /// Floats order by IEEE total ordering so the relation is total.
  pub fn total_cmp(&self, other: &Value) -> Ordering {
    use Value::*;
    match (self, other) {
      (Null, Null) => Ordering::Equal,
      (Int(a), Int(b)) => a.cmp(b),
      (Bool(a), Bool(b)) => a.cmp(b),
      (String(a), String(b)) => a.cmp(b),
      (Binary(a), Binary(b)) => a.cmp(b),
      (Float(a), Float(b)) => a.total_cmp(b),
      (Double(a), Double(b)) => a.total_cmp(b),
      (Timestamp(a), Timestamp(b)) => a.cmp(b),
      (ObjectId(a), ObjectId(b)) => a.cmp(b),
      (Uuid(a), Uuid(b)) => a.cmp(b),
      (Link(a), Link(b)) => a.cmp(b),
      _ => self.type_rank().cmp(&other.type_rank()),
    }
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Null => f.write_str("null"),
      Value::Int(v) => write!(f, "{v}"),
      Value::Bool(v) => write!(f, "{v}"),
      Value::String(v) => write!(f, "{v:?}"),
      Value::Binary(v) => write!(f, "<{} bytes>", v.len()),
      Value::Float(v) => write!(f, "{v}"),
      Value::Double(v) => write!(f, "{v}"),
      Value::Timestamp(v) => write!(f, "{v}"),
      Value::ObjectId(v) => write!(f, "{v}"),
      Value::Uuid(v) => write!(f, "{v}"),
      Value::Link(v) => write!(f, "{v}"),
    }
  }
}

// ============================================================================
// Primary key
// ============================================================================

/// Orderable, hashable projection of the value types legal as primary keys
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PkKey {
  Null,
  Int(i64),
  String(String),
  ObjectId(ObjectId),
  Uuid(Uuid),
}

impl PkKey {
  /// Project a mixed value onto the pk domain; `None` for illegal types
  pub fn from_value(value: &Value) -> Option<PkKey> {
    match value {
      Value::Null => Some(PkKey::Null),
      Value::Int(v) => Some(PkKey::Int(*v)),
      Value::String(v) => Some(PkKey::String(v.clone())),
      Value::ObjectId(v) => Some(PkKey::ObjectId(*v)),
      Value::Uuid(v) => Some(PkKey::Uuid(*v)),
      _ => None,
    }
  }

  pub fn to_value(&self) -> Value {
    match self {
      PkKey::Null => Value::Null,
      PkKey::Int(v) => Value::Int(*v),
      PkKey::String(v) => Value::String(v.clone()),
      PkKey::ObjectId(v) => Value::ObjectId(*v),
      PkKey::Uuid(v) => Value::Uuid(*v),
    }
  }
}

impl fmt::Display for PkKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_value())
  }
}

// ============================================================================
// Sync identity
// ============================================================================

/// `(ident, salt)` pair assigned by the sync server on first bind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileIdent {
  pub ident: u64,
  pub salt: u64,
}

impl FileIdent {
  pub fn is_unassigned(&self) -> bool {
    self.ident == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pk_projection_rejects_non_key_types() {
    assert!(PkKey::from_value(&Value::Double(1.0)).is_none());
    assert!(PkKey::from_value(&Value::Bool(true)).is_none());
    assert_eq!(
      PkKey::from_value(&Value::Int(7)),
      Some(PkKey::Int(7))
    );
  }

  #[test]
  fn total_cmp_is_total_over_floats() {
    let nan = Value::Double(f64::NAN);
    assert_eq!(nan.total_cmp(&nan), Ordering::Equal);
    assert_ne!(
      Value::Double(1.0).total_cmp(&Value::Double(2.0)),
      Ordering::Equal
    );
  }
}
