//! Sync instructions and changeset framing
//!
//! A changeset is an ordered sequence of typed mutation instructions.
//! Each instruction addresses its target through a path: table name,
//! object identity, field name, then zero or more path components
//! walking column -> list index | dictionary key | embedded field.
//!
//! Frames are length-prefixed little-endian with a crc32 trailer:
//!
//! ```text
//! magic (u32) | version (u16) | flags (u16)
//! client_version (u64) | last_integrated_remote_version (u64)
//! origin_file_ident (u64) | origin_timestamp (i64)
//! instruction_count (u32) | instructions... | crc32 (u32)
//! ```

use crate::constants::{CHANGESET_MAGIC, CHANGESET_VERSION};
use crate::error::{Result, TideError};
use crate::types::{
  CollectionKind, DataType, ObjectId, Timestamp, Uuid, Value, Version,
};
use crate::util::binary::{Reader, Writer};

// ============================================================================
// Object identity
// ============================================================================

/// How an instruction names an object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PrimaryKey {
  /// Object in a table without a primary key column
  GlobalKey(u64),
  Null,
  Int(i64),
  String(String),
  ObjectId(ObjectId),
  Uuid(Uuid),
}

impl PrimaryKey {
  pub fn type_name(&self) -> &'static str {
    match self {
      PrimaryKey::GlobalKey(_) => "GlobalKey",
      PrimaryKey::Null => "NULL",
      PrimaryKey::Int(_) => "Int",
      PrimaryKey::String(_) => "String",
      PrimaryKey::ObjectId(_) => "ObjectId",
      PrimaryKey::Uuid(_) => "UUID",
    }
  }

  /// The stored pk value; `None` for global keys
  pub fn to_value(&self) -> Option<Value> {
    match self {
      PrimaryKey::GlobalKey(_) => None,
      PrimaryKey::Null => Some(Value::Null),
      PrimaryKey::Int(v) => Some(Value::Int(*v)),
      PrimaryKey::String(v) => Some(Value::String(v.clone())),
      PrimaryKey::ObjectId(v) => Some(Value::ObjectId(*v)),
      PrimaryKey::Uuid(v) => Some(Value::Uuid(*v)),
    }
  }
}

impl std::fmt::Display for PrimaryKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      PrimaryKey::GlobalKey(v) => write!(f, "gk({v})"),
      PrimaryKey::Null => f.write_str("null"),
      PrimaryKey::Int(v) => write!(f, "{v}"),
      PrimaryKey::String(v) => write!(f, "{v:?}"),
      PrimaryKey::ObjectId(v) => write!(f, "{v}"),
      PrimaryKey::Uuid(v) => write!(f, "{v}"),
    }
  }
}

// ============================================================================
// Paths
// ============================================================================

/// One step below the named field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathElement {
  /// List position
  Index(u32),
  /// Dictionary key
  Key(String),
  /// Field of an embedded object
  Field(String),
}

impl std::fmt::Display for PathElement {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      PathElement::Index(i) => write!(f, "[{i}]"),
      PathElement::Key(k) => write!(f, "[{k:?}]"),
      PathElement::Field(name) => write!(f, ".{name}"),
    }
  }
}

/// Full address of a mutation target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInstruction {
  pub table: String,
  pub object: PrimaryKey,
  pub field: String,
  pub path: Vec<PathElement>,
}

impl std::fmt::Display for PathInstruction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}[{}].{}", self.table, self.object, self.field)?;
    for p in &self.path {
      write!(f, "{p}")?;
    }
    Ok(())
  }
}

// ============================================================================
// Payloads
// ============================================================================

/// Value carried by a mutation instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
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
  /// Link to an object named by primary key in the target table
  Link {
    target_table: String,
    target: PrimaryKey,
  },
  /// Create an embedded object at the addressed position
  ObjectValue,
  /// Erase the addressed dictionary entry
  Erased,
}

impl Payload {
  pub fn type_name(&self) -> &'static str {
    match self {
      Payload::Null => "NULL",
      Payload::Int(_) => "Int",
      Payload::Bool(_) => "Bool",
      Payload::String(_) => "String",
      Payload::Binary(_) => "Binary",
      Payload::Float(_) => "Float",
      Payload::Double(_) => "Double",
      Payload::Timestamp(_) => "Timestamp",
      Payload::ObjectId(_) => "ObjectId",
      Payload::Uuid(_) => "UUID",
      Payload::Link { .. } => "Link",
      Payload::ObjectValue => "ObjectValue",
      Payload::Erased => "Erased",
    }
  }
}

// ============================================================================
// Instructions
// ============================================================================

/// Table shape requested by `AddTable`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSpec {
  PrimaryKey {
    field: String,
    key_type: DataType,
    nullable: bool,
  },
  GlobalKey,
  Embedded,
}

/// One typed mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
  AddTable {
    table: String,
    spec: TableSpec,
  },
  EraseTable {
    table: String,
  },
  AddColumn {
    table: String,
    field: String,
    data_type: DataType,
    nullable: bool,
    collection: CollectionKind,
    link_target: Option<String>,
  },
  EraseColumn {
    table: String,
    field: String,
  },
  CreateObject {
    table: String,
    object: PrimaryKey,
  },
  EraseObject {
    table: String,
    object: PrimaryKey,
  },
  Update {
    path: PathInstruction,
    value: Payload,
    /// Set when the write carries a default rather than a user change
    is_default: bool,
  },
  AddInteger {
    path: PathInstruction,
    value: i64,
  },
  ArrayInsert {
    path: PathInstruction,
    index: u32,
    value: Payload,
    prior_size: u32,
  },
  ArrayMove {
    path: PathInstruction,
    from: u32,
    to: u32,
    prior_size: u32,
  },
  ArrayErase {
    path: PathInstruction,
    index: u32,
    prior_size: u32,
  },
  Clear {
    path: PathInstruction,
  },
  SetInsert {
    path: PathInstruction,
    value: Payload,
  },
  SetErase {
    path: PathInstruction,
    value: Payload,
  },
}

impl Instruction {
  /// Table the instruction addresses
  pub fn table_name(&self) -> &str {
    match self {
      Instruction::AddTable { table, .. }
      | Instruction::EraseTable { table }
      | Instruction::AddColumn { table, .. }
      | Instruction::EraseColumn { table, .. }
      | Instruction::CreateObject { table, .. }
      | Instruction::EraseObject { table, .. } => table,
      Instruction::Update { path, .. }
      | Instruction::AddInteger { path, .. }
      | Instruction::ArrayInsert { path, .. }
      | Instruction::ArrayMove { path, .. }
      | Instruction::ArrayErase { path, .. }
      | Instruction::Clear { path }
      | Instruction::SetInsert { path, .. }
      | Instruction::SetErase { path, .. } => &path.table,
    }
  }
}

// ============================================================================
// Changeset
// ============================================================================

/// A parsed changeset: header plus ordered instructions
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Changeset {
  pub version: Version,
  pub last_integrated_remote_version: Version,
  pub origin_file_ident: u64,
  pub origin_timestamp: i64,
  pub instructions: Vec<Instruction>,
}

impl Changeset {
  pub fn encode(&self) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u32(CHANGESET_MAGIC);
    w.write_u16(CHANGESET_VERSION);
    w.write_u16(0); // flags
    w.write_u64(self.version);
    w.write_u64(self.last_integrated_remote_version);
    w.write_u64(self.origin_file_ident);
    w.write_i64(self.origin_timestamp);
    w.write_u32(self.instructions.len() as u32);
    for instr in &self.instructions {
      encode_instruction(&mut w, instr);
    }
    let mut bytes = w.into_bytes();
    let crc = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
    bytes
  }

  pub fn decode(bytes: &[u8]) -> Result<Changeset> {
    if bytes.len() < 4 {
      return Err(TideError::BadChangeset("changeset frame too short".into()));
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_le_bytes(crc_bytes.try_into().expect("4 bytes"));
    if crc32fast::hash(body) != stored {
      return Err(TideError::BadChangeset("changeset crc mismatch".into()));
    }

    let mut r = Reader::new(body);
    if r.read_u32()? != CHANGESET_MAGIC {
      return Err(TideError::BadChangeset("bad changeset magic".into()));
    }
    let frame_version = r.read_u16()?;
    if frame_version != CHANGESET_VERSION {
      return Err(TideError::BadChangeset(format!(
        "unsupported changeset frame version {frame_version}"
      )));
    }
    let _flags = r.read_u16()?;
    let version = r.read_u64()?;
    let last_integrated_remote_version = r.read_u64()?;
    let origin_file_ident = r.read_u64()?;
    let origin_timestamp = r.read_i64()?;
    let count = r.read_u32()?;
    let mut instructions = Vec::with_capacity(count as usize);
    for _ in 0..count {
      instructions.push(decode_instruction(&mut r)?);
    }
    Ok(Changeset {
      version,
      last_integrated_remote_version,
      origin_file_ident,
      origin_timestamp,
      instructions,
    })
  }
}

// ============================================================================
// Wire codec
// ============================================================================

fn encode_pk(w: &mut Writer, pk: &PrimaryKey) {
  match pk {
    PrimaryKey::GlobalKey(v) => {
      w.write_u8(0);
      w.write_u64(*v);
    }
    PrimaryKey::Null => w.write_u8(1),
    PrimaryKey::Int(v) => {
      w.write_u8(2);
      w.write_i64(*v);
    }
    PrimaryKey::String(v) => {
      w.write_u8(3);
      w.write_string(v);
    }
    PrimaryKey::ObjectId(v) => {
      w.write_u8(4);
      w.write_array(&v.0);
    }
    PrimaryKey::Uuid(v) => {
      w.write_u8(5);
      w.write_array(&v.0);
    }
  }
}

fn decode_pk(r: &mut Reader<'_>) -> Result<PrimaryKey> {
  Ok(match r.read_u8()? {
    0 => PrimaryKey::GlobalKey(r.read_u64()?),
    1 => PrimaryKey::Null,
    2 => PrimaryKey::Int(r.read_i64()?),
    3 => PrimaryKey::String(r.read_string()?),
    4 => PrimaryKey::ObjectId(ObjectId(r.read_array()?)),
    5 => PrimaryKey::Uuid(Uuid(r.read_array()?)),
    tag => {
      return Err(TideError::BadChangeset(format!(
        "unknown primary key tag {tag}"
      )));
    }
  })
}

fn encode_path(w: &mut Writer, path: &PathInstruction) {
  w.write_string(&path.table);
  encode_pk(w, &path.object);
  w.write_string(&path.field);
  w.write_u32(path.path.len() as u32);
  for p in &path.path {
    match p {
      PathElement::Index(i) => {
        w.write_u8(0);
        w.write_u32(*i);
      }
      PathElement::Key(k) => {
        w.write_u8(1);
        w.write_string(k);
      }
      PathElement::Field(name) => {
        w.write_u8(2);
        w.write_string(name);
      }
    }
  }
}

fn decode_path(r: &mut Reader<'_>) -> Result<PathInstruction> {
  let table = r.read_string()?;
  let object = decode_pk(r)?;
  let field = r.read_string()?;
  let count = r.read_u32()?;
  let mut path = Vec::with_capacity(count as usize);
  for _ in 0..count {
    path.push(match r.read_u8()? {
      0 => PathElement::Index(r.read_u32()?),
      1 => PathElement::Key(r.read_string()?),
      2 => PathElement::Field(r.read_string()?),
      tag => {
        return Err(TideError::BadChangeset(format!(
          "unknown path element tag {tag}"
        )));
      }
    });
  }
  Ok(PathInstruction {
    table,
    object,
    field,
    path,
  })
}

fn encode_payload(w: &mut Writer, payload: &Payload) {
  match payload {
    Payload::Null => w.write_u8(0),
    Payload::Int(v) => {
      w.write_u8(1);
      w.write_i64(*v);
    }
    Payload::Bool(v) => {
      w.write_u8(2);
      w.write_u8(u8::from(*v));
    }
    Payload::String(v) => {
      w.write_u8(3);
      w.write_string(v);
    }
    Payload::Binary(v) => {
      w.write_u8(4);
      w.write_bytes(v);
    }
    Payload::Float(v) => {
      w.write_u8(5);
      w.write_f32(*v);
    }
    Payload::Double(v) => {
      w.write_u8(6);
      w.write_f64(*v);
    }
    Payload::Timestamp(v) => {
      w.write_u8(7);
      w.write_i64(v.seconds);
      w.write_u32(v.nanoseconds);
    }
    Payload::ObjectId(v) => {
      w.write_u8(8);
      w.write_array(&v.0);
    }
    Payload::Uuid(v) => {
      w.write_u8(9);
      w.write_array(&v.0);
    }
    Payload::Link {
      target_table,
      target,
    } => {
      w.write_u8(10);
      w.write_string(target_table);
      encode_pk(w, target);
    }
    Payload::ObjectValue => w.write_u8(11),
    Payload::Erased => w.write_u8(12),
  }
}

fn decode_payload(r: &mut Reader<'_>) -> Result<Payload> {
  Ok(match r.read_u8()? {
    0 => Payload::Null,
    1 => Payload::Int(r.read_i64()?),
    2 => Payload::Bool(r.read_u8()? != 0),
    3 => Payload::String(r.read_string()?),
    4 => Payload::Binary(r.read_bytes()?),
    5 => Payload::Float(r.read_f32()?),
    6 => Payload::Double(r.read_f64()?),
    7 => Payload::Timestamp(Timestamp {
      seconds: r.read_i64()?,
      nanoseconds: r.read_u32()?,
    }),
    8 => Payload::ObjectId(ObjectId(r.read_array()?)),
    9 => Payload::Uuid(Uuid(r.read_array()?)),
    10 => Payload::Link {
      target_table: r.read_string()?,
      target: decode_pk(r)?,
    },
    11 => Payload::ObjectValue,
    12 => Payload::Erased,
    tag => {
      return Err(TideError::BadChangeset(format!(
        "unknown payload tag {tag}"
      )));
    }
  })
}

fn encode_instruction(w: &mut Writer, instr: &Instruction) {
  match instr {
    Instruction::AddTable { table, spec } => {
      w.write_u8(0);
      w.write_string(table);
      match spec {
        TableSpec::PrimaryKey {
          field,
          key_type,
          nullable,
        } => {
          w.write_u8(0);
          w.write_string(field);
          w.write_u8(data_type_tag(*key_type));
          w.write_u8(u8::from(*nullable));
        }
        TableSpec::GlobalKey => w.write_u8(1),
        TableSpec::Embedded => w.write_u8(2),
      }
    }
    Instruction::EraseTable { table } => {
      w.write_u8(1);
      w.write_string(table);
    }
    Instruction::AddColumn {
      table,
      field,
      data_type,
      nullable,
      collection,
      link_target,
    } => {
      w.write_u8(2);
      w.write_string(table);
      w.write_string(field);
      w.write_u8(data_type_tag(*data_type));
      w.write_u8(u8::from(*nullable));
      w.write_u8(collection_tag(*collection));
      match link_target {
        Some(target) => {
          w.write_u8(1);
          w.write_string(target);
        }
        None => w.write_u8(0),
      }
    }
    Instruction::EraseColumn { table, field } => {
      w.write_u8(3);
      w.write_string(table);
      w.write_string(field);
    }
    Instruction::CreateObject { table, object } => {
      w.write_u8(4);
      w.write_string(table);
      encode_pk(w, object);
    }
    Instruction::EraseObject { table, object } => {
      w.write_u8(5);
      w.write_string(table);
      encode_pk(w, object);
    }
    Instruction::Update {
      path,
      value,
      is_default,
    } => {
      w.write_u8(6);
      encode_path(w, path);
      encode_payload(w, value);
      w.write_u8(u8::from(*is_default));
    }
    Instruction::AddInteger { path, value } => {
      w.write_u8(7);
      encode_path(w, path);
      w.write_i64(*value);
    }
    Instruction::ArrayInsert {
      path,
      index,
      value,
      prior_size,
    } => {
      w.write_u8(8);
      encode_path(w, path);
      w.write_u32(*index);
      encode_payload(w, value);
      w.write_u32(*prior_size);
    }
    Instruction::ArrayMove {
      path,
      from,
      to,
      prior_size,
    } => {
      w.write_u8(9);
      encode_path(w, path);
      w.write_u32(*from);
      w.write_u32(*to);
      w.write_u32(*prior_size);
    }
    Instruction::ArrayErase {
      path,
      index,
      prior_size,
    } => {
      w.write_u8(10);
      encode_path(w, path);
      w.write_u32(*index);
      w.write_u32(*prior_size);
    }
    Instruction::Clear { path } => {
      w.write_u8(11);
      encode_path(w, path);
    }
    Instruction::SetInsert { path, value } => {
      w.write_u8(12);
      encode_path(w, path);
      encode_payload(w, value);
    }
    Instruction::SetErase { path, value } => {
      w.write_u8(13);
      encode_path(w, path);
      encode_payload(w, value);
    }
  }
}

fn decode_instruction(r: &mut Reader<'_>) -> Result<Instruction> {
  Ok(match r.read_u8()? {
    0 => {
      let table = r.read_string()?;
      let spec = match r.read_u8()? {
        0 => TableSpec::PrimaryKey {
          field: r.read_string()?,
          key_type: crate::db::group::decode_data_type(r.read_u8()?)?,
          nullable: r.read_u8()? != 0,
        },
        1 => TableSpec::GlobalKey,
        2 => TableSpec::Embedded,
        tag => {
          return Err(TideError::BadChangeset(format!(
            "unknown table spec tag {tag}"
          )));
        }
      };
      Instruction::AddTable { table, spec }
    }
    1 => Instruction::EraseTable {
      table: r.read_string()?,
    },
    2 => Instruction::AddColumn {
      table: r.read_string()?,
      field: r.read_string()?,
      data_type: crate::db::group::decode_data_type(r.read_u8()?)?,
      nullable: r.read_u8()? != 0,
      collection: collection_from_tag(r.read_u8()?)?,
      link_target: if r.read_u8()? != 0 {
        Some(r.read_string()?)
      } else {
        None
      },
    },
    3 => Instruction::EraseColumn {
      table: r.read_string()?,
      field: r.read_string()?,
    },
    4 => Instruction::CreateObject {
      table: r.read_string()?,
      object: decode_pk(r)?,
    },
    5 => Instruction::EraseObject {
      table: r.read_string()?,
      object: decode_pk(r)?,
    },
    6 => Instruction::Update {
      path: decode_path(r)?,
      value: decode_payload(r)?,
      is_default: r.read_u8()? != 0,
    },
    7 => Instruction::AddInteger {
      path: decode_path(r)?,
      value: r.read_i64()?,
    },
    8 => Instruction::ArrayInsert {
      path: decode_path(r)?,
      index: r.read_u32()?,
      value: decode_payload(r)?,
      prior_size: r.read_u32()?,
    },
    9 => Instruction::ArrayMove {
      path: decode_path(r)?,
      from: r.read_u32()?,
      to: r.read_u32()?,
      prior_size: r.read_u32()?,
    },
    10 => Instruction::ArrayErase {
      path: decode_path(r)?,
      index: r.read_u32()?,
      prior_size: r.read_u32()?,
    },
    11 => Instruction::Clear {
      path: decode_path(r)?,
    },
    12 => Instruction::SetInsert {
      path: decode_path(r)?,
      value: decode_payload(r)?,
    },
    13 => Instruction::SetErase {
      path: decode_path(r)?,
      value: decode_payload(r)?,
    },
    tag => {
      return Err(TideError::BadChangeset(format!(
        "unknown instruction tag {tag}"
      )));
    }
  })
}

fn data_type_tag(t: DataType) -> u8 {
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

fn collection_tag(kind: CollectionKind) -> u8 {
  match kind {
    CollectionKind::Single => 0,
    CollectionKind::List => 1,
    CollectionKind::Set => 2,
    CollectionKind::Dictionary => 3,
  }
}

fn collection_from_tag(tag: u8) -> Result<CollectionKind> {
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

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_changeset() -> Changeset {
    Changeset {
      version: 12,
      last_integrated_remote_version: 9,
      origin_file_ident: 77,
      origin_timestamp: 1_700_000_000,
      instructions: vec![
        Instruction::AddTable {
          table: "person".into(),
          spec: TableSpec::PrimaryKey {
            field: "id".into(),
            key_type: DataType::Int,
            nullable: false,
          },
        },
        Instruction::CreateObject {
          table: "person".into(),
          object: PrimaryKey::Int(1),
        },
        Instruction::Update {
          path: PathInstruction {
            table: "person".into(),
            object: PrimaryKey::Int(1),
            field: "name".into(),
            path: vec![],
          },
          value: Payload::String("ada".into()),
          is_default: false,
        },
        Instruction::ArrayInsert {
          path: PathInstruction {
            table: "person".into(),
            object: PrimaryKey::Int(1),
            field: "tags".into(),
            path: vec![],
          },
          index: 0,
          value: Payload::String("first".into()),
          prior_size: 0,
        },
      ],
    }
  }

  #[test]
  fn changeset_round_trips() {
    let cs = sample_changeset();
    let decoded = Changeset::decode(&cs.encode()).unwrap();
    assert_eq!(decoded, cs);
  }

  #[test]
  fn corrupted_frame_is_rejected() {
    let mut bytes = sample_changeset().encode();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xff;
    assert!(matches!(
      Changeset::decode(&bytes),
      Err(TideError::BadChangeset(_))
    ));
  }

  #[test]
  fn truncated_frame_is_rejected() {
    let bytes = sample_changeset().encode();
    assert!(Changeset::decode(&bytes[..bytes.len() - 5]).is_err());
  }
}
