//! Declarative schema description
//!
//! Used by the coordinator's schema cache and by configuration
//! compatibility checks. The live schema is derived from the group.

use crate::types::{CollectionKind, DataType};

/// Sentinel for "no schema version supplied"
pub const NOT_VERSIONED: u64 = u64::MAX;

/// How a realm treats schema differences on open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaMode {
  /// Apply migrations through the migration function
  #[default]
  Automatic,
  /// File may not be modified at all
  Immutable,
  /// Schema may not be changed, data may
  ReadOnly,
  /// New columns/tables are added automatically (sync realms)
  AdditiveDiscovered,
  /// Like AdditiveDiscovered, but only the named schema is reported
  AdditiveExplicit,
  /// Delete and recreate the file on mismatch
  ResetFile,
}

/// One property of an object class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
  pub name: String,
  pub data_type: DataType,
  pub collection: CollectionKind,
  pub nullable: bool,
  pub indexed: bool,
  /// Target class name for link-typed properties
  pub target: Option<String>,
}

impl Property {
  pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
    Self {
      name: name.into(),
      data_type,
      collection: CollectionKind::Single,
      nullable: false,
      indexed: false,
      target: None,
    }
  }

  pub fn nullable(mut self, value: bool) -> Self {
    self.nullable = value;
    self
  }

  pub fn collection(mut self, kind: CollectionKind) -> Self {
    self.collection = kind;
    self
  }

  pub fn indexed(mut self, value: bool) -> Self {
    self.indexed = value;
    self
  }

  pub fn target(mut self, table: impl Into<String>) -> Self {
    self.target = Some(table.into());
    self
  }
}

/// One object class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSchema {
  pub name: String,
  pub embedded: bool,
  /// Name of the primary key property, if any
  pub primary_key: Option<String>,
  pub properties: Vec<Property>,
}

impl ObjectSchema {
  pub fn property(&self, name: &str) -> Option<&Property> {
    self.properties.iter().find(|p| p.name == name)
  }
}

/// An ordered set of object classes.
///
/// Equality is exact: the same properties in a different order are a
/// different schema.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
  pub objects: Vec<ObjectSchema>,
}

impl Schema {
  pub fn new(objects: Vec<ObjectSchema>) -> Self {
    Self { objects }
  }

  pub fn is_empty(&self) -> bool {
    self.objects.is_empty()
  }

  pub fn object(&self, name: &str) -> Option<&ObjectSchema> {
    self.objects.iter().find(|o| o.name == name)
  }
}
