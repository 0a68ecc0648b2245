//! Typed catalog records and the collaborator traits that produce them
//!
//! The catalog query layer and the DDL formatters live outside this crate; the
//! backup engine only consumes the records and statement text they return.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::connection::DbConnection;
use crate::errors::Result;
use crate::toc::AoEntry;

/// Content id of the coordinator segment.
pub const COORDINATOR_CONTENT_ID: i32 = -1;

/// One node of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub content_id: i32,
    pub hostname: String,
    pub data_dir: PathBuf,
}

impl Segment {
    pub fn is_coordinator(&self) -> bool {
        self.content_id == COORDINATOR_CONTENT_ID
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectType {
    SessionGuc,
    ResourceQueue,
    ResourceGroup,
    Role,
    RoleGrant,
    Tablespace,
    Database,
    Schema,
    Extension,
    Type,
    Function,
    Table,
    View,
    Sequence,
    Index,
    Constraint,
    Trigger,
    Rule,
    Statistics,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::SessionGuc => "SESSION GUCS",
            ObjectType::ResourceQueue => "RESOURCE QUEUE",
            ObjectType::ResourceGroup => "RESOURCE GROUP",
            ObjectType::Role => "ROLE",
            ObjectType::RoleGrant => "ROLE GRANT",
            ObjectType::Tablespace => "TABLESPACE",
            ObjectType::Database => "DATABASE",
            ObjectType::Schema => "SCHEMA",
            ObjectType::Extension => "EXTENSION",
            ObjectType::Type => "TYPE",
            ObjectType::Function => "FUNCTION",
            ObjectType::Table => "TABLE",
            ObjectType::View => "VIEW",
            ObjectType::Sequence => "SEQUENCE",
            ObjectType::Index => "INDEX",
            ObjectType::Constraint => "CONSTRAINT",
            ObjectType::Trigger => "TRIGGER",
            ObjectType::Rule => "RULE",
            ObjectType::Statistics => "STATISTICS",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of any object the DDL formatter can render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogObject {
    pub object_type: ObjectType,
    pub schema: String,
    pub name: String,
    pub oid: u32,
    /// Owning object for dependent objects (e.g. the table an index is on).
    #[serde(default)]
    pub reference_object: String,
}

impl CatalogObject {
    pub fn new(object_type: ObjectType, schema: &str, name: &str, oid: u32) -> Self {
        Self {
            object_type,
            schema: schema.to_string(),
            name: name.to_string(),
            oid,
            reference_object: String::new(),
        }
    }

    pub fn with_reference(mut self, reference_object: &str) -> Self {
        self.reference_object = reference_object.to_string();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionLevel {
    None,
    Root,
    Intermediate,
    Leaf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    Heap,
    AppendOptimized,
    AppendOptimizedColumn,
    External,
    Foreign,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub oid: u32,
    pub schema: String,
    pub name: String,
    pub storage: StorageKind,
    pub partition_level: PartitionLevel,
    pub columns: Vec<String>,
    pub dependencies: Vec<String>,
}

impl Relation {
    pub fn fqn(&self) -> String {
        qualify(&self.schema, &self.name)
    }

    pub fn is_append_optimized(&self) -> bool {
        matches!(
            self.storage,
            StorageKind::AppendOptimized | StorageKind::AppendOptimizedColumn
        )
    }

    /// External and foreign tables hold no data inside the cluster.
    pub fn has_local_data(&self) -> bool {
        !matches!(self.storage, StorageKind::External | StorageKind::Foreign)
    }

    pub fn catalog_object(&self) -> CatalogObject {
        CatalogObject::new(ObjectType::Table, &self.schema, &self.name, self.oid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub oid: u32,
    pub schema: String,
    pub name: String,
    pub is_materialized: bool,
    pub dependencies: Vec<String>,
}

impl View {
    pub fn fqn(&self) -> String {
        qualify(&self.schema, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub oid: u32,
    pub schema: String,
    pub name: String,
    pub arguments: String,
    pub dependencies: Vec<String>,
}

impl Function {
    /// Overloads share a name, so the argument list is part of the identity.
    pub fn fqn(&self) -> String {
        format!("{}({})", qualify(&self.schema, &self.name), self.arguments)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    pub oid: u32,
    pub schema: String,
    pub name: String,
    pub dependencies: Vec<String>,
}

impl TypeDef {
    pub fn fqn(&self) -> String {
        qualify(&self.schema, &self.name)
    }
}

pub fn qualify(schema: &str, name: &str) -> String {
    format!("{}.{}", schema, name)
}

/// Quotes an identifier unless it is a plain lower-case name.
pub fn quote_ident(ident: &str) -> String {
    let plain = !ident.is_empty()
        && ident
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

/// Catalog query layer: turns catalog rows into typed records.
pub trait Catalog: Send + Sync {
    fn segments(&self, conn: &mut dyn DbConnection) -> Result<Vec<Segment>>;
    fn schemas(&self, conn: &mut dyn DbConnection) -> Result<Vec<String>>;
    fn relations(&self, conn: &mut dyn DbConnection) -> Result<Vec<Relation>>;
    fn views(&self, conn: &mut dyn DbConnection) -> Result<Vec<View>>;
    fn functions(&self, conn: &mut dyn DbConnection) -> Result<Vec<Function>>;
    fn types(&self, conn: &mut dyn DbConnection) -> Result<Vec<TypeDef>>;
    /// Roles, tablespaces, resource queues and other cluster-wide objects.
    fn global_objects(&self, conn: &mut dyn DbConnection) -> Result<Vec<CatalogObject>>;
    /// Indexes, constraints, triggers and rules on the given relations.
    fn postdata_objects(
        &self,
        conn: &mut dyn DbConnection,
        relations: &[Relation],
    ) -> Result<Vec<CatalogObject>>;
    /// Modification counters of the append-optimized relations, keyed by FQN.
    fn ao_fingerprints(
        &self,
        conn: &mut dyn DbConnection,
        relations: &[Relation],
    ) -> Result<BTreeMap<String, AoEntry>>;
    fn attribute_statistics(
        &self,
        conn: &mut dyn DbConnection,
        relations: &[Relation],
    ) -> Result<Vec<CatalogObject>>;
}

/// Renders the CREATE statement text for one object.
pub trait DdlFormatter: Send + Sync {
    fn statement(&self, object: &CatalogObject) -> Result<String>;
}
