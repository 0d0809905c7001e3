//! The assembled schema: an immutable, versioned snapshot of every attached
//! data source's types plus the metadata the compiler needs.
//!
//! Cyclic relations are kept as names into the metadata tables, never as
//! direct pointers, so a snapshot is cheaply cloneable and shareable across
//! requests.

use std::sync::Arc;

use apollo_compiler::Name;
use apollo_compiler::Schema;
use apollo_compiler::validation::Valid;
use indexmap::IndexMap;
use indexmap::IndexSet;
use sha2::Digest;
use sha2::Sha256;

use crate::error::HugrError;
use crate::source::SourceKind;

pub(crate) mod assemble;
pub(crate) mod derive;
pub mod directives;
pub mod modules;

pub use assemble::Assembler;
pub use modules::ModulePath;
pub use modules::ModuleRootKind;

/// Classification of a scalar field, driving filter operators, aggregation
/// functions and SQL lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum ScalarClass {
    #[strum(to_string = "Int")]
    Int,
    #[strum(to_string = "BigInt")]
    BigInt,
    #[strum(to_string = "Float")]
    Float,
    #[strum(to_string = "String")]
    String,
    #[strum(to_string = "Boolean")]
    Boolean,
    #[strum(to_string = "Timestamp")]
    Timestamp,
    #[strum(to_string = "Date")]
    Date,
    #[strum(to_string = "Time")]
    Time,
    #[strum(to_string = "Interval")]
    Interval,
    #[strum(to_string = "JSON")]
    Json,
    #[strum(to_string = "Geometry")]
    Geometry,
    #[strum(to_string = "IntRange")]
    IntRange,
    #[strum(to_string = "BigIntRange")]
    BigIntRange,
    #[strum(to_string = "TimestampRange")]
    TimestampRange,
    #[strum(to_string = "DateRange")]
    DateRange,
}

impl ScalarClass {
    pub fn from_type_name(name: &str) -> Option<Self> {
        Some(match name {
            "Int" => Self::Int,
            "BigInt" => Self::BigInt,
            "Float" => Self::Float,
            "String" | "ID" => Self::String,
            "Boolean" => Self::Boolean,
            "Timestamp" => Self::Timestamp,
            "Date" => Self::Date,
            "Time" => Self::Time,
            "Interval" => Self::Interval,
            "JSON" => Self::Json,
            "Geometry" => Self::Geometry,
            "IntRange" => Self::IntRange,
            "BigIntRange" => Self::BigIntRange,
            "TimestampRange" => Self::TimestampRange,
            "DateRange" => Self::DateRange,
            _ => return None,
        })
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int | Self::BigInt | Self::Float)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, Self::Timestamp | Self::Date | Self::Time)
    }

    pub fn is_range(&self) -> bool {
        matches!(
            self,
            Self::IntRange | Self::BigIntRange | Self::TimestampRange | Self::DateRange
        )
    }

    /// The shared filter input type for this scalar, e.g. `String_filter_input`.
    pub fn filter_input_name(&self) -> String {
        format!("{self}_filter_input")
    }

    /// The shared per-field aggregation object, e.g. `Float_aggregation`.
    pub fn aggregation_type_name(&self) -> String {
        format!("{self}_aggregation")
    }
}

/// Table kind of an assembled object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Table { read_only: bool },
    View,
    Cube,
}

impl ObjectKind {
    pub fn is_mutable(&self) -> bool {
        matches!(self, Self::Table { read_only: false })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    ManyToOne,
    OneToMany,
}

/// A declared relation between two object types, by name only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub target: Name,
    pub kind: RelationKind,
    pub source_fields: Vec<Name>,
    pub target_fields: Vec<Name>,
    pub inner: bool,
    /// True when the relation crosses data sources (installed via `@join`).
    pub cross_source: bool,
}

/// A field backed by a source-side function call (`@function_call` or
/// `@table_function_call_join` extension fields).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionBinding {
    pub sql_name: String,
    /// Function argument name to parent column, for join-style calls.
    pub args: Vec<(String, String)>,
    pub is_table: bool,
}

/// A field of an assembled object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMeta {
    pub name: Name,
    /// Column name at the owning source; differs from `name` under `@field_source`.
    pub column: String,
    pub scalar: Option<ScalarClass>,
    pub nullable: bool,
    pub has_default: bool,
    pub relation: Option<Relation>,
    /// Aggregation function for `@measurement` fields on cubes.
    pub measurement: Option<String>,
    pub function: Option<FunctionBinding>,
}

impl FieldMeta {
    pub fn is_scalar(&self) -> bool {
        self.scalar.is_some()
    }
}

/// A unique key: `_by_<suffix>` lookups are generated from these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueKey {
    pub suffix: String,
    pub fields: Vec<Name>,
}

/// Everything the compiler knows about one object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub name: Name,
    pub source: String,
    pub module: ModulePath,
    pub kind: ObjectKind,
    /// Relation name at the owning source.
    pub sql_name: String,
    pub fields: IndexMap<Name, FieldMeta>,
    pub pk: Vec<Name>,
    pub uniques: Vec<UniqueKey>,
    pub soft_delete_field: Option<Name>,
    pub hypertable_time_key: Option<Name>,
}

impl ObjectMeta {
    pub fn field(&self, name: &str) -> Option<&FieldMeta> {
        self.fields.get(name)
    }

    pub fn geometry_fields(&self) -> impl Iterator<Item = &FieldMeta> {
        self.fields
            .values()
            .filter(|f| f.scalar == Some(ScalarClass::Geometry))
    }

    pub fn has_geometry(&self) -> bool {
        self.geometry_fields().next().is_some()
    }

    /// Scalar fields that act as dimensions in bucket aggregations: everything
    /// that is not a measurement.
    pub fn dimension_fields(&self) -> impl Iterator<Item = &FieldMeta> {
        self.fields
            .values()
            .filter(|f| f.is_scalar() && f.measurement.is_none())
    }
}

/// What a generated root (or module root) field resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootOperationKind {
    Select,
    SelectByPk,
    SelectByUnique { suffix: String },
    Aggregate,
    BucketAggregate,
    Insert,
    Update,
    Delete,
    Function { sql_name: String },
    MutationFunction { sql_name: String },
    H3,
    /// A field mounting a module (or function namespace) root type.
    ModuleMount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootFieldMeta {
    pub object: Option<Name>,
    pub kind: RootOperationKind,
    pub module: ModulePath,
}

/// A function exposed through the `Function`/`MutationFunction` roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionMeta {
    pub name: Name,
    pub source: String,
    pub module: ModulePath,
    pub sql_name: String,
    pub is_mutation: bool,
    /// Argument name to scalar class, in declaration order.
    pub args: IndexMap<Name, ScalarClass>,
    pub returns_object: Option<Name>,
    pub returns_set: bool,
}

/// Side tables produced by assembly, addressed by type and field names.
#[derive(Debug, Clone, Default)]
pub struct SchemaMetadata {
    /// Data object types by final (prefixed) GraphQL type name.
    pub objects: IndexMap<Name, ObjectMeta>,
    /// Root and module-root operation fields, keyed `"<ParentType>.<field>"`.
    pub roots: IndexMap<String, RootFieldMeta>,
    /// Functions by final GraphQL field name.
    pub functions: IndexMap<Name, FunctionMeta>,
    /// Attached source kinds by source name.
    pub sources: IndexMap<String, SourceKind>,
    /// Every module path with at least one member, parents included.
    pub modules: IndexSet<ModulePath>,
}

impl SchemaMetadata {
    pub fn object(&self, name: &str) -> Option<&ObjectMeta> {
        self.objects.get(name)
    }

    pub fn root_field(&self, parent: &str, field: &str) -> Option<&RootFieldMeta> {
        self.roots.get(&format!("{parent}.{field}"))
    }

    pub fn has_h3_capable_source(&self) -> bool {
        self.objects.values().any(ObjectMeta::has_geometry)
    }
}

/// An immutable, versioned view of the assembled schema and its metadata.
///
/// Published snapshots are shared behind `Arc`; active requests keep the
/// snapshot they acquired while newer ones are swapped in.
#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    inner: Arc<SnapshotInner>,
}

#[derive(Debug)]
struct SnapshotInner {
    schema: Valid<Schema>,
    metadata: SchemaMetadata,
    version: u64,
    hash: String,
}

impl SchemaSnapshot {
    pub(crate) fn new(
        schema: Valid<Schema>,
        metadata: SchemaMetadata,
        version: u64,
    ) -> Result<Self, HugrError> {
        let sdl = schema.to_string();
        let hash = hex_digest(sdl.as_bytes());
        Ok(Self {
            inner: Arc::new(SnapshotInner {
                schema,
                metadata,
                version,
                hash,
            }),
        })
    }

    pub fn schema(&self) -> &Valid<Schema> {
        &self.inner.schema
    }

    pub fn metadata(&self) -> &SchemaMetadata {
        &self.inner.metadata
    }

    pub fn version(&self) -> u64 {
        self.inner.version
    }

    /// Content hash of the generated SDL; folded into cache fingerprints so
    /// nodes that missed an invalidation broadcast still converge.
    pub fn hash(&self) -> &str {
        &self.inner.hash
    }

    pub fn sdl(&self) -> String {
        self.inner.schema.to_string()
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
