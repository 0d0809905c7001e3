//! The compiled form of a GraphQL operation: a tree of relational operators,
//! the SQL statement generated from it, and a result-shape tree mapping flat
//! rows back to nested response JSON.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;

use crate::sql::SqlStatement;

pub(crate) mod aggregate;
pub mod compile;
pub(crate) mod display;
pub(crate) mod filter;
pub(crate) mod mutation;

pub use compile::Compiler;
pub use compile::CompilerOptions;

/// Opaque projection column handle (`c0`, `c1`, ...), shared between the SQL
/// projection and the shape tree.
pub type ColumnHandle = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Query,
    Mutation,
}

/// A relational operator tree. The plan drives push-down decisions and plan
/// display; SQL generation happens alongside compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_more::From)]
pub enum PlanNode {
    #[from]
    Scan(ScanNode),
    #[from(JoinNode, Box<JoinNode>)]
    Join(Box<JoinNode>),
    #[from(SpatialJoinNode, Box<SpatialJoinNode>)]
    SpatialJoin(Box<SpatialJoinNode>),
    #[from(AggregateNode, Box<AggregateNode>)]
    Aggregate(Box<AggregateNode>),
    #[from(BucketAggregateNode, Box<BucketAggregateNode>)]
    BucketAggregate(Box<BucketAggregateNode>),
    #[from(SubAggregateNode, Box<SubAggregateNode>)]
    SubAggregate(Box<SubAggregateNode>),
    #[from]
    FunctionScan(FunctionScanNode),
    #[from(H3OverlayNode, Box<H3OverlayNode>)]
    H3Overlay(Box<H3OverlayNode>),
    #[from]
    LimitOffset(Box<LimitOffsetNode>),
    #[from]
    DistinctOn(Box<DistinctOnNode>),
}

impl PlanNode {
    pub fn children(&self) -> Vec<&PlanNode> {
        match self {
            PlanNode::Scan(_) | PlanNode::FunctionScan(_) => Vec::new(),
            PlanNode::Join(node) => vec![&node.parent, &node.child],
            PlanNode::SpatialJoin(node) => vec![&node.parent, &node.child],
            PlanNode::Aggregate(node) => vec![&node.input],
            PlanNode::BucketAggregate(node) => vec![&node.input],
            PlanNode::SubAggregate(node) => vec![&node.child],
            PlanNode::H3Overlay(node) => node.inputs.iter().collect(),
            PlanNode::LimitOffset(node) => vec![&node.input],
            PlanNode::DistinctOn(node) => vec![&node.input],
        }
    }
}

/// A table or view scan with the parts of the query that could be pushed to
/// the owning source alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanNode {
    pub source: String,
    pub object: String,
    pub relation: String,
    pub alias: String,
    pub has_filter: bool,
    pub has_sort: bool,
    pub has_limit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinClass {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinNode {
    pub parent: PlanNode,
    pub child: PlanNode,
    pub kind: JoinClass,
    /// True when the two sides belong to different data sources (`_join`,
    /// `@join` extensions): the join itself can never execute remotely.
    pub cross_source: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialJoinNode {
    pub parent: PlanNode,
    pub child: PlanNode,
    pub relation: String,
    pub buffer: Option<f64>,
    pub cross_source: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateNode {
    pub input: PlanNode,
    /// Human-readable aggregation descriptions, for display and diagnostics.
    pub aggregations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketAggregateNode {
    pub input: PlanNode,
    pub keys: Vec<String>,
    pub aggregations: Vec<String>,
    pub has_having: bool,
}

/// An aggregation over a relation inside another aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAggregateNode {
    pub relation: String,
    pub child: PlanNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionScanNode {
    pub source: String,
    pub function: String,
    pub returns_set: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct H3OverlayNode {
    pub resolution: i32,
    /// Suppress cells with no data rows.
    pub inner: bool,
    pub inputs: Vec<PlanNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOffsetNode {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub input: PlanNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistinctOnNode {
    pub keys: Vec<String>,
    pub input: PlanNode,
}

/// How one object level of the response is identified and filled from rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectShape {
    /// Handles identifying a row of this object (primary key columns when
    /// declared, otherwise every scalar handle of the level).
    pub key: Vec<ColumnHandle>,
    pub fields: IndexMap<String, ShapeNode>,
    pub nullable: bool,
}

impl ObjectShape {
    /// Every scalar handle projected below this shape, keys included.
    pub fn subtree_handles(&self) -> Vec<&ColumnHandle> {
        let mut handles: Vec<&ColumnHandle> = self.key.iter().collect();
        for field in self.fields.values() {
            match field {
                ShapeNode::Scalar { handle } => handles.push(handle),
                ShapeNode::Object(object) | ShapeNode::List(object) => {
                    handles.extend(object.subtree_handles());
                }
                ShapeNode::Constant { .. } => {}
            }
        }
        handles
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShapeNode {
    Scalar { handle: ColumnHandle },
    Object(ObjectShape),
    List(ObjectShape),
    Constant { value: Value },
}

/// One compiled root field.
#[derive(Debug, Clone, PartialEq)]
pub struct RootPlan {
    /// Response key of the field itself.
    pub response_key: String,
    /// Response path from the operation root, module mounts included.
    pub path: Vec<String>,
    pub plan: PlanNode,
    pub statement: SqlStatement,
    pub params: Vec<Value>,
    pub shape: ShapeNode,
    /// Invalidation tags: owning sources and touched type names.
    pub tags: BTreeSet<String>,
}

/// The compiled operation: one statement per root field.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub kind: OperationKind,
    pub roots: Vec<RootPlan>,
    /// Greatest selection depth encountered, for diagnostics.
    pub depth: usize,
}

impl CompiledQuery {
    pub fn tags(&self) -> BTreeSet<String> {
        self.roots.iter().flat_map(|r| r.tags.clone()).collect()
    }
}
