//! Schema assembly and query compilation for the Hugr data mesh.
//!
//! This crate is the synchronous, deterministic half of Hugr: it turns a set
//! of attached data sources and their SDL catalogs into an immutable
//! [`schema::SchemaSnapshot`], rewrites incoming operations under the
//! per-role permission overlay, compiles them into a relational plan plus a
//! result shape, partitions the plan between remote sources and the central
//! engine, and shapes flat row streams back into nested GraphQL responses.
//!
//! Everything that performs I/O (catalog stores, drivers, the engine handle,
//! caching, the cluster protocol) lives in the `hugr-router` crate.

pub mod catalog;
pub mod error;
pub mod permissions;
pub mod pushdown;
pub mod query_plan;
pub mod scalars;
pub mod schema;
pub mod shape;
pub mod source;
pub mod sql;

mod display_helpers;

pub use crate::error::HugrError;
pub use crate::error::SingleHugrError;
pub use crate::schema::SchemaSnapshot;

const _: () = {
    const fn assert_thread_safe<T: Sync + Send>() {}

    assert_thread_safe::<schema::SchemaSnapshot>();
    assert_thread_safe::<query_plan::CompiledQuery>();
};
