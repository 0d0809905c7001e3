//! The Hugr runtime: configuration, catalog stores, the data source registry,
//! the executor driving the central analytical engine, the two-tier response
//! cache, authentication, the core database and the cluster coordinator.
//!
//! All pure computation — schema assembly, permission overlay, query
//! compilation, push-down partitioning, result shaping — lives in
//! `hugr-core`; this crate owns everything that does I/O.

pub mod auth;
pub mod cache;
pub mod catalogs;
pub mod cluster;
pub mod configuration;
pub mod coredb;
pub mod engine;
pub mod executor;
pub mod registry;
pub mod service;

pub use crate::configuration::Configuration;
pub use crate::service::Gateway;
