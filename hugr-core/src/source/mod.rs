//! Data source records and driver capability flags.

use serde::Deserialize;
use serde::Serialize;

/// The backend kind of an attached data source.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Postgres,
    Mysql,
    Sqlserver,
    Duckdb,
    Ducklake,
    Http,
    Embeddings,
    Extension,
}

impl SourceKind {
    /// Whether the source is backed by a SQL database the engine can attach.
    pub fn is_sql(&self) -> bool {
        matches!(
            self,
            Self::Postgres | Self::Mysql | Self::Sqlserver | Self::Duckdb | Self::Ducklake
        )
    }
}

/// What a driver can execute natively. The push-down planner only marks a
/// subtree `RemoteExecute` when every operator in it is covered by these flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub filter_pushdown: bool,
    pub order_by_pushdown: bool,
    pub limit_pushdown: bool,
    pub aggregate_pushdown: bool,
    pub join_pushdown: bool,
    pub transactions: bool,
    pub range_types: bool,
    pub geometry: bool,
    pub time_buckets: bool,
    pub upsert: bool,
}

impl Capabilities {
    /// Baseline capabilities for a source kind; drivers may narrow these at attach.
    pub fn for_kind(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Postgres => Self {
                filter_pushdown: true,
                order_by_pushdown: true,
                limit_pushdown: true,
                aggregate_pushdown: true,
                join_pushdown: true,
                transactions: true,
                range_types: true,
                geometry: true,
                time_buckets: true,
                upsert: true,
            },
            SourceKind::Mysql => Self {
                filter_pushdown: true,
                order_by_pushdown: true,
                limit_pushdown: true,
                aggregate_pushdown: true,
                join_pushdown: true,
                transactions: true,
                upsert: true,
                ..Self::default()
            },
            SourceKind::Sqlserver => Self {
                filter_pushdown: true,
                order_by_pushdown: true,
                limit_pushdown: true,
                aggregate_pushdown: true,
                join_pushdown: true,
                transactions: true,
                geometry: true,
                ..Self::default()
            },
            SourceKind::Duckdb | SourceKind::Ducklake => Self {
                filter_pushdown: true,
                order_by_pushdown: true,
                limit_pushdown: true,
                aggregate_pushdown: true,
                join_pushdown: true,
                transactions: true,
                range_types: true,
                geometry: true,
                time_buckets: true,
                upsert: true,
            },
            // HTTP and embeddings sources answer whole requests; nothing is
            // composable below the request boundary.
            SourceKind::Http | SourceKind::Embeddings => Self::default(),
            SourceKind::Extension => Self::default(),
        }
    }
}

/// A data source record, as stored in the `data_sources` system table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub as_module: bool,
    #[serde(default)]
    pub disabled: bool,
    /// Connection string; may contain `[$ENV]` templates resolved at attach.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub self_defined: bool,
    /// Ordered catalog references; order is irrelevant within a catalog but
    /// kept stable for deterministic assembly.
    #[serde(default)]
    pub catalogs: Vec<String>,
    /// Other sources this one depends on (`@dependency` declarations).
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl DataSource {
    /// Extension sources carry no connection path and must declare their
    /// dependencies explicitly.
    pub fn is_valid_extension(&self) -> bool {
        self.kind != SourceKind::Extension || (self.path.is_empty() && !self.dependencies.is_empty())
    }
}

/// Per-source connection pool limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_open_conns: usize,
    pub max_idle_conns: usize,
}

impl PoolConfig {
    pub fn for_kind(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Postgres => Self {
                max_open_conns: 64,
                max_idle_conns: 8,
            },
            _ => Self {
                max_open_conns: 16,
                max_idle_conns: 4,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_defaults_to_full_pushdown_and_pool_of_64() {
        let caps = Capabilities::for_kind(SourceKind::Postgres);
        assert!(caps.aggregate_pushdown && caps.join_pushdown && caps.time_buckets);
        assert_eq!(PoolConfig::for_kind(SourceKind::Postgres).max_open_conns, 64);
    }

    #[test]
    fn http_sources_push_nothing_down() {
        assert_eq!(
            Capabilities::for_kind(SourceKind::Http),
            Capabilities::default()
        );
    }

    #[test]
    fn extension_requires_empty_path_and_dependencies() {
        let ext = DataSource {
            name: "geo-ext".to_owned(),
            kind: SourceKind::Extension,
            prefix: String::new(),
            description: String::new(),
            as_module: false,
            disabled: false,
            path: String::new(),
            read_only: true,
            self_defined: false,
            catalogs: vec!["geo".to_owned()],
            dependencies: vec!["shop".to_owned()],
        };
        assert!(ext.is_valid_extension());
        let broken = DataSource {
            dependencies: vec![],
            ..ext
        };
        assert!(!broken.is_valid_extension());
    }
}
