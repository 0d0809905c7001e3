//! The data source registry: attach/detach/reload lifecycle, capability
//! tracking and atomic schema snapshot publication.
//!
//! Snapshots publish through a watch channel: requests clone the current
//! `Arc`-backed snapshot without locking and keep it for their lifetime;
//! mutations assemble a new snapshot and swap the pointer. A failed assembly
//! retains the previous snapshot.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use hugr_core::catalog::CatalogDocument;
use hugr_core::catalog::CatalogSource;
use hugr_core::catalog::LoadedCatalog;
use hugr_core::catalog::substitute_env;
use hugr_core::error::HugrError;
use hugr_core::error::SingleHugrError;
use hugr_core::schema::Assembler;
use hugr_core::schema::SchemaSnapshot;
use hugr_core::source::Capabilities;
use hugr_core::source::DataSource;
use indexmap::IndexMap;
use tokio::sync::RwLock;
use tokio::sync::broadcast;
use tokio::sync::watch;

use crate::catalogs::CatalogStores;
use crate::engine::Engine;

/// Broadcast on every schema or data-source change; the cache and the cluster
/// coordinator subscribe.
#[derive(Debug, Clone)]
pub struct InvalidationEvent {
    pub tags: BTreeSet<String>,
    pub schema_version: u64,
}

struct AttachedSource {
    record: DataSource,
    catalogs: Vec<LoadedCatalog>,
    capabilities: Capabilities,
}

pub struct DataSourceRegistry {
    engine: Arc<dyn Engine>,
    stores: CatalogStores,
    catalog_sources: RwLock<IndexMap<String, CatalogSource>>,
    attached: RwLock<IndexMap<String, AttachedSource>>,
    snapshot_tx: watch::Sender<SchemaSnapshot>,
    invalidation_tx: broadcast::Sender<InvalidationEvent>,
    version: AtomicU64,
    /// Grace period for draining active queries before a detach.
    detach_grace: Duration,
}

impl DataSourceRegistry {
    pub fn new(engine: Arc<dyn Engine>, detach_grace: Duration) -> Result<Self, HugrError> {
        let initial = Assembler::new().assemble(0)?;
        let (snapshot_tx, _) = watch::channel(initial);
        let (invalidation_tx, _) = broadcast::channel(64);
        Ok(Self {
            engine,
            stores: CatalogStores::default(),
            catalog_sources: RwLock::new(IndexMap::new()),
            attached: RwLock::new(IndexMap::new()),
            snapshot_tx,
            invalidation_tx,
            version: AtomicU64::new(0),
            detach_grace,
        })
    }

    /// The current snapshot; requests keep the clone they acquired.
    pub fn snapshot(&self) -> SchemaSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<SchemaSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.invalidation_tx.subscribe()
    }

    pub async fn capabilities(&self) -> IndexMap<String, Capabilities> {
        self.attached
            .read()
            .await
            .iter()
            .map(|(name, source)| (name.clone(), source.capabilities))
            .collect()
    }

    pub async fn register_catalog_source(&self, catalog: CatalogSource) {
        self.catalog_sources
            .write()
            .await
            .insert(catalog.name.clone(), catalog);
    }

    /// Opens the driver, loads (or introspects) the catalogs, and publishes a
    /// new snapshot. On any failure the previous snapshot stays active.
    #[tracing::instrument(skip(self, source), fields(source = %source.name))]
    pub async fn attach(&self, source: DataSource) -> Result<(), HugrError> {
        if source.disabled {
            return Err(SingleHugrError::InvalidConfiguration {
                message: format!("data source \"{}\" is disabled", source.name),
            }
            .into());
        }
        let path = substitute_env(&source.path, &source.name, |name| std::env::var(name).ok())?;
        if !path.is_empty() {
            self.engine
                .attach(&source.name, &source.kind.to_string(), &path)
                .await?;
        }

        let catalogs = match self.load_catalogs(&source).await {
            Ok(catalogs) => catalogs,
            Err(err) => {
                // Roll the driver attachment back so a retry starts clean.
                let _ = self.engine.detach(&source.name).await;
                return Err(err);
            }
        };

        let capabilities = Capabilities::for_kind(source.kind);
        {
            let mut attached = self.attached.write().await;
            attached.insert(
                source.name.clone(),
                AttachedSource {
                    record: source.clone(),
                    catalogs,
                    capabilities,
                },
            );
        }
        match self.rebuild().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.attached.write().await.shift_remove(&source.name);
                let _ = self.engine.detach(&source.name).await;
                Err(err)
            }
        }
    }

    /// Drains active queries for the configured grace, closes the pool and
    /// republishes without the source.
    #[tracing::instrument(skip(self))]
    pub async fn detach(&self, name: &str) -> Result<(), HugrError> {
        let removed = self.attached.write().await.shift_remove(name);
        if removed.is_none() {
            return Err(SingleHugrError::InvalidConfiguration {
                message: format!("data source \"{name}\" is not attached"),
            }
            .into());
        }
        tokio::time::sleep(self.detach_grace).await;
        self.engine.detach(name).await?;
        self.rebuild().await
    }

    /// Detach + attach without losing schema for other sources; the snapshot
    /// swap is atomic.
    #[tracing::instrument(skip(self))]
    pub async fn reload(&self, name: &str) -> Result<(), HugrError> {
        let record = {
            let attached = self.attached.read().await;
            attached
                .get(name)
                .map(|source| source.record.clone())
                .ok_or_else(|| SingleHugrError::InvalidConfiguration {
                    message: format!("data source \"{name}\" is not attached"),
                })?
        };
        let catalogs = self.load_catalogs(&record).await?;
        {
            let mut attached = self.attached.write().await;
            if let Some(state) = attached.get_mut(name) {
                state.catalogs = catalogs;
            }
        }
        self.rebuild().await
    }

    async fn load_catalogs(&self, source: &DataSource) -> Result<Vec<LoadedCatalog>, HugrError> {
        if source.self_defined {
            let mut catalog = LoadedCatalog::new(&source.name);
            for (path, sdl) in self.engine.describe(&source.name).await? {
                catalog.insert(CatalogDocument::parse(&sdl, &path)?);
            }
            return Ok(vec![catalog]);
        }
        let catalog_sources = self.catalog_sources.read().await;
        let mut catalogs = Vec::new();
        for catalog_name in &source.catalogs {
            let catalog = catalog_sources.get(catalog_name).ok_or_else(|| {
                SingleHugrError::CatalogFetch {
                    catalog: catalog_name.clone(),
                    message: "catalog source is not registered".to_owned(),
                }
            })?;
            catalogs.push(self.stores.load(&source.name, catalog).await?);
        }
        Ok(catalogs)
    }

    async fn rebuild(&self) -> Result<(), HugrError> {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let mut assembler = Assembler::new();
        let mut tags: BTreeSet<String> = BTreeSet::new();
        {
            let attached = self.attached.read().await;
            for source in attached.values() {
                tags.insert(source.record.name.clone());
                assembler.add_source(source.record.clone(), source.catalogs.clone());
            }
        }
        let snapshot = assembler.assemble(version)?;
        for object in snapshot.metadata().objects.keys() {
            tags.insert(object.to_string());
        }
        self.snapshot_tx.send_replace(snapshot);
        let _ = self.invalidation_tx.send(InvalidationEvent {
            tags,
            schema_version: version,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use hugr_core::source::SourceKind;

    use super::*;
    use crate::engine::ScriptedEngine;

    fn source(name: &str) -> DataSource {
        DataSource {
            name: name.to_owned(),
            kind: SourceKind::Duckdb,
            prefix: String::new(),
            description: String::new(),
            as_module: false,
            disabled: false,
            path: String::new(),
            read_only: false,
            self_defined: true,
            catalogs: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    #[tokio::test]
    async fn attach_publishes_a_new_snapshot_version() {
        let engine = ScriptedEngine::respond_with(Vec::new());
        let registry =
            DataSourceRegistry::new(engine, Duration::from_millis(0)).expect("registry");
        let before = registry.snapshot().version();
        registry.attach(source("shop")).await.expect("attach");
        let after = registry.snapshot().version();
        assert!(after > before);
    }

    #[tokio::test]
    async fn detach_of_unknown_source_fails() {
        let engine = ScriptedEngine::respond_with(Vec::new());
        let registry =
            DataSourceRegistry::new(engine, Duration::from_millis(0)).expect("registry");
        assert!(registry.detach("missing").await.is_err());
    }

    #[tokio::test]
    async fn invalidation_events_carry_source_tags() {
        let engine = ScriptedEngine::respond_with(Vec::new());
        let registry =
            DataSourceRegistry::new(engine, Duration::from_millis(0)).expect("registry");
        let mut events = registry.subscribe_invalidations();
        registry.attach(source("shop")).await.expect("attach");
        let event = events.try_recv().expect("event should be broadcast");
        assert!(event.tags.contains("shop"));
    }
}
