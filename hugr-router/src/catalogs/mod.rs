//! Catalog stores: fetching SDL documents by URI scheme.
//!
//! `file://` reads `.graphql` documents from a directory (or a single file);
//! `http://` and `https://` fetch one document. The registry is keyed by
//! scheme so object-storage schemes can be plugged in without touching the
//! loader.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use hugr_core::catalog::CatalogDocument;
use hugr_core::catalog::CatalogSource;
use hugr_core::catalog::LoadedCatalog;
use hugr_core::catalog::substitute_env;
use hugr_core::error::HugrError;
use hugr_core::error::SingleHugrError;
use url::Url;

/// Fetches the raw documents of one catalog: `(path, SDL text)` pairs.
#[async_trait]
pub trait CatalogStore: Send + Sync + 'static {
    async fn fetch(&self, catalog: &CatalogSource, location: &Url)
    -> Result<Vec<(String, String)>, HugrError>;
}

/// Scheme-keyed store registry.
pub struct CatalogStores {
    stores: BTreeMap<String, Arc<dyn CatalogStore>>,
}

impl Default for CatalogStores {
    fn default() -> Self {
        let mut stores: BTreeMap<String, Arc<dyn CatalogStore>> = BTreeMap::new();
        stores.insert("file".to_owned(), Arc::new(FileStore));
        stores.insert("http".to_owned(), Arc::new(HttpStore::default()));
        stores.insert("https".to_owned(), Arc::new(HttpStore::default()));
        Self { stores }
    }
}

impl CatalogStores {
    pub fn register(&mut self, scheme: impl Into<String>, store: Arc<dyn CatalogStore>) {
        self.stores.insert(scheme.into(), store);
    }

    /// Loads one catalog: resolves `[$VAR]` templates in the path, fetches the
    /// documents and parses them.
    #[tracing::instrument(skip(self), fields(catalog = %catalog.name))]
    pub async fn load(
        &self,
        source_name: &str,
        catalog: &CatalogSource,
    ) -> Result<LoadedCatalog, HugrError> {
        let path = substitute_env(&catalog.path, &catalog.name, |name| std::env::var(name).ok())?;
        let location = if path.contains("://") {
            Url::parse(&path)
        } else {
            // Bare local paths read as file URIs.
            Url::parse(&format!("file://{path}"))
        }
        .map_err(|err| SingleHugrError::CatalogFetch {
            catalog: catalog.name.clone(),
            message: format!("invalid catalog path \"{path}\": {err}"),
        })?;

        let store = self.stores.get(location.scheme()).ok_or_else(|| {
            SingleHugrError::CatalogFetch {
                catalog: catalog.name.clone(),
                message: format!("no catalog store for scheme \"{}\"", location.scheme()),
            }
        })?;

        let mut loaded = LoadedCatalog::new(source_name);
        for (document_path, text) in store.fetch(catalog, &location).await? {
            loaded.insert(CatalogDocument::parse(&text, &document_path)?);
        }
        Ok(loaded)
    }
}

/// Local filesystem store: a directory of `*.graphql` documents or a single
/// document.
pub struct FileStore;

#[async_trait]
impl CatalogStore for FileStore {
    async fn fetch(
        &self,
        catalog: &CatalogSource,
        location: &Url,
    ) -> Result<Vec<(String, String)>, HugrError> {
        let root = Path::new(location.path()).to_path_buf();
        let fetch_error = |message: String| SingleHugrError::CatalogFetch {
            catalog: catalog.name.clone(),
            message,
        };

        let metadata = tokio::fs::metadata(&root)
            .await
            .map_err(|err| fetch_error(format!("{}: {err}", root.display())))?;
        if metadata.is_file() {
            let text = tokio::fs::read_to_string(&root)
                .await
                .map_err(|err| fetch_error(format!("{}: {err}", root.display())))?;
            return Ok(vec![(root.display().to_string(), text)]);
        }

        let mut documents = Vec::new();
        let mut entries = tokio::fs::read_dir(&root)
            .await
            .map_err(|err| fetch_error(format!("{}: {err}", root.display())))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| fetch_error(err.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "graphql") {
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|err| fetch_error(format!("{}: {err}", path.display())))?;
                documents.push((path.display().to_string(), text));
            }
        }
        documents.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(documents)
    }
}

/// HTTP(S) store: one document per catalog URI.
#[derive(Default)]
pub struct HttpStore {
    client: reqwest::Client,
}

#[async_trait]
impl CatalogStore for HttpStore {
    async fn fetch(
        &self,
        catalog: &CatalogSource,
        location: &Url,
    ) -> Result<Vec<(String, String)>, HugrError> {
        let response = self
            .client
            .get(location.clone())
            .send()
            .await
            .map_err(|err| SingleHugrError::CatalogFetch {
                catalog: catalog.name.clone(),
                message: err.to_string(),
            })?;
        let text = response
            .error_for_status()
            .map_err(|err| SingleHugrError::CatalogFetch {
                catalog: catalog.name.clone(),
                message: err.to_string(),
            })?
            .text()
            .await
            .map_err(|err| SingleHugrError::CatalogFetch {
                catalog: catalog.name.clone(),
                message: err.to_string(),
            })?;
        Ok(vec![(location.to_string(), text)])
    }
}

#[cfg(test)]
mod tests {
    use hugr_core::catalog::CatalogKind;

    use super::*;

    #[tokio::test]
    async fn loads_documents_from_a_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(
            dir.path().join("orders.graphql"),
            r#"type orders @table(name: "orders") { id: Int! @pk }"#,
        )
        .await
        .expect("write fixture");
        tokio::fs::write(dir.path().join("notes.txt"), "ignored")
            .await
            .expect("write fixture");

        let stores = CatalogStores::default();
        let catalog = CatalogSource {
            name: "shop".to_owned(),
            kind: CatalogKind::LocalFs,
            description: String::new(),
            path: dir.path().display().to_string(),
        };
        let loaded = stores.load("shop", &catalog).await.expect("load");
        assert_eq!(loaded.documents.len(), 1);
    }

    #[tokio::test]
    async fn unknown_scheme_is_a_fetch_error() {
        let stores = CatalogStores::default();
        let catalog = CatalogSource {
            name: "remote".to_owned(),
            kind: CatalogKind::Uri,
            description: String::new(),
            path: "s3://bucket/schemas".to_owned(),
        };
        let err = stores.load("remote", &catalog).await.expect_err("no s3 store");
        assert!(err.to_string().contains("s3"));
    }

    #[tokio::test]
    async fn missing_env_variable_fails_the_load() {
        let stores = CatalogStores::default();
        let catalog = CatalogSource {
            name: "templated".to_owned(),
            kind: CatalogKind::Uri,
            description: String::new(),
            path: "file:///schemas/[$HUGR_UNSET_VARIABLE]".to_owned(),
        };
        let err = stores.load("templated", &catalog).await.expect_err("missing variable");
        assert!(err.to_string().contains("HUGR_UNSET_VARIABLE"));
    }
}
