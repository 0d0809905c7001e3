//! The opaque handle to the central analytical engine.
//!
//! The engine itself is an external collaborator: Hugr compiles one SQL
//! statement per root field and streams rows back. The default handle speaks
//! HTTP/JSON to the engine service; tests script an in-memory engine.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use futures::StreamExt;
use hugr_core::error::HugrError;
use hugr_core::error::SingleHugrError;
use hugr_core::shape::Row;
use hugr_core::sql::RenderedSql;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub type RowStream = Pin<Box<dyn Stream<Item = Result<Row, HugrError>> + Send>>;

/// A single opaque handle to the engine. Statement cancellation propagates
/// through the cancellation token; drivers that support it cancel the remote
/// source statement as well.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Executes one statement and streams result rows.
    async fn execute(
        &self,
        sql: &RenderedSql,
        cancel: &CancellationToken,
    ) -> Result<RowStream, HugrError>;

    /// Attaches a data source into the engine under its name.
    async fn attach(&self, name: &str, kind: &str, path: &str) -> Result<(), HugrError>;

    /// Detaches a data source, closing its pool.
    async fn detach(&self, name: &str) -> Result<(), HugrError>;

    /// Inspects live metadata of a `self_defined` source and returns
    /// `(document path, SDL)` pairs covering tables and views only.
    async fn describe(&self, name: &str) -> Result<Vec<(String, String)>, HugrError>;
}

/// Collects a row stream, honoring cancellation between rows.
pub async fn collect_rows(
    mut stream: RowStream,
    cancel: &CancellationToken,
) -> Result<Vec<Row>, HugrError> {
    let mut rows = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(HugrError::execution("statement cancelled"));
            }
            next = stream.next() => match next {
                Some(row) => rows.push(row?),
                None => return Ok(rows),
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    sql: &'a str,
    params: &'a [serde_json_bytes::Value],
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    rows: Vec<Row>,
    #[serde(default)]
    error: Option<String>,
}

/// The default engine handle: HTTP/JSON against the engine service.
pub struct HttpEngine {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpEngine {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    fn engine_error(message: impl std::fmt::Display) -> HugrError {
        // Engine memory failures surface as resource exhaustion, everything
        // else as an execution error.
        let message = message.to_string();
        if message.contains("out of memory") || message.contains("memory limit") {
            SingleHugrError::ResourceExhausted { message }.into()
        } else {
            HugrError::execution(message)
        }
    }
}

#[async_trait]
impl Engine for HttpEngine {
    async fn execute(
        &self,
        sql: &RenderedSql,
        cancel: &CancellationToken,
    ) -> Result<RowStream, HugrError> {
        let request = self
            .client
            .post(format!("{}/query", self.endpoint))
            .json(&ExecuteRequest {
                sql: &sql.text,
                params: &sql.params,
            })
            .send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(HugrError::execution("statement cancelled")),
            response = request => response.map_err(Self::engine_error)?,
        };
        let body: ExecuteResponse = response.json().await.map_err(Self::engine_error)?;
        if let Some(error) = body.error {
            return Err(Self::engine_error(error));
        }
        Ok(futures::stream::iter(body.rows.into_iter().map(Ok)).boxed())
    }

    async fn attach(&self, name: &str, kind: &str, path: &str) -> Result<(), HugrError> {
        self.client
            .post(format!("{}/attach", self.endpoint))
            .json(&serde_json::json!({ "name": name, "type": kind, "path": path }))
            .send()
            .await
            .map_err(Self::engine_error)?
            .error_for_status()
            .map_err(Self::engine_error)?;
        Ok(())
    }

    async fn detach(&self, name: &str) -> Result<(), HugrError> {
        self.client
            .post(format!("{}/detach", self.endpoint))
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await
            .map_err(Self::engine_error)?
            .error_for_status()
            .map_err(Self::engine_error)?;
        Ok(())
    }

    async fn describe(&self, name: &str) -> Result<Vec<(String, String)>, HugrError> {
        let response = self
            .client
            .get(format!("{}/describe/{name}", self.endpoint))
            .send()
            .await
            .map_err(Self::engine_error)?;
        response.json().await.map_err(Self::engine_error)
    }
}

/// A scripted engine for tests: replies to statements in order and records
/// what was executed.
#[derive(Default)]
pub struct ScriptedEngine {
    pub executed: std::sync::Mutex<Vec<String>>,
    pub responses: std::sync::Mutex<Vec<Vec<Row>>>,
    pub calls: std::sync::atomic::AtomicUsize,
}

impl ScriptedEngine {
    pub fn respond_with(responses: Vec<Vec<Row>>) -> Arc<Self> {
        Arc::new(Self {
            executed: std::sync::Mutex::new(Vec::new()),
            responses: std::sync::Mutex::new(responses),
            calls: std::sync::atomic::AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn execute(
        &self,
        sql: &RenderedSql,
        _cancel: &CancellationToken,
    ) -> Result<RowStream, HugrError> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.executed
            .lock()
            .expect("scripted engine lock")
            .push(sql.text.clone());
        let rows = {
            let mut responses = self.responses.lock().expect("scripted engine lock");
            if responses.is_empty() {
                Vec::new()
            } else {
                responses.remove(0)
            }
        };
        Ok(futures::stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn attach(&self, _name: &str, _kind: &str, _path: &str) -> Result<(), HugrError> {
        Ok(())
    }

    async fn detach(&self, _name: &str) -> Result<(), HugrError> {
        Ok(())
    }

    async fn describe(&self, _name: &str) -> Result<Vec<(String, String)>, HugrError> {
        Ok(Vec::new())
    }
}
