//! Drives compiled statements through the engine handle, bounded by
//! `max_parallel_queries`, and shapes row streams into response values.

use std::sync::Arc;

use hugr_core::error::HugrError;
use hugr_core::query_plan::CompiledQuery;
use hugr_core::query_plan::OperationKind;
use hugr_core::query_plan::RootPlan;
use hugr_core::query_plan::ShapeNode;
use hugr_core::shape;
use hugr_core::sql::SqlStatement;
use hugr_core::sql::render_statement;
use serde_json_bytes::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::engine::collect_rows;

pub struct Executor {
    engine: Arc<dyn Engine>,
    /// Fair semaphore: excess statements queue FIFO.
    permits: Arc<Semaphore>,
    allow_parallel: bool,
}

impl Executor {
    pub fn new(engine: Arc<dyn Engine>, max_parallel_queries: usize, allow_parallel: bool) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(max_parallel_queries)),
            allow_parallel,
        }
    }

    /// Executes every root of a compiled operation and assembles the `data`
    /// value. Mutations always run sequentially in declaration order; query
    /// roots run in parallel when permitted.
    #[tracing::instrument(skip_all)]
    pub async fn run(
        &self,
        compiled: &CompiledQuery,
        cancel: &CancellationToken,
    ) -> Result<Value, HugrError> {
        let sequential = compiled.kind == OperationKind::Mutation || !self.allow_parallel;
        let mut shaped = Vec::with_capacity(compiled.roots.len());
        if sequential {
            for root in &compiled.roots {
                shaped.push((root.path.clone(), self.run_root(root, cancel).await?));
            }
        } else {
            let results = futures::future::try_join_all(
                compiled
                    .roots
                    .iter()
                    .map(|root| async move { Ok::<_, HugrError>((root.path.clone(), self.run_root(root, cancel).await?)) }),
            )
            .await?;
            shaped.extend(results);
        }
        Ok(shape::assemble_response(shaped))
    }

    /// Executes one root statement and shapes its rows.
    pub async fn run_root(
        &self,
        root: &RootPlan,
        cancel: &CancellationToken,
    ) -> Result<Value, HugrError> {
        // Constant shapes (schema version) answer without touching the engine.
        if let ShapeNode::Constant { value } = &root.shape {
            return Ok(value.clone());
        }
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HugrError::execution("executor is shutting down"))?;
        let rendered = match &root.statement {
            SqlStatement::Select(select) => hugr_core::sql::render_select(select, &root.params),
            statement => render_statement(statement, &root.params),
        };
        tracing::debug!(sql = %rendered.text, "executing statement");
        let stream = self.engine.execute(&rendered, cancel).await?;
        let rows = collect_rows(stream, cancel).await?;
        Ok(shape::shape_rows(&root.shape, &rows))
    }
}
