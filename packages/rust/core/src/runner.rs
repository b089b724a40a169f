//! Background runner for one ingestion execution.
//!
//! Sequence: history RUNNING → pull → upsert → registry + pointer + history
//! final state. The registry is always moved to a final state, whatever
//! happens in between.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use warehouse_shared::{
    ExecutionId, ExecutionStatus, HistoryEntry, HistoryStatus, Result, StatusPointer,
    UpsertOutcome, WarehouseError,
};
use warehouse_source::SourceAdapter;
use warehouse_storage::Storage;

use crate::registry::ExecutionRegistry;

/// Whether a submission targets a dataset that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestKind {
    Initial,
    Refresh,
}

impl std::fmt::Display for IngestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => f.write_str("initial"),
            Self::Refresh => f.write_str("refresh"),
        }
    }
}

/// Everything a runner needs to know about its execution.
#[derive(Debug, Clone)]
pub(crate) struct RunContext {
    pub execution_id: ExecutionId,
    pub dataset_id: String,
    pub requester_id: String,
    pub requester_name: String,
    pub kind: IngestKind,
}

pub(crate) struct TaskRunner {
    source: Arc<dyn SourceAdapter>,
    storage: Arc<Storage>,
    registry: Arc<ExecutionRegistry>,
    pull_timeout: Duration,
    store_timeout: Duration,
}

impl TaskRunner {
    pub fn new(
        source: Arc<dyn SourceAdapter>,
        storage: Arc<Storage>,
        registry: Arc<ExecutionRegistry>,
        pull_timeout: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            source,
            storage,
            registry,
            pull_timeout,
            store_timeout,
        }
    }

    #[instrument(
        skip_all,
        fields(execution_id = %ctx.execution_id, dataset_id = %ctx.dataset_id, kind = %ctx.kind)
    )]
    pub async fn run(&self, ctx: RunContext, cancel: CancellationToken) {
        self.record_history(&ctx, HistoryStatus::Running).await;

        match self.ingest(&ctx, &cancel).await {
            Ok(outcome) => {
                info!(
                    records = outcome.record_count,
                    created = outcome.created,
                    source = self.source.name(),
                    "ingestion completed"
                );
                self.registry.complete(&ctx.execution_id);
                self.record_outcome(&ctx, ExecutionStatus::Completed).await;
            }
            Err(e) => self.record_failure(&ctx, &e.to_string()).await,
        }
    }

    /// Move the execution to `Error` everywhere it is tracked.
    pub async fn record_failure(&self, ctx: &RunContext, detail: &str) {
        error!(
            execution_id = %ctx.execution_id,
            dataset_id = %ctx.dataset_id,
            error = %detail,
            "ingestion failed"
        );
        self.registry.fail(&ctx.execution_id, detail);
        self.record_outcome(ctx, ExecutionStatus::Error).await;
    }

    async fn record_outcome(&self, ctx: &RunContext, status: ExecutionStatus) {
        self.record_pointer(ctx, status).await;
        self.record_history(ctx, HistoryStatus::from(status)).await;
    }

    async fn ingest(&self, ctx: &RunContext, cancel: &CancellationToken) -> Result<UpsertOutcome> {
        let pulled = guarded(
            cancel,
            self.pull_timeout,
            "upstream pull",
            self.source.pull(&ctx.dataset_id),
        )
        .await;

        let rows = match pulled {
            Ok(rows) => rows,
            Err(e) if e.is_soft() => {
                warn!(error = %e, "upstream has no such dataset, storing empty result");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let display_name = self.source.upstream_name(&ctx.dataset_id);
        guarded(
            cancel,
            self.store_timeout,
            "dataset upsert",
            self.storage.upsert_dataset(
                &ctx.dataset_id,
                &display_name,
                &ctx.requester_id,
                &rows,
            ),
        )
        .await
    }

    /// Pointer writes are best-effort once the registry holds the outcome.
    async fn record_pointer(&self, ctx: &RunContext, status: ExecutionStatus) {
        let pointer = StatusPointer {
            target: ctx.dataset_id.clone(),
            requester_id: ctx.requester_id.clone(),
            execution_id: ctx.execution_id,
            status,
            updated_at: Utc::now(),
        };
        let written = bounded(
            self.store_timeout,
            "status pointer write",
            self.storage.upsert_status_pointer(&pointer),
        )
        .await;
        if let Err(e) = written {
            warn!(error = %e, status = %status, "failed to update status pointer");
        }
    }

    async fn record_history(&self, ctx: &RunContext, status: HistoryStatus) {
        let entry = HistoryEntry {
            pipeline_name: ctx.dataset_id.clone(),
            execution_id: ctx.execution_id,
            status,
            requester_id: ctx.requester_id.clone(),
            requester_name: ctx.requester_name.clone(),
            timestamp: Utc::now(),
        };
        let written = bounded(
            self.store_timeout,
            "history write",
            self.storage.append_or_update_history(&entry),
        )
        .await;
        if let Err(e) = written {
            warn!(error = %e, status = %status, "failed to record pipeline history");
        }
    }
}

/// Run `fut` under a deadline, abandoning it if `cancel` fires first.
async fn guarded<T>(
    cancel: &CancellationToken,
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WarehouseError::Cancelled(format!(
            "{what} interrupted by shutdown"
        ))),
        res = bounded(limit, what, fut) => res,
    }
}

async fn bounded<T>(limit: Duration, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(WarehouseError::Timeout(format!(
            "{what} exceeded {limit:?}"
        ))),
    }
}
