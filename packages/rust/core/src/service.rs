//! `IngestService`: submission, status, history and dataset queries over one
//! storage handle, one source adapter and one worker pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument};

use warehouse_shared::{
    DatasetDocument, DatasetSummary, ExecutionId, ExecutionRecord, ExecutionStatus, HistoryEntry,
    HistoryFilter, MetadataUpdate, Result, StatusPointer, WarehouseError, WorkerConfig,
    validate_identifier,
};
use warehouse_source::SourceAdapter;
use warehouse_storage::Storage;

use crate::pool::WorkerPool;
use crate::registry::ExecutionRegistry;
use crate::runner::{IngestKind, RunContext, TaskRunner};
use crate::status::{StatusReport, query_status};

/// Returned synchronously by [`IngestService::submit`].
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub kind: IngestKind,
}

pub struct IngestService {
    storage: Arc<Storage>,
    registry: Arc<ExecutionRegistry>,
    runner: Arc<TaskRunner>,
    pool: WorkerPool,
}

impl IngestService {
    pub fn new(storage: Arc<Storage>, source: Arc<dyn SourceAdapter>, config: &WorkerConfig) -> Self {
        Self::with_registry(storage, source, Arc::new(ExecutionRegistry::new()), config)
    }

    /// Build a service around an existing registry.
    pub fn with_registry(
        storage: Arc<Storage>,
        source: Arc<dyn SourceAdapter>,
        registry: Arc<ExecutionRegistry>,
        config: &WorkerConfig,
    ) -> Self {
        let runner = TaskRunner::new(
            source,
            Arc::clone(&storage),
            Arc::clone(&registry),
            config.pull_timeout,
            config.store_timeout,
        );
        Self {
            storage,
            registry,
            runner: Arc::new(runner),
            pool: WorkerPool::new(config),
        }
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    /// Executions admitted and not yet finished.
    pub fn pending(&self) -> usize {
        self.pool.pending()
    }

    /// Start an ingestion of `dataset_id` on behalf of a requester.
    ///
    /// Returns as soon as the execution is registered as RUNNING; the pull
    /// and store happen in the background. Nothing is written when the
    /// inputs are invalid or the pool is full.
    #[instrument(skip(self), fields(execution_id))]
    pub async fn submit(
        &self,
        dataset_id: &str,
        requester_id: &str,
        requester_name: &str,
    ) -> Result<SubmitReceipt> {
        validate_identifier("dataset id", dataset_id)?;
        validate_identifier("requester id", requester_id)?;
        if requester_name.trim().is_empty() {
            return Err(WarehouseError::validation("requester name must not be empty"));
        }

        let admission = self.pool.admit()?;

        let kind = if self.storage.dataset_exists(dataset_id).await? {
            IngestKind::Refresh
        } else {
            IngestKind::Initial
        };

        let execution_id = ExecutionId::new();
        tracing::Span::current().record("execution_id", tracing::field::display(execution_id));

        self.storage
            .upsert_status_pointer(&StatusPointer {
                target: dataset_id.to_string(),
                requester_id: requester_id.to_string(),
                execution_id,
                status: ExecutionStatus::Running,
                updated_at: Utc::now(),
            })
            .await?;

        self.registry.register(ExecutionRecord {
            execution_id,
            target: dataset_id.to_string(),
            requester_id: requester_id.to_string(),
            requester_name: requester_name.to_string(),
            status: ExecutionStatus::Running,
            error_detail: None,
            submitted_at: Utc::now(),
            completed_at: None,
        });

        let ctx = RunContext {
            execution_id,
            dataset_id: dataset_id.to_string(),
            requester_id: requester_id.to_string(),
            requester_name: requester_name.to_string(),
            kind,
        };
        let runner = Arc::clone(&self.runner);
        self.pool.spawn(admission, move |cancel| async move {
            let failed_ctx = ctx.clone();
            let task_runner = Arc::clone(&runner);
            let joined = tokio::spawn(async move { task_runner.run(ctx, cancel).await }).await;
            if let Err(join_err) = joined {
                error!(execution_id = %failed_ctx.execution_id, "runner aborted: {join_err}");
                runner
                    .record_failure(&failed_ctx, &format!("runner aborted: {join_err}"))
                    .await;
            }
        });

        info!(%kind, "execution submitted");
        Ok(SubmitReceipt {
            execution_id,
            status: ExecutionStatus::Running,
            kind,
        })
    }

    /// Status of `requester_id`'s latest execution on `dataset_id`.
    pub async fn status(&self, dataset_id: &str, requester_id: &str) -> Result<StatusReport> {
        query_status(&self.storage, &self.registry, dataset_id, requester_id).await
    }

    /// Live record of an execution, if this process still tracks it.
    pub fn execution(&self, execution_id: &ExecutionId) -> Option<ExecutionRecord> {
        self.registry.get(execution_id)
    }

    /// Wait until `execution_id` reaches a final state, checking every `poll`.
    ///
    /// Reads the registry directly, so it is not affected by ownership.
    /// Returns `None` if this process does not track the execution.
    pub async fn wait_for(
        &self,
        execution_id: &ExecutionId,
        poll: Duration,
    ) -> Option<ExecutionRecord> {
        loop {
            if self.registry.status(execution_id)?.is_terminal() {
                return self.registry.get(execution_id);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Run history of one pipeline, oldest first.
    pub async fn history(&self, pipeline: &str, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>> {
        validate_identifier("pipeline name", pipeline)?;
        self.storage.list_history(pipeline, filter).await
    }

    /// History across all pipelines whose name matches `filter`.
    pub async fn search_history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>> {
        self.storage.search_history(filter).await
    }

    pub async fn dataset(&self, dataset_id: &str) -> Result<Option<DatasetDocument>> {
        validate_identifier("dataset id", dataset_id)?;
        self.storage.get_dataset(dataset_id).await
    }

    pub async fn datasets_owned_by(&self, requester_id: &str) -> Result<Vec<DatasetSummary>> {
        validate_identifier("requester id", requester_id)?;
        self.storage.list_datasets_for_owner(requester_id).await
    }

    /// Edit a dataset's descriptive metadata. Returns `false` if it does not exist.
    pub async fn update_dataset_metadata(
        &self,
        dataset_id: &str,
        update: &MetadataUpdate,
    ) -> Result<bool> {
        validate_identifier("dataset id", dataset_id)?;
        self.storage.update_dataset_metadata(dataset_id, update).await
    }

    /// Stop accepting submissions, cancel running executions and wait for
    /// their runners to record a final state.
    pub async fn shutdown(&self) {
        debug!(running = self.registry.running(), "ingest service shutting down");
        self.pool.shutdown().await;
        info!("ingest service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;
    use warehouse_shared::{HistoryStatus, PipelineMapping, Row};

    use crate::status::NotFoundReason;

    enum Step {
        Rows(usize),
        Fail(WarehouseError),
        /// Wait for the notify, then return rows.
        Gate(Arc<Notify>, usize),
        Stall,
        Panic,
    }

    struct ScriptedSource {
        steps: Mutex<VecDeque<Step>>,
        pulls: AtomicUsize,
        mapping: PipelineMapping,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                pulls: AtomicUsize::new(0),
                mapping: PipelineMapping::default(),
            })
        }

        /// Wait until `n` pulls have taken their step.
        async fn wait_pulls(&self, n: usize) {
            tokio::time::timeout(Duration::from_secs(10), async {
                while self.pulls.load(Ordering::SeqCst) < n {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("pull started");
        }
    }

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let mut row = Row::new();
                row.insert("name".into(), json!(format!("R-{i:03}")));
                row.insert("value".into(), json!(i));
                row
            })
            .collect()
    }

    #[async_trait]
    impl SourceAdapter for ScriptedSource {
        async fn pull(&self, _identifier: &str) -> Result<Vec<Row>> {
            let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Rows(0));
            self.pulls.fetch_add(1, Ordering::SeqCst);
            match step {
                Step::Rows(n) => Ok(rows(n)),
                Step::Fail(e) => Err(e),
                Step::Gate(gate, n) => {
                    gate.notified().await;
                    Ok(rows(n))
                }
                Step::Stall => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Vec::new())
                }
                Step::Panic => panic!("adapter blew up"),
            }
        }

        fn upstream_name(&self, identifier: &str) -> String {
            self.mapping.upstream_name(identifier).to_string()
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn temp_db_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("warehouse-core-test-{tag}-{}", uuid::Uuid::new_v4()))
            .join("warehouse.db")
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            max_concurrent: 4,
            max_pending: 16,
            pull_timeout: Duration::from_secs(5),
            store_timeout: Duration::from_secs(5),
        }
    }

    async fn service_with(tag: &str, steps: Vec<Step>, config: WorkerConfig) -> (IngestService, Arc<Storage>) {
        let storage = Arc::new(Storage::open(&temp_db_path(tag)).await.unwrap());
        let service = IngestService::new(Arc::clone(&storage), ScriptedSource::new(steps), &config);
        (service, storage)
    }

    async fn wait_settled(service: &IngestService, id: ExecutionId) -> ExecutionRecord {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let record = service.execution(&id).expect("execution tracked");
                if record.status.is_terminal() {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("execution settles")
    }

    /// Terminal registry state is set before the pointer and history writes;
    /// wait for the whole pool to drain when those matter.
    async fn wait_idle(service: &IngestService) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while service.pending() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pool drains");
    }

    #[tokio::test]
    async fn first_ingestion_creates_dataset() {
        let (service, storage) = service_with("first", vec![Step::Rows(3)], worker_config()).await;

        let receipt = service.submit("soil_collection", "u1", "Alice").await.unwrap();
        assert_eq!(receipt.status, ExecutionStatus::Running);
        assert_eq!(receipt.kind, IngestKind::Initial);

        wait_settled(&service, receipt.execution_id).await;
        wait_idle(&service).await;

        let report = service.status("soil_collection", "u1").await.unwrap();
        assert_eq!(
            report,
            StatusReport::Completed {
                execution_id: receipt.execution_id
            }
        );

        let doc = service.dataset("soil_collection").await.unwrap().unwrap();
        assert_eq!(doc.record_count, 3);
        assert_eq!(doc.rows.len(), 3);
        assert_eq!(doc.display_name, "Soil Collection Data");
        assert!(doc.pulled_from_pipeline);
        assert_eq!(doc.owners.iter().collect::<Vec<_>>(), vec!["u1"]);

        let history = service
            .history("soil_collection", &HistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].execution_id, receipt.execution_id);
        assert_eq!(history[0].status, HistoryStatus::Completed);
        assert_eq!(history[0].requester_name, "Alice");

        let pointer = storage
            .get_status_pointer("soil_collection", "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pointer.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn refresh_by_second_requester_merges_owners() {
        let (service, _storage) =
            service_with("refresh", vec![Step::Rows(3), Step::Rows(5)], worker_config()).await;

        let first = service.submit("soil_collection", "u1", "Alice").await.unwrap();
        wait_settled(&service, first.execution_id).await;
        wait_idle(&service).await;
        let before = service.dataset("soil_collection").await.unwrap().unwrap();

        let second = service.submit("soil_collection", "u2", "Bob").await.unwrap();
        assert_eq!(second.kind, IngestKind::Refresh);
        wait_settled(&service, second.execution_id).await;
        wait_idle(&service).await;

        let after = service.dataset("soil_collection").await.unwrap().unwrap();
        assert_eq!(after.record_count, 5);
        assert_eq!(after.storage_key, before.storage_key);
        assert_eq!(after.created_at, before.created_at);
        assert!(after.owners.contains("u1") && after.owners.contains("u2"));

        assert!(matches!(
            service.status("soil_collection", "u2").await.unwrap(),
            StatusReport::Completed { execution_id } if execution_id == second.execution_id
        ));
        assert!(matches!(
            service.status("soil_collection", "u1").await.unwrap(),
            StatusReport::Completed { execution_id } if execution_id == first.execution_id
        ));

        let history = service
            .history("soil_collection", &HistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.status == HistoryStatus::Completed));

        let owned = service.datasets_owned_by("u2").await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].dataset_id, "soil_collection");
    }

    #[tokio::test]
    async fn upstream_failure_records_error() {
        let (service, storage) = service_with(
            "failure",
            vec![Step::Fail(WarehouseError::UpstreamTransport(
                "connection reset by peer".into(),
            ))],
            worker_config(),
        )
        .await;

        let receipt = service.submit("weather_data", "u1", "Alice").await.unwrap();
        let record = wait_settled(&service, receipt.execution_id).await;
        wait_idle(&service).await;
        assert_eq!(record.status, ExecutionStatus::Error);

        match service.status("weather_data", "u1").await.unwrap() {
            StatusReport::Error { execution_id, detail } => {
                assert_eq!(execution_id, receipt.execution_id);
                assert!(detail.contains("connection reset"));
            }
            other => panic!("unexpected status {other:?}"),
        }

        assert!(service.dataset("weather_data").await.unwrap().is_none());

        let history = service
            .history("weather_data", &HistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, HistoryStatus::Failed);

        let pointer = storage
            .get_status_pointer("weather_data", "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pointer.status, ExecutionStatus::Error);
    }

    #[tokio::test]
    async fn failed_refresh_leaves_document_untouched() {
        let (service, _storage) = service_with(
            "failed-refresh",
            vec![
                Step::Rows(4),
                Step::Fail(WarehouseError::UpstreamAuth("login rejected".into())),
            ],
            worker_config(),
        )
        .await;

        let first = service.submit("crop_yield", "u1", "Alice").await.unwrap();
        wait_settled(&service, first.execution_id).await;
        wait_idle(&service).await;
        let before = service.dataset("crop_yield").await.unwrap().unwrap();

        let second = service.submit("crop_yield", "u1", "Alice").await.unwrap();
        wait_settled(&service, second.execution_id).await;
        wait_idle(&service).await;

        let after = service.dataset("crop_yield").await.unwrap().unwrap();
        assert_eq!(after.record_count, 4);
        assert_eq!(after.updated_at, before.updated_at);
        assert!(matches!(
            service.status("crop_yield", "u1").await.unwrap(),
            StatusReport::Error { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_pair_is_not_found() {
        let (service, _storage) = service_with("unknown", vec![], worker_config()).await;
        assert_eq!(
            service.status("never_ingested", "u1").await.unwrap(),
            StatusReport::NotFound {
                reason: NotFoundReason::NoPointer
            }
        );
    }

    #[tokio::test]
    async fn missing_upstream_completes_empty() {
        let (service, _storage) = service_with(
            "empty",
            vec![Step::Fail(WarehouseError::UpstreamNotFound("Weather Data".into()))],
            worker_config(),
        )
        .await;

        let receipt = service.submit("weather_data", "u1", "Alice").await.unwrap();
        let record = wait_settled(&service, receipt.execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Completed);

        let doc = service.dataset("weather_data").await.unwrap().unwrap();
        assert_eq!(doc.record_count, 0);
        assert!(doc.rows.is_empty());
    }

    #[tokio::test]
    async fn non_owner_is_not_authorized() {
        let (service, _storage) = service_with(
            "not-owner",
            vec![
                Step::Rows(2),
                Step::Fail(WarehouseError::UpstreamTransport("timeout".into())),
            ],
            worker_config(),
        )
        .await;

        let owner = service.submit("soil_collection", "u1", "Alice").await.unwrap();
        wait_settled(&service, owner.execution_id).await;
        wait_idle(&service).await;

        // u3's own pull fails, so they never become an owner.
        let outsider = service.submit("soil_collection", "u3", "Carol").await.unwrap();
        wait_settled(&service, outsider.execution_id).await;
        wait_idle(&service).await;

        assert_eq!(
            service.status("soil_collection", "u3").await.unwrap(),
            StatusReport::NotAuthorized
        );
        assert!(service.datasets_owned_by("u3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_input_writes_nothing() {
        let (service, storage) = service_with("invalid", vec![], worker_config()).await;

        let err = service.submit("", "u1", "Alice").await.unwrap_err();
        assert!(matches!(err, WarehouseError::Validation { .. }));
        let err = service.submit("soil_collection", "u1", "  ").await.unwrap_err();
        assert!(matches!(err, WarehouseError::Validation { .. }));
        let err = service.status("soil/collection", "u1").await.unwrap_err();
        assert!(matches!(err, WarehouseError::Validation { .. }));

        assert_eq!(service.registry().running(), 0);
        assert!(
            storage
                .get_status_pointer("soil_collection", "u1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn restart_loses_live_status() {
        let path = temp_db_path("restart");
        let storage = Arc::new(Storage::open(&path).await.unwrap());
        let service = IngestService::new(
            Arc::clone(&storage),
            ScriptedSource::new(vec![Step::Rows(3)]),
            &worker_config(),
        );
        let receipt = service.submit("soil_collection", "u1", "Alice").await.unwrap();
        wait_settled(&service, receipt.execution_id).await;
        service.shutdown().await;
        drop(service);

        let restarted = IngestService::new(storage, ScriptedSource::new(vec![]), &worker_config());
        assert_eq!(
            restarted.status("soil_collection", "u1").await.unwrap(),
            StatusReport::NotFound {
                reason: NotFoundReason::UntrackedExecution {
                    execution_id: receipt.execution_id,
                    last_recorded: ExecutionStatus::Completed,
                }
            }
        );
        // The document itself survives.
        assert!(restarted.dataset("soil_collection").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn full_pool_rejects_before_writing() {
        let gate = Arc::new(Notify::new());
        let config = WorkerConfig {
            max_pending: 1,
            ..worker_config()
        };
        let (service, storage) =
            service_with("overload", vec![Step::Gate(Arc::clone(&gate), 1), Step::Rows(2)], config)
                .await;

        let first = service.submit("soil_collection", "u1", "Alice").await.unwrap();
        assert_eq!(
            service.status("soil_collection", "u1").await.unwrap(),
            StatusReport::Running {
                execution_id: first.execution_id
            }
        );

        let err = service.submit("weather_data", "u2", "Bob").await.unwrap_err();
        assert!(matches!(err, WarehouseError::Overloaded { pending: 1 }));
        assert!(
            storage
                .get_status_pointer("weather_data", "u2")
                .await
                .unwrap()
                .is_none()
        );

        gate.notify_one();
        wait_settled(&service, first.execution_id).await;
        wait_idle(&service).await;

        let retry = service.submit("weather_data", "u2", "Bob").await.unwrap();
        let record = wait_settled(&service, retry.execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn slow_pull_times_out() {
        let config = WorkerConfig {
            pull_timeout: Duration::from_millis(50),
            ..worker_config()
        };
        let (service, _storage) = service_with("timeout", vec![Step::Stall], config).await;

        let receipt = service.submit("crop_yield", "u1", "Alice").await.unwrap();
        let record = wait_settled(&service, receipt.execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Error);
        assert!(record.error_detail.unwrap().contains("timed out"));
        assert!(service.dataset("crop_yield").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_cancels_running_executions() {
        let (service, _storage) = service_with("shutdown", vec![Step::Stall], worker_config()).await;

        let receipt = service.submit("crop_yield", "u1", "Alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(5), service.shutdown())
            .await
            .expect("shutdown completes");

        let record = service.execution(&receipt.execution_id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Error);
        assert!(record.error_detail.unwrap().contains("cancelled"));

        let history = service
            .history("crop_yield", &HistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(history[0].status, HistoryStatus::Failed);

        let err = service.submit("crop_yield", "u1", "Alice").await.unwrap_err();
        assert!(matches!(err, WarehouseError::Cancelled(_)));
    }

    #[tokio::test]
    async fn panicking_adapter_still_settles() {
        let (service, _storage) = service_with("panic", vec![Step::Panic], worker_config()).await;

        let receipt = service.submit("soil_collection", "u1", "Alice").await.unwrap();
        let record = wait_settled(&service, receipt.execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Error);
        assert!(record.error_detail.unwrap().contains("runner aborted"));
    }

    #[tokio::test]
    async fn metadata_edits_survive_refresh() {
        let (service, _storage) =
            service_with("metadata", vec![Step::Rows(1), Step::Rows(2)], worker_config()).await;

        let first = service.submit("weather_data", "u1", "Alice").await.unwrap();
        wait_settled(&service, first.execution_id).await;
        wait_idle(&service).await;

        let update = MetadataUpdate {
            description: Some("Hourly station readings".into()),
            tags: Some(vec!["weather".into()]),
            permissions: None,
        };
        assert!(service.update_dataset_metadata("weather_data", &update).await.unwrap());
        assert!(!service.update_dataset_metadata("unknown", &update).await.unwrap());

        let second = service.submit("weather_data", "u1", "Alice").await.unwrap();
        wait_settled(&service, second.execution_id).await;
        wait_idle(&service).await;

        let doc = service.dataset("weather_data").await.unwrap().unwrap();
        assert_eq!(doc.record_count, 2);
        assert_eq!(doc.description.as_deref(), Some("Hourly station readings"));
        assert_eq!(doc.tags, vec!["weather".to_string()]);
    }

    #[tokio::test]
    async fn history_search_spans_pipelines() {
        let (service, _storage) =
            service_with("search", vec![Step::Rows(1), Step::Rows(1)], worker_config()).await;

        for pipeline in ["soil_collection", "weather_data"] {
            let receipt = service.submit(pipeline, "u1", "Alice").await.unwrap();
            wait_settled(&service, receipt.execution_id).await;
            wait_idle(&service).await;
        }

        let all = service.search_history(&HistoryFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = service
            .search_history(&HistoryFilter {
                name_contains: Some("WEATHER".into()),
                since: None,
            })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].pipeline_name, "weather_data");
    }

    #[tokio::test]
    async fn new_owner_waits_through_own_refresh() {
        let gate = Arc::new(Notify::new());
        let (service, _storage) = service_with(
            "new-owner",
            vec![Step::Rows(3), Step::Gate(Arc::clone(&gate), 5)],
            worker_config(),
        )
        .await;

        let first = service.submit("soil_collection", "u1", "Alice").await.unwrap();
        service.wait_for(&first.execution_id, Duration::from_millis(10)).await;
        wait_idle(&service).await;

        let second = service.submit("soil_collection", "u2", "Bob").await.unwrap();
        // Not an owner until the refresh lands, even though the run is live.
        assert_eq!(
            service.status("soil_collection", "u2").await.unwrap(),
            StatusReport::NotAuthorized
        );

        gate.notify_one();
        let record = tokio::time::timeout(
            Duration::from_secs(10),
            service.wait_for(&second.execution_id, Duration::from_millis(10)),
        )
        .await
        .expect("run settles")
        .expect("execution tracked");
        assert_eq!(record.status, ExecutionStatus::Completed);
        service.shutdown().await;

        let doc = service.dataset("soil_collection").await.unwrap().unwrap();
        assert_eq!(doc.record_count, 5);
        assert!(doc.owners.contains("u2"));
        assert!(matches!(
            service.status("soil_collection", "u2").await.unwrap(),
            StatusReport::Completed { execution_id } if execution_id == second.execution_id
        ));
    }

    #[tokio::test]
    async fn wait_for_unknown_execution_is_none() {
        let (service, _storage) = service_with("wait-unknown", vec![], worker_config()).await;
        assert!(
            service
                .wait_for(&ExecutionId::new(), Duration::from_millis(10))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn overlapping_submissions_last_finisher_owns_pointer() {
        let early_gate = Arc::new(Notify::new());
        let late_gate = Arc::new(Notify::new());
        let source = ScriptedSource::new(vec![
            Step::Gate(Arc::clone(&early_gate), 2),
            Step::Gate(Arc::clone(&late_gate), 7),
        ]);
        let storage = Arc::new(Storage::open(&temp_db_path("overlap")).await.unwrap());
        let service = IngestService::new(
            Arc::clone(&storage),
            Arc::clone(&source) as Arc<dyn SourceAdapter>,
            &worker_config(),
        );

        let early = service.submit("weather_data", "u1", "Alice").await.unwrap();
        source.wait_pulls(1).await;
        let late = service.submit("weather_data", "u1", "Alice").await.unwrap();
        source.wait_pulls(2).await;

        // The later submission finishes first.
        late_gate.notify_one();
        let late_record = wait_settled(&service, late.execution_id).await;
        tokio::time::timeout(Duration::from_secs(10), async {
            while service.pending() > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("later run finishes its writes");
        early_gate.notify_one();
        let early_record = wait_settled(&service, early.execution_id).await;
        wait_idle(&service).await;

        assert_eq!(late_record.status, ExecutionStatus::Completed);
        assert_eq!(early_record.status, ExecutionStatus::Completed);

        let pointer = storage
            .get_status_pointer("weather_data", "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pointer.execution_id, early.execution_id);
        assert_eq!(pointer.status, ExecutionStatus::Completed);

        let doc = service.dataset("weather_data").await.unwrap().unwrap();
        assert_eq!(doc.record_count, 2);
        assert_eq!(doc.owners.len(), 1);

        let history = service
            .history("weather_data", &HistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.status == HistoryStatus::Completed));
    }
}
