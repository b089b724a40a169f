//! Process-lifetime registry of live executions.
//!
//! Nothing here is persisted: a restart starts with an empty registry and
//! status queries for older executions degrade to "not found".
//!
//! Records are never evicted either. A long-lived process keeps one entry
//! per execution it has accepted.

use chrono::Utc;
use dashmap::DashMap;
use warehouse_shared::{ExecutionId, ExecutionRecord, ExecutionStatus};

/// Concurrent map from execution id to its current record.
///
/// Each record has a single writer (its runner); readers take clones.
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    records: DashMap<ExecutionId, ExecutionRecord>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly submitted execution. Its status is forced to `Running`.
    pub fn register(&self, mut record: ExecutionRecord) {
        record.status = ExecutionStatus::Running;
        record.error_detail = None;
        record.completed_at = None;
        self.records.insert(record.execution_id, record);
    }

    /// Snapshot of an execution's record.
    pub fn get(&self, id: &ExecutionId) -> Option<ExecutionRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    pub fn status(&self, id: &ExecutionId) -> Option<ExecutionStatus> {
        self.records.get(id).map(|r| r.status)
    }

    /// Move a running execution to `Completed`. Returns `false` if it was
    /// unknown or already final.
    pub fn complete(&self, id: &ExecutionId) -> bool {
        self.finish(id, ExecutionStatus::Completed, None)
    }

    /// Move a running execution to `Error` with `detail`. Returns `false` if
    /// it was unknown or already final.
    pub fn fail(&self, id: &ExecutionId, detail: impl Into<String>) -> bool {
        self.finish(id, ExecutionStatus::Error, Some(detail.into()))
    }

    fn finish(&self, id: &ExecutionId, status: ExecutionStatus, detail: Option<String>) -> bool {
        let Some(mut record) = self.records.get_mut(id) else {
            return false;
        };
        if record.status.is_terminal() {
            return false;
        }
        record.status = status;
        record.error_detail = detail;
        record.completed_at = Some(Utc::now());
        true
    }

    /// Executions still running.
    pub fn running(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == ExecutionStatus::Running)
            .count()
    }
}
