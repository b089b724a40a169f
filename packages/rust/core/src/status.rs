//! Status answers for `(dataset, requester)` pairs.

use serde::Serialize;
use tracing::debug;

use warehouse_shared::{ExecutionId, ExecutionStatus, Result, validate_identifier};
use warehouse_storage::Storage;

use crate::registry::ExecutionRegistry;

/// What a requester sees when asking about their latest execution on a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusReport {
    Running { execution_id: ExecutionId },
    Completed { execution_id: ExecutionId },
    Error { execution_id: ExecutionId, detail: String },
    NotFound { reason: NotFoundReason },
    /// The dataset exists and the requester is not among its owners.
    NotAuthorized,
}

/// Why a status query found nothing live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotFoundReason {
    /// The requester never submitted for this dataset.
    NoPointer,
    /// A pointer exists but this process no longer tracks its execution,
    /// typically after a restart. `last_recorded` is informational only.
    UntrackedExecution {
        execution_id: ExecutionId,
        last_recorded: ExecutionStatus,
    },
}

impl StatusReport {
    /// Wire name of the reported state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running { .. } => "running",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
            Self::NotFound { .. } => "not_found",
            Self::NotAuthorized => "not_authorized",
        }
    }
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error { detail, .. } => write!(f, "error: {detail}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Resolve the status of `requester_id`'s latest execution on `dataset_id`.
///
/// Ownership is checked against the live document on every call, so losing
/// ownership is visible immediately even while an execution is running.
pub async fn query_status(
    storage: &Storage,
    registry: &ExecutionRegistry,
    dataset_id: &str,
    requester_id: &str,
) -> Result<StatusReport> {
    validate_identifier("dataset id", dataset_id)?;
    validate_identifier("requester id", requester_id)?;

    let Some(pointer) = storage.get_status_pointer(dataset_id, requester_id).await? else {
        return Ok(StatusReport::NotFound {
            reason: NotFoundReason::NoPointer,
        });
    };

    if let Some(owners) = storage.dataset_owners(dataset_id).await? {
        if !owners.contains(requester_id) {
            debug!(dataset_id, requester_id, "requester is not an owner");
            return Ok(StatusReport::NotAuthorized);
        }
    }

    let execution_id = pointer.execution_id;
    let Some(record) = registry.get(&execution_id) else {
        debug!(%execution_id, "pointer refers to an untracked execution");
        return Ok(StatusReport::NotFound {
            reason: NotFoundReason::UntrackedExecution {
                execution_id,
                last_recorded: pointer.status,
            },
        });
    };

    Ok(match record.status {
        ExecutionStatus::Running => StatusReport::Running { execution_id },
        ExecutionStatus::Completed => StatusReport::Completed { execution_id },
        ExecutionStatus::Error => StatusReport::Error {
            execution_id,
            detail: record
                .error_detail
                .unwrap_or_else(|| "execution failed without detail".into()),
        },
    })
}
