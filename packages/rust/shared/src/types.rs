//! Core domain types for dataset ingestion and execution tracking.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, WarehouseError};

/// Maximum length accepted for dataset, pipeline and requester identifiers.
pub const MAX_IDENTIFIER_LEN: usize = 256;

/// One upstream record, kept as an untyped JSON object.
pub type Row = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// ExecutionId
// ---------------------------------------------------------------------------

/// Opaque 128-bit random token identifying one run of the ingestion workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    /// Generate a fresh random execution id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Live status of an execution. `Completed` and `Error` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Error,
}

impl ExecutionStatus {
    /// Wire name, also used as the stored pointer status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = WarehouseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(WarehouseError::Storage(format!(
                "unknown execution status '{other}'"
            ))),
        }
    }
}

/// Outcome recorded in a pipeline's run history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Running,
    Completed,
    Failed,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HistoryStatus {
    type Err = WarehouseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(WarehouseError::Storage(format!(
                "unknown history status '{other}'"
            ))),
        }
    }
}

impl From<ExecutionStatus> for HistoryStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Running => Self::Running,
            ExecutionStatus::Completed => Self::Completed,
            ExecutionStatus::Error => Self::Failed,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

/// In-memory record of one execution. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    /// Dataset / pipeline identifier being pulled.
    pub target: String,
    pub requester_id: String,
    pub requester_name: String,
    pub status: ExecutionStatus,
    /// Set only when `status` is `Error`.
    pub error_detail: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Datasets
// ---------------------------------------------------------------------------

/// A stored dataset, keyed by its stable identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDocument {
    /// Stable identifier (the pipeline id that produces it).
    pub dataset_id: String,
    /// Internal storage key, fixed at creation.
    pub storage_key: String,
    /// Requesters who have ever ingested into this dataset.
    pub owners: BTreeSet<String>,
    pub display_name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub permissions: String,
    pub rows: Vec<Row>,
    pub record_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub pulled_from_pipeline: bool,
}

/// Listing view of a dataset, without its rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub dataset_id: String,
    pub display_name: String,
    pub description: Option<String>,
    pub record_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of one dataset upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub storage_key: String,
    /// `true` when this call created the document.
    pub created: bool,
    pub record_count: usize,
}

/// User-editable descriptive metadata. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub permissions: Option<String>,
}

// ---------------------------------------------------------------------------
// History and pointers
// ---------------------------------------------------------------------------

/// One execution's entry in a pipeline's run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub pipeline_name: String,
    pub execution_id: ExecutionId,
    pub status: HistoryStatus,
    pub requester_id: String,
    pub requester_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Optional narrowing for history reads.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Substring of the name being searched; ASCII letters match either case.
    pub name_contains: Option<String>,
    /// Inclusive lower bound on the entry timestamp.
    pub since: Option<DateTime<Utc>>,
}

/// Durable pointer from `(target, requester)` to the latest execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPointer {
    pub target: String,
    pub requester_id: String,
    pub execution_id: ExecutionId,
    /// Last state written by the submitter or runner.
    pub status: ExecutionStatus,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

static IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\x00-\x1F\x7F/]+$").expect("identifier regex is valid")
});

/// Check an identifier before it reaches any store. `what` names it in errors.
pub fn validate_identifier(what: &str, value: &str) -> Result<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(WarehouseError::validation(format!("{what} must not be empty")));
    }
    if trimmed != value {
        return Err(WarehouseError::validation(format!(
            "{what} must not have leading or trailing whitespace"
        )));
    }
    if value.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(WarehouseError::validation(format!(
            "{what} exceeds {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if !IDENTIFIER_RE.is_match(value) {
        return Err(WarehouseError::validation(format!(
            "{what} '{}' contains control characters or '/'",
            value.escape_debug()
        )));
    }
    Ok(())
}
