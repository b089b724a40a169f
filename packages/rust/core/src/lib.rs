//! Ingestion orchestration: submission, background runners, live status.
//!
//! [`IngestService`] is the entry point. A submission validates its inputs,
//! reserves pool capacity, records a RUNNING pointer and registry entry, and
//! hands the pull-and-store work to a [`WorkerPool`] runner.

pub mod pool;
pub mod registry;
pub mod runner;
pub mod service;
pub mod status;

pub use pool::{Admission, WorkerPool};
pub use registry::ExecutionRegistry;
pub use runner::IngestKind;
pub use service::{IngestService, SubmitReceipt};
pub use status::{NotFoundReason, StatusReport, query_status};
