//! Upstream sources that supply raw rows for a dataset identifier.
//!
//! This crate provides:
//! - [`SourceAdapter`]: the trait the task runner pulls through
//! - [`ErpSource`]: the ERP HTTP adapter

pub mod erp;

use async_trait::async_trait;
use warehouse_shared::{Result, Row};

pub use erp::ErpSource;

/// An upstream system that can be asked for the current rows of a dataset.
///
/// Failures are reported as `UpstreamNotFound`, `UpstreamAuth` or
/// `UpstreamTransport`; callers decide which of those are soft.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Fetch every row currently published for `identifier`.
    async fn pull(&self, identifier: &str) -> Result<Vec<Row>>;

    /// Name the upstream uses for `identifier`; also the display name given
    /// to a dataset created from it.
    fn upstream_name(&self, identifier: &str) -> String {
        identifier.to_string()
    }

    /// Human-readable adapter name for tracing.
    fn name(&self) -> &str;
}
