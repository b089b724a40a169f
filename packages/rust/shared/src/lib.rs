//! Shared types, error model, and configuration for the warehouse crates.
//!
//! This crate is the foundation depended on by all other warehouse crates.
//! It provides:
//! - [`WarehouseError`]: the unified error type
//! - Domain types ([`ExecutionRecord`], [`DatasetDocument`], [`HistoryEntry`], [`StatusPointer`])
//! - Configuration ([`AppConfig`], [`WorkerConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, PipelineMapping, SourceConfig, SourceCredentials, WorkerConfig,
    WorkersConfig, config_dir, config_file_path, expand_home, init_config, load_config,
    load_config_from, resolve_source_credentials,
};
pub use error::{Result, WarehouseError};
pub use types::{
    DatasetDocument, DatasetSummary, ExecutionId, ExecutionRecord, ExecutionStatus, HistoryEntry,
    HistoryFilter, HistoryStatus, MAX_IDENTIFIER_LEN, MetadataUpdate, Row, StatusPointer,
    UpsertOutcome, validate_identifier,
};
