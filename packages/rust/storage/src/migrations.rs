//! SQL migration definitions for the warehouse database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: datasets, pipeline_history, status_pointers",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One document per dataset identifier; owners and rows are JSON arrays
CREATE TABLE IF NOT EXISTS datasets (
    dataset_id           TEXT PRIMARY KEY,
    storage_key          TEXT NOT NULL UNIQUE,
    owners_json          TEXT NOT NULL,
    display_name         TEXT NOT NULL,
    description          TEXT,
    tags_json            TEXT NOT NULL DEFAULT '[]',
    permissions          TEXT NOT NULL DEFAULT 'private',
    rows_json            TEXT NOT NULL,
    record_count         INTEGER NOT NULL,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL,
    pulled_from_pipeline INTEGER NOT NULL DEFAULT 0
);

-- Per-pipeline run history, one row per execution
CREATE TABLE IF NOT EXISTS pipeline_history (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_name  TEXT NOT NULL,
    execution_id   TEXT NOT NULL,
    status         TEXT NOT NULL,
    requester_id   TEXT NOT NULL,
    requester_name TEXT NOT NULL,
    timestamp      TEXT NOT NULL,
    UNIQUE(pipeline_name, execution_id)
);

CREATE INDEX IF NOT EXISTS idx_history_pipeline ON pipeline_history(pipeline_name, seq);

-- Latest execution per (target, requester)
CREATE TABLE IF NOT EXISTS status_pointers (
    target       TEXT NOT NULL,
    requester_id TEXT NOT NULL,
    execution_id TEXT NOT NULL,
    status       TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    PRIMARY KEY (target, requester_id)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "History timestamp index for since-filters",
            sql: r#"
CREATE INDEX IF NOT EXISTS idx_history_timestamp ON pipeline_history(timestamp);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
