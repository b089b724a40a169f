//! libSQL-backed document store for ingested datasets.
//!
//! The [`Storage`] struct wraps a libSQL database holding dataset documents,
//! per-pipeline run history and the durable status pointers.
//!
//! **Atomicity rules:**
//! - every write is a single SQL statement, so concurrent writers to the same
//!   key serialize inside the database and never see a half-applied update
//! - writes to different keys touch different rows and do not block each other
//!   beyond SQLite's own statement locking

mod migrations;

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use uuid::Uuid;
use warehouse_shared::{
    DatasetDocument, DatasetSummary, ExecutionId, HistoryEntry, HistoryFilter, MetadataUpdate,
    Result, Row, StatusPointer, UpsertOutcome, WarehouseError,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WarehouseError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (for inspection tooling).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        WarehouseError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(WarehouseError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dataset operations
    // -----------------------------------------------------------------------

    /// Insert-or-refresh the dataset `dataset_id` with freshly pulled `rows`.
    ///
    /// A new document gets a fresh storage key, `owners = {requester_id}` and
    /// `display_name`. An existing one gets `requester_id` unioned into its
    /// owners, its rows and count replaced and `updated_at` bumped; storage key,
    /// `created_at`, display name and user-edited metadata are left alone.
    pub async fn upsert_dataset(
        &self,
        dataset_id: &str,
        display_name: &str,
        requester_id: &str,
        rows: &[Row],
    ) -> Result<UpsertOutcome> {
        self.check_writable()?;
        let storage_key = Uuid::now_v7().to_string();
        let rows_json = serde_json::to_string(rows)?;
        let now = format_ts(&Utc::now());

        let mut result = self
            .conn
            .query(
                "INSERT INTO datasets (dataset_id, storage_key, owners_json, display_name,
                                       rows_json, record_count, created_at, updated_at,
                                       pulled_from_pipeline)
                 VALUES (?1, ?2, json_array(?3), ?4, ?5, ?6, ?7, ?7, 1)
                 ON CONFLICT(dataset_id) DO UPDATE SET
                   owners_json = CASE
                     WHEN EXISTS (SELECT 1 FROM json_each(datasets.owners_json) WHERE value = ?3)
                       THEN datasets.owners_json
                     ELSE json_insert(datasets.owners_json, '$[#]', ?3)
                   END,
                   rows_json = excluded.rows_json,
                   record_count = excluded.record_count,
                   updated_at = excluded.updated_at
                 RETURNING storage_key",
                params![
                    dataset_id,
                    storage_key.as_str(),
                    requester_id,
                    display_name,
                    rows_json,
                    rows.len() as i64,
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;

        let stored_key: String = match result.next().await.map_err(db_err)? {
            Some(row) => row.get(0).map_err(db_err)?,
            None => {
                return Err(WarehouseError::Storage(format!(
                    "upsert of dataset '{dataset_id}' returned no row"
                )));
            }
        };

        Ok(UpsertOutcome {
            created: stored_key == storage_key,
            storage_key: stored_key,
            record_count: rows.len(),
        })
    }

    /// Whether a document exists for `dataset_id`. Reads no row data.
    pub async fn dataset_exists(&self, dataset_id: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM datasets WHERE dataset_id = ?1",
                params![dataset_id],
            )
            .await
            .map_err(db_err)?;

        Ok(rows.next().await.map_err(db_err)?.is_some())
    }

    /// Current owners of `dataset_id`, or `None` if no document exists.
    pub async fn dataset_owners(&self, dataset_id: &str) -> Result<Option<BTreeSet<String>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT owners_json FROM datasets WHERE dataset_id = ?1",
                params![dataset_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let owners_json: String = row.get(0).map_err(db_err)?;
                Ok(Some(serde_json::from_str(&owners_json)?))
            }
            None => Ok(None),
        }
    }

    /// Get the full document for `dataset_id`, rows included.
    pub async fn get_dataset(&self, dataset_id: &str) -> Result<Option<DatasetDocument>> {
        let mut rows = self
            .conn
            .query(
                "SELECT dataset_id, storage_key, owners_json, display_name, description,
                        tags_json, permissions, rows_json, record_count, created_at,
                        updated_at, pulled_from_pipeline
                 FROM datasets WHERE dataset_id = ?1",
                params![dataset_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_dataset(&row)?)),
            None => Ok(None),
        }
    }

    /// List datasets whose owners include `requester_id`, newest update first.
    pub async fn list_datasets_for_owner(&self, requester_id: &str) -> Result<Vec<DatasetSummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT d.dataset_id, d.display_name, d.description, d.record_count,
                        d.created_at, d.updated_at
                 FROM datasets d
                 WHERE EXISTS (SELECT 1 FROM json_each(d.owners_json) WHERE value = ?1)
                 ORDER BY d.updated_at DESC, d.dataset_id",
                params![requester_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(DatasetSummary {
                dataset_id: row.get(0).map_err(db_err)?,
                display_name: row.get(1).map_err(db_err)?,
                description: row.get::<String>(2).ok(),
                record_count: row.get::<i64>(3).map_err(db_err)? as usize,
                created_at: parse_ts(&row.get::<String>(4).map_err(db_err)?)?,
                updated_at: parse_ts(&row.get::<String>(5).map_err(db_err)?)?,
            });
        }
        Ok(results)
    }

    /// Apply a user edit to descriptive metadata. Returns `false` if the
    /// dataset does not exist. Rows, owners and timestamps are not touched.
    pub async fn update_dataset_metadata(
        &self,
        dataset_id: &str,
        update: &MetadataUpdate,
    ) -> Result<bool> {
        self.check_writable()?;
        let tags_json = update
            .tags
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let affected = self
            .conn
            .execute(
                "UPDATE datasets SET
                   description = COALESCE(?2, description),
                   tags_json = COALESCE(?3, tags_json),
                   permissions = COALESCE(?4, permissions)
                 WHERE dataset_id = ?1",
                params![
                    dataset_id,
                    update.description.as_deref(),
                    tags_json.as_deref(),
                    update.permissions.as_deref(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Pipeline history operations
    // -----------------------------------------------------------------------

    /// Record `entry` in its pipeline's history.
    ///
    /// The first call for an execution appends; later calls for the same
    /// `(pipeline_name, execution_id)` overwrite status, requester and
    /// timestamp in place, keeping the entry's position.
    pub async fn append_or_update_history(&self, entry: &HistoryEntry) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO pipeline_history (pipeline_name, execution_id, status,
                                               requester_id, requester_name, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(pipeline_name, execution_id) DO UPDATE SET
                   status = excluded.status,
                   requester_id = excluded.requester_id,
                   requester_name = excluded.requester_name,
                   timestamp = excluded.timestamp",
                params![
                    entry.pipeline_name.as_str(),
                    entry.execution_id.to_string(),
                    entry.status.as_str(),
                    entry.requester_id.as_str(),
                    entry.requester_name.as_str(),
                    format_ts(&entry.timestamp),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// History of one pipeline in append order.
    ///
    /// `filter.name_contains` matches the requester's display name, folding
    /// ASCII case only (SQLite `lower`).
    pub async fn list_history(
        &self,
        pipeline_name: &str,
        filter: &HistoryFilter,
    ) -> Result<Vec<HistoryEntry>> {
        let since = filter.since.as_ref().map(format_ts);
        let rows = self
            .conn
            .query(
                "SELECT pipeline_name, execution_id, status, requester_id, requester_name, timestamp
                 FROM pipeline_history
                 WHERE pipeline_name = ?1
                   AND (?2 IS NULL OR instr(lower(requester_name), lower(?2)) > 0)
                   AND (?3 IS NULL OR timestamp >= ?3)
                 ORDER BY seq",
                params![
                    pipeline_name,
                    filter.name_contains.as_deref(),
                    since.as_deref(),
                ],
            )
            .await
            .map_err(db_err)?;

        collect_history(rows).await
    }

    /// History across all pipelines, grouped by pipeline then append order.
    ///
    /// `filter.name_contains` matches the pipeline name, folding ASCII case only.
    pub async fn search_history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>> {
        let since = filter.since.as_ref().map(format_ts);
        let rows = self
            .conn
            .query(
                "SELECT pipeline_name, execution_id, status, requester_id, requester_name, timestamp
                 FROM pipeline_history
                 WHERE (?1 IS NULL OR instr(lower(pipeline_name), lower(?1)) > 0)
                   AND (?2 IS NULL OR timestamp >= ?2)
                 ORDER BY pipeline_name, seq",
                params![filter.name_contains.as_deref(), since.as_deref()],
            )
            .await
            .map_err(db_err)?;

        collect_history(rows).await
    }

    // -----------------------------------------------------------------------
    // Status pointer operations
    // -----------------------------------------------------------------------

    /// Insert or overwrite the pointer for `(pointer.target, pointer.requester_id)`.
    pub async fn upsert_status_pointer(&self, pointer: &StatusPointer) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO status_pointers (target, requester_id, execution_id, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(target, requester_id) DO UPDATE SET
                   execution_id = excluded.execution_id,
                   status = excluded.status,
                   updated_at = excluded.updated_at",
                params![
                    pointer.target.as_str(),
                    pointer.requester_id.as_str(),
                    pointer.execution_id.to_string(),
                    pointer.status.as_str(),
                    format_ts(&pointer.updated_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Get the pointer for `(target, requester_id)`.
    pub async fn get_status_pointer(
        &self,
        target: &str,
        requester_id: &str,
    ) -> Result<Option<StatusPointer>> {
        let mut rows = self
            .conn
            .query(
                "SELECT target, requester_id, execution_id, status, updated_at
                 FROM status_pointers WHERE target = ?1 AND requester_id = ?2",
                params![target, requester_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(StatusPointer {
                target: row.get(0).map_err(db_err)?,
                requester_id: row.get(1).map_err(db_err)?,
                execution_id: parse_execution_id(&row.get::<String>(2).map_err(db_err)?)?,
                status: row.get::<String>(3).map_err(db_err)?.parse()?,
                updated_at: parse_ts(&row.get::<String>(4).map_err(db_err)?)?,
            })),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Row conversion helpers
// ---------------------------------------------------------------------------

fn db_err(e: libsql::Error) -> WarehouseError {
    WarehouseError::Storage(e.to_string())
}

/// Fixed-width UTC timestamps so stored values compare lexically.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WarehouseError::Storage(format!("invalid date '{s}': {e}")))
}

fn parse_execution_id(s: &str) -> Result<ExecutionId> {
    s.parse()
        .map_err(|e| WarehouseError::Storage(format!("invalid execution id '{s}': {e}")))
}

/// Convert a database row to a [`DatasetDocument`].
fn row_to_dataset(row: &libsql::Row) -> Result<DatasetDocument> {
    let owners_json: String = row.get(2).map_err(db_err)?;
    let tags_json: String = row.get(5).map_err(db_err)?;
    let rows_json: String = row.get(7).map_err(db_err)?;

    Ok(DatasetDocument {
        dataset_id: row.get(0).map_err(db_err)?,
        storage_key: row.get(1).map_err(db_err)?,
        owners: serde_json::from_str(&owners_json)?,
        display_name: row.get(3).map_err(db_err)?,
        description: row.get::<String>(4).ok(),
        tags: serde_json::from_str(&tags_json)?,
        permissions: row.get(6).map_err(db_err)?,
        rows: serde_json::from_str(&rows_json)?,
        record_count: row.get::<i64>(8).map_err(db_err)? as usize,
        created_at: parse_ts(&row.get::<String>(9).map_err(db_err)?)?,
        updated_at: parse_ts(&row.get::<String>(10).map_err(db_err)?)?,
        pulled_from_pipeline: row.get::<i64>(11).map_err(db_err)? != 0,
    })
}

async fn collect_history(mut rows: libsql::Rows) -> Result<Vec<HistoryEntry>> {
    let mut results = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        results.push(HistoryEntry {
            pipeline_name: row.get(0).map_err(db_err)?,
            execution_id: parse_execution_id(&row.get::<String>(1).map_err(db_err)?)?,
            status: row.get::<String>(2).map_err(db_err)?.parse()?,
            requester_id: row.get(3).map_err(db_err)?,
            requester_name: row.get(4).map_err(db_err)?,
            timestamp: parse_ts(&row.get::<String>(5).map_err(db_err)?)?,
        });
    }
    Ok(results)
}
