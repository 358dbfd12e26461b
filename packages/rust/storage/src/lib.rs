//! libSQL storage layer for listings and dead letters.
//!
//! The [`ListingStore`] keeps one record per subject, merged last-write-wins
//! on top-level fields, and the write-once dead-letter table.
//!
//! **Access rules:**
//! - pipeline workers: read-write via [`ListingStore::open`]
//! - inspection commands: read-only via [`ListingStore::open_readonly`]
//!
//! Every write runs on its own connection inside an `IMMEDIATE` transaction,
//! so concurrent upserts of the same subject serialize at the database.

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, TransactionBehavior, params};
use listingflow_shared::{DeadLetterRecord, ListingFlowError, Result, StoredRef, UpsertOutcome};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// How long a writer waits for the database lock before failing.
const BUSY_TIMEOUT_MS: u32 = 5000;

type Fields = serde_json::Map<String, serde_json::Value>;

fn storage_err(e: impl std::fmt::Display) -> ListingFlowError {
    ListingFlowError::Storage(e.to_string())
}

/// A persisted listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingRecord {
    pub storage_id: String,
    pub subject_id: String,
    pub fields: Fields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A dead-letter record as stored, with its identity hash.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDeadLetter {
    pub id: String,
    pub record: DeadLetterRecord,
    pub stored_at: DateTime<Utc>,
}

/// Primary storage handle wrapping a libSQL database.
pub struct ListingStore {
    db: Database,
    readonly: bool,
}

impl ListingStore {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ListingFlowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let store = Self {
            db,
            readonly: false,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        Ok(Self { db, readonly: true })
    }

    async fn connect(&self) -> Result<Connection> {
        let conn = self.db.connect().map_err(storage_err)?;
        // PRAGMA busy_timeout returns a row, so it goes through query().
        conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
            .await
            .map_err(storage_err)?;
        Ok(conn)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let conn = self.connect().await?;
        let current_version = Self::schema_version(&conn).await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    ListingFlowError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn schema_version(conn: &Connection) -> u32 {
        match conn
            .query("SELECT MAX(version) FROM schema_migrations", ())
            .await
        {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ListingFlowError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Listings
    // -----------------------------------------------------------------------

    /// Create or merge the record for `subject_id`.
    ///
    /// Incoming top-level fields replace stored ones; fields the caller does
    /// not send are kept. When the merge changes nothing the outcome is
    /// [`UpsertOutcome::Unchanged`] and no write happens.
    #[tracing::instrument(skip_all, fields(subject_id = %subject_id))]
    pub async fn upsert(&self, subject_id: &str, fields: &Fields) -> Result<StoredRef> {
        self.check_writable()?;
        if subject_id.is_empty() {
            return Err(ListingFlowError::validation("subject id must not be empty"));
        }

        let conn = self.connect().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(storage_err)?;

        let merged = Self::merge_in_tx(&tx, subject_id, fields).await;
        match merged {
            Ok(stored) => {
                tx.commit().await.map_err(storage_err)?;
                tracing::debug!(storage_id = %stored.storage_id, outcome = %stored.outcome, "listing upserted");
                Ok(stored)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn merge_in_tx(conn: &Connection, subject_id: &str, fields: &Fields) -> Result<StoredRef> {
        let mut rows = conn
            .query(
                "SELECT id, fields_json FROM listings WHERE subject_id = ?1",
                params![subject_id],
            )
            .await
            .map_err(storage_err)?;
        let existing = match rows.next().await.map_err(storage_err)? {
            Some(row) => Some((
                row.get::<String>(0).map_err(storage_err)?,
                row.get::<String>(1).map_err(storage_err)?,
            )),
            None => None,
        };
        drop(rows);

        let now = Utc::now().to_rfc3339();

        let Some((storage_id, stored_json)) = existing else {
            let storage_id = Uuid::now_v7().to_string();
            let canonical = serde_json::to_string(fields)?;
            conn.execute(
                "INSERT INTO listings (id, subject_id, fields_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    storage_id.as_str(),
                    subject_id,
                    canonical.as_str(),
                    now.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
            return Ok(StoredRef {
                storage_id,
                outcome: UpsertOutcome::Inserted,
            });
        };

        let mut merged: Fields = serde_json::from_str(&stored_json)?;
        for (key, value) in fields {
            merged.insert(key.clone(), value.clone());
        }
        // serde_json maps are key-sorted, so equal content means equal text.
        let canonical = serde_json::to_string(&merged)?;
        if canonical == stored_json {
            return Ok(StoredRef {
                storage_id,
                outcome: UpsertOutcome::Unchanged,
            });
        }

        conn.execute(
            "UPDATE listings SET fields_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![canonical.as_str(), now.as_str(), storage_id.as_str()],
        )
        .await
        .map_err(storage_err)?;

        Ok(StoredRef {
            storage_id,
            outcome: UpsertOutcome::Updated,
        })
    }

    /// Get the record for a subject.
    pub async fn get(&self, subject_id: &str) -> Result<Option<ListingRecord>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, subject_id, fields_json, created_at, updated_at
                 FROM listings WHERE subject_id = ?1",
                params![subject_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => {
                let fields_json = row.get::<String>(2).map_err(storage_err)?;
                Ok(Some(ListingRecord {
                    storage_id: row.get::<String>(0).map_err(storage_err)?,
                    subject_id: row.get::<String>(1).map_err(storage_err)?,
                    fields: serde_json::from_str(&fields_json)?,
                    created_at: parse_timestamp(&row.get::<String>(3).map_err(storage_err)?)?,
                    updated_at: parse_timestamp(&row.get::<String>(4).map_err(storage_err)?)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Number of stored listings.
    pub async fn count(&self) -> Result<u64> {
        let conn = self.connect().await?;
        count_rows(&conn, "SELECT COUNT(*) FROM listings").await
    }

    // -----------------------------------------------------------------------
    // Dead letters
    // -----------------------------------------------------------------------

    /// Store a dead-letter record once. Returns `false` when an identical
    /// record (same trace, stage and original body) is already stored.
    #[tracing::instrument(skip_all, fields(stage = %record.stage, reason = %record.reason))]
    pub async fn insert_dead_letter(&self, record: &DeadLetterRecord) -> Result<bool> {
        self.check_writable()?;
        let id = dead_letter_id(record)?;
        let record_json = serde_json::to_string(record)?;
        let failed_at = record.failed_at.to_rfc3339();
        let stored_at = Utc::now().to_rfc3339();
        let stage = record.stage.as_str();

        let conn = self.connect().await?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO dead_letters
                 (id, trace_id, subject_id, stage, reason, error, retry_count, failed_at, record_json, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id.as_str(),
                    record.trace_id(),
                    record.subject_id(),
                    stage,
                    record.reason.as_str(),
                    record.error.as_str(),
                    record.retry_count() as i64,
                    failed_at.as_str(),
                    record_json.as_str(),
                    stored_at.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;

        Ok(inserted > 0)
    }

    /// Most recently stored dead letters first.
    pub async fn list_dead_letters(&self, limit: u32) -> Result<Vec<StoredDeadLetter>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, record_json, stored_at FROM dead_letters
                 ORDER BY stored_at DESC, rowid DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let record_json = row.get::<String>(1).map_err(storage_err)?;
            results.push(StoredDeadLetter {
                id: row.get::<String>(0).map_err(storage_err)?,
                record: serde_json::from_str(&record_json)?,
                stored_at: parse_timestamp(&row.get::<String>(2).map_err(storage_err)?)?,
            });
        }
        Ok(results)
    }

    pub async fn dead_letter_count(&self) -> Result<u64> {
        let conn = self.connect().await?;
        count_rows(&conn, "SELECT COUNT(*) FROM dead_letters").await
    }
}

async fn count_rows(conn: &Connection, sql: &str) -> Result<u64> {
    let mut rows = conn.query(sql, ()).await.map_err(storage_err)?;
    match rows.next().await.map_err(storage_err)? {
        Some(row) => Ok(row.get::<i64>(0).map_err(storage_err)? as u64),
        None => Ok(0),
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ListingFlowError::Storage(format!("bad timestamp '{s}': {e}")))
}

/// SHA-256 over trace id, stage and the canonical original body.
fn dead_letter_id(record: &DeadLetterRecord) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(record.trace_id().unwrap_or_default().as_bytes());
    hasher.update(b"\n");
    hasher.update(record.stage.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(serde_json::to_vec(&record.original)?);
    Ok(format!("{:x}", hasher.finalize()))
}
