//! SQLite-backed catalog database handle.
//!
//! Owns the single write connection the pipeline uses. The schema is created
//! on first open and validated against the declarations on every subsequent
//! open. Batch bookkeeping (the staging-level idempotence registry) lives
//! here; the ingestor, analyzer and merge engine run their statements through
//! this handle.

use crate::schema;
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::info;

pub struct CatalogDb {
    conn: Connection,
}

/// One row of the `staging_batches` registry.
#[derive(Debug, Clone)]
pub struct BatchRecord {
    pub batch_id: String,
    pub dataset: String,
    pub table_name: String,
    pub source_file: Option<String>,
    pub accepted: usize,
    pub rejected: usize,
    pub created_at: String,
}

impl CatalogDb {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open_with_flags(
            db_path.as_ref(),
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open catalog database")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        let table_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
                [],
                |r| r.get(0),
            )
            .unwrap_or(0);

        if table_count == 0 {
            info!("Creating catalog schema");
            for table in schema::schema_tables() {
                table.create(&conn)?;
            }
        } else {
            for table in schema::schema_tables() {
                table.validate(&conn)?;
            }
        }

        let db = CatalogDb { conn };
        let artist_count = db.target_count("artists")?;
        let album_count = db.target_count("albums")?;
        let track_count = db.target_count("tracks")?;
        info!(
            "Opened catalog: {} artists, {} albums, {} tracks",
            artist_count, album_count, track_count
        );
        Ok(db)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn target_count(&self, table_name: &str) -> Result<i64> {
        let count = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table_name), [], |r| {
                r.get(0)
            })
            .with_context(|| format!("Failed to count rows in {}", table_name))?;
        Ok(count)
    }

    pub fn register_batch(&self, record: &BatchRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO staging_batches
                 (batch_id, dataset, table_name, source_file, accepted, rejected, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.batch_id,
                    record.dataset,
                    record.table_name,
                    record.source_file,
                    record.accepted as i64,
                    record.rejected as i64,
                    record.created_at,
                ],
            )
            .with_context(|| format!("Failed to register batch {}", record.batch_id))?;
        Ok(())
    }

    pub fn batch_exists(&self, batch_id: &str) -> Result<bool> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT 1 FROM staging_batches WHERE batch_id = ?1",
                params![batch_id],
                |_| Ok(true),
            )
            .unwrap_or(false);
        Ok(exists)
    }

    /// Remove every trace of a batch from the staging area: staged rows in
    /// all mirrors, its rejection log, and its registry entry. Used before
    /// re-ingesting the same batch id so a re-run never duplicates rows.
    pub fn clear_batch(&mut self, batch_id: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        for entity in schema::ENTITY_TABLES {
            tx.execute(
                &format!("DELETE FROM {} WHERE batch_id = ?1", entity.staging_name()),
                params![batch_id],
            )?;
        }
        for association in schema::ASSOCIATION_TABLES {
            tx.execute(
                &format!(
                    "DELETE FROM {} WHERE batch_id = ?1",
                    association.staging_name()
                ),
                params![batch_id],
            )?;
        }
        tx.execute(
            "DELETE FROM staging_rejections WHERE batch_id = ?1",
            params![batch_id],
        )?;
        tx.execute(
            "DELETE FROM staging_batches WHERE batch_id = ?1",
            params![batch_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Datasets the given batches were loaded from, deduplicated, in batch
    /// order. Used for row provenance at merge time.
    pub fn batch_datasets(&self, batch_ids: &[String]) -> Result<Vec<String>> {
        let mut datasets = Vec::new();
        for batch_id in batch_ids {
            let dataset: Option<String> = self
                .conn
                .query_row(
                    "SELECT dataset FROM staging_batches WHERE batch_id = ?1",
                    params![batch_id],
                    |r| r.get(0),
                )
                .ok();
            if let Some(dataset) = dataset {
                if !datasets.contains(&dataset) {
                    datasets.push(dataset);
                }
            }
        }
        Ok(datasets)
    }
}
