//! CSV ingestor.
//!
//! Streams a dataset CSV file through its configured column mapping into the
//! matching staging table. Rows are validated one at a time: a row missing a
//! required key field (or carrying a non-integer value in an integer field)
//! is appended to the rejection log and skipped, never aborting the load.
//! Reader-level CSV errors abort the file.
//!
//! Accepted rows are written in fixed-size chunks, one transaction per
//! chunk, so memory stays bounded regardless of file size. The batch id is
//! the staging-level idempotence key: re-ingesting an existing batch id
//! first clears the prior rows of that batch.

use crate::config::{DatasetConfig, Transform};
use crate::error::LoaderError;
use crate::schema::{self, TableKind};
use crate::store::{BatchRecord, CatalogDb};
use chrono::Utc;
use rusqlite::params_from_iter;
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use tracing::{info, warn};

const CHUNK_SIZE: usize = 500;

/// Outcome of one CSV load.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub batch_id: String,
    pub table: String,
    pub accepted: usize,
    pub rejected: usize,
    pub rejections: Vec<RejectedRow>,
}

/// One row that failed ingestion validation.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedRow {
    pub line: u64,
    pub natural_key: Option<String>,
    pub reason: String,
}

/// How one target field is filled from a CSV record.
struct FieldSource {
    csv_index: usize,
    transform: Option<Transform>,
}

/// Stage one CSV file for one table of a dataset.
///
/// `batch_id` defaults to `{dataset}-{table}-{utc timestamp}`. Passing the
/// same id again replaces the prior batch instead of duplicating it.
pub fn ingest_file(
    db: &mut CatalogDb,
    config: &DatasetConfig,
    table_name: &str,
    csv_path: &Path,
    batch_id: Option<String>,
) -> Result<IngestReport, LoaderError> {
    config.validate()?;
    let table = schema::lookup(table_name)
        .ok_or_else(|| LoaderError::config(format!("unknown table '{}'", table_name)))?;
    let mapping = config.mapping(table_name)?;

    let file = File::open(csv_path)?;
    let mut reader = csv::ReaderBuilder::new().from_reader(file);
    let headers = reader.headers()?.clone();

    // Resolve the mapping against the header row once, before any row is
    // read. A mapped CSV column missing from the file is a configuration
    // failure, not a mid-stream one.
    let fields = table.data_fields();
    let mut sources: Vec<Option<FieldSource>> = Vec::with_capacity(fields.len());
    for field in &fields {
        let source = mapping
            .columns
            .iter()
            .find(|(_, target)| target.as_str() == *field);
        match source {
            None => sources.push(None),
            Some((csv_column, _)) => {
                let csv_index = headers
                    .iter()
                    .position(|h| h == csv_column.as_str())
                    .ok_or_else(|| {
                        LoaderError::config(format!(
                            "CSV file {} has no column '{}' (mapped to field '{}')",
                            csv_path.display(),
                            csv_column,
                            field
                        ))
                    })?;
                sources.push(Some(FieldSource {
                    csv_index,
                    transform: mapping.transforms.get(csv_column).copied(),
                }));
            }
        }
    }

    let batch_id = batch_id.unwrap_or_else(|| {
        format!(
            "{}-{}-{}",
            config.name,
            table_name,
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        )
    });
    if db.batch_exists(&batch_id)? {
        info!("Batch {} already staged, re-staging", batch_id);
    }
    // Unconditional: also clears leftovers of a previously aborted load.
    db.clear_batch(&batch_id)?;

    let insert_sql = staging_insert_sql(&table);
    let required = table.required_fields();
    let integer_fields = table.integer_fields();

    let mut accepted = 0usize;
    let mut rejections: Vec<RejectedRow> = Vec::new();
    let mut pending: Vec<Vec<Option<String>>> = Vec::with_capacity(CHUNK_SIZE);

    let mut record = csv::StringRecord::new();
    loop {
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {}
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or(0);
                // The file aborts as a unit; drop chunks already flushed
                // for this batch.
                db.clear_batch(&batch_id)?;
                return Err(LoaderError::MalformedInput {
                    file: csv_path.display().to_string(),
                    line,
                    message: e.to_string(),
                });
            }
        }
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        let mut values: Vec<Option<String>> = Vec::with_capacity(fields.len());
        for source in &sources {
            let value = source.as_ref().and_then(|s| {
                let raw = record.get(s.csv_index).unwrap_or("");
                let value = match s.transform {
                    Some(transform) => transform.apply(raw),
                    None => raw.to_string(),
                };
                if value.is_empty() {
                    None
                } else {
                    Some(value)
                }
            });
            values.push(value);
        }

        match validate_row(&table, &fields, &values, &required, &integer_fields, line) {
            Ok(()) => {}
            Err(LoaderError::RowValidation {
                line,
                natural_key,
                reason,
            }) => {
                warn!("Rejected row {} of {}: {}", line, csv_path.display(), reason);
                rejections.push(RejectedRow {
                    line,
                    natural_key,
                    reason,
                });
                continue;
            }
            Err(other) => return Err(other),
        }

        pending.push(values);
        accepted += 1;
        if pending.len() >= CHUNK_SIZE {
            flush_chunk(db, &insert_sql, &batch_id, &mut pending)?;
        }
    }
    flush_chunk(db, &insert_sql, &batch_id, &mut pending)?;

    write_rejections(db, &batch_id, &rejections)?;
    db.register_batch(&BatchRecord {
        batch_id: batch_id.clone(),
        dataset: config.name.clone(),
        table_name: table_name.to_string(),
        source_file: Some(csv_path.display().to_string()),
        accepted,
        rejected: rejections.len(),
        created_at: Utc::now().to_rfc3339(),
    })?;

    info!(
        "Staged {}: {} rows accepted, {} rejected (batch {})",
        csv_path.display(),
        accepted,
        rejections.len(),
        batch_id
    );

    Ok(IngestReport {
        batch_id,
        table: table_name.to_string(),
        accepted,
        rejected: rejections.len(),
        rejections,
    })
}

fn staging_insert_sql(table: &TableKind) -> String {
    let fields = table.data_fields();
    let mut columns = vec!["batch_id"];
    columns.extend(fields.iter().copied());
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.staging_name(),
        columns.join(", "),
        (1..=columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

fn validate_row(
    table: &TableKind,
    fields: &[&'static str],
    values: &[Option<String>],
    required: &[&'static str],
    integer_fields: &[&'static str],
    line: u64,
) -> Result<(), LoaderError> {
    let field_value = |name: &str| -> &Option<String> {
        fields
            .iter()
            .position(|f| *f == name)
            .map(|i| &values[i])
            .unwrap_or(&None)
    };
    let natural_key = || -> Option<String> {
        table
            .required_fields()
            .first()
            .and_then(|f| field_value(f).clone())
    };

    for field in required {
        if field_value(field).is_none() {
            return Err(LoaderError::RowValidation {
                line,
                natural_key: natural_key(),
                reason: format!("missing required field '{}'", field),
            });
        }
    }
    for field in integer_fields {
        if let Some(value) = field_value(field) {
            if value.parse::<i64>().is_err() {
                return Err(LoaderError::RowValidation {
                    line,
                    natural_key: natural_key(),
                    reason: format!("field '{}' is not an integer: '{}'", field, value),
                });
            }
        }
    }
    Ok(())
}

fn flush_chunk(
    db: &mut CatalogDb,
    insert_sql: &str,
    batch_id: &str,
    pending: &mut Vec<Vec<Option<String>>>,
) -> Result<(), LoaderError> {
    if pending.is_empty() {
        return Ok(());
    }
    let tx = db.conn_mut().transaction().map_err(LoaderError::Sql)?;
    {
        let mut stmt = tx.prepare_cached(insert_sql)?;
        for row in pending.drain(..) {
            let mut bound: Vec<Option<String>> = Vec::with_capacity(row.len() + 1);
            bound.push(Some(batch_id.to_string()));
            bound.extend(row);
            stmt.execute(params_from_iter(bound))?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn write_rejections(
    db: &mut CatalogDb,
    batch_id: &str,
    rejections: &[RejectedRow],
) -> Result<(), LoaderError> {
    if rejections.is_empty() {
        return Ok(());
    }
    let tx = db.conn_mut().transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO staging_rejections (batch_id, line, natural_key, reason)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for rejected in rejections {
            stmt.execute(rusqlite::params![
                batch_id,
                rejected.line as i64,
                rejected.natural_key,
                rejected.reason
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}
