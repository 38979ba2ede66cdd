//! Staging analyzer.
//!
//! Compares staged batches against the current target tables and produces a
//! structured diff report without mutating any table. The merge engine runs
//! the exact same classification (through the shared helpers below) inside
//! its transaction, so a dry run and a commit can never diverge.
//!
//! Classification is deterministic: staged rows are read in natural-key
//! order with rowid as tiebreak, and a later staged row for the same key
//! supersedes an earlier one within the analyzed batch set. Rows are
//! visited one key group at a time, so memory stays bounded no matter how
//! large the staged batches are.

use crate::error::LoaderError;
use crate::schema::{self, AssociationTable, EntityTable};
use crate::store::CatalogDb;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;

/// Immutable snapshot of what a merge of the given batches would change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffReport {
    pub batch_ids: Vec<String>,
    pub tables: Vec<TableDiff>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableDiff {
    pub table: String,
    /// Raw staged row count for the batch set, before in-staging dedup.
    pub staged_rows: usize,
    /// Natural keys (or `left/right` pairs) that would be inserted.
    pub new: Vec<String>,
    /// Keys that already match an existing row exactly (no-op).
    pub duplicates: Vec<String>,
    /// Keys whose non-key attributes differ from the existing row.
    pub conflicts: Vec<RowConflict>,
    /// Associations with an unresolvable endpoint (entities only: empty).
    pub orphaned: Vec<AssociationRef>,
}

impl TableDiff {
    fn empty(table: &str) -> Self {
        TableDiff {
            table: table.to_string(),
            staged_rows: 0,
            new: Vec::new(),
            duplicates: Vec::new(),
            conflicts: Vec::new(),
            orphaned: Vec::new(),
        }
    }
}

/// A staged row that matched an existing row but disagrees on attributes,
/// with both sides recorded for review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowConflict {
    pub key: String,
    pub fields: Vec<FieldConflict>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldConflict {
    pub field: String,
    pub existing: Option<String>,
    pub staged: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssociationRef {
    pub left_key: String,
    pub right_key: String,
}

/// Diff the given staging batches against the target tables. Read-only.
pub fn analyze(db: &CatalogDb, batch_ids: &[String]) -> Result<DiffReport, LoaderError> {
    diff_with_conn(db.conn(), batch_ids)
}

pub(crate) fn diff_with_conn(
    conn: &Connection,
    batch_ids: &[String],
) -> Result<DiffReport, LoaderError> {
    let mut tables = Vec::new();
    if batch_ids.is_empty() {
        for entity in schema::ENTITY_TABLES {
            tables.push(TableDiff::empty(entity.name));
        }
        for association in schema::ASSOCIATION_TABLES {
            tables.push(TableDiff::empty(association.name));
        }
        return Ok(DiffReport {
            batch_ids: Vec::new(),
            tables,
        });
    }

    for entity in schema::ENTITY_TABLES {
        tables.push(entity_diff(conn, entity, batch_ids)?);
    }
    for association in schema::ASSOCIATION_TABLES {
        tables.push(association_diff(conn, association, batch_ids)?);
    }
    Ok(DiffReport {
        batch_ids: batch_ids.to_vec(),
        tables,
    })
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Visit the staged entity rows of a batch set, one deduplicated row per
/// natural key. Rows arrive ordered by key with rowid as tiebreak, so the
/// dedup (last staged row wins) collapses adjacent rows and only the
/// current key group is held in memory. Returns the raw staged row count.
pub(crate) fn for_each_staged_entity<F>(
    conn: &Connection,
    entity: &EntityTable,
    batch_ids: &[String],
    mut visit: F,
) -> Result<usize, LoaderError>
where
    F: FnMut(&str, &[Option<String>]) -> Result<(), LoaderError>,
{
    let sql = format!(
        "SELECT {} FROM {} WHERE batch_id IN ({}) ORDER BY {}, rowid",
        entity.data_fields().join(", "),
        entity.staging_name(),
        placeholders(batch_ids.len()),
        entity.natural_key,
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(batch_ids))?;

    let mut raw_count = 0usize;
    let mut current: Option<(String, Vec<Option<String>>)> = None;
    while let Some(row) = rows.next()? {
        raw_count += 1;
        let key: String = row.get(0)?;
        let mut attributes = Vec::with_capacity(entity.attributes.len());
        for index in 0..entity.attributes.len() {
            attributes.push(row.get::<_, Option<String>>(index + 1)?);
        }
        match &mut current {
            Some((current_key, current_attributes)) if *current_key == key => {
                *current_attributes = attributes;
            }
            _ => {
                if let Some((done_key, done_attributes)) = current.take() {
                    visit(&done_key, &done_attributes)?;
                }
                current = Some((key, attributes));
            }
        }
    }
    if let Some((done_key, done_attributes)) = current {
        visit(&done_key, &done_attributes)?;
    }
    Ok(raw_count)
}

/// Existing target attributes for a natural key, aligned with
/// `entity.attributes`. `None` when no row exists.
pub(crate) fn fetch_target_attributes(
    conn: &Connection,
    entity: &EntityTable,
    key: &str,
) -> Result<Option<Vec<Option<String>>>, LoaderError> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        entity.attributes.join(", "),
        entity.name,
        entity.natural_key,
    );
    let existing = conn
        .query_row(&sql, params![key], |row| {
            let mut attributes = Vec::with_capacity(entity.attributes.len());
            for index in 0..entity.attributes.len() {
                attributes.push(row.get::<_, Option<String>>(index)?);
            }
            Ok(attributes)
        })
        .optional()?;
    Ok(existing)
}

/// Field-level differences between a staged and an existing row. A staged
/// NULL means the dataset carried no value for that field and never
/// conflicts with the existing one.
pub(crate) fn attribute_conflicts(
    entity: &EntityTable,
    staged: &[Option<String>],
    existing: &[Option<String>],
) -> Vec<FieldConflict> {
    entity
        .attributes
        .iter()
        .enumerate()
        .filter_map(|(index, field)| match (&staged[index], &existing[index]) {
            (Some(staged_value), existing_value)
                if existing_value.as_deref() != Some(staged_value.as_str()) =>
            {
                Some(FieldConflict {
                    field: field.to_string(),
                    existing: existing_value.clone(),
                    staged: Some(staged_value.clone()),
                })
            }
            _ => None,
        })
        .collect()
}

fn entity_diff(
    conn: &Connection,
    entity: &EntityTable,
    batch_ids: &[String],
) -> Result<TableDiff, LoaderError> {
    let mut diff = TableDiff::empty(entity.name);
    let staged_rows = for_each_staged_entity(conn, entity, batch_ids, |key, attributes| {
        match fetch_target_attributes(conn, entity, key)? {
            None => diff.new.push(key.to_string()),
            Some(existing) => {
                let conflicts = attribute_conflicts(entity, attributes, &existing);
                if conflicts.is_empty() {
                    diff.duplicates.push(key.to_string());
                } else {
                    diff.conflicts.push(RowConflict {
                        key: key.to_string(),
                        fields: conflicts,
                    });
                }
            }
        }
        Ok(())
    })?;
    diff.staged_rows = staged_rows;
    Ok(diff)
}

/// Visit the staged association rows of a batch set, one deduplicated row
/// per (left, right) pair; a later staged row wins. Streams the same way as
/// [`for_each_staged_entity`]. Returns the raw staged row count.
pub(crate) fn for_each_staged_association<F>(
    conn: &Connection,
    association: &AssociationTable,
    batch_ids: &[String],
    mut visit: F,
) -> Result<usize, LoaderError>
where
    F: FnMut(&str, &str, Option<i64>) -> Result<(), LoaderError>,
{
    let sql = format!(
        "SELECT {}, {}, {} FROM {} WHERE batch_id IN ({}) ORDER BY {}, {}, rowid",
        association.left_key,
        association.right_key,
        association.role,
        association.staging_name(),
        placeholders(batch_ids.len()),
        association.left_key,
        association.right_key,
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(batch_ids))?;

    let mut raw_count = 0usize;
    let mut current: Option<(String, String, Option<i64>)> = None;
    while let Some(row) = rows.next()? {
        raw_count += 1;
        let left: String = row.get(0)?;
        let right: String = row.get(1)?;
        let position: Option<i64> = row.get(2)?;
        match &mut current {
            Some((current_left, current_right, current_position))
                if *current_left == left && *current_right == right =>
            {
                *current_position = position;
            }
            _ => {
                if let Some((done_left, done_right, done_position)) = current.take() {
                    visit(&done_left, &done_right, done_position)?;
                }
                current = Some((left, right, position));
            }
        }
    }
    if let Some((done_left, done_right, done_position)) = current {
        visit(&done_left, &done_right, done_position)?;
    }
    Ok(raw_count)
}

/// True when the key resolves in the entity's target table, or is staged in
/// the same batch set (and will exist after the same merge).
pub(crate) fn endpoint_resolvable(
    conn: &Connection,
    entity: &EntityTable,
    key: &str,
    batch_ids: &[String],
) -> Result<bool, LoaderError> {
    let in_target: bool = conn
        .query_row(
            &format!(
                "SELECT 1 FROM {} WHERE {} = ?1 LIMIT 1",
                entity.name, entity.natural_key
            ),
            params![key],
            |_| Ok(true),
        )
        .optional()?
        .is_some();
    if in_target {
        return Ok(true);
    }
    if batch_ids.is_empty() {
        return Ok(false);
    }
    let sql = format!(
        "SELECT 1 FROM {} WHERE {} = ?1 AND batch_id IN ({}) LIMIT 1",
        entity.staging_name(),
        entity.natural_key,
        placeholders(batch_ids.len()),
    );
    let mut bound = Vec::with_capacity(batch_ids.len() + 1);
    bound.push(key.to_string());
    bound.extend(batch_ids.iter().cloned());
    let staged: bool = conn
        .query_row(&sql, params_from_iter(bound), |_| Ok(true))
        .optional()?
        .is_some();
    Ok(staged)
}

pub(crate) fn fetch_target_position(
    conn: &Connection,
    association: &AssociationTable,
    left: &str,
    right: &str,
) -> Result<Option<Option<i64>>, LoaderError> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1 AND {} = ?2",
        association.role, association.name, association.left_key, association.right_key,
    );
    let existing = conn
        .query_row(&sql, params![left, right], |row| row.get::<_, Option<i64>>(0))
        .optional()?;
    Ok(existing)
}

fn association_diff(
    conn: &Connection,
    association: &AssociationTable,
    batch_ids: &[String],
) -> Result<TableDiff, LoaderError> {
    let mut diff = TableDiff::empty(association.name);
    let staged_rows =
        for_each_staged_association(conn, association, batch_ids, |left, right, position| {
            let left_ok = endpoint_resolvable(conn, association.left_entity(), left, batch_ids)?;
            let right_ok =
                endpoint_resolvable(conn, association.right_entity(), right, batch_ids)?;
            if !left_ok || !right_ok {
                diff.orphaned.push(AssociationRef {
                    left_key: left.to_string(),
                    right_key: right.to_string(),
                });
                return Ok(());
            }

            let pair = format!("{}/{}", left, right);
            match fetch_target_position(conn, association, left, right)? {
                None => diff.new.push(pair),
                Some(existing_position) if existing_position == position => {
                    diff.duplicates.push(pair)
                }
                Some(existing_position) => diff.conflicts.push(RowConflict {
                    key: pair,
                    fields: vec![FieldConflict {
                        field: association.role.to_string(),
                        existing: existing_position.map(|p| p.to_string()),
                        staged: position.map(|p| p.to_string()),
                    }],
                }),
            }
            Ok(())
        })?;
    diff.staged_rows = staged_rows;
    Ok(diff)
}
