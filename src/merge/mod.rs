//! Merge engine.
//!
//! Promotes staged batches into the target tables inside one transaction.
//! Entities are merged before the associations that reference them, so a
//! freshly staged artist is already in place when its album row links to it.
//! Classification reuses the analyzer's helpers, so what the dry run
//! reported is exactly what the merge acts on.
//!
//! A conflict under the `manual` policy aborts the whole batch; the
//! transaction rolls back and nothing is committed, staging included. An
//! association whose endpoint is still missing after the entity phase is
//! skipped and reported, never inserted.

use crate::analyze::{
    attribute_conflicts, fetch_target_attributes, fetch_target_position,
    for_each_staged_association, for_each_staged_entity, AssociationRef,
};
use crate::config::{ConflictPolicy, DatasetConfig};
use crate::error::LoaderError;
use crate::schema::{self, AssociationTable, EntityTable};
use crate::store::CatalogDb;
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Conflict policy selection per target table, with a fallback default.
#[derive(Debug, Clone)]
pub struct MergePolicies {
    per_table: BTreeMap<String, ConflictPolicy>,
    default: ConflictPolicy,
}

impl MergePolicies {
    /// Policies as declared by a dataset descriptor.
    pub fn from_config(config: &DatasetConfig) -> Self {
        let per_table = config
            .tables
            .iter()
            .map(|(name, mapping)| (name.clone(), mapping.policy))
            .collect();
        MergePolicies {
            per_table,
            default: ConflictPolicy::default(),
        }
    }

    /// The same policy for every table, as set on the command line.
    pub fn uniform(policy: ConflictPolicy) -> Self {
        MergePolicies {
            per_table: BTreeMap::new(),
            default: policy,
        }
    }

    fn for_entity(&self, entity: &EntityTable) -> ConflictPolicy {
        self.per_table.get(entity.name).copied().unwrap_or(self.default)
    }

    /// An association without its own entry follows its left entity's policy.
    fn for_association(&self, association: &AssociationTable) -> ConflictPolicy {
        self.per_table
            .get(association.name)
            .or_else(|| self.per_table.get(association.left_table))
            .copied()
            .unwrap_or(self.default)
    }
}

/// What one committed merge did, table by table.
#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub batch_ids: Vec<String>,
    pub tables: Vec<TableOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableOutcome {
    pub table: String,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Associations skipped because an endpoint entity does not exist.
    pub skipped_dangling: Vec<AssociationRef>,
}

impl TableOutcome {
    fn new(table: &str) -> Self {
        TableOutcome {
            table: table.to_string(),
            inserted: 0,
            updated: 0,
            unchanged: 0,
            skipped_dangling: Vec::new(),
        }
    }
}

/// Merge the given staging batches into the target tables.
///
/// All-or-nothing: either every accepted change lands and the merged
/// staging rows are cleared, or the database is left exactly as it was.
/// Re-running with the same (now cleared) batch ids is a no-op. Batch ids
/// that were never registered by an ingest are refused up front.
pub fn merge(
    db: &mut CatalogDb,
    policies: &MergePolicies,
    batch_ids: &[String],
) -> Result<MergeOutcome, LoaderError> {
    for batch_id in batch_ids {
        if !db.batch_exists(batch_id)? {
            return Err(LoaderError::config(format!(
                "unknown batch id '{}': not in the staging registry",
                batch_id
            )));
        }
    }
    let source_name = db.batch_datasets(batch_ids)?.join("+");
    let ingested_at = Utc::now().to_rfc3339();

    let tx = db.conn_mut().transaction()?;
    let mut tables = Vec::new();

    for entity in schema::ENTITY_TABLES {
        tables.push(merge_entity(
            &tx,
            entity,
            policies.for_entity(entity),
            batch_ids,
            &source_name,
            &ingested_at,
        )?);
    }
    for association in schema::ASSOCIATION_TABLES {
        tables.push(merge_association(
            &tx,
            association,
            policies.for_association(association),
            batch_ids,
            &source_name,
            &ingested_at,
        )?);
    }

    clear_merged_staging(&tx, batch_ids, &ingested_at)?;
    tx.commit()?;

    let outcome = MergeOutcome {
        batch_ids: batch_ids.to_vec(),
        tables,
    };
    for table in &outcome.tables {
        info!(
            "Merged {}: {} inserted, {} updated, {} unchanged, {} dangling skipped",
            table.table,
            table.inserted,
            table.updated,
            table.unchanged,
            table.skipped_dangling.len()
        );
    }
    Ok(outcome)
}

fn merge_entity(
    tx: &Transaction,
    entity: &EntityTable,
    policy: ConflictPolicy,
    batch_ids: &[String],
    source_name: &str,
    ingested_at: &str,
) -> Result<TableOutcome, LoaderError> {
    let mut outcome = TableOutcome::new(entity.name);

    let insert_sql = {
        let mut columns = entity.data_fields();
        columns.push("source_name");
        columns.push("ingested_at");
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            entity.name,
            columns.join(", "),
            (1..=columns.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", "),
        )
    };

    for_each_staged_entity(tx, entity, batch_ids, |key, attributes| {
        match fetch_target_attributes(tx, entity, key)? {
            None => {
                let mut bound: Vec<Option<String>> = Vec::with_capacity(attributes.len() + 3);
                bound.push(Some(key.to_string()));
                bound.extend(attributes.iter().cloned());
                bound.push(Some(source_name.to_string()));
                bound.push(Some(ingested_at.to_string()));
                tx.prepare_cached(&insert_sql)?.execute(params_from_iter(bound))?;
                outcome.inserted += 1;
            }
            Some(existing) => {
                let conflicts = attribute_conflicts(entity, attributes, &existing);
                if conflicts.is_empty() {
                    outcome.unchanged += 1;
                    return Ok(());
                }
                match policy {
                    ConflictPolicy::KeepExisting => outcome.unchanged += 1,
                    ConflictPolicy::PreferStaged => {
                        update_conflicting_fields(
                            tx,
                            entity,
                            key,
                            &conflicts
                                .iter()
                                .map(|c| (c.field.as_str(), c.staged.clone()))
                                .collect::<Vec<_>>(),
                            source_name,
                            ingested_at,
                        )?;
                        outcome.updated += 1;
                    }
                    ConflictPolicy::Manual => {
                        return Err(LoaderError::UnresolvedConflict {
                            table: entity.name.to_string(),
                            natural_key: key.to_string(),
                            field: conflicts[0].field.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    })?;
    Ok(outcome)
}

/// Overwrite only the fields that actually differ, leaving attributes the
/// staged row had no opinion on untouched.
fn update_conflicting_fields(
    tx: &Transaction,
    entity: &EntityTable,
    key: &str,
    fields: &[(&str, Option<String>)],
    source_name: &str,
    ingested_at: &str,
) -> Result<(), LoaderError> {
    let mut assignments: Vec<String> = Vec::with_capacity(fields.len() + 2);
    let mut bound: Vec<Option<String>> = Vec::with_capacity(fields.len() + 3);
    for (field, value) in fields {
        assignments.push(format!("{} = ?{}", field, bound.len() + 1));
        bound.push(value.clone());
    }
    assignments.push(format!("source_name = ?{}", bound.len() + 1));
    bound.push(Some(source_name.to_string()));
    assignments.push(format!("ingested_at = ?{}", bound.len() + 1));
    bound.push(Some(ingested_at.to_string()));

    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?{}",
        entity.name,
        assignments.join(", "),
        entity.natural_key,
        bound.len() + 1,
    );
    bound.push(Some(key.to_string()));
    tx.execute(&sql, params_from_iter(bound))?;
    Ok(())
}

fn merge_association(
    tx: &Transaction,
    association: &AssociationTable,
    policy: ConflictPolicy,
    batch_ids: &[String],
    source_name: &str,
    ingested_at: &str,
) -> Result<TableOutcome, LoaderError> {
    let mut outcome = TableOutcome::new(association.name);

    let insert_sql = format!(
        "INSERT INTO {} ({}, {}, {}, source_name, ingested_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        association.name, association.left_key, association.right_key, association.role,
    );
    let update_sql = format!(
        "UPDATE {} SET {} = ?1, source_name = ?2, ingested_at = ?3 WHERE {} = ?4 AND {} = ?5",
        association.name, association.role, association.left_key, association.right_key,
    );

    for_each_staged_association(tx, association, batch_ids, |left, right, position| {
        // Entities merged first; an endpoint still missing here is dangling.
        let left_ok = entity_exists(tx, association.left_entity(), left)?;
        let right_ok = entity_exists(tx, association.right_entity(), right)?;
        if !left_ok || !right_ok {
            let err = LoaderError::DanglingAssociation {
                table: association.name.to_string(),
                left_key: left.to_string(),
                right_key: right.to_string(),
            };
            warn!("{}, row skipped", err);
            outcome.skipped_dangling.push(AssociationRef {
                left_key: left.to_string(),
                right_key: right.to_string(),
            });
            return Ok(());
        }

        match fetch_target_position(tx, association, left, right)? {
            None => {
                tx.prepare_cached(&insert_sql)?
                    .execute(params![left, right, position, source_name, ingested_at])?;
                outcome.inserted += 1;
            }
            Some(existing) if existing == position => outcome.unchanged += 1,
            Some(_) => match policy {
                ConflictPolicy::KeepExisting => outcome.unchanged += 1,
                ConflictPolicy::PreferStaged => {
                    tx.prepare_cached(&update_sql)?
                        .execute(params![position, source_name, ingested_at, left, right])?;
                    outcome.updated += 1;
                }
                ConflictPolicy::Manual => {
                    return Err(LoaderError::UnresolvedConflict {
                        table: association.name.to_string(),
                        natural_key: format!("{}/{}", left, right),
                        field: association.role.to_string(),
                    });
                }
            },
        }
        Ok(())
    })?;
    Ok(outcome)
}

fn entity_exists(conn: &Connection, entity: &EntityTable, key: &str) -> Result<bool, LoaderError> {
    let found: bool = conn
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
    Ok(found)
}

/// Drop the merged staging rows and stamp the batches as merged. The
/// rejection log is kept for auditing.
fn clear_merged_staging(
    tx: &Transaction,
    batch_ids: &[String],
    merged_at: &str,
) -> Result<(), LoaderError> {
    for entity in schema::ENTITY_TABLES {
        for batch_id in batch_ids {
            tx.execute(
                &format!("DELETE FROM {} WHERE batch_id = ?1", entity.staging_name()),
                params![batch_id],
            )?;
        }
    }
    for association in schema::ASSOCIATION_TABLES {
        for batch_id in batch_ids {
            tx.execute(
                &format!(
                    "DELETE FROM {} WHERE batch_id = ?1",
                    association.staging_name()
                ),
                params![batch_id],
            )?;
        }
    }
    for batch_id in batch_ids {
        tx.execute(
            "UPDATE staging_batches SET merged_at = ?1 WHERE batch_id = ?2",
            params![merged_at, batch_id],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BatchRecord;

    fn test_db() -> CatalogDb {
        CatalogDb::open_in_memory().unwrap()
    }

    fn register(db: &CatalogDb, batch: &str, table: &str) {
        db.register_batch(&BatchRecord {
            batch_id: batch.to_string(),
            dataset: "mpd".to_string(),
            table_name: table.to_string(),
            source_file: None,
            accepted: 0,
            rejected: 0,
            created_at: "2024-01-01T00:00:00Z".to_string(),
        })
        .unwrap();
    }

    fn stage_artist(db: &CatalogDb, batch: &str, key: &str, name: Option<&str>) {
        db.conn()
            .execute(
                "INSERT INTO staging_artists (batch_id, key, name) VALUES (?1, ?2, ?3)",
                params![batch, key, name],
            )
            .unwrap();
    }

    fn target_artist_name(db: &CatalogDb, key: &str) -> Option<String> {
        db.conn()
            .query_row(
                "SELECT name FROM artists WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .unwrap()
    }

    fn batches(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn outcome_for<'a>(outcome: &'a MergeOutcome, table: &str) -> &'a TableOutcome {
        outcome.tables.iter().find(|t| t.table == table).unwrap()
    }

    #[test]
    fn test_new_rows_are_inserted_with_provenance() {
        let mut db = test_db();
        register(&db, "b1", "artists");
        stage_artist(&db, "b1", "A1", Some("Alice"));

        let outcome = merge(&mut db, &MergePolicies::uniform(ConflictPolicy::Manual), &batches(&["b1"])).unwrap();
        assert_eq!(outcome_for(&outcome, "artists").inserted, 1);
        assert_eq!(target_artist_name(&db, "A1").as_deref(), Some("Alice"));

        let source: String = db
            .conn()
            .query_row(
                "SELECT source_name FROM artists WHERE key = 'A1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(source, "mpd");
    }

    #[test]
    fn test_duplicate_rows_leave_target_untouched() {
        let mut db = test_db();
        register(&db, "b1", "artists");
        db.conn()
            .execute(
                "INSERT INTO artists (key, name, source_name) VALUES ('A1', 'Alice', 'seed')",
                [],
            )
            .unwrap();
        stage_artist(&db, "b1", "A1", Some("Alice"));

        let outcome = merge(&mut db, &MergePolicies::uniform(ConflictPolicy::Manual), &batches(&["b1"])).unwrap();
        assert_eq!(outcome_for(&outcome, "artists").unchanged, 1);
        // no overwrite of provenance either
        let source: String = db
            .conn()
            .query_row("SELECT source_name FROM artists WHERE key = 'A1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(source, "seed");
    }

    #[test]
    fn test_keep_existing_policy_preserves_target_value() {
        let mut db = test_db();
        register(&db, "b1", "artists");
        db.conn()
            .execute("INSERT INTO artists (key, name) VALUES ('A1', 'Alice')", [])
            .unwrap();
        stage_artist(&db, "b1", "A1", Some("Alicia"));

        let outcome = merge(
            &mut db,
            &MergePolicies::uniform(ConflictPolicy::KeepExisting),
            &batches(&["b1"]),
        )
        .unwrap();
        assert_eq!(outcome_for(&outcome, "artists").unchanged, 1);
        assert_eq!(target_artist_name(&db, "A1").as_deref(), Some("Alice"));
    }

    #[test]
    fn test_prefer_staged_policy_updates_only_conflicting_fields() {
        let mut db = test_db();
        register(&db, "b1", "artists");
        db.conn()
            .execute(
                "INSERT INTO artists (key, name, genres) VALUES ('A1', 'Alice', 'rock')",
                [],
            )
            .unwrap();
        // staged row has a new name but no opinion on genres
        stage_artist(&db, "b1", "A1", Some("Alicia"));

        let outcome = merge(
            &mut db,
            &MergePolicies::uniform(ConflictPolicy::PreferStaged),
            &batches(&["b1"]),
        )
        .unwrap();
        assert_eq!(outcome_for(&outcome, "artists").updated, 1);
        assert_eq!(target_artist_name(&db, "A1").as_deref(), Some("Alicia"));
        let genres: Option<String> = db
            .conn()
            .query_row("SELECT genres FROM artists WHERE key = 'A1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(genres.as_deref(), Some("rock"));
    }

    #[test]
    fn test_manual_policy_aborts_and_rolls_back() {
        let mut db = test_db();
        register(&db, "b1", "artists");
        db.conn()
            .execute("INSERT INTO artists (key, name) VALUES ('A1', 'Alice')", [])
            .unwrap();
        stage_artist(&db, "b1", "A1", Some("Alicia"));
        stage_artist(&db, "b1", "A2", Some("Bob"));

        let err = merge(
            &mut db,
            &MergePolicies::uniform(ConflictPolicy::Manual),
            &batches(&["b1"]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LoaderError::UnresolvedConflict { ref table, ref natural_key, .. }
                if table == "artists" && natural_key == "A1"
        ));

        // nothing committed: A2 not inserted, A1 untouched, staging intact
        assert_eq!(target_artist_name(&db, "A1").as_deref(), Some("Alice"));
        assert_eq!(db.target_count("artists").unwrap(), 1);
        let staged: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM staging_artists", [], |r| r.get(0))
            .unwrap();
        assert_eq!(staged, 2);
    }

    #[test]
    fn test_entities_merge_before_associations() {
        let mut db = test_db();
        register(&db, "b1", "artists");
        stage_artist(&db, "b1", "A1", Some("Alice"));
        db.conn()
            .execute(
                "INSERT INTO staging_tracks (batch_id, key, name) VALUES ('b1', 'T1', 'Song')",
                [],
            )
            .unwrap();
        db.conn()
            .execute(
                "INSERT INTO staging_track_artists (batch_id, track_key, artist_key, position)
                 VALUES ('b1', 'T1', 'A1', 0)",
                [],
            )
            .unwrap();

        let outcome = merge(&mut db, &MergePolicies::uniform(ConflictPolicy::Manual), &batches(&["b1"])).unwrap();
        assert_eq!(outcome_for(&outcome, "track_artists").inserted, 1);
        assert_eq!(db.target_count("track_artists").unwrap(), 1);
    }

    #[test]
    fn test_dangling_association_is_skipped_rest_committed() {
        let mut db = test_db();
        register(&db, "b1", "track_artists");
        db.conn()
            .execute("INSERT INTO tracks (key, name) VALUES ('T1', 'Song')", [])
            .unwrap();
        db.conn()
            .execute("INSERT INTO artists (key, name) VALUES ('A1', 'Alice')", [])
            .unwrap();
        db.conn()
            .execute(
                "INSERT INTO staging_track_artists (batch_id, track_key, artist_key, position)
                 VALUES ('b1', 'T1', 'A1', 0), ('b1', 'T1', 'A9', 1)",
                [],
            )
            .unwrap();

        let outcome = merge(&mut db, &MergePolicies::uniform(ConflictPolicy::Manual), &batches(&["b1"])).unwrap();
        let assoc = outcome_for(&outcome, "track_artists");
        assert_eq!(assoc.inserted, 1);
        assert_eq!(assoc.skipped_dangling.len(), 1);
        assert_eq!(assoc.skipped_dangling[0].right_key, "A9");
        assert_eq!(db.target_count("track_artists").unwrap(), 1);
    }

    #[test]
    fn test_association_position_conflict_follows_policy() {
        let mut db = test_db();
        register(&db, "b1", "track_artists");
        db.conn()
            .execute("INSERT INTO tracks (key, name) VALUES ('T1', 'Song')", [])
            .unwrap();
        db.conn()
            .execute("INSERT INTO artists (key, name) VALUES ('A1', 'Alice')", [])
            .unwrap();
        db.conn()
            .execute(
                "INSERT INTO track_artists (track_key, artist_key, position) VALUES ('T1', 'A1', 0)",
                [],
            )
            .unwrap();
        db.conn()
            .execute(
                "INSERT INTO staging_track_artists (batch_id, track_key, artist_key, position)
                 VALUES ('b1', 'T1', 'A1', 2)",
                [],
            )
            .unwrap();

        let outcome = merge(
            &mut db,
            &MergePolicies::uniform(ConflictPolicy::PreferStaged),
            &batches(&["b1"]),
        )
        .unwrap();
        assert_eq!(outcome_for(&outcome, "track_artists").updated, 1);
        let position: i64 = db
            .conn()
            .query_row("SELECT position FROM track_artists", [], |r| r.get(0))
            .unwrap();
        assert_eq!(position, 2);
    }

    #[test]
    fn test_merge_clears_staging_and_stamps_batch() {
        let mut db = test_db();
        register(&db, "b1", "artists");
        stage_artist(&db, "b1", "A1", Some("Alice"));

        merge(&mut db, &MergePolicies::uniform(ConflictPolicy::Manual), &batches(&["b1"])).unwrap();

        let staged: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM staging_artists", [], |r| r.get(0))
            .unwrap();
        assert_eq!(staged, 0);
        let merged_at: Option<String> = db
            .conn()
            .query_row(
                "SELECT merged_at FROM staging_batches WHERE batch_id = 'b1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(merged_at.is_some());
    }

    #[test]
    fn test_merge_refuses_unregistered_batch_id() {
        let mut db = test_db();
        // staged rows under an id that never went through ingestion
        stage_artist(&db, "b9", "A1", Some("Alice"));

        let err = merge(
            &mut db,
            &MergePolicies::uniform(ConflictPolicy::Manual),
            &batches(&["b9"]),
        )
        .unwrap_err();
        assert!(matches!(err, LoaderError::Configuration { .. }));
        assert!(err.to_string().contains("b9"));
        assert_eq!(db.target_count("artists").unwrap(), 0);
    }

    #[test]
    fn test_rerunning_a_merged_batch_changes_nothing() {
        let mut db = test_db();
        register(&db, "b1", "artists");
        stage_artist(&db, "b1", "A1", Some("Alice"));
        let policies = MergePolicies::uniform(ConflictPolicy::Manual);

        merge(&mut db, &policies, &batches(&["b1"])).unwrap();
        let second = merge(&mut db, &policies, &batches(&["b1"])).unwrap();

        assert_eq!(outcome_for(&second, "artists").inserted, 0);
        assert_eq!(db.target_count("artists").unwrap(), 1);
    }

    #[test]
    fn test_in_staging_duplicates_collapse_to_one_row() {
        let mut db = test_db();
        register(&db, "b1", "artists");
        stage_artist(&db, "b1", "A1", Some("Alicia"));
        stage_artist(&db, "b1", "A1", Some("Alice"));

        let outcome = merge(&mut db, &MergePolicies::uniform(ConflictPolicy::Manual), &batches(&["b1"])).unwrap();
        assert_eq!(outcome_for(&outcome, "artists").inserted, 1);
        assert_eq!(target_artist_name(&db, "A1").as_deref(), Some("Alice"));
    }

    #[test]
    fn test_policy_from_config_falls_back_to_left_entity() {
        let config = DatasetConfig::from_toml_str(
            r#"
name = "mpd"
[tables.tracks]
policy = "prefer-staged"
[tables.tracks.columns]
uri = "key"
"#,
        )
        .unwrap();
        let policies = MergePolicies::from_config(&config);
        assert_eq!(
            policies.for_association(&schema::TRACK_ARTISTS),
            ConflictPolicy::PreferStaged
        );
        assert_eq!(policies.for_entity(&schema::ARTISTS), ConflictPolicy::Manual);
    }
}
