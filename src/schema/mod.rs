//! Catalog schema model.
//!
//! Central declaration of the entity tables (artists, albums, tracks), the
//! association tables linking them, their natural keys, and the staging
//! mirrors each target table has. Any component asking "does row A equal
//! row B" must delegate to the natural key declared here; no other field
//! participates in identity.
//!
//! Data columns are stored as normalized TEXT. Integer-typed attributes are
//! validated at ingestion time but kept textual so staged and target values
//! compare uniformly. Association role columns are INTEGER.

use crate::sqlite_persistence::{Column, Table};

/// An entity table: a uniquely identifiable real-world object type.
#[derive(Debug)]
pub struct EntityTable {
    pub name: &'static str,
    /// The field that uniquely identifies an entity across datasets.
    pub natural_key: &'static str,
    /// Non-key descriptive attributes, in declaration order.
    pub attributes: &'static [&'static str],
    /// Attributes that must parse as integers during ingestion.
    pub integer_attributes: &'static [&'static str],
}

/// An association table: a many-to-many relationship between two entities,
/// carrying an ordering attribute.
#[derive(Debug)]
pub struct AssociationTable {
    pub name: &'static str,
    pub left_table: &'static str,
    pub left_key: &'static str,
    pub right_table: &'static str,
    pub right_key: &'static str,
    /// Role/ordering attribute (artist position on the album or track).
    pub role: &'static str,
}

pub const ARTISTS: EntityTable = EntityTable {
    name: "artists",
    natural_key: "key",
    attributes: &["name", "genres"],
    integer_attributes: &[],
};

pub const ALBUMS: EntityTable = EntityTable {
    name: "albums",
    natural_key: "key",
    attributes: &[
        "name",
        "album_type",
        "release_date",
        "release_date_precision",
        "n_tracks",
    ],
    integer_attributes: &["n_tracks"],
};

pub const TRACKS: EntityTable = EntityTable {
    name: "tracks",
    natural_key: "key",
    attributes: &[
        "name",
        "duration_ms",
        "explicit",
        "disc_number",
        "track_number",
        "album_key",
    ],
    integer_attributes: &["duration_ms", "disc_number", "track_number"],
};

pub const ALBUM_ARTISTS: AssociationTable = AssociationTable {
    name: "album_artists",
    left_table: "albums",
    left_key: "album_key",
    right_table: "artists",
    right_key: "artist_key",
    role: "position",
};

pub const TRACK_ARTISTS: AssociationTable = AssociationTable {
    name: "track_artists",
    left_table: "tracks",
    left_key: "track_key",
    right_table: "artists",
    right_key: "artist_key",
    role: "position",
};

/// Entity tables in merge order: entities a table references come first.
pub const ENTITY_TABLES: &[&EntityTable] = &[&ARTISTS, &ALBUMS, &TRACKS];

/// Association tables, merged after all entity tables.
pub const ASSOCIATION_TABLES: &[&AssociationTable] = &[&ALBUM_ARTISTS, &TRACK_ARTISTS];

/// Registry of ingested batches; the staging-level idempotence key.
pub const BATCHES_TABLE: &str = "staging_batches";

/// Rejection log for rows that failed ingestion validation.
pub const REJECTIONS_TABLE: &str = "staging_rejections";

impl EntityTable {
    pub fn staging_name(&self) -> String {
        format!("staging_{}", self.name)
    }

    /// Natural key followed by the attributes, the column order used by both
    /// the staging mirror and the ingestor.
    pub fn data_fields(&self) -> Vec<&'static str> {
        let mut fields = vec![self.natural_key];
        fields.extend_from_slice(self.attributes);
        fields
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.natural_key == field || self.attributes.contains(&field)
    }

    fn target_table(&self) -> Table {
        let mut table = Table::new(self.name).column(Column::text(self.natural_key).non_null());
        for attribute in self.attributes {
            table = table.column(Column::text(*attribute));
        }
        table
            .column(Column::text("source_name"))
            .column(Column::text("ingested_at"))
            .index(format!("idx_{}_{}", self.name, self.natural_key), self.natural_key)
            .unique(&[self.natural_key])
    }

    fn staging_table(&self) -> Table {
        let staging = self.staging_name();
        let mut table = Table::new(&staging)
            .column(Column::text("batch_id").non_null())
            .column(Column::text(self.natural_key).non_null());
        for attribute in self.attributes {
            table = table.column(Column::text(*attribute));
        }
        table
            .index(format!("idx_{}_batch", staging), "batch_id")
            .index(format!("idx_{}_{}", staging, self.natural_key), self.natural_key)
    }
}

impl AssociationTable {
    pub fn staging_name(&self) -> String {
        format!("staging_{}", self.name)
    }

    pub fn data_fields(&self) -> Vec<&'static str> {
        vec![self.left_key, self.right_key, self.role]
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.left_key == field || self.right_key == field || self.role == field
    }

    pub fn left_entity(&self) -> &'static EntityTable {
        entity(self.left_table).expect("association references undeclared entity table")
    }

    pub fn right_entity(&self) -> &'static EntityTable {
        entity(self.right_table).expect("association references undeclared entity table")
    }

    fn target_table(&self) -> Table {
        Table::new(self.name)
            .column(Column::text(self.left_key).non_null())
            .column(Column::text(self.right_key).non_null())
            .column(Column::integer(self.role))
            .column(Column::text("source_name"))
            .column(Column::text("ingested_at"))
            .index(format!("idx_{}_left", self.name), self.left_key)
            .index(format!("idx_{}_right", self.name), self.right_key)
            .unique(&[self.left_key, self.right_key])
    }

    fn staging_table(&self) -> Table {
        let staging = self.staging_name();
        Table::new(&staging)
            .column(Column::text("batch_id").non_null())
            .column(Column::text(self.left_key).non_null())
            .column(Column::text(self.right_key).non_null())
            .column(Column::integer(self.role))
            .index(format!("idx_{}_batch", staging), "batch_id")
    }
}

/// A target table of either kind, resolved by name.
#[derive(Debug, Clone, Copy)]
pub enum TableKind {
    Entity(&'static EntityTable),
    Association(&'static AssociationTable),
}

impl TableKind {
    pub fn name(&self) -> &'static str {
        match self {
            TableKind::Entity(t) => t.name,
            TableKind::Association(t) => t.name,
        }
    }

    pub fn staging_name(&self) -> String {
        match self {
            TableKind::Entity(t) => t.staging_name(),
            TableKind::Association(t) => t.staging_name(),
        }
    }

    pub fn data_fields(&self) -> Vec<&'static str> {
        match self {
            TableKind::Entity(t) => t.data_fields(),
            TableKind::Association(t) => t.data_fields(),
        }
    }

    /// Fields a staged row must carry to be accepted: the natural key for an
    /// entity, both endpoint keys for an association.
    pub fn required_fields(&self) -> Vec<&'static str> {
        match self {
            TableKind::Entity(t) => vec![t.natural_key],
            TableKind::Association(t) => vec![t.left_key, t.right_key],
        }
    }

    pub fn integer_fields(&self) -> Vec<&'static str> {
        match self {
            TableKind::Entity(t) => t.integer_attributes.to_vec(),
            TableKind::Association(t) => vec![t.role],
        }
    }

    pub fn has_field(&self, field: &str) -> bool {
        match self {
            TableKind::Entity(t) => t.has_field(field),
            TableKind::Association(t) => t.has_field(field),
        }
    }
}

pub fn entity(name: &str) -> Option<&'static EntityTable> {
    ENTITY_TABLES.iter().copied().find(|t| t.name == name)
}

pub fn association(name: &str) -> Option<&'static AssociationTable> {
    ASSOCIATION_TABLES.iter().copied().find(|t| t.name == name)
}

pub fn lookup(name: &str) -> Option<TableKind> {
    if let Some(t) = entity(name) {
        return Some(TableKind::Entity(t));
    }
    association(name).map(TableKind::Association)
}

fn batches_table() -> Table {
    Table::new(BATCHES_TABLE)
        .column(Column::text("batch_id").non_null())
        .column(Column::text("dataset").non_null())
        .column(Column::text("table_name").non_null())
        .column(Column::text("source_file"))
        .column(Column::integer("accepted").non_null())
        .column(Column::integer("rejected").non_null())
        .column(Column::text("created_at").non_null())
        .column(Column::text("merged_at"))
        .unique(&["batch_id"])
}

fn rejections_table() -> Table {
    Table::new(REJECTIONS_TABLE)
        .column(Column::text("batch_id").non_null())
        .column(Column::integer("line").non_null())
        .column(Column::text("natural_key"))
        .column(Column::text("reason").non_null())
        .index("idx_staging_rejections_batch", "batch_id")
}

/// All tables the loader owns: target entities and associations, their
/// staging mirrors, and the batch/rejection registries.
pub fn schema_tables() -> Vec<Table> {
    let mut tables = Vec::new();
    for entity in ENTITY_TABLES {
        tables.push(entity.target_table());
        tables.push(entity.staging_table());
    }
    for association in ASSOCIATION_TABLES {
        tables.push(association.target_table());
        tables.push(association.staging_table());
    }
    tables.push(batches_table());
    tables.push(rejections_table());
    tables
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        for table in schema_tables() {
            table.create(&conn).unwrap();
        }
        for table in schema_tables() {
            table.validate(&conn).unwrap();
        }
    }

    #[test]
    fn test_target_natural_key_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        for table in schema_tables() {
            table.create(&conn).unwrap();
        }

        conn.execute("INSERT INTO artists (key, name) VALUES ('A1', 'Alice')", [])
            .unwrap();
        let dup = conn.execute("INSERT INTO artists (key, name) VALUES ('A1', 'Alicia')", []);
        assert!(dup.is_err());
    }

    #[test]
    fn test_staging_has_no_uniqueness() {
        let conn = Connection::open_in_memory().unwrap();
        for table in schema_tables() {
            table.create(&conn).unwrap();
        }

        // Staged candidates are not yet validated against uniqueness
        for _ in 0..2 {
            conn.execute(
                "INSERT INTO staging_artists (batch_id, key, name) VALUES ('b1', 'A1', 'Alice')",
                [],
            )
            .unwrap();
        }
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM staging_artists", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_association_pair_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        for table in schema_tables() {
            table.create(&conn).unwrap();
        }

        conn.execute(
            "INSERT INTO track_artists (track_key, artist_key, position) VALUES ('T1', 'A1', 0)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO track_artists (track_key, artist_key, position) VALUES ('T1', 'A1', 1)",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_lookup_resolves_both_kinds() {
        assert!(matches!(lookup("artists"), Some(TableKind::Entity(t)) if t.name == "artists"));
        assert!(matches!(
            lookup("album_artists"),
            Some(TableKind::Association(t)) if t.left_table == "albums"
        ));
        assert!(lookup("playlists").is_none());
    }

    #[test]
    fn test_data_field_order_starts_with_identity() {
        assert_eq!(TRACKS.data_fields()[0], "key");
        assert_eq!(
            TRACK_ARTISTS.data_fields(),
            vec!["track_key", "artist_key", "position"]
        );
    }
}
