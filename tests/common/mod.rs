//! Shared fixtures for the end-to-end pipeline tests.

use catalog_loader::config::DatasetConfig;
use catalog_loader::store::CatalogDb;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// A scratch catalog database plus a place to drop CSV fixtures.
pub struct TestPipeline {
    pub db: CatalogDb,
    dir: TempDir,
}

pub const MPD_DATASET: &str = r#"
name = "mpd"

[tables.artists]
policy = "keep-existing"
[tables.artists.columns]
artist_uri = "key"
artist_name = "name"
[tables.artists.transforms]
artist_name = "trim"

[tables.albums]
policy = "keep-existing"
[tables.albums.columns]
album_uri = "key"
album_name = "name"

[tables.tracks]
policy = "keep-existing"
[tables.tracks.columns]
track_uri = "key"
track_name = "name"
duration_ms = "duration_ms"
album_uri = "album_key"

[tables.track_artists]
[tables.track_artists.columns]
track_uri = "track_key"
artist_uri = "artist_key"
pos = "position"
"#;

impl TestPipeline {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = CatalogDb::open(dir.path().join("catalog.db")).unwrap();
        TestPipeline { db, dir }
    }

    pub fn mpd_config(&self) -> DatasetConfig {
        DatasetConfig::from_toml_str(MPD_DATASET).unwrap()
    }

    pub fn write_csv(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    pub fn count(&self, table: &str) -> i64 {
        self.db.target_count(table).unwrap()
    }

    pub fn artist_name(&self, key: &str) -> Option<String> {
        self.db
            .conn()
            .query_row(
                "SELECT name FROM artists WHERE key = ?1",
                rusqlite::params![key],
                |r| r.get(0),
            )
            .unwrap()
    }
}
