//! Dataset loader configuration.
//!
//! Each dataset ships a TOML descriptor naming its CSV files, the CSV
//! column to target field mapping per table, optional value transforms, and
//! the conflict-resolution policy the merge engine should apply. All of it
//! is validated up front, before any I/O touches the staging tables.

use crate::error::LoaderError;
use crate::schema;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// How the merge engine resolves a row whose non-key attributes differ from
/// the existing target row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Leave the target row untouched.
    KeepExisting,
    /// Overwrite the conflicting attributes with the staged values.
    PreferStaged,
    /// Refuse to resolve automatically; the merge batch aborts.
    #[default]
    Manual,
}

/// Value normalization applied to a CSV column before staging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transform {
    Trim,
    Lowercase,
    TrimLowercase,
}

impl Transform {
    pub fn apply(&self, value: &str) -> String {
        match self {
            Transform::Trim => value.trim().to_string(),
            Transform::Lowercase => value.to_lowercase(),
            Transform::TrimLowercase => value.trim().to_lowercase(),
        }
    }
}

/// Per-table mapping from CSV columns to target fields.
#[derive(Debug, Clone, Deserialize)]
pub struct TableMapping {
    /// Default CSV file for this table, overridable on the command line.
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub policy: ConflictPolicy,
    /// `csv_column = target_field`
    pub columns: BTreeMap<String, String>,
    /// `csv_column = transform`
    #[serde(default)]
    pub transforms: BTreeMap<String, Transform>,
}

/// A dataset descriptor: name plus one mapping per staged table.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    pub tables: BTreeMap<String, TableMapping>,
}

impl DatasetConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, LoaderError> {
        let config: DatasetConfig = toml::from_str(raw)
            .map_err(|e| LoaderError::config(format!("invalid dataset config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, LoaderError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Check the descriptor against the schema model. Fails with a
    /// configuration error before any file or database is opened.
    pub fn validate(&self) -> Result<(), LoaderError> {
        if self.name.trim().is_empty() {
            return Err(LoaderError::config("dataset name must not be empty"));
        }
        if self.tables.is_empty() {
            return Err(LoaderError::config(format!(
                "dataset '{}' maps no tables",
                self.name
            )));
        }
        for (table_name, mapping) in &self.tables {
            let table = schema::lookup(table_name)
                .ok_or_else(|| LoaderError::config(format!("unknown table '{}'", table_name)))?;

            let mut mapped_fields = BTreeSet::new();
            for (csv_column, target_field) in &mapping.columns {
                if !table.has_field(target_field) {
                    return Err(LoaderError::config(format!(
                        "table '{}' has no field '{}' (mapped from CSV column '{}')",
                        table_name, target_field, csv_column
                    )));
                }
                if !mapped_fields.insert(target_field.as_str()) {
                    return Err(LoaderError::config(format!(
                        "table '{}': field '{}' is mapped from more than one CSV column",
                        table_name, target_field
                    )));
                }
            }
            for required in table.required_fields() {
                if !mapped_fields.contains(required) {
                    return Err(LoaderError::config(format!(
                        "table '{}': required key field '{}' is not mapped",
                        table_name, required
                    )));
                }
            }
            for csv_column in mapping.transforms.keys() {
                if !mapping.columns.contains_key(csv_column) {
                    return Err(LoaderError::config(format!(
                        "table '{}': transform references unmapped CSV column '{}'",
                        table_name, csv_column
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn mapping(&self, table_name: &str) -> Result<&TableMapping, LoaderError> {
        self.tables.get(table_name).ok_or_else(|| {
            LoaderError::config(format!(
                "dataset '{}' has no mapping for table '{}'",
                self.name, table_name
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MPD_CONFIG: &str = r#"
name = "mpd"

[tables.artists]
file = "csvs/mpd/artists.csv"
policy = "prefer-staged"

[tables.artists.columns]
uri = "key"
artist_name = "name"

[tables.artists.transforms]
artist_name = "trim"
"#;

    #[test]
    fn test_parse_valid_config() {
        let config = DatasetConfig::from_toml_str(MPD_CONFIG).unwrap();
        assert_eq!(config.name, "mpd");
        let mapping = config.mapping("artists").unwrap();
        assert_eq!(mapping.policy, ConflictPolicy::PreferStaged);
        assert_eq!(mapping.columns.get("uri").unwrap(), "key");
        assert_eq!(mapping.transforms.get("artist_name"), Some(&Transform::Trim));
    }

    #[test]
    fn test_policy_defaults_to_manual() {
        let config = DatasetConfig::from_toml_str(
            r#"
name = "x"
[tables.artists]
[tables.artists.columns]
uri = "key"
"#,
        )
        .unwrap();
        assert_eq!(
            config.mapping("artists").unwrap().policy,
            ConflictPolicy::Manual
        );
    }

    #[test]
    fn test_rejects_unknown_table() {
        let err = DatasetConfig::from_toml_str(
            r#"
name = "x"
[tables.playlists]
[tables.playlists.columns]
uri = "key"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, LoaderError::Configuration { .. }));
        assert!(err.to_string().contains("unknown table"));
    }

    #[test]
    fn test_rejects_unknown_field() {
        let err = DatasetConfig::from_toml_str(
            r#"
name = "x"
[tables.artists]
[tables.artists.columns]
uri = "key"
followers = "followers_total"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no field 'followers_total'"));
    }

    #[test]
    fn test_rejects_unmapped_natural_key() {
        let err = DatasetConfig::from_toml_str(
            r#"
name = "x"
[tables.artists]
[tables.artists.columns]
artist_name = "name"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("required key field 'key'"));
    }

    #[test]
    fn test_association_requires_both_endpoint_keys() {
        let err = DatasetConfig::from_toml_str(
            r#"
name = "x"
[tables.track_artists]
[tables.track_artists.columns]
track = "track_key"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("artist_key"));
    }

    #[test]
    fn test_rejects_duplicate_target_field() {
        let err = DatasetConfig::from_toml_str(
            r#"
name = "x"
[tables.artists]
[tables.artists.columns]
uri = "key"
spotify_uri = "key"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than one CSV column"));
    }

    #[test]
    fn test_rejects_transform_on_unmapped_column() {
        let err = DatasetConfig::from_toml_str(
            r#"
name = "x"
[tables.artists]
[tables.artists.columns]
uri = "key"
[tables.artists.transforms]
artist_name = "trim"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unmapped CSV column"));
    }

    #[test]
    fn test_transform_apply() {
        assert_eq!(Transform::Trim.apply("  Alice "), "Alice");
        assert_eq!(Transform::Lowercase.apply("ALICE"), "alice");
        assert_eq!(Transform::TrimLowercase.apply(" ALICE "), "alice");
    }
}
