pub mod analyze;
pub mod config;
pub mod error;
pub mod ingest;
pub mod merge;
pub mod schema;
pub mod sqlite_persistence;
pub mod store;

pub use analyze::{analyze, DiffReport};
pub use config::{ConflictPolicy, DatasetConfig};
pub use error::LoaderError;
pub use ingest::{ingest_file, IngestReport};
pub use merge::{merge, MergeOutcome, MergePolicies};
pub use store::CatalogDb;
