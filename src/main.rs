use anyhow::{bail, Context, Result};
use catalog_loader::config::{ConflictPolicy, DatasetConfig};
use catalog_loader::merge::MergePolicies;
use catalog_loader::store::CatalogDb;
use catalog_loader::{analyze, ingest, merge};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[clap(version)]
struct CliArgs {
    /// Path to the SQLite catalog database file.
    #[clap(long, value_parser = parse_path)]
    pub db: PathBuf,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create (or validate) the catalog schema and exit.
    Init,

    /// Stage one or more CSV files of a dataset.
    Load {
        /// Path to the dataset descriptor (TOML).
        #[clap(long, value_parser = parse_path)]
        config: PathBuf,

        /// Stage only this table. Defaults to every table in the descriptor
        /// that declares a file.
        #[clap(long)]
        table: Option<String>,

        /// CSV file to stage, overriding the descriptor's file. Requires
        /// --table.
        #[clap(long, value_parser = parse_path)]
        file: Option<PathBuf>,

        /// Batch id; re-using one replaces the prior batch. Defaults to a
        /// timestamped id per table.
        #[clap(long)]
        batch_id: Option<String>,
    },

    /// Dry run: print the diff report a merge of these batches would apply.
    Analyze {
        /// Batch ids to analyze together.
        #[clap(long = "batch", required = true)]
        batch_ids: Vec<String>,
    },

    /// Merge staged batches into the target tables.
    Merge {
        /// Batch ids to merge together.
        #[clap(long = "batch", required = true)]
        batch_ids: Vec<String>,

        /// Dataset descriptor supplying per-table conflict policies.
        #[clap(long, value_parser = parse_path)]
        config: Option<PathBuf>,

        /// Uniform conflict policy, overriding the descriptor.
        #[clap(long, value_enum)]
        policy: Option<ConflictPolicy>,
    },
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .ok();

    info!(
        "catalog-loader {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    let mut db = CatalogDb::open(&cli_args.db)?;

    match cli_args.command {
        Command::Init => {
            info!("Catalog schema ready at {:?}", cli_args.db);
        }
        Command::Load {
            config,
            table,
            file,
            batch_id,
        } => {
            let dataset = DatasetConfig::from_path(&config)?;
            let mut reports = Vec::new();
            match table {
                Some(table) => {
                    let csv_path = match file {
                        Some(path) => path,
                        None => dataset
                            .mapping(&table)?
                            .file
                            .clone()
                            .with_context(|| {
                                format!("no CSV file configured for table '{}'; pass --file", table)
                            })?,
                    };
                    reports.push(ingest::ingest_file(
                        &mut db, &dataset, &table, &csv_path, batch_id,
                    )?);
                }
                None => {
                    if file.is_some() {
                        bail!("--file requires --table");
                    }
                    if batch_id.is_some() {
                        bail!("--batch-id requires --table");
                    }
                    for (table, mapping) in &dataset.tables {
                        let Some(csv_path) = mapping.file.clone() else {
                            continue;
                        };
                        reports.push(ingest::ingest_file(
                            &mut db, &dataset, table, &csv_path, None,
                        )?);
                    }
                    if reports.is_empty() {
                        bail!(
                            "dataset '{}' declares no CSV files; pass --table and --file",
                            dataset.name
                        );
                    }
                }
            }
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        Command::Analyze { batch_ids } => {
            let report = analyze::analyze(&db, &batch_ids)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Merge {
            batch_ids,
            config,
            policy,
        } => {
            let policies = match (policy, config) {
                (Some(policy), _) => MergePolicies::uniform(policy),
                (None, Some(path)) => MergePolicies::from_config(&DatasetConfig::from_path(&path)?),
                (None, None) => MergePolicies::uniform(ConflictPolicy::default()),
            };
            let outcome = merge::merge(&mut db, &policies, &batch_ids)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }
    Ok(())
}
