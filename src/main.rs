//! # attack-mapper CLI (`r2a`)
//!
//! The `r2a` binary maps threat intelligence reports to MITRE ATT&CK
//! techniques. It provides commands for database initialization, catalog
//! download, catalog embedding, retrieval debugging, and the full document
//! mapping pipeline.
//!
//! ## Usage
//!
//! ```bash
//! r2a --config ./config/r2a.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `r2a init` | Create the SQLite database and run schema migrations |
//! | `r2a catalog sync` | Download the ATT&CK STIX bundle into the catalog |
//! | `r2a catalog info` | Show catalog and index status |
//! | `r2a index build` | Embed missing or stale catalog techniques |
//! | `r2a index rebuild` | Delete and regenerate all technique vectors |
//! | `r2a search "<query>"` | Show ranked candidate techniques for a query |
//! | `r2a map <input>` | Map a report (file or URL) to techniques |
//!
//! ## Examples
//!
//! ```bash
//! # One-time setup
//! r2a init --config ./config/r2a.toml
//! r2a catalog sync --config ./config/r2a.toml
//! r2a index build --config ./config/r2a.toml
//!
//! # Map a local PDF, writing JSON and Markdown
//! r2a map report.pdf --formats json,markdown --output-dir ./results
//!
//! # Map a web page with a stricter confidence cutoff
//! r2a map https://example.com/threat-report.html --min-confidence 0.7
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use attack_mapper::{catalog, config, index_cmd, map_cmd, migrate, progress, search_cmd};

/// attack-mapper CLI — automated threat report to MITRE ATT&CK mapping.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/r2a.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "r2a",
    about = "attack-mapper — map threat intelligence reports to MITRE ATT&CK techniques",
    version,
    long_about = "attack-mapper chunks a threat report, retrieves semantically relevant ATT&CK \
    techniques per chunk from an embedded catalog, extracts structured technique mappings with \
    confidence and evidence via an LLM, and aggregates them into one validated, \
    confidence-ranked result set."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/r2a.toml`. Database, catalog, chunking,
    /// retrieval, and provider settings are read from this file.
    #[arg(long, global = true, default_value = "./config/r2a.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (techniques, technique_vectors, catalog_meta). Idempotent —
    /// running it multiple times is safe.
    Init,

    /// Manage the ATT&CK technique catalog.
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },

    /// Manage the embedded technique index.
    ///
    /// Requires an embedding provider (e.g. OpenAI) to be configured.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Show ranked candidate techniques for a free-text query.
    ///
    /// Exercises retrieval standalone: embeds the query and prints the
    /// nearest techniques with similarity scores.
    Search {
        /// The query text.
        query: String,

        /// Maximum number of candidates to return.
        #[arg(long)]
        top_k: Option<usize>,

        /// Restrict to techniques within these tactics (repeatable).
        #[arg(long = "tactic")]
        tactics: Vec<String>,
    },

    /// Map a threat report to ATT&CK techniques.
    ///
    /// INPUT can be a local text or PDF file, or an http(s) URL (web page
    /// or PDF). Results are written to the output directory in the
    /// requested formats.
    Map {
        /// Input source: file path or URL.
        input: String,

        /// Output directory for result files.
        #[arg(long, short = 'o')]
        output_dir: Option<PathBuf>,

        /// Output formats: json, csv, markdown, navigator. Repeatable or
        /// comma-separated (`-f json,csv`).
        #[arg(long = "formats", short = 'f')]
        formats: Vec<String>,

        /// Minimum merged confidence for the final output (0.0-1.0).
        #[arg(long)]
        min_confidence: Option<f64>,

        /// Number of techniques to retrieve per chunk.
        #[arg(long)]
        top_k: Option<usize>,

        /// Restrict mapping to techniques within these tactics (repeatable).
        #[arg(long = "tactic")]
        tactics: Vec<String>,

        /// Progress reporting on stderr: auto, off, human, or json.
        #[arg(long, default_value = "auto")]
        progress: String,
    },
}

/// Catalog management subcommands.
#[derive(Subcommand)]
enum CatalogAction {
    /// Download the ATT&CK STIX bundle and populate the techniques table.
    ///
    /// Skips the download when the catalog is already populated unless
    /// `--force` is given.
    Sync {
        /// Re-download and replace the catalog even if already populated.
        #[arg(long)]
        force: bool,
    },
    /// Show catalog status: technique count, framework version, vectors.
    Info,
}

/// Index management subcommands.
#[derive(Subcommand)]
enum IndexAction {
    /// Embed techniques that are missing or have stale vectors.
    Build {
        /// Maximum number of techniques to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Override the batch size from config (texts per API call).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show counts without performing any embedding.
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete and regenerate all technique vectors.
    ///
    /// Useful when switching embedding models or dimensions.
    Rebuild {
        /// Override the batch size from config (texts per API call).
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

fn parse_progress_mode(raw: &str) -> anyhow::Result<progress::ProgressMode> {
    match raw {
        "auto" => Ok(progress::ProgressMode::default_for_tty()),
        "off" => Ok(progress::ProgressMode::Off),
        "human" => Ok(progress::ProgressMode::Human),
        "json" => Ok(progress::ProgressMode::Json),
        other => anyhow::bail!(
            "Unknown progress mode: '{}'. Use auto, off, human, or json.",
            other
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Catalog { action } => match action {
            CatalogAction::Sync { force } => {
                catalog::run_catalog_sync(&cfg, force).await?;
            }
            CatalogAction::Info => {
                catalog::run_catalog_info(&cfg).await?;
            }
        },
        Commands::Index { action } => match action {
            IndexAction::Build {
                limit,
                batch_size,
                dry_run,
            } => {
                index_cmd::run_index_build(&cfg, limit, batch_size, dry_run).await?;
            }
            IndexAction::Rebuild { batch_size } => {
                index_cmd::run_index_rebuild(&cfg, batch_size).await?;
            }
        },
        Commands::Search {
            query,
            top_k,
            tactics,
        } => {
            search_cmd::run_search(&cfg, &query, top_k, tactics).await?;
        }
        Commands::Map {
            input,
            output_dir,
            formats,
            min_confidence,
            top_k,
            tactics,
            progress,
        } => {
            let options = map_cmd::MapOptions {
                output_dir,
                formats,
                min_confidence,
                top_k,
                tactics,
                progress: parse_progress_mode(&progress)?,
            };
            map_cmd::run_map(&cfg, &input, options).await?;
        }
    }

    Ok(())
}
