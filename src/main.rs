//! # Attendance Harness CLI (`attend`)
//!
//! ## Usage
//!
//! ```bash
//! attend --config ./config/attend.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `attend init` | Create the SQLite database and schema |
//! | `attend serve` | Start the HTTP API |
//! | `attend stats` | Print people, punch, and index counts |
//! | `attend index rebuild` | Build the similarity index and print its stats |
//! | `attend people list` | List registered people |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use attendance_harness::{config, logging, migrate, server, stats};

/// Attendance Harness: face-verified attendance with background sync.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/attend.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "attend",
    about = "Attendance Harness: face-verified attendance with background sync",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/attend.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the `people` and `attendance`
    /// tables. Safe to run more than once.
    Init,

    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind`, builds the similarity index, and runs
    /// until Ctrl-C, then waits for background tasks to finish.
    Serve,

    /// Show database and index statistics.
    Stats,

    /// Similarity index maintenance.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Inspect registered people.
    People {
        #[command(subcommand)]
        action: PeopleAction,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Build the index from stored embeddings and print its stats.
    Rebuild,
}

#[derive(Subcommand)]
enum PeopleAction {
    /// List people, most recently updated first.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Index { action } => match action {
            IndexAction::Rebuild => {
                stats::run_index_rebuild(&cfg).await?;
            }
        },
        Commands::People { action } => match action {
            PeopleAction::List => {
                stats::run_people_list(&cfg).await?;
            }
        },
    }

    Ok(())
}
