//! ShelfDB CLI
//!
//! Command-line tools for ShelfDB database management.
//!
//! # Commands
//!
//! - `inspect` - Display scopes, collections and storage statistics
//! - `maintain` - Run a maintenance pass (compact, reindex, ...)
//! - `purge-expired` - Purge documents whose expiration has passed
//! - `copy` - Copy a closed database under a new name
//! - `delete` - Delete a closed database
//! - `exists` - Report whether a database exists

mod commands;

use clap::{Parser, Subcommand};
use shelfdb_core::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// ShelfDB command-line database tools.
#[derive(Parser)]
#[command(name = "shelfdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding `<name>.shelfdb` databases
    #[arg(global = true, short, long, default_value = ".")]
    dir: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display scopes, collections and storage statistics
    Inspect {
        /// Database name
        name: String,

        /// Scan every record instead of using the in-memory index
        #[arg(short, long)]
        full: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run a maintenance pass
    Maintain {
        /// Database name
        name: String,

        /// compact, reindex, integrity-check, optimize or full-optimize
        #[arg(short = 't', long = "type", default_value = "integrity-check")]
        kind: String,
    },

    /// Purge documents whose expiration has passed
    PurgeExpired {
        /// Database name
        name: String,
    },

    /// Copy a closed database under a new name
    Copy {
        /// Path of the source `.shelfdb` directory
        from: PathBuf,

        /// Name of the copy, created under `--dir`
        name: String,
    },

    /// Delete a closed database
    Delete {
        /// Database name
        name: String,
    },

    /// Report whether a database exists
    Exists {
        /// Database name
        name: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::new()
        .directory(&cli.dir)
        .create_if_missing(false);

    match cli.command {
        Commands::Inspect { name, full, format } => {
            commands::inspect::run(&name, config, full, &format)?;
        }
        Commands::Maintain { name, kind } => {
            commands::maintain::run(&name, config, &kind)?;
        }
        Commands::PurgeExpired { name } => {
            commands::maintain::purge_expired(&name, config)?;
        }
        Commands::Copy { from, name } => {
            commands::files::copy(&from, &name, &config)?;
        }
        Commands::Delete { name } => {
            commands::files::delete(&name, &cli.dir)?;
        }
        Commands::Exists { name } => {
            commands::files::exists(&name, &cli.dir);
        }
        Commands::Version => {
            println!("ShelfDB CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("ShelfDB Core v{}", shelfdb_core::VERSION);
        }
    }

    Ok(())
}
