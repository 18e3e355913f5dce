//! DuplexDB CLI
//!
//! Command-line tools for DuplexDB controllers.
//!
//! # Commands
//!
//! - `hooks` - List the fault-injection checkpoints and their codes
//! - `intent` - Show or clear a commit intent file
//! - `simulate` - Run a transaction on a simulated controller pair

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// DuplexDB command-line tools.
#[derive(Parser)]
#[command(name = "duplexdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the fault-injection checkpoints
    Hooks {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show a commit intent file
    Intent {
        /// Path to the intent file
        path: PathBuf,

        /// Remove the file after showing it
        #[arg(long)]
        clear: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run a transaction on a simulated controller pair
    Simulate {
        /// Objects to create in the transaction
        #[arg(short, long, default_value = "4")]
        objects: u32,

        /// Crash the active controller at this checkpoint (name or code)
        #[arg(short, long)]
        crash_at: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
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

    match cli.command {
        Commands::Hooks { format } => commands::hooks::run(&format)?,
        Commands::Intent {
            path,
            clear,
            format,
        } => commands::intent::run(&path, clear, &format)?,
        Commands::Simulate {
            objects,
            crash_at,
            format,
        } => {
            let crash_at = crash_at
                .as_deref()
                .map(commands::hooks::parse)
                .transpose()?;
            commands::simulate::run(objects, crash_at, &format)?;
        }
        Commands::Version => {
            println!("DuplexDB CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
