use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

/// Raster import and region delta verification tool
#[derive(Parser)]
#[command(name = "rd5")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Maximum parsed cell tables kept in memory per region file
    /// [default: $RD5_SECTION_CACHE_SIZE or 25]
    #[arg(long, global = true)]
    section_cache_size: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert every zipped elevation grid in a directory to .bef rasters
    Import {
        /// Directory containing .zip grid archives
        input: PathBuf,

        /// Directory receiving the .bef files
        output: PathBuf,
    },

    /// Compute and verify the delta between two versions of a region file
    Diff {
        /// Older region file
        older: PathBuf,

        /// Newer region file
        newer: PathBuf,

        /// Write the verified deltas to this artifact
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Process whole-degree cells in parallel [default: $RD5_PARALLEL]
        #[arg(short, long)]
        parallel: bool,

        /// Deep-compare every decoded delta
        #[arg(long)]
        full_verify: bool,

        /// Output statistics as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Apply a delta artifact to an older region file
    Patch {
        /// Older region file
        older: PathBuf,

        /// Delta artifact produced by `rd5 diff --output`
        delta: PathBuf,

        /// Patched region file to write
        output: PathBuf,
    },

    /// Display information about a region file
    Info {
        /// Path to the .rd5 file
        region: PathBuf,

        /// Output information as JSON
        #[arg(short, long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    // Logs go to stderr, results to stdout
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rd5=info,rd5_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Import { input, output } => commands::import::run(input, output),
        Commands::Diff {
            older,
            newer,
            output,
            parallel,
            full_verify,
            json,
        } => commands::diff::run(
            cli.section_cache_size,
            older,
            newer,
            output,
            parallel,
            full_verify,
            json,
        ),
        Commands::Patch {
            older,
            delta,
            output,
        } => commands::patch::run(cli.section_cache_size, older, delta, output),
        Commands::Info { region, json } => {
            commands::info::run(cli.section_cache_size, region, json)
        }
    }
}
