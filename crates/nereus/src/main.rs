//! Nereus CLI - cross-repository infrastructure graphs from the command line.
//!
//! Imports scanner exports into a local database, then diffs scans, merges
//! repositories into rollups, computes blast radius and queries the external
//! object index.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

mod cli;

/// Nereus: cross-repository infrastructure graph engine.
#[derive(Parser)]
#[command(name = "nereus")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory holding the database and config.yaml
    #[arg(short, long, global = true, default_value = ".nereus")]
    data_dir: PathBuf,

    /// Tenant every command runs as
    #[arg(short, long, global = true, default_value = "default")]
    tenant: String,

    /// Configuration file (defaults to <data-dir>/config.yaml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a scanner export (JSON) as a scan
    Import {
        /// Export file
        file: PathBuf,

        /// Index the scan's external references after importing
        #[arg(long)]
        index: bool,
    },

    /// Diff two scans
    Diff {
        /// Base scan id
        base: String,

        /// Compare scan id
        compare: String,

        /// Require both scans to belong to this repository
        #[arg(short, long)]
        repository: Option<String>,

        /// Ignore cached results
        #[arg(short, long)]
        force: bool,

        /// List unchanged nodes and edges too
        #[arg(long)]
        include_unchanged: bool,

        /// Only diff nodes of these types
        #[arg(long = "node-type")]
        node_types: Vec<String>,
    },

    /// Estimate the cost of diffing two scans
    Cost {
        /// Base scan id
        base: String,

        /// Compare scan id
        compare: String,
    },

    /// Show what a change to a node impacts
    Blast {
        /// Node id (a source node id is accepted for rollup executions)
        node: String,

        /// Scan containing the node
        #[arg(short, long, required_unless_present = "execution")]
        scan: Option<String>,

        /// Rollup execution whose merged graph is traversed
        #[arg(short, long, conflicts_with = "scan")]
        execution: Option<String>,

        /// Maximum traversal depth
        #[arg(long)]
        depth: Option<u32>,

        /// Only report these tools (terraform, helm, kubernetes, ci, argocd)
        #[arg(long = "tool")]
        tools: Vec<String>,

        /// Neither report nor traverse CI nodes
        #[arg(long)]
        exclude_ci: bool,

        /// Ignore edges below this confidence (0-100)
        #[arg(long, default_value = "0")]
        min_confidence: u8,
    },

    /// Manage and run rollups
    Rollup {
        #[command(subcommand)]
        command: cli::rollup::RollupCommand,
    },

    /// Build and query the external object index
    Index {
        #[command(subcommand)]
        command: cli::index::IndexCommand,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = cli::Context::open(&cli.data_dir, cli.config.as_deref(), &cli.tenant, cli.json)
        .and_then(|ctx| match cli.command {
            Commands::Import { file, index } => cli::import::run(&ctx, &file, index),
            Commands::Diff {
                base,
                compare,
                repository,
                force,
                include_unchanged,
                node_types,
            } => cli::diff::run(
                &ctx,
                &cli::diff::DiffArgs {
                    base,
                    compare,
                    repository,
                    force,
                    include_unchanged,
                    node_types,
                },
            ),
            Commands::Cost { base, compare } => cli::diff::cost(&ctx, &base, &compare),
            Commands::Blast {
                node,
                scan,
                execution,
                depth,
                tools,
                exclude_ci,
                min_confidence,
            } => cli::blast::run(
                &ctx,
                &cli::blast::BlastArgs {
                    node,
                    scan,
                    execution,
                    depth,
                    tools,
                    exclude_ci,
                    min_confidence,
                },
            ),
            Commands::Rollup { command } => cli::rollup::run(&ctx, command),
            Commands::Index { command } => cli::index::run(&ctx, command),
        });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {e}", "error".red().bold());
            // Show cause chain for nested errors
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                eprintln!("  {}: {cause}", "caused by".dimmed());
                source = std::error::Error::source(cause);
            }
            ExitCode::FAILURE
        }
    }
}
