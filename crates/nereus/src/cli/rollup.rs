//! `nereus rollup` command implementations.

use std::path::{Path, PathBuf};

use clap::Subcommand;
use colored::Colorize;
use nereus::rollup::{ExecutionStatus, Rollup, RollupExecution};
use nereus::{ExecutionId, RollupId, RollupInput, ScanId};

use super::Context;
use super::display::{print_field, print_list};

#[derive(Subcommand)]
pub enum RollupCommand {
    /// Create a rollup from a definition file (YAML or JSON)
    Create {
        /// Definition file
        file: PathBuf,
    },

    /// List rollups
    List,

    /// Show one rollup
    Show {
        /// Rollup id
        id: String,
    },

    /// Replace a rollup's definition
    Update {
        /// Rollup id
        id: String,

        /// Definition file
        file: PathBuf,
    },

    /// Delete a rollup and its executions
    Delete {
        /// Rollup id
        id: String,
    },

    /// Match and merge the rollup's repositories
    Run {
        /// Rollup id
        id: String,

        /// Merge these scans instead of each repository's latest scan
        #[arg(short, long = "scan")]
        scans: Vec<String>,
    },

    /// List executions of a rollup
    Executions {
        /// Rollup id
        id: String,
    },

    /// Show one execution
    Execution {
        /// Execution id
        id: String,
    },
}

/// Run a rollup subcommand.
pub fn run(ctx: &Context, command: RollupCommand) -> Result<(), nereus::Error> {
    let rollups = ctx.nereus.rollups();
    match command {
        RollupCommand::Create { file } => {
            let rollup = rollups.create(&ctx.tenant, read_input(&file)?)?;
            ctx.emit(&rollup, |r| {
                println!("{} rollup {}", "Created".green().bold(), r.id.as_str().cyan());
            })
        }
        RollupCommand::List => {
            let list = rollups.list(&ctx.tenant)?;
            ctx.emit(&list, |list| {
                println!("{} ({})", "Rollups".cyan().bold(), list.len());
                print_list(list, "(none)", |r| {
                    format!(
                        "{} {} {}",
                        r.id.as_str().cyan(),
                        r.name,
                        format!("v{}, {} repositories", r.version, r.repository_ids.len())
                            .dimmed()
                    )
                });
            })
        }
        RollupCommand::Show { id } => {
            let rollup = rollups.get(&ctx.tenant, &RollupId::from(id.as_str()))?;
            ctx.emit(&rollup, print_rollup)
        }
        RollupCommand::Update { id, file } => {
            let rollup =
                rollups.update(&ctx.tenant, &RollupId::from(id.as_str()), read_input(&file)?)?;
            ctx.emit(&rollup, |r| {
                println!(
                    "{} rollup {} to version {}",
                    "Updated".green().bold(),
                    r.id.as_str().cyan(),
                    r.version
                );
            })
        }
        RollupCommand::Delete { id } => {
            rollups.delete(&ctx.tenant, &RollupId::from(id.as_str()))?;
            ctx.emit(&serde_json::json!({ "deleted": id }), |_| {
                println!("{} rollup {}", "Deleted".green().bold(), id.cyan());
            })
        }
        RollupCommand::Run { id, scans } => {
            let scan_ids: Vec<ScanId> = scans.iter().map(|s| ScanId::from(s.as_str())).collect();
            let execution = rollups.execute(
                &ctx.tenant,
                &RollupId::from(id.as_str()),
                (!scan_ids.is_empty()).then_some(scan_ids.as_slice()),
            )?;
            ctx.emit(&execution, print_execution)
        }
        RollupCommand::Executions { id } => {
            let executions = rollups.list_executions(&ctx.tenant, &RollupId::from(id.as_str()))?;
            ctx.emit(&executions, |list| {
                println!("{} ({})", "Executions".cyan().bold(), list.len());
                print_list(list, "(none)", |e| {
                    format!(
                        "{} {} {}",
                        e.execution_id.as_str().cyan(),
                        status_label(e.status),
                        e.started_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
                    )
                });
            })
        }
        RollupCommand::Execution { id } => {
            let execution = rollups.get_execution(&ctx.tenant, &ExecutionId::from(id.as_str()))?;
            ctx.emit(&execution, print_execution)
        }
    }
}

/// Parse a rollup definition. YAML is a superset of JSON, so one parser
/// reads both.
fn read_input(path: &Path) -> Result<RollupInput, nereus::Error> {
    let content = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&content).map_err(|e| {
        nereus::Error::Config(format!("invalid rollup definition {}: {e}", path.display()))
    })
}

fn status_label(status: ExecutionStatus) -> colored::ColoredString {
    match status {
        ExecutionStatus::Running => "running".yellow(),
        ExecutionStatus::Completed => "completed".green(),
        ExecutionStatus::Failed => "failed".red(),
    }
}

fn print_rollup(rollup: &Rollup) {
    println!("{} {}", rollup.name.cyan().bold(), rollup.id.as_str().dimmed());
    if let Some(description) = &rollup.description {
        println!("  {description}");
    }
    println!();
    print_field("Version", rollup.version);
    print_field("Updated", rollup.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  {}:", "Repositories".white().bold());
    print_list(&rollup.repository_ids, "(none)", |r| r.to_string());
    println!("  {}:", "Matchers".white().bold());
    print_list(&rollup.matchers, "(none)", |m| {
        format!(
            "{} {}",
            m.matcher_type().as_str(),
            format!("priority {}, confidence {}", m.priority, m.confidence).dimmed()
        )
    });
}

fn print_execution(execution: &RollupExecution) {
    println!(
        "Execution {} {}",
        execution.execution_id.as_str().cyan().bold(),
        status_label(execution.status)
    );
    println!();
    print_field("Rollup", &execution.rollup_id);
    print_field(
        "Scans",
        execution
            .scan_ids
            .iter()
            .map(ScanId::as_str)
            .collect::<Vec<_>>()
            .join(", "),
    );
    print_field("Matches", execution.match_count);
    if let Some(output) = &execution.output {
        let stats = &output.statistics;
        print_field(
            "Nodes",
            format!("{} → {}", stats.nodes_before_merge, stats.nodes_after_merge),
        );
        print_field(
            "Edges",
            format!("{} → {}", stats.edges_before_merge, stats.edges_after_merge),
        );
        print_field("Cross-repo edges", stats.cross_repo_edges);
        print_field(
            "Conflicts",
            format!("{} ({} resolved)", stats.conflicts, stats.conflicts_resolved),
        );
        for warning in &output.warnings {
            println!("  {}: {warning}", "warning".yellow());
        }
    }
    if let Some(error) = &execution.error {
        print_field("Error", format!("{} {}", error.code.red(), error.message));
    }
}
