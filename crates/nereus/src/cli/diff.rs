//! `nereus diff` and `nereus cost` command implementations.

use colored::Colorize;
use nereus::diff::{ChangeType, CostEstimate, NodeDiff};
use nereus::{DiffOutcome, DiffRequest, DiffResult, ScanId};

use super::Context;
use super::display::{percent, print_field, print_list};

/// Arguments of the diff command.
pub struct DiffArgs {
    pub base: String,
    pub compare: String,
    pub repository: Option<String>,
    pub force: bool,
    pub include_unchanged: bool,
    pub node_types: Vec<String>,
}

/// Run the diff command.
pub fn run(ctx: &Context, args: &DiffArgs) -> Result<(), nereus::Error> {
    let mut options = ctx.nereus.diffs().engine().default_options();
    options.include_unchanged = args.include_unchanged;
    if !args.node_types.is_empty() {
        options.include_node_types = Some(args.node_types.clone());
    }

    let mut request =
        DiffRequest::new(args.base.as_str(), args.compare.as_str()).with_options(options);
    if let Some(repository) = &args.repository {
        request = request.with_repository(repository.as_str());
    }
    if args.force {
        request = request.force_recompute();
    }

    let outcome = ctx.nereus.diffs().diff(&ctx.tenant, &request)?;
    ctx.emit(&outcome, |outcome| match outcome {
        DiffOutcome::Completed {
            result, from_cache, ..
        } => print_diff(result, *from_cache),
        DiffOutcome::Pending { diff_id, .. } => {
            println!("Diff {} is being computed", diff_id.cyan());
        }
    })
}

fn print_diff(result: &DiffResult, from_cache: bool) {
    println!(
        "Diff {} → {}{}",
        result.base_snapshot_id.as_str().cyan().bold(),
        result.target_snapshot_id.as_str().cyan().bold(),
        if from_cache {
            " (cached)".dimmed().to_string()
        } else {
            String::new()
        }
    );
    println!();

    let summary = &result.summary;
    println!(
        "  {}: {} added, {} removed, {} modified",
        "Nodes".white().bold(),
        summary.nodes.added.to_string().green(),
        summary.nodes.removed.to_string().red(),
        summary.nodes.modified.to_string().yellow()
    );
    println!(
        "  {}: {} added, {} removed, {} modified",
        "Edges".white().bold(),
        summary.edges.added.to_string().green(),
        summary.edges.removed.to_string().red(),
        summary.edges.modified.to_string().yellow()
    );
    print_field("Change ratio", percent(summary.overall_change_ratio));
    if summary.is_significant_change {
        println!("  {}", "Significant change".yellow().bold());
    }
    println!();

    let changed: Vec<&NodeDiff> = result
        .node_diffs
        .iter()
        .filter(|d| d.change_type != ChangeType::Unchanged)
        .collect();
    println!("  {} ({}):", "Changed nodes".white().bold(), changed.len());
    print_list(&changed, "(none)", |d| {
        let marker = match d.change_type {
            ChangeType::Added => "+".green(),
            ChangeType::Removed => "-".red(),
            ChangeType::Modified => "~".yellow(),
            ChangeType::Unchanged => " ".normal(),
        };
        let attributes = d.attribute_changes.as_ref().map_or(0, Vec::len);
        if attributes > 0 {
            format!("{marker} {} ({attributes} attributes)", d.identity.key)
        } else {
            format!("{marker} {}", d.identity.key)
        }
    });

    for warning in &result.warnings {
        println!("  {}: {warning}", "warning".yellow());
    }
}

/// Run the cost command.
pub fn cost(ctx: &Context, base: &str, compare: &str) -> Result<(), nereus::Error> {
    let estimate = ctx.nereus.diffs().estimate_cost(
        &ctx.tenant,
        &ScanId::from(base),
        &ScanId::from(compare),
        None,
    )?;
    ctx.emit(&estimate, print_cost)
}

#[allow(clippy::cast_precision_loss)]
fn print_cost(estimate: &CostEstimate) {
    println!("{}", "Diff cost estimate".cyan().bold());
    println!();
    print_field("Nodes", estimate.total_nodes);
    print_field("Edges", estimate.total_edges);
    print_field("Time", format!("~{} ms", estimate.estimated_time_ms));
    print_field(
        "Memory",
        format!("~{:.1} MB", estimate.estimated_memory_bytes as f64 / 1_048_576.0),
    );
    if estimate.within_limits {
        print_field("Limits", "ok".green());
    } else {
        print_field("Limits", "exceeded".red().bold());
    }
    for warning in &estimate.warnings {
        println!("  {}: {warning}", "warning".yellow());
    }
}
