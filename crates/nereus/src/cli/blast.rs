//! `nereus blast` command implementation.

use colored::Colorize;
use nereus::blast::ImpactedNode;
use nereus::{BlastRadius, BlastRadiusOptions, ExecutionId, NodeId, ScanId, Tool};

use super::Context;
use super::display::{print_field, print_list};

/// Arguments of the blast command.
pub struct BlastArgs {
    pub node: String,
    pub scan: Option<String>,
    pub execution: Option<String>,
    pub depth: Option<u32>,
    pub tools: Vec<String>,
    pub exclude_ci: bool,
    pub min_confidence: u8,
}

/// Run the blast command.
pub fn run(ctx: &Context, args: &BlastArgs) -> Result<(), nereus::Error> {
    let mut options = BlastRadiusOptions::from_config(&ctx.nereus.config().blast_radius);
    if let Some(depth) = args.depth {
        options.max_depth = depth;
    }
    if !args.tools.is_empty() {
        options.tool_filter = Some(
            args.tools
                .iter()
                .map(|t| t.parse::<Tool>())
                .collect::<Result<Vec<_>, _>>()?,
        );
    }
    options.include_ci = !args.exclude_ci;
    options.min_confidence = args.min_confidence;

    let source = NodeId::from(args.node.as_str());
    let radius = match (&args.execution, &args.scan) {
        (Some(execution), _) => ctx.nereus.rollups().blast_radius(
            &ctx.tenant,
            &ExecutionId::from(execution.as_str()),
            &source,
            &options,
        )?,
        (None, Some(scan)) => ctx.nereus.blast_radius(
            &ctx.tenant,
            &ScanId::from(scan.as_str()),
            &source,
            &options,
        )?,
        (None, None) => {
            return Err(nereus::Error::Config(
                "either --scan or --execution is required".to_string(),
            ));
        }
    };

    ctx.emit(&radius, print_radius)
}

fn print_radius(radius: &BlastRadius) {
    let source = &radius.source_node;
    println!(
        "Blast radius of {} ({}, {}):",
        source.name.cyan().bold(),
        source.node_type,
        source.tool
    );
    println!();

    let summary = &radius.summary;
    print_field(
        "Impacted",
        format!(
            "{} ({} direct, {} transitive)",
            radius.total_impact.to_string().green(),
            summary.direct_impact,
            summary.transitive_impact
        ),
    );
    print_field("Deepest hop", summary.max_depth_reached);
    print_field("Cross-tool edges", summary.cross_tool_edges);
    println!();

    for (tool, impact) in &radius.impact_by_tool {
        if impact.total() == 0 {
            continue;
        }
        println!("  {} ({}):", tool.as_str().white().bold(), impact.total());
        let nodes: Vec<&ImpactedNode> = impact.direct.iter().chain(&impact.transitive).collect();
        print_list(&nodes, "(none)", |n| {
            format!(
                "{} {} {}",
                n.name,
                format!("[{} hop{}]", n.depth, if n.depth == 1 { "" } else { "s" }).dimmed(),
                format!("{:.0}%", n.path_confidence * 100.0).dimmed()
            )
        });
    }

    if !radius.critical_paths.is_empty() {
        println!();
        println!("  {}:", "Critical paths".white().bold());
        print_list(&radius.critical_paths, "(none)", |path| {
            let chain = path
                .nodes
                .iter()
                .map(NodeId::as_str)
                .collect::<Vec<_>>()
                .join(" → ");
            format!("{chain} {}", format!("{:.0}%", path.confidence * 100.0).dimmed())
        });
    }
}
