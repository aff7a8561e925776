//! `nereus import` command implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use colored::Colorize;
use nereus::index::BuildRequest;
use nereus::{GraphEdge, GraphNode, GraphSnapshot, RepositoryId, ScanId};
use serde::Deserialize;

use super::Context;
use super::display::print_field;

/// Scanner export: one scan of one repository. The tenant comes from the
/// command line.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanExport {
    scan_id: ScanId,
    repository_id: RepositoryId,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    nodes: Vec<GraphNode>,
    #[serde(default)]
    edges: Vec<GraphEdge>,
}

/// Run the import command.
pub fn run(ctx: &Context, file: &Path, index: bool) -> Result<(), nereus::Error> {
    let content = std::fs::read_to_string(file)?;
    let export: ScanExport = serde_json::from_str(&content)?;

    let snapshot = export.nodes.into_iter().fold(
        GraphSnapshot::new(ctx.tenant.clone(), export.repository_id, export.scan_id),
        GraphSnapshot::with_node,
    );
    let snapshot = export
        .edges
        .into_iter()
        .fold(snapshot, GraphSnapshot::with_edge);

    let stats = ctx.nereus.import_snapshot(&snapshot, export.completed_at)?;
    let build = if index {
        Some(
            ctx.nereus
                .index()
                .build(&ctx.tenant, BuildRequest::for_scans(vec![snapshot.scan_id.clone()]))?,
        )
    } else {
        None
    };

    if ctx.json {
        let value = serde_json::json!({
            "scanId": snapshot.scan_id,
            "repositoryId": snapshot.repository_id,
            "import": stats,
            "build": build,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "{} scan {} of {}",
        if stats.replaced { "Replaced" } else { "Imported" }.green().bold(),
        snapshot.scan_id.as_str().cyan(),
        snapshot.repository_id.as_str().cyan()
    );
    print_field("Nodes", stats.nodes);
    print_field("Edges", stats.edges);
    if let Some(build) = build {
        print_field(
            "Index",
            format!(
                "{} references, {} objects ({})",
                build.references_extracted,
                build.unique_objects_indexed,
                build.status.as_str()
            ),
        );
    }
    Ok(())
}
