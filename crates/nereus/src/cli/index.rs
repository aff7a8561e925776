//! `nereus index` command implementations.

use std::time::Duration;

use clap::Subcommand;
use colored::Colorize;
use nereus::index::{
    BuildRecord, BuildRequest, BuildResult, HealthReport, HealthStatus, IndexStats,
    LookupRequest, LookupResult, Pagination, ReferenceType, ReverseLookupRequest,
    ReverseLookupResult, SortField, SortOrder,
};
use nereus::{NodeId, RepositoryId, ScanId};

use super::Context;
use super::display::{percent, print_field, print_list};

#[derive(Subcommand)]
pub enum IndexCommand {
    /// Index external object references of scans
    Build {
        /// Scans to index
        #[arg(short, long = "scan")]
        scans: Vec<String>,

        /// Index the latest scan of these repositories
        #[arg(short, long = "repository")]
        repositories: Vec<String>,

        /// Re-index scans that are already indexed
        #[arg(short, long)]
        force: bool,

        /// Drop references below this confidence (0.0-1.0)
        #[arg(long, default_value_t = 0.5)]
        min_confidence: f64,

        /// Only index these reference types
        #[arg(long = "include-type")]
        include_types: Vec<String>,

        /// Never index these reference types
        #[arg(long = "exclude-type")]
        exclude_types: Vec<String>,
    },

    /// Show the state of a build
    Status {
        /// Build id
        build_id: String,

        /// Block up to this many seconds for the build to finish
        #[arg(short, long)]
        wait: Option<u64>,
    },

    /// Ask a running build to stop after its current batch
    Cancel {
        /// Build id
        build_id: String,
    },

    /// Find the nodes that reference an external object
    Lookup {
        /// External identifier (ARN, resource id, ...)
        external_id: String,

        /// Reference type of the identifier
        #[arg(long = "type", default_value = "arn")]
        reference_type: String,

        /// Restrict to one repository
        #[arg(short, long)]
        repository: Option<String>,

        /// Include full node records
        #[arg(long)]
        details: bool,
    },

    /// List the external objects a node references
    Reverse {
        /// Scan containing the node
        scan: String,

        /// Node id
        node: String,

        /// Only these reference types
        #[arg(long = "type")]
        types: Vec<String>,

        /// Page number, starting at 1
        #[arg(long, default_value_t = 1)]
        page: usize,

        /// References per page
        #[arg(long, default_value_t = Pagination::DEFAULT_PAGE_SIZE)]
        page_size: usize,

        /// Most confident references first
        #[arg(long)]
        by_confidence: bool,
    },

    /// Show index statistics
    Stats,

    /// Check index health
    Health,
}

/// Run an index subcommand.
pub fn run(ctx: &Context, command: IndexCommand) -> Result<(), nereus::Error> {
    let index = ctx.nereus.index();
    match command {
        IndexCommand::Build {
            scans,
            repositories,
            force,
            min_confidence,
            include_types,
            exclude_types,
        } => {
            let mut request = if !scans.is_empty() {
                BuildRequest::for_scans(scans.iter().map(|s| ScanId::from(s.as_str())).collect())
            } else if !repositories.is_empty() {
                BuildRequest::for_repositories(
                    repositories
                        .iter()
                        .map(|r| RepositoryId::from(r.as_str()))
                        .collect(),
                )
            } else {
                let all = ctx.nereus.store().list_scans(&ctx.tenant)?;
                BuildRequest::for_scans(all.into_iter().map(|scan| scan.scan_id).collect())
            };
            request.force_full_rebuild = force;
            request.min_confidence = min_confidence;
            request.include_types = parse_types(&include_types)?;
            request.exclude_types = parse_types(&exclude_types)?;

            let result = index.build(&ctx.tenant, request)?;
            ctx.emit(&result, print_build)
        }
        IndexCommand::Status { build_id, wait } => {
            let record = match wait {
                Some(secs) => {
                    index.wait_for_build(&ctx.tenant, &build_id, Duration::from_secs(secs))?
                }
                None => index.get_build(&ctx.tenant, &build_id)?,
            };
            ctx.emit(&record, print_record)
        }
        IndexCommand::Cancel { build_id } => {
            let record = index.cancel_build(&ctx.tenant, &build_id)?;
            ctx.emit(&record, print_record)
        }
        IndexCommand::Lookup {
            external_id,
            reference_type,
            repository,
            details,
        } => {
            let mut request = LookupRequest::new(external_id, reference_type.parse()?);
            if let Some(repository) = repository {
                request = request.in_repository(repository);
            }
            if details {
                request = request.with_node_details();
            }
            let result = index.lookup(&ctx.tenant, &request)?;
            ctx.emit(&result, print_lookup)
        }
        IndexCommand::Reverse {
            scan,
            node,
            types,
            page,
            page_size,
            by_confidence,
        } => {
            let mut request = ReverseLookupRequest::new(
                ScanId::from(scan.as_str()),
                NodeId::from(node.as_str()),
            );
            request.types = parse_types(&types)?;
            request.pagination = Pagination::new(page, page_size);
            if by_confidence {
                request.pagination = request
                    .pagination
                    .sorted_by(SortField::Confidence, SortOrder::Desc);
            }
            let result = index.reverse_lookup(&ctx.tenant, &request)?;
            ctx.emit(&result, print_reverse)
        }
        IndexCommand::Stats => {
            let stats = index.stats(&ctx.tenant)?;
            ctx.emit(&stats, |stats| print_stats(ctx, stats))
        }
        IndexCommand::Health => {
            let report = index.health(&ctx.tenant)?;
            ctx.emit(&report, print_health)
        }
    }
}

fn parse_types(types: &[String]) -> Result<Option<Vec<ReferenceType>>, nereus::Error> {
    if types.is_empty() {
        return Ok(None);
    }
    types
        .iter()
        .map(|t| t.parse::<ReferenceType>())
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn print_build(result: &BuildResult) {
    println!(
        "Build {} {}",
        result.build_id.cyan().bold(),
        result.status.as_str()
    );
    println!();
    print_field("Scans", result.scans_processed);
    print_field("Nodes", result.nodes_processed);
    print_field("References", result.references_extracted);
    print_field("Unique objects", result.unique_objects_indexed);
    print_field(
        "Entries",
        format!(
            "{} created, {} updated",
            result.entries_created, result.entries_updated
        ),
    );
    print_field("Duration", format!("{} ms", result.duration_ms));
    for warning in &result.warnings {
        println!("  {}: {warning}", "warning".yellow());
    }
    if !result.errors.is_empty() {
        println!("  {}:", "Errors".red().bold());
        print_list(&result.errors, "(none)", |e| match &e.scan_id {
            Some(scan) => format!("{} {} {}", scan, e.code.red(), e.message),
            None => format!("{} {}", e.code.red(), e.message),
        });
    }
}

fn print_record(record: &BuildRecord) {
    match &record.result {
        Some(result) => print_build(result),
        None => {
            println!(
                "Build {} {}",
                record.build_id.cyan().bold(),
                record.status.as_str()
            );
            print_field(
                "Progress",
                format!(
                    "{}/{}",
                    record.partial_progress.processed, record.partial_progress.total
                ),
            );
        }
    }
}

fn print_lookup(result: &LookupResult) {
    if !result.found {
        println!("{} is not referenced by any node", result.external_id.cyan());
        return;
    }
    println!(
        "{} is referenced {} time{}",
        result.external_id.cyan().bold(),
        result.reference_count,
        if result.reference_count == 1 { "" } else { "s" }
    );
    println!();
    println!("  {}:", "Repositories".white().bold());
    print_list(&result.repository_ids, "(none)", ToString::to_string);
    match &result.nodes {
        Some(nodes) => {
            println!("  {}:", "Nodes".white().bold());
            print_list(nodes, "(none)", |n| {
                format!(
                    "{} {} {}",
                    n.name,
                    format!("({}, {})", n.node_type, n.id).dimmed(),
                    n.repository_id.as_str().dimmed()
                )
            });
        }
        None => {
            println!("  {}:", "Nodes".white().bold());
            print_list(&result.node_ids, "(none)", ToString::to_string);
        }
    }
}

fn print_reverse(result: &ReverseLookupResult) {
    println!(
        "{} references {} external object{}",
        result.node_id.as_str().cyan().bold(),
        result.total_count,
        if result.total_count == 1 { "" } else { "s" }
    );
    println!();
    print_list(&result.external_objects, "(none)", |r| {
        format!(
            "{} {}",
            r.external_object_id,
            format!("[{}, {}]", r.ref_type, percent(r.confidence)).dimmed()
        )
    });
}

fn print_stats(ctx: &Context, stats: &IndexStats) {
    println!("{}", "Nereus Index Statistics".cyan().bold());
    println!();

    if let Some(path) = ctx.nereus.database().path() {
        let size = match std::fs::metadata(path) {
            Ok(meta) => format_size(meta.len()),
            Err(e) => {
                tracing::debug!(error = %e, "Failed to get database file size");
                "size unknown".to_string()
            }
        };
        println!(
            "  {}: {} ({size})",
            "Database".white().bold(),
            path.display()
        );
        println!();
    }

    println!(
        "  {}: {} total, {} unique objects",
        "Entries".white().bold(),
        stats.total_entries.to_string().green(),
        stats.unique_objects.to_string().green()
    );
    let mut by_count: Vec<_> = stats.counts_by_type.iter().collect();
    by_count.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (reference_type, count) in by_count {
        println!("    {}: {count}", reference_type.as_str().dimmed());
    }
    println!();

    println!(
        "  {}: {} L1, {} L2, {} misses ({} hit ratio)",
        "Cache".white().bold(),
        stats.cache.l1_hits,
        stats.cache.l2_hits,
        stats.cache.misses,
        percent(stats.cache_hit_ratio)
    );
    print_field("Average lookup", format!("{:.2} ms", stats.average_lookup_ms));
    match &stats.last_build {
        Some(build) => print_field(
            "Last build",
            format!(
                "{} {} at {}",
                build.build_id,
                build.status.as_str(),
                build
                    .completed_at
                    .unwrap_or(build.started_at)
                    .format("%Y-%m-%d %H:%M:%S")
            ),
        ),
        None => print_field("Last build", "never".dimmed()),
    }
}

fn print_health(report: &HealthReport) {
    match report.status {
        HealthStatus::Healthy => println!("Index is {}", "healthy".green().bold()),
        HealthStatus::Degraded => println!("Index is {}", "degraded".yellow().bold()),
    }
    for issue in &report.issues {
        println!("  {} {issue}", "•".dimmed());
    }
}

#[allow(clippy::cast_precision_loss)]
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} bytes")
    }
}
