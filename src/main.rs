use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use spacescan::{
    format_size, logging, settings, DeletionCoordinator, NodeId, ScanEngine, ScanEvent, SortOrder,
};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SortArg {
    Size,
    Name,
    Modified,
}

impl From<SortArg> for SortOrder {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Size => SortOrder::Size,
            SortArg::Name => SortOrder::Name,
            SortArg::Modified => SortOrder::Modified,
        }
    }
}

/// Show what is taking up space under a directory
#[derive(Debug, Parser)]
#[command(name = "spacescan", version, about)]
struct Cli {
    /// Directory to scan
    path: PathBuf,

    /// Number of entries to list
    #[arg(long, default_value_t = 20)]
    top: usize,

    /// Levels included in --json output
    #[arg(long, default_value_t = 1)]
    depth: usize,

    /// List entries whose name contains this text instead of the top entries
    #[arg(long)]
    search: Option<String>,

    /// Deepest level searched below the root
    #[arg(long)]
    search_depth: Option<usize>,

    #[arg(long, value_enum, default_value_t = SortArg::Size)]
    sort: SortArg,

    /// Extra gitignore-style pattern to skip (repeatable)
    #[arg(long = "ignore", value_name = "PATTERN")]
    ignore: Vec<String>,

    /// Move this path to the trash after scanning (repeatable)
    #[arg(long = "trash", value_name = "PATH")]
    trash: Vec<PathBuf>,

    /// Print the root subtree as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = settings::load_settings();
    logging::init(&settings.log_level);

    let mut options = settings.scan_options();
    options.ignore_patterns.extend(cli.ignore.iter().cloned());

    let engine = ScanEngine::with_os_fs(options);
    let events = engine.subscribe();
    if !engine.start_scan(&cli.path) {
        bail!("a scan is already running");
    }

    for event in events.iter() {
        match event {
            ScanEvent::Progress { progress, .. } => {
                eprint!(
                    "\r{:5.1}%  {:<60.60}",
                    progress.percentage(),
                    progress.current_path
                );
                let _ = std::io::stderr().flush();
            }
            ScanEvent::Completed { .. } => {
                eprintln!();
                break;
            }
            ScanEvent::Failed { error, .. } => {
                eprintln!();
                engine.wait();
                bail!("scan failed: {}", error);
            }
            ScanEvent::Cancelled { .. } => bail!("scan cancelled"),
            _ => {}
        }
    }
    engine.wait();

    let coordinator = DeletionCoordinator::with_system_trash();
    let root_id = prepare_listing(&engine, &coordinator, &cli)?;

    if cli.json {
        let snapshot = engine.snapshot(cli.depth);
        println!("{}", serde_json::to_string_pretty(&snapshot.root)?);
        return Ok(());
    }

    if let Some(summary) = engine.summary() {
        println!(
            "{}  {} items ({} files, {} dirs)  {}",
            summary.root_path.display(),
            summary.total_items,
            summary.total_files,
            summary.total_dirs,
            format_size(summary.total_size)
        );
    }

    let rows: Vec<(String, u64, bool)> = match &cli.search {
        Some(query) => engine
            .search(query, cli.search_depth)
            .into_iter()
            .take(cli.top)
            .map(|n| (n.path, n.size, n.is_dir))
            .collect(),
        None => engine
            .with_tree(|t| {
                t.children(root_id)
                    .take(cli.top)
                    .map(|n| (n.name().to_string(), n.size(), n.is_dir()))
                    .collect()
            })
            .unwrap_or_default(),
    };

    for (label, size, is_dir) in rows {
        let suffix = if is_dir { "/" } else { "" };
        println!("{:>10}  {}{}", format_size(size), label, suffix);
    }

    Ok(())
}

/// Apply `--trash`, then `--sort`. Reconciliation re-sorts by size, so the
/// requested order goes on last.
fn prepare_listing(
    engine: &ScanEngine,
    coordinator: &DeletionCoordinator,
    cli: &Cli,
) -> Result<NodeId> {
    let root_id = engine
        .with_tree(|t| t.root_id())
        .context("scan produced no tree")?;
    if !cli.trash.is_empty() {
        trash_paths(engine, coordinator, &cli.trash)?;
    }
    engine.sort_children(root_id, cli.sort.into());
    Ok(root_id)
}

fn trash_paths(
    engine: &ScanEngine,
    coordinator: &DeletionCoordinator,
    paths: &[PathBuf],
) -> Result<()> {
    for path in paths {
        let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
        let queued = engine
            .find_node(&resolved)
            .and_then(|id| engine.queued_node(id))
            .with_context(|| format!("{} is not part of the scanned tree", path.display()))?;
        coordinator.enqueue(queued);
    }

    let outcome = coordinator.execute_deletion();
    let report = engine.update_tree_after_deletion(&outcome.deleted_ids())?;
    println!(
        "Moved {} item(s) to trash, reclaimed {}",
        outcome.succeeded.len(),
        format_size(report.reclaimed_bytes)
    );

    for (node, err) in &outcome.failed {
        eprintln!("  failed: {} ({})", node.path.display(), err);
    }
    if let Some(err) = outcome.first_error() {
        bail!("{} deletion(s) failed: {}", outcome.failed.len(), err);
    }
    Ok(())
}
