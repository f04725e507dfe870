//! Tempora recovery CLI
//!
//! Operator tool that runs crash recovery over a data directory. The
//! embedding engine normally triggers recovery itself at startup; this
//! binary exists to repair a data directory out of band.

use clap::Parser;
use std::path::PathBuf;
use tempora::{
    ArchiveIndex, Config, CrashRecovery, DirtyFlag, FileIndex, LabelIndex, LabelIndexSink,
    MemStats, Metric, SeriesLayout, SeriesMap, TimeRange,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tempora")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Crash recovery for a Tempora data directory")]
#[command(
    long_about = "Scans the series file tree, quarantines files that cannot be trusted,\n\
                  reconciles the archive indexes, and rebuilds the label indexes.\n\
                  The live in-memory series come from the heads checkpoint, which only\n\
                  the embedding engine can load; this tool runs with an empty live map,\n\
                  the state after a lost checkpoint."
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Force the full reconciliation path for every series
    #[arg(long)]
    pedantic: bool,

    /// Run recovery even if the dirty flag is not set
    #[arg(long)]
    force: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(data_dir) = &cli.data_dir {
        config.storage.data_dir = data_dir.to_string_lossy().to_string();
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| format!("tempora={}", config.logging.level)),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Tempora recovery v{}", env!("CARGO_PKG_VERSION"));

    let base = PathBuf::from(&config.storage.data_dir);
    tracing::info!("Data directory: {:?}", base);

    let layout = SeriesLayout::new(&base, config.storage.series_dir_name_len);
    let dirty = DirtyFlag::new(&base);

    if !dirty.is_dirty() && !cli.force {
        tracing::info!("Store was shut down cleanly; nothing to recover. Use --force to run anyway.");
        return Ok(());
    }

    let archived_metrics: FileIndex<Metric> =
        FileIndex::open(base.join("archived_metrics.json"))?;
    let archived_ranges: FileIndex<TimeRange> =
        FileIndex::open(base.join("archived_ranges.json"))?;
    let sink = LabelIndexSink::new(LabelIndex::open(base.join("label_index.json"))?);
    let stats = MemStats::new();

    let mut series_map = SeriesMap::new();

    let recovery = CrashRecovery::new(
        &layout,
        &archived_metrics,
        &archived_ranges,
        &sink,
        &dirty,
        &stats,
    )
    .pedantic_checks(cli.pedantic || config.storage.pedantic_checks);

    recovery.run(&mut series_map)?;

    archived_metrics.persist()?;
    archived_ranges.persist()?;
    sink.persist()?;

    tracing::info!(
        "Recovery done: {} live series, {} archived series, {} chunk descriptors in memory",
        series_map.len(),
        archived_metrics.len(),
        stats.chunk_descs()
    );

    Ok(())
}
