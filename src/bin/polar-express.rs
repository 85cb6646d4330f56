use std::path::Path;
use std::time::Instant;

use anyhow::Error;
use clap::Parser;

use pex_datastore::catalog::DEFAULT_CATALOG_FILENAME;
use pex_datastore::MetadataCatalog;

use polar_express::backup::BackupExecutor;
use polar_express::config::Args;
use polar_express::executor::Scheduler;

fn human_readable_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

fn human_readable_duration(seconds: u64) -> String {
    if seconds >= 3600 {
        format!("{}h{}m{}s", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
    } else if seconds >= 60 {
        format!("{}m{}s", seconds / 60, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

fn run() -> Result<(), Error> {
    let config = Args::parse().into_config()?;

    let start = Instant::now();
    let scheduler = Scheduler::new()?;
    let catalog = MetadataCatalog::open(Path::new(DEFAULT_CATALOG_FILENAME))?;

    let executor = BackupExecutor::new(
        scheduler.clone(),
        catalog,
        config.keying,
        config.backup_root,
        pex_datastore::DEFAULT_BLOCK_SIZE,
        config.bundle_config,
        config.upload_config,
    )?;

    executor.start();
    scheduler.wait_for_finish();

    let counters = executor.counters();
    use std::sync::atomic::Ordering::Relaxed;
    println!(
        "Processed {} files ({}).",
        counters.files_processed.load(Relaxed),
        human_readable_size(counters.files_bytes.load(Relaxed))
    );
    println!(
        "Generated {} new snapshots ({}).",
        counters.snapshots_generated.load(Relaxed),
        human_readable_size(counters.snapshots_bytes.load(Relaxed))
    );
    println!(
        "Generated {} new bundles ({}).",
        counters.bundles_generated.load(Relaxed),
        human_readable_size(counters.bundles_bytes.load(Relaxed))
    );
    println!(
        "Uploaded {} new bundles ({}).",
        counters.bundles_uploaded.load(Relaxed),
        human_readable_size(counters.uploaded_bytes.load(Relaxed))
    );
    println!(
        "Took {}.",
        human_readable_duration(start.elapsed().as_secs())
    );

    drop(executor);
    scheduler.shutdown();
    Ok(())
}

fn main() {
    env_logger::init();

    if let Err(err) = run() {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}
