//! Batch harvesting

use colored::Colorize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use loanharvest::config::Config;
use loanharvest::db::{Database, RecordStore};
use loanharvest::error::{HarvestError, Result};
use loanharvest::fetch::SourceFetcher;
use loanharvest::pipeline::{BatchOptions, BatchReport, Harvester, ItemOutcome, SourceList};
use loanharvest::profile::ProfileTable;

/// Harvest every product in a sources file
pub fn cmd_run(
    config: &Config,
    sources_path: &Path,
    workers: Option<usize>,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let sources = SourceList::load(sources_path)?;
    if sources.products.is_empty() {
        println!("No products in {}.", sources_path.display());
        return Ok(());
    }

    let profiles = ProfileTable::load_or_builtin(config.profiles_path.as_deref())?;
    let fetcher = SourceFetcher::from_config(config);
    let db = if dry_run { None } else { Some(Database::open()?) };
    let store = db.as_ref().map(|db| db as &dyn RecordStore);

    let cancel = Arc::new(AtomicBool::new(false));
    let c = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling: finishing products already in progress...");
        c.store(true, Ordering::SeqCst);
    })
    .map_err(|e| HarvestError::ConfigError(format!("Failed to set Ctrl+C handler: {}", e)))?;

    let options = BatchOptions {
        workers: workers.unwrap_or(config.workers).max(1),
        delay: config.request_delay(),
    };

    if !json {
        println!(
            "\nHarvesting {} product(s) with {} worker(s){}...\n",
            sources.products.len(),
            options.workers,
            if dry_run { " (dry run)" } else { "" }
        );
    }

    let harvester = Harvester::new(&fetcher, store, &profiles, &config.extraction)
        .with_retry(config.retry);
    let report = harvester.run_batch(&sources.products, options, &cancel);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.cancelled > 0 {
        return Err(HarvestError::Cancelled);
    }
    Ok(())
}

fn print_report(report: &BatchReport) {
    for item in &report.items {
        let name = item
            .record
            .as_ref()
            .map(|r| r.product_name.as_str())
            .unwrap_or("");
        match &item.outcome {
            ItemOutcome::Success { record_id } => {
                println!("  {} {} {}", "✓".green(), name.bold(), id_suffix(*record_id).dimmed());
            }
            ItemOutcome::Partial { record_id, missing } => {
                let missing: Vec<String> = missing.iter().map(|g| g.to_string()).collect();
                println!(
                    "  {} {} {} missing: {}",
                    "~".yellow(),
                    name.bold(),
                    id_suffix(*record_id).dimmed(),
                    missing.join(", ")
                );
            }
            ItemOutcome::Skipped { duplicate_of } => {
                println!(
                    "  {} {} unchanged {}",
                    "=".cyan(),
                    name.bold(),
                    id_suffix(*duplicate_of).dimmed()
                );
            }
            ItemOutcome::Failed { stage, reason } => {
                eprintln!("  [ERROR] {} ({}): {}", item.source, stage, reason);
            }
            ItemOutcome::Cancelled => {
                println!("  {} {}", "-".dimmed(), item.source.dimmed());
            }
        }
    }

    println!(
        "\n{} succeeded, {} partial, {} skipped, {} failed, {} cancelled ({:.1}s)",
        report.succeeded.to_string().green(),
        report.partial.to_string().yellow(),
        report.skipped,
        if report.failed > 0 {
            report.failed.to_string().red().to_string()
        } else {
            report.failed.to_string()
        },
        report.cancelled,
        report.elapsed_ms as f64 / 1000.0
    );
}

fn id_suffix(id: Option<i64>) -> String {
    id.map(|id| format!("#{}", id)).unwrap_or_default()
}
