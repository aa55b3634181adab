//! Single-document inspection and profile table commands

use colored::Colorize;

use loanharvest::config::Config;
use loanharvest::error::{HarvestError, Result};
use loanharvest::fetch::SourceFetcher;
use loanharvest::fields::Channel;
use loanharvest::pipeline::{Harvester, ItemOutcome, ProductSource};
use loanharvest::profile::ProfileTable;

use super::records::print_record;

/// Run one page (and optional PDF) through the pipeline without persisting
pub fn cmd_inspect(
    config: &Config,
    target: &str,
    pdf: Option<String>,
    channel: Option<Channel>,
    institution: &str,
    json: bool,
) -> Result<()> {
    let profiles = ProfileTable::load_or_builtin(config.profiles_path.as_deref())?;
    let fetcher = SourceFetcher::from_config(config);
    let harvester = Harvester::new(&fetcher, None, &profiles, &config.extraction);

    let source = ProductSource {
        url: target.to_string(),
        pdf_url: pdf,
        rate_page: None,
        channel,
        institution_id: institution.to_string(),
        name: None,
    };
    let report = harvester.run_product(&source);

    if let ItemOutcome::Failed { stage, reason } = &report.outcome {
        return Err(HarvestError::SourceUnavailable {
            url: target.to_string(),
            reason: format!("{} ({})", reason, stage),
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let profile = profiles.resolve(target);
    println!();
    if let Some(ref record) = report.record {
        print_record(record);
    }
    println!(
        "  Profile:     {}",
        if profile.is_neutral() { "(none)" } else { profile.key.as_str() }
    );

    if !report.misses.is_empty() {
        println!("\n  {}", "Not extracted:".yellow());
        for miss in &report.misses {
            println!("    - {}", miss);
        }
    }
    if !report.repairs.is_empty() {
        println!("\n  {}", "Repaired:".yellow());
        for repair in &report.repairs {
            println!("    - {}", repair);
        }
    }
    println!();
    Ok(())
}

/// List the profile table
pub fn cmd_profiles(config: &Config, json: bool) -> Result<()> {
    let profiles = ProfileTable::load_or_builtin(config.profiles_path.as_deref())?;

    if json {
        println!("{}", serde_json::to_string_pretty(profiles.profiles())?);
        return Ok(());
    }

    if profiles.is_empty() {
        println!("Profile table is empty; every product uses neutral defaults.");
        return Ok(());
    }

    let source = config
        .profiles_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "built-in".to_string());
    println!("\nProfiles ({}, {}):\n", profiles.len(), source);

    let width = profiles
        .profiles()
        .iter()
        .map(|p| p.key.len())
        .max()
        .unwrap_or(20)
        .min(48);
    for profile in profiles.profiles() {
        let name = profile
            .product_name_override
            .as_deref()
            .or(profile.product_name.as_deref())
            .unwrap_or("-");
        println!(
            "  {:<width$}  {}  {}",
            profile.key,
            name.bold(),
            profile.loan_type.label().dimmed(),
            width = width
        );
        if let Some(ref pdf) = profile.fixed_pdf_reference {
            println!("  {:<width$}  pdf: {}", "", pdf.dimmed(), width = width);
        }
        if let Some(ref page) = profile.rate_page {
            println!("  {:<width$}  rates: {}", "", page.dimmed(), width = width);
        }
    }
    println!();
    Ok(())
}

/// Show the profile an identifier resolves to
pub fn cmd_resolve(config: &Config, identifier: &str) -> Result<()> {
    let profiles = ProfileTable::load_or_builtin(config.profiles_path.as_deref())?;
    let profile = profiles.resolve(identifier);

    if profile.is_neutral() {
        println!("{} matches no profile; neutral defaults apply.", identifier);
        return Ok(());
    }

    println!("{} → {}", identifier, profile.key.bold());
    println!("{}", toml::to_string_pretty(profile).map_err(|e| HarvestError::ConfigError(e.to_string()))?);
    Ok(())
}

/// Write the default configuration file if none exists
pub fn cmd_init(config: &Config) -> Result<()> {
    let path = Config::config_path()?;
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }
    config.save()?;
    println!("Wrote {}", path.display());
    println!("Database: {}", Config::db_path()?.display());
    Ok(())
}
