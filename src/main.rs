//! loanharvest - extract and reconcile loan product terms from bank pages and rate sheets

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use loanharvest::cli::{Cli, Commands};
use loanharvest::config::Config;
use loanharvest::error::Result;

mod commands;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(hint) = e.hint() {
            eprintln!("\n{}", hint.dimmed());
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Run {
            sources,
            workers,
            dry_run,
            json,
        } => commands::cmd_run(&config, &sources, workers, dry_run, json),
        Commands::Inspect {
            target,
            pdf,
            channel,
            institution,
            json,
        } => commands::cmd_inspect(&config, &target, pdf, channel.map(Into::into), &institution, json),
        Commands::Profiles { json } => commands::cmd_profiles(&config, json),
        Commands::Resolve { identifier } => commands::cmd_resolve(&config, &identifier),
        Commands::Records { institution, json } => commands::cmd_records(institution, json),
        Commands::Show { id, json } => commands::cmd_show(id, json),
        Commands::Init => commands::cmd_init(&config),
    }
}
