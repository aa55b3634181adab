use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::fields::Channel;

/// Sales channel as given on the command line
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ChannelArg {
    Web,
    Branch,
}

impl From<ChannelArg> for Channel {
    fn from(arg: ChannelArg) -> Self {
        match arg {
            ChannelArg::Web => Channel::Web,
            ChannelArg::Branch => Channel::Branch,
        }
    }
}

#[derive(Parser)]
#[command(name = "loanharvest")]
#[command(author, version, about = "Harvest loan product terms from bank pages and rate sheets", long_about = None)]
#[command(after_help = r#"Examples:
  loanharvest run sources.toml                          Harvest every listed product
  loanharvest run sources.toml --workers 4              Harvest on four workers
  loanharvest run sources.toml --dry-run --json         Extract without writing
  loanharvest inspect https://bank.example/kojin/loan/mycarloan/ --channel web
  loanharvest records                                   List stored products

Quick Start:
  1. loanharvest init
  2. loanharvest run sources.toml
  3. loanharvest records
"#)]
pub struct Cli {
    /// Configuration file to use instead of the default location
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Harvest every product in a sources file
    #[command(after_help = r#"Sources file format:
  [[products]]
  url = "https://bank.example/kojin/loan/mycarloan/"
  institution_id = "0117"
  channel = "web"                 # optional: web | branch
  pdf_url = "../pdf/l-75.pdf"     # optional, relative to url
  rate_page = "/rates/car.html"   # optional rate-list page
  name = "マイカーローン"           # optional display name
"#)]
    Run {
        /// TOML file listing the products
        #[arg(value_name = "SOURCES")]
        sources: PathBuf,

        /// Products processed in parallel (overrides config)
        #[arg(long)]
        workers: Option<usize>,

        /// Extract and report without deduplicating or writing
        #[arg(long)]
        dry_run: bool,

        /// Output the batch report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Extract a single page or PDF and show what was found
    Inspect {
        /// URL or local path of the product page (or PDF)
        target: String,

        /// Rate sheet PDF to read alongside the page
        #[arg(long)]
        pdf: Option<String>,

        /// Read the rate for this channel
        #[arg(long, value_enum)]
        channel: Option<ChannelArg>,

        /// Institution code recorded on the result
        #[arg(long, default_value = "0000")]
        institution: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the product profiles in use
    Profiles {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show which profile a URL or key resolves to
    Resolve {
        /// URL or path-like product key
        identifier: String,
    },

    /// List stored loan products
    Records {
        /// Only records for this institution
        #[arg(long)]
        institution: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one stored loan product
    Show {
        /// Record id
        id: i64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a default configuration file
    Init,
}
