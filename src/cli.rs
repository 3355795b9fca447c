//! CLI argument definitions using clap derive macros.

use clap::Parser;

/// Ingest, classify, and catalog medical-imaging datasets referenced by URL.
///
/// Each URL becomes one dataset: it is downloaded (archives are extracted),
/// every file is classified by format and modality, and a per-file catalog
/// plus a dataset summary are persisted.
#[derive(Parser, Debug)]
#[command(name = "datascan")]
#[command(author, version, about)]
pub struct Args {
    /// Dataset URLs to ingest
    pub urls: Vec<String>,

    /// Display name for the dataset (only with a single URL)
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Team identifier recorded on created datasets
    #[arg(long)]
    pub team: Option<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
