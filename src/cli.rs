use crate::leaf_selector::SelectionPolicy;
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Verbosity levels for output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum VerbosityLevel {
    /// Only show warnings and failures
    Quiet,
    /// Show standard information
    #[default]
    Normal,
    /// Show detailed information
    Verbose,
}

impl VerbosityLevel {
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        if quiet {
            VerbosityLevel::Quiet
        } else if verbose {
            VerbosityLevel::Verbose
        } else {
            VerbosityLevel::Normal
        }
    }
}

/// Mirror mzIdentML files from the archive and keep an analysis ledger of them
#[derive(Parser, Debug, Clone)]
#[command(name = "mzid-mirror")]
#[command(version)]
pub struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Local mirror root
    #[arg(long = "mirror-root", global = true)]
    pub mirror_root: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    /// Only report warnings and failures
    #[arg(short = 'q', long = "quiet", global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Walk the remote archive and download matching files
    Crawl(CrawlArgs),
    /// Expand compressed containers in the mirror
    Extract,
    /// Fetch collection metadata from the archive API
    Metadata,
    /// Add new mirrored files to the ledger and rebuild the subset file
    Report,
    /// Validate ledger rows against their declared schema, smallest first
    Validate(ValidateArgs),
    /// Crawl, extract, report and validate in order
    Run(CrawlArgs),
    /// Validate one file and print the result as JSON
    #[command(name = "validate-worker", hide = true)]
    ValidateWorker(WorkerArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct CrawlArgs {
    /// Only this period bucket (e.g. 2024)
    #[arg(long)]
    pub period: Option<String>,

    /// Only this sub-period (e.g. 03)
    #[arg(long = "sub-period")]
    pub sub_period: Option<String>,

    /// Only this collection (e.g. PXD000001)
    #[arg(long)]
    pub collection: Option<String>,

    /// Fetch the first matching file per collection or all of them
    #[arg(long, value_enum)]
    pub selection: Option<SelectionPolicy>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ValidateArgs {
    /// Only the subset file
    #[arg(long = "subset-only", conflicts_with = "main_only")]
    pub subset_only: bool,

    /// Only the main ledger
    #[arg(long = "main-only")]
    pub main_only: bool,

    /// Per-file timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Directory holding the supported schema files
    #[arg(long = "schema-dir")]
    pub schema_dir: Option<PathBuf>,

    /// Keep going after a worker runs out of resources
    #[arg(long = "continue-on-exhaustion")]
    pub continue_on_exhaustion: bool,

    /// Re-validate rows previously marked timed out or out of memory
    #[arg(long = "retry-exhausted")]
    pub retry_exhausted: bool,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[arg(long = "schema-dir")]
    pub schema_dir: PathBuf,

    #[arg(long = "schema-name")]
    pub schema_name: String,

    pub file: PathBuf,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn verbosity(&self) -> VerbosityLevel {
        VerbosityLevel::from_flags(self.verbose, self.quiet)
    }
}
