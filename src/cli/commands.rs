//! CLI command definitions using clap.
//!
//! - run: run the scheduler against the configured demo sources
//! - config: print the effective configuration
//! - check-schedule: parse and explain a schedule string

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Traversal scheduler - paces batch traversals of document sources
#[derive(Parser, Debug)]
#[command(name = "traversal-scheduler")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute (defaults to `run`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Run the scheduler until Ctrl+C
    Run {
        /// Stop after this many seconds
        #[arg(short, long)]
        duration_secs: Option<u64>,
    },

    /// Print the effective configuration as YAML
    Config,

    /// Parse a schedule string such as `docs:100:5000:9-17`
    CheckSchedule {
        schedule: String,
    },
}
