//! Command-line configuration.

use clap::Parser;
use std::path::PathBuf;
use tracing::Level;

/// Command-line arguments for the scenario runner.
#[derive(Parser, Debug, Clone)]
#[command(name = "deepcopy-rs")]
#[command(about = "Replays an object history and deep-copies it between in-memory images")]
#[command(version)]
pub struct Args {
    /// Scenario file (JSON).
    pub scenario: PathBuf,

    /// Materialize data inherited from the parent image.
    #[arg(long)]
    pub flatten: bool,

    /// Enable fast-diff on the destination image.
    #[arg(long)]
    pub fast_diff: bool,

    /// Disable the destination object map.
    #[arg(long)]
    pub no_object_map: bool,

    /// Object to copy, overriding the scenario.
    #[arg(long)]
    pub object_number: Option<u64>,

    /// Enable debug logging.
    #[arg(long, short = 'd')]
    pub debug: bool,

    /// Enable silent mode (errors only).
    #[arg(long, short = 's')]
    pub silent: bool,

    /// Pretty-print the report.
    #[arg(long)]
    pub pretty: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            scenario: PathBuf::from("scenario.json"),
            flatten: false,
            fast_diff: false,
            no_object_map: false,
            object_number: None,
            debug: false,
            silent: false,
            pretty: false,
        }
    }
}

/// Runner configuration derived from command-line arguments.
#[derive(Debug, Clone)]
pub struct Config {
    /// Scenario file to replay.
    pub scenario: PathBuf,
    pub flatten: bool,
    pub fast_diff: bool,
    pub disable_object_map: bool,
    pub object_number: Option<u64>,
    /// Enable debug logging.
    pub debug: bool,
    /// Errors only.
    pub silent: bool,
    pub pretty: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::from(Args::default())
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            scenario: args.scenario,
            flatten: args.flatten,
            fast_diff: args.fast_diff,
            disable_object_map: args.no_object_map,
            object_number: args.object_number,
            debug: args.debug,
            silent: args.silent,
            pretty: args.pretty,
        }
    }
}

impl Config {
    /// Maximum log level; debug wins over silent.
    pub fn log_level(&self) -> Level {
        if self.debug {
            Level::DEBUG
        } else if self.silent {
            Level::ERROR
        } else {
            Level::INFO
        }
    }
}
