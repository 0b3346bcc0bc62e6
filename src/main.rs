//! deepcopy-rs: replays an object history and deep-copies it.
//!
//! Prints a JSON report comparing the source and destination object at
//! every snapshot.

use clap::Parser;
use tracing_subscriber::FmtSubscriber;

use deepcopy_rs::{Args, Config, Scenario};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Parse command-line arguments
    let args = Args::parse();
    let config = Config::from(args);

    // Set up logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    let mut scenario = Scenario::load(&config.scenario)?;
    scenario.apply_config(&config);

    let report = scenario.run().await?;
    let output = if config.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", output);

    if !report.is_success() || !report.matches {
        std::process::exit(1);
    }
    Ok(())
}
