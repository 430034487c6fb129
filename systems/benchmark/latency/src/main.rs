//! Relay acknowledgment latency benchmark binary
use anyhow::Context;
use clap::Parser;
use karis::{components::prelude::*, logging::init_tracing};

/// Arguments required for starting the program from the command line.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the config file for the Latency Benchmark Component.
    #[arg(short, long)]
    filepath: String,
    /// Write the results here instead of the path in the config file.
    #[arg(short, long)]
    output: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = LatencyBenchmarkConfig::from_file(&args.filepath)
        .with_context(|| format!("Failed to load config {}", args.filepath))?;
    if let Some(output) = args.output {
        config = config.with_output_path(output);
    }
    let component = LatencyBenchmark::from_config(&config)?;
    LatencyBenchmarkController::start(component)
        .await
        .context("Latency benchmark aborted")?;
    Ok(())
}
