use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ct_batch::config::PipelineConfig;
use ct_batch::{BatchError, pipeline};
use env_logger::{Builder, Env};

/// Load, mask, resize, dump and sample a batch of CT scans.
#[derive(Parser)]
#[command(name = "ct-batch")]
#[command(version, author, about)]
struct Cli {
    /// Pipeline description (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Worker threads; overrides `workers` from the config.
    #[arg(long)]
    workers: Option<usize>,

    /// Sampling seed; overrides `sample.seed` from the config.
    #[arg(long)]
    seed: Option<u64>,
}

fn run(cli: Cli) -> Result<(), BatchError> {
    let mut config = PipelineConfig::from_path(&cli.config)?;
    if cli.workers.is_some() {
        config.workers = cli.workers;
    }
    if let (Some(seed), Some(sample)) = (cli.seed, config.sample.as_mut()) {
        sample.seed = Some(seed);
    }

    let output = pipeline::run(&config)?;
    log::info!(
        "Batch of {} scans with {} nodules",
        output.batch.len(),
        output.batch.nodules().map_or(0, |table| table.len())
    );
    if let Some(patches) = &output.patches {
        log::info!("Sampled {} patches", patches.len());
    }
    Ok(())
}

fn main() -> ExitCode {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    builder.init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
