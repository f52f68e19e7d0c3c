use clap::Parser;
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use env_logger::Env;
use log::info;
use std::fs;
use std::path::PathBuf;

use topoprobe::config_loader;
use topoprobe::matrix::print_summary;
use topoprobe::orchestrator::{self, REPORT_FILE};
use topoprobe::provider::SimulatedRemote;

/// Build a virtual network topology and verify its connectivity matrix
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the run configuration YAML file
    #[arg(short, long)]
    config: PathBuf,

    /// Output directory for the connectivity report
    #[arg(short, long, default_value = "topoprobe_output")]
    output: PathBuf,

    /// Log filter, overriding general.log_level
    #[arg(long)]
    log_level: Option<String>,

    /// Sweep worker threads, overriding sweep.workers
    #[arg(short = 'j', long)]
    workers: Option<usize>,

    /// Share of probes the simulated network drops
    #[arg(long, default_value_t = 0.0)]
    loss_rate: f64,

    /// Seed for simulated packet loss
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Keep every resource after the run
    #[arg(long)]
    keep: bool,
}

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    let args = Args::parse();

    // The configuration supplies the default log level
    let mut config = config_loader::load_config(&args.config)?;
    let level = args.log_level.clone().unwrap_or_else(|| config.general.log_level.clone());
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    info!("Starting topoprobe");
    info!("Configuration file: {:?}", args.config);
    info!("Output directory: {:?}", args.output);

    if let Some(workers) = args.workers {
        config.sweep.workers = workers;
    }

    fs::create_dir_all(&args.output)
        .wrap_err_with(|| format!("Failed to create output directory '{}'", args.output.display()))?;

    let cloud = orchestrator::simulated_cloud(&config)?;
    let remote = SimulatedRemote::new().with_loss(args.seed, args.loss_rate);

    let outcome = orchestrator::run(&config, &cloud, &remote, &args.output, args.keep)?;
    print_summary(&outcome.report);
    info!("Report written to {:?}", args.output.join(REPORT_FILE));

    if !outcome.left_in_place.is_empty() {
        info!("{} resources left in place", outcome.left_in_place.len());
    }
    if !outcome.release_errors.is_empty() {
        bail!("{} resources could not be released", outcome.release_errors.len());
    }
    if !outcome.report.passed() {
        bail!("Connectivity does not match the expected reachability");
    }

    info!("Connectivity verified");
    Ok(())
}
