//! `prop`: serve estimations, run idempotent batch steps, gather benchmark tables.

mod cli;
mod logging;

use crate::cli::{BackendArgs, Cli, Commands, GatherArgs, RunArgs, ServeArgs};
use clap::Parser;
use prop_backend::{BackendConfig, CommandEstimator};
use prop_cache::LocalFileCache;
use prop_runner::{
    aggregate, io, DriverConfig, Result, RunDriver, RunOutcome, RunnerError,
};
use prop_server::{EstimationServer, ServerConfig};
use prop_types::{CalculationBackend, Estimator};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// `run` exits with this code when another process holds the run's lock.
const DEFERRED_EXIT_CODE: i32 = 3;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = logging::setup_logging(cli.verbose, cli.quiet, cli.log_file.as_deref()) {
        eprintln!("Error: failed to set up logging: {e}");
        std::process::exit(1);
    }
    match run_app(cli).await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_app(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Serve(args) => serve(args).await.map(|()| 0),
        Commands::Run(args) => run(args).await,
        Commands::Gather(args) => gather(args).map(|()| 0),
    }
}

fn exit_code(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Locked { .. } => DEFERRED_EXIT_CODE,
        RunOutcome::Skipped { .. } | RunOutcome::Completed(_) => 0,
    }
}

async fn backend_config(args: &BackendArgs) -> Result<BackendConfig> {
    match &args.backend_config {
        Some(path) => io::load_backend_config(path).await,
        None => Ok(args.to_config()),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let listen = args
        .listen
        .clone()
        .or_else(|| std::env::var("PROP_LISTEN").ok())
        .unwrap_or_else(|| "0.0.0.0:8000".to_string());
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| RunnerError::Config(format!("invalid listen address '{listen}': {e}")))?;

    let estimator: Arc<dyn Estimator> = Arc::new(CommandEstimator::new(args.estimator.to_config()));
    let backend = backend_config(&args.backend).await?.build(estimator)?;
    backend.start().await?;

    let cache = LocalFileCache::new(&args.storage_directory, true).await?;
    let server = EstimationServer::new(
        ServerConfig {
            bind_address: addr.ip().to_string(),
            port: addr.port(),
            working_directory: args.working_directory.clone(),
            delete_working_files: args.delete_working_files,
            ..Default::default()
        },
        Arc::clone(&backend),
        Arc::new(cache),
    );
    let bound = server.start().await?;
    info!(addr = %bound, "serving estimations until interrupted");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.stop().await?;
    backend.stop().await?;
    Ok(())
}

async fn run(args: RunArgs) -> Result<i32> {
    let dataset = io::load_dataset(&args.input_path).await?;
    let force_field = io::load_force_field(&args.forcefield).await?;
    let options = io::load_options(&args.options_file).await?;
    info!(
        properties = dataset.len(),
        force_field = %force_field.name,
        replicate = args.replicate,
        "loaded inputs"
    );

    let config = DriverConfig {
        storage_directory: args.storage_directory.clone(),
        replicate: args.replicate,
        property_index: args.property_index,
        base_port: args.base_port,
        polling_interval_secs: args.polling_interval,
        timeout_secs: args.timeout,
        delete_working_files: !args.keep_working_files,
        ..DriverConfig::new(&args.output_directory)
    };
    let estimator = Arc::new(CommandEstimator::new(args.estimator.to_config()));
    let driver = RunDriver::new(config, backend_config(&args.backend).await?, estimator);

    let outcome = driver.run(&dataset, &force_field, &options).await?;
    match &outcome {
        RunOutcome::Skipped { ledger } => {
            println!("{} already exists", ledger.display());
        }
        RunOutcome::Locked { lock } => {
            warn!(lock = %lock.display(), "run deferred: lock held by another run, nothing recorded");
            println!("{} is held by another run", lock.display());
        }
        RunOutcome::Completed(summary) => {
            println!("# estimated: {}", summary.estimated);
            println!("# unsuccessful: {}", summary.unsuccessful);
            println!("# exceptions: {}", summary.exceptions);
            println!("Results saved to {}", summary.json_path.display());
        }
    }
    Ok(exit_code(&outcome))
}

fn gather(args: GatherArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.input_dataset)?;
    let reference = serde_json::from_str(&text).map_err(|e| RunnerError::Parse {
        path: args.input_dataset.clone(),
        message: e.to_string(),
    })?;
    let gathered = aggregate::gather(&reference, &args.input_directory)?;
    for inconsistency in &gathered.inconsistencies {
        warn!(
            path = %inconsistency.path.display(),
            id = inconsistency.id.as_deref().unwrap_or("-"),
            reason = %inconsistency.reason,
            "inconsistent record"
        );
    }
    let csv = aggregate::write_csv(&gathered.rows, &args.output_directory)?;
    println!("Wrote {} entries to {}", gathered.rows.len(), csv.display());
    if !gathered.inconsistencies.is_empty() || !gathered.incomplete.is_empty() {
        println!(
            "{} inconsistent records, {} incomplete runs skipped",
            gathered.inconsistencies.len(),
            gathered.incomplete.len()
        );
    }
    Ok(())
}
