use clap::{Args, Parser, Subcommand};
use prop_backend::{
    BackendConfig, CommandEstimatorConfig, LocalPoolConfig, QueuePoolConfig,
    QueueWorkerResources, SlurmPoolConfig,
};
use prop_types::ComputeResources;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Run batches of physical property estimations on a local or HPC worker pool."
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v for DEBUG, -vv for TRACE). RUST_LOG overrides this.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a long-lived estimation server.
    Serve(ServeArgs),
    /// Estimate one replicate of a dataset (or one property of it) under one force field,
    /// skipping the run if its ledger entry already exists.
    ///
    /// Exits with 0 when the run completed or was already recorded, 3 when another process
    /// holds the run's lock (nothing is recorded; retry later), and 1 on error.
    Run(RunArgs),
    /// Join committed results against a reference dataset and write benchmarks.csv.
    Gather(GatherArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listen address; falls back to PROP_LISTEN, then 0.0.0.0:8000
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Scratch space for running computations
    #[arg(long, default_value = "working-directory", value_name = "DIR")]
    pub working_directory: PathBuf,

    /// Result cache root
    #[arg(short, long, default_value = "stored_data", value_name = "DIR")]
    pub storage_directory: PathBuf,

    /// Remove each computation's scratch directory once it finishes
    #[arg(long)]
    pub delete_working_files: bool,

    #[command(flatten)]
    pub backend: BackendArgs,

    #[command(flatten)]
    pub estimator: EstimatorArgs,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Dataset JSON
    #[arg(short, long, value_name = "PATH")]
    pub input_path: PathBuf,

    /// Only estimate the property at this index
    #[arg(short, long, value_name = "INT")]
    pub property_index: Option<usize>,

    /// Force field file; its stem names the output directory
    #[arg(short = 'f', long, value_name = "PATH")]
    pub forcefield: PathBuf,

    #[arg(short, long, default_value = "validation", value_name = "DIR")]
    pub output_directory: PathBuf,

    /// Result cache root [default: <output-directory>/stored_data]
    #[arg(short, long, value_name = "DIR")]
    pub storage_directory: Option<PathBuf>,

    #[arg(short, long, default_value_t = 1)]
    pub replicate: u32,

    /// The server listens on base port + property index; 0 picks a free port
    #[arg(short = 'b', long, default_value_t = 8100)]
    pub base_port: u16,

    /// Request options JSON
    #[arg(long, default_value = "request-options.json", value_name = "PATH")]
    pub options_file: PathBuf,

    /// Seconds between status polls
    #[arg(long, default_value_t = 30)]
    pub polling_interval: u64,

    /// Give up after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Keep each computation's scratch directory
    #[arg(long)]
    pub keep_working_files: bool,

    #[command(flatten)]
    pub backend: BackendArgs,

    #[command(flatten)]
    pub estimator: EstimatorArgs,
}

#[derive(Args, Debug)]
pub struct GatherArgs {
    /// Reference dataset JSON
    #[arg(short, long, default_value = "dataset.json", value_name = "PATH")]
    pub input_dataset: PathBuf,

    /// Root holding rep-*/<force field>/ run directories
    #[arg(short = 'd', long, default_value = "training", value_name = "DIR")]
    pub input_directory: PathBuf,

    #[arg(short, long, default_value = "output", value_name = "DIR")]
    pub output_directory: PathBuf,
}

/// Worker pool selection and sizing.
#[derive(Args, Debug, Clone)]
pub struct BackendArgs {
    /// YAML backend configuration; replaces every other backend flag
    #[arg(long, value_name = "PATH")]
    pub backend_config: Option<PathBuf>,

    /// Provision workers through SLURM instead of running them in-process
    #[arg(long)]
    pub queue: bool,

    /// In-process workers
    #[arg(long, default_value_t = 1, conflicts_with = "queue")]
    pub local_workers: usize,

    /// SLURM partition
    #[arg(long, value_name = "NAME")]
    pub queue_name: Option<String>,

    #[arg(long, default_value_t = 1)]
    pub min_workers: usize,

    #[arg(long, default_value_t = 1)]
    pub max_workers: usize,

    #[arg(long, default_value_t = 1)]
    pub n_gpu: u32,

    #[arg(long, default_value_t = 1)]
    pub n_threads: u32,

    #[arg(long, default_value_t = 4.0, value_name = "GB")]
    pub memory_per_thread: f64,

    /// Allocation time limit (HH:MM:SS or D-HH:MM:SS)
    #[arg(long, default_value = "48:00:00")]
    pub wallclock: String,

    /// Shell line to run at the top of every worker script (repeatable)
    #[arg(long = "setup-command", value_name = "CMD")]
    pub setup_commands: Vec<String>,

    /// Extra #SBATCH option, e.g. --constraint=a100 (repeatable)
    #[arg(long = "extra-script-option", value_name = "OPT", allow_hyphen_values = true)]
    pub extra_script_options: Vec<String>,

    /// Where generated worker scripts go
    #[arg(long, default_value = "worker-scripts", value_name = "DIR")]
    pub script_directory: PathBuf,

    /// Per-computation wall-clock ceiling in seconds
    #[arg(long, value_name = "SECS")]
    pub task_timeout: Option<u64>,
}

impl BackendArgs {
    pub fn to_config(&self) -> BackendConfig {
        if !self.queue {
            return BackendConfig::Local(LocalPoolConfig {
                number_of_workers: self.local_workers,
                resources_per_worker: ComputeResources {
                    number_of_threads: self.n_threads,
                    number_of_gpus: self.n_gpu,
                    ..Default::default()
                },
                task_timeout_secs: self.task_timeout,
            });
        }
        BackendConfig::Slurm(SlurmPoolConfig {
            pool: QueuePoolConfig {
                min_workers: self.min_workers,
                max_workers: self.max_workers,
                resources_per_worker: QueueWorkerResources {
                    number_of_threads: self.n_threads,
                    number_of_gpus: self.n_gpu,
                    per_thread_memory_limit_gb: self.memory_per_thread,
                    wallclock_time_limit: self.wallclock.clone(),
                    ..Default::default()
                },
                queue_name: self.queue_name.clone(),
                setup_script_commands: self.setup_commands.clone(),
                extra_script_options: self.extra_script_options.clone(),
                task_timeout_secs: self.task_timeout,
                ..Default::default()
            },
            script_directory: self.script_directory.clone(),
        })
    }
}

/// The program that performs one estimation.
#[derive(Args, Debug, Clone)]
pub struct EstimatorArgs {
    /// Executable reading a task on stdin and printing an estimate on stdout
    #[arg(long, value_name = "PROGRAM")]
    pub estimator: String,

    /// Argument passed to the estimator (repeatable)
    #[arg(long = "estimator-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub estimator_args: Vec<String>,

    /// Launch the estimator as a job step of its worker's allocation
    #[arg(long)]
    pub srun: bool,
}

impl EstimatorArgs {
    pub fn to_config(&self) -> CommandEstimatorConfig {
        CommandEstimatorConfig {
            program: self.estimator.clone(),
            args: self.estimator_args.clone(),
            launch_with_srun: self.srun,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn queue_flags_build_a_slurm_backend() {
        let cli = Cli::parse_from([
            "prop",
            "run",
            "-i",
            "dataset.json",
            "-f",
            "openff-2.2.1.offxml",
            "--queue",
            "--queue-name",
            "gpu",
            "--max-workers",
            "8",
            "--wallclock",
            "8:00:00",
            "--setup-command",
            "conda activate md",
            "--extra-script-option",
            "--constraint=a100",
            "--estimator",
            "estimate-property",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let BackendConfig::Slurm(slurm) = args.backend.to_config() else {
            panic!("expected slurm backend");
        };
        assert_eq!(slurm.pool.max_workers, 8);
        assert_eq!(slurm.pool.queue_name.as_deref(), Some("gpu"));
        assert_eq!(slurm.pool.setup_script_commands, vec!["conda activate md"]);
        assert_eq!(slurm.pool.extra_script_options, vec!["--constraint=a100"]);
        assert_eq!(args.base_port, 8100);
    }

    #[test]
    fn local_workers_by_default() {
        let cli = Cli::parse_from(["prop", "serve", "--local-workers", "3", "--estimator", "est"]);
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert!(matches!(
            args.backend.to_config(),
            BackendConfig::Local(LocalPoolConfig { number_of_workers: 3, .. })
        ));
    }
}
