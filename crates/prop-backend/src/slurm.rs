//! Slurm adapter: allocations are `sbatch` jobs that keep a node reserved for the pool.

use crate::queue::{AllocationSpec, AllocationState, QueueError, QueueSystem};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

/// QueueSystem driving `sbatch`, `squeue` and `scancel`.
pub struct SlurmQueue {
    script_directory: PathBuf,
}

impl SlurmQueue {
    /// Batch scripts are written under `script_directory` before submission.
    pub fn new(script_directory: impl Into<PathBuf>) -> Self {
        Self {
            script_directory: script_directory.into(),
        }
    }
}

/// Render the batch script for one worker allocation.
///
/// The job reserves the requested resources and then idles; estimators launch their work into it
/// as job steps (`srun --jobid`).
pub fn render_script(spec: &AllocationSpec) -> Result<String, QueueError> {
    let resources = &spec.resources;
    let wallclock = resources.wallclock()?;
    let mut script = String::from("#!/bin/bash\n");
    let mut directive = |line: String| {
        let _ = writeln!(script, "#SBATCH {line}");
    };
    directive(format!("--job-name={}", spec.job_name));
    if let Some(queue) = &spec.queue_name {
        directive(format!("--partition={queue}"));
    }
    directive("--ntasks=1".to_string());
    directive(format!("--cpus-per-task={}", resources.number_of_threads));
    directive(format!("--mem={}G", resources.total_memory_gb()));
    if resources.number_of_gpus > 0 {
        directive(format!("--gres=gpu:{}", resources.number_of_gpus));
    }
    directive(format!("--time={}", format_wallclock(wallclock.as_secs())));
    directive(format!("--output={}-%j.log", spec.job_name));
    for option in &spec.extra_script_options {
        directive(option.clone());
    }
    script.push('\n');
    for command in &spec.setup_script_commands {
        script.push_str(command);
        script.push('\n');
    }
    script.push_str("sleep infinity\n");
    Ok(script)
}

fn format_wallclock(total_secs: u64) -> String {
    let (h, rem) = (total_secs / 3600, total_secs % 3600);
    format!("{:02}:{:02}:{:02}", h, rem / 60, rem % 60)
}

/// `sbatch --parsable` prints `<jobid>` or `<jobid>;<cluster>`.
fn parse_job_id(stdout: &str) -> Result<String, QueueError> {
    let id = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.split(';').next())
        .unwrap_or_default();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(QueueError::Rejected(format!(
            "unexpected sbatch output: {stdout:?}"
        )));
    }
    Ok(id.to_string())
}

/// Map an `squeue -o %T` state name.
fn parse_state(raw: &str) -> AllocationState {
    match raw.trim() {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "RESIZING" | "SUSPENDED" => {
            AllocationState::Pending
        }
        "RUNNING" | "COMPLETING" => AllocationState::Running,
        "COMPLETED" => AllocationState::Completed,
        "PREEMPTED" => AllocationState::Preempted,
        "TIMEOUT" | "DEADLINE" => AllocationState::TimedOut,
        "" => AllocationState::Completed,
        other => AllocationState::Failed(other.to_string()),
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

async fn run(program: &str, args: &[&str]) -> Result<Output, QueueError> {
    debug!(program, ?args, "running queue command");
    Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| QueueError::Unavailable(format!("failed to run {program}: {e}")))
}

#[async_trait]
impl QueueSystem for SlurmQueue {
    fn name(&self) -> &str {
        "slurm"
    }

    async fn submit(&self, spec: &AllocationSpec) -> Result<String, QueueError> {
        let script = render_script(spec)?;
        tokio::fs::create_dir_all(&self.script_directory).await?;
        let path = self
            .script_directory
            .join(format!("{}-{}.sh", spec.job_name, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&path, script).await?;
        let path = path.to_string_lossy().into_owned();

        let output = run("sbatch", &["--parsable", &path]).await?;
        if !output.status.success() {
            return Err(QueueError::Rejected(stderr_of(&output)));
        }
        parse_job_id(&String::from_utf8_lossy(&output.stdout))
    }

    async fn state(&self, allocation_id: &str) -> Result<AllocationState, QueueError> {
        let output = run("squeue", &["--noheader", "--jobs", allocation_id, "--format=%T"]).await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            // squeue forgets jobs shortly after they end
            if stderr.contains("Invalid job id") {
                return Ok(AllocationState::Completed);
            }
            return Err(QueueError::Unavailable(stderr));
        }
        Ok(parse_state(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn cancel(&self, allocation_id: &str) -> Result<(), QueueError> {
        let output = run("scancel", &[allocation_id]).await?;
        if !output.status.success() {
            return Err(QueueError::Unavailable(stderr_of(&output)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueueWorkerResources;

    fn spec() -> AllocationSpec {
        AllocationSpec {
            job_name: "prop-worker-3".to_string(),
            queue_name: Some("gpu".to_string()),
            resources: QueueWorkerResources {
                number_of_threads: 2,
                number_of_gpus: 1,
                per_thread_memory_limit_gb: 4.0,
                wallclock_time_limit: "1-00:30:00".to_string(),
                ..Default::default()
            },
            setup_script_commands: vec!["source ~/.bashrc".to_string(), "conda activate md".to_string()],
            extra_script_options: vec!["--account=chem".to_string()],
        }
    }

    #[test]
    fn script_carries_resources_and_setup() {
        let script = render_script(&spec()).unwrap();
        assert!(script.starts_with("#!/bin/bash\n"));
        for expected in [
            "#SBATCH --job-name=prop-worker-3",
            "#SBATCH --partition=gpu",
            "#SBATCH --cpus-per-task=2",
            "#SBATCH --mem=8G",
            "#SBATCH --gres=gpu:1",
            "#SBATCH --time=24:30:00",
            "#SBATCH --account=chem",
            "conda activate md",
        ] {
            assert!(script.contains(expected), "missing {expected:?} in\n{script}");
        }
        let setup = script.find("source ~/.bashrc").unwrap();
        assert!(setup < script.find("sleep infinity").unwrap());
    }

    #[test]
    fn cpu_only_allocation_has_no_gres() {
        let mut spec = spec();
        spec.resources.number_of_gpus = 0;
        spec.queue_name = None;
        let script = render_script(&spec).unwrap();
        assert!(!script.contains("--gres"));
        assert!(!script.contains("--partition"));
    }

    #[test]
    fn parses_sbatch_output() {
        assert_eq!(parse_job_id("123456\n").unwrap(), "123456");
        assert_eq!(parse_job_id("98;cluster-a\n").unwrap(), "98");
        assert!(parse_job_id("sbatch: error: invalid partition").is_err());
    }

    #[test]
    fn maps_squeue_states() {
        assert_eq!(parse_state("PENDING\n"), AllocationState::Pending);
        assert_eq!(parse_state("RUNNING"), AllocationState::Running);
        assert_eq!(parse_state("PREEMPTED"), AllocationState::Preempted);
        assert_eq!(parse_state("TIMEOUT"), AllocationState::TimedOut);
        assert_eq!(parse_state(""), AllocationState::Completed);
        assert_eq!(
            parse_state("NODE_FAIL"),
            AllocationState::Failed("NODE_FAIL".to_string())
        );
    }
}
