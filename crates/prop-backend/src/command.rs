//! Estimator that runs an external program per task.
//!
//! Protocol: the task and slot are written as JSON to the program's stdin (and to `task.json` in
//! the working directory). On exit code 0 stdout must hold an estimate
//! (`{"value": .., "uncertainty": .., "iterations": ..}`); exit code 2 means the estimate did not
//! meet its acceptance criteria; anything else is a crash.

use async_trait::async_trait;
use prop_types::{ComputeTask, Estimate, EstimationError, Estimator, SlotContext};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

const UNCONVERGED_EXIT_CODE: i32 = 2;
const STDERR_TAIL: usize = 2000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEstimatorConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Launch as a job step inside the slot's allocation (`srun --jobid`).
    #[serde(default)]
    pub launch_with_srun: bool,
}

#[derive(Serialize)]
struct TaskEnvelope<'a> {
    task: &'a ComputeTask,
    slot: &'a SlotContext,
}

pub struct CommandEstimator {
    config: CommandEstimatorConfig,
}

impl CommandEstimator {
    pub fn new(config: CommandEstimatorConfig) -> Self {
        Self { config }
    }

    fn command(&self, slot: &SlotContext) -> Command {
        match (&slot.allocation_id, self.config.launch_with_srun) {
            (Some(job_id), true) => {
                let mut command = Command::new("srun");
                command
                    .arg(format!("--jobid={job_id}"))
                    .args(["--ntasks=1", "--overlap"])
                    .arg(&self.config.program)
                    .args(&self.config.args);
                command
            }
            _ => {
                let mut command = Command::new(&self.config.program);
                command.args(&self.config.args);
                command
            }
        }
    }
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[start..].to_string()
}

#[async_trait]
impl Estimator for CommandEstimator {
    async fn estimate(
        &self,
        task: &ComputeTask,
        slot: &SlotContext,
    ) -> Result<Estimate, EstimationError> {
        let crashed = |what: &str, e: &dyn std::fmt::Display| {
            EstimationError::Crashed(format!("{what}: {e}"))
        };
        let workdir = &task.working_directory;
        tokio::fs::create_dir_all(workdir)
            .await
            .map_err(|e| crashed("failed to create working directory", &e))?;
        let payload = serde_json::to_vec_pretty(&TaskEnvelope { task, slot })
            .map_err(|e| crashed("failed to encode task", &e))?;
        tokio::fs::write(workdir.join("task.json"), &payload)
            .await
            .map_err(|e| crashed("failed to write task.json", &e))?;

        let mut child = self
            .command(slot)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| crashed(&format!("failed to launch {}", self.config.program), &e))?;
        debug!(task_id = %task.task_id, program = %self.config.program, "estimator launched");

        let stdin = child.stdin.take();
        let feed = async {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&payload).await {
                    warn!(task_id = %task.task_id, error = %e, "estimator did not read its input");
                }
            }
        };
        // stdout is drained while the input is still being written
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| crashed("failed to wait for estimator", &e))?;

        match output.status.code() {
            Some(0) => {
                let estimate: Estimate = serde_json::from_slice(&output.stdout)
                    .map_err(|e| crashed("estimator printed an invalid estimate", &e))?;
                if let Ok(bytes) = serde_json::to_vec_pretty(&estimate) {
                    let _ = tokio::fs::write(workdir.join("estimate.json"), bytes).await;
                }
                Ok(estimate)
            }
            Some(UNCONVERGED_EXIT_CODE) => Err(EstimationError::Unconverged(tail(&output.stderr))),
            Some(code) => Err(EstimationError::Crashed(format!(
                "exit code {code}: {}",
                tail(&output.stderr)
            ))),
            None => Err(EstimationError::Crashed(
                "estimator terminated by signal".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prop_types::{ComputeResources, EstimationSchema, Priority, PropertyType, WorkItem};

    fn task(dir: &std::path::Path) -> ComputeTask {
        ComputeTask {
            task_id: "t1".to_string(),
            cache_key: "k1".to_string(),
            work_item: WorkItem {
                id: "mix-1".to_string(),
                property_type: PropertyType::EnthalpyOfMixing,
                parameters: serde_json::json!({"x": 0.5}),
                replicate: 1,
                force_field: "ff".to_string(),
                force_field_hash: "h".to_string(),
            },
            schema: EstimationSchema::default(),
            working_directory: dir.join("k1"),
            priority: Priority::Normal,
        }
    }

    fn slot() -> SlotContext {
        SlotContext {
            slot_id: "local-0".to_string(),
            allocation_id: None,
            resources: ComputeResources::default(),
        }
    }

    fn shell(script: &str) -> CommandEstimator {
        CommandEstimator::new(CommandEstimatorConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            launch_with_srun: false,
        })
    }

    #[tokio::test]
    async fn parses_estimate_from_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let estimator =
            shell(r#"cat > /dev/null; echo '{"value": -1.25, "uncertainty": 0.05, "iterations": 7}'"#);
        let estimate = estimator.estimate(&task(dir.path()), &slot()).await.unwrap();
        assert_eq!(estimate.value, -1.25);
        assert_eq!(estimate.iterations, 7);
        assert!(dir.path().join("k1").join("task.json").exists());
        assert!(dir.path().join("k1").join("estimate.json").exists());
    }

    #[tokio::test]
    async fn large_input_and_output_do_not_block_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let mut big = task(dir.path());
        big.work_item.parameters = serde_json::json!({"blob": "x".repeat(512 * 1024)});
        let estimator = shell(
            r#"head -c 262144 /dev/zero | tr '\000' ' '; cat > /dev/null; echo '{"value": 3.5, "uncertainty": 0.1, "iterations": 1}'"#,
        );
        let estimate = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            estimator.estimate(&big, &slot()),
        )
        .await
        .expect("estimator deadlocked on its pipes")
        .unwrap();
        assert_eq!(estimate.value, 3.5);
    }

    #[tokio::test]
    async fn exit_codes_map_to_failure_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let unconverged = shell("cat > /dev/null; echo 'target not met' >&2; exit 2")
            .estimate(&task(dir.path()), &slot())
            .await
            .unwrap_err();
        assert_eq!(
            unconverged,
            EstimationError::Unconverged("target not met".to_string())
        );

        let crashed = shell("cat > /dev/null; exit 9")
            .estimate(&task(dir.path()), &slot())
            .await
            .unwrap_err();
        assert!(matches!(crashed, EstimationError::Crashed(m) if m.starts_with("exit code 9")));
    }

    #[tokio::test]
    async fn garbage_output_is_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let err = shell("cat > /dev/null; echo not-json")
            .estimate(&task(dir.path()), &slot())
            .await
            .unwrap_err();
        assert!(matches!(err, EstimationError::Crashed(_)));
    }

    #[tokio::test]
    async fn missing_program_is_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let estimator = CommandEstimator::new(CommandEstimatorConfig {
            program: "/nonexistent/estimator".to_string(),
            args: vec![],
            launch_with_srun: false,
        });
        let err = estimator.estimate(&task(dir.path()), &slot()).await.unwrap_err();
        assert!(matches!(err, EstimationError::Crashed(m) if m.contains("failed to launch")));
    }

    #[test]
    fn srun_only_with_an_allocation() {
        let estimator = CommandEstimator::new(CommandEstimatorConfig {
            program: "estimate-property".to_string(),
            args: vec![],
            launch_with_srun: true,
        });
        let local = estimator.command(&slot());
        assert_eq!(local.as_std().get_program(), "estimate-property");

        let mut allocated = slot();
        allocated.allocation_id = Some("4242".to_string());
        let stepped = estimator.command(&allocated);
        assert_eq!(stepped.as_std().get_program(), "srun");
        let args: Vec<_> = stepped.as_std().get_args().collect();
        assert_eq!(args[0], "--jobid=4242");
    }
}
