//! Per-worker resource requests for queue allocations.

use crate::QueueError;
use prop_types::{ComputeResources, GpuToolkit};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What one queue allocation asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueWorkerResources {
    #[serde(default = "default_threads")]
    pub number_of_threads: u32,
    #[serde(default = "default_gpus")]
    pub number_of_gpus: u32,
    #[serde(default)]
    pub preferred_gpu_toolkit: GpuToolkit,
    #[serde(default = "default_memory")]
    pub per_thread_memory_limit_gb: f64,
    /// `HH:MM:SS` or `D-HH:MM:SS`.
    #[serde(default = "default_wallclock")]
    pub wallclock_time_limit: String,
}

fn default_threads() -> u32 {
    1
}

fn default_gpus() -> u32 {
    1
}

fn default_memory() -> f64 {
    4.0
}

fn default_wallclock() -> String {
    "48:00:00".to_string()
}

impl Default for QueueWorkerResources {
    fn default() -> Self {
        Self {
            number_of_threads: default_threads(),
            number_of_gpus: default_gpus(),
            preferred_gpu_toolkit: GpuToolkit::Cuda,
            per_thread_memory_limit_gb: default_memory(),
            wallclock_time_limit: default_wallclock(),
        }
    }
}

impl QueueWorkerResources {
    /// Resources an estimator sees on a slot backed by this allocation.
    pub fn compute_resources(&self) -> ComputeResources {
        ComputeResources {
            number_of_threads: self.number_of_threads,
            number_of_gpus: self.number_of_gpus,
            preferred_gpu_toolkit: (self.number_of_gpus > 0).then_some(self.preferred_gpu_toolkit),
        }
    }

    /// Total memory request in whole gigabytes, rounded up.
    pub fn total_memory_gb(&self) -> u64 {
        (self.per_thread_memory_limit_gb * f64::from(self.number_of_threads)).ceil() as u64
    }

    pub fn wallclock(&self) -> Result<Duration, QueueError> {
        parse_wallclock(&self.wallclock_time_limit)
    }
}

/// Parse a queue wall-clock limit (`MM:SS`, `HH:MM:SS` or `D-HH:MM:SS`).
pub fn parse_wallclock(raw: &str) -> Result<Duration, QueueError> {
    let invalid = || QueueError::InvalidResources(format!("invalid wall-clock limit: {raw:?}"));
    let (days, rest) = match raw.split_once('-') {
        Some((d, rest)) => (d.trim().parse::<u64>().map_err(|_| invalid())?, rest),
        None => (0, raw),
    };
    let parts = rest
        .split(':')
        .map(|p| p.trim().parse::<u64>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>, _>>()?;
    let (h, m, s) = match parts.as_slice() {
        [m, s] => (0, *m, *s),
        [h, m, s] => (*h, *m, *s),
        _ => return Err(invalid()),
    };
    if m >= 60 || s >= 60 {
        return Err(invalid());
    }
    let total = days
        .checked_mul(24)
        .and_then(|t| t.checked_add(h))
        .and_then(|t| t.checked_mul(60))
        .and_then(|t| t.checked_add(m))
        .and_then(|t| t.checked_mul(60))
        .and_then(|t| t.checked_add(s))
        .ok_or_else(invalid)?;
    if total == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(total))
}
