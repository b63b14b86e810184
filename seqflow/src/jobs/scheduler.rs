//! Batch scheduler seam and the SLURM implementation.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::script::{missing_tasks, JobScript};
use crate::errors::{JobFailedError, Result, SeqflowError};

static JOB_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)").expect("static regex is valid"));

/// Aggregate state of a submitted array job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for resources.
    Pending,
    /// At least one task is running.
    Running,
    /// Every task finished successfully.
    Completed,
    /// At least one task failed.
    Failed,
    /// The job was cancelled.
    Cancelled,
    /// At least one task hit its wall-time limit.
    Timeout,
}

impl JobState {
    /// Returns true once no task will run again.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    fn from_slurm(state: &str) -> Self {
        // sacct prints e.g. "CANCELLED by 1234"
        let head = state.split_whitespace().next().unwrap_or_default();
        match head {
            "PENDING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "RESV_DEL_HOLD" | "SUSPENDED" => {
                Self::Pending
            }
            "RUNNING" | "COMPLETING" | "CONFIGURING" | "RESIZING" | "SIGNALING" | "STAGE_OUT" | "STOPPED" => {
                Self::Running
            }
            "COMPLETED" => Self::Completed,
            "CANCELLED" => Self::Cancelled,
            "TIMEOUT" | "DEADLINE" => Self::Timeout,
            // node, memory and boot failures included
            _ => Self::Failed,
        }
    }

    /// Folds per-task states into one job state.
    #[must_use]
    pub fn aggregate(states: &[Self]) -> Self {
        if states.is_empty() {
            return Self::Pending;
        }
        if states.contains(&Self::Running) {
            return Self::Running;
        }
        if states.contains(&Self::Pending) {
            return Self::Pending;
        }
        for terminal in [Self::Failed, Self::Timeout, Self::Cancelled] {
            if states.contains(&terminal) {
                return terminal;
            }
        }
        Self::Completed
    }
}

/// An external batch scheduler.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Submits an array job and returns the scheduler's job id.
    async fn submit(&self, job: &JobScript) -> Result<String>;

    /// Reports the aggregate state of a job.
    async fn state(&self, job_id: &str) -> Result<JobState>;

    /// Cancels a job.
    async fn cancel(&self, job_id: &str) -> Result<()>;
}

/// SLURM via `sbatch`, `sacct` and `scancel`.
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    sbatch: String,
    sacct: String,
    scancel: String,
}

impl Default for SlurmScheduler {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            sacct: "sacct".to_string(),
            scancel: "scancel".to_string(),
        }
    }
}

impl SlurmScheduler {
    /// Creates a scheduler using the binaries on `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the `sbatch` binary.
    #[must_use]
    pub fn with_sbatch(mut self, path: impl Into<String>) -> Self {
        self.sbatch = path.into();
        self
    }

    /// Overrides the `sacct` binary.
    #[must_use]
    pub fn with_sacct(mut self, path: impl Into<String>) -> Self {
        self.sacct = path.into();
        self
    }

    async fn capture(program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| SeqflowError::Scheduler(format!("could not run {program}: {e}")))?;
        if !output.status.success() {
            return Err(SeqflowError::Scheduler(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Extracts the job id from `sbatch --parsable` output (`id[;cluster]`).
///
/// # Errors
///
/// Returns an error if the output does not start with a number.
pub fn parse_job_id(output: &str) -> Result<String> {
    JOB_ID
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| SeqflowError::Scheduler(format!("unexpected sbatch output: {}", output.trim())))
}

/// Folds `sacct --parsable2 --noheader --format=JobID,State` output,
/// ignoring job steps.
#[must_use]
pub fn parse_sacct(output: &str) -> JobState {
    let states: Vec<JobState> = output
        .lines()
        .filter_map(|line| line.split_once('|'))
        .filter(|(id, _)| !id.contains('.'))
        .map(|(_, state)| JobState::from_slurm(state.trim()))
        .collect();
    JobState::aggregate(&states)
}

#[async_trait]
impl Scheduler for SlurmScheduler {
    async fn submit(&self, job: &JobScript) -> Result<String> {
        let array = job.array_spec();
        let script = job.script_path.display().to_string();
        let stdout = Self::capture(&self.sbatch, &["--parsable", "--array", &array, &script]).await?;
        let job_id = parse_job_id(&stdout)?;
        info!(label = %job.label, job_id = %job_id, array = %array, "Submitted array job");
        Ok(job_id)
    }

    async fn state(&self, job_id: &str) -> Result<JobState> {
        let stdout = Self::capture(
            &self.sacct,
            &["-j", job_id, "--noheader", "--parsable2", "--format=JobID,State"],
        )
        .await?;
        Ok(parse_sacct(&stdout))
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        Self::capture(&self.scancel, &[job_id]).await?;
        warn!(job_id = %job_id, "Cancelled job");
        Ok(())
    }
}

/// Polls until the job finishes and returns its final state.
///
/// # Errors
///
/// Returns an error if polling fails.
pub async fn wait_for_job(scheduler: &dyn Scheduler, job_id: &str, poll_interval: Duration) -> Result<JobState> {
    loop {
        let state = scheduler.state(job_id).await?;
        if state.is_finished() {
            debug!(job_id = %job_id, state = ?state, "Job finished");
            return Ok(state);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Submits `job`, waits for it and audits its completion markers.
///
/// The markers are authoritative: a job the scheduler reports as failed
/// whose tasks all left a marker is accepted.
///
/// # Errors
///
/// Returns [`JobFailedError`] when any task left no marker, or a scheduler
/// error if submission or polling fails.
pub async fn run_array_job(scheduler: &dyn Scheduler, job: &JobScript, poll_interval: Duration) -> Result<String> {
    let job_id = scheduler.submit(job).await?;
    let state = wait_for_job(scheduler, &job_id, poll_interval).await?;

    let missing = missing_tasks(&job.log_dir, &job.label, job.array_size);
    if !missing.is_empty() {
        return Err(JobFailedError::new(&job.label, &job_id, missing).into());
    }
    if state != JobState::Completed {
        warn!(
            label = %job.label,
            job_id = %job_id,
            state = ?state,
            "Scheduler reported a non-completed state but every task left a marker"
        );
    }
    Ok(job_id)
}
