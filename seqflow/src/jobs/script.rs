//! Cluster submission script rendering.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::{ConfigError, Result};

/// Per-task resource request for an array job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResources {
    /// Partition/queue name.
    pub queue: String,
    /// Nodes per task.
    #[serde(default = "default_nodes")]
    pub nodes: u32,
    /// Cores per task.
    #[serde(default = "default_cores")]
    pub cores: u32,
    /// Memory per task in MiB.
    pub memory_mb: u64,
    /// Wall-clock limit per task in minutes.
    pub wall_time_minutes: u64,
    /// Maximum concurrently running tasks.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_nodes() -> u32 {
    1
}

fn default_cores() -> u32 {
    1
}

fn default_pool_size() -> usize {
    30
}

impl JobResources {
    /// Creates a resource request with one node, one core and a pool of 30.
    #[must_use]
    pub fn new(queue: impl Into<String>, memory_mb: u64, wall_time_minutes: u64) -> Self {
        Self {
            queue: queue.into(),
            nodes: default_nodes(),
            cores: default_cores(),
            memory_mb,
            wall_time_minutes,
            pool_size: default_pool_size(),
        }
    }

    /// Sets the core count.
    #[must_use]
    pub fn with_cores(mut self, cores: u32) -> Self {
        self.cores = cores;
        self
    }

    /// Sets the pool size.
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Checks every field, naming offenders as `<section>.<field>`.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty queue or a zero count.
    pub fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.queue.trim().is_empty() {
            return Err(ConfigError::missing(format!("{section}.queue")));
        }
        let counts = [
            ("nodes", u64::from(self.nodes)),
            ("cores", u64::from(self.cores)),
            ("memory_mb", self.memory_mb),
            ("wall_time_minutes", self.wall_time_minutes),
            ("pool_size", self.pool_size as u64),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(ConfigError::new(format!("{section}.{name} must be at least 1"))
                    .with_field(format!("{section}.{name}")));
            }
        }
        Ok(())
    }

    /// Grows memory and wall time in proportion to the largest bucket.
    #[must_use]
    pub fn scaled_for(&self, max_bucket_bytes: u64, scaling: &ResourceScaling) -> Self {
        let gib = max_bucket_bytes as f64 / f64::from(1u32 << 30);
        let mut scaled = self.clone();
        scaled.memory_mb += (gib * scaling.memory_mb_per_gb).ceil() as u64;
        scaled.wall_time_minutes += (gib * scaling.minutes_per_gb).ceil() as u64;
        scaled
    }

    /// Wall time as `H:MM:SS`.
    #[must_use]
    pub fn wall_time(&self) -> String {
        format!("{}:{:02}:00", self.wall_time_minutes / 60, self.wall_time_minutes % 60)
    }
}

/// Extra resources per GiB of the largest bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceScaling {
    /// Additional MiB of memory per GiB of input.
    #[serde(default)]
    pub memory_mb_per_gb: f64,
    /// Additional minutes per GiB of input.
    #[serde(default)]
    pub minutes_per_gb: f64,
}

/// A rendered, on-disk array job ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobScript {
    /// Job label, also the completion-marker prefix.
    pub label: String,
    /// The submission script.
    pub script_path: PathBuf,
    /// One command per array task, line N for task N.
    pub task_manifest: PathBuf,
    /// Directory receiving task logs and completion markers.
    pub log_dir: PathBuf,
    /// Number of array tasks.
    pub array_size: usize,
    /// Maximum concurrently running tasks.
    pub pool_size: usize,
}

impl JobScript {
    /// The `--array` specification, `1-N%pool`.
    #[must_use]
    pub fn array_spec(&self) -> String {
        format!("1-{}%{}", self.array_size, self.pool_size)
    }
}

/// Wraps `value` in single quotes so the shell takes it literally.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Path of the marker task `index` writes on success.
#[must_use]
pub fn completion_marker(log_dir: &Path, label: &str, index: usize) -> PathBuf {
    log_dir.join(format!("{label}_{index}.completed"))
}

/// Indices in `1..=array_size` without a completion marker.
#[must_use]
pub fn missing_tasks(log_dir: &Path, label: &str, array_size: usize) -> Vec<usize> {
    (1..=array_size)
        .filter(|index| !completion_marker(log_dir, label, *index).exists())
        .collect()
}

/// Renders array-job scripts and their task manifests.
#[derive(Debug, Clone)]
pub struct JobScriptGenerator {
    label: String,
    resources: JobResources,
    work_dir: PathBuf,
    env: BTreeMap<String, String>,
}

impl JobScriptGenerator {
    /// Creates a generator writing under `work_dir`.
    #[must_use]
    pub fn new(label: impl Into<String>, resources: JobResources, work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        let mut env = BTreeMap::new();
        env.insert("TMPDIR".to_string(), work_dir.join("tmp").display().to_string());
        Self {
            label: label.into(),
            resources,
            work_dir,
            env,
        }
    }

    /// Sets an exported environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets `INPUT_PREFIX`.
    #[must_use]
    pub fn with_input_prefix(self, prefix: &Path) -> Self {
        self.with_env("INPUT_PREFIX", prefix.display().to_string())
    }

    /// Sets `OUTPUT`.
    #[must_use]
    pub fn with_output(self, output: &Path) -> Self {
        self.with_env("OUTPUT", output.display().to_string())
    }

    /// The resources requested per task.
    #[must_use]
    pub fn resources(&self) -> &JobResources {
        &self.resources
    }

    /// The log directory.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.work_dir.join("logs")
    }

    /// Renders the script text for a task manifest at `task_manifest`.
    #[must_use]
    pub fn render(&self, task_manifest: &Path) -> String {
        let r = &self.resources;
        let log_dir = self.log_dir();
        let label = &self.label;

        let mut script = String::from("#!/bin/bash -l\n");
        let _ = writeln!(script, "#SBATCH -J {label}");
        let _ = writeln!(script, "#SBATCH -p {}", r.queue);
        let _ = writeln!(script, "#SBATCH -N {}", r.nodes);
        let _ = writeln!(script, "#SBATCH -n {}", r.cores);
        let _ = writeln!(script, "#SBATCH --time {}", r.wall_time());
        let _ = writeln!(script, "#SBATCH --mem {}M", r.memory_mb);
        let _ = writeln!(script, "#SBATCH --output {}/{label}_%A_%a.out", log_dir.display());
        let _ = writeln!(script, "#SBATCH --error {}/{label}_%A_%a.err", log_dir.display());
        script.push_str("\nset -euo pipefail\n\n");
        for (key, value) in &self.env {
            let _ = writeln!(script, "export {key}={}", shell_quote(value));
        }
        script.push_str("mkdir -p \"${TMPDIR}\"\n\n");
        let _ = writeln!(
            script,
            "cmd=$(sed -n \"${{SLURM_ARRAY_TASK_ID}}p\" {})",
            task_manifest.display()
        );
        script.push_str("bash -c \"${cmd}\"\n\n");
        let _ = writeln!(
            script,
            "touch {}/{label}_${{SLURM_ARRAY_TASK_ID}}.completed",
            log_dir.display()
        );
        script
    }

    /// Writes the task manifest and script for `commands`, one task each.
    ///
    /// # Errors
    ///
    /// Returns an error if `commands` is empty, a command spans lines, or a
    /// file cannot be written.
    pub fn generate(&self, commands: &[String]) -> Result<JobScript> {
        if commands.is_empty() {
            return Err(ConfigError::new(format!("job '{}' has no tasks", self.label)).into());
        }
        if let Some(bad) = commands.iter().position(|c| c.contains('\n')) {
            return Err(ConfigError::new(format!(
                "job '{}' task {} spans multiple lines",
                self.label,
                bad + 1
            ))
            .into());
        }

        let log_dir = self.log_dir();
        fs::create_dir_all(&log_dir)?;

        let task_manifest = self.work_dir.join(format!("{}.commands", self.label));
        let mut writer = BufWriter::new(fs::File::create(&task_manifest)?);
        for command in commands {
            writeln!(writer, "{command}")?;
        }
        writer.flush()?;

        let script_path = self.work_dir.join(format!("{}.sbatch", self.label));
        fs::write(&script_path, self.render(&task_manifest))?;

        debug!(
            label = %self.label,
            tasks = commands.len(),
            "Wrote job script {}",
            script_path.display()
        );
        Ok(JobScript {
            label: self.label.clone(),
            script_path,
            task_manifest,
            log_dir,
            array_size: commands.len(),
            pool_size: self.resources.pool_size,
        })
    }
}
