//! Error types for seqflow.
//!
//! The taxonomy follows how a run can go wrong: configuration problems are
//! caught before anything is submitted, naming-convention violations abort the
//! file or record being processed, and job failures abort the current stage
//! while leaving the run resumable.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for seqflow operations.
#[derive(Debug, Error)]
pub enum SeqflowError {
    /// Invalid or missing configuration, detected before any job submission.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A file or read name did not follow the expected naming convention.
    #[error("{0}")]
    Naming(#[from] NamingConventionError),

    /// An array job did not complete every task.
    #[error("{0}")]
    JobFailed(#[from] JobFailedError),

    /// The planner found nothing to dispatch.
    #[error("No paired read files found under {}", .0.display())]
    NoWork(PathBuf),

    /// Submitting to or polling the batch scheduler failed.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// A stage's work function failed.
    #[error("Stage '{stage}' failed: {message}")]
    StageExecution {
        /// The stage name.
        stage: String,
        /// What went wrong.
        message: String,
    },

    /// The LIMS collaborator returned an error.
    #[error("LIMS error: {0}")]
    Lims(String),

    /// A FASTQ record could not be parsed.
    #[error("FASTQ parse error: {0}")]
    Fastq(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SeqflowError {
    /// Creates a stage execution error.
    #[must_use]
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StageExecution {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Returns true for errors that must stop the run before any submission.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::NoWork(_))
    }
}

impl From<seq_io::fastq::Error> for SeqflowError {
    fn from(err: seq_io::fastq::Error) -> Self {
        Self::Fastq(err.to_string())
    }
}

/// Error raised when the run configuration is invalid.
#[derive(Debug, Clone, Error)]
#[error("Configuration error: {message}")]
pub struct ConfigError {
    /// The error message.
    pub message: String,
    /// The offending field, dotted (e.g. `filter.bucket_count`).
    pub field: Option<String>,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
            fix_hint: None,
        }
    }

    /// Creates an error for a required field that is missing or empty.
    #[must_use]
    pub fn missing(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            message: format!("required field '{field}' is missing or empty"),
            field: Some(field),
            fix_hint: None,
        }
    }

    /// Sets the offending field.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

/// Error raised when a file or read name cannot be interpreted.
#[derive(Debug, Clone, Error)]
#[error("Naming convention violated by '{name}': {reason}")]
pub struct NamingConventionError {
    /// The file name or read header at fault.
    pub name: String,
    /// Why it was rejected.
    pub reason: String,
}

impl NamingConventionError {
    /// Creates a new naming convention error.
    #[must_use]
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Error raised when an array job finishes with tasks that never reported
/// completion.
#[derive(Debug, Clone, Error)]
#[error("Job '{label}' ({job_id}) finished with missing tasks: {missing:?}")]
pub struct JobFailedError {
    /// The job label.
    pub label: String,
    /// The scheduler's job id.
    pub job_id: String,
    /// Array indices without a completion marker.
    pub missing: Vec<usize>,
}

impl JobFailedError {
    /// Creates a new job failure error.
    #[must_use]
    pub fn new(label: impl Into<String>, job_id: impl Into<String>, missing: Vec<usize>) -> Self {
        Self {
            label: label.into(),
            job_id: job_id.into(),
            missing,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = SeqflowError> = std::result::Result<T, E>;
