//! # Seqflow
//!
//! Resumable orchestration of cluster-executed sequence-processing runs.
//!
//! A run converts raw instrument output to per-sample reads, filters them,
//! generates quality reports and prep files, and registers the results. Each
//! stage runs as a batch-scheduler array job and is complete only once its
//! sentinel file exists, so an interrupted run can be restarted and picks up
//! at the first unfinished stage.
//!
//! The pieces:
//!
//! - **Planning**: size-balanced bucketing of read pairs into array tasks
//! - **Demultiplexing**: sharded splitting of a tagged read stream per sample
//! - **Failure ledger**: the first stage each sample failed at, across restarts
//! - **Job scripts**: array-job scripts, task manifests and completion markers
//! - **Reorganizing**: the per-project output layout and zero-size quarantine
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use seqflow::prelude::*;
//!
//! let config = PipelineConfig::load(Path::new("run.json"))?;
//! let orchestrator = Orchestrator::new(config, Arc::new(SlurmScheduler::default()))
//!     .with_sink(Arc::new(LoggingProgressSink::default()));
//! let result = orchestrator.run(false).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod demux;
pub mod errors;
pub mod events;
pub mod jobs;
pub mod ledger;
pub mod lims;
pub mod orchestrator;
pub mod planner;
pub mod reorganize;
pub mod stages;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{AssayKind, PipelineConfig, ProtocolKind};
    pub use crate::core::{ProgressEvent, StageName, StageState, SENTINEL_FILE};
    pub use crate::demux::{demux, DemuxSummary, Demultiplexer, SampleMap};
    pub use crate::errors::{ConfigError, JobFailedError, NamingConventionError, SeqflowError};
    pub use crate::events::{
        CollectingProgressSink, LoggingProgressSink, NoOpProgressSink, ProgressSink,
    };
    pub use crate::jobs::{JobScriptGenerator, JobState, Scheduler, SlurmScheduler};
    pub use crate::ledger::FailureLedger;
    pub use crate::orchestrator::{Orchestrator, RunResult};
    pub use crate::planner::{plan, BucketPlan};
    pub use crate::reorganize::{reorganize, ProjectPlan};
    pub use crate::stages::{StageContext, StageOutcome, StageWork};
    pub use crate::utils::{generate_run_id, iso_timestamp};
}
