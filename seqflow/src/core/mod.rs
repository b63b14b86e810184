//! Core domain model types for seqflow.
//!
//! - Stage names and lifecycle states
//! - Progress events emitted on stage transitions

mod event;
mod status;

pub use event::ProgressEvent;
pub use status::{StageName, StageState};

/// Name of the empty marker file whose presence denotes a completed stage.
pub const SENTINEL_FILE: &str = "job_completed";
