//! Array-job scripts and the batch scheduler they are submitted to.

mod scheduler;
mod script;

pub use scheduler::{
    parse_job_id, parse_sacct, run_array_job, wait_for_job, JobState, Scheduler, SlurmScheduler,
};
pub use script::{
    completion_marker, missing_tasks, JobResources, JobScript, JobScriptGenerator, ResourceScaling,
};
