//! Raw instrument output to per-project FASTQ.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fs;
use tracing::{info, warn};

use super::{sample_of, StageContext, StageOutcome, StageWork};
use crate::core::StageName;
use crate::errors::{Result, SeqflowError};
use crate::jobs::{run_array_job, JobScriptGenerator};
use crate::planner::discover_pairs;

/// Runs the configured converter as a one-task array job, then marks every
/// expected sample without a read pair as failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvertStage;

#[async_trait]
impl StageWork for ConvertStage {
    fn name(&self) -> StageName {
        StageName::Convert
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let config = &ctx.config;
        let stage_dir = ctx.stage_dir(self.name());
        fs::create_dir_all(&stage_dir)?;

        let converter = config.convert.select_converter(config.protocol)?;
        let resources = config.convert.resources.clone();
        let command = converter.command(&config.run_dir, &config.sample_sheet, &stage_dir, resources.cores);
        info!(converter = converter.name(), "Converting {}", config.run_dir.display());

        let job = JobScriptGenerator::new(self.name().dir_name(), resources, ctx.work_dir(self.name()))
            .with_input_prefix(&config.run_dir)
            .with_output(&stage_dir)
            .generate(&[command])?;
        let job_id = run_array_job(ctx.scheduler.as_ref(), &job, config.scheduler.poll_interval()).await?;

        let pairs = discover_pairs(&stage_dir)?;
        if pairs.is_empty() {
            return Err(SeqflowError::NoWork(stage_dir));
        }
        let converted: BTreeSet<String> = pairs.iter().map(sample_of).collect::<Result<_>>()?;

        let failed: Vec<String> = config
            .samples
            .iter()
            .filter(|s| !converted.contains(&s.sample_id))
            .map(|s| s.sample_id.clone())
            .collect();
        if !failed.is_empty() {
            warn!(count = failed.len(), "Samples produced no reads");
        }
        Ok(StageOutcome::ok().with_failed(failed).with_job_id(job_id))
    }
}
