//! Per-file quality reports over the run's final reads.

use async_trait::async_trait;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use super::{project_of, sample_of, StageContext, StageOutcome, StageWork};
use crate::core::StageName;
use crate::errors::{Result, SeqflowError};
use crate::jobs::{run_array_job, JobScriptGenerator};
use crate::planner::discover_pairs;
use crate::utils::naming::READ_EXTENSIONS;

/// One report task per kept pair; a pair whose reports are missing after
/// the job fails its sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportStage;

/// The archive the report tool writes for `read_file`.
#[must_use]
pub fn report_archive_name(read_file: &Path) -> String {
    let name = read_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = READ_EXTENSIONS
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .unwrap_or(&name);
    format!("{stem}_fastqc.zip")
}

#[async_trait]
impl StageWork for ReportStage {
    fn name(&self) -> StageName {
        StageName::Report
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let config = &ctx.config;
        let input = ctx.stage_dir(ctx.reads_stage());
        let stage_dir = ctx.stage_dir(self.name());
        fs::create_dir_all(&stage_dir)?;

        let pairs = discover_pairs(&input)?;
        if pairs.is_empty() {
            return Err(SeqflowError::NoWork(input));
        }

        let cores = config.report.resources.cores;
        let mut commands = Vec::with_capacity(pairs.len());
        let mut expected = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            let out_dir = stage_dir.join(project_of(pair, &input));
            commands.push(format!(
                "mkdir -p {out} && {} --noextract -t {cores} -o {out} {} {}",
                config.report.fastqc,
                pair.forward.display(),
                pair.reverse.display(),
                out = out_dir.display()
            ));
            expected.push((sample_of(pair)?, out_dir, pair));
        }

        let job = JobScriptGenerator::new(self.name().dir_name(), config.report.resources.clone(), ctx.work_dir(self.name()))
            .with_input_prefix(&input)
            .with_output(&stage_dir)
            .generate(&commands)?;
        let job_id = run_array_job(ctx.scheduler.as_ref(), &job, config.scheduler.poll_interval()).await?;

        let failed: Vec<String> = expected
            .into_iter()
            .filter(|(_, out_dir, pair)| {
                [&pair.forward, &pair.reverse]
                    .iter()
                    .any(|read| !out_dir.join(report_archive_name(read)).exists())
            })
            .map(|(sample, _, _)| sample)
            .collect();
        if !failed.is_empty() {
            warn!(count = failed.len(), "Quality reports missing");
        }
        info!(pairs = pairs.len(), "Quality reports finished");
        Ok(StageOutcome::ok().with_failed(failed).with_job_id(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_archive_name() {
        assert_eq!(
            report_archive_name(Path::new("/x/sA_S1_L001_R1_001.fastq.gz")),
            "sA_S1_L001_R1_001_fastqc.zip"
        );
        assert_eq!(report_archive_name(Path::new("b_R2.fq")), "b_R2_fastqc.zip");
    }
}
