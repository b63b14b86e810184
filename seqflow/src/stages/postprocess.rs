//! Artifact registration and the run's failure report.

use async_trait::async_trait;
use serde_json::json;
use std::fs;
use std::io::BufWriter;
use std::path::PathBuf;
use tracing::info;

use super::{StageContext, StageOutcome, StageWork, PREP_SUFFIX};
use crate::core::StageName;
use crate::errors::Result;
use crate::ledger::{write_report_tsv, FailureLedger};
use crate::lims::{md5_file, register_artifact};

/// Failure report file name under the stage directory.
pub const FAILED_REPORT_FILE: &str = "failed_samples.tsv";

/// Registers every prep file with the LIMS (when configured) and renders
/// the failure ledger.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostProcessStage;

fn prep_files(ctx: &StageContext) -> Vec<(String, PathBuf)> {
    let genprep = ctx.stage_dir(StageName::GenPrep);
    ctx.config
        .projects
        .iter()
        .map(|plan| {
            let path = genprep
                .join(&plan.name)
                .join(format!("{}{PREP_SUFFIX}", plan.name));
            (plan.name.clone(), path)
        })
        .filter(|(_, path)| path.is_file())
        .collect()
}

#[async_trait]
impl StageWork for PostProcessStage {
    fn name(&self) -> StageName {
        StageName::PostProcess
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let stage_dir = ctx.stage_dir(self.name());
        fs::create_dir_all(&stage_dir)?;

        let mut artifacts = Vec::new();
        for (project, path) in prep_files(ctx) {
            let md5 = md5_file(&path)?;
            if let Some(lims) = &ctx.lims {
                register_artifact(lims.as_ref(), &ctx.run_id, &project, &path).await?;
            }
            artifacts.push(json!({
                "project": project,
                "path": path.display().to_string(),
                "md5": md5,
                "registered": ctx.lims.is_some(),
            }));
        }
        let artifact_count = artifacts.len();

        let ledger = FailureLedger::open(&ctx.ledger_path)?;
        let rows = ledger.report();
        let report_path = stage_dir.join(FAILED_REPORT_FILE);
        write_report_tsv(&rows, BufWriter::new(fs::File::create(&report_path)?))?;

        let summary = json!({
            "run_id": ctx.run_id,
            "artifacts": artifacts,
            "failed_samples": rows.len(),
        });
        fs::write(stage_dir.join("run_summary.json"), serde_json::to_vec_pretty(&summary)?)?;

        info!(
            artifacts = artifact_count,
            failed_samples = rows.len(),
            registered = ctx.lims.is_some(),
            "Wrote failure report {}",
            report_path.display()
        );
        Ok(StageOutcome::ok())
    }
}
