//! Stage work and the context it runs in.
//!
//! Each stage of a run is a [`StageWork`] implementation. The orchestrator
//! owns sequencing, sentinels and the failure ledger; a stage only produces
//! its output directory and reports which entities it failed.

mod convert;
mod filter;
mod genprep;
mod postprocess;
mod report;

pub use convert::ConvertStage;
pub use filter::{bucket_command, FilterStage};
pub use genprep::{GenPrepStage, PREP_SUFFIX};
pub use postprocess::{PostProcessStage, FAILED_REPORT_FILE};
pub use report::{report_archive_name, ReportStage};

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::core::StageName;
use crate::errors::Result;
use crate::jobs::Scheduler;
use crate::lims::LimsClient;
use crate::planner::ReadPair;
use crate::utils::naming::parse_read_path;

/// Directory under a stage directory holding scripts, manifests and logs.
pub const WORK_DIR: &str = "work";

/// What a stage reports back to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutcome {
    /// Entities that failed in this stage.
    pub failed_ids: Vec<String>,
    /// The scheduler job id, for stages that submit one.
    pub job_id: Option<String>,
}

impl StageOutcome {
    /// An outcome with no failures.
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// Sets the failed entities, sorted and deduplicated.
    #[must_use]
    pub fn with_failed(mut self, failed: impl IntoIterator<Item = String>) -> Self {
        let unique: BTreeSet<String> = failed.into_iter().collect();
        self.failed_ids = unique.into_iter().collect();
        self
    }

    /// Sets the job id.
    #[must_use]
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// One stage of a run.
#[async_trait]
pub trait StageWork: Send + Sync + Debug {
    /// Which stage this is.
    fn name(&self) -> StageName;

    /// Produces the stage's output directory.
    ///
    /// The directory does not exist when this is called. Returning `Ok`
    /// means every sub-step finished; per-entity failures go in the outcome.
    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome>;
}

/// Everything a stage needs from the run.
#[derive(Clone)]
pub struct StageContext {
    /// The run identifier.
    pub run_id: String,
    /// The validated configuration.
    pub config: Arc<PipelineConfig>,
    /// Where array jobs go.
    pub scheduler: Arc<dyn Scheduler>,
    /// The LIMS, when registration and metadata lookups are enabled.
    pub lims: Option<Arc<dyn LimsClient>>,
    /// The failure ledger file.
    pub ledger_path: PathBuf,
}

impl Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("run_id", &self.run_id)
            .field("run_root", &self.config.output_dir)
            .field("has_lims", &self.lims.is_some())
            .field("ledger_path", &self.ledger_path)
            .finish()
    }
}

impl StageContext {
    /// The run root.
    #[must_use]
    pub fn run_root(&self) -> &Path {
        &self.config.output_dir
    }

    /// The output directory of `stage`.
    #[must_use]
    pub fn stage_dir(&self, stage: StageName) -> PathBuf {
        self.run_root().join(stage.dir_name())
    }

    /// The scratch directory of `stage`.
    #[must_use]
    pub fn work_dir(&self, stage: StageName) -> PathBuf {
        self.stage_dir(stage).join(WORK_DIR)
    }

    /// The stage whose output holds the run's final reads.
    #[must_use]
    pub fn reads_stage(&self) -> StageName {
        if self.config.stages().contains(&StageName::Filter) {
            StageName::Filter
        } else {
            StageName::Convert
        }
    }
}

/// The stage implementations for `config`'s assay, in order.
#[must_use]
pub fn default_stages(config: &PipelineConfig) -> Vec<Arc<dyn StageWork>> {
    config
        .stages()
        .into_iter()
        .map(|stage| -> Arc<dyn StageWork> {
            match stage {
                StageName::Convert => Arc::new(ConvertStage),
                StageName::Filter => Arc::new(FilterStage),
                StageName::Report => Arc::new(ReportStage),
                StageName::GenPrep => Arc::new(GenPrepStage),
                StageName::PostProcess => Arc::new(PostProcessStage),
            }
        })
        .collect()
}

/// The project a pair belongs to: the first directory under `root`.
pub(crate) fn project_of(pair: &ReadPair, root: &Path) -> String {
    pair.forward
        .strip_prefix(root)
        .ok()
        .and_then(|rel| rel.components().next())
        .map_or_else(
            || pair.project.clone(),
            |c| c.as_os_str().to_string_lossy().into_owned(),
        )
}

/// The sample id encoded in a pair's forward file name.
pub(crate) fn sample_of(pair: &ReadPair) -> Result<String> {
    Ok(parse_read_path(&pair.forward)?.sample_id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_dedups_failures() {
        let outcome = StageOutcome::ok()
            .with_failed(["b".to_string(), "a".to_string(), "b".to_string()])
            .with_job_id("42");
        assert_eq!(outcome.failed_ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(outcome.job_id.as_deref(), Some("42"));
    }

    #[test]
    fn test_project_of_uses_first_component() {
        let pair = ReadPair {
            forward: PathBuf::from("/run/NuQCJob/proj1/filtered_sequences/a_R1.fastq.gz"),
            reverse: PathBuf::from("/run/NuQCJob/proj1/filtered_sequences/a_R2.fastq.gz"),
            project: "filtered_sequences".to_string(),
            size_bytes: 0,
        };
        assert_eq!(project_of(&pair, Path::new("/run/NuQCJob")), "proj1");
        assert_eq!(project_of(&pair, Path::new("/elsewhere")), "filtered_sequences");
        assert_eq!(sample_of(&pair).unwrap(), "a");
    }
}
