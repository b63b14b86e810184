//! Resumable stage sequencing.
//!
//! The orchestrator runs the stages of one sequencing run in order. A stage
//! counts as done only when its directory holds the sentinel file, which is
//! written after the stage's work and its failure-ledger delta have both
//! succeeded. On restart, finished stages are skipped and the first partial
//! directory is deleted so the stage reruns from scratch.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::core::{ProgressEvent, StageName, StageState, SENTINEL_FILE};
use crate::errors::{ConfigError, Result, SeqflowError};
use crate::events::{NoOpProgressSink, ProgressSink};
use crate::jobs::Scheduler;
use crate::ledger::{FailureLedger, LedgerRow};
use crate::lims::LimsClient;
use crate::stages::{default_stages, StageContext, StageOutcome, StageWork};
use crate::utils::generate_run_id;

/// Ledger file name under the run root.
pub const LEDGER_FILE: &str = "sample_failures.json";

/// The sentinel path of `stage` under `run_root`.
#[must_use]
pub fn sentinel_path(run_root: &Path, stage: StageName) -> PathBuf {
    run_root.join(stage.dir_name()).join(SENTINEL_FILE)
}

/// Checks that no stage is marked complete after an incomplete one.
///
/// # Errors
///
/// Returns a [`ConfigError`] naming the first stage whose sentinel exists
/// while an earlier stage's does not.
pub fn check_sentinel_order(run_root: &Path, stages: &[StageName]) -> Result<(), ConfigError> {
    let mut first_missing: Option<StageName> = None;
    for &stage in stages {
        let done = sentinel_path(run_root, stage).is_file();
        match (done, first_missing) {
            (true, Some(missing)) => {
                return Err(ConfigError::new(format!(
                    "{stage} is marked complete but {missing} is not"
                ))
                .with_field(stage.dir_name())
                .with_fix_hint(format!(
                    "inspect {} and remove the stale sentinels before restarting",
                    run_root.display()
                )));
            }
            (false, None) => first_missing = Some(stage),
            _ => {}
        }
    }
    Ok(())
}

/// Computes the stages a restart may skip.
///
/// Scans `stages` in order: a stage whose sentinel exists is skippable. The
/// first stage without one ends the scan, and its directory, if any, is
/// deleted.
///
/// # Errors
///
/// Returns an error if a partial directory cannot be removed.
pub fn compute_skip_set(run_root: &Path, stages: &[StageName]) -> Result<BTreeSet<StageName>> {
    let mut skip = BTreeSet::new();
    for &stage in stages {
        if sentinel_path(run_root, stage).is_file() {
            skip.insert(stage);
            continue;
        }
        let dir = run_root.join(stage.dir_name());
        if dir.exists() {
            warn!(stage = %stage, "Removing partial stage directory {}", dir.display());
            fs::remove_dir_all(&dir)?;
        }
        break;
    }
    Ok(skip)
}

/// Outcome of one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    /// The run identifier.
    pub run_id: String,
    /// Final state of every stage.
    pub states: BTreeMap<StageName, StageState>,
    /// Stages skipped because an earlier invocation finished them.
    pub skipped: BTreeSet<StageName>,
    /// Stages finished by this invocation, in order.
    pub completed: Vec<StageName>,
    /// Every failed entity, sorted by id.
    pub failures: Vec<LedgerRow>,
}

impl RunResult {
    /// Returns true if every stage is completed or skipped.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.states.values().all(StageState::is_success)
    }
}

/// Sequences the stages of one run.
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    stages: Vec<Arc<dyn StageWork>>,
    scheduler: Arc<dyn Scheduler>,
    lims: Option<Arc<dyn LimsClient>>,
    sink: Arc<dyn ProgressSink>,
    run_id: String,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("run_id", &self.run_id)
            .field("run_root", &self.config.output_dir)
            .field("stages", &self.stage_names())
            .field("has_lims", &self.lims.is_some())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator running the assay's default stages.
    #[must_use]
    pub fn new(config: PipelineConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        let stages = default_stages(&config);
        Self {
            config: Arc::new(config),
            stages,
            scheduler,
            lims: None,
            sink: Arc::new(NoOpProgressSink),
            run_id: generate_run_id(),
        }
    }

    /// Replaces the stage implementations.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<Arc<dyn StageWork>>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the LIMS client.
    #[must_use]
    pub fn with_lims(mut self, lims: Arc<dyn LimsClient>) -> Self {
        self.lims = Some(lims);
        self
    }

    /// Sets the progress sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// The run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The ledger file of this run.
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.config.output_dir.join(LEDGER_FILE)
    }

    fn stage_names(&self) -> Vec<StageName> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    fn check_stage_list(&self) -> Result<Vec<StageName>, ConfigError> {
        let names = self.stage_names();
        if names.is_empty() {
            return Err(ConfigError::missing("stages"));
        }
        if names.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::new(format!(
                "stages must be unique and in pipeline order, got {names:?}"
            ))
            .with_field("stages"));
        }
        Ok(names)
    }

    /// Runs every stage not already finished.
    ///
    /// A stage error is not retried: it is reported to the sink and
    /// returned, leaving the stage without a sentinel. Re-invoke with
    /// `is_restart` set to resume.
    ///
    /// # Errors
    ///
    /// Returns a configuration error before touching the filesystem when the
    /// config is invalid, sentinels are out of order, or a fresh run finds
    /// existing stage directories. Otherwise returns the first stage error.
    pub async fn run(&self, is_restart: bool) -> Result<RunResult> {
        self.config.validate()?;
        let names = self.check_stage_list()?;
        let run_root = self.config.output_dir.clone();
        check_sentinel_order(&run_root, &names)?;

        let skipped = if is_restart {
            compute_skip_set(&run_root, &names)?
        } else {
            if let Some(existing) = names.iter().find(|s| run_root.join(s.dir_name()).exists()) {
                return Err(ConfigError::new(format!(
                    "{existing} already exists under {}",
                    run_root.display()
                ))
                .with_fix_hint("restart the run, or choose a new output directory")
                .into());
            }
            BTreeSet::new()
        };
        info!(
            run_id = %self.run_id,
            restart = is_restart,
            skipped = skipped.len(),
            "Starting run in {}",
            run_root.display()
        );

        fs::create_dir_all(&run_root)?;
        let ledger_path = self.ledger_path();
        let mut ledger = if is_restart {
            FailureLedger::open_or_create(&ledger_path, self.config.entities())?
        } else {
            FailureLedger::create(&ledger_path, self.config.entities())?
        };

        let ctx = StageContext {
            run_id: self.run_id.clone(),
            config: Arc::clone(&self.config),
            scheduler: Arc::clone(&self.scheduler),
            lims: self.lims.clone(),
            ledger_path,
        };

        let mut states: BTreeMap<StageName, StageState> =
            names.iter().map(|&s| (s, StageState::NotStarted)).collect();
        let mut completed = Vec::new();

        for stage in &self.stages {
            let name = stage.name();
            if skipped.contains(&name) {
                debug!(stage = %name, "Sentinel present; skipping");
                advance(&mut states, name, StageState::Skipped)?;
                self.sink.emit(ProgressEvent::skipped(&self.run_id, name)).await;
                continue;
            }

            let dir = ctx.stage_dir(name);
            if dir.exists() {
                warn!(stage = %name, "Removing stale stage directory {}", dir.display());
                fs::remove_dir_all(&dir)?;
            }

            advance(&mut states, name, StageState::Running)?;
            self.sink.emit(ProgressEvent::started(&self.run_id, name)).await;
            info!(stage = %name, "Stage started");
            let start = Instant::now();

            match self.execute(stage.as_ref(), &ctx, &mut ledger).await {
                Ok((outcome, newly_failed)) => {
                    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
                    advance(&mut states, name, StageState::Completed)?;
                    completed.push(name);
                    info!(
                        stage = %name,
                        duration_ms,
                        failed = outcome.failed_ids.len(),
                        newly_failed,
                        job_id = outcome.job_id.as_deref().unwrap_or("-"),
                        "Stage completed"
                    );
                    self.sink
                        .emit(ProgressEvent::completed(&self.run_id, name, duration_ms, newly_failed))
                        .await;
                }
                Err(err) => {
                    advance(&mut states, name, StageState::Failed)?;
                    error!(stage = %name, error = %err, "Stage failed; restart to resume");
                    self.sink
                        .emit(ProgressEvent::failed(&self.run_id, name, &err.to_string()))
                        .await;
                    return Err(err);
                }
            }
        }

        let failures = ledger.report();
        info!(
            run_id = %self.run_id,
            completed = completed.len(),
            failed_samples = failures.len(),
            "Run finished"
        );
        Ok(RunResult {
            run_id: self.run_id.clone(),
            states,
            skipped,
            completed,
            failures,
        })
    }

    /// Runs one stage, records its failures and writes its sentinel.
    async fn execute(
        &self,
        stage: &dyn StageWork,
        ctx: &StageContext,
        ledger: &mut FailureLedger,
    ) -> Result<(StageOutcome, usize)> {
        let name = stage.name();
        let outcome = stage.run(ctx).await?;
        let newly_failed = ledger.write(&outcome.failed_ids, name)?;

        let dir = ctx.stage_dir(name);
        fs::create_dir_all(&dir)?;
        fs::File::create(dir.join(SENTINEL_FILE))?;
        Ok((outcome, newly_failed))
    }
}

/// Moves `name` to `next`, rejecting changes the stage lifecycle forbids.
fn advance(states: &mut BTreeMap<StageName, StageState>, name: StageName, next: StageState) -> Result<()> {
    let current = states.get(&name).copied().unwrap_or(StageState::NotStarted);
    if !current.can_transition_to(next) {
        let reason = if current.is_terminal() {
            "stage already finished"
        } else {
            "illegal state change"
        };
        return Err(SeqflowError::stage(
            name.dir_name(),
            format!("{reason}: {current:?} -> {next:?}"),
        ));
    }
    states.insert(name, next);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssayKind;
    use crate::events::CollectingProgressSink;
    use crate::testing::{test_config, FakeScheduler, RecordingStage};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Harness {
        _tmp: TempDir,
        root: PathBuf,
        stages: Vec<Arc<RecordingStage>>,
        sink: Arc<CollectingProgressSink>,
    }

    impl Harness {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let root = tmp.path().join("run");
            let stages = StageName::ALL
                .into_iter()
                .map(|s| Arc::new(RecordingStage::new(s)))
                .collect();
            Self {
                _tmp: tmp,
                root,
                stages,
                sink: Arc::new(CollectingProgressSink::new()),
            }
        }

        fn with_stage(mut self, stage: RecordingStage) -> Self {
            let pos = self.stages.iter().position(|s| s.name() == stage.name()).unwrap();
            self.stages[pos] = Arc::new(stage);
            self
        }

        fn stage(&self, name: StageName) -> &RecordingStage {
            self.stages.iter().find(|s| s.name() == name).unwrap()
        }

        fn orchestrator(&self) -> Orchestrator {
            let config = test_config(&self.root, AssayKind::Metagenomic);
            let stages = self
                .stages
                .iter()
                .map(|s| Arc::clone(s) as Arc<dyn StageWork>)
                .collect();
            Orchestrator::new(config, Arc::new(FakeScheduler::new()))
                .with_stages(stages)
                .with_sink(self.sink.clone())
                .with_run_id("run-1")
        }

        fn mark_done(&self, stage: StageName) {
            let dir = self.root.join(stage.dir_name());
            fs::create_dir_all(&dir).unwrap();
            fs::File::create(dir.join(SENTINEL_FILE)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_fresh_run_completes_every_stage() {
        let h = Harness::new();
        let result = h.orchestrator().run(false).await.unwrap();

        assert!(result.is_success());
        assert!(result.skipped.is_empty());
        assert_eq!(result.completed, StageName::ALL.to_vec());
        for stage in StageName::ALL {
            assert!(sentinel_path(&h.root, stage).is_file());
            assert_eq!(h.stage(stage).calls(), 1);
        }
        assert_eq!(
            h.sink.types_for(StageName::Filter),
            vec!["stage.started".to_string(), "stage.completed".to_string()]
        );
        assert_eq!(h.sink.len(), 10);
    }

    #[tokio::test]
    async fn test_restart_skips_finished_and_clears_partial() {
        let h = Harness::new();
        h.mark_done(StageName::Convert);
        let partial = h.root.join(StageName::Filter.dir_name());
        fs::create_dir_all(&partial).unwrap();
        fs::write(partial.join("leftover.fastq"), "x").unwrap();

        let skip = compute_skip_set(&h.root, &StageName::ALL).unwrap();
        assert_eq!(skip, BTreeSet::from([StageName::Convert]));
        assert!(!partial.exists());

        fs::create_dir_all(&partial).unwrap();
        fs::write(partial.join("leftover.fastq"), "x").unwrap();
        let result = h.orchestrator().run(true).await.unwrap();

        assert_eq!(result.skipped, BTreeSet::from([StageName::Convert]));
        assert_eq!(result.states[&StageName::Convert], StageState::Skipped);
        assert_eq!(result.states[&StageName::Filter], StageState::Completed);
        assert_eq!(h.stage(StageName::Convert).calls(), 0);
        assert_eq!(h.stage(StageName::Filter).calls(), 1);
        assert!(!partial.join("leftover.fastq").exists());
        assert_eq!(
            h.sink.types_for(StageName::Convert),
            vec!["stage.skipped".to_string()]
        );
    }

    #[tokio::test]
    async fn test_out_of_order_sentinels_touch_nothing() {
        let h = Harness::new();
        h.mark_done(StageName::Convert);
        h.mark_done(StageName::Report);

        let err = h.orchestrator().run(true).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("FastQCJob"));
        assert!(sentinel_path(&h.root, StageName::Report).is_file());
        assert!(!h.root.join(LEDGER_FILE).exists());
        assert!(h.sink.is_empty());
    }

    #[tokio::test]
    async fn test_fresh_run_refuses_existing_output() {
        let h = Harness::new();
        fs::create_dir_all(h.root.join(StageName::Convert.dir_name())).unwrap();

        let err = h.orchestrator().run(false).await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(h.stage(StageName::Convert).calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_stage_leaves_no_sentinel_and_resumes() {
        let h = Harness::new();
        h.stage(StageName::Report).fail_with("fastqc exploded");

        let err = h.orchestrator().run(false).await.unwrap_err();
        assert!(matches!(
            err,
            crate::errors::SeqflowError::StageExecution { ref stage, .. } if stage == "FastQCJob"
        ));
        assert!(sentinel_path(&h.root, StageName::Filter).is_file());
        assert!(!sentinel_path(&h.root, StageName::Report).exists());
        assert_eq!(h.stage(StageName::GenPrep).calls(), 0);
        assert_eq!(
            h.sink.types_for(StageName::Report),
            vec!["stage.started".to_string(), "stage.failed".to_string()]
        );

        h.stage(StageName::Report).recover();
        let result = h.orchestrator().run(true).await.unwrap();
        assert_eq!(
            result.skipped,
            BTreeSet::from([StageName::Convert, StageName::Filter])
        );
        assert_eq!(result.completed.first(), Some(&StageName::Report));
        assert_eq!(h.stage(StageName::Convert).calls(), 1);
        assert_eq!(h.stage(StageName::Report).calls(), 2);
    }

    #[tokio::test]
    async fn test_ledger_keeps_earliest_failure_across_restart() {
        let h = Harness::new()
            .with_stage(RecordingStage::new(StageName::Convert).with_failed(&["s2"]))
            .with_stage(RecordingStage::new(StageName::Filter).with_failed(&["s2", "s5"]));
        h.stage(StageName::Report).fail_with("boom");
        assert!(h.orchestrator().run(false).await.is_err());

        h.stage(StageName::Report).recover();
        let result = h.orchestrator().run(true).await.unwrap();

        let failures: Vec<(String, String)> = result
            .failures
            .iter()
            .map(|r| (r.sample_id.clone(), r.failed_at.clone()))
            .collect();
        assert_eq!(
            failures,
            vec![
                ("s2".to_string(), "ConvertJob".to_string()),
                ("s5".to_string(), "NuQCJob".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_rejects_unordered_stage_list() {
        let h = Harness::new();
        let stages: Vec<Arc<dyn StageWork>> = vec![
            Arc::new(RecordingStage::new(StageName::Filter)),
            Arc::new(RecordingStage::new(StageName::Convert)),
        ];
        let err = h.orchestrator().with_stages(stages).run(false).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_submission_error_keeps_ledger_and_writes_no_sentinel() {
        let h = Harness::new();
        let scheduler = Arc::new(FakeScheduler::new());
        scheduler.fail_submissions("sbatch: error: Batch job submission failed");

        let orchestrator = Orchestrator::new(test_config(&h.root, AssayKind::Metagenomic), scheduler.clone())
            .with_sink(h.sink.clone());
        let err = orchestrator.run(false).await.unwrap_err();

        assert!(matches!(err, SeqflowError::Scheduler(_)));
        assert!(scheduler.labels().is_empty());
        assert!(!sentinel_path(&h.root, StageName::Convert).exists());
        let ledger = FailureLedger::open(orchestrator.ledger_path()).unwrap();
        assert!(ledger.report().is_empty());
        assert_eq!(h.sink.len(), 2);
    }

    #[test]
    fn test_advance_follows_stage_lifecycle() {
        let mut states = BTreeMap::from([(StageName::Convert, StageState::NotStarted)]);
        advance(&mut states, StageName::Convert, StageState::Running).unwrap();
        advance(&mut states, StageName::Convert, StageState::Completed).unwrap();
        assert_eq!(states[&StageName::Convert], StageState::Completed);

        let err = advance(&mut states, StageName::Convert, StageState::Running).unwrap_err();
        assert!(err.to_string().contains("stage already finished"));
        assert_eq!(states[&StageName::Convert], StageState::Completed);

        let mut fresh = BTreeMap::new();
        let err = advance(&mut fresh, StageName::Filter, StageState::Completed).unwrap_err();
        assert!(err.to_string().contains("illegal state change"));
        assert!(fresh.is_empty());
    }

    #[test]
    fn test_sentinel_order_allows_prefix() {
        let h = Harness::new();
        h.mark_done(StageName::Convert);
        h.mark_done(StageName::Filter);
        assert!(check_sentinel_order(&h.root, &StageName::ALL).is_ok());
    }
}
