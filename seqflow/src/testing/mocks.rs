//! Hand-written fakes for the scheduler and stage seams.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs;

use crate::core::StageName;
use crate::errors::{Result, SeqflowError};
use crate::jobs::{completion_marker, JobScript, JobState, Scheduler};
use crate::stages::{StageContext, StageOutcome, StageWork};

type TaskHandler = dyn Fn(&JobScript, usize, &str) -> bool + Send + Sync;

/// A scheduler that runs array tasks in-process.
///
/// On submission every task's command is handed to the handler together
/// with its 1-based index; a task whose handler returns true gets its
/// completion marker. Polls drain any queued states first and then report
/// `final_state`.
pub struct FakeScheduler {
    handler: Box<TaskHandler>,
    submissions: Mutex<Vec<JobScript>>,
    queued_states: Mutex<VecDeque<JobState>>,
    final_state: Mutex<JobState>,
    submit_error: Mutex<Option<String>>,
    polls: Mutex<usize>,
}

impl std::fmt::Debug for FakeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeScheduler")
            .field("submissions", &self.submissions.lock().len())
            .field("final_state", &*self.final_state.lock())
            .finish_non_exhaustive()
    }
}

impl Default for FakeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeScheduler {
    /// A scheduler whose tasks all succeed without doing anything.
    #[must_use]
    pub fn new() -> Self {
        Self::with_handler(|_, _, _| true)
    }

    /// A scheduler that runs `handler` for every task.
    #[must_use]
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&JobScript, usize, &str) -> bool + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            submissions: Mutex::new(Vec::new()),
            queued_states: Mutex::new(VecDeque::new()),
            final_state: Mutex::new(JobState::Completed),
            submit_error: Mutex::new(None),
            polls: Mutex::new(0),
        }
    }

    /// Sets the state reported for every job.
    pub fn set_final_state(&self, state: JobState) {
        *self.final_state.lock() = state;
    }

    /// Queues states reported by the next polls, before `final_state`.
    pub fn queue_states(&self, states: impl IntoIterator<Item = JobState>) {
        self.queued_states.lock().extend(states);
    }

    /// Number of state polls answered.
    #[must_use]
    pub fn polls(&self) -> usize {
        *self.polls.lock()
    }

    /// Makes every later submission fail with `message`.
    pub fn fail_submissions(&self, message: impl Into<String>) {
        *self.submit_error.lock() = Some(message.into());
    }

    /// Jobs submitted so far.
    #[must_use]
    pub fn submissions(&self) -> Vec<JobScript> {
        self.submissions.lock().clone()
    }

    /// Labels of the jobs submitted so far, in order.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.submissions.lock().iter().map(|j| j.label.clone()).collect()
    }
}

#[async_trait]
impl Scheduler for FakeScheduler {
    async fn submit(&self, job: &JobScript) -> Result<String> {
        if let Some(message) = self.submit_error.lock().clone() {
            return Err(SeqflowError::Scheduler(message));
        }
        let commands = fs::read_to_string(&job.task_manifest)?;
        for (pos, command) in commands.lines().enumerate() {
            let index = pos + 1;
            if (self.handler)(job, index, command) {
                fs::write(completion_marker(&job.log_dir, &job.label, index), "")?;
            }
        }
        let mut submissions = self.submissions.lock();
        submissions.push(job.clone());
        Ok(format!("fake-{}", submissions.len()))
    }

    async fn state(&self, _job_id: &str) -> Result<JobState> {
        *self.polls.lock() += 1;
        if let Some(state) = self.queued_states.lock().pop_front() {
            return Ok(state);
        }
        Ok(self.final_state.lock().clone())
    }

    async fn cancel(&self, _job_id: &str) -> Result<()> {
        Ok(())
    }
}

/// A stage that records its calls and writes a placeholder output.
#[derive(Debug)]
pub struct RecordingStage {
    name: StageName,
    calls: Mutex<usize>,
    failed_ids: Vec<String>,
    error: Mutex<Option<String>>,
}

impl RecordingStage {
    /// A stage that succeeds with no failures.
    #[must_use]
    pub fn new(name: StageName) -> Self {
        Self {
            name,
            calls: Mutex::new(0),
            failed_ids: Vec::new(),
            error: Mutex::new(None),
        }
    }

    /// Reports `ids` as failed entities.
    #[must_use]
    pub fn with_failed(mut self, ids: &[&str]) -> Self {
        self.failed_ids = ids.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Makes the next runs fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.error.lock() = Some(message.into());
    }

    /// Lets the stage succeed again.
    pub fn recover(&self) {
        *self.error.lock() = None;
    }

    /// Number of times the stage ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl StageWork for RecordingStage {
    fn name(&self) -> StageName {
        self.name
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome> {
        *self.calls.lock() += 1;
        let dir = ctx.stage_dir(self.name);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("output.txt"), self.name.dir_name())?;

        if let Some(message) = self.error.lock().clone() {
            return Err(SeqflowError::stage(self.name.dir_name(), message));
        }
        Ok(StageOutcome::ok().with_failed(self.failed_ids.clone()))
    }
}
