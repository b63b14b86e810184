//! Progress events emitted on stage transitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{StageName, StageState};

/// An event describing one stage transition within a run.
///
/// The orchestrator emits exactly one event per transition, so consumers
/// can treat each event as a state change rather than a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The event type (e.g., "stage.started", "stage.completed").
    #[serde(rename = "type")]
    pub event_type: String,

    /// The run this event belongs to.
    pub run_id: String,

    /// The stage that transitioned.
    pub stage: StageName,

    /// The state the stage entered.
    pub state: StageState,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// Additional payload data.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl ProgressEvent {
    fn new(event_type: &str, run_id: &str, stage: StageName, state: StageState) -> Self {
        Self {
            event_type: event_type.to_string(),
            run_id: run_id.to_string(),
            stage,
            state,
            timestamp: crate::utils::iso_timestamp(),
            data: HashMap::new(),
        }
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Creates a "stage.started" event.
    #[must_use]
    pub fn started(run_id: &str, stage: StageName) -> Self {
        Self::new("stage.started", run_id, stage, StageState::Running)
    }

    /// Creates a "stage.completed" event.
    #[must_use]
    pub fn completed(run_id: &str, stage: StageName, duration_ms: f64, failed_entities: usize) -> Self {
        Self::new("stage.completed", run_id, stage, StageState::Completed)
            .add_data("duration_ms", serde_json::json!(duration_ms))
            .add_data("failed_entities", serde_json::json!(failed_entities))
    }

    /// Creates a "stage.failed" event.
    #[must_use]
    pub fn failed(run_id: &str, stage: StageName, error: &str) -> Self {
        Self::new("stage.failed", run_id, stage, StageState::Failed)
            .add_data("error", serde_json::json!(error))
    }

    /// Creates a "stage.skipped" event.
    #[must_use]
    pub fn skipped(run_id: &str, stage: StageName) -> Self {
        Self::new("stage.skipped", run_id, stage, StageState::Skipped)
            .add_data("reason", serde_json::json!("completion sentinel present"))
    }
}
