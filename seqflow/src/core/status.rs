//! Stage identity and lifecycle state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ConfigError;

/// The stages of a sequencing run, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Raw instrument output to per-sample FASTQ.
    Convert,
    /// Adapter trimming, host filtering and demultiplexing.
    Filter,
    /// Per-file quality reports.
    Report,
    /// Sample-prep file generation.
    GenPrep,
    /// Artifact registration and the final failure report.
    PostProcess,
}

impl StageName {
    /// All stages in pipeline order.
    pub const ALL: [Self; 5] = [
        Self::Convert,
        Self::Filter,
        Self::Report,
        Self::GenPrep,
        Self::PostProcess,
    ];

    /// The stage's directory name under the run root.
    #[must_use]
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Convert => "ConvertJob",
            Self::Filter => "NuQCJob",
            Self::Report => "FastQCJob",
            Self::GenPrep => "GenPrepFileJob",
            Self::PostProcess => "PostProcessJob",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for StageName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.dir_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigError::new(format!("unknown stage '{s}'")))
    }
}

/// The execution state of a stage within one orchestrator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Not yet reached.
    NotStarted,
    /// Completed by an earlier invocation (sentinel present).
    Skipped,
    /// Currently running.
    Running,
    /// Completed in this invocation; sentinel written.
    Completed,
    /// Failed in this invocation; a restart may retry it.
    Failed,
}

impl Default for StageState {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Skipped => write!(f, "skipped"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl StageState {
    /// Returns true if the state cannot change again in this process.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Skipped | Self::Completed | Self::Failed)
    }

    /// Returns true if the stage's output can be consumed downstream.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Skipped | Self::Completed)
    }

    /// Returns true if `next` is a legal transition from this state.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Running | Self::Skipped)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let mut shuffled = vec![StageName::GenPrep, StageName::Convert, StageName::Report];
        shuffled.sort();
        assert_eq!(
            shuffled,
            vec![StageName::Convert, StageName::Report, StageName::GenPrep]
        );
    }

    #[test]
    fn test_stage_dir_names_round_trip() {
        for stage in StageName::ALL {
            assert_eq!(stage.dir_name().parse::<StageName>().unwrap(), stage);
        }
        assert!("nope".parse::<StageName>().is_err());
    }

    #[test]
    fn test_stage_state_transitions() {
        assert!(StageState::NotStarted.can_transition_to(StageState::Running));
        assert!(StageState::NotStarted.can_transition_to(StageState::Skipped));
        assert!(StageState::Running.can_transition_to(StageState::Failed));
        assert!(!StageState::Completed.can_transition_to(StageState::Running));
        assert!(!StageState::NotStarted.can_transition_to(StageState::Completed));
    }

    #[test]
    fn test_stage_state_is_terminal() {
        assert!(StageState::Completed.is_terminal());
        assert!(StageState::Failed.is_terminal());
        assert!(!StageState::Running.is_terminal());
        assert!(StageState::Skipped.is_success());
        assert!(!StageState::Failed.is_success());
    }

    #[test]
    fn test_stage_state_serialize() {
        let json = serde_json::to_string(&StageState::NotStarted).unwrap();
        assert_eq!(json, r#""not_started""#);
        let stage: StageName = serde_json::from_str(r#""gen_prep""#).unwrap();
        assert_eq!(stage, StageName::GenPrep);
    }
}
