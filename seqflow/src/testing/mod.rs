//! Testing utilities for seqflow runs.
//!
//! This module provides:
//! - An in-process fake scheduler
//! - A recording stage for orchestrator tests
//! - Read-file and configuration fixtures

mod fixtures;
mod mocks;

pub use fixtures::{test_config, write_filler, write_read_pair};
pub use mocks::{FakeScheduler, RecordingStage};
