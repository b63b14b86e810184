//! Progress sinks for stage transition events.
//!
//! The orchestrator receives a sink explicitly and reports every stage
//! transition to it exactly once. There is no global sink.

mod sink;

pub use sink::{
    ChannelProgressSink, CollectingProgressSink, LoggingProgressSink, NoOpProgressSink, ProgressSink,
};
