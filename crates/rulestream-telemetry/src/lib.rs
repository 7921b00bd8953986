//! Rulestream Telemetry
//!
//! Structured outcome events and metrics for the rules engine.
//!
//! Provides:
//! - Outcome events for matched, enforced, skipped and failed rules
//! - Outcome sinks: tracing, live broadcast bus, metrics
//! - Performance and outcome counters

pub mod bus;
pub mod events;
pub mod metrics;

pub use bus::EventBus;
pub use events::{OutcomeEvent, OutcomeKind, OutcomeSink, SinkSet, TracingSink};
pub use metrics::{MetricsCollector, MetricsSnapshot};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::events::{OutcomeEvent, OutcomeKind, OutcomeSink};
    pub use crate::metrics::MetricsCollector;
}
