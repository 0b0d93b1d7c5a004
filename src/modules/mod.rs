//! Cross-cutting services module
//!
//! Lifecycle notifications about the tracker and the counters built from
//! them.

pub mod events;
pub mod metrics;

pub use events::{
    AffiliateEvent, AffiliateEventKind, DeliveryEvent, EventDispatcher, EventHandler, FlushEvent,
    LoggingHandler, MetricsHandler, PatternRejectedEvent, RetryEvent, SamplingEvent, TrackerEvent,
};
pub use metrics::{AffiliateStats, MetricsCollector, MetricsSnapshot, PipelineStats};
