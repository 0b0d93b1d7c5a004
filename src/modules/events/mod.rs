//! Internal event system.
//!
//! Provides hooks for metrics, logging, and custom reactions around pipeline
//! and affiliate activity. These are lifecycle notifications about the tracker
//! itself, not the behavioural events it collects.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::metrics::MetricsCollector;
use crate::core::Classification;

/// Outcome of a sampling decision.
#[derive(Debug, Clone)]
pub struct SamplingEvent {
    pub event_name: String,
    pub classification: Option<Classification>,
    pub sampled: bool,
    pub queued_for_replay: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FlushEvent {
    pub event_count: usize,
    pub forced: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DeliveryEvent {
    pub endpoint: String,
    pub event_count: usize,
    pub attempts: u32,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub endpoint: String,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AffiliateEvent {
    pub affiliate_id: String,
    pub kind: AffiliateEventKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AffiliateEventKind {
    Scheduled { delay: Duration },
    LimitReached { limit: u32 },
    Fired { success: bool },
}

#[derive(Debug, Clone)]
pub struct PatternRejectedEvent {
    pub pattern_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Sampling(SamplingEvent),
    Flush(FlushEvent),
    Delivery(DeliveryEvent),
    Retry(RetryEvent),
    Affiliate(AffiliateEvent),
    PatternRejected(PatternRejectedEvent),
    SessionUpgraded { session_id: String, replayed: usize },
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &TrackerEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: TrackerEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &TrackerEvent) {
        match event {
            TrackerEvent::Sampling(sampling) => {
                log::trace!(
                    "sampling {} ({:?}) sampled={} queued={}",
                    sampling.event_name,
                    sampling.classification,
                    sampling.sampled,
                    sampling.queued_for_replay
                );
            }
            TrackerEvent::Flush(flush) => {
                log::debug!("flush {} events forced={}", flush.event_count, flush.forced);
            }
            TrackerEvent::Delivery(delivery) => {
                if delivery.success {
                    log::debug!(
                        "delivered {} events to {} after {} attempt(s)",
                        delivery.event_count,
                        delivery.endpoint,
                        delivery.attempts
                    );
                } else {
                    log::warn!(
                        "dropped {} events for {} after {} attempt(s): {}",
                        delivery.event_count,
                        delivery.endpoint,
                        delivery.attempts,
                        delivery.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            TrackerEvent::Retry(retry) => {
                log::info!(
                    "retry {} attempt {} after {:.2}s ({})",
                    retry.endpoint,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            TrackerEvent::Affiliate(affiliate) => match &affiliate.kind {
                AffiliateEventKind::Scheduled { delay } => {
                    log::debug!(
                        "affiliate {} scheduled in {}ms",
                        affiliate.affiliate_id,
                        delay.as_millis()
                    );
                }
                AffiliateEventKind::LimitReached { limit } => {
                    log::debug!(
                        "affiliate {} skipped, daily limit {} reached",
                        affiliate.affiliate_id,
                        limit
                    );
                }
                AffiliateEventKind::Fired { success } => {
                    log::info!("affiliate {} fired success={}", affiliate.affiliate_id, success);
                }
            },
            TrackerEvent::PatternRejected(rejected) => {
                log::warn!("url pattern {} skipped: {}", rejected.pattern_id, rejected.error);
            }
            TrackerEvent::SessionUpgraded { session_id, replayed } => {
                log::info!("session {} upgraded, replaying {} events", session_id, replayed);
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &TrackerEvent) {
        match event {
            TrackerEvent::Sampling(sampling) => {
                self.metrics
                    .record_sampling(sampling.sampled, sampling.queued_for_replay);
            }
            TrackerEvent::Delivery(delivery) => {
                self.metrics
                    .record_delivery(delivery.event_count, delivery.success);
            }
            TrackerEvent::Affiliate(affiliate) => {
                self.metrics
                    .record_affiliate(&affiliate.affiliate_id, &affiliate.kind);
            }
            TrackerEvent::SessionUpgraded { replayed, .. } => {
                self.metrics.record_replay(*replayed);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &TrackerEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.dispatch(TrackerEvent::Flush(FlushEvent {
            event_count: 3,
            forced: true,
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }

    #[test]
    fn metrics_handler_counts_affiliate_outcomes() {
        let metrics = MetricsCollector::new();
        let handler = MetricsHandler::new(metrics.clone());
        handler.handle(&TrackerEvent::Affiliate(AffiliateEvent {
            affiliate_id: "aff".into(),
            kind: AffiliateEventKind::Fired { success: false },
            timestamp: Utc::now(),
        }));

        let snapshot = metrics.snapshot();
        let stats = snapshot.affiliates.iter().find(|a| a.affiliate_id == "aff").unwrap();
        assert_eq!(stats.failures, 1);
    }
}
