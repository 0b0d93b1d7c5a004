//! Metrics collection utilities.
//!
//! Aggregates pipeline counters (sampling, delivery, replay) and per-affiliate
//! firing statistics for observability.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::events::AffiliateEventKind;

/// Aggregated pipeline counters.
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub started_at: DateTime<Utc>,
    pub events_seen: u64,
    pub events_sampled: u64,
    pub events_dropped: u64,
    pub events_queued_for_replay: u64,
    pub events_replayed: u64,
    pub batches_delivered: u64,
    pub batches_failed: u64,
    pub events_delivered: u64,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            events_seen: 0,
            events_sampled: 0,
            events_dropped: 0,
            events_queued_for_replay: 0,
            events_replayed: 0,
            batches_delivered: 0,
            batches_failed: 0,
            events_delivered: 0,
        }
    }
}

/// Affiliate-scoped statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffiliateStats {
    pub affiliate_id: String,
    pub scheduled: u64,
    pub limited: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_fired: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub pipeline: PipelineStats,
    pub affiliates: Vec<AffiliateStats>,
}

#[derive(Debug, Default)]
struct MetricsState {
    pipeline: PipelineStats,
    affiliates: HashMap<String, AffiliateStats>,
}

impl MetricsState {
    fn affiliate_mut(&mut self, affiliate_id: &str) -> &mut AffiliateStats {
        self.affiliates
            .entry(affiliate_id.to_string())
            .or_insert_with(|| AffiliateStats {
                affiliate_id: affiliate_id.to_string(),
                ..AffiliateStats::default()
            })
    }
}

/// Thread-safe metrics collector used by the orchestration layer.
#[derive(Clone, Debug, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sampling(&self, sampled: bool, queued_for_replay: bool) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.pipeline.events_seen += 1;
        if sampled {
            guard.pipeline.events_sampled += 1;
        } else {
            guard.pipeline.events_dropped += 1;
        }
        if queued_for_replay {
            guard.pipeline.events_queued_for_replay += 1;
        }
    }

    pub fn record_replay(&self, replayed: usize) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.pipeline.events_replayed += replayed as u64;
    }

    pub fn record_delivery(&self, event_count: usize, success: bool) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if success {
            guard.pipeline.batches_delivered += 1;
            guard.pipeline.events_delivered += event_count as u64;
        } else {
            guard.pipeline.batches_failed += 1;
        }
    }

    pub fn record_affiliate(&self, affiliate_id: &str, kind: &AffiliateEventKind) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = guard.affiliate_mut(affiliate_id);
        match kind {
            AffiliateEventKind::Scheduled { .. } => stats.scheduled += 1,
            AffiliateEventKind::LimitReached { .. } => stats.limited += 1,
            AffiliateEventKind::Fired { success } => {
                if *success {
                    stats.successes += 1;
                } else {
                    stats.failures += 1;
                }
                stats.last_fired = Some(Utc::now());
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut affiliates: Vec<_> = guard.affiliates.values().cloned().collect();
        affiliates.sort_by(|a, b| a.affiliate_id.cmp(&b.affiliate_id));
        MetricsSnapshot {
            pipeline: guard.pipeline.clone(),
            affiliates,
        }
    }
}
