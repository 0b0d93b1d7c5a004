//! Affiliate firing orchestration.
//!
//! `idle → checked → fired*`: a page URL is checked once per session (match
//! cache), matching affiliates are ordered by priority, gated by the daily
//! limit and fired after a randomized delay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::attribution::AttributionStore;
use super::delivery::DeliveryStrategy;
use super::limits::DailyLimitGovernor;
use super::patterns::PatternMatcher;
use crate::config::AffiliateUrl;
use crate::core::{FireDelay, KeyValueStore, RandomSource, Transport};
use crate::modules::events::{AffiliateEvent, AffiliateEventKind, EventDispatcher, TrackerEvent};

const MATCH_CACHE_PREFIX: &str = "_aff_match_";

/// A fire that has been scheduled on a timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledFire {
    pub affiliate_id: String,
    pub pattern_id: Option<String>,
    pub delay: Duration,
}

/// Result of [`AffiliateTracker::check_and_fire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No usable patterns are configured.
    Disabled,
    /// The URL was already evaluated in this session; nothing was scheduled.
    CacheHit { affiliate_ids: Vec<String> },
    NoMatch,
    Matched {
        scheduled: Vec<ScheduledFire>,
        limited: Vec<String>,
    },
}

/// Collaborators needed to build an [`AffiliateTracker`].
pub struct AffiliateDeps {
    pub transport: Arc<dyn Transport>,
    pub session_store: Arc<dyn KeyValueStore>,
    pub durable_store: Arc<dyn KeyValueStore>,
    pub attribution: Arc<AttributionStore>,
    pub random: Arc<dyn RandomSource>,
    pub events: Arc<EventDispatcher>,
    pub telemetry_endpoint: String,
}

pub struct AffiliateTracker {
    affiliates: Vec<AffiliateUrl>,
    matcher: PatternMatcher,
    governor: DailyLimitGovernor,
    delivery: DeliveryStrategy,
    attribution: Arc<AttributionStore>,
    transport: Arc<dyn Transport>,
    session_store: Arc<dyn KeyValueStore>,
    random: Arc<dyn RandomSource>,
    events: Arc<EventDispatcher>,
    telemetry_endpoint: String,
    fire_delay: FireDelay,
    match_cache: Mutex<HashMap<String, Vec<String>>>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl AffiliateTracker {
    pub fn new(affiliates: Vec<AffiliateUrl>, deps: AffiliateDeps) -> Self {
        let matcher = PatternMatcher::compile(&affiliates);
        for rejected in matcher.rejected() {
            deps.events.dispatch(TrackerEvent::PatternRejected(
                crate::modules::events::PatternRejectedEvent {
                    pattern_id: rejected.pattern_id.clone(),
                    error: rejected.error.clone(),
                    timestamp: Utc::now(),
                },
            ));
        }

        Self {
            affiliates,
            matcher,
            governor: DailyLimitGovernor::new(deps.durable_store),
            delivery: DeliveryStrategy::new(deps.transport.clone()),
            attribution: deps.attribution,
            transport: deps.transport,
            session_store: deps.session_store,
            random: deps.random,
            events: deps.events,
            telemetry_endpoint: deps.telemetry_endpoint,
            fire_delay: FireDelay::default(),
            match_cache: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fire_delay(mut self, fire_delay: FireDelay) -> Self {
        self.fire_delay = fire_delay;
        self
    }

    pub fn matcher(&self) -> &PatternMatcher {
        &self.matcher
    }

    /// Evaluates `url` against the configured patterns and schedules fires for
    /// every matching affiliate. Repeated calls for the same URL within a
    /// session are cache hits and schedule nothing.
    pub fn check_and_fire(&self, url: &str) -> CheckOutcome {
        if self.matcher.is_empty() {
            return CheckOutcome::Disabled;
        }

        let cache_key = cache_key(url);
        if let Some(affiliate_ids) = self.cached(&cache_key) {
            return CheckOutcome::CacheHit { affiliate_ids };
        }

        if !self.matcher.is_match(url) {
            self.store_cache(&cache_key, Vec::new());
            return CheckOutcome::NoMatch;
        }

        // Without a runtime nothing can fire, so the URL stays unchecked and
        // the daily allowance untouched.
        let Ok(runtime) = Handle::try_current() else {
            log::warn!("no runtime to fire affiliates for {}", url);
            return CheckOutcome::Matched {
                scheduled: Vec::new(),
                limited: Vec::new(),
            };
        };

        let hits = self.matcher.resolve(url);
        let ids = hits
            .iter()
            .map(|hit| self.affiliates[hit.affiliate_index].id.clone())
            .collect();
        self.store_cache(&cache_key, ids);

        // Stable sort: equal priorities keep configuration order.
        let mut ordered = hits;
        ordered.sort_by(|a, b| {
            let pa = self.affiliates[a.affiliate_index].priority;
            let pb = self.affiliates[b.affiliate_index].priority;
            pb.cmp(&pa)
        });

        let mut scheduled = Vec::new();
        let mut limited = Vec::new();
        for hit in ordered {
            let affiliate = &self.affiliates[hit.affiliate_index];
            if !self.governor.try_consume(&affiliate.id, affiliate.daily_limit) {
                self.dispatch(
                    &affiliate.id,
                    AffiliateEventKind::LimitReached {
                        limit: affiliate.daily_limit,
                    },
                );
                limited.push(affiliate.id.clone());
                continue;
            }

            let delay = self.fire_delay.sample(self.random.as_ref());
            self.schedule(&runtime, affiliate.clone(), Some(hit.pattern_id.clone()), delay);
            self.dispatch(&affiliate.id, AffiliateEventKind::Scheduled { delay });
            scheduled.push(ScheduledFire {
                affiliate_id: affiliate.id.clone(),
                pattern_id: Some(hit.pattern_id),
                delay,
            });
        }

        CheckOutcome::Matched { scheduled, limited }
    }

    /// Aborts every fire whose timer has not run yet.
    pub fn cancel_pending(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut cancelled = 0;
        for handle in pending.drain(..) {
            if !handle.is_finished() {
                handle.abort();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn pending_fires(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|handle| !handle.is_finished());
        pending.len()
    }

    fn schedule(
        &self,
        runtime: &Handle,
        affiliate: AffiliateUrl,
        pattern_id: Option<String>,
        delay: Duration,
    ) {
        let delivery = self.delivery.clone();
        let attribution = self.attribution.clone();
        let transport = self.transport.clone();
        let events = self.events.clone();
        let telemetry_endpoint = self.telemetry_endpoint.clone();

        let task = runtime.spawn(async move {
            sleep(delay).await;

            let success = delivery.fire(&affiliate.url, affiliate.delivery_method);
            if success {
                attribution.set(
                    &affiliate.id,
                    affiliate.attribution_window_days,
                    pattern_id.as_deref(),
                );
            }

            let payload = json!({
                "type": "affiliate_fire",
                "affiliate_url_id": affiliate.id,
                "success": success,
                "timestamp": Utc::now().to_rfc3339(),
            });
            transport.send_beacon(&telemetry_endpoint, Some(payload.to_string()));

            events.dispatch(TrackerEvent::Affiliate(AffiliateEvent {
                affiliate_id: affiliate.id.clone(),
                kind: AffiliateEventKind::Fired { success },
                timestamp: Utc::now(),
            }));
        });

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|handle| !handle.is_finished());
        pending.push(task);
    }

    fn cached(&self, key: &str) -> Option<Vec<String>> {
        if let Some(ids) = self
            .match_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Some(ids.clone());
        }

        let raw = match self.session_store.get(key) {
            Ok(raw) => raw?,
            Err(err) => {
                log::debug!("match cache read failed for {}: {}", key, err);
                return None;
            }
        };
        let ids: Vec<String> = serde_json::from_str(&raw).ok()?;
        self.match_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), ids.clone());
        Some(ids)
    }

    fn store_cache(&self, key: &str, ids: Vec<String>) {
        match serde_json::to_string(&ids) {
            Ok(raw) => {
                if let Err(err) = self.session_store.set(key, &raw) {
                    log::debug!("match cache write failed for {}: {}", key, err);
                }
            }
            Err(err) => log::debug!("match cache encode failed: {}", err),
        }
        self.match_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), ids);
    }

    fn dispatch(&self, affiliate_id: &str, kind: AffiliateEventKind) {
        self.events.dispatch(TrackerEvent::Affiliate(AffiliateEvent {
            affiliate_id: affiliate_id.to_string(),
            kind,
            timestamp: Utc::now(),
        }));
    }
}

impl Drop for AffiliateTracker {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

fn cache_key(url: &str) -> String {
    format!("{}{}", MATCH_CACHE_PREFIX, hash_code(url))
}

/// 32-bit `h * 31 + c` string hash over UTF-16 units, rendered as the base-36
/// absolute value.
fn hash_code(input: &str) -> String {
    let hash = input
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)));
    to_base36(i64::from(hash).unsigned_abs())
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
