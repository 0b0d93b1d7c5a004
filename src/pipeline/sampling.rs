//! Tiered event sampling with retroactive session upgrade.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::config::SamplingRates;
use crate::core::{Classification, Event, RandomSource};

pub const REPLAY_CAPACITY: usize = 100;

/// Outcome of a sampling decision, beyond the boolean.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingDecision {
    pub sampled: bool,
    pub rate: f64,
    pub queued_for_replay: bool,
}

pub struct SamplingEngine {
    rates: SamplingRates,
    random: Arc<dyn RandomSource>,
    upgraded: HashSet<String>,
    replay: VecDeque<Event>,
}

impl SamplingEngine {
    pub fn new(rates: SamplingRates, random: Arc<dyn RandomSource>) -> Self {
        Self {
            rates,
            random,
            upgraded: HashSet::new(),
            replay: VecDeque::with_capacity(REPLAY_CAPACITY),
        }
    }

    /// Decides whether `event` is transmitted and records the decision on it.
    pub fn should_sample(&mut self, event: &mut Event) -> bool {
        self.decide(event).sampled
    }

    pub fn decide(&mut self, event: &mut Event) -> SamplingDecision {
        let (sampled, rate) = if event.classification == Some(Classification::High)
            || self.upgraded.contains(&event.session_id)
        {
            (true, 100.0)
        } else {
            let rate = self.rate_for(event.classification);
            (self.random.next_f64() * 100.0 < rate, rate)
        };

        event.sampled = sampled;
        event.sampling_rate = Some(rate);

        let queued_for_replay = !sampled && event.classification == Some(Classification::Low);
        if queued_for_replay {
            if self.replay.len() == REPLAY_CAPACITY {
                self.replay.pop_front();
            }
            self.replay.push_back(event.clone());
        }

        SamplingDecision {
            sampled,
            rate,
            queued_for_replay,
        }
    }

    /// Marks `session_id` as fully sampled and hands back the low-value events
    /// previously dropped for it, oldest first. The caller re-submits them.
    pub fn upgrade_session(&mut self, session_id: &str) -> Vec<Event> {
        self.upgraded.insert(session_id.to_string());

        let (matching, rest): (Vec<_>, Vec<_>) = self
            .replay
            .drain(..)
            .partition(|event| event.session_id == session_id);
        self.replay = rest.into();
        matching
    }

    pub fn is_upgraded(&self, session_id: &str) -> bool {
        self.upgraded.contains(session_id)
    }

    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    fn rate_for(&self, classification: Option<Classification>) -> f64 {
        match classification {
            Some(Classification::High) => self.rates.high,
            Some(Classification::Medium) => self.rates.medium,
            Some(Classification::Low) | None => self.rates.low,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SequenceRandom;

    fn engine(draw: f64) -> SamplingEngine {
        SamplingEngine::new(SamplingRates::default(), Arc::new(SequenceRandom::constant(draw)))
    }

    fn event(session: &str, classification: Classification) -> Event {
        Event::new(session, "click", "button_click").with_classification(Some(classification))
    }

    #[test]
    fn high_value_events_ignore_the_configured_rate() {
        let mut sampler = SamplingEngine::new(
            SamplingRates {
                high: 0.0,
                medium: 0.0,
                low: 0.0,
            },
            Arc::new(SequenceRandom::constant(0.99)),
        );
        let mut high = event("s", Classification::High);
        assert!(sampler.should_sample(&mut high));
        assert!(high.sampled);
        assert_eq!(high.sampling_rate, Some(100.0));
    }

    #[test]
    fn tier_rates_compare_against_the_draw() {
        let mut sampler = engine(0.79);
        let mut medium = event("s", Classification::Medium);
        assert!(sampler.should_sample(&mut medium));
        assert_eq!(medium.sampling_rate, Some(80.0));

        let mut low = event("s", Classification::Low);
        assert!(!sampler.should_sample(&mut low));
        assert_eq!(low.sampling_rate, Some(50.0));
        assert!(!low.sampled);
    }

    #[test]
    fn unclassified_events_use_the_low_rate_but_are_not_queued() {
        let mut sampler = engine(0.6);
        let mut custom = Event::new("s", "custom", "pageview");
        assert!(!sampler.should_sample(&mut custom));
        assert_eq!(sampler.replay_len(), 0);
    }

    #[test]
    fn rejected_low_event_is_replayed_after_upgrade() {
        let mut sampler = engine(0.9);
        let mut low = event("session-1", Classification::Low);
        let id = low.id.clone();
        assert!(!sampler.should_sample(&mut low));

        let mut other = event("session-2", Classification::Low);
        sampler.should_sample(&mut other);

        let replayed = sampler.upgrade_session("session-1");
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].id, id);
        assert_eq!(sampler.replay_len(), 1);
        assert!(sampler.upgrade_session("session-1").is_empty());
    }

    #[test]
    fn upgraded_sessions_are_always_sampled() {
        let mut sampler = engine(0.99);
        sampler.upgrade_session("s");
        assert!(sampler.is_upgraded("s"));

        let mut low = event("s", Classification::Low);
        assert!(sampler.should_sample(&mut low));
        assert_eq!(low.sampling_rate, Some(100.0));

        let mut elsewhere = event("t", Classification::Low);
        assert!(!sampler.should_sample(&mut elsewhere));
    }

    #[test]
    fn replay_queue_evicts_oldest_first() {
        let mut sampler = engine(0.99);
        let mut first_id = None;
        for i in 0..=REPLAY_CAPACITY {
            let mut low = event("s", Classification::Low);
            if i == 1 {
                first_id = Some(low.id.clone());
            }
            sampler.should_sample(&mut low);
        }
        assert_eq!(sampler.replay_len(), REPLAY_CAPACITY);

        let replayed = sampler.upgrade_session("s");
        assert_eq!(replayed.len(), REPLAY_CAPACITY);
        assert_eq!(Some(replayed[0].id.clone()), first_id);
    }
}
