//! Per-affiliate daily fire caps.

use std::sync::Arc;

use chrono::{Local, NaiveDate};

use crate::core::KeyValueStore;

const KEY_PREFIX: &str = "_aff_limit_";

/// Counts attempted fires per affiliate and local calendar day in a store
/// that outlives the page.
#[derive(Clone)]
pub struct DailyLimitGovernor {
    store: Arc<dyn KeyValueStore>,
}

impl DailyLimitGovernor {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Consumes one unit of today's allowance for `affiliate_id`.
    pub fn try_consume(&self, affiliate_id: &str, limit: u32) -> bool {
        self.try_consume_on(affiliate_id, limit, Local::now().date_naive())
    }

    pub fn try_consume_on(&self, affiliate_id: &str, limit: u32, day: NaiveDate) -> bool {
        let key = counter_key(affiliate_id, day);
        let count = self.count_for_key(&key);
        if count >= limit {
            return false;
        }

        if let Err(err) = self.store.set(&key, &(count + 1).to_string()) {
            log::warn!("failed to persist daily limit counter {}: {}", key, err);
        }
        true
    }

    /// Attempts recorded so far for `affiliate_id` on `day`.
    pub fn count_on(&self, affiliate_id: &str, day: NaiveDate) -> u32 {
        self.count_for_key(&counter_key(affiliate_id, day))
    }

    fn count_for_key(&self, key: &str) -> u32 {
        match self.store.get(key) {
            Ok(Some(raw)) => raw.trim().parse().unwrap_or(0),
            Ok(None) => 0,
            Err(err) => {
                log::debug!("daily limit counter {} unreadable: {}", key, err);
                0
            }
        }
    }
}

fn counter_key(affiliate_id: &str, day: NaiveDate) -> String {
    format!("{}{}_{}", KEY_PREFIX, affiliate_id, day.format("%Y-%m-%d"))
}
