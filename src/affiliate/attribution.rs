//! First-party cookie recording which affiliate caused the current visit.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{CookieJar, SetCookie};

pub const ATTRIBUTION_COOKIE: &str = "_aff_attr";

/// Payload stored in the attribution cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionRecord {
    pub affiliate_url_id: String,
    /// Epoch milliseconds of the fire that wrote the record.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_pattern_id: Option<String>,
}

/// Reads and writes the attribution cookie. The last successful fire wins.
pub struct AttributionStore {
    jar: Arc<dyn CookieJar>,
    current: Mutex<Option<String>>,
}

impl AttributionStore {
    /// Loads the current affiliate id once so the event pipeline can read it
    /// without reparsing the cookie.
    pub fn new(jar: Arc<dyn CookieJar>) -> Self {
        let store = Self {
            jar,
            current: Mutex::new(None),
        };
        let loaded = store.get().map(|record| record.affiliate_url_id);
        *store.current.lock().unwrap_or_else(PoisonError::into_inner) = loaded;
        store
    }

    pub fn set(&self, affiliate_id: &str, window_days: u32, pattern_id: Option<&str>) -> bool {
        let now = Utc::now();
        let record = AttributionRecord {
            affiliate_url_id: affiliate_id.to_string(),
            timestamp: now.timestamp_millis(),
            url_pattern_id: pattern_id.map(str::to_string),
        };
        let json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(err) => {
                log::warn!("failed to encode attribution record: {}", err);
                return false;
            }
        };

        let Some(expires) = Duration::try_days(i64::from(window_days))
            .and_then(|window| now.checked_add_signed(window))
        else {
            log::warn!(
                "attribution window of {} days for {} is out of range",
                window_days,
                affiliate_id
            );
            return false;
        };

        let cookie = SetCookie::new(
            ATTRIBUTION_COOKIE,
            urlencoding::encode(&json).into_owned(),
            expires,
        );
        if let Err(err) = self.jar.write(&cookie) {
            log::warn!("failed to write attribution cookie: {}", err);
            return false;
        }

        *self.current.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(affiliate_id.to_string());
        true
    }

    /// Current record, or `None` when absent or corrupt.
    pub fn get(&self) -> Option<AttributionRecord> {
        let raw = match self.jar.read(ATTRIBUTION_COOKIE) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                log::debug!("attribution cookie unreadable: {}", err);
                return None;
            }
        };
        let decoded = urlencoding::decode(&raw).ok()?;
        serde_json::from_str(&decoded).ok()
    }

    pub fn clear(&self) {
        if let Err(err) = self.jar.write(&SetCookie::expired(ATTRIBUTION_COOKIE)) {
            log::warn!("failed to clear attribution cookie: {}", err);
        }
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn current_affiliate_id(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
