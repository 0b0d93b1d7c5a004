//! Tracker configuration.
//!
//! The host page supplies a camelCase JSON object before the script runs. It
//! is parsed into [`RawConfig`], validated once and frozen into
//! [`TrackerConfig`]. Nothing downstream mutates it.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://api.yourtracking.com/v1/events";

/// Longest accepted attribution window, in days.
pub const MAX_ATTRIBUTION_WINDOW_DAYS: u32 = 3650;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("tracking code is required")]
    MissingTrackingCode,
    #[error("invalid configuration json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("sampling rate for {tier} must be within 0..=100, got {value}")]
    InvalidSamplingRate { tier: &'static str, value: f64 },
    #[error("attribution window for {affiliate_id} must be within 1..={max} days, got {days}")]
    InvalidAttributionWindow {
        affiliate_id: String,
        days: u32,
        max: u32,
    },
}

/// Where batched events are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCollectionMode {
    ClientOnly,
    ServerOnly,
    #[default]
    Both,
}

impl DataCollectionMode {
    pub fn sends_to_server(self) -> bool {
        matches!(self, Self::ServerOnly | Self::Both)
    }

    pub fn sends_to_client(self) -> bool {
        matches!(self, Self::ClientOnly | Self::Both)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub categories: Vec<String>,
}

/// How a matched URL pattern is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Contains,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlPattern {
    pub id: String,
    pub pattern: String,
    pub match_type: MatchType,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl UrlPattern {
    pub fn new(id: impl Into<String>, match_type: MatchType, pattern: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pattern: pattern.into(),
            match_type,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Transport used to deliver an affiliate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMethod {
    #[default]
    Pixel,
    Beacon,
    Fetch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffiliateUrl {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub patterns: Vec<UrlPattern>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default)]
    pub delivery_method: DeliveryMethod,
    #[serde(default = "default_attribution_window")]
    pub attribution_window_days: u32,
}

impl AffiliateUrl {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            patterns: Vec::new(),
            priority: 0,
            daily_limit: default_daily_limit(),
            delivery_method: DeliveryMethod::default(),
            attribution_window_days: default_attribution_window(),
        }
    }

    pub fn with_pattern(mut self, pattern: UrlPattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_daily_limit(mut self, limit: u32) -> Self {
        self.daily_limit = limit;
        self
    }

    pub fn with_delivery(mut self, method: DeliveryMethod) -> Self {
        self.delivery_method = method;
        self
    }

    pub fn with_attribution_window(mut self, days: u32) -> Self {
        self.attribution_window_days = days;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffiliateTrackingSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub urls: Vec<AffiliateUrl>,
}

/// Per-tier sampling percentages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingRates {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for SamplingRates {
    fn default() -> Self {
        Self {
            high: 100.0,
            medium: 80.0,
            low: 50.0,
        }
    }
}

/// Configuration object as supplied by the host page.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
    #[serde(default)]
    pub tracking_code: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub website_id: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub data_collection_mode: Option<DataCollectionMode>,
    #[serde(default)]
    pub auto_detect_events: Option<bool>,
    #[serde(default)]
    pub consent_management: Option<ConsentSettings>,
    #[serde(default)]
    pub affiliate_tracking: Option<AffiliateTrackingSettings>,
    #[serde(default)]
    pub sampling: Option<SamplingRates>,
}

/// Validated, immutable tracker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub tracking_code: String,
    pub org_id: String,
    pub website_id: String,
    pub endpoint: String,
    pub data_collection_mode: DataCollectionMode,
    pub auto_detect_events: bool,
    pub consent: ConsentSettings,
    pub affiliate_tracking: AffiliateTrackingSettings,
    pub sampling: SamplingRates,
}

impl TrackerConfig {
    /// Minimal valid configuration with defaults for everything else.
    pub fn new(tracking_code: impl Into<String>) -> Result<Self, ConfigError> {
        Self::from_raw(RawConfig {
            tracking_code: Some(tracking_code.into()),
            ..RawConfig::default()
        })
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(json)?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let tracking_code = raw
            .tracking_code
            .map(|code| code.trim().to_string())
            .filter(|code| !code.is_empty())
            .ok_or(ConfigError::MissingTrackingCode)?;

        let endpoint = raw
            .endpoint
            .filter(|endpoint| !endpoint.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        Url::parse(&endpoint)?;

        let sampling = raw.sampling.unwrap_or_default();
        for (tier, value) in [
            ("high", sampling.high),
            ("medium", sampling.medium),
            ("low", sampling.low),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::InvalidSamplingRate { tier, value });
            }
        }

        let affiliate_tracking = raw.affiliate_tracking.unwrap_or_default();
        if let Some(affiliate) = affiliate_tracking.urls.iter().find(|affiliate| {
            !(1..=MAX_ATTRIBUTION_WINDOW_DAYS).contains(&affiliate.attribution_window_days)
        }) {
            return Err(ConfigError::InvalidAttributionWindow {
                affiliate_id: affiliate.id.clone(),
                days: affiliate.attribution_window_days,
                max: MAX_ATTRIBUTION_WINDOW_DAYS,
            });
        }

        Ok(Self {
            tracking_code,
            org_id: raw.org_id.unwrap_or_default(),
            website_id: raw.website_id.unwrap_or_default(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            data_collection_mode: raw.data_collection_mode.unwrap_or_default(),
            auto_detect_events: raw.auto_detect_events.unwrap_or(true),
            consent: raw.consent_management.unwrap_or_default(),
            affiliate_tracking,
            sampling,
        })
    }

    /// Telemetry sink for affiliate fire beacons.
    pub fn affiliate_endpoint(&self) -> String {
        format!("{}/affiliate", self.endpoint)
    }

    pub fn with_affiliates(mut self, urls: Vec<AffiliateUrl>) -> Self {
        self.affiliate_tracking = AffiliateTrackingSettings { enabled: true, urls };
        self
    }

    pub fn with_mode(mut self, mode: DataCollectionMode) -> Self {
        self.data_collection_mode = mode;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingRates) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_consent(mut self, consent: ConsentSettings) -> Self {
        self.consent = consent;
        self
    }
}

fn default_true() -> bool {
    true
}

fn default_daily_limit() -> u32 {
    1
}

fn default_attribution_window() -> u32 {
    30
}
