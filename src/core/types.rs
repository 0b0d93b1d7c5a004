//! Core data structures shared by the event pipeline and the affiliate engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Coarse value bucket assigned to a behavioural event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    High,
    Medium,
    Low,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Classification::High => "high",
            Classification::Medium => "medium",
            Classification::Low => "low",
        };
        f.write_str(label)
    }
}

/// Free-form event properties.
pub type Properties = Map<String, Value>;

/// Behavioural event as transmitted to the ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub org_id: String,
    pub website_id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub event_type: String,
    pub event_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<u8>,
    pub auto_detected: bool,
    pub sampled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_rate: Option<f64>,
    pub affiliate_url_id: Option<String>,
    pub page_url: String,
    pub referrer: String,
    pub user_agent: String,
    pub properties: Properties,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates an event with a fresh id and the current timestamp. Sampling
    /// fields start unset.
    pub fn new(
        session_id: impl Into<String>,
        event_type: impl Into<String>,
        event_name: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            org_id: String::new(),
            website_id: String::new(),
            session_id: session_id.into(),
            user_id: None,
            event_type: event_type.into(),
            event_name: event_name.into(),
            event_value: None,
            classification: None,
            confidence_score: None,
            auto_detected: false,
            sampled: false,
            sampling_rate: None,
            affiliate_url_id: None,
            page_url: String::new(),
            referrer: String::new(),
            user_agent: String::new(),
            properties: Properties::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_classification(mut self, classification: Option<Classification>) -> Self {
        self.classification = classification;
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }
}

/// Page-level context the host supplies for every event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContext {
    pub url: String,
    pub referrer: String,
    pub user_agent: String,
    pub title: String,
}

impl PageContext {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = referrer.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}
