//! # universal-tracker
//!
//! Behavioural event pipeline and affiliate attribution engine for embedding
//! in a web page host.
//!
//! The host feeds page lifecycle and DOM notifications in; the tracker
//! classifies interactions, samples them by value, batches them to an
//! ingestion endpoint, and fires configured affiliate URLs when the page
//! matches their patterns.
//!
//! ## Features
//!
//! - Heuristic detection of clicks, downloads, forms, scroll depth and video
//! - Tiered sampling with retroactive replay once a session converts
//! - Size and time triggered batching with retry and unload beacons
//! - Single-pass URL pattern matching across all affiliates
//! - Daily fire limits and first-party attribution cookies
//! - Consent gating for analytics and marketing
//!
//! ## Example
//!
//! ```no_run
//! use universal_tracker::{PageContext, Properties, Tracker, TrackerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TrackerConfig::new("TRK-123")?;
//!     let tracker = Tracker::builder(config)
//!         .with_page(PageContext::new("https://shop.example/thank-you"))
//!         .build()?;
//!     tracker.start();
//!     tracker.track_conversion(49.0, Properties::new());
//!     tracker.unload();
//!     Ok(())
//! }
//! ```

mod tracker;

pub mod affiliate;
pub mod config;
pub mod core;
pub mod modules;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod test_support;

pub use crate::tracker::{
    CONSENT_ANALYTICS,
    CONSENT_MARKETING,
    SESSION_KEY,
    Session,
    Tracker,
    TrackerBuilder,
    TrackerError,
    TrackerResult,
};

pub use crate::affiliate::{
    AffiliateTracker,
    AttributionRecord,
    AttributionStore,
    CheckOutcome,
    DailyLimitGovernor,
    DeliveryStrategy,
    PatternMatcher,
    ScheduledFire,
};

pub use crate::config::{
    AffiliateTrackingSettings,
    AffiliateUrl,
    ConfigError,
    ConsentSettings,
    DataCollectionMode,
    DeliveryMethod,
    MatchType,
    RawConfig,
    SamplingRates,
    TrackerConfig,
    UrlPattern,
};

pub use crate::core::{
    Classification,
    CookieJar,
    Event,
    FireDelay,
    KeyValueStore,
    MemoryCookieJar,
    MemoryStore,
    PageContext,
    Properties,
    RandomSource,
    RedbStore,
    ReqwestTransport,
    RetryPolicy,
    SequenceRandom,
    SetCookie,
    StorageError,
    ThreadRandom,
    Transport,
    TransportError,
};

pub use crate::modules::{
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    TrackerEvent,
};

pub use crate::pipeline::{
    AddedNode,
    ClientDestination,
    Detection,
    DomEvent,
    ElementInfo,
    EventBatcher,
    EventDetector,
    FormInfo,
    SamplingEngine,
    VideoInfo,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
