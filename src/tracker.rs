//! High level tracker orchestration.
//!
//! Wires the event pipeline (detector, sampler, batcher) and the affiliate
//! engine (matcher, governor, delivery, attribution) behind one handle that
//! the host drives with page lifecycle and DOM notifications.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use crate::affiliate::{AffiliateDeps, AffiliateTracker, AttributionStore, CheckOutcome};
use crate::config::{ConfigError, TrackerConfig};
use crate::core::{
    Classification, CookieJar, Event, FireDelay, KeyValueStore, MemoryCookieJar, MemoryStore,
    PageContext, Properties, RandomSource, RedbStore, ReqwestTransport, StorageError,
    ThreadRandom, Transport, TransportError,
};
use crate::modules::events::{
    EventDispatcher, EventHandler, LoggingHandler, MetricsHandler, SamplingEvent, TrackerEvent,
};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::pipeline::{
    BatcherSettings, ClientDestination, DomEvent, EventBatcher, EventDetector, SamplingEngine,
    VideoInfo,
};

/// Tab-store key holding the session id.
pub const SESSION_KEY: &str = "_tracker_session";

/// Consent category gating behavioural event collection.
pub const CONSENT_ANALYTICS: &str = "analytics";
/// Consent category gating affiliate firing and attribution.
pub const CONSENT_MARKETING: &str = "marketing";

/// Result alias used across the orchestration layer.
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Construction failure surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("transport initialisation failed: {0}")]
    Transport(#[from] TransportError),
    #[error("storage initialisation failed: {0}")]
    Storage(#[from] StorageError),
}

/// Visitor session, scoped to the tab store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: String,
    resumed: bool,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// True when the id was found in the tab store rather than created.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    fn resolve(store: &dyn KeyValueStore) -> Self {
        match store.get(SESSION_KEY) {
            Ok(Some(id)) if !id.is_empty() => {
                return Self { id, resumed: true };
            }
            Ok(_) => {}
            Err(err) => log::debug!("session lookup failed: {}", err),
        }

        let id = uuid::Uuid::new_v4().to_string();
        if let Err(err) = store.set(SESSION_KEY, &id) {
            log::warn!("session id not persisted: {}", err);
        }
        Self { id, resumed: false }
    }
}

/// Fluent builder for [`Tracker`].
pub struct TrackerBuilder {
    config: TrackerConfig,
    transport: Option<Arc<dyn Transport>>,
    session_store: Option<Arc<dyn KeyValueStore>>,
    durable_store: Option<Arc<dyn KeyValueStore>>,
    durable_path: Option<PathBuf>,
    cookie_jar: Option<Arc<dyn CookieJar>>,
    random: Option<Arc<dyn RandomSource>>,
    page: PageContext,
    destinations: Vec<Arc<dyn ClientDestination>>,
    handlers: Vec<Arc<dyn EventHandler>>,
    fire_delay: FireDelay,
    enable_metrics: bool,
}

impl TrackerBuilder {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            transport: None,
            session_store: None,
            durable_store: None,
            durable_path: None,
            cookie_jar: None,
            random: None,
            page: PageContext::default(),
            destinations: Vec::new(),
            handlers: Vec::new(),
            fire_delay: FireDelay::default(),
            enable_metrics: true,
        }
    }

    /// Parses and validates a host-supplied JSON configuration.
    pub fn from_json(json: &str) -> TrackerResult<Self> {
        Ok(Self::new(TrackerConfig::from_json(json)?))
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Tab-scoped store for the session id and URL match cache.
    pub fn with_session_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    /// Long-lived store for daily-limit counters.
    pub fn with_durable_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.durable_store = Some(store);
        self
    }

    /// Opens a redb file as the durable store during `build`.
    pub fn with_durable_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.durable_path = Some(path.into());
        self
    }

    pub fn with_cookie_jar(mut self, jar: Arc<dyn CookieJar>) -> Self {
        self.cookie_jar = Some(jar);
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = Some(random);
        self
    }

    pub fn with_page(mut self, page: PageContext) -> Self {
        self.page = page;
        self
    }

    pub fn with_client_destination(mut self, destination: Arc<dyn ClientDestination>) -> Self {
        self.destinations.push(destination);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_fire_delay(mut self, fire_delay: FireDelay) -> Self {
        self.fire_delay = fire_delay;
        self
    }

    pub fn disable_metrics(mut self) -> Self {
        self.enable_metrics = false;
        self
    }

    pub fn build(self) -> TrackerResult<Tracker> {
        Tracker::from_builder(self)
    }
}

/// Main tracker orchestrator.
pub struct Tracker {
    config: TrackerConfig,
    session: Session,
    page: Mutex<PageContext>,
    user_id: Mutex<Option<String>>,
    granted: Mutex<HashSet<String>>,
    sampler: Mutex<SamplingEngine>,
    detector: Option<Mutex<EventDetector>>,
    batcher: EventBatcher,
    affiliates: Option<AffiliateTracker>,
    attribution: Arc<AttributionStore>,
    metrics: Option<MetricsCollector>,
    events: Arc<EventDispatcher>,
}

impl Tracker {
    pub fn builder(config: TrackerConfig) -> TrackerBuilder {
        TrackerBuilder::new(config)
    }

    fn from_builder(builder: TrackerBuilder) -> TrackerResult<Self> {
        let config = builder.config;

        let transport: Arc<dyn Transport> = match builder.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let session_store: Arc<dyn KeyValueStore> = builder
            .session_store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let durable_store: Arc<dyn KeyValueStore> = match (builder.durable_store, builder.durable_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(RedbStore::open(path)?),
            (None, None) => Arc::new(MemoryStore::new()),
        };
        let cookie_jar: Arc<dyn CookieJar> = builder
            .cookie_jar
            .unwrap_or_else(|| Arc::new(MemoryCookieJar::new()));
        let random: Arc<dyn RandomSource> = builder.random.unwrap_or_else(|| Arc::new(ThreadRandom));

        let metrics = builder.enable_metrics.then(MetricsCollector::new);
        let mut events = EventDispatcher::new();
        events.register_handler(Arc::new(LoggingHandler));
        if let Some(ref collector) = metrics {
            events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
        }
        for handler in builder.handlers {
            events.register_handler(handler);
        }
        let events = Arc::new(events);

        let session = Session::resolve(session_store.as_ref());
        let attribution = Arc::new(AttributionStore::new(cookie_jar));

        let batcher = EventBatcher::new(
            BatcherSettings::new(config.endpoint.clone(), config.tracking_code.clone())
                .with_mode(config.data_collection_mode),
            transport.clone(),
            builder.destinations,
            events.clone(),
        );

        let affiliates = config.affiliate_tracking.enabled.then(|| {
            AffiliateTracker::new(
                config.affiliate_tracking.urls.clone(),
                AffiliateDeps {
                    transport: transport.clone(),
                    session_store: session_store.clone(),
                    durable_store,
                    attribution: attribution.clone(),
                    random: random.clone(),
                    events: events.clone(),
                    telemetry_endpoint: config.affiliate_endpoint(),
                },
            )
            .with_fire_delay(builder.fire_delay)
        });

        let detector = config
            .auto_detect_events
            .then(|| Mutex::new(EventDetector::new()));

        log::debug!(
            "tracker ready: session={} resumed={} affiliates={}",
            session.id,
            session.resumed,
            affiliates.is_some()
        );

        Ok(Self {
            sampler: Mutex::new(SamplingEngine::new(config.sampling, random)),
            config,
            session,
            page: Mutex::new(builder.page),
            user_id: Mutex::new(None),
            granted: Mutex::new(HashSet::new()),
            detector,
            batcher,
            affiliates,
            attribution,
            metrics,
            events,
        })
    }

    /// Page-load hook: records the page view and checks affiliate patterns
    /// for the current URL.
    pub fn start(&self) -> Option<CheckOutcome> {
        let page = lock(&self.page).clone();
        let mut properties = Properties::new();
        properties.insert("url".into(), Value::String(page.url.clone()));
        properties.insert("title".into(), Value::String(page.title));
        properties.insert("referrer".into(), Value::String(page.referrer));
        self.track_event("pageview", properties);

        self.check_affiliates(&page.url)
    }

    /// Records a custom event. Returns whether it was sampled into the batch.
    pub fn track_event(&self, name: &str, properties: Properties) -> bool {
        let event = self.new_event("custom", name, properties);
        self.submit(event)
    }

    pub fn track_classified(
        &self,
        name: &str,
        classification: Classification,
        properties: Properties,
    ) -> bool {
        let event = self
            .new_event("custom", name, properties)
            .with_classification(Some(classification));
        self.submit(event)
    }

    pub fn identify(&self, user_id: &str, traits: Properties) -> bool {
        *lock(&self.user_id) = Some(user_id.to_string());

        let mut properties = Properties::new();
        properties.insert("user_id".into(), Value::String(user_id.to_string()));
        properties.extend(traits);
        self.track_event("identify", properties)
    }

    pub fn set_user_properties(&self, properties: Properties) -> bool {
        self.track_event("user_properties_updated", properties)
    }

    /// Records a conversion, marks the session as converted and re-submits
    /// the low-value events dropped earlier in the session.
    pub fn track_conversion(&self, value: f64, properties: Properties) -> bool {
        let mut merged = Properties::new();
        merged.insert("value".into(), Value::from(value));
        merged.extend(properties);

        let event = self
            .new_event("conversion", "conversion", merged)
            .with_classification(Some(Classification::High));
        if !self.submit(event) {
            return false;
        }

        let replayed = lock(&self.sampler).upgrade_session(&self.session.id);
        let count = replayed.len();
        for mut event in replayed {
            event.properties.insert("replayed".into(), Value::Bool(true));
            self.batcher.add(event);
        }
        self.events.dispatch(TrackerEvent::SessionUpgraded {
            session_id: self.session.id.clone(),
            replayed: count,
        });
        true
    }

    /// Feeds a host DOM notification through the detector. Returns how many
    /// interactions were detected.
    pub fn handle_dom_event(&self, event: &DomEvent) -> usize {
        let Some(detector) = &self.detector else {
            return 0;
        };
        let detections = lock(detector).handle(event);
        let count = detections.len();

        for detection in detections {
            let mut event =
                self.new_event(detection.event_type, detection.event_name, detection.properties);
            event.classification = Some(detection.classification);
            event.confidence_score = Some(detection.confidence);
            event.auto_detected = true;
            self.submit(event);
        }
        count
    }

    /// Processes deferred DOM mutations. Call when the host is idle.
    pub fn run_idle(&self) -> usize {
        self.detector
            .as_ref()
            .map(|detector| lock(detector).run_idle())
            .unwrap_or(0)
    }

    /// Starts tracking a video present at page load.
    pub fn observe_video(&self, video: &VideoInfo) {
        if let Some(detector) = &self.detector {
            lock(detector).observe_video(video);
        }
    }

    /// Client-side route change.
    pub fn navigate(&self, url: &str) -> Option<CheckOutcome> {
        {
            let mut page = lock(&self.page);
            page.referrer = std::mem::replace(&mut page.url, url.to_string());
        }
        self.check_affiliates(url)
    }

    /// Runs the affiliate check for `url`. `None` when affiliate tracking is
    /// off or marketing consent is missing.
    pub fn check_affiliates(&self, url: &str) -> Option<CheckOutcome> {
        let affiliates = self.affiliates.as_ref()?;
        if !self.consent_allows(CONSENT_MARKETING) {
            log::debug!("affiliate check skipped for {}: no marketing consent", url);
            return None;
        }
        Some(affiliates.check_and_fire(url))
    }

    pub fn flush(&self) -> usize {
        self.batcher.flush(false)
    }

    /// Page teardown: sends what is queued in one beacon, drops pending
    /// affiliate fires and stops listening for DOM events.
    pub fn unload(&self) -> usize {
        let flushed = self.batcher.flush(true);
        if let Some(affiliates) = &self.affiliates {
            let cancelled = affiliates.cancel_pending();
            if cancelled > 0 {
                log::debug!("cancelled {} pending affiliate fires", cancelled);
            }
        }
        if let Some(detector) = &self.detector {
            lock(detector).teardown();
        }
        flushed
    }

    pub fn grant_consent<I, S>(&self, categories: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.granted).extend(categories.into_iter().map(Into::into));
    }

    pub fn revoke_consent<I, S>(&self, categories: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let revoked: Vec<String> = categories.into_iter().map(Into::into).collect();
        {
            let mut granted = lock(&self.granted);
            for category in &revoked {
                granted.remove(category);
            }
        }

        for category in &revoked {
            match category.as_str() {
                CONSENT_ANALYTICS if self.consent_required(CONSENT_ANALYTICS) => {
                    let dropped = self.batcher.discard();
                    log::debug!("analytics consent revoked, discarded {} events", dropped);
                }
                CONSENT_MARKETING if self.consent_required(CONSENT_MARKETING) => {
                    self.attribution.clear();
                    if let Some(affiliates) = &self.affiliates {
                        affiliates.cancel_pending();
                    }
                }
                _ => {}
            }
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.metrics.as_ref().map(MetricsCollector::snapshot)
    }

    pub fn current_affiliate_id(&self) -> Option<String> {
        self.attribution.current_affiliate_id()
    }

    pub fn queued_events(&self) -> usize {
        self.batcher.len()
    }

    fn new_event(&self, event_type: &str, event_name: &str, properties: Properties) -> Event {
        let page = lock(&self.page).clone();
        let mut event = Event::new(self.session.id.as_str(), event_type, event_name);
        event.org_id = self.config.org_id.clone();
        event.website_id = self.config.website_id.clone();
        event.user_id = lock(&self.user_id).clone();
        event.event_value = properties.get("value").and_then(Value::as_f64);
        event.affiliate_url_id = self.attribution.current_affiliate_id();
        event.page_url = page.url;
        event.referrer = page.referrer;
        event.user_agent = page.user_agent;
        event.properties = properties;
        event.timestamp = Utc::now();
        event
    }

    fn submit(&self, mut event: Event) -> bool {
        if !self.consent_allows(CONSENT_ANALYTICS) {
            log::trace!("dropping {}: no analytics consent", event.event_name);
            return false;
        }

        let decision = lock(&self.sampler).decide(&mut event);
        self.events.dispatch(TrackerEvent::Sampling(SamplingEvent {
            event_name: event.event_name.clone(),
            classification: event.classification,
            sampled: decision.sampled,
            queued_for_replay: decision.queued_for_replay,
            timestamp: Utc::now(),
        }));

        if decision.sampled {
            self.batcher.add(event);
        }
        decision.sampled
    }

    fn consent_required(&self, category: &str) -> bool {
        let consent = &self.config.consent;
        consent.enabled
            && (consent.categories.is_empty() || consent.categories.iter().any(|c| c == category))
    }

    fn consent_allows(&self, category: &str) -> bool {
        !self.consent_required(category) || lock(&self.granted).contains(category)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
