//! Event batching and delivery.
//!
//! Events accumulate in memory and leave on three triggers: the queue
//! reaching the batch size, the wait timer expiring, or a forced flush at
//! unload. Regular flushes post with retry; forced flushes use a single
//! beacon since nothing is left to retry in.

use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::DataCollectionMode;
use crate::core::{Event, RetryPolicy, Transport, TransportError, is_success};
use crate::modules::events::{DeliveryEvent, EventDispatcher, FlushEvent, RetryEvent, TrackerEvent};

/// Client-side sink for events, such as an advertising platform pixel.
pub trait ClientDestination: Send + Sync {
    fn name(&self) -> &str;
    fn deliver(&self, events: &[Event]);
}

#[derive(Debug, Clone)]
pub struct BatcherSettings {
    pub batch_size: usize,
    pub max_wait: Duration,
    pub retry: RetryPolicy,
    pub mode: DataCollectionMode,
    pub endpoint: String,
    pub tracking_code: String,
}

impl BatcherSettings {
    pub fn new(endpoint: impl Into<String>, tracking_code: impl Into<String>) -> Self {
        Self {
            batch_size: 100,
            max_wait: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            mode: DataCollectionMode::default(),
            endpoint: endpoint.into(),
            tracking_code: tracking_code.into(),
        }
    }

    pub fn with_mode(mut self, mode: DataCollectionMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Default)]
struct BatchState {
    queue: Vec<Event>,
    timer: Option<JoinHandle<()>>,
}

struct BatcherInner {
    settings: BatcherSettings,
    transport: Arc<dyn Transport>,
    destinations: Vec<Arc<dyn ClientDestination>>,
    events: Arc<EventDispatcher>,
    state: Mutex<BatchState>,
}

/// Cloneable handle to a shared event queue.
#[derive(Clone)]
pub struct EventBatcher {
    inner: Arc<BatcherInner>,
}

impl EventBatcher {
    pub fn new(
        settings: BatcherSettings,
        transport: Arc<dyn Transport>,
        destinations: Vec<Arc<dyn ClientDestination>>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                settings,
                transport,
                destinations,
                events,
                state: Mutex::new(BatchState::default()),
            }),
        }
    }

    pub fn add(&self, event: Event) {
        let full = {
            let mut state = self.state();
            state.queue.push(event);
            if state.queue.len() >= self.inner.settings.batch_size {
                true
            } else {
                if state.timer.is_none() {
                    state.timer = self.arm_timer();
                }
                false
            }
        };

        if full {
            self.flush(false);
        }
    }

    /// Sends everything queued and returns how many events left the queue.
    pub fn flush(&self, force: bool) -> usize {
        self.flush_inner(force, false)
    }

    /// Drops queued events without sending them.
    pub fn discard(&self) -> usize {
        let mut state = self.state();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let dropped = state.queue.len();
        state.queue.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_pending_timer(&self) -> bool {
        self.state().timer.is_some()
    }

    fn flush_inner(&self, force: bool, from_timer: bool) -> usize {
        let mode = self.inner.settings.mode;
        let runtime = if !force && mode.sends_to_server() {
            match Handle::try_current() {
                Ok(handle) => Some(handle),
                Err(_) => {
                    log::debug!("no runtime for delivery; holding {} queued events", self.len());
                    return 0;
                }
            }
        } else {
            None
        };

        let batch = {
            let mut state = self.state();
            if let Some(timer) = state.timer.take()
                && !from_timer
            {
                timer.abort();
            }
            mem::take(&mut state.queue)
        };

        if batch.is_empty() {
            return 0;
        }

        let count = batch.len();
        self.inner.events.dispatch(TrackerEvent::Flush(FlushEvent {
            event_count: count,
            forced: force,
            timestamp: Utc::now(),
        }));

        if mode.sends_to_client() {
            for destination in &self.inner.destinations {
                log::trace!("delivering {} events to {}", count, destination.name());
                destination.deliver(&batch);
            }
        }

        if mode.sends_to_server() {
            let body = json!({
                "tracking_code": self.inner.settings.tracking_code,
                "events": batch,
                "timestamp": Utc::now().to_rfc3339(),
            })
            .to_string();

            match runtime {
                Some(handle) => self.post_with_retry(&handle, body, count),
                None => self.send_beacon(body, count),
            }
        }

        count
    }

    fn send_beacon(&self, body: String, count: usize) {
        let endpoint = &self.inner.settings.endpoint;
        let accepted = self.inner.transport.send_beacon(endpoint, Some(body));
        self.inner.events.dispatch(TrackerEvent::Delivery(DeliveryEvent {
            endpoint: endpoint.clone(),
            event_count: count,
            attempts: 1,
            success: accepted,
            error: (!accepted).then(|| "beacon refused".to_string()),
            timestamp: Utc::now(),
        }));
    }

    fn post_with_retry(&self, handle: &Handle, body: String, count: usize) {
        let inner = self.inner.clone();
        handle.spawn(async move {
            deliver_with_retry(inner, body, count).await;
        });
    }

    fn arm_timer(&self) -> Option<JoinHandle<()>> {
        let Ok(handle) = Handle::try_current() else {
            log::debug!("no runtime for the batch timer; waiting for size or unload");
            return None;
        };
        let batcher = self.clone();
        let wait = self.inner.settings.max_wait;
        Some(handle.spawn(async move {
            sleep(wait).await;
            batcher.flush_inner(false, true);
        }))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BatchState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn deliver_with_retry(inner: Arc<BatcherInner>, body: String, count: usize) {
    let policy = inner.settings.retry;
    let endpoint = inner.settings.endpoint.clone();
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts {
        match inner.transport.post_json(&endpoint, &body).await {
            Ok(status) if is_success(status) => {
                inner.events.dispatch(TrackerEvent::Delivery(DeliveryEvent {
                    endpoint,
                    event_count: count,
                    attempts: attempt,
                    success: true,
                    error: None,
                    timestamp: Utc::now(),
                }));
                return;
            }
            Ok(status) => last_error = TransportError::Status(status).to_string(),
            Err(err) => last_error = err.to_string(),
        }

        if attempt < policy.max_attempts {
            let wait = policy.backoff(attempt - 1);
            inner.events.dispatch(TrackerEvent::Retry(RetryEvent {
                endpoint: endpoint.clone(),
                attempt: attempt + 1,
                reason: last_error.clone(),
                scheduled_after: wait,
                timestamp: Utc::now(),
            }));
            sleep(wait).await;
        }
    }

    inner.events.dispatch(TrackerEvent::Delivery(DeliveryEvent {
        endpoint,
        event_count: count,
        attempts: policy.max_attempts,
        success: false,
        error: Some(last_error),
        timestamp: Utc::now(),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::events::EventHandler;
    use crate::test_support::{RecordingTransport, settle};

    const ENDPOINT: &str = "https://ingest.example/v1/events";

    #[derive(Default)]
    struct Captured(Mutex<Vec<TrackerEvent>>);

    impl EventHandler for Captured {
        fn handle(&self, event: &TrackerEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    impl Captured {
        fn deliveries(&self) -> Vec<DeliveryEvent> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|event| match event {
                    TrackerEvent::Delivery(delivery) => Some(delivery.clone()),
                    _ => None,
                })
                .collect()
        }

        fn retries(&self) -> Vec<RetryEvent> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|event| match event {
                    TrackerEvent::Retry(retry) => Some(retry.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[derive(Default)]
    struct RecordingDestination(Mutex<Vec<usize>>);

    impl ClientDestination for RecordingDestination {
        fn name(&self) -> &str {
            "recording"
        }

        fn deliver(&self, events: &[Event]) {
            self.0.lock().unwrap().push(events.len());
        }
    }

    struct Fixture {
        transport: Arc<RecordingTransport>,
        destination: Arc<RecordingDestination>,
        captured: Arc<Captured>,
        batcher: EventBatcher,
    }

    fn fixture(mode: DataCollectionMode) -> Fixture {
        let transport = Arc::new(RecordingTransport::new());
        let destination = Arc::new(RecordingDestination::default());
        let captured = Arc::new(Captured::default());
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(captured.clone());
        let batcher = EventBatcher::new(
            BatcherSettings::new(ENDPOINT, "TRK-1").with_mode(mode),
            transport.clone(),
            vec![destination.clone() as Arc<dyn ClientDestination>],
            Arc::new(dispatcher),
        );
        Fixture {
            transport,
            destination,
            captured,
            batcher,
        }
    }

    fn event(name: &str) -> Event {
        Event::new("session", "custom", name)
    }

    fn posted_names(body: &str) -> Vec<String> {
        let payload: serde_json::Value = serde_json::from_str(body).unwrap();
        payload["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|event| event["event_name"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn hundredth_event_flushes_in_order() {
        let fx = fixture(DataCollectionMode::ServerOnly);
        for i in 0..100 {
            fx.batcher.add(event(&format!("e{i}")));
        }
        settle().await;

        let posts = fx.transport.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, ENDPOINT);
        let names = posted_names(&posts[0].1);
        assert_eq!(names.len(), 100);
        assert_eq!(names[0], "e0");
        assert_eq!(names[99], "e99");

        let payload: serde_json::Value = serde_json::from_str(&posts[0].1).unwrap();
        assert_eq!(payload["tracking_code"], "TRK-1");
        assert!(fx.batcher.is_empty());
        assert!(!fx.batcher.has_pending_timer());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_a_partial_batch() {
        let fx = fixture(DataCollectionMode::ServerOnly);
        fx.batcher.add(event("one"));
        fx.batcher.add(event("two"));
        assert!(fx.batcher.has_pending_timer());

        sleep(Duration::from_millis(4900)).await;
        settle().await;
        assert!(fx.transport.posts().is_empty());

        sleep(Duration::from_millis(200)).await;
        settle().await;
        let posts = fx.transport.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posted_names(&posts[0].1), vec!["one", "two"]);
        assert!(!fx.batcher.has_pending_timer());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_posts_retry_with_doubling_backoff() {
        let fx = fixture(DataCollectionMode::ServerOnly);
        fx.transport.script_statuses([Some(503), None]);
        fx.batcher.add(event("e"));
        fx.batcher.flush(false);
        settle().await;
        assert_eq!(fx.transport.posts().len(), 1);

        sleep(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(fx.transport.posts().len(), 2);

        sleep(Duration::from_millis(2000)).await;
        settle().await;
        assert_eq!(fx.transport.posts().len(), 3);

        let retries = fx.captured.retries();
        assert_eq!(retries.len(), 2);
        assert_eq!(retries[0].scheduled_after, Duration::from_secs(1));
        assert_eq!(retries[1].scheduled_after, Duration::from_secs(2));

        let deliveries = fx.captured.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert!(deliveries[0].success);
        assert_eq!(deliveries[0].attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_dropped_after_three_failures() {
        let fx = fixture(DataCollectionMode::ServerOnly);
        fx.transport.script_statuses([Some(500), Some(500), Some(500)]);
        fx.batcher.add(event("e"));
        fx.batcher.flush(false);

        sleep(Duration::from_secs(10)).await;
        settle().await;

        assert_eq!(fx.transport.posts().len(), 3);
        let deliveries = fx.captured.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert!(!deliveries[0].success);
        assert_eq!(
            deliveries[0].error.as_deref(),
            Some("endpoint rejected payload with status 500")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn forced_flush_uses_a_single_beacon() {
        let fx = fixture(DataCollectionMode::ServerOnly);
        fx.batcher.add(event("a"));
        fx.batcher.add(event("b"));

        assert_eq!(fx.batcher.flush(true), 2);
        assert!(!fx.batcher.has_pending_timer());

        let beacons = fx.transport.beacons();
        assert_eq!(beacons.len(), 1);
        assert_eq!(beacons[0].0, ENDPOINT);
        assert_eq!(posted_names(beacons[0].1.as_deref().unwrap()), vec!["a", "b"]);

        sleep(Duration::from_secs(10)).await;
        settle().await;
        assert!(fx.transport.posts().is_empty());
    }

    #[test]
    fn regular_flush_without_runtime_keeps_the_queue() {
        let fx = fixture(DataCollectionMode::Both);
        fx.batcher.add(event("a"));
        fx.batcher.add(event("b"));
        assert!(!fx.batcher.has_pending_timer());

        assert_eq!(fx.batcher.flush(false), 0);
        assert_eq!(fx.batcher.len(), 2);
        assert!(fx.destination.0.lock().unwrap().is_empty());

        assert_eq!(fx.batcher.flush(true), 2);
        let beacons = fx.transport.beacons();
        assert_eq!(beacons.len(), 1);
        assert_eq!(posted_names(beacons[0].1.as_deref().unwrap()), vec!["a", "b"]);
        assert_eq!(*fx.destination.0.lock().unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn collection_mode_selects_destinations() {
        let client = fixture(DataCollectionMode::ClientOnly);
        client.batcher.add(event("a"));
        client.batcher.flush(true);
        assert_eq!(*client.destination.0.lock().unwrap(), vec![1]);
        assert!(client.transport.beacons().is_empty());

        let server = fixture(DataCollectionMode::ServerOnly);
        server.batcher.add(event("a"));
        server.batcher.flush(true);
        assert!(server.destination.0.lock().unwrap().is_empty());
        assert_eq!(server.transport.beacons().len(), 1);

        let both = fixture(DataCollectionMode::Both);
        both.batcher.add(event("a"));
        both.batcher.flush(true);
        assert_eq!(*both.destination.0.lock().unwrap(), vec![1]);
        assert_eq!(both.transport.beacons().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn discard_drops_queue_and_timer() {
        let fx = fixture(DataCollectionMode::ServerOnly);
        fx.batcher.add(event("a"));
        assert_eq!(fx.batcher.discard(), 1);
        assert!(!fx.batcher.has_pending_timer());

        sleep(Duration::from_secs(6)).await;
        settle().await;
        assert!(fx.transport.posts().is_empty());
        assert_eq!(fx.batcher.flush(true), 0);
    }
}
