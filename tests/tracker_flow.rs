use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use universal_tracker::{
    CheckOutcome, ClientDestination, Event, MemoryCookieJar, PageContext, Properties,
    SequenceRandom, Tracker, TrackerBuilder, Transport, TransportError,
};

#[derive(Default)]
struct StubTransport {
    posts: Mutex<Vec<(String, String)>>,
    beacons: Mutex<Vec<(String, Option<String>)>>,
    images: Mutex<Vec<String>>,
    statuses: Mutex<VecDeque<u16>>,
}

impl StubTransport {
    fn beacon_payloads(&self, url: &str) -> Vec<Value> {
        self.beacons
            .lock()
            .unwrap()
            .iter()
            .filter(|(target, _)| target == url)
            .filter_map(|(_, body)| body.as_deref())
            .map(|body| serde_json::from_str(body).unwrap())
            .collect()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn post_json(&self, url: &str, body: &str) -> Result<u16, TransportError> {
        self.posts
            .lock()
            .unwrap()
            .push((url.to_string(), body.to_string()));
        Ok(self.statuses.lock().unwrap().pop_front().unwrap_or(204))
    }

    async fn fetch_get(&self, _url: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn send_beacon(&self, url: &str, body: Option<String>) -> bool {
        self.beacons.lock().unwrap().push((url.to_string(), body));
        true
    }

    fn load_image(&self, url: &str) -> bool {
        self.images.lock().unwrap().push(url.to_string());
        true
    }
}

#[derive(Default)]
struct PixelSink(Mutex<Vec<String>>);

impl ClientDestination for PixelSink {
    fn name(&self) -> &str {
        "pixel-sink"
    }

    fn deliver(&self, events: &[Event]) {
        let mut seen = self.0.lock().unwrap();
        seen.extend(events.iter().map(|event| event.event_name.clone()));
    }
}

const CONFIG: &str = r#"{
    "trackingCode": "TRK-900",
    "orgId": "org-1",
    "websiteId": "site-1",
    "sampling": {"high": 100, "medium": 100, "low": 100},
    "affiliateTracking": {
        "enabled": true,
        "urls": [{
            "id": "aff-1",
            "url": "https://partner.example/conv?src=shop",
            "deliveryMethod": "beacon",
            "patterns": [
                {"id": "thanks", "pattern": "/thank-you", "matchType": "contains"},
                {"id": "broken", "pattern": "([unclosed", "matchType": "regex"}
            ]
        }]
    }
}"#;

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

fn builder(transport: Arc<StubTransport>) -> TrackerBuilder {
    TrackerBuilder::from_json(CONFIG)
        .unwrap()
        .with_transport(transport)
        .with_random(Arc::new(SequenceRandom::constant(0.5)))
        .with_page(PageContext::new("https://shop.example/checkout/thank-you?order=7"))
}

#[tokio::test(start_paused = true)]
async fn page_load_to_unload() {
    let transport = Arc::new(StubTransport::default());
    let jar = Arc::new(MemoryCookieJar::new());
    let tracker = builder(transport.clone())
        .with_cookie_jar(jar.clone())
        .build()
        .unwrap();

    let outcome = tracker.start().unwrap();
    let CheckOutcome::Matched { scheduled, limited } = outcome else {
        panic!("thank-you page should match");
    };
    assert_eq!(scheduled[0].pattern_id.as_deref(), Some("thanks"));
    assert!(limited.is_empty());

    // Past the fire delay, before the batch timer.
    tokio::time::sleep(Duration::from_secs(3)).await;
    settle().await;

    let partner = transport.beacons.lock().unwrap().clone();
    assert!(
        partner
            .iter()
            .any(|(url, body)| url == "https://partner.example/conv?src=shop" && body.is_none())
    );
    assert!(transport.images.lock().unwrap().is_empty());
    let telemetry = transport.beacon_payloads("https://api.yourtracking.com/v1/events/affiliate");
    assert_eq!(telemetry.len(), 1);
    assert_eq!(telemetry[0]["success"], true);
    assert!(jar.cookie_header().contains("_aff_attr="));
    assert_eq!(tracker.current_affiliate_id().as_deref(), Some("aff-1"));

    tracker.track_conversion(120.0, Properties::new());
    assert_eq!(tracker.unload(), 2);

    let batches = transport.beacon_payloads("https://api.yourtracking.com/v1/events");
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0]["tracking_code"], "TRK-900");
    let events = batches[0]["events"].as_array().unwrap();
    assert_eq!(events[0]["event_name"], "pageview");
    assert_eq!(events[0]["affiliate_url_id"], Value::Null);
    assert_eq!(events[1]["event_name"], "conversion");
    assert_eq!(events[1]["affiliate_url_id"], "aff-1");
    assert_eq!(events[1]["org_id"], "org-1");
    assert!(transport.posts.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn daily_limit_survives_a_new_page_load() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("limits.redb");

    let first = builder(Arc::new(StubTransport::default()))
        .with_durable_path(&db_path)
        .build()
        .unwrap();
    assert!(matches!(
        first.start(),
        Some(CheckOutcome::Matched { ref scheduled, .. }) if scheduled.len() == 1
    ));
    drop(first);

    let second = builder(Arc::new(StubTransport::default()))
        .with_durable_path(&db_path)
        .build()
        .unwrap();
    assert_eq!(
        second.start(),
        Some(CheckOutcome::Matched {
            scheduled: vec![],
            limited: vec!["aff-1".to_string()],
        })
    );
}

#[tokio::test(start_paused = true)]
async fn timer_flush_retries_server_errors() {
    let transport = Arc::new(StubTransport::default());
    transport.statuses.lock().unwrap().extend([502, 200]);
    let tracker = builder(transport.clone()).build().unwrap();

    tracker.track_event("newsletter_open", Properties::new());
    tokio::time::sleep(Duration::from_millis(5100)).await;
    settle().await;
    assert_eq!(transport.posts.lock().unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    settle().await;
    let posts = transport.posts.lock().unwrap().clone();
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].1, posts[1].1);

    let snapshot = tracker.metrics().unwrap();
    assert_eq!(snapshot.pipeline.batches_delivered, 1);
    assert_eq!(snapshot.pipeline.events_delivered, 1);
}

#[tokio::test]
async fn client_only_mode_skips_the_ingestion_endpoint() {
    let transport = Arc::new(StubTransport::default());
    let sink = Arc::new(PixelSink::default());
    let config = universal_tracker::TrackerConfig::from_json(CONFIG)
        .unwrap()
        .with_mode(universal_tracker::DataCollectionMode::ClientOnly);
    let tracker = Tracker::builder(config)
        .with_transport(transport.clone())
        .with_client_destination(sink.clone())
        .build()
        .unwrap();

    tracker.track_event("add_to_wishlist", Properties::new());
    assert_eq!(tracker.flush(), 1);
    settle().await;

    assert_eq!(*sink.0.lock().unwrap(), vec!["add_to_wishlist".to_string()]);
    assert!(transport.posts.lock().unwrap().is_empty());
    assert!(transport.beacons.lock().unwrap().is_empty());
}
