//! Shared stubs for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::core::{KeyValueStore, StorageError, Transport, TransportError};

/// Transport that records every request. `post_json` answers from a scripted
/// status queue and falls back to 200.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    posts: Mutex<Vec<(String, String)>>,
    beacons: Mutex<Vec<(String, Option<String>)>>,
    images: Mutex<Vec<String>>,
    fetches: Mutex<Vec<String>>,
    statuses: Mutex<VecDeque<Option<u16>>>,
    refuse_images: AtomicBool,
    fail_fetches: AtomicBool,
}

impl RecordingTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue responses for upcoming posts; `None` is a network error.
    pub(crate) fn script_statuses(&self, statuses: impl IntoIterator<Item = Option<u16>>) {
        self.statuses.lock().unwrap().extend(statuses);
    }

    pub(crate) fn refuse_images(&self) {
        self.refuse_images.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_fetches(&self) {
        self.fail_fetches.store(true, Ordering::SeqCst);
    }

    pub(crate) fn posts(&self) -> Vec<(String, String)> {
        self.posts.lock().unwrap().clone()
    }

    pub(crate) fn beacons(&self) -> Vec<(String, Option<String>)> {
        self.beacons.lock().unwrap().clone()
    }

    pub(crate) fn beacon_urls(&self) -> Vec<String> {
        self.beacons().into_iter().map(|(url, _)| url).collect()
    }

    pub(crate) fn images(&self) -> Vec<String> {
        self.images.lock().unwrap().clone()
    }

    pub(crate) fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn post_json(&self, url: &str, body: &str) -> Result<u16, TransportError> {
        self.posts
            .lock()
            .unwrap()
            .push((url.to_string(), body.to_string()));
        match self.statuses.lock().unwrap().pop_front() {
            Some(Some(status)) => Ok(status),
            Some(None) => Err(TransportError::Network("connection reset".into())),
            None => Ok(200),
        }
    }

    async fn fetch_get(&self, url: &str) -> Result<(), TransportError> {
        self.fetches.lock().unwrap().push(url.to_string());
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(TransportError::Network("blocked".into()));
        }
        Ok(())
    }

    fn send_beacon(&self, url: &str, body: Option<String>) -> bool {
        self.beacons.lock().unwrap().push((url.to_string(), body));
        true
    }

    fn load_image(&self, url: &str) -> bool {
        if self.refuse_images.load(Ordering::SeqCst) {
            return false;
        }
        self.images.lock().unwrap().push(url.to_string());
        true
    }
}

/// Store whose every read and write fails, like storage in a private window.
pub(crate) struct UnavailableStore;

impl KeyValueStore for UnavailableStore {
    fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::Unavailable("storage disabled".into()))
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("storage disabled".into()))
    }

    fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("storage disabled".into()))
    }
}

/// Lets spawned tasks that are ready run to completion.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
