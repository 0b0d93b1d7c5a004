//! Network boundary used by the batcher, the delivery strategy and telemetry.
//!
//! The engine never talks to a concrete HTTP stack directly. Everything goes
//! through [`Transport`] so hosts can plug in their own delivery primitives and
//! tests can record traffic.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http transport error: {0}")]
    Network(String),
    #[error("endpoint rejected payload with status {0}")]
    Status(u16),
}

/// Contract for the outbound network primitives the tracker relies on.
///
/// `post_json` and `fetch_get` are awaited by callers that care about the
/// outcome. `send_beacon` and `load_image` are fire-and-forget: they return
/// whether the request was queued, never whether it arrived.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST a JSON body and report the response status.
    async fn post_json(&self, url: &str, body: &str) -> Result<u16, TransportError>;

    /// Credential-less GET whose response is ignored.
    async fn fetch_get(&self, url: &str) -> Result<(), TransportError>;

    /// Best-effort delivery that must survive page teardown.
    fn send_beacon(&self, url: &str, body: Option<String>) -> bool;

    /// Image-pixel style GET.
    fn load_image(&self, url: &str) -> bool;
}

/// Returns true for 2xx statuses.
pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}
