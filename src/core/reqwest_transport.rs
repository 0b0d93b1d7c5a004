//! Reqwest-based implementation of the [`Transport`] trait.
//!
//! Fire-and-forget primitives are spawned onto the ambient tokio runtime. When
//! no runtime is running they report `false` instead of blocking.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tokio::runtime::Handle;

use super::transport::{Transport, TransportError};

/// Reqwest-backed transport used outside of tests.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Builds a client that never stores cookies, so the tracker's own requests
    /// stay credential-less.
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .build()
            .map_err(|err| TransportError::Network(err.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing reqwest client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn spawn_get(&self, url: &str) -> bool {
        let Ok(handle) = Handle::try_current() else {
            log::debug!("no runtime for background GET {}", url);
            return false;
        };
        let client = self.client.clone();
        let url = url.to_string();
        handle.spawn(async move {
            if let Err(err) = client.get(&url).send().await {
                log::debug!("background GET {} failed: {}", url, err);
            }
        });
        true
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post_json(&self, url: &str, body: &str) -> Result<u16, TransportError> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        Ok(response.status().as_u16())
    }

    async fn fetch_get(&self, url: &str) -> Result<(), TransportError> {
        self.client
            .get(url)
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        Ok(())
    }

    fn send_beacon(&self, url: &str, body: Option<String>) -> bool {
        let Ok(handle) = Handle::try_current() else {
            log::debug!("no runtime for beacon to {}", url);
            return false;
        };
        let client = self.client.clone();
        let url = url.to_string();
        handle.spawn(async move {
            let mut request = client.post(&url);
            if let Some(body) = body {
                request = request.header(CONTENT_TYPE, "application/json").body(body);
            }
            if let Err(err) = request.send().await {
                log::debug!("beacon to {} failed: {}", url, err);
            }
        });
        true
    }

    fn load_image(&self, url: &str) -> bool {
        self.spawn_get(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_primitives_need_a_runtime() {
        let transport = ReqwestTransport::new().unwrap();
        assert!(!transport.load_image("https://example.com/pixel.gif"));
        assert!(!transport.send_beacon("https://example.com/beacon", None));
    }
}
