//! Delivery of outbound affiliate requests.

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::config::DeliveryMethod;
use crate::core::Transport;

/// Picks the transport primitive for an affiliate request. The return value
/// reports whether the request was handed off, not whether it arrived.
#[derive(Clone)]
pub struct DeliveryStrategy {
    transport: Arc<dyn Transport>,
}

impl DeliveryStrategy {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn fire(&self, url: &str, method: DeliveryMethod) -> bool {
        match method {
            DeliveryMethod::Pixel => self.transport.load_image(url),
            DeliveryMethod::Beacon => self.transport.send_beacon(url, None),
            DeliveryMethod::Fetch => self.fire_fetch(url),
        }
    }

    fn fire_fetch(&self, url: &str) -> bool {
        let Ok(handle) = Handle::try_current() else {
            log::debug!("no runtime for fetch delivery to {}", url);
            return false;
        };
        let transport = self.transport.clone();
        let url = url.to_string();
        handle.spawn(async move {
            if let Err(err) = transport.fetch_get(&url).await {
                log::debug!("fetch delivery to {} failed: {}", url, err);
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingTransport;

    #[tokio::test]
    async fn each_method_uses_its_primitive() {
        let transport = Arc::new(RecordingTransport::new());
        let delivery = DeliveryStrategy::new(transport.clone());

        assert!(delivery.fire("https://p.example/img", DeliveryMethod::Pixel));
        assert!(delivery.fire("https://p.example/beacon", DeliveryMethod::Beacon));
        assert!(delivery.fire("https://p.example/fetch", DeliveryMethod::Fetch));
        tokio::task::yield_now().await;

        assert_eq!(transport.images(), vec!["https://p.example/img".to_string()]);
        assert_eq!(transport.beacon_urls(), vec!["https://p.example/beacon".to_string()]);
        assert_eq!(transport.fetches(), vec!["https://p.example/fetch".to_string()]);
    }

    #[tokio::test]
    async fn fetch_errors_are_swallowed() {
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_fetches();
        let delivery = DeliveryStrategy::new(transport.clone());

        assert!(delivery.fire("https://p.example/fetch", DeliveryMethod::Fetch));
        tokio::task::yield_now().await;
        assert_eq!(transport.fetches().len(), 1);
    }

    #[test]
    fn refused_primitive_reports_failure() {
        let transport = Arc::new(RecordingTransport::new());
        transport.refuse_images();
        let delivery = DeliveryStrategy::new(transport);
        assert!(!delivery.fire("https://p.example/img", DeliveryMethod::Pixel));
    }
}
