//! Pixel adapter.
//!
//! Sends one GET per event to a pixel collection endpoint. Delivery is
//! fire-and-forget with a bounded request timeout; a dead endpoint means
//! dropped events, never an error surfaced to the pipeline. Purchases are
//! deduplicated with a deterministic identifier derived from the store
//! name and the order's transaction id, so a page reload cannot
//! double-count a conversion.

use super::ProviderAdapter;
use anyhow::Result;
use async_trait::async_trait;
use common::config::Pixel;
use common::types::{self, CanonicalEvent};
use reqwest::Url;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub struct PixelAdapter {
    endpoint: String,
    store_name: String,
    client: reqwest::Client,
    enabled: AtomicBool,
    sent_conversions: Mutex<HashSet<String>>,
}

impl PixelAdapter {
    pub fn new(cfg: &Pixel) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()?;
        Ok(Self {
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            store_name: cfg.store_name.clone(),
            client,
            enabled: AtomicBool::new(true),
            sent_conversions: Mutex::new(HashSet::new()),
        })
    }

    /// Deterministic conversion id: the same order on the same store maps
    /// to the same id on every page load.
    fn conversion_id(&self, transaction_id: &str) -> String {
        format!("{}_{transaction_id}", self.store_name)
    }

    fn pixel_event_name(canonical: &str) -> &str {
        match canonical {
            types::PAGE_VIEW => "PageView",
            types::VIEW_ITEM => "ViewContent",
            types::ADD_TO_CART => "AddToCart",
            types::PURCHASE => "Purchase",
            other => other,
        }
    }

    fn request_url(&self, event: &CanonicalEvent) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("ev", Self::pixel_event_name(&event.name));
            qp.append_pair("eid", &event.id);
            qp.append_pair("store", &self.store_name);
            if let Some(ecommerce) = &event.ecommerce {
                qp.append_pair("cur", &ecommerce.currency);
                qp.append_pair("val", &ecommerce.value.to_string());
                if let Some(tx) = &ecommerce.transaction_id {
                    qp.append_pair("tx", tx);
                }
            }
        }
        Ok(url)
    }

    /// Records the conversion id, returning false if it was already sent.
    /// The id is claimed before the request goes out, so an in-flight
    /// duplicate is suppressed as well.
    fn claim_conversion(&self, event: &CanonicalEvent) -> bool {
        if event.name != types::PURCHASE {
            return true;
        }
        let Some(tx) = event
            .ecommerce
            .as_ref()
            .and_then(|e| e.transaction_id.as_deref())
        else {
            // No transaction id to dedup on; send and let the validator
            // complain in debug mode.
            return true;
        };
        self.sent_conversions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(self.conversion_id(tx))
    }
}

#[async_trait]
impl ProviderAdapter for PixelAdapter {
    fn name(&self) -> &'static str {
        "pixel"
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    async fn track_event(&self, event: &CanonicalEvent) -> Result<()> {
        if !self.claim_conversion(event) {
            tracing::debug!(
                event = %event.name,
                "pixel conversion already sent; skipping duplicate"
            );
            return Ok(());
        }

        let url = self.request_url(event)?;
        match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::debug!(
                    event = %event.name,
                    status = %response.status(),
                    "pixel endpoint rejected event; dropping"
                );
            }
            Err(error) => {
                tracing::debug!(
                    event = %event.name,
                    %error,
                    "pixel endpoint unreachable; dropping event"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::EcommerceBlock;
    use rust_decimal::Decimal;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn adapter() -> PixelAdapter {
        PixelAdapter::new(&Pixel {
            endpoint: "https://px.example.com/collect".to_string(),
            store_name: "demo-store".to_string(),
            request_timeout_ms: 5000,
        })
        .unwrap()
    }

    fn purchase(tx: &str) -> CanonicalEvent {
        let mut block = EcommerceBlock::new("USD", dec("10.00"));
        block.transaction_id = Some(tx.to_string());
        CanonicalEvent::new(types::PURCHASE).with_ecommerce(block)
    }

    #[test]
    fn test_request_url_carries_event_and_commerce_params() {
        let adapter = adapter();
        let url = adapter.request_url(&purchase("ord-1")).unwrap().to_string();

        assert!(url.contains("ev=Purchase"));
        assert!(url.contains("store=demo-store"));
        assert!(url.contains("cur=USD"));
        assert!(url.contains("val=10.00"));
        assert!(url.contains("tx=ord-1"));
    }

    #[test]
    fn test_event_name_mapping() {
        assert_eq!(PixelAdapter::pixel_event_name("page_view"), "PageView");
        assert_eq!(PixelAdapter::pixel_event_name("add_to_cart"), "AddToCart");
        assert_eq!(PixelAdapter::pixel_event_name("view_item"), "ViewContent");
        // Unmapped names pass through as-is.
        assert_eq!(PixelAdapter::pixel_event_name("upsell_view"), "upsell_view");
    }

    #[test]
    fn test_purchase_dedup_is_per_transaction() {
        let adapter = adapter();

        assert!(adapter.claim_conversion(&purchase("ord-1")));
        // Same order again (page reload): suppressed.
        assert!(!adapter.claim_conversion(&purchase("ord-1")));
        // A different order is its own conversion.
        assert!(adapter.claim_conversion(&purchase("ord-2")));
    }

    #[test]
    fn test_non_purchase_events_never_deduped() {
        let adapter = adapter();
        let event = CanonicalEvent::new(types::PAGE_VIEW);

        assert!(adapter.claim_conversion(&event));
        assert!(adapter.claim_conversion(&event));
    }

    #[test]
    fn test_conversion_id_is_deterministic() {
        let adapter = adapter();
        assert_eq!(adapter.conversion_id("ord-1"), "demo-store_ord-1");
        assert_eq!(adapter.conversion_id("ord-1"), "demo-store_ord-1");
    }
}
