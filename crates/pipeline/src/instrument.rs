//! Auto-instrumentation: turns raw domain events from the bus into
//! canonical commerce events and pushes them into the dispatcher.
//!
//! The bus handler is synchronous, so it only forwards the event into an
//! `mpsc` channel; a worker task owns the debounce state and does the
//! async work. Debounce is leading-edge per event name: the first
//! occurrence passes, recurrences inside the window are dropped outright
//! (never queued), and the next occurrence past the boundary passes again.
//!
//! Canonical events are priced from [`CartSource`] / [`CampaignSource`]
//! at build time, not at emit time, so bursts that survive debouncing
//! always carry the latest known pricing.

use crate::bus::{EventBus, Handler};
use crate::dispatch::DispatchManager;
use crate::events::{DomainEvent, DOMAIN_EVENT_NAMES};
use common::config::Debounce;
use common::types::{
    self as names, CanonicalEvent, EcommerceBlock, LineItem,
};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Read-only view of the current cart.
#[derive(Debug, Clone, Default)]
pub struct CartSnapshot {
    pub currency: String,
    pub total: Decimal,
    pub items: Vec<LineItem>,
}

pub trait CartSource: Send + Sync {
    fn snapshot(&self) -> CartSnapshot;
    fn item(&self, item_id: &str) -> Option<LineItem>;
}

/// Read-only view of campaign offers (packages, upsells).
pub trait CampaignSource: Send + Sync {
    fn offer_item(&self, offer_id: &str) -> Option<LineItem>;
}

pub struct Instrumentation {
    handler: Handler,
    task: tokio::task::JoinHandle<()>,
}

impl Instrumentation {
    /// Subscribes to every domain event name and starts the worker.
    pub fn spawn(
        bus: &EventBus,
        dispatch: Arc<DispatchManager>,
        cart: Arc<dyn CartSource>,
        campaign: Arc<dyn CampaignSource>,
        windows: &Debounce,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<DomainEvent>(256);
        let handler: Handler = Arc::new(move |event: &DomainEvent| {
            tx.try_send(event.clone())
                .map_err(|_| anyhow::anyhow!("instrumentation channel full"))
        });
        for name in DOMAIN_EVENT_NAMES {
            bus.on(name, handler.clone());
        }

        let worker = Worker {
            dispatch,
            cart,
            campaign,
            windows: windows.clone(),
            last_accepted: HashMap::new(),
        };
        let task = tokio::spawn(worker.run(rx));
        Self { handler, task }
    }

    /// Unsubscribes from the bus; the worker drains and exits once the
    /// channel closes.
    pub fn detach(&self, bus: &EventBus) {
        for name in DOMAIN_EVENT_NAMES {
            bus.off(name, &self.handler);
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

struct Worker {
    dispatch: Arc<DispatchManager>,
    cart: Arc<dyn CartSource>,
    campaign: Arc<dyn CampaignSource>,
    windows: Debounce,
    /// Last accepted instant per domain event name.
    last_accepted: HashMap<&'static str, Instant>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<DomainEvent>) {
        while let Some(event) = rx.recv().await {
            if !self.accept(&event) {
                metrics::counter!("pipeline_debounced_total").increment(1);
                tracing::debug!(event = event.name(), "dropped inside debounce window");
                continue;
            }
            self.handle(event).await;
        }
    }

    fn accept(&mut self, event: &DomainEvent) -> bool {
        let window = self.window_for(event);
        if window.is_zero() {
            return true;
        }
        let now = Instant::now();
        match self.last_accepted.get(event.name()) {
            Some(last) if now.duration_since(*last) < window => false,
            _ => {
                self.last_accepted.insert(event.name(), now);
                true
            }
        }
    }

    fn window_for(&self, event: &DomainEvent) -> Duration {
        let ms = match event {
            DomainEvent::CartQuantityChanged { .. } => self.windows.cart_quantity_ms,
            DomainEvent::CartItemAdded { .. } | DomainEvent::CartItemRemoved { .. } => {
                self.windows.cart_item_ms
            }
            DomainEvent::PackageSwapped { .. } => self.windows.package_swap_ms,
            DomainEvent::OrderCompleted { .. } => self.windows.order_ms,
            DomainEvent::UpsellViewed { .. }
            | DomainEvent::UpsellAccepted { .. }
            | DomainEvent::UpsellSkipped { .. } => self.windows.upsell_ms,
            DomainEvent::RouteChanged { .. } => self.windows.route_ms,
        };
        Duration::from_millis(ms)
    }

    async fn handle(&self, event: DomainEvent) {
        match event {
            DomainEvent::CartItemAdded { item_id, quantity } => {
                self.push_cart_line(names::ADD_TO_CART, &item_id, Some(quantity))
                    .await;
            }
            DomainEvent::CartItemRemoved { item_id } => {
                self.push_cart_line(names::REMOVE_FROM_CART, &item_id, None)
                    .await;
            }
            // A quantity change is an add with the new quantity; backends
            // treat the latest line state as authoritative.
            DomainEvent::CartQuantityChanged { item_id, quantity } => {
                self.push_cart_line(names::ADD_TO_CART, &item_id, Some(quantity))
                    .await;
            }
            DomainEvent::PackageSwapped {
                from_package,
                to_package,
            } => {
                let mut event = CanonicalEvent::new(names::PACKAGE_SWAP)
                    .with_property("from_package", json!(from_package))
                    .with_property("to_package", json!(to_package));
                if let Some(item) = self.campaign.offer_item(&to_package) {
                    let value = line_value(&item);
                    event = event.with_ecommerce(
                        EcommerceBlock::new(self.cart.snapshot().currency, value)
                            .with_items(vec![item]),
                    );
                }
                self.dispatch.push(event).await;
            }
            DomainEvent::OrderCompleted {
                order_id,
                tax,
                shipping,
                coupon,
            } => {
                let snapshot = self.cart.snapshot();
                let mut block = EcommerceBlock::new(snapshot.currency, snapshot.total)
                    .with_items(snapshot.items);
                block.transaction_id = Some(order_id);
                block.tax = tax;
                block.shipping = shipping;
                block.coupon = coupon;
                self.dispatch
                    .push(CanonicalEvent::new(names::PURCHASE).with_ecommerce(block))
                    .await;
            }
            DomainEvent::UpsellViewed { offer_id } => {
                self.dispatch
                    .push(
                        CanonicalEvent::new(names::UPSELL_VIEW)
                            .with_property("offer_id", json!(offer_id)),
                    )
                    .await;
            }
            DomainEvent::UpsellAccepted { offer_id } => {
                let mut event = CanonicalEvent::new(names::UPSELL_ACCEPT)
                    .with_property("offer_id", json!(offer_id));
                match self.campaign.offer_item(&offer_id) {
                    Some(item) => {
                        let value = line_value(&item);
                        event = event.with_ecommerce(
                            EcommerceBlock::new(self.cart.snapshot().currency, value)
                                .with_items(vec![item]),
                        );
                    }
                    None => {
                        tracing::debug!(offer_id, "accepted upsell has no campaign item");
                    }
                }
                self.dispatch.push(event).await;
            }
            DomainEvent::UpsellSkipped { offer_id } => {
                self.dispatch
                    .push(
                        CanonicalEvent::new(names::UPSELL_SKIP)
                            .with_property("offer_id", json!(offer_id)),
                    )
                    .await;
            }
            DomainEvent::RouteChanged { path, title } => {
                // The cached page snapshot is stale the moment the route
                // changes; the page_view below re-reads it.
                self.dispatch.invalidate_context();
                self.dispatch
                    .push(
                        CanonicalEvent::new(names::PAGE_VIEW)
                            .with_property("path", json!(path))
                            .with_property("title", json!(title)),
                    )
                    .await;
                // Each page asserts identity fresh; queued copies from the
                // previous page are dropped by the pending queue.
                self.dispatch
                    .push(CanonicalEvent::new(names::USER_DATA))
                    .await;
            }
        }
    }

    /// add/remove built from current cart pricing; unknown items still
    /// produce a bare event so the funnel is not silently truncated.
    async fn push_cart_line(&self, name: &str, item_id: &str, quantity: Option<u32>) {
        let mut event = CanonicalEvent::new(name).with_property("item_id", json!(item_id));
        match self.cart.item(item_id) {
            Some(mut item) => {
                if let Some(quantity) = quantity {
                    item.quantity = quantity;
                }
                let value = line_value(&item);
                event = event.with_ecommerce(
                    EcommerceBlock::new(self.cart.snapshot().currency, value)
                        .with_items(vec![item]),
                );
            }
            None => {
                tracing::debug!(item_id, "cart line not found; emitting without pricing");
            }
        }
        self.dispatch.push(event).await;
    }
}

fn line_value(item: &LineItem) -> Decimal {
    item.price * Decimal::from(item.quantity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{NoAttribution, PageContext, StaticContext};
    use common::config::Config;
    use common::storage::MemoryStorage;
    use std::str::FromStr;
    use tokio::task::yield_now;
    use tokio::time::advance;

    struct FakeCart {
        snapshot: CartSnapshot,
    }

    impl CartSource for FakeCart {
        fn snapshot(&self) -> CartSnapshot {
            self.snapshot.clone()
        }

        fn item(&self, item_id: &str) -> Option<LineItem> {
            self.snapshot
                .items
                .iter()
                .find(|i| i.item_id == item_id)
                .cloned()
        }
    }

    struct FakeCampaign {
        offers: Vec<LineItem>,
    }

    impl CampaignSource for FakeCampaign {
        fn offer_item(&self, offer_id: &str) -> Option<LineItem> {
            self.offers.iter().find(|i| i.item_id == offer_id).cloned()
        }
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn line(item_id: &str, name: &str, price: &str, quantity: u32) -> LineItem {
        LineItem {
            item_id: item_id.to_string(),
            item_name: name.to_string(),
            price: dec(price),
            quantity,
            item_list_name: None,
            index: None,
        }
    }

    struct Fixture {
        bus: EventBus,
        dispatch: Arc<DispatchManager>,
        instrumentation: Instrumentation,
    }

    fn fixture(cart_items: Vec<LineItem>, offers: Vec<LineItem>) -> Fixture {
        let cfg = Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        let dispatch = Arc::new(DispatchManager::new(
            &cfg,
            Arc::new(MemoryStorage::new()),
            Arc::new(StaticContext(PageContext {
                url: "https://shop.example.com/".to_string(),
                title: "Shop".to_string(),
                referrer: String::new(),
                viewport: "1280x800".to_string(),
            })),
            Arc::new(NoAttribution),
        ));
        let total = cart_items
            .iter()
            .map(|i| i.price * Decimal::from(i.quantity))
            .sum();
        let cart = Arc::new(FakeCart {
            snapshot: CartSnapshot {
                currency: "EUR".to_string(),
                total,
                items: cart_items,
            },
        });
        let bus = EventBus::new();
        let instrumentation = Instrumentation::spawn(
            &bus,
            dispatch.clone(),
            cart,
            Arc::new(FakeCampaign { offers }),
            &cfg.debounce,
        );
        Fixture {
            bus,
            dispatch,
            instrumentation,
        }
    }

    async fn settle() {
        for _ in 0..8 {
            yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cart_add_builds_priced_add_to_cart() {
        let fx = fixture(vec![line("sku-1", "Espresso Cups", "12.50", 1)], vec![]);

        fx.bus.emit(&DomainEvent::CartItemAdded {
            item_id: "sku-1".to_string(),
            quantity: 2,
        });
        settle().await;

        let recent = fx.dispatch.recent_events();
        assert_eq!(recent.len(), 1);
        let event = &recent[0];
        assert_eq!(event.name, names::ADD_TO_CART);
        let block = event.ecommerce.as_ref().unwrap();
        assert_eq!(block.currency, "EUR");
        assert_eq!(block.value, dec("25.00"));
        assert_eq!(block.items[0].quantity, 2, "domain quantity wins");
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_drops_recurrences_inside_window() {
        let fx = fixture(vec![line("sku-1", "Espresso Cups", "12.50", 1)], vec![]);
        let event = DomainEvent::CartQuantityChanged {
            item_id: "sku-1".to_string(),
            quantity: 3,
        };

        // cart_quantity window is 500ms: burst of five produces one event.
        for _ in 0..5 {
            fx.bus.emit(&event);
            settle().await;
        }
        assert_eq!(fx.dispatch.recent_events().len(), 1);

        // The next occurrence past the boundary is accepted again.
        advance(Duration::from_millis(500)).await;
        fx.bus.emit(&event);
        settle().await;
        assert_eq!(fx.dispatch.recent_events().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_window_events_never_debounced() {
        let fx = fixture(vec![], vec![]);
        let event = DomainEvent::PackageSwapped {
            from_package: "starter".to_string(),
            to_package: "pro".to_string(),
        };

        fx.bus.emit(&event);
        fx.bus.emit(&event);
        settle().await;

        assert_eq!(fx.dispatch.recent_events().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_completed_builds_purchase_in_cart_order() {
        let fx = fixture(
            vec![
                line("sku-1", "Espresso Cups", "12.50", 2),
                line("sku-2", "Grinder", "89.00", 1),
            ],
            vec![],
        );

        fx.bus.emit(&DomainEvent::OrderCompleted {
            order_id: "ord-42".to_string(),
            tax: Some(dec("19.00")),
            shipping: Some(dec("4.90")),
            coupon: Some("WELCOME10".to_string()),
        });
        settle().await;

        let recent = fx.dispatch.recent_events();
        assert_eq!(recent.len(), 1);
        let block = recent[0].ecommerce.as_ref().unwrap();
        assert_eq!(recent[0].name, names::PURCHASE);
        assert_eq!(block.transaction_id.as_deref(), Some("ord-42"));
        assert_eq!(block.value, dec("114.00"));
        assert_eq!(block.tax, Some(dec("19.00")));
        assert_eq!(block.coupon.as_deref(), Some("WELCOME10"));
        let ids: Vec<_> = block.items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, ["sku-1", "sku-2"], "display order preserved");
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_change_emits_page_view_and_fresh_identity() {
        let fx = fixture(vec![], vec![]);

        fx.bus.emit(&DomainEvent::RouteChanged {
            path: "/checkout".to_string(),
            title: "Checkout".to_string(),
        });
        settle().await;

        let recent = fx.dispatch.recent_events();
        let event_names: Vec<_> = recent.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(event_names, [names::PAGE_VIEW, names::USER_DATA]);
        assert_eq!(recent[0].properties["path"], json!("/checkout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_upsell_priced_from_campaign() {
        let fx = fixture(vec![], vec![line("offer-7", "Extended Warranty", "15.00", 1)]);

        fx.bus.emit(&DomainEvent::UpsellAccepted {
            offer_id: "offer-7".to_string(),
        });
        settle().await;

        let recent = fx.dispatch.recent_events();
        assert_eq!(recent[0].name, names::UPSELL_ACCEPT);
        let block = recent[0].ecommerce.as_ref().unwrap();
        assert_eq!(block.value, dec("15.00"));
        assert_eq!(block.items[0].item_name, "Extended Warranty");
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsell_view_and_skip_are_bare_events() {
        let fx = fixture(vec![], vec![]);

        fx.bus.emit(&DomainEvent::UpsellViewed {
            offer_id: "offer-7".to_string(),
        });
        advance(Duration::from_millis(200)).await;
        fx.bus.emit(&DomainEvent::UpsellSkipped {
            offer_id: "offer-7".to_string(),
        });
        settle().await;

        let recent = fx.dispatch.recent_events();
        let event_names: Vec<_> = recent.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(event_names, [names::UPSELL_VIEW, names::UPSELL_SKIP]);
        assert!(recent.iter().all(|e| e.ecommerce.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_stops_forwarding() {
        let fx = fixture(vec![], vec![]);

        fx.instrumentation.detach(&fx.bus);
        fx.bus.emit(&DomainEvent::UpsellViewed {
            offer_id: "offer-7".to_string(),
        });
        settle().await;

        assert!(fx.dispatch.recent_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_cart_line_emits_without_pricing() {
        let fx = fixture(vec![], vec![]);

        fx.bus.emit(&DomainEvent::CartItemRemoved {
            item_id: "sku-gone".to_string(),
        });
        settle().await;

        let recent = fx.dispatch.recent_events();
        assert_eq!(recent[0].name, names::REMOVE_FROM_CART);
        assert_eq!(recent[0].properties["item_id"], json!("sku-gone"));
        assert!(recent[0].ecommerce.is_none());
    }
}
