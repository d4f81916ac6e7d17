use anyhow::Result;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

mod bus;
mod dispatch;
mod events;
mod instrument;
mod metrics;
mod pending;
mod providers;
mod session;
mod validator;

use common::types::LineItem;
use dispatch::{DispatchManager, NoAttribution, PageContext, StaticContext};
use instrument::{CampaignSource, CartSnapshot, CartSource, Instrumentation};
use providers::http_sink::{HttpSinkAdapter, HttpSinkConfig};
use providers::partner::{HttpPartnerTransport, PartnerAdapter};
use providers::pixel::PixelAdapter;
use providers::tag_manager::{DataLayerSink, TagManagerAdapter};

/// Stand-in for a real tag-manager data layer: pushes land in the log.
struct LoggingSink;

impl DataLayerSink for LoggingSink {
    fn push(&self, value: serde_json::Value) {
        tracing::info!(payload = %value, "data layer push");
    }
}

struct DemoCart {
    snapshot: CartSnapshot,
}

impl CartSource for DemoCart {
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

struct DemoCampaign {
    offers: Vec<LineItem>,
}

impl CampaignSource for DemoCampaign {
    fn offer_item(&self, offer_id: &str) -> Option<LineItem> {
        self.offers.iter().find(|i| i.item_id == offer_id).cloned()
    }
}

fn line(item_id: &str, name: &str, price: &str, quantity: u32) -> LineItem {
    LineItem {
        item_id: item_id.to_string(),
        item_name: name.to_string(),
        price: Decimal::from_str(price).unwrap_or_default(),
        quantity,
        item_list_name: None,
        index: None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;

    let dispatch_log = common::observability::build_dispatch(&config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch_log).map_err(anyhow::Error::msg)?;

    tracing::info!("storefront analytics pipeline starting");

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    std::fs::create_dir_all("data")?;
    let storage: Arc<dyn common::storage::Storage> =
        Arc::new(common::storage::FileStorage::new("data"));

    let manager = Arc::new(DispatchManager::new(
        &config,
        storage,
        Arc::new(StaticContext(PageContext {
            url: "https://shop.example.com/".to_string(),
            title: "Storefront".to_string(),
            referrer: String::new(),
            viewport: "1280x800".to_string(),
        })),
        Arc::new(NoAttribution),
    ));

    manager.add_provider(Arc::new(TagManagerAdapter::new(
        Arc::new(LoggingSink),
        &config.dispatch.structured_prefix,
    )));
    manager.add_provider(Arc::new(PixelAdapter::new(&config.pixel)?));
    manager.add_provider(Arc::new(PartnerAdapter::new(
        HttpPartnerTransport::new(&config.partner)?,
        &config.partner.site_key,
    )));
    let sink = Arc::new(HttpSinkAdapter::spawn(
        HttpSinkConfig::from_config(&config.http_sink, &config.general.source),
        None,
    )?);
    manager.add_provider(sink.clone());

    // Replay whatever the previous page parked before redirecting, before
    // any live traffic produces fresh events.
    manager.process_pending_events().await;

    let bus = bus::EventBus::new();
    let cart = Arc::new(DemoCart {
        snapshot: CartSnapshot {
            currency: "EUR".to_string(),
            total: Decimal::from_str("114.00").unwrap_or_default(),
            items: vec![
                line("sku-1", "Espresso Cups", "12.50", 2),
                line("sku-2", "Grinder", "89.00", 1),
            ],
        },
    });
    let campaign = Arc::new(DemoCampaign {
        offers: vec![line("offer-7", "Extended Warranty", "15.00", 1)],
    });
    let instrumentation =
        Instrumentation::spawn(&bus, manager.clone(), cart, campaign, &config.debounce);

    // Synthetic storefront session to exercise the whole path.
    bus.emit(&events::DomainEvent::RouteChanged {
        path: "/".to_string(),
        title: "Storefront".to_string(),
    });
    bus.emit(&events::DomainEvent::CartItemAdded {
        item_id: "sku-1".to_string(),
        quantity: 2,
    });
    bus.emit(&events::DomainEvent::UpsellViewed {
        offer_id: "offer-7".to_string(),
    });
    bus.emit(&events::DomainEvent::UpsellAccepted {
        offer_id: "offer-7".to_string(),
    });
    bus.emit(&events::DomainEvent::OrderCompleted {
        order_id: format!("ord-{}", chrono::Utc::now().timestamp()),
        tax: Some(Decimal::from_str("19.00").unwrap_or_default()),
        shipping: None,
        coupon: None,
    });

    // Let the instrumentation worker drain, then force the sink out.
    tokio::time::sleep(Duration::from_millis(500)).await;
    sink.flush().await;
    instrumentation.detach(&bus);

    tracing::info!(
        recent = manager.recent_events().len(),
        "synthetic session complete"
    );
    Ok(())
}
