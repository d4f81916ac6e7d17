use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Canonical commerce event names produced by the instrumentation layer.
pub const PAGE_VIEW: &str = "page_view";
pub const VIEW_ITEM: &str = "view_item";
pub const ADD_TO_CART: &str = "add_to_cart";
pub const REMOVE_FROM_CART: &str = "remove_from_cart";
pub const PACKAGE_SWAP: &str = "package_swap";
pub const PURCHASE: &str = "purchase";
pub const UPSELL_VIEW: &str = "upsell_view";
pub const UPSELL_ACCEPT: &str = "upsell_accept";
pub const UPSELL_SKIP: &str = "upsell_skip";
pub const USER_DATA: &str = "user_data";

/// Metadata stamped onto every event by the dispatch manager at enrichment
/// time. Producers never construct this; a submitted event carries `None`
/// until it passes through `push()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventMetadata {
    pub session_id: String,
    pub sequence: u64,
    pub debug: bool,
    pub source: String,
    pub schema_version: String,
}

/// One cart/order line. `items` order on the enclosing block matches the
/// cart or list display order and must be preserved end to end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineItem {
    pub item_id: String,
    pub item_name: String,
    pub price: Decimal,
    pub quantity: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_list_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EcommerceBlock {
    pub currency: String,
    pub value: Decimal,
    pub items: Vec<LineItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping: Option<Decimal>,
}

impl EcommerceBlock {
    pub fn new(currency: impl Into<String>, value: Decimal) -> Self {
        Self {
            currency: currency.into(),
            value,
            items: Vec::new(),
            transaction_id: None,
            coupon: None,
            tax: None,
            shipping: None,
        }
    }

    pub fn with_items(mut self, items: Vec<LineItem>) -> Self {
        self.items = items;
        self
    }
}

/// The normalized event every producer converges to before adapter fan-out.
///
/// `name` and `id` are immutable once assigned. The id is composed of
/// session id, per-session sequence and a unix-millis timestamp, so it is
/// globally unique within a session; it is empty until the dispatch manager
/// enriches the event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CanonicalEvent {
    pub name: String,
    pub id: String,
    pub time: DateTime<Utc>,
    pub properties: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ecommerce: Option<EcommerceBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
    /// Routing flag: deliver via the pending queue on the next page load
    /// instead of the current one. Cleared when the event is persisted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub redirect_pending: bool,
}

impl CanonicalEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: String::new(),
            time: Utc::now(),
            properties: Map::new(),
            ecommerce: None,
            metadata: None,
            redirect_pending: false,
        }
    }

    pub fn with_ecommerce(mut self, block: EcommerceBlock) -> Self {
        self.ecommerce = Some(block);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn will_redirect(mut self) -> Self {
        self.redirect_pending = true;
        self
    }

    /// True for identity/user-data assertions, which every page emits fresh.
    pub fn is_identity(&self) -> bool {
        self.name == USER_DATA
    }
}
