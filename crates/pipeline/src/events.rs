//! Domain event definitions emitted by storefront flows onto the bus.
//!
//! These are the raw signals (cart mutations, checkout completion, upsell
//! interactions, route changes) that the instrumentation layer turns into
//! canonical commerce events. Producers never talk to providers directly.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// An item was added to the cart.
    CartItemAdded { item_id: String, quantity: u32 },

    /// An item was removed from the cart.
    CartItemRemoved { item_id: String },

    /// The quantity of a cart line changed. Fires on every click of a
    /// stepper control, so it carries the widest debounce window.
    CartQuantityChanged { item_id: String, quantity: u32 },

    /// The selected package/bundle was swapped for another.
    PackageSwapped {
        from_package: String,
        to_package: String,
    },

    /// Checkout finished; the order exists upstream.
    OrderCompleted {
        order_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tax: Option<Decimal>,
        #[serde(skip_serializing_if = "Option::is_none")]
        shipping: Option<Decimal>,
        #[serde(skip_serializing_if = "Option::is_none")]
        coupon: Option<String>,
    },

    /// An upsell offer was shown.
    UpsellViewed { offer_id: String },

    /// An upsell offer was accepted.
    UpsellAccepted { offer_id: String },

    /// An upsell offer was dismissed.
    UpsellSkipped { offer_id: String },

    /// The page route changed (SPA navigation or fresh load).
    RouteChanged { path: String, title: String },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CartItemAdded { .. } => "cart_item_added",
            Self::CartItemRemoved { .. } => "cart_item_removed",
            Self::CartQuantityChanged { .. } => "cart_quantity_changed",
            Self::PackageSwapped { .. } => "package_swapped",
            Self::OrderCompleted { .. } => "order_completed",
            Self::UpsellViewed { .. } => "upsell_viewed",
            Self::UpsellAccepted { .. } => "upsell_accepted",
            Self::UpsellSkipped { .. } => "upsell_skipped",
            Self::RouteChanged { .. } => "route_changed",
        }
    }
}

/// Every domain event name, in one place so consumers can subscribe to the
/// full set without enumerating variants by hand.
pub const DOMAIN_EVENT_NAMES: &[&str] = &[
    "cart_item_added",
    "cart_item_removed",
    "cart_quantity_changed",
    "package_swapped",
    "order_completed",
    "upsell_viewed",
    "upsell_accepted",
    "upsell_skipped",
    "route_changed",
];
