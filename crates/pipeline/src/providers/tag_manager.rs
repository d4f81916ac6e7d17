//! Tag-manager adapter.
//!
//! Translates canonical events into the flat object shape tag managers
//! consume and pushes them into a `DataLayerSink`. Structured (prefixed)
//! events get a `{"ecommerce": null}` clearing sentinel pushed first so a
//! previous event's nested commerce object can never leak into the next
//! one inside the consumer's object model.

use super::ProviderAdapter;
use anyhow::Result;
use async_trait::async_trait;
use common::types::{self, CanonicalEvent, EcommerceBlock};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Destination for tag-manager pushes. In a browser build this fronts the
/// page's data-layer array; tests and headless runs record or log pushes.
pub trait DataLayerSink: Send + Sync {
    fn push(&self, value: Value);
}

/// Sink that remembers every push, used by tests and the debug tooling.
#[derive(Default)]
pub struct RecordingSink {
    pushes: Mutex<Vec<Value>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushes(&self) -> Vec<Value> {
        self.pushes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl DataLayerSink for RecordingSink {
    fn push(&self, value: Value) {
        self.pushes.lock().unwrap_or_else(|e| e.into_inner()).push(value);
    }
}

pub struct TagManagerAdapter {
    sink: Arc<dyn DataLayerSink>,
    structured_prefix: String,
    enabled: AtomicBool,
}

impl TagManagerAdapter {
    pub fn new(sink: Arc<dyn DataLayerSink>, structured_prefix: impl Into<String>) -> Self {
        Self {
            sink,
            structured_prefix: structured_prefix.into(),
            enabled: AtomicBool::new(true),
        }
    }

    fn is_structured(&self, event: &CanonicalEvent) -> bool {
        !self.structured_prefix.is_empty() && event.name.starts_with(&self.structured_prefix)
    }

    fn payload(event: &CanonicalEvent) -> Value {
        let mut object = Map::new();
        object.insert("event".to_string(), json!(event.name));
        object.insert("event_id".to_string(), json!(event.id));
        for (key, value) in &event.properties {
            object.insert(key.clone(), value.clone());
        }
        if let Some(metadata) = &event.metadata {
            object.insert("session_id".to_string(), json!(metadata.session_id));
            object.insert("sequence".to_string(), json!(metadata.sequence));
        }
        if let Some(ecommerce) = &event.ecommerce {
            object.insert(
                "ecommerce".to_string(),
                Self::commerce_object(&event.name, ecommerce),
            );
        }
        Value::Object(object)
    }

    /// Nested commerce object with event-type-specific fields: the
    /// transaction id, tax and shipping only belong on a purchase.
    fn commerce_object(event_name: &str, block: &EcommerceBlock) -> Value {
        let mut object = Map::new();
        object.insert("currency".to_string(), json!(block.currency));
        object.insert("value".to_string(), json!(block.value));
        object.insert("items".to_string(), json!(block.items));
        if let Some(coupon) = &block.coupon {
            object.insert("coupon".to_string(), json!(coupon));
        }
        if event_name == types::PURCHASE {
            if let Some(tx) = &block.transaction_id {
                object.insert("transaction_id".to_string(), json!(tx));
            }
            if let Some(tax) = block.tax {
                object.insert("tax".to_string(), json!(tax));
            }
            if let Some(shipping) = block.shipping {
                object.insert("shipping".to_string(), json!(shipping));
            }
        }
        Value::Object(object)
    }
}

#[async_trait]
impl ProviderAdapter for TagManagerAdapter {
    fn name(&self) -> &'static str {
        "tag_manager"
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    async fn track_event(&self, event: &CanonicalEvent) -> Result<()> {
        if self.is_structured(event) {
            self.sink.push(json!({ "ecommerce": null }));
        }
        self.sink.push(Self::payload(event));
        Ok(())
    }
}
