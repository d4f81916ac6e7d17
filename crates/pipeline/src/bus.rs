//! In-process event bus keyed by domain event name.
//!
//! Producers (cart, checkout, upsell flows) emit onto the bus; the
//! instrumentation layer is the primary consumer. Handlers run
//! synchronously in emit order, and one failing handler never suppresses
//! the rest — availability of analytics beats strictness here.

use crate::events::DomainEvent;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type Handler = Arc<dyn Fn(&DomainEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<String, Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `name`. Registering the same `Arc` twice
    /// under one name is a no-op (set semantics by pointer identity);
    /// returns whether the handler was actually added.
    pub fn on(&self, name: &str, handler: Handler) -> bool {
        let mut map = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let list = map.entry(name.to_string()).or_default();
        if list.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return false;
        }
        list.push(handler);
        true
    }

    /// Unregisters a handler by pointer identity; returns whether it was
    /// found.
    pub fn off(&self, name: &str, handler: &Handler) -> bool {
        let mut map = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = map.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|h| !Arc::ptr_eq(h, handler));
        let removed = list.len() != before;
        if list.is_empty() {
            map.remove(name);
        }
        removed
    }

    /// Invokes every handler registered for the event's name, FIFO in
    /// registration order. The handler list is snapshotted at emit time, so
    /// handlers added or removed during emit take effect on the next emit.
    /// A handler error is logged and counted, never propagated.
    pub fn emit(&self, event: &DomainEvent) {
        let snapshot: Vec<Handler> = {
            let map = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            map.get(event.name()).cloned().unwrap_or_default()
        };

        for handler in snapshot {
            if let Err(error) = handler(event) {
                metrics::counter!("pipeline_handler_errors_total").increment(1);
                tracing::warn!(
                    event = event.name(),
                    %error,
                    "bus handler failed; continuing with remaining handlers"
                );
            }
        }
    }

    /// Drops all handlers for `name`, or every handler when `name` is None.
    pub fn remove_all(&self, name: Option<&str>) {
        let mut map = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        match name {
            Some(n) => {
                map.remove(n);
            }
            None => map.clear(),
        }
    }

    pub fn handler_count(&self, name: &str) -> usize {
        let map = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        map.get(name).map_or(0, Vec::len)
    }
}
