//! Central dispatch: every canonical event enters through [`DispatchManager::push`],
//! gets validated (debug mode), enriched, optionally transformed, and either
//! parked in the pending queue for a redirect or fanned out to every enabled
//! provider adapter. Adapter failures are isolated per adapter; neither the
//! caller nor sibling adapters ever see them.

use crate::pending::PendingQueue;
use crate::providers::ProviderAdapter;
use crate::session::SessionTracker;
use crate::validator::Validator;
use chrono::Utc;
use common::config::Config;
use common::storage::Storage;
use common::types::{CanonicalEvent, EventMetadata};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEBUG_KEY: &str = "analytics.debug";

/// Snapshot of the hosting page at event time.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PageContext {
    pub url: String,
    pub title: String,
    pub referrer: String,
    pub viewport: String,
}

/// Where the current page context comes from. The snapshot is cached by the
/// dispatcher until `invalidate_context()`.
pub trait ContextSource: Send + Sync {
    fn page_context(&self) -> PageContext;
}

/// Marketing attribution parameters (utm tags, click ids). An empty map
/// means "no attribution" and is omitted from events entirely.
pub trait AttributionSource: Send + Sync {
    fn attribution(&self) -> Map<String, Value>;
}

pub struct StaticContext(pub PageContext);

impl ContextSource for StaticContext {
    fn page_context(&self) -> PageContext {
        self.0.clone()
    }
}

pub struct NoAttribution;

impl AttributionSource for NoAttribution {
    fn attribution(&self) -> Map<String, Value> {
        Map::new()
    }
}

/// Applied to every event after enrichment; returning `None` drops it.
pub type GlobalTransform = Arc<dyn Fn(CanonicalEvent) -> Option<CanonicalEvent> + Send + Sync>;

pub struct DispatchManager {
    storage: Arc<dyn Storage>,
    session: SessionTracker,
    pending: PendingQueue,
    validator: Validator,
    providers: Mutex<Vec<Arc<dyn ProviderAdapter>>>,
    transform: Mutex<Option<GlobalTransform>>,
    context_source: Arc<dyn ContextSource>,
    attribution_source: Arc<dyn AttributionSource>,
    context_cache: Mutex<Option<PageContext>>,
    event_log: Mutex<VecDeque<CanonicalEvent>>,
    log_capacity: usize,
    sequence: AtomicU64,
    debug: AtomicBool,
    source: String,
    schema_version: String,
}

impl DispatchManager {
    pub fn new(
        cfg: &Config,
        storage: Arc<dyn Storage>,
        context_source: Arc<dyn ContextSource>,
        attribution_source: Arc<dyn AttributionSource>,
    ) -> Self {
        // A persisted debug toggle survives reloads and wins over config.
        let debug = match storage.read(DEBUG_KEY) {
            Ok(Some(raw)) => raw == "true",
            _ => cfg.general.debug,
        };
        Self {
            session: SessionTracker::new(
                storage.clone(),
                Duration::from_secs(cfg.session.timeout_secs),
            ),
            pending: PendingQueue::new(
                storage.clone(),
                Duration::from_secs(cfg.pending.staleness_secs),
            ),
            validator: Validator::with_default_schemas(&cfg.dispatch.schema_version),
            storage,
            providers: Mutex::new(Vec::new()),
            transform: Mutex::new(None),
            context_source,
            attribution_source,
            context_cache: Mutex::new(None),
            event_log: Mutex::new(VecDeque::new()),
            log_capacity: cfg.dispatch.event_log_capacity,
            sequence: AtomicU64::new(0),
            debug: AtomicBool::new(debug),
            source: cfg.general.source.clone(),
            schema_version: cfg.dispatch.schema_version.clone(),
        }
    }

    pub fn add_provider(&self, adapter: Arc<dyn ProviderAdapter>) {
        self.providers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(adapter);
    }

    pub fn set_transform(&self, transform: GlobalTransform) {
        *self.transform.lock().unwrap_or_else(|e| e.into_inner()) = Some(transform);
    }

    pub fn set_debug(&self, on: bool) {
        self.debug.store(on, Ordering::Relaxed);
        let raw = if on { "true" } else { "false" };
        if let Err(error) = self.storage.write(DEBUG_KEY, raw) {
            tracing::warn!(%error, "failed to persist debug flag");
        }
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Drops the cached page context so the next event re-reads it.
    pub fn invalidate_context(&self) {
        self.context_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Resets the sequence counter and the in-memory event log. Persisted
    /// state (session, pending queue) is untouched.
    pub fn clear(&self) {
        self.sequence.store(0, Ordering::Relaxed);
        self.event_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn recent_events(&self) -> Vec<CanonicalEvent> {
        self.event_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    /// Single ingress for the whole pipeline. Infallible to the caller:
    /// every failure mode downstream is logged and counted instead.
    pub async fn push(&self, mut event: CanonicalEvent) {
        if self.debug_enabled() {
            let report = self.validator.validate(&event);
            for warning in &report.warnings {
                tracing::debug!(event = %event.name, warning, "validation warning");
            }
            if !report.valid {
                // Diagnostics only: invalid events still flow.
                tracing::warn!(
                    event = %event.name,
                    errors = ?report.errors,
                    "event failed validation"
                );
            }
        }

        self.enrich(&mut event);

        let transform = self
            .transform
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(transform) = transform {
            match transform(event) {
                Some(transformed) => event = transformed,
                None => {
                    metrics::counter!("pipeline_events_dropped_total").increment(1);
                    tracing::debug!("event dropped by global transform");
                    return;
                }
            }
        }

        if event.redirect_pending {
            self.pending.queue_event(event);
            return;
        }

        self.deliver(event).await;
    }

    /// Replays events parked before a redirect through the immediate path.
    /// Call once, early in startup, before live traffic begins.
    pub async fn process_pending_events(&self) {
        for event in self.pending.take_for_delivery() {
            self.deliver(event).await;
        }
    }

    fn enrich(&self, event: &mut CanonicalEvent) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let session_id = self.session.current();
        if event.id.is_empty() {
            event.id = format!("{session_id}-{sequence}-{}", Utc::now().timestamp_millis());
        }
        event.metadata = Some(EventMetadata {
            session_id,
            sequence,
            debug: self.debug_enabled(),
            source: self.source.clone(),
            schema_version: self.schema_version.clone(),
        });

        let attribution = self.attribution_source.attribution();
        if !attribution.is_empty() {
            event
                .properties
                .insert("attribution".to_string(), Value::Object(attribution));
        }

        let context = self.page_context();
        event.properties.insert(
            "page".to_string(),
            serde_json::to_value(&context).unwrap_or(Value::Null),
        );
    }

    fn page_context(&self) -> PageContext {
        let mut cache = self.context_cache.lock().unwrap_or_else(|e| e.into_inner());
        match &*cache {
            Some(ctx) => ctx.clone(),
            None => {
                let ctx = self.context_source.page_context();
                *cache = Some(ctx.clone());
                ctx
            }
        }
    }

    async fn deliver(&self, event: CanonicalEvent) {
        {
            let mut log = self.event_log.lock().unwrap_or_else(|e| e.into_inner());
            if log.len() >= self.log_capacity {
                log.pop_front();
            }
            log.push_back(event.clone());
        }
        metrics::counter!("pipeline_events_dispatched_total").increment(1);

        // Snapshot under the lock, await outside it.
        let providers: Vec<Arc<dyn ProviderAdapter>> = self
            .providers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for adapter in providers {
            if !adapter.is_enabled() {
                continue;
            }
            if let Err(error) = adapter.track_event(&event).await {
                metrics::counter!(
                    "pipeline_adapter_errors_total",
                    "adapter" => adapter.name()
                )
                .increment(1);
                tracing::warn!(
                    adapter = adapter.name(),
                    event = %event.name,
                    %error,
                    "adapter rejected event"
                );
            }
        }
    }
}
