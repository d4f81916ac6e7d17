//! Generic HTTP sink with size-or-time batching and linear-backoff retry.
//!
//! All batching state lives in one worker task fed by a command channel,
//! so there is no locking and no re-entrancy hazard: the buffer is drained
//! atomically before a send begins, and a retry entry leaves the map only
//! after a successful send. A manual `flush()` racing a due retry can
//! therefore never double-send an event.
//!
//! Per-event lifecycle: queued -> batched -> sent, or failed ->
//! retry-scheduled -> retry-sent / retry-exhausted. Exhausted events are
//! dropped with a single terminal-failure log; there is no dead-letter
//! persistence by design.

use super::ProviderAdapter;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use common::types::CanonicalEvent;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

pub type EventTransform = Arc<dyn Fn(&CanonicalEvent) -> Value + Send + Sync>;

#[derive(Clone)]
pub struct HttpSinkConfig {
    pub endpoint: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub request_timeout: Duration,
    pub source: String,
}

impl HttpSinkConfig {
    pub fn from_config(cfg: &common::config::HttpSink, source: &str) -> Self {
        Self {
            endpoint: cfg.endpoint.clone(),
            batch_size: cfg.batch_size.max(1),
            flush_interval: Duration::from_millis(cfg.flush_interval_ms),
            max_retries: cfg.max_retries,
            retry_base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
            source: source.to_string(),
        }
    }
}

/// Transport seam so tests drive the worker without a network.
pub trait BatchTransport: Send + Sync {
    fn send(&self, body: &Value) -> impl Future<Output = Result<()>> + Send;
}

pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }
}

impl BatchTransport for HttpTransport {
    async fn send(&self, body: &Value) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

enum Command {
    Track(Box<CanonicalEvent>),
    Flush(oneshot::Sender<()>),
}

pub struct HttpSinkAdapter {
    enabled: AtomicBool,
    tx: mpsc::Sender<Command>,
}

impl HttpSinkAdapter {
    pub fn spawn(cfg: HttpSinkConfig, transform: Option<EventTransform>) -> Result<Self> {
        let transport = HttpTransport::new(&cfg.endpoint, cfg.request_timeout)?;
        Ok(Self::spawn_with_transport(cfg, transport, transform))
    }

    pub fn spawn_with_transport<T: BatchTransport + 'static>(
        cfg: HttpSinkConfig,
        transport: T,
        transform: Option<EventTransform>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let worker = Worker {
            cfg,
            transport,
            transform,
            buffer: Vec::new(),
            first_buffered_at: None,
            retries: HashMap::new(),
        };
        tokio::spawn(worker.run(rx));
        Self {
            enabled: AtomicBool::new(true),
            tx,
        }
    }

    /// Force-drains the buffer, awaiting until the worker has emptied it.
    /// Callers invoke this proactively before a known page unload.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpSinkAdapter {
    fn name(&self) -> &'static str {
        "http_sink"
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    async fn track_event(&self, event: &CanonicalEvent) -> Result<()> {
        self.tx
            .send(Command::Track(Box::new(event.clone())))
            .await
            .ok()
            .context("http sink worker is gone")
    }
}

struct RetryEntry {
    event: CanonicalEvent,
    /// Failed send attempts so far (the initial batch send not counted).
    attempts: u32,
    next_attempt_at: Instant,
}

struct Worker<T: BatchTransport> {
    cfg: HttpSinkConfig,
    transport: T,
    transform: Option<EventTransform>,
    buffer: Vec<CanonicalEvent>,
    /// Set when the first event lands in an empty buffer; the debounce
    /// flush fires `flush_interval` after this point.
    first_buffered_at: Option<Instant>,
    retries: HashMap<String, RetryEntry>,
}

impl<T: BatchTransport> Worker<T> {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            let far = Instant::now() + Duration::from_secs(86_400);
            let flush_deadline = self
                .first_buffered_at
                .map(|t| t + self.cfg.flush_interval);
            let retry_deadline = self.retries.values().map(|r| r.next_attempt_at).min();

            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Track(event)) => self.enqueue(*event).await,
                    Some(Command::Flush(ack)) => {
                        self.drain_buffer().await;
                        let _ = ack.send(());
                    }
                    None => {
                        self.drain_buffer().await;
                        break;
                    }
                },
                () = tokio::time::sleep_until(flush_deadline.unwrap_or(far)),
                    if flush_deadline.is_some() =>
                {
                    self.flush_buffer().await;
                }
                () = tokio::time::sleep_until(retry_deadline.unwrap_or(far)),
                    if retry_deadline.is_some() =>
                {
                    self.retry_due().await;
                }
            }
        }
    }

    async fn enqueue(&mut self, event: CanonicalEvent) {
        if self.buffer.is_empty() {
            self.first_buffered_at = Some(Instant::now());
        }
        self.buffer.push(event);
        if self.buffer.len() >= self.cfg.batch_size {
            self.flush_buffer().await;
        }
    }

    /// Iterates until the buffer is genuinely empty; a send can take long
    /// enough that more events queued behind the flush command.
    async fn drain_buffer(&mut self) {
        while !self.buffer.is_empty() {
            self.flush_buffer().await;
        }
    }

    async fn flush_buffer(&mut self) {
        // Atomic drain before the async send begins; anything arriving
        // mid-send starts a fresh batch.
        let batch: Vec<CanonicalEvent> = self.buffer.drain(..).collect();
        self.first_buffered_at = None;
        if batch.is_empty() {
            return;
        }
        self.send_batch(batch).await;
    }

    async fn retry_due(&mut self) {
        let now = Instant::now();
        let mut due_ids: Vec<String> = self
            .retries
            .iter()
            .filter(|(_, entry)| entry.next_attempt_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        if due_ids.is_empty() {
            return;
        }
        due_ids.sort();

        let batch: Vec<CanonicalEvent> = due_ids
            .iter()
            .map(|id| self.retries[id].event.clone())
            .collect();
        // This send is attempt #(attempts + 1) for each entry.
        for id in &due_ids {
            if let Some(entry) = self.retries.get_mut(id) {
                entry.attempts += 1;
            }
        }
        self.send_batch(batch).await;
    }

    async fn send_batch(&mut self, events: Vec<CanonicalEvent>) {
        let payloads: Vec<Value> = events
            .iter()
            .map(|event| match &self.transform {
                Some(transform) => transform(event),
                None => serde_json::to_value(event).unwrap_or(Value::Null),
            })
            .collect();
        let body = json!({
            "sent_at": Utc::now(),
            "source": self.cfg.source,
            "batch_size": events.len(),
            "events": payloads,
        });

        match self.transport.send(&body).await {
            Ok(()) => {
                metrics::counter!("pipeline_batches_flushed_total").increment(1);
                // Success is the only path that removes a retry entry.
                for event in &events {
                    self.retries.remove(&event.id);
                }
            }
            Err(error) => {
                tracing::warn!(
                    batch_size = events.len(),
                    %error,
                    "batch send failed; scheduling per-event retries"
                );
                for event in events {
                    self.schedule_retry(event);
                }
            }
        }
    }

    fn schedule_retry(&mut self, event: CanonicalEvent) {
        let id = event.id.clone();
        let attempts = self.retries.get(&id).map_or(0, |entry| entry.attempts);

        if attempts >= self.cfg.max_retries {
            self.retries.remove(&id);
            metrics::counter!("pipeline_terminal_failures_total").increment(1);
            tracing::error!(
                event_id = %id,
                event = %event.name,
                attempts,
                "event permanently failed after retries; dropping"
            );
            return;
        }

        // Linear backoff: delay = base x upcoming attempt number.
        let delay = self.cfg.retry_base_delay * (attempts + 1);
        metrics::counter!("pipeline_retries_scheduled_total").increment(1);
        self.retries.insert(
            id,
            RetryEntry {
                event,
                attempts,
                next_attempt_at: Instant::now() + delay,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::task::yield_now;
    use tokio::time::advance;

    struct FakeTransport {
        bodies: Mutex<Vec<Value>>,
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl FakeTransport {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                bodies: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                fail_first,
            })
        }

        fn body_count(&self) -> usize {
            self.bodies.lock().unwrap().len()
        }

        fn event_names(&self, body_idx: usize) -> Vec<String> {
            self.bodies.lock().unwrap()[body_idx]["events"]
                .as_array()
                .unwrap()
                .iter()
                .map(|e| e["name"].as_str().unwrap().to_string())
                .collect()
        }
    }

    impl BatchTransport for Arc<FakeTransport> {
        async fn send(&self, body: &Value) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                anyhow::bail!("connection refused");
            }
            self.bodies.lock().unwrap().push(body.clone());
            Ok(())
        }
    }

    fn config(batch_size: usize) -> HttpSinkConfig {
        HttpSinkConfig {
            endpoint: "https://collect.example.com/v1/batch".to_string(),
            batch_size,
            flush_interval: Duration::from_millis(2000),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
            request_timeout: Duration::from_millis(5000),
            source: "storefront-sdk".to_string(),
        }
    }

    fn event(name: &str, id: &str) -> CanonicalEvent {
        let mut e = CanonicalEvent::new(name);
        e.id = id.to_string();
        e
    }

    async fn settle() {
        for _ in 0..8 {
            yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_immediately() {
        let transport = FakeTransport::new(0);
        let adapter =
            HttpSinkAdapter::spawn_with_transport(config(3), transport.clone(), None);

        for i in 0..3 {
            adapter.track_event(&event("page_view", &format!("e{i}"))).await.unwrap();
        }
        settle().await;

        assert_eq!(transport.body_count(), 1);
        assert_eq!(
            transport.bodies.lock().unwrap()[0]["batch_size"],
            json!(3)
        );

        // No leftover buffer: a forced flush sends nothing new.
        adapter.flush().await;
        assert_eq!(transport.body_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushes_after_interval() {
        let transport = FakeTransport::new(0);
        let adapter =
            HttpSinkAdapter::spawn_with_transport(config(10), transport.clone(), None);

        adapter.track_event(&event("page_view", "e0")).await.unwrap();
        adapter.track_event(&event("add_to_cart", "e1")).await.unwrap();
        settle().await;
        assert_eq!(transport.body_count(), 0, "nothing before the interval");

        advance(Duration::from_millis(2000)).await;
        settle().await;

        assert_eq!(transport.body_count(), 1);
        assert_eq!(transport.event_names(0), ["page_view", "add_to_cart"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_reappears_in_retry() {
        // First request fails, retry succeeds.
        let transport = FakeTransport::new(1);
        let adapter =
            HttpSinkAdapter::spawn_with_transport(config(2), transport.clone(), None);

        adapter.track_event(&event("purchase", "e0")).await.unwrap();
        adapter.track_event(&event("page_view", "e1")).await.unwrap();
        settle().await;
        assert_eq!(transport.body_count(), 0, "initial send failed");

        // First retry due after base_delay x 1.
        advance(Duration::from_millis(1000)).await;
        settle().await;

        assert_eq!(transport.body_count(), 1);
        let mut names = transport.event_names(0);
        names.sort();
        assert_eq!(names, ["page_view", "purchase"]);

        // Nothing further: the retry map must be empty after success.
        advance(Duration::from_millis(60_000)).await;
        settle().await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    // Plain #[test] with a hand-built paused runtime: the worker task has
    // to poll on the thread holding the local recorder so its counter
    // increments are captured.
    #[test]
    fn test_retry_exhaustion_drops_event() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                // Never succeeds: initial + max_retries attempts, then
                // silence.
                let transport = FakeTransport::new(usize::MAX);
                let adapter =
                    HttpSinkAdapter::spawn_with_transport(config(1), transport.clone(), None);

                adapter.track_event(&event("purchase", "e0")).await.unwrap();
                settle().await;
                assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

                // Linear backoff: retries due after 1s, then 2s, then 3s.
                for (delay_ms, expected_calls) in [(1000, 2), (2000, 3), (3000, 4)] {
                    advance(Duration::from_millis(delay_ms)).await;
                    settle().await;
                    assert_eq!(transport.calls.load(Ordering::SeqCst), expected_calls);
                }

                // Exhausted: no further attempts no matter how long we wait.
                advance(Duration::from_secs(300)).await;
                settle().await;
                assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
            });
        });

        // The permanent drop is signalled exactly once.
        let rendered = handle.render();
        assert!(
            rendered.contains("pipeline_terminal_failures_total 1"),
            "expected exactly one terminal failure, got:\n{rendered}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_flush_drains_early() {
        let transport = FakeTransport::new(0);
        let adapter =
            HttpSinkAdapter::spawn_with_transport(config(10), transport.clone(), None);

        adapter.track_event(&event("page_view", "e0")).await.unwrap();
        adapter.flush().await;

        assert_eq!(transport.body_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_does_not_resend_retry_map_entries() {
        let transport = FakeTransport::new(1);
        let adapter =
            HttpSinkAdapter::spawn_with_transport(config(1), transport.clone(), None);

        adapter.track_event(&event("purchase", "e0")).await.unwrap();
        settle().await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        // A manual flush before the retry is due only drains the buffer;
        // the retry entry stays scheduled and fires exactly once.
        adapter.flush().await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.body_count(), 1);
        assert_eq!(transport.event_names(0), ["purchase"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transform_applied_per_event() {
        let transport = FakeTransport::new(0);
        let transform: EventTransform =
            Arc::new(|event| json!({ "n": event.name, "renamed": true }));
        let adapter = HttpSinkAdapter::spawn_with_transport(
            config(1),
            transport.clone(),
            Some(transform),
        );

        adapter.track_event(&event("page_view", "e0")).await.unwrap();
        settle().await;

        let bodies = transport.bodies.lock().unwrap();
        assert_eq!(bodies[0]["events"][0], json!({ "n": "page_view", "renamed": true }));
        assert_eq!(bodies[0]["source"], "storefront-sdk");
    }
}
