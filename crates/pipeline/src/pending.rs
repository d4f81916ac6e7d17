//! Redirect-durable pending queue.
//!
//! Events flagged as redirect-pending are written here instead of being
//! delivered on the current page; the next page's first processing pass
//! drains them. The storage key is removed before anything is delivered,
//! which makes replay at-most-once: a crash mid-delivery loses an entry,
//! it never duplicates one.

use chrono::{DateTime, Utc};
use common::storage::Storage;
use common::types::CanonicalEvent;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PENDING_KEY: &str = "analytics.pending_events";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingEntry {
    pub event: CanonicalEvent,
    pub queued_at: DateTime<Utc>,
    pub entry_id: String,
}

pub struct PendingQueue {
    storage: Arc<dyn Storage>,
    staleness: chrono::Duration,
    counter: AtomicU64,
}

impl PendingQueue {
    pub fn new(storage: Arc<dyn Storage>, staleness: Duration) -> Self {
        Self {
            storage,
            staleness: chrono::Duration::from_std(staleness)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
            counter: AtomicU64::new(0),
        }
    }

    /// Appends an event to the persisted list. The redirect flag is cleared
    /// on the stored copy so replay cannot re-queue it.
    pub fn queue_event(&self, mut event: CanonicalEvent) {
        event.redirect_pending = false;

        let now = Utc::now();
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let entry = PendingEntry {
            event,
            queued_at: now,
            entry_id: format!("pe{}-{n}", now.timestamp_millis()),
        };

        let mut entries = self.load_or_reset();
        entries.push(entry);

        match serde_json::to_string(&entries) {
            Ok(raw) => {
                if let Err(error) = self.storage.write(PENDING_KEY, &raw) {
                    tracing::warn!(%error, "failed to persist pending queue; entry lost");
                } else {
                    metrics::counter!("pipeline_pending_queued_total").increment(1);
                }
            }
            Err(error) => tracing::warn!(%error, "pending entry not serializable; entry lost"),
        }
    }

    /// Read-only view of what is currently queued, for introspection.
    pub fn pending_entries(&self) -> Vec<PendingEntry> {
        self.load_or_reset()
    }

    /// Drains the queue for replay on a fresh page:
    /// - the storage key is removed before anything is returned
    ///   (at-most-once),
    /// - identity events are dropped (the new page asserts its own),
    /// - entries past the staleness threshold are dropped undelivered,
    /// - survivors come back sorted by queue time ascending, recreating
    ///   the original order even if storage saw out-of-order writes.
    pub fn take_for_delivery(&self) -> Vec<CanonicalEvent> {
        let entries = self.load_or_reset();
        if let Err(error) = self.storage.remove(PENDING_KEY) {
            tracing::warn!(%error, "failed to clear pending queue key");
        }
        if entries.is_empty() {
            return Vec::new();
        }

        let cutoff = Utc::now() - self.staleness;
        let mut survivors: Vec<PendingEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.event.is_identity() {
                tracing::debug!(
                    entry_id = %entry.entry_id,
                    "dropping queued identity event; page emits a fresh one"
                );
                continue;
            }
            if entry.queued_at < cutoff {
                metrics::counter!("pipeline_pending_expired_total").increment(1);
                tracing::debug!(
                    entry_id = %entry.entry_id,
                    queued_at = %entry.queued_at,
                    "dropping stale pending entry"
                );
                continue;
            }
            survivors.push(entry);
        }

        survivors.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        metrics::counter!("pipeline_pending_replayed_total").increment(survivors.len() as u64);
        survivors.into_iter().map(|e| e.event).collect()
    }

    pub fn clear(&self) {
        if let Err(error) = self.storage.remove(PENDING_KEY) {
            tracing::warn!(%error, "failed to clear pending queue key");
        }
    }

    /// Loads the persisted list; a corrupt or unreadable record resets the
    /// key so one bad write cannot wedge the queue forever.
    fn load_or_reset(&self) -> Vec<PendingEntry> {
        match self.storage.read(PENDING_KEY) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(entries) => entries,
                Err(error) => {
                    tracing::warn!(%error, "corrupt pending queue; resetting key");
                    self.clear();
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(error) => {
                tracing::warn!(%error, "pending queue unreadable; resetting key");
                self.clear();
                Vec::new()
            }
        }
    }
}
