//! Session identity with timeout-based rotation.
//!
//! The session record lives in persistent storage so the id survives page
//! navigations; it rotates once the gap since the last touch exceeds the
//! configured timeout (default 30 minutes). Storage failures fall back to
//! an ephemeral id rather than failing the event.

use chrono::{DateTime, Utc};
use common::storage::Storage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SESSION_KEY: &str = "analytics.session";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    id: String,
    last_seen: DateTime<Utc>,
}

pub struct SessionTracker {
    storage: Arc<dyn Storage>,
    timeout: chrono::Duration,
    counter: AtomicU64,
}

impl SessionTracker {
    pub fn new(storage: Arc<dyn Storage>, timeout: Duration) -> Self {
        Self {
            storage,
            timeout: chrono::Duration::from_std(timeout)
                .unwrap_or_else(|_| chrono::Duration::minutes(30)),
            counter: AtomicU64::new(0),
        }
    }

    /// Returns the current session id, rotating first if the session has
    /// expired, and refreshes `last_seen`.
    pub fn current(&self) -> String {
        let now = Utc::now();

        let existing = match self.storage.read(SESSION_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<SessionRecord>(&raw) {
                Ok(record) => Some(record),
                Err(error) => {
                    tracing::warn!(%error, "corrupt session record; rotating");
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(%error, "session storage unreadable; using ephemeral id");
                return self.new_id(now);
            }
        };

        let record = match existing {
            Some(mut record) if now - record.last_seen <= self.timeout => {
                record.last_seen = now;
                record
            }
            _ => SessionRecord {
                id: self.new_id(now),
                last_seen: now,
            },
        };

        if let Ok(raw) = serde_json::to_string(&record) {
            if let Err(error) = self.storage.write(SESSION_KEY, &raw) {
                tracing::warn!(%error, "failed to persist session record");
            }
        }

        record.id
    }

    fn new_id(&self, now: DateTime<Utc>) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("s{}-{n}", now.timestamp_millis())
    }
}
