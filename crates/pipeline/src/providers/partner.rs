//! Partner-script adapter.
//!
//! The partner backend needs a one-time registration of the site key
//! before it accepts traffic. That handshake runs lazily on the first
//! event and exactly once: concurrent callers await the in-flight
//! handshake instead of starting another. A failed handshake behaves like
//! a partner script that never loaded — events are silently dropped for
//! the rest of the page lifetime.
//!
//! By design only page views are mapped; every other event is a no-op,
//! not an error.

use super::ProviderAdapter;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::config::Partner;
use common::types::{self, CanonicalEvent};
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;

pub trait PartnerTransport: Send + Sync {
    /// Registers the site key; returns the partner session token.
    fn handshake(&self, site_key: &str) -> impl Future<Output = Result<String>> + Send;

    fn send_page_view(
        &self,
        session: &str,
        path: &str,
        title: &str,
    ) -> impl Future<Output = Result<()>> + Send;
}

pub struct HttpPartnerTransport {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpPartnerTransport {
    pub fn new(cfg: &Partner) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.handshake_timeout_ms))
            .build()?;
        Ok(Self {
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl PartnerTransport for HttpPartnerTransport {
    async fn handshake(&self, site_key: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/register", self.endpoint))
            .json(&json!({ "site_key": site_key }))
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        body.get("session")
            .and_then(|s| s.as_str())
            .map(str::to_string)
            .context("partner handshake response missing session token")
    }

    async fn send_page_view(&self, session: &str, path: &str, title: &str) -> Result<()> {
        self.client
            .post(format!("{}/pageview", self.endpoint))
            .json(&json!({ "session": session, "path": path, "title": title }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct PartnerAdapter<T: PartnerTransport> {
    transport: T,
    site_key: String,
    enabled: AtomicBool,
    session: OnceCell<Option<String>>,
}

impl<T: PartnerTransport> PartnerAdapter<T> {
    pub fn new(transport: T, site_key: impl Into<String>) -> Self {
        Self {
            transport,
            site_key: site_key.into(),
            enabled: AtomicBool::new(true),
            session: OnceCell::new(),
        }
    }

    async fn session(&self) -> Option<&str> {
        self.session
            .get_or_init(|| async {
                match self.transport.handshake(&self.site_key).await {
                    Ok(token) => Some(token),
                    Err(error) => {
                        tracing::debug!(%error, "partner handshake failed; dropping events");
                        None
                    }
                }
            })
            .await
            .as_deref()
    }
}

#[async_trait]
impl<T: PartnerTransport> ProviderAdapter for PartnerAdapter<T> {
    fn name(&self) -> &'static str {
        "partner"
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    async fn track_event(&self, event: &CanonicalEvent) -> Result<()> {
        if event.name != types::PAGE_VIEW {
            return Ok(());
        }

        let Some(session) = self.session().await else {
            return Ok(());
        };

        let path = event
            .properties
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or("/");
        let title = event
            .properties
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if let Err(error) = self.transport.send_page_view(session, path, title).await {
            tracing::debug!(%error, "partner page view not delivered");
        }
        Ok(())
    }
}
