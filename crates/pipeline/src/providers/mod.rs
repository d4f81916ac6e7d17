//! Provider adapters: pluggable translator/senders for one analytics
//! backend each. The dispatch manager fans every delivered event out to
//! all enabled adapters and isolates their failures from one another.

pub mod http_sink;
pub mod partner;
pub mod pixel;
pub mod tag_manager;

use anyhow::Result;
use async_trait::async_trait;
use common::types::CanonicalEvent;

/// The capability contract every backend integration implements.
///
/// `track_event` must not panic and should reserve `Err` for failures the
/// dispatcher ought to log; adapters that intentionally skip an event
/// (unmapped name, backend unavailable) return `Ok`.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    async fn track_event(&self, event: &CanonicalEvent) -> Result<()>;
}
