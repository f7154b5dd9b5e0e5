//! The uniform ingestion protocol every source class satisfies.
//!
//! The orchestrator drives each parser through the same steps: enumerate
//! sources, fetch raw posts, drop the already-seen, persist the new seen
//! marks, post-process (group/split where the source needs it), resolve
//! media, format, enqueue. Parsers own their seen-state persistence so a
//! run can die between sources without losing more than one source's
//! progress.

use async_trait::async_trait;

use crate::error::{ConfigError, ParseError};
use crate::post::QueuePost;

pub mod feed;
pub mod mastodon;
pub mod telegram;

/// What the orchestrator needs to know about one configured source.
#[derive(Debug, Clone)]
pub struct SourceMeta {
    pub name: String,
    pub keywords_profile: Option<String>,
}

#[async_trait]
pub trait Parser: Send {
    fn name(&self) -> &'static str;

    /// The configured sources, in configuration order.
    fn sources(&self) -> Vec<SourceMeta>;

    /// Raw items for one source: IDs populated, nothing filtered yet.
    async fn fetch_raw(&mut self, source: &str) -> Result<Vec<QueuePost>, ParseError>;

    fn already_seen(&mut self, source: &str, id: &str) -> bool;

    /// Idempotent; the state is persisted before this returns.
    fn mark_seen(&mut self, source: &str, ids: &[String]) -> Result<(), ConfigError>;

    /// Default identity; the Telegram parser reshapes messages into
    /// logical posts here.
    fn post_process(&mut self, _source: &str, posts: Vec<QueuePost>) -> Vec<QueuePost> {
        posts
    }

    /// Fills `post.media`. May download now or leave URL-only entries for
    /// the publisher.
    async fn parse_media(&mut self, post: &mut QueuePost);

    /// Sets the final `text`/`summary`.
    fn format_post(&self, source: &str, post: &mut QueuePost);
}
