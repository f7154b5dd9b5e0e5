//! Mastodon-side ingestion: echo configured remote accounts by boosting
//! their statuses.
//!
//! This parser never re-posts content; everything it enqueues is a
//! `Reblog` action carrying the remote status id. Seen-tracking is a
//! high-water mark: the id of the newest status returned last time,
//! passed back as `since_id`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Config, MastodonAccount};
use crate::error::{ConfigError, ParseError};
use crate::fediverse::{FediverseApi, Status};
use crate::parsers::{Parser, SourceMeta};
use crate::post::{Action, QueuePost};
use crate::storage::Storage;

/// Cached account record, keyed by the hashed user handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredAccount {
    id: String,
    #[serde(default)]
    last_seen_toot: Option<String>,
}

pub struct MastodonParser {
    accounts: Vec<MastodonAccount>,
    storage: Storage,
    api: Arc<dyn FediverseApi>,
    only_public: bool,
    ignore_offset: bool,
    /// Account records to persist on `mark_seen`, refreshed by
    /// `fetch_raw` with the newest returned status id.
    pending: HashMap<String, StoredAccount>,
}

impl MastodonParser {
    pub fn new(config: &Config, api: Arc<dyn FediverseApi>) -> Result<Self, ConfigError> {
        let storage = Storage::open(&config.mastodon_parser.storage_file)?;
        Ok(Self {
            accounts: config.mastodon_parser.accounts.clone(),
            storage,
            api,
            only_public: config.mastodon_parser.only_public_visibility,
            ignore_offset: config.mastodon_parser.ignore_toots_offset,
            pending: HashMap::new(),
        })
    }

    fn account(&self, source: &str) -> Option<&MastodonAccount> {
        self.accounts.iter().find(|a| a.user == source)
    }

    fn stored(&self, user: &str) -> Option<StoredAccount> {
        self.storage.get_hashed_as::<StoredAccount>(user)
    }

    /// Follows the account unless the bot already does; the federation
    /// only starts delivering statuses once the follow is in place.
    async fn ensure_followed(&self, user: &str, account_id: &str) -> Result<(), ParseError> {
        let bot_account = self
            .api
            .verify_credentials()
            .await
            .map_err(|e| ParseError::unreachable(user, e))?;
        let following = self
            .api
            .account_following(&bot_account.id)
            .await
            .map_err(|e| ParseError::unreachable(user, e))?;

        if following.iter().any(|f| f.id == account_id) {
            debug!(user, "already following, skipping follow call");
            return Ok(());
        }

        info!(user, "following the account");
        self.api
            .account_follow(account_id)
            .await
            .map_err(|e| ParseError::unreachable(user, e))?;
        Ok(())
    }

    fn wanted(&self, account: &MastodonAccount, status: &Status) -> bool {
        if self.only_public && status.visibility != "public" {
            return false;
        }
        if status.reblog.is_some() {
            return account.retoots;
        }
        let is_reply =
            status.in_reply_to_id.is_some() || status.in_reply_to_account_id.is_some();
        if is_reply {
            return false;
        }
        account.toots
    }
}

#[async_trait]
impl Parser for MastodonParser {
    fn name(&self) -> &'static str {
        "Mastodon"
    }

    fn sources(&self) -> Vec<SourceMeta> {
        self.accounts
            .iter()
            .map(|account| SourceMeta {
                name: account.user.clone(),
                keywords_profile: account.keywords_filter_profile.clone(),
            })
            .collect()
    }

    async fn fetch_raw(&mut self, source: &str) -> Result<Vec<QueuePost>, ParseError> {
        let account = self
            .account(source)
            .cloned()
            .ok_or_else(|| ParseError::malformed(source, "source not configured"))?;

        let stored = self.stored(&account.user);
        let account_id = match &stored {
            Some(record) => {
                debug!(user = %account.user, "reusing stored account data");
                record.id.clone()
            }
            None => {
                debug!(user = %account.user, "searching for the account");
                let matches = self
                    .api
                    .account_search(&account.user)
                    .await
                    .map_err(|e| ParseError::unreachable(source, e))?;
                let Some(found) = matches.first() else {
                    warn!(user = %account.user, "no account found, skipping");
                    return Ok(Vec::new());
                };
                let id = found.id.clone();
                if account.auto_follow {
                    self.ensure_followed(&account.user, &id).await?;
                }
                id
            }
        };

        let last_seen = if self.ignore_offset {
            None
        } else {
            stored.as_ref().and_then(|record| record.last_seen_toot.clone())
        };

        debug!(
            user = %account.user,
            since = last_seen.as_deref().unwrap_or("ever"),
            "getting statuses"
        );
        let statuses = self
            .api
            .account_statuses(&account_id, last_seen.as_deref())
            .await
            .map_err(|e| ParseError::unreachable(source, e))?;
        debug!(user = %account.user, count = statuses.len(), "got statuses");

        if statuses.is_empty() {
            debug!(
                user = %account.user,
                "no statuses received; may be a federation issue, is the bot following the account?"
            );
            self.pending.insert(
                source.to_string(),
                StoredAccount {
                    id: account_id,
                    last_seen_toot: stored.and_then(|r| r.last_seen_toot),
                },
            );
            return Ok(Vec::new());
        }

        // High-water mark: statuses come newest first.
        self.pending.insert(
            source.to_string(),
            StoredAccount {
                id: account_id,
                last_seen_toot: Some(statuses[0].id.clone()),
            },
        );

        let posts = statuses
            .iter()
            .filter(|status| self.wanted(&account, status))
            .map(|status| {
                let mut post = QueuePost::new(status.id.clone(), status.created_at);
                post.action = Action::Reblog(status.id.clone());
                post.raw_combined = Some(status.content.clone());
                post
            })
            .collect();
        Ok(posts)
    }

    fn already_seen(&mut self, source: &str, id: &str) -> bool {
        // `since_id` already trims the fetch; only the mark itself can
        // come back once more.
        let Some(last_seen) = self
            .stored(source)
            .and_then(|record| record.last_seen_toot)
        else {
            return false;
        };
        match (id.parse::<u64>(), last_seen.parse::<u64>()) {
            (Ok(this), Ok(mark)) => this <= mark,
            _ => id == last_seen,
        }
    }

    fn mark_seen(&mut self, source: &str, _ids: &[String]) -> Result<(), ConfigError> {
        // The high-water mark recorded at fetch time is what persists;
        // individual ids below it are implied.
        let Some(record) = self.pending.get(source) else {
            return Ok(());
        };
        debug!(user = source, "updating gathered account data");
        self.storage.set_hashed(source, record.clone())?;
        self.storage.write_file()
    }

    async fn parse_media(&mut self, _post: &mut QueuePost) {
        // Boosted statuses carry their own media on the remote side.
    }

    fn format_post(&self, _source: &str, _post: &mut QueuePost) {
        // Reblogs ignore text, summary and language.
    }
}
