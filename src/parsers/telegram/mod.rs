//! Telegram ingestion and the grouping/splitting engine.
//!
//! The upstream API delivers individual messages, but one logical post may
//! span several of them: a captioned message followed within seconds by
//! one message per extra image. `post_process` reconstructs the logical
//! posts, then splits them again wherever the text outgrows the status
//! length or the media stack outgrows the per-status attachment cap,
//! linking the emitted slices into one thread group.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::config::{Config, TelegramChannel};
use crate::error::{ConfigError, ParseError};
use crate::parsers::{Parser, SourceMeta};
use crate::post::{QueuePost, QueuePostMedia, RawContent};
use crate::seen::SeenIds;
use crate::storage::Storage;
use crate::text;

pub mod gateway;

use gateway::{RawFile, TelegramGateway};
#[cfg(test)]
use gateway::RawMessage;

const DEFAULT_LANGUAGE: &str = "en";
/// Messages closer together than this belong to the same logical post,
/// unless the newer one carries text.
const GROUP_GAP_MINUTES: i64 = 1;
const THREAD_SEPARATOR: &str = "\n\n";

fn thread_suffix(current: usize, total: usize) -> String {
    format!("🧵 {current}/{total}")
}

fn sha1_hex(text: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct TelegramParser {
    channels: Vec<TelegramChannel>,
    storage: Storage,
    seen: SeenIds,
    gateway: Box<dyn TelegramGateway>,
    max_length: usize,
    max_media: usize,
    ignore_offsets: bool,
    start_date: Option<NaiveDate>,
    media_dir: PathBuf,
}

impl TelegramParser {
    pub fn new(config: &Config, gateway: Box<dyn TelegramGateway>) -> Result<Self, ConfigError> {
        let storage = Storage::open(&config.telegram_parser.storage_file)?;
        Ok(Self {
            channels: config.telegram_parser.conversations(),
            storage,
            seen: SeenIds::new(),
            gateway,
            max_length: config.defaults.max_length,
            max_media: config.defaults.max_media_per_status,
            ignore_offsets: config.telegram_parser.ignore_offsets,
            start_date: config.telegram_parser.date_to_start_from,
            media_dir: config.publisher.media_storage.clone(),
        })
    }

    fn channel(&self, source: &str) -> Option<&TelegramChannel> {
        self.channels.iter().find(|c| c.name == source)
    }

    fn storage_key(entity_id: i64) -> String {
        format!("entity_{}", entity_id.abs())
    }

    fn load_seen(&mut self, source: &str) {
        if self.seen.is_loaded(source) {
            return;
        }
        let ids = self
            .channel(source)
            .and_then(|channel| {
                self.storage
                    .get_as::<Vec<i64>>(&Self::storage_key(channel.id))
            })
            .unwrap_or_default();
        debug!(source, count = ids.len(), "loaded seen message ids");
        self.seen
            .put(source, ids.iter().map(|id| id.to_string()).collect());
    }

    fn max_seen_id(&mut self, source: &str) -> Option<i64> {
        self.load_seen(source);
        self.channel(source).and_then(|channel| {
            self.storage
                .get_as::<Vec<i64>>(&Self::storage_key(channel.id))
                .and_then(|ids| ids.into_iter().max())
        })
    }

    /// Status length left for body text once the thread marker and its
    /// separator are accounted for (two-digit counters reserved).
    fn effective_max_length(&self) -> usize {
        let reserve =
            text::count_chars(&thread_suffix(0, 0).replace('0', "00")) + THREAD_SEPARATOR.len();
        self.max_length.saturating_sub(reserve)
    }

    /// Walks the raw messages in order and cuts them into logical groups:
    /// a new group opens on a time gap or on a message that carries text.
    /// Image-only follow-ups to a captioned message are the same logical
    /// post; new text starts a new one.
    fn group_messages(posts: Vec<QueuePost>) -> Vec<Vec<QueuePost>> {
        let mut groups: Vec<Vec<QueuePost>> = Vec::new();
        let mut current: Vec<QueuePost> = Vec::new();
        let mut last_date: Option<DateTime<Utc>> = None;

        for post in posts {
            let has_text = matches!(
                &post.raw,
                Some(RawContent::Telegram(message)) if message.has_text()
            );
            if let Some(previous) = last_date {
                let gap_exceeded =
                    previous + Duration::minutes(GROUP_GAP_MINUTES) < post.published_at;
                if (gap_exceeded || has_text) && !current.is_empty() {
                    groups.push(std::mem::take(&mut current));
                }
            }
            last_date = Some(post.published_at);
            current.push(post);
        }
        if !current.is_empty() {
            groups.push(current);
        }
        groups
    }

    /// Unrolls one logical group into the posts to publish: text sliced by
    /// the effective length, media packed four per status, all slices
    /// linked by a content-derived group key.
    fn split_group(&self, posts: &[QueuePost]) -> Vec<QueuePost> {
        let mut full_text = String::new();
        let mut media_stack: Vec<RawFile> = Vec::new();
        let mut status_date: Option<DateTime<Utc>> = None;
        let mut language: Option<String> = None;

        for post in posts {
            let Some(RawContent::Telegram(message)) = &post.raw else {
                continue;
            };
            if let Some(file) = &message.file {
                media_stack.push(file.clone());
            }
            if message.has_text() {
                if !full_text.is_empty() {
                    full_text.push_str("\n\n");
                }
                full_text.push_str(&message.text);
            }
            if status_date.is_none() {
                status_date = Some(post.published_at);
            }
            language = post.language.clone();
        }

        if full_text.is_empty() && media_stack.is_empty() {
            return Vec::new();
        }
        let Some(status_date) = status_date else {
            return Vec::new();
        };

        let effective_length = self.effective_max_length().max(1);
        let total_chars = text::count_chars(&full_text);
        let by_text = if total_chars > effective_length {
            total_chars.div_ceil(effective_length)
        } else {
            1
        };
        let by_media = if media_stack.len() > self.max_media {
            media_stack.len().div_ceil(self.max_media)
        } else {
            1
        };
        let total = by_text.max(by_media);
        debug!(
            by_text,
            by_media, total, "unrolling group into statuses"
        );

        // Media-only groups have no text to hash; their identity comes
        // from the file ids instead, so two picture posts never collide.
        let group_id = if full_text.is_empty() {
            let file_ids: Vec<&str> = media_stack.iter().map(|f| f.id.as_str()).collect();
            sha1_hex(&file_ids.join("\n"))
        } else {
            sha1_hex(&full_text)
        };
        let mut remaining = full_text;
        let mut media_stack = std::collections::VecDeque::from(media_stack);
        let mut emitted = Vec::with_capacity(total);

        for index in 0..total {
            let mut files = Vec::new();
            while let Some(file) = media_stack.pop_front() {
                files.push(file);
                if files.len() >= self.max_media {
                    break;
                }
            }

            let body = if total > 1 {
                let slice = text::take_chars(&remaining, effective_length);
                remaining = text::skip_chars(&remaining, effective_length);
                let marker = thread_suffix(index + 1, total);
                if slice.is_empty() {
                    marker
                } else {
                    format!("{slice}{THREAD_SEPARATOR}{marker}")
                }
            } else {
                std::mem::take(&mut remaining)
            };

            let id = if body.is_empty() {
                group_id.clone()
            } else {
                sha1_hex(&body)
            };
            let mut post = QueuePost::new(id, status_date);
            post.group = Some(group_id.clone());
            post.language = language.clone();
            post.raw = Some(RawContent::TelegramGroup { body, files });
            emitted.push(post);
        }

        emitted
    }
}

#[async_trait]
impl Parser for TelegramParser {
    fn name(&self) -> &'static str {
        "Telegram"
    }

    fn sources(&self) -> Vec<SourceMeta> {
        self.channels
            .iter()
            .map(|channel| SourceMeta {
                name: channel.name.clone(),
                keywords_profile: channel.keywords_filter_profile.clone(),
            })
            .collect()
    }

    async fn fetch_raw(&mut self, source: &str) -> Result<Vec<QueuePost>, ParseError> {
        let channel = self
            .channel(source)
            .cloned()
            .ok_or_else(|| ParseError::malformed(source, "source not configured"))?;

        let min_id = if self.ignore_offsets {
            None
        } else {
            self.max_seen_id(source)
        };
        let since = if self.ignore_offsets {
            None
        } else {
            self.start_date
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        };

        let language = channel
            .language
            .clone()
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

        let messages = self.gateway.history(channel.id, min_id, since).await?;
        let posts = messages
            .into_iter()
            .filter(|message| {
                // Nothing to echo in service messages.
                if !message.has_text() && message.file.is_none() {
                    debug!(id = message.id, "dropping message with no text and no file");
                    return false;
                }
                true
            })
            .map(|message| {
                let mut post = QueuePost::new(message.id.to_string(), message.date);
                post.language = Some(language.clone());
                post.raw_combined = Some(message.text.clone());
                post.raw = Some(RawContent::Telegram(message));
                post
            })
            .collect();
        Ok(posts)
    }

    fn already_seen(&mut self, source: &str, id: &str) -> bool {
        self.load_seen(source);
        self.seen.contains(source, id)
    }

    fn mark_seen(&mut self, source: &str, ids: &[String]) -> Result<(), ConfigError> {
        self.load_seen(source);
        let all = self.seen.extend(source, ids);

        let Some(channel) = self.channels.iter().find(|c| c.name == source) else {
            return Ok(());
        };
        let numeric: Vec<i64> = all.iter().filter_map(|id| id.parse().ok()).collect();
        debug!(source, count = numeric.len(), "updating seen message ids");
        self.storage.set(&Self::storage_key(channel.id), numeric)?;
        self.storage.write_file()
    }

    fn post_process(&mut self, _source: &str, posts: Vec<QueuePost>) -> Vec<QueuePost> {
        if posts.is_empty() {
            info!("no messages to publish");
            return posts;
        }
        info!(count = posts.len(), "received messages to publish");

        let groups = Self::group_messages(posts);
        info!(groups = groups.len(), "grouped messages");

        let mut emitted = Vec::new();
        for group in &groups {
            debug!(size = group.len(), "preparing group of posts");
            emitted.extend(self.split_group(group));
        }
        emitted
    }

    async fn parse_media(&mut self, post: &mut QueuePost) {
        let Some(RawContent::TelegramGroup { files, .. }) = &post.raw else {
            return;
        };

        for file in files.clone() {
            let file_name = match &file.name {
                Some(name) => name.clone(),
                None => {
                    let ext = file
                        .mime_type
                        .as_deref()
                        .and_then(|mime| mime_guess::get_mime_extensions_str(mime))
                        .and_then(|exts| exts.first())
                        .copied()
                        .unwrap_or("bin");
                    format!("{}.{ext}", file.id)
                }
            };
            let dest = self.media_dir.join(&file_name);

            debug!(file = %file.id, path = %dest.display(), "downloading media");
            match self.gateway.download(&file, &dest).await {
                Ok(path) => post
                    .media
                    .push(QueuePostMedia::from_path(path, file.mime_type.clone())),
                Err(e) => warn!(file = %file.id, error = %e, "skipping media item"),
            }
        }
    }

    fn format_post(&self, source: &str, post: &mut QueuePost) {
        let Some(RawContent::TelegramGroup { body, .. }) = &post.raw else {
            return;
        };
        let show_name = self.channel(source).is_some_and(|c| c.show_name);
        post.text = Some(if show_name {
            format!("{source}\t{body}")
        } else {
            body.clone()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeGateway;
    use chrono::TimeZone;

    fn config_with_channel(max_length: usize) -> Config {
        let yaml = format!(
            "default:\n  max_length: {max_length}\ntelegram_parser:\n  bot_token: \"1:a\"\n  channels:\n    - name: Alerts\n      id: -1001234\n"
        );
        serde_yaml::from_str(&yaml).expect("config")
    }

    fn parser_for(messages: Vec<RawMessage>, max_length: usize, dir: &std::path::Path) -> TelegramParser {
        let mut config = config_with_channel(max_length);
        config.telegram_parser.storage_file = dir.join("telegram.yaml");
        config.publisher.media_storage = dir.join("media");
        TelegramParser::new(&config, Box::new(FakeGateway::new(messages))).expect("parser")
    }

    fn message(id: i64, ts: i64, text: &str, with_file: bool) -> RawMessage {
        RawMessage {
            id,
            text: text.to_string(),
            date: Utc.timestamp_opt(ts, 0).unwrap(),
            file: with_file.then(|| RawFile {
                id: format!("file-{id}"),
                name: None,
                mime_type: Some("image/jpeg".to_string()),
            }),
        }
    }

    async fn fetch_and_process(parser: &mut TelegramParser) -> Vec<QueuePost> {
        let raw = parser.fetch_raw("Alerts").await.expect("fetch");
        parser.post_process("Alerts", raw)
    }

    #[tokio::test]
    async fn captioned_message_groups_with_image_followups() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = 1_700_000_000;
        let mut parser = parser_for(
            vec![
                message(1, base, "Hello", false),
                message(2, base + 10, "", true),
                message(3, base + 20, "", true),
            ],
            400,
            dir.path(),
        );

        let posts = fetch_and_process(&mut parser).await;
        assert_eq!(posts.len(), 1);
        let Some(RawContent::TelegramGroup { body, files }) = &posts[0].raw else {
            panic!("expected a telegram group");
        };
        assert_eq!(body, "Hello");
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn new_text_starts_a_new_group() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = 1_700_000_000;
        let mut parser = parser_for(
            vec![
                message(1, base, "First", false),
                message(2, base + 5, "Second", false),
            ],
            400,
            dir.path(),
        );

        let posts = fetch_and_process(&mut parser).await;
        assert_eq!(posts.len(), 2);
    }

    #[tokio::test]
    async fn time_gap_starts_a_new_group() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = 1_700_000_000;
        let mut parser = parser_for(
            vec![
                message(1, base, "", true),
                message(2, base + 120, "", true),
            ],
            400,
            dir.path(),
        );

        let posts = fetch_and_process(&mut parser).await;
        assert_eq!(posts.len(), 2);
    }

    #[tokio::test]
    async fn long_text_splits_into_marked_thread() {
        let dir = tempfile::tempdir().expect("tempdir");
        let long_text: String = "x".repeat(120);
        let mut parser = parser_for(
            vec![message(1, 1_700_000_000, &long_text, false)],
            56,
            dir.path(),
        );

        let posts = fetch_and_process(&mut parser).await;
        assert_eq!(posts.len(), 3);

        let effective = parser.effective_max_length();
        let group = posts[0].group.clone().expect("group id");
        for (i, post) in posts.iter().enumerate() {
            assert_eq!(post.group.as_ref(), Some(&group));
            let Some(RawContent::TelegramGroup { body, .. }) = &post.raw else {
                panic!("expected a telegram group");
            };
            assert!(body.contains(&format!("🧵 {}/3", i + 1)));
            let body_without_marker = body
                .split(THREAD_SEPARATOR)
                .next()
                .expect("body part");
            assert!(text::count_chars(body_without_marker) <= effective);
            assert!(text::count_chars(body) <= 56);
        }

        // Slices have distinct ids but one shared published_at.
        let mut ids: Vec<&String> = posts.iter().map(|p| &p.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert!(posts.iter().all(|p| p.published_at == posts[0].published_at));
    }

    #[tokio::test]
    async fn group_count_follows_the_split_formula() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = 1_700_000_000;
        // 9 media-only messages right after a captioned one: 9 files total.
        let mut messages = vec![message(1, base, "Gallery", true)];
        for i in 2..=9 {
            messages.push(message(i, base + i, "", true));
        }
        let mut parser = parser_for(messages, 400, dir.path());

        let posts = fetch_and_process(&mut parser).await;
        // ceil(9 / 4) = 3 statuses, four media in each but the last.
        assert_eq!(posts.len(), 3);
        let sizes: Vec<usize> = posts
            .iter()
            .map(|p| match &p.raw {
                Some(RawContent::TelegramGroup { files, .. }) => files.len(),
                _ => 0,
            })
            .collect();
        assert_eq!(sizes, [4, 4, 1]);
    }

    #[tokio::test]
    async fn media_only_posts_get_distinct_identities() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = 1_700_000_000;
        // Two separate picture posts, far enough apart to be two groups.
        let mut parser = parser_for(
            vec![
                message(1, base, "", true),
                message(2, base + 600, "", true),
            ],
            400,
            dir.path(),
        );

        let posts = fetch_and_process(&mut parser).await;
        assert_eq!(posts.len(), 2);
        assert_ne!(posts[0].id, posts[1].id);
        assert_ne!(posts[0].group, posts[1].group);
    }

    #[tokio::test]
    async fn empty_messages_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut parser = parser_for(
            vec![message(1, 1_700_000_000, "", false)],
            400,
            dir.path(),
        );
        let posts = fetch_and_process(&mut parser).await;
        assert!(posts.is_empty());
    }

    #[tokio::test]
    async fn offsets_skip_already_seen_messages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = 1_700_000_000;
        let mut parser = parser_for(
            vec![
                message(1, base, "old", false),
                message(2, base + 100, "new", false),
            ],
            400,
            dir.path(),
        );

        parser.mark_seen("Alerts", &["1".to_string()]).expect("mark");
        let raw = parser.fetch_raw("Alerts").await.expect("fetch");
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].id, "2");
    }

    #[tokio::test]
    async fn seen_state_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let mut parser = parser_for(vec![], 400, dir.path());
            parser
                .mark_seen("Alerts", &["7".to_string(), "9".to_string()])
                .expect("mark");
        }
        let mut parser = parser_for(vec![], 400, dir.path());
        assert!(parser.already_seen("Alerts", "7"));
        assert!(parser.already_seen("Alerts", "9"));
        assert!(!parser.already_seen("Alerts", "10"));
    }

    #[tokio::test]
    async fn parse_media_downloads_group_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = 1_700_000_000;
        let mut parser = parser_for(
            vec![message(1, base, "pic", true), message(2, base + 5, "", true)],
            400,
            dir.path(),
        );

        let mut posts = fetch_and_process(&mut parser).await;
        assert_eq!(posts.len(), 1);
        parser.parse_media(&mut posts[0]).await;
        assert_eq!(posts[0].media.len(), 2);
        assert!(posts[0].media.iter().all(|m| m.path.is_some()));
    }

    #[tokio::test]
    async fn format_post_can_prefix_the_source_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut parser = parser_for(
            vec![message(1, 1_700_000_000, "body", false)],
            400,
            dir.path(),
        );
        parser.channels[0].show_name = true;

        let mut posts = fetch_and_process(&mut parser).await;
        parser.format_post("Alerts", &mut posts[0]);
        assert_eq!(posts[0].text.as_deref(), Some("Alerts\tbody"));
    }
}
