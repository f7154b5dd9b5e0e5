//! The pipeline's universal currency: a normalized, publishable post.
//!
//! `QueuePost` splits into a persistable record (everything serde sees) and
//! an in-memory enrichment holder: `raw` and `raw_combined` carry upstream
//! payloads between fetch, filtering and formatting, and are dropped on
//! save so the queue file never embeds upstream client objects.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::parsers::telegram::gateway::{RawFile, RawMessage};

/// What the publisher should do with a queued post.
///
/// On the wire this is the tagged form (`new`, `!reblog <id>`); anything
/// else is rejected when the queue file is parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[default]
    New,
    Reblog(String),
}

/// One media attachment, either still remote (`url`) or already on disk
/// (`path`). At least one of the two is always set when built through the
/// constructors; entries read back from an edited queue file are checked
/// again by the publisher before upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePostMedia {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_text: Option<String>,
}

impl QueuePostMedia {
    pub fn from_url(url: impl Into<String>, alt_text: Option<String>) -> Self {
        Self {
            url: Some(url.into()),
            path: None,
            mime_type: None,
            alt_text,
        }
    }

    pub fn from_path(path: impl Into<PathBuf>, mime_type: Option<String>) -> Self {
        Self {
            url: None,
            path: Some(path.into()),
            mime_type,
            alt_text: None,
        }
    }

    /// A media entry needs a URL or a local path to be uploadable.
    pub fn is_usable(&self) -> bool {
        self.url.is_some() || self.path.is_some()
    }
}

/// Pre-format payloads a parser attaches for its own later pipeline steps.
/// Never persisted.
#[derive(Debug, Clone)]
pub enum RawContent {
    /// One feed entry before formatting.
    Feed {
        url: String,
        title: String,
        body: String,
    },
    /// One upstream Telegram message, before grouping.
    Telegram(RawMessage),
    /// One emitted slice of a grouped Telegram post, before formatting.
    TelegramGroup { body: String, files: Vec<RawFile> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePost {
    /// Upstream-stable identifier: URL for feeds, message number for
    /// Telegram, status id for Mastodon. Dedup and seen-tracking key.
    pub id: String,

    /// Posts sharing a group publish contiguously as one thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default)]
    pub action: Action,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// The formatted body actually sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<QueuePostMedia>,

    /// Upstream origin time, unix seconds on the wire. Queue order and the
    /// age cutoff both key on this.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub published_at: DateTime<Utc>,

    #[serde(skip)]
    pub raw: Option<RawContent>,

    /// Combined pre-format text used by the keyword filter and media
    /// detection.
    #[serde(skip)]
    pub raw_combined: Option<String>,
}

impl QueuePost {
    pub fn new(id: impl Into<String>, published_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            group: None,
            action: Action::New,
            summary: None,
            text: None,
            language: None,
            media: Vec::new(),
            published_at,
            raw: None,
            raw_combined: None,
        }
    }

    /// Dedup identity within the queue.
    pub fn dedup_key(&self) -> (String, Action) {
        (self.id.clone(), self.action.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> QueuePost {
        let mut post = QueuePost::new(
            "//example.org/a",
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        );
        post.group = Some("abc123".into());
        post.summary = Some("A title".into());
        post.text = Some("A body\n\nhttps://example.org/a".into());
        post.language = Some("en".into());
        post.media = vec![QueuePostMedia::from_url(
            "https://example.org/img.png",
            Some("an image".into()),
        )];
        post.raw = Some(RawContent::Feed {
            url: "https://example.org/a".into(),
            title: "A title".into(),
            body: "A body".into(),
        });
        post.raw_combined = Some("A title A body".into());
        post
    }

    #[test]
    fn round_trip_preserves_persisted_fields_and_drops_raw() {
        let post = sample();
        let yaml = serde_yaml::to_string(&post).expect("serialize");
        let back: QueuePost = serde_yaml::from_str(&yaml).expect("deserialize");

        assert_eq!(back.id, post.id);
        assert_eq!(back.group, post.group);
        assert_eq!(back.action, post.action);
        assert_eq!(back.summary, post.summary);
        assert_eq!(back.text, post.text);
        assert_eq!(back.language, post.language);
        assert_eq!(back.media, post.media);
        assert_eq!(back.published_at, post.published_at);
        assert!(back.raw.is_none());
        assert!(back.raw_combined.is_none());
    }

    #[test]
    fn published_at_serializes_as_unix_seconds() {
        let post = sample();
        let yaml = serde_yaml::to_string(&post).expect("serialize");
        assert!(yaml.contains(&post.published_at.timestamp().to_string()));
    }

    #[test]
    fn reblog_action_round_trips_with_payload() {
        let mut post = sample();
        post.action = Action::Reblog("109876".into());
        let yaml = serde_yaml::to_string(&post).expect("serialize");
        let back: QueuePost = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(back.action, Action::Reblog("109876".into()));
    }

    #[test]
    fn unknown_action_is_rejected_at_parse_time() {
        let yaml = "id: x\naction: repost\npublished_at: 1700000000\n";
        assert!(serde_yaml::from_str::<QueuePost>(yaml).is_err());
    }

    #[test]
    fn media_constructors_always_yield_usable_entries() {
        assert!(QueuePostMedia::from_url("https://x/y.png", None).is_usable());
        assert!(QueuePostMedia::from_path("/tmp/y.png", None).is_usable());
        let empty = QueuePostMedia {
            url: None,
            path: None,
            mime_type: None,
            alt_text: None,
        };
        assert!(!empty.is_usable());
    }
}
