//! Typed configuration, loaded once from a YAML file and threaded by
//! reference into every component. Sections and keys mirror the on-disk
//! layout; everything has a default so a minimal config stays minimal.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::fediverse::{ContentType, InstanceType, Visibility};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    #[serde(rename = "default")]
    pub defaults: Defaults,
    pub publisher: PublisherConfig,
    pub queue_storage: QueueStorageConfig,
    pub feed_parser: FeedParserConfig,
    pub telegram_parser: TelegramParserConfig,
    pub mastodon_parser: MastodonParserConfig,
    pub keywords_filter: KeywordsFilterConfig,
    pub janitor: JanitorConfig,
    pub logger: LoggerConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Malformed {
            path: path.display().to_string(),
            source,
        })
    }

    /// One post drained per run when either toggle is set.
    pub fn only_oldest_per_iteration(&self) -> bool {
        self.publisher
            .only_older_toot
            .unwrap_or(self.publisher.only_oldest_post_every_iteration)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub api_base_url: String,
    pub instance_type: InstanceType,
    pub access_token: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "fedibot".into(),
            api_base_url: String::new(),
            instance_type: InstanceType::Mastodon,
            access_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub max_length: usize,
    pub max_media_per_status: usize,
    pub merge_content: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            max_length: 500,
            max_media_per_status: 4,
            merge_content: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub dry_run: bool,
    pub media_storage: PathBuf,
    pub only_oldest_post_every_iteration: bool,
    /// Older spelling of the same toggle; wins when both are present.
    pub only_older_toot: Option<bool>,
    pub visibility: Visibility,
    pub content_type: ContentType,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            media_storage: PathBuf::from("storage/media"),
            only_oldest_post_every_iteration: false,
            only_older_toot: None,
            visibility: Visibility::Public,
            content_type: ContentType::Plain,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueStorageConfig {
    pub file: PathBuf,
}

impl Default for QueueStorageConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("storage/queue.yaml"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedParserConfig {
    pub storage_file: PathBuf,
    pub sites: Vec<FeedSite>,
}

impl Default for FeedParserConfig {
    fn default() -> Self {
        Self {
            storage_file: PathBuf::from("storage/feeds.yaml"),
            sites: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedSite {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub language_default: Option<String>,
    #[serde(default)]
    pub language_override: bool,
    #[serde(default)]
    pub max_summary_length: Option<usize>,
    #[serde(default)]
    pub show_name: bool,
    #[serde(default)]
    pub keywords_filter_profile: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramParserConfig {
    pub bot_token: Option<String>,
    pub storage_file: PathBuf,
    /// Chats and channels are handled the same way, but people configure
    /// them under different names.
    pub chats: Vec<TelegramChannel>,
    pub channels: Vec<TelegramChannel>,
    pub ignore_offsets: bool,
    pub date_to_start_from: Option<NaiveDate>,
}

impl Default for TelegramParserConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            storage_file: PathBuf::from("storage/telegram.yaml"),
            chats: Vec::new(),
            channels: Vec::new(),
            ignore_offsets: false,
            date_to_start_from: None,
        }
    }
}

impl TelegramParserConfig {
    pub fn conversations(&self) -> Vec<TelegramChannel> {
        self.chats.iter().chain(self.channels.iter()).cloned().collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChannel {
    pub name: String,
    pub id: i64,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub show_name: bool,
    #[serde(default)]
    pub keywords_filter_profile: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MastodonParserConfig {
    pub active: bool,
    pub storage_file: PathBuf,
    pub accounts: Vec<MastodonAccount>,
    pub only_public_visibility: bool,
    pub ignore_toots_offset: bool,
}

impl Default for MastodonParserConfig {
    fn default() -> Self {
        Self {
            active: false,
            storage_file: PathBuf::from("storage/accounts.yaml"),
            accounts: Vec::new(),
            only_public_visibility: false,
            ignore_toots_offset: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MastodonAccount {
    pub user: String,
    /// Echo the account's own original statuses.
    #[serde(default)]
    pub toots: bool,
    /// Echo the account's boosts.
    #[serde(default)]
    pub retoots: bool,
    #[serde(default)]
    pub auto_follow: bool,
    #[serde(default)]
    pub keywords_filter_profile: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct KeywordsFilterConfig {
    pub profiles: HashMap<String, KeywordProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeywordProfile {
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct JanitorConfig {
    pub active: bool,
    pub remote_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}
