//! Boundary to the Telegram client library.
//!
//! The grouping/splitting engine never touches the wire types directly:
//! it sees plain [`RawMessage`]s through this trait, which keeps the
//! engine testable and the client swappable. The production implementation
//! polls the Bot API for channel posts and downloads files through the
//! same bot.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use teloxide::net::Download;
use teloxide::payloads::GetUpdatesSetters;
use teloxide::prelude::*;
use teloxide::types::{AllowedUpdate, MediaKind, MessageKind, UpdateKind};
use tracing::debug;

use crate::error::{MediaUnavailable, ParseError};

#[derive(Debug, Clone)]
pub struct RawFile {
    /// Client-side file identifier, usable for download.
    pub id: String,
    pub name: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: i64,
    /// Empty for media-only messages.
    pub text: String,
    pub date: DateTime<Utc>,
    pub file: Option<RawFile>,
}

impl RawMessage {
    pub fn has_text(&self) -> bool {
        !self.text.is_empty()
    }
}

#[async_trait]
pub trait TelegramGateway: Send + Sync {
    /// Messages of one chat/channel, oldest to newest. `min_id` excludes
    /// messages up to and including the given message number; `since`
    /// excludes older messages by date.
    async fn history(
        &self,
        channel_id: i64,
        min_id: Option<i64>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawMessage>, ParseError>;

    /// Downloads one file to `dest`, returning the final path.
    async fn download(&self, file: &RawFile, dest: &Path) -> Result<PathBuf, MediaUnavailable>;
}

/// Bot API gateway. The bot must be a member of the configured chats and
/// channels; history arrives as pending updates, which the Bot API hands
/// out in order.
pub struct BotGateway {
    bot: Bot,
}

impl BotGateway {
    pub fn new(token: &str) -> Self {
        Self {
            bot: Bot::new(token),
        }
    }
}

fn raw_file_from(message: &Message) -> Option<RawFile> {
    let MessageKind::Common(common) = &message.kind else {
        return None;
    };
    match &common.media_kind {
        MediaKind::Photo(photo) => {
            // Largest rendition is last.
            let size = photo.photo.last()?;
            Some(RawFile {
                id: size.file.id.clone(),
                name: None,
                mime_type: Some("image/jpeg".to_string()),
            })
        }
        MediaKind::Document(document) => Some(RawFile {
            id: document.document.file.id.clone(),
            name: document.document.file_name.clone(),
            mime_type: document
                .document
                .mime_type
                .as_ref()
                .map(|m| m.to_string()),
        }),
        MediaKind::Video(video) => Some(RawFile {
            id: video.video.file.id.clone(),
            name: video.video.file_name.clone(),
            mime_type: video.video.mime_type.as_ref().map(|m| m.to_string()),
        }),
        MediaKind::Animation(animation) => Some(RawFile {
            id: animation.animation.file.id.clone(),
            name: animation.animation.file_name.clone(),
            mime_type: animation
                .animation
                .mime_type
                .as_ref()
                .map(|m| m.to_string()),
        }),
        _ => None,
    }
}

fn raw_message_from(message: &Message) -> RawMessage {
    RawMessage {
        id: i64::from(message.id.0),
        text: message.text().or_else(|| message.caption()).unwrap_or("").to_string(),
        date: message.date,
        file: raw_file_from(message),
    }
}

#[async_trait]
impl TelegramGateway for BotGateway {
    async fn history(
        &self,
        channel_id: i64,
        min_id: Option<i64>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawMessage>, ParseError> {
        let mut messages = Vec::new();
        let mut offset: Option<i32> = None;

        loop {
            let mut request = self.bot.get_updates().allowed_updates(vec![
                AllowedUpdate::Message,
                AllowedUpdate::ChannelPost,
            ]);
            if let Some(next) = offset {
                request = request.offset(next);
            }
            let updates = request
                .await
                .map_err(|e| ParseError::unreachable(channel_id.to_string(), e))?;
            if updates.is_empty() {
                break;
            }

            for update in updates {
                offset = Some(update.id + 1);
                let message = match &update.kind {
                    UpdateKind::Message(message) | UpdateKind::ChannelPost(message) => message,
                    _ => continue,
                };
                if message.chat.id.0 != channel_id {
                    continue;
                }
                let raw = raw_message_from(message);
                if min_id.is_some_and(|min| raw.id <= min) {
                    continue;
                }
                if since.is_some_and(|cutoff| raw.date < cutoff) {
                    continue;
                }
                messages.push(raw);
            }
        }

        messages.sort_by_key(|m| m.id);
        debug!(channel_id, count = messages.len(), "telegram history fetched");
        Ok(messages)
    }

    async fn download(&self, file: &RawFile, dest: &Path) -> Result<PathBuf, MediaUnavailable> {
        let remote = self
            .bot
            .get_file(file.id.clone())
            .await
            .map_err(|e| MediaUnavailable(format!("get_file {}: {e}", file.id)))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MediaUnavailable(format!("creating {}: {e}", parent.display())))?;
        }
        let mut out = tokio::fs::File::create(dest)
            .await
            .map_err(|e| MediaUnavailable(format!("creating {}: {e}", dest.display())))?;
        self.bot
            .download_file(&remote.path, &mut out)
            .await
            .map_err(|e| MediaUnavailable(format!("downloading {}: {e}", file.id)))?;

        debug!(file = %file.id, path = %dest.display(), "telegram file downloaded");
        Ok(dest.to_path_buf())
    }
}
