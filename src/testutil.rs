//! In-memory fakes shared by the unit tests: a recording fediverse API
//! and a canned Telegram gateway.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::{ApiError, MediaUnavailable, ParseError};
use crate::fediverse::{
    Account, FediverseApi, MediaAttachment, MediaUpload, Status, StatusParams,
};
use crate::parsers::telegram::gateway::{RawFile, RawMessage, TelegramGateway};

pub fn status(id: &str, ts: i64) -> Status {
    Status {
        id: id.to_string(),
        content: String::new(),
        created_at: Utc.timestamp_opt(ts, 0).unwrap(),
        visibility: "public".to_string(),
        in_reply_to_id: None,
        in_reply_to_account_id: None,
        reblog: None,
    }
}

#[derive(Debug, Clone)]
pub struct StatusPostCall {
    pub status: String,
    pub in_reply_to_id: Option<String>,
    pub media_ids: Vec<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MediaPostCall {
    pub file_name: String,
    pub description: Option<String>,
}

#[derive(Default)]
struct ApiState {
    search_results: Vec<Account>,
    search_calls: usize,
    statuses_responses: VecDeque<Vec<Status>>,
    last_since_id: Option<String>,
    following: Vec<String>,
    follow_calls: usize,
    post_failures: usize,
    post_calls: Vec<StatusPostCall>,
    reblog_calls: Vec<String>,
    media_calls: Vec<MediaPostCall>,
    media_failures: usize,
    next_id: usize,
}

/// Records every remote call and answers from canned data.
#[derive(Default)]
pub struct RecordingApi {
    state: Mutex<ApiState>,
}

impl RecordingApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_search_result(&self, id: &str, acct: &str) {
        self.state.lock().unwrap().search_results.push(Account {
            id: id.to_string(),
            acct: acct.to_string(),
        });
    }

    pub fn push_statuses(&self, statuses: Vec<Status>) {
        self.state
            .lock()
            .unwrap()
            .statuses_responses
            .push_back(statuses);
    }

    pub fn set_following(&self, ids: Vec<String>) {
        self.state.lock().unwrap().following = ids;
    }

    /// Makes the next `n` `status_post` calls fail with a 500.
    pub fn fail_next_posts(&self, n: usize) {
        self.state.lock().unwrap().post_failures = n;
    }

    /// Makes the next `n` `media_post` calls fail with a 500.
    pub fn fail_next_media(&self, n: usize) {
        self.state.lock().unwrap().media_failures = n;
    }

    pub fn search_calls(&self) -> usize {
        self.state.lock().unwrap().search_calls
    }

    pub fn follow_calls(&self) -> usize {
        self.state.lock().unwrap().follow_calls
    }

    pub fn last_since_id(&self) -> Option<String> {
        self.state.lock().unwrap().last_since_id.clone()
    }

    pub fn post_calls(&self) -> Vec<StatusPostCall> {
        self.state.lock().unwrap().post_calls.clone()
    }

    pub fn reblog_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().reblog_calls.clone()
    }

    pub fn media_calls(&self) -> Vec<MediaPostCall> {
        self.state.lock().unwrap().media_calls.clone()
    }

    pub fn total_remote_calls(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.search_calls
            + state.follow_calls
            + state.post_calls.len()
            + state.reblog_calls.len()
            + state.media_calls.len()
    }

    fn server_error(endpoint: &str) -> ApiError {
        ApiError::Status {
            endpoint: endpoint.to_string(),
            status: 500,
            body: "boom".to_string(),
        }
    }
}

#[async_trait]
impl FediverseApi for RecordingApi {
    async fn verify_credentials(&self) -> Result<Account, ApiError> {
        Ok(Account {
            id: "bot".to_string(),
            acct: "bot".to_string(),
        })
    }

    async fn account_search(&self, _query: &str) -> Result<Vec<Account>, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.search_calls += 1;
        Ok(state.search_results.clone())
    }

    async fn account_statuses(
        &self,
        _account_id: &str,
        since_id: Option<&str>,
    ) -> Result<Vec<Status>, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.last_since_id = since_id.map(str::to_string);
        Ok(state.statuses_responses.pop_front().unwrap_or_default())
    }

    async fn account_following(&self, _account_id: &str) -> Result<Vec<Account>, ApiError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .following
            .iter()
            .map(|id| Account {
                id: id.clone(),
                acct: id.clone(),
            })
            .collect())
    }

    async fn account_follow(&self, _account_id: &str) -> Result<(), ApiError> {
        self.state.lock().unwrap().follow_calls += 1;
        Ok(())
    }

    async fn status_post(&self, params: StatusParams) -> Result<Status, ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.post_failures > 0 {
            state.post_failures -= 1;
            return Err(Self::server_error("/api/v1/statuses"));
        }
        state.next_id += 1;
        let id = format!("R{}", state.next_id);
        state.post_calls.push(StatusPostCall {
            status: params.status.clone(),
            in_reply_to_id: params.in_reply_to_id.clone(),
            media_ids: params.media_ids.clone(),
            language: params.language.clone(),
        });
        Ok(status(&id, 1_700_000_000))
    }

    async fn status_reblog(&self, status_id: &str) -> Result<Status, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.reblog_calls.push(status_id.to_string());
        state.next_id += 1;
        let id = format!("R{}", state.next_id);
        Ok(status(&id, 1_700_000_000))
    }

    async fn media_post(&self, upload: MediaUpload) -> Result<MediaAttachment, ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.media_failures > 0 {
            state.media_failures -= 1;
            return Err(Self::server_error("/api/v2/media"));
        }
        state.next_id += 1;
        let id = format!("M{}", state.next_id);
        state.media_calls.push(MediaPostCall {
            file_name: upload.file_name.clone(),
            description: upload.description.clone(),
        });
        Ok(MediaAttachment { id })
    }
}

/// Gateway answering from a fixed message list; downloads write a stub
/// file so paths are real.
pub struct FakeGateway {
    messages: Vec<RawMessage>,
    fail_downloads: Mutex<usize>,
}

impl FakeGateway {
    pub fn new(messages: Vec<RawMessage>) -> Self {
        Self {
            messages,
            fail_downloads: Mutex::new(0),
        }
    }

    pub fn fail_next_downloads(&self, n: usize) {
        *self.fail_downloads.lock().unwrap() = n;
    }
}

#[async_trait]
impl TelegramGateway for FakeGateway {
    async fn history(
        &self,
        _channel_id: i64,
        min_id: Option<i64>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawMessage>, ParseError> {
        let mut messages: Vec<RawMessage> = self
            .messages
            .iter()
            .filter(|m| min_id.is_none_or(|min| m.id > min))
            .filter(|m| since.is_none_or(|cutoff| m.date >= cutoff))
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    async fn download(&self, file: &RawFile, dest: &Path) -> Result<PathBuf, MediaUnavailable> {
        {
            let mut failures = self.fail_downloads.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(MediaUnavailable(format!("download of {} failed", file.id)));
            }
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MediaUnavailable(e.to_string()))?;
        }
        std::fs::write(dest, b"stub")
            .map_err(|e| MediaUnavailable(e.to_string()))?;
        Ok(dest.to_path_buf())
    }
}
