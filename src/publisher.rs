//! Publishes the queued posts.
//!
//! Drains the queue front to back, reconstructing reply chains through the
//! server-assigned status ids: while consecutive queue entries share a
//! group, each one is posted in reply to the previous one's remote id.
//! Failed publications retry with a fixed back-off and are discarded after
//! exhaustion; the queue file is only rewritten once, at the end of the
//! drain, and never in dry-run mode.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ConfigError;
use crate::fediverse::{ContentType, FediverseApi, MediaUpload, Status, StatusParams, Visibility};
use crate::media;
use crate::post::{Action, QueuePost, QueuePostMedia};
use crate::queue::PostQueue;
use crate::text;

const MAX_RETRIES: u32 = 3;
const SLEEP_TIME: Duration = Duration::from_secs(10);

pub struct Publisher {
    api: Arc<dyn FediverseApi>,
    http: reqwest::Client,
    dry_run: bool,
    only_oldest: bool,
    media_storage: PathBuf,
    max_length: usize,
    visibility: Visibility,
    content_type: ContentType,
}

impl Publisher {
    pub fn new(config: &Config, api: Arc<dyn FediverseApi>) -> Self {
        Self {
            api,
            http: reqwest::Client::new(),
            dry_run: config.publisher.dry_run,
            only_oldest: config.only_oldest_per_iteration(),
            media_storage: config.publisher.media_storage.clone(),
            max_length: config.defaults.max_length,
            visibility: config.publisher.visibility,
            content_type: config.publisher.content_type,
        }
    }

    /// Drains the queue. Groups publish contiguously as a thread even when
    /// `only_oldest` limits the run to a single logical post.
    pub async fn publish_all(&self, queue: &mut PostQueue) -> Result<(), ConfigError> {
        if queue.is_empty() {
            info!("the queue is empty, skipping");
            return Ok(());
        }
        if self.dry_run {
            info!("dry run: no remote calls will be made and the queue will not be saved");
        }

        let mut previous_id: Option<String> = None;
        while let Some(post) = queue.pop_front() {
            match self.execute_action(&post, previous_id.as_deref()).await {
                Some(published) => {
                    debug!(id = %published.id, "post was published");
                    previous_id = Some(published.id);
                }
                // Dry run, skipped or terminally failed: the reply chain
                // must not point at something that was never posted.
                None => previous_id = None,
            }

            let next_in_group = previous_id.is_some()
                && post.group.is_some()
                && queue
                    .first()
                    .is_some_and(|next| next.group == post.group);
            if next_in_group {
                debug!("more posts in this group, continuing the thread");
                continue;
            }

            previous_id = None;
            if self.only_oldest {
                info!("publishing only the oldest per iteration, finishing");
                break;
            }
        }

        if !self.dry_run {
            queue.save()?;
        }
        Ok(())
    }

    /// Publishes one post outside the queue flow (the `publish-test`
    /// command).
    pub async fn publish_single(&self, post: &QueuePost) -> Option<Status> {
        self.execute_action(post, None).await
    }

    async fn execute_action(&self, post: &QueuePost, previous_id: Option<&str>) -> Option<Status> {
        if self.dry_run {
            debug!(id = %post.id, "dry run, stopping here");
            return None;
        }

        match &post.action {
            Action::Reblog(remote_id) => {
                info!(remote_id = %remote_id, "boosting post");
                match self.api.status_reblog(remote_id).await {
                    Ok(published) => Some(published),
                    Err(e) => {
                        error!(remote_id = %remote_id, error = %e, "boost failed, discarding");
                        None
                    }
                }
            }
            Action::New => self.post_new(post, previous_id).await,
        }
    }

    async fn post_new(&self, post: &QueuePost, previous_id: Option<&str>) -> Option<Status> {
        let mut media_ids = Vec::new();
        if !post.media.is_empty() {
            info!(count = post.media.len(), "posting media items first");
            for item in &post.media {
                if !item.is_usable() {
                    warn!("media item has neither url nor path, skipping");
                    continue;
                }
                match self.post_media(item).await {
                    Some(attachment) => media_ids.push(attachment.id),
                    None => warn!(
                        media = item.url.as_deref().unwrap_or("<local file>"),
                        "could not post media item"
                    ),
                }
            }
        }

        let status = text::ellipsize(post.text.as_deref().unwrap_or(""), self.max_length);
        if status.is_empty() && media_ids.is_empty() {
            warn!(id = %post.id, "no media and no body, skipping this post");
            return None;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            info!(attempt, status = %status, "posting new status");
            let params = StatusParams {
                status: status.clone(),
                language: post.language.clone(),
                in_reply_to_id: previous_id.map(str::to_string),
                media_ids: media_ids.clone(),
                visibility: self.visibility,
                content_type: self.content_type,
                // Same key on every retry: a post that made it out despite
                // the error response will not be duplicated.
                idempotency_key: Some(post.id.clone()),
            };
            match self.api.status_post(params).await {
                Ok(published) => return Some(published),
                Err(e) => {
                    warn!(attempt, error = %e, "publish attempt failed");
                    if attempt >= MAX_RETRIES {
                        error!(
                            max_retries = MAX_RETRIES,
                            "max retries reached, discarding post"
                        );
                        return None;
                    }
                    debug!(seconds = SLEEP_TIME.as_secs(), "sleeping before retry");
                    tokio::time::sleep(SLEEP_TIME).await;
                }
            }
        }
    }

    /// Uploads one attachment, downloading URL-only items into the media
    /// storage directory first.
    async fn post_media(&self, item: &QueuePostMedia) -> Option<crate::fediverse::MediaAttachment> {
        let (path, mime_type) = if let Some(path) = &item.path {
            (path.clone(), item.mime_type.clone())
        } else {
            let url = item.url.as_deref()?;
            match media::download_from_url(&self.http, url, &self.media_storage).await {
                Ok(downloaded) => (
                    downloaded.path,
                    item.mime_type.clone().or(downloaded.mime_type),
                ),
                Err(e) => {
                    warn!(url, error = %e, "media download failed");
                    return None;
                }
            }
        };

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read media file");
                return None;
            }
        };
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "media".to_string());

        let upload = MediaUpload {
            bytes,
            file_name,
            mime_type,
            description: item.alt_text.clone(),
            focus: Some((0.0, 1.0)),
        };
        match self.api.media_post(upload).await {
            Ok(attachment) => Some(attachment),
            Err(e) => {
                warn!(error = %e, "media upload failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingApi;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn queue_in(dir: &std::path::Path) -> PostQueue {
        PostQueue::open(dir.join("queue.yaml")).expect("queue")
    }

    fn publisher_with(api: Arc<RecordingApi>, dry_run: bool, only_oldest: bool) -> Publisher {
        let mut config = Config::default();
        config.publisher.dry_run = dry_run;
        config.publisher.only_oldest_post_every_iteration = only_oldest;
        Publisher::new(&config, api)
    }

    fn new_post(id: &str, ts: i64, text: &str, group: Option<&str>) -> QueuePost {
        let mut post = QueuePost::new(id, Utc.timestamp_opt(ts, 0).unwrap());
        post.text = Some(text.to_string());
        post.group = group.map(str::to_string);
        post
    }

    #[tokio::test]
    async fn grouped_posts_thread_through_remote_ids() {
        let dir = tempdir().expect("tempdir");
        let api = Arc::new(RecordingApi::new());
        let publisher = publisher_with(api.clone(), false, false);

        let mut queue = queue_in(dir.path());
        queue.append(new_post("p1", 100, "one", Some("g")));
        queue.append(new_post("p2", 101, "two", Some("g")));
        queue.append(new_post("p3", 102, "three", Some("g")));

        publisher.publish_all(&mut queue).await.expect("publish");

        let calls = api.post_calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].in_reply_to_id, None);
        assert_eq!(calls[1].in_reply_to_id, Some("R1".to_string()));
        assert_eq!(calls[2].in_reply_to_id, Some("R2".to_string()));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn chain_resets_between_groups() {
        let dir = tempdir().expect("tempdir");
        let api = Arc::new(RecordingApi::new());
        let publisher = publisher_with(api.clone(), false, false);

        let mut queue = queue_in(dir.path());
        queue.append(new_post("p1", 100, "one", Some("g1")));
        queue.append(new_post("p2", 101, "two", Some("g2")));

        publisher.publish_all(&mut queue).await.expect("publish");

        let calls = api.post_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].in_reply_to_id, None);
        assert_eq!(calls[1].in_reply_to_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_discards_and_continues_clean() {
        let dir = tempdir().expect("tempdir");
        let api = Arc::new(RecordingApi::new());
        api.fail_next_posts(3);
        let publisher = publisher_with(api.clone(), false, false);

        let mut queue = queue_in(dir.path());
        queue.append(new_post("p1", 100, "doomed", Some("g")));
        queue.append(new_post("p2", 101, "fine", Some("g")));

        publisher.publish_all(&mut queue).await.expect("publish");

        // Three failed attempts for the first post, then the second one
        // starts its own chain.
        let calls = api.post_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, "fine");
        assert_eq!(calls[0].in_reply_to_id, None);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let dir = tempdir().expect("tempdir");
        let api = Arc::new(RecordingApi::new());
        let publisher = publisher_with(api.clone(), true, false);

        let mut queue = queue_in(dir.path());
        queue.append(new_post("p1", 100, "one", None));
        queue.append(new_post("p2", 101, "two", None));
        queue.save().expect("save");

        publisher.publish_all(&mut queue).await.expect("publish");

        assert_eq!(api.total_remote_calls(), 0);
        // The in-memory queue drained, but the saved state did not move.
        let reloaded = queue.load().expect("reload");
        assert_eq!(reloaded, 2);
    }

    #[tokio::test]
    async fn only_oldest_drains_one_post_but_whole_groups() {
        let dir = tempdir().expect("tempdir");
        let api = Arc::new(RecordingApi::new());
        let publisher = publisher_with(api.clone(), false, true);

        let mut queue = queue_in(dir.path());
        queue.append(new_post("p1", 100, "one", Some("g")));
        queue.append(new_post("p2", 101, "two", Some("g")));
        queue.append(new_post("p3", 102, "solo", None));

        publisher.publish_all(&mut queue).await.expect("publish");

        // The group drained atomically, the unrelated post stayed queued.
        assert_eq!(api.post_calls().len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.first().map(|p| p.id.clone()), Some("p3".to_string()));
    }

    #[tokio::test]
    async fn reblog_actions_boost_by_remote_id() {
        let dir = tempdir().expect("tempdir");
        let api = Arc::new(RecordingApi::new());
        let publisher = publisher_with(api.clone(), false, false);

        let mut queue = queue_in(dir.path());
        let mut post = QueuePost::new("42", Utc.timestamp_opt(100, 0).unwrap());
        post.action = Action::Reblog("42".into());
        queue.append(post);

        publisher.publish_all(&mut queue).await.expect("publish");

        assert_eq!(api.reblog_calls(), vec!["42".to_string()]);
        assert!(api.post_calls().is_empty());
    }

    #[tokio::test]
    async fn empty_posts_are_skipped_without_remote_calls() {
        let dir = tempdir().expect("tempdir");
        let api = Arc::new(RecordingApi::new());
        let publisher = publisher_with(api.clone(), false, false);

        let mut queue = queue_in(dir.path());
        queue.append(QueuePost::new("empty", Utc.timestamp_opt(100, 0).unwrap()));

        publisher.publish_all(&mut queue).await.expect("publish");
        assert_eq!(api.total_remote_calls(), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn long_text_is_ellipsized_to_the_status_cap() {
        let dir = tempdir().expect("tempdir");
        let api = Arc::new(RecordingApi::new());
        let publisher = publisher_with(api.clone(), false, false);

        let mut queue = queue_in(dir.path());
        queue.append(new_post("p1", 100, &"x".repeat(600), None));

        publisher.publish_all(&mut queue).await.expect("publish");

        let calls = api.post_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status.chars().count(), 500);
        assert!(calls[0].status.ends_with("..."));
    }

    #[tokio::test]
    async fn local_media_is_uploaded_in_order() {
        let dir = tempdir().expect("tempdir");
        let api = Arc::new(RecordingApi::new());
        let publisher = publisher_with(api.clone(), false, false);

        let first = dir.path().join("a.png");
        let second = dir.path().join("b.png");
        std::fs::write(&first, b"a").expect("write");
        std::fs::write(&second, b"b").expect("write");

        let mut post = new_post("p1", 100, "with media", None);
        post.media = vec![
            QueuePostMedia::from_path(&first, Some("image/png".into())),
            QueuePostMedia::from_path(&second, Some("image/png".into())),
        ];
        let mut queue = queue_in(dir.path());
        queue.append(post);

        publisher.publish_all(&mut queue).await.expect("publish");

        let uploads = api.media_calls();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].file_name, "a.png");
        assert_eq!(uploads[1].file_name, "b.png");
        let calls = api.post_calls();
        assert_eq!(calls[0].media_ids, vec!["M1".to_string(), "M2".to_string()]);
    }

    #[tokio::test]
    async fn failed_media_is_skipped_but_the_post_still_goes_out() {
        let dir = tempdir().expect("tempdir");
        let api = Arc::new(RecordingApi::new());
        api.fail_next_media(1);
        let publisher = publisher_with(api.clone(), false, false);

        let first = dir.path().join("a.png");
        let second = dir.path().join("b.png");
        std::fs::write(&first, b"a").expect("write");
        std::fs::write(&second, b"b").expect("write");

        let mut post = new_post("p1", 100, "partly illustrated", None);
        post.media = vec![
            QueuePostMedia::from_path(&first, Some("image/png".into())),
            QueuePostMedia::from_path(&second, Some("image/png".into())),
        ];
        let mut queue = queue_in(dir.path());
        queue.append(post);

        publisher.publish_all(&mut queue).await.expect("publish");

        let calls = api.post_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].media_ids, vec!["M1".to_string()]);
    }

    #[tokio::test]
    async fn unusable_media_entries_are_ignored() {
        let dir = tempdir().expect("tempdir");
        let api = Arc::new(RecordingApi::new());
        let publisher = publisher_with(api.clone(), false, false);

        let mut post = new_post("p1", 100, "text", None);
        post.media = vec![QueuePostMedia {
            url: None,
            path: None,
            mime_type: None,
            alt_text: None,
        }];
        let mut queue = queue_in(dir.path());
        queue.append(post);

        publisher.publish_all(&mut queue).await.expect("publish");

        assert!(api.media_calls().is_empty());
        assert_eq!(api.post_calls().len(), 1);
        assert!(api.post_calls()[0].media_ids.is_empty());
    }
}
