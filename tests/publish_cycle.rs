//! End-to-end drain of a persisted queue through the publisher, against
//! an in-memory remote.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use fedibot::config::Config;
use fedibot::error::ApiError;
use fedibot::fediverse::{
    Account, FediverseApi, MediaAttachment, MediaUpload, Status, StatusParams,
};
use fedibot::post::{Action, QueuePost};
use fedibot::publisher::Publisher;
use fedibot::queue::PostQueue;

#[derive(Default)]
struct RemoteDouble {
    posted: Mutex<Vec<(String, Option<String>)>>,
    boosted: Mutex<Vec<String>>,
    counter: Mutex<usize>,
}

impl RemoteDouble {
    fn next_status(&self, prefix: &str) -> Status {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        Status {
            id: format!("{prefix}{counter}"),
            content: String::new(),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            visibility: "public".to_string(),
            in_reply_to_id: None,
            in_reply_to_account_id: None,
            reblog: None,
        }
    }
}

#[async_trait]
impl FediverseApi for RemoteDouble {
    async fn verify_credentials(&self) -> Result<Account, ApiError> {
        Ok(Account {
            id: "bot".into(),
            acct: "bot".into(),
        })
    }

    async fn account_search(&self, _query: &str) -> Result<Vec<Account>, ApiError> {
        Ok(Vec::new())
    }

    async fn account_statuses(
        &self,
        _account_id: &str,
        _since_id: Option<&str>,
    ) -> Result<Vec<Status>, ApiError> {
        Ok(Vec::new())
    }

    async fn account_following(&self, _account_id: &str) -> Result<Vec<Account>, ApiError> {
        Ok(Vec::new())
    }

    async fn account_follow(&self, _account_id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn status_post(&self, params: StatusParams) -> Result<Status, ApiError> {
        self.posted
            .lock()
            .unwrap()
            .push((params.status, params.in_reply_to_id));
        Ok(self.next_status("R"))
    }

    async fn status_reblog(&self, status_id: &str) -> Result<Status, ApiError> {
        self.boosted.lock().unwrap().push(status_id.to_string());
        Ok(self.next_status("B"))
    }

    async fn media_post(&self, _upload: MediaUpload) -> Result<MediaAttachment, ApiError> {
        Ok(MediaAttachment { id: "M".into() })
    }
}

fn post(id: &str, ts: i64, text: &str, group: Option<&str>) -> QueuePost {
    let mut post = QueuePost::new(id, Utc.timestamp_opt(ts, 0).unwrap());
    post.text = Some(text.to_string());
    post.group = group.map(str::to_string);
    post
}

#[tokio::test]
async fn a_persisted_queue_drains_in_order_and_threads_groups() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue_file = dir.path().join("queue.yaml");

    // First "run": ingest side fills and saves the queue, out of order
    // and with a duplicate, then secures it.
    {
        let mut queue = PostQueue::open(&queue_file).expect("queue");
        queue.append(post("solo", 300, "standalone", None));
        queue.append(post("t1", 100, "thread 1/3", Some("g")));
        queue.append(post("t2", 101, "thread 2/3", Some("g")));
        queue.append(post("t3", 102, "thread 3/3", Some("g")));
        queue.append(post("t1", 100, "thread 1/3", Some("g")));
        let mut boost = QueuePost::new("b", Utc.timestamp_opt(400, 0).unwrap());
        boost.action = Action::Reblog("remote-7".into());
        queue.append(boost);

        queue.deduplicate();
        queue.sort();
        queue.save().expect("save");
    }

    // Second "run": a fresh process loads the file and publishes.
    let remote = Arc::new(RemoteDouble::default());
    let mut queue = PostQueue::open(&queue_file).expect("reopen");
    assert_eq!(queue.len(), 5);

    let config = Config::default();
    let publisher = Publisher::new(&config, remote.clone());
    publisher.publish_all(&mut queue).await.expect("publish");

    let posted = remote.posted.lock().unwrap().clone();
    assert_eq!(
        posted,
        vec![
            ("thread 1/3".to_string(), None),
            ("thread 2/3".to_string(), Some("R1".to_string())),
            ("thread 3/3".to_string(), Some("R2".to_string())),
            ("standalone".to_string(), None),
        ]
    );
    assert_eq!(*remote.boosted.lock().unwrap(), vec!["remote-7".to_string()]);

    // The drained queue was saved empty; a third run sees nothing left.
    let queue = PostQueue::open(&queue_file).expect("reopen again");
    assert!(queue.is_empty());
}

#[tokio::test]
async fn dry_run_leaves_the_queue_file_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue_file = dir.path().join("queue.yaml");

    {
        let mut queue = PostQueue::open(&queue_file).expect("queue");
        queue.append(post("a", 100, "one", None));
        queue.append(post("b", 200, "two", None));
        queue.save().expect("save");
    }

    let remote = Arc::new(RemoteDouble::default());
    let mut queue = PostQueue::open(&queue_file).expect("reopen");

    let mut config = Config::default();
    config.publisher.dry_run = true;
    let publisher = Publisher::new(&config, remote.clone());
    publisher.publish_all(&mut queue).await.expect("publish");

    assert!(remote.posted.lock().unwrap().is_empty());
    assert!(remote.boosted.lock().unwrap().is_empty());

    let queue = PostQueue::open(&queue_file).expect("reopen again");
    assert_eq!(queue.len(), 2);
}
