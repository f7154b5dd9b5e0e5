//! The durable publication queue.
//!
//! An ordered, deduplicated sequence of [`QueuePost`] with a persistent
//! YAML backing file (`{ queue: [...] }`). The file is the state of
//! record: a crash between runs loses at most the in-memory raw payloads,
//! which the next ingest rebuilds.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;

use tracing::debug;

use crate::error::ConfigError;
use crate::post::QueuePost;
use crate::storage::Storage;

const QUEUE_KEY: &str = "queue";

pub struct PostQueue {
    storage: Storage,
    items: VecDeque<QueuePost>,
}

impl PostQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let storage = Storage::open(path.as_ref())?;
        let mut queue = Self {
            storage,
            items: VecDeque::new(),
        };
        queue.load()?;
        Ok(queue)
    }

    /// Re-reads the backing file and returns the new length.
    pub fn load(&mut self) -> Result<usize, ConfigError> {
        self.storage.reload()?;
        self.items = self
            .storage
            .get_as::<VecDeque<QueuePost>>(QUEUE_KEY)
            .unwrap_or_default();
        Ok(self.items.len())
    }

    pub fn append(&mut self, post: QueuePost) {
        self.items.push_back(post);
    }

    pub fn pop_front(&mut self) -> Option<QueuePost> {
        self.items.pop_front()
    }

    pub fn first(&self) -> Option<&QueuePost> {
        self.items.front()
    }

    pub fn last(&self) -> Option<&QueuePost> {
        self.items.back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Stable sort by `published_at` ascending.
    pub fn sort(&mut self) {
        debug!("sorting queue by date asc");
        self.items
            .make_contiguous()
            .sort_by_key(|post| post.published_at);
    }

    /// Drops later duplicates of `(id, action)`, keeping the first
    /// occurrence in current order.
    pub fn deduplicate(&mut self) {
        debug!("deduplicating queue");
        let mut seen = HashSet::new();
        self.items.retain(|post| seen.insert(post.dedup_key()));
    }

    /// Serializes all posts to the backing file. Raw payloads are dropped
    /// by the post's serde shape.
    pub fn save(&mut self) -> Result<(), ConfigError> {
        debug!(len = self.items.len(), "saving the queue");
        self.storage.set(QUEUE_KEY, &self.items)?;
        self.storage.write_file()
    }
}
