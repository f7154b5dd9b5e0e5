//! In-memory side of the per-source seen-state.
//!
//! Each parser persists its own on-disk layout (hashed feed URLs, entity
//! keys, account records); what they share is this lazily-filled cache of
//! already-processed upstream IDs per source. The set only ever grows:
//! parsers load it once per source, check membership while filtering, and
//! extend it with the survivors before post-processing.

use std::collections::HashMap;

pub struct SeenIds {
    by_source: HashMap<String, Vec<String>>,
}

impl SeenIds {
    pub fn new() -> Self {
        Self {
            by_source: HashMap::new(),
        }
    }

    /// Whether the per-source list was already loaded from storage.
    pub fn is_loaded(&self, source: &str) -> bool {
        self.by_source.contains_key(source)
    }

    /// Installs the persisted list for a source.
    pub fn put(&mut self, source: &str, ids: Vec<String>) {
        self.by_source.insert(source.to_string(), ids);
    }

    pub fn contains(&self, source: &str, id: &str) -> bool {
        self.by_source
            .get(source)
            .is_some_and(|ids| ids.iter().any(|known| known == id))
    }

    /// Appends `ids` to the source's list, skipping ones already present,
    /// and returns the full list for persistence.
    pub fn extend(&mut self, source: &str, ids: &[String]) -> &[String] {
        let list = self.by_source.entry(source.to_string()).or_default();
        for id in ids {
            if !list.contains(id) {
                list.push(id.clone());
            }
        }
        list
    }
}

impl Default for SeenIds {
    fn default() -> Self {
        Self::new()
    }
}
