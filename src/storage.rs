//! Key-value persistence over a single YAML document.
//!
//! Every piece of durable state (queue, per-source seen markers, cached
//! account lookups) goes through one of these. Keys are dotted paths into
//! nested mappings; untrusted identifiers (URLs, handles) are hashed to a
//! fixed-width hex string first so they can never collide with structured
//! keys or break the document layout.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ConfigError;

#[derive(Debug)]
pub struct Storage {
    path: PathBuf,
    content: Value,
}

impl Storage {
    /// Opens the document at `path`. A missing file is an empty document;
    /// a file that exists but does not parse is a hard error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = read_document(&path)?;
        Ok(Self { path, content })
    }

    /// Re-reads the backing file, discarding any unsaved mutation.
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.content = read_document(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dotted-path lookup. A missing intermediate yields `None`, not an
    /// error.
    pub fn get(&self, param: &str) -> Option<&Value> {
        let mut current = &self.content;
        for segment in param.split('.') {
            current = current.get(segment)?;
        }
        Some(current)
    }

    /// Typed variant of [`Storage::get`]. A present value that does not
    /// deserialize into `T` is treated as absent.
    pub fn get_as<T: DeserializeOwned>(&self, param: &str) -> Option<T> {
        let value = self.get(param)?;
        serde_yaml::from_value(value.clone()).ok()
    }

    /// Sets `value` under the dotted path, creating intermediate mappings
    /// as needed.
    pub fn set<T: Serialize>(&mut self, param: &str, value: T) -> Result<(), ConfigError> {
        let value = serde_yaml::to_value(value)
            .map_err(|e| ConfigError::Invalid(format!("unserializable value for [{param}]: {e}")))?;

        if !self.content.is_mapping() {
            self.content = Value::Mapping(Mapping::new());
        }

        let mut current = &mut self.content;
        let segments: Vec<&str> = param.split('.').collect();
        for segment in &segments[..segments.len() - 1] {
            let map = current
                .as_mapping_mut()
                .ok_or_else(|| ConfigError::Invalid(format!("[{param}] crosses a non-mapping node")))?;
            let key = Value::String((*segment).to_string());
            let needs_fresh_map = !map.get(&key).is_some_and(Value::is_mapping);
            if needs_fresh_map {
                map.insert(key.clone(), Value::Mapping(Mapping::new()));
            }
            current = map.get_mut(&key).ok_or_else(|| {
                ConfigError::Invalid(format!("[{param}] lost an intermediate node"))
            })?;
        }

        let map = current
            .as_mapping_mut()
            .ok_or_else(|| ConfigError::Invalid(format!("[{param}] crosses a non-mapping node")))?;
        let last = segments[segments.len() - 1];
        map.insert(Value::String(last.to_string()), value);
        Ok(())
    }

    /// Lookup under `sha256(key)`.
    pub fn get_hashed(&self, key: &str) -> Option<&Value> {
        self.get(&hashed_key(key))
    }

    pub fn get_hashed_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_as(&hashed_key(key))
    }

    /// Store under `sha256(key)`.
    pub fn set_hashed<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), ConfigError> {
        self.set(&hashed_key(key), value)
    }

    /// Atomic replace: the document is written to a sibling temp file,
    /// fsynced and renamed over the target, so a crash mid-write never
    /// leaves a truncated file behind.
    pub fn write_file(&self) -> Result<(), ConfigError> {
        let as_io = |source: std::io::Error| ConfigError::Io {
            path: self.path.display().to_string(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(as_io)?;
            }
        }

        let serialized = serde_yaml::to_string(&self.content).map_err(|e| ConfigError::Malformed {
            path: self.path.display().to_string(),
            source: e,
        })?;

        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(as_io)?;
        file.write_all(serialized.as_bytes()).map_err(as_io)?;
        file.sync_all().map_err(as_io)?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(as_io)?;

        debug!(path = %self.path.display(), "storage written");
        Ok(())
    }
}

fn read_document(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Ok(Value::Mapping(Mapping::new()));
    }

    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let parsed: Value = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Malformed {
        path: path.display().to_string(),
        source,
    })?;

    // An empty file parses to null; treat it like a fresh document.
    if parsed.is_null() {
        return Ok(Value::Mapping(Mapping::new()));
    }
    Ok(parsed)
}

fn hashed_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}
