use thiserror::Error;

/// Malformed on-disk configuration or state. Fatal for the run.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed document {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

/// Errors raised while fetching raw content from an upstream source.
///
/// Both variants are source-local: the orchestrator logs them, skips the
/// source and continues with the rest of the run.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("source [{source_name}] unreachable: {reason}")]
    Unreachable { source_name: String, reason: String },

    #[error("source [{source_name}] returned malformed data: {reason}")]
    Malformed { source_name: String, reason: String },
}

impl ParseError {
    pub fn unreachable(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unreachable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Malformed {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }
}

/// A single media item could not be fetched or stored. The owning post is
/// still published with whatever media remains.
#[derive(Error, Debug)]
#[error("media unavailable: {0}")]
pub struct MediaUnavailable(pub String);

/// Errors from the remote fediverse API surface.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
}
