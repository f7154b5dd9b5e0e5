//! Media detection and retrieval.
//!
//! Parsers only *detect* media where they can (feed entries embed `<img>`
//! tags); the actual download happens either in the Telegram parser (the
//! upstream files are only reachable through its client) or here, when the
//! publisher turns a URL-only attachment into an uploadable local file.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use sha1::{Digest, Sha1};
use tracing::debug;
use url::Url;

use crate::error::MediaUnavailable;

static IMG_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("img").expect("static selector"));

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRef {
    pub url: String,
    pub alt_text: Option<String>,
}

/// Collects `<img src alt>` references out of an HTML fragment.
pub fn extract_images(html: &str) -> Vec<ImageRef> {
    let fragment = Html::parse_fragment(html);
    fragment
        .select(&IMG_SELECTOR)
        .filter_map(|img| {
            let src = img.value().attr("src")?;
            if src.is_empty() {
                return None;
            }
            let alt = img
                .value()
                .attr("alt")
                .filter(|alt| !alt.is_empty())
                .map(str::to_string);
            Some(ImageRef {
                url: src.to_string(),
                alt_text: alt,
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Downloaded {
    pub path: PathBuf,
    pub mime_type: Option<String>,
}

/// Fetches `url` into `dir`, keeping the remote file name when the URL has
/// one. The MIME type comes from the response header, falling back to a
/// guess from the file extension.
pub async fn download_from_url(
    client: &reqwest::Client,
    url: &str,
    dir: &Path,
) -> Result<Downloaded, MediaUnavailable> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| MediaUnavailable(format!("GET {url}: {e}")))?;

    if !response.status().is_success() {
        return Err(MediaUnavailable(format!("{url} -> HTTP {}", response.status())));
    }

    let header_mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

    let bytes = response
        .bytes()
        .await
        .map_err(|e| MediaUnavailable(format!("reading {url}: {e}")))?;

    let file_name = file_name_for(url);
    let path = dir.join(&file_name);

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| MediaUnavailable(format!("creating {}: {e}", dir.display())))?;
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| MediaUnavailable(format!("writing {}: {e}", path.display())))?;

    let mime_type = header_mime.or_else(|| {
        mime_guess::from_path(&path)
            .first()
            .map(|m| m.essence_str().to_string())
    });

    debug!(url, path = %path.display(), "media downloaded");
    Ok(Downloaded { path, mime_type })
}

/// Last URL path segment, or a content hash of the URL when it has none.
fn file_name_for(url: &str) -> String {
    if let Ok(parsed) = Url::parse(url) {
        if let Some(segment) = parsed
            .path_segments()
            .and_then(|segments| segments.last())
            .filter(|s| !s.is_empty())
        {
            return segment.to_string();
        }
    }
    let mut hasher = Sha1::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}
