//! RSS/Atom ingestion.
//!
//! Feeds are polled with the shared HTTP client and parsed with feed-rs.
//! Entry URLs are compared with their scheme stripped so the http and
//! https spellings of the same resource collapse into one seen mark.

use std::time::Duration;

use async_trait::async_trait;
use feed_rs::model::Feed;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{Config, Defaults, FeedSite};
use crate::error::{ConfigError, ParseError};
use crate::media;
use crate::parsers::{Parser, SourceMeta};
use crate::post::{QueuePost, QueuePostMedia, RawContent};
use crate::seen::SeenIds;
use crate::storage::Storage;
use crate::text;

const DEFAULT_LANGUAGE: &str = "en";

/// Per-feed record in the seen-state document, keyed by the hashed feed
/// URL.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SiteSeen {
    urls_seen: Vec<String>,
}

/// `http`/`https` of the same resource must collapse for dedup.
fn strip_scheme(url: &str) -> String {
    url.strip_prefix("https:")
        .or_else(|| url.strip_prefix("http:"))
        .unwrap_or(url)
        .to_string()
}

pub struct FeedParser {
    sites: Vec<FeedSite>,
    storage: Storage,
    seen: SeenIds,
    defaults: Defaults,
    http: reqwest::Client,
}

impl FeedParser {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let storage = Storage::open(&config.feed_parser.storage_file)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(config.app.name.clone())
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))?;
        Ok(Self {
            sites: config.feed_parser.sites.clone(),
            storage,
            seen: SeenIds::new(),
            defaults: config.defaults.clone(),
            http,
        })
    }

    fn site(&self, source: &str) -> Option<&FeedSite> {
        self.sites.iter().find(|s| s.name == source)
    }

    fn load_seen(&mut self, source: &str) {
        if self.seen.is_loaded(source) {
            return;
        }
        let urls = self
            .site(source)
            .and_then(|site| self.storage.get_hashed_as::<SiteSeen>(&site.url))
            .map(|record| record.urls_seen)
            .unwrap_or_default();
        debug!(source, count = urls.len(), "loaded seen urls");
        self.seen.put(source, urls);
    }

    /// Language priority: per-source override, then the feed's own
    /// language, then the per-source default, then the class default.
    fn choose_language(site: &FeedSite, feed_language: Option<&str>) -> String {
        if site.language_override {
            if let Some(default) = &site.language_default {
                return default.clone();
            }
        }
        if let Some(language) = feed_language {
            return language.to_string();
        }
        if let Some(default) = &site.language_default {
            return default.clone();
        }
        DEFAULT_LANGUAGE.to_string()
    }

    /// Maps parsed feed entries into raw queue posts. Entries without a
    /// usable link, body or date are dropped.
    fn collect_entries(&self, source: &str, site: &FeedSite, feed: &Feed) -> Vec<QueuePost> {
        if feed.entries.is_empty() {
            warn!(source, "no entries in this feed, skipping");
            return Vec::new();
        }

        let language = Self::choose_language(site, feed.language.as_deref());

        let mut posts = Vec::new();
        let mut discarded = 0usize;
        for entry in &feed.entries {
            let Some(link) = entry_link(entry) else {
                debug!(source, "entry without link, discarding");
                discarded += 1;
                continue;
            };

            // Some feeds put the body in `summary`, some only fill the
            // content block.
            let body = entry
                .summary
                .as_ref()
                .map(|text| text.content.clone())
                .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()));
            let Some(body) = body else {
                debug!(source, link = %link, "entry without body, discarding");
                discarded += 1;
                continue;
            };

            let Some(published) = entry.published.or(entry.updated) else {
                debug!(source, link = %link, "no usable published date, discarding");
                discarded += 1;
                continue;
            };

            let title = entry
                .title
                .as_ref()
                .map(|t| t.content.clone())
                .unwrap_or_default();

            let mut post = QueuePost::new(strip_scheme(&link), published);
            post.language = Some(language.clone());
            post.raw_combined = Some(format!("{title} {body}"));
            post.raw = Some(RawContent::Feed {
                url: link,
                title,
                body,
            });
            posts.push(post);
        }

        debug!(source, discarded, "discarded invalid entries");
        posts
    }
}

fn entry_link(entry: &feed_rs::model::Entry) -> Option<String> {
    // Prefer the "alternate" link, otherwise the first one.
    entry
        .links
        .iter()
        .find(|l| l.rel.as_deref().unwrap_or("alternate") == "alternate")
        .or_else(|| entry.links.first())
        .map(|l| l.href.clone())
}

#[async_trait]
impl Parser for FeedParser {
    fn name(&self) -> &'static str {
        "RSS Feed"
    }

    fn sources(&self) -> Vec<SourceMeta> {
        self.sites
            .iter()
            .map(|site| SourceMeta {
                name: site.name.clone(),
                keywords_profile: site.keywords_filter_profile.clone(),
            })
            .collect()
    }

    async fn fetch_raw(&mut self, source: &str) -> Result<Vec<QueuePost>, ParseError> {
        let site = self
            .site(source)
            .cloned()
            .ok_or_else(|| ParseError::malformed(source, "source not configured"))?;

        debug!(source, url = %site.url, "parsing site");
        let response = self
            .http
            .get(&site.url)
            .send()
            .await
            .map_err(|e| ParseError::unreachable(source, e))?;
        if !response.status().is_success() {
            return Err(ParseError::unreachable(
                source,
                format!("{} -> HTTP {}", site.url, response.status()),
            ));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ParseError::unreachable(source, e))?;

        let feed = feed_rs::parser::parse(std::io::Cursor::new(bytes))
            .map_err(|e| ParseError::malformed(source, e))?;

        Ok(self.collect_entries(source, &site, &feed))
    }

    fn already_seen(&mut self, source: &str, id: &str) -> bool {
        self.load_seen(source);
        self.seen.contains(source, id)
    }

    fn mark_seen(&mut self, source: &str, ids: &[String]) -> Result<(), ConfigError> {
        self.load_seen(source);
        let urls_seen = self.seen.extend(source, ids).to_vec();

        let Some(site) = self.sites.iter().find(|s| s.name == source) else {
            return Ok(());
        };
        debug!(source, count = urls_seen.len(), "updating seen urls");
        self.storage.set_hashed(&site.url, SiteSeen { urls_seen })?;
        self.storage.write_file()
    }

    async fn parse_media(&mut self, post: &mut QueuePost) {
        // Image links embedded in the entry body; downloads are left to
        // the publisher.
        let Some(combined) = &post.raw_combined else {
            return;
        };
        post.media = media::extract_images(combined)
            .into_iter()
            .map(|image| QueuePostMedia::from_url(image.url, image.alt_text))
            .collect();
    }

    fn format_post(&self, source: &str, post: &mut QueuePost) {
        let Some(RawContent::Feed { url, title, body }) = post.raw.clone() else {
            return;
        };
        let Some(site) = self.site(source) else {
            return;
        };

        let mut title = text::tame_shouting_title(&title);

        let mut body = if body.is_empty() {
            body
        } else {
            text::collapse_whitespace(&text::strip_html(&body))
        };

        if site.show_name {
            title = format!("{source}\t{title}");
        }

        let mut summary = Some(title);
        if self.defaults.merge_content {
            let title = summary.take().unwrap_or_default();
            body = format!("{title}\n\n{body}");
        }

        // The status must still fit the link and its separator after the
        // body is cut.
        let max_length = site.max_summary_length.unwrap_or(self.defaults.max_length);
        let url_length = text::count_chars(&url) + 2;
        if text::count_chars(&body) + url_length > max_length {
            let cut = max_length.saturating_sub(url_length + 3);
            body = format!("{}...", text::take_chars(&body, cut));
        }

        post.summary = summary.filter(|s| !s.is_empty());
        post.text = Some(format!("{body}\n\n{url}"));
    }
}
