//! The ingest → filter → enqueue → publish cycle.
//!
//! Parsers run sequentially; after each one the queue is deduplicated,
//! sorted and saved, so a later parser blowing up cannot lose an earlier
//! parser's work. Seen marks are written before post-processing: grouping
//! may reshape posts beyond recognition, and provenance must survive that.

use std::sync::Arc;

use anyhow::Context;
use chrono::{Months, Utc};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ParseError;
use crate::fediverse::{FediverseApi, MastodonClient};
use crate::filter::KeywordFilter;
use crate::janitor::Janitor;
use crate::parsers::feed::FeedParser;
use crate::parsers::mastodon::MastodonParser;
use crate::parsers::telegram::gateway::BotGateway;
use crate::parsers::telegram::TelegramParser;
use crate::parsers::{Parser, SourceMeta};
use crate::post::QueuePost;
use crate::publisher::Publisher;
use crate::queue::PostQueue;

/// Posts older than this are not worth echoing anymore.
const MONTHS_POST_TOO_OLD: u32 = 6;

/// Runs one full cycle and absorbs its failures: anything uncaught is
/// logged with its chain and optionally reported to the janitor, and the
/// process stays healthy for the next invocation.
pub async fn run_guarded(config: &Config) {
    if let Err(e) = run(config).await {
        error!(error = ?e, "run failed");
        notify_janitor(config, &e).await;
    }
}

async fn notify_janitor(config: &Config, e: &anyhow::Error) {
    if !config.janitor.active || config.publisher.dry_run {
        return;
    }
    let Some(remote_url) = &config.janitor.remote_url else {
        return;
    };
    Janitor::new(remote_url)
        .error(
            &format!("Echo bot [{}] failed: {e}", config.app.name),
            &format!("```{e:?}```"),
        )
        .await;
}

/// One full cycle: every active parser, every source, then the publisher.
pub async fn run(config: &Config) -> anyhow::Result<()> {
    info!("main run");

    let api: Arc<dyn FediverseApi> =
        Arc::new(MastodonClient::new(&config.app).context("remote api client")?);
    let mut queue = PostQueue::open(&config.queue_storage.file).context("opening the queue")?;
    let filter = KeywordFilter::new(&config.keywords_filter);

    for mut parser in active_parsers(config, api.clone())? {
        info!(parser = parser.name(), "processing parser");

        for meta in parser.sources() {
            info!(source = %meta.name, "processing source");
            if let Err(e) = process_source(parser.as_mut(), &meta, &filter, &mut queue).await {
                warn!(source = %meta.name, error = %e, "skipping source");
            }
        }

        // Isolate possible issues between parsers: secure the current
        // queue before moving on to the next one.
        queue.deduplicate();
        queue.sort();
        queue.save().context("saving the queue")?;
    }

    Publisher::new(config, api)
        .publish_all(&mut queue)
        .await
        .context("publishing the queue")?;

    info!("run finished");
    Ok(())
}

/// Drains the queue without ingesting anything new.
pub async fn publish_queue(config: &Config) -> anyhow::Result<()> {
    let api: Arc<dyn FediverseApi> =
        Arc::new(MastodonClient::new(&config.app).context("remote api client")?);
    let mut queue = PostQueue::open(&config.queue_storage.file).context("opening the queue")?;
    info!(len = queue.len(), "publishing the stored queue");
    Publisher::new(config, api)
        .publish_all(&mut queue)
        .await
        .context("publishing the queue")?;
    Ok(())
}

fn active_parsers(
    config: &Config,
    api: Arc<dyn FediverseApi>,
) -> anyhow::Result<Vec<Box<dyn Parser>>> {
    let mut parsers: Vec<Box<dyn Parser>> = Vec::new();

    if !config.feed_parser.sites.is_empty() {
        parsers.push(Box::new(FeedParser::new(config).context("feed parser")?));
    }

    let telegram_sources = config.telegram_parser.conversations();
    if !telegram_sources.is_empty() {
        if let Some(token) = &config.telegram_parser.bot_token {
            let gateway = Box::new(BotGateway::new(token));
            parsers.push(Box::new(
                TelegramParser::new(config, gateway).context("telegram parser")?,
            ));
        } else {
            warn!("telegram sources configured but no bot token, skipping the parser");
        }
    }

    if config.mastodon_parser.active && !config.mastodon_parser.accounts.is_empty() {
        parsers.push(Box::new(
            MastodonParser::new(config, api).context("mastodon parser")?,
        ));
    }

    if parsers.is_empty() {
        info!("no parsers are active");
    }
    Ok(parsers)
}

async fn process_source(
    parser: &mut dyn Parser,
    meta: &SourceMeta,
    filter: &KeywordFilter,
    queue: &mut PostQueue,
) -> anyhow::Result<()> {
    let posts = match parser.fetch_raw(&meta.name).await {
        Ok(posts) => posts,
        Err(e @ ParseError::Unreachable { .. }) => {
            warn!(source = %meta.name, error = %e, "source unreachable, skipping");
            return Ok(());
        }
        Err(e @ ParseError::Malformed { .. }) => {
            warn!(source = %meta.name, error = %e, "source malformed, skipping");
            return Ok(());
        }
    };

    let cutoff = Utc::now()
        .checked_sub_months(Months::new(MONTHS_POST_TOO_OLD))
        .unwrap_or_else(Utc::now);

    let mut valid = Vec::new();
    let mut discarded = 0usize;
    for post in posts {
        if parser.already_seen(&meta.name, &post.id) {
            debug!(id = %post.id, "discarding post: already seen");
            discarded += 1;
            continue;
        }
        if post.published_at < cutoff {
            debug!(
                id = %post.id,
                months = MONTHS_POST_TOO_OLD,
                "discarding post: too old"
            );
            discarded += 1;
            continue;
        }
        if !keyword_profile_allows(filter, meta, &post)? {
            debug!(id = %post.id, "discarding post: keyword profile rejected");
            discarded += 1;
            continue;
        }
        valid.push(post);
    }
    info!(source = %meta.name, kept = valid.len(), discarded, "source filtered");

    // Seen marks go in before post-processing, so grouping changes cannot
    // lose provenance.
    let ids: Vec<String> = valid.iter().map(|post| post.id.clone()).collect();
    parser
        .mark_seen(&meta.name, &ids)
        .context("persisting seen state")?;

    let processed = parser.post_process(&meta.name, valid);
    for mut post in processed {
        parser.parse_media(&mut post).await;
        parser.format_post(&meta.name, &mut post);
        queue.append(post);
    }

    Ok(())
}

fn keyword_profile_allows(
    filter: &KeywordFilter,
    meta: &SourceMeta,
    post: &QueuePost,
) -> anyhow::Result<bool> {
    let Some(profile) = &meta.keywords_profile else {
        return Ok(true);
    };
    let text = post.raw_combined.as_deref().unwrap_or("");
    Ok(filter.profile_allows_text(profile, text)?)
}
