use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fedibot::config::Config;
use fedibot::fediverse::{FediverseApi, MastodonClient};
use fedibot::janitor::Janitor;
use fedibot::orchestrator;
use fedibot::post::QueuePost;
use fedibot::publisher::Publisher;

#[derive(Parser)]
#[command(name = "fedibot", about = "Multi-source content syndication bot for the fediverse")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// One full ingest and publish cycle.
    Run,
    /// Publish what is already queued, skipping ingestion.
    PublishQueue,
    /// Publish a synthetic test post.
    PublishTest,
    /// Fire a test report at the janitor endpoint.
    TestJanitor,
    /// Load the configuration and report what would be active.
    ValidateConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // A config that cannot be read or parsed is the one fatal error; from
    // here on, failures are logged and absorbed so the next scheduled
    // invocation can recover.
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logger.level.clone())),
        )
        .init();

    match cli.command {
        Command::Run => orchestrator::run_guarded(&config).await,
        Command::PublishQueue => {
            if let Err(e) = orchestrator::publish_queue(&config).await {
                error!(error = ?e, "publish-queue failed");
            }
        }
        Command::PublishTest => publish_test(&config).await,
        Command::TestJanitor => test_janitor(&config).await,
        Command::ValidateConfig => validate_config(&config),
    }

    ExitCode::SUCCESS
}

async fn publish_test(config: &Config) {
    info!("publishing test message");

    let api: std::sync::Arc<dyn FediverseApi> = match MastodonClient::new(&config.app) {
        Ok(client) => std::sync::Arc::new(client),
        Err(e) => {
            error!(error = %e, "cannot build the remote api client");
            return;
        }
    };

    let mut post = QueuePost::new("publish-test", Utc::now());
    post.text = Some("This is a test".to_string());
    post.language = Some("en".to_string());

    match Publisher::new(config, api).publish_single(&post).await {
        Some(published) => info!(id = %published.id, "test post published"),
        None => info!("test post was not published (dry run or failure)"),
    }
}

fn validate_config(config: &Config) {
    info!(app = %config.app.name, "configuration parsed");
    info!(
        feed_sources = config.feed_parser.sites.len(),
        telegram_sources = config.telegram_parser.conversations().len(),
        mastodon_accounts = config.mastodon_parser.accounts.len(),
        mastodon_active = config.mastodon_parser.active,
        "configured sources"
    );
    info!(
        dry_run = config.publisher.dry_run,
        only_oldest = config.only_oldest_per_iteration(),
        max_length = config.defaults.max_length,
        janitor_active = config.janitor.active,
        "publisher settings"
    );
    if config.app.api_base_url.is_empty() {
        info!("note: app.api_base_url is empty, publishing will fail");
    }
}

async fn test_janitor(config: &Config) {
    if !config.janitor.active {
        info!("janitor is inactive, activate it in the config");
        return;
    }
    if config.publisher.dry_run {
        info!("publisher is set to dry run, not reporting");
        return;
    }
    let Some(remote_url) = &config.janitor.remote_url else {
        info!("the janitor remote url is not set in the config");
        return;
    };

    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    Janitor::new(remote_url)
        .error(
            &format!("Echo bot [{}] test in host: {hostname}", config.app.name),
            "```This is a test```",
        )
        .await;
    info!("janitor test report sent");
}
