use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

use rssreader::config::Config;
use rssreader::feed::FetchClient;
use rssreader::storage::{Database, DatabaseError, Feed, Item, Store};
use rssreader::sync::{self, RefreshEvent, RefreshScheduler};
use rssreader::util::parse_feed_url;

/// Get the config directory path (~/.config/rssreader/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("rssreader"))
}

fn ensure_config_dir(config_dir: &Path) -> Result<()> {
    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;
    }

    // SEC-007: Set directory permissions on Unix (user-only access)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(config_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "rssreader", about = "Pull-based RSS/Atom reader")]
struct Args {
    /// Config file (default: ~/.config/rssreader/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// SQLite database file (overrides `database_path` from the config)
    #[arg(long, global = true, value_name = "FILE")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed
    Add { url: String },
    /// Refresh one feed, or every stored feed
    Refresh { url: Option<String> },
    /// List subscribed feeds with unread counts
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show a feed's items, newest first
    Items {
        url: String,
        #[arg(long)]
        json: bool,
    },
    /// Mark an item as read
    Read { id: i64 },
    /// Hide an item; it is purged once the feed stops listing it
    Remove { id: i64 },
    /// Delete a feed and all of its items
    Unsubscribe { url: String },
    /// Keep feeds refreshed on the configured interval until Ctrl-C
    Watch { urls: Vec<String> },
}

#[derive(Serialize)]
struct FeedSummary<'a> {
    #[serde(flatten)]
    feed: &'a Feed,
    unread: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = match args.db.clone().or_else(|| config.database_path.clone()) {
        Some(path) => path,
        None => {
            ensure_config_dir(&config_dir)?;
            config_dir.join("feeds.db")
        }
    };
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => Arc::new(db),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of rssreader appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    let selector = config.selector().context("Invalid parser_overrides")?;
    let fetcher = FetchClient::new(config.fetch_config(), selector)
        .context("Failed to create HTTP client")?;

    match args.command {
        Command::Add { url } => {
            let url = parse_feed_url(&url)?;
            match sync::add_feed_by_url(&fetcher, db.as_ref(), &url).await {
                Some(feed) => {
                    let count = db.visible_items(feed.id).await?.len();
                    println!(
                        "Added {} ({} items)",
                        feed.title.as_deref().unwrap_or(&feed.source_url),
                        count
                    );
                }
                None => {
                    eprintln!("Error: Could not add {url}: the feed could not be fetched or parsed");
                    std::process::exit(1);
                }
            }
        }
        Command::Refresh { url: Some(url) } => {
            let url = parse_feed_url(&url)?;
            let report = sync::refresh_feed(&fetcher, db.as_ref(), &url)
                .await
                .with_context(|| format!("Failed to refresh {url}"))?;
            println!(
                "{}: {} new, {} updated, {} purged",
                url, report.created, report.updated, report.purged
            );
        }
        Command::Refresh { url: None } => {
            let results = sync::refresh_all(&fetcher, db.clone(), config.refresh_concurrency)
                .await
                .context("Failed to load feeds")?;
            let mut failed = 0;
            for result in &results {
                match &result.result {
                    Ok(report) => println!(
                        "{}: {} new, {} updated, {} purged",
                        result.feed_url, report.created, report.updated, report.purged
                    ),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{}: {}", result.feed_url, e);
                    }
                }
            }
            println!("Refreshed {} feeds ({} failed)", results.len(), failed);
        }
        Command::List { json } => {
            let feeds = db.list_feeds().await.context("Failed to load feeds")?;
            let mut summaries = Vec::with_capacity(feeds.len());
            for feed in &feeds {
                let unread = db.count_unread(feed.id).await?;
                summaries.push(FeedSummary { feed, unread });
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                for s in &summaries {
                    println!(
                        "{:>4}  {:>4} unread  {}  <{}>",
                        s.feed.id,
                        s.unread,
                        s.feed.title.as_deref().unwrap_or("(untitled)"),
                        s.feed.source_url
                    );
                }
            }
        }
        Command::Items { url, json } => {
            let url = parse_feed_url(&url)?;
            let Some(feed) = db.find_feed_by_url(url.as_str()).await? else {
                anyhow::bail!("Not subscribed to {url}");
            };
            let items = db.visible_items(feed.id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                for item in &items {
                    print_item(item);
                }
            }
        }
        Command::Read { id } => {
            db.set_read(id, true).await?;
        }
        Command::Remove { id } => {
            db.set_deletion_mark(id, true).await?;
        }
        Command::Unsubscribe { url } => {
            let url = parse_feed_url(&url)?;
            let Some(feed) = db.find_feed_by_url(url.as_str()).await? else {
                anyhow::bail!("Not subscribed to {url}");
            };
            db.delete_feed(feed.id).await?;
            println!("Unsubscribed from {url}");
        }
        Command::Watch { urls } => watch(&config, fetcher, db, urls).await?,
    }

    Ok(())
}

fn print_item(item: &Item) {
    let published = chrono::DateTime::from_timestamp(item.published, 0)
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default();
    println!(
        "{:>6} {} {}  {}",
        item.id,
        if item.read { " " } else { "*" },
        published,
        item.title.as_deref().unwrap_or(&item.link)
    );
}

/// Validates `urls` and drops repeats, so each feed gets a single scheduler.
///
/// Spellings that normalize to the same URL count as repeats. First
/// occurrence order is kept.
fn unique_feed_urls(urls: &[String]) -> Result<Vec<Url>> {
    let mut seen = BTreeSet::new();
    let mut unique = Vec::with_capacity(urls.len());
    for raw in urls {
        let url = parse_feed_url(raw)?;
        if seen.insert(url.as_str().to_string()) {
            unique.push(url);
        } else {
            tracing::warn!(url = %raw, "Duplicate feed URL ignored");
        }
    }
    Ok(unique)
}

async fn watch(
    config: &Config,
    fetcher: FetchClient,
    db: Arc<Database>,
    urls: Vec<String>,
) -> Result<()> {
    let urls = if urls.is_empty() {
        db.list_feeds()
            .await
            .context("Failed to load feeds")?
            .into_iter()
            .map(|feed| feed.source_url)
            .collect()
    } else {
        urls
    };
    if urls.is_empty() {
        anyhow::bail!("No feeds to watch. Add one with `rssreader add <url>`.");
    }

    let urls = unique_feed_urls(&urls)?;
    let (events_tx, mut events_rx) = mpsc::channel::<RefreshEvent>(32);
    let mut schedulers = Vec::with_capacity(urls.len());
    for url in urls {
        let scheduler =
            RefreshScheduler::new(url, fetcher.clone(), db.clone(), config.refresh_interval());
        scheduler.observe(events_tx.clone());
        scheduler.start();
        schedulers.push(scheduler);
    }
    drop(events_tx);

    tracing::info!(
        feeds = schedulers.len(),
        interval_secs = config.refresh_interval_secs,
        "Watching feeds"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(event) = events_rx.recv() => match event.result {
                Ok(report) => println!(
                    "{}: {} new, {} updated, {} purged",
                    event.feed_url, report.created, report.updated, report.purged
                ),
                Err(e) => eprintln!("{}: {}", event.feed_url, e),
            },
        }
    }

    for scheduler in &schedulers {
        scheduler.stop();
        tracing::debug!(feed = %scheduler.feed_url(), "Scheduler stopped");
    }
    println!("Goodbye!");
    Ok(())
}
