use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use crate::feed::{FetchClient, FetchError, RawFeed};
use crate::storage::{Feed, Store, StoreError, StoreTransaction};

/// Default number of feeds refreshed at once by [`refresh_all`].
pub const DEFAULT_REFRESH_CONCURRENCY: usize = 10;

/// What a single reconciliation changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// The feed as stored after the commit.
    pub feed: Feed,
    pub created: usize,
    pub updated: usize,
    pub purged: u64,
}

/// Why a refresh cycle produced no change. None of these are fatal; the next
/// cycle retries.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// The reconciliation was rolled back.
    #[error("Persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Outcome for one feed of [`refresh_all`].
#[derive(Debug)]
pub struct RefreshResult {
    pub feed_url: String,
    pub result: Result<ReconcileReport, RefreshError>,
}

/// Merges a parsed snapshot into the stored feed identified by `feed_url`.
///
/// Runs in one transaction:
///
/// 1. Finds the feed by exact URL, creating it if unknown
/// 2. Copies the feed title and source URL, stamps `last_fetched`
/// 3. Creates items with unseen guids; refreshes title, description, link,
///    publish date and image of matched ones (never `read` or `deletion_mark`)
/// 4. Purges deletion-marked items the snapshot no longer lists
///
/// # Errors
///
/// Any store failure drops the transaction, so nothing from this call is
/// visible afterwards.
pub async fn reconcile<S: Store>(
    store: &S,
    feed_url: &str,
    raw: &RawFeed,
) -> Result<ReconcileReport, StoreError> {
    let mut tx = store.begin().await?;

    let mut feed = match tx.find_feed_by_url(feed_url).await? {
        Some(feed) => feed,
        None => tx.create_feed(feed_url, raw.title.as_deref()).await?,
    };
    feed.title = raw.title.clone();
    feed.source_url = raw.source_url.to_string();
    feed.last_fetched = Some(chrono::Utc::now().timestamp());
    tx.update_feed(&feed).await?;

    let existing = tx.items_for_feed(feed.id).await?;
    let mut by_guid: HashMap<String, i64> = existing
        .iter()
        .map(|item| (item.guid.clone(), item.id))
        .collect();

    let mut touched = HashSet::with_capacity(raw.items.len());
    let mut created = 0;
    let mut updated = 0;
    for raw_item in &raw.items {
        match by_guid.get(&raw_item.guid) {
            Some(&id) => {
                tx.update_item_content(id, raw_item).await?;
                touched.insert(id);
                updated += 1;
            }
            None => {
                let item = tx.create_item(feed.id, raw_item).await?;
                by_guid.insert(item.guid.clone(), item.id);
                touched.insert(item.id);
                created += 1;
            }
        }
    }

    let doomed: Vec<i64> = existing
        .iter()
        .filter(|item| item.deletion_mark && !touched.contains(&item.id))
        .map(|item| item.id)
        .collect();
    let purged = if doomed.is_empty() {
        0
    } else {
        tx.delete_items(&doomed).await?
    };

    tx.commit().await?;

    tracing::debug!(
        feed = %feed_url,
        created = created,
        updated = updated,
        purged = purged,
        "Feed reconciled"
    );

    Ok(ReconcileReport {
        feed,
        created,
        updated,
        purged,
    })
}

/// Fetches `url` and reconciles the result under the same URL.
pub async fn refresh_feed<S: Store>(
    fetcher: &FetchClient,
    store: &S,
    url: &Url,
) -> Result<ReconcileReport, RefreshError> {
    let raw = fetcher.fetch(url).await?;
    Ok(reconcile(store, url.as_str(), &raw).await?)
}

/// Subscribes to a feed that may not be stored yet.
///
/// Returns `None` when the fetch, the parse or the commit failed; in that case
/// no feed and no items were written.
pub async fn add_feed_by_url<S: Store>(fetcher: &FetchClient, store: &S, url: &Url) -> Option<Feed> {
    match refresh_feed(fetcher, store, url).await {
        Ok(report) => {
            tracing::info!(
                feed = %url,
                items = report.created,
                "Feed added"
            );
            Some(report.feed)
        }
        Err(e) => {
            tracing::warn!(feed = %url, error = %e, "Failed to add feed");
            None
        }
    }
}

/// Refreshes every stored feed with at most `concurrency` in flight.
///
/// Results arrive in completion order, not input order. A failing feed
/// never affects the others.
///
/// # Errors
///
/// Fails only if the feed list itself cannot be read.
pub async fn refresh_all<S: Store>(
    fetcher: &FetchClient,
    store: Arc<S>,
    concurrency: usize,
) -> Result<Vec<RefreshResult>, StoreError> {
    let feeds = store.list_feeds().await?;
    if feeds.is_empty() {
        return Ok(Vec::new());
    }

    let results: Vec<RefreshResult> = stream::iter(feeds)
        .map(|feed| {
            let fetcher = fetcher.clone();
            let store = store.clone();
            async move {
                let result = match Url::parse(&feed.source_url) {
                    Ok(url) => refresh_feed(&fetcher, store.as_ref(), &url).await,
                    Err(e) => Err(RefreshError::InvalidUrl(e)),
                };
                if let Err(e) = &result {
                    tracing::warn!(feed = %feed.source_url, error = %e, "Feed refresh failed");
                }
                RefreshResult {
                    feed_url: feed.source_url,
                    result,
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    Ok(results)
}
