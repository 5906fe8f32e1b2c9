//! The persistence contract the sync layer depends on.
//!
//! Reconciliation only needs a handful of primitives (find, create, update,
//! delete, commit) on the Feed/Item aggregate, so any engine that can offer
//! them transactionally can back the reader. Both [`Database`](super::Database)
//! and [`MemoryStore`](super::MemoryStore) implement it.
use async_trait::async_trait;

use super::types::{Feed, Item, StoreError};
use crate::feed::RawItem;

/// Consumer-facing operations plus the entry point for transactions.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: StoreTransaction;

    /// Opens a transaction. Writes inside it are invisible to other callers
    /// until [`StoreTransaction::commit`]; dropping it rolls back.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// All feeds, ordered by title then URL.
    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError>;

    async fn find_feed_by_url(&self, url: &str) -> Result<Option<Feed>, StoreError>;

    /// Deletes a feed and its items. Returns whether the feed existed.
    async fn delete_feed(&self, feed_id: i64) -> Result<bool, StoreError>;

    /// Items not marked for deletion, newest first.
    async fn visible_items(&self, feed_id: i64) -> Result<Vec<Item>, StoreError>;

    async fn item(&self, item_id: i64) -> Result<Option<Item>, StoreError>;

    /// Unread, visible items of a feed.
    async fn count_unread(&self, feed_id: i64) -> Result<i64, StoreError>;

    async fn set_read(&self, item_id: i64, read: bool) -> Result<(), StoreError>;

    async fn set_deletion_mark(&self, item_id: i64, marked: bool) -> Result<(), StoreError>;
}

/// Read-your-writes view of the store used by a single reconciliation.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn find_feed_by_url(&mut self, url: &str) -> Result<Option<Feed>, StoreError>;

    async fn create_feed(&mut self, url: &str, title: Option<&str>) -> Result<Feed, StoreError>;

    /// Writes `title`, `source_url` and `last_fetched` of an existing feed.
    async fn update_feed(&mut self, feed: &Feed) -> Result<(), StoreError>;

    /// Every item of the feed, deletion-marked ones included.
    async fn items_for_feed(&mut self, feed_id: i64) -> Result<Vec<Item>, StoreError>;

    async fn find_item_by_guid(
        &mut self,
        feed_id: i64,
        guid: &str,
    ) -> Result<Option<Item>, StoreError>;

    /// Inserts an unread, unmarked item.
    async fn create_item(&mut self, feed_id: i64, item: &RawItem) -> Result<Item, StoreError>;

    /// Refreshes upstream-owned fields; `read`, `deletion_mark` and `guid`
    /// are left alone.
    async fn update_item_content(&mut self, item_id: i64, item: &RawItem)
        -> Result<(), StoreError>;

    /// Deletes items by id, returning how many were removed.
    async fn delete_items(&mut self, item_ids: &[i64]) -> Result<u64, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}
