use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::store::{Store, StoreTransaction};
use super::types::{Feed, Item, StoreError};
use crate::feed::RawItem;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    feeds: BTreeMap<i64, Feed>,
    items: BTreeMap<i64, Item>,
    next_feed_id: i64,
    next_item_id: i64,
}

impl MemoryState {
    fn feed_by_url(&self, url: &str) -> Option<&Feed> {
        self.feeds.values().find(|f| f.source_url == url)
    }

    fn item_mut(&mut self, item_id: i64) -> Result<&mut Item, StoreError> {
        self.items.get_mut(&item_id).ok_or(StoreError::NotFound {
            entity: "item",
            id: item_id,
        })
    }
}

/// In-process [`Store`] for tests and ephemeral sessions.
///
/// Transactions serialize on a single lock and work on a staged copy of the
/// state, which replaces the live state only on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(MemoryTransaction { guard, staged })
    }

    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let state = self.state.lock().await;
        let mut feeds: Vec<Feed> = state.feeds.values().cloned().collect();
        feeds.sort_by(|a, b| {
            let a_title = a.title.as_deref().unwrap_or_default().to_lowercase();
            let b_title = b.title.as_deref().unwrap_or_default().to_lowercase();
            a_title
                .cmp(&b_title)
                .then_with(|| a.source_url.cmp(&b.source_url))
        });
        Ok(feeds)
    }

    async fn find_feed_by_url(&self, url: &str) -> Result<Option<Feed>, StoreError> {
        Ok(self.state.lock().await.feed_by_url(url).cloned())
    }

    async fn delete_feed(&self, feed_id: i64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.feeds.remove(&feed_id).is_none() {
            return Ok(false);
        }
        state.items.retain(|_, item| item.feed_id != feed_id);
        Ok(true)
    }

    async fn visible_items(&self, feed_id: i64) -> Result<Vec<Item>, StoreError> {
        let state = self.state.lock().await;
        let mut items: Vec<Item> = state
            .items
            .values()
            .filter(|item| item.feed_id == feed_id && !item.deletion_mark)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.published.cmp(&a.published).then(b.id.cmp(&a.id)));
        Ok(items)
    }

    async fn item(&self, item_id: i64) -> Result<Option<Item>, StoreError> {
        Ok(self.state.lock().await.items.get(&item_id).cloned())
    }

    async fn count_unread(&self, feed_id: i64) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        let count = state
            .items
            .values()
            .filter(|item| item.feed_id == feed_id && !item.read && !item.deletion_mark)
            .count();
        Ok(count as i64)
    }

    async fn set_read(&self, item_id: i64, read: bool) -> Result<(), StoreError> {
        self.state.lock().await.item_mut(item_id)?.read = read;
        Ok(())
    }

    async fn set_deletion_mark(&self, item_id: i64, marked: bool) -> Result<(), StoreError> {
        self.state.lock().await.item_mut(item_id)?.deletion_mark = marked;
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn find_feed_by_url(&mut self, url: &str) -> Result<Option<Feed>, StoreError> {
        Ok(self.staged.feed_by_url(url).cloned())
    }

    async fn create_feed(&mut self, url: &str, title: Option<&str>) -> Result<Feed, StoreError> {
        if self.staged.feed_by_url(url).is_some() {
            return Err(StoreError::Conflict(format!(
                "feed with url {url} already exists"
            )));
        }
        self.staged.next_feed_id += 1;
        let feed = Feed {
            id: self.staged.next_feed_id,
            title: title.map(str::to_string),
            source_url: url.to_string(),
            last_fetched: None,
        };
        self.staged.feeds.insert(feed.id, feed.clone());
        Ok(feed)
    }

    async fn update_feed(&mut self, feed: &Feed) -> Result<(), StoreError> {
        if let Some(other) = self.staged.feed_by_url(&feed.source_url) {
            if other.id != feed.id {
                return Err(StoreError::Conflict(format!(
                    "feed with url {} already exists",
                    feed.source_url
                )));
            }
        }
        let stored = self
            .staged
            .feeds
            .get_mut(&feed.id)
            .ok_or(StoreError::NotFound {
                entity: "feed",
                id: feed.id,
            })?;
        stored.title = feed.title.clone();
        stored.source_url = feed.source_url.clone();
        stored.last_fetched = feed.last_fetched;
        Ok(())
    }

    async fn items_for_feed(&mut self, feed_id: i64) -> Result<Vec<Item>, StoreError> {
        Ok(self
            .staged
            .items
            .values()
            .filter(|item| item.feed_id == feed_id)
            .cloned()
            .collect())
    }

    async fn find_item_by_guid(
        &mut self,
        feed_id: i64,
        guid: &str,
    ) -> Result<Option<Item>, StoreError> {
        Ok(self
            .staged
            .items
            .values()
            .find(|item| item.feed_id == feed_id && item.guid == guid)
            .cloned())
    }

    async fn create_item(&mut self, feed_id: i64, item: &RawItem) -> Result<Item, StoreError> {
        if !self.staged.feeds.contains_key(&feed_id) {
            return Err(StoreError::NotFound {
                entity: "feed",
                id: feed_id,
            });
        }
        if self
            .staged
            .items
            .values()
            .any(|stored| stored.feed_id == feed_id && stored.guid == item.guid)
        {
            return Err(StoreError::Conflict(format!(
                "item with guid {} already exists in feed {feed_id}",
                item.guid
            )));
        }
        self.staged.next_item_id += 1;
        let created = Item {
            id: self.staged.next_item_id,
            feed_id,
            guid: item.guid.clone(),
            link: item.link.clone(),
            title: item.title.clone(),
            description: item.description.clone(),
            author: item.author.clone(),
            image_url: item.image_url.clone(),
            published: item.publish_date.timestamp(),
            read: false,
            deletion_mark: false,
        };
        self.staged.items.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_item_content(
        &mut self,
        item_id: i64,
        item: &RawItem,
    ) -> Result<(), StoreError> {
        let stored = self.staged.item_mut(item_id)?;
        stored.link = item.link.clone();
        stored.title = item.title.clone();
        stored.description = item.description.clone();
        stored.author = item.author.clone();
        stored.image_url = item.image_url.clone();
        stored.published = item.publish_date.timestamp();
        Ok(())
    }

    async fn delete_items(&mut self, item_ids: &[i64]) -> Result<u64, StoreError> {
        let mut deleted = 0;
        for id in item_ids {
            if self.staged.items.remove(id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        *self.guard = self.staged;
        Ok(())
    }
}
