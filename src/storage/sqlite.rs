use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tokio::sync::OwnedMutexGuard;

use super::schema::Database;
use super::store::{Store, StoreTransaction};
use super::types::{Feed, Item, StoreError};
use crate::feed::RawItem;

const FEED_COLUMNS: &str = "id, title, url AS source_url, last_fetched";
const ITEM_COLUMNS: &str = "id, feed_id, guid, link, title, description, author, image_url, \
                            published, read, deletion_mark";

/// Keeps `IN (...)` lists well under SQLite's 999 parameter limit.
const DELETE_BATCH_SIZE: usize = 500;

/// An open SQLite transaction. Dropping it without `commit` rolls back.
pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
    _writer: OwnedMutexGuard<()>,
}

#[async_trait]
impl Store for Database {
    type Tx = SqliteTransaction;

    async fn begin(&self) -> Result<SqliteTransaction, StoreError> {
        let writer = self.write_lock.clone().lock_owned().await;
        Ok(SqliteTransaction {
            tx: self.pool.begin().await?,
            _writer: writer,
        })
    }

    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let feeds = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds ORDER BY title COLLATE NOCASE, url"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    async fn find_feed_by_url(&self, url: &str) -> Result<Option<Feed>, StoreError> {
        let feed =
            sqlx::query_as::<_, Feed>(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?"))
                .bind(url)
                .fetch_optional(&self.pool)
                .await?;
        Ok(feed)
    }

    async fn delete_feed(&self, feed_id: i64) -> Result<bool, StoreError> {
        // Items go with it via ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn visible_items(&self, feed_id: i64) -> Result<Vec<Item>, StoreError> {
        let items = sqlx::query_as::<_, Item>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE feed_id = ? AND deletion_mark = 0
             ORDER BY published DESC, id DESC"
        ))
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn item(&self, item_id: i64) -> Result<Option<Item>, StoreError> {
        let item =
            sqlx::query_as::<_, Item>(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"))
                .bind(item_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(item)
    }

    async fn count_unread(&self, feed_id: i64) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM items WHERE feed_id = ? AND read = 0 AND deletion_mark = 0",
        )
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn set_read(&self, item_id: i64, read: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE items SET read = ? WHERE id = ?")
            .bind(read)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "item",
                id: item_id,
            });
        }
        Ok(())
    }

    async fn set_deletion_mark(&self, item_id: i64, marked: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE items SET deletion_mark = ? WHERE id = ?")
            .bind(marked)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "item",
                id: item_id,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn find_feed_by_url(&mut self, url: &str) -> Result<Option<Feed>, StoreError> {
        let feed =
            sqlx::query_as::<_, Feed>(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?"))
                .bind(url)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(feed)
    }

    async fn create_feed(&mut self, url: &str, title: Option<&str>) -> Result<Feed, StoreError> {
        let feed = sqlx::query_as::<_, Feed>(&format!(
            "INSERT INTO feeds (title, url) VALUES (?, ?) RETURNING {FEED_COLUMNS}"
        ))
        .bind(title)
        .bind(url)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(feed)
    }

    async fn update_feed(&mut self, feed: &Feed) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE feeds SET title = ?, url = ?, last_fetched = ? WHERE id = ?")
                .bind(&feed.title)
                .bind(&feed.source_url)
                .bind(feed.last_fetched)
                .bind(feed.id)
                .execute(&mut *self.tx)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "feed",
                id: feed.id,
            });
        }
        Ok(())
    }

    async fn items_for_feed(&mut self, feed_id: i64) -> Result<Vec<Item>, StoreError> {
        let items = sqlx::query_as::<_, Item>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE feed_id = ?"
        ))
        .bind(feed_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(items)
    }

    async fn find_item_by_guid(
        &mut self,
        feed_id: i64,
        guid: &str,
    ) -> Result<Option<Item>, StoreError> {
        let item = sqlx::query_as::<_, Item>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE feed_id = ? AND guid = ?"
        ))
        .bind(feed_id)
        .bind(guid)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(item)
    }

    async fn create_item(&mut self, feed_id: i64, item: &RawItem) -> Result<Item, StoreError> {
        let created = sqlx::query_as::<_, Item>(&format!(
            "INSERT INTO items (feed_id, guid, link, title, description, author, image_url, published)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(feed_id)
        .bind(&item.guid)
        .bind(&item.link)
        .bind(&item.title)
        .bind(&item.description)
        .bind(&item.author)
        .bind(&item.image_url)
        .bind(item.publish_date.timestamp())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(created)
    }

    async fn update_item_content(
        &mut self,
        item_id: i64,
        item: &RawItem,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE items SET link = ?, title = ?, description = ?, author = ?, image_url = ?,
                              published = ?
             WHERE id = ?",
        )
        .bind(&item.link)
        .bind(&item.title)
        .bind(&item.description)
        .bind(&item.author)
        .bind(&item.image_url)
        .bind(item.publish_date.timestamp())
        .bind(item_id)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "item",
                id: item_id,
            });
        }
        Ok(())
    }

    async fn delete_items(&mut self, item_ids: &[i64]) -> Result<u64, StoreError> {
        let mut deleted = 0;
        for chunk in item_ids.chunks(DELETE_BATCH_SIZE) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM items WHERE id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            deleted += builder.build().execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(deleted)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn raw(guid: String) -> RawItem {
        RawItem {
            link: format!("https://example.com/{guid}"),
            guid,
            title: None,
            description: None,
            author: None,
            image_url: None,
            publish_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_delete_items_spans_batches() {
        let db = Database::open(":memory:").await.unwrap();
        let mut tx = db.begin().await.unwrap();
        let feed = tx.create_feed("https://example.com/feed", None).await.unwrap();
        let mut ids = Vec::new();
        for i in 0..(DELETE_BATCH_SIZE + 20) {
            ids.push(tx.create_item(feed.id, &raw(format!("g{i}"))).await.unwrap().id);
        }
        assert_eq!(tx.delete_items(&ids).await.unwrap(), ids.len() as u64);
        tx.commit().await.unwrap();

        assert!(db.visible_items(feed.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_guid_rejected_by_schema() {
        let db = Database::open(":memory:").await.unwrap();
        let mut tx = db.begin().await.unwrap();
        let feed = tx.create_feed("https://example.com/feed", None).await.unwrap();
        tx.create_item(feed.id, &raw("a".to_string())).await.unwrap();
        assert!(matches!(
            tx.create_item(feed.id, &raw("a".to_string())).await,
            Err(StoreError::Database(_))
        ));
    }

    #[tokio::test]
    async fn test_uncommitted_writes_discarded() {
        let db = Database::open(":memory:").await.unwrap();
        {
            let mut tx = db.begin().await.unwrap();
            tx.create_feed("https://example.com/feed", Some("Feed"))
                .await
                .unwrap();
        }
        assert!(db.list_feeds().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_read_unknown_item() {
        let db = Database::open(":memory:").await.unwrap();
        assert!(matches!(
            db.set_read(7, true).await,
            Err(StoreError::NotFound { entity: "item", id: 7 })
        ));
    }
}
