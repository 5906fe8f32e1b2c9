use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while opening or migrating the SQLite database.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the application has locked the database
    #[error("Another instance of rssreader appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_error(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

// SQLITE_BUSY (5): database is locked
// SQLITE_LOCKED (6): database table is locked
// SQLITE_CANTOPEN (14): unable to open database file
pub(crate) fn is_lock_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

/// Errors surfaced by [`Store`](super::Store) operations.
///
/// Any error inside a transaction aborts it; nothing from that transaction
/// becomes visible.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// A write would break a uniqueness rule (feed url, item guid per feed)
    #[error("Constraint violated: {0}")]
    Conflict(String),

    /// The backend refused the operation (closed, read-only, etc.)
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// Data Structures
// ============================================================================

/// A subscribed feed. Identity is the exact `source_url` string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub title: Option<String>,
    pub source_url: String,
    /// Unix timestamp of the last successful reconciliation
    pub last_fetched: Option<i64>,
}

/// A stored feed item.
///
/// `read` and `deletion_mark` belong to the consumer; reconciliation never
/// resets them. A deletion-marked item is hidden from consumer queries and
/// purged once upstream stops listing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Item {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub link: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<String>,
    /// Unix timestamp
    pub published: i64,
    pub read: bool,
    pub deletion_mark: bool,
}
