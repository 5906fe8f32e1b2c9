use chrono::{DateTime, Utc};
use url::Url;

/// One item extracted from a feed document, independent of storage.
///
/// An item without a guid falls back to its link, so `guid` is never empty.
/// Items whose publish date cannot be parsed never become a `RawItem`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawItem {
    pub guid: String,
    pub link: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    /// URL of the first `image/*` enclosure, if any.
    pub image_url: Option<String>,
    pub publish_date: DateTime<Utc>,
}

/// A parsed feed document. Items are kept in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFeed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub source_url: Url,
    pub items: Vec<RawItem>,
}

impl RawFeed {
    /// Creates a feed with no metadata and no items.
    pub fn empty(source_url: Url) -> Self {
        Self {
            title: None,
            description: None,
            source_url,
            items: Vec::new(),
        }
    }
}
