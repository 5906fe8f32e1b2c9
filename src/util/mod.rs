//! Small helpers shared by the CLI and the library.

mod url;

pub use self::url::{parse_feed_url, UrlError};
