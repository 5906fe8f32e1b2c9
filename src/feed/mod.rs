//! Feed acquisition: fetching RSS/Atom documents and parsing them into
//! storage-independent [`RawFeed`] values.
//!
//! # Architecture
//!
//! - [`model`] - `RawFeed` / `RawItem` value types
//! - [`date_format`] - LDML publish-date patterns compiled for chrono
//! - [`parser`] - Single-pass event-driven parser built on `quick-xml`
//! - [`selector`] - Per-domain parser variant table
//! - [`fetcher`] - HTTP retrieval with timeout and size limits
//! - [`completion`] - Execution contexts for callback delivery
//!
//! # Example
//!
//! ```ignore
//! use rssreader::feed::{FetchClient, FetchConfig, ParserSelector};
//!
//! let fetcher = FetchClient::new(FetchConfig::default(), ParserSelector::default())?;
//! let feed = fetcher.fetch(&url).await?;
//! ```

pub mod completion;
pub mod date_format;
pub mod fetcher;
pub mod model;
pub mod parser;
pub mod selector;

pub use completion::{CompletionContext, CompletionQueue};
pub use date_format::{DateFormat, DateFormatError};
pub use fetcher::{FetchClient, FetchConfig, FetchError, NetworkError};
pub use model::{RawFeed, RawItem};
pub use parser::{parse_feed, ParseError, ParseOutcome};
pub use selector::{ParserSelector, ParserVariant, APPLE_DATE_FORMAT, BASE_DATE_FORMAT};
