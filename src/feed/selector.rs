//! Chooses the parser variant for a feed URL.
//!
//! Variants differ only in configuration (date pattern, optional item tag),
//! so the selector is a table keyed by the host's last two labels rather than
//! a family of parser types.
use std::collections::HashMap;

use url::Url;

use super::date_format::{DateFormat, DateFormatError};

/// RFC 822 style `pubDate` with a numeric zone, used for every unlisted domain.
pub const BASE_DATE_FORMAT: &str = "EEE, dd MMM yyyy HH:mm:ss ZZZ";

/// Apple's feeds spell the zone by name (`PDT`) instead of as an offset.
pub const APPLE_DATE_FORMAT: &str = "EEE, dd MMM yyyy HH:mm:ss zzz";

const APPLE_DOMAIN: &str = "apple.com";

/// Configuration for one parser flavor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserVariant {
    /// Human-readable name, used in logs.
    pub name: String,
    pub date_format: DateFormat,
    /// Replaces the default `item`/`entry` item tags when set.
    pub item_tag: Option<String>,
}

impl ParserVariant {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self, DateFormatError> {
        Ok(Self {
            name: name.into(),
            date_format: DateFormat::new(pattern)?,
            item_tag: None,
        })
    }
}

/// Domain → variant table with a base fallback.
#[derive(Debug, Clone)]
pub struct ParserSelector {
    base: ParserVariant,
    overrides: HashMap<String, ParserVariant>,
}

impl Default for ParserSelector {
    fn default() -> Self {
        let base = ParserVariant {
            name: "base".to_string(),
            date_format: DateFormat::new(BASE_DATE_FORMAT)
                .unwrap_or_else(|e| unreachable!("built-in pattern is valid: {e}")),
            item_tag: None,
        };
        let apple = ParserVariant {
            name: APPLE_DOMAIN.to_string(),
            date_format: DateFormat::new(APPLE_DATE_FORMAT)
                .unwrap_or_else(|e| unreachable!("built-in pattern is valid: {e}")),
            item_tag: None,
        };

        let mut overrides = HashMap::new();
        overrides.insert(APPLE_DOMAIN.to_string(), apple);

        Self { base, overrides }
    }
}

impl ParserSelector {
    /// Builds the default table and layers `overrides` (domain → LDML pattern)
    /// on top. Configured entries replace built-ins for the same domain.
    pub fn with_overrides<'a, I>(overrides: I) -> Result<Self, DateFormatError>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut selector = Self::default();
        for (domain, pattern) in overrides {
            let domain = domain.trim().to_ascii_lowercase();
            let variant = ParserVariant::new(domain.clone(), pattern)?;
            selector.overrides.insert(domain, variant);
        }
        Ok(selector)
    }

    /// The variant used when no override matches.
    pub fn base(&self) -> &ParserVariant {
        &self.base
    }

    /// Selects the variant for `url`.
    ///
    /// The host's last two labels approximate the registrable domain, so
    /// `images.apple.com` matches an `apple.com` entry. Hosts with fewer than
    /// two labels always get the base variant.
    pub fn select(&self, url: &Url) -> &ParserVariant {
        let Some(host) = url.host_str() else {
            return &self.base;
        };
        let host = host.to_ascii_lowercase();
        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() < 2 {
            return &self.base;
        }
        let domain = labels[labels.len() - 2..].join(".");
        self.overrides.get(&domain).unwrap_or(&self.base)
    }
}
