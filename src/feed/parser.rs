//! Single-pass RSS/Atom parser built on quick-xml's pull events.
//!
//! The scan keeps an explicit [`ParseState`]: the current element, whether we
//! are inside an item, the field map of the item being built and the finished
//! field maps. Nothing is materialized as a DOM. Field maps are converted to
//! [`RawItem`]s at the end using the variant's date format; conversion failures
//! drop the item, never the document.
use std::borrow::Cow;
use std::collections::HashMap;

use quick_xml::escape::resolve_html5_entity;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use url::Url;

use super::date_format::parse_rfc3339;
use super::model::{RawFeed, RawItem};
use super::selector::ParserVariant;

/// Tags that open an item when the variant does not override them.
const DEFAULT_ITEM_TAGS: [&str; 2] = ["item", "entry"];

/// Leaf tags captured inside an item.
const ITEM_FIELDS: [&str; 11] = [
    "title",
    "description",
    "summary",
    "content",
    "link",
    "guid",
    "id",
    "pubDate",
    "published",
    "updated",
    "author",
];

/// Synthetic field key for an image enclosure URL.
const IMAGE_URL_KEY: &str = "imageURL";

/// Longest reference name we try to resolve (HTML5 tops out at 31 characters).
const MAX_ENTITY_LEN: usize = 32;

/// SEC-003: Bound element nesting so hostile documents cannot grow the stack of open tags unboundedly.
const MAX_DEPTH: usize = 256;

/// Errors that make a whole document unusable.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The XML scanner rejected the document.
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// Result of a successful parse.
#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub feed: RawFeed,
    /// Item blocks dropped because they lacked a guid/link or a parseable date.
    pub skipped: usize,
}

type FieldMap = HashMap<String, String>;

/// Mutable scan state carried across events.
#[derive(Debug, Default)]
struct ParseState {
    current_element: String,
    in_item: bool,
    text: String,
    item: FieldMap,
    items: Vec<FieldMap>,
    feed_title: Option<String>,
    feed_description: Option<String>,
    depth: usize,
    saw_root: bool,
}

impl ParseState {
    fn start(&mut self, name: &str, item_tags: &[&str]) {
        self.current_element.clear();
        self.current_element.push_str(name);
        self.text.clear();

        if item_tags.contains(&name) {
            self.in_item = true;
            self.item.clear();
        }
    }

    fn capturing(&self) -> bool {
        if self.in_item {
            ITEM_FIELDS.contains(&self.current_element.as_str())
        } else {
            matches!(self.current_element.as_str(), "title" | "description")
        }
    }

    fn text(&mut self, chunk: &str) {
        if self.capturing() {
            self.text.push_str(chunk);
        }
    }

    fn end(&mut self, name: &str, item_tags: &[&str]) {
        if item_tags.contains(&name) {
            if self.in_item {
                self.items.push(std::mem::take(&mut self.item));
            }
            self.in_item = false;
            self.text.clear();
            self.current_element.clear();
            return;
        }

        // Whitespace-only text counts as absent
        let captured = self.text.trim();
        if !captured.is_empty() && name == self.current_element {
            if self.in_item {
                if ITEM_FIELDS.contains(&name) {
                    self.item
                        .entry(name.to_string())
                        .or_insert_with(|| captured.to_string());
                }
            } else {
                match name {
                    "title" if self.feed_title.is_none() => {
                        self.feed_title = Some(captured.to_string())
                    }
                    "description" if self.feed_description.is_none() => {
                        self.feed_description = Some(captured.to_string())
                    }
                    _ => {}
                }
            }
        }
        self.text.clear();
        self.current_element.clear();
    }

    /// Handles attribute-carrying tags inside items (`enclosure`, Atom `link`).
    fn attributes(&mut self, name: &str, e: &BytesStart<'_>, reader: &Reader<&[u8]>) {
        if !self.in_item {
            return;
        }
        match name {
            "enclosure" => {
                let kind = attribute(e, reader, b"type");
                let url = attribute(e, reader, b"url");
                if let (Some(kind), Some(url)) = (kind, url) {
                    if kind.starts_with("image/") && !self.item.contains_key(IMAGE_URL_KEY) {
                        self.item.insert(IMAGE_URL_KEY.to_string(), url);
                    }
                }
            }
            "link" => {
                let rel = attribute(e, reader, b"rel");
                if matches!(rel.as_deref(), None | Some("alternate")) {
                    if let Some(href) = attribute(e, reader, b"href") {
                        if !href.trim().is_empty() {
                            self.item
                                .entry("link".to_string())
                                .or_insert_with(|| href.trim().to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

fn attribute(e: &BytesStart<'_>, reader: &Reader<&[u8]>, key: &[u8]) -> Option<String> {
    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(err) => {
                tracing::debug!(error = %err, "Skipping malformed attribute");
                continue;
            }
        };
        if attr.key.as_ref() == key {
            return reader
                .decoder()
                .decode(&attr.value)
                .ok()
                .map(|v| unescape_lenient(&v).into_owned());
        }
    }
    None
}

/// Resolves character references and HTML5 named entities one at a time.
///
/// Feeds routinely use HTML entities such as `&nbsp;` that XML does not
/// define. An unknown or unterminated reference is kept verbatim and the rest
/// of the text is still unescaped.
fn unescape_lenient(text: &str) -> Cow<'_, str> {
    if !text.contains('&') {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp + 1..];
        let end = tail
            .bytes()
            .take(MAX_ENTITY_LEN + 1)
            .position(|b| b == b';')
            .filter(|&end| end > 0);
        match end {
            Some(end) if resolve_reference(&tail[..end], &mut out) => rest = &tail[end + 1..],
            _ => {
                out.push('&');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

fn resolve_reference(name: &str, out: &mut String) -> bool {
    let resolved = match name.strip_prefix('#') {
        Some(number) => {
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => number.parse::<u32>().ok(),
            };
            code.and_then(char::from_u32).map(|c| out.push(c))
        }
        None => resolve_html5_entity(name).map(|value| out.push_str(value)),
    };
    resolved.is_some()
}

/// Parses `bytes` fetched from `source_url` using `variant`'s configuration.
///
/// A well-formed document without valid items yields an empty item list.
/// Malformed XML, a document with no root element or one that ends with
/// unclosed elements yields [`ParseError::Malformed`].
pub fn parse_feed(
    bytes: &[u8],
    source_url: &Url,
    variant: &ParserVariant,
) -> Result<ParseOutcome, ParseError> {
    // SEC-002: quick-xml never expands <!ENTITY> declarations; only the XML builtins are unescaped.
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut state = ParseState::default();

    let item_tags: Vec<&str> = match variant.item_tag.as_deref() {
        Some(tag) => vec![tag],
        None => DEFAULT_ITEM_TAGS.to_vec(),
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                state.depth += 1;
                state.saw_root = true;
                if state.depth > MAX_DEPTH {
                    return Err(ParseError::Malformed(format!(
                        "nesting deeper than {} levels",
                        MAX_DEPTH
                    )));
                }
                let name = decode_name(&reader, e.name().as_ref())?;
                state.start(&name, &item_tags);
                state.attributes(&name, &e, &reader);
            }
            Ok(Event::Empty(e)) => {
                state.saw_root = true;
                let name = decode_name(&reader, e.name().as_ref())?;
                state.attributes(&name, &e, &reader);
            }
            Ok(Event::Text(t)) => {
                let decoded = reader
                    .decoder()
                    .decode(&t)
                    .map_err(|e| ParseError::Malformed(e.to_string()))?;
                state.text(&unescape_lenient(&decoded));
            }
            Ok(Event::CData(c)) => {
                let decoded = reader
                    .decoder()
                    .decode(&c)
                    .map_err(|e| ParseError::Malformed(e.to_string()))?;
                state.text(&decoded);
            }
            Ok(Event::End(e)) => {
                state.depth = state.depth.saturating_sub(1);
                let name = decode_name(&reader, e.name().as_ref())?;
                state.end(&name, &item_tags);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Malformed(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !state.saw_root {
        return Err(ParseError::Malformed("document has no root element".into()));
    }
    if state.depth > 0 {
        return Err(ParseError::Malformed(format!(
            "document ended with {} unclosed element(s)",
            state.depth
        )));
    }

    let total = state.items.len();
    let items: Vec<RawItem> = state
        .items
        .into_iter()
        .filter_map(|fields| raw_item_from_fields(fields, variant))
        .collect();
    let skipped = total - items.len();

    Ok(ParseOutcome {
        feed: RawFeed {
            title: state.feed_title,
            description: state.feed_description,
            source_url: source_url.clone(),
            items,
        },
        skipped,
    })
}

fn decode_name(reader: &Reader<&[u8]>, raw: &[u8]) -> Result<String, ParseError> {
    reader
        .decoder()
        .decode(raw)
        .map(|name| name.into_owned())
        .map_err(|e| ParseError::Malformed(e.to_string()))
}

/// Converts one accumulated field map, or `None` when the item is unusable.
fn raw_item_from_fields(mut fields: FieldMap, variant: &ParserVariant) -> Option<RawItem> {
    let link = fields.remove("link")?;
    let guid = fields
        .remove("guid")
        .or_else(|| fields.remove("id"))
        .unwrap_or_else(|| link.clone());

    let publish_date = match fields.get("pubDate") {
        Some(raw) => variant.date_format.parse(raw),
        None => fields
            .get("published")
            .or_else(|| fields.get("updated"))
            .and_then(|raw| parse_rfc3339(raw)),
    };
    let Some(publish_date) = publish_date else {
        tracing::debug!(guid = %guid, variant = %variant.name, "Dropping item with unparseable publish date");
        return None;
    };

    Some(RawItem {
        guid,
        link,
        title: fields.remove("title"),
        description: fields
            .remove("description")
            .or_else(|| fields.remove("summary"))
            .or_else(|| fields.remove("content")),
        author: fields.remove("author"),
        image_url: fields.remove(IMAGE_URL_KEY),
        publish_date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::selector::ParserSelector;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn source() -> Url {
        Url::parse("https://example.com/feed.xml").unwrap()
    }

    fn base() -> ParserVariant {
        ParserSelector::default().base().clone()
    }

    fn apple() -> ParserVariant {
        let url = Url::parse("https://images.apple.com/main/rss/hotnews/hotnews.rss").unwrap();
        ParserSelector::default().select(&url).clone()
    }

    fn parse(xml: &str) -> Result<ParseOutcome, ParseError> {
        parse_feed(xml.as_bytes(), &source(), &base())
    }

    fn rss_item(guid: &str, date: &str) -> String {
        format!(
            "<item><title>Item {guid}</title><link>https://example.com/{guid}</link>\
             <guid>{guid}</guid><pubDate>{date}</pubDate></item>"
        )
    }

    fn rss(items: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel>
  <title>Example Feed</title>
  <description>All the news</description>
  <link>https://example.com</link>
  {items}
</channel></rss>"#
        )
    }

    const DATE: &str = "Tue, 10 Nov 2015 18:10:09 +0000";

    #[test]
    fn test_parses_feed_metadata_and_items() {
        let xml = rss(&format!("{}{}", rss_item("a", DATE), rss_item("b", DATE)));
        let outcome = parse(&xml).unwrap();

        assert_eq!(outcome.feed.title.as_deref(), Some("Example Feed"));
        assert_eq!(outcome.feed.description.as_deref(), Some("All the news"));
        assert_eq!(outcome.feed.source_url, source());
        assert_eq!(outcome.skipped, 0);

        let guids: Vec<_> = outcome.feed.items.iter().map(|i| i.guid.as_str()).collect();
        assert_eq!(guids, vec!["a", "b"]);

        let first = &outcome.feed.items[0];
        assert_eq!(first.title.as_deref(), Some("Item a"));
        assert_eq!(first.link, "https://example.com/a");
        assert_eq!(
            first.publish_date,
            Utc.with_ymd_and_hms(2015, 11, 10, 18, 10, 9).unwrap()
        );
    }

    #[test]
    fn test_item_title_does_not_override_feed_title() {
        let xml = rss(&rss_item("a", DATE));
        let outcome = parse(&xml).unwrap();
        assert_eq!(outcome.feed.title.as_deref(), Some("Example Feed"));
    }

    #[test]
    fn test_guid_falls_back_to_link() {
        let xml = rss(&format!(
            "<item><link>https://example.com/x</link><pubDate>{DATE}</pubDate></item>"
        ));
        let outcome = parse(&xml).unwrap();
        assert_eq!(outcome.feed.items[0].guid, "https://example.com/x");
    }

    #[test]
    fn test_item_without_link_is_dropped() {
        let xml = rss(&format!(
            "<item><guid>only-guid</guid><pubDate>{DATE}</pubDate></item>{}",
            rss_item("kept", DATE)
        ));
        let outcome = parse(&xml).unwrap();
        assert_eq!(outcome.feed.items.len(), 1);
        assert_eq!(outcome.feed.items[0].guid, "kept");
        assert_eq!(outcome.skipped, 1);
    }

    #[test]
    fn test_item_with_bad_date_is_dropped() {
        let xml = rss(&format!(
            "{}{}",
            rss_item("bad", "not a date"),
            rss_item("good", DATE)
        ));
        let outcome = parse(&xml).unwrap();
        assert_eq!(outcome.feed.items.len(), 1);
        assert_eq!(outcome.feed.items[0].guid, "good");
        assert_eq!(outcome.skipped, 1);
    }

    #[test]
    fn test_item_without_date_is_dropped() {
        let xml = rss("<item><link>https://example.com/x</link></item>");
        let outcome = parse(&xml).unwrap();
        assert!(outcome.feed.items.is_empty());
        assert_eq!(outcome.skipped, 1);
    }

    #[test]
    fn test_whitespace_only_text_is_absent() {
        let xml = rss(&format!(
            "<item><title>   \n  </title><link>https://example.com/x</link><pubDate>{DATE}</pubDate></item>"
        ));
        let outcome = parse(&xml).unwrap();
        assert_eq!(outcome.feed.items[0].title, None);
    }

    #[test]
    fn test_text_is_trimmed_and_unescaped() {
        let xml = rss(&format!(
            "<item><title>\n  Fish &amp; Chips  \n</title><link>https://example.com/x</link><pubDate>{DATE}</pubDate></item>"
        ));
        let outcome = parse(&xml).unwrap();
        assert_eq!(outcome.feed.items[0].title.as_deref(), Some("Fish & Chips"));
    }

    #[test]
    fn test_html_entity_does_not_block_xml_entities() {
        let xml = rss(&format!(
            "<item><title>AT&amp;T&nbsp;news</title><link>https://example.com/x</link><pubDate>{DATE}</pubDate></item>"
        ));
        let outcome = parse(&xml).unwrap();
        assert_eq!(outcome.feed.items[0].title.as_deref(), Some("AT&T\u{a0}news"));
    }

    #[test]
    fn test_unknown_entity_kept_verbatim() {
        let xml = rss(&format!(
            "<item><title>&bogus; &lt;b&gt; &#233;t&#xE9; &amp</title><link>https://example.com/x</link><pubDate>{DATE}</pubDate></item>"
        ));
        let outcome = parse(&xml).unwrap();
        assert_eq!(
            outcome.feed.items[0].title.as_deref(),
            Some("&bogus; <b> été &amp")
        );
    }

    #[test]
    fn test_attribute_entities_resolved() {
        let xml = rss(&format!(
            "<item><link>https://example.com/x</link><pubDate>{DATE}</pubDate>\
             <enclosure url=\"https://example.com/a.jpg?w=1&amp;h=2&amp;c=&copy;\" type=\"image/jpeg\"/></item>"
        ));
        let outcome = parse(&xml).unwrap();
        assert_eq!(
            outcome.feed.items[0].image_url.as_deref(),
            Some("https://example.com/a.jpg?w=1&h=2&c=\u{a9}")
        );
    }

    #[test]
    fn test_cdata_description() {
        let xml = rss(&format!(
            "<item><description><![CDATA[<p>Hello</p>]]></description><link>https://example.com/x</link><pubDate>{DATE}</pubDate></item>"
        ));
        let outcome = parse(&xml).unwrap();
        assert_eq!(
            outcome.feed.items[0].description.as_deref(),
            Some("<p>Hello</p>")
        );
    }

    #[test]
    fn test_image_enclosure_captured() {
        let xml = rss(&format!(
            r#"<item><link>https://example.com/x</link><pubDate>{DATE}</pubDate>
               <enclosure url="https://example.com/a.mp3" type="audio/mpeg" length="1"/>
               <enclosure url="https://example.com/a.jpg" type="image/jpeg" length="1"/></item>"#
        ));
        let outcome = parse(&xml).unwrap();
        assert_eq!(
            outcome.feed.items[0].image_url.as_deref(),
            Some("https://example.com/a.jpg")
        );
    }

    #[test]
    fn test_duplicate_guids_are_both_reported() {
        let xml = rss(&format!("{}{}", rss_item("A", DATE), rss_item("A", DATE)));
        let outcome = parse(&xml).unwrap();
        assert_eq!(outcome.feed.items.len(), 2);
    }

    #[test]
    fn test_empty_channel_is_not_an_error() {
        let outcome = parse(&rss("")).unwrap();
        assert!(outcome.feed.items.is_empty());
        assert_eq!(outcome.skipped, 0);
    }

    #[test]
    fn test_malformed_xml() {
        assert!(matches!(parse("<not valid xml"), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_mismatched_end_tag_is_malformed() {
        assert!(matches!(
            parse("<rss><channel></rss>"),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_unclosed_document_is_malformed() {
        assert!(matches!(
            parse("<rss><channel><title>x</title>"),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_document_is_malformed() {
        assert!(matches!(parse(""), Err(ParseError::Malformed(_))));
        assert!(matches!(parse("just text"), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_atom_entries() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Feed</title>
  <link href="https://example.org/" rel="alternate"/>
  <entry>
    <title>First</title>
    <link rel="alternate" href="https://example.org/1"/>
    <link rel="edit" href="https://example.org/edit/1"/>
    <id>urn:uuid:1</id>
    <updated>2016-05-05T10:00:00Z</updated>
    <summary>Short</summary>
  </entry>
</feed>"#;
        let outcome = parse(xml).unwrap();
        assert_eq!(outcome.feed.title.as_deref(), Some("Atom Feed"));
        let item = &outcome.feed.items[0];
        assert_eq!(item.guid, "urn:uuid:1");
        assert_eq!(item.link, "https://example.org/1");
        assert_eq!(item.description.as_deref(), Some("Short"));
        assert_eq!(
            item.publish_date,
            Utc.with_ymd_and_hms(2016, 5, 5, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_named_zone_needs_override_variant() {
        let xml = rss(&rss_item("a", "Thu, 05 May 2016 10:00:00 PDT"));

        let with_base = parse_feed(xml.as_bytes(), &source(), &base()).unwrap();
        assert!(with_base.feed.items.is_empty());

        let with_apple = parse_feed(xml.as_bytes(), &source(), &apple()).unwrap();
        assert_eq!(with_apple.feed.items.len(), 1);
    }

    #[test]
    fn test_item_tag_override() {
        let mut variant = base();
        variant.item_tag = Some("story".to_string());
        let xml = format!(
            "<news><story><link>https://example.com/s</link><pubDate>{DATE}</pubDate></story>{}</news>",
            rss_item("ignored", DATE)
        );
        let outcome = parse_feed(xml.as_bytes(), &source(), &variant).unwrap();
        assert_eq!(outcome.feed.items.len(), 1);
        assert_eq!(outcome.feed.items[0].link, "https://example.com/s");
    }

    #[test]
    fn test_latin1_declaration_is_decoded() {
        let mut bytes =
            b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><rss><channel><title>Caf".to_vec();
        bytes.push(0xE9);
        bytes.extend_from_slice(b"</title></channel></rss>");
        let outcome = parse_feed(&bytes, &source(), &base()).unwrap();
        assert_eq!(outcome.feed.title.as_deref(), Some("Caf\u{e9}"));
    }

    proptest! {
        #[test]
        fn prop_valid_items_preserved_in_order(guids in proptest::collection::vec("[a-z0-9]{1,12}", 0..20)) {
            let body: String = guids.iter().map(|g| rss_item(g, DATE)).collect();
            let outcome = parse(&rss(&body)).unwrap();
            let parsed: Vec<String> = outcome.feed.items.into_iter().map(|i| i.guid).collect();
            prop_assert_eq!(parsed, guids);
        }
    }
}
