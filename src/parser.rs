//! RSS 2.0 / Atom normalization.
//!
//! Turns raw feed bytes into [`NormalizedEntry`] values in document order.
//! Individual items never fail: missing fields get fallbacks, and only a
//! document that is not recognizable as a feed yields [`ParseError`].

use chrono::{DateTime, Utc};
use feed_rs::model::Entry;
use feed_rs::parser;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const UNTITLED: &str = "Untitled";

/// Scheme used for canonical URLs synthesized for items with no link or guid.
pub const PLACEHOLDER_SCHEME: &str = "urn:newsdesk:item:";

#[derive(Debug, Error)]
#[error("Parse error: {0}")]
pub struct ParseError(String);

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEntry {
    /// Dedup key: the item link, else its guid, else a synthesized placeholder
    pub canonical_url: String,
    pub title: String,
    pub body: String,
    pub published_at: DateTime<Utc>,
}

/// Parse a feed document for the given source.
pub fn parse(bytes: &[u8], source_id: i64) -> Result<Vec<NormalizedEntry>, ParseError> {
    let feed = parser::parse(bytes).map_err(|e| ParseError(e.to_string()))?;
    let now = Utc::now();

    Ok(feed
        .entries
        .into_iter()
        .map(|entry| normalize(entry, source_id, now))
        .collect())
}

fn normalize(entry: Entry, source_id: i64, now: DateTime<Utc>) -> NormalizedEntry {
    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| UNTITLED.to_string());

    let feed_published = entry.published.or(entry.updated);

    let canonical_url = entry
        .links
        .iter()
        .map(|l| l.href.trim())
        .find(|href| !href.is_empty())
        .or_else(|| Some(entry.id.trim()).filter(|id| !id.is_empty()))
        .map(str::to_string)
        .unwrap_or_else(|| placeholder_url(source_id, &title, feed_published));

    let body = entry
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .filter(|b| !b.trim().is_empty())
        .or_else(|| {
            entry
                .summary
                .as_ref()
                .map(|s| s.content.clone())
                .filter(|s| !s.trim().is_empty())
        })
        .or_else(|| {
            entry
                .media
                .iter()
                .filter_map(|m| m.description.as_ref())
                .map(|d| d.content.clone())
                .find(|d| !d.trim().is_empty())
        })
        .unwrap_or_default();

    NormalizedEntry {
        canonical_url,
        title,
        body,
        published_at: feed_published.unwrap_or(now),
    }
}

/// Deterministic stand-in URL built from what the item does carry, so a
/// link-less item maps to the same key on every run.
pub fn placeholder_url(source_id: i64, title: &str, published: Option<DateTime<Utc>>) -> String {
    let input = format!(
        "{}|{}|{}",
        source_id,
        title,
        published.map(|p| p.timestamp_millis().to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{}{:x}", PLACEHOLDER_SCHEME, hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
        <rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/">
            <channel>
                <title>Tech News</title>
                <link>https://technews.example.com</link>
                <description>Latest tech news</description>
                <item>
                    <title>Second</title>
                    <link>https://technews.example.com/2</link>
                    <guid>https://technews.example.com/2</guid>
                    <description>Summary two</description>
                    <content:encoded><![CDATA[<p>Full two</p>]]></content:encoded>
                    <pubDate>Tue, 02 Jan 2024 00:00:00 GMT</pubDate>
                </item>
                <item>
                    <title>First</title>
                    <link>https://technews.example.com/1</link>
                    <description>Summary one</description>
                    <pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate>
                </item>
            </channel>
        </rss>
    "#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
        <feed xmlns="http://www.w3.org/2005/Atom">
            <title>Atom Blog</title>
            <id>urn:uuid:60a76c80-d399-11d9-b93C-0003939e0af6</id>
            <updated>2024-01-03T00:00:00Z</updated>
            <entry>
                <title>Atom entry</title>
                <link href="https://blog.example.com/atom-1"/>
                <id>urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6a</id>
                <updated>2024-01-03T00:00:00Z</updated>
                <summary>Atom summary</summary>
            </entry>
        </feed>
    "#;

    #[test]
    fn test_rss_entries_in_document_order() {
        let entries = parse(RSS.as_bytes(), 1).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].canonical_url, "https://technews.example.com/2");
        assert_eq!(entries[1].canonical_url, "https://technews.example.com/1");
        assert_eq!(
            entries[1].published_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_full_content_preferred_over_summary() {
        let entries = parse(RSS.as_bytes(), 1).unwrap();

        assert!(entries[0].body.contains("Full two"));
        assert_eq!(entries[1].body, "Summary one");
    }

    #[test]
    fn test_atom_dialect() {
        let entries = parse(ATOM.as_bytes(), 1).unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "Atom entry");
        assert_eq!(entries[0].canonical_url, "https://blog.example.com/atom-1");
        assert_eq!(entries[0].body, "Atom summary");
        assert_eq!(
            entries[0].published_at,
            Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_guid_used_when_link_missing() {
        let xml = r#"<rss version="2.0"><channel><title>T</title>
            <item><title>No link</title><guid isPermaLink="false">tag:example.com,2024:42</guid></item>
        </channel></rss>"#;

        let entries = parse(xml.as_bytes(), 1).unwrap();
        assert_eq!(entries[0].canonical_url, "tag:example.com,2024:42");
    }

    #[test]
    fn test_item_without_link_or_guid_still_has_key() {
        let xml = r#"<rss version="2.0"><channel><title>T</title>
            <item><description>Bare item</description></item>
        </channel></rss>"#;

        let entries = parse(xml.as_bytes(), 7).unwrap();

        assert_eq!(entries.len(), 1);
        assert!(!entries[0].canonical_url.is_empty());
        assert_eq!(entries[0].title, UNTITLED);
        assert_eq!(entries[0].body, "Bare item");
    }

    #[test]
    fn test_missing_date_falls_back_to_now() {
        let xml = r#"<rss version="2.0"><channel><title>T</title>
            <item><title>Undated</title><link>https://x.example.com/1</link></item>
        </channel></rss>"#;

        let before = Utc::now();
        let entries = parse(xml.as_bytes(), 1).unwrap();

        assert!(entries[0].published_at >= before);
        assert_eq!(entries[0].body, "");
    }

    #[test]
    fn test_unparseable_document_fails() {
        assert!(parse(b"<html><body>Bad gateway</body></html>", 1).is_err());
        assert!(parse(b"", 1).is_err());
    }

    #[test]
    fn test_placeholder_is_stable_and_source_specific() {
        let published = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        let a = placeholder_url(1, "Title", published);
        let b = placeholder_url(1, "Title", published);
        let c = placeholder_url(2, "Title", published);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(PLACEHOLDER_SCHEME));
    }
}
