//! RSS 2.0 / Atom 1.0 feed parser.
//!
//! Total: returns an empty list on any malformed XML instead of failing.
//! Documents carrying a DTD are rejected outright and external entities
//! are never resolved (quick-xml does not expand them), which closes the
//! XXE hole feed parsing is notorious for.

use crate::core::types::FeedEntry;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::warn;
use url::Url;

/// Minimal owned element tree; enough for feeds and sitemaps.
#[derive(Debug, Clone, Default)]
pub(crate) struct XmlElement {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    /// Tag name with any namespace prefix removed, lowercased.
    pub fn local_name(&self) -> String {
        self.name
            .rsplit(':')
            .next()
            .unwrap_or(&self.name)
            .to_ascii_lowercase()
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, local: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.local_name() == local)
    }

    pub fn children_named<'a>(&'a self, local: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.local_name() == local)
    }

    pub fn text_trimmed(&self) -> Option<String> {
        let t = self.text.trim();
        (!t.is_empty()).then(|| t.to_string())
    }

    /// Depth-first iteration over this element and all descendants.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a XmlElement)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

/// Parse an XML document into an element tree. Returns `None` on any
/// parse error or when the document declares a DTD.
pub(crate) fn parse_xml(xml: &str) -> Option<XmlElement> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let mut el = XmlElement {
                    name: String::from_utf8_lossy(e.name().as_ref()).to_string(),
                    ..XmlElement::default()
                };
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    let value = attr
                        .unescape_value()
                        .map(|v| v.to_string())
                        .unwrap_or_default();
                    el.attrs.push((key, value));
                }
                stack.push(el);
            }
            Ok(Event::Empty(e)) => {
                let mut el = XmlElement {
                    name: String::from_utf8_lossy(e.name().as_ref()).to_string(),
                    ..XmlElement::default()
                };
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    let value = attr
                        .unescape_value()
                        .map(|v| v.to_string())
                        .unwrap_or_default();
                    el.attrs.push((key, value));
                }
                match stack.last_mut() {
                    Some(parent) => parent.children.push(el),
                    None if root.is_none() => root = Some(el),
                    None => {}
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(top), Ok(text)) = (stack.last_mut(), t.unescape()) {
                    top.text.push_str(&text);
                }
            }
            Ok(Event::CData(t)) => {
                if let Some(top) = stack.last_mut() {
                    top.text
                        .push_str(&String::from_utf8_lossy(t.into_inner().as_ref()));
                }
            }
            Ok(Event::End(_)) => {
                let el = stack.pop()?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(el),
                    None if root.is_none() => root = Some(el),
                    None => {}
                }
            }
            Ok(Event::DocType(_)) => {
                warn!("rejecting XML document with DTD");
                return None;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return None,
        }
    }

    if !stack.is_empty() {
        return None;
    }
    root
}

// ---------------------------------------------------------------------------
// RSS 2.0
// ---------------------------------------------------------------------------

fn parse_rss(root: &XmlElement) -> Vec<FeedEntry> {
    let channel = root.child("channel").unwrap_or(root);
    let mut entries = Vec::new();

    for item in channel.children_named("item") {
        // <link> in RSS is element text, not an attribute.
        let mut url = item.child("link").and_then(XmlElement::text_trimmed);
        if url.is_none() {
            if let Some(guid) = item.child("guid") {
                let is_permalink = guid
                    .attr("isPermaLink")
                    .map(|v| !v.eq_ignore_ascii_case("false"))
                    .unwrap_or(true);
                if is_permalink {
                    url = guid.text_trimmed();
                }
            }
        }
        let Some(url) = url else {
            continue;
        };

        let author = item
            .children
            .iter()
            .find(|c| c.local_name() == "creator")
            .and_then(XmlElement::text_trimmed)
            .or_else(|| item.child("author").and_then(XmlElement::text_trimmed));

        let published_at = item
            .child("pubdate")
            .and_then(XmlElement::text_trimmed)
            .or_else(|| {
                item.children
                    .iter()
                    .find(|c| c.local_name() == "date")
                    .and_then(XmlElement::text_trimmed)
            });

        entries.push(FeedEntry {
            url,
            title: item
                .child("title")
                .and_then(XmlElement::text_trimmed)
                .unwrap_or_default(),
            author,
            published_at,
            summary: item.child("description").and_then(XmlElement::text_trimmed),
        });
    }

    entries
}

// ---------------------------------------------------------------------------
// Atom 1.0
// ---------------------------------------------------------------------------

fn resolve_link(href: &str, base_url: &str) -> String {
    if base_url.is_empty() {
        return href.to_string();
    }
    Url::parse(base_url)
        .and_then(|base| base.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

fn parse_atom(root: &XmlElement, base_url: &str) -> Vec<FeedEntry> {
    let mut entries = Vec::new();

    for entry in root.children_named("entry") {
        // Canonical alternate link; a missing rel counts as alternate.
        let mut url: Option<String> = None;
        for link in entry.children_named("link") {
            let rel = link.attr("rel").unwrap_or("alternate");
            if rel == "alternate" || rel.is_empty() {
                if let Some(href) = link.attr("href").map(str::trim).filter(|h| !h.is_empty()) {
                    url = Some(resolve_link(href, base_url));
                    break;
                }
            }
        }
        let Some(url) = url else {
            continue;
        };

        let author = entry
            .child("author")
            .and_then(|a| a.child("name"))
            .and_then(XmlElement::text_trimmed);

        let published_at = entry
            .child("published")
            .and_then(XmlElement::text_trimmed)
            .or_else(|| entry.child("updated").and_then(XmlElement::text_trimmed));

        let summary = entry
            .child("summary")
            .and_then(XmlElement::text_trimmed)
            .or_else(|| entry.child("content").and_then(XmlElement::text_trimmed));

        entries.push(FeedEntry {
            url,
            title: entry
                .child("title")
                .and_then(XmlElement::text_trimmed)
                .unwrap_or_default(),
            author,
            published_at,
            summary,
        });
    }

    entries
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Parse RSS 2.0 or Atom 1.0 XML into ordered [`FeedEntry`] values.
///
/// Format is auto-detected from the root element; entries come back in
/// file order. Never fails: malformed XML yields an empty list.
pub fn parse_feed(xml_text: &str, base_url: &str) -> Vec<FeedEntry> {
    let Some(root) = parse_xml(xml_text) else {
        warn!("feed XML parse error; returning no entries");
        return Vec::new();
    };

    let tag = root.local_name();

    if tag.contains("rss") || root.child("channel").is_some() {
        let entries = parse_rss(&root);
        if !entries.is_empty() {
            return entries;
        }
        // Fall through for unusual structures.
    }

    if tag.contains("feed") {
        return parse_atom(&root, base_url);
    }

    let entries = parse_rss(&root);
    if !entries.is_empty() {
        return entries;
    }
    let entries = parse_atom(&root, base_url);
    if entries.is_empty() {
        warn!("could not detect feed format for root tag {:?}", root.name);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
    <rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
      <channel>
        <title>Example Blog</title>
        <item>
          <title>First Post</title>
          <link>https://example.com/post/1</link>
          <dc:creator>Ada</dc:creator>
          <pubDate>Tue, 05 Mar 2024 10:30:00 GMT</pubDate>
          <description>Summary one</description>
        </item>
        <item>
          <title>Guid Post</title>
          <guid>https://example.com/post/2</guid>
        </item>
        <item>
          <title>Non-permalink guid</title>
          <guid isPermaLink="false">tag:example.com,2024:3</guid>
        </item>
      </channel>
    </rss>"#;

    const ATOM: &str = r#"<?xml version="1.0"?>
    <feed xmlns="http://www.w3.org/2005/Atom">
      <title>Example Feed</title>
      <entry>
        <title>Relative Entry</title>
        <link rel="alternate" href="/post/1"/>
        <author><name>Grace</name></author>
        <published>2024-02-01T00:00:00Z</published>
        <summary>Atom summary</summary>
      </entry>
      <entry>
        <title>Absolute Entry</title>
        <link href="https://example.com/post/2"/>
        <updated>2024-02-02T00:00:00Z</updated>
        <content>Body content</content>
      </entry>
    </feed>"#;

    #[test]
    fn rss_items_in_order_with_dc_creator() {
        let entries = parse_feed(RSS, "");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url, "https://example.com/post/1");
        assert_eq!(entries[0].title, "First Post");
        assert_eq!(entries[0].author.as_deref(), Some("Ada"));
        assert_eq!(
            entries[0].published_at.as_deref(),
            Some("Tue, 05 Mar 2024 10:30:00 GMT")
        );
        assert_eq!(entries[0].summary.as_deref(), Some("Summary one"));
    }

    #[test]
    fn rss_guid_permalink_fallback() {
        let entries = parse_feed(RSS, "");
        assert_eq!(entries[1].url, "https://example.com/post/2");
        // The isPermaLink="false" item carries no usable URL and is dropped.
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn atom_relative_links_resolved_against_base() {
        let entries = parse_feed(ATOM, "https://example.com/feed");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url, "https://example.com/post/1");
        assert_eq!(entries[0].author.as_deref(), Some("Grace"));
        assert_eq!(entries[0].summary.as_deref(), Some("Atom summary"));
        assert_eq!(entries[1].url, "https://example.com/post/2");
        assert_eq!(
            entries[1].published_at.as_deref(),
            Some("2024-02-02T00:00:00Z")
        );
        assert_eq!(entries[1].summary.as_deref(), Some("Body content"));
    }

    #[test]
    fn malformed_xml_returns_empty() {
        assert!(parse_feed("this is not xml <<<", "").is_empty());
        assert!(parse_feed("", "").is_empty());
        assert!(parse_feed("<rss><channel><item></rss>", "").is_empty());
    }

    #[test]
    fn dtd_documents_rejected() {
        let xml = r#"<?xml version="1.0"?>
        <!DOCTYPE rss [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
        <rss><channel><item><link>https://example.com/x</link></item></channel></rss>"#;
        assert!(parse_feed(xml, "").is_empty());
    }

    #[test]
    fn unknown_root_tries_both_formats() {
        let xml = r#"<weird><channel><item><link>https://example.com/a</link></item></channel></weird>"#;
        let entries = parse_feed(xml, "");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn cdata_summaries_preserved() {
        let xml = r#"<rss><channel><item>
            <link>https://example.com/p</link>
            <description><![CDATA[<b>Rich</b> summary]]></description>
        </item></channel></rss>"#;
        let entries = parse_feed(xml, "");
        assert_eq!(entries[0].summary.as_deref(), Some("<b>Rich</b> summary"));
    }
}
