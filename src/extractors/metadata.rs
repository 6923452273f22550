//! Deterministic metadata extraction from HTML.
//!
//! Priority chain (highest → lowest):
//!     JSON-LD → Open Graph → Twitter Card → HTML `<meta>` tags → `<title>` / `<html lang>`

use crate::core::types::{ImageRef, RawMetadata};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use scraper::{Html, Selector};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;
use tracing::debug;
use url::Url;

/// Merged metadata for one page.
#[derive(Debug, Clone, Default)]
pub struct MetadataBundle {
    pub title: String,
    pub author: Option<String>,
    pub published_at: Option<String>,
    pub updated_at: Option<String>,
    pub site_name: Option<String>,
    pub language: Option<String>,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub canonical_url: Option<String>,
    pub images: Vec<ImageRef>,
    pub raw: RawMetadata,
}

const ARTICLE_TYPES: &[&str] = &[
    "article",
    "blogging",
    "blogposting",
    "newsarticle",
    "techarticle",
    "scholarlyarticle",
    "liveblogposting",
    "reportage",
];

static JSONLD_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap());
static META_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("meta").unwrap());
static TITLE_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());
static H1_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").unwrap());
static HTML_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("html").unwrap());
static CANONICAL_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"link[rel~="canonical"]"#).unwrap());
static TIME_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("time[datetime]").unwrap());
static AUTHOR_META_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[name="author"]"#).unwrap());
static PUBDATE_META_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[name="pubdate"]"#).unwrap());
static DESCRIPTION_META_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[name="description"]"#).unwrap());
static KEYWORDS_META_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[name="keywords"]"#).unwrap());
static ARTICLE_TAG_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[property="article:tag"]"#).unwrap());
static HTTP_EQUIV_LANG_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[http-equiv="content-language"]"#).unwrap());
static NAME_LANG_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[name="language"]"#).unwrap());

// ---------------------------------------------------------------------------
// Date parsing
// ---------------------------------------------------------------------------

/// Parse a raw date string into UTC RFC 3339.
///
/// Returns `None` on failure or when the year falls outside 1990–2099
/// (catches epoch defaults like 1970-01-01 and far-future typos).
pub fn parse_date(raw: &str) -> Option<String> {
    let cleaned = crate::extractors::scrub::normalize_whitespace(raw);
    if cleaned.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(&cleaned) {
        return iso_if_plausible(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(&cleaned) {
        return iso_if_plausible(dt.with_timezone(&Utc));
    }

    const AWARE_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f%z",
        "%Y-%m-%dT%H:%M:%S%z",
        "%Y-%m-%d %H:%M:%S %z",
    ];
    for fmt in AWARE_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(&cleaned, fmt) {
            return iso_if_plausible(dt.with_timezone(&Utc));
        }
    }

    const NAIVE_DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ];
    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(&cleaned, fmt) {
            return iso_if_plausible(Utc.from_utc_datetime(&ndt));
        }
    }

    const DATE_FORMATS: &[&str] = &[
        "%Y-%m-%d",
        "%Y/%m/%d",
        "%d %B %Y",
        "%B %d, %Y",
        "%b %d, %Y",
        "%d %b %Y",
        "%d.%m.%Y",
        "%m/%d/%Y",
    ];
    for fmt in DATE_FORMATS {
        if let Ok(nd) = NaiveDate::parse_from_str(&cleaned, fmt) {
            if let Some(ndt) = nd.and_hms_opt(0, 0, 0) {
                return iso_if_plausible(Utc.from_utc_datetime(&ndt));
            }
        }
    }

    debug!("unparseable date: {cleaned:?}");
    None
}

fn iso_if_plausible(dt: DateTime<Utc>) -> Option<String> {
    use chrono::Datelike;
    if (1990..=2099).contains(&dt.year()) {
        Some(dt.to_rfc3339())
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// JSON-LD
// ---------------------------------------------------------------------------

fn node_is_article(node: &Value) -> bool {
    match node.get("@type") {
        Some(Value::String(t)) => ARTICLE_TYPES.contains(&t.to_ascii_lowercase().as_str()),
        Some(Value::Array(ts)) => ts.iter().any(|t| {
            t.as_str()
                .map(|s| ARTICLE_TYPES.contains(&s.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        }),
        _ => false,
    }
}

/// Collect JSON-LD nodes and pick the representative one: the first
/// Article-typed node when any exists, otherwise the first node.
fn extract_jsonld(document: &Html) -> Value {
    let mut first: Option<Value> = None;

    for script in document.select(&JSONLD_SELECTOR) {
        let raw = script.text().collect::<String>();
        let parsed: Value = match serde_json::from_str(raw.trim()) {
            Ok(v) => v,
            Err(_) => continue,
        };

        let nodes: Vec<Value> = match parsed {
            Value::Array(items) => items,
            Value::Object(ref map) => match map.get("@graph") {
                Some(Value::Array(items)) => items.clone(),
                _ => vec![parsed],
            },
            _ => continue,
        };

        for node in nodes {
            if !node.is_object() {
                continue;
            }
            if node_is_article(&node) {
                return node;
            }
            if first.is_none() {
                first = Some(node);
            }
        }
    }

    first.unwrap_or(Value::Null)
}

fn jsonld_str(node: &Value, key: &str) -> Option<String> {
    match node.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Array(items)) => items
            .iter()
            .find_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        _ => None,
    }
}

fn jsonld_author(node: &Value) -> Option<String> {
    let author = node.get("author")?;
    let name = match author {
        Value::Object(map) => map.get("name").and_then(|v| v.as_str()).map(String::from),
        Value::Array(items) => items.first().and_then(|first| match first {
            Value::Object(map) => map.get("name").and_then(|v| v.as_str()).map(String::from),
            Value::String(s) => Some(s.clone()),
            _ => None,
        }),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }?;
    let name = name.trim().to_string();
    (!name.is_empty()).then_some(name)
}

fn jsonld_tags(node: &Value) -> Vec<String> {
    match node.get("keywords") {
        Some(Value::String(csv)) => csv
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|t| !t.is_empty())
            .collect(),
        _ => vec![],
    }
}

// ---------------------------------------------------------------------------
// Open Graph / Twitter Card
// ---------------------------------------------------------------------------

fn extract_og_twitter(document: &Html) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut og = BTreeMap::new();
    let mut twitter = BTreeMap::new();

    for meta in document.select(&META_SELECTOR) {
        let el = meta.value();
        let prop = el
            .attr("property")
            .or_else(|| el.attr("name"))
            .unwrap_or("")
            .to_ascii_lowercase();
        let content = el.attr("content").unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }
        if prop.starts_with("og:") || prop.starts_with("article:") {
            og.insert(prop, content.to_string());
        } else if prop.starts_with("twitter:") {
            twitter.insert(prop, content.to_string());
        }
    }

    (og, twitter)
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

fn first_attr(document: &Html, selector: &Selector, attr: &str) -> Option<String> {
    document
        .select(selector)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn resolve(href: &str, page_url: &str) -> String {
    if href.starts_with("http") {
        return href.to_string();
    }
    Url::parse(page_url)
        .and_then(|base| base.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

fn extract_canonical(document: &Html, og: &BTreeMap<String, String>, page_url: &str) -> Option<String> {
    if let Some(href) = first_attr(document, &CANONICAL_SELECTOR, "href") {
        return Some(resolve(&href, page_url));
    }
    og.get("og:url").cloned()
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn extract_language(document: &Html, og: &BTreeMap<String, String>, jsonld: &Value, html: &str) -> Option<String> {
    if let Some(lang) = first_attr(document, &HTML_SELECTOR, "lang") {
        return Some(truncate_chars(&lang, 10));
    }

    if let Some(locale) = og.get("og:locale") {
        let primary = locale.replace('_', "-");
        let primary = primary.split('-').next().unwrap_or("").to_string();
        if !primary.is_empty() {
            return Some(truncate_chars(&primary, 5));
        }
    }

    if let Some(Value::String(lang)) = jsonld.get("inLanguage") {
        if !lang.trim().is_empty() {
            return Some(truncate_chars(lang.trim(), 10));
        }
    }

    if let Some(lang) = first_attr(document, &HTTP_EQUIV_LANG_SELECTOR, "content")
        .or_else(|| first_attr(document, &NAME_LANG_SELECTOR, "content"))
    {
        return Some(truncate_chars(&lang, 10));
    }

    // Content-based fallback when the page declares nothing.
    detect_language_from_text(html)
}

fn detect_language_from_text(html: &str) -> Option<String> {
    let text = crate::extractors::scrub::body_text(&crate::extractors::scrub::strip_scriptish(html));
    if crate::extractors::scrub::word_count(&text) < 20 {
        return None;
    }
    whatlang::detect(&text).map(|info| {
        use whatlang::Lang;
        match info.lang() {
            Lang::Eng => "en".to_string(),
            Lang::Spa => "es".to_string(),
            Lang::Fra => "fr".to_string(),
            Lang::Deu => "de".to_string(),
            Lang::Ita => "it".to_string(),
            Lang::Por => "pt".to_string(),
            Lang::Rus => "ru".to_string(),
            Lang::Jpn => "ja".to_string(),
            Lang::Kor => "ko".to_string(),
            Lang::Cmn => "zh".to_string(),
            other => other.code().to_string(),
        }
    })
}

fn extract_tags(jsonld: &Value, document: &Html) -> Vec<String> {
    let mut tags = jsonld_tags(jsonld);

    for meta in document.select(&ARTICLE_TAG_SELECTOR) {
        if let Some(content) = meta.value().attr("content") {
            let tag = content.trim();
            if !tag.is_empty() {
                tags.push(tag.to_string());
            }
        }
    }

    if let Some(csv) = first_attr(document, &KEYWORDS_META_SELECTOR, "content") {
        tags.extend(
            csv.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        );
    }

    // Case-insensitive dedup, first occurrence wins.
    let mut seen: HashSet<String> = HashSet::new();
    tags.retain(|t| seen.insert(t.to_ascii_lowercase()));
    tags
}

fn extract_meta_images(
    og: &BTreeMap<String, String>,
    jsonld: &Value,
    page_url: &str,
) -> Vec<ImageRef> {
    let mut images = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    if let Some(og_img) = og.get("og:image") {
        let url = resolve(og_img, page_url);
        seen.insert(url.clone());
        images.push(ImageRef {
            url,
            alt: og.get("og:image:alt").cloned().unwrap_or_default(),
            caption: String::new(),
        });
    }

    match jsonld.get("image") {
        Some(Value::String(src)) => {
            let url = resolve(src, page_url);
            if seen.insert(url.clone()) {
                images.push(ImageRef {
                    url,
                    alt: String::new(),
                    caption: String::new(),
                });
            }
        }
        Some(Value::Object(map)) => {
            if let Some(src) = map.get("url").and_then(|v| v.as_str()) {
                let url = resolve(src, page_url);
                if seen.insert(url.clone()) {
                    images.push(ImageRef {
                        url,
                        alt: map
                            .get("description")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        caption: String::new(),
                    });
                }
            }
        }
        _ => {}
    }

    images
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Extract all available metadata from `html`. No network.
pub fn extract_metadata(html: &str, page_url: &str) -> MetadataBundle {
    let document = Html::parse_document(html);

    let jsonld = extract_jsonld(&document);
    let (og, twitter) = extract_og_twitter(&document);

    let title = jsonld_str(&jsonld, "headline")
        .or_else(|| jsonld_str(&jsonld, "name"))
        .or_else(|| og.get("og:title").cloned())
        .or_else(|| twitter.get("twitter:title").cloned())
        .or_else(|| first_text(&document, &TITLE_SELECTOR))
        .or_else(|| first_text(&document, &H1_SELECTOR))
        .unwrap_or_default();

    let author = jsonld_author(&jsonld)
        .or_else(|| og.get("article:author").cloned())
        .or_else(|| twitter.get("twitter:creator").cloned())
        .or_else(|| first_attr(&document, &AUTHOR_META_SELECTOR, "content"));

    let published_at = jsonld_str(&jsonld, "datePublished")
        .or_else(|| og.get("article:published_time").cloned())
        .or_else(|| first_attr(&document, &PUBDATE_META_SELECTOR, "content"))
        .or_else(|| first_attr(&document, &TIME_SELECTOR, "datetime"))
        .and_then(|raw| parse_date(&raw));

    let updated_at = jsonld_str(&jsonld, "dateModified")
        .or_else(|| og.get("article:modified_time").cloned())
        .or_else(|| og.get("og:updated_time").cloned())
        .and_then(|raw| parse_date(&raw));

    let publisher_name = jsonld
        .get("publisher")
        .and_then(|p| p.get("name"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let site_name = og
        .get("og:site_name")
        .cloned()
        .or(publisher_name)
        .or_else(|| {
            let host = crate::extractors::urlnorm::extract_domain(page_url);
            (!host.is_empty()).then(|| host.trim_start_matches("www.").to_string())
        });

    let summary = jsonld_str(&jsonld, "description")
        .or_else(|| og.get("og:description").cloned())
        .or_else(|| twitter.get("twitter:description").cloned())
        .or_else(|| first_attr(&document, &DESCRIPTION_META_SELECTOR, "content"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let language = extract_language(&document, &og, &jsonld, html);
    let tags = extract_tags(&jsonld, &document);
    let canonical_url = extract_canonical(&document, &og, page_url);
    let images = extract_meta_images(&og, &jsonld, page_url);

    MetadataBundle {
        title: title.trim().to_string(),
        author,
        published_at,
        updated_at,
        site_name,
        language,
        summary,
        tags,
        canonical_url,
        images,
        raw: RawMetadata {
            jsonld,
            og,
            twitter,
            classification: None,
        },
    }
}
