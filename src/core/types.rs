use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One unit of structured content in the extracted block sequence.
///
/// Serialized as a sum with a `type` discriminator, e.g.
/// `{"type":"heading","level":2,"text":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Heading {
        level: u8,
        text: String,
    },
    Paragraph {
        text: String,
    },
    Image {
        url: String,
        alt: String,
        caption: String,
    },
    Code {
        language: String,
        text: String,
    },
    List {
        ordered: bool,
        items: Vec<String>,
    },
    Quote {
        text: String,
    },
    Table {
        rows: Vec<Vec<String>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
    #[serde(default)]
    pub alt: String,
    #[serde(default)]
    pub caption: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRef {
    pub href: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub rel: String,
    #[serde(default)]
    pub is_internal: bool,
}

/// Classified page type, driving the adaptive strategy choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    StaticHtml,
    JsSpa,
    CookieWalled,
    Paywalled,
    Unknown,
}

impl PageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageType::StaticHtml => "static_html",
            PageType::JsSpa => "js_spa",
            PageType::CookieWalled => "cookie_walled",
            PageType::Paywalled => "paywalled",
            PageType::Unknown => "unknown",
        }
    }
}

/// Kind of bot-protection or degenerate page detected by the block detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Cloudflare,
    Captcha,
    Datadome,
    Perimeterx,
    Akamai,
    IpBan,
    SoftBlock,
    Empty,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Cloudflare => "cloudflare",
            BlockType::Captcha => "captcha",
            BlockType::Datadome => "datadome",
            BlockType::Perimeterx => "perimeterx",
            BlockType::Akamai => "akamai",
            BlockType::IpBan => "ip_ban",
            BlockType::SoftBlock => "soft_block",
            BlockType::Empty => "empty",
        }
    }
}

/// Result of a block-detection check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockResult {
    pub is_blocked: bool,
    pub block_type: Option<BlockType>,
    pub block_reason: Option<String>,
    /// 0.0–1.0
    pub confidence: f64,
}

impl BlockResult {
    pub fn clean() -> Self {
        Self {
            is_blocked: false,
            block_type: None,
            block_reason: None,
            confidence: 1.0,
        }
    }
}

/// Raw per-page signals extracted before classification.
/// Never mutated after construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageSignals {
    /// Visible word count after noise-tag, template, and consent stripping.
    pub body_word_count: usize,
    pub has_meta_title: bool,
    pub has_article_schema: bool,
    pub is_js_spa: bool,
    pub js_root_found: bool,
    pub is_cookie_walled: bool,
    pub is_paywalled: bool,
    pub amp_url: Option<String>,
    pub feed_url: Option<String>,
    pub frameworks_detected: Vec<String>,
}

/// Full classification of a fetched page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub page_type: PageType,
    pub signals: PageSignals,
    /// "static" | "amp" | "mobile_ua" | "playwright"
    pub recommended_strategy: String,
    /// 0.0–1.0
    pub confidence: f64,
    pub reason: String,
}

/// Result of an adaptive fetch: the winning HTML plus provenance.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub html: String,
    pub classification: ClassificationResult,
    pub strategy_used: String,
}

/// Single article entry from an RSS or Atom feed, in feed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub url: String,
    pub title: String,
    pub author: Option<String>,
    pub published_at: Option<String>,
    pub summary: Option<String>,
}

/// Classification signals embedded in `raw_metadata._classification` so
/// callers can inspect the adaptive decision without a second fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub reason: String,
    pub confidence: f64,
    pub frameworks: Vec<String>,
    pub amp_url: Option<String>,
    pub feed_url: Option<String>,
    pub body_word_count: usize,
}

/// Raw metadata bag. Top-level keys are stable; the per-source maps are
/// open-schema (values kept as opaque strings / JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMetadata {
    #[serde(default)]
    pub jsonld: serde_json::Value,
    #[serde(default)]
    pub og: BTreeMap<String, String>,
    #[serde(default)]
    pub twitter: BTreeMap<String, String>,
    #[serde(
        rename = "_classification",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub classification: Option<ClassificationRecord>,
}

/// Canonical output of one extraction pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleRecord {
    // Identity
    pub url: String,
    pub canonical_url: Option<String>,

    // Metadata
    pub title: String,
    pub author: Option<String>,
    pub published_at: Option<String>,
    pub updated_at: Option<String>,
    pub site_name: Option<String>,
    pub language: Option<String>,
    pub tags: Vec<String>,
    pub summary: Option<String>,

    // Content
    pub content_markdown: String,
    pub content_text: String,
    pub content_blocks: Vec<Block>,

    // Media & links
    pub images: Vec<ImageRef>,
    pub links: Vec<LinkRef>,

    // Stats
    pub word_count: usize,
    pub reading_time_minutes: u32,

    // Provenance
    /// "readability" | "trafilatura" | "dom_heuristic" | plugin name
    pub extraction_method_used: String,
    pub article_score: i32,
    /// UTC RFC 3339
    pub scraped_at: String,

    // Raw signals
    #[serde(default)]
    pub raw_metadata: RawMetadata,

    // Adaptive fetch provenance
    #[serde(default)]
    pub fetch_strategy: Option<String>,
    #[serde(default)]
    pub page_type: Option<PageType>,

    // Block detection
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub block_type: Option<BlockType>,
    #[serde(default)]
    pub block_reason: Option<String>,

    // Derived (see `finalize`)
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub is_empty: bool,
}

impl ArticleRecord {
    /// Compute the derived fields from the raw ones.
    ///
    /// `confidence_score = clamp(article_score / 80, 0, 1)`,
    /// `is_empty = word_count < 20`,
    /// `reading_time_minutes = max(1, ceil(word_count / 200))`.
    pub fn finalize(mut self) -> Self {
        self.title = self.title.trim().to_string();
        self.url = self.url.trim().to_string();
        self.confidence_score = (self.article_score as f64 / 80.0).clamp(0.0, 1.0);
        self.is_empty = self.word_count < 20;
        self.reading_time_minutes = crate::extractors::heuristics::reading_time(self.word_count);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_record() -> ArticleRecord {
        ArticleRecord {
            url: "https://example.com/post".to_string(),
            canonical_url: None,
            title: String::new(),
            author: None,
            published_at: None,
            updated_at: None,
            site_name: None,
            language: None,
            tags: vec![],
            summary: None,
            content_markdown: String::new(),
            content_text: String::new(),
            content_blocks: vec![],
            images: vec![],
            links: vec![],
            word_count: 0,
            reading_time_minutes: 0,
            extraction_method_used: "dom_heuristic".to_string(),
            article_score: 0,
            scraped_at: String::new(),
            raw_metadata: RawMetadata::default(),
            fetch_strategy: None,
            page_type: None,
            is_blocked: false,
            block_type: None,
            block_reason: None,
            confidence_score: 0.0,
            is_empty: false,
        }
    }

    #[test]
    fn block_serializes_with_type_tag() {
        let block = Block::Heading {
            level: 2,
            text: "Intro".to_string(),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "heading");
        assert_eq!(json["level"], 2);

        let code = Block::Code {
            language: "rust".to_string(),
            text: "fn main() {}".to_string(),
        };
        let json = serde_json::to_value(&code).unwrap();
        assert_eq!(json["type"], "code");
        assert_eq!(json["language"], "rust");
    }

    #[test]
    fn finalize_clamps_confidence_and_flags_empty() {
        let mut record = bare_record();
        record.title = "  Title  ".to_string();
        record.word_count = 5;
        record.article_score = 200;
        let record = record.finalize();

        assert_eq!(record.title, "Title");
        assert!((record.confidence_score - 1.0).abs() < f64::EPSILON);
        assert!(record.is_empty);
        assert_eq!(record.reading_time_minutes, 1);
    }

    #[test]
    fn negative_score_clamps_to_zero() {
        let mut record = bare_record();
        record.word_count = 400;
        record.article_score = -30;
        let record = record.finalize();

        assert_eq!(record.confidence_score, 0.0);
        assert!(!record.is_empty);
        assert_eq!(record.reading_time_minutes, 2);
    }

    #[test]
    fn page_type_serde_names() {
        assert_eq!(
            serde_json::to_value(PageType::CookieWalled).unwrap(),
            "cookie_walled"
        );
        assert_eq!(serde_json::to_value(BlockType::IpBan).unwrap(), "ip_ban");
    }
}
