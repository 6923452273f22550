//! Deterministic heuristics: article likelihood scoring, "needs JS"
//! detection, and reading-time estimation.

use crate::extractors::scrub;
use aho_corasick::AhoCorasick;
use regex::{Regex, RegexSet};
use scraper::{Html, Selector};
use std::sync::LazyLock;
use url::Url;

/// Pages scoring at or above this are treated as articles.
pub const ARTICLE_SCORE_THRESHOLD: i32 = 35;

const ARTICLE_PATH_SEGMENTS: &[&str] = &[
    "blog",
    "blogs",
    "post",
    "posts",
    "article",
    "articles",
    "news",
    "story",
    "stories",
    "essay",
    "essays",
    "journal",
    "write",
    "writing",
    "p",
    "entry",
    "entries",
    "publication",
    "publications",
    "insight",
    "insights",
    "tutorial",
    "tutorials",
    "guide",
    "guides",
    "learn",
    "thought",
    "thoughts",
];

static EXCLUDED_PATH_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)/tag/",
        r"(?i)/tags/",
        r"(?i)/category/",
        r"(?i)/categories/",
        r"(?i)/search(\?|$|/)",
        r"(?i)/login(\?|$|/)",
        r"(?i)/signin(\?|$|/)",
        r"(?i)/signup(\?|$|/)",
        r"(?i)/register(\?|$|/)",
        r"(?i)/logout(\?|$|/)",
        r"(?i)/privacy(\?|$|/)",
        r"(?i)/terms(\?|$|/)",
        r"(?i)/feed(\?|$|/)",
        r"(?i)/rss(\?|$|/)",
        r"(?i)/sitemap",
        r"(?i)/archive(\?|$|/)",
        r"(?i)/archives(\?|$|/)",
        r"(?i)/_next/static/",
        r"(?i)/cdn-cgi/",
        r"(?i)/wp-content/uploads/",
        r"(?i)/__webpack",
        r"(?i)/page/\d+",
    ])
    .unwrap()
});

static DATE_IN_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/\d{4}/\d{2}(/\d{2})?").unwrap());
static PAGE_IN_PATH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/page/\d+").unwrap());

static JS_REQUIRED_PHRASES: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build([
            "enable javascript",
            "javascript is required",
            "please enable javascript",
            "javascript must be enabled",
            "this site requires javascript",
            "you need to enable javascript",
            "requires javascript to function",
        ])
        .unwrap()
});

static JS_ROOT_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        "#__next",
        "#app",
        "#root",
        "#__nuxt",
        "#app-root",
        "#gatsby-focus-wrapper",
        "[data-reactroot]",
        "[data-server-rendered]",
        "div[ng-app]",
        "#angular-app",
        "#ember-application",
    ]
    .iter()
    .map(|s| Selector::parse(s).unwrap())
    .collect()
});

static H1_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").unwrap());
static P_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("p").unwrap());
static A_HREF_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());
static LINK_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("link[rel]").unwrap());
static META_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("meta").unwrap());
static JSONLD_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap());
static NOSCRIPT_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("noscript").unwrap());
static SCRIPT_SRC_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("script[src]").unwrap());

const ARTICLE_JSONLD_TYPES: &[&str] = &[
    "article",
    "blogging",
    "blogposting",
    "newsarticle",
    "techarticle",
    "scholarlyarticle",
    "liveblogposting",
    "reportage",
    "satiricalarticle",
    "socialmediaposting",
];

// ---------------------------------------------------------------------------
// Article scoring
// ---------------------------------------------------------------------------

/// Integer likelihood that `url`/`html` is a single article page.
/// Additive and unbounded above; compare against
/// [`ARTICLE_SCORE_THRESHOLD`].
pub fn article_score(url: &str, html: &str) -> i32 {
    url_score(url).clamp(-30, 30) + content_score(html)
}

fn url_score(url: &str) -> i32 {
    let Ok(parsed) = Url::parse(url) else {
        return 0;
    };
    let path = parsed.path().to_ascii_lowercase();

    // Hard excludes short-circuit; no point scoring further.
    if EXCLUDED_PATH_PATTERNS.is_match(&path) {
        return -30;
    }

    let mut score = 0;
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    if segments
        .iter()
        .any(|seg| ARTICLE_PATH_SEGMENTS.contains(seg))
    {
        score += 15;
    }

    if DATE_IN_PATH_RE.is_match(&path) {
        score += 10;
    }

    match segments.len() {
        n if n >= 4 => score += 5,
        2 => score += 3,
        n if n <= 1 => score -= 20,
        _ => {}
    }

    let paginated = parsed.query_pairs().any(|(k, _)| k == "page")
        || PAGE_IN_PATH_RE.is_match(&path);
    if paginated {
        score -= 15;
    }

    if path.contains("/author/") && segments.len() <= 2 {
        score -= 10;
    }

    score
}

struct QuickMeta {
    has_author: bool,
    has_date: bool,
    jsonld_article: bool,
    og_article: bool,
}

fn quick_meta(document: &Html) -> QuickMeta {
    let mut meta = QuickMeta {
        has_author: false,
        has_date: false,
        jsonld_article: false,
        og_article: false,
    };

    for script in document.select(&JSONLD_SELECTOR) {
        let raw = script.text().collect::<String>();
        let Ok(data) = serde_json::from_str::<serde_json::Value>(raw.trim()) else {
            continue;
        };
        let node = match &data {
            serde_json::Value::Array(items) => items.first().cloned().unwrap_or_default(),
            other => other.clone(),
        };
        let dtype = node
            .get("@type")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if ARTICLE_JSONLD_TYPES.contains(&dtype.as_str()) {
            meta.jsonld_article = true;
        }
        if node.get("author").is_some() {
            meta.has_author = true;
        }
        if node.get("datePublished").is_some() {
            meta.has_date = true;
        }
    }

    for tag in document.select(&META_SELECTOR) {
        let el = tag.value();
        let prop = el
            .attr("property")
            .or_else(|| el.attr("name"))
            .unwrap_or("")
            .to_ascii_lowercase();
        let content = el.attr("content").unwrap_or("");
        if content.is_empty() {
            continue;
        }
        if prop == "og:type" && content.eq_ignore_ascii_case("article") {
            meta.og_article = true;
        }
        if prop == "article:published_time" {
            meta.has_date = true;
        }
        if matches!(prop.as_str(), "author" | "article:author" | "og:article:author") {
            meta.has_author = true;
        }
    }

    meta
}

fn content_score(html: &str) -> i32 {
    let mut score = 0;

    // Word counting and structure on the noise-stripped document; metadata
    // scanning on the full document (the noise strip removes script tags
    // and with them every JSON-LD payload).
    let stripped = scrub::strip_noise_tags(html);
    let doc = Html::parse_document(&stripped);
    let full_doc = Html::parse_document(html);

    let words = scrub::word_count(&doc.root_element().text().collect::<Vec<_>>().join(" "));
    if words > 300 {
        score += 20;
    } else if words >= 150 {
        score += 10;
    } else if words < 50 {
        score -= 20;
    }

    let h1_count = doc.select(&H1_SELECTOR).count();
    if h1_count == 1 {
        score += 15;
    } else if h1_count > 3 {
        score -= 5;
    }

    let substantial_paras = doc
        .select(&P_SELECTOR)
        .filter(|p| scrub::word_count(&p.text().collect::<Vec<_>>().join(" ")) >= 20)
        .count();
    if substantial_paras >= 3 {
        score += 5;
    }

    let meta = quick_meta(&full_doc);
    if meta.has_author {
        score += 10;
    }
    if meta.has_date {
        score += 10;
    }
    if meta.jsonld_article {
        score += 10;
    }
    if meta.og_article {
        score += 5;
    }

    if doc.select(&A_HREF_SELECTOR).count() > 30 {
        score -= 10;
    }

    // Pagination links mark listing pages.
    for link in full_doc.select(&LINK_SELECTOR) {
        let rel = link.value().attr("rel").unwrap_or("");
        if rel
            .split_whitespace()
            .any(|v| v == "next" || v == "prev")
        {
            score -= 15;
            break;
        }
    }

    score
}

// ---------------------------------------------------------------------------
// JS rendering detection
// ---------------------------------------------------------------------------

/// True when `html` appears to need JavaScript to render its content.
pub fn needs_js(html: &str, threshold_words: usize) -> bool {
    if html.trim().is_empty() {
        return false;
    }

    let full_doc = Html::parse_document(html);

    // Explicit JS-required message, checked before any stripping.
    let full_text = full_doc.root_element().text().collect::<Vec<_>>().join(" ");
    if JS_REQUIRED_PHRASES.is_match(&full_text) {
        return true;
    }

    // A noscript block with meaningful text is the site telling us.
    for noscript in full_doc.select(&NOSCRIPT_SELECTOR) {
        let ns_text = noscript.text().collect::<Vec<_>>().join(" ");
        if scrub::word_count(&ns_text) > 15 {
            return true;
        }
    }

    let stripped = scrub::strip_block_noise(html);
    let doc = Html::parse_document(&stripped);
    let word_count = scrub::word_count(&doc.root_element().text().collect::<Vec<_>>().join(" "));

    // Framework root element plus sparse visible text.
    let has_js_root = JS_ROOT_SELECTORS
        .iter()
        .any(|sel| doc.select(sel).next().is_some());
    if has_js_root && word_count < threshold_words {
        return true;
    }

    // Many external scripts over a nearly empty body.
    let script_count = full_doc.select(&SCRIPT_SRC_SELECTOR).count();
    script_count > 8 && word_count < 50
}

// ---------------------------------------------------------------------------
// Reading time
// ---------------------------------------------------------------------------

/// Estimated reading time in minutes at 200 wpm, minimum 1.
pub fn reading_time(word_count: usize) -> u32 {
    reading_time_at(word_count, 200)
}

pub fn reading_time_at(word_count: usize, wpm: usize) -> u32 {
    (word_count.div_ceil(wpm.max(1)) as u32).max(1)
}
