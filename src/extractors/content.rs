//! Main content extraction with a best-of-two + heuristic cascade.
//!
//! Tier A: readability (Mozilla Readability port, precision-oriented)
//! Tier B: trafilatura-style recall harvester (collects every dense
//!         content container instead of fixating on the single best one)
//! Tier C: DOM-density heuristic (priority selectors + paragraph density)
//!
//! Registered extractor plugins run after the built-in cascade and are
//! adopted only when they strictly improve the word count.

use crate::core::types::{ImageRef, LinkRef};
use crate::extractors::scrub;
use crate::plugins::Registry;
use scraper::{ElementRef, Html, Selector};
use select::document::Document as SelectDoc;
use select::node::Node as SelectNode;
use select::predicate::{Attr, Name};
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::debug;
use url::Url;

pub const METHOD_READABILITY: &str = "readability";
pub const METHOD_TRAFILATURA: &str = "trafilatura";
pub const METHOD_DOM_HEURISTIC: &str = "dom_heuristic";

// Minimum words for a tier's output to be considered successful.
const READABILITY_MIN_WORDS: usize = 50;
const TRAFILATURA_MIN_WORDS: usize = 30;
const DOM_MIN_WORDS: usize = 10;

// Tier B must beat Tier A by this factor to win when both succeed.
const RECALL_WIN_RATIO: f64 = 1.4;

/// Result of one extraction pass.
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub html: String,
    pub method: String,
    pub word_count: usize,
}

static PRIORITY_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        "article",
        "main",
        r#"[role="main"]"#,
        r#"[itemprop="articleBody"]"#,
        ".post-content",
        ".article-content",
        ".entry-content",
        ".post-body",
        ".article-body",
        "#article-content",
        "#post-content",
        "#entry-content",
        "#content",
        "#main-content",
        ".content-body",
        ".story-body",
        ".blog-post",
        ".post",
        ".single-content",
    ]
    .iter()
    .map(|s| Selector::parse(s).unwrap())
    .collect()
});

static DIV_SECTION_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div, section").unwrap());
static P_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("p").unwrap());
static BODY_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());
static IMG_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img").unwrap());
static FIGCAPTION_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("figcaption").unwrap());
static ANCHOR_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a").unwrap());

const NOISE_SUBSTRINGS: &[&str] = &[
    "sidebar",
    "comment",
    "advertisement",
    "banner",
    "promo",
    "related",
    "share",
    "social",
    "newsletter",
    "cookie",
    "popup",
    "modal",
    "widget",
];

// ---------------------------------------------------------------------------
// Pre-processing
// ---------------------------------------------------------------------------

/// Strip `<template>` placeholders and cookie-consent widgets before any
/// extractor runs.
pub fn pre_scrub(html: &str) -> String {
    let cleaned = scrub::remove_templates(html);
    scrub::strip_cookie_consent(&cleaned)
}

// ---------------------------------------------------------------------------
// Tier A: readability
// ---------------------------------------------------------------------------

fn try_readability(html: &str, url: &str) -> Option<(String, usize)> {
    let base = Url::parse(url)
        .or_else(|_| Url::parse("http://localhost/"))
        .ok()?;
    match readability::extractor::extract(&mut html.as_bytes(), &base) {
        Ok(product) => {
            let wc = scrub::html_word_count(&product.content);
            (wc >= READABILITY_MIN_WORDS).then_some((product.content, wc))
        }
        Err(e) => {
            debug!("readability failed: {e}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tier B: recall harvester
// ---------------------------------------------------------------------------

fn node_words(node: &SelectNode) -> usize {
    scrub::word_count(&node.text())
}

fn node_paragraph_words(node: &SelectNode) -> usize {
    node.find(Name("p")).map(|p| node_words(&p)).sum()
}

fn node_is_noisy(node: &SelectNode) -> bool {
    let mut combined = node.attr("class").unwrap_or("").to_ascii_lowercase();
    combined.push(' ');
    combined.push_str(&node.attr("id").unwrap_or("").to_ascii_lowercase());
    NOISE_SUBSTRINGS.iter().any(|kw| combined.contains(kw))
}

fn has_accepted_ancestor(node: &SelectNode, accepted: &HashSet<usize>) -> bool {
    let mut current = node.parent();
    while let Some(parent) = current {
        if accepted.contains(&parent.index()) {
            return true;
        }
        current = parent.parent();
    }
    false
}

/// Recall-favoring extraction: harvest *every* dense content container in
/// document order instead of picking a single winner. Multi-section
/// service/portal pages keep all of their sections this way.
fn try_trafilatura(html: &str) -> Option<(String, usize)> {
    let doc = SelectDoc::from(html);
    let mut accepted: HashSet<usize> = HashSet::new();
    let mut fragments: Vec<String> = Vec::new();

    // Semantic containers first.
    let semantic = doc
        .find(Name("article"))
        .chain(doc.find(Name("main")))
        .chain(doc.find(Attr("role", "main")))
        .chain(doc.find(Attr("itemprop", "articleBody")));
    for node in semantic {
        if has_accepted_ancestor(&node, &accepted) || accepted.contains(&node.index()) {
            continue;
        }
        if node_words(&node) >= DOM_MIN_WORDS {
            accepted.insert(node.index());
            fragments.push(node.html());
        }
    }

    // Dense generic containers, skipping anything already captured.
    for node in doc.find(Name("div")).chain(doc.find(Name("section"))) {
        if has_accepted_ancestor(&node, &accepted) || accepted.contains(&node.index()) {
            continue;
        }
        if node_is_noisy(&node) {
            continue;
        }
        let para_words = node_paragraph_words(&node);
        if para_words < TRAFILATURA_MIN_WORDS {
            continue;
        }
        let total = node_words(&node).max(1);
        if (para_words as f64 / total as f64) < 0.3 {
            continue;
        }
        accepted.insert(node.index());
        fragments.push(node.html());
    }

    if fragments.is_empty() {
        return None;
    }
    let combined = fragments.join("\n");
    let wc = scrub::html_word_count(&combined);
    (wc >= TRAFILATURA_MIN_WORDS).then_some((combined, wc))
}

// ---------------------------------------------------------------------------
// Tier C: DOM-density heuristic
// ---------------------------------------------------------------------------

fn element_words(el: ElementRef) -> usize {
    scrub::word_count(&el.text().collect::<Vec<_>>().join(" "))
}

/// Extract main content via priority selectors and paragraph-density
/// scoring once both general-purpose extractors have failed.
pub fn dom_heuristic_extract(html: &str) -> String {
    let stripped = scrub::strip_boilerplate(html);
    let stripped = scrub::strip_noise_containers(&stripped);
    let document = Html::parse_document(&stripped);

    // Priority selectors: largest match wins, accepted at >= 10 words.
    for selector in PRIORITY_SELECTORS.iter() {
        if let Some(best) = document.select(selector).max_by_key(|el| element_words(*el)) {
            if element_words(best) >= DOM_MIN_WORDS {
                return best.html();
            }
        }
    }

    // Paragraph-density scoring across <div> and <section>.
    let mut best: Option<(f64, ElementRef)> = None;
    for el in document.select(&DIV_SECTION_SELECTOR) {
        let para_words: usize = el.select(&P_SELECTOR).map(element_words).sum();
        if para_words < DOM_MIN_WORDS {
            continue;
        }
        let total = element_words(el).max(1);
        let score = para_words as f64 * (para_words as f64 / total as f64);
        if best.map_or(true, |(s, _)| score > s) {
            best = Some((score, el));
        }
    }

    let body = document.select(&BODY_SELECTOR).next();

    if let Some((_, top)) = best {
        // If one element dominates (>= 55 % of remaining body words), take
        // just that element. Otherwise the content is spread across many
        // equal-weight sections (portals, wikis) and the full stripped body
        // loses nothing.
        let body_words = body.map(element_words).unwrap_or(0);
        let top_words = element_words(top);
        if body_words == 0 || top_words as f64 / body_words as f64 >= 0.55 {
            return top.html();
        }
        if let Some(b) = body {
            return b.html();
        }
        return top.html();
    }

    match body {
        Some(b) => b.html(),
        None => html.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Cascade
// ---------------------------------------------------------------------------

/// Choose between the two general-purpose extractors.
///
/// When both met their thresholds, the recall harvester wins only at
/// >= 1.4x the word count; switching on minor noise differences would
/// churn provenance for no content gain.
fn pick_best(
    readability: Option<(String, usize)>,
    recall: Option<(String, usize)>,
) -> Option<ExtractionOutcome> {
    match (readability, recall) {
        (Some((r_html, r_wc)), Some((t_html, t_wc))) => {
            if t_wc as f64 >= r_wc as f64 * RECALL_WIN_RATIO {
                Some(ExtractionOutcome {
                    html: t_html,
                    method: METHOD_TRAFILATURA.to_string(),
                    word_count: t_wc,
                })
            } else {
                Some(ExtractionOutcome {
                    html: r_html,
                    method: METHOD_READABILITY.to_string(),
                    word_count: r_wc,
                })
            }
        }
        (Some((r_html, r_wc)), None) => Some(ExtractionOutcome {
            html: r_html,
            method: METHOD_READABILITY.to_string(),
            word_count: r_wc,
        }),
        (None, Some((t_html, t_wc))) => Some(ExtractionOutcome {
            html: t_html,
            method: METHOD_TRAFILATURA.to_string(),
            word_count: t_wc,
        }),
        (None, None) => None,
    }
}

/// Extract the main content from `html`.
///
/// Both general-purpose extractors run on the pre-scrubbed page; the DOM
/// heuristic backstops them; extractor plugins get the final word when
/// they strictly improve on the current word count.
pub fn extract_main_content(html: &str, url: &str, registry: &Registry) -> ExtractionOutcome {
    let pre = pre_scrub(html);

    let readability = try_readability(&pre, url);
    let recall = try_trafilatura(&pre);
    debug!(
        "extraction passes: readability={} words, trafilatura={} words",
        readability.as_ref().map(|r| r.1).unwrap_or(0),
        recall.as_ref().map(|r| r.1).unwrap_or(0),
    );

    let mut outcome = pick_best(readability, recall).unwrap_or_else(|| {
        let content = dom_heuristic_extract(&pre);
        let wc = scrub::html_word_count(&content);
        ExtractionOutcome {
            html: content,
            method: METHOD_DOM_HEURISTIC.to_string(),
            word_count: wc,
        }
    });

    for plugin in registry.extractors_by_priority() {
        if !plugin.can_extract(html, url) {
            continue;
        }
        if let Some(plugin_html) = plugin.extract(html, url) {
            let wc = scrub::html_word_count(&plugin_html);
            if wc > outcome.word_count {
                outcome = ExtractionOutcome {
                    html: plugin_html,
                    method: plugin.name().to_string(),
                    word_count: wc,
                };
                break;
            }
        }
    }

    outcome
}

// ---------------------------------------------------------------------------
// Images & links
// ---------------------------------------------------------------------------

fn img_src(el: ElementRef) -> Option<String> {
    let v = el.value();
    let src = v.attr("src").map(str::trim).unwrap_or("");
    if !src.is_empty() {
        return Some(src.to_string());
    }
    let srcset = v.attr("srcset").map(str::trim).unwrap_or("");
    srcset
        .split(',')
        .next()
        .and_then(|candidate| candidate.trim().split(' ').next())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

fn resolve_against(base: Option<&Url>, href: &str) -> String {
    match base {
        Some(b) => b
            .join(href)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| href.to_string()),
        None => href.to_string(),
    }
}

fn figure_caption(el: ElementRef) -> String {
    let parent = el
        .parent()
        .and_then(ElementRef::wrap)
        .filter(|p| p.value().name() == "figure");
    match parent {
        Some(figure) => figure
            .select(&FIGCAPTION_SELECTOR)
            .next()
            .map(|c| c.text().collect::<String>().trim().to_string())
            .unwrap_or_default(),
        None => String::new(),
    }
}

/// Extract all images from `html` with resolved URL, alt, and figure caption.
pub fn extract_images(html: &str, base_url: &str) -> Vec<ImageRef> {
    let document = Html::parse_document(html);
    let base = Url::parse(base_url).ok();
    let mut images = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for img in document.select(&IMG_SELECTOR) {
        let Some(src) = img_src(img) else {
            continue;
        };
        let url = resolve_against(base.as_ref(), &src);
        if !seen.insert(url.clone()) {
            continue;
        }
        images.push(ImageRef {
            url,
            alt: img.value().attr("alt").unwrap_or("").trim().to_string(),
            caption: figure_caption(img),
        });
    }

    images
}

/// Extract all hyperlinks from `html`: http(s) only, duplicates removed in
/// order, internality judged against `base_domain`.
pub fn extract_links(html: &str, base_url: &str, base_domain: &str) -> Vec<LinkRef> {
    let document = Html::parse_document(html);
    let base = Url::parse(base_url).ok();
    let mut links = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for a in document.select(&ANCHOR_SELECTOR) {
        let href = a.value().attr("href").map(str::trim).unwrap_or("");
        if href.is_empty() {
            continue;
        }
        let lower = href.to_ascii_lowercase();
        if lower.starts_with('#')
            || lower.starts_with("mailto:")
            || lower.starts_with("javascript:")
            || lower.starts_with("tel:")
            || lower.starts_with("data:")
            || lower.starts_with("sms:")
        {
            continue;
        }

        let resolved = resolve_against(base.as_ref(), href);
        if let Ok(parsed) = Url::parse(&resolved) {
            if !matches!(parsed.scheme(), "http" | "https") {
                continue;
            }
        }
        if !seen.insert(resolved.clone()) {
            continue;
        }

        let is_internal = !base_domain.is_empty()
            && Url::parse(&resolved)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.eq_ignore_ascii_case(base_domain)))
                .unwrap_or(false);

        links.push(LinkRef {
            href: resolved,
            text: a.text().collect::<String>().trim().to_string(),
            rel: a.value().attr("rel").unwrap_or("").to_string(),
            is_internal,
        });
    }

    links
}
