//! Page classification: derive [`PageSignals`] from raw HTML and map them
//! to a [`PageType`] plus a recommended fetch strategy.
//!
//! Decision tree (priority order):
//!   JS SPA > Cookie wall > Paywall > AMP available > Good static > Thin static

use crate::core::config::MIN_CONTENT_WORDS;
use crate::core::types::{ClassificationResult, PageSignals, PageType};
use crate::extractors::scrub;
use aho_corasick::AhoCorasick;
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::sync::LazyLock;

const JS_FRAMEWORK_PATTERNS: &[(&str, &str)] = &[
    ("Next.js", r"(?i)/_next/static/|window\.__NEXT_DATA__"),
    ("Nuxt.js", r"(?i)/__nuxt/|window\.__NUXT__"),
    ("React/CRA", r"(?i)/static/js/main\.[a-f0-9]+\.js"),
    ("Webpack", r"(?i)chunk\.[a-f0-9]+\.js"),
    ("Angular", r"(?i)angular(?:\.min)?\.js|ng-app"),
    ("Vue", r"(?i)vue(?:\.min)?\.js|data-v-app"),
    ("Ember", r"(?i)ember(?:\.min)?\.js"),
    ("Gatsby", r"(?i)gatsby-focus-wrapper|window\.__gatsby"),
    ("Svelte", r"(?i)svelte(?:kit)?|__svelte"),
    ("Remix", r"(?i)__remixContext"),
    ("Astro", r"(?i)astro-island|astro:page-load"),
];

static FRAMEWORK_REGEXES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    JS_FRAMEWORK_PATTERNS
        .iter()
        .map(|(name, pat)| (*name, Regex::new(pat).unwrap()))
        .collect()
});

static JS_ROOT_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(root|app|__next|__nuxt|app-root|gatsby-focus-wrapper|ember-application)$")
        .unwrap()
});

static COOKIE_WALL_PHRASES: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build([
            "cookie preferences",
            "essential cookies enable",
            "cookie consent",
            "manage your cookie",
            "accept all cookies",
            "reject all cookies",
            "cookieyes",
            "cookiebot",
        ])
        .unwrap()
});

static PAYWALL_PHRASES: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build([
            "subscribe to continue",
            "subscribe to read",
            "sign in to read",
            "this article is for subscribers",
            "become a member to",
            "unlock this article",
            "member-only content",
            "you've reached your free article limit",
            "you have read your free articles",
            "subscribe for unlimited",
            "create a free account to continue",
        ])
        .unwrap()
});

static PAYWALL_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        ".paywall",
        ".paid-content",
        ".premium-content",
        "#piano-paywall",
        ".tp-modal",
        ".tp-iframe-wrapper",
        ".subscriber-only",
        ".metered-paywall",
        "[class*='paywall']",
        "[id*='paywall']",
        ".subscription-required",
        ".access-denied",
        ".piano-container",
        ".reg-wall",
    ]
    .iter()
    .map(|s| Selector::parse(s).unwrap())
    .collect()
});

static SCRIPT_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("script").unwrap());
static SCRIPT_SRC_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("script[src]").unwrap());
static JSONLD_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap());
static TITLE_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());
static OG_TITLE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[property="og:title"]"#).unwrap());
static AMP_LINK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"link[rel~="amphtml"]"#).unwrap());
static ALTERNATE_LINK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"link[rel~="alternate"]"#).unwrap());
static ID_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("[id]").unwrap());
static BODY_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

fn distinct_phrase_hits(ac: &AhoCorasick, text: &str) -> usize {
    let mut seen: HashSet<usize> = HashSet::new();
    for m in ac.find_iter(text) {
        seen.insert(m.pattern().as_usize());
    }
    seen.len()
}

/// Extract all classification signals from `html`.
///
/// Two parses: the full HTML for structural signals (script tags must stay
/// intact), and a template/noise/consent-stripped pass for the visible
/// word count.
pub fn detect_signals(html: &str) -> PageSignals {
    let mut signals = PageSignals {
        body_word_count: scrub::visible_word_count(html),
        ..PageSignals::default()
    };

    let full = Html::parse_document(html);

    signals.has_meta_title = full.select(&OG_TITLE_SELECTOR).next().is_some()
        || full.select(&TITLE_SELECTOR).next().is_some();

    for script in full.select(&JSONLD_SELECTOR) {
        let text = script.text().collect::<String>();
        if ["Article", "BlogPosting", "NewsArticle"]
            .iter()
            .any(|t| text.contains(t))
        {
            signals.has_article_schema = true;
            break;
        }
    }

    signals.amp_url = full
        .select(&AMP_LINK_SELECTOR)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty());

    for link in full.select(&ALTERNATE_LINK_SELECTOR) {
        let ltype = link
            .value()
            .attr("type")
            .unwrap_or("")
            .to_ascii_lowercase();
        if ltype.contains("rss") || ltype.contains("atom") {
            if let Some(href) = link.value().attr("href") {
                let href = href.trim();
                if !href.is_empty() {
                    signals.feed_url = Some(href.to_string());
                    break;
                }
            }
        }
    }

    // Framework fingerprints over concatenated script src + inline text.
    let mut script_blob = String::new();
    for script in full.select(&SCRIPT_SELECTOR) {
        if let Some(src) = script.value().attr("src") {
            script_blob.push_str(src);
            script_blob.push(' ');
        }
        script_blob.push_str(&script.text().collect::<String>());
        script_blob.push(' ');
    }
    for (name, re) in FRAMEWORK_REGEXES.iter() {
        if re.is_match(&script_blob) {
            signals.frameworks_detected.push(name.to_string());
        }
    }

    // Near-empty SPA mount points.
    for el in full.select(&ID_SELECTOR) {
        let id = el.value().attr("id").unwrap_or("");
        if !JS_ROOT_ID_RE.is_match(id) {
            continue;
        }
        let words = scrub::word_count(&el.text().collect::<Vec<_>>().join(" "));
        if words < 20 {
            signals.js_root_found = true;
            break;
        }
    }

    let has_external_scripts = full.select(&SCRIPT_SRC_SELECTOR).next().is_some();
    signals.is_js_spa = (!signals.frameworks_detected.is_empty()
        && (signals.js_root_found || signals.body_word_count < 100))
        || (signals.body_word_count < 10 && has_external_scripts);

    // Cookie wall and paywall share one body-text extraction.
    let body_text = match full.select(&BODY_SELECTOR).next() {
        Some(body) => body.text().collect::<Vec<_>>().join(" "),
        None => full.root_element().text().collect::<Vec<_>>().join(" "),
    };

    let cookie_hits = distinct_phrase_hits(&COOKIE_WALL_PHRASES, &body_text);
    // Cookie phrases are specific enough to trigger on alone; thin content
    // after consent stripping is corroborating evidence.
    if cookie_hits >= 2 || (cookie_hits >= 1 && signals.body_word_count < 150) {
        signals.is_cookie_walled = true;
    }

    if !signals.is_cookie_walled {
        if PAYWALL_PHRASES.is_match(&body_text) {
            signals.is_paywalled = true;
        } else {
            signals.is_paywalled = PAYWALL_SELECTORS
                .iter()
                .any(|sel| full.select(sel).next().is_some());
        }
    }

    signals
}

/// Classify `html` and recommend the best fetch strategy.
pub fn classify_page(html: &str, _url: &str) -> ClassificationResult {
    let sig = detect_signals(html);

    if sig.is_js_spa {
        let strategy = if sig.amp_url.is_some() { "amp" } else { "playwright" };
        let fw = if sig.frameworks_detected.is_empty() {
            "ultra-thin body + scripts".to_string()
        } else {
            sig.frameworks_detected.join(", ")
        };
        let confidence = if sig.frameworks_detected.is_empty() {
            0.80
        } else {
            0.90
        };
        let reason = format!(
            "JS SPA ({fw}); visible body={} words → {strategy}",
            sig.body_word_count
        );
        return ClassificationResult {
            page_type: PageType::JsSpa,
            signals: sig,
            recommended_strategy: strategy.to_string(),
            confidence,
            reason,
        };
    }

    if sig.is_cookie_walled {
        let reason = format!(
            "Cookie-consent wall detected; visible body={} words",
            sig.body_word_count
        );
        return ClassificationResult {
            page_type: PageType::CookieWalled,
            signals: sig,
            recommended_strategy: "playwright".to_string(),
            confidence: 0.85,
            reason,
        };
    }

    if sig.is_paywalled && sig.body_word_count < 500 {
        return ClassificationResult {
            page_type: PageType::Paywalled,
            signals: sig,
            recommended_strategy: "playwright".to_string(),
            confidence: 0.75,
            reason: "Paywall detected — headless render may bypass soft paywalls".to_string(),
        };
    }

    if sig.amp_url.is_some() && sig.body_word_count < MIN_CONTENT_WORDS {
        let reason = format!(
            "AMP URL found; thin static body ({} words) → amp",
            sig.body_word_count
        );
        return ClassificationResult {
            page_type: PageType::StaticHtml,
            signals: sig,
            recommended_strategy: "amp".to_string(),
            confidence: 0.70,
            reason,
        };
    }

    if sig.body_word_count >= MIN_CONTENT_WORDS {
        let reason = format!(
            "Static HTML; {} body words — no JS needed",
            sig.body_word_count
        );
        return ClassificationResult {
            page_type: PageType::StaticHtml,
            signals: sig,
            recommended_strategy: "static".to_string(),
            confidence: 0.90,
            reason,
        };
    }

    if sig.has_meta_title && sig.body_word_count < MIN_CONTENT_WORDS {
        let strategy = if sig.amp_url.is_some() { "amp" } else { "mobile_ua" };
        let reason = format!(
            "Thin content ({} words), metadata present → {strategy}",
            sig.body_word_count
        );
        return ClassificationResult {
            page_type: PageType::Unknown,
            signals: sig,
            recommended_strategy: strategy.to_string(),
            confidence: 0.50,
            reason,
        };
    }

    let reason = format!("Default static ({} body words)", sig.body_word_count);
    ClassificationResult {
        page_type: PageType::StaticHtml,
        signals: sig,
        recommended_strategy: "static".to_string(),
        confidence: 0.55,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filler_paragraphs(words: usize) -> String {
        format!("<p>{}</p>", vec!["word"; words].join(" "))
    }

    #[test]
    fn rich_static_page_recommends_static() {
        let html = format!(
            "<html><head><title>T</title></head><body><article>{}</article></body></html>",
            filler_paragraphs(300)
        );
        let result = classify_page(&html, "https://example.com");
        assert_eq!(result.page_type, PageType::StaticHtml);
        assert_eq!(result.recommended_strategy, "static");
        assert!((result.confidence - 0.90).abs() < 1e-9);
    }

    #[test]
    fn nextjs_spa_detected_with_playwright_strategy() {
        let html = r#"<html><head><title>App</title></head><body>
            <div id="__next"></div>
            <script src="/_next/static/chunks/main.js"></script>
            <script>window.__NEXT_DATA__ = {"props":{}}</script>
        </body></html>"#;
        let result = classify_page(html, "");
        assert_eq!(result.page_type, PageType::JsSpa);
        assert_eq!(result.recommended_strategy, "playwright");
        assert!((result.confidence - 0.90).abs() < 1e-9);
        assert!(result
            .signals
            .frameworks_detected
            .contains(&"Next.js".to_string()));
        assert!(result.signals.js_root_found);
    }

    #[test]
    fn spa_with_amp_prefers_amp() {
        let html = r#"<html><head>
            <link rel="amphtml" href="https://example.com/post/amp">
        </head><body>
            <div id="root"></div>
            <script src="/static/js/main.0a1b2c3d.js"></script>
        </body></html>"#;
        let result = classify_page(html, "");
        assert_eq!(result.page_type, PageType::JsSpa);
        assert_eq!(result.recommended_strategy, "amp");
    }

    #[test]
    fn cookie_wall_detected() {
        let html = r#"<html><body>
            <div><p>We use cookies. Accept all cookies or manage your cookie preferences.</p></div>
            <p>tiny body</p>
        </body></html>"#;
        let result = classify_page(html, "");
        assert_eq!(result.page_type, PageType::CookieWalled);
        assert_eq!(result.recommended_strategy, "playwright");
        assert!((result.confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn cookie_wall_overrides_paywall() {
        let html = r#"<html><body>
            <p>Accept all cookies or reject all cookies.</p>
            <p>Subscribe to continue reading.</p>
        </body></html>"#;
        let result = classify_page(html, "");
        assert_eq!(result.page_type, PageType::CookieWalled);
        assert!(!result.signals.is_paywalled);
    }

    #[test]
    fn paywall_detected_by_phrase() {
        let html = format!(
            r#"<html><body><p>Subscribe to continue reading this piece.</p>{}</body></html>"#,
            filler_paragraphs(100)
        );
        let result = classify_page(&html, "");
        assert_eq!(result.page_type, PageType::Paywalled);
        assert_eq!(result.recommended_strategy, "playwright");
        assert!((result.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn paywall_detected_by_selector() {
        let html = r#"<html><body><div class="piano-container"></div><p>short teaser text</p></body></html>"#;
        let result = classify_page(html, "");
        assert_eq!(result.page_type, PageType::Paywalled);
    }

    #[test]
    fn soft_paywall_with_long_content_stays_static() {
        let html = format!(
            r#"<html><body><p>Subscribe to continue for more.</p>{}</body></html>"#,
            filler_paragraphs(600)
        );
        let result = classify_page(&html, "");
        assert_eq!(result.page_type, PageType::StaticHtml);
        assert_eq!(result.recommended_strategy, "static");
    }

    #[test]
    fn amp_with_thin_body_recommends_amp() {
        let html = format!(
            r#"<html><head><link rel="amphtml" href="/amp"></head><body>{}</body></html>"#,
            filler_paragraphs(40)
        );
        let result = classify_page(&html, "");
        assert_eq!(result.page_type, PageType::StaticHtml);
        assert_eq!(result.recommended_strategy, "amp");
        assert!((result.confidence - 0.70).abs() < 1e-9);
    }

    #[test]
    fn thin_with_metadata_tries_mobile_ua() {
        let html = format!(
            r#"<html><head><title>Thin</title></head><body>{}</body></html>"#,
            filler_paragraphs(40)
        );
        let result = classify_page(&html, "");
        assert_eq!(result.page_type, PageType::Unknown);
        assert_eq!(result.recommended_strategy, "mobile_ua");
        assert!((result.confidence - 0.50).abs() < 1e-9);
    }

    #[test]
    fn template_content_excluded_from_word_count() {
        // A consent modal inside <template> must not inflate the count.
        let consent = vec!["consent"; 200].join(" ");
        let html = format!(
            r#"<html><head><title>T</title></head><body><template><div>{consent}</div></template>{}</body></html>"#,
            filler_paragraphs(30)
        );
        let result = classify_page(&html, "");
        assert_eq!(result.signals.body_word_count, 30);
    }

    #[test]
    fn feed_and_amp_urls_extracted() {
        let html = r#"<html><head>
            <link rel="alternate" type="application/rss+xml" href="/feed.xml">
            <link rel="amphtml" href="/amp">
        </head><body><p>hello there everyone reading this</p></body></html>"#;
        let signals = detect_signals(html);
        assert_eq!(signals.feed_url.as_deref(), Some("/feed.xml"));
        assert_eq!(signals.amp_url.as_deref(), Some("/amp"));
    }
}
