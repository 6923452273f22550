//! String-level HTML scrubbing shared across the extraction pipeline.
//!
//! Element removal is expressed as compiled-once regex passes over the raw
//! HTML rather than DOM mutation: the parser used everywhere else
//! (`scraper`) exposes an immutable tree. `<template>` blocks in
//! particular must be dropped *before* parsing: html5ever re-parents
//! template children into the document, so their invisible placeholder
//! content would otherwise leak into word counts and extractor output.

use regex::Regex;
use scraper::{Html, Selector};
use std::sync::LazyLock;

static TEMPLATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<template\b[^>]*>.*?</template>").unwrap());

static SCRIPTISH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:script|style|noscript)[^>]*?>.*?</(?:script|style|noscript)>").unwrap()
});

static CHROME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:nav|header|footer)[^>]*?>.*?</(?:nav|header|footer)>").unwrap()
});

static ASIDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<aside[^>]*?>.*?</aside>").unwrap());

static FORMS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:form|button|select|textarea)[^>]*?>.*?</(?:form|button|select|textarea)>")
        .unwrap()
});

static INPUT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<input[^>]*>").unwrap());

// Known consent-widget vendors plus generic cookie/GDPR class and id names.
// Matches the element's attribute block, then eats to the nearest closing
// tag of the same family (no backreferences in the regex crate, so nesting
// is resolved to the first close, the same trade-off the rest of the scrubbing
// makes).
static COOKIE_CONSENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<(?:div|section|aside)[^>]*?(?:id|class)=["'][^"'>]*(?:cookieyes|cky-|cookiebot|cybotcookiebot|cookiehub|onetrust|borlabs|cmplz|complianz|cookielawinfo|cli-modal|cli-settings|wpconsent|cookie-consent|cookie-banner|cookie-notice|cookie-popup|cookie-modal|cookie-overlay|cookie_notice|gdpr-consent|gdpr-overlay|gdpr_overlay|gdpr-banner|gdpr-cookie)[^"'>]*["'][^>]*?>.*?</(?:div|section|aside)>"#,
    )
    .unwrap()
});

// Noise containers stripped by the DOM-density heuristic.
static NOISE_CONTAINER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<(?:div|section|aside)[^>]*?(?:id|class|role)=["'][^"'>]*(?:sidebar|comment|advertisement|banner|promo|related|share|social|newsletter|cookie|popup|modal|widget)[^"'>]*["'][^>]*?>.*?</(?:div|section|aside)>"#,
    )
    .unwrap()
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

static BODY_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

/// Drop `<template>` blocks (content included) before any parsing.
pub fn remove_templates(html: &str) -> String {
    TEMPLATE_RE.replace_all(html, "").into_owned()
}

/// Remove script/style/noscript together with their content.
pub fn strip_scriptish(html: &str) -> String {
    SCRIPTISH_RE.replace_all(html, " ").into_owned()
}

/// Noise set used for visible-word counting: scripts, page chrome, asides.
pub fn strip_noise_tags(html: &str) -> String {
    let s = SCRIPTISH_RE.replace_all(html, " ");
    let s = CHROME_RE.replace_all(&s, " ");
    ASIDE_RE.replace_all(&s, " ").into_owned()
}

/// Noise set used by the block parser and markdown renderer: scripts and
/// page chrome, but asides survive (pull-quotes often live there).
pub fn strip_block_noise(html: &str) -> String {
    let s = SCRIPTISH_RE.replace_all(html, " ");
    CHROME_RE.replace_all(&s, " ").into_owned()
}

/// Full boilerplate strip used by the DOM-density heuristic.
pub fn strip_boilerplate(html: &str) -> String {
    let s = strip_noise_tags(html);
    let s = FORMS_RE.replace_all(&s, " ");
    INPUT_RE.replace_all(&s, " ").into_owned()
}

/// Remove known cookie-consent / GDPR widgets by vendor and generic names.
pub fn strip_cookie_consent(html: &str) -> String {
    COOKIE_CONSENT_RE.replace_all(html, " ").into_owned()
}

/// Remove `div`/`section`/`aside` containers whose class/id/role carries a
/// noise keyword.
pub fn strip_noise_containers(html: &str) -> String {
    NOISE_CONTAINER_RE.replace_all(html, " ").into_owned()
}

/// Approximate word count over raw HTML: strip tags by regex, split.
pub fn raw_word_count(html: &str) -> usize {
    word_count(&TAG_RE.replace_all(html, " "))
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Parsed visible text of the `<body>` (whole document when absent).
pub fn body_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let text: String = match document.select(&BODY_SELECTOR).next() {
        Some(body) => body.text().collect::<Vec<_>>().join(" "),
        None => document.root_element().text().collect::<Vec<_>>().join(" "),
    };
    text
}

/// Word count of the parsed document (any fragment or full page).
pub fn html_word_count(html: &str) -> usize {
    word_count(&body_text(html))
}

/// Visible word count the classifier relies on: template, noise-tag, and
/// consent stripping applied before counting.
pub fn visible_word_count(html: &str) -> usize {
    let clean = remove_templates(html);
    let clean = strip_noise_tags(&clean);
    let clean = strip_cookie_consent(&clean);
    html_word_count(&clean)
}

/// Collapse all whitespace runs to single spaces and trim.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
