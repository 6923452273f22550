//! Bot/block page detector.
//!
//! Pure functions, no network. Classifies a fetched HTML page as blocked
//! (CAPTCHA, Cloudflare challenge, DataDome, PerimeterX, Akamai, IP ban,
//! soft block, or empty) by fast string/regex matching in priority order;
//! the first match wins.

use crate::core::types::{BlockResult, BlockType};
use crate::extractors::scrub;
use regex::{Regex, RegexSet};
use std::sync::LazyLock;

static CF_BODY_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)just a moment",
        r"(?i)cf-browser-verification",
        r"(?i)challenges\.cloudflare\.com",
        r"(?i)cf-challenge",
        r"(?i)__cf_bm",
        r"(?i)cf-ray",
    ])
    .unwrap()
});

static CF_TITLE_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([r"(?i)attention required", r"(?i)just a moment"]).unwrap()
});

static CAPTCHA_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)g-recaptcha",
        r"(?i)h-captcha",
        r"(?i)hcaptcha\.com",
        r"(?i)cf-turnstile",
        r"(?i)FriendlyCaptcha",
        r"(?i)recaptcha\.net",
    ])
    .unwrap()
});

static DATADOME_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([r"(?i)datadome", r"(?i)ddCaptcha", r"(?i)_dd_s"]).unwrap()
});

static PERIMETERX_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)px-captcha",
        r"(?i)pxi_loader",
        r"(?i)_pxAppId",
        r"(?i)perimeterx",
    ])
    .unwrap()
});

static AKAMAI_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([r"(?i)ak_bmsc", r"(?i)_abck", r"(?i)bmak\.js"]).unwrap()
});

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());

static EXTERNAL_SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<script[^>]+\bsrc\s*=\s*["']https?://"#).unwrap());

fn page_title(html: &str) -> String {
    TITLE_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

fn blocked(block_type: BlockType, reason: String, confidence: f64) -> BlockResult {
    BlockResult {
        is_blocked: true,
        block_type: Some(block_type),
        block_reason: Some(reason),
        confidence,
    }
}

/// Detect whether `html` is a bot-protection or block page.
pub fn detect_block(html: &str, url: &str, status_code: u16) -> BlockResult {
    let wc = scrub::raw_word_count(html);

    // Priority 1: IP ban (auth-flavored status + sparse content).
    if matches!(status_code, 401 | 403 | 407) && wc < 200 {
        let origin = if url.is_empty() {
            String::new()
        } else {
            format!(" from {url}")
        };
        return blocked(
            BlockType::IpBan,
            format!("HTTP {status_code}{origin} with sparse content ({wc} words)"),
            0.95,
        );
    }

    // Priority 2: Cloudflare challenge.
    if CF_TITLE_PATTERNS.is_match(&page_title(html)) || CF_BODY_PATTERNS.is_match(html) {
        return blocked(
            BlockType::Cloudflare,
            "Cloudflare challenge page detected".to_string(),
            0.95,
        );
    }

    // Priority 3: CAPTCHA widgets.
    let captcha_hits = CAPTCHA_PATTERNS.matches(html).iter().count();
    if captcha_hits >= 1 {
        return blocked(
            BlockType::Captcha,
            format!("CAPTCHA widget detected ({captcha_hits} signal(s))"),
            0.90,
        );
    }

    // Priority 4–6: vendor fingerprints.
    let dd_hits = DATADOME_PATTERNS.matches(html).iter().count();
    if dd_hits >= 1 {
        return blocked(
            BlockType::Datadome,
            format!("DataDome bot protection detected ({dd_hits} signal(s))"),
            0.92,
        );
    }

    let px_hits = PERIMETERX_PATTERNS.matches(html).iter().count();
    if px_hits >= 1 {
        return blocked(
            BlockType::Perimeterx,
            format!("PerimeterX bot protection detected ({px_hits} signal(s))"),
            0.92,
        );
    }

    let ak_hits = AKAMAI_PATTERNS.matches(html).iter().count();
    if ak_hits >= 1 {
        return blocked(
            BlockType::Akamai,
            format!("Akamai bot manager detected ({ak_hits} signal(s))"),
            0.90,
        );
    }

    // Priority 7: soft block, sparse text under a heavy JS payload.
    let ext_scripts = EXTERNAL_SCRIPT_RE.find_iter(html).count();
    if wc < 30 && ext_scripts > 6 {
        return blocked(
            BlockType::SoftBlock,
            format!("Sparse content ({wc} words) with heavy JS load ({ext_scripts} external scripts)"),
            0.75,
        );
    }

    // Priority 8: empty 200.
    if status_code == 200 && wc < 20 {
        return blocked(
            BlockType::Empty,
            format!("HTTP 200 but page has only {wc} words"),
            0.80,
        );
    }

    BlockResult::clean()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filler(words: usize) -> String {
        format!("<p>{}</p>", vec!["content"; words].join(" "))
    }

    #[test]
    fn clean_page_not_blocked() {
        let html = format!("<html><body>{}</body></html>", filler(250));
        let result = detect_block(&html, "https://example.com", 200);
        assert!(!result.is_blocked);
        assert_eq!(result.block_type, None);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn cloudflare_by_title() {
        let html = r#"<html><head><title>Just a moment...</title></head>
            <body><script src="https://challenges.cloudflare.com/x.js"></script>
            checking your browser before accessing the site please wait a few seconds
            while we verify your request now</body></html>"#;
        let result = detect_block(html, "", 200);
        assert!(result.is_blocked);
        assert_eq!(result.block_type, Some(BlockType::Cloudflare));
        assert!(result.confidence >= 0.9);
        assert!(result.block_reason.is_some());
    }

    #[test]
    fn ip_ban_on_403_with_sparse_body() {
        let result = detect_block("Forbidden. Access denied.", "https://example.com", 403);
        assert_eq!(result.block_type, Some(BlockType::IpBan));
        assert!(result.confidence >= 0.9);
        assert!(result.block_reason.as_deref().unwrap().contains("403"));
    }

    #[test]
    fn status_403_with_rich_body_is_not_ip_ban() {
        let html = format!("<html><body>{}</body></html>", filler(250));
        let result = detect_block(&html, "", 403);
        assert!(!result.is_blocked);
    }

    #[test]
    fn captcha_detected() {
        let html = format!(
            r#"<html><body><div class="g-recaptcha" data-sitekey="x"></div>{}</body></html>"#,
            filler(100)
        );
        let result = detect_block(&html, "", 200);
        assert_eq!(result.block_type, Some(BlockType::Captcha));
        assert!((result.confidence - 0.90).abs() < 1e-9);
    }

    #[test]
    fn datadome_perimeterx_akamai_fingerprints() {
        let cases = [
            ("<script>window.ddCaptcha = 1;</script>", BlockType::Datadome),
            ("<div id='px-captcha'></div>", BlockType::Perimeterx),
            ("<script src='/bmak.js'></script>", BlockType::Akamai),
        ];
        for (snippet, expected) in cases {
            let html = format!("<html><body>{}{}</body></html>", snippet, filler(100));
            let result = detect_block(&html, "", 200);
            assert_eq!(result.block_type, Some(expected), "for {snippet}");
        }
    }

    #[test]
    fn soft_block_needs_sparse_text_and_many_scripts() {
        let scripts: String = (0..8)
            .map(|i| format!(r#"<script src="https://cdn.example.com/{i}.js"></script>"#))
            .collect();
        let html = format!("<html><body>{scripts}<p>loading app shell now please</p>{}</body></html>", filler(20));
        let result = detect_block(&html, "", 200);
        assert_eq!(result.block_type, Some(BlockType::SoftBlock));
        assert!((result.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn empty_200_detected() {
        let result = detect_block("<html><body><p>Loading...</p></body></html>", "", 200);
        assert_eq!(result.block_type, Some(BlockType::Empty));
        assert!((result.confidence - 0.80).abs() < 1e-9);
    }

    #[test]
    fn empty_check_only_applies_to_200() {
        let result = detect_block("<html><body><p>tiny</p></body></html>", "", 204);
        assert!(!result.is_blocked);
    }

    #[test]
    fn detection_is_monotone_under_appended_content() {
        // Appending clean content must not clear an existing trigger.
        let base = r#"<html><head><title>Attention Required!</title></head><body>x</body></html>"#;
        let appended = format!("{base}{}", filler(500));
        assert!(detect_block(base, "", 200).is_blocked);
        assert!(detect_block(&appended, "", 200).is_blocked);

        let captcha = format!("<div class='h-captcha'></div>{}", filler(500));
        assert!(detect_block(&captcha, "", 200).is_blocked);
    }
}
