//! URL normalization and slug generation.
//!
//! Pure string functions; invalid input is passed through unchanged so the
//! crawler's dedup ledger stays total.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;
use std::sync::LazyLock;
use url::Url;

/// Query parameters that carry no semantic meaning for content identity.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "utm_id",
    "utm_reader",
    "fbclid",
    "gclid",
    "gclsrc",
    "dclid",
    "msclkid",
    "ref",
    "source",
    "via",
    "_ga",
    "_gac",
    "mc_cid",
    "mc_eid",
    "igshid",
    "s_kwcid",
    "ef_id",
    "affiliate_id",
    "clickid",
];

/// Final path extensions that clearly point at non-HTML assets.
const NON_CONTENT_EXTENSIONS: &[&str] = &[
    "pdf", "jpg", "jpeg", "png", "gif", "svg", "webp", "bmp", "tiff", "ico", "css", "js", "json",
    "xml", "txt", "csv", "zip", "tar", "gz", "rar", "7z", "woff", "woff2", "ttf", "eot", "mp3",
    "mp4", "avi", "mov", "wmv", "flv", "webm",
];

static SLUG_UNSAFE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\-]+").unwrap());
static MULTI_DASH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-{2,}").unwrap());

// Spaces and query metacharacters that must stay escaped when we re-encode
// sorted query pairs.
const QUERY_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'&')
    .add(b'=')
    .add(b'+')
    .add(b'%');

fn is_tracking_param(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    TRACKING_PARAMS.contains(&lower.as_str())
}

/// Canonical form of `url` suitable for deduplication.
///
/// Lowercases scheme and host, drops default ports and the fragment,
/// removes tracking query parameters, and sorts the remaining parameters
/// by key (values for a repeated key keep input order). Returns the input
/// unchanged when it does not parse as an absolute URL.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    let mut parsed = match Url::parse(trimmed) {
        Ok(u) => u,
        Err(_) => return url.to_string(),
    };

    // Url already lowercases scheme and host and drops default ports for
    // http/https; ftp's port 21 needs an explicit check.
    if parsed.scheme() == "ftp" && parsed.port() == Some(21) {
        let _ = parsed.set_port(None);
    }

    parsed.set_fragment(None);

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        // Stable sort: repeated keys keep their relative input order.
        let mut sorted = kept;
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let query = sorted
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(k, QUERY_ESCAPE),
                    utf8_percent_encode(v, QUERY_ESCAPE)
                )
            })
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&query));
    }

    parsed.to_string()
}

/// Filesystem-safe slug from the URL path (host when the path is empty).
///
/// `https://example.com/blog/how-to-scrape` → `blog-how-to-scrape`.
pub fn url_to_slug(url: &str, max_length: usize) -> String {
    let path = match Url::parse(url) {
        Ok(parsed) => {
            let p = parsed.path().trim_matches('/').to_string();
            if p.is_empty() {
                parsed.host_str().unwrap_or("").replace('.', "-")
            } else {
                p
            }
        }
        Err(_) => url.to_string(),
    };

    let slug = SLUG_UNSAFE_RE.replace_all(&path, "-");
    let slug = MULTI_DASH_RE.replace_all(&slug, "-");
    let slug = slug.trim_matches('-');
    let slug: String = slug.chars().take(max_length).collect();
    let slug = slug.trim_matches('-');

    if slug.is_empty() {
        "index".to_string()
    } else {
        slug.to_string()
    }
}

/// True when the final path extension marks a non-HTML asset.
pub fn is_non_content_url(url: &str) -> bool {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_ascii_lowercase(),
        Err(_) => return false,
    };
    match path.rsplit_once('.') {
        Some((_, ext)) => NON_CONTENT_EXTENSIONS.contains(&ext),
        None => false,
    }
}

/// Lowercased host of `url`, or an empty string.
pub fn extract_domain(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_port_fragment_and_tracking() {
        assert_eq!(
            normalize_url("HTTPS://Example.COM:443/Post?utm_source=x&b=2&a=1#frag"),
            "https://example.com/Post?a=1&b=2"
        );
    }

    #[test]
    fn tracking_only_query_is_dropped_entirely() {
        assert_eq!(
            normalize_url("https://example.com/p?utm_source=a&fbclid=b"),
            "https://example.com/p"
        );
    }

    #[test]
    fn idempotent() {
        let urls = [
            "https://example.com/a/b?z=1&y=2&utm_medium=email",
            "http://EXAMPLE.com:80/path#x",
            "https://example.com/",
            "not a url at all",
        ];
        for u in urls {
            let once = normalize_url(u);
            assert_eq!(normalize_url(&once), once, "not idempotent for {u}");
        }
    }

    #[test]
    fn repeated_keys_keep_input_order() {
        let n = normalize_url("https://example.com/p?b=2&a=second&a=first");
        assert_eq!(n, "https://example.com/p?a=second&a=first&b=2");
    }

    #[test]
    fn invalid_urls_pass_through() {
        assert_eq!(normalize_url("::::"), "::::");
    }

    #[test]
    fn slug_from_path() {
        assert_eq!(
            url_to_slug("https://example.com/blog/how-to-scrape-data", 100),
            "blog-how-to-scrape-data"
        );
    }

    #[test]
    fn slug_from_host_when_path_empty() {
        assert_eq!(url_to_slug("https://example.com/", 100), "example-com");
    }

    #[test]
    fn slug_collapses_and_truncates() {
        assert_eq!(
            url_to_slug("https://example.com/a//b__c!!d", 100),
            "a-b__c-d"
        );
        let long = format!("https://example.com/{}", "x".repeat(300));
        assert_eq!(url_to_slug(&long, 10).len(), 10);
    }

    #[test]
    fn empty_slug_becomes_index() {
        assert_eq!(url_to_slug("https://example.com/---", 100), "index");
    }

    #[test]
    fn asset_urls_detected() {
        assert!(is_non_content_url("https://example.com/pic.JPG"));
        assert!(is_non_content_url("https://example.com/a/b/style.css?v=3"));
        assert!(!is_non_content_url("https://example.com/post"));
        assert!(!is_non_content_url("https://example.com/post.html"));
    }

    #[test]
    fn domain_extraction() {
        assert_eq!(extract_domain("https://Blog.Example.com/x"), "blog.example.com");
        assert_eq!(extract_domain("not-a-url"), "");
    }
}
