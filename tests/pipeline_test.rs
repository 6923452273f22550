//! End-to-end pipeline tests over the public API: pre-fetched HTML in,
//! validated article records out.

use pagemill::{
    classify_page, detect_block, normalize_url, parse, parse_feed, reading_time, PageType,
};

fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

fn words(n: usize) -> String {
    (0..n)
        .map(|i| format!("w{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[test]
fn static_article_end_to_end() {
    init_logger();

    // Two paragraphs totalling 75 words, JSON-LD Article, OG title.
    let p1 = words(40);
    let p2 = words(35);
    let html = format!(
        r#"<html lang="en"><head>
        <title>Deep Learning Guide</title>
        <meta property="og:title" content="Deep Learning Guide">
        <script type="application/ld+json">{{"@type":"Article","headline":"Deep Learning Guide"}}</script>
        </head><body><article><h1>Deep Learning Guide</h1><p>{p1}</p><p>{p2}</p></article></body></html>"#
    );

    let article = parse(&html, "https://example.com/blog/deep-learning-guide");

    assert!(!article.is_blocked);
    assert_eq!(article.block_type, None);
    assert_eq!(article.title, "Deep Learning Guide");
    assert_eq!(article.reading_time_minutes, 1);
    assert!(!article.is_empty);
    assert!(["readability", "trafilatura", "dom_heuristic"]
        .contains(&article.extraction_method_used.as_str()));
    assert_eq!(article.fetch_strategy.as_deref(), Some("pre_fetched"));

    // The extracted text covers the article body (h1 + both paragraphs).
    assert!(article.word_count >= 75, "got {}", article.word_count);
    assert!(article.content_markdown.contains("Deep Learning Guide"));
    assert!(article
        .content_blocks
        .iter()
        .any(|b| matches!(b, pagemill::Block::Heading { level: 1, .. })));

    // Derived invariants.
    assert!(article.confidence_score >= 0.0 && article.confidence_score <= 1.0);
    let expected = (article.article_score as f64 / 80.0).clamp(0.0, 1.0);
    assert!((article.confidence_score - expected).abs() < 1e-9);
}

#[test]
fn cloudflare_challenge_is_flagged() {
    let html = format!(
        r#"<html><head><title>Just a moment...</title></head>
        <body><script src="https://challenges.cloudflare.com/x.js"></script><p>{}</p></body></html>"#,
        words(20)
    );
    let article = parse(&html, "https://example.com/post");

    assert!(article.is_blocked);
    assert_eq!(article.block_type.map(|b| b.as_str()), Some("cloudflare"));
    assert!(article.block_reason.is_some());

    let verdict = detect_block(&html, "https://example.com/post", 200);
    assert!(verdict.confidence >= 0.9);
}

#[test]
fn ip_ban_on_sparse_403() {
    let verdict = detect_block("Forbidden. Access denied.", "https://example.com/p", 403);
    assert!(verdict.is_blocked);
    assert_eq!(verdict.block_type.map(|b| b.as_str()), Some("ip_ban"));
    assert!(verdict.confidence >= 0.9);
    assert!(verdict.block_reason.unwrap().contains("403"));
}

#[test]
fn empty_200_page() {
    let html = "<html><body><p>Loading...</p></body></html>";
    let article = parse(html, "https://example.com/x");

    assert!(article.is_empty);
    assert_eq!(article.block_type.map(|b| b.as_str()), Some("empty"));
    assert!(article.word_count < 20);
}

#[test]
fn url_normalization_scenarios() {
    assert_eq!(
        normalize_url("HTTPS://Example.COM:443/Post?utm_source=x&b=2&a=1#frag"),
        "https://example.com/Post?a=1&b=2"
    );
    assert_eq!(
        normalize_url("https://example.com/p?utm_source=a&fbclid=b"),
        "https://example.com/p"
    );
    // Idempotence over a spread of shapes.
    for url in [
        "https://example.com/a?x=1&y=2",
        "http://EXAMPLE.com:80/",
        "https://example.com/path#frag",
    ] {
        let once = normalize_url(url);
        assert_eq!(normalize_url(&once), once);
    }
}

#[test]
fn atom_feed_relative_link_resolution() {
    let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom">
      <entry><title>One</title><link rel="alternate" href="/post/1"/></entry>
      <entry><title>Two</title><link rel="alternate" href="https://example.com/post/2"/></entry>
    </feed>"#;
    let entries = parse_feed(xml, "https://example.com/feed");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].url, "https://example.com/post/1");
}

#[test]
fn feed_parsing_is_total() {
    for garbage in ["", "not xml", "<rss><unclosed>", "{\"json\": true}"] {
        assert!(parse_feed(garbage, "").is_empty(), "failed for {garbage:?}");
    }
}

#[test]
fn block_detection_monotone_under_appended_content() {
    let triggers = [
        "<html><head><title>Just a moment...</title></head><body>x</body></html>".to_string(),
        "<div class=\"g-recaptcha\"></div>".to_string(),
        "<script>window.ddCaptcha = true;</script>".to_string(),
    ];
    let filler = format!("<p>{}</p>", words(800));
    for trigger in triggers {
        assert!(detect_block(&trigger, "", 200).is_blocked);
        let appended = format!("{trigger}{filler}");
        assert!(
            detect_block(&appended, "", 200).is_blocked,
            "appending clean content cleared the trigger for {trigger}"
        );
    }
}

#[test]
fn classifier_priority_js_spa_wins() {
    // SPA signals plus a cookie phrase and paywall marker: SPA must win,
    // and with an AMP URL present the strategy is amp.
    let html = r#"<html><head>
        <title>App</title>
        <link rel="amphtml" href="/amp">
    </head><body>
        <div id="__next"></div>
        <p>accept all cookies and subscribe to continue</p>
        <script src="/_next/static/chunks/main.js"></script>
    </body></html>"#;
    let result = classify_page(html, "");
    assert_eq!(result.page_type, PageType::JsSpa);
    assert_eq!(result.recommended_strategy, "amp");
}

#[test]
fn reading_time_formula() {
    for (words, minutes) in [(0usize, 1u32), (10, 1), (200, 1), (201, 2), (999, 5), (1000, 5)] {
        assert_eq!(reading_time(words), minutes, "for {words} words");
    }
}

#[test]
fn soft_paywalled_page_still_yields_content() {
    let body = words(600);
    let html = format!(
        r#"<html><head><title>Soft Wall</title></head><body>
        <article><h1>Soft Wall</h1><p>{body}</p></article>
        <div class="paywall-banner"><p>Subscribe to continue reading.</p></div>
        </body></html>"#
    );
    let classification = classify_page(&html, "");
    // Long visible content keeps the page static despite the marker.
    assert_eq!(classification.page_type, PageType::StaticHtml);

    let article = parse(&html, "https://example.com/blog/soft-wall");
    assert!(!article.is_empty);
    assert!(article.word_count >= 500);
}

#[test]
fn record_serialization_round_trip() {
    let html = format!(
        r#"<html><head><title>Round Trip</title></head><body><article><h1>Round Trip</h1><p>{}</p></article></body></html>"#,
        words(120)
    );
    let article = parse(&html, "https://example.com/blog/round-trip");

    let json = serde_json::to_string(&article).unwrap();
    let back: pagemill::ArticleRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(back.title, article.title);
    assert_eq!(back.word_count, article.word_count);
    assert_eq!(back.content_blocks, article.content_blocks);
}
