//! Single-URL query API: `parse`, `fetch`, `fetch_batch`, `fetch_feed`,
//! plus the block-aware proxy retry glue.

use crate::core::config;
use crate::core::types::{ArticleRecord, ClassificationRecord, FeedEntry, PageType};
use crate::extractors::block_detection::detect_block;
use crate::extractors::blocks::html_to_blocks;
use crate::extractors::content::{extract_images, extract_links, extract_main_content};
use crate::extractors::feed::parse_feed;
use crate::extractors::heuristics;
use crate::extractors::markdown::html_to_markdown;
use crate::extractors::metadata::extract_metadata;
use crate::extractors::{scrub, urlnorm};
use crate::fetch::adaptive::{adaptive_fetch, AdaptiveOptions};
use crate::fetch::browser::{renderer_available, BrowserRenderer, CdpRenderer, PageAction, RenderOptions};
use crate::fetch::proxy::{ProxyConfig, ProxyRotator, RotationStrategy};
use crate::fetch::rate_limit::DomainRateLimiter;
use crate::fetch::{default_backend, FetchError, FetchOptions, HttpBackend};
use crate::fetch::auth::AuthSession;
use crate::plugins::{self, Registry};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{info, warn};

/// How `fetch_batch` reports individual failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    /// Omit failed URLs from the result list.
    Skip,
    /// Propagate the first failure immediately.
    Raise,
    /// Keep one slot per input URL, `None` for failures.
    Include,
}

/// Options for the `fetch` family.
#[derive(Clone)]
pub struct QueryOptions {
    /// Skip the adaptive chain and render with the headless browser.
    pub render_js: bool,
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
    /// When non-empty, fetches run through a per-session proxy rotator.
    pub proxy_list: Vec<String>,
    pub proxy_rotation: RotationStrategy,
    /// Rotate proxies and retry when a fetched page classifies as blocked.
    pub retry_on_block: bool,
    pub auth: Option<Arc<AuthSession>>,
    pub rate_limiter: Option<Arc<DomainRateLimiter>>,
    pub page_actions: Option<Vec<PageAction>>,
    /// Explicit renderer; defaults to the pooled CDP renderer when a
    /// browser binary is available.
    pub renderer: Option<Arc<dyn BrowserRenderer>>,
    /// Explicit plugin registry; defaults to the process-wide one.
    pub registry: Option<Registry>,
    /// Explicit HTTP backend; defaults to the shared reqwest backend.
    pub backend: Option<Arc<dyn HttpBackend>>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            render_js: false,
            timeout: None,
            user_agent: None,
            proxy_list: Vec::new(),
            proxy_rotation: RotationStrategy::RoundRobin,
            retry_on_block: true,
            auth: None,
            rate_limiter: None,
            page_actions: None,
            renderer: None,
            registry: None,
            backend: None,
        }
    }
}

impl QueryOptions {
    fn fetch_options(&self, proxy: Option<String>) -> FetchOptions {
        FetchOptions {
            timeout: self.timeout,
            user_agent: self.user_agent.clone(),
            max_retries: None,
            proxy,
            auth: self.auth.clone(),
            rate_limiter: self.rate_limiter.clone(),
            extra_headers: Vec::new(),
        }
    }

    fn backend(&self) -> Arc<dyn HttpBackend> {
        self.backend.clone().unwrap_or_else(|| default_backend())
    }

    fn renderer(&self) -> Option<Arc<dyn BrowserRenderer>> {
        if let Some(r) = &self.renderer {
            return Some(r.clone());
        }
        if renderer_available() {
            static SHARED: OnceLock<Arc<CdpRenderer>> = OnceLock::new();
            let shared = SHARED.get_or_init(|| Arc::new(CdpRenderer::new())).clone();
            return Some(shared);
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Extraction (pure HTML → ArticleRecord, no network)
// ---------------------------------------------------------------------------

/// Run the full extraction pipeline over already-fetched HTML.
pub fn parse(html: &str, url: &str) -> ArticleRecord {
    parse_with(html, url, None)
}

/// Like [`parse`], with an explicit plugin registry.
pub fn parse_with(html: &str, url: &str, registry: Option<&Registry>) -> ArticleRecord {
    let registry = plugins::resolve(registry);
    extract_article(html, url, Some("pre_fetched".to_string()), None, 200, &registry)
}

pub(crate) fn extract_article(
    html: &str,
    url: &str,
    fetch_strategy: Option<String>,
    page_type: Option<PageType>,
    status_code: u16,
    registry: &Registry,
) -> ArticleRecord {
    let domain = urlnorm::extract_domain(url);

    let meta = extract_metadata(html, url);
    let outcome = extract_main_content(html, url, registry);

    let content_markdown = html_to_markdown(&outcome.html);
    let content_text = scrub::normalize_whitespace(&scrub::body_text(&outcome.html));
    let word_count = scrub::word_count(&content_text);

    let content_blocks = html_to_blocks(&outcome.html, url);

    // Content images, with metadata images (og:image first) prepended.
    let mut images = extract_images(&outcome.html, url);
    let existing: HashSet<String> = images.iter().map(|i| i.url.clone()).collect();
    let mut merged = Vec::new();
    for img in &meta.images {
        if !existing.contains(&img.url) {
            merged.push(img.clone());
        }
    }
    merged.append(&mut images);
    let images = merged;

    let links = extract_links(html, url, &domain);

    let mut article_score = heuristics::article_score(url, html);
    for scorer in registry.scorers() {
        article_score = scorer.score(url, html, article_score);
    }

    let block = detect_block(html, url, status_code);

    ArticleRecord {
        url: url.to_string(),
        canonical_url: meta
            .canonical_url
            .clone()
            .or_else(|| (!url.is_empty()).then(|| url.to_string())),
        title: meta.title.clone(),
        author: meta.author.clone(),
        published_at: meta.published_at.clone(),
        updated_at: meta.updated_at.clone(),
        site_name: meta.site_name.clone(),
        language: meta.language.clone(),
        tags: meta.tags.clone(),
        summary: meta.summary.clone(),
        content_markdown,
        content_text,
        content_blocks,
        images,
        links,
        word_count,
        reading_time_minutes: 0,
        extraction_method_used: outcome.method,
        article_score,
        scraped_at: Utc::now().to_rfc3339(),
        raw_metadata: meta.raw,
        fetch_strategy,
        page_type,
        is_blocked: block.is_blocked,
        block_type: block.block_type,
        block_reason: block.block_reason,
        confidence_score: 0.0,
        is_empty: false,
    }
    .finalize()
}

// ---------------------------------------------------------------------------
// Single-URL fetch
// ---------------------------------------------------------------------------

async fn fetch_once(
    url: &str,
    opts: &QueryOptions,
    proxy: Option<String>,
    registry: &Registry,
) -> Result<ArticleRecord, FetchError> {
    let backend = opts.backend();

    if opts.render_js {
        let renderer = opts.renderer().ok_or_else(|| FetchError::Browser {
            url: url.to_string(),
            reason: "render_js requested but no browser renderer is available".to_string(),
        })?;
        let render_opts = RenderOptions {
            timeout: Some(opts.fetch_options(proxy.clone()).timeout()),
            proxy,
            user_agent: opts.user_agent.clone(),
            cookies: opts
                .auth
                .as_ref()
                .map(|a| a.cookie_pairs())
                .unwrap_or_default(),
            extra_headers: Vec::new(),
            page_actions: opts.page_actions.clone(),
        };
        let html = renderer.render(url, &render_opts).await?;
        return Ok(extract_article(
            &html,
            url,
            Some("playwright_forced".to_string()),
            None,
            200,
            registry,
        ));
    }

    let adaptive_opts = AdaptiveOptions {
        fetch: opts.fetch_options(proxy),
        renderer: opts.renderer(),
        page_actions: opts.page_actions.clone(),
    };
    let result = adaptive_fetch(backend.as_ref(), url, &adaptive_opts, registry).await?;

    let mut record = extract_article(
        &result.html,
        url,
        Some(result.strategy_used),
        Some(result.classification.page_type),
        200,
        registry,
    );
    let sig = &result.classification.signals;
    record.raw_metadata.classification = Some(ClassificationRecord {
        reason: result.classification.reason.clone(),
        confidence: result.classification.confidence,
        frameworks: sig.frameworks_detected.clone(),
        amp_url: sig.amp_url.clone(),
        feed_url: sig.feed_url.clone(),
        body_word_count: sig.body_word_count,
    });
    Ok(record)
}

/// Fetch `url` and return a fully-extracted [`ArticleRecord`].
///
/// With a proxy list, blocked results (and HTTP failures whose bodies
/// classify as blocked) mark the current proxy failed and rotate, up to
/// `min(5, proxies)` attempts; the last observed article is returned
/// when the budget runs out.
pub async fn fetch(url: &str, opts: &QueryOptions) -> Result<ArticleRecord, FetchError> {
    info!("fetch: {url} (render_js={})", opts.render_js);
    let registry = plugins::resolve(opts.registry.as_ref());

    if opts.proxy_list.is_empty() {
        return fetch_once(url, opts, None, &registry).await;
    }

    let mut rotator = ProxyRotator::new(ProxyConfig {
        proxies: opts.proxy_list.clone(),
        rotation: opts.proxy_rotation,
    });
    let max_attempts = if opts.retry_on_block {
        opts.proxy_list.len().min(5)
    } else {
        1
    };

    let mut last_record: Option<ArticleRecord> = None;
    let mut last_error: Option<FetchError> = None;

    for attempt in 0..max_attempts {
        let Some(proxy) = rotator.get() else {
            break;
        };

        match fetch_once(url, opts, Some(proxy.clone()), &registry).await {
            Ok(record) if !record.is_blocked => {
                rotator.mark_success(&proxy);
                return Ok(record);
            }
            Ok(record) => {
                warn!(
                    "blocked response ({}) via proxy {proxy} for {url} (attempt {})",
                    record
                        .block_type
                        .map(|b| b.as_str())
                        .unwrap_or("unknown"),
                    attempt + 1
                );
                rotator.mark_failed(&proxy);
                rotator.rotate();
                last_record = Some(record);
                if !opts.retry_on_block {
                    break;
                }
            }
            Err(e) => {
                let body_blocked = e
                    .body()
                    .map(|body| detect_block(body, url, e.status()).is_blocked)
                    .unwrap_or(false);
                if body_blocked && opts.retry_on_block {
                    warn!("block-classified HTTP failure via proxy {proxy} for {url}: {e}");
                    rotator.mark_failed(&proxy);
                    rotator.rotate();
                    last_error = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    match last_record {
        Some(record) => Ok(record),
        None => Err(last_error.unwrap_or_else(|| FetchError::Network {
            url: url.to_string(),
            reason: "proxy budget exhausted with no response".to_string(),
        })),
    }
}

// ---------------------------------------------------------------------------
// Batch & feed APIs
// ---------------------------------------------------------------------------

/// Fetch many URLs concurrently on a bounded pool, preserving input order.
pub async fn fetch_batch(
    urls: &[String],
    opts: &QueryOptions,
    max_workers: usize,
    on_error: OnError,
) -> Result<Vec<Option<ArticleRecord>>, FetchError> {
    let workers = max_workers.max(1);
    let mut results: Vec<Option<ArticleRecord>> = (0..urls.len()).map(|_| None).collect();

    let mut in_flight = stream::iter(urls.iter().cloned().enumerate())
        .map(|(idx, url)| async move { (idx, fetch(&url, opts).await) })
        .buffer_unordered(workers);

    while let Some((idx, outcome)) = in_flight.next().await {
        match outcome {
            Ok(article) => results[idx] = Some(article),
            Err(e) => {
                if on_error == OnError::Raise {
                    return Err(e);
                }
                warn!("fetch_batch: failed to fetch {}: {e}", urls[idx]);
            }
        }
    }

    if on_error == OnError::Skip {
        results.retain(Option::is_some);
    }
    Ok(results)
}

/// Fetch an RSS/Atom feed and extract each linked article (failures
/// silently skipped). Fails only when the feed itself cannot be fetched.
pub async fn fetch_feed(
    feed_url: &str,
    opts: &QueryOptions,
    max_articles: usize,
) -> Result<Vec<ArticleRecord>, FetchError> {
    let backend = opts.backend();
    let xml = crate::fetch::http_get_with(backend.as_ref(), feed_url, &opts.fetch_options(None))
        .await?;

    let entries: Vec<FeedEntry> = parse_feed(&xml, feed_url);
    if entries.is_empty() {
        warn!("fetch_feed: no entries found in feed {feed_url}");
        return Ok(Vec::new());
    }
    info!("fetch_feed: {} entries in {feed_url}", entries.len());

    let urls: Vec<String> = entries
        .into_iter()
        .take(max_articles)
        .map(|e| e.url)
        .collect();
    let articles = fetch_batch(&urls, opts, config::DEFAULT_BATCH_WORKERS, OnError::Skip).await?;
    Ok(articles.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::RawResponse;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Renderer stub so tests never launch a real browser.
    struct NoRenderer;

    #[async_trait]
    impl BrowserRenderer for NoRenderer {
        async fn render(&self, url: &str, _opts: &RenderOptions) -> Result<String, FetchError> {
            Err(FetchError::Browser {
                url: url.to_string(),
                reason: "rendering disabled in tests".to_string(),
            })
        }
    }

    fn article_page() -> String {
        let para = vec!["insight"; 40].join(" ");
        format!(
            r#"<html lang="en"><head>
            <title>Deep Learning Guide</title>
            <meta property="og:title" content="Deep Learning Guide">
            <script type="application/ld+json">{{"@type":"Article","headline":"Deep Learning Guide","author":{{"name":"R. Net"}},"datePublished":"2024-04-01T00:00:00Z"}}</script>
            </head><body><article><h1>Deep Learning Guide</h1><p>{para}</p><p>{para}</p></article></body></html>"#
        )
    }

    const CLOUDFLARE_PAGE: &str = r#"<html><head><title>Just a moment...</title></head>
        <body><script src="https://challenges.cloudflare.com/turnstile/v0/api.js"></script>
        <p>Checking your browser before accessing example com please stand by while we verify</p>
        </body></html>"#;

    #[test]
    fn parse_extracts_static_article() {
        let record = parse(&article_page(), "https://example.com/blog/deep-learning");
        assert_eq!(record.title, "Deep Learning Guide");
        assert_eq!(record.author.as_deref(), Some("R. Net"));
        assert!(!record.is_blocked);
        assert_eq!(record.block_type, None);
        assert_eq!(record.fetch_strategy.as_deref(), Some("pre_fetched"));
        assert!(record.word_count >= 80);
        assert_eq!(record.reading_time_minutes, 1);
        assert!(!record.is_empty);
        assert!(["readability", "trafilatura", "dom_heuristic"]
            .contains(&record.extraction_method_used.as_str()));
        assert!(record.confidence_score >= 0.0 && record.confidence_score <= 1.0);
        assert!(record.scraped_at.contains('T'));
    }

    #[test]
    fn parse_flags_cloudflare_challenge() {
        let record = parse(CLOUDFLARE_PAGE, "https://example.com/post");
        assert!(record.is_blocked);
        assert_eq!(record.block_type.map(|b| b.as_str()), Some("cloudflare"));
        assert!(record.block_reason.is_some());
    }

    #[test]
    fn parse_marks_empty_pages() {
        let record = parse(
            "<html><body><p>Loading...</p></body></html>",
            "https://example.com/x",
        );
        assert!(record.is_empty);
        assert!(record.is_blocked);
        assert_eq!(record.block_type.map(|b| b.as_str()), Some("empty"));
    }

    #[test]
    fn canonical_falls_back_to_request_url() {
        let record = parse("<html><body><p>hi</p></body></html>", "https://example.com/p");
        assert_eq!(record.canonical_url.as_deref(), Some("https://example.com/p"));
    }

    /// Serves the Cloudflare page through one proxy and a clean article
    /// through every other; records the proxy sequence observed.
    struct ProxySensitiveBackend {
        blocked_proxy: String,
        proxies_seen: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl HttpBackend for ProxySensitiveBackend {
        async fn get(
            &self,
            _url: &str,
            _headers: &[(String, String)],
            _timeout: Duration,
            proxy: Option<&str>,
        ) -> Result<RawResponse, FetchError> {
            self.proxies_seen
                .lock()
                .unwrap()
                .push(proxy.map(str::to_string));
            let body = if proxy == Some(self.blocked_proxy.as_str()) {
                CLOUDFLARE_PAGE.to_string()
            } else {
                article_page()
            };
            Ok(RawResponse {
                status: 200,
                headers: vec![],
                body,
            })
        }
    }

    #[tokio::test]
    async fn block_aware_retry_rotates_to_clean_proxy() {
        let backend = Arc::new(ProxySensitiveBackend {
            blocked_proxy: "http://p1:8080".to_string(),
            proxies_seen: Mutex::new(Vec::new()),
        });
        let opts = QueryOptions {
            proxy_list: vec!["http://p1:8080".to_string(), "http://p2:8080".to_string()],
            backend: Some(backend.clone()),
            registry: Some(Registry::new()),
            renderer: Some(Arc::new(NoRenderer)),
            ..QueryOptions::default()
        };

        let record = fetch("https://example.com/blog/deep-learning", &opts)
            .await
            .unwrap();
        assert!(!record.is_blocked);
        assert_eq!(record.title, "Deep Learning Guide");

        let seen = backend.proxies_seen.lock().unwrap();
        assert_eq!(seen.first().unwrap().as_deref(), Some("http://p1:8080"));
        assert_eq!(seen.last().unwrap().as_deref(), Some("http://p2:8080"));
    }

    #[tokio::test]
    async fn retry_disabled_returns_blocked_record() {
        let backend = Arc::new(ProxySensitiveBackend {
            blocked_proxy: "http://p1:8080".to_string(),
            proxies_seen: Mutex::new(Vec::new()),
        });
        let opts = QueryOptions {
            proxy_list: vec!["http://p1:8080".to_string(), "http://p2:8080".to_string()],
            retry_on_block: false,
            backend: Some(backend),
            registry: Some(Registry::new()),
            renderer: Some(Arc::new(NoRenderer)),
            ..QueryOptions::default()
        };

        let record = fetch("https://example.com/blog/deep-learning", &opts)
            .await
            .unwrap();
        assert!(record.is_blocked);
    }

    struct CountingBackend {
        fail_on: Vec<String>,
    }

    #[async_trait]
    impl HttpBackend for CountingBackend {
        async fn get(
            &self,
            url: &str,
            _headers: &[(String, String)],
            _timeout: Duration,
            _proxy: Option<&str>,
        ) -> Result<RawResponse, FetchError> {
            if self.fail_on.iter().any(|f| url.contains(f)) {
                return Ok(RawResponse {
                    status: 404,
                    headers: vec![],
                    body: "not found".to_string(),
                });
            }
            Ok(RawResponse {
                status: 200,
                headers: vec![],
                body: article_page(),
            })
        }
    }

    fn batch_opts(backend: Arc<dyn HttpBackend>) -> QueryOptions {
        QueryOptions {
            backend: Some(backend),
            registry: Some(Registry::new()),
            renderer: Some(Arc::new(NoRenderer)),
            ..QueryOptions::default()
        }
    }

    #[tokio::test]
    async fn batch_include_preserves_positions() {
        let backend = Arc::new(CountingBackend {
            fail_on: vec!["/bad".to_string()],
        });
        let urls = vec![
            "https://example.com/blog/a".to_string(),
            "https://example.com/bad".to_string(),
            "https://example.com/blog/c".to_string(),
        ];
        let results = fetch_batch(&urls, &batch_opts(backend), 4, OnError::Include)
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_some());
        assert!(results[1].is_none());
        assert!(results[2].is_some());
    }

    #[tokio::test]
    async fn batch_skip_omits_failures() {
        let backend = Arc::new(CountingBackend {
            fail_on: vec!["/bad".to_string()],
        });
        let urls = vec![
            "https://example.com/blog/a".to_string(),
            "https://example.com/bad".to_string(),
        ];
        let results = fetch_batch(&urls, &batch_opts(backend), 4, OnError::Skip)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn batch_raise_propagates_first_failure() {
        let backend = Arc::new(CountingBackend {
            fail_on: vec!["/bad".to_string()],
        });
        let urls = vec![
            "https://example.com/blog/a".to_string(),
            "https://example.com/bad".to_string(),
        ];
        let err = fetch_batch(&urls, &batch_opts(backend), 4, OnError::Raise)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 404);
    }

    struct FeedBackend;

    #[async_trait]
    impl HttpBackend for FeedBackend {
        async fn get(
            &self,
            url: &str,
            _headers: &[(String, String)],
            _timeout: Duration,
            _proxy: Option<&str>,
        ) -> Result<RawResponse, FetchError> {
            let body = if url.ends_with("/feed.xml") {
                r#"<rss><channel>
                    <item><title>A</title><link>https://example.com/blog/a</link></item>
                    <item><title>B</title><link>https://example.com/blog/b</link></item>
                    <item><title>C</title><link>https://example.com/blog/c</link></item>
                </channel></rss>"#
                    .to_string()
            } else {
                article_page()
            };
            Ok(RawResponse {
                status: 200,
                headers: vec![],
                body,
            })
        }
    }

    #[tokio::test]
    async fn feed_fetch_caps_article_count() {
        let opts = batch_opts(Arc::new(FeedBackend));
        let articles = fetch_feed("https://example.com/feed.xml", &opts, 2)
            .await
            .unwrap();
        assert_eq!(articles.len(), 2);
        assert!(articles.iter().all(|a| a.title == "Deep Learning Guide"));
    }

    #[tokio::test]
    async fn feed_parse_failure_yields_empty_list() {
        struct BadFeed;
        #[async_trait]
        impl HttpBackend for BadFeed {
            async fn get(
                &self,
                _url: &str,
                _headers: &[(String, String)],
                _timeout: Duration,
                _proxy: Option<&str>,
            ) -> Result<RawResponse, FetchError> {
                Ok(RawResponse {
                    status: 200,
                    headers: vec![],
                    body: "not xml at all <<<".to_string(),
                })
            }
        }
        let opts = batch_opts(Arc::new(BadFeed));
        let articles = fetch_feed("https://example.com/feed.xml", &opts, 10)
            .await
            .unwrap();
        assert!(articles.is_empty());
    }
}
