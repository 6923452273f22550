//! Bounded BFS crawler: sitemap and feed seeding, per-domain politeness,
//! dedup by normalized URL, conditional-request caching, and incremental
//! resume. Per-page errors never stop the crawl; they become skip
//! entries and the loop moves on.

pub mod state;

use crate::core::types::ArticleRecord;
use crate::extractors::block_detection::detect_block;
use crate::extractors::feed::{parse_feed, parse_xml};
use crate::extractors::heuristics::{self, ARTICLE_SCORE_THRESHOLD};
use crate::extractors::urlnorm::{extract_domain, is_non_content_url, normalize_url, url_to_slug};
use crate::fetch::auth::AuthSession;
use crate::fetch::browser::{renderer_available, BrowserRenderer, CdpRenderer, PageAction, RenderOptions};
use crate::fetch::rate_limit::DomainRateLimiter;
use crate::fetch::{default_backend, http_get_response, FetchError, FetchOptions, HttpBackend};
use crate::plugins::{self, Registry};
use crate::query::extract_article;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use regex::{Regex, RegexSet};
use scraper::{Html, Selector};
use state::{CrawlStore, CrawlTelemetry, HttpCacheEntry, IndexEntry, SkipEntry};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

// Queue priorities, high → low.
const PRIORITY_SITEMAP: i32 = 10;
const PRIORITY_FEED: i32 = 9;
const PRIORITY_SITEMAP_PAGE: i32 = 6;
const PRIORITY_START: i32 = 5;
const PRIORITY_NEXT_LINK: i32 = 4;
const PRIORITY_RENDER_RETRY: i32 = 3;
const PRIORITY_LINK: i32 = 0;

const SITEMAP_PROBES: &[&str] = &["/sitemap.xml", "/sitemap_index.xml", "/sitemap-index.xml"];

const FEED_PROBES: &[&str] = &[
    "/feed.xml",
    "/feed",
    "/rss.xml",
    "/rss",
    "/blog/feed",
    "/blog/feed.xml",
    "/blog/rss",
    "/blog/rss.xml",
];

// Purely technical paths that never contain articles and are not worth
// crawling even for link discovery.
static HARD_EXCLUDE_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)/_next/static/",
        r"(?i)/cdn-cgi/",
        r"(?i)/wp-content/uploads/",
        r"(?i)/__webpack",
        r"(?i)/wp-json/",
        r"(?i)/wp-admin/",
        r"(?i)/xmlrpc\.php",
        r"(?i)\.amp(\?|$)",
    ])
    .unwrap()
});

static ANCHOR_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());
static NEXT_LINK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"link[rel~="next"]"#).unwrap());
static ALTERNATE_FEED_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"link[rel~="alternate"]"#).unwrap());

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("invalid crawl configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// When to hand pages to the headless renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderJsMode {
    #[default]
    Auto,
    Always,
    Never,
}

impl std::str::FromStr for RenderJsMode {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(RenderJsMode::Auto),
            "always" => Ok(RenderJsMode::Always),
            "never" => Ok(RenderJsMode::Never),
            other => Err(CrawlError::InvalidConfig(format!(
                "render_js must be auto|always|never, got {other:?}"
            ))),
        }
    }
}

/// Crawl parameters. `Default` gives the stock bounded crawl; set
/// `out_dir` to persist state and enable `resume`/`delta`.
#[derive(Clone)]
pub struct CrawlConfig {
    pub start_url: String,
    pub max_pages: usize,
    pub max_depth: usize,
    pub render_js: RenderJsMode,
    pub include_regex: Option<String>,
    pub exclude_regex: Option<String>,
    pub allow_subdomains: bool,
    pub extra_domains: Vec<String>,
    pub resume: bool,
    /// Conditional-request caching (ETag / Last-Modified).
    pub delta: bool,
    pub auth: Option<Arc<AuthSession>>,
    pub concurrent_requests: usize,
    pub per_domain_limit: usize,
    /// Base inter-request delay per domain, in seconds.
    pub download_delay: f64,
    pub page_actions: Option<Vec<PageAction>>,
    pub out_dir: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub timeout: Option<Duration>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            start_url: String::new(),
            max_pages: 500,
            max_depth: 10,
            render_js: RenderJsMode::Auto,
            include_regex: None,
            exclude_regex: None,
            allow_subdomains: false,
            extra_domains: Vec::new(),
            resume: false,
            delta: false,
            auth: None,
            concurrent_requests: 8,
            per_domain_limit: 4,
            download_delay: 1.0,
            page_actions: None,
            out_dir: None,
            user_agent: None,
            timeout: None,
        }
    }
}

/// Everything a finished crawl hands back.
pub struct CrawlReport {
    pub articles: Vec<ArticleRecord>,
    pub skipped: Vec<SkipEntry>,
    pub telemetry: CrawlTelemetry,
}

// ---------------------------------------------------------------------------
// Queue plumbing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum WorkItem {
    Sitemap { url: String },
    Feed { url: String },
    Page { url: String, depth: usize, rendered: bool },
}

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    seq: Reverse<u64>,
    item: WorkItem,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.priority, &self.seq).cmp(&(other.priority, &other.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// URLs surfaced while processing one item; vetted and enqueued by the
/// single-threaded merge step.
enum Discovered {
    Page { url: String, depth: usize, priority: i32 },
    RenderRetry { url: String, depth: usize },
    Feed { url: String },
    Sitemap { url: String },
}

struct ItemOutcome {
    article: Option<ArticleRecord>,
    skip: Option<SkipEntry>,
    discovered: Vec<Discovered>,
    response_status: Option<u16>,
    response_bytes: u64,
    latency: Option<Duration>,
    error: bool,
    block_type: Option<String>,
    cache_update: Option<(String, HttpCacheEntry)>,
}

impl ItemOutcome {
    fn empty() -> Self {
        Self {
            article: None,
            skip: None,
            discovered: Vec::new(),
            response_status: None,
            response_bytes: 0,
            latency: None,
            error: false,
            block_type: None,
            cache_update: None,
        }
    }
}

fn skip_entry(url: &str, reason: impl Into<String>) -> SkipEntry {
    SkipEntry {
        url: url.to_string(),
        reason: reason.into(),
        timestamp: Utc::now().to_rfc3339(),
    }
}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

pub struct Crawler {
    config: CrawlConfig,
    include_re: Option<Regex>,
    exclude_re: Option<Regex>,
    allowed_domains: Vec<String>,
    registry: Registry,
    backend: Arc<dyn HttpBackend>,
    renderer: Option<Arc<dyn BrowserRenderer>>,
    rate_limiter: Arc<DomainRateLimiter>,
    store: Option<CrawlStore>,
    domain_slots: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Crawler {
    pub fn new(config: CrawlConfig) -> Result<Self, CrawlError> {
        Self::with_parts(config, None, None, None)
    }

    /// Constructor-injected collaborators for embedding and tests.
    pub fn with_parts(
        config: CrawlConfig,
        backend: Option<Arc<dyn HttpBackend>>,
        renderer: Option<Arc<dyn BrowserRenderer>>,
        registry: Option<Registry>,
    ) -> Result<Self, CrawlError> {
        let start = Url::parse(&config.start_url)
            .map_err(|e| CrawlError::InvalidConfig(format!("bad start_url: {e}")))?;
        let host = start
            .host_str()
            .ok_or_else(|| CrawlError::InvalidConfig("start_url has no host".to_string()))?
            .to_ascii_lowercase();

        let mut allowed_domains = vec![host];
        allowed_domains.extend(config.extra_domains.iter().map(|d| d.to_ascii_lowercase()));

        let include_re = config
            .include_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| CrawlError::InvalidConfig(format!("bad include_regex: {e}")))?;
        let exclude_re = config
            .exclude_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| CrawlError::InvalidConfig(format!("bad exclude_regex: {e}")))?;

        let rate = if config.download_delay > 0.0 {
            1.0 / config.download_delay
        } else {
            1000.0
        };
        let rate_limiter = Arc::new(
            DomainRateLimiter::new(rate)
                .map_err(|e| CrawlError::InvalidConfig(e.to_string()))?,
        );

        let store = config
            .out_dir
            .as_ref()
            .map(CrawlStore::open)
            .transpose()?;

        let renderer = renderer.or_else(|| {
            if config.render_js == RenderJsMode::Never {
                None
            } else if renderer_available() {
                Some(Arc::new(CdpRenderer::new()) as Arc<dyn BrowserRenderer>)
            } else {
                None
            }
        });

        Ok(Self {
            config,
            include_re,
            exclude_re,
            allowed_domains,
            registry: registry.unwrap_or_else(|| plugins::resolve(None)),
            backend: backend.unwrap_or_else(|| default_backend()),
            renderer,
            rate_limiter,
            store,
            domain_slots: Mutex::new(HashMap::new()),
        })
    }

    fn fetch_options(&self, extra_headers: Vec<(String, String)>) -> FetchOptions {
        FetchOptions {
            timeout: self.config.timeout,
            user_agent: Some(
                self.config
                    .user_agent
                    .clone()
                    .unwrap_or_else(|| crate::fetch::antibot::random_user_agent().to_string()),
            ),
            max_retries: None,
            proxy: None,
            auth: self.config.auth.clone(),
            rate_limiter: Some(self.rate_limiter.clone()),
            extra_headers,
        }
    }

    fn domain_slot(&self, url: &str) -> Arc<Semaphore> {
        let domain = extract_domain(url);
        let mut slots = match self.domain_slots.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        slots
            .entry(domain)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_domain_limit.max(1))))
            .clone()
    }

    /// Minimal crawl filter: scheme, domain, assets, hard excludes, and
    /// the user exclude regex. Article-vs-navigation decisions belong to
    /// the scorer, so tag/archive pages stay crawlable for their links.
    fn crawlable(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }

        let host = parsed.host_str().unwrap_or("").to_ascii_lowercase();
        let host_ok = self.allowed_domains.iter().any(|d| {
            host == *d || (self.config.allow_subdomains && host.ends_with(&format!(".{d}")))
        });
        if !host_ok {
            return false;
        }

        if is_non_content_url(url) {
            return false;
        }
        if HARD_EXCLUDE_PATTERNS.is_match(parsed.path()) {
            return false;
        }
        if let Some(exclude) = &self.exclude_re {
            if exclude.is_match(url) {
                return false;
            }
        }
        true
    }

    /// The include regex restricts extraction only, never link discovery.
    fn should_extract(&self, url: &str) -> bool {
        self.include_re
            .as_ref()
            .map(|re| re.is_match(url))
            .unwrap_or(true)
    }

    // -----------------------------------------------------------------
    // Item processing (runs concurrently)
    // -----------------------------------------------------------------

    async fn process_sitemap(&self, url: &str) -> ItemOutcome {
        let mut outcome = ItemOutcome::empty();
        let started = Instant::now();

        let response = match http_get_response(
            self.backend.as_ref(),
            url,
            &self.fetch_options(Vec::new()),
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!("sitemap fetch failed (expected when absent) {url}: {e}");
                return outcome;
            }
        };
        outcome.latency = Some(started.elapsed());
        outcome.response_status = Some(response.status);
        outcome.response_bytes = response.body.len() as u64;

        if response.status != 200 {
            return outcome;
        }
        let Some(root) = parse_xml(&response.body) else {
            debug!("sitemap at {url} is not valid XML");
            return outcome;
        };

        let is_index = root.local_name().contains("sitemapindex");
        let mut locs = Vec::new();
        root.walk(&mut |el| {
            if el.local_name() == "loc" {
                if let Some(text) = el.text_trimmed() {
                    locs.push(text);
                }
            }
        });

        for loc in locs {
            if is_index {
                outcome.discovered.push(Discovered::Sitemap { url: loc });
            } else {
                outcome.discovered.push(Discovered::Page {
                    url: loc,
                    depth: 0,
                    priority: PRIORITY_SITEMAP_PAGE,
                });
            }
        }
        outcome
    }

    async fn process_feed(&self, url: &str) -> ItemOutcome {
        let mut outcome = ItemOutcome::empty();
        let started = Instant::now();

        let body = match crate::fetch::http_get_with(
            self.backend.as_ref(),
            url,
            &self.fetch_options(Vec::new()),
        )
        .await
        {
            Ok(b) => b,
            Err(e) => {
                debug!("feed fetch failed (expected when absent) {url}: {e}");
                return outcome;
            }
        };
        outcome.latency = Some(started.elapsed());
        outcome.response_status = Some(200);
        outcome.response_bytes = body.len() as u64;

        for entry in parse_feed(&body, url) {
            outcome.discovered.push(Discovered::Page {
                url: entry.url,
                depth: 0,
                priority: PRIORITY_SITEMAP_PAGE,
            });
        }
        outcome
    }

    async fn render_page(&self, url: &str) -> Result<String, FetchError> {
        let renderer = self.renderer.as_ref().ok_or_else(|| FetchError::Browser {
            url: url.to_string(),
            reason: "no browser renderer available".to_string(),
        })?;
        let opts = RenderOptions {
            timeout: self.config.timeout,
            proxy: None,
            user_agent: self.config.user_agent.clone(),
            cookies: self
                .config
                .auth
                .as_ref()
                .map(|a| a.cookie_pairs())
                .unwrap_or_default(),
            extra_headers: Vec::new(),
            page_actions: self.config.page_actions.clone(),
        };
        renderer.render(url, &opts).await
    }

    async fn process_page(
        &self,
        url: &str,
        depth: usize,
        rendered: bool,
        cache_entry: Option<HttpCacheEntry>,
    ) -> ItemOutcome {
        let mut outcome = ItemOutcome::empty();
        let started = Instant::now();

        let html: String;

        if rendered {
            // Rendered requests go straight to the browser capability.
            match self.render_page(url).await {
                Ok(body) => html = body,
                Err(e) => {
                    warn!("render failed for {url}: {e}");
                    outcome.error = true;
                    outcome.skip = Some(skip_entry(url, format!("render_error ({e})")));
                    return outcome;
                }
            }
            outcome.latency = Some(started.elapsed());
            outcome.response_status = Some(200);
            outcome.response_bytes = html.len() as u64;
        } else {
            let mut extra_headers = Vec::new();
            if let Some(entry) = &cache_entry {
                if let Some(etag) = &entry.etag {
                    extra_headers.push(("If-None-Match".to_string(), etag.clone()));
                }
                if let Some(lm) = &entry.last_modified {
                    extra_headers.push(("If-Modified-Since".to_string(), lm.clone()));
                }
            }

            let response = match http_get_response(
                self.backend.as_ref(),
                url,
                &self.fetch_options(extra_headers),
            )
            .await
            {
                Ok(r) => r,
                Err(e) => {
                    outcome.error = true;
                    outcome.response_status = (e.status() > 0).then(|| e.status());
                    outcome.skip = Some(skip_entry(url, format!("fetch_error ({e})")));
                    return outcome;
                }
            };
            outcome.latency = Some(started.elapsed());
            outcome.response_status = Some(response.status);
            outcome.response_bytes = response.body.len() as u64;

            if response.status == 304 {
                outcome.skip = Some(skip_entry(url, "not_modified_304"));
                return outcome;
            }
            if response.status != 200 {
                outcome.skip = Some(skip_entry(url, format!("http_status_{}", response.status)));
                return outcome;
            }

            let content_type = response
                .header("content-type")
                .map(|v| v.to_ascii_lowercase());
            if let Some(ct) = &content_type {
                if !ct.is_empty() && !ct.contains("html") {
                    outcome.skip =
                        Some(skip_entry(url, format!("non_html_content_type ({ct})")));
                    return outcome;
                }
            }

            if self.config.delta {
                let etag = response.header("etag").map(str::to_string);
                let last_modified = response.header("last-modified").map(str::to_string);
                if etag.is_some() || last_modified.is_some() {
                    outcome.cache_update = Some((
                        normalize_url(url),
                        HttpCacheEntry {
                            etag,
                            last_modified,
                        },
                    ));
                }
            }

            html = response.body;

            // Hand JS-dependent pages to the renderer and come back.
            if self.config.render_js == RenderJsMode::Auto
                && self.renderer.is_some()
                && heuristics::needs_js(&html, 100)
            {
                debug!("re-enqueueing {url} for headless render");
                outcome.discovered.push(Discovered::RenderRetry {
                    url: url.to_string(),
                    depth,
                });
                return outcome;
            }
        }

        let block = detect_block(&html, url, outcome.response_status.unwrap_or(200));
        if block.is_blocked {
            outcome.block_type = block.block_type.map(|b| b.as_str().to_string());
        }

        // One parse shared by scoring and link discovery.
        let document = Html::parse_document(&html);

        let mut score = heuristics::article_score(url, &html);
        for scorer in self.registry.scorers() {
            score = scorer.score(url, &html, score);
        }
        debug!("article score={score} for {url}");

        if score >= ARTICLE_SCORE_THRESHOLD && self.should_extract(url) {
            let strategy = if rendered { "playwright" } else { "static" };
            let article = extract_article(
                &html,
                url,
                Some(strategy.to_string()),
                None,
                outcome.response_status.unwrap_or(200),
                &self.registry,
            );
            if article.word_count < 10 {
                outcome.skip = Some(skip_entry(url, "extraction_returned_empty"));
            } else {
                outcome.article = Some(article);
            }
        } else {
            let reason = if !self.should_extract(url) {
                "include_regex_mismatch".to_string()
            } else {
                format!("low_article_score ({score})")
            };
            outcome.skip = Some(skip_entry(url, reason));
        }

        // Link discovery.
        if depth < self.config.max_depth {
            let base = Url::parse(url).ok();

            for link in document.select(&NEXT_LINK_SELECTOR) {
                if let Some(href) = link.value().attr("href") {
                    if let Some(resolved) = resolve_href(base.as_ref(), href) {
                        outcome.discovered.push(Discovered::Page {
                            url: resolved,
                            depth: depth + 1,
                            priority: PRIORITY_NEXT_LINK,
                        });
                    }
                }
            }

            for link in document.select(&ALTERNATE_FEED_SELECTOR) {
                let ltype = link.value().attr("type").unwrap_or("").to_ascii_lowercase();
                if ltype.contains("rss") || ltype.contains("atom") {
                    if let Some(href) = link.value().attr("href") {
                        if let Some(resolved) = resolve_href(base.as_ref(), href) {
                            outcome.discovered.push(Discovered::Feed { url: resolved });
                        }
                    }
                }
            }

            for anchor in document.select(&ANCHOR_SELECTOR) {
                let href = anchor.value().attr("href").map(str::trim).unwrap_or("");
                if href.is_empty() {
                    continue;
                }
                if let Some(resolved) = resolve_href(base.as_ref(), href) {
                    outcome.discovered.push(Discovered::Page {
                        url: resolved,
                        depth: depth + 1,
                        priority: PRIORITY_LINK,
                    });
                }
            }
        }

        outcome
    }

    async fn process_item(
        &self,
        item: WorkItem,
        cache_entry: Option<HttpCacheEntry>,
    ) -> ItemOutcome {
        let url = match &item {
            WorkItem::Sitemap { url } | WorkItem::Feed { url } | WorkItem::Page { url, .. } => {
                url.clone()
            }
        };
        let slot = self.domain_slot(&url);
        let _permit = slot.acquire().await;

        match item {
            WorkItem::Sitemap { url } => self.process_sitemap(&url).await,
            WorkItem::Feed { url } => self.process_feed(&url).await,
            WorkItem::Page {
                url,
                depth,
                rendered,
            } => self.process_page(&url, depth, rendered, cache_entry).await,
        }
    }

    // -----------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------

    /// Run the crawl to completion and return everything it produced.
    pub async fn crawl(&self) -> Result<CrawlReport, CrawlError> {
        let started = Instant::now();
        info!(
            "starting crawl of {} (max_pages: {}, max_depth: {})",
            self.config.start_url, self.config.max_pages, self.config.max_depth
        );

        let mut seen: HashSet<String> = HashSet::new();
        let mut http_cache: HashMap<String, HttpCacheEntry> = HashMap::new();

        if let Some(store) = &self.store {
            if self.config.resume {
                seen.extend(store.load_seen());
                seen.extend(store.load_index_urls().iter().map(|u| normalize_url(u)));
                info!("resume: preloaded {} seen URLs", seen.len());
            } else {
                store.clear_skips();
            }
            if self.config.delta {
                http_cache = store.load_http_cache();
            }
        }

        let mut queue: BinaryHeap<QueueEntry> = BinaryHeap::new();
        let mut seq: u64 = 0;
        let push = |queue: &mut BinaryHeap<QueueEntry>, seq: &mut u64, priority, item| {
            *seq += 1;
            queue.push(QueueEntry {
                priority,
                seq: Reverse(*seq),
                item,
            });
        };

        // Seeding: sitemap probes, feed probes, then the start URL.
        let start = Url::parse(&self.config.start_url)
            .map_err(|e| CrawlError::InvalidConfig(format!("bad start_url: {e}")))?;
        let origin = format!(
            "{}://{}",
            start.scheme(),
            start.host_str().unwrap_or_default()
        );
        for probe in SITEMAP_PROBES {
            push(
                &mut queue,
                &mut seq,
                PRIORITY_SITEMAP,
                WorkItem::Sitemap {
                    url: format!("{origin}{probe}"),
                },
            );
        }
        for probe in FEED_PROBES {
            push(
                &mut queue,
                &mut seq,
                PRIORITY_FEED,
                WorkItem::Feed {
                    url: format!("{origin}{probe}"),
                },
            );
        }

        let mut pages_reserved: usize = 0;
        let start_norm = normalize_url(&self.config.start_url);
        if !seen.contains(&start_norm) {
            seen.insert(start_norm.clone());
            if let Some(store) = &self.store {
                store.append_seen(&start_norm);
            }
            pages_reserved += 1;
            push(
                &mut queue,
                &mut seq,
                PRIORITY_START,
                WorkItem::Page {
                    url: self.config.start_url.clone(),
                    depth: 0,
                    rendered: self.config.render_js == RenderJsMode::Always,
                },
            );
        }

        let mut feeds_seen: HashSet<String> = HashSet::new();
        let mut sitemaps_seen: HashSet<String> = HashSet::new();
        let mut extracted_slugs: HashSet<String> = HashSet::new();

        let mut articles: Vec<ArticleRecord> = Vec::new();
        let mut index_entries: Vec<IndexEntry> = self
            .store
            .as_ref()
            .map(|s| s.load_index())
            .unwrap_or_default();
        if self.config.resume {
            extracted_slugs.extend(index_entries.iter().map(|e| e.slug.clone()));
        } else {
            index_entries.clear();
        }
        let mut skipped: Vec<SkipEntry> = Vec::new();

        let mut telemetry = CrawlTelemetry::default();
        let mut total_latency = Duration::ZERO;
        let mut latency_samples: u64 = 0;

        // Cooperative waves: drain a batch, fan out, merge discoveries.
        while !queue.is_empty() {
            let batch_size = self.config.concurrent_requests.max(1) * 2;
            let mut batch: Vec<QueueEntry> = Vec::with_capacity(batch_size);
            while batch.len() < batch_size {
                match queue.pop() {
                    Some(entry) => batch.push(entry),
                    None => break,
                }
            }

            let outcomes: Vec<ItemOutcome> = stream::iter(batch.into_iter().map(|entry| {
                let cache_entry = match &entry.item {
                    WorkItem::Page { url, rendered, .. } if self.config.delta && !rendered => {
                        http_cache.get(&normalize_url(url)).cloned()
                    }
                    _ => None,
                };
                self.process_item(entry.item, cache_entry)
            }))
            .buffer_unordered(self.config.concurrent_requests.max(1))
            .collect()
            .await;

            for outcome in outcomes {
                // Telemetry first.
                if let Some(status) = outcome.response_status {
                    telemetry.responses += 1;
                    *telemetry.status_counts.entry(status).or_insert(0) += 1;
                }
                if outcome.error {
                    telemetry.errors += 1;
                }
                telemetry.bytes += outcome.response_bytes;
                if let Some(latency) = outcome.latency {
                    total_latency += latency;
                    latency_samples += 1;
                }
                if let Some(block) = outcome.block_type {
                    *telemetry.block_counts.entry(block).or_insert(0) += 1;
                }

                if let Some((key, entry)) = outcome.cache_update {
                    http_cache.insert(key, entry);
                }

                if let Some(article) = outcome.article {
                    let mut slug = url_to_slug(&article.url, 100);
                    let mut n = 2;
                    while !extracted_slugs.insert(slug.clone()) {
                        slug = format!("{}-{n}", url_to_slug(&article.url, 100));
                        n += 1;
                    }
                    index_entries.push(IndexEntry::from_article(&slug, &article));
                    telemetry.articles += 1;
                    articles.push(article);
                }

                if let Some(skip) = outcome.skip {
                    if let Some(store) = &self.store {
                        store.append_skip(&skip);
                    }
                    skipped.push(skip);
                }

                // Merge discoveries: dedup, filter, and reserve budget in
                // one single-threaded pass.
                for discovered in outcome.discovered {
                    match discovered {
                        Discovered::Sitemap { url } => {
                            if sitemaps_seen.insert(url.clone()) {
                                push(&mut queue, &mut seq, PRIORITY_SITEMAP, WorkItem::Sitemap { url });
                            }
                        }
                        Discovered::Feed { url } => {
                            if feeds_seen.insert(url.clone()) {
                                push(&mut queue, &mut seq, PRIORITY_FEED, WorkItem::Feed { url });
                            }
                        }
                        Discovered::RenderRetry { url, depth } => {
                            // Slot was reserved when first enqueued.
                            push(
                                &mut queue,
                                &mut seq,
                                PRIORITY_RENDER_RETRY,
                                WorkItem::Page {
                                    url,
                                    depth,
                                    rendered: true,
                                },
                            );
                        }
                        Discovered::Page {
                            url,
                            depth,
                            priority,
                        } => {
                            if pages_reserved >= self.config.max_pages {
                                continue;
                            }
                            let norm = normalize_url(&url);
                            if seen.contains(&norm) {
                                continue;
                            }
                            if !self.crawlable(&url) {
                                continue;
                            }
                            seen.insert(norm.clone());
                            if let Some(store) = &self.store {
                                store.append_seen(&norm);
                            }
                            pages_reserved += 1;
                            push(
                                &mut queue,
                                &mut seq,
                                priority,
                                WorkItem::Page {
                                    url,
                                    depth,
                                    rendered: self.config.render_js == RenderJsMode::Always,
                                },
                            );
                        }
                    }
                }
            }
        }

        // Close out: persist state and emit the summary.
        telemetry.reason = "finished".to_string();
        telemetry.elapsed_sec = started.elapsed().as_secs_f64();
        if telemetry.elapsed_sec > 0.0 {
            telemetry.responses_per_sec = telemetry.responses as f64 / telemetry.elapsed_sec;
        }
        if latency_samples > 0 {
            telemetry.avg_latency_ms =
                total_latency.as_millis() as f64 / latency_samples as f64;
        }
        if telemetry.responses > 0 {
            let blocked: u64 = telemetry.block_counts.values().sum();
            telemetry.block_rate = blocked as f64 / telemetry.responses as f64;
        }

        if let Some(store) = &self.store {
            store.save_index(&index_entries);
            if self.config.delta {
                store.save_http_cache(&http_cache);
            }
            store.save_telemetry(&telemetry);
        }

        info!(
            "crawl closed ({}): crawled={} articles={} skipped={}",
            telemetry.reason,
            telemetry.responses,
            articles.len(),
            skipped.len()
        );

        Ok(CrawlReport {
            articles,
            skipped,
            telemetry,
        })
    }
}

fn resolve_href(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let lower = href.to_ascii_lowercase();
    if lower.starts_with("javascript:")
        || lower.starts_with("mailto:")
        || lower.starts_with("tel:")
        || lower.starts_with("data:")
        || lower.starts_with("sms:")
    {
        return None;
    }
    match base {
        Some(b) => b.join(href).ok().map(|u| u.to_string()),
        None => Url::parse(href).ok().map(|u| u.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::RawResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn scratch_dir(tag: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("pagemill-crawl-{tag}-{}-{n}", std::process::id()))
    }

    fn article_body(title: &str, words: usize) -> String {
        let para = vec!["substance"; words / 2].join(" ");
        format!(
            r#"<html lang="en"><head><title>{title}</title>
            <meta name="author" content="Crawl Writer">
            <meta property="article:published_time" content="2024-02-02">
            <script type="application/ld+json">{{"@type":"BlogPosting","headline":"{title}"}}</script>
            </head><body><h1>{title}</h1><p>{para}</p><p>{para}</p></body></html>"#
        )
    }

    /// Small in-memory site with a hub page linking to two articles.
    struct SiteBackend {
        requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl SiteBackend {
        fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requested_urls(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|(u, _)| u.clone())
                .collect()
        }
    }

    #[async_trait]
    impl HttpBackend for SiteBackend {
        async fn get(
            &self,
            url: &str,
            headers: &[(String, String)],
            _timeout: Duration,
            _proxy: Option<&str>,
        ) -> Result<RawResponse, FetchError> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), headers.to_vec()));

            let path = Url::parse(url).unwrap().path().to_string();
            let (status, body, extra): (u16, String, Vec<(String, String)>) = match path.as_str() {
                "/" => (
                    200,
                    r#"<html><head><title>Hub</title></head><body>
                        <a href="/blog/first-post">First</a>
                        <a href="/blog/second-post">Second</a>
                        <a href="/tag/rust">Tag page</a>
                        <a href="/blog/first-post?utm_source=x">Dup with tracking</a>
                        <a href="https://other.example.org/offsite">Offsite</a>
                        <a href="/assets/logo.png">Logo</a>
                    </body></html>"#
                        .to_string(),
                    vec![],
                ),
                "/blog/first-post" => (
                    200,
                    article_body("First Post", 400),
                    vec![("ETag".to_string(), "\"v1\"".to_string())],
                ),
                "/blog/second-post" => (200, article_body("Second Post", 380), vec![]),
                "/tag/rust" => (
                    200,
                    r#"<html><head><title>Tag</title></head><body>
                        <a href="/blog/third-post">Third</a>
                    </body></html>"#
                        .to_string(),
                    vec![],
                ),
                "/blog/third-post" => (200, article_body("Third Post", 350), vec![]),
                _ => (404, "not found".to_string(), vec![]),
            };

            // Conditional request support for the delta test.
            if path == "/blog/first-post"
                && headers
                    .iter()
                    .any(|(k, v)| k == "If-None-Match" && v == "\"v1\"")
            {
                return Ok(RawResponse {
                    status: 304,
                    headers: vec![],
                    body: String::new(),
                });
            }

            Ok(RawResponse {
                status,
                headers: extra,
                body,
            })
        }
    }

    fn test_config(start: &str) -> CrawlConfig {
        CrawlConfig {
            start_url: start.to_string(),
            max_pages: 50,
            max_depth: 3,
            render_js: RenderJsMode::Never,
            download_delay: 0.001,
            ..CrawlConfig::default()
        }
    }

    fn crawler_with(backend: Arc<SiteBackend>, config: CrawlConfig) -> Crawler {
        Crawler::with_parts(config, Some(backend), None, Some(Registry::new())).unwrap()
    }

    #[tokio::test]
    async fn crawl_discovers_and_extracts_articles() {
        let backend = Arc::new(SiteBackend::new());
        let crawler = crawler_with(backend.clone(), test_config("https://site.example.com/"));
        let report = crawler.crawl().await.unwrap();

        let titles: Vec<&str> = report.articles.iter().map(|a| a.title.as_str()).collect();
        assert!(titles.contains(&"First Post"));
        assert!(titles.contains(&"Second Post"));
        // Reached through the tag page even though the tag page itself is
        // never extracted.
        assert!(titles.contains(&"Third Post"));

        // The hub and tag pages become skips, not articles.
        assert!(report
            .skipped
            .iter()
            .any(|s| s.reason.starts_with("low_article_score")));

        // Offsite and asset links never fetched.
        let urls = backend.requested_urls();
        assert!(!urls.iter().any(|u| u.contains("other.example.org")));
        assert!(!urls.iter().any(|u| u.contains("logo.png")));

        assert_eq!(report.telemetry.articles, 3);
        assert!(report.telemetry.responses > 0);
        assert_eq!(report.telemetry.reason, "finished");
    }

    #[tokio::test]
    async fn tracking_params_do_not_defeat_dedup() {
        let backend = Arc::new(SiteBackend::new());
        let crawler = crawler_with(backend.clone(), test_config("https://site.example.com/"));
        let report = crawler.crawl().await.unwrap();

        let first_fetches = backend
            .requested_urls()
            .iter()
            .filter(|u| u.contains("first-post"))
            .count();
        assert_eq!(first_fetches, 1);
        assert_eq!(report.articles.len(), 3);
    }

    #[tokio::test]
    async fn max_pages_caps_enqueueing() {
        let backend = Arc::new(SiteBackend::new());
        let mut config = test_config("https://site.example.com/");
        config.max_pages = 2;
        let crawler = crawler_with(backend, config);
        let report = crawler.crawl().await.unwrap();

        // Start page plus one discovered page.
        let page_responses: u64 = report
            .telemetry
            .status_counts
            .iter()
            .filter(|(status, _)| **status != 404)
            .map(|(_, n)| *n)
            .sum();
        assert!(page_responses <= 2);
    }

    #[tokio::test]
    async fn include_regex_limits_extraction_but_not_traversal() {
        let backend = Arc::new(SiteBackend::new());
        let mut config = test_config("https://site.example.com/");
        config.include_regex = Some("third-post".to_string());
        let crawler = crawler_with(backend, config);
        let report = crawler.crawl().await.unwrap();

        let titles: Vec<&str> = report.articles.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, vec!["Third Post"]);
        assert!(report
            .skipped
            .iter()
            .any(|s| s.reason == "include_regex_mismatch"));
    }

    #[tokio::test]
    async fn exclude_regex_blocks_traversal() {
        let backend = Arc::new(SiteBackend::new());
        let mut config = test_config("https://site.example.com/");
        config.exclude_regex = Some("/tag/".to_string());
        let crawler = crawler_with(backend.clone(), config);
        let report = crawler.crawl().await.unwrap();

        // The tag page is never crawled, so third-post is unreachable.
        let titles: Vec<&str> = report.articles.iter().map(|a| a.title.as_str()).collect();
        assert!(!titles.contains(&"Third Post"));
        assert!(!backend.requested_urls().iter().any(|u| u.contains("/tag/")));
    }

    #[tokio::test]
    async fn resume_skips_previously_seen_pages() {
        let dir = scratch_dir("resume");

        let backend = Arc::new(SiteBackend::new());
        let mut config = test_config("https://site.example.com/");
        config.out_dir = Some(dir.clone());
        let crawler = crawler_with(backend, config);
        let first = crawler.crawl().await.unwrap();
        assert_eq!(first.articles.len(), 3);

        let backend2 = Arc::new(SiteBackend::new());
        let mut config2 = test_config("https://site.example.com/");
        config2.out_dir = Some(dir.clone());
        config2.resume = true;
        let crawler2 = crawler_with(backend2.clone(), config2);
        let second = crawler2.crawl().await.unwrap();

        // Everything was seen before; no pages re-fetched, no articles.
        assert!(second.articles.is_empty());
        assert!(!backend2
            .requested_urls()
            .iter()
            .any(|u| u.contains("first-post")));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn delta_sends_conditional_headers_on_second_run() {
        let dir = scratch_dir("delta");

        let backend = Arc::new(SiteBackend::new());
        let mut config = test_config("https://site.example.com/");
        config.out_dir = Some(dir.clone());
        config.delta = true;
        let crawler = crawler_with(backend, config.clone());
        crawler.crawl().await.unwrap();

        // Second, non-resume run re-crawls but sends validators.
        let backend2 = Arc::new(SiteBackend::new());
        let crawler2 = crawler_with(backend2.clone(), config);
        let second = crawler2.crawl().await.unwrap();

        let requests = backend2.requests.lock().unwrap();
        let conditional = requests.iter().find(|(u, h)| {
            u.contains("first-post") && h.iter().any(|(k, _)| k == "If-None-Match")
        });
        assert!(conditional.is_some());
        drop(requests);
        assert!(second
            .skipped
            .iter()
            .any(|s| s.reason == "not_modified_304"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn invalid_start_url_is_a_config_error() {
        let config = CrawlConfig {
            start_url: "not a url".to_string(),
            ..CrawlConfig::default()
        };
        assert!(matches!(
            Crawler::new(config),
            Err(CrawlError::InvalidConfig(_))
        ));
    }

    #[test]
    fn crawlable_rules() {
        let config = test_config("https://site.example.com/");
        let crawler = Crawler::with_parts(
            config,
            Some(Arc::new(SiteBackend::new())),
            None,
            Some(Registry::new()),
        )
        .unwrap();

        assert!(crawler.crawlable("https://site.example.com/blog/post"));
        assert!(!crawler.crawlable("https://elsewhere.org/blog/post"));
        assert!(!crawler.crawlable("https://site.example.com/image.png"));
        assert!(!crawler.crawlable("https://site.example.com/wp-admin/options.php"));
        assert!(!crawler.crawlable("ftp://site.example.com/file"));
        // Subdomains rejected unless allowed.
        assert!(!crawler.crawlable("https://docs.site.example.com/x"));
    }

    #[test]
    fn subdomains_allowed_when_configured() {
        let mut config = test_config("https://site.example.com/");
        config.allow_subdomains = true;
        let crawler = Crawler::with_parts(
            config,
            Some(Arc::new(SiteBackend::new())),
            None,
            Some(Registry::new()),
        )
        .unwrap();
        assert!(crawler.crawlable("https://docs.site.example.com/x"));
    }

    #[test]
    fn render_mode_parses() {
        assert_eq!("auto".parse::<RenderJsMode>().unwrap(), RenderJsMode::Auto);
        assert!("sometimes".parse::<RenderJsMode>().is_err());
    }
}
