//! Headless-browser rendering capability.
//!
//! The core depends only on the [`BrowserRenderer`] trait and the
//! [`PageAction`] vocabulary; the default implementation drives a native
//! Chromium-family browser over CDP via `chromiumoxide`. Launched
//! browsers are pooled per `(user_agent, proxy, extra_headers)`
//! fingerprint with LRU eviction so repeat renders skip startup cost.

use crate::core::config;
use crate::fetch::FetchError;
use async_trait::async_trait;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One step of the renderer's wait protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageAction {
    /// Navigate and wait for the load event (timeout tolerated).
    WaitLoad,
    /// Wait for the network to go quiet, up to `max_ms`.
    WaitNetworkIdle { max_ms: u64 },
    /// Wait until the body carries at least `min_tokens` whitespace
    /// tokens, up to `max_ms`.
    WaitTextReached { min_tokens: usize, max_ms: u64 },
    /// Click/toggle collapsed containers so hidden content enters the DOM.
    ExpandCollapsibles,
}

/// The standard four-phase wait.
pub fn default_page_actions() -> Vec<PageAction> {
    vec![
        PageAction::WaitLoad,
        PageAction::WaitNetworkIdle { max_ms: 12_000 },
        PageAction::WaitTextReached {
            min_tokens: 50,
            max_ms: 12_000,
        },
        PageAction::ExpandCollapsibles,
    ]
}

#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    pub timeout: Option<Duration>,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub cookies: Vec<(String, String)>,
    pub extra_headers: Vec<(String, String)>,
    /// `None` runs the default four-phase wait.
    pub page_actions: Option<Vec<PageAction>>,
}

/// Capability seam for JS rendering. Implementations must honour the
/// [`PageAction`] sequence and fail on empty rendered content.
#[async_trait]
pub trait BrowserRenderer: Send + Sync {
    async fn render(&self, url: &str, opts: &RenderOptions) -> Result<String, FetchError>;
}

// ---------------------------------------------------------------------------
// Browser executable discovery
// ---------------------------------------------------------------------------

/// Find a usable Chromium-family executable: `CHROME_EXECUTABLE`, then a
/// PATH scan, then well-known install locations.
pub fn find_chrome_executable() -> Option<String> {
    if let Ok(p) = std::env::var("CHROME_EXECUTABLE") {
        if Path::new(&p).exists() {
            return Some(p);
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        let candidates = [
            "google-chrome",
            "chromium",
            "chromium-browser",
            "chrome",
            "brave-browser",
        ];
        for dir in std::env::split_paths(&path_var) {
            for exe in candidates {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/local/bin/chromium",
            "/usr/bin/brave-browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

/// True when JS rendering is possible on this machine.
pub fn renderer_available() -> bool {
    find_chrome_executable().is_some()
}

// ---------------------------------------------------------------------------
// CDP renderer with pooled browsers
// ---------------------------------------------------------------------------

type PoolKey = (Option<String>, Option<String>, Vec<(String, String)>);

struct PoolEntry {
    key: PoolKey,
    browser: Browser,
    handler_task: JoinHandle<()>,
}

impl PoolEntry {
    async fn shutdown(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("browser close error (non-fatal): {e}");
        }
        self.handler_task.abort();
    }
}

/// Native CDP renderer. One pool per value; renders sharing a
/// fingerprint reuse a live browser instance.
pub struct CdpRenderer {
    pool: Mutex<VecDeque<PoolEntry>>,
    max_contexts: usize,
}

impl CdpRenderer {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(VecDeque::new()),
            max_contexts: config::max_browser_contexts(),
        }
    }

    fn pool_key(opts: &RenderOptions) -> PoolKey {
        (
            opts.user_agent.clone(),
            opts.proxy.clone(),
            opts.extra_headers.clone(),
        )
    }

    async fn checkout(&self, url: &str, opts: &RenderOptions) -> Result<PoolEntry, FetchError> {
        let key = Self::pool_key(opts);

        {
            let mut pool = self.pool.lock().await;
            if let Some(pos) = pool.iter().position(|entry| entry.key == key) {
                debug!("reusing pooled browser for {url}");
                if let Some(entry) = pool.remove(pos) {
                    return Ok(entry);
                }
            }
        }

        let exe = find_chrome_executable().ok_or_else(|| FetchError::Browser {
            url: url.to_string(),
            reason: "no Chromium-family browser found; install Chrome/Chromium or set CHROME_EXECUTABLE".to_string(),
        })?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(exe.as_str())
            .viewport(Viewport {
                width: 1920,
                height: 1080,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: true,
                has_touch: false,
            })
            .window_size(1920, 1080)
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--hide-scrollbars")
            .arg("--mute-audio");

        if let Some(ua) = &opts.user_agent {
            builder = builder.arg(format!("--user-agent={ua}"));
        }
        if let Some(proxy) = &opts.proxy {
            builder = builder.arg(format!("--proxy-server={proxy}"));
        }

        let browser_config = builder.build().map_err(|e| FetchError::Browser {
            url: url.to_string(),
            reason: format!("browser config error: {e}"),
        })?;

        info!("launching headless browser for {url} ({exe})");
        let (browser, mut handler) =
            Browser::launch(browser_config)
                .await
                .map_err(|e| FetchError::Browser {
                    url: url.to_string(),
                    reason: format!("launch failed: {e}"),
                })?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("CDP handler error: {e}");
                }
            }
        });

        Ok(PoolEntry {
            key,
            browser,
            handler_task,
        })
    }

    async fn checkin(&self, entry: PoolEntry) {
        let evicted = {
            let mut pool = self.pool.lock().await;
            pool.push_back(entry);
            if pool.len() > self.max_contexts {
                pool.pop_front()
            } else {
                None
            }
        };
        if let Some(old) = evicted {
            debug!("evicting least-recently-used pooled browser");
            old.shutdown().await;
        }
    }

    /// Drop every pooled browser; call on shutdown.
    pub async fn close_all(&self) {
        let entries: Vec<PoolEntry> = {
            let mut pool = self.pool.lock().await;
            pool.drain(..).collect()
        };
        for entry in entries {
            entry.shutdown().await;
        }
    }
}

impl Default for CdpRenderer {
    fn default() -> Self {
        Self::new()
    }
}

const EXPAND_COLLAPSIBLES_JS: &str = r#"(() => {
    let count = 0;

    document.querySelectorAll('[aria-expanded="false"]').forEach(el => {
        try { el.click(); count++; } catch (e) {}
    });

    document.querySelectorAll('details:not([open])').forEach(el => {
        el.setAttribute('open', '');
        count++;
    });

    document.querySelectorAll(
        'mat-expansion-panel:not(.mat-expanded), .mat-expansion-panel:not(.mat-expanded)'
    ).forEach(el => {
        const header = el.querySelector('mat-expansion-panel-header, .mat-expansion-panel-header');
        if (header) { try { header.click(); count++; } catch (e) {} }
    });

    document.querySelectorAll(
        '.collapse:not(.show), [data-bs-toggle="collapse"], [data-toggle="collapse"]'
    ).forEach(el => {
        try { el.click(); count++; } catch (e) {}
    });

    return count;
})()"#;

const BODY_TOKEN_COUNT_JS: &str = "(() => document.body ? document.body.innerText.trim().split(/\\s+/).filter(Boolean).length : 0)()";

const RESOURCE_COUNT_JS: &str = "(() => performance.getEntriesByType('resource').length)()";

async fn eval_usize(page: &Page, js: &str) -> Option<usize> {
    let result = page.evaluate(js.to_string()).await.ok()?;
    result.into_value::<i64>().ok().map(|n| n.max(0) as usize)
}

/// Approximate network idle: the resource count stays flat across two
/// consecutive polls.
async fn wait_network_idle(page: &Page, max_ms: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(max_ms);
    let mut last = eval_usize(page, RESOURCE_COUNT_JS).await.unwrap_or(0);
    let mut stable = 0u32;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let current = eval_usize(page, RESOURCE_COUNT_JS).await.unwrap_or(last);
        if current == last {
            stable += 1;
            if stable >= 2 {
                debug!("network idle reached");
                return;
            }
        } else {
            stable = 0;
            last = current;
        }
    }
    debug!("network idle wait timed out after {max_ms}ms — continuing");
}

async fn wait_text_reached(page: &Page, min_tokens: usize, max_ms: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(max_ms);
    while tokio::time::Instant::now() < deadline {
        if eval_usize(page, BODY_TOKEN_COUNT_JS).await.unwrap_or(0) > min_tokens {
            debug!("DOM hydration confirmed (> {min_tokens} tokens)");
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    debug!("hydration wait timed out after {max_ms}ms — grabbing partial content");
}

async fn run_page_actions(page: &Page, url: &str, actions: &[PageAction], timeout: Duration) {
    for action in actions {
        match action {
            PageAction::WaitLoad => {
                // Load may never fire on analytics-heavy pages; tolerate.
                if tokio::time::timeout(timeout, page.wait_for_navigation())
                    .await
                    .is_err()
                {
                    warn!("load wait timed out for {url} — continuing");
                }
            }
            PageAction::WaitNetworkIdle { max_ms } => wait_network_idle(page, *max_ms).await,
            PageAction::WaitTextReached { min_tokens, max_ms } => {
                wait_text_reached(page, *min_tokens, *max_ms).await
            }
            PageAction::ExpandCollapsibles => {
                match page.evaluate(EXPAND_COLLAPSIBLES_JS.to_string()).await {
                    Ok(result) => {
                        let expanded = result.into_value::<i64>().unwrap_or(0);
                        if expanded > 0 {
                            debug!("expanded {expanded} collapsible sections on {url}");
                            // Give expansion-triggered requests a chance to land.
                            wait_network_idle(page, 6_000).await;
                            tokio::time::sleep(Duration::from_millis(1_500)).await;
                        }
                    }
                    Err(e) => debug!("collapsible expansion failed for {url}: {e}"),
                }
            }
        }
    }
}

#[async_trait]
impl BrowserRenderer for CdpRenderer {
    async fn render(&self, url: &str, opts: &RenderOptions) -> Result<String, FetchError> {
        let overall = opts
            .timeout
            .unwrap_or(Duration::from_secs(config::DEFAULT_TIMEOUT_SECS))
            .max(Duration::from_secs(60));

        let entry = self.checkout(url, opts).await?;
        let result = tokio::time::timeout(overall, render_on(&entry.browser, url, opts)).await;
        self.checkin(entry).await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(FetchError::Browser {
                url: url.to_string(),
                reason: format!("render timed out after {overall:?}"),
            }),
        }
    }
}

async fn render_on(browser: &Browser, url: &str, opts: &RenderOptions) -> Result<String, FetchError> {
    let page = browser
        .new_page("about:blank")
        .await
        .map_err(|e| FetchError::Browser {
            url: url.to_string(),
            reason: format!("failed to create page: {e}"),
        })?;

    page.goto(url).await.map_err(|e| FetchError::Browser {
        url: url.to_string(),
        reason: format!("navigation failed: {e}"),
    })?;

    // Cookie injection is script-level; HttpOnly cookies are outside this
    // capability's reach.
    if !opts.cookies.is_empty() {
        for (name, value) in &opts.cookies {
            let js = format!(
                "document.cookie = {};",
                serde_json::json!(format!("{name}={value}; path=/"))
            );
            if let Err(e) = page.evaluate(js).await {
                debug!("cookie injection failed for {url}: {e}");
            }
        }
        if let Err(e) = page.evaluate("location.reload()".to_string()).await {
            debug!("post-cookie reload failed for {url}: {e}");
        }
    }

    let actions = opts
        .page_actions
        .clone()
        .unwrap_or_else(default_page_actions);
    let phase_timeout = Duration::from_secs(30);
    run_page_actions(&page, url, &actions, phase_timeout).await;

    let html = page.content().await.map_err(|e| FetchError::Browser {
        url: url.to_string(),
        reason: format!("failed to read page content: {e}"),
    })?;

    if html.trim().is_empty() {
        return Err(FetchError::EmptyRender {
            url: url.to_string(),
        });
    }
    Ok(html)
}
