//! Runtime tunables resolved from environment variables with built-in
//! defaults. File-free by design: the crate is a library first, and every
//! knob here can also be set explicitly through the public option structs.

/// Default desktop Chrome user agent used when the caller supplies none.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

/// iPhone Safari user agent for the `mobile_ua` adaptive branch.
pub const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";

/// Default per-request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default retry budget for the HTTP fetcher.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Visible body words below which a static fetch is considered thin.
pub const MIN_CONTENT_WORDS: usize = 150;

/// Default worker-pool width for `fetch_batch`.
pub const DEFAULT_BATCH_WORKERS: usize = 8;

/// Override the default UA: `PAGEMILL_USER_AGENT`.
pub fn default_user_agent() -> String {
    std::env::var("PAGEMILL_USER_AGENT")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
}

/// Headless browser instances kept alive per pool: `PAGEMILL_MAX_BROWSER_CONTEXTS` → 2.
pub fn max_browser_contexts() -> usize {
    std::env::var("PAGEMILL_MAX_BROWSER_CONTEXTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&n| n > 0)
        .unwrap_or(2)
}
