//! Network layer: HTTP fetching with retries, the pluggable backend seam,
//! proxy rotation, per-domain rate limiting, auth, the headless renderer
//! capability, and the adaptive strategy engine.

pub mod adaptive;
pub mod antibot;
pub mod auth;
pub mod browser;
pub mod proxy;
pub mod rate_limit;

use crate::core::config;
use async_trait::async_trait;
use auth::AuthSession;
use rand::Rng;
use rate_limit::DomainRateLimiter;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Any failure to turn a URL into a usable body.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unsupported URL scheme {scheme:?} for {url}")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        url: String,
        status: u16,
        body: Option<String>,
    },

    #[error("network error fetching {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("failed to decode response body from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("headless render returned an empty page for {url}")]
    EmptyRender { url: String },

    #[error("headless browser error for {url}: {reason}")]
    Browser { url: String, reason: String },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            FetchError::UnsupportedScheme { url, .. }
            | FetchError::InvalidUrl { url, .. }
            | FetchError::HttpStatus { url, .. }
            | FetchError::Network { url, .. }
            | FetchError::Decode { url, .. }
            | FetchError::EmptyRender { url }
            | FetchError::Browser { url, .. } => url,
        }
    }

    /// HTTP status, or 0 when no response was received.
    pub fn status(&self) -> u16 {
        match self {
            FetchError::HttpStatus { status, .. } => *status,
            _ => 0,
        }
    }

    /// Decoded error body, when one was read.
    pub fn body(&self) -> Option<&str> {
        match self {
            FetchError::HttpStatus { body, .. } => body.as_deref(),
            _ => None,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Network { .. })
    }
}

/// Raw response as seen by the retry layer. Error bodies are readable.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Capability seam for plain HTTP. The default implementation is backed
/// by `reqwest`; tests substitute scripted backends.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
        proxy: Option<&str>,
    ) -> Result<RawResponse, FetchError>;
}

/// `reqwest`-backed HTTP. Clients are cached per proxy so connection
/// pools survive across requests; gzip/deflate/brotli decompression and
/// charset decoding are handled by the client.
pub struct ReqwestBackend {
    clients: std::sync::Mutex<std::collections::HashMap<Option<String>, reqwest::Client>>,
}

impl ReqwestBackend {
    pub fn new() -> Self {
        Self {
            clients: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn client_for(&self, url: &str, proxy: Option<&str>) -> Result<reqwest::Client, FetchError> {
        let key = proxy.map(str::to_string);
        if let Ok(cache) = self.clients.lock() {
            if let Some(client) = cache.get(&key) {
                return Ok(client.clone());
            }
        }

        let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::limited(10));
        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| FetchError::InvalidUrl {
                url: proxy_url.to_string(),
                reason: e.to_string(),
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| FetchError::Network {
            url: url.to_string(),
            reason: format!("client construction failed: {e}"),
        })?;

        if let Ok(mut cache) = self.clients.lock() {
            cache.insert(key, client.clone());
        }
        Ok(client)
    }
}

impl Default for ReqwestBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
        proxy: Option<&str>,
    ) -> Result<RawResponse, FetchError> {
        let client = self.client_for(url, proxy)?;

        let mut request = client.get(url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| FetchError::Network {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let response_headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        // Charset comes from Content-Type with a UTF-8 lossy fallback.
        let body = response.text().await.map_err(|e| FetchError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        Ok(RawResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}

static DEFAULT_BACKEND: OnceLock<Arc<ReqwestBackend>> = OnceLock::new();

/// The shared process-wide `reqwest` backend.
pub fn default_backend() -> Arc<ReqwestBackend> {
    DEFAULT_BACKEND
        .get_or_init(|| Arc::new(ReqwestBackend::new()))
        .clone()
}

/// Options shared by every fetch path.
#[derive(Clone, Default)]
pub struct FetchOptions {
    /// Per-request timeout; defaults to 30 s.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
    /// Retry budget; defaults to 3.
    pub max_retries: Option<u32>,
    pub proxy: Option<String>,
    pub auth: Option<Arc<AuthSession>>,
    pub rate_limiter: Option<Arc<DomainRateLimiter>>,
    /// Extra request headers, applied after the browser defaults
    /// (conditional-request headers, custom auth, …).
    pub extra_headers: Vec<(String, String)>,
}

impl FetchOptions {
    pub fn timeout(&self) -> Duration {
        self.timeout
            .unwrap_or(Duration::from_secs(config::DEFAULT_TIMEOUT_SECS))
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(config::DEFAULT_MAX_RETRIES)
    }
}

const RETRY_STATUS: &[u16] = &[429, 500, 502, 503, 504];

fn jitter() -> f64 {
    rand::thread_rng().gen_range(0.0..1.0)
}

/// Fetch `url` through the default backend. See [`http_get_with`].
pub async fn http_get(url: &str, opts: &FetchOptions) -> Result<String, FetchError> {
    let backend = default_backend();
    http_get_with(backend.as_ref(), url, opts).await
}

/// Fetch `url` and return the decoded body.
pub async fn http_get_with(
    backend: &dyn HttpBackend,
    url: &str,
    opts: &FetchOptions,
) -> Result<String, FetchError> {
    http_get_response(backend, url, opts).await.map(|r| r.body)
}

/// Fetch `url` and return the full response (status + headers + body).
///
/// Retries transient failures (429/500/502/503/504 and network errors)
/// with jittered exponential backoff, honouring `Retry-After` on 429/503.
/// A 401 triggers one auth refresh when the session declares support,
/// consuming one retry attempt. The per-domain rate limiter, when
/// supplied, gates every attempt. Any status below 400 (200s, 304) comes
/// back as `Ok`; the rest surface as [`FetchError::HttpStatus`] with the
/// decoded body attached.
pub async fn http_get_response(
    backend: &dyn HttpBackend,
    url: &str,
    opts: &FetchOptions,
) -> Result<RawResponse, FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(FetchError::UnsupportedScheme {
            url: url.to_string(),
            scheme: parsed.scheme().to_string(),
        });
    }

    let ua = opts
        .user_agent
        .clone()
        .unwrap_or_else(config::default_user_agent);
    let mut headers = antibot::browser_headers(&ua);
    for (name, value) in &opts.extra_headers {
        headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        headers.push((name.clone(), value.clone()));
    }
    if let Some(auth) = &opts.auth {
        auth.apply_headers(&mut headers);
    }

    let max_retries = opts.max_retries();
    let mut refreshed = false;
    let mut last_err: Option<FetchError> = None;

    for attempt in 0..=max_retries {
        if let Some(limiter) = &opts.rate_limiter {
            limiter.wait(url).await;
        }

        match backend
            .get(url, &headers, opts.timeout(), opts.proxy.as_deref())
            .await
        {
            Ok(resp) if resp.status < 400 => return Ok(resp),
            Ok(resp) => {
                let status = resp.status;

                if status == 401 && !refreshed {
                    if let Some(auth) = &opts.auth {
                        if auth.has_refresh() {
                            debug!("HTTP 401 for {url} — refreshing auth (attempt {attempt})");
                            refreshed = true;
                            auth.refresh_now();
                            headers = antibot::browser_headers(&ua);
                            for (name, value) in &opts.extra_headers {
                                headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
                                headers.push((name.clone(), value.clone()));
                            }
                            auth.apply_headers(&mut headers);
                            last_err = Some(FetchError::HttpStatus {
                                url: url.to_string(),
                                status,
                                body: Some(resp.body),
                            });
                            continue;
                        }
                    }
                }

                if RETRY_STATUS.contains(&status) && attempt < max_retries {
                    let retry_after = resp
                        .header("retry-after")
                        .and_then(|v| v.trim().parse::<u64>().ok())
                        .unwrap_or(0);
                    let backoff = 2u64.saturating_pow(attempt).max(retry_after);
                    let delay = Duration::from_secs_f64(backoff as f64 + jitter());
                    debug!(
                        "HTTP {status} for {url} — retrying in {delay:.1?} (attempt {}/{max_retries}){}",
                        attempt + 1,
                        if retry_after > 0 {
                            format!(" [Retry-After={retry_after}s]")
                        } else {
                            String::new()
                        }
                    );
                    tokio::time::sleep(delay).await;
                    last_err = Some(FetchError::HttpStatus {
                        url: url.to_string(),
                        status,
                        body: Some(resp.body),
                    });
                    continue;
                }

                return Err(FetchError::HttpStatus {
                    url: url.to_string(),
                    status,
                    body: Some(resp.body),
                });
            }
            Err(e) => {
                if e.is_retryable() && attempt < max_retries {
                    let delay = Duration::from_secs_f64(
                        2u64.saturating_pow(attempt) as f64 + jitter(),
                    );
                    debug!("network error for {url} — retrying in {delay:.1?}: {e}");
                    tokio::time::sleep(delay).await;
                    last_err = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| FetchError::Network {
        url: url.to_string(),
        reason: "all retries exhausted".to_string(),
    }))
}
