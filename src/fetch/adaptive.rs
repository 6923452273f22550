//! Adaptive fetch engine: classify the statically-fetched page, then walk
//! the strategy chain (static → amp → mobile UA → headless render →
//! strategy plugins → best effort) until content quality is acceptable.

use crate::core::config::{MIN_CONTENT_WORDS, MOBILE_USER_AGENT};
use crate::core::types::FetchResult;
use crate::extractors::classify::classify_page;
use crate::extractors::scrub::raw_word_count;
use crate::fetch::browser::{BrowserRenderer, PageAction, RenderOptions};
use crate::fetch::{http_get_with, FetchError, FetchOptions, HttpBackend};
use crate::plugins::Registry;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Everything the adaptive engine needs besides the URL.
#[derive(Clone, Default)]
pub struct AdaptiveOptions {
    pub fetch: FetchOptions,
    /// JS rendering capability; strategies needing it are skipped when absent.
    pub renderer: Option<Arc<dyn BrowserRenderer>>,
    pub page_actions: Option<Vec<PageAction>>,
}

impl AdaptiveOptions {
    fn render_options(&self) -> RenderOptions {
        RenderOptions {
            timeout: Some(self.fetch.timeout()),
            proxy: self.fetch.proxy.clone(),
            user_agent: self.fetch.user_agent.clone(),
            cookies: self
                .fetch
                .auth
                .as_ref()
                .map(|a| a.cookie_pairs())
                .unwrap_or_default(),
            extra_headers: Vec::new(),
            page_actions: self.page_actions.clone(),
        }
    }
}

async fn try_render(
    url: &str,
    opts: &AdaptiveOptions,
) -> Option<String> {
    let renderer = opts.renderer.as_ref()?;
    match renderer.render(url, &opts.render_options()).await {
        Ok(html) => Some(html),
        Err(e) => {
            warn!("headless render failed for {url}: {e}");
            None
        }
    }
}

/// Fetch `url` using the best available strategy.
///
/// Fails only when the initial static fetch fails; every later strategy
/// degrades to the static result on error. `strategy_used` names the
/// branch that produced the returned HTML.
pub async fn adaptive_fetch(
    backend: &dyn HttpBackend,
    url: &str,
    opts: &AdaptiveOptions,
    registry: &Registry,
) -> Result<FetchResult, FetchError> {
    // Step 1: static fetch, always first.
    let html = http_get_with(backend, url, &opts.fetch).await?;
    let classification = classify_page(&html, url);
    let strategy = classification.recommended_strategy.clone();
    let initial_words = classification.signals.body_word_count;

    info!(
        "classified {url} → type={} strategy={} confidence={:.2} | {}",
        classification.page_type.as_str(),
        strategy,
        classification.confidence,
        classification.reason
    );

    // Already good quality.
    if strategy == "static" && initial_words >= MIN_CONTENT_WORDS {
        return Ok(FetchResult {
            html,
            classification,
            strategy_used: "static".to_string(),
        });
    }

    // Step 2: AMP variant (clean HTML, no JS required).
    if strategy == "amp" {
        if let Some(amp_url) = classification.signals.amp_url.clone() {
            let amp_url = Url::parse(url)
                .and_then(|base| base.join(&amp_url))
                .map(|u| u.to_string())
                .unwrap_or(amp_url);
            match http_get_with(backend, &amp_url, &opts.fetch).await {
                Ok(amp_html) if raw_word_count(&amp_html) > initial_words => {
                    info!("AMP strategy succeeded for {url}");
                    return Ok(FetchResult {
                        html: amp_html,
                        classification,
                        strategy_used: "amp".to_string(),
                    });
                }
                Ok(_) => debug!("AMP variant was no richer for {url}"),
                Err(e) => debug!("AMP fetch failed for {url}: {e}"),
            }
        }
    }

    // Step 3: retry with a mobile user agent.
    if strategy == "mobile_ua" {
        let mobile_opts = FetchOptions {
            user_agent: Some(MOBILE_USER_AGENT.to_string()),
            ..opts.fetch.clone()
        };
        match http_get_with(backend, url, &mobile_opts).await {
            Ok(mob_html)
                if raw_word_count(&mob_html) as f64 > initial_words as f64 * 1.3 =>
            {
                info!("mobile-UA strategy succeeded for {url}");
                return Ok(FetchResult {
                    html: mob_html,
                    classification,
                    strategy_used: "mobile_ua".to_string(),
                });
            }
            Ok(_) => debug!("mobile-UA fetch was no richer for {url}"),
            Err(e) => debug!("mobile-UA fetch failed for {url}: {e}"),
        }
    }

    // Step 4: headless render for JS-built pages.
    if strategy == "playwright" {
        if let Some(rendered) = try_render(url, opts).await {
            if raw_word_count(&rendered) > initial_words {
                info!("headless strategy succeeded for {url}");
                return Ok(FetchResult {
                    html: rendered,
                    classification,
                    strategy_used: "playwright".to_string(),
                });
            }
        }
    }

    // Step 5: headless fallback for thin static pages that slipped through.
    if strategy != "playwright" && initial_words < MIN_CONTENT_WORDS {
        if let Some(rendered) = try_render(url, opts).await {
            if raw_word_count(&rendered) > initial_words {
                info!("headless fallback succeeded for {url}");
                return Ok(FetchResult {
                    html: rendered,
                    classification,
                    strategy_used: "playwright_fallback".to_string(),
                });
            }
        }
    }

    // Step 6: registered strategy plugins, in order.
    for plugin in registry.strategies() {
        if !plugin.can_handle(url, &classification.signals) {
            continue;
        }
        match plugin.fetch(url, opts.fetch.timeout()).await {
            Ok(plugin_html) if raw_word_count(&plugin_html) > initial_words => {
                info!("plugin strategy {} succeeded for {url}", plugin.name());
                return Ok(FetchResult {
                    html: plugin_html,
                    classification,
                    strategy_used: plugin.name().to_string(),
                });
            }
            Ok(_) => debug!("plugin strategy {} was no richer for {url}", plugin.name()),
            Err(e) => warn!("plugin strategy {} failed for {url}: {e}", plugin.name()),
        }
    }

    warn!(
        "all strategies exhausted for {url} — returning best-effort result ({initial_words} words)"
    );
    Ok(FetchResult {
        html,
        classification,
        strategy_used: "static_best_effort".to_string(),
    })
}
