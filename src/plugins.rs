//! Extension points for custom fetch strategies, extractors, scorers, and
//! output formatters.
//!
//! Registries are explicit values threaded through the `fetch` / extraction
//! entry points; a process-wide default registry exists for convenience
//! (`register_strategy` & friends).

use crate::core::types::{ArticleRecord, PageSignals};
use crate::fetch::FetchError;
use async_trait::async_trait;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

/// Custom fetch strategy consulted after the built-in chain is exhausted.
/// A plugin result is adopted only when its raw word count improves on the
/// current best.
#[async_trait]
pub trait FetchStrategyPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn can_handle(&self, url: &str, signals: &PageSignals) -> bool;
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<String, FetchError>;
}

/// Custom main-content extractor, tried after the built-in cascade in
/// descending `priority` order. The first plugin whose output strictly
/// improves the word count wins.
pub trait ExtractorPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;
    fn can_extract(&self, html: &str, url: &str) -> bool;
    /// Return an HTML fragment with the main content, or `None` to pass.
    fn extract(&self, html: &str, url: &str) -> Option<String>;
}

/// Adjusts the article score produced by the built-in heuristic.
pub trait ScorerPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn score(&self, url: &str, html: &str, base_score: i32) -> i32;
}

/// Produces an alternative serialization of an article record.
pub trait OutputFormatterPlugin: Send + Sync {
    fn name(&self) -> &str;
    /// File extension without the leading dot, e.g. `"txt"`.
    fn extension(&self) -> &str;
    fn format(&self, article: &ArticleRecord) -> String;
}

/// A set of registered plugins. Cheap to clone (shared trait objects).
#[derive(Clone, Default)]
pub struct Registry {
    strategies: Vec<Arc<dyn FetchStrategyPlugin>>,
    extractors: Vec<Arc<dyn ExtractorPlugin>>,
    scorers: Vec<Arc<dyn ScorerPlugin>>,
    formatters: Vec<Arc<dyn OutputFormatterPlugin>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_strategy(&mut self, plugin: Arc<dyn FetchStrategyPlugin>) {
        self.strategies.push(plugin);
    }

    pub fn register_extractor(&mut self, plugin: Arc<dyn ExtractorPlugin>) {
        self.extractors.push(plugin);
    }

    pub fn register_scorer(&mut self, plugin: Arc<dyn ScorerPlugin>) {
        self.scorers.push(plugin);
    }

    pub fn register_formatter(&mut self, plugin: Arc<dyn OutputFormatterPlugin>) {
        self.formatters.push(plugin);
    }

    pub fn strategies(&self) -> &[Arc<dyn FetchStrategyPlugin>] {
        &self.strategies
    }

    /// Extractors in descending priority order.
    pub fn extractors_by_priority(&self) -> Vec<Arc<dyn ExtractorPlugin>> {
        let mut sorted = self.extractors.clone();
        sorted.sort_by_key(|p| std::cmp::Reverse(p.priority()));
        sorted
    }

    pub fn scorers(&self) -> &[Arc<dyn ScorerPlugin>] {
        &self.scorers
    }

    pub fn formatters(&self) -> &[Arc<dyn OutputFormatterPlugin>] {
        &self.formatters
    }

    pub fn clear(&mut self) {
        self.strategies.clear();
        self.extractors.clear();
        self.scorers.clear();
        self.formatters.clear();
    }
}

static GLOBAL_REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();

/// The process-wide default registry.
pub fn global() -> &'static RwLock<Registry> {
    GLOBAL_REGISTRY.get_or_init(|| RwLock::new(Registry::new()))
}

/// Snapshot of `explicit` when given, otherwise of the global registry.
pub fn resolve(explicit: Option<&Registry>) -> Registry {
    match explicit {
        Some(r) => r.clone(),
        None => global().read().map(|g| g.clone()).unwrap_or_default(),
    }
}

pub fn register_strategy(plugin: Arc<dyn FetchStrategyPlugin>) {
    if let Ok(mut g) = global().write() {
        g.register_strategy(plugin);
    }
}

pub fn register_extractor(plugin: Arc<dyn ExtractorPlugin>) {
    if let Ok(mut g) = global().write() {
        g.register_extractor(plugin);
    }
}

pub fn register_scorer(plugin: Arc<dyn ScorerPlugin>) {
    if let Ok(mut g) = global().write() {
        g.register_scorer(plugin);
    }
}

pub fn register_formatter(plugin: Arc<dyn OutputFormatterPlugin>) {
    if let Ok(mut g) = global().write() {
        g.register_formatter(plugin);
    }
}
