//! pagemill: adaptive article extraction and bounded web crawling.
//!
//! Turns arbitrary HTML pages into validated, RAG-ready article records:
//! main content as Markdown, plain text, and typed blocks; merged
//! metadata; and provenance (fetch strategy, winning extractor,
//! block-detection verdict, quality score).
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), pagemill::fetch::FetchError> {
//! use pagemill::query::{fetch, QueryOptions};
//!
//! let article = fetch("https://example.com/blog/post", &QueryOptions::default()).await?;
//! println!("{} ({} words)", article.title, article.word_count);
//! println!("{}", article.content_markdown);
//! # Ok(())
//! # }
//! ```
//!
//! Already have the HTML? `pagemill::query::parse` runs the extraction
//! pipeline with no network at all. For whole sites, `crawler::Crawler`
//! does a bounded BFS with sitemap/feed seeding and incremental resume.

pub mod core;
pub mod crawler;
pub mod extractors;
pub mod fetch;
pub mod plugins;
pub mod query;

// --- Primary exports ---
pub use crate::core::types::{
    ArticleRecord, Block, BlockResult, BlockType, ClassificationResult, FeedEntry, FetchResult,
    ImageRef, LinkRef, PageSignals, PageType,
};
pub use crawler::{CrawlConfig, CrawlReport, Crawler, RenderJsMode};
pub use fetch::FetchError;
pub use query::{fetch, fetch_batch, fetch_feed, parse, OnError, QueryOptions};

// --- Commonly-used building blocks ---
pub use extractors::block_detection::detect_block;
pub use extractors::classify::classify_page;
pub use extractors::feed::parse_feed;
pub use extractors::heuristics::{article_score, needs_js, reading_time};
pub use extractors::markdown::html_to_markdown;
pub use extractors::metadata::extract_metadata;
pub use extractors::urlnorm::{extract_domain, is_non_content_url, normalize_url, url_to_slug};
pub use plugins::{
    register_extractor, register_formatter, register_scorer, register_strategy, Registry,
};
