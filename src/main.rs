//! pagemill CLI: crawl a site (or fetch a single page) into a directory
//! of article records.
//!
//! ```bash
//! pagemill https://example.com/blog --out-dir ./out --max-pages 200
//! pagemill https://example.com/blog/post --single --json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use pagemill::crawler::{CrawlConfig, Crawler, RenderJsMode};
use pagemill::extractors::markdown::format_markdown_article;
use pagemill::extractors::urlnorm::url_to_slug;
use pagemill::query::{fetch, QueryOptions};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "pagemill",
    version,
    about = "Adaptive article extraction and bounded web crawling"
)]
struct Cli {
    /// Start URL (crawl seed, or the page itself with --single).
    url: String,

    /// Fetch and extract just the one URL instead of crawling.
    #[arg(long)]
    single: bool,

    /// Output directory for articles and crawl state.
    #[arg(long, default_value = "./out")]
    out_dir: PathBuf,

    /// Maximum pages to fetch.
    #[arg(long, default_value_t = 500)]
    max_pages: usize,

    /// Maximum BFS depth.
    #[arg(long, default_value_t = 10)]
    max_depth: usize,

    /// Concurrent in-flight requests.
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// JS rendering mode: auto | always | never.
    #[arg(long, default_value = "auto")]
    render_js: String,

    /// Only extract URLs matching this regex (traversal is unaffected).
    #[arg(long)]
    include_regex: Option<String>,

    /// Skip URLs matching this regex entirely.
    #[arg(long)]
    exclude_regex: Option<String>,

    /// Follow subdomains of the start host.
    #[arg(long)]
    allow_subdomains: bool,

    /// Additional allowed domains.
    #[arg(long)]
    extra_domains: Vec<String>,

    /// Resume from a previous crawl's state in --out-dir.
    #[arg(long)]
    resume: bool,

    /// Disable the conditional-request (ETag/Last-Modified) cache.
    #[arg(long)]
    no_cache: bool,

    /// Base inter-request delay per domain, in seconds.
    #[arg(long, default_value_t = 1.0)]
    delay: f64,

    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// With --single: print the JSON record instead of Markdown.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pagemill=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if cli.single {
        return run_single(cli).await;
    }

    let config = CrawlConfig {
        start_url: cli.url.clone(),
        max_pages: cli.max_pages,
        max_depth: cli.max_depth,
        render_js: cli.render_js.parse::<RenderJsMode>()?,
        include_regex: cli.include_regex,
        exclude_regex: cli.exclude_regex,
        allow_subdomains: cli.allow_subdomains,
        extra_domains: cli.extra_domains,
        resume: cli.resume,
        delta: !cli.no_cache,
        concurrent_requests: cli.concurrency,
        download_delay: cli.delay,
        out_dir: Some(cli.out_dir.clone()),
        timeout: Some(Duration::from_secs(cli.timeout)),
        ..CrawlConfig::default()
    };

    let crawler = Crawler::new(config)?;
    let report = crawler.crawl().await?;

    std::fs::create_dir_all(&cli.out_dir)
        .with_context(|| format!("creating {}", cli.out_dir.display()))?;
    for article in &report.articles {
        let slug = url_to_slug(&article.url, 100);
        let json = serde_json::to_string_pretty(article)?;
        std::fs::write(cli.out_dir.join(format!("{slug}.json")), json)?;
        let md = format_markdown_article(
            &article.title,
            article.author.as_deref(),
            article.published_at.as_deref(),
            &article.tags,
            article.summary.as_deref(),
            &article.content_markdown,
        );
        std::fs::write(cli.out_dir.join(format!("{slug}.md")), md)?;
    }

    println!(
        "crawled {} responses, {} articles, {} skipped in {:.1}s",
        report.telemetry.responses,
        report.articles.len(),
        report.skipped.len(),
        report.telemetry.elapsed_sec
    );
    Ok(())
}

async fn run_single(cli: Cli) -> Result<()> {
    let opts = QueryOptions {
        render_js: cli.render_js == "always",
        timeout: Some(Duration::from_secs(cli.timeout)),
        ..QueryOptions::default()
    };
    let article = fetch(&cli.url, &opts).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&article)?);
    } else {
        println!(
            "{}",
            format_markdown_article(
                &article.title,
                article.author.as_deref(),
                article.published_at.as_deref(),
                &article.tags,
                article.summary.as_deref(),
                &article.content_markdown,
            )
        );
    }
    Ok(())
}
