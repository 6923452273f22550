//! Crawl state persistence: the seen-URL ledger, article index, skip log,
//! conditional-request cache, and the close-time telemetry record.

use crate::core::types::ArticleRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

const SEEN_FILE: &str = "seen_urls.txt";
const INDEX_FILE: &str = "index.json";
const SKIP_FILE: &str = "skipped.jsonl";
const HTTP_CACHE_FILE: &str = "http_cache.json";
const TELEMETRY_FILE: &str = "telemetry.json";

/// Cached validators for one URL, used for conditional requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpCacheEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

/// Per-article summary row in the crawl index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub slug: String,
    pub url: String,
    pub title: String,
    pub author: Option<String>,
    pub published_at: Option<String>,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub word_count: usize,
    pub reading_time_minutes: u32,
    pub extraction_method_used: String,
}

impl IndexEntry {
    pub fn from_article(slug: &str, article: &ArticleRecord) -> Self {
        Self {
            slug: slug.to_string(),
            url: article.url.clone(),
            title: article.title.clone(),
            author: article.author.clone(),
            published_at: article.published_at.clone(),
            summary: article.summary.clone(),
            tags: article.tags.clone(),
            word_count: article.word_count,
            reading_time_minutes: article.reading_time_minutes,
            extraction_method_used: article.extraction_method_used.clone(),
        }
    }
}

/// One skipped URL with its reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipEntry {
    pub url: String,
    pub reason: String,
    pub timestamp: String,
}

/// Close summary for one crawl run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlTelemetry {
    pub reason: String,
    pub responses: u64,
    pub articles: u64,
    pub errors: u64,
    pub bytes: u64,
    pub responses_per_sec: f64,
    pub avg_latency_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub block_counts: BTreeMap<String, u64>,
    pub block_rate: f64,
    pub elapsed_sec: f64,
}

/// Filesystem-backed crawl state. All writers are append-oriented so a
/// crash loses at most the in-flight record.
pub struct CrawlStore {
    dir: PathBuf,
    seen_file: Mutex<Option<File>>,
}

impl CrawlStore {
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            seen_file: Mutex::new(None),
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Previously seen normalized URLs, one per line.
    pub fn load_seen(&self) -> HashSet<String> {
        let Ok(file) = File::open(self.path(SEEN_FILE)) else {
            return HashSet::new();
        };
        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// Append one normalized URL to the seen ledger.
    pub fn append_seen(&self, url: &str) {
        let mut guard = match self.seen_file.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_none() {
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path(SEEN_FILE))
            {
                Ok(f) => *guard = Some(f),
                Err(e) => {
                    warn!("could not open seen ledger: {e}");
                    return;
                }
            }
        }
        if let Some(f) = guard.as_mut() {
            if let Err(e) = writeln!(f, "{url}") {
                warn!("could not append to seen ledger: {e}");
            }
        }
    }

    /// URLs present in a prior article index.
    pub fn load_index_urls(&self) -> HashSet<String> {
        self.load_index()
            .into_iter()
            .map(|entry| entry.url)
            .collect()
    }

    pub fn load_index(&self) -> Vec<IndexEntry> {
        let Ok(raw) = std::fs::read_to_string(self.path(INDEX_FILE)) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    pub fn save_index(&self, entries: &[IndexEntry]) {
        match serde_json::to_string_pretty(entries) {
            Ok(json) => {
                if let Err(e) = std::fs::write(self.path(INDEX_FILE), json) {
                    warn!("could not write article index: {e}");
                }
            }
            Err(e) => warn!("could not serialize article index: {e}"),
        }
    }

    pub fn append_skip(&self, entry: &SkipEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(l) => l,
            Err(e) => {
                warn!("could not serialize skip entry: {e}");
                return;
            }
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(SKIP_FILE))
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!("could not append skip entry: {e}");
        }
    }

    /// Fresh (non-resume) crawls start with an empty skip log.
    pub fn clear_skips(&self) {
        let _ = std::fs::remove_file(self.path(SKIP_FILE));
    }

    pub fn load_http_cache(&self) -> HashMap<String, HttpCacheEntry> {
        let Ok(raw) = std::fs::read_to_string(self.path(HTTP_CACHE_FILE)) else {
            return HashMap::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    pub fn save_http_cache(&self, cache: &HashMap<String, HttpCacheEntry>) {
        match serde_json::to_string_pretty(cache) {
            Ok(json) => {
                if let Err(e) = std::fs::write(self.path(HTTP_CACHE_FILE), json) {
                    warn!("could not write http cache: {e}");
                }
            }
            Err(e) => warn!("could not serialize http cache: {e}"),
        }
    }

    pub fn save_telemetry(&self, telemetry: &CrawlTelemetry) {
        match serde_json::to_string_pretty(telemetry) {
            Ok(json) => {
                if let Err(e) = std::fs::write(self.path(TELEMETRY_FILE), json) {
                    warn!("could not write telemetry: {e}");
                }
            }
            Err(e) => warn!("could not serialize telemetry: {e}"),
        }
    }
}
