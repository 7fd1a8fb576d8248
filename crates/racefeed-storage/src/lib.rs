//! Caching document fetcher, JSON-Lines persistence and the durable event store.

pub mod jsonl;
pub mod store;

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, NaiveDate, Utc};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONNECTION,
    UPGRADE_INSECURE_REQUESTS, USER_AGENT,
};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub use store::{
    EventStore, FeedCandidate, MergeReport, StoredRawEvent, RAW_EVENTS, SCHEMA_EVENTS,
};

pub const CRATE_NAME: &str = "racefeed-storage";

pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(23 * 60 * 60);
pub const DEFAULT_CRAWL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/141.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("cache io failure at {}: {source}", .path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown text encoding {0}")]
    Encoding(String),
    #[error("invalid json document {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
}

fn cache_err(path: &Path) -> impl FnOnce(std::io::Error) -> FetchError + '_ {
    move |source| FetchError::Cache {
        path: path.to_path_buf(),
        source,
    }
}

/// A document body plus the cache file that holds it.
#[derive(Debug, Clone)]
pub struct CachedDocument {
    pub path: PathBuf,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub from_cache: bool,
}

impl CachedDocument {
    /// Decode the body. `None` means UTF-8; other labels follow the WHATWG
    /// encoding names (`iso-8859-1`, `windows-1252`, ...).
    pub fn text(&self, encoding: Option<&str>) -> Result<String, FetchError> {
        let encoding = match encoding {
            None => encoding_rs::UTF_8,
            Some(label) => encoding_rs::Encoding::for_label(label.as_bytes())
                .ok_or_else(|| FetchError::Encoding(label.to_string()))?,
        };
        let (text, _, _) = encoding.decode(&self.body);
        Ok(text.into_owned())
    }

    pub fn json(&self) -> Result<serde_json::Value, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Json {
            path: self.path.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    modified: SystemTime,
}

/// Date-stamped document cache for one source: `<root>/<YYYY-MM-DD>-<cache_key>`.
#[derive(Debug, Clone)]
pub struct DocumentCache {
    root: PathBuf,
}

impl DocumentCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_name(date: NaiveDate, cache_key: &str) -> String {
        format!("{}-{cache_key}", date.format("%Y-%m-%d"))
    }

    fn matches_key(file_name: &str, cache_key: &str) -> bool {
        file_name
            .strip_suffix(cache_key)
            .and_then(|prefix| prefix.strip_suffix('-'))
            .map(|stamp| NaiveDate::parse_from_str(stamp, "%Y-%m-%d").is_ok())
            .unwrap_or(false)
    }

    async fn latest(&self, cache_key: &str) -> Result<Option<CacheEntry>, FetchError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(cache_err(&self.root)(err)),
        };

        let mut newest: Option<CacheEntry> = None;
        while let Some(entry) = entries.next_entry().await.map_err(cache_err(&self.root))? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !Self::matches_key(&name, cache_key) {
                continue;
            }
            let path = entry.path();
            let meta = entry.metadata().await.map_err(cache_err(&path))?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().map_err(cache_err(&path))?;
            if newest.as_ref().map_or(true, |n| modified > n.modified) {
                newest = Some(CacheEntry { path, modified });
            }
        }
        Ok(newest)
    }

    /// Newest cached file for `cache_key` whose age is strictly below `freshness`.
    pub async fn fresh(
        &self,
        cache_key: &str,
        freshness: Duration,
    ) -> Result<Option<PathBuf>, FetchError> {
        let Some(entry) = self.latest(cache_key).await? else {
            return Ok(None);
        };
        let age = SystemTime::now()
            .duration_since(entry.modified)
            .unwrap_or(Duration::ZERO);
        Ok((age < freshness).then_some(entry.path))
    }

    pub async fn read(&self, path: &Path) -> Result<CachedDocument, FetchError> {
        let body = fs::read(path).await.map_err(cache_err(path))?;
        let fetched_at = modified_at(path).await?;
        Ok(CachedDocument {
            path: path.to_path_buf(),
            body,
            fetched_at,
            from_cache: true,
        })
    }

    /// Persist bytes under the date-stamped name via temp-file rename.
    pub async fn store(
        &self,
        date: NaiveDate,
        cache_key: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, FetchError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(cache_err(&self.root))?;
        let path = self.root.join(Self::file_name(date, cache_key));
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(cache_err(&temp_path))?;
        file.write_all(bytes).await.map_err(cache_err(&temp_path))?;
        file.flush().await.map_err(cache_err(&temp_path))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(cache_err(&path)(err));
        }
        Ok(path)
    }
}

async fn modified_at(path: &Path) -> Result<DateTime<Utc>, FetchError> {
    let meta = fs::metadata(path).await.map_err(cache_err(path))?;
    let modified = meta.modified().map_err(cache_err(path))?;
    Ok(DateTime::<Utc>::from(modified))
}

/// Turn an href or path into a file-name-safe cache key.
pub fn sanitize_cache_key(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Fixed browser-like header set sent with every live request.
pub fn browser_headers(user_agent: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let user_agent = HeaderValue::from_str(user_agent)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_USER_AGENT));
    headers.insert(USER_AGENT, user_agent);
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static("pt-BR,en-US;q=0.8,en;q=0.6,pt;q=0.4"),
    );
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate, br"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    headers.insert(
        HeaderName::from_static("sec-fetch-dest"),
        HeaderValue::from_static("document"),
    );
    headers.insert(
        HeaderName::from_static("sec-fetch-mode"),
        HeaderValue::from_static("navigate"),
    );
    headers.insert(
        HeaderName::from_static("sec-fetch-site"),
        HeaderValue::from_static("cross-site"),
    );
    headers.insert(HeaderName::from_static("priority"), HeaderValue::from_static("u=0, i"));
    headers
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub crawl_delay: Duration,
    pub freshness: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            crawl_delay: DEFAULT_CRAWL_DELAY,
            freshness: DEFAULT_FRESHNESS,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Overrides the fetcher's freshness window for this call.
    pub freshness: Option<Duration>,
    /// When set, the request is a POST with this JSON body.
    pub payload: Option<serde_json::Value>,
}

/// Cache-first fetcher. One value is held by each source adapter.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    cache: DocumentCache,
    crawl_delay: Duration,
    freshness: Duration,
}

impl Fetcher {
    pub fn build_client(config: &FetcherConfig) -> Result<reqwest::Client, FetchError> {
        reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(browser_headers(&config.user_agent))
            .build()
            .map_err(FetchError::Client)
    }

    pub fn new(config: &FetcherConfig, cache_root: impl Into<PathBuf>) -> Result<Self, FetchError> {
        let client = Self::build_client(config)?;
        Ok(Self::with_client(client, config, cache_root))
    }

    /// Share one connection pool across per-source fetchers.
    pub fn with_client(
        client: reqwest::Client,
        config: &FetcherConfig,
        cache_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            cache: DocumentCache::new(cache_root),
            crawl_delay: config.crawl_delay,
            freshness: config.freshness,
        }
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    pub async fn fetch(&self, url: &str, cache_key: &str) -> Result<CachedDocument, FetchError> {
        self.fetch_with(url, cache_key, &FetchOptions::default()).await
    }

    pub async fn fetch_with(
        &self,
        url: &str,
        cache_key: &str,
        options: &FetchOptions,
    ) -> Result<CachedDocument, FetchError> {
        let freshness = options.freshness.unwrap_or(self.freshness);
        if let Some(path) = self.cache.fresh(cache_key, freshness).await? {
            debug!(path = %path.display(), cache_key, "reading cached document");
            return self.cache.read(&path).await;
        }

        let span = info_span!("http_fetch", url, cache_key);
        self.fetch_live(url, cache_key, options.payload.as_ref())
            .instrument(span)
            .await
    }

    pub async fn fetch_text(
        &self,
        url: &str,
        cache_key: &str,
        encoding: Option<&str>,
    ) -> Result<(CachedDocument, String), FetchError> {
        let doc = self.fetch(url, cache_key).await?;
        let text = doc.text(encoding)?;
        Ok((doc, text))
    }

    pub async fn fetch_json(
        &self,
        url: &str,
        cache_key: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<(CachedDocument, serde_json::Value), FetchError> {
        let options = FetchOptions {
            payload,
            ..Default::default()
        };
        let doc = self.fetch_with(url, cache_key, &options).await?;
        let value = doc.json()?;
        Ok((doc, value))
    }

    async fn fetch_live(
        &self,
        url: &str,
        cache_key: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<CachedDocument, FetchError> {
        tokio::time::sleep(self.crawl_delay).await;
        info!("requesting document");

        let request = match payload {
            Some(body) => self.client.post(url).json(body),
            None => self.client.get(url),
        };
        let response = request.send().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?
            .to_vec();
        let path = self
            .cache
            .store(Local::now().date_naive(), cache_key, &body)
            .await?;
        let fetched_at = modified_at(&path).await?;
        Ok(CachedDocument {
            path,
            body,
            fetched_at,
            from_cache: false,
        })
    }
}
