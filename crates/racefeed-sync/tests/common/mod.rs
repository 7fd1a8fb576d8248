#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use racefeed_adapters::{AdapterError, CrawlOutput, SourceAdapter};
use racefeed_core::{DateFields, LocationFields, RawEvent, RawEventRecord};
use racefeed_sync::normalize::{NormalizationError, NormalizationOracle};

type DateFn = Box<dyn Fn(&str) -> Result<DateFields, NormalizationError> + Send + Sync>;
type LocationFn = Box<dyn Fn(&str) -> Result<LocationFields, NormalizationError> + Send + Sync>;

/// Oracle answering from closures and counting calls.
pub struct ScriptedOracle {
    date: DateFn,
    location: LocationFn,
    pub date_calls: AtomicUsize,
    pub location_calls: AtomicUsize,
    pub location_queries: Mutex<Vec<String>>,
}

impl ScriptedOracle {
    pub fn new(
        date: impl Fn(&str) -> Result<DateFields, NormalizationError> + Send + Sync + 'static,
        location: impl Fn(&str) -> Result<LocationFields, NormalizationError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            date: Box::new(date),
            location: Box::new(location),
            date_calls: AtomicUsize::new(0),
            location_calls: AtomicUsize::new(0),
            location_queries: Mutex::new(Vec::new()),
        }
    }

    pub fn date_calls(&self) -> usize {
        self.date_calls.load(Ordering::SeqCst)
    }

    pub fn location_calls(&self) -> usize {
        self.location_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NormalizationOracle for ScriptedOracle {
    async fn parse_date(&self, text: &str) -> Result<DateFields, NormalizationError> {
        self.date_calls.fetch_add(1, Ordering::SeqCst);
        (self.date)(text)
    }

    async fn parse_location(&self, text: &str) -> Result<LocationFields, NormalizationError> {
        self.location_calls.fetch_add(1, Ordering::SeqCst);
        self.location_queries.lock().unwrap().push(text.to_string());
        (self.location)(text)
    }
}

/// Adapter returning a fixed crawl result, or a fetch failure.
pub struct StaticAdapter {
    pub source_id: String,
    pub events: Vec<RawEvent>,
    pub fail_with_status: Option<u16>,
}

#[async_trait]
impl SourceAdapter for StaticAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn crawl(&self) -> Result<CrawlOutput, AdapterError> {
        if let Some(status) = self.fail_with_status {
            return Err(AdapterError::Fetch(racefeed_storage::FetchError::HttpStatus {
                status,
                url: format!("https://{}.example.com/", self.source_id),
            }));
        }
        Ok(CrawlOutput {
            events: self.events.clone(),
            skipped: 0,
            documents: 1,
        })
    }
}

pub fn crawled_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 1, 9, 0, 0).unwrap()
}

pub fn raw_event(title: &str, local: &str, date: &str, url: &str, source: &str) -> RawEvent {
    RawEvent::new(RawEventRecord {
        title: title.to_string(),
        local: local.to_string(),
        date: date.to_string(),
        url: url.to_string(),
        source: source.to_string(),
        crawled_at: crawled_at(),
        raw_file: format!("/data/bronze/{source}/raw/2025-10-01-home.html"),
    })
    .unwrap()
}
