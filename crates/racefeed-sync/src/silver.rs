//! Silver stage: validate, dedup, normalize and tag each raw record.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use racefeed_core::{tag_url, RawEvent, RawEventRecord, SchemaEvent, SchemaEventRecord, ValidationError};
use racefeed_storage::jsonl::{read_jsonl, write_jsonl};
use racefeed_storage::StoredRawEvent;
use serde::Serialize;
use tracing::{debug, warn};

use crate::dedup::DedupEngine;
use crate::normalize::{NormalizationError, Normalizer};

#[derive(Debug)]
pub enum SkipReason {
    Malformed(String),
    Invalid(ValidationError),
    Duplicate { title: String, url: String },
    Normalization(NormalizationError),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(err) => write!(f, "malformed record: {err}"),
            Self::Invalid(err) => write!(f, "invalid record: {err}"),
            Self::Duplicate { title, url } => write!(f, "duplicate: {title}: {url}"),
            Self::Normalization(err) => write!(f, "normalization failed: {err}"),
        }
    }
}

#[derive(Debug)]
pub enum RecordOutcome {
    Persisted(SchemaEvent),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SilverTally {
    pub persisted: usize,
    pub malformed: usize,
    pub invalid: usize,
    pub duplicates: usize,
    pub normalization_failures: usize,
}

impl SilverTally {
    pub fn skipped(&self) -> usize {
        self.malformed + self.invalid + self.duplicates + self.normalization_failures
    }

    fn count(&mut self, outcome: &RecordOutcome) {
        match outcome {
            RecordOutcome::Persisted(_) => self.persisted += 1,
            RecordOutcome::Skipped(SkipReason::Malformed(_)) => self.malformed += 1,
            RecordOutcome::Skipped(SkipReason::Invalid(_)) => self.invalid += 1,
            RecordOutcome::Skipped(SkipReason::Duplicate { .. }) => self.duplicates += 1,
            RecordOutcome::Skipped(SkipReason::Normalization(_)) => self.normalization_failures += 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct SilverBatch {
    pub events: Vec<SchemaEvent>,
    pub tally: SilverTally,
}

impl SilverBatch {
    /// Tally the outcome and keep persisted events; skips are handed back for logging.
    fn record(&mut self, outcome: RecordOutcome) -> Option<SkipReason> {
        self.tally.count(&outcome);
        match outcome {
            RecordOutcome::Persisted(event) => {
                self.events.push(event);
                None
            }
            RecordOutcome::Skipped(reason) => Some(reason),
        }
    }
}

/// Per-run record processor. The dedup set lives as long as the parser.
pub struct SilverParser {
    normalizer: Normalizer,
    dedup: DedupEngine,
    tracking_source: String,
}

impl SilverParser {
    pub fn new(normalizer: Normalizer, tracking_source: impl Into<String>) -> Self {
        Self {
            normalizer,
            dedup: DedupEngine::new(),
            tracking_source: tracking_source.into(),
        }
    }

    /// Run one record through validation, dedup and normalization.
    pub async fn process(
        &mut self,
        record: RawEventRecord,
        bronze_file: Option<&str>,
    ) -> RecordOutcome {
        let raw = match RawEvent::new(record) {
            Ok(raw) => raw,
            Err(err) => return RecordOutcome::Skipped(SkipReason::Invalid(err)),
        };
        if self.dedup.is_duplicate(&raw) {
            return RecordOutcome::Skipped(SkipReason::Duplicate {
                title: raw.title().to_string(),
                url: raw.url().to_string(),
            });
        }

        let date_range = match self.normalizer.normalize_date(&raw).await {
            Ok(range) => range,
            Err(err) => return RecordOutcome::Skipped(SkipReason::Normalization(err)),
        };
        let location = match self.normalizer.normalize_location(&raw).await {
            Ok(location) => location,
            Err(err) => return RecordOutcome::Skipped(SkipReason::Normalization(err)),
        };
        let url = match tag_url(raw.url(), &self.tracking_source) {
            Ok(url) => url,
            Err(err) => return RecordOutcome::Skipped(SkipReason::Invalid(err)),
        };

        let event = SchemaEvent::new(SchemaEventRecord {
            title: raw.title().to_string(),
            url,
            raw_url: raw.url().to_string(),
            source: raw.source().to_string(),
            date_range,
            location,
            crawled_at: raw.crawled_at(),
            processed_at: Utc::now(),
            bronze_file: bronze_file.map(str::to_string),
        });
        match event {
            Ok(event) => {
                debug!(url = event.url(), "normalized record");
                RecordOutcome::Persisted(event)
            }
            Err(err) => RecordOutcome::Skipped(SkipReason::Invalid(err)),
        }
    }

    /// Process rows already loaded from the store. Each keeps the bronze file
    /// it was merged from.
    pub async fn process_records(&mut self, rows: Vec<StoredRawEvent>) -> SilverBatch {
        let mut batch = SilverBatch::default();
        for row in rows {
            let raw_file = row.record.raw_file.clone();
            let url = row.record.url.clone();
            let outcome = self.process(row.record, row.bronze_file.as_deref()).await;
            if let Some(reason) = batch.record(outcome) {
                warn!(
                    file = row.bronze_file.as_deref().unwrap_or("-"),
                    raw_file = %raw_file,
                    url = %url,
                    reason = %reason,
                    "skipping record"
                );
            }
        }
        batch
    }

    /// Process a bronze JSON-Lines file, line by line.
    pub async fn process_file(&mut self, path: &Path) -> Result<SilverBatch> {
        let bronze_file = std::path::absolute(path)
            .unwrap_or_else(|_| path.to_path_buf())
            .display()
            .to_string();
        let mut batch = SilverBatch::default();
        for line in read_jsonl::<RawEventRecord>(path).await? {
            let outcome = match line.value {
                Ok(record) => self.process(record, Some(&bronze_file)).await,
                Err(err) => RecordOutcome::Skipped(SkipReason::Malformed(err.to_string())),
            };
            if let Some(reason) = batch.record(outcome) {
                warn!(file = %bronze_file, line = line.line, reason = %reason, "skipping record");
            }
        }
        Ok(batch)
    }
}

#[derive(Debug, Clone)]
pub struct SilverLayer {
    root: PathBuf,
}

impl SilverLayer {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("silver"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<silver>/<date>.jsonl`, newest crawl first.
    pub async fn store_jsonl(&self, date: NaiveDate, events: &mut [SchemaEvent]) -> Result<PathBuf> {
        events.sort_by(|a, b| b.crawled_at().cmp(&a.crawled_at()));
        let path = self.root.join(format!("{}.jsonl", date.format("%Y-%m-%d")));
        write_jsonl(&path, events)
            .await
            .context("writing silver file")?;
        Ok(path)
    }
}
