//! Core event model and validation gates for racefeed.
//!
//! Every record type here is validated at construction and on deserialization,
//! so a value that exists is a value that passed its invariants.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::{Host, Url};

pub const CRATE_NAME: &str = "racefeed-core";

/// Query parameter injected into every published event URL.
pub const TRACKING_PARAM: &str = "utm_source";

pub const DEFAULT_TRACKING_SOURCE: &str = "racefeed";

/// Brazilian federative unit codes accepted in [`Location::uf`].
pub const REGION_CODES: [&str; 27] = [
    "AC", "AL", "AP", "AM", "BA", "CE", "DF", "ES", "GO", "MA", "MT", "MS", "MG", "PA", "PB", "PR",
    "PE", "PI", "RJ", "RN", "RS", "RO", "RR", "SC", "SP", "SE", "TO",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("title cannot be empty")]
    EmptyTitle,
    #[error("url cannot be empty")]
    EmptyUrl,
    #[error("malformed url: {0}")]
    MalformedUrl(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("date_raw cannot be empty")]
    EmptyDateRaw,
    #[error("location_raw cannot be empty")]
    EmptyLocationRaw,
    #[error("unknown region code: {0}")]
    InvalidRegionCode(String),
}

pub fn is_region_code(code: &str) -> bool {
    REGION_CODES.contains(&code)
}

/// Repair a missing scheme (assume HTTPS) and validate the result as an
/// absolute http(s) URL with a resolvable host.
pub fn repair_url(input: &str) -> Result<String, ValidationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyUrl);
    }

    let candidate = if has_scheme(trimmed) {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let parsed =
        Url::parse(&candidate).map_err(|_| ValidationError::MalformedUrl(candidate.clone()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::InvalidUrl(candidate));
    }
    match parsed.host() {
        None => Err(ValidationError::MalformedUrl(candidate)),
        Some(Host::Domain(domain)) if !is_plausible_domain(domain) => {
            Err(ValidationError::InvalidUrl(candidate))
        }
        Some(_) => Ok(candidate),
    }
}

fn has_scheme(input: &str) -> bool {
    input
        .split_once("://")
        .map(|(scheme, _)| {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        })
        .unwrap_or(false)
}

fn is_plausible_domain(domain: &str) -> bool {
    if domain == "localhost" {
        return true;
    }
    let labels = domain.trim_end_matches('.').split('.').collect::<Vec<_>>();
    if labels.len() < 2 {
        return false;
    }
    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    let tld = labels.last().copied().unwrap_or_default();
    labels_ok && tld.len() >= 2 && tld.chars().any(|c| c.is_ascii_alphabetic())
}

/// Set the tracking parameter on `url`, replacing any existing value.
///
/// Applying this twice yields the same URL as applying it once.
pub fn tag_url(url: &str, tracking_source: &str) -> Result<String, ValidationError> {
    let mut parsed = Url::parse(url).map_err(|_| ValidationError::InvalidUrl(url.to_string()))?;
    let kept = parsed
        .query_pairs()
        .filter(|(key, _)| key != TRACKING_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect::<Vec<_>>();
    parsed
        .query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(TRACKING_PARAM, tracking_source);
    Ok(parsed.into())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Unvalidated wire shape of a [`RawEvent`], as written to bronze files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEventRecord {
    pub title: String,
    pub local: String,
    pub date: String,
    pub url: String,
    pub source: String,
    pub crawled_at: DateTime<Utc>,
    pub raw_file: String,
}

/// One harvested listing plus provenance. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEventRecord")]
pub struct RawEvent {
    title: String,
    local: String,
    date: String,
    url: String,
    source: String,
    crawled_at: DateTime<Utc>,
    raw_file: String,
}

impl RawEvent {
    pub fn new(record: RawEventRecord) -> Result<Self, ValidationError> {
        let title = record.title.trim().to_string();
        if title.is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        let url = repair_url(&record.url)?;
        Ok(Self {
            title,
            local: record.local.trim().to_string(),
            date: record.date.trim().to_string(),
            url,
            source: record.source,
            crawled_at: record.crawled_at,
            raw_file: record.raw_file,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn crawled_at(&self) -> DateTime<Utc> {
        self.crawled_at
    }

    pub fn raw_file(&self) -> &str {
        &self.raw_file
    }

    /// In-run identity used by deduplication.
    pub fn identity(&self) -> (String, String) {
        (self.title.clone(), self.url.clone())
    }

    pub fn to_record(&self) -> RawEventRecord {
        RawEventRecord {
            title: self.title.clone(),
            local: self.local.clone(),
            date: self.date.clone(),
            url: self.url.clone(),
            source: self.source.clone(),
            crawled_at: self.crawled_at,
            raw_file: self.raw_file.clone(),
        }
    }
}

impl TryFrom<RawEventRecord> for RawEvent {
    type Error = ValidationError;

    fn try_from(record: RawEventRecord) -> Result<Self, Self::Error> {
        Self::new(record)
    }
}

/// Structured date fields as returned by the normalization oracle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DateFields {
    pub multi_day: Option<bool>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRangeRecord {
    pub date_raw: String,
    pub multi_day: Option<bool>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// Normalized date span. `end_date` is only kept for multi-day events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DateRangeRecord")]
pub struct DateRange {
    date_raw: String,
    multi_day: Option<bool>,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(date_raw: &str, fields: DateFields) -> Result<Self, ValidationError> {
        let date_raw = date_raw.trim();
        if date_raw.is_empty() {
            return Err(ValidationError::EmptyDateRaw);
        }
        let end_date = if fields.multi_day == Some(true) {
            fields.end_date
        } else {
            None
        };
        Ok(Self {
            date_raw: date_raw.to_string(),
            multi_day: fields.multi_day,
            start_date: fields.start_date,
            end_date,
        })
    }

    pub fn date_raw(&self) -> &str {
        &self.date_raw
    }

    pub fn multi_day(&self) -> Option<bool> {
        self.multi_day
    }

    pub fn start_date(&self) -> Option<NaiveDate> {
        self.start_date
    }

    pub fn end_date(&self) -> Option<NaiveDate> {
        self.end_date
    }
}

impl TryFrom<DateRangeRecord> for DateRange {
    type Error = ValidationError;

    fn try_from(record: DateRangeRecord) -> Result<Self, Self::Error> {
        Self::new(
            &record.date_raw,
            DateFields {
                multi_day: record.multi_day,
                start_date: record.start_date,
                end_date: record.end_date,
            },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Structured location fields as returned by the normalization oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocationFields {
    pub address: Option<String>,
    pub city: Option<String>,
    pub uf: Option<String>,
    pub confidence: Confidence,
}

impl LocationFields {
    pub fn unknown(confidence: Confidence) -> Self {
        Self {
            address: None,
            city: None,
            uf: None,
            confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub location_raw: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub uf: Option<String>,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LocationRecord")]
pub struct Location {
    location_raw: String,
    address: Option<String>,
    city: Option<String>,
    uf: Option<String>,
    confidence: Confidence,
}

impl Location {
    pub fn new(location_raw: &str, fields: LocationFields) -> Result<Self, ValidationError> {
        let location_raw = location_raw.trim();
        if location_raw.is_empty() {
            return Err(ValidationError::EmptyLocationRaw);
        }
        let uf = non_blank(fields.uf).map(|uf| uf.to_ascii_uppercase());
        if let Some(code) = &uf {
            if !is_region_code(code) {
                return Err(ValidationError::InvalidRegionCode(code.clone()));
            }
        }
        Ok(Self {
            location_raw: location_raw.to_string(),
            address: non_blank(fields.address),
            city: non_blank(fields.city),
            uf,
            confidence: fields.confidence,
        })
    }

    pub fn location_raw(&self) -> &str {
        &self.location_raw
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn city(&self) -> Option<&str> {
        self.city.as_deref()
    }

    pub fn uf(&self) -> Option<&str> {
        self.uf.as_deref()
    }

    pub fn confidence(&self) -> Confidence {
        self.confidence
    }
}

impl TryFrom<LocationRecord> for Location {
    type Error = ValidationError;

    fn try_from(record: LocationRecord) -> Result<Self, Self::Error> {
        Self::new(
            &record.location_raw,
            LocationFields {
                address: record.address,
                city: record.city,
                uf: record.uf,
                confidence: record.confidence,
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEventRecord {
    pub title: String,
    pub url: String,
    pub raw_url: String,
    pub source: String,
    pub date_range: DateRange,
    pub location: Location,
    pub crawled_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    #[serde(default)]
    pub bronze_file: Option<String>,
}

/// Canonical normalized event. `url` carries the tracking tag; `raw_url` is the
/// bronze key it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SchemaEventRecord")]
pub struct SchemaEvent {
    title: String,
    url: String,
    raw_url: String,
    source: String,
    date_range: DateRange,
    location: Location,
    crawled_at: DateTime<Utc>,
    processed_at: DateTime<Utc>,
    bronze_file: Option<String>,
}

impl SchemaEvent {
    pub fn new(record: SchemaEventRecord) -> Result<Self, ValidationError> {
        if record.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        if record.url.trim().is_empty() || record.raw_url.trim().is_empty() {
            return Err(ValidationError::EmptyUrl);
        }
        Ok(Self {
            title: record.title,
            url: record.url,
            raw_url: record.raw_url,
            source: record.source,
            date_range: record.date_range,
            location: record.location,
            crawled_at: record.crawled_at,
            processed_at: record.processed_at,
            bronze_file: record.bronze_file,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn raw_url(&self) -> &str {
        &self.raw_url
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn date_range(&self) -> &DateRange {
        &self.date_range
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn crawled_at(&self) -> DateTime<Utc> {
        self.crawled_at
    }

    pub fn processed_at(&self) -> DateTime<Utc> {
        self.processed_at
    }

    pub fn bronze_file(&self) -> Option<&str> {
        self.bronze_file.as_deref()
    }
}

impl TryFrom<SchemaEventRecord> for SchemaEvent {
    type Error = ValidationError;

    fn try_from(record: SchemaEventRecord) -> Result<Self, Self::Error> {
        Self::new(record)
    }
}

/// One published row of the gold feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRow {
    pub title: String,
    pub url: String,
    pub date: NaiveDate,
    pub city: Option<String>,
    pub uf: Option<String>,
}
