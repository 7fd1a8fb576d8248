//! Free-text date and location normalization through a remote oracle.

use std::sync::Arc;

use async_trait::async_trait;
use racefeed_core::{
    Confidence, DateFields, DateRange, Location, LocationFields, RawEvent, ValidationError,
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum NormalizationError {
    #[error("oracle configuration error: {0}")]
    Config(String),
    #[error("oracle network error: {0}")]
    Network(String),
    #[error("oracle api error: {0}")]
    Api(String),
    #[error("oracle response does not match schema: {0}")]
    Schema(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Structured parsing of one free-text span. Implementations must return an
/// error rather than fields that do not match the response schema.
#[async_trait]
pub trait NormalizationOracle: Send + Sync {
    async fn parse_date(&self, text: &str) -> Result<DateFields, NormalizationError>;
    async fn parse_location(&self, text: &str) -> Result<LocationFields, NormalizationError>;
}

#[derive(Clone)]
pub struct Normalizer {
    oracle: Arc<dyn NormalizationOracle>,
}

impl Normalizer {
    pub fn new(oracle: Arc<dyn NormalizationOracle>) -> Self {
        Self { oracle }
    }

    /// Single pass over `"{date} {title}"`; the title often carries the year.
    pub async fn normalize_date(&self, event: &RawEvent) -> Result<DateRange, NormalizationError> {
        if event.date().trim().is_empty() {
            return Err(ValidationError::EmptyDateRaw.into());
        }
        let query = format!("{} {}", event.date(), event.title());
        let fields = self.oracle.parse_date(&query).await?;
        Ok(DateRange::new(event.date(), fields)?)
    }

    /// Raw place text first; only an answer the oracle itself marks low gets
    /// exactly one retry with the title appended, and that answer is final.
    pub async fn normalize_location(&self, event: &RawEvent) -> Result<Location, NormalizationError> {
        if event.local().trim().is_empty() {
            return Err(ValidationError::EmptyLocationRaw.into());
        }
        let mut fields = self.oracle.parse_location(event.local()).await?;
        if fields.confidence == Confidence::Low {
            let enriched = format!("{} {}", event.local(), event.title());
            debug!(query = %enriched, "retrying low-confidence location");
            fields = self.oracle.parse_location(&enriched).await?;
        }
        Ok(Location::new(event.local(), fields)?)
    }
}
