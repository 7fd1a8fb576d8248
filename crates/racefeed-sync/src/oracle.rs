//! OpenAI-compatible structured-output client used as the normalization oracle.

use std::time::Duration;

use async_trait::async_trait;
use racefeed_core::{DateFields, LocationFields, REGION_CODES};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info_span, Instrument};

use crate::normalize::{NormalizationError, NormalizationOracle};

pub const DEFAULT_ORACLE_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ORACLE_BASE_URL: &str = "https://api.openai.com/v1";

const DATE_PROMPT: &str = "You are a date parser. Extract the event date from natural-language \
or formatted date expressions written in the Brazilian day-first convention. \
Always output ISO 8601 dates (YYYY-MM-DD). Extract exactly one start date. \
If the event spans several days set multi_day=true and give the end date, otherwise \
set multi_day=false and end_date to null. If the text has no valid date, or the month \
or year cannot be resolved, return null for every field. Ignore times of day and timezones.";

const LOCATION_PROMPT: &str = "You are a location parser specialized in Brazilian geography. \
Extract address, city and uf (Brazilian state abbreviation) from the input. \
If the text names a venue, business, park or landmark, treat it as the address and identify its city. \
If the text looks like an event name rather than a place, return null for every field. \
When a city is identified always infer its uf from your knowledge of Brazil; never leave it null. \
If you are not certain about the city and uf pair, set confidence to low. \
Use high when every field is certain and medium when some uncertainty remains. \
Normalize text to title case.";

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_ORACLE_MODEL.to_string(),
            base_url: DEFAULT_ORACLE_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OpenAiOracle {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiOracle {
    pub fn from_config(config: &OracleConfig) -> Result<Self, NormalizationError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| NormalizationError::Config("OPENAI_API_KEY not set".into()))?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| NormalizationError::Config(e.to_string()))?;
        Ok(Self {
            http,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn date_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "multi_day": {"type": ["boolean", "null"]},
                "start_date": {"type": ["string", "null"], "description": "YYYY-MM-DD"},
                "end_date": {"type": ["string", "null"], "description": "YYYY-MM-DD"}
            },
            "required": ["multi_day", "start_date", "end_date"],
            "additionalProperties": false
        })
    }

    fn location_schema() -> Value {
        let mut ufs: Vec<Value> = REGION_CODES.iter().map(|c| json!(c)).collect();
        ufs.push(Value::Null);
        json!({
            "type": "object",
            "properties": {
                "address": {"type": ["string", "null"]},
                "city": {"type": ["string", "null"]},
                "uf": {"type": ["string", "null"], "enum": ufs},
                "confidence": {"type": "string", "enum": ["low", "medium", "high"]}
            },
            "required": ["address", "city", "uf", "confidence"],
            "additionalProperties": false
        })
    }

    async fn structured<T: DeserializeOwned>(
        &self,
        name: &str,
        system: &str,
        schema: Value,
        text: &str,
    ) -> Result<T, NormalizationError> {
        let request = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": text}
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {"name": name, "strict": true, "schema": schema}
            }
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| NormalizationError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NormalizationError::Api(format!("{status}: {body}")));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| NormalizationError::Schema(e.to_string()))?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| NormalizationError::Api("empty completion".into()))?;
        debug!(%content, "oracle answered");
        serde_json::from_str(&content).map_err(|e| NormalizationError::Schema(e.to_string()))
    }
}

#[async_trait]
impl NormalizationOracle for OpenAiOracle {
    async fn parse_date(&self, text: &str) -> Result<DateFields, NormalizationError> {
        self.structured("parse_daterange", DATE_PROMPT, Self::date_schema(), text)
            .instrument(info_span!("oracle_date", model = %self.model))
            .await
    }

    async fn parse_location(&self, text: &str) -> Result<LocationFields, NormalizationError> {
        self.structured("parse_location", LOCATION_PROMPT, Self::location_schema(), text)
            .instrument(info_span!("oracle_location", model = %self.model))
            .await
    }
}
