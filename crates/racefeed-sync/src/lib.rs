//! Pipeline orchestration: crawl into bronze, normalize into silver, publish gold.

pub mod bronze;
pub mod dedup;
pub mod gold;
pub mod normalize;
pub mod oracle;
pub mod silver;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use racefeed_adapters::{adapter_for_source, JsonListingCrawler, JsonSourceDefinition, SourceAdapter};
use racefeed_core::DEFAULT_TRACKING_SOURCE;
use racefeed_storage::{EventStore, Fetcher, FetcherConfig, DEFAULT_USER_AGENT};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bronze::{load_pending, BronzeLayer, LoadMode};
use crate::gold::{GoldLayer, GoldReport};
use crate::normalize::{NormalizationOracle, Normalizer};
use crate::oracle::{OpenAiOracle, OracleConfig, DEFAULT_ORACLE_BASE_URL, DEFAULT_ORACLE_MODEL};
use crate::silver::{SilverLayer, SilverParser, SilverTally};

pub const CRATE_NAME: &str = "racefeed-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
    /// Declares a JSON listing source; without it a built-in adapter is looked up.
    #[serde(default)]
    pub json: Option<JsonSourceDefinition>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub database_url: String,
    pub sources_file: PathBuf,
    pub fetcher: FetcherConfig,
    pub tracking_source: String,
    pub oracle: OracleConfig,
    pub scheduler_enabled: bool,
    pub cron: String,
}

impl PipelineConfig {
    /// Defaults rooted at `data_dir`, with no environment lookups.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            database_url: format!("sqlite://{}?mode=rwc", data_dir.join("events.sqlite").display()),
            data_dir,
            sources_file: PathBuf::from("sources.yaml"),
            fetcher: FetcherConfig::default(),
            tracking_source: DEFAULT_TRACKING_SOURCE.to_string(),
            oracle: OracleConfig::default(),
            scheduler_enabled: false,
            cron: "0 0 6 * * *".to_string(),
        }
    }

    pub fn from_env() -> Self {
        let data_dir = std::env::var("RACEFEED_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let defaults = Self::for_data_dir(data_dir);
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            sources_file: std::env::var("RACEFEED_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            fetcher: FetcherConfig {
                timeout: Duration::from_secs(env_u64("RACEFEED_HTTP_TIMEOUT_SECS", 20)),
                user_agent: std::env::var("RACEFEED_USER_AGENT")
                    .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
                crawl_delay: Duration::from_secs(env_u64("RACEFEED_CRAWL_DELAY_SECS", 1)),
                freshness: Duration::from_secs(env_u64("RACEFEED_FRESHNESS_HOURS", 23) * 60 * 60),
            },
            tracking_source: std::env::var("RACEFEED_TRACKING_SOURCE")
                .unwrap_or(defaults.tracking_source),
            oracle: OracleConfig {
                api_key: std::env::var("OPENAI_API_KEY").ok(),
                model: std::env::var("RACEFEED_ORACLE_MODEL")
                    .unwrap_or_else(|_| DEFAULT_ORACLE_MODEL.to_string()),
                base_url: std::env::var("RACEFEED_ORACLE_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_ORACLE_BASE_URL.to_string()),
                ..OracleConfig::default()
            },
            scheduler_enabled: env_flag("RACEFEED_SCHEDULER_ENABLED"),
            cron: std::env::var("RACEFEED_CRON").unwrap_or(defaults.cron),
            data_dir: defaults.data_dir,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlSummary {
    pub events_by_source: BTreeMap<String, usize>,
    pub skipped_items: usize,
    pub failed_sources: Vec<String>,
    pub bronze_files: Vec<PathBuf>,
    pub bronze_rows_merged: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SilverSummary {
    pub load_mode: LoadMode,
    pub pending: usize,
    pub tally: SilverTally,
    pub silver_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub crawl: CrawlSummary,
    pub silver: SilverSummary,
    pub gold: GoldReport,
}

/// One pipeline over one store. Stages run sequentially and assume they are
/// the only writer.
pub struct Pipeline {
    config: PipelineConfig,
    store: EventStore,
    http: reqwest::Client,
    bronze: BronzeLayer,
    silver: SilverLayer,
    gold: GoldLayer,
    oracle: Option<Arc<dyn NormalizationOracle>>,
}

impl Pipeline {
    pub async fn new(config: PipelineConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("creating {}", config.data_dir.display()))?;
        let store = EventStore::connect(&config.database_url).await?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: PipelineConfig, store: EventStore) -> Result<Self> {
        let http = Fetcher::build_client(&config.fetcher)?;
        Ok(Self {
            bronze: BronzeLayer::new(&config.data_dir),
            silver: SilverLayer::new(&config.data_dir),
            gold: GoldLayer::new(&config.data_dir),
            config,
            store,
            http,
            oracle: None,
        })
    }

    /// Replace the oracle built from configuration.
    pub fn with_oracle(mut self, oracle: Arc<dyn NormalizationOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn bronze(&self) -> &BronzeLayer {
        &self.bronze
    }

    /// Fetcher whose cache lives under `<bronze>/<source_id>/raw`.
    pub fn fetcher_for(&self, source_id: &str) -> Fetcher {
        Fetcher::with_client(
            self.http.clone(),
            &self.config.fetcher,
            self.bronze.raw_dir(source_id),
        )
    }

    fn normalizer(&self) -> Result<Normalizer> {
        let oracle: Arc<dyn NormalizationOracle> = match &self.oracle {
            Some(oracle) => oracle.clone(),
            None => Arc::new(OpenAiOracle::from_config(&self.config.oracle)?),
        };
        Ok(Normalizer::new(oracle))
    }

    pub async fn adapters(&self) -> Result<Vec<Box<dyn SourceAdapter>>> {
        let registry = SourceRegistry::load(&self.config.sources_file).await?;
        let mut adapters = Vec::new();
        for source in registry.enabled() {
            let fetcher = self.fetcher_for(&source.source_id);
            let adapter: Box<dyn SourceAdapter> = match &source.json {
                Some(definition) => Box::new(JsonListingCrawler::new(
                    &source.source_id,
                    definition.clone(),
                    fetcher,
                )),
                None => adapter_for_source(&source.source_id, fetcher)
                    .with_context(|| format!("building adapter for {}", source.source_id))?,
            };
            adapters.push(adapter);
        }
        Ok(adapters)
    }

    pub async fn run_crawl(&self, today: NaiveDate) -> Result<CrawlSummary> {
        let adapters = self.adapters().await?;
        self.crawl_with(&adapters, today).await
    }

    /// Crawl sources one at a time. A failing source is logged and tallied;
    /// the others still run.
    pub async fn crawl_with(
        &self,
        adapters: &[Box<dyn SourceAdapter>],
        today: NaiveDate,
    ) -> Result<CrawlSummary> {
        let mut summary = CrawlSummary::default();
        let mut combined = Vec::new();

        for adapter in adapters {
            let source_id = adapter.source_id().to_string();
            let output = match adapter.crawl().await {
                Ok(output) => output,
                Err(err) => {
                    error!(source = %source_id, error = %err, "crawl failed");
                    summary.failed_sources.push(source_id);
                    continue;
                }
            };
            summary.skipped_items += output.skipped;
            summary
                .events_by_source
                .insert(source_id.clone(), output.events.len());
            if output.events.is_empty() {
                continue;
            }
            let path = self.bronze.store_jsonl(&source_id, today, &output.events).await?;
            summary.bronze_files.push(path);
            combined.extend(output.events);
        }

        if !combined.is_empty() {
            let path = self.bronze.store_combined(today, &combined).await?;
            let report = self.store.merge_raw_events(&path).await?;
            summary.bronze_rows_merged = report.merged;
        }
        Ok(summary)
    }

    /// Normalize every bronze row that has no silver counterpart yet.
    pub async fn run_silver(&self, today: NaiveDate) -> Result<SilverSummary> {
        let pending = load_pending(&self.store).await?;
        let mut summary = SilverSummary {
            load_mode: pending.mode,
            pending: pending.rows.len(),
            tally: SilverTally::default(),
            silver_file: None,
        };
        if pending.rows.is_empty() {
            info!("no pending bronze rows");
            return Ok(summary);
        }

        let mut parser = SilverParser::new(self.normalizer()?, self.config.tracking_source.clone());
        let mut batch = parser.process_records(pending.rows).await;
        summary.tally = batch.tally;
        if !batch.events.is_empty() {
            let path = self.silver.store_jsonl(today, &mut batch.events).await?;
            self.store.merge_schema_events(&path).await?;
            summary.silver_file = Some(path);
        }
        info!(
            mode = ?summary.load_mode,
            persisted = summary.tally.persisted,
            skipped = summary.tally.skipped(),
            "silver stage finished"
        );
        Ok(summary)
    }

    /// Normalize one bronze file directly, bypassing the differential load.
    pub async fn run_silver_file(&self, path: &Path, today: NaiveDate) -> Result<SilverSummary> {
        let mut parser = SilverParser::new(self.normalizer()?, self.config.tracking_source.clone());
        let mut batch = parser.process_file(path).await?;
        let mut summary = SilverSummary {
            load_mode: LoadMode::FullReload,
            pending: batch.tally.persisted + batch.tally.skipped(),
            tally: batch.tally,
            silver_file: None,
        };
        if !batch.events.is_empty() {
            let silver_path = self.silver.store_jsonl(today, &mut batch.events).await?;
            self.store.merge_schema_events(&silver_path).await?;
            summary.silver_file = Some(silver_path);
        }
        Ok(summary)
    }

    pub async fn run_gold(&self, today: NaiveDate) -> Result<GoldReport> {
        self.gold.publish(&self.store, today).await
    }

    pub async fn run_once(&self, today: NaiveDate) -> Result<RunSummary> {
        let adapters = self.adapters().await?;
        self.run_with(&adapters, today).await
    }

    pub async fn run_with(
        &self,
        adapters: &[Box<dyn SourceAdapter>],
        today: NaiveDate,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, %today, "pipeline run started");

        let crawl = self.crawl_with(adapters, today).await?;
        let silver = self.run_silver(today).await?;
        let gold = self.run_gold(today).await?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            crawl,
            silver,
            gold,
        };
        if !summary.crawl.failed_sources.is_empty() {
            warn!(failed = ?summary.crawl.failed_sources, "run finished with failed sources");
        }
        info!(%run_id, gold_rows = summary.gold.rows, "pipeline run finished");
        Ok(summary)
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

/// Cron job running the whole pipeline. The mutex keeps runs single-writer
/// when a tick fires while the previous run is still going.
pub async fn maybe_build_scheduler(
    pipeline: Arc<Mutex<Pipeline>>,
) -> Result<Option<JobScheduler>> {
    let cron = {
        let guard = pipeline.lock().await;
        if !guard.config().scheduler_enabled {
            return Ok(None);
        }
        guard.config().cron.clone()
    };

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            let guard = pipeline.lock().await;
            match guard.run_once(Local::now().date_naive()).await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled run finished"),
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let pipeline = Pipeline::new(PipelineConfig::from_env()).await?;
    let summary = pipeline.run_once(Local::now().date_naive()).await;
    pipeline.close().await;
    summary
}
