//! Durable event store backed by sqlite.
//!
//! `raw_events` mirrors bronze, `schema_events` mirrors silver. Both are keyed
//! by url and merged from JSON-Lines run files with last-write-wins upserts.

use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use racefeed_core::{RawEvent, RawEventRecord, SchemaEvent};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::jsonl::read_jsonl;

pub const RAW_EVENTS: &str = "raw_events";
pub const SCHEMA_EVENTS: &str = "schema_events";

const CREATE_RAW_EVENTS: &str = r#"
    CREATE TABLE IF NOT EXISTS raw_events (
        url TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        local TEXT NOT NULL,
        date TEXT NOT NULL,
        source TEXT NOT NULL,
        crawled_at TEXT NOT NULL,
        raw_file TEXT NOT NULL,
        bronze_file TEXT
    )
"#;

const UPSERT_RAW_EVENT: &str = r#"
    INSERT INTO raw_events (url, title, local, date, source, crawled_at, raw_file, bronze_file)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(url) DO UPDATE SET
        title = excluded.title,
        local = excluded.local,
        date = excluded.date,
        source = excluded.source,
        crawled_at = excluded.crawled_at,
        raw_file = excluded.raw_file,
        bronze_file = excluded.bronze_file
"#;

const CREATE_SCHEMA_EVENTS: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_events (
        url TEXT PRIMARY KEY,
        raw_url TEXT NOT NULL,
        title TEXT NOT NULL,
        source TEXT NOT NULL,
        date_range TEXT NOT NULL,
        location TEXT NOT NULL,
        crawled_at TEXT NOT NULL,
        processed_at TEXT NOT NULL,
        bronze_file TEXT
    )
"#;

const UPSERT_SCHEMA_EVENT: &str = r#"
    INSERT INTO schema_events
        (url, raw_url, title, source, date_range, location, crawled_at, processed_at, bronze_file)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(url) DO UPDATE SET
        raw_url = excluded.raw_url,
        title = excluded.title,
        source = excluded.source,
        date_range = excluded.date_range,
        location = excluded.location,
        crawled_at = excluded.crawled_at,
        processed_at = excluded.processed_at,
        bronze_file = excluded.bronze_file
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub merged: usize,
    pub rejected: usize,
}

/// Projection of a silver row used to build the gold feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedCandidate {
    pub title: String,
    pub url: String,
    pub source: String,
    pub start_date: Option<String>,
    pub city: Option<String>,
    pub uf: Option<String>,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid stored timestamp {raw}"))?
        .with_timezone(&Utc))
}

/// A `raw_events` row plus the bronze run file it was merged from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRawEvent {
    pub record: RawEventRecord,
    pub bronze_file: Option<String>,
}

fn stored_from_row(row: &SqliteRow) -> anyhow::Result<StoredRawEvent> {
    let crawled_at: String = row.try_get("crawled_at")?;
    Ok(StoredRawEvent {
        record: RawEventRecord {
            title: row.try_get("title")?,
            local: row.try_get("local")?,
            date: row.try_get("date")?,
            url: row.try_get("url")?,
            source: row.try_get("source")?,
            crawled_at: parse_timestamp(&crawled_at)?,
            raw_file: row.try_get("raw_file")?,
        },
        bronze_file: row.try_get("bronze_file")?,
    })
}

fn absolute_display(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

#[derive(Debug, Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url {database_url}"))?
            .create_if_missing(true);
        // A single long-lived connection keeps `sqlite::memory:` databases alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> anyhow::Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn table_exists(&self, table: &str) -> anyhow::Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Row count, or zero when the table has not been created yet.
    pub async fn count(&self, table: &str) -> anyhow::Result<i64> {
        if !self.table_exists(table).await? {
            return Ok(0);
        }
        let sql = match table {
            RAW_EVENTS => "SELECT COUNT(*) FROM raw_events",
            SCHEMA_EVENTS => "SELECT COUNT(*) FROM schema_events",
            other => anyhow::bail!("unknown table {other}"),
        };
        Ok(sqlx::query_scalar(sql).fetch_one(&self.pool).await?)
    }

    /// Upsert a bronze run file into `raw_events`. Lines that fail validation
    /// are logged and left out. Each row remembers `path` as its bronze file.
    pub async fn merge_raw_events(&self, path: &Path) -> anyhow::Result<MergeReport> {
        let bronze_file = absolute_display(path);
        let mut report = MergeReport::default();
        let mut events = Vec::new();
        for line in read_jsonl::<RawEvent>(path).await? {
            match line.value {
                Ok(event) => events.push(event),
                Err(err) => {
                    report.rejected += 1;
                    warn!(file = %path.display(), line = line.line, reason = %err, "rejected bronze line");
                }
            }
        }

        let mut tx = self.pool.begin().await.context("beginning raw_events merge")?;
        sqlx::query(CREATE_RAW_EVENTS).execute(&mut *tx).await?;
        for event in &events {
            sqlx::query(UPSERT_RAW_EVENT)
                .bind(event.url())
                .bind(event.title())
                .bind(event.local())
                .bind(event.date())
                .bind(event.source())
                .bind(timestamp(event.crawled_at()))
                .bind(event.raw_file())
                .bind(&bronze_file)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("upserting raw event {}", event.url()))?;
            report.merged += 1;
        }
        tx.commit().await.context("committing raw_events merge")?;

        info!(file = %path.display(), merged = report.merged, rejected = report.rejected, "merged bronze file");
        Ok(report)
    }

    /// Upsert a silver run file into `schema_events`.
    pub async fn merge_schema_events(&self, path: &Path) -> anyhow::Result<MergeReport> {
        let mut report = MergeReport::default();
        let mut events = Vec::new();
        for line in read_jsonl::<SchemaEvent>(path).await? {
            match line.value {
                Ok(event) => events.push(event),
                Err(err) => {
                    report.rejected += 1;
                    warn!(file = %path.display(), line = line.line, reason = %err, "rejected silver line");
                }
            }
        }

        let mut tx = self.pool.begin().await.context("beginning schema_events merge")?;
        sqlx::query(CREATE_SCHEMA_EVENTS).execute(&mut *tx).await?;
        for event in &events {
            let date_range = serde_json::to_string(event.date_range())?;
            let location = serde_json::to_string(event.location())?;
            sqlx::query(UPSERT_SCHEMA_EVENT)
                .bind(event.url())
                .bind(event.raw_url())
                .bind(event.title())
                .bind(event.source())
                .bind(date_range)
                .bind(location)
                .bind(timestamp(event.crawled_at()))
                .bind(timestamp(event.processed_at()))
                .bind(event.bronze_file())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("upserting schema event {}", event.url()))?;
            report.merged += 1;
        }
        tx.commit().await.context("committing schema_events merge")?;

        info!(file = %path.display(), merged = report.merged, rejected = report.rejected, "merged silver file");
        Ok(report)
    }

    /// Raw events with no silver counterpart, or whose title, date or place
    /// text changed since the silver row was built. Fails when either table
    /// is missing.
    pub async fn load_new_events(&self) -> anyhow::Result<Vec<StoredRawEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT r.url, r.title, r.local, r.date, r.source, r.crawled_at, r.raw_file,
                   r.bronze_file
              FROM raw_events r
              LEFT JOIN schema_events s ON r.url = s.raw_url
             WHERE s.url IS NULL
                OR r.title <> s.title
                OR r.date <> json_extract(s.date_range, '$.date_raw')
                OR r.local <> json_extract(s.location, '$.location_raw')
             ORDER BY r.crawled_at DESC, r.url
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("querying raw events without silver rows")?;

        rows.iter().map(stored_from_row).collect()
    }

    pub async fn load_all_events(&self) -> anyhow::Result<Vec<StoredRawEvent>> {
        if !self.table_exists(RAW_EVENTS).await? {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT url, title, local, date, source, crawled_at, raw_file, bronze_file
              FROM raw_events
             ORDER BY crawled_at DESC, url
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(stored_from_row).collect()
    }

    pub async fn load_schema_events(&self) -> anyhow::Result<Vec<SchemaEvent>> {
        if !self.table_exists(SCHEMA_EVENTS).await? {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT url, raw_url, title, source, date_range, location,
                   crawled_at, processed_at, bronze_file
              FROM schema_events
             ORDER BY crawled_at DESC, url
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let date_range: String = row.try_get("date_range")?;
            let location: String = row.try_get("location")?;
            let crawled_at: String = row.try_get("crawled_at")?;
            let processed_at: String = row.try_get("processed_at")?;
            let record = racefeed_core::SchemaEventRecord {
                title: row.try_get("title")?,
                url: row.try_get("url")?,
                raw_url: row.try_get("raw_url")?,
                source: row.try_get("source")?,
                date_range: serde_json::from_str(&date_range)?,
                location: serde_json::from_str(&location)?,
                crawled_at: parse_timestamp(&crawled_at)?,
                processed_at: parse_timestamp(&processed_at)?,
                bronze_file: row.try_get("bronze_file")?,
            };
            out.push(SchemaEvent::new(record)?);
        }
        Ok(out)
    }

    /// Silver rows projected to the fields the gold feed needs. Empty when no
    /// silver table exists yet.
    pub async fn feed_candidates(&self) -> anyhow::Result<Vec<FeedCandidate>> {
        if !self.table_exists(SCHEMA_EVENTS).await? {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT title,
                   url,
                   source,
                   json_extract(date_range, '$.start_date') AS start_date,
                   json_extract(location, '$.city') AS city,
                   json_extract(location, '$.uf') AS uf
              FROM schema_events
             ORDER BY start_date, title
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(FeedCandidate {
                title: row.try_get("title")?,
                url: row.try_get("url")?,
                source: row.try_get("source")?,
                start_date: row.try_get("start_date")?,
                city: row.try_get("city")?,
                uf: row.try_get("uf")?,
            });
        }
        Ok(out)
    }
}
