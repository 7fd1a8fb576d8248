//! Bronze stage: per-run JSON-Lines files of raw events and the differential
//! handoff to silver.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use racefeed_core::RawEvent;
use racefeed_storage::jsonl::write_jsonl;
use racefeed_storage::{EventStore, StoredRawEvent, SCHEMA_EVENTS};
use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct BronzeLayer {
    root: PathBuf,
}

impl BronzeLayer {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("bronze"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self, source_id: &str) -> PathBuf {
        self.root.join(source_id)
    }

    /// Document cache directory handed to the source's fetcher.
    pub fn raw_dir(&self, source_id: &str) -> PathBuf {
        self.source_dir(source_id).join("raw")
    }

    fn file_name(date: NaiveDate) -> String {
        format!("{}.jsonl", date.format("%Y-%m-%d"))
    }

    /// `<bronze>/<source_id>/<date>.jsonl`
    pub async fn store_jsonl(
        &self,
        source_id: &str,
        date: NaiveDate,
        events: &[RawEvent],
    ) -> Result<PathBuf> {
        let path = self.source_dir(source_id).join(Self::file_name(date));
        write_jsonl(&path, events)
            .await
            .with_context(|| format!("writing bronze file for {source_id}"))?;
        info!(source = source_id, events = events.len(), file = %path.display(), "stored bronze file");
        Ok(path)
    }

    /// `<bronze>/<date>.jsonl` holding every source's events for the run.
    pub async fn store_combined(&self, date: NaiveDate, events: &[RawEvent]) -> Result<PathBuf> {
        let path = self.root.join(Self::file_name(date));
        write_jsonl(&path, events)
            .await
            .context("writing combined bronze file")?;
        Ok(path)
    }

    /// Newest `*.jsonl` per source directory. Sources without files are left out.
    pub async fn latest_bronze_files(&self, sources: &[&str]) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for source_id in sources {
            let dir = self.source_dir(source_id);
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("reading {}", dir.display()))
                }
            };
            let mut newest: Option<PathBuf> = None;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                if newest.as_ref().map_or(true, |n| path.file_name() > n.file_name()) {
                    newest = Some(path);
                }
            }
            out.extend(newest);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Differential,
    FullReload,
}

#[derive(Debug)]
pub struct PendingEvents {
    pub rows: Vec<StoredRawEvent>,
    pub mode: LoadMode,
}

/// Raw rows that still need silver processing.
///
/// Uses the anti-join against `schema_events`. When that table does not exist
/// yet or the query fails, every bronze row is returned instead and the
/// degraded mode is reported in `mode`.
pub async fn load_pending(store: &EventStore) -> Result<PendingEvents> {
    if !store.table_exists(SCHEMA_EVENTS).await? {
        warn!("no silver table yet; loading the full bronze table");
        return full_reload(store).await;
    }
    match store.load_new_events().await {
        Ok(rows) => {
            info!(rows = rows.len(), "loaded new bronze rows");
            Ok(PendingEvents {
                rows,
                mode: LoadMode::Differential,
            })
        }
        Err(err) => {
            warn!(error = %err, "differential load failed; loading the full bronze table");
            full_reload(store).await
        }
    }
}

async fn full_reload(store: &EventStore) -> Result<PendingEvents> {
    let rows = store.load_all_events().await?;
    Ok(PendingEvents {
        rows,
        mode: LoadMode::FullReload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use racefeed_core::RawEventRecord;
    use tempfile::tempdir;

    fn event(url: &str) -> RawEvent {
        RawEvent::new(RawEventRecord {
            title: "Desafio Batatais".to_string(),
            local: "Batatais - SP".to_string(),
            date: "07/12/2025".to_string(),
            url: url.to_string(),
            source: "peloto".to_string(),
            crawled_at: Utc.with_ymd_and_hms(2025, 10, 1, 9, 0, 0).unwrap(),
            raw_file: "/data/bronze/peloto/raw/2025-10-01-home.html".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn latest_file_per_source() {
        let dir = tempdir().expect("tempdir");
        let bronze = BronzeLayer::new(dir.path());
        let older = NaiveDate::from_ymd_opt(2025, 9, 30).unwrap();
        let newer = NaiveDate::from_ymd_opt(2025, 10, 1).unwrap();
        bronze.store_jsonl("peloto", older, &[event("https://a.example.com")]).await.unwrap();
        let latest = bronze
            .store_jsonl("peloto", newer, &[event("https://b.example.com")])
            .await
            .unwrap();

        let files = bronze.latest_bronze_files(&["peloto", "tionline"]).await.unwrap();
        assert_eq!(files, vec![latest]);
    }

    #[tokio::test]
    async fn pending_falls_back_to_full_reload_without_silver() {
        let dir = tempdir().expect("tempdir");
        let bronze = BronzeLayer::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2025, 10, 1).unwrap();
        let path = bronze
            .store_combined(date, &[event("https://a.example.com"), event("https://b.example.com")])
            .await
            .unwrap();
        assert!(path.ends_with("bronze/2025-10-01.jsonl"));

        let store = EventStore::in_memory().await.unwrap();
        store.merge_raw_events(&path).await.unwrap();
        let pending = load_pending(&store).await.unwrap();
        assert_eq!(pending.mode, LoadMode::FullReload);
        assert_eq!(pending.rows.len(), 2);
    }

    #[tokio::test]
    async fn pending_falls_back_to_full_reload_when_the_query_fails() {
        let dir = tempdir().expect("tempdir");
        let bronze = BronzeLayer::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2025, 10, 1).unwrap();
        let path = bronze
            .store_combined(date, &[event("https://a.example.com"), event("https://b.example.com")])
            .await
            .unwrap();

        let store = EventStore::in_memory().await.unwrap();
        store.merge_raw_events(&path).await.unwrap();
        // A silver table from an older layout, without the raw_url column.
        sqlx::query("CREATE TABLE schema_events (url TEXT PRIMARY KEY, title TEXT NOT NULL)")
            .execute(store.pool())
            .await
            .unwrap();
        assert!(store.table_exists(SCHEMA_EVENTS).await.unwrap());
        assert!(store.load_new_events().await.is_err());

        let pending = load_pending(&store).await.unwrap();
        assert_eq!(pending.mode, LoadMode::FullReload);
        let mut urls: Vec<_> = pending.rows.iter().map(|r| r.record.url.as_str()).collect();
        urls.sort();
        assert_eq!(urls, vec!["https://a.example.com", "https://b.example.com"]);
    }
}
