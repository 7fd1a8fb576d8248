//! Gold stage: forward-looking feed export from the silver table.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use racefeed_core::FeedRow;
use racefeed_storage::jsonl::write_atomic;
use racefeed_storage::{EventStore, FeedCandidate};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

/// Rows whose start date parses as an ISO date strictly after `today`.
pub fn upcoming_rows(candidates: &[FeedCandidate], today: NaiveDate) -> Vec<FeedRow> {
    candidates
        .iter()
        .filter_map(|c| {
            let date = NaiveDate::parse_from_str(c.start_date.as_deref()?, "%Y-%m-%d").ok()?;
            (date > today).then(|| FeedRow {
                title: c.title.clone(),
                url: c.url.clone(),
                date,
                city: c.city.clone(),
                uf: c.uf.clone(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedManifest {
    pub schema_version: u32,
    pub generated_for: NaiveDate,
    pub rows: usize,
    pub files: Vec<FeedManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GoldReport {
    pub rows: usize,
    pub data_file: PathBuf,
    pub array_file: PathBuf,
    pub parquet_file: PathBuf,
    pub manifest_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct GoldLayer {
    root: PathBuf,
}

impl GoldLayer {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("gold"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read-only over the store: filter, then write `data.jsonl`, `feed.json`,
    /// `events.parquet` and `manifest.json`.
    pub async fn publish(&self, store: &EventStore, today: NaiveDate) -> Result<GoldReport> {
        let candidates = store.feed_candidates().await?;
        let rows = upcoming_rows(&candidates, today);

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating {}", self.root.display()))?;

        let data_file = self.root.join("data.jsonl");
        let mut data = Vec::new();
        for row in &rows {
            serde_json::to_writer(&mut data, row).context("serializing gold row")?;
            data.push(b'\n');
        }
        write_atomic(&data_file, &data)
            .await
            .context("writing gold data.jsonl")?;

        let array_file = self.root.join("feed.json");
        let array = serde_json::to_vec_pretty(&rows).context("serializing gold feed")?;
        write_atomic(&array_file, &array)
            .await
            .context("writing gold feed.json")?;

        let parquet_file = self.root.join("events.parquet");
        let parquet_rows = rows.clone();
        let parquet = tokio::task::spawn_blocking(move || encode_feed_parquet(&parquet_rows))
            .await
            .context("parquet encoder task")??;
        write_atomic(&parquet_file, &parquet)
            .await
            .context("writing gold events.parquet")?;

        let manifest = FeedManifest {
            schema_version: 1,
            generated_for: today,
            rows: rows.len(),
            files: vec![
                manifest_entry("data", &self.root, &data_file, &data),
                manifest_entry("feed", &self.root, &array_file, &array),
                manifest_entry("events", &self.root, &parquet_file, &parquet),
            ],
        };
        let manifest_file = self.root.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing gold manifest")?;
        write_atomic(&manifest_file, &bytes)
            .await
            .context("writing gold manifest.json")?;

        info!(rows = rows.len(), candidates = candidates.len(), %today, "published gold feed");
        Ok(GoldReport {
            rows: rows.len(),
            data_file,
            array_file,
            parquet_file,
            manifest_file,
        })
    }
}

/// CPU-bound; callers run it on the blocking pool.
fn encode_feed_parquet(rows: &[FeedRow]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("date", DataType::Utf8, false),
        ArrowField::new("city", DataType::Utf8, true),
        ArrowField::new("uf", DataType::Utf8, true),
    ]));

    let titles = StringArray::from(rows.iter().map(|r| Some(r.title.as_str())).collect::<Vec<_>>());
    let urls = StringArray::from(rows.iter().map(|r| Some(r.url.as_str())).collect::<Vec<_>>());
    let dates = StringArray::from(
        rows.iter()
            .map(|r| Some(r.date.format("%Y-%m-%d").to_string()))
            .collect::<Vec<_>>(),
    );
    let cities = StringArray::from(rows.iter().map(|r| r.city.as_deref()).collect::<Vec<_>>());
    let ufs = StringArray::from(rows.iter().map(|r| r.uf.as_deref()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(titles),
            Arc::new(urls),
            Arc::new(dates),
            Arc::new(cities),
            Arc::new(ufs),
        ],
    )
    .context("building feed record batch")?;

    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(&batch).context("writing feed record batch")?;
    writer.into_inner().context("closing parquet writer")
}

/// Digest of the exact bytes written, so no file is read back.
fn manifest_entry(name: &str, root: &Path, path: &Path, bytes: &[u8]) -> FeedManifestFile {
    let rel = path.strip_prefix(root).unwrap_or(path).display().to_string();
    FeedManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(Sha256::digest(bytes)),
        bytes: bytes.len() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: &str, start_date: Option<&str>) -> FeedCandidate {
        FeedCandidate {
            title: title.to_string(),
            url: format!("https://{title}.example.com/?utm_source=racefeed"),
            source: "test".to_string(),
            start_date: start_date.map(str::to_string),
            city: Some("Extrema".to_string()),
            uf: Some("MG".to_string()),
        }
    }

    #[test]
    fn only_strictly_future_parseable_dates_survive() {
        let today = NaiveDate::from_ymd_opt(2025, 10, 1).unwrap();
        let rows = upcoming_rows(
            &[
                candidate("yesterday", Some("2025-09-30")),
                candidate("today", Some("2025-10-01")),
                candidate("tomorrow", Some("2025-10-02")),
                candidate("garbage", Some("01-11-2025")),
                candidate("unknown", None),
            ],
            today,
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "tomorrow");
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2025, 10, 2).unwrap());
    }

    #[tokio::test]
    async fn publish_leaves_only_final_files_with_matching_digests() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::in_memory().await.unwrap();
        let gold = GoldLayer::new(dir.path());
        let today = NaiveDate::from_ymd_opt(2025, 10, 1).unwrap();
        gold.publish(&store, today).await.unwrap();
        let report = gold.publish(&store, today).await.unwrap();
        assert_eq!(report.rows, 0);

        let mut names: Vec<String> = std::fs::read_dir(gold.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["data.jsonl", "events.parquet", "feed.json", "manifest.json"]
        );

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&report.manifest_file).unwrap()).unwrap();
        for file in manifest["files"].as_array().unwrap() {
            let bytes = std::fs::read(gold.root().join(file["path"].as_str().unwrap())).unwrap();
            assert_eq!(file["sha256"], hex::encode(Sha256::digest(&bytes)));
            assert_eq!(file["bytes"], bytes.len() as u64);
        }
    }
}
