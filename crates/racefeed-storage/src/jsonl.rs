//! JSON-Lines files (one serialized record per line) and atomic file writes.

use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// One parsed line. `line` is 1-based so it can be quoted in skip logs.
#[derive(Debug)]
pub struct JsonlLine<T> {
    pub line: usize,
    pub value: Result<T, serde_json::Error>,
}

pub async fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    for item in items {
        serde_json::to_writer(&mut buf, item).context("serializing jsonl record")?;
        buf.push(b'\n');
    }
    write_atomic(path, &buf).await
}

/// Write to a hidden sibling temp file, then rename over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::File::create(&temp_path)
        .await
        .with_context(|| format!("creating temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    file.flush().await?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("renaming into {}", path.display()));
    }
    Ok(())
}

/// Parse every non-blank line. Per-line failures are returned, not raised.
pub async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<JsonlLine<T>>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(text
        .lines()
        .enumerate()
        .filter(|(_, raw)| !raw.trim().is_empty())
        .map(|(idx, raw)| JsonlLine {
            line: idx + 1,
            value: serde_json::from_str(raw),
        })
        .collect())
}
