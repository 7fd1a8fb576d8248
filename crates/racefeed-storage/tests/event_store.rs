use chrono::{TimeZone, Utc};
use racefeed_core::{
    Confidence, DateFields, DateRange, Location, LocationFields, RawEvent, RawEventRecord,
    SchemaEvent, SchemaEventRecord,
};
use racefeed_storage::jsonl::write_jsonl;
use racefeed_storage::{EventStore, RAW_EVENTS, SCHEMA_EVENTS};
use tempfile::tempdir;

fn raw(title: &str, url: &str, hour: u32) -> RawEvent {
    RawEvent::new(RawEventRecord {
        title: title.to_string(),
        local: "Extrema/MG".to_string(),
        date: "01/11/2025".to_string(),
        url: url.to_string(),
        source: "tionline".to_string(),
        crawled_at: Utc.with_ymd_and_hms(2025, 10, 1, hour, 0, 0).unwrap(),
        raw_file: "/data/bronze/tionline/raw/2025-10-01-home.html".to_string(),
    })
    .unwrap()
}

fn schema(raw: &RawEvent) -> SchemaEvent {
    SchemaEvent::new(SchemaEventRecord {
        title: raw.title().to_string(),
        url: format!("{}?utm_source=racefeed", raw.url()),
        raw_url: raw.url().to_string(),
        source: raw.source().to_string(),
        date_range: DateRange::new(
            raw.date(),
            DateFields {
                multi_day: Some(false),
                start_date: chrono::NaiveDate::from_ymd_opt(2025, 11, 1),
                end_date: None,
            },
        )
        .unwrap(),
        location: Location::new(
            raw.local(),
            LocationFields {
                address: None,
                city: Some("Extrema".to_string()),
                uf: Some("mg".to_string()),
                confidence: Confidence::High,
            },
        )
        .unwrap(),
        crawled_at: raw.crawled_at(),
        processed_at: Utc.with_ymd_and_hms(2025, 10, 1, 12, 0, 0).unwrap(),
        bronze_file: None,
    })
    .unwrap()
}

#[tokio::test]
async fn merging_the_same_file_twice_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("2025-10-01.jsonl");
    write_jsonl(&path, &[raw("A", "https://a.example.com/", 9), raw("B", "https://b.example.com/", 9)])
        .await
        .unwrap();

    let store = EventStore::in_memory().await.unwrap();
    assert_eq!(store.count(RAW_EVENTS).await.unwrap(), 0);
    store.merge_raw_events(&path).await.unwrap();
    let first = store.load_all_events().await.unwrap();
    let report = store.merge_raw_events(&path).await.unwrap();
    assert_eq!(report.merged, 2);
    assert_eq!(store.load_all_events().await.unwrap(), first);
    assert_eq!(store.count(RAW_EVENTS).await.unwrap(), 2);
}

#[tokio::test]
async fn later_runs_overwrite_rows_with_the_same_url() {
    let dir = tempdir().expect("tempdir");
    let older = dir.path().join("old.jsonl");
    let newer = dir.path().join("new.jsonl");
    write_jsonl(&older, &[raw("Old title", "https://a.example.com/", 8)]).await.unwrap();
    write_jsonl(&newer, &[raw("New title", "https://a.example.com/", 10)]).await.unwrap();

    let store = EventStore::in_memory().await.unwrap();
    store.merge_raw_events(&older).await.unwrap();
    store.merge_raw_events(&newer).await.unwrap();

    let rows = store.load_all_events().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].record.title, "New title");
    assert!(rows[0].bronze_file.as_deref().is_some_and(|f| f.ends_with("new.jsonl")));
}

#[tokio::test]
async fn invalid_lines_are_rejected_not_fatal() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("mixed.jsonl");
    let mut text = serde_json::to_string(&raw("A", "https://a.example.com/", 9)).unwrap();
    text.push('\n');
    text.push_str(r#"{"title":"","local":"x","date":"y","url":"https://z.example.com","source":"s","crawled_at":"2025-10-01T09:00:00Z","raw_file":"f"}"#);
    text.push('\n');
    tokio::fs::write(&path, text).await.unwrap();

    let store = EventStore::in_memory().await.unwrap();
    let report = store.merge_raw_events(&path).await.unwrap();
    assert_eq!(report.merged, 1);
    assert_eq!(report.rejected, 1);
}

#[tokio::test]
async fn new_events_exclude_urls_already_in_silver() {
    let dir = tempdir().expect("tempdir");
    let bronze = dir.path().join("bronze.jsonl");
    let silver = dir.path().join("silver.jsonl");
    let a = raw("A", "https://a.example.com/", 9);
    let b = raw("B", "https://b.example.com/", 9);
    write_jsonl(&bronze, &[a.clone(), b.clone()]).await.unwrap();
    write_jsonl(&silver, &[schema(&a)]).await.unwrap();

    let store = EventStore::in_memory().await.unwrap();
    store.merge_raw_events(&bronze).await.unwrap();
    assert!(store.load_new_events().await.is_err());
    assert!(!store.table_exists(SCHEMA_EVENTS).await.unwrap());

    store.merge_schema_events(&silver).await.unwrap();
    let pending = store.load_new_events().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].record.url, b.url());
    assert!(pending[0].bronze_file.as_deref().is_some_and(|f| f.ends_with("bronze.jsonl")));

    let stored = store.load_schema_events().await.unwrap();
    assert_eq!(stored, vec![schema(&a)]);

    let candidates = store.feed_candidates().await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].start_date.as_deref(), Some("2025-11-01"));
    assert_eq!(candidates[0].city.as_deref(), Some("Extrema"));
    assert_eq!(candidates[0].uf.as_deref(), Some("MG"));
}

#[tokio::test]
async fn recrawled_rows_with_changed_text_are_pending_again() {
    let dir = tempdir().expect("tempdir");
    let first = dir.path().join("first.jsonl");
    let second = dir.path().join("second.jsonl");
    let silver = dir.path().join("silver.jsonl");
    let a = raw("A", "https://a.example.com/", 9);
    write_jsonl(&first, &[a.clone()]).await.unwrap();
    write_jsonl(&silver, &[schema(&a)]).await.unwrap();

    let store = EventStore::in_memory().await.unwrap();
    store.merge_raw_events(&first).await.unwrap();
    store.merge_schema_events(&silver).await.unwrap();
    assert!(store.load_new_events().await.unwrap().is_empty());

    // Same snapshot again: nothing to redo.
    store.merge_raw_events(&first).await.unwrap();
    assert!(store.load_new_events().await.unwrap().is_empty());

    let mut moved = a.to_record();
    moved.date = "08/11/2025".to_string();
    write_jsonl(&second, &[RawEvent::new(moved).unwrap()]).await.unwrap();
    store.merge_raw_events(&second).await.unwrap();

    let pending = store.load_new_events().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].record.date, "08/11/2025");
    assert!(pending[0].bronze_file.as_deref().is_some_and(|f| f.ends_with("second.jsonl")));
}
