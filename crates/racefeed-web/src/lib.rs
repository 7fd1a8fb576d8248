//! Axum + Askama read-only surface over the gold feed.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Local, NaiveDate};
use racefeed_core::FeedRow;
use racefeed_storage::{EventStore, FeedCandidate};
use racefeed_sync::gold::upcoming_rows;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "racefeed-web";

#[derive(Clone)]
pub struct AppState {
    pub store: EventStore,
    /// Fixed reference date; `None` means the local current date per request.
    pub today: Option<NaiveDate>,
}

impl AppState {
    pub fn new(store: EventStore) -> Self {
        Self { store, today: None }
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    pub uf: Option<String>,
    pub city: Option<String>,
    pub source: Option<String>,
}

impl FeedQuery {
    fn matches(&self, candidate: &FeedCandidate) -> bool {
        field_matches(self.uf.as_deref(), candidate.uf.as_deref())
            && field_matches(self.city.as_deref(), candidate.city.as_deref())
            && field_matches(self.source.as_deref(), Some(candidate.source.as_str()))
    }
}

/// Blank filters match everything; otherwise a case-insensitive equality.
fn field_matches(filter: Option<&str>, value: Option<&str>) -> bool {
    match filter.map(str::trim).filter(|f| !f.is_empty()) {
        None => true,
        Some(wanted) => value.is_some_and(|v| v.trim().to_lowercase() == wanted.to_lowercase()),
    }
}

struct RowView {
    date: String,
    title: String,
    url: String,
    city: String,
    uf: String,
}

impl From<FeedRow> for RowView {
    fn from(row: FeedRow) -> Self {
        Self {
            date: row.date.format("%d/%m/%Y").to_string(),
            title: row.title,
            url: row.url,
            city: row.city.unwrap_or_else(|| "-".into()),
            uf: row.uf.unwrap_or_else(|| "-".into()),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    today: String,
    rows: Vec<RowView>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/feed.json", get(feed_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("RACEFEED_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = racefeed_sync::PipelineConfig::from_env();
    let store = EventStore::connect(&config.database_url).await?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving feed");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

async fn filtered_rows(state: &AppState, query: &FeedQuery) -> anyhow::Result<Vec<FeedRow>> {
    let candidates = state
        .store
        .feed_candidates()
        .await?
        .into_iter()
        .filter(|c| query.matches(c))
        .collect::<Vec<_>>();
    Ok(upcoming_rows(&candidates, state.today()))
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
) -> Response {
    match filtered_rows(&state, &query).await {
        Ok(rows) => render_html(IndexTemplate {
            today: state.today().format("%d/%m/%Y").to_string(),
            rows: rows.into_iter().map(RowView::from).collect(),
        }),
        Err(err) => server_error(err),
    }
}

async fn feed_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
) -> Response {
    match filtered_rows(&state, &query).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use racefeed_core::{
        Confidence, DateFields, DateRange, Location, LocationFields, SchemaEvent, SchemaEventRecord,
    };
    use racefeed_storage::jsonl::write_jsonl;
    use tower::ServiceExt;

    fn event(title: &str, source: &str, date: &str, city: &str, uf: &str) -> SchemaEvent {
        let start = NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap();
        let raw_url = format!("https://{}.example.com/", title.to_lowercase().replace(' ', "-"));
        SchemaEvent::new(SchemaEventRecord {
            title: title.to_string(),
            url: format!("{raw_url}?utm_source=racefeed"),
            raw_url,
            source: source.to_string(),
            date_range: DateRange::new(
                date,
                DateFields {
                    multi_day: Some(false),
                    start_date: Some(start),
                    end_date: None,
                },
            )
            .unwrap(),
            location: Location::new(
                &format!("{city}/{uf}"),
                LocationFields {
                    address: None,
                    city: Some(city.to_string()),
                    uf: Some(uf.to_string()),
                    confidence: Confidence::High,
                },
            )
            .unwrap(),
            crawled_at: Utc.with_ymd_and_hms(2025, 10, 1, 9, 0, 0).unwrap(),
            processed_at: Utc.with_ymd_and_hms(2025, 10, 1, 9, 5, 0).unwrap(),
            bronze_file: None,
        })
        .unwrap()
    }

    async fn state() -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silver.jsonl");
        let events = vec![
            event("Desafio Extrema", "tionline", "2025-11-01", "Extrema", "MG"),
            event("Copa Franca", "peloto", "2025-11-08", "Franca", "SP"),
            event("Passeio Antigo", "tionline", "2025-09-01", "Extrema", "MG"),
        ];
        write_jsonl(&path, &events).await.unwrap();
        let store = EventStore::in_memory().await.unwrap();
        store.merge_schema_events(&path).await.unwrap();
        AppState::new(store).with_today(NaiveDate::from_ymd_opt(2025, 10, 1).unwrap())
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn feed_lists_only_upcoming_rows() {
        let (status, body) = get_body(app(state().await), "/feed.json").await;
        assert_eq!(status, StatusCode::OK);
        let rows: Vec<FeedRow> = serde_json::from_str(&body).unwrap();
        let titles: Vec<_> = rows.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["Desafio Extrema", "Copa Franca"]);
    }

    #[tokio::test]
    async fn feed_filters_are_case_insensitive() {
        let app = app(state().await);
        let (_, body) = get_body(app.clone(), "/feed.json?uf=mg").await;
        let rows: Vec<FeedRow> = serde_json::from_str(&body).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].city.as_deref(), Some("Extrema"));

        let (_, body) = get_body(app.clone(), "/feed.json?city=FRANCA&source=Peloto").await;
        let rows: Vec<FeedRow> = serde_json::from_str(&body).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Copa Franca");

        let (_, body) = get_body(app, "/feed.json?source=activesports").await;
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn index_renders_upcoming_events() {
        let (status, body) = get_body(app(state().await), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Desafio Extrema"));
        assert!(body.contains("01/11/2025"));
        assert!(!body.contains("Passeio Antigo"));
    }

    #[tokio::test]
    async fn empty_store_serves_an_empty_feed() {
        let store = EventStore::in_memory().await.unwrap();
        let app = app(AppState::new(store));
        let (status, body) = get_body(app.clone(), "/feed.json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");

        let (status, body) = get_body(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }
}
