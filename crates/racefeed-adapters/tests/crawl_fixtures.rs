use std::path::{Path, PathBuf};
use std::time::Duration;

use racefeed_adapters::{
    adapter_for_definition, adapter_for_source, builtin_definition, AdapterError, JsonFields,
    JsonListingCrawler, JsonSourceDefinition, SourceAdapter,
};
use racefeed_storage::{FetchError, Fetcher, FetcherConfig};
use tempfile::tempdir;
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fixture(source_id: &str, name: &str) -> String {
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(source_id)
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("{}: {e}", path.display()))
}

fn fetcher(root: &Path) -> Fetcher {
    let config = FetcherConfig {
        crawl_delay: Duration::ZERO,
        ..Default::default()
    };
    Fetcher::new(&config, root).unwrap()
}

async fn serve(server: &MockServer, route: &str, body: String, calls: u64) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn follow_links_crawl_fetches_each_detail_once() {
    let server = MockServer::start().await;
    serve(&server, "/", fixture("peloto", "listing.html"), 1).await;
    serve(
        &server,
        "/evento/copa-regional-franca",
        fixture("peloto", "evento_copa-regional-franca.html"),
        1,
    )
    .await;
    serve(
        &server,
        "/evento/desafio-batatais",
        fixture("peloto", "evento_desafio-batatais.html"),
        1,
    )
    .await;

    let dir = tempdir().expect("tempdir");
    let definition = builtin_definition("peloto").unwrap().with_base_url(server.uri());
    let adapter = adapter_for_definition(definition, fetcher(dir.path())).unwrap();
    assert_eq!(adapter.source_id(), "peloto");

    let out = adapter.crawl().await.unwrap();
    assert_eq!(out.documents, 3);
    assert_eq!(out.events.len(), 1);
    assert_eq!(out.skipped, 1);
    assert!(out.events[0].raw_file().ends_with("-evento_copa-regional-franca"));

    // Same-day rerun is served from cache; the mocks above expect a single hit.
    let again = adapter.crawl().await.unwrap();
    assert_eq!(again.events, out.events);
}

#[tokio::test]
async fn failed_listing_fetch_aborts_the_crawl() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/calendario/"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = tempdir().expect("tempdir");
    let definition = builtin_definition("tourdopeixe")
        .unwrap()
        .with_base_url(server.uri());
    let adapter = adapter_for_definition(definition, fetcher(dir.path())).unwrap();
    let err = adapter.crawl().await.unwrap_err();
    assert!(matches!(
        err,
        AdapterError::Fetch(FetchError::HttpStatus { status: 500, .. })
    ));
}

#[test]
fn unknown_sources_are_rejected() {
    let dir = tempdir().expect("tempdir");
    let err = adapter_for_source("corridapronta", fetcher(dir.path())).err().unwrap();
    assert!(matches!(err, AdapterError::UnknownSource(id) if id == "corridapronta"));
}

fn json_definition(base_url: &str, payload: Option<serde_json::Value>) -> JsonSourceDefinition {
    JsonSourceDefinition {
        base_url: base_url.to_string(),
        listing_path: "/api/events".to_string(),
        cache_key: "events.json".to_string(),
        items: "/items".to_string(),
        payload,
        fields: JsonFields {
            title: "/title".to_string(),
            date: "/date".to_string(),
            local: "/place".to_string(),
            url: "/link".to_string(),
        },
    }
}

fn json_listing() -> serde_json::Value {
    json!({"items": [
        {"title": "Pedal da Serra", "date": "15/11/2025", "place": "Cunha/SP", "link": "/e/pedal"}
    ]})
}

#[tokio::test]
async fn json_listing_with_payload_is_posted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/events"))
        .and(body_json(json!({"page": 1, "state": "SP"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json_listing()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().expect("tempdir");
    let definition = json_definition(&server.uri(), Some(json!({"page": 1, "state": "SP"})));
    let adapter = JsonListingCrawler::new("jsonapi", definition, fetcher(dir.path()));
    assert_eq!(adapter.source_id(), "jsonapi");

    let out = adapter.crawl().await.unwrap();
    assert_eq!(out.events.len(), 1);
    assert_eq!(out.events[0].url(), format!("{}/e/pedal", server.uri()));
    assert!(out.events[0].raw_file().ends_with("-events.json"));

    // Cached for the day; the mock expects a single request.
    let again = adapter.crawl().await.unwrap();
    assert_eq!(again.events, out.events);
}

#[tokio::test]
async fn json_listing_without_payload_uses_get() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json_listing()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().expect("tempdir");
    let adapter =
        JsonListingCrawler::new("jsonapi", json_definition(&server.uri(), None), fetcher(dir.path()));
    let out = adapter.crawl().await.unwrap();
    assert_eq!(out.events.len(), 1);
    assert_eq!(out.events[0].title(), "Pedal da Serra");
    assert_eq!(out.events[0].date(), "15/11/2025");
}
