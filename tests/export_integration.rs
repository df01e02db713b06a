//! End-to-end exporter scenario: crawl a site, export the visited set in
//! batches, and verify the concatenated output equals the visited table
//! in id order with no duplicates.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crawler_core::export::UrlBatchExporter;
use crawler_core::{
    CrawlConfig, CrawlPolicy, Crawler, DomainParser, HttpFetcher, Metrics, Store,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("Content-Type", "text/html; charset=utf-8")
        .set_body_string(body)
}

fn fast_config(start_url: &str, db_path: &Path) -> CrawlConfig {
    let mut config = CrawlConfig::new(start_url);
    config.db_path = db_path.to_path_buf();
    config.worker_count = 20;
    config.idle_poll = Duration::from_millis(20);
    config.quiescence_grace = Duration::from_millis(150);
    config
}

#[tokio::test]
async fn test_crawl_then_export_preserves_visited_order() {
    let server = MockServer::start().await;
    let links: String = (0..24)
        .map(|i| format!(r#"<a href="/p{i}">p{i}</a>"#))
        .collect();
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(&links))
        .mount(&server)
        .await;
    for i in 0..24 {
        Mock::given(method("GET"))
            .and(path(format!("/p{i}")))
            .respond_with(html("leaf"))
            .mount(&server)
            .await;
    }

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("crawl.db");
    let out_dir = dir.path().join("exports");
    let start_url = format!("{}/", server.uri());

    let store = Store::connect(&db_path).await.unwrap();
    let config = fast_config(&start_url, &db_path);
    let crawler = Crawler::new(
        store.clone(),
        Arc::new(HttpFetcher::new("crawler-tests/0.1", config.controller.initial).unwrap()),
        Arc::new(DomainParser::new("127.0.0.1")),
        Arc::new(CrawlPolicy::default()),
        Arc::new(Metrics::new()),
        &config,
    )
    .unwrap();

    let summary = crawler.run(&start_url, Vec::new()).await.unwrap();
    assert_eq!(summary.visited, 25);

    // Export in small batches to force several files.
    let mut exporter = UrlBatchExporter::new(store.clone(), &out_dir, 7).await.unwrap();
    let batches = exporter.export_all().await.unwrap();
    assert_eq!(batches, 4); // 7 + 7 + 7 + 4

    let mut files: Vec<_> = std::fs::read_dir(&out_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "txt"))
        .collect();
    files.sort();

    let mut exported = Vec::new();
    for file in files {
        for line in std::fs::read_to_string(file).unwrap().lines() {
            exported.push(line.to_string());
        }
    }

    let visited: Vec<String> = store
        .fetch_visited_since(0, 1000)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.url)
        .collect();

    assert_eq!(exported.len(), 25);
    assert_eq!(exported, visited, "export equals visited in id order");

    let mut deduped = exported.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(deduped.len(), 25, "no duplicates in export");

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_second_export_run_picks_up_only_new_rows() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("crawl.db");
    let out_dir = dir.path().join("exports");

    let store = Store::connect(&db_path).await.unwrap();
    for i in 0..5 {
        store
            .mark_visited(&format!("https://a.test/{i}"), 0)
            .await
            .unwrap();
    }

    let mut exporter = UrlBatchExporter::new(store.clone(), &out_dir, 100).await.unwrap();
    assert_eq!(exporter.export_all().await.unwrap(), 1);

    // Batch files are named by a per-run timestamp with one-second
    // resolution; step past it so the runs cannot collide.
    tokio::time::sleep(Duration::from_millis(1100)).await;

    // The crawler finds more pages between export runs.
    for i in 5..8 {
        store
            .mark_visited(&format!("https://a.test/{i}"), 1)
            .await
            .unwrap();
    }

    let mut second = UrlBatchExporter::new(store.clone(), &out_dir, 100).await.unwrap();
    assert_eq!(second.export_all().await.unwrap(), 1);

    let mut files: Vec<_> = std::fs::read_dir(&out_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "txt"))
        .collect();
    files.sort();
    assert_eq!(files.len(), 2);

    let newest = std::fs::read_to_string(files.last().unwrap()).unwrap();
    let lines: Vec<_> = newest.lines().collect();
    assert_eq!(
        lines,
        vec!["https://a.test/5", "https://a.test/6", "https://a.test/7"]
    );

    store.close().await.unwrap();
}
