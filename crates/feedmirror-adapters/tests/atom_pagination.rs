use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use feedmirror_adapters::{AtomFeedSource, FeedSource, FileFeedSource};
use feedmirror_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fixture(name: &str) -> String {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/blogger");
    std::fs::read_to_string(root.join(name)).expect("fixture")
}

fn fetcher() -> Arc<HttpFetcher> {
    Arc::new(
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::none(),
            ..Default::default()
        })
        .expect("fetcher"),
    )
}

async fn serve_feed(server: &MockServer) {
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/feeds/posts/default"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/atom+xml")
                .set_body_string(fixture("page-1.xml").replace("{{BASE}}", &base)),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feeds/posts/next"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/atom+xml")
                .set_body_string(fixture("page-2.xml").replace("{{BASE}}", &base)),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn follows_next_links_until_exhausted() {
    let server = MockServer::start().await;
    serve_feed(&server).await;

    let source = AtomFeedSource::new(format!("{}/feeds/posts/default", server.uri()), fetcher());
    let entries = source.fetch_entries(Uuid::new_v4()).await.expect("entries");

    let links: Vec<_> = entries.iter().map(|e| e.link.as_str()).collect();
    assert_eq!(
        links,
        vec![
            "https://blog.example/2024/05/mirroring-a-feed.html",
            "https://blog.example/2024/04/search-descriptions.html",
            "https://blog.example/2024/03/pictures-only.html",
            "https://blog.example/2024/02/draft-stub.html",
        ]
    );
    assert!(entries[3].raw_body.is_empty());
    let requests = server.received_requests().await.expect("recording enabled");
    assert_eq!(requests.len(), 2);
    assert!(entries[2].raw_body.contains("first.jpg"));
}

#[tokio::test]
async fn page_limit_is_enforced() {
    let server = MockServer::start().await;
    serve_feed(&server).await;

    let source = AtomFeedSource::new(format!("{}/feeds/posts/default", server.uri()), fetcher())
        .with_max_pages(1);
    let err = source.fetch_entries(Uuid::new_v4()).await.expect_err("limit");
    assert!(err.to_string().contains("exceeded 1 pages"));
}

#[tokio::test]
async fn unreachable_feed_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let source = AtomFeedSource::new(format!("{}/feeds/posts/default", server.uri()), fetcher());
    assert!(source.fetch_entries(Uuid::new_v4()).await.is_err());
}

#[tokio::test]
async fn file_source_reads_a_single_document() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/blogger/page-2.xml");
    let entries = FileFeedSource::new(dir).fetch_entries(Uuid::new_v4()).await.expect("entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].title, "Pictures only");
}

#[tokio::test]
async fn file_source_reports_missing_document() {
    let missing = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/blogger/absent.xml");
    let err = FileFeedSource::new(missing).fetch_entries(Uuid::new_v4()).await.unwrap_err();
    assert!(err.to_string().contains("absent.xml"));
}
