use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use feedmirror_adapters::{
    AdapterError, DisabledKeywordExtractor, FeedSource, KeywordExtractor, OfflineScraper,
};
use feedmirror_core::{Record, RemoteEntry};
use feedmirror_storage::{JsonFileStore, RecordStore};
use feedmirror_sync::{StoreBackend, SyncConfig, SyncError, SyncPipeline};
use tempfile::TempDir;
use uuid::Uuid;

/// Feed whose contents can be swapped between runs.
#[derive(Clone, Default)]
struct ScriptedFeed {
    entries: Arc<Mutex<Option<Vec<RemoteEntry>>>>,
}

impl ScriptedFeed {
    fn serve(&self, entries: Vec<RemoteEntry>) {
        *self.entries.lock().unwrap() = Some(entries);
    }

    fn go_down(&self) {
        *self.entries.lock().unwrap() = None;
    }
}

#[async_trait]
impl FeedSource for ScriptedFeed {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn fetch_entries(&self, _run_id: Uuid) -> Result<Vec<RemoteEntry>, AdapterError> {
        self.entries
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AdapterError::Message("feed offline".into()))
    }
}

struct FixedKeywords;

#[async_trait]
impl KeywordExtractor for FixedKeywords {
    async fn extract_keywords(&self, _text: &str) -> Option<Vec<String>> {
        Some(vec!["mirror".to_string()])
    }
}

fn ts(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, 8, 0, 0).unwrap()
}

fn entry(slug: &str, day: u32) -> RemoteEntry {
    RemoteEntry {
        link: format!("https://blog.example/{slug}.html"),
        title: slug.to_string(),
        raw_body: format!("<p>Body of {slug}.</p>"),
        summary: None,
        published: ts(day),
        last_modified: ts(day),
        categories: vec!["notes".to_string()],
        thumbnail: None,
    }
}

fn config(dir: &Path) -> SyncConfig {
    SyncConfig {
        feed_url: "scripted".into(),
        store_backend: StoreBackend::File,
        store_path: dir.join("blog_data.json"),
        kv_key: "blog_data".into(),
        cf_account_id: None,
        cf_api_token: None,
        cf_namespace_id: None,
        gemini_api_key: None,
        gemini_model: "gemini-test".into(),
        user_agent: "feedmirror-test".into(),
        http_timeout_secs: 5,
        scrape_timeout_secs: 1,
        enrich_timeout_secs: 1,
        throttle_min_ms: 0,
        throttle_max_ms: 0,
        max_refreshes: None,
        default_image_url: "https://img.example/default.png".into(),
        summary_placeholder: "Read more".into(),
        reports_dir: None,
        scheduler_enabled: false,
        sync_cron: "0 0 6 * * *".into(),
        offline: true,
        prune_missing: false,
        dry_run: false,
    }
}

fn pipeline(config: SyncConfig, feed: &ScriptedFeed) -> SyncPipeline {
    let store = JsonFileStore::new(config.store_path.clone());
    SyncPipeline::with_components(
        config,
        Box::new(feed.clone()),
        Box::new(store),
        Box::new(OfflineScraper),
        Box::new(DisabledKeywordExtractor),
    )
}

async fn stored(path: &Path) -> Vec<Record> {
    JsonFileStore::new(path.to_path_buf()).load().await.unwrap()
}

fn snapshot_path(dir: &TempDir) -> PathBuf {
    dir.path().join("blog_data.json")
}

#[tokio::test]
async fn first_run_creates_the_snapshot_and_second_run_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let feed = ScriptedFeed::default();
    feed.serve(vec![entry("b", 2), entry("a", 1)]);
    let pipeline = pipeline(config(dir.path()), &feed);

    let first = pipeline.run_once().await.unwrap();
    assert!(first.written);
    assert_eq!(first.stats.new, 2);
    let bytes = std::fs::read(snapshot_path(&dir)).unwrap();

    let second = pipeline.run_once().await.unwrap();
    assert!(!second.written);
    assert_eq!(second.stats.reused, 2);
    assert_eq!(second.stats.refreshed(), 0);
    assert_eq!(first.snapshot_sha256, second.snapshot_sha256);
    assert_eq!(std::fs::read(snapshot_path(&dir)).unwrap(), bytes);

    let links: Vec<_> = stored(&snapshot_path(&dir)).await.into_iter().map(|r| r.link).collect();
    assert_eq!(links, vec!["https://blog.example/b.html", "https://blog.example/a.html"]);
}

#[tokio::test]
async fn feed_failure_leaves_storage_untouched() {
    let dir = TempDir::new().unwrap();
    let feed = ScriptedFeed::default();
    feed.serve(vec![entry("a", 1)]);
    let pipeline = pipeline(config(dir.path()), &feed);
    pipeline.run_once().await.unwrap();
    let before = std::fs::read(snapshot_path(&dir)).unwrap();

    feed.go_down();
    let err = pipeline.run_once().await.unwrap_err();
    assert!(matches!(err, SyncError::FetchUnavailable(_)));
    assert_eq!(std::fs::read(snapshot_path(&dir)).unwrap(), before);
}

#[tokio::test]
async fn corrupt_snapshot_aborts_without_overwriting() {
    let dir = TempDir::new().unwrap();
    std::fs::write(snapshot_path(&dir), b"{ not json").unwrap();
    let feed = ScriptedFeed::default();
    feed.serve(vec![entry("a", 1)]);

    let err = pipeline(config(dir.path()), &feed).run_once().await.unwrap_err();
    assert!(matches!(err, SyncError::CorruptState(_)));
    assert_eq!(std::fs::read(snapshot_path(&dir)).unwrap(), b"{ not json");
}

#[tokio::test]
async fn cancelled_run_does_not_write() {
    let dir = TempDir::new().unwrap();
    let feed = ScriptedFeed::default();
    feed.serve(vec![entry("a", 1)]);
    let pipeline = pipeline(config(dir.path()), &feed);
    pipeline.cancel_flag().cancel();

    let err = pipeline.run_once().await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled(_)));
    assert!(!snapshot_path(&dir).exists());
}

#[tokio::test]
async fn dry_run_reports_without_writing() {
    let dir = TempDir::new().unwrap();
    let feed = ScriptedFeed::default();
    feed.serve(vec![entry("a", 1)]);
    let mut config = config(dir.path());
    config.dry_run = true;

    let summary = pipeline(config, &feed).run_once().await.unwrap();
    assert_eq!(summary.stats.new, 1);
    assert!(!summary.written);
    assert!(!snapshot_path(&dir).exists());
}

#[tokio::test]
async fn updated_entries_replace_records_and_vanished_ones_are_kept() {
    let dir = TempDir::new().unwrap();
    let feed = ScriptedFeed::default();
    feed.serve(vec![entry("b", 2), entry("a", 1)]);
    let pipeline = pipeline(config(dir.path()), &feed);
    pipeline.run_once().await.unwrap();

    let mut edited = entry("b", 2);
    edited.last_modified = ts(9);
    edited.title = "b, revised".into();
    feed.serve(vec![edited]);
    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.stats.updated, 1);
    assert_eq!(summary.stats.retained, 1);

    let records = stored(&snapshot_path(&dir)).await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].title, "b, revised");
    assert_eq!(records[0].last_modified, ts(9));
    assert_eq!(records[1].link, "https://blog.example/a.html");
}

fn legacy_record(slug: &str, day: u32) -> Record {
    Record {
        link: format!("https://blog.example/{slug}.html"),
        title: slug.to_string(),
        published: ts(day),
        last_modified: ts(day),
        image: "https://img.example/old.png".into(),
        summary: "old summary".into(),
        tags: vec![],
        keywords: None,
        excerpt: String::new(),
    }
}

#[tokio::test]
async fn records_without_keywords_are_backfilled() {
    let dir = TempDir::new().unwrap();
    JsonFileStore::new(snapshot_path(&dir))
        .write(&[legacy_record("a", 1)])
        .await
        .unwrap();
    let feed = ScriptedFeed::default();
    feed.serve(vec![entry("a", 1)]);

    let config = config(dir.path());
    let store = JsonFileStore::new(config.store_path.clone());
    let enriched = SyncPipeline::with_components(
        config,
        Box::new(feed.clone()),
        Box::new(store),
        Box::new(OfflineScraper),
        Box::new(FixedKeywords),
    );
    let summary = enriched.run_once().await.unwrap();
    assert_eq!(summary.stats.backfilled, 1);
    assert_eq!(
        stored(&snapshot_path(&dir)).await[0].keywords,
        Some(vec!["mirror".to_string()])
    );
}

#[tokio::test]
async fn backfill_without_a_keyword_service_stores_an_empty_list_once() {
    let dir = TempDir::new().unwrap();
    JsonFileStore::new(snapshot_path(&dir))
        .write(&[legacy_record("a", 1)])
        .await
        .unwrap();
    let feed = ScriptedFeed::default();
    feed.serve(vec![entry("a", 1)]);
    let pipeline = pipeline(config(dir.path()), &feed);

    let first = pipeline.run_once().await.unwrap();
    assert_eq!(first.stats.backfilled, 1);
    assert!(first.written);
    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(snapshot_path(&dir)).unwrap()).unwrap();
    assert_eq!(json[0]["keywords"], serde_json::json!([]));

    let second = pipeline.run_once().await.unwrap();
    assert_eq!(second.stats.reused, 1);
    assert_eq!(second.stats.refreshed(), 0);
    assert!(!second.written);
}

#[tokio::test]
async fn run_report_is_written_when_configured() {
    let dir = TempDir::new().unwrap();
    let reports = dir.path().join("reports");
    let feed = ScriptedFeed::default();
    feed.serve(vec![entry("a", 1)]);
    let mut config = config(dir.path());
    config.reports_dir = Some(reports.clone());

    let summary = pipeline(config, &feed).run_once().await.unwrap();
    let report = PathBuf::from(summary.report_path.expect("report path"));
    assert_eq!(report, reports.join(summary.run_id.to_string()).join("sync_report.json"));

    let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&report).unwrap()).unwrap();
    assert_eq!(json["stats"]["new"], 1);
    assert_eq!(json["written"], true);
    assert!(report.with_file_name("brief.md").exists());
}

#[tokio::test]
async fn pipeline_built_from_config_reads_a_local_feed() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.feed_url = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/blogger/page-1.xml")
        .display()
        .to_string();

    let summary = SyncPipeline::new(config).unwrap().run_once().await.unwrap();
    assert_eq!(summary.stats.new, 2);

    let records = stored(&snapshot_path(&dir)).await;
    assert_eq!(records[0].title, "Mirroring a feed");
    assert_eq!(records[0].tags, vec!["rust", "sync"]);
    assert!(records[0].image.contains("/s1600/cover.png"));
    assert_eq!(records[0].summary, "Hello world. Second paragraph....");
    assert_eq!(records[1].summary, "A hand-written search description.");
    assert_eq!(records[1].image, "https://img.example/default.png");
}
