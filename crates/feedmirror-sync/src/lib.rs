//! Sync pipeline orchestration: load the stored snapshot, fetch the feed,
//! reconcile, and write the new snapshot once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use feedmirror_adapters::{
    AdapterError, AtomFeedSource, ContentScraper, DisabledKeywordExtractor, FeedSource,
    FileFeedSource, GeminiConfig, GeminiKeywordExtractor, KeywordExtractor,
    MetaDescriptionScraper, OfflineScraper,
};
use feedmirror_core::{Record, SyncStats};
use feedmirror_storage::{
    encode_snapshot, index_records, snapshot_digest, BackoffPolicy, CloudflareKvStore,
    HttpClientConfig, HttpFetcher, JsonFileStore, KvConfig, RecordStore, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod reconcile;

pub use reconcile::{
    classify, fallback_summary, resolve_image, CancelFlag, ReconcileEngine, ReconcileError,
    ReconcileOptions, ReconcileOutcome, Throttle, ThrottleConfig, DEFAULT_IMAGE_URL,
    DEFAULT_SUMMARY_PLACEHOLDER,
};

pub const CRATE_NAME: &str = "feedmirror-sync";

pub const DEFAULT_FEED_URL: &str =
    "https://blog.timshan.idv.tw/feeds/posts/default?max-results=150&orderby=updated";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    File,
    Kv,
}

impl StoreBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" | "json" => Some(Self::File),
            "kv" | "cloudflare" => Some(Self::Kv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub feed_url: String,
    pub store_backend: StoreBackend,
    pub store_path: PathBuf,
    pub kv_key: String,
    pub cf_account_id: Option<String>,
    pub cf_api_token: Option<String>,
    pub cf_namespace_id: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scrape_timeout_secs: u64,
    pub enrich_timeout_secs: u64,
    pub throttle_min_ms: u64,
    pub throttle_max_ms: u64,
    pub max_refreshes: Option<usize>,
    pub default_image_url: String,
    pub summary_placeholder: String,
    pub reports_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    /// Skip the scraper and keyword service entirely.
    pub offline: bool,
    pub prune_missing: bool,
    pub dry_run: bool,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_opt(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    env_opt(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            feed_url: env_opt("FEEDMIRROR_FEED_URL")
                .unwrap_or_else(|| DEFAULT_FEED_URL.to_string()),
            store_backend: env_opt("FEEDMIRROR_STORE")
                .and_then(|v| StoreBackend::parse(&v))
                .unwrap_or(StoreBackend::File),
            store_path: env_opt("FEEDMIRROR_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./blog_data.json")),
            kv_key: env_opt("FEEDMIRROR_KV_KEY").unwrap_or_else(|| "blog_data".to_string()),
            cf_account_id: env_opt("CF_ACCOUNT_ID"),
            cf_api_token: env_opt("CF_API_TOKEN"),
            cf_namespace_id: env_opt("CF_KV_NAMESPACE_ID"),
            gemini_api_key: env_opt("GEMINI_API_KEY"),
            gemini_model: env_opt("GEMINI_MODEL")
                .unwrap_or_else(|| GeminiConfig::DEFAULT_MODEL.to_string()),
            user_agent: env_opt("FEEDMIRROR_USER_AGENT")
                .unwrap_or_else(|| "feedmirror-bot/0.1".to_string()),
            http_timeout_secs: env_parse("FEEDMIRROR_HTTP_TIMEOUT_SECS", 20),
            scrape_timeout_secs: env_parse("FEEDMIRROR_SCRAPE_TIMEOUT_SECS", 8),
            enrich_timeout_secs: env_parse("FEEDMIRROR_ENRICH_TIMEOUT_SECS", 30),
            throttle_min_ms: env_parse("FEEDMIRROR_THROTTLE_MIN_MS", 1000),
            throttle_max_ms: env_parse("FEEDMIRROR_THROTTLE_MAX_MS", 3000),
            max_refreshes: env_opt("FEEDMIRROR_MAX_REFRESHES").and_then(|v| v.trim().parse().ok()),
            default_image_url: env_opt("FEEDMIRROR_DEFAULT_IMAGE")
                .unwrap_or_else(|| DEFAULT_IMAGE_URL.to_string()),
            summary_placeholder: env_opt("FEEDMIRROR_SUMMARY_PLACEHOLDER")
                .unwrap_or_else(|| DEFAULT_SUMMARY_PLACEHOLDER.to_string()),
            reports_dir: env_opt("FEEDMIRROR_REPORTS_DIR").map(PathBuf::from),
            scheduler_enabled: env_flag("FEEDMIRROR_SCHEDULER_ENABLED"),
            sync_cron: env_opt("SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            offline: false,
            prune_missing: false,
            dry_run: false,
        }
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            default_image_url: self.default_image_url.clone(),
            summary_placeholder: self.summary_placeholder.clone(),
            scrape_timeout: Duration::from_secs(self.scrape_timeout_secs.max(1)),
            enrich_timeout: Duration::from_secs(self.enrich_timeout_secs.max(1)),
            throttle: ThrottleConfig {
                min: Duration::from_millis(self.throttle_min_ms),
                max: Duration::from_millis(self.throttle_max_ms.max(self.throttle_min_ms)),
            },
            max_refreshes: self.max_refreshes,
            prune_missing: self.prune_missing,
        }
    }

    pub fn build_store(&self) -> Result<Box<dyn RecordStore>, SyncError> {
        match self.store_backend {
            StoreBackend::File => Ok(Box::new(JsonFileStore::new(self.store_path.clone()))),
            StoreBackend::Kv => {
                let require = |value: &Option<String>, name: &str| {
                    value.clone().ok_or_else(|| {
                        SyncError::Config(format!("{name} is required for the kv store"))
                    })
                };
                let store = CloudflareKvStore::new(KvConfig {
                    account_id: require(&self.cf_account_id, "CF_ACCOUNT_ID")?,
                    namespace_id: require(&self.cf_namespace_id, "CF_KV_NAMESPACE_ID")?,
                    api_token: require(&self.cf_api_token, "CF_API_TOKEN")?,
                    key: self.kv_key.clone(),
                    base_url: KvConfig::DEFAULT_BASE_URL.to_string(),
                    timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
                })?;
                Ok(Box::new(store))
            }
        }
    }

    fn build_feed(&self) -> Result<Box<dyn FeedSource>, SyncError> {
        if self.feed_url.starts_with("http://") || self.feed_url.starts_with("https://") {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
                user_agent: Some(self.user_agent.clone()),
                ..Default::default()
            })?;
            return Ok(Box::new(AtomFeedSource::new(self.feed_url.clone(), Arc::new(http))));
        }
        let path = self.feed_url.strip_prefix("file://").unwrap_or(&self.feed_url);
        Ok(Box::new(FileFeedSource::new(path)))
    }

    fn build_scraper(&self) -> Result<Box<dyn ContentScraper>, SyncError> {
        if self.offline {
            return Ok(Box::new(OfflineScraper));
        }
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.scrape_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::none(),
            ..Default::default()
        })?;
        Ok(Box::new(MetaDescriptionScraper::new(Arc::new(http))))
    }

    fn build_keywords(&self) -> Result<Box<dyn KeywordExtractor>, SyncError> {
        match (&self.gemini_api_key, self.offline) {
            (Some(api_key), false) => Ok(Box::new(GeminiKeywordExtractor::new(GeminiConfig {
                api_key: api_key.clone(),
                model: self.gemini_model.clone(),
                base_url: GeminiConfig::DEFAULT_BASE_URL.to_string(),
                timeout: Duration::from_secs(self.enrich_timeout_secs.max(1)),
            })?)),
            _ => {
                info!("keyword extraction disabled");
                Ok(Box::new(DisabledKeywordExtractor))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote feed unavailable: {0}")]
    FetchUnavailable(#[source] AdapterError),
    #[error("stored snapshot is corrupt: {0}")]
    CorruptState(#[source] StoreError),
    #[error("record store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    #[error(transparent)]
    Cancelled(#[from] ReconcileError),
    #[error("writing snapshot failed: {0}")]
    Persist(#[source] StoreError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feed: String,
    pub store: String,
    pub fetched_entries: usize,
    pub records: usize,
    pub stats: SyncStats,
    pub snapshot_sha256: String,
    /// False when the snapshot was unchanged or the run was a dry run.
    pub written: bool,
    pub dry_run: bool,
    pub report_path: Option<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    feed: Box<dyn FeedSource>,
    store: Box<dyn RecordStore>,
    scraper: Box<dyn ContentScraper>,
    keywords: Box<dyn KeywordExtractor>,
    cancel: CancelFlag,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let feed = config.build_feed()?;
        let store = config.build_store()?;
        let scraper = config.build_scraper()?;
        let keywords = config.build_keywords()?;
        Ok(Self::with_components(config, feed, store, scraper, keywords))
    }

    pub fn with_components(
        config: SyncConfig,
        feed: Box<dyn FeedSource>,
        store: Box<dyn RecordStore>,
        scraper: Box<dyn ContentScraper>,
        keywords: Box<dyn KeywordExtractor>,
    ) -> Self {
        Self {
            config,
            feed,
            store,
            scraper,
            keywords,
            cancel: CancelFlag::new(),
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Load, fetch and reconcile, then write the new snapshot.
    ///
    /// Any failure before the write leaves stored data untouched.
    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            feed = %self.feed.describe(),
            store = %self.store.location(),
            "sync started"
        );

        let (previous, had_snapshot) = match self.store.load().await {
            Ok(records) => (records, true),
            Err(StoreError::NotAvailable { location }) => {
                info!(%location, "no stored snapshot yet; starting empty");
                (Vec::new(), false)
            }
            Err(err @ StoreError::CorruptState { .. }) => return Err(SyncError::CorruptState(err)),
            Err(err) => return Err(SyncError::StoreUnavailable(err)),
        };
        let existing = index_records(&previous);

        let entries = self
            .feed
            .fetch_entries(run_id)
            .await
            .map_err(SyncError::FetchUnavailable)?;

        let options = self.config.reconcile_options();
        let engine = ReconcileEngine::new(
            self.scraper.as_ref(),
            self.keywords.as_ref(),
            &options,
            self.cancel.clone(),
        )
        .with_run_id(run_id);
        let outcome = engine.reconcile(&entries, &existing).await?;

        let encoded = encode_snapshot(&outcome.records).map_err(SyncError::Persist)?;
        let digest = snapshot_digest(&encoded);
        let previous_digest = if had_snapshot {
            Some(snapshot_digest(
                &encode_snapshot(&previous).map_err(SyncError::Persist)?,
            ))
        } else {
            None
        };
        let unchanged = previous_digest.as_deref() == Some(digest.as_str());

        let written = if self.config.dry_run {
            info!(records = outcome.records.len(), "dry run; snapshot not written");
            false
        } else if unchanged {
            info!("snapshot unchanged; skipping write");
            false
        } else {
            self.store
                .write(&outcome.records)
                .await
                .map_err(SyncError::Persist)?;
            true
        };

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            feed: self.feed.describe(),
            store: self.store.location(),
            fetched_entries: entries.len(),
            records: outcome.records.len(),
            stats: outcome.stats,
            snapshot_sha256: digest,
            written,
            dry_run: self.config.dry_run,
            report_path: None,
        };

        if let Some(reports_dir) = &self.config.reports_dir {
            match write_report(reports_dir, &summary).await {
                Ok(path) => summary.report_path = Some(path.display().to_string()),
                Err(err) => warn!(error = %err, "writing run report failed"),
            }
        }

        info!(
            %run_id,
            refreshed = summary.stats.refreshed(),
            reused = summary.stats.reused,
            written,
            "sync complete"
        );
        Ok(summary)
    }

    /// Cron scheduler running [`SyncPipeline::run_once`], when enabled in config.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync finished"),
                    Err(err) => error!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Load the configured store and summarize it without touching the feed.
pub async fn inspect_store(config: &SyncConfig) -> Result<StoreInspection, SyncError> {
    let store = config.build_store()?;
    let records = match store.load().await {
        Ok(records) => records,
        Err(StoreError::NotAvailable { .. }) => Vec::new(),
        Err(err @ StoreError::CorruptState { .. }) => return Err(SyncError::CorruptState(err)),
        Err(err) => return Err(SyncError::StoreUnavailable(err)),
    };
    Ok(StoreInspection::from_records(store.location(), &records))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreInspection {
    pub location: String,
    pub records: usize,
    pub awaiting_keywords: usize,
    pub newest: Option<DateTime<Utc>>,
}

impl StoreInspection {
    pub fn from_records(location: String, records: &[Record]) -> Self {
        Self {
            location,
            records: records.len(),
            awaiting_keywords: records.iter().filter(|r| r.keywords.is_none()).count(),
            newest: records.iter().map(|r| r.last_modified).max(),
        }
    }
}

async fn write_report(reports_dir: &Path, summary: &SyncRunSummary) -> anyhow::Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let report_path = run_dir.join("sync_report.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing sync report")?;
    fs::write(&report_path, bytes)
        .await
        .with_context(|| format!("writing {}", report_path.display()))?;

    let stats = &summary.stats;
    let brief = format!(
        "# Feed Mirror Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Feed: {}\n- Store: {}\n- Snapshot written: {}\n\n## Entries\n- new: {}\n- updated: {}\n- backfilled: {}\n- reused: {}\n- deferred: {}\n- retained: {}\n- pruned: {}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.feed,
        summary.store,
        summary.written,
        stats.new,
        stats.updated,
        stats.backfilled,
        stats.reused,
        stats.deferred,
        stats.retained,
        stats.pruned,
    );
    fs::write(run_dir.join("brief.md"), brief)
        .await
        .context("writing brief.md")?;

    Ok(report_path)
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary, SyncError> {
    SyncPipeline::new(SyncConfig::from_env())?.run_once().await
}
