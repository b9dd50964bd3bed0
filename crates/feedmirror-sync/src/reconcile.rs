//! Incremental reconciliation: decide reuse vs. refresh per remote entry and
//! build the next collection without touching the loaded one.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use feedmirror_adapters::text::{collapse_whitespace, first_image_src, html_to_text};
use feedmirror_adapters::{ContentScraper, KeywordExtractor};
use feedmirror_core::{
    truncate_chars, upgrade_thumbnail_url, Decision, Record, RemoteEntry, SyncStats,
    CONTINUATION_MARKER, EXCERPT_CHARS, KEYWORD_INPUT_CHARS, MAX_KEYWORDS,
    SUMMARY_FALLBACK_CHARS,
};
use rand::Rng;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub min: Duration,
    pub max: Duration,
}

impl ThrottleConfig {
    pub fn disabled() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(1000),
            max: Duration::from_millis(3000),
        }
    }
}

/// Randomized pause between successive refreshes. The first refresh of a run is not delayed.
#[derive(Debug)]
pub struct Throttle {
    config: ThrottleConfig,
    primed: bool,
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            primed: false,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        if !self.primed {
            self.primed = true;
            return Duration::ZERO;
        }
        let min = self.config.min.as_millis() as u64;
        let max = (self.config.max.as_millis() as u64).max(min);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    pub async fn pace(&mut self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "throttling before refresh");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Shared abort switch. Once set, no further refresh-path calls are issued.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub default_image_url: String,
    pub summary_placeholder: String,
    pub scrape_timeout: Duration,
    pub enrich_timeout: Duration,
    pub throttle: ThrottleConfig,
    /// Refresh budget per run; entries past it are deferred to a later run.
    pub max_refreshes: Option<usize>,
    /// Drop stored records whose identity is no longer in the feed.
    pub prune_missing: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            default_image_url: DEFAULT_IMAGE_URL.to_string(),
            summary_placeholder: DEFAULT_SUMMARY_PLACEHOLDER.to_string(),
            scrape_timeout: Duration::from_secs(8),
            enrich_timeout: Duration::from_secs(30),
            throttle: ThrottleConfig::default(),
            max_refreshes: None,
            prune_missing: false,
        }
    }
}

pub const DEFAULT_IMAGE_URL: &str = "https://blogger.googleusercontent.com/img/b/R29vZ2xl/AVvXsEg5ObeFcmpieWz7g68vuMXYXrf7sQQpj8IhWUWdqhSmWnYJ887gL1oc6Asf5_klvI7vCB9g1v8hd_w8JjL7Hb5xd_5H8onSZFW1J-OoeSGsLqMAHUMqkL5ExR98NMhOjzbtyi3jMYAesBVXqRSfo-xPKl1c7VNgUhF-lBZuLiENOPhgnFupuckw8rOCQIjd/s1600/coverforall.png";
pub const DEFAULT_SUMMARY_PLACEHOLDER: &str = "Click to read the full post...";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("reconcile cancelled after {completed} of {total} entries")]
    Cancelled { completed: usize, total: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub records: Vec<Record>,
    pub stats: SyncStats,
}

/// First match wins: new, updated, incomplete (keyword backfill), unchanged.
pub fn classify(entry: &RemoteEntry, existing: Option<&Record>) -> Decision {
    match existing {
        None => Decision::New,
        Some(record) if record.last_modified != entry.last_modified => Decision::Updated,
        Some(record) if record.keywords.is_none() => Decision::Incomplete,
        Some(_) => Decision::Unchanged,
    }
}

/// Summary used when the scraper has nothing: feed summary, then body prefix, then placeholder.
pub fn fallback_summary(feed_summary: Option<&str>, plain_text: &str, placeholder: &str) -> String {
    if let Some(summary) = feed_summary.map(html_to_text).filter(|s| !s.is_empty()) {
        return summary;
    }
    if plain_text.is_empty() {
        return placeholder.to_string();
    }
    format!(
        "{}{}",
        truncate_chars(plain_text, SUMMARY_FALLBACK_CHARS),
        CONTINUATION_MARKER
    )
}

/// Feed thumbnail at high resolution, else the first image in the body, else the default.
pub fn resolve_image(entry: &RemoteEntry, default_image_url: &str) -> String {
    entry
        .thumbnail
        .as_deref()
        .map(upgrade_thumbnail_url)
        .or_else(|| first_image_src(&entry.raw_body))
        .unwrap_or_else(|| default_image_url.to_string())
}

pub struct ReconcileEngine<'a> {
    scraper: &'a dyn ContentScraper,
    keywords: &'a dyn KeywordExtractor,
    options: &'a ReconcileOptions,
    cancel: CancelFlag,
    run_id: Uuid,
}

impl<'a> ReconcileEngine<'a> {
    pub fn new(
        scraper: &'a dyn ContentScraper,
        keywords: &'a dyn KeywordExtractor,
        options: &'a ReconcileOptions,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            scraper,
            keywords,
            options,
            cancel,
            run_id: Uuid::new_v4(),
        }
    }

    /// Tag outbound scrape requests with the pipeline's run id.
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Build the next collection in feed order. `existing` is only read.
    pub async fn reconcile(
        &self,
        entries: &[RemoteEntry],
        existing: &HashMap<String, Record>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let mut throttle = Throttle::new(self.options.throttle);
        let mut seen: HashSet<&str> = HashSet::with_capacity(entries.len());
        let mut records = Vec::with_capacity(entries.len());
        let mut stats = SyncStats::default();
        let mut refreshes = 0usize;

        for (index, entry) in entries.iter().enumerate() {
            if !seen.insert(entry.link.as_str()) {
                warn!(link = %entry.link, "duplicate identity in feed; keeping first occurrence");
                continue;
            }

            let cached = existing.get(&entry.link);
            let decision = classify(entry, cached);

            if !decision.needs_refresh() {
                records.extend(cached.cloned());
                stats.record(decision);
                continue;
            }

            if self
                .options
                .max_refreshes
                .is_some_and(|limit| refreshes >= limit)
            {
                debug!(
                    link = %entry.link,
                    decision = decision.as_str(),
                    "refresh budget spent; deferring"
                );
                stats.deferred += 1;
                records.extend(cached.cloned());
                continue;
            }

            if self.cancel.is_cancelled() {
                warn!(completed = index, total = entries.len(), "reconcile cancelled");
                return Err(ReconcileError::Cancelled {
                    completed: index,
                    total: entries.len(),
                });
            }

            throttle.pace().await;
            debug!(link = %entry.link, decision = decision.as_str(), "refreshing entry");
            records.push(self.refresh_record(entry).await);
            refreshes += 1;
            stats.record(decision);
        }

        let mut missing: Vec<&Record> = existing
            .values()
            .filter(|record| !seen.contains(record.link.as_str()))
            .collect();
        missing.sort_by(|a, b| b.published.cmp(&a.published).then_with(|| a.link.cmp(&b.link)));

        if self.options.prune_missing {
            stats.pruned = missing.len();
        } else {
            stats.retained = missing.len();
            records.extend(missing.into_iter().cloned());
        }

        info!(
            new = stats.new,
            updated = stats.updated,
            backfilled = stats.backfilled,
            reused = stats.reused,
            deferred = stats.deferred,
            retained = stats.retained,
            pruned = stats.pruned,
            "reconcile finished"
        );
        Ok(ReconcileOutcome { records, stats })
    }

    /// Regenerate every derived field of one entry. Each enrichment step degrades on its own.
    pub async fn refresh_record(&self, entry: &RemoteEntry) -> Record {
        let plain_text = html_to_text(&entry.raw_body);

        let scrape = self.scraper.describe(self.run_id, &entry.link);
        let scraped = match timeout(self.options.scrape_timeout, scrape).await {
            Ok(found) => found
                .map(|text| collapse_whitespace(&text))
                .filter(|text| !text.is_empty()),
            Err(_) => {
                warn!(link = %entry.link, "scrape timed out; falling back");
                None
            }
        };
        let summary = scraped.unwrap_or_else(|| {
            fallback_summary(
                entry.summary.as_deref(),
                &plain_text,
                &self.options.summary_placeholder,
            )
        });

        // Always present after a refresh; an empty list marks a failed or skipped extraction.
        let keywords = if plain_text.is_empty() {
            Vec::new()
        } else {
            let input = truncate_chars(&plain_text, KEYWORD_INPUT_CHARS);
            let extraction = self.keywords.extract_keywords(input);
            match timeout(self.options.enrich_timeout, extraction).await {
                Ok(Some(mut keywords)) => {
                    keywords.truncate(MAX_KEYWORDS);
                    keywords
                }
                Ok(None) => {
                    debug!(link = %entry.link, "no keywords from extractor; storing empty list");
                    Vec::new()
                }
                Err(_) => {
                    warn!(link = %entry.link, "keyword extraction timed out; storing empty list");
                    Vec::new()
                }
            }
        };

        Record {
            link: entry.link.clone(),
            title: entry.title.clone(),
            published: entry.published,
            last_modified: entry.last_modified,
            image: resolve_image(entry, &self.options.default_image_url),
            summary,
            tags: entry.categories.clone(),
            keywords: Some(keywords),
            excerpt: truncate_chars(&plain_text, EXCERPT_CHARS).to_string(),
        }
    }
}
