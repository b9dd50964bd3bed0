use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use feed_rs::model::{Entry, Link};
use feedmirror_core::RemoteEntry;
use feedmirror_storage::HttpFetcher;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{AdapterError, FeedSource};

/// Hard stop for pagination, in case a feed links back to itself.
const DEFAULT_MAX_PAGES: usize = 200;

/// One parsed feed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPage {
    pub entries: Vec<RemoteEntry>,
    pub next: Option<String>,
}

/// Parse one Atom/RSS document into typed entries plus the `rel="next"` link, if any.
///
/// Entries without a usable link or without any timestamp are skipped with a warning.
pub fn parse_feed_document(location: &str, bytes: &[u8]) -> Result<FeedPage, AdapterError> {
    let feed = feed_rs::parser::parse(bytes).map_err(|err| AdapterError::Parse {
        location: location.to_string(),
        reason: err.to_string(),
    })?;

    let next = feed
        .links
        .iter()
        .find(|link| link.rel.as_deref() == Some("next"))
        .map(|link| link.href.clone());

    let entries = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let id = entry.id.clone();
            let mapped = entry_to_remote(entry);
            if mapped.is_none() {
                warn!(entry_id = %id, location, "skipping feed entry without link or timestamp");
            }
            mapped
        })
        .collect();

    Ok(FeedPage { entries, next })
}

fn canonical_link(links: &[Link], id: &str) -> Option<String> {
    links
        .iter()
        .find(|link| link.rel.as_deref() == Some("alternate"))
        .or_else(|| links.iter().find(|link| link.rel.is_none()))
        .map(|link| link.href.trim().to_string())
        .filter(|href| !href.is_empty())
        .or_else(|| id.starts_with("http").then(|| id.to_string()))
}

fn entry_to_remote(entry: Entry) -> Option<RemoteEntry> {
    let link = canonical_link(&entry.links, &entry.id)?;
    let published = entry.published.or(entry.updated)?;
    let last_modified = entry.updated.unwrap_or(published);

    let summary = entry
        .summary
        .map(|text| text.content)
        .filter(|content| !content.trim().is_empty());
    let raw_body = entry
        .content
        .and_then(|content| content.body)
        .filter(|body| !body.trim().is_empty())
        .or_else(|| summary.clone())
        .unwrap_or_default();
    let thumbnail = entry
        .media
        .iter()
        .flat_map(|media| media.thumbnails.iter())
        .map(|thumb| thumb.image.uri.trim().to_string())
        .find(|uri| !uri.is_empty());

    Some(RemoteEntry {
        link,
        title: entry.title.map(|t| t.content).unwrap_or_default(),
        raw_body,
        summary,
        published,
        last_modified,
        categories: entry.categories.into_iter().map(|c| c.term).collect(),
        thumbnail,
    })
}

/// Remote Atom feed, paginated through `rel="next"` links.
#[derive(Debug, Clone)]
pub struct AtomFeedSource {
    url: String,
    http: Arc<HttpFetcher>,
    max_pages: usize,
}

impl AtomFeedSource {
    pub fn new(url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            url: url.into(),
            http,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }
}

#[async_trait]
impl FeedSource for AtomFeedSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch_entries(&self, run_id: Uuid) -> Result<Vec<RemoteEntry>, AdapterError> {
        let mut entries = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(self.url.clone());
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            if !visited.insert(url.clone()) {
                warn!(%url, "feed pagination revisited a page; stopping");
                break;
            }
            if pages >= self.max_pages {
                return Err(AdapterError::Message(format!(
                    "feed {} exceeded {} pages",
                    self.url, self.max_pages
                )));
            }

            let fetched = self.http.fetch_bytes(run_id, "feed", &url).await?;
            let page = parse_feed_document(&url, &fetched.body)?;
            pages += 1;
            debug!(%url, entries = page.entries.len(), "fetched feed page");

            entries.extend(page.entries);
            next = page.next;
        }

        info!(feed = %self.url, pages, entries = entries.len(), "feed fetched");
        Ok(entries)
    }
}

/// A feed document on local disk. Pagination links are ignored.
#[derive(Debug, Clone)]
pub struct FileFeedSource {
    path: PathBuf,
}

impl FileFeedSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FeedSource for FileFeedSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch_entries(&self, _run_id: Uuid) -> Result<Vec<RemoteEntry>, AdapterError> {
        let bytes = fs::read(&self.path).await.map_err(|err| {
            AdapterError::Message(format!("reading {}: {err}", self.path.display()))
        })?;
        let page = parse_feed_document(&self.describe(), &bytes)?;
        Ok(page.entries)
    }
}
