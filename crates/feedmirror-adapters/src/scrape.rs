use std::sync::Arc;

use async_trait::async_trait;
use feedmirror_storage::HttpFetcher;
use scraper::Html;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::text::select_first_attr;
use crate::ContentScraper;

/// Pull the page's meta description, falling back to the OpenGraph description.
pub fn extract_meta_description(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    select_first_attr(&document, r#"meta[name="description"]"#, "content")
        .or_else(|| select_first_attr(&document, r#"meta[property="og:description"]"#, "content"))
}

/// Fetches the post page and reads its `<meta name="description">`.
///
/// The fetcher should be built with a short timeout and no retries: a failed
/// lookup only costs the entry its scraped summary.
#[derive(Debug, Clone)]
pub struct MetaDescriptionScraper {
    http: Arc<HttpFetcher>,
}

impl MetaDescriptionScraper {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ContentScraper for MetaDescriptionScraper {
    async fn describe(&self, run_id: Uuid, url: &str) -> Option<String> {
        let fetched = match self.http.fetch_bytes(run_id, "scrape", url).await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(%url, error = %err, "scrape failed; falling back");
                return None;
            }
        };
        let description = extract_meta_description(&fetched.text());
        if description.is_none() {
            debug!(%url, "page has no meta description");
        }
        description
    }
}

/// Scraper for offline runs: never issues a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineScraper;

#[async_trait]
impl ContentScraper for OfflineScraper {
    async fn describe(&self, _run_id: Uuid, _url: &str) -> Option<String> {
        None
    }
}
