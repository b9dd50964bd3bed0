//! Adapter contracts for the feed mirror's external collaborators: the feed,
//! the page scraper and the keyword extraction service.

use async_trait::async_trait;
use feedmirror_core::RemoteEntry;
use feedmirror_storage::FetchError;
use thiserror::Error;
use uuid::Uuid;

mod feed;
mod keywords;
mod scrape;
pub mod text;

pub use feed::{parse_feed_document, AtomFeedSource, FeedPage, FileFeedSource};
pub use keywords::{
    parse_keyword_reply, DisabledKeywordExtractor, GeminiConfig, GeminiKeywordExtractor,
};
pub use scrape::{extract_meta_description, MetaDescriptionScraper, OfflineScraper};

pub const CRATE_NAME: &str = "feedmirror-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parsing feed {location}: {reason}")]
    Parse { location: String, reason: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Produces the complete, ordered list of remote entries.
#[async_trait]
pub trait FeedSource: Send + Sync {
    fn describe(&self) -> String;

    /// Fetch every entry, following pagination until exhausted.
    async fn fetch_entries(&self, run_id: Uuid) -> Result<Vec<RemoteEntry>, AdapterError>;
}

/// Best-effort lookup of a page's short descriptive text.
#[async_trait]
pub trait ContentScraper: Send + Sync {
    /// `None` on any failure; errors never cross this boundary. `run_id` tags outbound requests.
    async fn describe(&self, run_id: Uuid, url: &str) -> Option<String>;
}

/// Best-effort keyword extraction.
#[async_trait]
pub trait KeywordExtractor: Send + Sync {
    /// `Some` with 0..=10 keywords on success, `None` when the service failed or is unavailable.
    async fn extract_keywords(&self, text: &str) -> Option<Vec<String>>;
}
