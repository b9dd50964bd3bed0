//! Core domain model for the feed mirror: remote entries, persisted records and run stats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "feedmirror-core";

/// Characters of plain text kept when the summary falls back to the post body.
pub const SUMMARY_FALLBACK_CHARS: usize = 120;
/// Appended to a body-derived summary.
pub const CONTINUATION_MARKER: &str = "...";
/// Characters of plain text handed to the keyword extractor.
pub const KEYWORD_INPUT_CHARS: usize = 3000;
/// Characters of plain text stored as the search excerpt.
pub const EXCERPT_CHARS: usize = 2000;
/// Upper bound on keywords kept per record.
pub const MAX_KEYWORDS: usize = 10;
/// Size token substituted into thumbnail URLs.
pub const HIGH_RES_SIZE: &str = "s1600";

/// The feed's view of one post, produced fresh on every fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Canonical post URL; the identity shared with [`Record::link`].
    pub link: String,
    pub title: String,
    /// Post body as markup.
    pub raw_body: String,
    /// Feed-provided summary (Blogger's search description), markup allowed.
    pub summary: Option<String>,
    pub published: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub categories: Vec<String>,
    pub thumbnail: Option<String>,
}

/// Persisted, enriched view of one post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub link: String,
    pub title: String,
    pub published: DateTime<Utc>,
    /// Staleness fingerprint compared against [`RemoteEntry::last_modified`].
    pub last_modified: DateTime<Utc>,
    pub image: String,
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Always present after a refresh. `None` marks a record that was never
    /// enriched, which the next sync backfills.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    #[serde(default)]
    pub excerpt: String,
}

/// Outcome of comparing a remote entry against its cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    New,
    Updated,
    Incomplete,
    Unchanged,
}

impl Decision {
    pub fn needs_refresh(self) -> bool {
        !matches!(self, Decision::Unchanged)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::New => "new",
            Decision::Updated => "updated",
            Decision::Incomplete => "incomplete",
            Decision::Unchanged => "unchanged",
        }
    }
}

/// Per-run counters reported at the end of a sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub new: usize,
    pub updated: usize,
    pub backfilled: usize,
    pub reused: usize,
    /// Entries that needed a refresh but exceeded the per-run refresh budget.
    pub deferred: usize,
    /// Stored records whose identity no longer appears in the feed, kept as-is.
    pub retained: usize,
    pub pruned: usize,
}

impl SyncStats {
    pub fn refreshed(&self) -> usize {
        self.new + self.updated + self.backfilled
    }

    pub fn record(&mut self, decision: Decision) {
        match decision {
            Decision::New => self.new += 1,
            Decision::Updated => self.updated += 1,
            Decision::Incomplete => self.backfilled += 1,
            Decision::Unchanged => self.reused += 1,
        }
    }
}

/// Rewrite a low-resolution thumbnail URL to its high-resolution variant.
///
/// Blogger serves thumbnails either with a size path segment
/// (`.../s72-c/photo.jpg`, `.../w400-h300-p/photo.jpg`) or with a size suffix
/// after `=` (`.../AVvXs...=s72-c`). The first such size token is replaced with
/// [`HIGH_RES_SIZE`]; everything else, query string included, is left intact.
/// URLs without a recognizable size token are returned unchanged.
pub fn upgrade_thumbnail_url(url: &str) -> String {
    let (base, query) = match url.find('?') {
        Some(idx) => (&url[..idx], &url[idx..]),
        None => (url, ""),
    };

    let path_start = base
        .find("://")
        .and_then(|scheme_end| {
            base[scheme_end + 3..]
                .find('/')
                .map(|host_len| scheme_end + 3 + host_len)
        })
        .unwrap_or(0);
    let (origin, path) = base.split_at(path_start);

    let mut segments: Vec<String> = path.split('/').map(ToString::to_string).collect();
    let last = segments.len().saturating_sub(1);
    for (idx, segment) in segments.iter_mut().enumerate() {
        if idx != last && is_size_token(segment) {
            *segment = HIGH_RES_SIZE.to_string();
            return format!("{origin}{}{query}", segments.join("/"));
        }
    }

    if let Some(last_segment) = segments.last_mut() {
        if let Some(eq) = last_segment.rfind('=') {
            if is_size_token(&last_segment[eq + 1..]) {
                last_segment.truncate(eq + 1);
                last_segment.push_str(HIGH_RES_SIZE);
                return format!("{origin}{}{query}", segments.join("/"));
            }
        }
    }

    url.to_string()
}

fn is_size_token(token: &str) -> bool {
    let mut parts = token.split('-');
    let Some(first) = parts.next() else {
        return false;
    };
    if !is_dimension(first) {
        return false;
    }
    parts.all(|part| is_dimension(part) || matches!(part, "c" | "p" | "k" | "no" | "rw" | "nu"))
}

fn is_dimension(part: &str) -> bool {
    let mut chars = part.chars();
    matches!(chars.next(), Some('s' | 'w' | 'h'))
        && part.len() > 1
        && chars.all(|c| c.is_ascii_digit())
}

/// Take at most `max_chars` characters, never splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrades_blogspot_path_segment() {
        assert_eq!(
            upgrade_thumbnail_url("https://1.bp.blogspot.com/-abc/XYZ/AAA/s72-c/photo.jpg"),
            "https://1.bp.blogspot.com/-abc/XYZ/AAA/s1600/photo.jpg"
        );
        assert_eq!(
            upgrade_thumbnail_url(
                "https://blogger.googleusercontent.com/img/b/R29v/w400-h300-p-k-no-nu/cover.png"
            ),
            "https://blogger.googleusercontent.com/img/b/R29v/s1600/cover.png"
        );
    }

    #[test]
    fn upgrades_equals_suffix_and_keeps_query() {
        assert_eq!(
            upgrade_thumbnail_url("https://blogger.googleusercontent.com/img/b/R29v/AVvXsEg=s72-c"),
            "https://blogger.googleusercontent.com/img/b/R29v/AVvXsEg=s1600"
        );
        assert_eq!(
            upgrade_thumbnail_url("https://x.bp.blogspot.com/a/s72-c/p.png?text=No+Image"),
            "https://x.bp.blogspot.com/a/s1600/p.png?text=No+Image"
        );
    }

    #[test]
    fn leaves_unrecognized_urls_alone() {
        let plain = "https://example.com/images/sunset.jpg";
        assert_eq!(upgrade_thumbnail_url(plain), plain);
        // a file literally named like a size token is not a path segment
        let file = "https://example.com/img/s72";
        assert_eq!(upgrade_thumbnail_url(file), file);
        let already = "https://1.bp.blogspot.com/a/s1600/photo.jpg";
        assert_eq!(upgrade_thumbnail_url(already), already);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("部落格文章", 2), "部落");
        assert_eq!(truncate_chars("short", 120), "short");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn missing_keywords_are_omitted_and_detectable() {
        let json = r#"{
            "link": "https://blog.example/a.html",
            "title": "A",
            "published": "2024-01-01T00:00:00Z",
            "last_modified": "2024-01-02T00:00:00Z",
            "image": "https://img.example/a.png",
            "summary": "sum"
        }"#;
        let record: Record = serde_json::from_str(json).unwrap();
        assert!(record.keywords.is_none());
        assert!(record.tags.is_empty());

        let back = serde_json::to_value(&record).unwrap();
        assert!(back.get("keywords").is_none());

        let with_empty = Record {
            keywords: Some(Vec::new()),
            ..record
        };
        let value = serde_json::to_value(&with_empty).unwrap();
        assert_eq!(value["keywords"], serde_json::json!([]));
    }

    #[test]
    fn stats_count_refreshes() {
        let mut stats = SyncStats::default();
        for decision in [
            Decision::New,
            Decision::Updated,
            Decision::Incomplete,
            Decision::Unchanged,
        ] {
            stats.record(decision);
        }
        assert_eq!(stats.refreshed(), 3);
        assert_eq!(stats.reused, 1);
        assert!(!Decision::Unchanged.needs_refresh());
        assert!(Decision::Incomplete.needs_refresh());
    }
}
