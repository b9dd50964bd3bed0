use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use feedmirror_core::MAX_KEYWORDS;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::KeywordExtractor;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl GeminiConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com/v1beta";
    pub const DEFAULT_MODEL: &'static str = "gemini-2.0-flash";
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

fn keyword_prompt(text: &str) -> String {
    format!(
        "Extract at most {MAX_KEYWORDS} search keywords from the blog post below. \
         Use the post's own language. Reply with a JSON array of strings only.\n\n{text}"
    )
}

/// Turn a model reply into a bounded keyword list.
///
/// Accepts a JSON array (optionally wrapped in a ```json fence) or a
/// comma/newline separated list. Keywords are trimmed, de-duplicated
/// case-insensitively and capped at [`MAX_KEYWORDS`].
pub fn parse_keyword_reply(reply: &str) -> Vec<String> {
    let body = reply.trim();
    let body = body
        .strip_prefix("```json")
        .or_else(|| body.strip_prefix("```"))
        .unwrap_or(body);
    let body = body.strip_suffix("```").unwrap_or(body).trim();

    let raw: Vec<String> = match serde_json::from_str::<Vec<String>>(body) {
        Ok(list) => list,
        Err(_) => body
            .split(|c| matches!(c, ',' | '\n' | '，' | '、'))
            .map(ToString::to_string)
            .collect(),
    };

    let mut seen = std::collections::HashSet::new();
    raw.into_iter()
        .map(|kw| {
            kw.trim()
                .trim_start_matches(|c| matches!(c, '-' | '*' | '•'))
                .trim()
                .trim_matches(|c| matches!(c, '"' | '\'' | '[' | ']'))
                .trim()
                .to_string()
        })
        .filter(|kw| !kw.is_empty())
        .filter(|kw| seen.insert(kw.to_lowercase()))
        .take(MAX_KEYWORDS)
        .collect()
}

/// Keyword extraction through the Gemini `generateContent` API.
#[derive(Debug)]
pub struct GeminiKeywordExtractor {
    config: GeminiConfig,
    http: reqwest::Client,
}

impl GeminiKeywordExtractor {
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building Gemini reqwest client")?;
        Ok(Self { config, http })
    }

    async fn request_keywords(&self, text: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );
        let prompt = keyword_prompt(text);
        let request = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart { text: &prompt }],
            }],
        };

        debug!(model = %self.config.model, chars = text.chars().count(), "Gemini keyword request");

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Gemini API error ({status}): {error_text}"));
        }

        let body: GenerateResponse = response.json().await.context("decoding Gemini response")?;
        let reply = body
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");
        if reply.trim().is_empty() {
            return Err(anyhow!("Gemini returned no text"));
        }
        Ok(parse_keyword_reply(&reply))
    }
}

#[async_trait]
impl KeywordExtractor for GeminiKeywordExtractor {
    async fn extract_keywords(&self, text: &str) -> Option<Vec<String>> {
        match self.request_keywords(text).await {
            Ok(keywords) => Some(keywords),
            Err(err) => {
                warn!(error = %err, "keyword extraction failed; storing no keywords");
                None
            }
        }
    }
}

/// Used when no API key is configured. Every refresh then stores an empty keyword list.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledKeywordExtractor;

#[async_trait]
impl KeywordExtractor for DisabledKeywordExtractor {
    async fn extract_keywords(&self, _text: &str) -> Option<Vec<String>> {
        None
    }
}
