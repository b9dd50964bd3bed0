//! Existing-record store and snapshot writer backends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use feedmirror_core::Record;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Nothing has been stored yet. Callers start from an empty collection.
    #[error("no stored snapshot at {location}")]
    NotAvailable { location: String },
    /// Stored data exists but cannot be decoded. Never overwritten implicitly.
    #[error("stored snapshot at {location} is malformed: {reason}")]
    CorruptState { location: String, reason: String },
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Durable home of the record collection, addressed by one stable name.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Human-readable name of the snapshot (file path or KV key).
    fn location(&self) -> String;

    async fn load(&self) -> Result<Vec<Record>, StoreError>;

    /// Replace the stored snapshot with `records` in one write.
    async fn write(&self, records: &[Record]) -> Result<(), StoreError>;
}

/// Serialize a collection the way every backend stores it: pretty JSON array plus newline.
pub fn encode_snapshot(records: &[Record]) -> Result<Vec<u8>, StoreError> {
    let mut bytes = serde_json::to_vec_pretty(records)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn decode_snapshot(location: &str, bytes: &[u8]) -> Result<Vec<Record>, StoreError> {
    serde_json::from_slice(bytes).map_err(|err| StoreError::CorruptState {
        location: location.to_string(),
        reason: err.to_string(),
    })
}

/// Key stored records by identity. The first record for an identity wins.
pub fn index_records(records: &[Record]) -> HashMap<String, Record> {
    let mut map = HashMap::with_capacity(records.len());
    for record in records {
        if map.contains_key(&record.link) {
            warn!(link = %record.link, "duplicate identity in stored snapshot; keeping first");
            continue;
        }
        map.insert(record.link.clone(), record.clone());
    }
    map
}

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self) -> Result<Vec<Record>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotAvailable {
                    location: self.location(),
                });
            }
            Err(err) => return Err(self.io_error(&self.path, err)),
        };
        let records = decode_snapshot(&self.location(), &bytes)?;
        debug!(path = %self.path.display(), records = records.len(), "loaded snapshot");
        Ok(records)
    }

    /// Write via a sibling temp file and atomic rename so readers never see a partial snapshot.
    async fn write(&self, records: &[Record]) -> Result<(), StoreError> {
        let bytes = encode_snapshot(records)?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| self.io_error(&parent, err))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error(&self.path, err));
        }

        info!(path = %self.path.display(), records = records.len(), "snapshot written");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct KvConfig {
    pub account_id: String,
    pub namespace_id: String,
    pub api_token: String,
    pub key: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl KvConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.cloudflare.com/client/v4";
}

/// Snapshot stored as a single value in a Cloudflare Workers KV namespace.
#[derive(Debug)]
pub struct CloudflareKvStore {
    config: KvConfig,
    http: reqwest::Client,
}

impl CloudflareKvStore {
    pub fn new(config: KvConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building KV reqwest client")?;
        Ok(Self { config, http })
    }

    fn value_url(&self) -> String {
        format!(
            "{}/accounts/{}/storage/kv/namespaces/{}/values/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.account_id,
            self.config.namespace_id,
            self.config.key
        )
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.config.api_token)
    }
}

#[async_trait]
impl RecordStore for CloudflareKvStore {
    fn location(&self) -> String {
        format!("kv://{}/{}", self.config.namespace_id, self.config.key)
    }

    async fn load(&self) -> Result<Vec<Record>, StoreError> {
        let resp = self
            .http
            .get(self.value_url())
            .header(AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(StoreError::NotAvailable {
                location: self.location(),
            }),
            status if status.is_success() => {
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|err| StoreError::Unavailable(err.to_string()))?;
                decode_snapshot(&self.location(), &bytes)
            }
            status => Err(StoreError::Unavailable(format!(
                "KV read returned http status {status}"
            ))),
        }
    }

    async fn write(&self, records: &[Record]) -> Result<(), StoreError> {
        let bytes = encode_snapshot(records)?;
        let resp = self
            .http
            .put(self.value_url())
            .header(AUTHORIZATION, self.bearer())
            .header(CONTENT_TYPE, "application/json")
            .body(bytes)
            .send()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Unavailable(format!(
                "KV write returned http status {status}: {body}"
            )));
        }
        info!(location = %self.location(), records = records.len(), "snapshot written");
        Ok(())
    }
}
