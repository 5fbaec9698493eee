//! src/services/blob_client.rs
//!
//! Remote blob store client. Content lives in a chat on the messaging
//! platform; a blob reference is the platform's file id. Reading is a two-hop
//! affair: the reference is first resolved to a short-lived download URL,
//! then the bytes are fetched from that URL. Resolved URLs expire and are
//! never cached here.
//!
//! `TelegramBlobStore` talks to the bot API over `reqwest`. `MemoryBlobStore`
//! keeps blobs in process and backs local development and the tests.

use crate::{
    config::BlobStoreConfig,
    models::platform::{ApiResponse, FileInfo, Message},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt, stream};
use reqwest::{Client, StatusCode, header};
use serde::de::DeserializeOwned;
use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Boxed stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("remote blob store request failed: {0}")]
    Request(reqwest::Error),
    #[error("remote blob store answered HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("remote blob store rejected the call: {0}")]
    Api(String),
    #[error("blob `{0}` is unknown to the remote store")]
    UnknownRef(String),
    #[error("remote blob store did not answer within {0:?}")]
    Timeout(Duration),
    #[error("remote blob store is offline")]
    Offline,
}

pub type BlobResult<T> = Result<T, BlobError>;

impl From<reqwest::Error> for BlobError {
    /// Request URLs embed the bot token, so they are stripped here.
    fn from(err: reqwest::Error) -> Self {
        BlobError::Request(err.without_url())
    }
}

/// Inclusive byte range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    /// Value for an HTTP `Range` request header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// An open download from the remote store.
pub struct BlobBody {
    pub stream: ByteStream,
    pub content_length: Option<u64>,
    /// Whether the upstream honoured the requested range.
    pub partial: bool,
}

/// Payload handed to the remote store.
#[derive(Debug, Clone)]
pub struct BlobUpload {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub caption: Option<String>,
    pub payload: Bytes,
}

/// Where the remote store put an uploaded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub blob_ref: String,
    pub size: Option<i64>,
}

/// Remote blob store operations used by the gateways.
#[async_trait]
pub trait RemoteBlobStore: Send + Sync {
    /// Turn a blob reference into a short-lived direct URL.
    async fn resolve_url(&self, blob_ref: &str) -> BlobResult<String>;

    /// Open `url`, optionally restricted to `range`.
    async fn fetch(&self, url: &str, range: Option<ByteRange>) -> BlobResult<BlobBody>;

    /// Store a payload and return its reference.
    async fn upload(&self, upload: BlobUpload) -> BlobResult<StoredBlob>;

    /// Cheap reachability check for readiness probes.
    async fn ping(&self) -> BlobResult<()>;
}

/// Blob store backed by a chat on the bot API.
#[derive(Clone)]
pub struct TelegramBlobStore {
    config: BlobStoreConfig,
    client: Client,
}

impl TelegramBlobStore {
    pub fn new(config: BlobStoreConfig) -> BlobResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.timeout)
            .user_agent(concat!("chat-drive/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { config, client })
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.config.api_base_url, self.config.bot_token
        )
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{}",
            self.config.api_base_url,
            self.config.bot_token,
            file_path.trim_start_matches('/')
        )
    }

    /// Remove the bot token from text that came back from upstream.
    fn redact(&self, text: &str) -> String {
        if self.config.bot_token.is_empty() {
            return text.to_string();
        }
        text.replace(&self.config.bot_token, "<redacted>")
    }

    async fn status_error(&self, response: reqwest::Response) -> BlobError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        BlobError::Status {
            status,
            body: self.redact(&body),
        }
    }

    /// Unwrap the API envelope, turning `ok: false` into an error.
    async fn read_api<T: DeserializeOwned>(&self, response: reqwest::Response) -> BlobResult<T> {
        let status = response.status();
        if !status.is_success() && status != StatusCode::BAD_REQUEST {
            return Err(self.status_error(response).await);
        }

        let envelope: ApiResponse<T> = response.json().await?;
        if !envelope.ok {
            let description = envelope
                .description
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(BlobError::Api(self.redact(&description)));
        }
        envelope
            .result
            .ok_or_else(|| BlobError::Api("response carried no result".into()))
    }
}

#[async_trait]
impl RemoteBlobStore for TelegramBlobStore {
    async fn resolve_url(&self, blob_ref: &str) -> BlobResult<String> {
        let response = self
            .client
            .get(self.api_url("getFile"))
            .query(&[("file_id", blob_ref)])
            .send()
            .await?;
        let info: FileInfo = self.read_api(response).await?;
        let path = info
            .file_path
            .ok_or_else(|| BlobError::UnknownRef(blob_ref.to_string()))?;
        debug!(file_id = %info.file_id, "resolved blob reference");
        Ok(self.file_url(&path))
    }

    async fn fetch(&self, url: &str, range: Option<ByteRange>) -> BlobResult<BlobBody> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(header::RANGE, range.header_value());
        }

        let response = request.send().await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(self.status_error(response).await);
        }

        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map_err(|err| io::Error::other(err.without_url()));
        Ok(BlobBody {
            stream: Box::pin(stream),
            content_length,
            partial: status == StatusCode::PARTIAL_CONTENT,
        })
    }

    async fn upload(&self, upload: BlobUpload) -> BlobResult<StoredBlob> {
        let size = upload.payload.len() as u64;
        let mut part = reqwest::multipart::Part::stream_with_length(upload.payload, size)
            .file_name(upload.file_name.clone());
        if let Some(mime) = upload.mime_type.as_deref() {
            part = part
                .mime_str(mime)
                .map_err(|e| BlobError::Api(format!("invalid mime type `{mime}`: {e}")))?;
        }

        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", self.config.chat_id.clone())
            .part("document", part);
        if let Some(caption) = upload.caption {
            form = form.text("caption", caption);
        }

        debug!(file_name = %upload.file_name, size, "sending document");
        let response = self
            .client
            .post(self.api_url("sendDocument"))
            .multipart(form)
            .send()
            .await?;
        let message: Message = self.read_api(response).await?;

        let attachment = message
            .attachment()
            .ok_or_else(|| BlobError::Api("sent message carries no file".into()))?;
        Ok(StoredBlob {
            blob_ref: attachment.file_id,
            size: attachment.file_size.or(Some(size as i64)),
        })
    }

    async fn ping(&self) -> BlobResult<()> {
        let response = self.client.get(self.api_url("getMe")).send().await?;
        let _: serde_json::Value = self.read_api(response).await?;
        Ok(())
    }
}

const MEMORY_URL_PREFIX: &str = "memory://";
const DEFAULT_MEMORY_CHUNK: usize = 64 * 1024;

/// In-process blob store.
///
/// Bodies are streamed in fixed-size chunks. The store can be taken offline
/// and told to ignore ranges, which is how upstream failures and non-range
/// capable servers are simulated.
#[derive(Clone)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Bytes>>>,
    offline: Arc<AtomicBool>,
    ignore_ranges: Arc<AtomicBool>,
    chunk_size: usize,
    uploads: Arc<AtomicUsize>,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: Arc::default(),
            offline: Arc::default(),
            ignore_ranges: Arc::default(),
            chunk_size: DEFAULT_MEMORY_CHUNK,
            uploads: Arc::default(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Store `data` directly and return its reference.
    pub async fn insert(&self, data: impl Into<Bytes>) -> String {
        let blob_ref = Uuid::new_v4().to_string();
        self.blobs.write().await.insert(blob_ref.clone(), data.into());
        blob_ref
    }

    pub async fn get(&self, blob_ref: &str) -> Option<Bytes> {
        self.blobs.read().await.get(blob_ref).cloned()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_ignore_ranges(&self, ignore: bool) {
        self.ignore_ranges.store(ignore, Ordering::SeqCst);
    }

    /// Number of uploads accepted so far.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> BlobResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BlobError::Offline);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBlobStore for MemoryBlobStore {
    async fn resolve_url(&self, blob_ref: &str) -> BlobResult<String> {
        self.ensure_online()?;
        if !self.blobs.read().await.contains_key(blob_ref) {
            return Err(BlobError::UnknownRef(blob_ref.to_string()));
        }
        Ok(format!("{MEMORY_URL_PREFIX}{blob_ref}"))
    }

    async fn fetch(&self, url: &str, range: Option<ByteRange>) -> BlobResult<BlobBody> {
        self.ensure_online()?;
        let blob_ref = url
            .strip_prefix(MEMORY_URL_PREFIX)
            .ok_or_else(|| BlobError::Api(format!("not a memory url: {url}")))?;
        let data = self
            .get(blob_ref)
            .await
            .ok_or_else(|| BlobError::UnknownRef(blob_ref.to_string()))?;

        let (data, partial) = match range {
            Some(range) if !self.ignore_ranges.load(Ordering::SeqCst) => {
                let len = data.len() as u64;
                if range.start >= len {
                    return Err(BlobError::Status {
                        status: StatusCode::RANGE_NOT_SATISFIABLE.as_u16(),
                        body: String::new(),
                    });
                }
                let end = range.end.min(len - 1);
                (data.slice(range.start as usize..=end as usize), true)
            }
            _ => (data, false),
        };

        let content_length = Some(data.len() as u64);
        let chunks: Vec<io::Result<Bytes>> = data
            .chunks(self.chunk_size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(BlobBody {
            stream: stream::iter(chunks).boxed(),
            content_length,
            partial,
        })
    }

    async fn upload(&self, upload: BlobUpload) -> BlobResult<StoredBlob> {
        self.ensure_online()?;
        let size = upload.payload.len() as i64;
        let blob_ref = self.insert(upload.payload).await;
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(StoredBlob {
            blob_ref,
            size: Some(size),
        })
    }

    async fn ping(&self) -> BlobResult<()> {
        self.ensure_online()
    }
}
