//! Artifact storage + HTTP utilities for fleetsync.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use fleetsync_core::Record;
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fleetsync-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub name: String,
    pub absolute_path: PathBuf,
    pub content_hash: String,
    pub rows: usize,
    pub byte_size: usize,
}

/// A delimited-text artifact: header row plus one record per data row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub header: Vec<String>,
    pub records: Vec<Record>,
}

/// Flat-file exchange directory shared by the pipeline stages.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }

    /// Names from `names` with no file on disk, in input order.
    pub fn missing<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        names
            .into_iter()
            .filter(|name| !self.exists(name))
            .map(str::to_string)
            .collect()
    }

    /// Reads an artifact. Columns a row lacks are left absent on its record so
    /// callers render them as the unknown placeholder.
    pub async fn read_table(&self, name: &str) -> anyhow::Result<Table> {
        let path = self.path_for(name);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading artifact {}", path.display()))?;
        parse_table(&bytes).with_context(|| format!("parsing artifact {}", path.display()))
    }

    pub async fn read_records(&self, name: &str) -> anyhow::Result<Vec<Record>> {
        Ok(self.read_table(name).await?.records)
    }

    /// Writes `records` under `header` column order via temp-file + rename so
    /// a reader never observes a half-written artifact.
    pub async fn write_records(
        &self,
        name: &str,
        header: &[impl AsRef<str>],
        records: &[Record],
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = render_table(header, records)
            .with_context(|| format!("rendering artifact {name}"))?;
        let absolute_path = self.path_for(name);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredArtifact {
            name: name.to_string(),
            absolute_path,
            content_hash: Self::sha256_hex(&bytes),
            rows: records.len(),
            byte_size: bytes.len(),
        })
    }

    /// Deletes the named artifacts that exist; returns the deleted paths.
    pub async fn delete<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> anyhow::Result<Vec<PathBuf>> {
        let mut deleted = Vec::new();
        for name in names {
            let path = self.path_for(name);
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "deleted artifact");
                    deleted.push(path);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("deleting artifact {}", path.display()))
                }
            }
        }
        Ok(deleted)
    }
}

fn parse_table(bytes: &[u8]) -> anyhow::Result<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let header = reader
        .headers()
        .context("reading header row")?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect::<Vec<_>>();

    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("reading data row {}", index + 1))?;
        let mut record = Record::new();
        for (column, name) in header.iter().enumerate() {
            if let Some(value) = row.get(column) {
                record.set(name.clone(), value);
            }
        }
        records.push(record);
    }
    Ok(Table { header, records })
}

fn render_table(header: &[impl AsRef<str>], records: &[Record]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(header.iter().map(|h| h.as_ref()))
        .context("writing header row")?;
    for record in records {
        writer
            .write_record(record.render(header))
            .context("writing data row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv writer: {}", err.error()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Appends URL-encoded query parameters to `base`.
pub fn url_with_query(base: &str, params: &[(&str, &str)]) -> anyhow::Result<String> {
    let url = reqwest::Url::parse_with_params(base, params)
        .with_context(|| format!("building url from {base}"))?;
    Ok(url.to_string())
}

#[derive(Debug, Clone)]
pub enum Auth {
    Bearer(String),
    Basic { username: String, password: String },
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Errors surface per call; retrying is left to the enclosing stage.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        disposition: RetryDisposition,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        disposition: RetryDisposition,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request { disposition, .. } | Self::HttpStatus { disposition, .. } => {
                *disposition
            }
            Self::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Thin JSON-over-HTTP client shared by the external system adapters.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            token_bucket,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        auth: &Auth,
    ) -> Result<T, FetchError> {
        self.send(Method::GET, url, auth, None::<&()>).await
    }

    pub async fn put_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        auth: &Auth,
        body: &B,
    ) -> Result<T, FetchError> {
        self.send(Method::PUT, url, auth, Some(body)).await
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        auth: &Auth,
        body: &B,
    ) -> Result<T, FetchError> {
        self.send(Method::POST, url, auth, Some(body)).await
    }

    async fn send<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        auth: &Auth,
        body: Option<&B>,
    ) -> Result<T, FetchError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_request", %method, url);
        async {
            let mut request = self.client.request(method, url);
            request = match auth {
                Auth::Bearer(token) => request.bearer_auth(token),
                Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
            };
            if let Some(body) = body {
                request = request.json(body);
            }

            let resp = request.send().await.map_err(|source| FetchError::Request {
                url: url.to_string(),
                disposition: classify_reqwest_error(&source),
                source,
            })?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    disposition: classify_status(status),
                });
            }

            let bytes = resp.bytes().await.map_err(|source| FetchError::Request {
                url: final_url.clone(),
                disposition: classify_reqwest_error(&source),
                source,
            })?;
            debug!(status = status.as_u16(), bytes = bytes.len(), "http response");
            serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}
