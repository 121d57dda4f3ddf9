//! Where the relay gets the payload it hands to the streaming helper.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use ferry_common::{ByteStream, Error, Payload, Result};
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use url::Url;

#[async_trait]
pub trait PayloadSource: Send + Sync {
    /// Human-readable name for logs.
    fn describe(&self) -> String;

    /// Produce a fresh payload. Called once per transfer.
    async fn fetch(&self) -> Result<Payload>;
}

/// Re-slice a byte stream into `chunk_size` pieces; the last may be short.
///
/// An error from `inner` is passed through and ends the stream.
pub fn rechunk<S>(inner: S, chunk_size: usize) -> ByteStream
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let chunk_size = chunk_size.max(1);
    let state = (Box::pin(inner), BytesMut::new(), false);
    Box::pin(stream::unfold(
        state,
        move |(mut inner, mut buf, mut done)| async move {
            loop {
                if buf.len() >= chunk_size {
                    let chunk = buf.split_to(chunk_size).freeze();
                    return Some((Ok(chunk), (inner, buf, done)));
                }
                if done {
                    if buf.is_empty() {
                        return None;
                    }
                    let chunk = buf.split().freeze();
                    return Some((Ok(chunk), (inner, buf, done)));
                }
                match inner.next().await {
                    Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        buf.clear();
                        return Some((Err(e), (inner, buf, true)));
                    }
                    None => done = true,
                }
            }
        },
    ))
}

/// GET a URL and stream the body.
///
/// Requests bypass caches and never carry cookies.
pub struct HttpSource {
    client: reqwest::Client,
    url: Url,
    chunk_size: usize,
}

impl HttpSource {
    pub fn new(url: &str, chunk_size: usize) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::config(format!("invalid url {url:?}: {e}")))?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("ferry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url,
            chunk_size,
        })
    }
}

#[async_trait]
impl PayloadSource for HttpSource {
    fn describe(&self) -> String {
        self.url.to_string()
    }

    async fn fetch(&self) -> Result<Payload> {
        let response = self
            .client
            .get(self.url.clone())
            .header(CACHE_CONTROL, "no-store")
            .header(PRAGMA, "no-cache")
            .send()
            .await
            .map_err(|e| Error::transfer(format!("GET {}: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::transfer(format!("GET {} returned {}", self.url, status)));
        }
        info!(
            "Fetching {} ({} bytes advertised)",
            self.url,
            response
                .content_length()
                .map_or_else(|| "unknown".to_string(), |n| n.to_string())
        );

        let body = response
            .bytes_stream()
            .map(|item| item.map_err(|e| Error::transfer(format!("body read failed: {e}"))));
        Ok(Payload::Stream(rechunk(body, self.chunk_size)))
    }
}

pub struct FileSource {
    path: PathBuf,
    chunk_size: usize,
    buffered: bool,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            path: path.into(),
            chunk_size: chunk_size.max(1),
            buffered: false,
        }
    }

    /// Read the whole file up front and send it as one buffer.
    pub fn buffered(mut self, buffered: bool) -> Self {
        self.buffered = buffered;
        self
    }
}

#[async_trait]
impl PayloadSource for FileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self) -> Result<Payload> {
        if self.buffered {
            let data = tokio::fs::read(&self.path).await?;
            debug!("Read {} bytes from {}", data.len(), self.path.display());
            return Ok(Payload::Buffer(Bytes::from(data)));
        }

        let file = File::open(&self.path).await?;
        let reads = ReaderStream::with_capacity(file, self.chunk_size)
            .map(|item| item.map_err(Error::from));
        Ok(Payload::Stream(rechunk(reads, self.chunk_size)))
    }
}

/// Fixed in-memory payload.
#[derive(Debug, Clone)]
pub enum MemorySource {
    Buffer(Bytes),
    Chunks(Vec<Bytes>),
}

#[async_trait]
impl PayloadSource for MemorySource {
    fn describe(&self) -> String {
        match self {
            MemorySource::Buffer(data) => format!("memory buffer ({} bytes)", data.len()),
            MemorySource::Chunks(chunks) => format!("memory stream ({} chunks)", chunks.len()),
        }
    }

    async fn fetch(&self) -> Result<Payload> {
        Ok(match self {
            MemorySource::Buffer(data) => Payload::Buffer(data.clone()),
            MemorySource::Chunks(chunks) => Payload::from_chunks(chunks.clone()),
        })
    }
}
