use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{Cache, ProxyError, Result, Source, SourceStream};

const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// [`Source`] over bytes already held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
    chunk_size: usize,
    length_known: bool,
    mime: Option<String>,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        MemorySource {
            data: data.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            length_known: true,
            mime: None,
        }
    }

    /// Size of the chunks handed out by [`MemoryStream::read`].
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    /// Hides the length, like an upstream answering without `Content-Length`.
    pub fn with_unknown_length(mut self) -> Self {
        self.length_known = false;
        self
    }
}

#[async_trait]
impl Source for MemorySource {
    type Stream = MemoryStream;

    async fn open(&self, offset: u64) -> Result<MemoryStream> {
        let start = usize::try_from(offset)
            .ok()
            .filter(|start| *start <= self.data.len())
            .ok_or_else(|| ProxyError::SourceOpen {
                offset,
                reason: format!("offset beyond {} bytes", self.data.len()),
            })?;
        Ok(MemoryStream {
            remaining: self.data.slice(start..),
            chunk_size: self.chunk_size,
        })
    }

    async fn length(&self) -> Option<u64> {
        self.length_known.then_some(self.data.len() as u64)
    }

    async fn mime(&self) -> Option<String> {
        self.mime.clone()
    }
}

#[derive(Debug)]
pub struct MemoryStream {
    remaining: Bytes,
    chunk_size: usize,
}

#[async_trait]
impl SourceStream for MemoryStream {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        if self.remaining.is_empty() {
            return Ok(None);
        }
        let n = self.chunk_size.min(self.remaining.len());
        Ok(Some(self.remaining.split_to(n)))
    }

    async fn close(&mut self) -> Result<()> {
        self.remaining.clear();
        Ok(())
    }
}

/// [`Cache`] keeping persisted bytes in a growable buffer.
#[derive(Debug, Default)]
pub struct MemoryCache {
    data: RwLock<Vec<u8>>,
    completed: AtomicBool,
    closed: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache::default()
    }

    /// A cache already holding the whole resource.
    pub fn completed(data: impl Into<Vec<u8>>) -> Self {
        MemoryCache {
            data: RwLock::new(data.into()),
            completed: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Copy of the persisted bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().map(|data| data.clone()).unwrap_or_default()
    }

    fn poisoned() -> ProxyError {
        ProxyError::Cache("memory cache lock poisoned".to_string())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn available(&self) -> Result<u64> {
        let data = self.data.read().map_err(|_| MemoryCache::poisoned())?;
        Ok(data.len() as u64)
    }

    async fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.data.read().map_err(|_| MemoryCache::poisoned())?;
        let start = match usize::try_from(offset) {
            Ok(start) if start < data.len() => start,
            _ => return Ok(0),
        };
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    async fn append(&self, bytes: &[u8]) -> Result<()> {
        if self.completed.load(Ordering::Acquire) {
            return Err(ProxyError::Cache("error appending to a completed cache".to_string()));
        }
        if self.is_closed() {
            return Err(ProxyError::Cache("error appending to a closed cache".to_string()));
        }
        let mut data = self.data.write().map_err(|_| MemoryCache::poisoned())?;
        data.extend_from_slice(bytes);
        Ok(())
    }

    async fn complete(&self) -> Result<()> {
        self.completed.store(true, Ordering::Release);
        Ok(())
    }

    async fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
