use std::fmt;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::stream::{write_cached, write_uncached};
use crate::{Cache, GetRequest, ProxyCache, ProxyError, Result, Source, SourceStream};

const DEFAULT_NO_CACHE_BARRIER: f64 = 0.2;

/// `Content-Range` of a partial response, inclusive `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub size: u64,
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.size)
    }
}

/// Status line and headers sent ahead of a proxied body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub partial: bool,
    pub content_length: Option<u64>,
    pub content_range: Option<ContentRange>,
    pub content_type: Option<String>,
}

impl ResponseHead {
    /// `length` is the full resource length if known; `range_offset` only
    /// matters for partial responses.
    pub fn new(mime: Option<&str>, partial: bool, range_offset: u64, length: Option<u64>) -> Self {
        let content_length = length.map(|length| {
            if partial {
                length.saturating_sub(range_offset)
            } else {
                length
            }
        });
        let content_range = length.filter(|_| partial).map(|size| ContentRange {
            start: range_offset,
            end: size.saturating_sub(1),
            size,
        });
        ResponseHead {
            partial,
            content_length,
            content_range,
            content_type: mime.filter(|mime| !mime.is_empty()).map(str::to_string),
        }
    }
}

impl fmt::Display for ResponseHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.partial {
            write!(f, "HTTP/1.1 206 PARTIAL CONTENT\r\n")?;
        } else {
            write!(f, "HTTP/1.1 200 OK\r\n")?;
        }
        write!(f, "Accept-Ranges: bytes\r\n")?;
        if let Some(content_length) = self.content_length {
            write!(f, "Content-Length: {content_length}\r\n")?;
        }
        if let Some(content_range) = self.content_range {
            write!(f, "Content-Range: {content_range}\r\n")?;
        }
        if let Some(content_type) = &self.content_type {
            write!(f, "Content-Type: {content_type}\r\n")?;
        }
        write!(f, "\r\n")
    }
}

/// Whether a request should be answered from the cache.
///
/// Partial requests starting more than `barrier` of the source length past
/// the cached bytes look like a seek, so they bypass the cache instead of
/// waiting for it to catch up.
pub fn use_cache(request: &GetRequest, source_length: Option<u64>, cache_available: u64, barrier: f64) -> bool {
    match source_length {
        Some(source_length) if request.partial => {
            request.range_offset as f64 <= cache_available as f64 + source_length as f64 * barrier
        }
        _ => true,
    }
}

/// Answers HTTP `GET` and range `GET` requests through a [`ProxyCache`].
pub struct HttpProxyCache<S, C> {
    proxy: ProxyCache<S, C>,
    no_cache_barrier: f64,
}

impl<S: Source, C: Cache> HttpProxyCache<S, C> {
    pub fn new(proxy: ProxyCache<S, C>) -> Self {
        HttpProxyCache { proxy, no_cache_barrier: DEFAULT_NO_CACHE_BARRIER }
    }

    pub fn with_no_cache_barrier(mut self, barrier: f64) -> Self {
        self.no_cache_barrier = barrier;
        self
    }

    pub fn proxy(&self) -> &ProxyCache<S, C> {
        &self.proxy
    }

    /// Writes the response headers, then the body from the cache or straight from the source.
    pub async fn serve<W: AsyncWrite + Unpin + Send>(&self, request: &GetRequest, out: W) -> Result<()> {
        let mut out = BufWriter::new(out);
        let head = self.response_head(request).await?;
        out.write_all(head.to_string().as_bytes()).await?;

        let offset = request.range_offset;
        if self.is_use_cache(request).await? {
            let written = write_cached(&self.proxy, &mut out, offset, self.proxy.config().buffer_size).await?;
            debug!(path = %request.path, offset, written, "served from cache");
        } else {
            let written = self.respond_without_cache(&mut out, offset).await?;
            debug!(path = %request.path, offset, written, "served bypassing cache");
        }
        Ok(())
    }

    /// Response headers for `request`, with the length taken from a complete
    /// cache or else from the source.
    pub async fn response_head(&self, request: &GetRequest) -> Result<ResponseHead> {
        let cache = self.proxy.cache();
        let source = self.proxy.source();
        let length = if cache.is_completed().await {
            Some(cache.available().await?)
        } else {
            source.length().await
        };
        let mime = source.mime().await;
        Ok(ResponseHead::new(mime.as_deref(), request.partial, request.range_offset, length))
    }

    pub async fn shutdown(&self) {
        self.proxy.shutdown().await;
    }

    async fn is_use_cache(&self, request: &GetRequest) -> Result<bool> {
        let source_length = self.proxy.source().length().await;
        let cache_available = self.proxy.cache().available().await?;
        Ok(use_cache(request, source_length, cache_available, self.no_cache_barrier))
    }

    async fn respond_without_cache<W: AsyncWrite + Unpin + Send>(&self, out: &mut W, offset: u64) -> Result<u64> {
        let source = self.proxy.source();
        let mut stream = source.open(offset).await?;
        let written = write_uncached(&mut stream, out).await;
        if let Err(e) = stream.close().await {
            self.proxy.report(&ProxyError::close(format!("source {source:?}"), e));
        }
        written
    }
}
