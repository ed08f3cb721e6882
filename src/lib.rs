//! # range-cache-proxy
//!
//! Local caching proxy for progressively downloadable HTTP resources such as
//! media streams.
//!
//! A consumer reads through HTTP range requests while a single background
//! fetch pulls bytes from the upstream [`Source`] and appends them to a
//! [`Cache`]. Reads block until the bytes they need are persisted, so a
//! player can start before the resource is complete and every later or
//! concurrent read is answered from the cache.
//!
//! The coordination lives in [`ProxyCache`]; [`HttpProxyCache`] adds the
//! HTTP response on top of it, and [`ProxyServer`] wires both to a TCP
//! listener with one [`HttpUrlSource`] and [`FileCache`] per upstream URL.
//!
//! ```no_run
//! use range_cache_proxy::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> range_cache_proxy::Result<()> {
//!     let server = ProxyServer::start(Config::default()).await?;
//!     let url = server.proxy_url("https://example.com/video.mp4");
//!     println!("play {url}");
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
mod error;
mod file;
mod http;
pub mod logging;
mod memory;
mod ping;
mod proxy;
mod request;
mod server;
mod source;
mod stream;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

pub use config::{Config, EngineConfig};
pub use error::{ProxyError, Result};
pub use file::{cache_file_name, FileCache};
pub use http::{use_cache, ContentRange, HttpProxyCache, ResponseHead};
pub use memory::{MemoryCache, MemorySource, MemoryStream};
pub use ping::{is_ping_request, respond_to_ping, Pinger, PING_REQUEST, PING_RESPONSE};
pub use proxy::{log_error, ErrorHook, ProgressListener, ProxyCache, ProxyCacheBuilder};
pub use request::GetRequest;
pub use server::{CacheListener, ProxyServer};
pub use source::{HttpSourceStream, HttpUrlSource};

/// The single upstream byte producer of one resource.
///
/// Every call to [`Source::open`] yields an independent [`SourceStream`], so
/// a pass-through read can run next to the cache fetch without disturbing it.
#[async_trait]
pub trait Source: fmt::Debug + Send + Sync + 'static {
    type Stream: SourceStream;

    /// Starts producing bytes from `offset`. Fails if the resource can't be reached.
    async fn open(&self, offset: u64) -> Result<Self::Stream>;

    /// Total length of the resource, `None` while unknown.
    async fn length(&self) -> Option<u64>;

    /// Content type of the resource, if known.
    async fn mime(&self) -> Option<String>;
}

/// An opened [`Source`], positioned at the offset it was opened with.
#[async_trait]
pub trait SourceStream: Send + 'static {
    /// Next chunk of bytes, `None` at end of stream.
    async fn read(&mut self) -> Result<Option<Bytes>>;

    /// Releases the transport behind this stream.
    async fn close(&mut self) -> Result<()>;
}

/// Append-only persisted bytes of one resource.
///
/// Must tolerate one writer appending while many readers read.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    /// Count of contiguous bytes persisted from offset 0. Never decreases.
    async fn available(&self) -> Result<u64>;

    /// Fills `buf` from `offset`, returning the byte count; 0 at the end of persisted data.
    ///
    /// Callers only ask for ranges that are already [available](Cache::available).
    async fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Extends the persisted range.
    async fn append(&self, data: &[u8]) -> Result<()>;

    /// Marks the cache as holding the whole resource.
    async fn complete(&self) -> Result<()>;

    async fn is_completed(&self) -> bool;

    /// Finalizes the cache state. Appends fail afterwards.
    async fn close(&self) -> Result<()>;
}
