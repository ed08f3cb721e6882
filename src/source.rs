use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, error};

use crate::config::UpstreamConfig;
use crate::{ProxyError, Result, Source, SourceStream};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SourceInfo {
    length: Option<u64>,
    mime: Option<String>,
}

/// [`Source`] reading a remote resource over HTTP.
///
/// Clones share the client and whatever length and content type were
/// discovered, so a clone can serve a pass-through read without a new probe.
#[derive(Clone)]
pub struct HttpUrlSource {
    client: Client,
    url: String,
    info: Arc<Mutex<Option<SourceInfo>>>,
}

impl std::fmt::Debug for HttpUrlSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUrlSource").field("url", &self.url).finish()
    }
}

impl HttpUrlSource {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        HttpUrlSource {
            client,
            url: url.into(),
            info: Arc::new(Mutex::new(None)),
        }
    }

    /// Builds the upstream client the way [`UpstreamConfig`] describes it.
    pub fn client(config: &UpstreamConfig) -> Result<Client> {
        let mut builder = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .connect_timeout(std::time::Duration::from_millis(config.connect_timeout_ms));
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(builder.build()?)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn info(&self) -> Option<SourceInfo> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn store_info(&self, info: SourceInfo) {
        *self.info.lock().unwrap_or_else(PoisonError::into_inner) = Some(info);
    }

    fn guess_mime(&self) -> Option<String> {
        let path = reqwest::Url::parse(&self.url).ok()?.path().to_string();
        mime_guess::from_path(path).first().map(|mime| mime.essence_str().to_string())
    }

    fn response_mime(&self, response: &Response) -> Option<String> {
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .or_else(|| self.guess_mime())
    }

    fn check_status(&self, response: &Response) -> Result<()> {
        match response.status() {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => Ok(()),
            status => Err(ProxyError::UpstreamStatus { url: self.url.clone(), status }),
        }
    }

    /// Discovers length and content type with a `HEAD` request.
    async fn fetch_content_info(&self) -> Result<SourceInfo> {
        debug!(url = %self.url, "read content info");
        let response = self.client.head(&self.url).send().await?;
        self.check_status(&response)?;
        let info = SourceInfo {
            length: content_length(&response),
            mime: self.response_mime(&response),
        };
        debug!(url = %self.url, length = ?info.length, mime = ?info.mime, "content info");
        self.store_info(info.clone());
        Ok(info)
    }

    async fn discovered_info(&self) -> Option<SourceInfo> {
        if let Some(info) = self.info() {
            return Some(info);
        }
        match self.fetch_content_info().await {
            Ok(info) => Some(info),
            Err(e) => {
                error!(url = %self.url, error = %e, "error fetching content info");
                None
            }
        }
    }
}

#[async_trait]
impl Source for HttpUrlSource {
    type Stream = HttpSourceStream;

    async fn open(&self, offset: u64) -> Result<HttpSourceStream> {
        let mut request = self.client.get(&self.url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        debug!(url = %self.url, offset, "open connection");
        let response = request.send().await?;
        self.check_status(&response)?;

        let partial = response.status() == StatusCode::PARTIAL_CONTENT;
        let length = content_length(&response).map(|length| if partial { length + offset } else { length });
        self.store_info(SourceInfo { length, mime: self.response_mime(&response) });

        // an upstream ignoring the range starts over at byte 0
        let skip = if partial { 0 } else { offset };
        Ok(HttpSourceStream { response: Some(response), skip })
    }

    async fn length(&self) -> Option<u64> {
        self.discovered_info().await.and_then(|info| info.length)
    }

    async fn mime(&self) -> Option<String> {
        self.discovered_info().await.and_then(|info| info.mime)
    }
}

fn content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

/// Body of an opened [`HttpUrlSource`].
#[derive(Debug)]
pub struct HttpSourceStream {
    response: Option<Response>,
    skip: u64,
}

#[async_trait]
impl SourceStream for HttpSourceStream {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        let Some(response) = self.response.as_mut() else {
            return Ok(None);
        };
        loop {
            let Some(mut chunk) = response.chunk().await? else {
                return Ok(None);
            };
            if self.skip == 0 {
                return Ok(Some(chunk));
            }
            let skipped = std::cmp::min(self.skip, chunk.len() as u64);
            self.skip -= skipped;
            chunk.advance(skipped as usize);
            if !chunk.is_empty() {
                return Ok(Some(chunk));
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.response = None;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::SocketAddr;
    use std::ops::Bound;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use axum::extract::State;
    use axum::http::{header, HeaderMap, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::get;
    use axum::Router;
    use axum_extra::headers::Range;
    use axum_extra::TypedHeader;

    use super::*;

    /// Upstream double serving `content` with open-ended range support.
    #[derive(Clone)]
    pub(crate) struct Upstream {
        pub content: Bytes,
        pub gets: Arc<AtomicUsize>,
        pub ignore_range: bool,
    }

    pub(crate) async fn spawn_upstream(upstream: Upstream) -> SocketAddr {
        async fn video(
            State(upstream): State<Upstream>,
            range: Option<TypedHeader<Range>>,
        ) -> AxumResponse {
            upstream.gets.fetch_add(1, Ordering::SeqCst);
            let total = upstream.content.len() as u64;
            let start = match range.filter(|_| !upstream.ignore_range) {
                Some(TypedHeader(range)) => match range.satisfiable_ranges(total).next() {
                    Some((Bound::Included(start), _)) => Some(start),
                    _ => return AxumStatus::RANGE_NOT_SATISFIABLE.into_response(),
                },
                None => None,
            };
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, "video/mp4".parse().unwrap());
            match start {
                Some(start) => {
                    let content_range = format!("bytes {}-{}/{}", start, total - 1, total);
                    headers.insert(header::CONTENT_RANGE, content_range.parse().unwrap());
                    let body = upstream.content.slice(start as usize..);
                    (AxumStatus::PARTIAL_CONTENT, headers, body).into_response()
                }
                None => (AxumStatus::OK, headers, upstream.content.clone()).into_response(),
            }
        }

        let app = Router::new()
            .route("/video.mp4", get(video))
            .route("/missing.mp4", get(|| async { AxumStatus::NOT_FOUND }))
            .with_state(upstream);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    pub(crate) fn content(len: usize) -> Bytes {
        (0..len).map(|i| (i % 253) as u8).collect::<Vec<_>>().into()
    }

    fn client() -> Client {
        Client::builder().no_proxy().build().unwrap()
    }

    async fn collect(mut stream: HttpSourceStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.read().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    fn upstream(len: usize) -> Upstream {
        Upstream { content: content(len), gets: Arc::new(AtomicUsize::new(0)), ignore_range: false }
    }

    #[tokio::test]
    async fn test_open_from_start() {
        let upstream = upstream(50_000);
        let addr = spawn_upstream(upstream.clone()).await;
        let source = HttpUrlSource::new(client(), format!("http://{addr}/video.mp4"));

        let stream = source.open(0).await.unwrap();
        assert_eq!(Some(50_000), source.length().await);
        assert_eq!(Some("video/mp4".to_string()), source.mime().await);
        assert_eq!(upstream.content.to_vec(), collect(stream).await);
    }

    #[tokio::test]
    async fn test_open_at_offset() {
        let upstream = upstream(50_000);
        let addr = spawn_upstream(upstream.clone()).await;
        let source = HttpUrlSource::new(client(), format!("http://{addr}/video.mp4"));

        let stream = source.open(20_000).await.unwrap();
        assert_eq!(Some(50_000), source.length().await);
        assert_eq!(upstream.content[20_000..].to_vec(), collect(stream).await);
    }

    #[tokio::test]
    async fn test_open_at_offset_when_range_is_ignored() {
        let upstream = Upstream { ignore_range: true, ..upstream(10_000) };
        let addr = spawn_upstream(upstream.clone()).await;
        let source = HttpUrlSource::new(client(), format!("http://{addr}/video.mp4"));

        let stream = source.open(1234).await.unwrap();
        assert_eq!(Some(10_000), source.length().await);
        assert_eq!(upstream.content[1234..].to_vec(), collect(stream).await);
    }

    #[tokio::test]
    async fn test_length_probes_with_head() {
        let addr = spawn_upstream(upstream(777)).await;
        let source = HttpUrlSource::new(client(), format!("http://{addr}/video.mp4"));

        assert_eq!(Some(777), source.length().await);
        assert_eq!(Some("video/mp4".to_string()), source.clone().mime().await);
    }

    #[tokio::test]
    async fn test_missing_resource() {
        let addr = spawn_upstream(upstream(10)).await;
        let source = HttpUrlSource::new(client(), format!("http://{addr}/missing.mp4"));

        assert_matches!(
            source.open(0).await,
            Err(ProxyError::UpstreamStatus { status: StatusCode::NOT_FOUND, .. })
        );
        assert_eq!(None, source.length().await);
    }

    #[tokio::test]
    async fn test_guessed_mime() {
        let source = HttpUrlSource::new(client(), "http://127.0.0.1:9/clip.webm");
        assert_eq!(Some("video/webm".to_string()), source.guess_mime());
    }
}
