use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config::EngineConfig;
use crate::{Cache, ProxyError, Result, Source, SourceStream};

/// Called with the cached percentage of the resource, 0 to 100.
pub type ProgressListener = Arc<dyn Fn(u8) + Send + Sync>;

/// Receives every non-fatal internal error: failed fetches and failed closes.
pub type ErrorHook = Arc<dyn Fn(&ProxyError) + Send + Sync>;

/// Default [`ErrorHook`]: interruptions at debug level, everything else as errors.
pub fn log_error(error: &ProxyError) {
    if error.is_interruption() {
        debug!("proxy cache is interrupted");
    } else {
        error!(%error, "proxy cache error");
    }
}

/// Proxy for a [`Source`] with caching support.
///
/// [`ProxyCache::read`] blocks until the requested bytes are in the [`Cache`],
/// spawning at most one background fetch at a time to get them there. Only
/// usable for sources whose content doesn't change over time.
pub struct ProxyCache<S, C> {
    inner: Arc<Inner<S, C>>,
}

impl<S, C> Clone for ProxyCache<S, C> {
    fn clone(&self) -> Self {
        ProxyCache { inner: Arc::clone(&self.inner) }
    }
}

struct Inner<S, C> {
    source: S,
    cache: C,
    config: EngineConfig,
    state: Mutex<State>,
    stop: watch::Sender<bool>,
    new_data: Notify,
    // None until the first measurement
    percents_available: StdMutex<Option<u8>>,
    on_progress: Option<ProgressListener>,
    on_error: ErrorHook,
}

#[derive(Default)]
struct State {
    stopped: bool,
    fetch: Option<JoinHandle<()>>,
    read_source_errors: usize,
    // a source of unknown length reached its end without completing the cache
    exhausted: bool,
}

pub struct ProxyCacheBuilder<S, C> {
    source: S,
    cache: C,
    config: EngineConfig,
    on_progress: Option<ProgressListener>,
    on_error: Option<ErrorHook>,
}

impl<S: Source, C: Cache> ProxyCacheBuilder<S, C> {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn on_progress(mut self, listener: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(listener));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&ProxyError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> ProxyCache<S, C> {
        let (stop, _) = watch::channel(false);
        let mut config = self.config;
        config.max_read_source_attempts = config.max_read_source_attempts.max(1);
        ProxyCache {
            inner: Arc::new(Inner {
                source: self.source,
                cache: self.cache,
                config,
                state: Mutex::new(State::default()),
                stop,
                new_data: Notify::new(),
                percents_available: StdMutex::new(None),
                on_progress: self.on_progress,
                on_error: self.on_error.unwrap_or_else(|| Arc::new(log_error)),
            }),
        }
    }
}

impl<S: Source, C: Cache> ProxyCache<S, C> {
    pub fn new(source: S, cache: C) -> Self {
        ProxyCache::builder(source, cache).build()
    }

    pub fn builder(source: S, cache: C) -> ProxyCacheBuilder<S, C> {
        ProxyCacheBuilder {
            source,
            cache,
            config: EngineConfig::default(),
            on_progress: None,
            on_error: None,
        }
    }

    pub fn source(&self) -> &S {
        &self.inner.source
    }

    pub fn cache(&self) -> &C {
        &self.inner.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Last published percentage, `None` before the first measurement.
    pub fn percents_available(&self) -> Option<u8> {
        *self.inner.last_published()
    }

    pub async fn is_stopped(&self) -> bool {
        self.inner.state.lock().await.stopped
    }

    /// Reads up to `buf.len()` bytes at `offset`, waiting for the background
    /// fetch until they are cached. Returns 0 once `offset` is past the end.
    ///
    /// After [`shutdown`](ProxyCache::shutdown), or once a source of unknown
    /// length has ended, the read no longer waits and returns whatever is
    /// cached, possibly fewer bytes than requested.
    pub async fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let inner = &self.inner;
        let end = offset.saturating_add(buf.len() as u64);

        loop {
            // registered before the checks so a publication in between still wakes us
            let notified = inner.new_data.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if inner.cache.is_completed().await || inner.cache.available().await? >= end || inner.is_done().await {
                break;
            }

            self.read_source_async().await;
            let _ = tokio::time::timeout(inner.config.read_wait(), notified).await;
            inner.check_read_source_errors().await?;
        }

        let read = inner.cache.read(buf, offset).await?;
        if inner.cache.is_completed().await {
            inner.publish_complete();
        }
        Ok(read)
    }

    /// Stops the engine for good: cancels the fetch and closes the cache.
    /// Later calls do nothing.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.stopped {
            return;
        }
        debug!(source = ?inner.source, "shutdown proxy");
        state.stopped = true;
        inner.stop.send_replace(true);
        // the fetch observes the stop signal and exits on its own
        state.fetch = None;
        if let Err(e) = inner.cache.close().await {
            inner.report(&ProxyError::close("cache", e));
        }
    }

    pub(crate) fn report(&self, error: &ProxyError) {
        self.inner.report(error);
    }

    async fn read_source_async(&self) {
        let mut state = self.inner.state.lock().await;
        let reading = state.fetch.as_ref().is_some_and(|fetch| !fetch.is_finished());
        if !state.stopped && !state.exhausted && !reading && !self.inner.cache.is_completed().await {
            let inner = Arc::clone(&self.inner);
            state.fetch = Some(tokio::spawn(inner.read_source()));
        }
    }
}

impl<S: Source, C: Cache> Inner<S, C> {
    async fn read_source(self: Arc<Self>) {
        let mut offset = 0;
        let mut source_length = None;
        let mut stream = None;

        match self.fetch(&mut stream, &mut offset, &mut source_length).await {
            Ok(()) => {}
            Err(e) if e.is_interruption() => self.report(&e),
            Err(e) => {
                self.state.lock().await.read_source_errors += 1;
                self.report(&e);
            }
        }

        if let Some(mut stream) = stream {
            if let Err(e) = stream.close().await {
                self.report(&ProxyError::close(format!("source {:?}", self.source), e));
            }
        }
        // blocked readers must wake however the fetch ended
        self.notify_new_cache_data_available(offset, source_length);
    }

    async fn fetch(
        &self,
        stream: &mut Option<S::Stream>,
        offset: &mut u64,
        source_length: &mut Option<u64>,
    ) -> Result<()> {
        let mut stop = self.stop.subscribe();
        *offset = self.cache.available().await?;

        let opened = tokio::select! {
            opened = self.source.open(*offset) => opened?,
            _ = stopped(&mut stop) => return Err(ProxyError::Interrupted),
        };
        let stream = stream.insert(opened);
        *source_length = self.source.length().await;

        loop {
            let chunk = tokio::select! {
                biased;
                chunk = stream.read() => chunk?,
                _ = stopped(&mut stop) => return Err(ProxyError::Interrupted),
            };
            let Some(chunk) = chunk else { break };

            {
                let state = self.state.lock().await;
                if state.stopped {
                    return Ok(());
                }
                self.cache.append(&chunk).await?;
            }
            *offset += chunk.len() as u64;
            self.notify_new_cache_data_available(*offset, *source_length);
        }

        self.try_complete(*source_length).await?;
        self.publish_complete();
        Ok(())
    }

    async fn try_complete(&self, source_length: Option<u64>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Ok(());
        }
        let available = self.cache.available().await?;
        match source_length {
            Some(length) if length == available => self.cache.complete().await?,
            // only a reported length proves the resource is whole
            None => state.exhausted = true,
            Some(_) => {}
        }
        Ok(())
    }

    async fn is_done(&self) -> bool {
        let state = self.state.lock().await;
        state.stopped || state.exhausted
    }

    async fn check_read_source_errors(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let attempts = state.read_source_errors;
        if attempts >= self.config.max_read_source_attempts {
            state.read_source_errors = 0;
            return Err(ProxyError::SourceRead { attempts });
        }
        Ok(())
    }

    fn notify_new_cache_data_available(&self, cache_available: u64, source_length: Option<u64>) {
        self.on_cache_available(cache_available, source_length);
        self.new_data.notify_waiters();
    }

    fn on_cache_available(&self, cache_available: u64, source_length: Option<u64>) {
        let Some(source_length) = source_length else { return };
        // 100 is left to publish_complete, after the cache is completed
        let percents = percents(cache_available, source_length).min(99);
        let mut last = self.last_published();
        if *last == Some(100) {
            return;
        }
        let changed = *last != Some(percents);
        *last = Some(percents);
        if changed {
            self.publish(percents);
        }
    }

    fn publish_complete(&self) {
        let mut last = self.last_published();
        if *last != Some(100) {
            *last = Some(100);
            self.publish(100);
        }
    }

    // listeners run under the percents lock so publications stay ordered
    fn publish(&self, percents: u8) {
        if let Some(listener) = &self.on_progress {
            listener(percents);
        }
    }

    fn last_published(&self) -> MutexGuard<'_, Option<u8>> {
        self.percents_available.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, error: &ProxyError) {
        (self.on_error)(error);
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn percents(cache_available: u64, source_length: u64) -> u8 {
    if source_length == 0 {
        return 100;
    }
    let percents = u128::from(cache_available) * 100 / u128::from(source_length);
    percents.min(100) as u8
}
