use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::{
    cache_file_name, is_ping_request, respond_to_ping, Config, FileCache, GetRequest, HttpProxyCache,
    HttpUrlSource, Pinger, ProxyCache, Result,
};

type UrlProxy = HttpProxyCache<HttpUrlSource, FileCache>;

/// Notified with the cached percentage of a URL while it downloads.
pub trait CacheListener: Send + Sync + 'static {
    fn on_cache_available(&self, cache_file: &Path, url: &str, percents_available: u8);
}

type Listeners = Arc<StdMutex<Vec<Arc<dyn CacheListener>>>>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Local HTTP server handing every upstream URL to its own [`HttpProxyCache`].
pub struct ProxyServer {
    inner: Arc<ServerInner>,
    shutdown: watch::Sender<bool>,
    accept: StdMutex<Option<JoinHandle<()>>>,
}

struct ServerInner {
    addr: SocketAddr,
    config: Config,
    client: Client,
    clients: StdMutex<HashMap<String, Arc<Clients>>>,
}

impl ProxyServer {
    /// Binds the listener described by `config` and starts accepting connections.
    pub async fn start(config: Config) -> Result<ProxyServer> {
        config.validate()?;
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;
        let client = HttpUrlSource::client(&config.upstream)?;
        info!(%addr, cache_dir = %config.cache_dir.display(), "proxy cache server started");

        let inner = Arc::new(ServerInner {
            addr,
            config,
            client,
            clients: StdMutex::new(HashMap::new()),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept = tokio::spawn(accept_connections(listener, shutdown_rx, Arc::clone(&inner)));

        Ok(ProxyServer {
            inner,
            shutdown,
            accept: StdMutex::new(Some(accept)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Address a player should use instead of `url`.
    pub fn proxy_url(&self, url: &str) -> String {
        format!("http://{}/{}", self.inner.addr, urlencoding::encode(url))
    }

    /// Whether `url` has been downloaded completely.
    pub async fn is_cached(&self, url: &str) -> bool {
        let path = self.inner.cache_file(url);
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    pub fn register_cache_listener(&self, url: &str, listener: Arc<dyn CacheListener>) {
        let clients = self.inner.clients(url);
        lock(&clients.listeners).push(listener);
    }

    /// Removes `listener` from every URL it was registered for.
    pub fn unregister_cache_listener(&self, listener: &Arc<dyn CacheListener>) {
        let mut clients = lock(&self.inner.clients);
        for entry in clients.values() {
            lock(&entry.listeners).retain(|registered| !Arc::ptr_eq(registered, listener));
        }
        clients.retain(|_, entry| !entry.is_idle());
    }

    /// Pings the server's own listener.
    pub async fn ping(&self, max_attempts: usize, initial_timeout: Duration) -> bool {
        let host = self.inner.addr.ip().to_string();
        match Pinger::new(&host, self.inner.addr.port()) {
            Ok(pinger) => pinger.ping(max_attempts, initial_timeout).await,
            Err(e) => {
                error!(error = %e, "error creating pinger");
                false
            }
        }
    }

    /// Stops accepting connections and shuts every live engine down.
    pub async fn shutdown(&self) {
        info!(addr = %self.inner.addr, "shutdown proxy server");
        self.shutdown.send_replace(true);
        let accept = lock(&self.accept).take();
        if let Some(accept) = accept {
            let _ = accept.await;
        }

        let clients: Vec<_> = lock(&self.inner.clients).values().cloned().collect();
        futures::future::join_all(clients.iter().map(|clients| clients.shutdown())).await;
    }
}

impl ServerInner {
    fn cache_file(&self, url: &str) -> PathBuf {
        self.config.cache_dir.join(cache_file_name(url))
    }

    fn clients(&self, url: &str) -> Arc<Clients> {
        let mut clients = lock(&self.clients);
        let entry = clients.entry(url.to_string()).or_insert_with(|| {
            Arc::new(Clients {
                url: url.to_string(),
                cache_file: self.cache_file(url),
                listeners: Arc::new(StdMutex::new(Vec::new())),
                state: Mutex::new(ClientsState::default()),
            })
        });
        Arc::clone(entry)
    }

    /// Drops a request's hold on `clients`, forgetting the URL once no
    /// request holds it and nobody listens to it.
    fn release(&self, clients: Arc<Clients>) {
        let url = clients.url.clone();
        let mut map = lock(&self.clients);
        drop(clients);
        if map.get(&url).is_some_and(|entry| entry.is_idle()) {
            map.remove(&url);
        }
    }
}

async fn accept_connections(listener: TcpListener, mut shutdown: watch::Receiver<bool>, inner: Arc<ServerInner>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (socket, peer) = match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "error accepting connection");
                        continue;
                    }
                };
                debug!(%peer, "accepted connection");
                tokio::spawn(process_socket(Arc::clone(&inner), socket));
            }
        }
    }
    debug!("accept loop stopped");
}

async fn process_socket(inner: Arc<ServerInner>, mut socket: TcpStream) {
    match handle_request(&inner, &mut socket).await {
        Ok(()) => {}
        Err(e) if e.is_disconnect() => debug!(error = %e, "client closed connection"),
        Err(e) => error!(error = %e, "error processing request"),
    }
    if let Err(e) = socket.shutdown().await {
        debug!(error = %e, "error closing socket");
    }
}

async fn handle_request(inner: &ServerInner, socket: &mut TcpStream) -> Result<()> {
    let request = GetRequest::read_from(&mut *socket).await?;
    debug!(?request, "request to cache proxy");
    if is_ping_request(&request.path) {
        return respond_to_ping(socket).await;
    }
    let clients = inner.clients(&request.path);
    let result = clients.process_request(&request, socket, inner).await;
    inner.release(clients);
    result
}

/// Requests in flight for one URL and the engine they share.
struct Clients {
    url: String,
    cache_file: PathBuf,
    listeners: Listeners,
    state: Mutex<ClientsState>,
}

#[derive(Default)]
struct ClientsState {
    count: usize,
    proxy: Option<Arc<UrlProxy>>,
}

impl Clients {
    // References come only from the server map and requests in flight, and
    // are taken under the map lock.
    fn is_idle(self: &Arc<Self>) -> bool {
        Arc::strong_count(self) == 1 && lock(&self.listeners).is_empty()
    }

    async fn process_request(&self, request: &GetRequest, socket: &mut TcpStream, server: &ServerInner) -> Result<()> {
        let proxy = self.start_processing(server).await?;
        let result = proxy.serve(request, &mut *socket).await;
        self.finish_processing().await;
        result
    }

    async fn start_processing(&self, server: &ServerInner) -> Result<Arc<UrlProxy>> {
        let mut state = self.state.lock().await;
        let proxy = match &state.proxy {
            Some(proxy) => Arc::clone(proxy),
            None => {
                let proxy = Arc::new(self.new_proxy(server).await?);
                state.proxy = Some(Arc::clone(&proxy));
                proxy
            }
        };
        state.count += 1;
        Ok(proxy)
    }

    async fn finish_processing(&self) {
        let mut state = self.state.lock().await;
        state.count = state.count.saturating_sub(1);
        if state.count == 0 {
            if let Some(proxy) = state.proxy.take() {
                proxy.shutdown().await;
            }
        }
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(proxy) = state.proxy.take() {
            proxy.shutdown().await;
        }
    }

    async fn new_proxy(&self, server: &ServerInner) -> Result<UrlProxy> {
        let source = HttpUrlSource::new(server.client.clone(), self.url.clone());
        let cache = FileCache::open(&self.cache_file).await?;

        let listeners = Arc::clone(&self.listeners);
        let url = self.url.clone();
        let cache_file = self.cache_file.clone();
        let proxy = ProxyCache::builder(source, cache)
            .config(server.config.engine.clone())
            .on_progress(move |percents| {
                for listener in lock(&listeners).iter() {
                    listener.on_cache_available(&cache_file, &url, percents);
                }
            })
            .build();
        Ok(HttpProxyCache::new(proxy).with_no_cache_barrier(server.config.no_cache_barrier))
    }
}
