use std::time::Duration;

use reqwest::Client;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::Result;

/// Decoded request path answered by the liveness check.
pub const PING_REQUEST: &str = "ping";
/// Body of a successful ping response.
pub const PING_RESPONSE: &str = "ping ok";

pub fn is_ping_request(path: &str) -> bool {
    path == PING_REQUEST
}

pub async fn respond_to_ping<W: AsyncWrite + Unpin>(out: &mut W) -> Result<()> {
    out.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
    out.write_all(PING_RESPONSE.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

/// Checks that a proxy listener is up and answering.
#[derive(Debug, Clone)]
pub struct Pinger {
    client: Client,
    ping_url: String,
}

impl Pinger {
    /// Pings the listener at `host:port`.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        // local listener, never through a system proxy
        let client = Client::builder().no_proxy().build()?;
        Ok(Pinger { client, ping_url: format!("http://{host}:{port}/{PING_REQUEST}") })
    }

    pub fn ping_url(&self) -> &str {
        &self.ping_url
    }

    /// Tries up to `max_attempts` times, doubling the timeout after every failure.
    pub async fn ping(&self, max_attempts: usize, initial_timeout: Duration) -> bool {
        let mut timeout = initial_timeout;
        for attempt in 1..=max_attempts {
            match tokio::time::timeout(timeout, self.ping_once()).await {
                Ok(Ok(true)) => return true,
                Ok(Ok(false)) => warn!(attempt, url = %self.ping_url, "unexpected ping response"),
                Ok(Err(e)) => warn!(attempt, url = %self.ping_url, error = %e, "error pinging proxy"),
                Err(_) => warn!(attempt, ?timeout, url = %self.ping_url, "ping timed out"),
            }
            timeout *= 2;
        }
        debug!(max_attempts, url = %self.ping_url, "proxy is not pingable");
        false
    }

    async fn ping_once(&self) -> Result<bool> {
        let response = self.client.get(&self.ping_url).send().await?;
        let body = response.bytes().await?;
        Ok(body.as_ref() == PING_RESPONSE.as_bytes())
    }
}
