use std::io;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

/// Every failure the proxy can surface or report through its error hook.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The inbound request text is not a `GET /<path> HTTP/<version>` request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The background fetch failed and the read-side retry budget is exhausted.
    #[error("error reading source {attempts} times")]
    SourceRead { attempts: usize },

    /// The upstream answered with a status that carries no resource bytes.
    #[error("upstream responded {status} for {url}")]
    UpstreamStatus { url: String, status: reqwest::StatusCode },

    /// A source could not be positioned at the requested offset.
    #[error("error opening source at offset {offset}: {reason}")]
    SourceOpen { offset: u64, reason: String },

    /// Releasing a source or cache failed.
    #[error("error closing {resource}")]
    Close {
        resource: String,
        #[source]
        cause: Box<ProxyError>,
    },

    #[error("cache error: {0}")]
    Cache(String),

    /// The fetch was cancelled by a shutdown.
    #[error("proxy cache is interrupted")]
    Interrupted,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ProxyError {
    /// True for errors caused by a shutdown rather than a real failure.
    pub fn is_interruption(&self) -> bool {
        match self {
            ProxyError::Interrupted => true,
            ProxyError::Close { cause, .. } => cause.is_interruption(),
            _ => false,
        }
    }

    /// True when the peer went away while we were writing to it.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    pub(crate) fn close(resource: impl Into<String>, cause: ProxyError) -> Self {
        ProxyError::Close { resource: resource.into(), cause: Box::new(cause) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interruption_through_close() {
        let err = ProxyError::close("source", ProxyError::Interrupted);
        assert!(err.is_interruption());
        assert!(!ProxyError::SourceRead { attempts: 1 }.is_interruption());
    }

    #[test]
    fn test_source_read_message() {
        let err = ProxyError::SourceRead { attempts: 1 };
        assert_eq!("error reading source 1 times", err.to_string());
    }

    #[test]
    fn test_disconnect() {
        let err = ProxyError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(err.is_disconnect());
        let err = ProxyError::from(io::Error::from(io::ErrorKind::NotFound));
        assert!(!err.is_disconnect());
    }
}
