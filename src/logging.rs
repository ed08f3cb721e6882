//! `tracing` subscriber setup for the proxy binary.

use tracing_subscriber::EnvFilter;

use crate::{ProxyError, Result};

/// Installs a fmt subscriber filtered by `RUST_LOG`, or by `level` when it is unset.
pub fn init(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| ProxyError::Config(format!("invalid log level {level}: {e}")))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| ProxyError::Config(format!("logger already installed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        let _ = init("debug");
        assert!(init("debug").is_err());
    }
}
