use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use range_cache_proxy::{logging, Config, ProxyServer, Result};

#[derive(Parser, Debug)]
#[command(name = "range-cache-proxy", about = "Local caching proxy for progressive HTTP resources", version)]
struct Cli {
    /// Config file path
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(long)]
    host: Option<String>,

    /// Listen port, overrides the config file
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Cache directory, overrides the config file
    #[arg(long = "cache-dir")]
    cache_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Upstream URLs to print proxy addresses for
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = cache_dir;
    }
    if cli.verbose {
        config.log.level = "debug".to_string();
    }

    logging::init(&config.log.level)?;

    let server = ProxyServer::start(config).await?;
    for url in &cli.urls {
        println!("{url} -> {}", server.proxy_url(url));
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupted, shutting down");
    server.shutdown().await;
    Ok(())
}
