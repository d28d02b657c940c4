//! Runs a caching reverse proxy.
//!
//! ```text
//! cargo run --example caching_proxy -- proxy.json
//! cargo run --example caching_proxy              # fronts http://127.0.0.1:9000
//! ```
//!
//! Set `RUST_LOG=apiproxy=debug` to watch cache hits and stores.

use apiproxy::{ProxyConfig, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ProxyConfig::load(path)?,
        None => ProxyConfig::new("http://127.0.0.1:9000"),
    };

    let proxy = config.build_proxy()?;
    info!(
        listen = %config.listen,
        upstream = %config.target,
        cache = config.cache_enabled,
        ttl_secs = config.cache_ttl_secs,
        "starting proxy"
    );

    let server = Server::bind(&config.listen).await?;
    server
        .run(move |req| {
            let proxy = proxy.clone();
            async move { proxy.handle(req).await }
        })
        .await?;
    Ok(())
}
