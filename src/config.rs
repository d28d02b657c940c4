//! Proxy configuration.
//!
//! [`ProxyConfig`] is plain data, deserialized with `serde` from JSON. Only
//! `target` is required:
//!
//! ```json
//! {
//!   "listen": "0.0.0.0:8080",
//!   "target": "http://127.0.0.1:9000/api",
//!   "cache_ttl_secs": 120,
//!   "connect_timeout_ms": 2000
//! }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::cache::{CacheError, MemoryCache};
use crate::proxy::ReverseProxy;
use crate::transport::connector::DEFAULT_MAX_RESPONSE_SIZE;
use crate::transport::{CachingTransport, HttpConnector};

/// Errors produced while loading or applying a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid target URL {url:?}: {source}")]
    InvalidTarget {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("target URL must use http, got {0:?}")]
    UnsupportedTarget(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Settings for a (caching) single-host reverse proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the server binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Absolute `http://` URL requests are forwarded to.
    pub target: String,

    /// Whether responses are cached at all.
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,

    /// Lifetime of a cached response in seconds. Must be non-zero when caching.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,

    /// Largest origin response that will be buffered.
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_owned()
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_max_response_bytes() -> usize {
    DEFAULT_MAX_RESPONSE_SIZE
}

impl ProxyConfig {
    /// Creates a configuration for `target` with every other field defaulted.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            listen: default_listen(),
            target: target.into(),
            cache_enabled: default_cache_enabled(),
            cache_ttl_secs: default_cache_ttl_secs(),
            connect_timeout_ms: None,
            max_response_bytes: default_max_response_bytes(),
        }
    }

    /// Parses a configuration from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Parses and checks the target URL.
    pub fn target_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.target).map_err(|source| ConfigError::InvalidTarget {
            url: self.target.clone(),
            source,
        })?;
        if url.scheme() != "http" {
            return Err(ConfigError::UnsupportedTarget(url.scheme().to_owned()));
        }
        Ok(url)
    }

    /// Builds the outbound connector described by this configuration.
    pub fn connector(&self) -> HttpConnector {
        let connector = HttpConnector::new().max_response_size(self.max_response_bytes);
        match self.connect_timeout_ms {
            Some(ms) => connector.connect_timeout(Duration::from_millis(ms)),
            None => connector,
        }
    }

    /// Assembles the reverse proxy: a caching transport over the configured
    /// connector when caching is enabled, the bare connector otherwise.
    pub fn build_proxy(&self) -> Result<ReverseProxy, ConfigError> {
        let target = self.target_url()?;
        let connector = Arc::new(self.connector());

        let proxy = if self.cache_enabled {
            let cache = Arc::new(MemoryCache::new(self.cache_ttl())?);
            let transport = CachingTransport::new(cache).with_transport(connector);
            ReverseProxy::new(target).with_transport(Arc::new(transport))
        } else {
            ReverseProxy::new(target).with_transport(connector)
        };
        Ok(proxy)
    }
}
