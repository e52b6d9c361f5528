//! A rotating HTTP client with a base URL.

use crate::config::ClientConfig;
use crate::error::Result;
use crate::middleware::{DirectAttempt, RotatingProxyMiddleware};
use crate::pool::ProxyPool;
use crate::transport::base_client;

use log::info;
use reqwest::Method;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use std::sync::Arc;
use url::Url;

/// HTTP client whose requests go through a [`ProxyPool`].
///
/// With rotation disabled it is a plain client and the pool is never used.
#[derive(Clone)]
pub struct RotatingClient {
    inner: ClientWithMiddleware,
    config: Arc<ClientConfig>,
    pool: Option<Arc<ProxyPool>>,
}

impl RotatingClient {
    /// Build a client routed through `pool`, unless `config` disables rotation.
    pub fn new(pool: Arc<ProxyPool>, config: ClientConfig) -> Result<Self> {
        if !config.rotation_enabled {
            return Self::direct(config);
        }

        let middleware = RotatingProxyMiddleware::new(Arc::clone(&pool), &config)?;
        let inner = ClientBuilder::new(base_client(&config)?).with(middleware).build();
        let stats = pool.stats();
        info!("Rotating client ready with {}/{} available proxies", stats.available, stats.total);

        Ok(Self {
            inner,
            config: Arc::new(config),
            pool: Some(pool),
        })
    }

    /// Build a client that always sends directly.
    pub fn direct(config: ClientConfig) -> Result<Self> {
        info!("Proxy rotation disabled, requests go out directly");
        let inner = ClientBuilder::new(base_client(&config)?).build();
        Ok(Self {
            inner,
            config: Arc::new(config),
            pool: None,
        })
    }

    /// The pool in use, if rotation is enabled.
    pub fn pool(&self) -> Option<&Arc<ProxyPool>> {
        self.pool.as_ref()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The underlying middleware client.
    pub fn inner(&self) -> &ClientWithMiddleware {
        &self.inner
    }

    /// Resolve `path` against the base URL.
    pub fn url(&self, path: &str) -> Result<Url> {
        self.config.resolve_url(path)
    }

    /// Start a request for `path`.
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        Ok(self.inner.request(method, self.url(path)?))
    }

    pub fn get(&self, path: &str) -> Result<RequestBuilder> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> Result<RequestBuilder> {
        self.request(Method::POST, path)
    }

    /// Start a GET for `path` that skips the pool.
    pub fn get_direct(&self, path: &str) -> Result<RequestBuilder> {
        Ok(self.get(path)?.with_extension(DirectAttempt))
    }
}
