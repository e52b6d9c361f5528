//! Middleware implementation for reqwest.

use crate::config::ClientConfig;
use crate::error;
use crate::executor::ResilientExecutor;
use crate::pool::ProxyPool;
use crate::transport::ReqwestTransport;

use async_trait::async_trait;
use reqwest_middleware::{Middleware, Next, Result};
use std::sync::Arc;

/// Request extension that sends a request directly, bypassing the pool.
///
/// ```ignore
/// client.get(url).with_extension(DirectAttempt).send().await?;
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectAttempt;

/// Middleware that routes requests through a rotating proxy pool.
#[derive(Clone)]
pub struct RotatingProxyMiddleware {
    executor: Arc<ResilientExecutor<ReqwestTransport>>,
}

impl RotatingProxyMiddleware {
    /// Create a middleware drawing proxies from `pool`.
    pub fn new(pool: Arc<ProxyPool>, config: &ClientConfig) -> error::Result<Self> {
        let transport = ReqwestTransport::new(config)?;
        let executor = ResilientExecutor::new(pool, transport, config.executor_options());
        Ok(Self {
            executor: Arc::new(executor),
        })
    }

    /// The pool requests are routed through.
    pub fn pool(&self) -> &Arc<ProxyPool> {
        self.executor.pool()
    }
}

#[async_trait]
impl Middleware for RotatingProxyMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        if extensions.get::<DirectAttempt>().is_some() {
            return self.executor.execute_direct(&req).await;
        }
        self.executor.execute(&req).await
    }
}
