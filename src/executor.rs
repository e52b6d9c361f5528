//! Retry and direct-fallback policy around a pluggable HTTP transport.

use crate::error::Error;
use crate::health::{ErrorCode, ReleaseOutcome};
use crate::pool::ProxyPool;
use crate::proxy::{AcquireRequest, AcquiredProxy, Protocol};

use async_trait::async_trait;
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How a single attempt leaves the process.
#[derive(Debug, Clone, Copy)]
pub enum Route<'a> {
    /// Straight to the origin, no proxy.
    Direct,
    /// Through the given proxy.
    Proxied(&'a AcquiredProxy),
}

/// The HTTP client the executor drives.
///
/// A response is a failure for health purposes when its status is 400 or
/// above, but it is still handed back to the caller as-is if it ends up
/// being the final attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    type Request: Send + Sync;
    type Response: Send;
    type Error: From<Error> + fmt::Display + Send;

    /// Reject requests that can never be sent more than once.
    ///
    /// Runs before a proxy is acquired, so a bad request never counts
    /// against proxy health.
    fn check_request(&self, _request: &Self::Request) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Send one attempt of `request` along `route`.
    async fn send(&self, request: &Self::Request, route: Route<'_>) -> Result<Self::Response, Self::Error>;

    fn response_status(&self, response: &Self::Response) -> u16;

    /// Status code carried by an error, if any.
    fn error_status(&self, error: &Self::Error) -> Option<u16>;

    fn error_code(&self, error: &Self::Error) -> Option<ErrorCode>;
}

/// Where a sticky session key comes from.
pub enum StickyKey<R> {
    /// The same key for every request.
    Static(String),
    /// A key computed from each request; `None` means no affinity.
    Derived(Arc<dyn Fn(&R) -> Option<String> + Send + Sync>),
}

impl<R> StickyKey<R> {
    /// Derive the key from each request.
    pub fn derived<F>(f: F) -> Self
    where
        F: Fn(&R) -> Option<String> + Send + Sync + 'static,
    {
        StickyKey::Derived(Arc::new(f))
    }

    /// Resolve the key for `request`.
    pub fn resolve(&self, request: &R) -> Option<String> {
        match self {
            StickyKey::Static(key) => Some(key.clone()),
            StickyKey::Derived(f) => f(request),
        }
    }
}

impl<R> Clone for StickyKey<R> {
    fn clone(&self) -> Self {
        match self {
            StickyKey::Static(key) => StickyKey::Static(key.clone()),
            StickyKey::Derived(f) => StickyKey::Derived(Arc::clone(f)),
        }
    }
}

impl<R> fmt::Debug for StickyKey<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StickyKey::Static(key) => f.debug_tuple("Static").field(key).finish(),
            StickyKey::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

impl<R> From<&str> for StickyKey<R> {
    fn from(key: &str) -> Self {
        StickyKey::Static(key.to_string())
    }
}

/// Per-executor acquisition and retry settings.
pub struct ExecutorOptions<R> {
    pub protocol: Protocol,
    pub sticky_key: Option<StickyKey<R>>,
    pub max_in_flight_per_proxy: usize,
    /// Extra proxied attempts after the first one.
    pub max_retries: usize,
    /// Make one direct attempt when proxied attempts give up.
    pub fallback_to_direct: bool,
}

impl<R> Clone for ExecutorOptions<R> {
    fn clone(&self) -> Self {
        Self {
            protocol: self.protocol,
            sticky_key: self.sticky_key.clone(),
            max_in_flight_per_proxy: self.max_in_flight_per_proxy,
            max_retries: self.max_retries,
            fallback_to_direct: self.fallback_to_direct,
        }
    }
}

impl<R> fmt::Debug for ExecutorOptions<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorOptions")
            .field("protocol", &self.protocol)
            .field("sticky_key", &self.sticky_key)
            .field("max_in_flight_per_proxy", &self.max_in_flight_per_proxy)
            .field("max_retries", &self.max_retries)
            .field("fallback_to_direct", &self.fallback_to_direct)
            .finish()
    }
}

impl<R> Default for ExecutorOptions<R> {
    fn default() -> Self {
        Self {
            protocol: Protocol::Http,
            sticky_key: None,
            max_in_flight_per_proxy: 1,
            max_retries: 2,
            fallback_to_direct: true,
        }
    }
}

/// Whether a failed attempt is worth repeating through another proxy.
pub fn is_retryable(outcome: &ReleaseOutcome) -> bool {
    if outcome.is_success() {
        return false;
    }
    let transient_code = outcome.code().is_some_and(|code| code.is_transient());
    let retryable_status = matches!(outcome.status(), Some(s) if s == 429 || s == 403 || s >= 500);
    transient_code || retryable_status
}

/// Routes every call through the pool, retrying on fresh proxies and
/// falling back to one direct attempt.
pub struct ResilientExecutor<T: Transport> {
    pool: Arc<ProxyPool>,
    transport: T,
    options: ExecutorOptions<T::Request>,
}

impl<T: Transport> ResilientExecutor<T> {
    pub fn new(pool: Arc<ProxyPool>, transport: T, options: ExecutorOptions<T::Request>) -> Self {
        Self { pool, transport, options }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn options(&self) -> &ExecutorOptions<T::Request> {
        &self.options
    }

    /// Send `request` through the pool.
    ///
    /// Returns whatever the last attempt produced: a success, the final
    /// non-success response, or the transport's error, unchanged. Only a
    /// misconfigured proxy port surfaces as a pool [`Error`].
    pub async fn execute(&self, request: &T::Request) -> Result<T::Response, T::Error> {
        self.transport.check_request(request)?;

        let acquire = AcquireRequest {
            protocol: self.options.protocol,
            sticky_key: self.options.sticky_key.as_ref().and_then(|key| key.resolve(request)),
            max_in_flight_per_proxy: self.options.max_in_flight_per_proxy,
        };

        let mut retries = 0;
        loop {
            let mut lease = self.pool.lease(&acquire)?;
            if let Some(limiter) = &lease.proxy().limiter {
                limiter.until_ready().await;
            }
            lease.mark_issued();

            debug!("Using proxy: {} (attempt {})", lease.proxy().id, retries + 1);
            let result = self.transport.send(request, Route::Proxied(lease.proxy())).await;
            let outcome = self.outcome(&result, lease.elapsed());
            let proxy_id = lease.proxy().id.clone();
            lease.release(outcome);

            if outcome.is_success() {
                return result;
            }

            if retries < self.options.max_retries && is_retryable(&outcome) {
                warn!(
                    "Request failed with proxy {} (attempt {}): {}",
                    proxy_id,
                    retries + 1,
                    describe(&outcome)
                );
                retries += 1;
                continue;
            }

            if self.options.fallback_to_direct {
                info!(
                    "Proxied attempts gave up after {} tries ({}), retrying once directly",
                    retries + 1,
                    describe(&outcome)
                );
                return self.transport.send(request, Route::Direct).await;
            }

            if let Err(err) = &result {
                warn!("Request failed with proxy {}, giving up: {}", proxy_id, err);
            }
            return result;
        }
    }

    /// Send `request` once without any proxy. The pool is not touched.
    pub async fn execute_direct(&self, request: &T::Request) -> Result<T::Response, T::Error> {
        debug!("Sending forced direct request");
        self.transport.send(request, Route::Direct).await
    }

    fn outcome(&self, result: &Result<T::Response, T::Error>, elapsed: Duration) -> ReleaseOutcome {
        match result {
            Ok(response) => {
                let status = self.transport.response_status(response);
                if status < 400 {
                    ReleaseOutcome::Success { status, elapsed }
                } else {
                    ReleaseOutcome::status_failure(status, elapsed)
                }
            }
            Err(err) => ReleaseOutcome::Failure {
                status: self.transport.error_status(err),
                code: self.transport.error_code(err),
                elapsed,
            },
        }
    }
}

fn describe(outcome: &ReleaseOutcome) -> String {
    match (outcome.status(), outcome.code()) {
        (Some(status), Some(code)) => format!("status {} ({:?})", status, code),
        (Some(status), None) => format!("status {}", status),
        (None, Some(code)) => format!("{:?}", code),
        (None, None) => "unknown failure".to_string(),
    }
}
