//! # reqwest-proxy-rotator
//!
//! A health-aware rotating proxy middleware for reqwest.
//!
//! Every request is sent through a proxy picked from a [`ProxyPool`]. The pool
//! prefers the least loaded, longest idle and most reliable proxy, keeps
//! sticky sessions on the same egress address, and benches proxies that fail:
//! briefly for throttling and transient network errors, for a long time after
//! credential rejections or repeated failures. Failed requests are retried on
//! fresh proxies and can fall back to one direct attempt.

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod health;
pub mod middleware;
pub mod pool;
pub mod proxy;
pub mod transport;
mod utils;

pub use client::RotatingClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use error::{Error, Result};
pub use executor::{ExecutorOptions, ResilientExecutor, Route, StickyKey, Transport};
pub use health::{Classification, ErrorCode, FailureCategory, HealthPolicy, ReleaseOutcome, Window};
pub use middleware::{DirectAttempt, RotatingProxyMiddleware};
pub use pool::{PoolConfig, PoolStats, ProxyLease, ProxyPool};
pub use proxy::{AcquireRequest, AcquiredProxy, Port, Protocol, ProxyEntry, ProxyRecord};
pub use transport::ReqwestTransport;
