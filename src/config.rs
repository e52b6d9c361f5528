//! Configuration for rotating clients.

use crate::error::{Error, Result};
use crate::executor::{ExecutorOptions, StickyKey};
use crate::proxy::Protocol;

use http::{HeaderMap, HeaderName, HeaderValue};
use log::warn;
use std::time::Duration;
use url::Url;

/// Set to `false` to send every request directly.
pub const ROTATION_ENV: &str = "USE_PROXY";
/// Base URL prepended to relative request paths.
pub const BASE_URL_ENV: &str = "API_BASE_URL";
/// Per-request timeout in milliseconds.
pub const TIMEOUT_ENV: &str = "API_TIMEOUT_MS";

/// Timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for a rotating client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL that relative paths are appended to.
    pub base_url: Option<Url>,
    /// Timeout applied to every attempt.
    pub timeout: Duration,
    /// Headers sent with every request.
    pub headers: HeaderMap,
    pub user_agent: Option<String>,
    /// Protocol used to reach proxies.
    pub protocol: Protocol,
    /// Session affinity key.
    pub sticky_key: Option<StickyKey<reqwest::Request>>,
    pub max_in_flight_per_proxy: usize,
    /// Number of times to retry a request with different proxies.
    pub max_retries: usize,
    /// Whether to try once without a proxy when proxied attempts give up.
    pub fallback_to_direct: bool,
    /// When false the pool is bypassed entirely.
    pub rotation_enabled: bool,
}

impl ClientConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Executor settings derived from this configuration.
    pub fn executor_options(&self) -> ExecutorOptions<reqwest::Request> {
        ExecutorOptions {
            protocol: self.protocol,
            sticky_key: self.sticky_key.clone(),
            max_in_flight_per_proxy: self.max_in_flight_per_proxy,
            max_retries: self.max_retries,
            fallback_to_direct: self.fallback_to_direct,
        }
    }

    /// Resolve `path` against the base URL. Absolute URLs pass through.
    pub fn resolve_url(&self, path: &str) -> Result<Url> {
        if let Ok(url) = Url::parse(path) {
            return Ok(url);
        }
        match &self.base_url {
            Some(base) => {
                let joined = format!(
                    "{}/{}",
                    base.as_str().trim_end_matches('/'),
                    path.trim_start_matches('/')
                );
                Ok(Url::parse(&joined)?)
            }
            None => Err(Error::InvalidUrl(url::ParseError::RelativeUrlWithoutBase)),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfigBuilder::new().build()
    }
}

/// Builder for `ClientConfig`.
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    base_url: Option<Url>,
    timeout: Option<Duration>,
    headers: HeaderMap,
    user_agent: Option<String>,
    protocol: Option<Protocol>,
    sticky_key: Option<StickyKey<reqwest::Request>>,
    max_in_flight_per_proxy: Option<usize>,
    max_retries: Option<usize>,
    fallback_to_direct: Option<bool>,
    rotation_enabled: Option<bool>,
}

impl ClientConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a builder from `USE_PROXY`, `API_BASE_URL` and `API_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let mut builder = Self::new().rotation_enabled(rotation_enabled_from_env());

        if let Ok(raw) = std::env::var(BASE_URL_ENV) {
            match Url::parse(&raw) {
                Ok(url) => builder = builder.base_url(url),
                Err(e) => warn!("Ignoring {}={}: {}", BASE_URL_ENV, raw, e),
            }
        }
        if let Some(timeout) = parse_timeout_ms(std::env::var(TIMEOUT_ENV).ok().as_deref()) {
            builder = builder.timeout(timeout);
        }

        builder
    }

    /// Set the base URL.
    pub fn base_url(mut self, url: Url) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Set the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a header sent with every request.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replace all default headers.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the User-Agent.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set the proxy protocol.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Use the same sticky key for every request.
    pub fn sticky_key(mut self, key: impl Into<String>) -> Self {
        self.sticky_key = Some(StickyKey::Static(key.into()));
        self
    }

    /// Derive the sticky key from each request.
    pub fn sticky_key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&reqwest::Request) -> Option<String> + Send + Sync + 'static,
    {
        self.sticky_key = Some(StickyKey::derived(f));
        self
    }

    /// Set the per-proxy in-flight cap.
    pub fn max_in_flight_per_proxy(mut self, cap: usize) -> Self {
        self.max_in_flight_per_proxy = Some(cap);
        self
    }

    /// Set the number of times to retry a request with different proxies.
    pub fn max_retries(mut self, count: usize) -> Self {
        self.max_retries = Some(count);
        self
    }

    /// Enable or disable the final direct attempt.
    pub fn fallback_to_direct(mut self, enabled: bool) -> Self {
        self.fallback_to_direct = Some(enabled);
        self
    }

    /// Enable or disable rotation.
    pub fn rotation_enabled(mut self, enabled: bool) -> Self {
        self.rotation_enabled = Some(enabled);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url,
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            headers: self.headers,
            user_agent: self.user_agent,
            protocol: self.protocol.unwrap_or_default(),
            sticky_key: self.sticky_key,
            max_in_flight_per_proxy: self.max_in_flight_per_proxy.unwrap_or(1),
            max_retries: self.max_retries.unwrap_or(2),
            fallback_to_direct: self.fallback_to_direct.unwrap_or(true),
            rotation_enabled: self.rotation_enabled.unwrap_or(true),
        }
    }
}

/// Read the process-wide rotation toggle.
pub fn rotation_enabled_from_env() -> bool {
    parse_rotation_flag(std::env::var(ROTATION_ENV).ok().as_deref())
}

/// Anything other than `false` (any case) keeps rotation on.
fn parse_rotation_flag(value: Option<&str>) -> bool {
    value.map_or(true, |v| !v.trim().eq_ignore_ascii_case("false"))
}

fn parse_timeout_ms(value: Option<&str>) -> Option<Duration> {
    value?
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}
