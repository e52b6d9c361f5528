//! The reqwest-backed transport.

use crate::config::ClientConfig;
use crate::executor::{Route, Transport};
use crate::health::ErrorCode;
use crate::proxy::AcquiredProxy;

use anyhow::anyhow;
use async_trait::async_trait;
use http::HeaderMap;
use log::debug;
use parking_lot::Mutex;
use reqwest_middleware::Error;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::io;
use std::time::Duration;

/// Client settings shared by the direct client and every per-proxy client.
#[derive(Debug, Clone)]
struct ClientSettings {
    timeout: Duration,
    headers: HeaderMap,
    user_agent: Option<String>,
}

impl From<&ClientConfig> for ClientSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            timeout: config.timeout,
            headers: config.headers.clone(),
            user_agent: config.user_agent.clone(),
        }
    }
}

impl ClientSettings {
    fn builder(&self) -> reqwest::ClientBuilder {
        let builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .default_headers(self.headers.clone());
        match &self.user_agent {
            Some(ua) => builder.user_agent(ua.as_str()),
            None => builder,
        }
    }
}

/// Sends requests with reqwest, one client per proxy URL.
///
/// reqwest binds proxies to clients, so a client is built the first time a
/// proxy is used and reused after that.
#[derive(Debug)]
pub struct ReqwestTransport {
    settings: ClientSettings,
    direct: reqwest::Client,
    proxied: Mutex<HashMap<String, reqwest::Client>>,
}

impl ReqwestTransport {
    /// Build the transport and its direct client.
    pub fn new(config: &ClientConfig) -> Result<Self, reqwest::Error> {
        let settings = ClientSettings::from(config);
        let direct = settings.builder().no_proxy().build()?;

        Ok(Self {
            settings,
            direct,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    fn client_for(&self, proxy: &AcquiredProxy) -> Result<reqwest::Client, reqwest::Error> {
        if let Some(client) = self.proxied.lock().get(&proxy.url) {
            return Ok(client.clone());
        }

        debug!("Building client for proxy {}", proxy.id);
        let client = self
            .settings
            .builder()
            .proxy(reqwest::Proxy::all(&proxy.url)?)
            .build()?;

        self.proxied.lock().insert(proxy.url.clone(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    type Request = reqwest::Request;
    type Response = reqwest::Response;
    type Error = Error;

    fn check_request(&self, request: &reqwest::Request) -> Result<(), Error> {
        request.try_clone().map(drop).ok_or_else(not_cloneable)
    }

    async fn send(&self, request: &reqwest::Request, route: Route<'_>) -> Result<reqwest::Response, Error> {
        let request = request.try_clone().ok_or_else(not_cloneable)?;

        let client = match route {
            Route::Direct => self.direct.clone(),
            Route::Proxied(proxy) => self.client_for(proxy)?,
        };

        Ok(client.execute(request).await?)
    }

    fn response_status(&self, response: &reqwest::Response) -> u16 {
        response.status().as_u16()
    }

    fn error_status(&self, error: &Error) -> Option<u16> {
        match error {
            Error::Reqwest(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    fn error_code(&self, error: &Error) -> Option<ErrorCode> {
        match error {
            Error::Reqwest(e) => Some(error_code(e)),
            _ => Some(ErrorCode::Other),
        }
    }
}

fn not_cloneable() -> Error {
    Error::Middleware(anyhow!(
        "Request object is not cloneable. Are you passing a streaming body?"
    ))
}

/// A client that never goes through a proxy, not even one from the environment.
pub(crate) fn base_client(config: &ClientConfig) -> Result<reqwest::Client, reqwest::Error> {
    ClientSettings::from(config).builder().no_proxy().build()
}

/// Map a reqwest error onto the codes proxy health cares about.
pub fn error_code(err: &reqwest::Error) -> ErrorCode {
    if err.is_timeout() {
        return ErrorCode::Timeout;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::TimedOut => return ErrorCode::Timeout,
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe => return ErrorCode::ConnectionReset,
                _ => {}
            }
        }
        let message = cause.to_string().to_ascii_lowercase();
        if message.contains("dns error") || message.contains("failed to lookup address") {
            return ErrorCode::DnsRetry;
        }
        source = cause.source();
    }

    if err.is_connect() {
        ErrorCode::Connect
    } else {
        ErrorCode::Other
    }
}
