//! Simple example of using reqwest-proxy-rotator.
//!
//! Expects a JSON proxy list, e.g. `PROXY_LIST=proxies.json`:
//! `[{"ip": "203.0.113.7", "http_port": 8080, "username": "u", "password": "p"}]`

use reqwest_proxy_rotator::config::ClientConfigBuilder;
use reqwest_proxy_rotator::{PoolConfig, ProxyPool, RotatingClient};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let source = std::env::var("PROXY_LIST").unwrap_or_else(|_| "proxies.json".to_string());
    println!("Loading proxies from {}...", source);

    let pool = Arc::new(ProxyPool::from_sources(&[source], PoolConfig::default()).await?);

    let config = ClientConfigBuilder::from_env()
        .timeout(Duration::from_secs(10))
        .max_retries(2)
        .sticky_key_fn(|req| req.url().host_str().map(str::to_string))
        .user_agent("reqwest-proxy-rotator/0.1")
        .build();

    let client = RotatingClient::new(Arc::clone(&pool), config)?;

    println!("Sending request...");
    let response = client.get("https://httpbin.org/ip")?.send().await?;

    println!("Status: {}", response.status());
    println!("Response: {}", response.text().await?);
    println!("Pool: {:?}", pool.stats());

    Ok(())
}
