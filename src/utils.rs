//! Utility functions for loading proxy lists.

use crate::error::Result;
use crate::proxy::ProxyEntry;

use futures::future;
use log::{info, warn};

/// Load proxy entries from a URL or file path.
///
/// The content must be a JSON array of entries.
pub(crate) async fn load_entries(source: &str) -> Result<Vec<ProxyEntry>> {
    let content = if source.starts_with("http://") || source.starts_with("https://") {
        reqwest::get(source).await?.error_for_status()?.text().await?
    } else {
        tokio::fs::read_to_string(source).await?
    };
    parse_entries(&content)
}

/// Load and concatenate entries from every source, skipping sources that fail.
pub(crate) async fn load_entries_from_sources(sources: &[String]) -> Vec<ProxyEntry> {
    let results = future::join_all(sources.iter().map(|source| load_entries(source))).await;

    let mut entries = Vec::new();
    for (source, result) in sources.iter().zip(results) {
        match result {
            Ok(found) => {
                info!("Loaded {} proxies from {}", found.len(), source);
                entries.extend(found);
            }
            Err(e) => warn!("Failed to load proxies from {}: {}", source, e),
        }
    }
    entries
}

/// Parse a JSON proxy list.
pub(crate) fn parse_entries(content: &str) -> Result<Vec<ProxyEntry>> {
    Ok(serde_json::from_str(content)?)
}
