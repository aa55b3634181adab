use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::config::Config;
use crate::error::{HarvestError, Result};

/// Retrieves source documents. Implementations never retry.
pub trait Fetcher: Send + Sync {
    /// Fetch a page as text
    fn fetch_html(&self, url: &str) -> Result<String>;

    /// Fetch raw bytes (PDF rate sheets)
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
}

/// Default fetcher: HTTP(S) through a shared ureq agent, local paths from disk
pub struct SourceFetcher {
    agent: ureq::Agent,
    user_agent: String,
}

impl SourceFetcher {
    pub fn new(timeout: Duration, user_agent: impl Into<String>) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self {
            agent,
            user_agent: user_agent.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.timeout(), config.user_agent.clone())
    }

    fn get(&self, url: &str) -> Result<ureq::http::Response<ureq::Body>> {
        debug!(url, "fetching");
        let response = self
            .agent
            .get(url)
            .header("User-Agent", &self.user_agent)
            .call()?;
        Ok(response)
    }
}

impl Fetcher for SourceFetcher {
    fn fetch_html(&self, url: &str) -> Result<String> {
        if !is_remote(url) {
            return read_local(url).map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        }
        let html = self.get(url)?.into_body().read_to_string()?;
        Ok(html)
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        if !is_remote(url) {
            return read_local(url);
        }
        let bytes = self.get(url)?.into_body().read_to_vec()?;
        Ok(bytes)
    }
}

/// Whether a reference names an http(s) resource rather than a local file
pub fn is_remote(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

fn read_local(reference: &str) -> Result<Vec<u8>> {
    let path = reference.strip_prefix("file://").unwrap_or(reference);
    std::fs::read(Path::new(path)).map_err(|e| HarvestError::SourceUnavailable {
        url: reference.to_string(),
        reason: e.to_string(),
    })
}

/// Resolve a potentially relative URL against a base URL
pub fn resolve_url(base: &str, relative: &str) -> Option<String> {
    // If already absolute, return as-is
    if is_remote(relative) {
        return Some(relative.to_string());
    }

    if !is_remote(base) {
        let dir = Path::new(base.strip_prefix("file://").unwrap_or(base)).parent()?;
        return Some(dir.join(relative).to_string_lossy().into_owned());
    }

    let base_url = url::Url::parse(base).ok()?;
    base_url.join(relative).ok().map(|u| u.to_string())
}
