use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::metadata::{DEFAULT_TIMEOUT_SECS, DEFAULT_USER_AGENT};
use crate::utils::{MarkerStore, Markers};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub upstream_timeout_seconds: u64,
    pub probe_timeout_seconds: u64,
    pub cookie_file: Option<PathBuf>,
    pub markers_file: Option<PathBuf>,
    pub browser: BrowserConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub enabled: bool,
    pub max_sessions: usize,
    pub selector_wait_ms: u64,
    pub click_pause_ms: u64,
    pub settle_ms: u64,
    /// Browser binaries tried in order before falling back to auto-detection.
    pub executables: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            upstream_timeout_seconds: 60,
            probe_timeout_seconds: 20,
            cookie_file: None,
            markers_file: None,
            browser: BrowserConfig::default(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_sessions: 2,
            selector_wait_ms: 5_000,
            click_pause_ms: 3_000,
            settle_ms: 5_000,
            executables: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn marker_store(&self) -> Result<MarkerStore> {
        match &self.markers_file {
            Some(path) => MarkerStore::from_file(path),
            None => Ok(MarkerStore::fixed(Markers::default())),
        }
    }

    /// The on-disk cookie, read fresh so an operator can rotate it without a restart.
    pub async fn stored_cookie(&self) -> Option<String> {
        let path = self.cookie_file.as_ref()?;
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Some(text.trim().to_string()).filter(|c| !c.is_empty()),
            Err(e) => {
                tracing::warn!("Could not read cookie file {}: {}", path.display(), e);
                None
            }
        }
    }
}
