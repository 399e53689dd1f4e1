//! Download-indicator markers.
//!
//! A marker is a lowercase substring (a CDN hostname, or a keyword such as
//! `dlink`) whose presence in a URL suggests it serves file bytes rather than
//! another HTML wrapper. The list drifts as the host changes its markup, so it
//! can live in a file that is re-read whenever its mtime moves.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tracing::{info, warn};

pub const DEFAULT_MARKERS: &[&str] = &[
    "download",
    "dlink",
    "get_file",
    "d.terabox",
    "baidupcs",
    "file.baidu.com",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    needles: Vec<String>,
}

impl Markers {
    pub fn new<I, S>(needles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            needles: needles
                .into_iter()
                .map(|n| n.as_ref().trim().to_lowercase())
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    /// Parse a newline-separated list; blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Self {
        Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        )
    }

    pub fn matches(&self, candidate: &str) -> bool {
        let lowered = candidate.to_lowercase();
        self.needles.iter().any(|n| lowered.contains(n.as_str()))
    }

    pub fn len(&self) -> usize {
        self.needles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }
}

impl Default for Markers {
    fn default() -> Self {
        Self::new(DEFAULT_MARKERS.iter().copied())
    }
}

struct Loaded {
    modified: Option<SystemTime>,
    markers: Arc<Markers>,
}

/// Hands out marker snapshots, reloading from disk when the backing file changes.
pub struct MarkerStore {
    path: Option<PathBuf>,
    loaded: RwLock<Loaded>,
}

impl MarkerStore {
    pub fn fixed(markers: Markers) -> Self {
        Self {
            path: None,
            loaded: RwLock::new(Loaded {
                modified: None,
                markers: Arc::new(markers),
            }),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (modified, markers) = read_markers(&path)?;
        info!("Loaded {} download markers from {}", markers.len(), path.display());
        Ok(Self {
            path: Some(path),
            loaded: RwLock::new(Loaded {
                modified,
                markers: Arc::new(markers),
            }),
        })
    }

    /// Current snapshot. A file that vanished or fails to parse keeps the old
    /// list; a failed version is not retried until the file changes again.
    pub async fn snapshot(&self) -> Arc<Markers> {
        let Some(path) = &self.path else {
            return self.cached();
        };

        let on_disk = tokio::fs::metadata(path).await.and_then(|m| m.modified()).ok();
        {
            let loaded = self.loaded.read().unwrap_or_else(|e| e.into_inner());
            if on_disk.is_none() || loaded.modified == on_disk {
                return loaded.markers.clone();
            }
        }

        let reloaded = match tokio::fs::read_to_string(path).await {
            Ok(text) => parse_marker_file(path, &text),
            Err(e) => Err(anyhow::Error::new(e).context(format!("reading marker file {}", path.display()))),
        };

        let mut loaded = self.loaded.write().unwrap_or_else(|e| e.into_inner());
        loaded.modified = on_disk;
        match reloaded {
            Ok(markers) => {
                info!("Reloaded {} download markers from {}", markers.len(), path.display());
                loaded.markers = Arc::new(markers);
            }
            Err(e) => warn!("Keeping previous markers, reload failed: {:#}", e),
        }
        loaded.markers.clone()
    }

    fn cached(&self) -> Arc<Markers> {
        self.loaded
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .markers
            .clone()
    }
}

impl Default for MarkerStore {
    fn default() -> Self {
        Self::fixed(Markers::default())
    }
}

fn read_markers(path: &Path) -> Result<(Option<SystemTime>, Markers)> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading marker file {}", path.display()))?;
    let markers = parse_marker_file(path, &text)?;
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    Ok((modified, markers))
}

fn parse_marker_file(path: &Path, text: &str) -> Result<Markers> {
    let markers = Markers::parse(text);
    if markers.is_empty() {
        anyhow::bail!("marker file {} lists no markers", path.display());
    }
    Ok(markers)
}
