use crate::config::Config;
use crate::core::prober::MetadataProber;
use crate::core::{BrowserFallback, ResolveRequest, ResolvedFile};
use crate::extractors::{BrowserExtractor, StaticExtractor};
use crate::utils::{is_absolute_url, MarkerStore};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("could not resolve a direct URL; the page may be private or its layout changed")]
    Unresolvable,
    #[error("internal resolver fault: {0}")]
    Internal(String),
}

impl ResolveError {
    /// What the caller can try next, for errors they can do something about.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ResolveError::Unresolvable => Some(
                "Check the link opens in a normal browser; for private links pass a cookie, \
                 and make sure browser fallback is allowed.",
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Stage {
    StaticAttempt,
    BrowserAttempt,
    Probing(String),
    Done(ResolvedFile),
    Failed,
}

/// Runs the static extractor, then (if allowed) the browser, then the prober.
pub struct Resolver {
    static_extractor: StaticExtractor,
    browser: Option<Arc<dyn BrowserFallback>>,
    prober: MetadataProber,
    markers: Arc<MarkerStore>,
}

impl Resolver {
    pub fn new(client: reqwest::Client, markers: Arc<MarkerStore>, probe_timeout: Duration) -> Self {
        Self {
            static_extractor: StaticExtractor::new(client.clone()),
            browser: None,
            prober: MetadataProber::new(client, probe_timeout),
            markers,
        }
    }

    pub fn with_browser(mut self, browser: Arc<dyn BrowserFallback>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        let resolver = Self::new(client, Arc::new(config.marker_store()?), config.probe_timeout());
        if config.browser.enabled {
            Ok(resolver.with_browser(Arc::new(BrowserExtractor::from_config(&config.browser))))
        } else {
            Ok(resolver)
        }
    }

    pub async fn resolve(&self, req: &ResolveRequest) -> Result<ResolvedFile, ResolveError> {
        let markers = self.markers.snapshot().await;
        let mut stage = Stage::StaticAttempt;

        loop {
            debug!("Resolving {}: {:?}", req.url(), stage);
            stage = match stage {
                Stage::StaticAttempt => {
                    match self.static_extractor.find_candidate(req, &markers).await {
                        Some(url) => Stage::Probing(url),
                        None if req.use_browser() && self.browser.is_some() => Stage::BrowserAttempt,
                        None => Stage::Failed,
                    }
                }
                Stage::BrowserAttempt => {
                    let found = match &self.browser {
                        Some(browser) => browser.find_candidate(req, &markers).await,
                        None => None,
                    };
                    match found.filter(|url| is_absolute_url(url)) {
                        Some(url) => Stage::Probing(url),
                        None => Stage::Failed,
                    }
                }
                Stage::Probing(url) => {
                    let metadata = self.prober.probe(&url, req.user_agent(), req.cookie()).await;
                    Stage::Done(ResolvedFile::new(url, metadata))
                }
                Stage::Done(file) => {
                    info!("Resolved {} -> {}", req.url(), file.direct_url);
                    return Ok(file);
                }
                Stage::Failed => {
                    warn!("No strategy produced a direct URL for {}", req.url());
                    return Err(ResolveError::Unresolvable);
                }
            };
        }
    }
}
