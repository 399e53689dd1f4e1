//! Headless-browser fallback.
//!
//! A page is driven through a short, explicit script:
//!
//! ```text
//! Navigating -> AwaitingInterception -> TryingSelectors(0..n) -> ScanningContent -> Done
//!          \______________________ budget exhausted ______________________/-> TimedOut
//! ```
//!
//! Every request the page issues passes a network interceptor first; the
//! first one whose URL carries a download marker is written into a
//! [`CaptureSlot`], which later writes cannot overwrite. The script only ever
//! talks to a [`BrowserPage`], so it runs against a scripted fake in tests and
//! against Chrome in production.

pub mod chrome;

pub use chrome::ChromeEngine;

use crate::config::BrowserConfig;
use crate::core::{BrowserFallback, ResolveRequest};
use crate::utils::{quoted_urls, Markers};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Single-slot, write-once store for the intercepted download URL.
#[derive(Debug, Clone, Default)]
pub struct CaptureSlot(Arc<OnceLock<String>>);

impl CaptureSlot {
    /// Returns `true` only for the write that filled the slot.
    pub fn offer(&self, url: &str) -> bool {
        self.0.set(url.to_string()).is_ok()
    }

    pub fn get(&self) -> Option<String> {
        self.0.get().cloned()
    }
}

/// An element the script tries to click to make the page reveal its link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Css(String),
    XPath(String),
}

impl Trigger {
    fn text(tag: &str, text: &str) -> Self {
        Trigger::XPath(format!("//{}[contains(normalize-space(.), '{}')]", tag, text))
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Css(selector) => write!(f, "css:{}", selector),
            Trigger::XPath(xpath) => write!(f, "xpath:{}", xpath),
        }
    }
}

pub fn default_triggers() -> Vec<Trigger> {
    let mut triggers = Vec::new();
    for text in ["Download", "Download Now", "下载"] {
        triggers.push(Trigger::text("button", text));
        triggers.push(Trigger::text("a", text));
    }
    for css in [
        "button.download-btn",
        "a.download-btn",
        "button[data-action='download']",
        "a[data-action='download']",
        "button[onclick*='download']",
        "a[onclick*='download']",
    ] {
        triggers.push(Trigger::Css(css.to_string()));
    }
    triggers
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    Loaded,
    /// The deadline passed; whatever has rendered so far is still usable.
    TimedOut,
}

/// The slice of a browser tab the script needs.
pub trait BrowserPage {
    fn navigate(&mut self, url: &str, timeout: Duration) -> Result<Navigation>;
    /// Wait up to `wait` for the trigger to appear, then click it.
    fn click(&mut self, trigger: &Trigger, wait: Duration) -> Result<()>;
    fn content(&mut self) -> Result<String>;
    fn captured(&self) -> Option<String>;
    fn pause(&mut self, duration: Duration);
}

/// Per-session settings handed to an engine at launch.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub user_agent: String,
    pub cookie: Option<String>,
    pub referer: String,
    pub markers: Arc<Markers>,
    /// Upper bound on how long the session may live.
    pub lifetime: Duration,
}

pub trait BrowserEngine: Send + Sync {
    fn name(&self) -> String;
    fn launch(&self, options: &SessionOptions, capture: CaptureSlot) -> Result<Box<dyn BrowserPage>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptState {
    Navigating,
    AwaitingInterception,
    TryingSelectors(usize),
    ScanningContent,
    Done(Option<String>),
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct ScriptTiming {
    pub navigation: Duration,
    pub selector_wait: Duration,
    pub click_pause: Duration,
    pub settle: Duration,
    pub budget: Duration,
}

impl ScriptTiming {
    pub fn new(config: &BrowserConfig, navigation: Duration) -> Self {
        Self {
            navigation,
            selector_wait: Duration::from_millis(config.selector_wait_ms),
            click_pause: Duration::from_millis(config.click_pause_ms),
            settle: Duration::from_millis(config.settle_ms),
            budget: navigation * 3,
        }
    }
}

pub struct BrowserScript {
    url: String,
    triggers: Arc<Vec<Trigger>>,
    markers: Arc<Markers>,
    timing: ScriptTiming,
}

impl BrowserScript {
    pub fn new(url: &str, triggers: Arc<Vec<Trigger>>, markers: Arc<Markers>, timing: ScriptTiming) -> Self {
        Self {
            url: url.to_string(),
            triggers,
            markers,
            timing,
        }
    }

    pub fn run(&self, page: &mut dyn BrowserPage) -> Result<Option<String>> {
        let started = Instant::now();
        let mut state = ScriptState::Navigating;

        loop {
            if !matches!(state, ScriptState::Done(_) | ScriptState::TimedOut)
                && started.elapsed() >= self.timing.budget
            {
                state = ScriptState::TimedOut;
            }

            state = match state {
                ScriptState::Done(Some(url)) => return Ok(Some(url)),
                ScriptState::Done(None) => {
                    // Give late requests a chance to reach the interceptor.
                    page.pause(self.timing.settle);
                    return Ok(page.captured());
                }
                ScriptState::TimedOut => {
                    warn!("Browser script ran out of time after {:?}", started.elapsed());
                    return Ok(page.captured());
                }
                other => self.step(other, page)?,
            };
        }
    }

    /// Advance one transition. Errors abort the whole script.
    pub fn step(&self, state: ScriptState, page: &mut dyn BrowserPage) -> Result<ScriptState> {
        debug!("Browser script state: {:?}", state);
        let next = match state {
            ScriptState::Navigating => {
                info!("Navigating to: {}", self.url);
                if page.navigate(&self.url, self.timing.navigation)? == Navigation::TimedOut {
                    warn!("Page load timed out, continuing with current state");
                }
                ScriptState::AwaitingInterception
            }
            ScriptState::AwaitingInterception => match page.captured() {
                Some(url) => ScriptState::Done(Some(url)),
                None => ScriptState::TryingSelectors(0),
            },
            ScriptState::TryingSelectors(index) => match self.triggers.get(index) {
                None => ScriptState::ScanningContent,
                Some(trigger) => {
                    debug!("Trying selector: {}", trigger);
                    match page.click(trigger, self.timing.selector_wait) {
                        Ok(()) => {
                            info!("Clicked element: {}", trigger);
                            page.pause(self.timing.click_pause);
                            match page.captured() {
                                Some(url) => ScriptState::Done(Some(url)),
                                None => ScriptState::TryingSelectors(index + 1),
                            }
                        }
                        Err(e) => {
                            debug!("Selector {} failed: {:#}", trigger, e);
                            ScriptState::TryingSelectors(index + 1)
                        }
                    }
                }
            },
            ScriptState::ScanningContent => {
                let content = page.content()?;
                let found = quoted_urls(&content)
                    .find(|url| self.markers.matches(url))
                    .map(str::to_string);
                if let Some(url) = &found {
                    info!("Found URL in page content: {}", url);
                }
                ScriptState::Done(found)
            }
            terminal => terminal,
        };
        Ok(next)
    }
}

/// [`BrowserFallback`] backed by real browser engines, with bounded concurrency.
pub struct BrowserExtractor {
    engines: Arc<Vec<Box<dyn BrowserEngine>>>,
    sessions: Arc<Semaphore>,
    triggers: Arc<Vec<Trigger>>,
    config: BrowserConfig,
}

impl BrowserExtractor {
    pub fn new(engines: Vec<Box<dyn BrowserEngine>>, config: BrowserConfig) -> Self {
        Self {
            engines: Arc::new(engines),
            sessions: Arc::new(Semaphore::new(config.max_sessions.max(1))),
            triggers: Arc::new(default_triggers()),
            config,
        }
    }

    /// Configured executables first, then whatever Chrome the host has.
    pub fn from_config(config: &BrowserConfig) -> Self {
        let mut engines: Vec<Box<dyn BrowserEngine>> = config
            .executables
            .iter()
            .map(|path| Box::new(ChromeEngine::with_executable(path.clone())) as Box<dyn BrowserEngine>)
            .collect();
        engines.push(Box::new(ChromeEngine::auto_detect()));
        Self::new(engines, config.clone())
    }

    pub fn available_sessions(&self) -> usize {
        self.sessions.available_permits()
    }
}

#[async_trait]
impl BrowserFallback for BrowserExtractor {
    async fn find_candidate(&self, req: &ResolveRequest, markers: &Markers) -> Option<String> {
        let permit = match tokio::time::timeout(req.timeout(), self.sessions.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                warn!("Browser session pool is closed");
                return None;
            }
            Err(_) => {
                warn!("No browser session slot freed up within {:?}", req.timeout());
                return None;
            }
        };

        info!("Attempting headless browser resolution...");
        let timing = ScriptTiming::new(&self.config, req.timeout());
        let script = BrowserScript::new(
            req.url().as_str(),
            self.triggers.clone(),
            Arc::new(markers.clone()),
            timing,
        );
        let options = SessionOptions {
            user_agent: req.user_agent().to_string(),
            cookie: req.cookie().map(str::to_string),
            referer: req.referer(),
            markers: Arc::new(markers.clone()),
            lifetime: timing.budget + timing.settle,
        };
        let engines = self.engines.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            run_session(&engines, &options, &script)
        })
        .await;

        match outcome {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!("Browser resolution failed: {:#}", e);
                None
            }
            Err(e) => {
                warn!("Browser session task died: {}", e);
                None
            }
        }
    }
}

/// Launch the first engine that starts and run the script on it. The page,
/// and with it the browser process, is dropped before this returns.
fn run_session(
    engines: &[Box<dyn BrowserEngine>],
    options: &SessionOptions,
    script: &BrowserScript,
) -> Result<Option<String>> {
    let capture = CaptureSlot::default();
    let mut page = launch_first(engines, options, &capture)?;
    script.run(page.as_mut())
}

fn launch_first(
    engines: &[Box<dyn BrowserEngine>],
    options: &SessionOptions,
    capture: &CaptureSlot,
) -> Result<Box<dyn BrowserPage>> {
    for engine in engines {
        match engine.launch(options, capture.clone()) {
            Ok(page) => {
                debug!("Launched {}", engine.name());
                return Ok(page);
            }
            Err(e) => warn!("Failed to launch {}: {:#}", engine.name(), e),
        }
    }
    anyhow::bail!("Failed to launch any browser")
}
