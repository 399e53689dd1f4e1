use super::{BrowserEngine, BrowserPage, CaptureSlot, Navigation, SessionOptions, Trigger};
use anyhow::Result;
use headless_chrome::browser::tab::{RequestPausedDecision, Tab};
use headless_chrome::browser::transport::{SessionId, Transport};
use headless_chrome::protocol::cdp::Fetch::events::RequestPausedEvent;
use headless_chrome::{Browser, LaunchOptions};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const BROWSER_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
const BROWSER_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
const VIEWPORT: (u32, u32) = (1920, 1080);

/// Chrome or Chromium over the DevTools protocol.
pub struct ChromeEngine {
    executable: Option<PathBuf>,
}

impl ChromeEngine {
    pub fn auto_detect() -> Self {
        Self { executable: None }
    }

    pub fn with_executable(path: PathBuf) -> Self {
        Self {
            executable: Some(path),
        }
    }
}

impl BrowserEngine for ChromeEngine {
    fn name(&self) -> String {
        match &self.executable {
            Some(path) => format!("chrome ({})", path.display()),
            None => "chrome (auto-detected)".to_string(),
        }
    }

    fn launch(&self, options: &SessionOptions, capture: CaptureSlot) -> Result<Box<dyn BrowserPage>> {
        let browser = Browser::new(LaunchOptions {
            headless: true,
            sandbox: false,
            window_size: Some(VIEWPORT),
            ignore_certificate_errors: true,
            path: self.executable.clone(),
            idle_browser_timeout: options.lifetime,
            ..Default::default()
        })?;

        let tab = browser.new_tab()?;
        tab.set_user_agent(&options.user_agent, Some(BROWSER_ACCEPT_LANGUAGE), None)?;

        let mut headers = HashMap::new();
        headers.insert("Accept", BROWSER_ACCEPT);
        headers.insert("Referer", options.referer.as_str());
        if let Some(cookie) = options.cookie.as_deref() {
            headers.insert("Cookie", cookie);
        }
        tab.set_extra_http_headers(headers)?;

        // Pause every request, note the first download-looking one, let all continue.
        let markers = options.markers.clone();
        let slot = capture.clone();
        tab.enable_fetch(None, None)?;
        tab.enable_request_interception(Arc::new(
            move |_transport: Arc<Transport>, _session: SessionId, event: RequestPausedEvent| {
                let url = &event.params.request.url;
                if markers.matches(url) && slot.offer(url) {
                    info!("Intercepted potential download URL: {}", url);
                }
                RequestPausedDecision::Continue(None)
            },
        ))?;

        Ok(Box::new(ChromePage {
            tab,
            capture,
            _browser: browser,
        }))
    }
}

/// One tab in its own browser process. Dropping it kills the process.
struct ChromePage {
    tab: Arc<Tab>,
    capture: CaptureSlot,
    _browser: Browser,
}

impl BrowserPage for ChromePage {
    fn navigate(&mut self, url: &str, timeout: Duration) -> Result<Navigation> {
        self.tab.set_default_timeout(timeout);
        self.tab.navigate_to(url)?;
        match self.tab.wait_until_navigated() {
            Ok(_) => Ok(Navigation::Loaded),
            Err(e) => {
                debug!("Navigation did not finish: {:#}", e);
                Ok(Navigation::TimedOut)
            }
        }
    }

    fn click(&mut self, trigger: &Trigger, wait: Duration) -> Result<()> {
        match trigger {
            Trigger::Css(selector) => {
                self.tab
                    .wait_for_element_with_custom_timeout(selector, wait)?
                    .click()?;
            }
            Trigger::XPath(xpath) => {
                self.tab
                    .wait_for_xpath_with_custom_timeout(xpath, wait)?
                    .click()?;
            }
        }
        Ok(())
    }

    fn content(&mut self) -> Result<String> {
        self.tab.get_content()
    }

    fn captured(&self) -> Option<String> {
        self.capture.get()
    }

    fn pause(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
