use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use crate::core::resolver::ResolveError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36";
pub const DEFAULT_TIMEOUT_SECS: u64 = 25;
pub const MIN_TIMEOUT_SECS: u64 = 5;
pub const MAX_TIMEOUT_SECS: u64 = 120;

/// A validated request to resolve one share page.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    url: Url,
    cookie: Option<String>,
    user_agent: String,
    timeout: Duration,
    use_browser: bool,
}

impl ResolveRequest {
    pub fn new(
        url: &str,
        cookie: Option<String>,
        user_agent: Option<String>,
        timeout_seconds: u64,
        use_browser: bool,
    ) -> Result<Self, ResolveError> {
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&timeout_seconds) {
            return Err(ResolveError::InvalidRequest(format!(
                "timeout_seconds must be between {} and {}",
                MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS
            )));
        }
        let url = parse_http_url(url).map_err(ResolveError::InvalidRequest)?;

        Ok(Self {
            url,
            cookie: cookie.filter(|c| !c.trim().is_empty()),
            user_agent: user_agent
                .filter(|ua| !ua.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout: Duration::from_secs(timeout_seconds),
            use_browser,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn use_browser(&self) -> bool {
        self.use_browser
    }

    /// Same request with a fallback cookie, used when the caller supplied none.
    pub fn with_default_cookie(mut self, cookie: Option<String>) -> Self {
        if self.cookie.is_none() {
            self.cookie = cookie.filter(|c| !c.trim().is_empty());
        }
        self
    }

    /// The share host's own origin, sent as `Referer` so the page renders normally.
    pub fn referer(&self) -> String {
        format!("{}/", self.url.origin().ascii_serialization())
    }
}

/// Best-effort metadata read from a header probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub filename: Option<String>,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFile {
    pub direct_url: String,
    pub filename: Option<String>,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub headers: HashMap<String, String>,
}

impl ResolvedFile {
    pub fn new(direct_url: String, metadata: FileMetadata) -> Self {
        Self {
            direct_url,
            filename: metadata.filename,
            content_length: metadata.content_length,
            content_type: metadata.content_type,
            headers: metadata.headers,
        }
    }
}

/// A request to stream any URL back to the caller.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub url: Url,
    pub filename: Option<String>,
    pub cookie: Option<String>,
    pub user_agent: String,
    /// Forwarded verbatim; syntax is the caller's and upstream's business.
    pub range: Option<String>,
}

impl ProxyRequest {
    pub fn new(url: &str) -> Result<Self, String> {
        Ok(Self {
            url: parse_http_url(url)?,
            filename: None,
            cookie: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            range: None,
        })
    }

    pub fn with_range(mut self, range: Option<String>) -> Self {
        self.range = range;
        self
    }

    pub fn with_cookie(mut self, cookie: Option<String>) -> Self {
        self.cookie = cookie.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn with_filename(mut self, filename: Option<String>) -> Self {
        self.filename = filename.filter(|f| !f.trim().is_empty());
        self
    }

    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        if let Some(ua) = user_agent.filter(|ua| !ua.trim().is_empty()) {
            self.user_agent = ua;
        }
        self
    }
}

fn parse_http_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw.trim()).map_err(|e| format!("invalid url '{}': {}", raw, e))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(format!("url must be an absolute http(s) URL: {}", raw));
    }
    Ok(url)
}
