use crate::core::extractor::{SharePage, Strategy, StrategyChain};
use crate::core::ResolveRequest;
use crate::extractors::js_state::StateEvaluator;
use crate::utils::{flatten_json, is_absolute_url, quoted_urls, unescape_js_url, Markers};
use anyhow::Result;
use regex::Regex;
use scraper::Selector;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

const PAGE_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
const PAGE_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.5";

/// `window.<state> = {...}` assignments that close their script block.
static WINDOW_STATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)window\.(?:data|__INITIAL_STATE__|jsData)\s*=\s*(\{.*?\})\s*;?\s*</script>")
        .unwrap()
});
static NEXT_DATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<script[^>]*\bid\s*=\s*["']__NEXT_DATA__["'][^>]*>(.*?)</script>"#).unwrap()
});

/// Raw-text patterns, most specific first. Group 1 is the candidate.
static DIRECT_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r#"(?i)(https?://[^\s"'<>]+?/file/[^\s"'<>]+)"#, "direct file pattern"),
        (r#"(?i)(https?://[^\s"'<>]+?/share/link[^\s"'<>]+)"#, "share link pattern"),
        (r#"(?i)"dlink"\s*:\s*"([^"]+)""#, "dlink JSON field"),
        (r#"(?i)downloadUrl\s*[=:]\s*["']([^"']+)["']"#, "downloadUrl assignment"),
    ]
    .into_iter()
    .map(|(pattern, desc)| (Regex::new(pattern).unwrap(), desc))
    .collect()
});

fn accept(candidate: &str, markers: &Markers) -> bool {
    is_absolute_url(candidate) && markers.matches(candidate)
}

/// Parses framework state blobs and looks for a `*url*` leaf pointing at a download.
pub struct EmbeddedState {
    evaluator: StateEvaluator,
}

impl EmbeddedState {
    pub fn new() -> Self {
        Self {
            evaluator: StateEvaluator::new(),
        }
    }

    fn parse_state(&self, raw: &str) -> Option<Value> {
        match serde_json::from_str(raw.trim()) {
            Ok(value) => Some(value),
            Err(json_err) => match self.evaluator.to_json(raw) {
                Ok(value) => Some(value),
                Err(js_err) => {
                    debug!("State block is neither JSON ({}) nor JS ({:#})", json_err, js_err);
                    None
                }
            },
        }
    }
}

impl Default for EmbeddedState {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for EmbeddedState {
    fn name(&self) -> &'static str {
        "embedded state"
    }

    fn attempt(&self, page: &SharePage<'_>, markers: &Markers) -> Option<String> {
        let blocks = [&*WINDOW_STATE_RE, &*NEXT_DATA_RE]
            .into_iter()
            .filter_map(|re| re.captures(page.html()))
            .filter_map(|c| c.get(1).map(|m| m.as_str()));

        for raw in blocks {
            let Some(state) = self.parse_state(raw) else {
                continue;
            };
            let found = flatten_json(&state).into_iter().find_map(|(key, leaf)| match leaf {
                Value::String(s) if key.to_lowercase().contains("url") && accept(s, markers) => {
                    debug!("State key {} holds a download URL", key);
                    Some(s.clone())
                }
                _ => None,
            });
            if found.is_some() {
                return found;
            }
        }
        None
    }
}

/// Regex scan over the raw page text.
pub struct PatternScan;

impl Strategy for PatternScan {
    fn name(&self) -> &'static str {
        "pattern scan"
    }

    fn attempt(&self, page: &SharePage<'_>, markers: &Markers) -> Option<String> {
        for (re, desc) in DIRECT_PATTERNS.iter() {
            for captures in re.captures_iter(page.html()) {
                let Some(m) = captures.get(1) else { continue };
                let candidate = unescape_js_url(m.as_str());
                if accept(&candidate, markers) {
                    debug!("Matched {}", desc);
                    return Some(candidate);
                }
            }
        }
        None
    }
}

/// Quoted absolute URLs inside inline `<script>` blocks.
pub struct InlineScriptScan;

impl Strategy for InlineScriptScan {
    fn name(&self) -> &'static str {
        "inline script scan"
    }

    fn attempt(&self, page: &SharePage<'_>, markers: &Markers) -> Option<String> {
        let selector = Selector::parse("script:not([src])").ok()?;
        page.document().select(&selector).find_map(|script| {
            let body: String = script.text().collect();
            let found = quoted_urls(&body)
                .map(unescape_js_url)
                .find(|candidate| accept(candidate, markers));
            found
        })
    }
}

/// Last resort: `src`/`href` of embedding and link elements.
pub struct MarkupScan;

impl Strategy for MarkupScan {
    fn name(&self) -> &'static str {
        "markup scan"
    }

    fn attempt(&self, page: &SharePage<'_>, markers: &Markers) -> Option<String> {
        let selector = Selector::parse("iframe, embed, source, a").ok()?;
        page.document().select(&selector).find_map(|element| {
            let attrs = element.value();
            let link = attrs.attr("src").or_else(|| attrs.attr("href"))?.trim();
            if accept(link, markers) {
                debug!("Found URL in <{}> tag", attrs.name());
                Some(link.to_string())
            } else {
                None
            }
        })
    }
}

/// Fetches the share page and runs the static strategy chain over it.
pub struct StaticExtractor {
    client: reqwest::Client,
    chain: Arc<StrategyChain>,
}

impl StaticExtractor {
    pub fn new(client: reqwest::Client) -> Self {
        let mut chain = StrategyChain::new();
        chain.register_strategy(Box::new(EmbeddedState::new()));
        chain.register_strategy(Box::new(PatternScan));
        chain.register_strategy(Box::new(InlineScriptScan));
        chain.register_strategy(Box::new(MarkupScan));
        Self {
            client,
            chain: Arc::new(chain),
        }
    }

    /// `None` covers both "page fetched, nothing found" and "page fetch failed".
    pub async fn find_candidate(&self, req: &ResolveRequest, markers: &Markers) -> Option<String> {
        let html = match self.fetch_page(req).await {
            Ok(html) => html,
            Err(e) => {
                warn!("Could not fetch share page {}: {:#}", req.url(), e);
                return None;
            }
        };
        // Parsing and state evaluation are CPU-bound; keep them off the runtime threads.
        let chain = self.chain.clone();
        let markers = markers.clone();
        let scan = tokio::task::spawn_blocking(move || {
            chain.first_candidate(&SharePage::new(&html), &markers)
        });
        match scan.await {
            Ok(found) => found,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                warn!("Static strategies aborted for {}: {}", req.url(), e);
                None
            }
        }
    }

    pub fn candidate_from_html(&self, html: &str, markers: &Markers) -> Option<String> {
        self.chain.first_candidate(&SharePage::new(html), markers)
    }

    async fn fetch_page(&self, req: &ResolveRequest) -> Result<String> {
        info!("Fetching share page: {}", req.url());
        let mut request = self
            .client
            .get(req.url().clone())
            .timeout(req.timeout())
            .header("User-Agent", req.user_agent())
            .header("Accept", PAGE_ACCEPT)
            .header("Accept-Language", PAGE_ACCEPT_LANGUAGE)
            .header("Referer", req.referer())
            .header("Upgrade-Insecure-Requests", "1")
            .header("Sec-Fetch-Dest", "document")
            .header("Sec-Fetch-Mode", "navigate")
            .header("Sec-Fetch-Site", "same-origin");
        if let Some(cookie) = req.cookie() {
            request = request.header("Cookie", cookie);
        }

        let response = request.send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Markers {
        Markers::default()
    }

    fn run(strategy: &dyn Strategy, html: &str) -> Option<String> {
        strategy.attempt(&SharePage::new(html), &markers())
    }

    #[test]
    fn test_window_state_json() {
        let html = r#"<html><script>window.data = {"share":{"title":"x",
            "thumbUrl":"https://thumb.example/a.jpg",
            "downloadUrl":"https://d.terabox.com/file/abc?fid=1"}};</script></html>"#;
        assert_eq!(
            run(&EmbeddedState::new(), html).as_deref(),
            Some("https://d.terabox.com/file/abc?fid=1")
        );
    }

    #[test]
    fn test_window_state_js_literal() {
        let html = "<script>window.jsData = {list: [{name: 'a.mp4', dlink_url: 'https://d.terabox.com/file/js'},]};</script>";
        assert_eq!(
            run(&EmbeddedState::new(), html).as_deref(),
            Some("https://d.terabox.com/file/js")
        );
    }

    #[test]
    fn test_next_data_block() {
        let html = r#"<script id="__NEXT_DATA__" type="application/json">
            {"props":{"pageProps":{"file":{"url":"https://data.baidupcs.com/get/1"}}}}
            </script>"#;
        assert_eq!(
            run(&EmbeddedState::new(), html).as_deref(),
            Some("https://data.baidupcs.com/get/1")
        );
    }

    #[test]
    fn test_state_ignores_non_url_keys_and_relative_values() {
        let html = r#"<script>window.data = {"dlink":"https://d.terabox.com/file/k",
            "previewUrl":"/download/relative"};</script>"#;
        assert!(run(&EmbeddedState::new(), html).is_none());
    }

    #[test]
    fn test_pattern_scan_order_and_unescape() {
        let html = r#"<div>"dlink":"https:\/\/d.terabox.com\/sharedl\/x?a=1&b=2"</div>
            <p>see https://www.example.com/file/readme.html</p>"#;
        // The /file/ match lacks a marker, so the dlink field wins.
        assert_eq!(
            run(&PatternScan, html).as_deref(),
            Some("https://d.terabox.com/sharedl/x?a=1&b=2")
        );
    }

    #[test]
    fn test_pattern_scan_direct_file_first() {
        let html = r#"downloadUrl = "https://cdn.example/download/late";
            <a>https://d.terabox.com/file/early</a>"#;
        assert_eq!(
            run(&PatternScan, html).as_deref(),
            Some("https://d.terabox.com/file/early")
        );
    }

    #[test]
    fn test_inline_script_scan_skips_external_scripts() {
        let html = r#"<script src="https://static.example/download.js"></script>
            <script>var cfg = {cdn: "https://static.example/app.js", f: 'https://x.baidupcs.com/v?id=9'};</script>"#;
        assert_eq!(
            run(&InlineScriptScan, html).as_deref(),
            Some("https://x.baidupcs.com/v?id=9")
        );
    }

    #[test]
    fn test_markup_scan_document_order() {
        let html = r#"<a href="/download/relative">rel</a>
            <iframe src="https://player.example/embed"></iframe>
            <source src="https://d.terabox.com/stream/1.mp4">
            <a href="https://mirror.example/download/2">mirror</a>"#;
        assert_eq!(
            run(&MarkupScan, html).as_deref(),
            Some("https://d.terabox.com/stream/1.mp4")
        );
    }

    #[test]
    fn test_chain_prefers_embedded_state() {
        let extractor = StaticExtractor::new(reqwest::Client::new());
        let html = r#"<script>window.data = {"fileUrl":"https://d.terabox.com/file/state"};</script>
            <a href="https://d.terabox.com/file/anchor">go</a>"#;
        assert_eq!(
            extractor.candidate_from_html(html, &markers()).as_deref(),
            Some("https://d.terabox.com/file/state")
        );
    }

    #[test]
    fn test_chain_nothing_found() {
        let extractor = StaticExtractor::new(reqwest::Client::new());
        let html = r#"<html><a href="https://www.terabox.com/login">Log in</a>
            <script>var home = "https://www.terabox.com/";</script></html>"#;
        assert!(extractor.candidate_from_html(html, &markers()).is_none());
    }

    #[tokio::test]
    async fn test_find_candidate_evaluates_js_state_off_runtime() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/s/1js")
            .with_status(200)
            .with_body("<script>window.jsData = {file: {downloadUrl: 'https://d.terabox.com/file/js2',},};</script>")
            .create_async()
            .await;

        let extractor = StaticExtractor::new(reqwest::Client::new());
        let req = ResolveRequest::new(&format!("{}/s/1js", server.url()), None, None, 10, true).unwrap();
        assert_eq!(
            extractor.find_candidate(&req, &markers()).await.as_deref(),
            Some("https://d.terabox.com/file/js2")
        );
    }

    #[tokio::test]
    async fn test_find_candidate_page_error_is_none() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/s/gone").with_status(404).create_async().await;

        let extractor = StaticExtractor::new(reqwest::Client::new());
        let req = ResolveRequest::new(&format!("{}/s/gone", server.url()), None, None, 10, true).unwrap();
        assert!(extractor.find_candidate(&req, &markers()).await.is_none());
    }
}
