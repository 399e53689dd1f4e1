use crate::core::ResolveRequest;
use crate::utils::Markers;
use async_trait::async_trait;
use scraper::Html;

/// A fetched share page, parsed lazily for the strategies that need a DOM.
pub struct SharePage<'a> {
    html: &'a str,
    document: std::cell::OnceCell<Html>,
}

impl<'a> SharePage<'a> {
    pub fn new(html: &'a str) -> Self {
        Self {
            html,
            document: std::cell::OnceCell::new(),
        }
    }

    pub fn html(&self) -> &'a str {
        self.html
    }

    pub fn document(&self) -> &Html {
        self.document.get_or_init(|| Html::parse_document(self.html))
    }
}

/// One heuristic for digging a direct-download URL out of a share page.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn attempt(&self, page: &SharePage<'_>, markers: &Markers) -> Option<String>;
}

/// Escalation step used when no static strategy finds anything.
#[async_trait]
pub trait BrowserFallback: Send + Sync {
    async fn find_candidate(&self, req: &ResolveRequest, markers: &Markers) -> Option<String>;
}

/// Strategies in priority order; the first non-empty candidate wins.
pub struct StrategyChain {
    pub strategies: Vec<Box<dyn Strategy>>,
}

impl StrategyChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    pub fn register_strategy(&mut self, strategy: Box<dyn Strategy>) {
        self.strategies.push(strategy);
    }

    pub fn first_candidate(&self, page: &SharePage<'_>, markers: &Markers) -> Option<String> {
        for strategy in &self.strategies {
            if let Some(candidate) = strategy.attempt(page, markers).filter(|c| !c.is_empty()) {
                tracing::info!("Found URL with {}: {}", strategy.name(), candidate);
                return Some(candidate);
            }
            tracing::debug!("Strategy {} found nothing", strategy.name());
        }
        None
    }
}

impl Default for StrategyChain {
    fn default() -> Self {
        Self::new()
    }
}
