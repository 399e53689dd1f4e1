pub mod extractor;
pub mod metadata;
pub mod prober;
pub mod proxy;
pub mod resolver;

pub use extractor::{BrowserFallback, SharePage, Strategy, StrategyChain};
pub use metadata::{FileMetadata, ProxyRequest, ResolveRequest, ResolvedFile};
pub use prober::MetadataProber;
pub use proxy::{ProxyError, ProxyResponse, StreamingProxy};
pub use resolver::{ResolveError, Resolver};
