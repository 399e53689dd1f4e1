pub mod cli;
pub mod config;
pub mod core;
pub mod extractors;
pub mod server;
pub mod utils;

pub use config::Config;
pub use core::{ProxyRequest, ResolveError, ResolveRequest, ResolvedFile, Resolver, StreamingProxy};
pub use server::{router, AppState};
