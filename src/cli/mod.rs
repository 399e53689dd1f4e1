use crate::config::Config;
use crate::core::{ResolveRequest, Resolver};
use crate::server;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "terabox-proxy")]
#[command(about = "Resolve share-page links to direct URLs and stream them with range support")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP service
    Serve {
        /// Address to listen on, overrides the config file
        #[arg(short, long)]
        bind: Option<String>,

        /// TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Never launch a headless browser
        #[arg(long)]
        no_browser: bool,
    },
    /// Resolve one share link and print the result as JSON
    Resolve {
        #[arg(value_name = "URL")]
        url: String,

        /// Cookie header to send with the page request
        #[arg(long)]
        cookie: Option<String>,

        /// Page fetch timeout in seconds (5-120)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Skip the headless browser fallback
        #[arg(long)]
        no_browser: bool,

        /// TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Serve {
                bind,
                config,
                no_browser,
            } => {
                let mut config = Config::load(config.as_deref())?;
                if let Some(bind) = bind {
                    config.bind = bind;
                }
                if no_browser {
                    config.browser.enabled = false;
                }
                server::serve(config).await
            }
            Command::Resolve {
                url,
                cookie,
                timeout,
                no_browser,
                config,
            } => {
                let config = Config::load(config.as_deref())?;
                let req = ResolveRequest::new(
                    &url,
                    cookie,
                    Some(config.user_agent.clone()),
                    timeout.unwrap_or(config.timeout_seconds),
                    !no_browser,
                )?
                .with_default_cookie(config.stored_cookie().await);

                let resolved = Resolver::from_config(&config)?.resolve(&req).await?;
                println!("{}", serde_json::to_string_pretty(&resolved)?);
                Ok(())
            }
        }
    }
}
