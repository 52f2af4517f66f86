//! Process configuration: command-line arguments with environment fallbacks.

use crate::renderer::chromium::{EngineConfig, DEFAULT_USER_AGENT};
use crate::resources::cache::DEFAULT_TTL;
use crate::resources::filter::{DEFAULT_CACHED_EXTENSIONS, DEFAULT_SKIP_LIST};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Port used when neither the argument nor `PORT` is given.
pub const DEFAULT_PORT: u16 = 80;

/// Default upper bound for one render.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "prerender",
    about = "Prerender: renders JavaScript pages in headless Chromium and serves the HTML",
    version
)]
pub struct Cli {
    /// Port to listen on (overrides --port / PORT)
    #[arg(value_name = "PORT")]
    pub port_arg: Option<u16>,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "PRERENDER_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Shared secret callers must send in the Api-Key header
    #[arg(long, env = "PrerenderApiKey", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Maximum seconds to wait for a page to load and settle
    #[arg(long, env = "PRERENDER_WAIT_SECS", default_value_t = DEFAULT_MAX_WAIT.as_secs())]
    pub wait_secs: u64,

    /// User agent sent by the browser
    #[arg(long, env = "PRERENDER_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Seconds a cached sub-resource decision stays valid
    #[arg(long, env = "PRERENDER_CACHE_TTL_SECS", default_value_t = DEFAULT_TTL.as_secs())]
    pub cache_ttl_secs: u64,

    /// Sub-resource extensions whose decisions are cached
    #[arg(long = "cache-ext", value_delimiter = ',', default_values_t = DEFAULT_CACHED_EXTENSIONS.iter().map(|s| s.to_string()))]
    pub cache_extensions: Vec<String>,

    /// URL substrings of sub-resources that are never loaded
    #[arg(long = "skip", value_delimiter = ',', default_values_t = DEFAULT_SKIP_LIST.iter().map(|s| s.to_string()))]
    pub skip: Vec<String>,

    /// Path to the Chromium executable (searched for when omitted)
    #[arg(long, env = "PRERENDER_CHROMIUM_PATH")]
    pub chromium_path: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Log browser engine diagnostics at warn level
    #[arg(long)]
    pub verbose_engine: bool,
}

/// Resolved server settings.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub max_wait: Duration,
    pub user_agent: String,
    pub cache_ttl: Duration,
    pub cache_extensions: Vec<String>,
    pub skip_list: Vec<String>,
    pub chromium_path: Option<PathBuf>,
    pub log_format: LogFormat,
    pub verbose_engine: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            api_key: None,
            max_wait: DEFAULT_MAX_WAIT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cache_ttl: DEFAULT_TTL,
            cache_extensions: DEFAULT_CACHED_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            skip_list: DEFAULT_SKIP_LIST.iter().map(|s| s.to_string()).collect(),
            chromium_path: None,
            log_format: LogFormat::Text,
            verbose_engine: false,
        }
    }
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        let port = cli.port_arg.unwrap_or(cli.port);
        Self {
            listen: SocketAddr::new(cli.bind, port),
            api_key: cli.api_key.filter(|k| !k.is_empty()),
            max_wait: Duration::from_secs(cli.wait_secs),
            user_agent: cli.user_agent,
            cache_ttl: Duration::from_secs(cli.cache_ttl_secs),
            cache_extensions: cli.cache_extensions,
            skip_list: cli.skip,
            chromium_path: cli.chromium_path,
            log_format: cli.log_format,
            verbose_engine: cli.verbose_engine,
        }
    }
}

impl ServerConfig {
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            chromium_path: self.chromium_path.clone(),
            user_agent: self.user_agent.clone(),
            verbose: self.verbose_engine,
        }
    }
}
