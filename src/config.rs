//! Configuration management for the pool coordinator
//!
//! Options come from the command line and environment (via clap) and may be
//! supplemented by a YAML, JSON or TOML file. A value given on the command line
//! or through the environment always wins over the file.

use crate::blk_handler::BlkHandlerOptions;
use crate::client::PoolClientOptions;
use crate::master::MasterOptions;
use crate::utils::{parse_compact_target, parse_duration};
use crate::{Error, Result};
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Which service this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Produce and serve work
    Master,
    /// Validate and redeem block shares
    BlkHandler,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::BlkHandler => write!(f, "blk-handler"),
        }
    }
}

/// Log output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Plain,
    Json,
    Pretty,
}

/// Complete configuration for either role
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "pool-coordinator",
    version = env!("CARGO_PKG_VERSION"),
    about = "Work distribution and share redemption for a proof-of-work mining pool"
)]
pub struct Config {
    /// Print the parsed configuration and exit
    #[arg(long)]
    #[serde(default)]
    pub print_config: bool,

    /// Configuration file (YAML, JSON or TOML)
    #[arg(long, value_name = "FILE", env = "POOL_CONFIG_FILE")]
    #[serde(default)]
    pub config_file: Option<PathBuf>,

    /// Service to run
    #[arg(long, value_enum, default_value = "master", env = "POOL_ROLE")]
    pub role: Role,

    /// Log filter, e.g. `info` or `pool_coordinator=debug`
    #[arg(short = 'l', long, default_value = "info", env = "POOL_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "plain")]
    pub log_format: LogFormat,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Address the HTTP server listens on
    #[arg(long, default_value = "0.0.0.0:8080", env = "POOL_BIND")]
    pub bind: SocketAddr,

    /// Directory where the master persists work and templates
    #[arg(long, default_value = "./pool-data", env = "POOL_WORKDIR")]
    pub workdir: PathBuf,

    /// Chain daemon JSON-RPC endpoint
    #[arg(long, env = "POOL_RPC_URL")]
    #[serde(default)]
    pub rpc_url: Option<Url>,

    /// Chain daemon RPC user
    #[arg(long, env = "POOL_RPC_USER")]
    #[serde(default)]
    pub rpc_user: Option<String>,

    /// Chain daemon RPC password
    #[arg(long, env = "POOL_RPC_PASSWORD", hide_env_values = true)]
    #[serde(default)]
    pub rpc_password: Option<String>,

    /// Secret from which per-height announcement signing keys are derived
    #[arg(long, env = "POOL_PRIVATE_SEED", hide_env_values = true)]
    #[serde(default)]
    pub private_seed: Option<String>,

    /// Share target in compact hex form
    #[arg(long, default_value = "2000ffff")]
    pub share_target: String,

    /// Announcement target in compact hex form
    #[arg(long, default_value = "207fffff")]
    pub ann_target: String,

    /// Public URL of the master; the master advertises it, handlers fetch work from it
    #[arg(long, env = "POOL_MASTER_URL")]
    #[serde(default)]
    pub master_url: Option<Url>,

    /// Announcement handler submit URLs
    #[arg(long, value_delimiter = ',')]
    #[serde(default)]
    pub submit_ann_urls: Vec<String>,

    /// Announcement download URLs
    #[arg(long, value_delimiter = ',')]
    #[serde(default)]
    pub download_ann_urls: Vec<String>,

    /// Block handler submit URLs
    #[arg(long, value_delimiter = ',')]
    #[serde(default)]
    pub submit_block_urls: Vec<String>,

    /// How long a request for the next height is held open
    #[arg(long, default_value = "30s")]
    pub longpoll_timeout: String,

    /// Delay before retrying a failed block template request
    #[arg(long, default_value = "10s")]
    pub template_retry: String,

    /// Shard served by this block handler
    #[arg(long, default_value = "0")]
    pub hash_num: u32,

    /// Number of block handler shards
    #[arg(long, default_value = "1")]
    pub hash_mod: u32,

    /// Largest accepted share submission, in bytes
    #[arg(long, default_value = "65536")]
    pub max_body_size: usize,

    /// Directory holding announcement content files
    #[arg(long, default_value = "./pool-data/anncontent", env = "POOL_CONTENT_DIR")]
    pub content_dir: PathBuf,

    /// Payout service base URL for share events
    #[arg(long, env = "POOL_PAYMAKER_URL")]
    #[serde(default)]
    pub paymaker_url: Option<Url>,

    /// Interval between config document polls
    #[arg(long, default_value = "5s")]
    pub config_poll_interval: String,

    /// Silence after which a handler considers the master gone
    #[arg(long, default_value = "15s")]
    pub disconnect_deadline: String,

    /// Heights of work kept below the current one; 0 keeps all
    #[arg(long, default_value = "20")]
    pub retain_heights: u32,
}

impl Config {
    /// Parse the process arguments, merge the config file and validate
    pub fn load() -> Result<Self> {
        let matches = Self::command().get_matches();
        Self::from_matches(&matches)
    }

    /// Same as [`Self::load`] for explicit arguments
    pub fn try_load_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Self::command()
            .try_get_matches_from(args)
            .map_err(|e| Error::config(e.to_string()))?;
        Self::from_matches(&matches)
    }

    fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config =
            Self::from_arg_matches(matches).map_err(|e| Error::config(e.to_string()))?;
        if let Some(path) = config.config_file.clone() {
            let file = Self::load_file(&path)?;
            config = config.merge_with_file(file, |id| {
                matches!(
                    matches.value_source(id),
                    Some(ValueSource::CommandLine) | Some(ValueSource::EnvVariable)
                )
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Read a config file into a loose key/value map
    fn load_file(path: &Path) -> Result<serde_json::Map<String, serde_json::Value>> {
        ::config::Config::builder()
            .add_source(::config::File::from(path))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::config(format!("Failed to load {}: {}", path.display(), e)))
    }

    /// Overlay file values on every option the user did not set explicitly
    fn merge_with_file(
        self,
        file: serde_json::Map<String, serde_json::Value>,
        explicit: impl Fn(&str) -> bool,
    ) -> Result<Self> {
        let mut merged = match serde_json::to_value(&self)? {
            serde_json::Value::Object(map) => map,
            _ => return Err(Error::config("configuration is not a map")),
        };
        for (key, value) in file {
            let key = key.replace('-', "_");
            if !merged.contains_key(&key) {
                return Err(Error::config(format!("Unknown configuration key {:?}", key)));
            }
            if !explicit(&key) {
                merged.insert(key, value);
            }
        }
        serde_json::from_value(serde_json::Value::Object(merged))
            .map_err(|e| Error::config(format!("Invalid configuration file value: {}", e)))
    }

    /// Reject inconsistent settings before anything starts
    pub fn validate(&self) -> Result<()> {
        EnvFilter::try_new(&self.log_level)
            .map_err(|e| Error::config(format!("Invalid log level: {}", e)))?;
        parse_compact_target(&self.share_target)?;
        parse_compact_target(&self.ann_target)?;
        parse_duration(&self.longpoll_timeout)?;
        parse_duration(&self.template_retry)?;
        parse_duration(&self.config_poll_interval)?;
        parse_duration(&self.disconnect_deadline)?;

        if self.private_seed.as_deref().map_or(true, str::is_empty) {
            return Err(Error::config("A private seed is required"));
        }
        if self.rpc_url.is_none() {
            return Err(Error::config("A chain daemon RPC URL is required"));
        }
        match self.role {
            Role::Master => {}
            Role::BlkHandler => {
                if self.master_url.is_none() {
                    return Err(Error::config("The block handler needs --master-url"));
                }
                if self.hash_mod == 0 || self.hash_num >= self.hash_mod {
                    return Err(Error::config(format!(
                        "hash_num ({}) must be below hash_mod ({})",
                        self.hash_num, self.hash_mod
                    )));
                }
                if self.max_body_size == 0 {
                    return Err(Error::config("max_body_size must be greater than 0"));
                }
            }
        }
        Ok(())
    }

    pub fn private_seed_bytes(&self) -> Vec<u8> {
        self.private_seed
            .as_deref()
            .unwrap_or_default()
            .as_bytes()
            .to_vec()
    }

    /// Copy with secrets masked, for printing
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        if out.private_seed.is_some() {
            out.private_seed = Some("<redacted>".to_string());
        }
        if out.rpc_password.is_some() {
            out.rpc_password = Some("<redacted>".to_string());
        }
        out
    }

    pub fn master_options(&self) -> Result<MasterOptions> {
        let mut opts = MasterOptions::new(
            self.private_seed_bytes(),
            parse_compact_target(&self.share_target)?,
            parse_compact_target(&self.ann_target)?,
        );
        opts.public_url = match &self.master_url {
            Some(url) => url.to_string(),
            None => format!("http://{}/", self.bind),
        };
        opts.submit_ann_urls = self.submit_ann_urls.clone();
        opts.download_ann_urls = self.download_ann_urls.clone();
        opts.submit_block_urls = self.submit_block_urls.clone();
        opts.longpoll_timeout = parse_duration(&self.longpoll_timeout)?;
        opts.template_retry = parse_duration(&self.template_retry)?;
        Ok(opts)
    }

    pub fn client_options(&self) -> Result<PoolClientOptions> {
        let url = self
            .master_url
            .clone()
            .ok_or_else(|| Error::config("master_url is not set"))?;
        let mut opts = PoolClientOptions::new(url);
        opts.poll_interval = parse_duration(&self.config_poll_interval)?;
        opts.disconnect_deadline = parse_duration(&self.disconnect_deadline)?;
        opts.retain_heights = self.retain_heights;
        opts.request_timeout =
            parse_duration(&self.longpoll_timeout)? + Duration::from_secs(30);
        Ok(opts)
    }

    pub fn blk_handler_options(&self) -> BlkHandlerOptions {
        let mut opts =
            BlkHandlerOptions::new(self.hash_num, self.hash_mod, self.private_seed_bytes());
        opts.max_body_size = self.max_body_size;
        opts.paymaker_url = self.paymaker_url.clone();
        opts
    }
}
