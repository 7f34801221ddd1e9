use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

const CONFIG_FILE: &str = "tagstream.toml";

static HOME: OnceLock<PathBuf> = OnceLock::new();

/// `$TAGSTREAM_HOME`, falling back to `~/.tagstream`.
pub fn home_dir() -> &'static Path {
    HOME.get_or_init(|| {
        std::env::var_os("TAGSTREAM_HOME")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".tagstream")))
            .unwrap_or_else(|| PathBuf::from(".tagstream"))
    })
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    /// Sent in the hello frame as `hi,<app_name>`.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

fn default_address() -> String {
    "ws://localhost:11235/socket".to_string()
}

fn default_app_name() -> String {
    "tagstream".to_string()
}

fn default_source() -> String {
    "client".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            app_name: default_app_name(),
            source: default_source(),
            session_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReconnectConfig {
    #[serde(default = "default_delays_secs")]
    pub delays_secs: Vec<u64>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_hello_delay_ms")]
    pub hello_delay_ms: u64,
}

fn default_delays_secs() -> Vec<u64> {
    crate::connection::backoff::DEFAULT_DELAYS_SECS.to_vec()
}

fn default_max_attempts() -> u32 {
    crate::connection::backoff::DEFAULT_MAX_ATTEMPTS
}

fn default_hello_delay_ms() -> u64 {
    150
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delays_secs: default_delays_secs(),
            max_attempts: default_max_attempts(),
            hello_delay_ms: default_hello_delay_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn hello_delay(&self) -> Duration {
        Duration::from_millis(self.hello_delay_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_grace_delay_ms")]
    pub grace_delay_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    180
}

fn default_grace_delay_ms() -> u64 {
    500
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            grace_delay_ms: default_grace_delay_ms(),
        }
    }
}

impl StreamConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.grace_delay_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub directory: Option<String>,
    pub retention_days: Option<u64>,
}

impl LoggingConfig {
    /// The configured directory with `~/` expanded, or `<home>/logs`.
    pub fn log_dir(&self) -> PathBuf {
        match self.directory.as_deref() {
            Some(dir) => match (dir.strip_prefix("~/"), dirs::home_dir()) {
                (Some(rest), Some(home)) => home.join(rest),
                _ => PathBuf::from(dir),
            },
            None => home_dir().join("logs"),
        }
    }
}

impl Config {
    pub fn load_with_path() -> Result<(Self, Option<PathBuf>)> {
        let mut candidates = Vec::new();

        if let Ok(explicit) = std::env::var("TAGSTREAM_CONFIG") {
            candidates.push(PathBuf::from(explicit));
        }

        candidates.push(PathBuf::from(CONFIG_FILE));
        candidates.push(home_dir().join("config").join(CONFIG_FILE));

        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("tagstream").join(CONFIG_FILE));
        }

        for path in candidates {
            if path.exists() {
                let config = Self::load_from(&path)?;
                return Ok((config, Some(path)));
            }
        }

        Ok((Config::default(), None))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Config at {:?} is invalid: {}", path, e))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let address = url::Url::parse(self.server.address.trim())
            .map_err(|e| anyhow::anyhow!("Server address '{}' is invalid: {}", self.server.address, e))?;
        if !matches!(address.scheme(), "ws" | "wss") {
            anyhow::bail!(
                "Server address must start with ws:// or wss://, got: {}",
                self.server.address
            );
        }
        if self.reconnect.delays_secs.is_empty() {
            anyhow::bail!("reconnect.delays_secs must contain at least one delay");
        }
        if self.reconnect.max_attempts == 0 {
            anyhow::bail!("reconnect.max_attempts must be greater than 0");
        }
        if self.stream.tick_interval_ms == 0 {
            anyhow::bail!("stream.tick_interval_ms must be greater than 0");
        }
        Ok(())
    }

    /// The socket URL with the `source` / `sessid` query the backend expects.
    pub fn socket_url(&self) -> Result<String> {
        let mut url = url::Url::parse(self.server.address.trim())?;
        let has_source = url.query_pairs().any(|(k, _)| k == "source");
        if !has_source {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("source", &self.server.source);
            pairs.append_pair("sessid", self.server.session_id.as_deref().unwrap_or(""));
        }
        Ok(url.to_string())
    }
}
