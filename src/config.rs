use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::connection::DEFAULT_RECONNECT_BACKOFF;
use crate::protocol::ProtocolRevision;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Keeper endpoint, `ws://` or `wss://`.
    pub address: String,
    #[serde(default)]
    pub protocol: ProtocolRevision,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    /// How long `init` waits for the first SYNCED. Absent means forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl LoggingConfig {
    pub fn level_filter(&self) -> Option<log::LevelFilter> {
        self.level.parse().ok()
    }
}

fn default_reconnect_backoff_ms() -> u64 {
    DEFAULT_RECONNECT_BACKOFF.as_millis() as u64
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address: "ws://127.0.0.1:8080/".to_string(),
            protocol: ProtocolRevision::default(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            startup_timeout_seconds: None,
            logging: Some(LoggingConfig {
                level: "info".to_string(),
            }),
        }
    }
}

impl Config {
    /// Configuration as a host plugin receives it: only the keeper address.
    pub fn for_address(address: impl Into<String>) -> Self {
        Config {
            address: address.into(),
            logging: None,
            ..Default::default()
        }
    }

    pub fn default_path() -> &'static str {
        "/etc/policyd-client.toml"
    }

    /// Loads TOML, or YAML when the file ends in `.yaml`/`.yml`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path.display()))?;

        let config: Config = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Invalid YAML configuration: {}", path.display()))?
        } else {
            toml::from_str(&content)
                .with_context(|| format!("Invalid TOML configuration: {}", path.display()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            toml::to_string_pretty(self)?
        };
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write configuration file: {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.address)
            .with_context(|| format!("Invalid keeper address '{}'", self.address))?;
        match url.scheme() {
            "ws" | "wss" => {}
            scheme => bail!(
                "Keeper address '{}' must use ws:// or wss://, not {scheme}://",
                self.address
            ),
        }
        if self.reconnect_backoff_ms == 0 {
            bail!("reconnect_backoff_ms must be greater than zero");
        }
        if let Some(logging) = &self.logging {
            if logging.level_filter().is_none() {
                bail!("Unknown logging level '{}'", logging.level);
            }
        }
        Ok(())
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout_seconds.map(Duration::from_secs)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}
