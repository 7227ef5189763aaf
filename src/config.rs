use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::execution::ExecutorConfig;
use crate::sniper::SniperConfig;

/// Config file picked up from the working directory when present
pub const DEFAULT_CONFIG_FILE: &str = "snipebot.toml";
pub const ENV_PREFIX: &str = "SNIPEBOT";
pub const DEFAULT_LOG_FILTER: &str = "snipebot=info";

/// Exchange endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub recv_window_ms: u64,
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            base_url: crate::api::mexc::MEXC_API_BASE.to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            recv_window_ms: 5000,
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: crate::execution::DEFAULT_MONITOR_INTERVAL,
        }
    }
}

/// Process-wide settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Postgres URL. In-memory stores are used when unset.
    pub database_url: Option<String>,
    pub log_filter: Option<String>,
    pub exchange: ExchangeSettings,
    pub executor: ExecutorConfig,
    pub sniper: SniperConfig,
    pub monitor: MonitorSettings,
}

impl Settings {
    /// Load settings from an optional file, then `SNIPEBOT__*` environment
    /// variables (`SNIPEBOT__SNIPER__MAX_BUY_AMOUNT=50`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.executor
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid executor configuration: {}", e))?;
        self.sniper
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid sniper configuration: {}", e))?;
        if self.monitor.interval.is_zero() {
            anyhow::bail!("monitor interval must be positive");
        }
        Ok(())
    }

    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}

/// Serde adapter for durations written as whole milliseconds
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
