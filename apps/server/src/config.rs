//! Application configuration.

use sentinel_alerts::{EmailConfig, EngineConfig, TierLimits};
use sentinel_feeds::RestConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Engine tuning.
    pub engine: EngineSettings,
    /// Email relay.
    pub email: EmailSettings,
    /// Market data API.
    pub market_data: MarketDataSettings,
    /// SQLite database URL.
    pub database_url: String,
    /// Symbols seeded in simulation mode.
    pub simulated_symbols: Vec<SimulatedSymbol>,
}

impl AppConfig {
    /// Load from a JSON file; defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(path)?)?
        } else {
            Self::default()
        };
        if config.database_url.is_empty() {
            config.database_url = default_database_url();
        }
        if config.simulated_symbols.is_empty() {
            config.simulated_symbols = SimulatedSymbol::defaults();
        }
        Ok(config)
    }

    /// Overlay secrets and endpoints from the environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("EMAIL_RELAY_URL") {
            self.email.relay_url = url;
        }
        if let Some(token) = var("EMAIL_RELAY_TOKEN") {
            self.email.api_token = Some(token);
        }
        if let Some(url) = var("MARKET_DATA_URL") {
            self.market_data.base_url = url;
        }
        if let Some(key) = var("MARKET_DATA_API_KEY") {
            self.market_data.api_key = Some(key);
        }
        if let Some(url) = var("DATABASE_URL") {
            self.database_url = url;
        }
    }
}

fn default_database_url() -> String {
    "sqlite://sentinel.db".to_string()
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub max_concurrent_fetches: usize,
    pub max_concurrent_dispatches: usize,
    pub max_cycle_duration_secs: u64,
    pub delivery_timeout_ms: u64,
    pub retry_delay_ms: u64,
    /// Daily ceilings; `null` means unlimited.
    pub tier_limits: TierLimits,
    /// Minimum spacing for `always` rules, in seconds.
    pub always_min_interval_secs: Option<u64>,
    pub history_retention_days: i64,
    /// How often history cleanup runs.
    pub cleanup_interval_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            max_concurrent_fetches: engine.max_concurrent_fetches,
            max_concurrent_dispatches: engine.max_concurrent_dispatches,
            max_cycle_duration_secs: engine.max_cycle_duration.as_secs(),
            delivery_timeout_ms: engine.delivery_timeout.as_millis() as u64,
            retry_delay_ms: engine.retry_delay.as_millis() as u64,
            tier_limits: engine.tier_limits,
            always_min_interval_secs: None,
            history_retention_days: engine.history_retention_days,
            cleanup_interval_secs: 3600,
        }
    }
}

impl From<&EngineSettings> for EngineConfig {
    fn from(settings: &EngineSettings) -> Self {
        EngineConfig {
            max_concurrent_fetches: settings.max_concurrent_fetches,
            max_concurrent_dispatches: settings.max_concurrent_dispatches,
            max_cycle_duration: Duration::from_secs(settings.max_cycle_duration_secs),
            delivery_timeout: Duration::from_millis(settings.delivery_timeout_ms),
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            tier_limits: settings.tier_limits,
            always_min_interval: settings.always_min_interval_secs.map(Duration::from_secs),
            history_retention_days: settings.history_retention_days,
        }
    }
}

/// Email relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailSettings {
    pub enabled: bool,
    pub relay_url: String,
    /// Read from `EMAIL_RELAY_TOKEN`, never written back.
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub from_email: String,
    pub from_name: String,
    pub frontend_url: String,
    pub timeout_ms: u64,
}

impl Default for EmailSettings {
    fn default() -> Self {
        let email = EmailConfig::default();
        Self {
            enabled: true,
            relay_url: email.relay_url,
            api_token: None,
            from_email: email.from_email,
            from_name: email.from_name,
            frontend_url: email.frontend_url,
            timeout_ms: email.timeout_ms,
        }
    }
}

impl From<&EmailSettings> for EmailConfig {
    fn from(settings: &EmailSettings) -> Self {
        EmailConfig {
            relay_url: settings.relay_url.clone(),
            api_token: settings.api_token.clone(),
            from_email: settings.from_email.clone(),
            from_name: settings.from_name.clone(),
            frontend_url: settings.frontend_url.clone(),
            timeout_ms: settings.timeout_ms,
        }
    }
}

/// Market data API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketDataSettings {
    pub base_url: String,
    /// Read from `MARKET_DATA_API_KEY`, never written back.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

impl Default for MarketDataSettings {
    fn default() -> Self {
        let rest = RestConfig::default();
        Self {
            base_url: rest.base_url,
            api_key: None,
            timeout_ms: rest.timeout_ms,
        }
    }
}

impl From<&MarketDataSettings> for RestConfig {
    fn from(settings: &MarketDataSettings) -> Self {
        RestConfig {
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone().unwrap_or_default(),
            timeout_ms: settings.timeout_ms,
        }
    }
}

/// A symbol seeded into the simulated market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedSymbol {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
}

impl SimulatedSymbol {
    fn new(symbol: &str, price: f64, volume: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            price,
            volume,
        }
    }

    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("AAPL", 190.0, 55_000_000.0),
            Self::new("MSFT", 410.0, 22_000_000.0),
            Self::new("NVDA", 880.0, 45_000_000.0),
            Self::new("TSLA", 175.0, 95_000_000.0),
        ]
    }
}
