use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::domain::Timeframe;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool (each held lock pins one)
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct CycleConfig {
    /// Exchange symbol traded by the decision cycle (e.g., "KRW-BTC")
    #[serde(default = "default_ticker")]
    pub ticker: String,
    /// Candle granularity of the decision cycle
    #[serde(default = "default_timeframe")]
    pub timeframe: Timeframe,
    /// Candle granularity that bounds position-management runs
    #[serde(default = "default_position_timeframe")]
    pub position_timeframe: Timeframe,
    /// Idempotency scope for position management (it is not per-ticker)
    #[serde(default = "default_position_ticker")]
    pub position_ticker: String,
    /// Advisory lock timeout recorded for each cycle
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Wall-clock budget for one pipeline run
    #[serde(default = "default_pipeline_timeout_secs")]
    pub pipeline_timeout_secs: u64,
    /// Lifetime of a marked candle/action key
    #[serde(default = "default_idempotency_ttl_hours")]
    pub idempotency_ttl_hours: i64,
}

fn default_ticker() -> String {
    "KRW-BTC".to_string()
}

fn default_timeframe() -> Timeframe {
    Timeframe::H1
}

fn default_position_timeframe() -> Timeframe {
    Timeframe::M15
}

fn default_position_ticker() -> String {
    "portfolio".to_string()
}

fn default_lock_timeout_secs() -> u64 {
    600
}

fn default_pipeline_timeout_secs() -> u64 {
    600
}

fn default_idempotency_ttl_hours() -> i64 {
    24
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            ticker: default_ticker(),
            timeframe: default_timeframe(),
            position_timeframe: default_position_timeframe(),
            position_ticker: default_position_ticker(),
            lock_timeout_secs: default_lock_timeout_secs(),
            pipeline_timeout_secs: default_pipeline_timeout_secs(),
            idempotency_ttl_hours: default_idempotency_ttl_hours(),
        }
    }
}

/// Thresholds for the composite trend filter
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    /// Minimum ADX (trend strength) for a buy
    #[serde(default = "default_min_adx")]
    pub min_adx: f64,
    /// Minimum volume relative to its average for a buy
    #[serde(default = "default_min_volume_ratio")]
    pub min_volume_ratio: f64,
    /// Minimum Bollinger band width (% of price) for a buy
    #[serde(default = "default_min_bb_width_pct")]
    pub min_bb_width_pct: f64,
}

fn default_min_adx() -> f64 {
    20.0
}

fn default_min_volume_ratio() -> f64 {
    1.5
}

fn default_min_bb_width_pct() -> f64 {
    2.0
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_adx: default_min_adx(),
            min_volume_ratio: default_min_volume_ratio(),
            min_bb_width_pct: default_min_bb_width_pct(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    /// Seconds between expired-key sweeps
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

fn default_sweep_interval() -> u64 {
    3600
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rotating log files (console only when unset)
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        Self::load_with(config_dir, None)
    }

    /// Load configuration, using `database_url` only where no file or
    /// environment variable sets `database.url`
    pub fn load_with<P: AsRef<Path>>(
        config_dir: P,
        database_url: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("database.url", database_url.unwrap_or_default())?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("CYCLEGUARD_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (CYCLEGUARD_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("CYCLEGUARD")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Create a default configuration for CLI usage
    pub fn default_config(database_url: &str) -> Self {
        Self {
            database: DatabaseConfig {
                url: database_url.to_string(),
                max_connections: default_max_connections(),
            },
            cycle: CycleConfig::default(),
            validator: ValidatorConfig::default(),
            sweeper: SweeperConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.url.trim().is_empty() {
            errors.push("database.url must be set".to_string());
        }

        // One connection per held lock plus one for key queries.
        if self.database.max_connections < 3 {
            errors.push(format!(
                "database.max_connections must be at least 3, got {}",
                self.database.max_connections
            ));
        }

        if self.cycle.ticker.trim().is_empty() {
            errors.push("cycle.ticker must be set".to_string());
        }

        if self.cycle.pipeline_timeout_secs == 0 {
            errors.push("cycle.pipeline_timeout_secs must be positive".to_string());
        }

        if self.cycle.idempotency_ttl_hours <= 0 {
            errors.push("cycle.idempotency_ttl_hours must be positive".to_string());
        }

        // A key that expires inside its own candle would let the candle run twice.
        let ttl_secs = self.cycle.idempotency_ttl_hours.saturating_mul(3600);
        if ttl_secs > 0 && ttl_secs < self.cycle.timeframe.seconds() {
            errors.push(format!(
                "cycle.idempotency_ttl_hours ({}h) is shorter than the {} candle",
                self.cycle.idempotency_ttl_hours, self.cycle.timeframe
            ));
        }

        for (name, value) in [
            ("validator.min_adx", self.validator.min_adx),
            ("validator.min_volume_ratio", self.validator.min_volume_ratio),
            ("validator.min_bb_width_pct", self.validator.min_bb_width_pct),
        ] {
            if !value.is_finite() || value < 0.0 {
                errors.push(format!("{} must be a non-negative number, got {}", name, value));
            }
        }

        if self.sweeper.interval_secs == 0 {
            errors.push("sweeper.interval_secs must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
