use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

use crate::adapters::PostgresStore;
use crate::config::{AppConfig, ValidatorConfig};
use crate::coordination::{LockCoordinator, LockName};
use crate::domain::{Decision, Indicators, MarketConditions};
use crate::error::Result;
use crate::services::{CycleMetrics, IdempotencySweeper};
use crate::strategy::IdempotencyGuard;
use crate::validation::{generate_report, DecisionValidator};

#[derive(Parser)]
#[command(name = "cycleguard")]
#[command(version)]
#[command(about = "Operator tools for the exactly-once trading cycle runner", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and per-environment overrides
    #[arg(short, long, default_value = "config")]
    pub config_dir: String,

    /// Database URL, used when no config file provides one
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Delete expired idempotency keys
    Sweep {
        /// Keep sweeping on the configured interval until interrupted
        #[arg(long)]
        watch: bool,
    },
    /// Show which cycle locks are currently held
    Locks,
    /// Database reachability, lock state and key table size
    Status,
    /// Run the decision validator over a JSON document and print the report
    Validate {
        /// File with {"decision", "indicators", "market_conditions"?}
        #[arg(short, long)]
        file: String,
    },
}

impl Commands {
    /// Whether the command needs the database
    pub fn needs_database(&self) -> bool {
        !matches!(self, Commands::Validate { .. })
    }
}

impl Cli {
    /// Layered config, with `--database-url` filling in a missing `database.url`
    pub fn load_config(&self) -> anyhow::Result<AppConfig> {
        AppConfig::load_with(&self.config_dir, self.database_url.as_deref())
            .with_context(|| format!("failed to load configuration from {}", self.config_dir))
    }
}

/// Input document for `cycleguard validate`
#[derive(Debug, Deserialize)]
pub struct ValidationRequest {
    pub decision: Decision,
    #[serde(default)]
    pub indicators: Indicators,
    #[serde(default)]
    pub market_conditions: Option<MarketConditions>,
}

/// Validate one request and render the audit report plus the final decision
pub fn validate_request(request: &ValidationRequest, config: &ValidatorConfig) -> Result<String> {
    let validator = DecisionValidator::new(config.clone());
    let result = validator.validate(
        &request.decision,
        &request.indicators,
        request.market_conditions.as_ref(),
    );
    let final_decision = validator.apply(&request.decision, &result);

    Ok(format!(
        "{}\n\n{}",
        generate_report(&result, &request.decision, &request.indicators),
        serde_json::to_string_pretty(&final_decision)?
    ))
}

pub fn validate_file(path: &Path, config: &ValidatorConfig) -> anyhow::Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let request: ValidationRequest = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a validation request", path.display()))?;
    Ok(validate_request(&request, config)?)
}

pub async fn run_migrations(store: &PostgresStore) -> anyhow::Result<()> {
    store.migrate().await.context("migration failed")?;
    println!("Migrations applied");
    Ok(())
}

pub async fn sweep_once(sweeper: &IdempotencySweeper) -> anyhow::Result<()> {
    let removed = sweeper.sweep_once().await.context("sweep failed")?;
    println!("Removed {} expired idempotency keys", removed);
    Ok(())
}

pub async fn show_locks(locks: &LockCoordinator) -> anyhow::Result<()> {
    println!("{:<22} {:>6}  STATE", "LOCK", "ID");
    for name in LockName::ALL {
        let held = locks
            .is_locked(name)
            .await
            .with_context(|| format!("cannot read state of lock {}", name))?;
        let state = if held { "held" } else { "free" };
        println!("{:<22} {:>6}  {}", name.as_str(), name.id(), state);
    }
    Ok(())
}

pub async fn show_status(store: &PostgresStore, locks: &LockCoordinator) -> anyhow::Result<()> {
    store.ping().await.context("database unreachable")?;
    println!("Database: ok");

    let (live, expired) = store
        .idempotency_key_counts()
        .await
        .context("cannot count idempotency keys")?;
    println!("Idempotency keys: {} live, {} awaiting sweep", live, expired);
    println!();
    show_locks(locks).await
}

/// Build the sweeper over the Postgres key table
pub fn postgres_sweeper(store: &PostgresStore, config: &AppConfig) -> IdempotencySweeper {
    IdempotencySweeper::new(
        Arc::new(IdempotencyGuard::postgres(store.clone())),
        Arc::new(CycleMetrics::new()),
        &config.sweeper,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_request_reports_override() {
        let request: ValidationRequest = serde_json::from_str(
            r#"{
                "decision": {"action": "buy", "confidence": "high", "reason": "breakout"},
                "indicators": {"rsi": 82.0, "atr_percent": 2.0},
                "market_conditions": {"market_correlation": {"market_risk": "low"}}
            }"#,
        )
        .unwrap();

        let out = validate_request(&request, &ValidatorConfig::default()).unwrap();
        assert!(out.contains("HOLD"));
        assert!(out.contains("\"original_action\": \"buy\""));
    }

    #[test]
    fn test_validate_file_names_unreadable_path() {
        let err = validate_file(Path::new("/nonexistent/req.json"), &ValidatorConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("cannot read /nonexistent/req.json"));
    }

    #[test]
    fn test_load_config_surfaces_malformed_file_despite_database_url() {
        let dir = std::env::temp_dir().join(format!("cycleguard-cli-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("default.toml"), "[cycle\nticker = ").unwrap();

        let cli = Cli::try_parse_from([
            "cycleguard",
            "--config-dir",
            dir.to_str().unwrap(),
            "--database-url",
            "postgres://localhost/cycleguard",
            "sweep",
        ])
        .unwrap();

        assert!(cli.load_config().is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_cli_parses_validate() {
        let cli = Cli::try_parse_from(["cycleguard", "validate", "--file", "req.json"]).unwrap();
        assert!(!cli.command.needs_database());
        match cli.command {
            Commands::Validate { file } => assert_eq!(file, "req.json"),
            _ => panic!("expected validate"),
        }
    }
}
