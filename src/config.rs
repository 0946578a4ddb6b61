use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::str::FromStr;
use thiserror::Error;

use crate::contribution::types::WalletType;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    #[serde(default)]
    pub environment: Environment,
    /// PostgreSQL connection URL for the contribution store
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub worker: WorkerSettings,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" | "dev" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(ConfigError::Invalid(format!("unknown environment: {}", other))),
        }
    }
}

/// Contribution engine settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EngineConfig {
    /// Deterministic 1 s queue delay instead of a random one
    pub testing: bool,
    /// When off, the monthly reconcile only moves its stamp forward
    #[serde(default = "default_rewards_enabled")]
    pub rewards_enabled: bool,
    pub queue_delay_mean_secs: u64,
    /// Mean of the random delay used when a computed timer delay is zero
    pub timer_fallback_mean_secs: u64,
    pub reconcile_interval_days: u32,
    /// Monthly auto-contribute budget
    pub auto_contribute_amount: Decimal,
    pub processor_chain: Vec<WalletType>,
    /// Overrides the per-environment SKU settings
    #[serde(default)]
    pub sku: Option<SkuConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            testing: false,
            rewards_enabled: true,
            queue_delay_mean_secs: 15,
            timer_fallback_mean_secs: 45,
            reconcile_interval_days: 30,
            auto_contribute_amount: Decimal::from(20),
            processor_chain: vec![
                WalletType::UnblindedTokens,
                WalletType::AnonymousCard,
                WalletType::CustodialWallet,
            ],
            sku: None,
        }
    }
}

fn default_rewards_enabled() -> bool {
    true
}

impl EngineConfig {
    pub fn sku_config(&self, environment: Environment) -> SkuConfig {
        self.sku
            .clone()
            .unwrap_or_else(|| SkuConfig::for_environment(environment))
    }
}

/// SKU identifiers and settlement destinations
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SkuConfig {
    /// SKU bought for auto-contribute
    pub ac_sku: String,
    /// SKU bought for tips funded by the user
    pub user_funds_sku: String,
    pub anon_card_destination: String,
    pub ac_destination: String,
    /// Settlement account for tips paid from the custodial wallet
    pub custodial_destination: String,
    /// Price of one vote
    pub vote_price: Decimal,
}

impl SkuConfig {
    pub fn for_environment(environment: Environment) -> Self {
        let (prefix, suffix) = match environment {
            Environment::Development => ("dev", "dev"),
            Environment::Staging => ("staging", "staging"),
            Environment::Production => ("prod", "prod"),
        };

        Self {
            ac_sku: format!("{}-auto-contribute-vote", prefix),
            user_funds_sku: format!("{}-user-wallet-vote", prefix),
            anon_card_destination: format!("anon-card-settlement-{}", suffix),
            ac_destination: format!("auto-contribute-settlement-{}", suffix),
            custodial_destination: format!("custodial-settlement-{}", suffix),
            vote_price: Decimal::new(25, 2),
        }
    }
}

/// Recovery worker settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkerSettings {
    pub scan_interval_secs: u64,
    pub batch_size: usize,
    /// Warn when a contribution has been retried more often than this
    pub retry_warn_threshold: i32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: 60,
            batch_size: 50,
            retry_warn_threshold: 10,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.processor_chain.is_empty() {
            return Err(ConfigError::Invalid("processor_chain is empty".to_string()));
        }
        if self.engine.sku_config(self.environment).vote_price <= Decimal::ZERO {
            return Err(ConfigError::Invalid("vote_price must be positive".to_string()));
        }
        Ok(())
    }
}
