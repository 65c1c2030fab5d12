// ⚙️ Configuration - LEDGER_* environment variables over built-in defaults

use crate::error::{LedgerError, Result};
use crate::reconciliation::validate_threshold;
use ::config::{ConfigError, Environment, Map};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_DB_PATH: &str = "ledger.db";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.8;
pub const DEFAULT_AMOUNT_EPSILON: f64 = 0.01;
pub const DEFAULT_BASE_CURRENCY: &str = "PKR";
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub db_path: PathBuf,
    pub bind_addr: String,
    pub match_threshold: f64,
    pub amount_epsilon: f64,
    pub base_currency: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            amount_epsilon: DEFAULT_AMOUNT_EPSILON,
            base_currency: DEFAULT_BASE_CURRENCY.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl From<ConfigError> for LedgerError {
    fn from(err: ConfigError) -> Self {
        LedgerError::Config(err.to_string())
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Same as `from_env`, reading from `vars` instead of the process environment
    pub fn from_vars(vars: Map<String, String>) -> Result<Self> {
        Self::load(Some(vars))
    }

    fn load(vars: Option<Map<String, String>>) -> Result<Self> {
        // LOG_LEVEL is shared with the other services, so it carries no prefix
        let log_level = match &vars {
            Some(vars) => vars.get("LOG_LEVEL").cloned(),
            None => env::var("LOG_LEVEL").ok(),
        };

        let settings = ::config::Config::builder()
            .set_default("db_path", DEFAULT_DB_PATH)?
            .set_default("bind_addr", DEFAULT_BIND_ADDR)?
            .set_default("match_threshold", DEFAULT_MATCH_THRESHOLD)?
            .set_default("amount_epsilon", DEFAULT_AMOUNT_EPSILON)?
            .set_default("base_currency", DEFAULT_BASE_CURRENCY)?
            .set_default("log_level", DEFAULT_LOG_LEVEL)?
            .add_source(
                Environment::with_prefix("LEDGER")
                    .prefix_separator("_")
                    .try_parsing(true)
                    .source(vars),
            )
            .set_override_option("log_level", log_level)?
            .build()?;

        let mut config: Config = settings.try_deserialize()?;
        config.base_currency = config.base_currency.trim().to_ascii_uppercase();

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_threshold(self.match_threshold)?;

        if !self.amount_epsilon.is_finite() || self.amount_epsilon < 0.0 {
            return Err(LedgerError::Config(format!(
                "LEDGER_AMOUNT_EPSILON must be a non-negative number, got {}",
                self.amount_epsilon
            )));
        }
        if self.base_currency.len() != 3 || !self.base_currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(LedgerError::Config(format!(
                "LEDGER_BASE_CURRENCY must be a 3-letter code, got {:?}",
                self.base_currency
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Map<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_vars(vars(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.match_threshold, 0.8);
        assert_eq!(config.base_currency, "PKR");
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_vars(vars(&[
            ("LEDGER_DB_PATH", "/tmp/books.db"),
            ("LEDGER_MATCH_THRESHOLD", "0.6"),
            ("LEDGER_AMOUNT_EPSILON", "0.5"),
            ("LEDGER_BASE_CURRENCY", "usd"),
            ("LOG_LEVEL", "debug"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/books.db"));
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.amount_epsilon, 0.5);
        assert_eq!(config.base_currency, "USD");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
    }

    #[test]
    fn test_unrelated_variables_ignored() {
        let config = Config::from_vars(vars(&[("PATH", "/usr/bin"), ("LEDGER_UNUSED", "x")])).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_threshold_out_of_range() {
        let err = Config::from_vars(vars(&[("LEDGER_MATCH_THRESHOLD", "1.5")])).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidThreshold(t) if t == 1.5));
    }

    #[test]
    fn test_unparseable_values() {
        let err = Config::from_vars(vars(&[("LEDGER_MATCH_THRESHOLD", "high")])).unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));

        let err = Config::from_vars(vars(&[("LEDGER_AMOUNT_EPSILON", "-1")])).unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));

        let err = Config::from_vars(vars(&[("LEDGER_BASE_CURRENCY", "rupee")])).unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));
    }
}
