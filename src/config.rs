//! Configuration management
//!
//! Loads the application config from JSON, with API credentials picked up
//! from the environment so they never live in config files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::traders::{BasicConfig, MultiConfig};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    pub trader: TraderConfig,
}

impl Config {
    /// Loads configuration from a JSON file, overriding API credentials
    /// from `BINANCE_API_KEY` / `BINANCE_API_SECRET` when present.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        if let Ok(api_key) = std::env::var("BINANCE_API_KEY") {
            config.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("BINANCE_API_SECRET") {
            config.exchange.api_secret = Some(api_secret);
        }

        Ok(config)
    }
}

/// Exchange connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// `"binance"` or `"fake"`.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
}

/// State/candle persistence configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path; `None` keeps everything in memory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Which broker fills orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerConfig {
    #[default]
    Market,
    LimitLeading,
    LimitLeadingEdit,
    LimitMatching,
}

/// Which trader supervises the run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraderConfig {
    Basic(BasicConfig),
    Multi(MultiConfig),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::StrategyConfig;
    use serde_json::json;

    #[test]
    fn test_parse_multi_config() {
        let raw = json!({
            "exchange": {"name": "binance"},
            "broker": "limit_leading",
            "trader": {
                "type": "multi",
                "exchange": "binance",
                "interval": "1h",
                "end": 1_700_000_000_000u64,
                "strategy": {
                    "type": "ema_crossover",
                    "short_period": 13,
                    "long_period": 21,
                },
                "track_count": 3,
                "position_count": 2,
                "short": true,
                "mode": "paper",
                "custodian": "spot",
            },
        });
        let config: Config = serde_json::from_value(raw).unwrap();
        assert_eq!(config.broker, BrokerConfig::LimitLeading);
        let TraderConfig::Multi(multi) = config.trader else {
            panic!("expected multi trader");
        };
        assert_eq!(multi.interval, crate::time::HOUR_MS);
        assert_eq!(multi.track_count, 3);
        assert!(multi.long);
        assert!(multi.short);
        assert!(matches!(multi.strategy, StrategyConfig::EmaCrossover { .. }));
    }

    #[test]
    fn test_parse_basic_config_with_stop_loss() {
        let raw = json!({
            "exchange": {"name": "fake"},
            "trader": {
                "type": "basic",
                "exchange": "fake",
                "symbol": "eth-btc",
                "interval": "1d",
                "end": 1_700_000_000_000u64,
                "quote": "1.0",
                "strategy": {"type": "fixed", "advices": ["LONG"]},
                "stop_loss": {"type": "trailing", "up_threshold": "0.1"},
                "adjusted_start": "strategy",
            },
        });
        let config: Config = serde_json::from_value(raw).unwrap();
        let TraderConfig::Basic(basic) = config.trader else {
            panic!("expected basic trader");
        };
        assert_eq!(basic.interval, crate::time::DAY_MS);
        assert!(basic.stop_loss.is_some());
        assert_eq!(
            basic.adjusted_start,
            Some(crate::traders::AdjustedStart::Strategy)
        );
    }
}
