//! Core market data types used across the trading system

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::time::{Interval, Timestamp};

/// Lowercased asset ticker, e.g. `"eth"`.
pub type Asset = String;

/// Trading pair in canonical `base-quote` form, e.g. `"eth-btc"`.
///
/// Symbols are cloned on nearly every hop between components; `Arc<str>`
/// keeps those clones allocation-free.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        let s = s.as_ref();
        debug_assert!(s.contains('-'), "symbol {s:?} missing base-quote separator");
        Symbol(Arc::from(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn base_asset(&self) -> &str {
        self.0.split_once('-').map(|(base, _)| base).unwrap_or(&self.0)
    }

    pub fn quote_asset(&self) -> &str {
        self.0.split_once('-').map(|(_, quote)| quote).unwrap_or("")
    }

    pub fn assets(&self) -> (&str, &str) {
        (self.base_asset(), self.quote_asset())
    }

    pub fn swap(&self) -> Symbol {
        let (base, quote) = self.assets();
        Symbol::new(format!("{quote}-{base}"))
    }

    /// All assets mentioned by the given symbols, with repetition.
    pub fn iter_assets(symbols: &[Symbol]) -> impl Iterator<Item = &str> {
        symbols.iter().flat_map(|s| [s.base_asset(), s.quote_asset()])
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

/// Venue sub-account funds live on and orders are placed against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Account {
    Spot,
    Margin,
    /// Isolated margin account, one per symbol.
    Isolated(Symbol),
}

impl Account {
    pub fn is_margin(&self) -> bool {
        !matches!(self, Account::Spot)
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Account::Spot => write!(f, "spot"),
            Account::Margin => write!(f, "margin"),
            Account::Isolated(symbol) => write!(f, "{symbol}"),
        }
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Where trading decisions take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    /// Historical candles, simulated fills, no external side effects.
    #[default]
    Backtest,
    /// Real market data, simulated fills.
    Paper,
    /// Real money.
    Live,
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Backtest => write!(f, "backtest"),
            TradingMode::Paper => write!(f, "paper"),
            TradingMode::Live => write!(f, "live"),
        }
    }
}

/// Which variant of candle a feed carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandleType {
    #[default]
    Regular,
    /// Smoothed candles derived from the regular ones.
    HeikinAshi,
}

/// OHLCV candlestick; `time` is the interval start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub time: Timestamp,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub closed: bool,
}

/// Historical or streamed trade tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub time: Timestamp,
    pub price: Decimal,
    pub size: Decimal,
}

/// 24h rolling ticker stats used for symbol ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub price: Decimal,
}

/// Fee rates as fractions, e.g. `0.001` for 0.1%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Fees {
    pub maker: Decimal,
    pub taker: Decimal,
}

/// How elapsed borrow time converts into charged interest ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterestCharge {
    /// A started interval is charged in full (Binance-style).
    #[default]
    Ceil,
    /// Only fully elapsed intervals are charged.
    Floor,
}

/// Margin lending terms for an asset on an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowInfo {
    /// Maximum borrowable amount regardless of collateral.
    pub limit: Decimal,
    /// How often interest ticks, in milliseconds.
    pub interest_interval: Interval,
    /// Interest rate charged per tick.
    pub interest_rate: Decimal,
    #[serde(default)]
    pub interest_charge: InterestCharge,
}

/// Account balance of a single asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub available: Decimal,
    pub hold: Decimal,
    pub borrowed: Decimal,
    pub interest: Decimal,
}

impl Balance {
    /// Outstanding debt to be repaid.
    pub fn repay(&self) -> Decimal {
        self.borrowed + self.interest
    }

    /// Whether the balance is non-dust at the asset's precision.
    pub fn significant(&self, precision: u32) -> bool {
        crate::math::round_down(self.available + self.hold, precision) > Decimal::ZERO
    }
}

/// Per-asset precision info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetInfo {
    /// Number of significant fractional digits.
    pub precision: u32,
}

impl Default for AssetInfo {
    fn default() -> Self {
        AssetInfo { precision: 8 }
    }
}

/// Map keyed per symbol/asset with a `__all__` wildcard fallback.
pub type KeyedBy<T> = HashMap<String, T>;

pub(crate) fn keyed<'a, T>(map: &'a KeyedBy<T>, key: &str) -> Option<&'a T> {
    map.get(key).or_else(|| map.get("__all__"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_symbol_assets() {
        let symbol = Symbol::new("eth-btc");
        assert_eq!(symbol.base_asset(), "eth");
        assert_eq!(symbol.quote_asset(), "btc");
        assert_eq!(symbol.assets(), ("eth", "btc"));
        assert_eq!(symbol.swap().as_str(), "btc-eth");
    }

    #[test]
    fn test_symbol_iter_assets() {
        let symbols = [Symbol::new("eth-btc"), Symbol::new("ltc-btc")];
        let assets: Vec<_> = Symbol::iter_assets(&symbols).collect();
        assert_eq!(assets, ["eth", "btc", "ltc", "btc"]);
    }

    #[test]
    fn test_balance_significant() {
        let balance = Balance {
            available: dec!(0.000000004),
            hold: Decimal::ZERO,
            ..Default::default()
        };
        assert!(!balance.significant(8));
        assert!(Balance { available: dec!(0.5), ..Default::default() }.significant(8));
    }

    #[test]
    fn test_account_display() {
        assert_eq!(Account::Spot.to_string(), "spot");
        assert_eq!(Account::Isolated(Symbol::new("eth-btc")).to_string(), "eth-btc");
    }
}
