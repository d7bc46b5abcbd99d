//! Take profit triggers
//!
//! Mirror image of the stop loss family: `upside_hit` realizes gains on
//! longs (price rose enough), `downside_hit` on shorts (price fell
//! enough).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::Candle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TakeProfitConfig {
    Noop,
    Basic {
        up_threshold: Decimal,
        #[serde(default)]
        down_threshold: Option<Decimal>,
    },
    /// Thresholds anchored to the running extreme instead of the entry
    /// close; locks in recoveries on mean-reverting markets.
    Trailing {
        up_threshold: Decimal,
        #[serde(default)]
        down_threshold: Option<Decimal>,
    },
    Legacy {
        threshold: Decimal,
    },
}

impl TakeProfitConfig {
    pub fn construct(&self) -> TakeProfit {
        match self {
            TakeProfitConfig::Noop => TakeProfit::Noop,
            TakeProfitConfig::Basic { up_threshold, down_threshold } => {
                let down = down_threshold.unwrap_or(*up_threshold);
                assert!(*up_threshold >= Decimal::ZERO);
                assert!(down >= Decimal::ZERO);
                TakeProfit::Basic(Basic {
                    up_threshold_factor: Decimal::ONE + up_threshold,
                    down_threshold_factor: Decimal::ONE - down,
                    close_at_position: Decimal::ZERO,
                    close: Decimal::ZERO,
                })
            }
            TakeProfitConfig::Trailing { up_threshold, down_threshold } => {
                let down = down_threshold.unwrap_or(*up_threshold);
                assert!(*up_threshold >= Decimal::ZERO);
                assert!(down >= Decimal::ZERO);
                TakeProfit::Trailing(Trailing {
                    up_threshold_factor: Decimal::ONE + up_threshold,
                    down_threshold_factor: Decimal::ONE - down,
                    highest_close_since_position: Decimal::ZERO,
                    lowest_close_since_position: Decimal::MAX,
                    close: Decimal::ZERO,
                })
            }
            TakeProfitConfig::Legacy { threshold } => {
                assert!(*threshold >= Decimal::ZERO);
                TakeProfit::Legacy(Legacy {
                    threshold: *threshold,
                    close_at_position: Decimal::ZERO,
                    close: Decimal::ZERO,
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TakeProfit {
    Noop,
    Basic(Basic),
    Trailing(Trailing),
    Legacy(Legacy),
}

impl TakeProfit {
    pub fn upside_hit(&self) -> bool {
        match self {
            TakeProfit::Noop => false,
            TakeProfit::Basic(s) => {
                s.close_at_position > Decimal::ZERO
                    && s.close >= s.close_at_position * s.up_threshold_factor
            }
            TakeProfit::Trailing(s) => {
                s.lowest_close_since_position < Decimal::MAX
                    && s.close >= s.lowest_close_since_position * s.up_threshold_factor
            }
            TakeProfit::Legacy(s) => {
                s.threshold > Decimal::ZERO
                    && s.close >= s.close_at_position * (Decimal::ONE + s.threshold)
            }
        }
    }

    pub fn downside_hit(&self) -> bool {
        match self {
            TakeProfit::Noop => false,
            TakeProfit::Basic(s) => {
                s.close_at_position > Decimal::ZERO
                    && s.close <= s.close_at_position * s.down_threshold_factor
            }
            TakeProfit::Trailing(s) => {
                s.highest_close_since_position > Decimal::ZERO
                    && s.close <= s.highest_close_since_position * s.down_threshold_factor
            }
            TakeProfit::Legacy(s) => {
                s.threshold > Decimal::ZERO
                    && s.close_at_position > Decimal::ZERO
                    && s.close <= s.close_at_position * (Decimal::ONE - s.threshold)
            }
        }
    }

    pub fn clear(&mut self, candle: &Candle) {
        match self {
            TakeProfit::Noop => {}
            TakeProfit::Basic(s) => s.close_at_position = candle.close,
            TakeProfit::Trailing(s) => {
                s.highest_close_since_position = candle.close;
                s.lowest_close_since_position = candle.close;
            }
            TakeProfit::Legacy(s) => s.close_at_position = candle.close,
        }
    }

    pub fn update(&mut self, candle: &Candle) {
        match self {
            TakeProfit::Noop => {}
            TakeProfit::Basic(s) => s.close = candle.close,
            TakeProfit::Trailing(s) => {
                s.close = candle.close;
                s.highest_close_since_position =
                    s.highest_close_since_position.max(candle.close);
                s.lowest_close_since_position =
                    s.lowest_close_since_position.min(candle.close);
            }
            TakeProfit::Legacy(s) => s.close = candle.close,
        }
    }
}

impl Default for TakeProfit {
    fn default() -> Self {
        TakeProfit::Noop
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Basic {
    up_threshold_factor: Decimal,
    down_threshold_factor: Decimal,
    close_at_position: Decimal,
    close: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trailing {
    up_threshold_factor: Decimal,
    down_threshold_factor: Decimal,
    highest_close_since_position: Decimal,
    lowest_close_since_position: Decimal,
    close: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Legacy {
    threshold: Decimal,
    close_at_position: Decimal,
    close: Decimal,
}
