//! Stop loss triggers
//!
//! `upside_hit` guards long positions (price fell), `downside_hit` guards
//! shorts (price rose). `clear` re-anchors at position open; `update`
//! feeds the latest candle. Variants are a sum type picked by config.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::Candle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopLossConfig {
    Noop,
    Basic {
        up_threshold: Decimal,
        #[serde(default)]
        down_threshold: Option<Decimal>,
    },
    Trailing {
        up_threshold: Decimal,
        #[serde(default)]
        down_threshold: Option<Decimal>,
    },
    Legacy {
        threshold: Decimal,
        #[serde(default = "default_trail")]
        trail: bool,
    },
}

fn default_trail() -> bool {
    true
}

impl StopLossConfig {
    pub fn construct(&self) -> StopLoss {
        match self {
            StopLossConfig::Noop => StopLoss::Noop,
            StopLossConfig::Basic { up_threshold, down_threshold } => {
                let down = down_threshold.unwrap_or(*up_threshold);
                assert!((Decimal::ZERO..=Decimal::ONE).contains(up_threshold));
                assert!((Decimal::ZERO..=Decimal::ONE).contains(&down));
                StopLoss::Basic(Basic {
                    up_threshold_factor: Decimal::ONE - up_threshold,
                    down_threshold_factor: Decimal::ONE + down,
                    close_at_position: Decimal::ZERO,
                    close: Decimal::ZERO,
                })
            }
            StopLossConfig::Trailing { up_threshold, down_threshold } => {
                let down = down_threshold.unwrap_or(*up_threshold);
                assert!((Decimal::ZERO..=Decimal::ONE).contains(up_threshold));
                assert!((Decimal::ZERO..=Decimal::ONE).contains(&down));
                StopLoss::Trailing(Trailing {
                    up_threshold_factor: Decimal::ONE - up_threshold,
                    down_threshold_factor: Decimal::ONE + down,
                    highest_close_since_position: Decimal::ZERO,
                    lowest_close_since_position: Decimal::MAX,
                    close: Decimal::ZERO,
                })
            }
            StopLossConfig::Legacy { threshold, trail } => {
                assert!((Decimal::ZERO..Decimal::ONE).contains(threshold));
                StopLoss::Legacy(Legacy {
                    threshold: *threshold,
                    trail: *trail,
                    close_at_position: Decimal::ZERO,
                    highest_close_since_position: Decimal::ZERO,
                    lowest_close_since_position: Decimal::MAX,
                    close: Decimal::ZERO,
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopLoss {
    Noop,
    Basic(Basic),
    Trailing(Trailing),
    Legacy(Legacy),
}

impl StopLoss {
    pub fn upside_hit(&self) -> bool {
        match self {
            StopLoss::Noop => false,
            StopLoss::Basic(s) => s.close <= s.close_at_position * s.up_threshold_factor,
            StopLoss::Trailing(s) => {
                s.close <= s.highest_close_since_position * s.up_threshold_factor
            }
            StopLoss::Legacy(s) => {
                s.threshold > Decimal::ZERO
                    && s.close
                        <= s.reference_high() * (Decimal::ONE - s.threshold)
            }
        }
    }

    pub fn downside_hit(&self) -> bool {
        match self {
            StopLoss::Noop => false,
            StopLoss::Basic(s) => s.close >= s.close_at_position * s.down_threshold_factor,
            StopLoss::Trailing(s) => {
                s.lowest_close_since_position < Decimal::MAX
                    && s.close >= s.lowest_close_since_position * s.down_threshold_factor
            }
            StopLoss::Legacy(s) => {
                s.threshold > Decimal::ZERO
                    && s.reference_low() < Decimal::MAX
                    && s.close >= s.reference_low() * (Decimal::ONE + s.threshold)
            }
        }
    }

    /// Re-anchors thresholds at the position-opening candle.
    pub fn clear(&mut self, candle: &Candle) {
        match self {
            StopLoss::Noop => {}
            StopLoss::Basic(s) => s.close_at_position = candle.close,
            StopLoss::Trailing(s) => {
                s.highest_close_since_position = candle.close;
                s.lowest_close_since_position = candle.close;
            }
            StopLoss::Legacy(s) => {
                s.close_at_position = candle.close;
                s.highest_close_since_position = candle.close;
                s.lowest_close_since_position = candle.close;
            }
        }
    }

    pub fn update(&mut self, candle: &Candle) {
        match self {
            StopLoss::Noop => {}
            StopLoss::Basic(s) => s.close = candle.close,
            StopLoss::Trailing(s) => {
                s.close = candle.close;
                s.highest_close_since_position =
                    s.highest_close_since_position.max(candle.close);
                s.lowest_close_since_position =
                    s.lowest_close_since_position.min(candle.close);
            }
            StopLoss::Legacy(s) => {
                s.close = candle.close;
                s.highest_close_since_position =
                    s.highest_close_since_position.max(candle.close);
                s.lowest_close_since_position =
                    s.lowest_close_since_position.min(candle.close);
            }
        }
    }
}

impl Default for StopLoss {
    fn default() -> Self {
        StopLoss::Noop
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
    trail: bool,
    close_at_position: Decimal,
    highest_close_since_position: Decimal,
    lowest_close_since_position: Decimal,
    close: Decimal,
}

impl Legacy {
    fn reference_high(&self) -> Decimal {
        if self.trail {
            self.highest_close_since_position
        } else {
            self.close_at_position
        }
    }

    fn reference_low(&self) -> Decimal {
        if self.trail {
            self.lowest_close_since_position
        } else {
            self.close_at_position
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(close: Decimal) -> Candle {
        Candle {
            time: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            closed: true,
        }
    }

    #[test]
    fn test_basic_upside() {
        let mut stop = StopLossConfig::Basic {
            up_threshold: dec!(0.1),
            down_threshold: None,
        }
        .construct();
        stop.clear(&candle(dec!(100)));
        stop.update(&candle(dec!(95)));
        assert!(!stop.upside_hit());
        stop.update(&candle(dec!(90)));
        assert!(stop.upside_hit());
    }

    #[test]
    fn test_trailing_ratchets() {
        let mut stop = StopLossConfig::Trailing {
            up_threshold: dec!(0.1),
            down_threshold: None,
        }
        .construct();
        stop.clear(&candle(dec!(100)));
        stop.update(&candle(dec!(200)));
        assert!(!stop.upside_hit());
        // 10% below the 200 peak trips even though above entry.
        stop.update(&candle(dec!(179)));
        assert!(stop.upside_hit());
    }

    #[test]
    fn test_legacy_trail_flag() {
        let mut fixed = StopLossConfig::Legacy { threshold: dec!(0.1), trail: false }.construct();
        fixed.clear(&candle(dec!(100)));
        fixed.update(&candle(dec!(200)));
        fixed.update(&candle(dec!(179)));
        assert!(!fixed.upside_hit());

        let mut trailing =
            StopLossConfig::Legacy { threshold: dec!(0.1), trail: true }.construct();
        trailing.clear(&candle(dec!(100)));
        trailing.update(&candle(dec!(200)));
        trailing.update(&candle(dec!(179)));
        assert!(trailing.upside_hit());
    }

    #[test]
    fn test_noop_never_hits() {
        let mut stop = StopLossConfig::Noop.construct();
        stop.clear(&candle(dec!(100)));
        stop.update(&candle(dec!(1)));
        assert!(!stop.upside_hit());
        assert!(!stop.downside_hit());
    }
}
