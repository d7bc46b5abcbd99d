//! Strategy signals
//!
//! Strategies are sum types: each variant owns its state, and a serde
//! discriminator in the config picks the variant. The trading supervisors
//! only ever see the enum, never a concrete strategy.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::time::Interval;
use crate::types::{Candle, CandleType, Symbol};

/// Per-tick recommendation from a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Advice {
    #[default]
    None,
    Long,
    Short,
    Liquidate,
}

/// Strategy construction parameters, tagged by strategy name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Replays a scripted advice sequence. Useful for dry runs and tests.
    Fixed {
        advices: Vec<Advice>,
        #[serde(default)]
        maturity: u32,
    },
    /// Long when the fast EMA crosses above the slow one, short on the
    /// opposite cross.
    EmaCrossover {
        short_period: u32,
        long_period: u32,
        #[serde(default)]
        neutral_threshold: Decimal,
    },
}

impl StrategyConfig {
    pub fn construct(&self) -> Strategy {
        match self {
            StrategyConfig::Fixed { advices, maturity } => Strategy::Fixed(Fixed {
                advices: advices.clone(),
                maturity: *maturity,
                index: 0,
                updates: 0,
            }),
            StrategyConfig::EmaCrossover { short_period, long_period, neutral_threshold } => {
                assert!(short_period < long_period, "short period must be below long");
                Strategy::EmaCrossover(EmaCrossover {
                    short_period: *short_period,
                    long_period: *long_period,
                    neutral_threshold: *neutral_threshold,
                    short_ema: Ema::new(*short_period),
                    long_ema: Ema::new(*long_period),
                    updates: 0,
                })
            }
        }
    }
}

/// A live strategy instance; state serializes for trader resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Strategy {
    Fixed(Fixed),
    EmaCrossover(EmaCrossover),
}

impl Strategy {
    pub fn update(&mut self, candle: &Candle) -> Advice {
        match self {
            Strategy::Fixed(s) => s.update(candle),
            Strategy::EmaCrossover(s) => s.update(candle),
        }
    }

    /// Number of candles needed before the strategy gives advice.
    pub fn maturity(&self) -> u32 {
        match self {
            Strategy::Fixed(s) => s.maturity,
            Strategy::EmaCrossover(s) => s.long_period,
        }
    }

    pub fn mature(&self) -> bool {
        match self {
            Strategy::Fixed(s) => s.updates >= s.maturity,
            Strategy::EmaCrossover(s) => s.updates >= s.long_period,
        }
    }

    /// Additional candle feeds the strategy wants beside its own symbol's
    /// regular stream. None of the current strategies use any.
    pub fn extra_candles(&self) -> Vec<(Symbol, Interval, CandleType)> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixed {
    advices: Vec<Advice>,
    maturity: u32,
    index: usize,
    updates: u32,
}

impl Fixed {
    fn update(&mut self, _candle: &Candle) -> Advice {
        self.updates = self.updates.saturating_add(1);
        if self.updates <= self.maturity {
            return Advice::None;
        }
        let advice = self.advices.get(self.index).copied().unwrap_or(Advice::None);
        if self.index < self.advices.len() {
            self.index += 1;
        }
        advice
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Ema {
    period: u32,
    value: Option<Decimal>,
}

impl Ema {
    fn new(period: u32) -> Ema {
        Ema { period, value: None }
    }

    fn update(&mut self, price: Decimal) -> Decimal {
        let alpha = Decimal::TWO / (Decimal::from(self.period) + Decimal::ONE);
        let value = match self.value {
            Some(previous) => (price - previous) * alpha + previous,
            None => price,
        };
        self.value = Some(value);
        value
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaCrossover {
    short_period: u32,
    long_period: u32,
    neutral_threshold: Decimal,
    short_ema: Ema,
    long_ema: Ema,
    updates: u32,
}

impl EmaCrossover {
    fn update(&mut self, candle: &Candle) -> Advice {
        let short = self.short_ema.update(candle.close);
        let long = self.long_ema.update(candle.close);
        self.updates = self.updates.saturating_add(1);
        if self.updates < self.long_period {
            return Advice::None;
        }
        let divergence = short - long;
        if divergence > self.neutral_threshold {
            Advice::Long
        } else if divergence < -self.neutral_threshold {
            Advice::Short
        } else {
            Advice::None
        }
    }
}

/// Wraps a stream of advices and surfaces transitions only, so a
/// sustained advice is not acted on twice. Tracks the prevailing (last
/// non-none) advice and its age in ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changed {
    enabled: bool,
    prevailing_advice: Advice,
    prevailing_advice_age: u32,
}

impl Changed {
    pub fn new(enabled: bool) -> Changed {
        Changed { enabled, prevailing_advice: Advice::None, prevailing_advice_age: 0 }
    }

    /// Feeds one advice; returns it only when it differs from the
    /// prevailing one.
    pub fn update(&mut self, advice: Advice) -> Advice {
        if !self.enabled {
            return advice;
        }
        let changed = if advice != Advice::None && advice != self.prevailing_advice {
            self.prevailing_advice = advice;
            self.prevailing_advice_age = 0;
            advice
        } else {
            Advice::None
        };
        self.prevailing_advice_age += 1;
        changed
    }

    pub fn prevailing_advice(&self) -> Advice {
        self.prevailing_advice
    }

    /// Ticks since the prevailing advice was emitted (1 on the tick it
    /// changed).
    pub fn prevailing_advice_age(&self) -> u32 {
        self.prevailing_advice_age
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
    fn test_fixed_respects_maturity() {
        let mut strategy = StrategyConfig::Fixed {
            advices: vec![Advice::Long, Advice::Liquidate],
            maturity: 1,
        }
        .construct();
        assert!(!strategy.mature());
        assert_eq!(strategy.update(&candle(dec!(1))), Advice::None);
        assert!(strategy.mature());
        assert_eq!(strategy.update(&candle(dec!(1))), Advice::Long);
        assert_eq!(strategy.update(&candle(dec!(1))), Advice::Liquidate);
        assert_eq!(strategy.update(&candle(dec!(1))), Advice::None);
    }

    #[test]
    fn test_ema_crossover() {
        let mut strategy = StrategyConfig::EmaCrossover {
            short_period: 2,
            long_period: 4,
            neutral_threshold: Decimal::ZERO,
        }
        .construct();
        let mut advice = Advice::None;
        for close in [1, 1, 1, 1, 2, 4, 8] {
            advice = strategy.update(&candle(Decimal::from(close)));
        }
        assert_eq!(advice, Advice::Long);
        for close in [8, 4, 2, 1, 1, 1] {
            advice = strategy.update(&candle(Decimal::from(close)));
        }
        assert_eq!(advice, Advice::Short);
    }

    #[test]
    fn test_changed_surfaces_transitions_only() {
        let mut changed = Changed::new(true);
        assert_eq!(changed.update(Advice::Long), Advice::Long);
        assert_eq!(changed.update(Advice::Long), Advice::None);
        assert_eq!(changed.prevailing_advice(), Advice::Long);
        assert_eq!(changed.prevailing_advice_age(), 2);
        assert_eq!(changed.update(Advice::Short), Advice::Short);
        assert_eq!(changed.prevailing_advice_age(), 1);
        // NONE does not disturb the prevailing advice.
        assert_eq!(changed.update(Advice::None), Advice::None);
        assert_eq!(changed.prevailing_advice(), Advice::Short);
    }
}
