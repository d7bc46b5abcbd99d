//! Trading supervisors
//!
//! Drive strategy advice into positions over a candle feed. `basic` runs
//! one symbol; `multi` tracks the top-volume symbols under a shared
//! capital budget.

pub mod basic;
pub mod multi;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::chandler::Chandler;
use crate::errors::{ExchangeError, Result};
use crate::time::{floor_timestamp, Interval, Timestamp};
use crate::types::Symbol;

pub use basic::{BasicConfig, BasicState, BasicTrader};
pub use multi::{MultiConfig, MultiState, MultiTrader};

/// Cooperative stop for a running trader. The run loop exits at the next
/// tick boundary; with `close_on_exit` set, open positions are closed with
/// `CloseReason::Cancelled` before the summary is returned.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> StopSignal {
        let (tx, _) = watch::channel(false);
        StopSignal { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let stopped = { *rx.borrow() };
            if stopped {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        StopSignal::new()
    }
}

/// When to start feeding candles relative to the configured start: not at
/// all, early enough to warm the strategy up, or from a fixed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AdjustedStartRepr", into = "AdjustedStartRepr")]
pub enum AdjustedStart {
    /// Backfill `maturity - 1` candles before the official start.
    Strategy,
    At(Timestamp),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum AdjustedStartRepr {
    Tag(String),
    At(Timestamp),
}

impl TryFrom<AdjustedStartRepr> for AdjustedStart {
    type Error = String;

    fn try_from(repr: AdjustedStartRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            AdjustedStartRepr::Tag(tag) if tag == "strategy" => Ok(AdjustedStart::Strategy),
            AdjustedStartRepr::Tag(tag) => Err(format!("unknown adjusted start {tag:?}")),
            AdjustedStartRepr::At(time) => Ok(AdjustedStart::At(time)),
        }
    }
}

impl From<AdjustedStart> for AdjustedStartRepr {
    fn from(value: AdjustedStart) -> Self {
        match value {
            AdjustedStart::Strategy => AdjustedStartRepr::Tag("strategy".into()),
            AdjustedStart::At(time) => AdjustedStartRepr::At(time),
        }
    }
}

/// Resolves the trading start: an explicit start floors to the interval;
/// otherwise the latest first-candle time across the symbols, so every
/// tracked symbol has data from day one.
pub(crate) async fn request_candle_start(
    chandler: &Chandler,
    start: Option<Timestamp>,
    exchange: &str,
    symbols: &[Symbol],
    interval: Interval,
) -> Result<Timestamp> {
    if let Some(start) = start {
        return Ok(floor_timestamp(start, interval));
    }
    let mut latest: Option<Timestamp> = None;
    for symbol in symbols {
        let first = chandler.get_first_candle(exchange, symbol, interval).await?;
        latest = Some(latest.map_or(first.time, |t| t.max(first.time)));
    }
    latest
        .map(|t| floor_timestamp(t, interval))
        .ok_or_else(|| ExchangeError::unexpected("no symbols to resolve start from"))
}

/// Warm-up start for a strategy that needs `maturity` candles.
pub(crate) fn warmed_up_start(
    start: Timestamp,
    maturity: u32,
    interval: Interval,
    adjusted: Option<AdjustedStart>,
) -> Timestamp {
    match adjusted {
        None => start,
        Some(AdjustedStart::Strategy) => {
            start.saturating_sub(u64::from(maturity.saturating_sub(1)) * interval)
        }
        Some(AdjustedStart::At(time)) => time.min(start),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::HOUR_MS;

    #[test]
    fn test_adjusted_start_serde() {
        let strategy: AdjustedStart = serde_json::from_str("\"strategy\"").unwrap();
        assert_eq!(strategy, AdjustedStart::Strategy);
        let at: AdjustedStart = serde_json::from_str("12345").unwrap();
        assert_eq!(at, AdjustedStart::At(12345));
        assert!(serde_json::from_str::<AdjustedStart>("\"bogus\"").is_err());
    }

    #[test]
    fn test_warmed_up_start() {
        assert_eq!(warmed_up_start(10 * HOUR_MS, 3, HOUR_MS, None), 10 * HOUR_MS);
        assert_eq!(
            warmed_up_start(10 * HOUR_MS, 3, HOUR_MS, Some(AdjustedStart::Strategy)),
            8 * HOUR_MS,
        );
        assert_eq!(
            warmed_up_start(10 * HOUR_MS, 3, HOUR_MS, Some(AdjustedStart::At(HOUR_MS))),
            HOUR_MS,
        );
    }

    #[tokio::test]
    async fn test_stop_signal() {
        let stop = StopSignal::new();
        assert!(!stop.is_stopped());
        stop.stop();
        assert!(stop.is_stopped());
        stop.wait().await;
    }
}
