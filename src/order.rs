//! Orders, fills, and order update stream events

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::math::{round_down, round_half_up};
use crate::time::Timestamp;
use crate::types::Asset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good till cancelled.
    Gtc,
    /// Immediate or cancel; unfilled remainder is cancelled.
    Ioc,
    /// Fill entirely or cancel.
    Fok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Filled,
    PartiallyFilled,
    Canceled,
    /// Simulated order; nothing reached the venue.
    NotPlaced,
}

/// Matched portion of an order at a specific price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    pub price: Decimal,
    pub size: Decimal,
    pub quote: Decimal,
    pub fee: Decimal,
    pub fee_asset: Asset,
}

impl Fill {
    /// Builds a fill deriving `quote` from price and size at the symbol's
    /// quote precision.
    pub fn with_computed_quote(
        price: Decimal,
        size: Decimal,
        fee: Decimal,
        fee_asset: impl Into<Asset>,
        quote_precision: u32,
    ) -> Fill {
        Fill {
            price,
            size,
            quote: round_down(price * size, quote_precision),
            fee,
            fee_asset: fee_asset.into(),
        }
    }

    /// Derives the newest fill from cumulative totals reported by venues
    /// that do not stream per-match deltas.
    pub fn from_cumulative(
        prior: &[Fill],
        price: Decimal,
        cumulative_size: Decimal,
        cumulative_quote: Decimal,
        cumulative_fee: Decimal,
        fee_asset: impl Into<Asset>,
    ) -> Fill {
        Fill {
            price,
            size: cumulative_size - Fill::total_size(prior),
            quote: cumulative_quote - Fill::total_quote(prior),
            fee: cumulative_fee - Fill::total_fee(prior),
            fee_asset: fee_asset.into(),
        }
    }

    pub fn total_size(fills: &[Fill]) -> Decimal {
        fills.iter().map(|f| f.size).sum()
    }

    pub fn total_quote(fills: &[Fill]) -> Decimal {
        fills.iter().map(|f| f.quote).sum()
    }

    /// Sum of all fees regardless of asset. Callers that care about the
    /// denomination use [`Fill::total_fee_for`] or [`Fill::all_fees`].
    pub fn total_fee(fills: &[Fill]) -> Decimal {
        fills.iter().map(|f| f.fee).sum()
    }

    pub fn total_fee_for(fills: &[Fill], asset: &str) -> Decimal {
        fills.iter().filter(|f| f.fee_asset == asset).map(|f| f.fee).sum()
    }

    pub fn all_fees(fills: &[Fill]) -> HashMap<Asset, Decimal> {
        let mut result: HashMap<Asset, Decimal> = HashMap::new();
        for fill in fills {
            *result.entry(fill.fee_asset.clone()).or_default() += fill.fee;
        }
        result
    }

    pub fn mean_price(fills: &[Fill]) -> Decimal {
        let total_size = Fill::total_size(fills);
        if total_size == Decimal::ZERO {
            return Decimal::ZERO;
        }
        fills.iter().map(|f| f.price * f.size).sum::<Decimal>() / total_size
    }

    /// Quote value the fills should settle at given the venue's quote
    /// precision.
    pub fn expected_quote(fills: &[Fill], quote_precision: u32) -> Decimal {
        fills.iter().map(|f| round_down(f.price * f.size, quote_precision)).sum()
    }

    /// Base-denominated taker fee expected on buys.
    pub fn expected_base_fee(fills: &[Fill], fee_rate: Decimal, base_precision: u32) -> Decimal {
        fills.iter().map(|f| round_half_up(f.size * fee_rate, base_precision)).sum()
    }

    /// Quote-denominated taker fee expected on sells.
    pub fn expected_quote_fee(fills: &[Fill], fee_rate: Decimal, quote_precision: u32) -> Decimal {
        fills
            .iter()
            .map(|f| round_half_up(f.size * f.price * fee_rate, quote_precision))
            .sum()
    }
}

/// Final outcome of a broker operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderResult {
    pub time: Timestamp,
    pub status: OrderStatus,
    pub fills: Vec<Fill>,
}

impl OrderResult {
    pub fn not_placed(time: Timestamp, fills: Vec<Fill>) -> OrderResult {
        OrderResult { time, status: OrderStatus::NotPlaced, fills }
    }
}

/// Why a resting order left the book without filling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelledReason {
    Unknown,
    /// Cancelled as one half of a non-atomic order edit; not an error.
    Edit,
}

/// Exchange-assigned order lifecycle event, correlated by client id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderUpdate {
    New {
        client_id: String,
    },
    Match {
        client_id: String,
        fill: Fill,
    },
    Cancelled {
        client_id: String,
        time: Timestamp,
        reason: CancelledReason,
    },
    Done {
        client_id: String,
        time: Timestamp,
    },
}

impl OrderUpdate {
    pub fn client_id(&self) -> &str {
        match self {
            OrderUpdate::New { client_id }
            | OrderUpdate::Match { client_id, .. }
            | OrderUpdate::Cancelled { client_id, .. }
            | OrderUpdate::Done { client_id, .. } => client_id,
        }
    }
}
