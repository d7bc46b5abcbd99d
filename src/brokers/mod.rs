//! Order brokers
//!
//! A broker turns "fill this much" into venue orders: the market broker
//! crosses the spread immediately, the limit broker rests at the top of
//! book and re-prices as the book moves.

pub mod limit;
pub mod market;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::errors::{BadOrder, Result};
use crate::order::OrderResult;
use crate::types::{Account, Symbol};

pub use limit::{LimitBroker, PlacementStrategy};
pub use market::MarketBroker;

/// One buy or sell request against a venue account.
#[derive(Debug, Clone)]
pub struct BrokerRequest {
    pub exchange: String,
    pub account: Account,
    pub symbol: Symbol,
    /// Base-denominated amount to fill.
    pub size: Option<Decimal>,
    /// Quote-denominated amount to fill.
    pub quote: Option<Decimal>,
    /// Simulate only; no venue side effects.
    pub test: bool,
    /// Grow the request so the post-fee received base still covers `size`.
    pub ensure_size: bool,
    /// Margin multiplier for venues that short via leveraged orders.
    pub leverage: Option<u32>,
    pub reduce_only: bool,
}

impl BrokerRequest {
    pub fn size(
        exchange: impl Into<String>,
        account: Account,
        symbol: Symbol,
        size: Decimal,
    ) -> BrokerRequest {
        BrokerRequest {
            exchange: exchange.into(),
            account,
            symbol,
            size: Some(size),
            quote: None,
            test: false,
            ensure_size: false,
            leverage: None,
            reduce_only: false,
        }
    }

    pub fn quote(
        exchange: impl Into<String>,
        account: Account,
        symbol: Symbol,
        quote: Decimal,
    ) -> BrokerRequest {
        BrokerRequest {
            exchange: exchange.into(),
            account,
            symbol,
            size: None,
            quote: Some(quote),
            test: false,
            ensure_size: false,
            leverage: None,
            reduce_only: false,
        }
    }

    pub fn test(mut self, test: bool) -> BrokerRequest {
        self.test = test;
        self
    }

    pub fn ensure_size(mut self, ensure_size: bool) -> BrokerRequest {
        self.ensure_size = ensure_size;
        self
    }

    /// Exactly one of size/quote must be set and positive.
    pub(crate) fn validate_funds(&self) -> Result<()> {
        match (self.size, self.quote) {
            (Some(size), None) if size > Decimal::ZERO => Ok(()),
            (None, Some(quote)) if quote > Decimal::ZERO => Ok(()),
            _ => Err(BadOrder::Rejected(
                "exactly one of size or quote must be requested, and positive".into(),
            )
            .into()),
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn buy(&self, request: BrokerRequest) -> Result<OrderResult>;

    async fn sell(&self, request: BrokerRequest) -> Result<OrderResult>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_validate_funds() {
        let base = BrokerRequest::size("fake", Account::Spot, Symbol::new("eth-btc"), dec!(1));
        assert!(base.validate_funds().is_ok());

        let mut both = base.clone();
        both.quote = Some(dec!(1));
        assert!(both.validate_funds().is_err());

        let mut neither = base.clone();
        neither.size = None;
        assert!(neither.validate_funds().is_err());

        let mut zero = base;
        zero.size = Some(Decimal::ZERO);
        assert!(zero.validate_funds().is_err());
    }
}
