//! Custodians
//!
//! A custodian is where trading capital parks between positions: nowhere
//! (stub), on the spot wallet, or in a savings product that must be
//! redeemed before trading and re-purchased after.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::info;

use crate::errors::{BadOrder, ExchangeError, Result};
use crate::types::Account;
use crate::user::User;

#[async_trait]
pub trait Custodian: Send + Sync {
    /// Resolves the quote amount to trade with; `None` means "whatever is
    /// available".
    async fn request_quote(
        &self,
        exchange: &str,
        asset: &str,
        quote: Option<Decimal>,
    ) -> Result<Decimal>;

    /// Makes `quote` spendable on the trading account.
    async fn acquire(&self, exchange: &str, asset: &str, quote: Decimal) -> Result<()>;

    /// Returns `quote` to the custodian after trading.
    async fn release(&self, exchange: &str, asset: &str, quote: Decimal) -> Result<()>;
}

/// No funds management; the caller must state the quote explicitly.
pub struct Stub;

#[async_trait]
impl Custodian for Stub {
    async fn request_quote(
        &self,
        _exchange: &str,
        _asset: &str,
        quote: Option<Decimal>,
    ) -> Result<Decimal> {
        quote.ok_or_else(|| {
            ExchangeError::from(BadOrder::Rejected(
                "stub custodian requires an explicit quote".into(),
            ))
        })
    }

    async fn acquire(&self, _exchange: &str, _asset: &str, _quote: Decimal) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _exchange: &str, _asset: &str, _quote: Decimal) -> Result<()> {
        Ok(())
    }
}

/// Funds already sit on the spot wallet; only balance checks apply.
pub struct Spot {
    user: Arc<User>,
}

impl Spot {
    pub fn new(user: Arc<User>) -> Spot {
        Spot { user }
    }
}

#[async_trait]
impl Custodian for Spot {
    async fn request_quote(
        &self,
        exchange: &str,
        asset: &str,
        quote: Option<Decimal>,
    ) -> Result<Decimal> {
        let available =
            self.user.get_balance(exchange, &Account::Spot, asset).await?.available;
        match quote {
            None => {
                info!(%asset, "quote not specified; using available {available}");
                Ok(available)
            }
            Some(quote) if quote <= available => Ok(quote),
            Some(quote) => Err(BadOrder::InsufficientFunds(format!(
                "requested {quote} {asset} but only {available} available"
            ))
            .into()),
        }
    }

    async fn acquire(&self, _exchange: &str, _asset: &str, _quote: Decimal) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _exchange: &str, _asset: &str, _quote: Decimal) -> Result<()> {
        Ok(())
    }
}

/// Keeps idle capital in a flexible savings product: redeemed on acquire,
/// re-purchased on release. Requires venue savings endpoints which are not
/// part of the adapter contract yet; quoting works, moving funds reports
/// unsupported.
pub struct Savings {
    user: Arc<User>,
}

impl Savings {
    pub fn new(user: Arc<User>) -> Savings {
        Savings { user }
    }
}

#[async_trait]
impl Custodian for Savings {
    async fn request_quote(
        &self,
        exchange: &str,
        asset: &str,
        quote: Option<Decimal>,
    ) -> Result<Decimal> {
        // Funds counted whether parked in savings or already spot.
        let balance = self.user.get_balance(exchange, &Account::Spot, asset).await?;
        let available = balance.available + balance.hold;
        match quote {
            None => Ok(available),
            Some(quote) if quote <= available => Ok(quote),
            Some(quote) => Err(BadOrder::InsufficientFunds(format!(
                "requested {quote} {asset} but only {available} available"
            ))
            .into()),
        }
    }

    async fn acquire(&self, _exchange: &str, asset: &str, quote: Decimal) -> Result<()> {
        info!(%asset, %quote, "redeeming savings product");
        Err(ExchangeError::Unsupported("savings product redemption"))
    }

    async fn release(&self, _exchange: &str, asset: &str, quote: Decimal) -> Result<()> {
        info!(%asset, %quote, "purchasing savings product");
        Err(ExchangeError::Unsupported("savings product purchase"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::{Exchange, Fake};
    use crate::types::Balance;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_stub_requires_quote() {
        let stub = Stub;
        assert!(stub.request_quote("fake", "btc", None).await.is_err());
        assert_eq!(stub.request_quote("fake", "btc", Some(dec!(1))).await.unwrap(), dec!(1));
    }

    #[tokio::test]
    async fn test_spot_reads_available() {
        let fake = Arc::new(Fake::new());
        fake.set_balance(
            Account::Spot,
            "btc",
            Balance { available: dec!(2.5), ..Default::default() },
        );
        let spot = Spot::new(Arc::new(User::new(vec![fake as Arc<dyn Exchange>])));

        assert_eq!(spot.request_quote("fake", "btc", None).await.unwrap(), dec!(2.5));
        assert_eq!(spot.request_quote("fake", "btc", Some(dec!(2))).await.unwrap(), dec!(2));
        assert!(spot.request_quote("fake", "btc", Some(dec!(3))).await.is_err());
    }
}
