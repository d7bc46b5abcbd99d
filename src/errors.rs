//! Error taxonomy for the trading engine
//!
//! Two tiers: `BadOrder` covers venue-side order rejections that callers
//! are expected to handle as part of normal control flow, `ExchangeError`
//! is the umbrella for everything a venue interaction can produce.
//! Transient transport failures are recovered by retry loops in the sync
//! components and never reach subscribers until the retry budget runs out.

use thiserror::Error;

/// Order rejected by the venue for a reason the caller can act on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BadOrder {
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Funds locked by an in-flight fill; the limit broker converts this
    /// into "edit succeeded as cancel" and reconciles.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Cancel found no such order; the order already reached a terminal
    /// state and accumulated fills stand.
    #[error("order missing: {0}")]
    OrderMissing(String),
}

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Transport/venue failure (5xx, throttling, socket drop). Retryable.
    #[error("exchange unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    BadOrder(#[from] BadOrder),

    /// Venue answered but the answer makes no sense (e.g. zero borrowable
    /// with collateral posted). Drives bounded retry in the positioner.
    #[error("unexpected exchange result: {0}")]
    Unexpected(String),

    /// Operation outside the venue's capability set.
    #[error("not supported by venue: {0}")]
    Unsupported(&'static str),
}

impl From<crate::storage::StorageError> for ExchangeError {
    fn from(err: crate::storage::StorageError) -> Self {
        ExchangeError::Unexpected(err.to_string())
    }
}

impl ExchangeError {
    /// Whether a retry loop may swallow this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Unavailable(_) | ExchangeError::Unexpected(_))
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        ExchangeError::Unavailable(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        ExchangeError::Unexpected(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::unavailable("502").is_transient());
        assert!(ExchangeError::unexpected("borrowable 0").is_transient());
        assert!(!ExchangeError::BadOrder(BadOrder::Rejected("min size".into())).is_transient());
        assert!(!ExchangeError::Unsupported("edit_order").is_transient());
    }
}
