//! Venue adapters
//!
//! One polymorphic [`Exchange`] contract over venues. Not every venue
//! supports every operation; callers inspect the [`Capabilities`] struct
//! instead of downcasting to a concrete adapter.

pub mod binance;
pub mod fake;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Result;
use crate::order::{OrderResult, OrderType, OrderUpdate, TimeInForce};
use crate::orderbook::Depth;
use crate::time::{Interval, Timestamp};
use crate::types::{
    Account, Asset, AssetInfo, Balance, BorrowInfo, Candle, Fees, KeyedBy, Side, Symbol, Ticker,
    Trade,
};
use crate::filters::Filters;

pub use binance::Binance;
pub use fake::Fake;

/// Boxed async stream; lifetime bounded by the subscription it came from.
pub type ExchangeStream<T> = Pin<Box<dyn futures::Stream<Item = Result<T>> + Send>>;

/// What a venue can do. Brokers and the positioner branch on these flags
/// rather than on adapter identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// Depth stream opens with a full snapshot message; no REST fetch
    /// needed during book sync.
    pub can_stream_depth_snapshot: bool,
    pub can_margin_trade: bool,
    pub can_margin_borrow: bool,
    /// Shorting via leveraged orders instead of explicit borrow/repay.
    pub can_margin_order_leverage: bool,
    pub can_place_market_order: bool,
    /// Market orders denominated in quote ("spend X btc") supported.
    pub can_place_market_order_quote: bool,
    pub can_edit_order: bool,
    /// Order edit replaces atomically; no cancel/new pair on the stream.
    pub can_edit_order_atomic: bool,
    /// Market order fills are reported in the placement response rather
    /// than over the order update stream.
    pub can_get_market_order_result_direct: bool,
    pub can_stream_balances: bool,
    pub can_stream_historical_earliest_candle: bool,
    pub can_list_all_tickers: bool,
}

/// Full venue metadata snapshot served by the informant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeInfo {
    /// Keyed by asset.
    pub assets: KeyedBy<AssetInfo>,
    /// Keyed by symbol.
    pub fees: KeyedBy<Fees>,
    /// Keyed by symbol.
    pub filters: KeyedBy<Filters>,
    /// Keyed by account kind, then by asset.
    pub borrow_info: KeyedBy<KeyedBy<BorrowInfo>>,
}

/// Parameters for [`Exchange::place_order`].
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub account: Account,
    pub symbol: Symbol,
    pub side: Side,
    pub type_: OrderType,
    pub size: Option<Decimal>,
    pub quote: Option<Decimal>,
    pub price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub client_id: Option<String>,
    /// Margin multiplier for venues with `can_margin_order_leverage`.
    pub leverage: Option<u32>,
    pub reduce_only: bool,
}

impl NewOrder {
    pub fn market(account: Account, symbol: Symbol, side: Side) -> NewOrder {
        NewOrder {
            account,
            symbol,
            side,
            type_: OrderType::Market,
            size: None,
            quote: None,
            price: None,
            time_in_force: None,
            client_id: None,
            leverage: None,
            reduce_only: false,
        }
    }

    pub fn limit(
        account: Account,
        symbol: Symbol,
        side: Side,
        price: Decimal,
        size: Decimal,
        client_id: String,
    ) -> NewOrder {
        NewOrder {
            account,
            symbol,
            side,
            type_: OrderType::Limit,
            size: Some(size),
            quote: None,
            price: Some(price),
            time_in_force: Some(TimeInForce::Gtc),
            client_id: Some(client_id),
            leverage: None,
            reduce_only: false,
        }
    }
}

/// Parameters for [`Exchange::edit_order`]. The client id survives the
/// edit; update streams keep correlating against it.
#[derive(Debug, Clone)]
pub struct EditOrder {
    pub account: Account,
    pub symbol: Symbol,
    pub side: Side,
    pub client_id: String,
    pub price: Decimal,
    pub size: Decimal,
}

/// Asset transfer between venue sub-accounts.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub asset: Asset,
    pub size: Decimal,
    pub from_account: Account,
    pub to_account: Account,
}

/// Open margin position as reported by the venue.
#[derive(Debug, Clone)]
pub struct MarginPosition {
    pub symbol: Symbol,
    pub side: Side,
    pub size: Decimal,
}

#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    fn generate_client_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    async fn get_exchange_info(&self) -> Result<ExchangeInfo>;

    async fn map_tickers(&self) -> Result<HashMap<Symbol, Ticker>>;

    /// Balances for one account, or for every open account when `account`
    /// is `Margin` on venues that report isolated accounts in bulk.
    async fn map_balances(&self, account: Account)
        -> Result<HashMap<Account, HashMap<Asset, Balance>>>;

    async fn connect_stream_balances(
        &self,
        account: Account,
    ) -> Result<ExchangeStream<HashMap<Asset, Balance>>>;

    async fn get_depth(&self, symbol: &Symbol) -> Result<Depth>;

    async fn connect_stream_depth(&self, symbol: &Symbol) -> Result<ExchangeStream<Depth>>;

    async fn stream_historical_trades(
        &self,
        symbol: &Symbol,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<ExchangeStream<Trade>>;

    async fn connect_stream_trades(&self, symbol: &Symbol) -> Result<ExchangeStream<Trade>>;

    async fn stream_historical_candles(
        &self,
        symbol: &Symbol,
        interval: Interval,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<ExchangeStream<Candle>>;

    async fn connect_stream_candles(
        &self,
        symbol: &Symbol,
        interval: Interval,
    ) -> Result<ExchangeStream<Candle>>;

    async fn place_order(&self, order: NewOrder) -> Result<OrderResult>;

    async fn cancel_order(&self, account: Account, symbol: &Symbol, client_id: &str)
        -> Result<()>;

    async fn edit_order(&self, _edit: EditOrder) -> Result<OrderResult> {
        Err(crate::errors::ExchangeError::Unsupported("edit_order"))
    }

    async fn connect_stream_orders(
        &self,
        account: Account,
        symbol: &Symbol,
    ) -> Result<ExchangeStream<OrderUpdate>>;

    // Margin-only operations; venues without margin keep the defaults.

    async fn transfer(&self, _transfer: Transfer) -> Result<()> {
        Err(crate::errors::ExchangeError::Unsupported("transfer"))
    }

    async fn borrow(&self, _asset: &str, _size: Decimal, _account: Account) -> Result<()> {
        Err(crate::errors::ExchangeError::Unsupported("borrow"))
    }

    async fn repay(&self, _asset: &str, _size: Decimal, _account: Account) -> Result<()> {
        Err(crate::errors::ExchangeError::Unsupported("repay"))
    }

    async fn get_max_borrowable(&self, _account: Account, _asset: &str) -> Result<Decimal> {
        Err(crate::errors::ExchangeError::Unsupported("get_max_borrowable"))
    }

    async fn create_account(&self, _account: Account) -> Result<()> {
        Err(crate::errors::ExchangeError::Unsupported("create_account"))
    }

    async fn list_open_accounts(&self) -> Result<Vec<Account>> {
        Ok(vec![Account::Spot])
    }

    async fn list_open_margin_positions(&self) -> Result<Vec<MarginPosition>> {
        Err(crate::errors::ExchangeError::Unsupported("list_open_margin_positions"))
    }
}
