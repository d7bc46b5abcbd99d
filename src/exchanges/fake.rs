//! Scriptable in-process venue
//!
//! Serves canned exchange info, depth, and balances, records every order
//! call, and lets a driver inject depth updates and order update events.
//! Used by paper trading and by the engine's own tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::errors::{ExchangeError, Result};
use crate::filters::Filters;
use crate::order::{OrderResult, OrderStatus, OrderUpdate};
use crate::orderbook::Depth;
use crate::time::{Interval, Timestamp};
use crate::types::{Account, Asset, Balance, Candle, Fees, Symbol, Ticker, Trade};

use super::{
    Capabilities, EditOrder, Exchange, ExchangeInfo, ExchangeStream, MarginPosition, NewOrder,
    Transfer,
};

const CHANNEL_CAPACITY: usize = 256;

/// Recorded margin bookkeeping call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarginCall {
    pub asset: Asset,
    pub size: Decimal,
    pub account: Account,
}

pub struct Fake {
    capabilities: Mutex<Capabilities>,
    time: AtomicU64,
    pub depth_requests: AtomicU64,

    exchange_info: Mutex<ExchangeInfo>,
    tickers: Mutex<HashMap<Symbol, Ticker>>,
    balances: Mutex<HashMap<Account, HashMap<Asset, Balance>>>,
    scripted_balances: Mutex<HashMap<(Account, Asset), VecDeque<Balance>>>,
    depth: Mutex<Depth>,
    candles: Mutex<HashMap<(Symbol, Interval), Vec<Candle>>>,

    depth_tx: broadcast::Sender<Depth>,
    orders_tx: broadcast::Sender<OrderUpdate>,
    balances_tx: broadcast::Sender<HashMap<Asset, Balance>>,
    candles_tx: Mutex<HashMap<(Symbol, Interval), broadcast::Sender<Candle>>>,

    place_order_results: Mutex<VecDeque<Result<OrderResult>>>,
    pub place_order_calls: Mutex<Vec<NewOrder>>,
    cancel_order_results: Mutex<VecDeque<Result<()>>>,
    pub cancel_order_calls: Mutex<Vec<(Account, Symbol, String)>>,
    edit_order_results: Mutex<VecDeque<Result<OrderResult>>>,
    pub edit_order_calls: Mutex<Vec<EditOrder>>,
    max_borrowable_results: Mutex<VecDeque<Result<Decimal>>>,
    client_ids: Mutex<VecDeque<String>>,

    pub transfers: Mutex<Vec<Transfer>>,
    pub borrows: Mutex<Vec<MarginCall>>,
    pub repays: Mutex<Vec<MarginCall>>,
    margin_positions: Mutex<Vec<MarginPosition>>,
}

impl Default for Fake {
    fn default() -> Self {
        Fake::new()
    }
}

impl Fake {
    pub fn new() -> Fake {
        let (depth_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (orders_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (balances_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Fake {
            capabilities: Mutex::new(Capabilities {
                can_place_market_order: true,
                can_place_market_order_quote: true,
                can_margin_trade: true,
                can_margin_borrow: true,
                can_stream_balances: true,
                can_list_all_tickers: true,
                ..Default::default()
            }),
            time: AtomicU64::new(0),
            depth_requests: AtomicU64::new(0),
            exchange_info: Mutex::new(default_exchange_info()),
            tickers: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            scripted_balances: Mutex::new(HashMap::new()),
            depth: Mutex::new(Depth::Snapshot {
                bids: Vec::new(),
                asks: Vec::new(),
                last_update_id: 0,
            }),
            candles: Mutex::new(HashMap::new()),
            depth_tx,
            orders_tx,
            balances_tx,
            candles_tx: Mutex::new(HashMap::new()),
            place_order_results: Mutex::new(VecDeque::new()),
            place_order_calls: Mutex::new(Vec::new()),
            cancel_order_results: Mutex::new(VecDeque::new()),
            cancel_order_calls: Mutex::new(Vec::new()),
            edit_order_results: Mutex::new(VecDeque::new()),
            edit_order_calls: Mutex::new(Vec::new()),
            max_borrowable_results: Mutex::new(VecDeque::new()),
            client_ids: Mutex::new(VecDeque::new()),
            transfers: Mutex::new(Vec::new()),
            borrows: Mutex::new(Vec::new()),
            repays: Mutex::new(Vec::new()),
            margin_positions: Mutex::new(Vec::new()),
        }
    }

    // Scripting surface.

    pub fn with_capabilities(self, capabilities: Capabilities) -> Self {
        *self.capabilities.lock() = capabilities;
        self
    }

    pub fn set_capabilities(&self, capabilities: Capabilities) {
        *self.capabilities.lock() = capabilities;
    }

    pub fn set_time(&self, time: Timestamp) {
        self.time.store(time, Ordering::Relaxed);
    }

    pub fn time(&self) -> Timestamp {
        self.time.load(Ordering::Relaxed)
    }

    pub fn set_exchange_info(&self, info: ExchangeInfo) {
        *self.exchange_info.lock() = info;
    }

    pub fn set_tickers(&self, tickers: HashMap<Symbol, Ticker>) {
        *self.tickers.lock() = tickers;
    }

    pub fn set_balance(&self, account: Account, asset: impl Into<Asset>, balance: Balance) {
        self.balances.lock().entry(account).or_default().insert(asset.into(), balance);
    }

    /// Queues balances returned by successive reads before falling back to
    /// the value set via [`Fake::set_balance`]. Lets tests model venues
    /// that keep serving stale balances for a while.
    pub fn script_balance(&self, account: Account, asset: impl Into<Asset>, balances: Vec<Balance>) {
        self.scripted_balances
            .lock()
            .entry((account, asset.into()))
            .or_default()
            .extend(balances);
    }

    pub fn set_depth_snapshot(
        &self,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
        last_update_id: u64,
    ) {
        *self.depth.lock() = Depth::Snapshot { bids, asks, last_update_id };
    }

    pub fn set_candles(&self, symbol: Symbol, interval: Interval, candles: Vec<Candle>) {
        self.candles.lock().insert((symbol, interval), candles);
    }

    pub fn push_depth(&self, depth: Depth) {
        let _ = self.depth_tx.send(depth);
    }

    pub fn push_order_update(&self, update: OrderUpdate) {
        let _ = self.orders_tx.send(update);
    }

    pub fn push_balances(&self, balances: HashMap<Asset, Balance>) {
        let _ = self.balances_tx.send(balances);
    }

    pub fn push_candle(&self, symbol: &Symbol, interval: Interval, candle: Candle) {
        let senders = self.candles_tx.lock();
        if let Some(tx) = senders.get(&(symbol.clone(), interval)) {
            let _ = tx.send(candle);
        }
    }

    pub fn script_place_order(&self, result: Result<OrderResult>) {
        self.place_order_results.lock().push_back(result);
    }

    pub fn script_cancel_order(&self, result: Result<()>) {
        self.cancel_order_results.lock().push_back(result);
    }

    pub fn script_edit_order(&self, result: Result<OrderResult>) {
        self.edit_order_results.lock().push_back(result);
    }

    pub fn script_max_borrowable(&self, result: Result<Decimal>) {
        self.max_borrowable_results.lock().push_back(result);
    }

    pub fn script_client_id(&self, client_id: impl Into<String>) {
        self.client_ids.lock().push_back(client_id.into());
    }

    pub fn set_margin_positions(&self, positions: Vec<MarginPosition>) {
        *self.margin_positions.lock() = positions;
    }

    fn stream_broadcast<T: Clone + Send + 'static>(
        rx: broadcast::Receiver<T>,
    ) -> ExchangeStream<T> {
        BroadcastStream::new(rx)
            .map(|item| {
                item.map_err(|err| ExchangeError::unavailable(format!("stream lagged: {err}")))
            })
            .boxed()
    }
}

fn default_exchange_info() -> ExchangeInfo {
    let mut info = ExchangeInfo::default();
    info.fees.insert("__all__".into(), Fees::default());
    info.filters.insert("__all__".into(), Filters::default());
    info
}

#[async_trait]
impl Exchange for Fake {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn capabilities(&self) -> Capabilities {
        *self.capabilities.lock()
    }

    fn generate_client_id(&self) -> String {
        self.client_ids
            .lock()
            .pop_front()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    async fn get_exchange_info(&self) -> Result<ExchangeInfo> {
        Ok(self.exchange_info.lock().clone())
    }

    async fn map_tickers(&self) -> Result<HashMap<Symbol, Ticker>> {
        Ok(self.tickers.lock().clone())
    }

    async fn map_balances(
        &self,
        account: Account,
    ) -> Result<HashMap<Account, HashMap<Asset, Balance>>> {
        let mut result = HashMap::new();
        let mut balances =
            self.balances.lock().get(&account).cloned().unwrap_or_default();
        let mut scripted = self.scripted_balances.lock();
        for ((scripted_account, asset), queue) in scripted.iter_mut() {
            if *scripted_account == account {
                if let Some(balance) = queue.pop_front() {
                    balances.insert(asset.clone(), balance);
                }
            }
        }
        result.insert(account, balances);
        Ok(result)
    }

    async fn connect_stream_balances(
        &self,
        _account: Account,
    ) -> Result<ExchangeStream<HashMap<Asset, Balance>>> {
        Ok(Self::stream_broadcast(self.balances_tx.subscribe()))
    }

    async fn get_depth(&self, _symbol: &Symbol) -> Result<Depth> {
        self.depth_requests.fetch_add(1, Ordering::Relaxed);
        Ok(self.depth.lock().clone())
    }

    async fn connect_stream_depth(&self, _symbol: &Symbol) -> Result<ExchangeStream<Depth>> {
        let updates = Self::stream_broadcast(self.depth_tx.subscribe());
        if self.capabilities().can_stream_depth_snapshot {
            let snapshot = self.depth.lock().clone();
            Ok(futures::stream::iter([Ok(snapshot)]).chain(updates).boxed())
        } else {
            Ok(updates)
        }
    }

    async fn stream_historical_trades(
        &self,
        _symbol: &Symbol,
        _start: Timestamp,
        _end: Timestamp,
    ) -> Result<ExchangeStream<Trade>> {
        Ok(futures::stream::empty().boxed())
    }

    async fn connect_stream_trades(&self, _symbol: &Symbol) -> Result<ExchangeStream<Trade>> {
        Ok(futures::stream::pending().boxed())
    }

    async fn stream_historical_candles(
        &self,
        symbol: &Symbol,
        interval: Interval,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<ExchangeStream<Candle>> {
        let candles: Vec<_> = self
            .candles
            .lock()
            .get(&(symbol.clone(), interval))
            .map(|candles| {
                candles
                    .iter()
                    .filter(|c| c.time >= start && c.time < end)
                    .copied()
                    .map(Ok)
                    .collect()
            })
            .unwrap_or_default();
        Ok(futures::stream::iter(candles).boxed())
    }

    async fn connect_stream_candles(
        &self,
        symbol: &Symbol,
        interval: Interval,
    ) -> Result<ExchangeStream<Candle>> {
        let rx = {
            let mut senders = self.candles_tx.lock();
            senders
                .entry((symbol.clone(), interval))
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        Ok(Self::stream_broadcast(rx))
    }

    async fn place_order(&self, order: NewOrder) -> Result<OrderResult> {
        self.place_order_calls.lock().push(order);
        self.place_order_results.lock().pop_front().unwrap_or_else(|| {
            Ok(OrderResult { time: self.time(), status: OrderStatus::New, fills: Vec::new() })
        })
    }

    async fn cancel_order(
        &self,
        account: Account,
        symbol: &Symbol,
        client_id: &str,
    ) -> Result<()> {
        self.cancel_order_calls.lock().push((account, symbol.clone(), client_id.to_owned()));
        self.cancel_order_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn edit_order(&self, edit: EditOrder) -> Result<OrderResult> {
        self.edit_order_calls.lock().push(edit);
        self.edit_order_results.lock().pop_front().unwrap_or_else(|| {
            Ok(OrderResult { time: self.time(), status: OrderStatus::New, fills: Vec::new() })
        })
    }

    async fn connect_stream_orders(
        &self,
        _account: Account,
        _symbol: &Symbol,
    ) -> Result<ExchangeStream<OrderUpdate>> {
        Ok(Self::stream_broadcast(self.orders_tx.subscribe()))
    }

    async fn transfer(&self, transfer: Transfer) -> Result<()> {
        self.transfers.lock().push(transfer);
        Ok(())
    }

    async fn borrow(&self, asset: &str, size: Decimal, account: Account) -> Result<()> {
        self.borrows.lock().push(MarginCall { asset: asset.to_owned(), size, account });
        Ok(())
    }

    async fn repay(&self, asset: &str, size: Decimal, account: Account) -> Result<()> {
        self.repays.lock().push(MarginCall { asset: asset.to_owned(), size, account });
        Ok(())
    }

    async fn get_max_borrowable(&self, _account: Account, _asset: &str) -> Result<Decimal> {
        self.max_borrowable_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Decimal::new(1_000_000, 0)))
    }

    async fn create_account(&self, _account: Account) -> Result<()> {
        Ok(())
    }

    async fn list_open_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.balances.lock().keys().cloned().collect())
    }

    async fn list_open_margin_positions(&self) -> Result<Vec<MarginPosition>> {
        Ok(self.margin_positions.lock().clone())
    }
}
