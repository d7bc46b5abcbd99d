//! Order book synchronizer
//!
//! Keeps a per-(exchange, symbol) local depth view consistent with the
//! venue. One background task writes each book; any number of subscribers
//! read it through [`BookHandle`]s. The first subscriber spawns the sync
//! task and blocks on the initial-sync barrier; later subscribers attach
//! instantly; the last handle dropped tears the task down.
//!
//! Sequencing: after the snapshot at id `S`, buffered updates with
//! `last_update_id <= S` are discarded, the first accepted update must
//! satisfy `first_update_id <= S+1 <= last_update_id`, and every update
//! after that must start at `previous.last_update_id + 1`. Any gap forces
//! a re-snapshot while existing subscribers keep their handles.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::errors::{ExchangeError, Result};
use crate::exchanges::Exchange;
use crate::filters::Filters;
use crate::math::round_half_up;
use crate::order::Fill;
use crate::sync::RetryBudget;
use crate::types::Symbol;

/// Depth message from a venue: full snapshot or incremental update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Depth {
    Snapshot {
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
        last_update_id: u64,
    },
    Update {
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
        first_update_id: u64,
        last_update_id: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncStatus {
    Pending,
    Ready,
    Failed,
}

#[derive(Debug, Clone)]
struct BookState {
    version: u64,
    status: SyncStatus,
    error: Option<String>,
}

#[derive(Default)]
struct BookSides {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_update_id: u64,
}

struct SharedBook {
    sides: Mutex<BookSides>,
    state: watch::Sender<BookState>,
}

impl SharedBook {
    fn new() -> SharedBook {
        let (state, _) = watch::channel(BookState {
            version: 0,
            status: SyncStatus::Pending,
            error: None,
        });
        SharedBook { sides: Mutex::new(BookSides::default()), state }
    }

    fn reset(&self, bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)], last_update_id: u64) {
        let mut sides = self.sides.lock();
        sides.bids = bids.iter().filter(|(_, s)| *s > Decimal::ZERO).copied().collect();
        sides.asks = asks.iter().filter(|(_, s)| *s > Decimal::ZERO).copied().collect();
        sides.last_update_id = last_update_id;
        drop(sides);
        self.notify();
    }

    fn apply(&self, bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)], last_update_id: u64) {
        let mut sides = self.sides.lock();
        apply_side(&mut sides.bids, bids);
        apply_side(&mut sides.asks, asks);
        if last_update_id > 0 {
            sides.last_update_id = last_update_id;
        }
        drop(sides);
        self.notify();
    }

    fn last_update_id(&self) -> u64 {
        self.sides.lock().last_update_id
    }

    fn notify(&self) {
        self.state.send_modify(|state| state.version += 1);
    }

    fn mark_ready(&self) {
        self.state.send_modify(|state| {
            if state.status == SyncStatus::Pending {
                state.status = SyncStatus::Ready;
            }
        });
    }

    fn fail(&self, error: &ExchangeError) {
        self.state.send_modify(|state| {
            state.status = SyncStatus::Failed;
            state.error = Some(error.to_string());
        });
    }
}

fn apply_side(side: &mut BTreeMap<Decimal, Decimal>, levels: &[(Decimal, Decimal)]) {
    for (price, size) in levels {
        if *size == Decimal::ZERO {
            side.remove(price);
        } else {
            side.insert(*price, *size);
        }
    }
}

type BookKey = (String, Symbol);

struct BookEntry {
    book: Arc<SharedBook>,
    refcount: usize,
    task: tokio::task::JoinHandle<()>,
}

/// Shared order book component; one per process.
pub struct Orderbook {
    exchanges: HashMap<String, Arc<dyn Exchange>>,
    entries: Arc<Mutex<HashMap<BookKey, BookEntry>>>,
}

impl Orderbook {
    pub fn new(exchanges: Vec<Arc<dyn Exchange>>) -> Orderbook {
        Orderbook {
            exchanges: exchanges.into_iter().map(|e| (e.name().to_owned(), e)).collect(),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquires a synchronized book for `(exchange, symbol)`, sharing the
    /// background sync task with any existing subscribers. Resolves once
    /// the initial sync has completed.
    pub async fn sync(&self, exchange: &str, symbol: &Symbol) -> Result<BookHandle> {
        let exchange_instance = self
            .exchanges
            .get(exchange)
            .cloned()
            .ok_or_else(|| ExchangeError::unexpected(format!("unknown exchange {exchange}")))?;
        let key = (exchange.to_owned(), symbol.clone());

        let book = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.refcount += 1;
                    entry.book.clone()
                }
                None => {
                    let book = Arc::new(SharedBook::new());
                    let task = tokio::spawn(sync_task(
                        exchange_instance,
                        symbol.clone(),
                        book.clone(),
                    ));
                    entries.insert(
                        key.clone(),
                        BookEntry { book: book.clone(), refcount: 1, task },
                    );
                    book
                }
            }
        };

        let mut rx = book.state.subscribe();
        loop {
            let (status, error) = {
                let state = rx.borrow();
                (state.status, state.error.clone())
            };
            match status {
                SyncStatus::Ready => break,
                SyncStatus::Failed => {
                    release(&self.entries, &key);
                    return Err(ExchangeError::unavailable(
                        error.unwrap_or_else(|| "book sync failed".into()),
                    ));
                }
                SyncStatus::Pending => {
                    if rx.changed().await.is_err() {
                        release(&self.entries, &key);
                        return Err(ExchangeError::unavailable("book sync task stopped"));
                    }
                }
            }
        }

        Ok(BookHandle {
            symbol: symbol.clone(),
            key,
            entries: self.entries.clone(),
            rx,
            book,
        })
    }

    /// Number of live background sync tasks.
    pub fn active_books(&self) -> usize {
        self.entries.lock().len()
    }
}

fn release(entries: &Mutex<HashMap<BookKey, BookEntry>>, key: &BookKey) {
    let mut entries = entries.lock();
    if let Some(entry) = entries.get_mut(key) {
        entry.refcount -= 1;
        if entry.refcount == 0 {
            if let Some(entry) = entries.remove(key) {
                entry.task.abort();
            }
        }
    }
}

/// Subscriber view of a synchronized book. Dropping the last handle for a
/// `(exchange, symbol)` pair tears down the sync task.
pub struct BookHandle {
    symbol: Symbol,
    key: BookKey,
    entries: Arc<Mutex<HashMap<BookKey, BookEntry>>>,
    rx: watch::Receiver<BookState>,
    book: Arc<SharedBook>,
}

impl BookHandle {
    /// Resumes once at least one update batch has been applied since the
    /// previous call. Each handle has an independent cursor.
    pub async fn updated(&mut self) -> Result<()> {
        if self.rx.changed().await.is_err() {
            return Err(ExchangeError::unavailable("book sync task stopped"));
        }
        let state = self.rx.borrow_and_update();
        if state.status == SyncStatus::Failed {
            return Err(ExchangeError::unavailable(
                state.error.clone().unwrap_or_else(|| "book sync failed".into()),
            ));
        }
        Ok(())
    }

    /// Asks sorted by price ascending.
    pub fn list_asks(&self) -> Vec<(Decimal, Decimal)> {
        self.book.sides.lock().asks.iter().map(|(p, s)| (*p, *s)).collect()
    }

    /// Bids sorted by price descending.
    pub fn list_bids(&self) -> Vec<(Decimal, Decimal)> {
        self.book.sides.lock().bids.iter().rev().map(|(p, s)| (*p, *s)).collect()
    }

    pub fn last_update_id(&self) -> u64 {
        self.book.last_update_id()
    }

    /// Fills obtained by lifting asks (a buy), by base size or by quote.
    pub fn find_order_asks(
        &self,
        size: Option<Decimal>,
        quote: Option<Decimal>,
        fee_rate: Decimal,
        filters: &Filters,
    ) -> Vec<Fill> {
        find_order_asks(
            &self.list_asks(),
            size,
            quote,
            fee_rate,
            filters,
            self.symbol.base_asset(),
        )
    }

    /// Fills obtained by hitting bids (a sell), by base size or by quote.
    pub fn find_order_bids(
        &self,
        size: Option<Decimal>,
        quote: Option<Decimal>,
        fee_rate: Decimal,
        filters: &Filters,
    ) -> Vec<Fill> {
        find_order_bids(
            &self.list_bids(),
            size,
            quote,
            fee_rate,
            filters,
            self.symbol.quote_asset(),
        )
    }
}

impl Drop for BookHandle {
    fn drop(&mut self) {
        release(&self.entries, &self.key);
    }
}

// =============================================================================
// Sync task
// =============================================================================

async fn sync_task(exchange: Arc<dyn Exchange>, symbol: Symbol, book: Arc<SharedBook>) {
    let mut budget = RetryBudget::new(8, Duration::from_secs(300));
    loop {
        match sync_once(&*exchange, &symbol, &book).await {
            // Sequence gap; resync immediately, subscribers are preserved.
            Ok(()) => debug!(%symbol, "order book out of sync; fetching new snapshot"),
            Err(err) if err.is_transient() => match budget.fail() {
                Some(delay) => {
                    warn!(%symbol, %err, "order book sync failed; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(%symbol, %err, "order book sync retry budget exhausted");
                    book.fail(&err);
                    return;
                }
            },
            Err(err) => {
                warn!(%symbol, %err, "order book sync failed fatally");
                book.fail(&err);
                return;
            }
        }
    }
}

/// Runs one snapshot + update cycle. `Ok(())` requests an immediate
/// resync; errors bubble to the retry loop.
async fn sync_once(
    exchange: &dyn Exchange,
    symbol: &Symbol,
    book: &SharedBook,
) -> Result<()> {
    let mut stream = exchange.connect_stream_depth(symbol).await?;

    if exchange.capabilities().can_stream_depth_snapshot {
        match stream.next().await {
            Some(Ok(Depth::Snapshot { bids, asks, last_update_id })) => {
                book.reset(&bids, &asks, last_update_id);
            }
            Some(Ok(Depth::Update { .. })) => {
                return Err(ExchangeError::unexpected(
                    "expected snapshot as first depth message",
                ));
            }
            Some(Err(err)) => return Err(err),
            None => return Err(ExchangeError::unavailable("depth stream closed")),
        }
    } else {
        match exchange.get_depth(symbol).await? {
            Depth::Snapshot { bids, asks, last_update_id } => {
                book.reset(&bids, &asks, last_update_id);
            }
            Depth::Update { .. } => {
                return Err(ExchangeError::unexpected("snapshot request returned an update"));
            }
        }
    }
    book.mark_ready();

    let mut reconciled = false;
    while let Some(item) = stream.next().await {
        match item? {
            Depth::Snapshot { bids, asks, last_update_id } => {
                book.reset(&bids, &asks, last_update_id);
                reconciled = false;
            }
            Depth::Update { bids, asks, first_update_id, last_update_id } => {
                // Venues without sequence ids are applied as-is.
                if first_update_id == 0 && last_update_id == 0 {
                    book.apply(&bids, &asks, 0);
                    continue;
                }
                let book_last = book.last_update_id();
                if last_update_id <= book_last {
                    continue;
                }
                if !reconciled {
                    if !(first_update_id <= book_last + 1 && book_last + 1 <= last_update_id) {
                        return Ok(());
                    }
                    reconciled = true;
                } else if first_update_id != book_last + 1 {
                    return Ok(());
                }
                book.apply(&bids, &asks, last_update_id);
            }
        }
    }
    Err(ExchangeError::unavailable("depth stream closed"))
}

// =============================================================================
// Book walking
// =============================================================================

fn exactly_one(size: Option<Decimal>, quote: Option<Decimal>) {
    assert!(
        size.is_some() != quote.is_some(),
        "exactly one of size or quote must be requested"
    );
}

/// Walks asks ascending, consuming `min(level, remaining)` per level with
/// filter-aware rounding. Buy fees are charged in base asset.
pub fn find_order_asks(
    asks: &[(Decimal, Decimal)],
    size: Option<Decimal>,
    quote: Option<Decimal>,
    fee_rate: Decimal,
    filters: &Filters,
    base_asset: &str,
) -> Vec<Fill> {
    exactly_one(size, quote);
    let mut result = Vec::new();
    if let Some(size) = size {
        let mut remaining = size;
        for (price, level_size) in asks {
            if remaining <= Decimal::ZERO {
                break;
            }
            let take = filters.size.round_down((*level_size).min(remaining));
            if take == Decimal::ZERO || !filters.min_notional.valid(*price, take) {
                continue;
            }
            let fee = round_half_up(take * fee_rate, filters.base_precision);
            result.push(Fill::with_computed_quote(
                *price,
                take,
                fee,
                base_asset,
                filters.quote_precision,
            ));
            remaining -= take;
        }
    } else if let Some(quote) = quote {
        let mut remaining = quote;
        for (price, level_size) in asks {
            let affordable = remaining / price;
            let take = filters.size.round_down((*level_size).min(affordable));
            // Deeper levels only get more expensive; stop here.
            if take == Decimal::ZERO || !filters.min_notional.valid(*price, take) {
                break;
            }
            let fee = round_half_up(take * fee_rate, filters.base_precision);
            let fill = Fill::with_computed_quote(
                *price,
                take,
                fee,
                base_asset,
                filters.quote_precision,
            );
            remaining -= fill.quote;
            result.push(fill);
        }
    }
    result
}

/// Walks bids descending; sell fees are charged in quote asset.
pub fn find_order_bids(
    bids: &[(Decimal, Decimal)],
    size: Option<Decimal>,
    quote: Option<Decimal>,
    fee_rate: Decimal,
    filters: &Filters,
    quote_asset: &str,
) -> Vec<Fill> {
    exactly_one(size, quote);
    let mut result = Vec::new();
    if let Some(size) = size {
        let mut remaining = size;
        for (price, level_size) in bids {
            if remaining <= Decimal::ZERO {
                break;
            }
            let take = filters.size.round_down((*level_size).min(remaining));
            if take == Decimal::ZERO || !filters.min_notional.valid(*price, take) {
                continue;
            }
            let fee = round_half_up(take * *price * fee_rate, filters.quote_precision);
            result.push(Fill::with_computed_quote(
                *price,
                take,
                fee,
                quote_asset,
                filters.quote_precision,
            ));
            remaining -= take;
        }
    } else if let Some(quote) = quote {
        let mut remaining = quote;
        for (price, level_size) in bids {
            if remaining <= Decimal::ZERO {
                break;
            }
            let wanted = remaining / price;
            let take = filters.size.round_down((*level_size).min(wanted));
            if take == Decimal::ZERO || !filters.min_notional.valid(*price, take) {
                break;
            }
            let fee = round_half_up(take * *price * fee_rate, filters.quote_precision);
            let fill = Fill::with_computed_quote(
                *price,
                take,
                fee,
                quote_asset,
                filters.quote_precision,
            );
            remaining -= fill.quote;
            result.push(fill);
        }
    }
    result
}
