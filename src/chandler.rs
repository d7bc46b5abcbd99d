//! Candle component
//!
//! Streams candles for a `(exchange, symbol, interval)` triple, serving
//! history from storage where coverage exists, fetching and caching the
//! rest from the venue, and tailing the live stream once the requested
//! range crosses the present. Also imports candle history from CSV files.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::errors::{ExchangeError, Result};
use crate::exchanges::{Exchange, ExchangeStream};
use crate::storage::Storage;
use crate::time::{self, floor_timestamp, Interval, Timestamp};
use crate::types::{Candle, Symbol};

const CANDLE_SHARD: &str = "candle";

fn candle_key(exchange: &str, symbol: &Symbol, interval: Interval) -> String {
    format!("{exchange}:{symbol}:{}", time::format_interval(interval))
}

pub struct Chandler {
    storage: Arc<dyn Storage>,
    exchanges: HashMap<String, Arc<dyn Exchange>>,
}

impl Chandler {
    pub fn new(storage: Arc<dyn Storage>, exchanges: Vec<Arc<dyn Exchange>>) -> Chandler {
        Chandler {
            storage,
            exchanges: exchanges.into_iter().map(|e| (e.name().to_owned(), e)).collect(),
        }
    }

    fn exchange(&self, exchange: &str) -> Result<Arc<dyn Exchange>> {
        self.exchanges
            .get(exchange)
            .cloned()
            .ok_or_else(|| ExchangeError::unexpected(format!("unknown exchange {exchange}")))
    }

    /// Earliest candle available on the venue.
    pub async fn get_first_candle(
        &self,
        exchange: &str,
        symbol: &Symbol,
        interval: Interval,
    ) -> Result<Candle> {
        let exchange_instance = self.exchange(exchange)?;
        let mut stream = exchange_instance
            .stream_historical_candles(symbol, interval, 0, time::now())
            .await?;
        match stream.next().await {
            Some(candle) => candle,
            None => Err(ExchangeError::unexpected(format!("no candles for {symbol}"))),
        }
    }

    /// Most recent closed candle.
    pub async fn get_last_candle(
        &self,
        exchange: &str,
        symbol: &Symbol,
        interval: Interval,
    ) -> Result<Candle> {
        let exchange_instance = self.exchange(exchange)?;
        let now = time::now();
        let start = floor_timestamp(now, interval).saturating_sub(2 * interval);
        let mut stream = exchange_instance
            .stream_historical_candles(symbol, interval, start, now)
            .await?;
        let mut last = None;
        while let Some(candle) = stream.next().await {
            last = Some(candle?);
        }
        last.ok_or_else(|| ExchangeError::unexpected(format!("no recent candles for {symbol}")))
    }

    /// Streams closed candles for `[start, end)`, caching fetched history.
    /// Candle times are interval-aligned and strictly increasing; missing
    /// intervals are skipped.
    pub async fn stream_candles(
        &self,
        exchange: &str,
        symbol: &Symbol,
        interval: Interval,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<ExchangeStream<Candle>> {
        let exchange_instance = self.exchange(exchange)?;
        let storage = self.storage.clone();
        let symbol = symbol.clone();
        let exchange = exchange.to_owned();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let result = drive_candles(
                &*exchange_instance,
                &*storage,
                &exchange,
                &symbol,
                interval,
                start,
                end,
                &tx,
            )
            .await;
            if let Err(err) = result {
                let _ = tx.send(Err(err)).await;
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    /// Like [`Chandler::stream_candles`] but emits one item per interval
    /// slot: `Some` when a closed candle arrived, `None` when the slot
    /// passed without one (venue outage or an illiquid market).
    pub async fn stream_candles_fill_missing_with_none(
        &self,
        exchange: &str,
        symbol: &Symbol,
        interval: Interval,
        start: Timestamp,
        end: Timestamp,
        exchange_timeout: Option<Interval>,
    ) -> Result<ExchangeStream<Option<Candle>>> {
        let inner = self.stream_candles(exchange, symbol, interval, start, end).await?;
        let (tx, rx) = mpsc::channel(64);
        let live = end > time::now();

        tokio::spawn(async move {
            let mut inner = inner;
            let mut next = floor_timestamp(start, interval);
            'outer: while next < end {
                let candle = if live {
                    // Allow one interval plus grace before declaring the
                    // slot missed.
                    let deadline = Duration::from_millis(
                        interval + exchange_timeout.unwrap_or(interval / 2),
                    );
                    match tokio::time::timeout(deadline, inner.next()).await {
                        Ok(item) => item,
                        Err(_) => {
                            if tx.send(Ok(None)).await.is_err() {
                                break 'outer;
                            }
                            next += interval;
                            continue;
                        }
                    }
                } else {
                    inner.next().await
                };

                match candle {
                    Some(Ok(candle)) => {
                        if candle.time < next {
                            continue;
                        }
                        while candle.time > next {
                            if tx.send(Ok(None)).await.is_err() {
                                break 'outer;
                            }
                            next += interval;
                            if next >= end {
                                break 'outer;
                            }
                        }
                        if tx.send(Ok(Some(candle))).await.is_err() {
                            break 'outer;
                        }
                        next += interval;
                    }
                    Some(Err(err)) => {
                        let _ = tx.send(Err(err)).await;
                        break;
                    }
                    None => {
                        // Historical range exhausted; backfill the tail
                        // with misses.
                        while next < end {
                            if tx.send(Ok(None)).await.is_err() {
                                break 'outer;
                            }
                            next += interval;
                        }
                        break;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    /// Imports candles from a CSV file into storage. Columns: time (ms),
    /// open, high, low, close, volume.
    pub async fn import_csv(
        &self,
        exchange: &str,
        symbol: &Symbol,
        interval: Interval,
        path: impl AsRef<Path>,
    ) -> Result<usize> {
        let mut reader = csv::Reader::from_path(path.as_ref())
            .map_err(|err| ExchangeError::unexpected(format!("csv open: {err}")))?;
        let mut items = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record
                .map_err(|err| ExchangeError::unexpected(format!("csv row {row}: {err}")))?;
            let field = |index: usize| -> Result<&str> {
                record.get(index).ok_or_else(|| {
                    ExchangeError::unexpected(format!("csv row {row}: missing column {index}"))
                })
            };
            let decimal = |index: usize| -> Result<Decimal> {
                field(index)?.trim().parse().map_err(|err| {
                    ExchangeError::unexpected(format!("csv row {row}: {err}"))
                })
            };
            let candle = Candle {
                time: field(0)?.trim().parse().map_err(|err| {
                    ExchangeError::unexpected(format!("csv row {row}: bad time: {err}"))
                })?,
                open: decimal(1)?,
                high: decimal(2)?,
                low: decimal(3)?,
                close: decimal(4)?,
                volume: decimal(5)?,
                closed: true,
            };
            items.push((candle.time, serde_json::to_value(candle).map_err(|err| {
                ExchangeError::unexpected(format!("csv row {row}: {err}"))
            })?));
        }
        if items.is_empty() {
            return Ok(0);
        }

        let count = items.len();
        let start = items[0].0;
        let end = items[count - 1].0 + interval;
        info!(%symbol, count, "imported candles from {}", path.as_ref().display());
        self.storage
            .store_time_series_and_span(
                CANDLE_SHARD,
                &candle_key(exchange, symbol, interval),
                items,
                start,
                end,
            )
            .await?;
        Ok(count)
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_candles(
    exchange: &dyn Exchange,
    storage: &dyn Storage,
    exchange_name: &str,
    symbol: &Symbol,
    interval: Interval,
    start: Timestamp,
    end: Timestamp,
    tx: &mpsc::Sender<Result<Candle>>,
) -> Result<()> {
    let start = floor_timestamp(start, interval);
    let now = time::now();
    let historical_end = end.min(floor_timestamp(now, interval));
    let key = candle_key(exchange_name, symbol, interval);

    // Serve covered ranges from storage, fetch and cache the gaps.
    let mut cursor = start;
    if historical_end > start {
        let spans = storage
            .stream_time_series_spans(CANDLE_SHARD, &key, start, historical_end)
            .await?;
        for (span_start, span_end) in spans.into_iter().chain([(historical_end, historical_end)])
        {
            if cursor < span_start {
                fetch_and_cache(exchange, storage, &key, symbol, interval, cursor, span_start, tx)
                    .await?;
            }
            if span_end > span_start {
                debug!(%symbol, "serving candles {} from storage",
                    time::format_span(span_start, span_end));
                for (_, value) in storage
                    .stream_time_series(CANDLE_SHARD, &key, span_start, span_end)
                    .await?
                {
                    let candle: Candle = serde_json::from_value(value)
                        .map_err(|err| ExchangeError::unexpected(format!("bad candle: {err}")))?;
                    if tx.send(Ok(candle)).await.is_err() {
                        return Ok(());
                    }
                }
            }
            cursor = cursor.max(span_end);
        }
    }

    // Tail live candles for the remainder.
    if end > historical_end {
        let mut stream = exchange.connect_stream_candles(symbol, interval).await?;
        while let Some(candle) = stream.next().await {
            let candle = candle?;
            if !candle.closed || candle.time < cursor {
                continue;
            }
            if candle.time >= end {
                break;
            }
            cursor = candle.time + interval;
            if tx.send(Ok(candle)).await.is_err() {
                return Ok(());
            }
            if cursor >= end {
                break;
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn fetch_and_cache(
    exchange: &dyn Exchange,
    storage: &dyn Storage,
    key: &str,
    symbol: &Symbol,
    interval: Interval,
    start: Timestamp,
    end: Timestamp,
    tx: &mpsc::Sender<Result<Candle>>,
) -> Result<()> {
    debug!(%symbol, "fetching candles {}", time::format_span(start, end));
    let mut stream = exchange.stream_historical_candles(symbol, interval, start, end).await?;
    let mut items = Vec::new();
    while let Some(candle) = stream.next().await {
        let candle = candle?;
        items.push((
            candle.time,
            serde_json::to_value(candle)
                .map_err(|err| ExchangeError::unexpected(format!("bad candle: {err}")))?,
        ));
        if tx.send(Ok(candle)).await.is_err() {
            return Ok(());
        }
    }
    let result = storage.store_time_series_and_span(CANDLE_SHARD, key, items, start, end).await;
    if let Err(err) = result {
        warn!(%symbol, %err, "failed to cache candles");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::Fake;
    use crate::storage::Memory;
    use crate::time::MIN_MS;
    use rust_decimal_macros::dec;

    fn candle(time: Timestamp) -> Candle {
        Candle {
            time,
            open: dec!(1),
            high: dec!(1),
            low: dec!(1),
            close: dec!(1),
            volume: dec!(1),
            closed: true,
        }
    }

    #[tokio::test]
    async fn test_stream_historical_candles_cached() {
        let fake = Arc::new(Fake::new());
        let symbol = Symbol::new("eth-btc");
        fake.set_candles(
            symbol.clone(),
            MIN_MS,
            vec![candle(0), candle(MIN_MS), candle(2 * MIN_MS)],
        );
        let storage = Arc::new(Memory::new());
        let chandler = Chandler::new(storage.clone(), vec![fake.clone()]);

        let candles: Vec<_> = chandler
            .stream_candles("fake", &symbol, MIN_MS, 0, 3 * MIN_MS)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(candles.len(), 3);
        assert!(candles.iter().all(|c| c.is_ok()));

        // Second read is served from storage.
        fake.set_candles(symbol.clone(), MIN_MS, vec![]);
        let candles: Vec<_> = chandler
            .stream_candles("fake", &symbol, MIN_MS, 0, 3 * MIN_MS)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(candles.len(), 3);
    }

    #[tokio::test]
    async fn test_fill_missing_with_none() {
        let fake = Arc::new(Fake::new());
        let symbol = Symbol::new("eth-btc");
        // Slot at MIN_MS is missing.
        fake.set_candles(symbol.clone(), MIN_MS, vec![candle(0), candle(2 * MIN_MS)]);
        let chandler = Chandler::new(Arc::new(Memory::new()), vec![fake]);

        let items: Vec<_> = chandler
            .stream_candles_fill_missing_with_none("fake", &symbol, MIN_MS, 0, 4 * MIN_MS, None)
            .await
            .unwrap()
            .collect()
            .await;
        let items: Vec<_> = items.into_iter().map(|i| i.unwrap()).collect();
        assert_eq!(items.len(), 4);
        assert!(items[0].is_some());
        assert!(items[1].is_none());
        assert!(items[2].is_some());
        assert!(items[3].is_none());
    }

    #[tokio::test]
    async fn test_get_first_candle() {
        let fake = Arc::new(Fake::new());
        let symbol = Symbol::new("eth-btc");
        fake.set_candles(symbol.clone(), MIN_MS, vec![candle(5 * MIN_MS), candle(6 * MIN_MS)]);
        let chandler = Chandler::new(Arc::new(Memory::new()), vec![fake]);
        let first = chandler.get_first_candle("fake", &symbol, MIN_MS).await.unwrap();
        assert_eq!(first.time, 5 * MIN_MS);
    }
}
