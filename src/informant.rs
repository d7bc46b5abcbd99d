//! Exchange metadata cache
//!
//! Fetches and periodically refreshes venue metadata (asset precisions,
//! fees, filters, borrow terms) and serves it to every other component
//! without further venue round-trips. Readers observe an atomic reference
//! swap on refresh. Fetched info is persisted so restarts within the TTL
//! skip the venue call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::errors::{ExchangeError, Result};
use crate::exchanges::{Exchange, ExchangeInfo};
use crate::filters::Filters;
use crate::storage::{self, Storage};
use crate::sync::RetryBudget;
use crate::time::{now, Timestamp};
use crate::types::{keyed, AssetInfo, BorrowInfo, Fees, Symbol, Ticker};

const EXCHANGE_INFO_SHARD: &str = "exchange_info";
const DEFAULT_TTL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(serde::Serialize, serde::Deserialize)]
struct CachedInfo {
    time: Timestamp,
    info: ExchangeInfo,
}

pub struct Informant {
    exchanges: HashMap<String, Arc<dyn Exchange>>,
    cache: Arc<RwLock<HashMap<String, Arc<ExchangeInfo>>>>,
    refresh_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Informant {
    /// Performs the initial metadata sync for every exchange and spawns
    /// per-exchange refresh tasks.
    pub async fn connect(
        storage: Arc<dyn Storage>,
        exchanges: Vec<Arc<dyn Exchange>>,
    ) -> Result<Informant> {
        let exchanges: HashMap<String, Arc<dyn Exchange>> =
            exchanges.into_iter().map(|e| (e.name().to_owned(), e)).collect();
        let cache = Arc::new(RwLock::new(HashMap::new()));

        let mut refresh_tasks = Vec::new();
        for (name, exchange) in &exchanges {
            let info = fetch_or_load(&*storage, &**exchange, name).await?;
            cache.write().insert(name.clone(), Arc::new(info));

            let cache = cache.clone();
            let storage = storage.clone();
            let exchange = exchange.clone();
            let name = name.clone();
            refresh_tasks.push(tokio::spawn(async move {
                refresh_periodically(cache, storage, exchange, name).await;
            }));
        }

        info!("ready");
        Ok(Informant { exchanges, cache, refresh_tasks })
    }

    fn info(&self, exchange: &str) -> Result<Arc<ExchangeInfo>> {
        self.cache
            .read()
            .get(exchange)
            .cloned()
            .ok_or_else(|| ExchangeError::unexpected(format!("unknown exchange {exchange}")))
    }

    pub fn get_fees_filters(&self, exchange: &str, symbol: &Symbol) -> Result<(Fees, Filters)> {
        let info = self.info(exchange)?;
        let fees = keyed(&info.fees, symbol.as_str()).copied().ok_or_else(|| {
            ExchangeError::unexpected(format!("no fees for {symbol} on {exchange}"))
        })?;
        let filters = keyed(&info.filters, symbol.as_str()).copied().ok_or_else(|| {
            ExchangeError::unexpected(format!("no filters for {symbol} on {exchange}"))
        })?;
        Ok((fees, filters))
    }

    pub fn get_asset_info(&self, exchange: &str, asset: &str) -> Result<AssetInfo> {
        let info = self.info(exchange)?;
        Ok(keyed(&info.assets, asset).copied().unwrap_or_default())
    }

    /// Borrow terms for an asset on an account; `account_key` is the
    /// isolated margin symbol or `"__all__"`.
    pub fn get_borrow_info(
        &self,
        exchange: &str,
        account_key: &str,
        asset: &str,
    ) -> Result<BorrowInfo> {
        let info = self.info(exchange)?;
        keyed(&info.borrow_info, account_key)
            .and_then(|by_asset| keyed(by_asset, asset))
            .copied()
            .ok_or_else(|| {
                ExchangeError::unexpected(format!(
                    "no borrow info for {asset} on {exchange} account {account_key}"
                ))
            })
    }

    /// Tickers matching `symbol_patterns` minus `exclude_symbol_patterns`,
    /// sorted by quote volume descending. Optionally restricted to symbols
    /// tradable spot / on isolated margin.
    pub async fn map_tickers(
        &self,
        exchange: &str,
        symbol_patterns: &[String],
        exclude_symbol_patterns: &[String],
        spot: bool,
        isolated_margin: bool,
    ) -> Result<Vec<(Symbol, Ticker)>> {
        let exchange_instance = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| ExchangeError::unexpected(format!("unknown exchange {exchange}")))?;
        let info = self.info(exchange)?;
        let tickers = exchange_instance.map_tickers().await?;

        let mut result: Vec<(Symbol, Ticker)> = tickers
            .into_iter()
            .filter(|(symbol, _)| {
                symbol_patterns.iter().any(|p| pattern_matches(p, symbol.as_str()))
                    && !exclude_symbol_patterns
                        .iter()
                        .any(|p| pattern_matches(p, symbol.as_str()))
            })
            .filter(|(symbol, _)| {
                let Some(filters) = keyed(&info.filters, symbol.as_str()) else {
                    return false;
                };
                (!spot || filters.spot) && (!isolated_margin || filters.isolated_margin)
            })
            .collect();
        result.sort_by(|(_, a), (_, b)| b.quote_volume.cmp(&a.quote_volume));
        Ok(result)
    }
}

impl Drop for Informant {
    fn drop(&mut self) {
        for task in &self.refresh_tasks {
            task.abort();
        }
    }
}

/// Glob-lite matching: `*` matches any run of characters.
pub(crate) fn pattern_matches(pattern: &str, value: &str) -> bool {
    fn inner(pattern: &[u8], value: &[u8]) -> bool {
        match (pattern.first(), value.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], value)
                    || (!value.is_empty() && inner(pattern, &value[1..]))
            }
            (Some(p), Some(v)) if p == v => inner(&pattern[1..], &value[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}

async fn fetch_or_load(
    storage: &dyn Storage,
    exchange: &dyn Exchange,
    name: &str,
) -> Result<ExchangeInfo> {
    let cached: Option<CachedInfo> = storage::get_typed(storage, EXCHANGE_INFO_SHARD, name)
        .await
        .ok()
        .flatten();
    if let Some(cached) = cached {
        if now().saturating_sub(cached.time) < DEFAULT_TTL.as_millis() as u64 {
            info!(exchange = name, "using cached exchange info");
            return Ok(cached.info);
        }
    }

    let info = exchange.get_exchange_info().await?;
    let result = storage::set_typed(
        storage,
        EXCHANGE_INFO_SHARD,
        name,
        &CachedInfo { time: now(), info: info.clone() },
    )
    .await;
    if let Err(err) = result {
        warn!(exchange = name, %err, "failed to persist exchange info");
    }
    Ok(info)
}

async fn refresh_periodically(
    cache: Arc<RwLock<HashMap<String, Arc<ExchangeInfo>>>>,
    storage: Arc<dyn Storage>,
    exchange: Arc<dyn Exchange>,
    name: String,
) {
    let mut budget = RetryBudget::new(8, Duration::from_secs(300));
    loop {
        tokio::time::sleep(DEFAULT_TTL).await;
        loop {
            match exchange.get_exchange_info().await {
                Ok(info) => {
                    let result = storage::set_typed(
                        &*storage,
                        EXCHANGE_INFO_SHARD,
                        &name,
                        &CachedInfo { time: now(), info: info.clone() },
                    )
                    .await;
                    if let Err(err) = result {
                        warn!(exchange = %name, %err, "failed to persist exchange info");
                    }
                    cache.write().insert(name.clone(), Arc::new(info));
                    info!(exchange = %name, "exchange info refreshed");
                    break;
                }
                Err(err) if err.is_transient() => match budget.fail() {
                    Some(delay) => {
                        warn!(exchange = %name, %err, "exchange info refresh failed; retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!(exchange = %name, %err, "exchange info refresh budget exhausted");
                        return;
                    }
                },
                Err(err) => {
                    warn!(exchange = %name, %err, "exchange info refresh failed fatally");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::Fake;
    use crate::storage::Memory;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("*-btc", "eth-btc"));
        assert!(!pattern_matches("*-btc", "eth-usdt"));
        assert!(pattern_matches("eth-*", "eth-btc"));
        assert!(pattern_matches("*", "anything"));
        assert!(!pattern_matches("eth-btc", "eth-usdt"));
    }

    #[tokio::test]
    async fn test_fees_filters_fallback() {
        let fake = Arc::new(Fake::new());
        let informant =
            Informant::connect(Arc::new(Memory::new()), vec![fake]).await.unwrap();
        let (fees, filters) =
            informant.get_fees_filters("fake", &Symbol::new("eth-btc")).unwrap();
        assert_eq!(fees, Fees::default());
        assert_eq!(filters.base_precision, 8);
    }

    #[tokio::test]
    async fn test_map_tickers_ranked_and_filtered() {
        let fake = Arc::new(Fake::new());
        let mut tickers = HashMap::new();
        for (symbol, volume) in
            [("eth-btc", dec!(10)), ("ltc-btc", dec!(20)), ("xmr-usdt", dec!(30))]
        {
            tickers.insert(
                Symbol::new(symbol),
                Ticker { volume, quote_volume: volume, price: dec!(1) },
            );
        }
        fake.set_tickers(tickers);
        let informant =
            Informant::connect(Arc::new(Memory::new()), vec![fake]).await.unwrap();

        let result = informant
            .map_tickers("fake", &["*-btc".into()], &[], false, false)
            .await
            .unwrap();
        let symbols: Vec<_> = result.iter().map(|(s, _)| s.as_str().to_owned()).collect();
        assert_eq!(symbols, ["ltc-btc", "eth-btc"]);

        let result = informant
            .map_tickers("fake", &["*-btc".into()], &["ltc-*".into()], false, false)
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].0.as_str(), "eth-btc");
    }

    #[tokio::test]
    async fn test_cached_info_skips_fetch() {
        let storage: Arc<dyn Storage> = Arc::new(Memory::new());
        let fake = Arc::new(Fake::new());
        {
            let _informant =
                Informant::connect(storage.clone(), vec![fake.clone()]).await.unwrap();
        }
        // Second connect within the TTL loads from storage.
        let cached: Option<serde_json::Value> =
            storage.get(EXCHANGE_INFO_SHARD, "fake").await.unwrap();
        assert!(cached.is_some());
        let _informant = Informant::connect(storage, vec![fake]).await.unwrap();
    }
}
