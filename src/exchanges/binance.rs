//! Binance venue adapter
//!
//! REST for request/response operations, WebSocket for market data and the
//! user data stream. Maps venue-specific shapes into the engine's uniform
//! contract. Symbols use the venue's concatenated upper-case form on the
//! wire and the engine's `base-quote` form everywhere else.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::errors::{BadOrder, ExchangeError, Result};
use crate::filters::{Filters, MinNotional, Price, Size};
use crate::order::{CancelledReason, Fill, OrderResult, OrderStatus, OrderType, OrderUpdate, TimeInForce};
use crate::orderbook::Depth;
use crate::time::{format_interval, Interval, Timestamp};
use crate::types::{
    Account, Asset, AssetInfo, Balance, BorrowInfo, Candle, Fees, Side, Symbol, Ticker, Trade,
};

use super::{
    Capabilities, EditOrder, Exchange, ExchangeInfo, ExchangeStream, MarginPosition, NewOrder,
    Transfer,
};

type HmacSha256 = Hmac<Sha256>;

const API_BASE_URL: &str = "https://api.binance.com";
const WS_BASE_URL: &str = "wss://stream.binance.com:9443";
const USER_DATA_KEEPALIVE: Duration = Duration::from_secs(30 * 60);

// Known quote assets, longest first, for splitting concatenated symbols.
const QUOTE_ASSETS: [&str; 7] = ["usdt", "usdc", "tusd", "busd", "btc", "eth", "bnb"];

pub struct Binance {
    api_key: String,
    api_secret: String,
    client: reqwest::Client,
}

impl Binance {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Binance {
        Binance {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            client: reqwest::Client::new(),
        }
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&str, String)>,
        signed: bool,
    ) -> Result<T> {
        let mut query: Vec<(String, String)> =
            params.into_iter().map(|(k, v)| (k.to_owned(), v)).collect();
        if signed {
            query.push(("timestamp".into(), crate::time::now().to_string()));
            let payload = query
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");
            query.push(("signature".into(), self.sign(&payload)));
        }

        let url = format!("{API_BASE_URL}{path}");
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .query(&query)
            .send()
            .await
            .map_err(|err| ExchangeError::unavailable(format!("{path}: {err}")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|err| ExchangeError::unexpected(format!("{path}: bad body: {err}")));
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(ExchangeError::unavailable(format!("{path}: {status}: {body}")));
        }
        Err(map_client_error(&body))
    }

    /// Opens a raw market data socket yielding parsed JSON messages.
    async fn connect_ws(&self, path: &str) -> Result<ExchangeStream<serde_json::Value>> {
        let url = format!("{WS_BASE_URL}{path}");
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ExchangeError::unavailable(format!("{url}: {err}")))?;
        Ok(socket
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => Some(
                        serde_json::from_str(&text)
                            .map_err(|err| ExchangeError::unexpected(format!("bad ws json: {err}"))),
                    ),
                    Ok(_) => None,
                    Err(err) => {
                        Some(Err(ExchangeError::unavailable(format!("ws read: {err}"))))
                    }
                }
            })
            .boxed())
    }

    /// Opens the user data stream for an account: fetches a listen key,
    /// keeps it alive, and forwards parsed events. The background task
    /// stops when the returned stream is dropped.
    async fn connect_user_data(
        &self,
        account: Account,
    ) -> Result<ExchangeStream<serde_json::Value>> {
        let (path, params) = match &account {
            Account::Spot => ("/api/v3/userDataStream", Vec::new()),
            Account::Margin => ("/sapi/v1/userDataStream", Vec::new()),
            Account::Isolated(symbol) => (
                "/sapi/v1/userDataStream/isolated",
                vec![("symbol", to_ws_symbol(symbol).to_uppercase())],
            ),
        };
        let listen_key: ListenKey =
            self.request(Method::POST, path, params.clone(), false).await?;

        let socket_stream = self.connect_ws(&format!("/ws/{}", listen_key.listen_key)).await?;
        let (tx, rx) = mpsc::channel(256);

        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let keepalive_path = path.to_owned();
        let keepalive_params = params;
        let key = listen_key.listen_key.clone();
        tokio::spawn(async move {
            let mut socket_stream = socket_stream;
            let mut keepalive = tokio::time::interval(USER_DATA_KEEPALIVE);
            keepalive.tick().await;
            loop {
                tokio::select! {
                    message = socket_stream.next() => match message {
                        Some(message) => {
                            if tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = tx
                                .send(Err(ExchangeError::unavailable("user data stream closed")))
                                .await;
                            break;
                        }
                    },
                    _ = keepalive.tick() => {
                        let mut query: Vec<(String, String)> = keepalive_params
                            .iter()
                            .map(|(k, v)| ((*k).to_owned(), v.clone()))
                            .collect();
                        query.push(("listenKey".into(), key.clone()));
                        let result = client
                            .put(format!("{API_BASE_URL}{keepalive_path}"))
                            .header("X-MBX-APIKEY", &api_key)
                            .query(&query)
                            .send()
                            .await;
                        if let Err(err) = result {
                            warn!("user data keepalive failed: {err}");
                        }
                    }
                }
            }
            debug!("user data stream task finished");
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    fn order_params(&self, order: &NewOrder) -> Result<(String, Vec<(&'static str, String)>)> {
        let mut params: Vec<(&'static str, String)> = vec![
            ("symbol", to_ws_symbol(&order.symbol).to_uppercase()),
            ("side", match order.side {
                Side::Buy => "BUY".into(),
                Side::Sell => "SELL".into(),
            }),
            ("type", match order.type_ {
                OrderType::Market => "MARKET".into(),
                OrderType::Limit => "LIMIT".into(),
            }),
        ];
        if let Some(size) = order.size {
            params.push(("quantity", size.normalize().to_string()));
        }
        if let Some(quote) = order.quote {
            params.push(("quoteOrderQty", quote.normalize().to_string()));
        }
        if let Some(price) = order.price {
            params.push(("price", price.normalize().to_string()));
        }
        if let Some(time_in_force) = order.time_in_force {
            params.push(("timeInForce", match time_in_force {
                TimeInForce::Gtc => "GTC".into(),
                TimeInForce::Ioc => "IOC".into(),
                TimeInForce::Fok => "FOK".into(),
            }));
        }
        if let Some(client_id) = &order.client_id {
            params.push(("newClientOrderId", client_id.clone()));
        }
        if order.leverage.is_some() || order.reduce_only {
            return Err(ExchangeError::Unsupported("leveraged orders"));
        }
        let path = match &order.account {
            Account::Spot => "/api/v3/order".to_owned(),
            Account::Margin | Account::Isolated(_) => {
                if let Account::Isolated(_) = order.account {
                    params.push(("isIsolated", "TRUE".into()));
                }
                "/sapi/v1/margin/order".to_owned()
            }
        };
        Ok((path, params))
    }
}

fn map_client_error(body: &str) -> ExchangeError {
    #[derive(Deserialize)]
    struct ApiError {
        code: i64,
        msg: String,
    }
    match serde_json::from_str::<ApiError>(body) {
        Ok(err) => match err.code {
            -2010 => BadOrder::InsufficientFunds(err.msg).into(),
            -2011 | -2013 => BadOrder::OrderMissing(err.msg).into(),
            -1013 | -2021 => BadOrder::Rejected(err.msg).into(),
            _ => ExchangeError::unexpected(format!("api error {}: {}", err.code, err.msg)),
        },
        Err(_) => ExchangeError::unexpected(format!("unparseable api error: {body}")),
    }
}

/// `"eth-btc"` -> `"ethbtc"` (lower-case stream form).
fn to_ws_symbol(symbol: &Symbol) -> String {
    let (base, quote) = symbol.assets();
    format!("{base}{quote}")
}

/// `"ETHBTC"` -> `"eth-btc"`; `None` when the quote asset is unknown.
fn from_exchange_symbol(raw: &str) -> Option<Symbol> {
    let lower = raw.to_lowercase();
    for quote in QUOTE_ASSETS {
        if let Some(base) = lower.strip_suffix(quote) {
            if !base.is_empty() {
                return Some(Symbol::new(format!("{base}-{quote}")));
            }
        }
    }
    None
}

fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|err| ExchangeError::unexpected(format!("bad decimal {raw:?}: {err}")))
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<(Decimal, Decimal)>> {
    raw.iter()
        .map(|[price, size]| Ok((parse_decimal(price)?, parse_decimal(size)?)))
        .collect()
}

fn ws_interval(interval: Interval) -> String {
    format_interval(interval)
}

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKey {
    listen_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExchangeInfo {
    symbols: Vec<RawSymbolInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSymbolInfo {
    symbol: String,
    status: String,
    base_asset_precision: u32,
    quote_asset_precision: u32,
    is_spot_trading_allowed: bool,
    is_margin_trading_allowed: bool,
    filters: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDepth {
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Deserialize)]
struct RawTicker {
    symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    volume: Decimal,
    #[serde(rename = "quoteVolume", with = "rust_decimal::serde::str")]
    quote_volume: Decimal,
    #[serde(rename = "lastPrice", with = "rust_decimal::serde::str")]
    last_price: Decimal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAccount {
    balances: Vec<RawBalance>,
}

#[derive(Deserialize)]
struct RawBalance {
    asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    free: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    locked: Decimal,
    #[serde(default)]
    borrowed: Option<String>,
    #[serde(default)]
    interest: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIsolatedAccount {
    assets: Vec<RawIsolatedPair>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIsolatedPair {
    symbol: String,
    base_asset: RawMarginAsset,
    quote_asset: RawMarginAsset,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMarginAsset {
    asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    free: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    locked: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    borrowed: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    interest: Decimal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrderResult {
    #[serde(default)]
    transact_time: Option<u64>,
    #[serde(default)]
    fills: Vec<RawOrderFill>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrderFill {
    #[serde(with = "rust_decimal::serde::str")]
    price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    commission: Decimal,
    commission_asset: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMaxBorrowable {
    #[serde(with = "rust_decimal::serde::str")]
    amount: Decimal,
}

// =============================================================================
// Exchange impl
// =============================================================================

#[async_trait]
impl Exchange for Binance {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            can_stream_depth_snapshot: false,
            can_margin_trade: true,
            can_margin_borrow: true,
            can_margin_order_leverage: false,
            can_place_market_order: true,
            can_place_market_order_quote: true,
            can_edit_order: true,
            can_edit_order_atomic: false,
            can_get_market_order_result_direct: true,
            can_stream_balances: true,
            can_stream_historical_earliest_candle: true,
            can_list_all_tickers: true,
        }
    }

    async fn get_exchange_info(&self) -> Result<ExchangeInfo> {
        let raw: RawExchangeInfo =
            self.request(Method::GET, "/api/v3/exchangeInfo", vec![], false).await?;

        let mut info = ExchangeInfo::default();
        // Spot/margin fee schedule is account-wide unless overridden.
        info.fees.insert(
            "__all__".into(),
            Fees { maker: Decimal::new(1, 3), taker: Decimal::new(1, 3) },
        );
        for raw_symbol in raw.symbols {
            if raw_symbol.status != "TRADING" {
                continue;
            }
            let Some(symbol) = from_exchange_symbol(&raw_symbol.symbol) else {
                continue;
            };

            let mut filters = Filters {
                base_precision: raw_symbol.base_asset_precision,
                quote_precision: raw_symbol.quote_asset_precision,
                spot: raw_symbol.is_spot_trading_allowed,
                cross_margin: raw_symbol.is_margin_trading_allowed,
                isolated_margin: raw_symbol.is_margin_trading_allowed,
                ..Default::default()
            };
            for filter in &raw_symbol.filters {
                let Some(filter_type) = filter.get("filterType").and_then(|v| v.as_str()) else {
                    continue;
                };
                let field = |name: &str| -> Result<Decimal> {
                    parse_decimal(filter.get(name).and_then(|v| v.as_str()).unwrap_or("0"))
                };
                match filter_type {
                    "PRICE_FILTER" => {
                        filters.price = Price {
                            min: field("minPrice")?,
                            max: field("maxPrice")?,
                            step: field("tickSize")?,
                        };
                    }
                    "LOT_SIZE" => {
                        filters.size = Size {
                            min: field("minQty")?,
                            max: field("maxQty")?,
                            step: field("stepSize")?,
                        };
                    }
                    "MIN_NOTIONAL" | "NOTIONAL" => {
                        filters.min_notional =
                            MinNotional { min_notional: field("minNotional")? };
                    }
                    _ => {}
                }
            }

            let (base, quote) = symbol.assets();
            info.assets
                .entry(base.to_owned())
                .or_insert(AssetInfo { precision: filters.base_precision });
            info.assets
                .entry(quote.to_owned())
                .or_insert(AssetInfo { precision: filters.quote_precision });
            info.filters.insert(symbol.as_str().to_owned(), filters);
        }

        // Hourly interest, limit refreshed per account on demand.
        let mut borrow = crate::types::KeyedBy::new();
        borrow.insert(
            "__all__".into(),
            BorrowInfo {
                limit: Decimal::ZERO,
                interest_interval: crate::time::HOUR_MS,
                interest_rate: Decimal::new(1, 5),
                interest_charge: Default::default(),
            },
        );
        info.borrow_info.insert("__all__".into(), borrow);

        Ok(info)
    }

    async fn map_tickers(&self) -> Result<HashMap<Symbol, Ticker>> {
        let raw: Vec<RawTicker> =
            self.request(Method::GET, "/api/v3/ticker/24hr", vec![], false).await?;
        Ok(raw
            .into_iter()
            .filter_map(|t| {
                let symbol = from_exchange_symbol(&t.symbol)?;
                Some((
                    symbol,
                    Ticker {
                        volume: t.volume,
                        quote_volume: t.quote_volume,
                        price: t.last_price,
                    },
                ))
            })
            .collect())
    }

    async fn map_balances(
        &self,
        account: Account,
    ) -> Result<HashMap<Account, HashMap<Asset, Balance>>> {
        let mut result = HashMap::new();
        match &account {
            Account::Spot => {
                let raw: RawAccount =
                    self.request(Method::GET, "/api/v3/account", vec![], true).await?;
                let balances = raw
                    .balances
                    .into_iter()
                    .map(|b| {
                        Ok((
                            b.asset.to_lowercase(),
                            Balance {
                                available: b.free,
                                hold: b.locked,
                                borrowed: b
                                    .borrowed
                                    .as_deref()
                                    .map(parse_decimal)
                                    .transpose()?
                                    .unwrap_or_default(),
                                interest: b
                                    .interest
                                    .as_deref()
                                    .map(parse_decimal)
                                    .transpose()?
                                    .unwrap_or_default(),
                            },
                        ))
                    })
                    .collect::<Result<_>>()?;
                result.insert(Account::Spot, balances);
            }
            Account::Margin | Account::Isolated(_) => {
                let params = match &account {
                    Account::Isolated(symbol) => {
                        vec![("symbols", to_ws_symbol(symbol).to_uppercase())]
                    }
                    _ => vec![],
                };
                let raw: RawIsolatedAccount = self
                    .request(Method::GET, "/sapi/v1/margin/isolated/account", params, true)
                    .await?;
                for pair in raw.assets {
                    let Some(symbol) = from_exchange_symbol(&pair.symbol) else {
                        continue;
                    };
                    let mut balances = HashMap::new();
                    for asset in [pair.base_asset, pair.quote_asset] {
                        balances.insert(
                            asset.asset.to_lowercase(),
                            Balance {
                                available: asset.free,
                                hold: asset.locked,
                                borrowed: asset.borrowed,
                                interest: asset.interest,
                            },
                        );
                    }
                    result.insert(Account::Isolated(symbol), balances);
                }
            }
        }
        Ok(result)
    }

    async fn connect_stream_balances(
        &self,
        account: Account,
    ) -> Result<ExchangeStream<HashMap<Asset, Balance>>> {
        let events = self.connect_user_data(account).await?;
        Ok(events
            .filter_map(|event| async move {
                let event = match event {
                    Ok(event) => event,
                    Err(err) => return Some(Err(err)),
                };
                if event.get("e").and_then(|v| v.as_str()) != Some("outboundAccountPosition") {
                    return None;
                }
                let mut balances = HashMap::new();
                for raw in event.get("B").and_then(|v| v.as_array())?.iter() {
                    let asset = raw.get("a").and_then(|v| v.as_str())?.to_lowercase();
                    let free = raw.get("f").and_then(|v| v.as_str())?;
                    let locked = raw.get("l").and_then(|v| v.as_str())?;
                    balances.insert(
                        asset,
                        Balance {
                            available: Decimal::from_str(free).ok()?,
                            hold: Decimal::from_str(locked).ok()?,
                            ..Default::default()
                        },
                    );
                }
                Some(Ok(balances))
            })
            .boxed())
    }

    async fn get_depth(&self, symbol: &Symbol) -> Result<Depth> {
        let raw: RawDepth = self
            .request(
                Method::GET,
                "/api/v3/depth",
                vec![
                    ("symbol", to_ws_symbol(symbol).to_uppercase()),
                    ("limit", "1000".into()),
                ],
                false,
            )
            .await?;
        Ok(Depth::Snapshot {
            bids: parse_levels(&raw.bids)?,
            asks: parse_levels(&raw.asks)?,
            last_update_id: raw.last_update_id,
        })
    }

    async fn connect_stream_depth(&self, symbol: &Symbol) -> Result<ExchangeStream<Depth>> {
        let stream = self
            .connect_ws(&format!("/ws/{}@depth@100ms", to_ws_symbol(symbol)))
            .await?;
        Ok(stream
            .map(|event| {
                let event = event?;
                let levels = |key: &str| -> Result<Vec<(Decimal, Decimal)>> {
                    let raw: Vec<[String; 2]> =
                        serde_json::from_value(event.get(key).cloned().unwrap_or_default())
                            .map_err(|err| {
                                ExchangeError::unexpected(format!("bad depth levels: {err}"))
                            })?;
                    parse_levels(&raw)
                };
                Ok(Depth::Update {
                    bids: levels("b")?,
                    asks: levels("a")?,
                    first_update_id: event.get("U").and_then(|v| v.as_u64()).unwrap_or(0),
                    last_update_id: event.get("u").and_then(|v| v.as_u64()).unwrap_or(0),
                })
            })
            .boxed())
    }

    async fn stream_historical_trades(
        &self,
        symbol: &Symbol,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<ExchangeStream<Trade>> {
        #[derive(Deserialize)]
        struct RawAggTrade {
            a: u64,
            #[serde(rename = "p", with = "rust_decimal::serde::str")]
            price: Decimal,
            #[serde(rename = "q", with = "rust_decimal::serde::str")]
            size: Decimal,
            #[serde(rename = "T")]
            time: u64,
        }
        let raw: Vec<RawAggTrade> = self
            .request(
                Method::GET,
                "/api/v3/aggTrades",
                vec![
                    ("symbol", to_ws_symbol(symbol).to_uppercase()),
                    ("startTime", start.to_string()),
                    ("endTime", end.saturating_sub(1).to_string()),
                ],
                false,
            )
            .await?;
        Ok(futures::stream::iter(
            raw.into_iter()
                .map(|t| Ok(Trade { id: t.a, time: t.time, price: t.price, size: t.size }))
                .collect::<Vec<_>>(),
        )
        .boxed())
    }

    async fn connect_stream_trades(&self, symbol: &Symbol) -> Result<ExchangeStream<Trade>> {
        let stream = self
            .connect_ws(&format!("/ws/{}@aggTrade", to_ws_symbol(symbol)))
            .await?;
        Ok(stream
            .filter_map(|event| async move {
                let event = match event {
                    Ok(event) => event,
                    Err(err) => return Some(Err(err)),
                };
                let trade = Trade {
                    id: event.get("a")?.as_u64()?,
                    time: event.get("T")?.as_u64()?,
                    price: Decimal::from_str(event.get("p")?.as_str()?).ok()?,
                    size: Decimal::from_str(event.get("q")?.as_str()?).ok()?,
                };
                Some(Ok(trade))
            })
            .boxed())
    }

    async fn stream_historical_candles(
        &self,
        symbol: &Symbol,
        interval: Interval,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<ExchangeStream<Candle>> {
        let raw: Vec<Vec<serde_json::Value>> = self
            .request(
                Method::GET,
                "/api/v3/klines",
                vec![
                    ("symbol", to_ws_symbol(symbol).to_uppercase()),
                    ("interval", ws_interval(interval)),
                    ("startTime", start.to_string()),
                    ("endTime", end.saturating_sub(1).to_string()),
                    ("limit", "1000".into()),
                ],
                false,
            )
            .await?;
        let candles: Vec<Result<Candle>> = raw
            .into_iter()
            .map(|row| {
                let field = |index: usize| -> Result<Decimal> {
                    parse_decimal(row.get(index).and_then(|v| v.as_str()).unwrap_or("0"))
                };
                Ok(Candle {
                    time: row.first().and_then(|v| v.as_u64()).unwrap_or(0),
                    open: field(1)?,
                    high: field(2)?,
                    low: field(3)?,
                    close: field(4)?,
                    volume: field(5)?,
                    closed: true,
                })
            })
            .collect();
        Ok(futures::stream::iter(candles).boxed())
    }

    async fn connect_stream_candles(
        &self,
        symbol: &Symbol,
        interval: Interval,
    ) -> Result<ExchangeStream<Candle>> {
        let stream = self
            .connect_ws(&format!(
                "/ws/{}@kline_{}",
                to_ws_symbol(symbol),
                ws_interval(interval)
            ))
            .await?;
        Ok(stream
            .filter_map(|event| async move {
                let event = match event {
                    Ok(event) => event,
                    Err(err) => return Some(Err(err)),
                };
                let k = event.get("k")?;
                let field = |key: &str| Decimal::from_str(k.get(key)?.as_str()?).ok();
                Some(Ok(Candle {
                    time: k.get("t")?.as_u64()?,
                    open: field("o")?,
                    high: field("h")?,
                    low: field("l")?,
                    close: field("c")?,
                    volume: field("v")?,
                    closed: k.get("x").and_then(|v| v.as_bool()).unwrap_or(false),
                }))
            })
            .boxed())
    }

    async fn place_order(&self, order: NewOrder) -> Result<OrderResult> {
        let fee_asset = match order.side {
            Side::Buy => order.symbol.base_asset().to_owned(),
            Side::Sell => order.symbol.quote_asset().to_owned(),
        };
        let (path, params) = self.order_params(&order)?;
        let raw: RawOrderResult = self.request(Method::POST, &path, params, true).await?;
        Ok(OrderResult {
            time: raw.transact_time.unwrap_or(0),
            status: if raw.fills.is_empty() { OrderStatus::New } else { OrderStatus::Filled },
            fills: raw
                .fills
                .into_iter()
                .map(|f| Fill {
                    price: f.price,
                    size: f.qty,
                    quote: f.price * f.qty,
                    fee: f.commission,
                    fee_asset: if f.commission_asset.is_empty() {
                        fee_asset.clone()
                    } else {
                        f.commission_asset.to_lowercase()
                    },
                })
                .collect(),
        })
    }

    async fn cancel_order(
        &self,
        account: Account,
        symbol: &Symbol,
        client_id: &str,
    ) -> Result<()> {
        let mut params = vec![
            ("symbol", to_ws_symbol(symbol).to_uppercase()),
            ("origClientOrderId", client_id.to_owned()),
        ];
        let path = match &account {
            Account::Spot => "/api/v3/order",
            Account::Margin | Account::Isolated(_) => {
                if let Account::Isolated(_) = account {
                    params.push(("isIsolated", "TRUE".into()));
                }
                "/sapi/v1/margin/order"
            }
        };
        let _: serde_json::Value = self.request(Method::DELETE, path, params, true).await?;
        Ok(())
    }

    async fn edit_order(&self, edit: EditOrder) -> Result<OrderResult> {
        if edit.account != Account::Spot {
            return Err(ExchangeError::Unsupported("edit_order on margin account"));
        }
        let params = vec![
            ("symbol", to_ws_symbol(&edit.symbol).to_uppercase()),
            ("cancelReplaceMode", "STOP_ON_FAILURE".into()),
            ("cancelOrigClientOrderId", edit.client_id.clone()),
            // Keep the same id across the edit so the update stream stays
            // correlated.
            ("newClientOrderId", edit.client_id.clone()),
            ("side", match edit.side {
                Side::Buy => "BUY".into(),
                Side::Sell => "SELL".into(),
            }),
            ("type", "LIMIT".into()),
            ("timeInForce", "GTC".into()),
            ("price", edit.price.normalize().to_string()),
            ("quantity", edit.size.normalize().to_string()),
        ];
        let raw: serde_json::Value = self
            .request(Method::POST, "/api/v3/order/cancelReplace", params, true)
            .await?;
        Ok(OrderResult {
            time: raw
                .get("newOrderResponse")
                .and_then(|r| r.get("transactTime"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            status: OrderStatus::New,
            fills: Vec::new(),
        })
    }

    async fn connect_stream_orders(
        &self,
        account: Account,
        symbol: &Symbol,
    ) -> Result<ExchangeStream<OrderUpdate>> {
        let events = self.connect_user_data(account).await?;
        let expected_symbol = to_ws_symbol(symbol).to_uppercase();
        Ok(events
            .map(move |event| -> Vec<Result<OrderUpdate>> {
                let event = match event {
                    Ok(event) => event,
                    Err(err) => return vec![Err(err)],
                };
                if event.get("e").and_then(|v| v.as_str()) != Some("executionReport") {
                    return Vec::new();
                }
                if event.get("s").and_then(|v| v.as_str()) != Some(expected_symbol.as_str()) {
                    return Vec::new();
                }
                match parse_execution_report(&event) {
                    Ok(updates) => updates.into_iter().map(Ok).collect(),
                    Err(err) => vec![Err(err)],
                }
            })
            .flat_map(futures::stream::iter)
            .boxed())
    }

    async fn transfer(&self, transfer: Transfer) -> Result<()> {
        let (symbol, direction) = match (&transfer.from_account, &transfer.to_account) {
            (Account::Spot, Account::Isolated(symbol)) => (symbol.clone(), "SPOT_TO_ISOLATED"),
            (Account::Isolated(symbol), Account::Spot) => (symbol.clone(), "ISOLATED_TO_SPOT"),
            _ => return Err(ExchangeError::Unsupported("transfer between these accounts")),
        };
        let (from, to) = match direction {
            "SPOT_TO_ISOLATED" => ("SPOT", "ISOLATED_MARGIN"),
            _ => ("ISOLATED_MARGIN", "SPOT"),
        };
        let params = vec![
            ("asset", transfer.asset.to_uppercase()),
            ("symbol", to_ws_symbol(&symbol).to_uppercase()),
            ("amount", transfer.size.normalize().to_string()),
            ("transFrom", from.into()),
            ("transTo", to.into()),
        ];
        let _: serde_json::Value = self
            .request(Method::POST, "/sapi/v1/margin/isolated/transfer", params, true)
            .await?;
        Ok(())
    }

    async fn borrow(&self, asset: &str, size: Decimal, account: Account) -> Result<()> {
        let mut params = vec![
            ("asset", asset.to_uppercase()),
            ("amount", size.normalize().to_string()),
        ];
        if let Account::Isolated(symbol) = &account {
            params.push(("isIsolated", "TRUE".into()));
            params.push(("symbol", to_ws_symbol(symbol).to_uppercase()));
        }
        let _: serde_json::Value =
            self.request(Method::POST, "/sapi/v1/margin/loan", params, true).await?;
        Ok(())
    }

    async fn repay(&self, asset: &str, size: Decimal, account: Account) -> Result<()> {
        let mut params = vec![
            ("asset", asset.to_uppercase()),
            ("amount", size.normalize().to_string()),
        ];
        if let Account::Isolated(symbol) = &account {
            params.push(("isIsolated", "TRUE".into()));
            params.push(("symbol", to_ws_symbol(symbol).to_uppercase()));
        }
        let _: serde_json::Value =
            self.request(Method::POST, "/sapi/v1/margin/repay", params, true).await?;
        Ok(())
    }

    async fn get_max_borrowable(&self, account: Account, asset: &str) -> Result<Decimal> {
        let mut params = vec![("asset", asset.to_uppercase())];
        if let Account::Isolated(symbol) = &account {
            params.push(("isolatedSymbol", to_ws_symbol(symbol).to_uppercase()));
        }
        let raw: RawMaxBorrowable = self
            .request(Method::GET, "/sapi/v1/margin/maxBorrowable", params, true)
            .await?;
        Ok(raw.amount)
    }

    async fn create_account(&self, account: Account) -> Result<()> {
        let Account::Isolated(symbol) = &account else {
            return Err(ExchangeError::Unsupported("create_account for non-isolated account"));
        };
        let (base, quote) = symbol.assets();
        let params = vec![("base", base.to_uppercase()), ("quote", quote.to_uppercase())];
        let _: serde_json::Value = self
            .request(Method::POST, "/sapi/v1/margin/isolated/create", params, true)
            .await?;
        Ok(())
    }

    async fn list_open_accounts(&self) -> Result<Vec<Account>> {
        let raw: RawIsolatedAccount = self
            .request(Method::GET, "/sapi/v1/margin/isolated/account", vec![], true)
            .await?;
        let mut accounts = vec![Account::Spot];
        accounts.extend(
            raw.assets
                .into_iter()
                .filter_map(|pair| from_exchange_symbol(&pair.symbol).map(Account::Isolated)),
        );
        Ok(accounts)
    }

    async fn list_open_margin_positions(&self) -> Result<Vec<MarginPosition>> {
        Err(ExchangeError::Unsupported("list_open_margin_positions"))
    }
}

fn parse_execution_report(event: &serde_json::Value) -> Result<Vec<OrderUpdate>> {
    let text = |key: &str| -> Result<&str> {
        event
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExchangeError::unexpected(format!("execution report missing {key:?}")))
    };
    let decimal = |key: &str| -> Result<Decimal> { parse_decimal(text(key)?) };

    // On cancellations the original id moves to `C` and `c` holds the
    // cancel request's id.
    let original_id = event.get("C").and_then(|v| v.as_str()).unwrap_or_default();
    let client_id =
        if original_id.is_empty() { text("c")?.to_owned() } else { original_id.to_owned() };
    let time = event.get("T").and_then(|v| v.as_u64()).unwrap_or(0);

    match text("x")? {
        "NEW" => Ok(vec![OrderUpdate::New { client_id }]),
        "TRADE" => {
            let price = decimal("L")?;
            let size = decimal("l")?;
            let fill = Fill {
                price,
                size,
                quote: decimal("Y").unwrap_or(price * size),
                fee: decimal("n")?,
                fee_asset: event
                    .get("N")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_lowercase(),
            };
            let mut updates = vec![OrderUpdate::Match { client_id: client_id.clone(), fill }];
            // The venue sends no separate terminal event after the final
            // trade; synthesize it for brokers.
            if text("X")? == "FILLED" {
                updates.push(OrderUpdate::Done { client_id, time });
            }
            Ok(updates)
        }
        "CANCELED" => {
            Ok(vec![OrderUpdate::Cancelled { client_id, time, reason: CancelledReason::Unknown }])
        }
        "REPLACED" => {
            Ok(vec![OrderUpdate::Cancelled { client_id, time, reason: CancelledReason::Edit }])
        }
        "EXPIRED" | "REJECTED" => Ok(vec![OrderUpdate::Done { client_id, time }]),
        _ => Ok(Vec::new()),
    }
}
