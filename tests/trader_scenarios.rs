//! End-to-end multi-symbol trader runs against the scriptable venue.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crypto_trader::chandler::Chandler;
use crypto_trader::custodians::{Custodian, Stub};
use crypto_trader::exchanges::{Exchange, ExchangeInfo, Fake};
use crypto_trader::filters::{Filters, Size};
use crypto_trader::informant::Informant;
use crypto_trader::position::{CloseReason, ClosedPosition, MissedCandlePolicy};
use crypto_trader::storage::Memory;
use crypto_trader::strategies::{Advice, StrategyConfig};
use crypto_trader::time::{Timestamp, HOUR_MS};
use crypto_trader::traders::{MultiConfig, MultiTrader, StopSignal};
use crypto_trader::types::{BorrowInfo, Candle, Fees, Symbol, Ticker, TradingMode};

fn candle(time: Timestamp, close: Decimal) -> Candle {
    Candle {
        time,
        open: close,
        high: close,
        low: close,
        close,
        volume: dec!(1),
        closed: true,
    }
}

fn exchange_info() -> ExchangeInfo {
    let mut info = ExchangeInfo::default();
    info.fees.insert("__all__".into(), Fees { maker: dec!(0.001), taker: dec!(0.001) });
    info.filters.insert(
        "__all__".into(),
        Filters {
            size: Size { min: dec!(0.0001), max: dec!(10000.0), step: dec!(0.0001) },
            isolated_margin: true,
            ..Default::default()
        },
    );
    let mut by_asset = HashMap::new();
    by_asset.insert(
        "__all__".to_owned(),
        BorrowInfo {
            limit: dec!(5),
            interest_interval: HOUR_MS,
            interest_rate: dec!(0.01),
            interest_charge: Default::default(),
        },
    );
    info.borrow_info.insert("__all__".to_owned(), by_asset);
    info
}

/// Seeds a fake venue with three ranked symbols and a scripted advice
/// sequence per symbol, then runs the multi trader over four intervals.
async fn run_scenario() -> (crypto_trader::position::TradingSummary, crypto_trader::traders::MultiState)
{
    let fake = Arc::new(Fake::new());
    fake.set_exchange_info(exchange_info());

    let mut tickers = HashMap::new();
    for (symbol, volume) in [("eth-btc", 30), ("ltc-btc", 20), ("xmr-btc", 10)] {
        tickers.insert(
            Symbol::new(symbol),
            Ticker {
                volume: Decimal::from(volume),
                quote_volume: Decimal::from(volume),
                price: dec!(10),
            },
        );
    }
    fake.set_tickers(tickers);

    for symbol in ["eth-btc", "ltc-btc", "xmr-btc"] {
        fake.set_candles(
            Symbol::new(symbol),
            HOUR_MS,
            (0..4).map(|i| candle(i * HOUR_MS, dec!(10))).collect(),
        );
    }

    let storage = Arc::new(Memory::new());
    let informant = Arc::new(
        Informant::connect(storage.clone(), vec![fake.clone() as Arc<dyn Exchange>])
            .await
            .unwrap(),
    );
    let chandler = Arc::new(Chandler::new(storage, vec![fake as Arc<dyn Exchange>]));
    let trader = MultiTrader::new(
        chandler,
        informant,
        None,
        vec![("stub".to_owned(), Arc::new(Stub) as Arc<dyn Custodian>)],
    );

    let advices = |advices: &[Advice]| StrategyConfig::Fixed {
        advices: advices.to_vec(),
        maturity: 0,
    };
    let mut symbol_strategies = HashMap::new();
    symbol_strategies.insert(
        Symbol::new("eth-btc"),
        advices(&[Advice::Long, Advice::Liquidate, Advice::Short, Advice::Short]),
    );
    symbol_strategies.insert(
        Symbol::new("ltc-btc"),
        advices(&[Advice::Long, Advice::Liquidate, Advice::None, Advice::None]),
    );
    symbol_strategies.insert(
        Symbol::new("xmr-btc"),
        advices(&[Advice::None, Advice::Long, Advice::Long, Advice::Long]),
    );

    let config = MultiConfig {
        exchange: "fake".into(),
        interval: HOUR_MS,
        start: Some(0),
        end: 4 * HOUR_MS,
        quote: Some(dec!(2.0)),
        strategy: advices(&[]),
        symbol_strategies,
        stop_loss: None,
        take_profit: None,
        trail_stop_loss: true,
        adjusted_start: None,
        missed_candle_policy: MissedCandlePolicy::Ignore,
        mode: TradingMode::Backtest,
        long: true,
        short: true,
        close_on_exit: true,
        track: vec![],
        track_exclude: vec![],
        track_count: 3,
        track_required_start: None,
        position_count: 2,
        allowed_age_drift: 0,
        quote_asset: "btc".into(),
        repick_symbols: false,
        custodian: "stub".into(),
        exchange_candle_timeout: None,
    };

    let mut state = trader.initialize(config).await.unwrap();
    let summary =
        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            trader.run(&mut state, StopSignal::new()).await
        })
        .await
        .expect("trader run timed out")
        .unwrap();
    (summary, state)
}

#[tokio::test]
async fn test_multi_trader_three_symbols_two_slots() {
    let (summary, state) = run_scenario().await;
    assert_eq!(summary.num_positions(), 4);
    assert_eq!(summary.num_long(), 3);
    assert_eq!(summary.num_short(), 1);
    assert_eq!(summary.num_with_reason(CloseReason::Strategy), 2);
    assert_eq!(summary.num_with_reason(CloseReason::Cancelled), 2);

    // With close_on_exit, a cancelled run leaves nothing open.
    assert!(state.open_positions().is_empty());

    let find = |symbol: &str, short: bool| {
        summary
            .positions
            .iter()
            .find(|p| {
                p.symbol().as_str() == symbol
                    && matches!(p, ClosedPosition::Short(_)) == short
            })
            .unwrap_or_else(|| panic!("missing position for {symbol}"))
    };

    // Advices: ETH [L, LIQ, S, S], LTC [L, LIQ, -, -], XMR [-, L, L, L].
    let eth_long = find("eth-btc", false);
    assert_eq!(eth_long.open_time(), HOUR_MS);
    assert_eq!(eth_long.close_time(), 2 * HOUR_MS);
    assert_eq!(eth_long.close_reason(), CloseReason::Strategy);

    let ltc_long = find("ltc-btc", false);
    assert_eq!(ltc_long.open_time(), HOUR_MS);
    assert_eq!(ltc_long.close_time(), 2 * HOUR_MS);

    let xmr_long = find("xmr-btc", false);
    assert_eq!(xmr_long.open_time(), 2 * HOUR_MS);
    assert_eq!(xmr_long.close_time(), 4 * HOUR_MS);
    assert_eq!(xmr_long.close_reason(), CloseReason::Cancelled);

    let eth_short = find("eth-btc", true);
    assert_eq!(eth_short.open_time(), 3 * HOUR_MS);
    assert_eq!(eth_short.close_time(), 4 * HOUR_MS);
    assert_eq!(eth_short.close_reason(), CloseReason::Cancelled);
}

#[tokio::test]
async fn test_multi_state_serialization_round_trip() {
    let (_, state) = run_scenario().await;
    let raw = serde_json::to_string(&state).unwrap();
    let restored: crypto_trader::traders::MultiState = serde_json::from_str(&raw).unwrap();
    assert_eq!(restored.id, state.id);
    assert_eq!(restored.next_, state.next_);
    assert_eq!(restored.positions.len(), state.positions.len());
    assert_eq!(restored.symbol_states.len(), state.symbol_states.len());
}
