//! Positioner lifecycle runs against the scriptable venue: paper shorts
//! priced off the book, and the live borrow/repay path including the
//! venue's stale-read quirks.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crypto_trader::brokers::MarketBroker;
use crypto_trader::chandler::Chandler;
use crypto_trader::custodians::{Custodian, Stub};
use crypto_trader::exchanges::{Capabilities, Exchange, ExchangeInfo, Fake};
use crypto_trader::filters::{Filters, Size};
use crypto_trader::informant::Informant;
use crypto_trader::order::{Fill, OrderResult, OrderStatus};
use crypto_trader::orderbook::Orderbook;
use crypto_trader::position::{CloseReason, ClosedPosition, OpenPosition};
use crypto_trader::positioner::Positioner;
use crypto_trader::storage::Memory;
use crypto_trader::time::{self, HOUR_MS, MIN_MS};
use crypto_trader::types::{
    Account, Balance, BorrowInfo, Candle, Fees, Symbol, TradingMode,
};
use crypto_trader::user::User;

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

async fn positioner(fake: Arc<Fake>) -> Positioner {
    let storage = Arc::new(Memory::new());
    let informant = Arc::new(
        Informant::connect(storage.clone(), vec![fake.clone() as Arc<dyn Exchange>])
            .await
            .unwrap(),
    );
    let chandler = Arc::new(Chandler::new(storage, vec![fake.clone() as Arc<dyn Exchange>]));
    let orderbook = Arc::new(Orderbook::new(vec![fake.clone() as Arc<dyn Exchange>]));
    let user = Arc::new(User::new(vec![fake as Arc<dyn Exchange>]));
    let broker = Arc::new(MarketBroker::new(informant.clone(), orderbook, user.clone()));
    Positioner::new(
        informant,
        chandler,
        broker,
        user,
        vec![("stub".to_owned(), Arc::new(Stub) as Arc<dyn Custodian>)],
    )
}

fn seed_last_candle(fake: &Fake, symbol: &Symbol, price: Decimal) {
    let now = time::now();
    let time = now - now % MIN_MS - MIN_MS;
    fake.set_candles(
        symbol.clone(),
        MIN_MS,
        vec![Candle {
            time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: dec!(1),
            closed: true,
        }],
    );
}

#[tokio::test]
async fn test_paper_short_open_close_borrow_model() {
    let fake = Arc::new(Fake::new());
    fake.set_exchange_info(exchange_info());
    let symbol = Symbol::new("eth-btc");
    seed_last_candle(&fake, &symbol, dec!(10));
    // Book liquidity for simulated fills at price 10.
    fake.set_depth_snapshot(
        vec![(dec!(10), dec!(100))],
        vec![(dec!(10), dec!(100))],
        1,
    );

    let positioner = positioner(fake.clone()).await;

    // collateral 10, price 10, multiplier 2, limit 5 -> borrow 1 base.
    let opened = positioner
        .open_positions(
            "fake",
            "stub",
            TradingMode::Paper,
            &[(symbol.clone(), dec!(10), true)],
        )
        .await
        .unwrap();
    assert_eq!(opened.len(), 1);
    let OpenPosition::Short(mut short) = opened.into_iter().next().unwrap() else {
        panic!("expected short position");
    };
    assert_eq!(short.borrowed, dec!(1));
    assert_eq!(Fill::total_quote(&short.fills), dec!(10));
    // Paper mode: no margin bookkeeping reaches the venue.
    assert!(fake.transfers.lock().is_empty());
    assert!(fake.borrows.lock().is_empty());

    // Pretend the position has been open for just under two hours; the
    // interest charge ceils to two hourly ticks.
    short.time = short.time.saturating_sub(2 * HOUR_MS - MIN_MS);

    let closed = positioner
        .close_positions(
            "stub",
            TradingMode::Paper,
            vec![(OpenPosition::Short(short), CloseReason::Strategy)],
        )
        .await
        .unwrap();
    let ClosedPosition::Short(short) = closed.into_iter().next().unwrap() else {
        panic!("expected short position");
    };
    assert_eq!(short.interest, dec!(0.02));
    assert!(fake.repays.lock().is_empty());

    // profit = open quote - open quote fee - close quote; the buy-back of
    // borrow + interest + fee costs more than the sale gained.
    let closed = ClosedPosition::Short(short);
    assert!(closed.profit() < Decimal::ZERO);
    let expected = dec!(10)
        - dec!(0.01)
        - match &closed {
            ClosedPosition::Short(s) => Fill::total_quote(&s.close_fills),
            _ => unreachable!(),
        };
    assert_eq!(closed.profit(), expected);
}

#[tokio::test(start_paused = true)]
async fn test_live_short_borrow_repay_with_stale_reads() {
    let fake = Arc::new(Fake::new());
    fake.set_exchange_info(exchange_info());
    fake.set_capabilities(Capabilities {
        can_margin_trade: true,
        can_margin_borrow: true,
        can_place_market_order: true,
        can_place_market_order_quote: true,
        can_get_market_order_result_direct: true,
        ..Default::default()
    });
    let symbol = Symbol::new("eth-btc");
    let account = Account::Isolated(symbol.clone());
    seed_last_candle(&fake, &symbol, dec!(10));

    // The venue serves a stale zero borrowable quota once.
    fake.script_max_borrowable(Ok(Decimal::ZERO));
    fake.script_max_borrowable(Ok(dec!(5)));

    // Balance reads during close: interest accrual, then a stale
    // pre-repay value, then the repaid state with base dust left over.
    fake.script_balance(
        account.clone(),
        "eth",
        vec![
            Balance { borrowed: dec!(1), interest: dec!(0.02), ..Default::default() },
            Balance { borrowed: dec!(1), ..Default::default() },
            Balance { available: dec!(0.005), ..Default::default() },
        ],
    );

    // Sell of the borrowed base on open, buy-back on close.
    fake.script_place_order(Ok(OrderResult {
        time: 1,
        status: OrderStatus::Filled,
        fills: vec![Fill {
            price: dec!(10),
            size: dec!(1),
            quote: dec!(10),
            fee: dec!(0.01),
            fee_asset: "btc".into(),
        }],
    }));
    fake.script_place_order(Ok(OrderResult {
        time: 2,
        status: OrderStatus::Filled,
        fills: vec![Fill {
            price: dec!(10),
            size: dec!(1.0311),
            quote: dec!(10.311),
            fee: dec!(0.0011),
            fee_asset: "eth".into(),
        }],
    }));

    let positioner = positioner(fake.clone()).await;

    let opened = positioner
        .open_positions(
            "fake",
            "stub",
            TradingMode::Live,
            &[(symbol.clone(), dec!(10), true)],
        )
        .await
        .unwrap();
    let OpenPosition::Short(short) = opened.into_iter().next().unwrap() else {
        panic!("expected short position");
    };
    assert_eq!(short.borrowed, dec!(1));
    {
        let transfers = fake.transfers.lock();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].asset, "btc");
        assert_eq!(transfers[0].size, dec!(10));
        assert_eq!(transfers[0].to_account, account);
    }
    {
        let borrows = fake.borrows.lock();
        assert_eq!(borrows.len(), 1);
        assert_eq!(borrows[0].asset, "eth");
        assert_eq!(borrows[0].size, dec!(1));
    }

    let closed = positioner
        .close_positions(
            "stub",
            TradingMode::Live,
            vec![(OpenPosition::Short(short), CloseReason::TakeProfit)],
        )
        .await
        .unwrap();
    let ClosedPosition::Short(short) = closed.into_iter().next().unwrap() else {
        panic!("expected short position");
    };
    // Exchange-reported interest, not derived.
    assert_eq!(short.interest, dec!(0.02));

    {
        let repays = fake.repays.lock();
        assert_eq!(repays.len(), 1);
        // repay = borrowed + interest.
        assert_eq!(repays[0].size, dec!(1.02));
    }
    {
        // Quote gain and leftover base both return to spot.
        let transfers = fake.transfers.lock();
        assert_eq!(transfers.len(), 3);
        assert_eq!(transfers[1].asset, "btc");
        assert_eq!(transfers[1].from_account, account);
        assert_eq!(transfers[1].to_account, Account::Spot);
        assert_eq!(transfers[2].asset, "eth");
        assert_eq!(transfers[2].size, dec!(0.005));
    }
}
