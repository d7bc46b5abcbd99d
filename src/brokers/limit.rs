//! Limit broker
//!
//! Fills a requested size or quote by resting a limit order at (or one
//! tick inside) the top of book and re-pricing it as the book moves, until
//! the request is covered or cannot proceed under the venue's filters.
//!
//! One task drives the whole state machine, selecting over the book's
//! update signal and the order update stream. The resting order is only
//! replaced when the new price strictly improves fill probability (higher
//! for buys, lower for sells); a tie at our own price never races itself.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::FutureExt;
use futures::StreamExt;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::errors::{BadOrder, ExchangeError, Result};
use crate::exchanges::{EditOrder, ExchangeStream, NewOrder};
use crate::filters::Filters;
use crate::informant::Informant;
use crate::order::{CancelledReason, Fill, OrderResult, OrderStatus, OrderUpdate};
use crate::orderbook::{BookHandle, Orderbook};
use crate::types::Side;
use crate::user::User;

use super::{Broker, BrokerRequest};

/// How the resting price chases the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStrategy {
    /// Post one tick inside the spread, ahead of the current best; match
    /// the best when the spread is exactly one tick.
    Leading,
    /// Match the best on our own side; never improve on it.
    Matching,
}

pub struct LimitBroker {
    informant: Arc<Informant>,
    orderbook: Arc<Orderbook>,
    user: Arc<User>,
    strategy: PlacementStrategy,
    use_edit_order_if_possible: bool,
    cancel_order_on_error: bool,
}

impl LimitBroker {
    pub fn new(
        informant: Arc<Informant>,
        orderbook: Arc<Orderbook>,
        user: Arc<User>,
        strategy: PlacementStrategy,
        use_edit_order_if_possible: bool,
        cancel_order_on_error: bool,
    ) -> Self {
        LimitBroker {
            informant,
            orderbook,
            user,
            strategy,
            use_edit_order_if_possible,
            cancel_order_on_error,
        }
    }

    pub fn leading(informant: Arc<Informant>, orderbook: Arc<Orderbook>, user: Arc<User>) -> Self {
        Self::new(informant, orderbook, user, PlacementStrategy::Leading, false, true)
    }

    pub fn leading_edit(
        informant: Arc<Informant>,
        orderbook: Arc<Orderbook>,
        user: Arc<User>,
    ) -> Self {
        Self::new(informant, orderbook, user, PlacementStrategy::Leading, true, true)
    }

    pub fn matching(informant: Arc<Informant>, orderbook: Arc<Orderbook>, user: Arc<User>) -> Self {
        Self::new(informant, orderbook, user, PlacementStrategy::Matching, false, true)
    }

    async fn fill(&self, request: &BrokerRequest, side: Side) -> Result<OrderResult> {
        assert!(!request.test, "limit broker does not support test orders");
        request.validate_funds()?;

        let (fees, filters) =
            self.informant.get_fees_filters(&request.exchange, &request.symbol)?;
        let requested = match (request.size, request.quote) {
            (Some(size), None) => {
                let size =
                    if request.ensure_size { filters.with_fee(size, fees.maker) } else { size };
                Requested::Size(size)
            }
            (None, Some(quote)) => Requested::Quote(quote),
            _ => unreachable!("validated above"),
        };

        let client_id = self.user.generate_client_id(&request.exchange)?;
        info!(
            symbol = %request.symbol,
            %side,
            ?requested,
            "filling with limit orders at spread ({client_id})"
        );

        let book = self.orderbook.sync(&request.exchange, &request.symbol).await?;
        let orders = self
            .user
            .connect_stream_orders(&request.exchange, request.account.clone(), &request.symbol)
            .await?;

        let mut machine = FillMachine {
            broker: self,
            request,
            side,
            filters,
            requested,
            client_id: client_id.clone(),
            book,
            orders,
            fills: Vec::new(),
            state: OrderState::Idle,
            last_time: 0,
        };

        match machine.run().await {
            Ok(status) => Ok(OrderResult {
                time: machine.last_time,
                status,
                fills: machine.fills,
            }),
            Err(err) => {
                if self.cancel_order_on_error {
                    machine.cancel_resting_and_drain().await;
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Broker for LimitBroker {
    async fn buy(&self, request: BrokerRequest) -> Result<OrderResult> {
        self.fill(&request, Side::Buy).await
    }

    async fn sell(&self, request: BrokerRequest) -> Result<OrderResult> {
        let result = self.fill(&request, Side::Sell).await;
        if request.quote.is_some() {
            debug!("sold by quote; fills denominate the quote gained");
        }
        result
    }
}

#[derive(Debug, Clone, Copy)]
enum Requested {
    Size(Decimal),
    Quote(Decimal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderState {
    /// Nothing resting; free to place.
    Idle,
    /// Limit order resting at `price` for `size`.
    Resting { price: Decimal, size: Decimal },
    /// Cancel issued for a re-price; awaiting the terminal ack.
    Cancelling,
}

struct FillMachine<'a> {
    broker: &'a LimitBroker,
    request: &'a BrokerRequest,
    side: Side,
    filters: Filters,
    requested: Requested,
    client_id: String,
    book: BookHandle,
    orders: ExchangeStream<OrderUpdate>,
    fills: Vec<Fill>,
    state: OrderState,
    last_time: u64,
}

impl FillMachine<'_> {
    /// Runs the state machine to a terminal status.
    async fn run(&mut self) -> Result<OrderStatus> {
        loop {
            match self.state {
                OrderState::Idle => {
                    if let Some(status) = self.place().await? {
                        return Ok(status);
                    }
                }
                OrderState::Resting { price, .. } => {
                    if let Some(desired) = self.desired_price(Some(price))? {
                        if improves(self.side, desired, price) {
                            if let Some(status) = self.reprice(desired).await? {
                                return Ok(status);
                            }
                        }
                    }
                }
                OrderState::Cancelling => {}
            }

            // Borrows inside the select stay on disjoint fields; handlers
            // run after the competing futures are dropped.
            enum Woken {
                Order(Option<Result<OrderUpdate>>),
                Book(Result<()>),
            }
            let woken = tokio::select! {
                update = self.orders.next() => Woken::Order(update),
                result = self.book.updated() => Woken::Book(result),
            };
            match woken {
                Woken::Order(update) => {
                    let update = update.ok_or_else(|| {
                        ExchangeError::unavailable("order update stream closed")
                    })??;
                    if let Some(status) = self.on_order_update(update)? {
                        return Ok(status);
                    }
                }
                Woken::Book(result) => result?,
            }
        }
    }

    /// Remaining amount to fill, converted to a base size at `price` and
    /// rounded to the venue's filters.
    fn remaining_size(&self, price: Decimal) -> Decimal {
        let size = match self.requested {
            Requested::Size(size) => size - Fill::total_size(&self.fills),
            Requested::Quote(quote) => {
                let remaining_quote = quote - Fill::total_quote(&self.fills);
                if remaining_quote <= Decimal::ZERO {
                    return Decimal::ZERO;
                }
                remaining_quote / price
            }
        };
        self.filters.size.round_down(size)
    }

    /// Desired resting price under the configured placement strategy, or
    /// `None` when the book currently gives no reason to act.
    fn desired_price(&self, current: Option<Decimal>) -> Result<Option<Decimal>> {
        let asks = self.book.list_asks();
        let bids = self.book.list_bids();
        let (own_best, other_best) = match self.side {
            Side::Buy => (bids.first().map(|l| l.0), asks.first().map(|l| l.0)),
            Side::Sell => (asks.first().map(|l| l.0), bids.first().map(|l| l.0)),
        };
        let step = self.filters.price.step;
        let ahead = |price: Decimal| match self.side {
            Side::Buy => price + step,
            Side::Sell => price - step,
        };

        let own_best = match (own_best, other_best) {
            (None, None) => {
                return Err(ExchangeError::Unsupported(
                    "empty order book; no reference price",
                ))
            }
            // Own side empty: post one tick inside the other side.
            (None, Some(other)) => {
                return Ok(Some(match self.side {
                    Side::Buy => other - step,
                    Side::Sell => other + step,
                }))
            }
            (Some(own), _) => own,
        };

        // The best may be our own resting order; improving on ourselves
        // would race the engine against itself.
        if current == Some(own_best) {
            return Ok(None);
        }

        let price = match self.broker.strategy {
            PlacementStrategy::Matching => own_best,
            PlacementStrategy::Leading => match other_best {
                Some(other) if (other - own_best).abs() == step => own_best,
                Some(_) => ahead(own_best),
                None => ahead(own_best),
            },
        };
        Ok(Some(price))
    }

    /// Places a fresh order at the current desired price. Returns a
    /// terminal status when the remaining amount cannot be placed.
    async fn place(&mut self) -> Result<Option<OrderStatus>> {
        let Some(price) = self.desired_price(None)? else {
            return Ok(None);
        };
        let size = self.remaining_size(price);

        // Rounded to nothing: the request is covered within one step.
        if size == Decimal::ZERO {
            return Ok(Some(self.final_status()));
        }
        // Remaining amount below the venue's minimum notional: stop with
        // what we have.
        if !self.filters.min_notional.valid(price, size) {
            debug!(
                %price, %size,
                "remaining below min notional; completing with accumulated fills"
            );
            return Ok(Some(OrderStatus::PartiallyFilled));
        }

        info!(%price, %size, "placing limit order {}", self.client_id);
        let order = NewOrder::limit(
            self.request.account.clone(),
            self.request.symbol.clone(),
            self.side,
            price,
            size,
            self.client_id.clone(),
        );
        self.broker.user.place_order(&self.request.exchange, order).await?;
        self.state = OrderState::Resting { price, size };
        Ok(None)
    }

    /// Moves the resting order to `desired`, atomically where the venue
    /// allows it, otherwise via cancel-then-place.
    async fn reprice(&mut self, desired: Decimal) -> Result<Option<OrderStatus>> {
        let capabilities = self.broker.user.capabilities(&self.request.exchange)?;
        if self.broker.use_edit_order_if_possible && capabilities.can_edit_order {
            let size = self.remaining_size(desired);
            if size == Decimal::ZERO {
                return self.cancel_for_completion().await;
            }
            if !self.filters.min_notional.valid(desired, size) {
                return self.cancel_for_completion().await;
            }
            info!(price = %desired, %size, "editing limit order {}", self.client_id);
            let edit = EditOrder {
                account: self.request.account.clone(),
                symbol: self.request.symbol.clone(),
                side: self.side,
                client_id: self.client_id.clone(),
                price: desired,
                size,
            };
            match self.broker.user.edit_order(&self.request.exchange, edit).await {
                Ok(_) => {
                    self.state = OrderState::Resting { price: desired, size };
                    Ok(None)
                }
                Err(ExchangeError::BadOrder(BadOrder::InsufficientFunds(reason))) => {
                    // A fill landed while the venue processed the edit: the
                    // cancel half succeeded, the new order half did not.
                    // Pick up the in-flight fills and fall back to a fresh
                    // placement with the recomputed remainder.
                    warn!(
                        %reason,
                        "edit rejected due to in-flight fill; reconciling and re-placing"
                    );
                    self.drain_pending_updates()?;
                    self.state = OrderState::Idle;
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        } else {
            info!("cancelling limit order {} for re-price", self.client_id);
            match self
                .broker
                .user
                .cancel_order(
                    &self.request.exchange,
                    self.request.account.clone(),
                    &self.request.symbol,
                    &self.client_id,
                )
                .await
            {
                Ok(()) => {
                    self.state = OrderState::Cancelling;
                    Ok(None)
                }
                Err(ExchangeError::BadOrder(BadOrder::OrderMissing(reason))) => {
                    // Cancel found nothing: the order already filled.
                    info!(%reason, "order {} already gone; assuming filled", self.client_id);
                    self.drain_pending_updates()?;
                    Ok(Some(self.final_status()))
                }
                Err(err) => Err(err),
            }
        }
    }

    /// Cancels because the remainder can no longer be placed; the fills
    /// collected so far are the result.
    async fn cancel_for_completion(&mut self) -> Result<Option<OrderStatus>> {
        let result = self
            .broker
            .user
            .cancel_order(
                &self.request.exchange,
                self.request.account.clone(),
                &self.request.symbol,
                &self.client_id,
            )
            .await;
        match result {
            Ok(()) | Err(ExchangeError::BadOrder(BadOrder::OrderMissing(_))) => {
                self.drain_pending_updates()?;
                Ok(Some(self.final_status()))
            }
            Err(err) => Err(err),
        }
    }

    /// Applies any order updates already delivered without blocking. Used
    /// to reconcile cumulative fills after a failed edit or a missing
    /// cancel before recomputing the remainder.
    fn drain_pending_updates(&mut self) -> Result<()> {
        while let Some(Some(update)) = self.orders.next().now_or_never() {
            let update = update?;
            if update.client_id() != self.client_id {
                continue;
            }
            if let OrderUpdate::Match { fill, .. } = update {
                self.fills.push(fill);
            }
        }
        Ok(())
    }

    /// Routes one order update through the state machine. Returns a
    /// terminal status when the fill completes.
    fn on_order_update(&mut self, update: OrderUpdate) -> Result<Option<OrderStatus>> {
        if update.client_id() != self.client_id {
            return Ok(None);
        }
        match update {
            OrderUpdate::New { .. } => {
                debug!("order {} confirmed resting", self.client_id);
                Ok(None)
            }
            OrderUpdate::Match { fill, .. } => {
                debug!(size = %fill.size, price = %fill.price, "order {} matched", self.client_id);
                self.fills.push(fill);
                Ok(None)
            }
            OrderUpdate::Cancelled { reason: CancelledReason::Edit, time, .. } => {
                // First half of a non-atomic edit; the paired `New` for the
                // same client id follows. A final `Match` on the pre-edit
                // order may interleave and is accounted for as usual.
                self.last_time = time;
                Ok(None)
            }
            OrderUpdate::Cancelled { time, .. } => {
                self.last_time = time;
                match self.state {
                    OrderState::Cancelling => {
                        self.state = OrderState::Idle;
                        Ok(None)
                    }
                    _ => {
                        // Cancelled outside a re-price (venue or operator).
                        warn!("order {} cancelled externally", self.client_id);
                        self.state = OrderState::Idle;
                        Ok(None)
                    }
                }
            }
            OrderUpdate::Done { time, .. } => {
                info!("order {} done", self.client_id);
                self.last_time = time;
                Ok(Some(self.final_status()))
            }
        }
    }

    fn final_status(&self) -> OrderStatus {
        let covered = match self.requested {
            Requested::Size(size) => {
                Fill::total_size(&self.fills) >= size - self.filters.size.step
            }
            Requested::Quote(quote) => {
                let remaining = quote - Fill::total_quote(&self.fills);
                self.filters.size.round_down(remaining.max(Decimal::ZERO)) == Decimal::ZERO
                    || remaining <= Decimal::ZERO
            }
        };
        if covered {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        }
    }

    /// Error-path cleanup: make sure nothing is left resting, then absorb
    /// the terminal acknowledgment so the venue and local state agree.
    async fn cancel_resting_and_drain(&mut self) {
        if matches!(self.state, OrderState::Idle) {
            return;
        }
        info!("cancelling resting order {} on error exit", self.client_id);
        let result = self
            .broker
            .user
            .cancel_order(
                &self.request.exchange,
                self.request.account.clone(),
                &self.request.symbol,
                &self.client_id,
            )
            .await;
        match result {
            Ok(()) => {
                // Await the terminal ack before propagating the error.
                while let Some(update) = self.orders.next().await {
                    let Ok(update) = update else { break };
                    if update.client_id() != self.client_id {
                        continue;
                    }
                    match update {
                        OrderUpdate::Match { fill, .. } => self.fills.push(fill),
                        OrderUpdate::Cancelled { .. } | OrderUpdate::Done { .. } => break,
                        OrderUpdate::New { .. } => {}
                    }
                }
            }
            Err(ExchangeError::BadOrder(BadOrder::OrderMissing(_))) => {}
            Err(err) => warn!(%err, "failed to cancel order {} during cleanup", self.client_id),
        }
    }
}

fn improves(side: Side, desired: Decimal, current: Decimal) -> bool {
    match side {
        Side::Buy => desired > current,
        Side::Sell => desired < current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::{Capabilities, Exchange, Fake};
    use crate::filters::{MinNotional, Price, Size};
    use crate::orderbook::Depth;
    use crate::storage::Memory;
    use crate::types::{Account, Fees, KeyedBy, Symbol};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    const CLIENT_ID: &str = "order-1";

    fn filters() -> Filters {
        Filters {
            price: Price { min: dec!(0.2), max: dec!(10.0), step: dec!(0.1) },
            size: Size { min: dec!(0.2), max: dec!(10.0), step: dec!(0.1) },
            ..Default::default()
        }
    }

    fn exchange_info() -> crate::exchanges::ExchangeInfo {
        let mut fees: KeyedBy<Fees> = HashMap::new();
        fees.insert("__all__".into(), Fees { maker: dec!(0.1), taker: dec!(0.1) });
        let mut filter_map: KeyedBy<Filters> = HashMap::new();
        filter_map.insert("__all__".into(), filters());
        crate::exchanges::ExchangeInfo {
            fees,
            filters: filter_map,
            ..Default::default()
        }
    }

    fn fake() -> Arc<Fake> {
        let fake = Arc::new(Fake::new());
        fake.set_capabilities(Capabilities {
            can_place_market_order: true,
            ..Default::default()
        });
        fake.set_exchange_info(exchange_info());
        fake.script_client_id(CLIENT_ID);
        fake
    }

    async fn broker(fake: &Arc<Fake>) -> LimitBroker {
        let informant = Arc::new(
            Informant::connect(
                Arc::new(Memory::new()),
                vec![fake.clone() as Arc<dyn Exchange>],
            )
            .await
            .unwrap(),
        );
        let orderbook = Arc::new(Orderbook::new(vec![fake.clone() as Arc<dyn Exchange>]));
        let user = Arc::new(User::new(vec![fake.clone() as Arc<dyn Exchange>]));
        LimitBroker::leading(informant, orderbook, user)
    }

    fn buy_request(quote: Decimal) -> BrokerRequest {
        BrokerRequest::quote("fake", Account::Spot, Symbol::new("eth-btc"), quote)
    }

    fn fill(price: Decimal, size: Decimal, fee: Decimal) -> Fill {
        Fill {
            price,
            size,
            quote: price * size,
            fee,
            fee_asset: "eth".into(),
        }
    }

    async fn wait_for_placements(fake: &Fake, count: usize) {
        for _ in 0..200 {
            tokio::task::yield_now().await;
            if fake.place_order_calls.lock().len() >= count {
                return;
            }
        }
        panic!("timed out waiting for {count} placement(s)");
    }

    #[tokio::test]
    async fn test_buy_fully_filled_on_first_placement() {
        // Spread is wide; leading posts one tick above best bid.
        let fake = fake();
        fake.set_depth_snapshot(vec![(dec!(0.9), dec!(1.0))], vec![], 1);
        let broker = broker(&fake).await;

        let task = tokio::spawn({
            let fake = fake.clone();
            async move {
                wait_for_placements(&fake, 1).await;
                {
                    let calls = fake.place_order_calls.lock();
                    assert_eq!(calls[0].price, Some(dec!(1.0)));
                    assert_eq!(calls[0].size, Some(dec!(1.0)));
                }
                fake.push_order_update(OrderUpdate::New { client_id: CLIENT_ID.into() });
                fake.push_order_update(OrderUpdate::Match {
                    client_id: CLIENT_ID.into(),
                    fill: fill(dec!(1.0), dec!(0.5), dec!(0.05)),
                });
                fake.push_order_update(OrderUpdate::Match {
                    client_id: CLIENT_ID.into(),
                    fill: fill(dec!(1.0), dec!(0.5), dec!(0.05)),
                });
                fake.push_order_update(OrderUpdate::Done { client_id: CLIENT_ID.into(), time: 7 });
            }
        });

        let result = broker.buy(buy_request(dec!(1.0))).await.unwrap();
        task.await.unwrap();

        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.time, 7);
        assert_eq!(Fill::total_size(&result.fills), dec!(1.0));
        assert_eq!(Fill::total_quote(&result.fills), dec!(1.0));
        assert_eq!(Fill::total_fee_for(&result.fills, "eth"), dec!(0.1));
    }

    #[tokio::test]
    async fn test_partial_fill_then_reprice_up() {
        let fake = fake();
        fake.set_depth_snapshot(
            vec![(dec!(0.9), dec!(1.0))],
            vec![(dec!(5.0), dec!(1.0))],
            1,
        );
        let broker = broker(&fake).await;

        let task = tokio::spawn({
            let fake = fake.clone();
            async move {
                wait_for_placements(&fake, 1).await;
                fake.push_order_update(OrderUpdate::New { client_id: CLIENT_ID.into() });
                fake.push_order_update(OrderUpdate::Match {
                    client_id: CLIENT_ID.into(),
                    fill: fill(dec!(1.0), dec!(1.0), dec!(0.1)),
                });
                // Another bidder takes the lead at 1.9.
                fake.push_depth(Depth::Update {
                    bids: vec![(dec!(1.9), dec!(1.0))],
                    asks: vec![],
                    first_update_id: 2,
                    last_update_id: 2,
                });
                // Broker cancels; acknowledge it.
                for _ in 0..200 {
                    tokio::task::yield_now().await;
                    if !fake.cancel_order_calls.lock().is_empty() {
                        break;
                    }
                }
                fake.push_order_update(OrderUpdate::Cancelled {
                    client_id: CLIENT_ID.into(),
                    time: 3,
                    reason: CancelledReason::Unknown,
                });
                wait_for_placements(&fake, 2).await;
                {
                    let calls = fake.place_order_calls.lock();
                    assert_eq!(calls[1].price, Some(dec!(2.0)));
                    assert_eq!(calls[1].size, Some(dec!(0.5)));
                }
                fake.push_order_update(OrderUpdate::New { client_id: CLIENT_ID.into() });
                fake.push_order_update(OrderUpdate::Match {
                    client_id: CLIENT_ID.into(),
                    fill: fill(dec!(2.0), dec!(0.5), dec!(0.05)),
                });
                fake.push_order_update(OrderUpdate::Done { client_id: CLIENT_ID.into(), time: 9 });
            }
        });

        let result = broker.buy(buy_request(dec!(2.0))).await.unwrap();
        task.await.unwrap();

        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(Fill::total_size(&result.fills), dec!(1.5));
        assert_eq!(Fill::total_quote(&result.fills), dec!(2.0));
        assert_eq!(Fill::total_fee_for(&result.fills, "eth"), dec!(0.15));
        assert_eq!(fake.place_order_calls.lock().len(), 2);
        assert_eq!(fake.cancel_order_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_no_reprice_when_own_order_is_best() {
        let fake = fake();
        fake.set_depth_snapshot(
            vec![(dec!(0.9), dec!(1.0))],
            vec![(dec!(5.0), dec!(1.0))],
            1,
        );
        let broker = broker(&fake).await;

        let task = tokio::spawn({
            let fake = fake.clone();
            async move {
                wait_for_placements(&fake, 1).await;
                fake.push_order_update(OrderUpdate::New { client_id: CLIENT_ID.into() });
                // Our own order shows up as the new best bid; no reprice.
                fake.push_depth(Depth::Update {
                    bids: vec![(dec!(1.0), dec!(1.0))],
                    asks: vec![],
                    first_update_id: 2,
                    last_update_id: 2,
                });
                for _ in 0..100 {
                    tokio::task::yield_now().await;
                }
                assert!(fake.cancel_order_calls.lock().is_empty());
                fake.push_order_update(OrderUpdate::Match {
                    client_id: CLIENT_ID.into(),
                    fill: fill(dec!(1.0), dec!(1.0), dec!(0.1)),
                });
                fake.push_order_update(OrderUpdate::Done { client_id: CLIENT_ID.into(), time: 2 });
            }
        });

        let result = broker.buy(buy_request(dec!(1.0))).await.unwrap();
        task.await.unwrap();
        assert_eq!(fake.place_order_calls.lock().len(), 1);
        assert_eq!(result.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_matching_never_improves() {
        let fake = fake();
        fake.set_depth_snapshot(
            vec![(dec!(0.9), dec!(1.0))],
            vec![(dec!(5.0), dec!(1.0))],
            1,
        );
        let informant = Arc::new(
            Informant::connect(
                Arc::new(Memory::new()),
                vec![fake.clone() as Arc<dyn Exchange>],
            )
            .await
            .unwrap(),
        );
        let orderbook = Arc::new(Orderbook::new(vec![fake.clone() as Arc<dyn Exchange>]));
        let user = Arc::new(User::new(vec![fake.clone() as Arc<dyn Exchange>]));
        let broker = LimitBroker::matching(informant, orderbook, user);

        let task = tokio::spawn({
            let fake = fake.clone();
            async move {
                wait_for_placements(&fake, 1).await;
                {
                    let calls = fake.place_order_calls.lock();
                    assert_eq!(calls[0].price, Some(dec!(0.9)));
                }
                fake.push_order_update(OrderUpdate::New { client_id: CLIENT_ID.into() });
                fake.push_order_update(OrderUpdate::Match {
                    client_id: CLIENT_ID.into(),
                    fill: fill(dec!(0.9), dec!(1.1), dec!(0.11)),
                });
                fake.push_order_update(OrderUpdate::Done { client_id: CLIENT_ID.into(), time: 1 });
            }
        });

        let result = broker.buy(buy_request(dec!(1.0))).await.unwrap();
        task.await.unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_min_notional_partial_completion() {
        let fake = fake();
        let mut info = exchange_info();
        info.filters.insert(
            "__all__".into(),
            Filters {
                price: Price { step: dec!(1.0), ..Default::default() },
                size: Size { step: dec!(0.01), ..Default::default() },
                min_notional: MinNotional { min_notional: dec!(10.0) },
                ..Default::default()
            },
        );
        fake.set_exchange_info(info);
        fake.set_depth_snapshot(vec![(dec!(99.0), dec!(1.0))], vec![], 1);
        let broker = broker(&fake).await;

        let task = tokio::spawn({
            let fake = fake.clone();
            async move {
                wait_for_placements(&fake, 1).await;
                fake.push_order_update(OrderUpdate::New { client_id: CLIENT_ID.into() });
                // Fill most of it, leaving less than min notional.
                fake.push_order_update(OrderUpdate::Match {
                    client_id: CLIENT_ID.into(),
                    fill: Fill {
                        price: dec!(100.0),
                        size: dec!(0.95),
                        quote: dec!(95.0),
                        fee: dec!(0.0),
                        fee_asset: "eth".into(),
                    },
                });
                // Someone outbids; the re-price path discovers the
                // remainder is below min notional and completes.
                fake.push_depth(Depth::Update {
                    bids: vec![(dec!(101.0), dec!(1.0))],
                    asks: vec![],
                    first_update_id: 2,
                    last_update_id: 2,
                });
                for _ in 0..200 {
                    tokio::task::yield_now().await;
                    if !fake.cancel_order_calls.lock().is_empty() {
                        break;
                    }
                }
                fake.push_order_update(OrderUpdate::Cancelled {
                    client_id: CLIENT_ID.into(),
                    time: 3,
                    reason: CancelledReason::Unknown,
                });
            }
        });

        let result = broker.buy(buy_request(dec!(100.0))).await.unwrap();
        task.await.unwrap();
        assert_eq!(result.status, OrderStatus::PartiallyFilled);
        assert_eq!(Fill::total_quote(&result.fills), dec!(95.0));
        assert_eq!(fake.cancel_order_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_edit_insufficient_funds_reconciles() {
        let fake = fake();
        fake.set_capabilities(Capabilities {
            can_edit_order: true,
            can_edit_order_atomic: false,
            ..Default::default()
        });
        fake.set_depth_snapshot(
            vec![(dec!(0.9), dec!(1.0))],
            vec![(dec!(5.0), dec!(1.0))],
            1,
        );
        fake.script_edit_order(Err(BadOrder::InsufficientFunds("locked by fill".into()).into()));
        let informant = Arc::new(
            Informant::connect(
                Arc::new(Memory::new()),
                vec![fake.clone() as Arc<dyn Exchange>],
            )
            .await
            .unwrap(),
        );
        let orderbook = Arc::new(Orderbook::new(vec![fake.clone() as Arc<dyn Exchange>]));
        let user = Arc::new(User::new(vec![fake.clone() as Arc<dyn Exchange>]));
        let broker = LimitBroker::leading_edit(informant, orderbook, user);

        let task = tokio::spawn({
            let fake = fake.clone();
            async move {
                wait_for_placements(&fake, 1).await;
                fake.push_order_update(OrderUpdate::New { client_id: CLIENT_ID.into() });
                // Fill lands while the edit is in flight; the edit gets
                // rejected with insufficient funds.
                fake.push_order_update(OrderUpdate::Match {
                    client_id: CLIENT_ID.into(),
                    fill: fill(dec!(1.0), dec!(1.0), dec!(0.1)),
                });
                fake.push_depth(Depth::Update {
                    bids: vec![(dec!(1.9), dec!(1.0))],
                    asks: vec![],
                    first_update_id: 2,
                    last_update_id: 2,
                });
                wait_for_placements(&fake, 2).await;
                {
                    let calls = fake.place_order_calls.lock();
                    // Remainder recomputed after absorbing the fill.
                    assert_eq!(calls[1].price, Some(dec!(2.0)));
                    assert_eq!(calls[1].size, Some(dec!(0.5)));
                }
                fake.push_order_update(OrderUpdate::New { client_id: CLIENT_ID.into() });
                fake.push_order_update(OrderUpdate::Match {
                    client_id: CLIENT_ID.into(),
                    fill: fill(dec!(2.0), dec!(0.5), dec!(0.05)),
                });
                fake.push_order_update(OrderUpdate::Done { client_id: CLIENT_ID.into(), time: 4 });
            }
        });

        let result = broker.buy(buy_request(dec!(2.0))).await.unwrap();
        task.await.unwrap();

        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(fake.edit_order_calls.lock().len(), 1);
        assert_eq!(fake.place_order_calls.lock().len(), 2);
        assert_eq!(Fill::total_quote(&result.fills), dec!(2.0));
    }

    #[tokio::test]
    async fn test_cancel_missing_means_filled() {
        let fake = fake();
        fake.set_depth_snapshot(
            vec![(dec!(0.9), dec!(2.0))],
            vec![(dec!(5.0), dec!(1.0))],
            1,
        );
        fake.script_cancel_order(Err(BadOrder::OrderMissing("unknown order".into()).into()));
        let broker = broker(&fake).await;

        let task = tokio::spawn({
            let fake = fake.clone();
            async move {
                wait_for_placements(&fake, 1).await;
                fake.push_order_update(OrderUpdate::New { client_id: CLIENT_ID.into() });
                fake.push_order_update(OrderUpdate::Match {
                    client_id: CLIENT_ID.into(),
                    fill: fill(dec!(1.0), dec!(1.0), dec!(0.1)),
                });
                // Trigger a re-price whose cancel will find nothing.
                fake.push_depth(Depth::Update {
                    bids: vec![(dec!(1.9), dec!(1.0))],
                    asks: vec![],
                    first_update_id: 2,
                    last_update_id: 2,
                });
            }
        });

        let result = broker.buy(buy_request(dec!(1.0))).await.unwrap();
        task.await.unwrap();

        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(Fill::total_size(&result.fills), dec!(1.0));
    }
}
