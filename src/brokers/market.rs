//! Market broker
//!
//! Submits immediate market orders. Where the venue cannot take
//! quote-denominated market orders, the requested quote is converted to a
//! base size by walking the synchronized order book. Fills are taken from
//! the placement response where the venue reports them directly, otherwise
//! reconciled over the order update stream opened before placement.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::errors::{BadOrder, ExchangeError, Result};
use crate::exchanges::NewOrder;
use crate::informant::Informant;
use crate::order::{Fill, OrderResult, OrderStatus, OrderUpdate};
use crate::orderbook::Orderbook;
use crate::time;
use crate::types::Side;
use crate::user::User;

use super::{Broker, BrokerRequest};

pub struct MarketBroker {
    informant: Arc<Informant>,
    orderbook: Arc<Orderbook>,
    user: Arc<User>,
}

impl MarketBroker {
    pub fn new(informant: Arc<Informant>, orderbook: Arc<Orderbook>, user: Arc<User>) -> Self {
        MarketBroker { informant, orderbook, user }
    }

    async fn synthesize_fills(
        &self,
        request: &BrokerRequest,
        side: Side,
        size: Option<Decimal>,
        quote: Option<Decimal>,
    ) -> Result<Vec<Fill>> {
        let (fees, filters) = self.informant.get_fees_filters(&request.exchange, &request.symbol)?;
        let book = self.orderbook.sync(&request.exchange, &request.symbol).await?;
        Ok(match side {
            Side::Buy => book.find_order_asks(size, quote, fees.taker, &filters),
            Side::Sell => book.find_order_bids(size, quote, fees.taker, &filters),
        })
    }

    async fn fill(
        &self,
        request: &BrokerRequest,
        side: Side,
        size: Option<Decimal>,
        quote: Option<Decimal>,
    ) -> Result<OrderResult> {
        let capabilities = self.user.capabilities(&request.exchange)?;
        if !capabilities.can_place_market_order {
            return Err(ExchangeError::Unsupported("market orders"));
        }

        let size = match size {
            Some(size) => {
                let (_, filters) =
                    self.informant.get_fees_filters(&request.exchange, &request.symbol)?;
                let size = filters.size.round_down(size);
                if size == Decimal::ZERO {
                    return Err(BadOrder::Rejected("size zero after rounding".into()).into());
                }
                Some(size)
            }
            None => None,
        };

        let mut order = NewOrder::market(request.account.clone(), request.symbol.clone(), side);
        order.size = size;
        order.quote = quote;
        order.leverage = request.leverage;
        order.reduce_only = request.reduce_only;

        if capabilities.can_get_market_order_result_direct {
            return self.user.place_order(&request.exchange, order).await;
        }

        // Subscribe before placing so no fill events are missed.
        let client_id = self.user.generate_client_id(&request.exchange)?;
        order.client_id = Some(client_id.clone());
        let mut stream = self
            .user
            .connect_stream_orders(&request.exchange, request.account.clone(), &request.symbol)
            .await?;
        self.user.place_order(&request.exchange, order).await?;

        let mut fills = Vec::new();
        let mut fill_time = 0;
        while let Some(update) = stream.next().await {
            let update = update?;
            if update.client_id() != client_id {
                continue;
            }
            match update {
                OrderUpdate::New { .. } => {
                    debug!(symbol = %request.symbol, %side, "market order {client_id} confirmed");
                }
                OrderUpdate::Match { fill, .. } => fills.push(fill),
                OrderUpdate::Done { time, .. } => {
                    info!(symbol = %request.symbol, %side, "market order {client_id} done");
                    fill_time = time;
                    break;
                }
                OrderUpdate::Cancelled { .. } => {
                    return Err(ExchangeError::unexpected(format!(
                        "market order {client_id} cancelled by venue"
                    )));
                }
            }
        }
        Ok(OrderResult { time: fill_time, status: OrderStatus::Filled, fills })
    }
}

#[async_trait]
impl Broker for MarketBroker {
    async fn buy(&self, request: BrokerRequest) -> Result<OrderResult> {
        request.validate_funds()?;
        let (fees, filters) = self.informant.get_fees_filters(&request.exchange, &request.symbol)?;

        let size = match request.size {
            Some(size) if request.ensure_size => Some(filters.with_fee(size, fees.taker)),
            other => other,
        };

        if request.test {
            let fills = self.synthesize_fills(&request, Side::Buy, size, request.quote).await?;
            return Ok(OrderResult::not_placed(time::now(), fills));
        }

        match (size, request.quote) {
            (Some(size), None) => {
                info!(symbol = %request.symbol, %size, "buying with market order");
                self.fill(&request, Side::Buy, Some(size), None).await
            }
            (None, Some(quote)) => {
                info!(symbol = %request.symbol, %quote, "buying by quote with market order");
                if self.user.capabilities(&request.exchange)?.can_place_market_order_quote {
                    self.fill(&request, Side::Buy, None, Some(quote)).await
                } else {
                    // Convert the quote to a base size off the book.
                    let fills =
                        self.synthesize_fills(&request, Side::Buy, None, Some(quote)).await?;
                    let size = Fill::total_size(&fills);
                    if size == Decimal::ZERO {
                        return Err(BadOrder::Rejected(
                            "insufficient liquidity to convert quote to size".into(),
                        )
                        .into());
                    }
                    self.fill(&request, Side::Buy, Some(size), None).await
                }
            }
            _ => unreachable!("validated above"),
        }
    }

    async fn sell(&self, request: BrokerRequest) -> Result<OrderResult> {
        request.validate_funds()?;
        let size = request
            .size
            .ok_or_else(|| ExchangeError::from(BadOrder::Rejected("sell requires size".into())))?;

        if request.test {
            let fills = self.synthesize_fills(&request, Side::Sell, Some(size), None).await?;
            return Ok(OrderResult::not_placed(time::now(), fills));
        }

        info!(symbol = %request.symbol, %size, "selling with market order");
        self.fill(&request, Side::Sell, Some(size), None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::{Capabilities, Exchange, Fake};
    use crate::storage::Memory;
    use crate::types::{Account, Symbol};
    use rust_decimal_macros::dec;

    async fn broker(fake: Arc<Fake>) -> MarketBroker {
        let informant = Arc::new(
            Informant::connect(Arc::new(Memory::new()), vec![fake.clone() as Arc<dyn Exchange>])
                .await
                .unwrap(),
        );
        let orderbook = Arc::new(Orderbook::new(vec![fake.clone() as Arc<dyn Exchange>]));
        let user = Arc::new(User::new(vec![fake as Arc<dyn Exchange>]));
        MarketBroker::new(informant, orderbook, user)
    }

    fn request(quote: Decimal) -> BrokerRequest {
        BrokerRequest::quote("fake", Account::Spot, Symbol::new("eth-btc"), quote)
    }

    #[tokio::test]
    async fn test_buy_quote_synthesis_when_unsupported() {
        let fake = Arc::new(Fake::new());
        fake.set_capabilities(Capabilities {
            can_place_market_order: true,
            can_place_market_order_quote: false,
            can_get_market_order_result_direct: true,
            ..Default::default()
        });
        // quote 1.5 covers 0.5 @ 1.0 plus 0.5 @ 2.0.
        fake.set_depth_snapshot(
            vec![],
            vec![(dec!(1.0), dec!(0.5)), (dec!(2.0), dec!(1.0))],
            1,
        );
        let broker = broker(fake.clone()).await;

        broker.buy(request(dec!(1.5))).await.unwrap();

        let calls = fake.place_order_calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].size, Some(dec!(1.0)));
        assert_eq!(calls[0].quote, None);
    }

    #[tokio::test]
    async fn test_buy_quote_passthrough_when_supported() {
        let fake = Arc::new(Fake::new());
        fake.set_capabilities(Capabilities {
            can_place_market_order: true,
            can_place_market_order_quote: true,
            can_get_market_order_result_direct: true,
            ..Default::default()
        });
        let broker = broker(fake.clone()).await;

        broker.buy(request(dec!(1.5))).await.unwrap();
        let calls = fake.place_order_calls.lock();
        assert_eq!(calls[0].quote, Some(dec!(1.5)));
        assert_eq!(calls[0].size, None);
    }

    #[tokio::test]
    async fn test_test_mode_returns_synthesized_fills() {
        let fake = Arc::new(Fake::new());
        fake.set_depth_snapshot(vec![], vec![(dec!(1.0), dec!(2.0))], 1);
        let broker = broker(fake.clone()).await;

        let result = broker.buy(request(dec!(1.5)).test(true)).await.unwrap();
        assert_eq!(result.status, OrderStatus::NotPlaced);
        assert_eq!(Fill::total_size(&result.fills), dec!(1.5));
        assert!(fake.place_order_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stream_reconciliation() {
        let fake = Arc::new(Fake::new());
        fake.set_capabilities(Capabilities {
            can_place_market_order: true,
            can_place_market_order_quote: true,
            can_get_market_order_result_direct: false,
            ..Default::default()
        });
        fake.script_client_id("cid");
        let fill = Fill {
            price: dec!(1.0),
            size: dec!(1.5),
            quote: dec!(1.5),
            fee: dec!(0.0015),
            fee_asset: "eth".into(),
        };
        let broker = broker(fake.clone()).await;

        let task = {
            let fake = fake.clone();
            tokio::spawn(async move {
                // Give the broker time to subscribe and place.
                for _ in 0..20 {
                    tokio::task::yield_now().await;
                    if !fake.place_order_calls.lock().is_empty() {
                        break;
                    }
                }
                fake.push_order_update(OrderUpdate::New { client_id: "cid".into() });
                fake.push_order_update(OrderUpdate::Match {
                    client_id: "cid".into(),
                    fill: fill.clone(),
                });
                fake.push_order_update(OrderUpdate::Done { client_id: "cid".into(), time: 42 });
                fill
            })
        };
        let result = broker.buy(request(dec!(1.5))).await.unwrap();
        let fill = task.await.unwrap();

        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.time, 42);
        assert_eq!(result.fills, vec![fill]);
    }
}
