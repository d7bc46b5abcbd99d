//! Positioner
//!
//! Opens and closes positions through a broker, orchestrating the margin
//! borrow/repay lifecycle for shorts. Entry points batch multiple symbols
//! so custodian funds are acquired and released once per invocation.
//! The simulated positioner replays the same numeric effects as a pure
//! function of market inputs for backtests.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::brokers::{Broker, BrokerRequest};
use crate::chandler::Chandler;
use crate::custodians::Custodian;
use crate::errors::{BadOrder, ExchangeError, Result};
use crate::exchanges::Transfer;
use crate::filters::Filters;
use crate::informant::Informant;
use crate::math::{ceil_multiple, floor_multiple, round_down, round_half_up};
use crate::order::Fill;
use crate::position::{CloseReason, ClosedPosition, OpenLong, OpenPosition, OpenShort};
use crate::sync::backoff;
use crate::time::{self, Interval, Timestamp, MIN_MS};
use crate::types::{Account, Balance, BorrowInfo, InterestCharge, Symbol, TradingMode};
use crate::user::User;

pub(crate) const MARGIN_MULTIPLIER: u32 = 2;
const BORROWABLE_RETRIES: u32 = 10;
const REPAY_BALANCE_RETRIES: u32 = 10;

pub struct Positioner {
    informant: Arc<Informant>,
    chandler: Arc<Chandler>,
    broker: Arc<dyn Broker>,
    user: Arc<User>,
    custodians: HashMap<String, Arc<dyn Custodian>>,
}

impl Positioner {
    pub fn new(
        informant: Arc<Informant>,
        chandler: Arc<Chandler>,
        broker: Arc<dyn Broker>,
        user: Arc<User>,
        custodians: Vec<(String, Arc<dyn Custodian>)>,
    ) -> Positioner {
        Positioner {
            informant,
            chandler,
            broker,
            user,
            custodians: custodians.into_iter().collect(),
        }
    }

    fn custodian(&self, name: &str) -> Result<&Arc<dyn Custodian>> {
        self.custodians
            .get(name)
            .ok_or_else(|| ExchangeError::unexpected(format!("unknown custodian {name}")))
    }

    /// Opens positions for `entries` of `(symbol, quote, short)`; funds
    /// for all entries are acquired from the custodian up front.
    pub async fn open_positions(
        &self,
        exchange: &str,
        custodian: &str,
        mode: TradingMode,
        entries: &[(Symbol, Decimal, bool)],
    ) -> Result<Vec<OpenPosition>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        assert!(matches!(mode, TradingMode::Paper | TradingMode::Live));
        info!(?entries, "opening position(s)");
        let custodian_instance = self.custodian(custodian)?;
        let capabilities = self.user.capabilities(exchange)?;

        let mut acquires: HashMap<String, Decimal> = HashMap::new();
        for (symbol, quote, short) in entries {
            *acquires.entry(symbol.quote_asset().to_owned()).or_default() += *quote;
            if *short && !(capabilities.can_margin_borrow || capabilities.can_margin_order_leverage)
            {
                return Err(ExchangeError::Unsupported("shorting on this venue"));
            }
        }
        for (asset, quote) in &acquires {
            custodian_instance.acquire(exchange, asset, *quote).await?;
        }

        let mut result = Vec::with_capacity(entries.len());
        for (symbol, quote, short) in entries {
            let position = if *short && capabilities.can_margin_borrow {
                self.open_short_using_borrow(exchange, symbol, *quote, mode).await?
            } else if *short {
                self.open_short_using_leveraged_order(exchange, symbol, *quote, mode).await?
            } else {
                self.open_long(exchange, symbol, *quote, mode).await?
            };
            result.push(position);
        }

        // Long positions hand the received base back to the custodian.
        let mut releases: HashMap<String, Decimal> = HashMap::new();
        for position in &result {
            if let OpenPosition::Long(long) = position {
                *releases.entry(long.symbol.base_asset().to_owned()).or_default() +=
                    long.base_gain();
            }
        }
        for (asset, quote) in &releases {
            custodian_instance.release(exchange, asset, *quote).await?;
        }

        info!("opened {} position(s)", result.len());
        Ok(result)
    }

    /// Closes positions for `entries` of `(position, reason)`.
    pub async fn close_positions(
        &self,
        custodian: &str,
        mode: TradingMode,
        entries: Vec<(OpenPosition, CloseReason)>,
    ) -> Result<Vec<ClosedPosition>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        assert!(matches!(mode, TradingMode::Paper | TradingMode::Live));
        info!(
            entries = ?entries.iter().map(|(p, r)| (p.symbol().clone(), *r)).collect::<Vec<_>>(),
            "closing position(s)"
        );
        let custodian_instance = self.custodian(custodian)?;
        let capabilities = self.user.capabilities(entries[0].0.exchange())?;

        // Long positions need their base back from the custodian first.
        let mut acquires: HashMap<(String, String), Decimal> = HashMap::new();
        for (position, _) in &entries {
            if let OpenPosition::Long(long) = position {
                *acquires
                    .entry((long.exchange.clone(), long.symbol.base_asset().to_owned()))
                    .or_default() += long.base_gain();
            }
        }
        for ((exchange, asset), quote) in &acquires {
            custodian_instance.acquire(exchange, asset, *quote).await?;
        }

        let mut result = Vec::with_capacity(entries.len());
        for (position, reason) in entries {
            let closed = match position {
                OpenPosition::Short(short) if capabilities.can_margin_borrow => {
                    self.close_short_using_borrow(short, mode, reason).await?
                }
                OpenPosition::Short(short) => {
                    self.close_short_using_leveraged_order(short, mode, reason).await?
                }
                OpenPosition::Long(long) => self.close_long(long, mode, reason).await?,
            };
            result.push(closed);
        }

        let mut releases: HashMap<(String, String), Decimal> = HashMap::new();
        for position in &result {
            *releases
                .entry((
                    match position {
                        ClosedPosition::Long(p) => p.open.exchange.clone(),
                        ClosedPosition::Short(p) => p.open.exchange.clone(),
                    },
                    position.symbol().quote_asset().to_owned(),
                ))
                .or_default() += position.gain();
        }
        for ((exchange, asset), quote) in &releases {
            custodian_instance.release(exchange, asset, *quote).await?;
        }

        info!("closed {} position(s)", result.len());
        Ok(result)
    }

    async fn open_long(
        &self,
        exchange: &str,
        symbol: &Symbol,
        quote: Decimal,
        mode: TradingMode,
    ) -> Result<OpenPosition> {
        info!(%symbol, %mode, %quote, "opening long position");
        let result = self
            .broker
            .buy(
                BrokerRequest::quote(exchange, Account::Spot, symbol.clone(), quote)
                    .test(mode == TradingMode::Paper),
            )
            .await?;
        let position = OpenLong {
            exchange: exchange.to_owned(),
            symbol: symbol.clone(),
            time: result.time,
            fills: result.fills,
        };
        info!(%symbol, %mode, "opened long position");
        Ok(OpenPosition::Long(position))
    }

    async fn close_long(
        &self,
        position: OpenLong,
        mode: TradingMode,
        reason: CloseReason,
    ) -> Result<ClosedPosition> {
        info!(symbol = %position.symbol, %mode, "closing long position");
        let result = self
            .broker
            .sell(
                BrokerRequest::size(
                    position.exchange.clone(),
                    Account::Spot,
                    position.symbol.clone(),
                    position.base_gain(),
                )
                .test(mode == TradingMode::Paper),
            )
            .await?;
        let closed = position.close(result.time, result.fills, reason);
        info!(symbol = %closed.open.symbol, %mode, "closed long position");
        Ok(ClosedPosition::Long(closed))
    }

    async fn open_short_using_borrow(
        &self,
        exchange: &str,
        symbol: &Symbol,
        collateral: Decimal,
        mode: TradingMode,
    ) -> Result<OpenPosition> {
        info!(%symbol, %mode, %collateral, "opening short position");
        let (base_asset, quote_asset) = symbol.assets();
        let (_, filters) = self.informant.get_fees_filters(exchange, symbol)?;
        let account = Account::Isolated(symbol.clone());

        let price = self.chandler.get_last_candle(exchange, symbol, MIN_MS).await?.close;

        let borrowed = if mode == TradingMode::Paper {
            let borrow_info =
                self.informant.get_borrow_info(exchange, symbol.as_str(), base_asset)?;
            calculate_borrowed(&filters, MARGIN_MULTIPLIER, borrow_info.limit, collateral, price)?
        } else {
            info!("transferring {collateral} {quote_asset} from spot to {symbol} account");
            self.user
                .transfer(
                    exchange,
                    Transfer {
                        asset: quote_asset.to_owned(),
                        size: collateral,
                        from_account: Account::Spot,
                        to_account: account.clone(),
                    },
                )
                .await?;

            // Some venues cache the borrowable quota and keep reporting 0
            // after the transfer. Retry, and if that does not help, prime
            // the cache by querying the quote asset once.
            let borrowable = match self
                .get_max_borrowable_with_retries(exchange, &account, base_asset)
                .await
            {
                Ok(borrowable) => borrowable,
                Err(err) if err.is_transient() => {
                    warn!(
                        "borrowable 0 even after retries; querying quote asset max \
                         borrowable to reset venue cache"
                    );
                    self.user.get_max_borrowable(exchange, account.clone(), quote_asset).await?;
                    self.get_max_borrowable_with_retries(exchange, &account, base_asset).await?
                }
                Err(err) => return Err(err),
            };

            let borrowed =
                calculate_borrowed(&filters, MARGIN_MULTIPLIER, borrowable, collateral, price)?;
            info!("borrowing {borrowed} {base_asset}");
            self.user.borrow(exchange, base_asset, borrowed, account.clone()).await?;
            borrowed
        };

        let sell_account =
            if mode == TradingMode::Live { account } else { Account::Spot };
        let result = self
            .broker
            .sell(
                BrokerRequest::size(exchange, sell_account, symbol.clone(), borrowed)
                    .test(mode == TradingMode::Paper),
            )
            .await?;

        let position = OpenShort {
            exchange: exchange.to_owned(),
            symbol: symbol.clone(),
            collateral,
            borrowed,
            time: result.time,
            fills: result.fills,
        };
        info!(%symbol, %mode, "opened short position");
        Ok(OpenPosition::Short(position))
    }

    async fn close_short_using_borrow(
        &self,
        position: OpenShort,
        mode: TradingMode,
        reason: CloseReason,
    ) -> Result<ClosedPosition> {
        info!(symbol = %position.symbol, %mode, "closing short position");
        let exchange = position.exchange.clone();
        let base_asset = position.symbol.base_asset().to_owned();
        let quote_asset = position.symbol.quote_asset().to_owned();
        let base_info = self.informant.get_asset_info(&exchange, &base_asset)?;
        let borrow_info =
            self.informant.get_borrow_info(&exchange, position.symbol.as_str(), &base_asset)?;
        let account = Account::Isolated(position.symbol.clone());

        let interest = if mode == TradingMode::Live {
            self.user.get_balance(&exchange, &account, &base_asset).await?.interest
        } else {
            calculate_interest(
                position.borrowed,
                &borrow_info,
                position.time,
                time::now(),
                base_info.precision,
            )
        };

        // Buy a buffer of one extra interest tick in case it ticks while
        // the order fills.
        let interest_per_tick = borrow_info.interest_rate * position.borrowed;
        let repay = position.borrowed + interest;
        let size = repay + interest_per_tick;

        let buy_account =
            if mode == TradingMode::Live { account.clone() } else { Account::Spot };
        let result = self
            .broker
            .buy(
                BrokerRequest::size(&exchange, buy_account, position.symbol.clone(), size)
                    .test(mode == TradingMode::Paper)
                    .ensure_size(true),
            )
            .await?;

        let symbol = position.symbol.clone();
        let borrowed = position.borrowed;
        let closed = position.close(interest, result.time, result.fills, reason);

        if mode == TradingMode::Live {
            info!("repaying {borrowed} + {interest} {base_asset}");
            self.user.repay(&exchange, &base_asset, repay, account.clone()).await?;

            // An interest tick may have landed right before the repay, and
            // the venue may keep serving the stale pre-repay balance for a
            // while. Retry the read, then settle any residue.
            let mut balance = self
                .get_repaid_balance_with_retries(&exchange, &account, &base_asset, borrowed)
                .await?;
            if balance.repay() > Decimal::ZERO {
                warn!("did not repay enough; {} {base_asset} still to be repaid", balance.repay());
                if balance.available < balance.repay() {
                    return Err(ExchangeError::unexpected(format!(
                        "cannot repay {} {base_asset} with only {} available; buying more \
                         base is not implemented",
                        balance.repay(),
                        balance.available
                    )));
                }
                self.user
                    .repay(&exchange, &base_asset, balance.repay(), account.clone())
                    .await?;
                balance = self.user.get_balance(&exchange, &account, &base_asset).await?;
                debug_assert_eq!(balance.repay(), Decimal::ZERO);
            }

            let gain = closed.gain();
            info!("transferring {gain} {quote_asset} from {symbol} to spot account");
            self.user
                .transfer(
                    &exchange,
                    Transfer {
                        asset: quote_asset.clone(),
                        size: gain,
                        from_account: account.clone(),
                        to_account: Account::Spot,
                    },
                )
                .await?;
            if balance.available > Decimal::ZERO {
                info!(
                    "transferring {} {base_asset} from {symbol} to spot account",
                    balance.available
                );
                self.user
                    .transfer(
                        &exchange,
                        Transfer {
                            asset: base_asset.clone(),
                            size: balance.available,
                            from_account: account,
                            to_account: Account::Spot,
                        },
                    )
                    .await?;
            }
        }

        info!(%symbol, %mode, "closed short position");
        Ok(ClosedPosition::Short(closed))
    }

    /// Shorting on venues that express margin through order leverage: no
    /// transfers or explicit borrow, the venue manages the loan.
    async fn open_short_using_leveraged_order(
        &self,
        exchange: &str,
        symbol: &Symbol,
        collateral: Decimal,
        mode: TradingMode,
    ) -> Result<OpenPosition> {
        info!(%symbol, %mode, %collateral, "opening short position using leveraged order");
        let base_asset = symbol.base_asset();
        let (_, filters) = self.informant.get_fees_filters(exchange, symbol)?;
        let borrow_info = self.informant.get_borrow_info(exchange, symbol.as_str(), base_asset)?;
        let price = self.chandler.get_last_candle(exchange, symbol, MIN_MS).await?.close;
        let borrowed =
            calculate_borrowed(&filters, MARGIN_MULTIPLIER, borrow_info.limit, collateral, price)?;

        let mut request = BrokerRequest::size(exchange, Account::Spot, symbol.clone(), borrowed)
            .test(mode == TradingMode::Paper);
        request.leverage = Some(MARGIN_MULTIPLIER);
        let result = self.broker.sell(request).await?;

        Ok(OpenPosition::Short(OpenShort {
            exchange: exchange.to_owned(),
            symbol: symbol.clone(),
            collateral,
            borrowed,
            time: result.time,
            fills: result.fills,
        }))
    }

    async fn close_short_using_leveraged_order(
        &self,
        position: OpenShort,
        mode: TradingMode,
        reason: CloseReason,
    ) -> Result<ClosedPosition> {
        info!(symbol = %position.symbol, %mode, "closing short position using leveraged order");
        let exchange = position.exchange.clone();
        let base_asset = position.symbol.base_asset();
        let base_info = self.informant.get_asset_info(&exchange, base_asset)?;
        let borrow_info =
            self.informant.get_borrow_info(&exchange, position.symbol.as_str(), base_asset)?;

        // The venue does not report accrued interest for leveraged
        // positions; derive it.
        let interest = calculate_interest(
            position.borrowed,
            &borrow_info,
            position.time,
            time::now(),
            base_info.precision,
        );

        let size = if mode == TradingMode::Live {
            let open_positions = self.user.list_open_margin_positions(&exchange).await?;
            open_positions
                .iter()
                .filter(|p| {
                    p.symbol == position.symbol && p.side == crate::types::Side::Sell
                })
                .map(|p| p.size)
                .sum()
        } else {
            let interest_per_tick = borrow_info.interest_rate * position.borrowed;
            position.borrowed + interest + interest_per_tick
        };

        let mut request = BrokerRequest::size(
            &exchange,
            Account::Spot,
            position.symbol.clone(),
            size,
        )
        .test(mode == TradingMode::Paper)
        .ensure_size(true);
        request.leverage = Some(MARGIN_MULTIPLIER);
        request.reduce_only = true;
        let result = self.broker.buy(request).await?;

        let closed = position.close(interest, result.time, result.fills, reason);
        Ok(ClosedPosition::Short(closed))
    }

    /// Venues can serve a stale zero borrowable quota; retry with backoff
    /// before giving up.
    async fn get_max_borrowable_with_retries(
        &self,
        exchange: &str,
        account: &Account,
        asset: &str,
    ) -> Result<Decimal> {
        let mut attempt = 0;
        loop {
            let borrowable =
                self.user.get_max_borrowable(exchange, account.clone(), asset).await?;
            if borrowable > Decimal::ZERO {
                return Ok(borrowable);
            }
            attempt += 1;
            if attempt >= BORROWABLE_RETRIES {
                return Err(ExchangeError::unexpected(format!(
                    "borrowable amount 0 for account {account} asset {asset}"
                )));
            }
            let delay = backoff(attempt);
            warn!(%account, %asset, "borrowable amount 0; retrying in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }

    /// After a repay, reads the balance until the venue stops serving the
    /// stale pre-repay value.
    async fn get_repaid_balance_with_retries(
        &self,
        exchange: &str,
        account: &Account,
        asset: &str,
        original_borrowed: Decimal,
    ) -> Result<Balance> {
        let mut attempt = 0;
        loop {
            let balance = self.user.get_balance(exchange, account, asset).await?;
            if balance.borrowed != original_borrowed {
                return Ok(balance);
            }
            attempt += 1;
            if attempt >= REPAY_BALANCE_RETRIES {
                return Err(ExchangeError::unexpected(format!(
                    "borrowed amount still {original_borrowed} for account {account} asset \
                     {asset}"
                )));
            }
            let delay = backoff(attempt);
            warn!(%account, %asset, "borrowed amount unchanged; retrying in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }
}

// =============================================================================
// Simulated positioner
// =============================================================================

/// Replays the positioner's numeric effects without venue interaction.
/// Used by backtests; fills derive from the candle close price and the
/// symbol's filters and fees.
pub struct SimulatedPositioner {
    informant: Arc<Informant>,
}

impl SimulatedPositioner {
    pub fn new(informant: Arc<Informant>) -> SimulatedPositioner {
        SimulatedPositioner { informant }
    }

    /// Entries are `(symbol, quote, short, time, price)`.
    pub fn open_simulated_positions(
        &self,
        exchange: &str,
        entries: &[(Symbol, Decimal, bool, Timestamp, Decimal)],
    ) -> Result<Vec<OpenPosition>> {
        entries
            .iter()
            .map(|(symbol, quote, short, time, price)| {
                if *short {
                    self.open_simulated_short(exchange, symbol, *time, *price, *quote)
                } else {
                    self.open_simulated_long(exchange, symbol, *time, *price, *quote)
                }
            })
            .collect()
    }

    /// Entries are `(position, reason, time, price)`.
    pub fn close_simulated_positions(
        &self,
        entries: Vec<(OpenPosition, CloseReason, Timestamp, Decimal)>,
    ) -> Result<Vec<ClosedPosition>> {
        entries
            .into_iter()
            .map(|(position, reason, time, price)| match position {
                OpenPosition::Long(long) => {
                    self.close_simulated_long(long, time, price, reason)
                }
                OpenPosition::Short(short) => {
                    self.close_simulated_short(short, time, price, reason)
                }
            })
            .collect()
    }

    fn open_simulated_long(
        &self,
        exchange: &str,
        symbol: &Symbol,
        time: Timestamp,
        price: Decimal,
        quote: Decimal,
    ) -> Result<OpenPosition> {
        let (fees, filters) = self.informant.get_fees_filters(exchange, symbol)?;
        let base_asset = symbol.base_asset();

        let size = filters.size.round_down(quote / price);
        if size == Decimal::ZERO {
            return Err(BadOrder::Rejected("insufficient funds".into()).into());
        }
        let quote = round_down(price * size, filters.quote_precision);
        let fee = round_half_up(size * fees.taker, filters.base_precision);

        debug!(%symbol, time = %time::format_timestamp(time), "opened simulated long position");
        Ok(OpenPosition::Long(OpenLong {
            exchange: exchange.to_owned(),
            symbol: symbol.clone(),
            time,
            fills: vec![Fill { price, size, quote, fee, fee_asset: base_asset.to_owned() }],
        }))
    }

    fn close_simulated_long(
        &self,
        position: OpenLong,
        time: Timestamp,
        price: Decimal,
        reason: CloseReason,
    ) -> Result<ClosedPosition> {
        let (fees, filters) =
            self.informant.get_fees_filters(&position.exchange, &position.symbol)?;
        let quote_asset = position.symbol.quote_asset().to_owned();

        // Size can round to zero when fees ate below the min size filter;
        // the position then closes with no fills.
        let mut fills = Vec::new();
        let size = filters.size.round_down(position.base_gain());
        if size > Decimal::ZERO {
            let quote = round_down(price * size, filters.quote_precision);
            let fee = round_half_up(quote * fees.taker, filters.quote_precision);
            fills.push(Fill { price, size, quote, fee, fee_asset: quote_asset });
        }

        debug!(
            symbol = %position.symbol,
            time = %time::format_timestamp(time),
            ?reason,
            "closed simulated long position"
        );
        Ok(ClosedPosition::Long(position.close(time, fills, reason)))
    }

    fn open_simulated_short(
        &self,
        exchange: &str,
        symbol: &Symbol,
        time: Timestamp,
        price: Decimal,
        collateral: Decimal,
    ) -> Result<OpenPosition> {
        let (fees, filters) = self.informant.get_fees_filters(exchange, symbol)?;
        let quote_asset = symbol.quote_asset();
        let borrow_info =
            self.informant.get_borrow_info(exchange, symbol.as_str(), symbol.base_asset())?;
        if borrow_info.limit == Decimal::ZERO {
            return Err(BadOrder::Rejected("borrow limit zero".into()).into());
        }

        let borrowed =
            calculate_borrowed(&filters, MARGIN_MULTIPLIER, borrow_info.limit, collateral, price)?;
        let quote = round_down(price * borrowed, filters.quote_precision);
        let fee = round_half_up(quote * fees.taker, filters.quote_precision);

        debug!(%symbol, time = %time::format_timestamp(time), "opened simulated short position");
        Ok(OpenPosition::Short(OpenShort {
            exchange: exchange.to_owned(),
            symbol: symbol.clone(),
            collateral,
            borrowed,
            time,
            fills: vec![Fill {
                price,
                size: borrowed,
                quote,
                fee,
                fee_asset: quote_asset.to_owned(),
            }],
        }))
    }

    fn close_simulated_short(
        &self,
        position: OpenShort,
        time: Timestamp,
        price: Decimal,
        reason: CloseReason,
    ) -> Result<ClosedPosition> {
        let (fees, filters) =
            self.informant.get_fees_filters(&position.exchange, &position.symbol)?;
        let base_asset = position.symbol.base_asset().to_owned();
        let base_info = self.informant.get_asset_info(&position.exchange, &base_asset)?;
        let borrow_info = self.informant.get_borrow_info(
            &position.exchange,
            position.symbol.as_str(),
            &base_asset,
        )?;

        let interest = calculate_interest(
            position.borrowed,
            &borrow_info,
            position.time,
            time,
            base_info.precision,
        );
        // Same one-tick buffer the real close buys, in case interest ticks
        // while the order fills.
        let interest_per_tick = borrow_info.interest_rate * position.borrowed;
        let mut size = position.borrowed + interest + interest_per_tick;
        let fee = round_half_up(size * fees.taker, filters.base_precision);
        size += fee;
        let quote = round_down(price * size, filters.quote_precision);

        debug!(
            symbol = %position.symbol,
            time = %time::format_timestamp(time),
            ?reason,
            "closed simulated short position"
        );
        Ok(ClosedPosition::Short(position.close(
            interest,
            time,
            vec![Fill { price, size, quote, fee, fee_asset: base_asset }],
            reason,
        )))
    }
}

/// Base amount to borrow for a short: collateral converted to base times
/// the margin multiplier minus one, capped by the venue's limit.
pub(crate) fn calculate_borrowed(
    filters: &Filters,
    margin_multiplier: u32,
    limit: Decimal,
    collateral: Decimal,
    price: Decimal,
) -> Result<Decimal> {
    let collateral_size = filters.size.round_down(collateral / price);
    if collateral_size == Decimal::ZERO {
        return Err(BadOrder::Rejected("collateral base size 0".into()).into());
    }
    let borrowed = collateral_size * Decimal::from(margin_multiplier - 1);
    if borrowed == Decimal::ZERO {
        return Err(BadOrder::Rejected("borrowed 0; incorrect margin multiplier?".into()).into());
    }
    Ok(borrowed.min(limit))
}

/// Interest accrued over `[start, end]`, by default charging every started
/// interval (venues differ; see [`InterestCharge`]).
pub(crate) fn calculate_interest(
    borrowed: Decimal,
    borrow_info: &BorrowInfo,
    start: Timestamp,
    end: Timestamp,
    precision: u32,
) -> Decimal {
    let elapsed = end.saturating_sub(start);
    let interval: Interval = borrow_info.interest_interval;
    let ticks = match borrow_info.interest_charge {
        InterestCharge::Ceil => ceil_multiple(elapsed, interval) / interval,
        InterestCharge::Floor => floor_multiple(elapsed, interval) / interval,
    };
    round_half_up(
        borrowed * Decimal::from(ticks) * borrow_info.interest_rate,
        precision,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::{Exchange, Fake};
    use crate::filters::Size;
    use crate::storage::Memory;
    use crate::time::HOUR_MS;
    use rust_decimal_macros::dec;

    fn borrow_info(limit: Decimal) -> BorrowInfo {
        BorrowInfo {
            limit,
            interest_interval: HOUR_MS,
            interest_rate: dec!(0.01),
            interest_charge: InterestCharge::Ceil,
        }
    }

    #[test]
    fn test_calculate_borrowed() {
        let filters = Filters {
            size: Size { min: dec!(0.1), max: dec!(100.0), step: dec!(0.1) },
            ..Default::default()
        };
        // collateral 10 at price 10 -> 1 base; multiplier 2 -> borrow 1.
        let borrowed =
            calculate_borrowed(&filters, 2, dec!(5), dec!(10), dec!(10)).unwrap();
        assert_eq!(borrowed, dec!(1.0));

        // Limit caps the borrow.
        let borrowed =
            calculate_borrowed(&filters, 5, dec!(2), dec!(10), dec!(10)).unwrap();
        assert_eq!(borrowed, dec!(2));

        // Tiny collateral rounds to zero base.
        assert!(calculate_borrowed(&filters, 2, dec!(5), dec!(0.1), dec!(10)).is_err());
    }

    #[test]
    fn test_calculate_interest_ceil_and_floor() {
        let mut info = borrow_info(dec!(5));
        // 90 minutes -> 2 hourly ticks under ceil.
        assert_eq!(
            calculate_interest(dec!(1), &info, 0, 90 * 60_000, 8),
            dec!(0.02),
        );
        info.interest_charge = InterestCharge::Floor;
        assert_eq!(
            calculate_interest(dec!(1), &info, 0, 90 * 60_000, 8),
            dec!(0.01),
        );
    }

    async fn simulated() -> SimulatedPositioner {
        let fake = Arc::new(Fake::new());
        let mut info = crate::exchanges::ExchangeInfo::default();
        info.fees.insert("__all__".into(), crate::types::Fees {
            maker: dec!(0.001),
            taker: dec!(0.001),
        });
        info.filters.insert("__all__".into(), Filters {
            size: Size { min: dec!(0.0001), max: dec!(1000.0), step: dec!(0.0001) },
            ..Default::default()
        });
        let mut borrow = HashMap::new();
        borrow.insert("__all__".to_owned(), {
            let mut by_asset = HashMap::new();
            by_asset.insert("__all__".to_owned(), borrow_info(dec!(5)));
            by_asset
        });
        info.borrow_info = borrow;
        fake.set_exchange_info(info);
        let informant = Informant::connect(
            Arc::new(Memory::new()),
            vec![fake as Arc<dyn Exchange>],
        )
        .await
        .unwrap();
        SimulatedPositioner::new(Arc::new(informant))
    }

    #[tokio::test]
    async fn test_simulated_short_round_trip() {
        let positioner = simulated().await;
        let symbol = Symbol::new("eth-btc");

        // collateral 10, price 10, multiplier 2, limit 5 -> borrow 1.
        let opened = positioner
            .open_simulated_positions("fake", &[(symbol.clone(), dec!(10), true, 0, dec!(10))])
            .unwrap();
        let OpenPosition::Short(ref short) = opened[0] else {
            panic!("expected short");
        };
        assert_eq!(short.borrowed, dec!(1));
        assert_eq!(short.fills[0].quote, dec!(10));
        assert_eq!(short.fills[0].fee, dec!(0.01));

        // Close after 2h: interest = ceil(2h/1h) * 0.01 * 1 = 0.02.
        let closed = positioner
            .close_simulated_positions(vec![(
                opened.into_iter().next().unwrap(),
                CloseReason::Strategy,
                2 * HOUR_MS,
                dec!(10),
            )])
            .unwrap();
        let ClosedPosition::Short(ref short) = closed[0] else {
            panic!("expected short");
        };
        assert_eq!(short.interest, dec!(0.02));
        // size bought = 1 + 0.02 + one-tick buffer 0.01 + fee(0.00103)
        assert_eq!(short.close_fills[0].size, dec!(1.03103));
        // profit = open quote (10) - open fee (0.01) - close quote.
        let expected_profit = dec!(10) - dec!(0.01) - short.close_fills[0].quote;
        assert_eq!(closed[0].profit(), expected_profit);
        assert!(closed[0].profit() < Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_simulated_long_round_trip() {
        let positioner = simulated().await;
        let symbol = Symbol::new("eth-btc");

        let opened = positioner
            .open_simulated_positions("fake", &[(symbol, dec!(10), false, 0, dec!(10))])
            .unwrap();
        assert_eq!(opened[0].cost(), dec!(10));

        let closed = positioner
            .close_simulated_positions(vec![(
                opened.into_iter().next().unwrap(),
                CloseReason::TakeProfit,
                HOUR_MS,
                dec!(20),
            )])
            .unwrap();
        assert!(closed[0].profit() > Decimal::ZERO);
        assert_eq!(closed[0].close_reason(), CloseReason::TakeProfit);
    }
}
