//! Multi-symbol trader
//!
//! Tracks the top-volume symbols on an exchange, runs one strategy
//! instance per symbol, and distributes a shared quote budget over up to
//! `position_count` concurrent positions. One candle consumer task per
//! symbol releases a keyed slot barrier each interval; the supervisor
//! waits for the full round, closes due positions, opens new ones, and
//! optionally re-picks the tracked set and rebalances the free quotes.
//!
//! The per-run state mutex doubles as the serialization queue: on-command
//! opens and closes take the same lock as the main loop's position
//! actions, so they interleave but never overlap.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chandler::Chandler;
use crate::custodians::Custodian;
use crate::errors::{ExchangeError, Result};
use crate::informant::Informant;
use crate::math::{rpstdev, split};
use crate::position::{
    CloseReason, ClosedPosition, MissedCandlePolicy, OpenPosition, TradingSummary,
};
use crate::positioner::{Positioner, SimulatedPositioner};
use crate::stop_loss::{StopLoss, StopLossConfig};
use crate::strategies::{Advice, Changed, Strategy, StrategyConfig};
use crate::sync::{Event, SlotBarrier};
use crate::take_profit::{TakeProfit, TakeProfitConfig};
use crate::time::{self, floor_timestamp, Interval, Timestamp};
use crate::types::{Asset, Candle, Symbol, TradingMode};

use super::{request_candle_start, warmed_up_start, AdjustedStart, StopSignal};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiConfig {
    pub exchange: String,
    #[serde(with = "crate::time::serde_interval")]
    pub interval: Interval,
    #[serde(default)]
    pub start: Option<Timestamp>,
    pub end: Timestamp,
    #[serde(default)]
    pub quote: Option<Decimal>,
    pub strategy: StrategyConfig,
    /// Per-symbol overrides of the default strategy.
    #[serde(default)]
    pub symbol_strategies: HashMap<Symbol, StrategyConfig>,
    #[serde(default)]
    pub stop_loss: Option<StopLossConfig>,
    #[serde(default)]
    pub take_profit: Option<TakeProfitConfig>,
    #[serde(default = "default_true")]
    pub trail_stop_loss: bool,
    #[serde(default)]
    pub adjusted_start: Option<AdjustedStart>,
    #[serde(default)]
    pub missed_candle_policy: MissedCandlePolicy,
    #[serde(default)]
    pub mode: TradingMode,
    #[serde(default = "default_true")]
    pub long: bool,
    #[serde(default)]
    pub short: bool,
    #[serde(default = "default_true")]
    pub close_on_exit: bool,
    /// Symbols always tracked, ahead of the volume ranking.
    #[serde(default)]
    pub track: Vec<Symbol>,
    /// Symbol patterns never tracked.
    #[serde(default)]
    pub track_exclude: Vec<String>,
    #[serde(default = "default_track_count")]
    pub track_count: usize,
    /// Only track symbols with candle history back to this time.
    #[serde(default)]
    pub track_required_start: Option<Timestamp>,
    #[serde(default = "default_position_count")]
    pub position_count: usize,
    /// How stale (in ticks) a prevailing advice may be and still open.
    #[serde(default)]
    pub allowed_age_drift: u32,
    #[serde(default = "default_quote_asset")]
    pub quote_asset: Asset,
    #[serde(default = "default_true")]
    pub repick_symbols: bool,
    #[serde(default = "default_custodian")]
    pub custodian: String,
    #[serde(default)]
    pub exchange_candle_timeout: Option<Interval>,
}

fn default_true() -> bool {
    true
}

fn default_track_count() -> usize {
    4
}

fn default_position_count() -> usize {
    2
}

fn default_quote_asset() -> Asset {
    "btc".into()
}

fn default_custodian() -> String {
    "stub".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolState {
    pub symbol: Symbol,
    pub strategy: Strategy,
    pub changed: Changed,
    pub stop_loss: StopLoss,
    pub take_profit: TakeProfit,
    pub adjusted_start: Timestamp,
    pub start: Timestamp,
    pub next_: Timestamp,
    pub open_position: Option<OpenPosition>,
    pub allocated_quote: Decimal,
    pub first_candle: Option<Candle>,
    pub last_candle: Option<Candle>,
    pub advice: Advice,
    pub reason: CloseReason,
}

impl SymbolState {
    /// A symbol participates in position management once it has seen a
    /// real candle.
    fn ready(&self) -> bool {
        self.first_candle.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiState {
    pub config: MultiConfig,
    pub close_on_exit: bool,
    /// Kept in ranking order; iteration order decides which symbols get
    /// free position slots first.
    pub symbol_states: Vec<SymbolState>,
    pub starting_quote: Decimal,
    /// Quote chunks not allocated to any open position.
    pub quotes: Vec<Decimal>,
    pub candle_start: Timestamp,
    pub start: Timestamp,
    pub next_: Timestamp,
    pub real_start: Timestamp,
    pub open_new_positions: bool,
    pub positions: Vec<ClosedPosition>,
    pub id: String,
    #[serde(skip)]
    pub running: bool,
}

impl MultiState {
    pub fn open_positions(&self) -> Vec<&OpenPosition> {
        self.symbol_states.iter().filter_map(|ss| ss.open_position.as_ref()).collect()
    }

    fn symbol_state_mut(&mut self, symbol: &Symbol) -> Option<&mut SymbolState> {
        self.symbol_states.iter_mut().find(|ss| &ss.symbol == symbol)
    }
}

type SharedState = Arc<Mutex<MultiState>>;

pub struct MultiTrader {
    chandler: Arc<Chandler>,
    informant: Arc<Informant>,
    positioner: Option<Arc<Positioner>>,
    simulated: Arc<SimulatedPositioner>,
    custodians: HashMap<String, Arc<dyn Custodian>>,
    /// Live run states by state id, for on-command position control.
    sessions: SyncMutex<HashMap<String, SharedState>>,
}

impl MultiTrader {
    pub fn new(
        chandler: Arc<Chandler>,
        informant: Arc<Informant>,
        positioner: Option<Arc<Positioner>>,
        custodians: Vec<(String, Arc<dyn Custodian>)>,
    ) -> MultiTrader {
        let simulated = Arc::new(SimulatedPositioner::new(informant.clone()));
        MultiTrader {
            chandler,
            informant,
            positioner,
            simulated,
            custodians: custodians.into_iter().collect(),
            sessions: SyncMutex::new(HashMap::new()),
        }
    }

    fn custodian(&self, name: &str) -> Result<&Arc<dyn Custodian>> {
        self.custodians
            .get(name)
            .ok_or_else(|| ExchangeError::unexpected(format!("unknown custodian {name}")))
    }

    pub async fn initialize(&self, config: MultiConfig) -> Result<MultiState> {
        assert!(config.mode == TradingMode::Backtest || self.positioner.is_some());
        assert!(config.end > 0);
        assert!(config.start.map_or(true, |start| config.end > start));
        assert!(config.position_count > 0);
        assert!(config.position_count <= config.track_count);
        assert!(config.track.len() <= config.track_count);
        assert!(
            !config.track.iter().any(|s| {
                config.track_exclude.iter().any(|p| crate::informant::pattern_matches(p, s.as_str()))
            }),
            "tracked symbols must not be excluded"
        );

        let symbols = self.find_top_symbols(&config).await?;
        let start = request_candle_start(
            &self.chandler,
            config.start,
            &config.exchange,
            &symbols,
            config.interval,
        )
        .await?;
        let real_start = time::now();

        let quote = self
            .custodian(&config.custodian)?
            .request_quote(&config.exchange, &config.quote_asset, config.quote)
            .await?;
        let position_quote = quote / Decimal::from(config.position_count as u64);
        for symbol in &symbols {
            let (_, filters) = self.informant.get_fees_filters(&config.exchange, symbol)?;
            assert!(position_quote > filters.price.min);
        }

        let quote_precision = self
            .informant
            .get_asset_info(&config.exchange, &config.quote_asset)?
            .precision;
        let symbol_states =
            symbols.iter().map(|s| create_symbol_state(s, start, &config)).collect();

        Ok(MultiState {
            close_on_exit: config.close_on_exit,
            symbol_states,
            starting_quote: quote,
            quotes: split(quote, config.position_count, quote_precision),
            candle_start: start,
            start: if config.mode == TradingMode::Backtest { start } else { real_start },
            next_: start,
            real_start,
            open_new_positions: true,
            positions: Vec::new(),
            id: Uuid::new_v4().to_string(),
            running: false,
            config,
        })
    }

    async fn find_top_symbols(&self, config: &MultiConfig) -> Result<Vec<Symbol>> {
        let symbol_pattern = format!("*-{}", config.quote_asset);
        let mut tickers = self
            .informant
            .map_tickers(
                &config.exchange,
                std::slice::from_ref(&symbol_pattern),
                &config.track_exclude,
                true,
                config.short,
            )
            .await?;

        if let Some(required_start) = config.track_required_start {
            let mut filtered = Vec::with_capacity(tickers.len());
            for (symbol, ticker) in tickers {
                let first = self
                    .chandler
                    .get_first_candle(&config.exchange, &symbol, config.interval)
                    .await?;
                if first.time <= required_start {
                    filtered.push((symbol, ticker));
                }
            }
            tickers = filtered;
        }

        if tickers.len() < config.track_count {
            return Err(ExchangeError::unexpected(format!(
                "exchange only supports {} symbols matching {symbol_pattern} while {} requested",
                tickers.len(),
                config.track_count
            )));
        }

        let mut result = config.track.clone();
        result.extend(
            tickers
                .into_iter()
                .map(|(symbol, _)| symbol)
                .filter(|s| !config.track.contains(s))
                .take(config.track_count - config.track.len()),
        );
        Ok(result)
    }

    pub async fn run(&self, state: &mut MultiState, stop: StopSignal) -> Result<TradingSummary> {
        info!(
            "managing up to {} positions by tracking top {} symbols by volume: {:?}",
            state.config.position_count,
            state.config.track_count,
            state.symbol_states.iter().map(|ss| ss.symbol.as_str()).collect::<Vec<_>>()
        );
        info!("quote split as: {:?}", state.quotes);

        state.running = true;
        let shared: SharedState = Arc::new(Mutex::new(state.clone()));
        self.sessions.lock().insert(state.id.clone(), shared.clone());

        let run_result = self.manage_positions(&shared, &stop).await;

        // Drain the serialization lock, close positions if requested, and
        // copy the final state back out for the caller (and for resume).
        {
            let mut guard = shared.lock().await;
            guard.running = false;
            if guard.close_on_exit {
                let entries: Vec<(Symbol, CloseReason)> = guard
                    .symbol_states
                    .iter()
                    .filter(|ss| ss.open_position.is_some())
                    .map(|ss| (ss.symbol.clone(), CloseReason::Cancelled))
                    .collect();
                if let Err(err) = self.close_entries(&mut guard, entries).await {
                    warn!(%err, "failed to close position(s) on exit");
                    if run_result.is_ok() {
                        self.sessions.lock().remove(&guard.id);
                        *state = guard.clone();
                        return Err(err);
                    }
                }
            }
            *state = guard.clone();
        }
        self.sessions.lock().remove(&state.id);
        state.running = false;
        run_result?;

        info!("finished");
        Ok(self.build_summary(state))
    }

    async fn manage_positions(&self, shared: &SharedState, stop: &StopSignal) -> Result<()> {
        let (config, symbols) = {
            let guard = shared.lock().await;
            (
                guard.config.clone(),
                guard.symbol_states.iter().map(|ss| ss.symbol.clone()).collect::<Vec<_>>(),
            )
        };

        let barrier = Arc::new(SlotBarrier::new(symbols.iter().cloned()));
        let tracker_error: Arc<SyncMutex<Option<ExchangeError>>> =
            Arc::new(SyncMutex::new(None));
        let mut ready_events: HashMap<Symbol, Arc<Event>> = HashMap::new();
        let mut tasks: HashMap<Symbol, tokio::task::JoinHandle<()>> = HashMap::new();
        for symbol in &symbols {
            let ready = Arc::new(Event::new());
            ready_events.insert(symbol.clone(), ready.clone());
            tasks.insert(
                symbol.clone(),
                self.spawn_tracker(shared, &config, symbol, &barrier, ready, &tracker_error),
            );
        }

        let end = floor_timestamp(config.end, config.interval);
        let result = loop {
            tokio::select! {
                () = barrier.wait() => {}
                () = stop.wait() => break Ok(()),
            }
            if let Some(err) = tracker_error.lock().take() {
                break Err(err);
            }

            let mut guard = shared.lock().await;
            if let Err(err) = self.try_close_existing_positions(&mut guard).await {
                break Err(err);
            }
            if let Err(err) = self.try_open_new_positions(&mut guard).await {
                break Err(err);
            }

            // Re-pick top symbols; not during the warm-up period.
            if config.repick_symbols && guard.next_ > guard.candle_start {
                match self.find_top_symbols(&config).await {
                    Ok(top_symbols) => {
                        self.swap_symbols(
                            &mut guard,
                            &config,
                            top_symbols,
                            shared,
                            &barrier,
                            &mut ready_events,
                            &mut tasks,
                            &tracker_error,
                        );
                    }
                    Err(err) if err.is_transient() => {
                        warn!(%err, "failed to re-pick top symbols; keeping current set");
                    }
                    Err(err) => break Err(err),
                }
            }

            // Rebalance free quote chunks when they drift apart.
            if guard.quotes.len() > 1 && rpstdev(&guard.quotes) > Decimal::new(5, 2) {
                let old_quotes = guard.quotes.clone();
                let quote_precision = self
                    .informant
                    .get_asset_info(&config.exchange, &config.quote_asset)
                    .map(|info| info.precision)
                    .unwrap_or(8);
                guard.quotes = split(
                    old_quotes.iter().copied().sum(),
                    old_quotes.len(),
                    quote_precision,
                );
                info!("rebalanced available quotes {old_quotes:?} as {:?}", guard.quotes);
            }

            let next_ = guard.next_;
            drop(guard);

            // Arm the next round before releasing the trackers.
            barrier.clear();
            for event in ready_events.values() {
                event.set();
            }

            if next_ >= end {
                let guard = shared.lock().await;
                for ss in &guard.symbol_states {
                    debug!(symbol = %ss.symbol, "last candle: {:?}", ss.last_candle);
                }
                break Ok(());
            }
        };

        for task in tasks.values() {
            task.abort();
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn swap_symbols(
        &self,
        guard: &mut MultiState,
        config: &MultiConfig,
        top_symbols: Vec<Symbol>,
        shared: &SharedState,
        barrier: &Arc<SlotBarrier<Symbol>>,
        ready_events: &mut HashMap<Symbol, Arc<Event>>,
        tasks: &mut HashMap<Symbol, tokio::task::JoinHandle<()>>,
        tracker_error: &Arc<SyncMutex<Option<ExchangeError>>>,
    ) {
        let leaving: Vec<Symbol> = guard
            .symbol_states
            .iter()
            .filter(|ss| ss.open_position.is_none() && !top_symbols.contains(&ss.symbol))
            .map(|ss| ss.symbol.clone())
            .collect();
        let joining: Vec<Symbol> = top_symbols
            .into_iter()
            .filter(|s| !guard.symbol_states.iter().any(|ss| &ss.symbol == s))
            .take(leaving.len())
            .collect();
        if joining.is_empty() {
            return;
        }
        // The caller holds the state lock, so no position action can be
        // in flight for the leaving symbols while they are dismantled.
        info!("swapping out {leaving:?} in favor of {joining:?}");

        for symbol in leaving.iter().take(joining.len()) {
            if let Some(task) = tasks.remove(symbol) {
                task.abort();
            }
            ready_events.remove(symbol);
            barrier.delete(symbol);
            guard.symbol_states.retain(|ss| &ss.symbol != symbol);
        }

        for symbol in joining {
            let symbol_state = create_symbol_state(&symbol, guard.next_, config);
            guard.symbol_states.push(symbol_state);
            barrier.add(symbol.clone());
            let ready = Arc::new(Event::new());
            ready_events.insert(symbol.clone(), ready.clone());
            tasks.insert(
                symbol.clone(),
                self.spawn_tracker(shared, config, &symbol, barrier, ready, tracker_error),
            );
        }
    }

    fn spawn_tracker(
        &self,
        shared: &SharedState,
        config: &MultiConfig,
        symbol: &Symbol,
        barrier: &Arc<SlotBarrier<Symbol>>,
        ready: Arc<Event>,
        tracker_error: &Arc<SyncMutex<Option<ExchangeError>>>,
    ) -> tokio::task::JoinHandle<()> {
        let chandler = self.chandler.clone();
        let shared = shared.clone();
        let config = config.clone();
        let symbol = symbol.clone();
        let barrier = barrier.clone();
        let tracker_error = tracker_error.clone();
        tokio::spawn(async move {
            let result =
                track_advice(chandler, shared, config, symbol.clone(), &barrier, ready).await;
            if let Err(err) = result {
                warn!(%symbol, %err, "advice tracker failed");
                *tracker_error.lock() = Some(err);
                // Wake the supervisor so the failure propagates.
                barrier.delete(&symbol);
            }
        })
    }

    async fn try_close_existing_positions(&self, guard: &mut MultiState) -> Result<()> {
        let entries: Vec<(Symbol, CloseReason)> = guard
            .symbol_states
            .iter()
            .filter(|ss| ss.ready())
            .filter_map(|ss| match &ss.open_position {
                Some(OpenPosition::Long(_))
                    if matches!(ss.advice, Advice::Liquidate | Advice::Short) =>
                {
                    Some((ss.symbol.clone(), ss.reason))
                }
                Some(OpenPosition::Short(_))
                    if matches!(ss.advice, Advice::Liquidate | Advice::Long) =>
                {
                    Some((ss.symbol.clone(), ss.reason))
                }
                _ => None,
            })
            .collect();
        self.close_entries(guard, entries).await.map(|_| ())
    }

    async fn try_open_new_positions(&self, guard: &mut MultiState) -> Result<()> {
        let config = guard.config.clone();
        let open_count =
            guard.symbol_states.iter().filter(|ss| ss.open_position.is_some()).count();
        assert!(open_count <= config.position_count);
        let mut available = config.position_count - open_count;

        let mut entries: Vec<(Symbol, bool)> = Vec::new();
        if guard.open_new_positions {
            for ss in guard.symbol_states.iter().filter(|ss| ss.ready()) {
                if available == 0 {
                    break;
                }
                if ss.open_position.is_some() {
                    continue;
                }
                let age_valid =
                    ss.changed.prevailing_advice_age().saturating_sub(1) <= config.allowed_age_drift;
                if config.long && ss.advice == Advice::Long && age_valid {
                    entries.push((ss.symbol.clone(), false));
                    available -= 1;
                } else if config.short && ss.advice == Advice::Short && age_valid {
                    entries.push((ss.symbol.clone(), true));
                    available -= 1;
                }
            }
        }
        self.open_entries(guard, entries).await.map(|_| ())
    }

    /// Opens positions for `(symbol, short)` entries, allocating a free
    /// quote chunk to each. A venue-rejected order skips that entry.
    async fn open_entries(
        &self,
        guard: &mut MultiState,
        entries: Vec<(Symbol, bool)>,
    ) -> Result<Vec<OpenPosition>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let config = guard.config.clone();
        info!("opening {} position(s)", entries.len());

        let mut opened = Vec::with_capacity(entries.len());
        for (symbol, short) in entries {
            if guard.quotes.is_empty() {
                warn!(%symbol, "no free quote chunk; skipping open");
                continue;
            }
            let allocated_quote = guard.quotes.remove(0);

            let result = if config.mode == TradingMode::Backtest {
                let ss = guard
                    .symbol_state_mut(&symbol)
                    .ok_or_else(|| ExchangeError::unexpected(format!("unknown symbol {symbol}")))?;
                let last_candle = ss.last_candle.expect("opening before any candle");
                self.simulated.open_simulated_positions(
                    &config.exchange,
                    &[(
                        symbol.clone(),
                        allocated_quote,
                        short,
                        last_candle.time + config.interval,
                        last_candle.close,
                    )],
                )
            } else {
                self.positioner
                    .as_ref()
                    .expect("positioner required outside backtest")
                    .open_positions(
                        &config.exchange,
                        &config.custodian,
                        config.mode,
                        &[(symbol.clone(), allocated_quote, short)],
                    )
                    .await
            };

            match result {
                Ok(mut positions) => {
                    let position = positions.remove(0);
                    let ss = guard
                        .symbol_state_mut(&symbol)
                        .ok_or_else(|| {
                            ExchangeError::unexpected(format!("unknown symbol {symbol}"))
                        })?;
                    ss.allocated_quote = allocated_quote - position.cost();
                    ss.open_position = Some(position.clone());
                    opened.push(position);
                }
                Err(ExchangeError::BadOrder(err)) => {
                    // Skip this action this tick; the chunk goes back.
                    warn!(%symbol, %err, "unable to open position");
                    guard.quotes.push(allocated_quote);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(opened)
    }

    /// Closes positions for `(symbol, reason)` entries and returns the
    /// freed quote chunks to the pool.
    async fn close_entries(
        &self,
        guard: &mut MultiState,
        entries: Vec<(Symbol, CloseReason)>,
    ) -> Result<Vec<ClosedPosition>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let config = guard.config.clone();
        info!("closing {} open position(s)", entries.len());

        let mut closed_all = Vec::with_capacity(entries.len());
        for (symbol, reason) in entries {
            let ss = guard
                .symbol_state_mut(&symbol)
                .ok_or_else(|| ExchangeError::unexpected(format!("unknown symbol {symbol}")))?;
            let position = ss.open_position.take().expect("no open position to close");
            let last_candle = ss.last_candle.expect("closing before any candle");

            let result = if config.mode == TradingMode::Backtest {
                self.simulated.close_simulated_positions(vec![(
                    position,
                    reason,
                    last_candle.time + config.interval,
                    last_candle.close,
                )])
            } else {
                self.positioner
                    .as_ref()
                    .expect("positioner required outside backtest")
                    .close_positions(&config.custodian, config.mode, vec![(position, reason)])
                    .await
            };
            let closed = result?.remove(0);

            let ss = guard
                .symbol_state_mut(&symbol)
                .ok_or_else(|| ExchangeError::unexpected(format!("unknown symbol {symbol}")))?;
            let chunk = ss.allocated_quote + closed.gain();
            ss.allocated_quote = Decimal::ZERO;
            guard.quotes.push(chunk);
            guard.positions.push(closed.clone());
            closed_all.push(closed);
        }
        Ok(closed_all)
    }

    /// On-command open, serialized with the main loop through the state
    /// lock. Validations mirror the loop's own invariants.
    pub async fn open_positions(
        &self,
        state_id: &str,
        symbols: &[Symbol],
        short: bool,
    ) -> Result<Vec<OpenPosition>> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let shared = self.session(state_id)?;
        let mut guard = shared.lock().await;
        if !guard.running {
            return Err(ExchangeError::unexpected("trader not running"));
        }
        let open_count =
            guard.symbol_states.iter().filter(|ss| ss.open_position.is_some()).count();
        if guard.config.position_count - open_count < symbols.len() {
            return Err(ExchangeError::unexpected("position limit reached"));
        }
        for symbol in symbols {
            let Some(ss) = guard.symbol_states.iter().find(|ss| &ss.symbol == symbol) else {
                return Err(ExchangeError::unexpected(format!("symbol {symbol} not tracked")));
            };
            if ss.open_position.is_some() {
                return Err(ExchangeError::unexpected(format!("{symbol} already open")));
            }
            if ss.last_candle.is_none() {
                return Err(ExchangeError::unexpected(format!("no candle for {symbol} yet")));
            }
        }
        let entries = symbols.iter().map(|s| (s.clone(), short)).collect();
        self.open_entries(&mut guard, entries).await
    }

    /// On-command close, serialized with the main loop through the state
    /// lock.
    pub async fn close_positions(
        &self,
        state_id: &str,
        symbols: &[Symbol],
        reason: CloseReason,
    ) -> Result<Vec<ClosedPosition>> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let shared = self.session(state_id)?;
        let mut guard = shared.lock().await;
        if !guard.running {
            return Err(ExchangeError::unexpected("trader not running"));
        }
        for symbol in symbols {
            let Some(ss) = guard.symbol_states.iter().find(|ss| &ss.symbol == symbol) else {
                return Err(ExchangeError::unexpected(format!("symbol {symbol} not tracked")));
            };
            if ss.open_position.is_none() {
                return Err(ExchangeError::unexpected(format!("{symbol} not open")));
            }
        }
        let entries = symbols.iter().map(|s| (s.clone(), reason)).collect();
        self.close_entries(&mut guard, entries).await
    }

    fn session(&self, state_id: &str) -> Result<SharedState> {
        self.sessions
            .lock()
            .get(state_id)
            .cloned()
            .ok_or_else(|| ExchangeError::unexpected(format!("no running trader {state_id}")))
    }

    pub fn build_summary(&self, state: &MultiState) -> TradingSummary {
        let config = &state.config;
        let end = if config.end <= state.real_start {
            // Backtest.
            state
                .symbol_states
                .iter()
                .filter_map(|ss| ss.last_candle)
                .map(|c| c.time + config.interval)
                .max()
                .unwrap_or(state.start + config.interval)
        } else {
            time::now().min(config.end)
        };
        TradingSummary {
            start: state.start,
            end,
            starting_assets: HashMap::from([(
                config.quote_asset.clone(),
                state.starting_quote,
            )]),
            positions: state.positions.clone(),
        }
    }
}

fn create_symbol_state(symbol: &Symbol, start: Timestamp, config: &MultiConfig) -> SymbolState {
    let strategy = config
        .symbol_strategies
        .get(symbol)
        .unwrap_or(&config.strategy)
        .construct();
    let adjusted_start =
        warmed_up_start(start, strategy.maturity(), config.interval, config.adjusted_start);
    if adjusted_start < start {
        info!(
            %symbol,
            "fetching candle(s) from {} to warm up strategy",
            time::format_timestamp(adjusted_start)
        );
    }
    SymbolState {
        symbol: symbol.clone(),
        strategy,
        changed: Changed::new(true),
        stop_loss: config.stop_loss.as_ref().map(|c| c.construct()).unwrap_or_default(),
        take_profit: config.take_profit.as_ref().map(|c| c.construct()).unwrap_or_default(),
        adjusted_start,
        start,
        next_: adjusted_start,
        open_position: None,
        allocated_quote: Decimal::ZERO,
        first_candle: None,
        last_candle: None,
        advice: Advice::None,
        reason: CloseReason::Strategy,
    }
}

/// Per-symbol candle consumer: feeds the strategy, derives the advice for
/// the round, releases the barrier slot, and waits for the supervisor
/// before moving to the next interval.
async fn track_advice(
    chandler: Arc<Chandler>,
    shared: SharedState,
    config: MultiConfig,
    symbol: Symbol,
    barrier: &SlotBarrier<Symbol>,
    ready: Arc<Event>,
) -> Result<()> {
    let (next_, end) = {
        let guard = shared.lock().await;
        let ss = guard
            .symbol_states
            .iter()
            .find(|ss| ss.symbol == symbol)
            .ok_or_else(|| ExchangeError::unexpected(format!("unknown symbol {symbol}")))?;
        (ss.next_, config.end)
    };
    info!(%symbol, "tracking candles");

    let mut stream = chandler
        .stream_candles_fill_missing_with_none(
            &config.exchange,
            &symbol,
            config.interval,
            next_,
            end,
            config.exchange_candle_timeout,
        )
        .await?;

    while let Some(item) = stream.next().await {
        let slot_candle = item?;
        let in_warmup = {
            let mut guard = shared.lock().await;
            let Some(ss) = guard.symbol_state_mut(&symbol) else {
                // Swapped out by a re-pick.
                return Ok(());
            };
            let slot_time = slot_candle.map(|c| c.time).unwrap_or(ss.next_);
            let in_warmup = slot_time < ss.start;

            match slot_candle {
                Some(candle) => process_candle(ss, &config, candle),
                None => process_missed_slot(ss, &config),
            }
            let next_ = ss.next_;
            guard.next_ = guard.next_.max(next_);
            in_warmup
        };

        // Warm-up slots feed the strategy only; they do not take part in
        // the supervisor's rounds.
        if !in_warmup {
            barrier.release(&symbol);
            ready.wait().await;
        }
    }
    Ok(())
}

fn process_candle(ss: &mut SymbolState, config: &MultiConfig, candle: Candle) {
    ss.stop_loss.update(&candle);
    ss.take_profit.update(&candle);
    let raw_advice = ss.strategy.update(&candle);

    let in_warmup = candle.time < ss.start;
    let (advice, reason) = derive_advice(ss, config, raw_advice);
    if in_warmup {
        if advice != Advice::None {
            warn!(
                symbol = %ss.symbol,
                ?advice,
                "received advice during strategy warm-up period: adjusted start {}; actual \
                 start {}",
                time::format_timestamp(ss.adjusted_start),
                time::format_timestamp(ss.start),
            );
        }
        ss.advice = Advice::None;
        ss.reason = CloseReason::Strategy;
    } else {
        ss.advice = advice;
        ss.reason = reason;
    }

    if ss.open_position.is_none()
        && ((config.long && ss.advice == Advice::Long)
            || (config.short && ss.advice == Advice::Short))
    {
        ss.stop_loss.clear(&candle);
        ss.take_profit.clear(&candle);
    }

    if ss.first_candle.is_none() && !in_warmup {
        info!(symbol = %ss.symbol, "first candle at {}", time::format_timestamp(candle.time));
        ss.first_candle = Some(candle);
    }
    ss.last_candle = Some(candle);
    ss.next_ = candle.time + config.interval;
}

/// Advances a slot that produced no candle.
fn process_missed_slot(ss: &mut SymbolState, config: &MultiConfig) {
    match (config.missed_candle_policy, ss.last_candle) {
        (MissedCandlePolicy::Last, Some(last)) => {
            // Replay the previous candle shifted into this slot.
            let mut synthetic = last;
            synthetic.time = ss.next_;
            process_candle(ss, config, synthetic);
            return;
        }
        (MissedCandlePolicy::Restart, Some(_)) => {
            info!(symbol = %ss.symbol, "restarting strategy due to missed candle");
            ss.strategy = config
                .symbol_strategies
                .get(&ss.symbol)
                .unwrap_or(&config.strategy)
                .construct();
        }
        _ => {}
    }
    ss.advice = Advice::None;
    ss.reason = CloseReason::Strategy;
    ss.next_ += config.interval;
}

/// Applies the changed filter and the stop loss / take profit overrides.
/// Overrides bypass the filter so strategy state is not disturbed.
fn derive_advice(
    ss: &mut SymbolState,
    config: &MultiConfig,
    raw_advice: Advice,
) -> (Advice, CloseReason) {
    // The prevailing advice is surfaced rather than the transition: the
    // allowed age drift may act on an advice given in the past, and the
    // age gate in the open path prevents acting twice.
    ss.changed.update(raw_advice);
    let mut advice = ss.changed.prevailing_advice();
    let mut reason = CloseReason::Strategy;

    match &ss.open_position {
        Some(OpenPosition::Long(_)) if !matches!(advice, Advice::Short | Advice::Liquidate) => {
            if ss.stop_loss.upside_hit() {
                info!(
                    symbol = %ss.symbol,
                    "upside stop loss hit (trailing: {}); liquidating",
                    config.trail_stop_loss
                );
                advice = Advice::Liquidate;
                reason = CloseReason::StopLoss;
            } else if ss.take_profit.upside_hit() {
                info!(symbol = %ss.symbol, "upside take profit hit; liquidating");
                advice = Advice::Liquidate;
                reason = CloseReason::TakeProfit;
            }
        }
        Some(OpenPosition::Short(_)) if !matches!(advice, Advice::Long | Advice::Liquidate) => {
            if ss.stop_loss.downside_hit() {
                info!(
                    symbol = %ss.symbol,
                    "downside stop loss hit (trailing: {}); liquidating",
                    config.trail_stop_loss
                );
                advice = Advice::Liquidate;
                reason = CloseReason::StopLoss;
            } else if ss.take_profit.downside_hit() {
                info!(symbol = %ss.symbol, "downside take profit hit; liquidating");
                advice = Advice::Liquidate;
                reason = CloseReason::TakeProfit;
            }
        }
        _ => {}
    }
    (advice, reason)
}
