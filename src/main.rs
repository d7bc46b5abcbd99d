//! Crypto trader - main entry point
//!
//! Subcommands:
//! - backtest: replay a strategy over stored candle history
//! - paper: live market data, simulated fills
//! - live: real order flow
//! - import-candles: load candle history from a CSV file into storage

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crypto_trader::brokers::{Broker, LimitBroker, MarketBroker};
use crypto_trader::chandler::Chandler;
use crypto_trader::config::{BrokerConfig, Config, TraderConfig};
use crypto_trader::custodians::{Custodian, Savings, Spot, Stub};
use crypto_trader::exchanges::{Binance, Exchange, Fake};
use crypto_trader::informant::Informant;
use crypto_trader::orderbook::Orderbook;
use crypto_trader::position::TradingSummary;
use crypto_trader::positioner::Positioner;
use crypto_trader::storage::{self, Memory, Sqlite, Storage};
use crypto_trader::time::parse_interval;
use crypto_trader::traders::{BasicState, BasicTrader, MultiState, MultiTrader, StopSignal};
use crypto_trader::types::{Symbol, TradingMode};
use crypto_trader::user::User;

const TRADER_STATE_SHARD: &str = "trader_state";

#[derive(Parser, Debug)]
#[command(name = "crypto-trader")]
#[command(about = "Multi-symbol algorithmic crypto trading engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "configs/trader.json")]
    config: String,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write JSON logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay the configured trader over historical candles
    Backtest,

    /// Trade on live market data with simulated fills
    Paper {
        /// Resume from persisted trader state
        #[arg(long)]
        resume: bool,
    },

    /// Trade with real orders
    Live {
        /// Resume from persisted trader state
        #[arg(long)]
        resume: bool,
    },

    /// Import candle history from a CSV file
    ImportCandles {
        /// CSV path with time(ms),open,high,low,close,volume rows
        path: PathBuf,

        /// Symbol the candles belong to, e.g. eth-btc
        #[arg(long)]
        symbol: String,

        /// Candle interval, e.g. 1h
        #[arg(long)]
        interval: String,
    },
}

fn init_tracing(verbose: bool, log_dir: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    let stdout_layer = tracing_subscriber::fmt::layer();

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "crypto-trader.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer().json().with_writer(writer);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(env_filter).with(stdout_layer).init();
            None
        }
    }
}

struct App {
    storage: Arc<dyn Storage>,
    chandler: Arc<Chandler>,
    basic: BasicTrader,
    multi: MultiTrader,
}

async fn build_app(config: &Config, need_broker: bool) -> Result<App> {
    let storage: Arc<dyn Storage> = match &config.storage.path {
        Some(path) => Arc::new(Sqlite::open(path).context("Failed to open storage")?),
        None => Arc::new(Memory::new()),
    };

    let exchange: Arc<dyn Exchange> = match config.exchange.name.as_str() {
        "binance" => Arc::new(Binance::new(
            config.exchange.api_key.clone().unwrap_or_default(),
            config.exchange.api_secret.clone().unwrap_or_default(),
        )),
        "fake" => Arc::new(Fake::new()),
        other => bail!("unknown exchange {other}"),
    };

    let informant = Arc::new(
        Informant::connect(storage.clone(), vec![exchange.clone()])
            .await
            .context("Failed to sync exchange info")?,
    );
    let chandler = Arc::new(Chandler::new(storage.clone(), vec![exchange.clone()]));
    let user = Arc::new(User::new(vec![exchange.clone()]));
    let orderbook = Arc::new(Orderbook::new(vec![exchange.clone()]));

    let custodians: Vec<(String, Arc<dyn Custodian>)> = vec![
        ("stub".to_owned(), Arc::new(Stub) as Arc<dyn Custodian>),
        ("spot".to_owned(), Arc::new(Spot::new(user.clone()))),
        ("savings".to_owned(), Arc::new(Savings::new(user.clone()))),
    ];

    let positioner = if need_broker {
        let broker: Arc<dyn Broker> = match config.broker {
            BrokerConfig::Market => Arc::new(MarketBroker::new(
                informant.clone(),
                orderbook.clone(),
                user.clone(),
            )),
            BrokerConfig::LimitLeading => Arc::new(LimitBroker::leading(
                informant.clone(),
                orderbook.clone(),
                user.clone(),
            )),
            BrokerConfig::LimitLeadingEdit => Arc::new(LimitBroker::leading_edit(
                informant.clone(),
                orderbook.clone(),
                user.clone(),
            )),
            BrokerConfig::LimitMatching => Arc::new(LimitBroker::matching(
                informant.clone(),
                orderbook.clone(),
                user.clone(),
            )),
        };
        Some(Arc::new(Positioner::new(
            informant.clone(),
            chandler.clone(),
            broker,
            user.clone(),
            custodians.clone(),
        )))
    } else {
        None
    };

    let basic = BasicTrader::new(
        chandler.clone(),
        informant.clone(),
        positioner.clone(),
        custodians.clone(),
    );
    let multi = MultiTrader::new(
        chandler.clone(),
        informant.clone(),
        positioner,
        custodians,
    );

    Ok(App { storage, chandler, basic, multi })
}

async fn run_trader(config: Config, mode: TradingMode, resume: bool) -> Result<()> {
    let app = build_app(&config, mode != TradingMode::Backtest).await?;

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; stopping trader");
                stop.stop();
            }
        });
    }

    let summary = match config.trader {
        TraderConfig::Basic(mut trader_config) => {
            trader_config.mode = mode;
            let state_key = format!("basic:{}", trader_config.symbol);
            let mut state: BasicState = match restore(&*app.storage, &state_key, resume).await? {
                Some(state) => state,
                None => app.basic.initialize(trader_config).await?,
            };
            let result = app.basic.run(&mut state, stop).await;
            persist(&*app.storage, &state_key, &state, mode).await;
            result?
        }
        TraderConfig::Multi(mut trader_config) => {
            trader_config.mode = mode;
            let state_key = format!("multi:{}", trader_config.quote_asset);
            let mut state: MultiState = match restore(&*app.storage, &state_key, resume).await? {
                Some(state) => state,
                None => app.multi.initialize(trader_config).await?,
            };
            let result = app.multi.run(&mut state, stop).await;
            persist(&*app.storage, &state_key, &state, mode).await;
            result?
        }
    };

    report_summary(&summary);
    Ok(())
}

async fn restore<T: serde::de::DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
    resume: bool,
) -> Result<Option<T>> {
    if !resume {
        return Ok(None);
    }
    let state = storage::get_typed(storage, TRADER_STATE_SHARD, key)
        .await
        .context("Failed to load trader state")?;
    if state.is_some() {
        info!(key, "resuming from persisted trader state");
    } else {
        warn!(key, "no persisted trader state found; starting fresh");
    }
    Ok(state)
}

async fn persist<T: serde::Serialize>(
    storage: &dyn Storage,
    key: &str,
    state: &T,
    mode: TradingMode,
) {
    if mode == TradingMode::Backtest {
        return;
    }
    if let Err(err) = storage::set_typed(storage, TRADER_STATE_SHARD, key, state).await {
        warn!(%err, key, "failed to persist trader state");
    }
}

fn report_summary(summary: &TradingSummary) {
    info!(
        "{} position(s) taken ({} long, {} short), profit {}, max drawdown {:.2}%",
        summary.num_positions(),
        summary.num_long(),
        summary.num_short(),
        summary.profit(),
        summary.max_drawdown() * rust_decimal::Decimal::ONE_HUNDRED,
    );
    for position in &summary.positions {
        info!(
            "{} {:?} profit {} (roi {:.4})",
            position.symbol(),
            position.close_reason(),
            position.profit(),
            position.roi(),
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.verbose, cli.log_dir.as_ref());

    let config = Config::from_file(&cli.config)?;

    match cli.command {
        Commands::Backtest => run_trader(config, TradingMode::Backtest, false).await,
        Commands::Paper { resume } => run_trader(config, TradingMode::Paper, resume).await,
        Commands::Live { resume } => run_trader(config, TradingMode::Live, resume).await,
        Commands::ImportCandles { path, symbol, interval } => {
            let app = build_app(&config, false).await?;
            let interval = parse_interval(&interval)?;
            let count = app
                .chandler
                .import_csv(&config.exchange.name, &Symbol::new(&symbol), interval, &path)
                .await?;
            info!("imported {count} candle(s) for {symbol}");
            Ok(())
        }
    }
}
