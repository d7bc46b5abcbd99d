//! Account component
//!
//! Owns everything that touches venue accounts: order placement and
//! cancellation, order update streams, balances (point reads and shared
//! wallet sync contexts), and margin bookkeeping (transfers, borrow,
//! repay). Isolated margin accounts are created lazily on first use.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::errors::{ExchangeError, Result};
use crate::exchanges::{
    Capabilities, EditOrder, Exchange, ExchangeStream, MarginPosition, NewOrder, Transfer,
};
use crate::order::{OrderResult, OrderUpdate};
use crate::sync::RetryBudget;
use crate::types::{Account, Asset, Balance, Symbol};

type WalletKey = (String, Account);

struct SharedWallet {
    balances: Mutex<HashMap<Asset, Balance>>,
    state: watch::Sender<u64>,
}

impl SharedWallet {
    fn new() -> SharedWallet {
        let (state, _) = watch::channel(0);
        SharedWallet { balances: Mutex::new(HashMap::new()), state }
    }

    fn update(&self, balances: HashMap<Asset, Balance>) {
        self.balances.lock().extend(balances);
        self.state.send_modify(|version| *version += 1);
    }
}

struct WalletEntry {
    wallet: Arc<SharedWallet>,
    refcount: usize,
    task: tokio::task::JoinHandle<()>,
}

pub struct User {
    exchanges: HashMap<String, Arc<dyn Exchange>>,
    open_accounts: Mutex<HashSet<WalletKey>>,
    wallets: Arc<Mutex<HashMap<WalletKey, WalletEntry>>>,
}

impl User {
    pub fn new(exchanges: Vec<Arc<dyn Exchange>>) -> User {
        User {
            exchanges: exchanges.into_iter().map(|e| (e.name().to_owned(), e)).collect(),
            open_accounts: Mutex::new(HashSet::new()),
            wallets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn exchange(&self, exchange: &str) -> Result<&Arc<dyn Exchange>> {
        self.exchanges
            .get(exchange)
            .ok_or_else(|| ExchangeError::unexpected(format!("unknown exchange {exchange}")))
    }

    pub fn capabilities(&self, exchange: &str) -> Result<Capabilities> {
        Ok(self.exchange(exchange)?.capabilities())
    }

    pub fn generate_client_id(&self, exchange: &str) -> Result<String> {
        Ok(self.exchange(exchange)?.generate_client_id())
    }

    /// Creates the isolated margin account on first use.
    async fn ensure_account(&self, exchange: &str, account: &Account) -> Result<()> {
        if !account.is_margin() {
            return Ok(());
        }
        let key = (exchange.to_owned(), account.clone());
        if self.open_accounts.lock().contains(&key) {
            return Ok(());
        }
        let exchange_instance = self.exchange(exchange)?;
        let open = exchange_instance.list_open_accounts().await?;
        {
            let mut accounts = self.open_accounts.lock();
            for account in open {
                accounts.insert((exchange.to_owned(), account));
            }
            if accounts.contains(&key) {
                return Ok(());
            }
        }
        info!(%account, "creating margin account");
        exchange_instance.create_account(account.clone()).await?;
        self.open_accounts.lock().insert(key);
        Ok(())
    }

    pub async fn get_balance(
        &self,
        exchange: &str,
        account: &Account,
        asset: &str,
    ) -> Result<Balance> {
        let balances = self.exchange(exchange)?.map_balances(account.clone()).await?;
        Ok(balances
            .get(account)
            .and_then(|assets| assets.get(asset))
            .copied()
            .unwrap_or_default())
    }

    /// Acquires a shared balance view for `(exchange, account)`. The first
    /// subscriber spawns a sync task; the last one dropped stops it.
    pub async fn sync_wallet(&self, exchange: &str, account: &Account) -> Result<WalletHandle> {
        self.ensure_account(exchange, account).await?;
        let exchange_instance = self.exchange(exchange)?.clone();
        let key = (exchange.to_owned(), account.clone());

        let (wallet, created) = {
            let mut wallets = self.wallets.lock();
            match wallets.get_mut(&key) {
                Some(entry) => {
                    entry.refcount += 1;
                    (entry.wallet.clone(), false)
                }
                None => {
                    let wallet = Arc::new(SharedWallet::new());
                    let task = tokio::spawn(sync_wallet_task(
                        exchange_instance,
                        account.clone(),
                        wallet.clone(),
                    ));
                    wallets.insert(
                        key.clone(),
                        WalletEntry { wallet: wallet.clone(), refcount: 1, task },
                    );
                    (wallet, true)
                }
            }
        };
        if created {
            // Wait for the initial balance load.
            let mut rx = wallet.state.subscribe();
            let pending = { *rx.borrow() == 0 };
            if pending && rx.changed().await.is_err() {
                return Err(ExchangeError::unavailable("wallet sync task stopped"));
            }
        }

        let rx = wallet.state.subscribe();
        Ok(WalletHandle { key, wallets: self.wallets.clone(), wallet, rx })
    }

    pub async fn place_order(&self, exchange: &str, order: NewOrder) -> Result<OrderResult> {
        self.ensure_account(exchange, &order.account).await?;
        self.exchange(exchange)?.place_order(order).await
    }

    pub async fn cancel_order(
        &self,
        exchange: &str,
        account: Account,
        symbol: &Symbol,
        client_id: &str,
    ) -> Result<()> {
        self.exchange(exchange)?.cancel_order(account, symbol, client_id).await
    }

    pub async fn edit_order(&self, exchange: &str, edit: EditOrder) -> Result<OrderResult> {
        self.exchange(exchange)?.edit_order(edit).await
    }

    pub async fn connect_stream_orders(
        &self,
        exchange: &str,
        account: Account,
        symbol: &Symbol,
    ) -> Result<ExchangeStream<OrderUpdate>> {
        self.ensure_account(exchange, &account).await?;
        self.exchange(exchange)?.connect_stream_orders(account, symbol).await
    }

    pub async fn transfer(&self, exchange: &str, transfer: Transfer) -> Result<()> {
        self.ensure_account(exchange, &transfer.to_account).await?;
        self.exchange(exchange)?.transfer(transfer).await
    }

    pub async fn borrow(
        &self,
        exchange: &str,
        asset: &str,
        size: Decimal,
        account: Account,
    ) -> Result<()> {
        self.exchange(exchange)?.borrow(asset, size, account).await
    }

    pub async fn repay(
        &self,
        exchange: &str,
        asset: &str,
        size: Decimal,
        account: Account,
    ) -> Result<()> {
        self.exchange(exchange)?.repay(asset, size, account).await
    }

    pub async fn get_max_borrowable(
        &self,
        exchange: &str,
        account: Account,
        asset: &str,
    ) -> Result<Decimal> {
        self.exchange(exchange)?.get_max_borrowable(account, asset).await
    }

    pub async fn list_open_margin_positions(
        &self,
        exchange: &str,
    ) -> Result<Vec<MarginPosition>> {
        self.exchange(exchange)?.list_open_margin_positions().await
    }
}

/// Subscriber view of a synced wallet.
pub struct WalletHandle {
    key: WalletKey,
    wallets: Arc<Mutex<HashMap<WalletKey, WalletEntry>>>,
    wallet: Arc<SharedWallet>,
    rx: watch::Receiver<u64>,
}

impl WalletHandle {
    pub fn balance(&self, asset: &str) -> Balance {
        self.wallet.balances.lock().get(asset).copied().unwrap_or_default()
    }

    pub fn balances(&self) -> HashMap<Asset, Balance> {
        self.wallet.balances.lock().clone()
    }

    /// Resumes once balances changed since the previous call.
    pub async fn updated(&mut self) -> Result<()> {
        self.rx
            .changed()
            .await
            .map_err(|_| ExchangeError::unavailable("wallet sync task stopped"))
    }
}

impl Drop for WalletHandle {
    fn drop(&mut self) {
        let mut wallets = self.wallets.lock();
        if let Some(entry) = wallets.get_mut(&self.key) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                if let Some(entry) = wallets.remove(&self.key) {
                    entry.task.abort();
                }
            }
        }
    }
}

async fn sync_wallet_task(
    exchange: Arc<dyn Exchange>,
    account: Account,
    wallet: Arc<SharedWallet>,
) {
    let mut budget = RetryBudget::new(8, Duration::from_secs(300));
    loop {
        match sync_wallet_once(&*exchange, &account, &wallet).await {
            Ok(()) => debug!(%account, "balance stream ended; reconnecting"),
            Err(err) if err.is_transient() => match budget.fail() {
                Some(delay) => {
                    warn!(%account, %err, "balance sync failed; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(%account, %err, "balance sync retry budget exhausted");
                    return;
                }
            },
            Err(err) => {
                warn!(%account, %err, "balance sync failed fatally");
                return;
            }
        }
    }
}

async fn sync_wallet_once(
    exchange: &dyn Exchange,
    account: &Account,
    wallet: &SharedWallet,
) -> Result<()> {
    let mut stream = if exchange.capabilities().can_stream_balances {
        Some(exchange.connect_stream_balances(account.clone()).await?)
    } else {
        None
    };

    let snapshot = exchange.map_balances(account.clone()).await?;
    wallet.update(snapshot.get(account).cloned().unwrap_or_default());

    match &mut stream {
        Some(stream) => {
            while let Some(balances) = stream.next().await {
                wallet.update(balances?);
            }
            Ok(())
        }
        None => {
            // Polling fallback for venues without balance streams.
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                let snapshot = exchange.map_balances(account.clone()).await?;
                wallet.update(snapshot.get(account).cloned().unwrap_or_default());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::Fake;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_get_balance() {
        let fake = Arc::new(Fake::new());
        fake.set_balance(
            Account::Spot,
            "btc",
            Balance { available: dec!(1.5), ..Default::default() },
        );
        let user = User::new(vec![fake]);
        let balance = user.get_balance("fake", &Account::Spot, "btc").await.unwrap();
        assert_eq!(balance.available, dec!(1.5));
        let missing = user.get_balance("fake", &Account::Spot, "eth").await.unwrap();
        assert_eq!(missing, Balance::default());
    }

    #[tokio::test]
    async fn test_wallet_sync_shares_task_and_updates() {
        let fake = Arc::new(Fake::new());
        fake.set_balance(
            Account::Spot,
            "btc",
            Balance { available: dec!(1.0), ..Default::default() },
        );
        let user = User::new(vec![fake.clone()]);

        let mut first = user.sync_wallet("fake", &Account::Spot).await.unwrap();
        let second = user.sync_wallet("fake", &Account::Spot).await.unwrap();
        assert_eq!(first.balance("btc").available, dec!(1.0));
        assert_eq!(second.balance("btc").available, dec!(1.0));

        let mut update = HashMap::new();
        update
            .insert("btc".to_owned(), Balance { available: dec!(2.0), ..Default::default() });
        fake.push_balances(update);
        first.updated().await.unwrap();
        assert_eq!(first.balance("btc").available, dec!(2.0));
        assert_eq!(second.balance("btc").available, dec!(2.0));
    }
}
