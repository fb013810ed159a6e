//! Main ledger orchestration layer
//!
//! This module ties together storage, the engine and the reward reactor
//! into the async API the request handlers call.
//!
//! # Example
//!
//! ```no_run
//! use credit_ledger::{Config, Ledger, UserId};
//!
//! #[tokio::main]
//! async fn main() -> credit_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default()).await?;
//!
//!     let alice = ledger.open_account(UserId::new("alice")).await?;
//!     let bob = ledger.open_account(UserId::new("bob")).await?;
//!     let balance = ledger.transfer(alice.id, bob.id, 30).await?;
//!     assert_eq!(balance, 70);
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    engine::{LedgerEngine, PurchaseReceipt, RewardOutcome},
    metrics::Metrics,
    reactor::{spawn_reward_reactor, ReactorHandle},
    storage::{Storage, StorageStats},
    types::{Account, Product, ProductId, Purchase, ReferralRecord, TransactionRecord, UserId},
    Config, Error, Result,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Main ledger interface
pub struct Ledger {
    /// Synchronous engine, driven from the blocking pool
    engine: Arc<LedgerEngine>,

    /// Reward reactor (absent when disabled)
    reactor: Option<ReactorHandle>,

    /// Reactor task, taken on shutdown
    reactor_task: Mutex<Option<JoinHandle<()>>>,

    /// Metrics collector
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("data_dir", &self.config.data_dir)
            .field("reactor", &self.reactor.is_some())
            .finish()
    }
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?;

        let storage_config = config.clone();
        let storage_metrics = metrics.clone();
        let storage = tokio::task::spawn_blocking(move || {
            Storage::open(&storage_config, storage_metrics)
        })
        .await
        .map_err(|e| Error::Concurrency(format!("Storage open task failed: {}", e)))??;

        let engine = Arc::new(LedgerEngine::new(
            Arc::new(storage),
            config.rewards.clone(),
            metrics.clone(),
        ));

        let (reactor, reactor_task) = if config.reactor.enabled {
            let (handle, task) = spawn_reward_reactor(
                engine.clone(),
                config.reactor.mailbox_capacity,
                Duration::from_millis(config.reactor.sweep_interval_ms.max(1)),
            );
            (Some(handle), Some(task))
        } else {
            (None, None)
        };

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            reactor = reactor.is_some(),
            "Ledger opened"
        );

        Ok(Self {
            engine,
            reactor,
            reactor_task: Mutex::new(reactor_task),
            metrics,
            config,
        })
    }

    /// Run an engine call on the blocking pool
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&LedgerEngine) -> Result<T> + Send + 'static,
    {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| Error::Concurrency(format!("Ledger task failed: {}", e)))?
    }

    /// Open (or fetch) the caller's account
    pub async fn open_account(&self, user_id: UserId) -> Result<Account> {
        self.run(move |engine| engine.open_account(&user_id)).await
    }

    /// Register or update a catalog product
    pub async fn put_product(&self, product: Product) -> Result<Product> {
        self.run(move |engine| engine.put_product(product)).await
    }

    /// Transfer credits; returns the sender's new balance
    pub async fn transfer(&self, sender: UserId, recipient: UserId, amount: u64) -> Result<u64> {
        self.run(move |engine| engine.transfer(&sender, &recipient, amount))
            .await
    }

    /// Purchase a product and announce the purchase to the reward reactor
    pub async fn purchase(&self, buyer: UserId, product_id: ProductId) -> Result<PurchaseReceipt> {
        let receipt = self
            .run(move |engine| engine.purchase(&buyer, &product_id))
            .await?;

        if let Some(reactor) = &self.reactor {
            reactor.notify(receipt.event.clone());
        }
        Ok(receipt)
    }

    /// Register a referral code for a new user; returns the bonus granted
    pub async fn register_referral(&self, new_user: UserId, referral_code: String) -> Result<u64> {
        self.run(move |engine| engine.register_referral(&new_user, &referral_code))
            .await
    }

    /// Pay a pending referral reward for `buyer` directly
    pub async fn credit_referral_reward(&self, buyer: UserId) -> Result<RewardOutcome> {
        self.run(move |engine| engine.credit_referral_reward(&buyer))
            .await
    }

    /// Whether the user owns the product
    pub async fn has_purchased(&self, user_id: UserId, product_id: ProductId) -> Result<bool> {
        self.run(move |engine| engine.has_purchased(&user_id, &product_id))
            .await
    }

    /// Committed account state
    pub async fn account(&self, user_id: UserId) -> Result<Account> {
        self.run(move |engine| engine.account(&user_id)).await
    }

    /// Committed product state
    pub async fn product(&self, product_id: ProductId) -> Result<Product> {
        self.run(move |engine| engine.product(&product_id)).await
    }

    /// Transaction history, oldest first
    pub async fn transaction_history(&self, user_id: UserId) -> Result<Vec<TransactionRecord>> {
        self.run(move |engine| engine.transaction_history(&user_id))
            .await
    }

    /// Purchase history, oldest first
    pub async fn purchase_history(&self, user_id: UserId) -> Result<Vec<Purchase>> {
        self.run(move |engine| engine.purchase_history(&user_id))
            .await
    }

    /// Referral history, oldest first
    pub async fn referral_history(&self, user_id: UserId) -> Result<Vec<ReferralRecord>> {
        self.run(move |engine| engine.referral_history(&user_id))
            .await
    }

    /// Approximate row counts
    pub async fn stats(&self) -> Result<StorageStats> {
        self.run(|engine| engine.storage().get_stats()).await
    }

    /// Wait until every pending purchase event has been processed
    ///
    /// Returns the number of outbox events the sweep found.
    pub async fn drain_rewards(&self) -> Result<usize> {
        match &self.reactor {
            Some(reactor) => reactor.sweep().await,
            None => Ok(0),
        }
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration the ledger was opened with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the reward reactor; pending outbox events survive for the next start
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(reactor) = &self.reactor {
            // Already stopped is fine
            let _ = reactor.shutdown().await;
        }

        let task = self.reactor_task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| Error::Concurrency(format!("Reactor task failed: {}", e)))?;
        }

        tracing::info!("Ledger shut down");
        Ok(())
    }
}
