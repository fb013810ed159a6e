//! Ledger engine: every balance-affecting operation
//!
//! Each operation is exactly one [`Storage::transact`] call. Balances and
//! statuses are checked on the values read inside that transaction, never
//! on a value cached from before it, so two racing debits of the same
//! account cannot both pass the funds check: the loser's commit conflicts
//! and its closure reruns against the winner's balance.
//!
//! # Invariants
//!
//! - Conservation: a transfer or purchase moves credits, never creates them
//! - Non-negative balances: debits go through [`Account::debit`]
//! - Paired records: every transfer/purchase appends both sides or neither
//! - Referral settlement: flag, counters and payout change together

use crate::{
    config::RewardConfig,
    error::{Error, Result},
    metrics::Metrics,
    referral::{generate_referral_code, ReferralTracker},
    storage::{Storage, StoreTxn},
    types::{
        new_transaction_id, Account, Product, ProductId, ProductStatus, Purchase, PurchaseEvent,
        ReferralRecord, TransactionKind, TransactionRecord, UserId,
    },
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Attempts at drawing an unused referral code before giving up
const MAX_CODE_ATTEMPTS: usize = 16;

/// Result of a successful purchase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseReceipt {
    /// Buyer balance after the purchase
    pub new_balance: u64,
    /// Files the buyer is now entitled to
    pub product_files: Vec<String>,
    /// Event handed to the reward reactor
    pub event: PurchaseEvent,
}

/// What a referral-reward reaction did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewardOutcome {
    /// Referrer paid
    Credited {
        /// Account that received the reward
        referrer: UserId,
        /// Reward amount
        amount: u64,
    },
    /// Nothing to pay; the reason is informational only
    Skipped(SkipReason),
}

/// Why a referral reward was not paid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Buyer account does not exist
    BuyerMissing,
    /// Buyer signed up without a referral code
    NotReferred,
    /// Referrer account does not exist
    ReferrerMissing,
    /// No uncredited record for this buyer (already paid)
    NothingPending,
    /// Purchase event was consumed earlier
    EventConsumed,
}

/// Synchronous ledger engine over the account store
#[derive(Debug)]
pub struct LedgerEngine {
    storage: Arc<Storage>,
    rewards: RewardConfig,
    tracker: ReferralTracker,
    metrics: Metrics,
}

impl LedgerEngine {
    /// Create engine
    pub fn new(storage: Arc<Storage>, rewards: RewardConfig, metrics: Metrics) -> Self {
        let tracker = ReferralTracker::new(&rewards);
        Self {
            storage,
            rewards,
            tracker,
            metrics,
        }
    }

    /// Underlying store
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn observe<T>(&self, op: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let result = f();
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind().code(),
        };
        self.metrics
            .record_operation(op, outcome, started.elapsed().as_secs_f64());
        result
    }

    /// Create the account with the starting grant, or return the existing one
    pub fn open_account(&self, user_id: &UserId) -> Result<Account> {
        self.observe("open_account", || {
            user_id.validate("User ID")?;
            let (account, created) = self.storage.transact("open_account", |txn| {
                if let Some(existing) = txn.account(user_id)? {
                    return Ok((existing, false));
                }

                let code = Self::unused_code(txn)?;
                let account =
                    Account::new(user_id.clone(), code.clone(), self.rewards.starting_credits);
                txn.put_code(&code, user_id)?;
                txn.put_account(&account)?;
                Ok((account, true))
            })?;

            if created {
                tracing::info!(
                    user = %user_id,
                    referral_code = %account.referral_code,
                    credits = account.credits,
                    "Account opened"
                );
            }
            Ok(account)
        })
    }

    fn unused_code(txn: &StoreTxn<'_>) -> Result<String> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_referral_code(&mut rng);
            if txn.user_for_code(&code)?.is_none() {
                return Ok(code);
            }
        }
        Err(Error::Concurrency(
            "could not allocate an unused referral code".to_string(),
        ))
    }

    /// Register or update a catalog product; the purchase counter is kept
    pub fn put_product(&self, mut product: Product) -> Result<Product> {
        self.observe("put_product", || {
            product.id.validate("Product ID")?;
            product.creator_id.validate("Creator ID")?;

            self.storage.transact("put_product", |txn| {
                if let Some(existing) = txn.product(&product.id)? {
                    product.purchase_count = existing.purchase_count;
                }
                txn.put_product(&product)?;
                Ok(product.clone())
            })
        })
    }

    /// Move `amount` credits from `sender` to `recipient`
    ///
    /// Returns the sender's new balance.
    pub fn transfer(&self, sender: &UserId, recipient: &UserId, amount: u64) -> Result<u64> {
        self.observe("transfer", || {
            if amount == 0 {
                return Err(Error::InvalidArgument(
                    "Transfer amount must be positive".to_string(),
                ));
            }
            if sender == recipient {
                return Err(Error::InvalidArgument(
                    "Cannot transfer credits to yourself".to_string(),
                ));
            }

            let new_balance = self.storage.transact("transfer", |txn| {
                let mut from = txn.require_account(sender, "Sender")?;
                let mut to = txn.require_account(recipient, "Recipient")?;

                from.debit(amount)?;
                to.credit(amount)?;

                let now = Utc::now();
                let base_id = new_transaction_id();

                let mut sent = TransactionRecord::new(
                    base_id.clone(),
                    TransactionKind::Transfer,
                    amount,
                    now,
                    format!("Credit transfer to {}", recipient),
                );
                sent.from_user_id = Some(sender.clone());
                sent.to_user_id = Some(recipient.clone());

                let mut received = TransactionRecord::new(
                    format!("{}_received", base_id),
                    TransactionKind::Received,
                    amount,
                    now,
                    format!("Credits received from {}", sender),
                );
                received.from_user_id = Some(sender.clone());
                received.to_user_id = Some(recipient.clone());

                txn.append_transaction(&mut from, &sent)?;
                txn.append_transaction(&mut to, &received)?;
                txn.put_account(&from)?;
                txn.put_account(&to)?;

                Ok(from.credits)
            })?;

            tracing::info!(
                from = %sender,
                to = %recipient,
                amount,
                new_balance,
                "Credit transfer completed"
            );
            Ok(new_balance)
        })
    }

    /// Buy an approved product at its current price
    pub fn purchase(&self, buyer: &UserId, product_id: &ProductId) -> Result<PurchaseReceipt> {
        self.observe("purchase", || {
            let receipt = self.storage.transact("purchase", |txn| {
                let mut buyer_account = txn.require_account(buyer, "Buyer")?;
                let mut product = txn
                    .product(product_id)?
                    .ok_or_else(|| Error::NotFound(format!("Product {}", product_id)))?;

                if product.status != ProductStatus::Approved {
                    return Err(Error::InvalidState(format!(
                        "Product {} is {} and not available for purchase",
                        product_id, product.status
                    )));
                }

                let price = product.price;
                buyer_account.debit(price)?;

                // Self-purchase: both sides land on the same account record
                let mut creator_account = if product.creator_id == *buyer {
                    None
                } else {
                    Some(txn.require_account(&product.creator_id, "Creator")?)
                };

                match creator_account.as_mut() {
                    Some(creator) => creator.credit(price)?,
                    None => buyer_account.credit(price)?,
                }

                let now = Utc::now();
                let base_id = new_transaction_id();

                let purchase = Purchase {
                    product_id: product.id.clone(),
                    product_title: product.title.clone(),
                    creator_id: product.creator_id.clone(),
                    creator_name: product.creator_name.clone(),
                    price,
                    timestamp: now,
                    product_files: product.product_files.clone(),
                };

                let mut bought = TransactionRecord::new(
                    base_id.clone(),
                    TransactionKind::Purchase,
                    price,
                    now,
                    format!("Purchased {}", product.title),
                );
                bought.product_id = Some(product.id.clone());
                bought.product_title = Some(product.title.clone());

                let mut sold = TransactionRecord::new(
                    format!("{}_sale", base_id),
                    TransactionKind::Sale,
                    price,
                    now,
                    format!("Sale of {}", product.title),
                );
                sold.product_id = Some(product.id.clone());
                sold.product_title = Some(product.title.clone());
                sold.buyer_id = Some(buyer.clone());

                let purchase_seq = txn.append_purchase(&mut buyer_account, &purchase)?;
                txn.append_transaction(&mut buyer_account, &bought)?;
                match creator_account.as_mut() {
                    Some(creator) => {
                        txn.append_transaction(creator, &sold)?;
                        txn.put_account(creator)?;
                    }
                    None => {
                        txn.append_transaction(&mut buyer_account, &sold)?;
                    }
                }
                txn.put_account(&buyer_account)?;

                product.purchase_count += 1;
                txn.put_product(&product)?;

                let event = PurchaseEvent {
                    event_id: Uuid::now_v7(),
                    buyer_id: buyer.clone(),
                    purchase_seq,
                };
                txn.put_event(&event)?;

                Ok(PurchaseReceipt {
                    new_balance: buyer_account.credits,
                    product_files: purchase.product_files,
                    event,
                })
            })?;

            tracing::info!(
                buyer = %buyer,
                product = %product_id,
                new_balance = receipt.new_balance,
                "Product purchase completed"
            );
            Ok(receipt)
        })
    }

    /// Attach `new_user` to the owner of `referral_code` and grant the bonus
    ///
    /// Returns the bonus granted.
    pub fn register_referral(&self, new_user: &UserId, referral_code: &str) -> Result<u64> {
        self.observe("register_referral", || {
            let code = referral_code.trim();
            if code.is_empty() {
                return Err(Error::InvalidArgument("Referral code required".to_string()));
            }

            let (referrer_id, bonus) = self.storage.transact("register_referral", |txn| {
                let referrer_id = txn
                    .user_for_code(code)?
                    .ok_or_else(|| Error::NotFound(format!("Referral code {}", code)))?;

                if referrer_id == *new_user {
                    return Err(Error::InvalidArgument(
                        "Cannot use your own referral code".to_string(),
                    ));
                }

                let mut user = txn.require_account(new_user, "User")?;
                if user.referred_by.is_some() {
                    return Err(Error::AlreadyReferred);
                }
                let mut referrer = txn.require_account(&referrer_id, "Referrer")?;

                let now = Utc::now();
                let bonus = self.tracker.signup_bonus();

                user.referred_by = Some(referrer_id.clone());
                user.credit(bonus)?;
                let welcome = TransactionRecord::new(
                    new_transaction_id(),
                    TransactionKind::Earned,
                    bonus,
                    now,
                    "Welcome bonus for using referral code",
                );
                txn.append_transaction(&mut user, &welcome)?;

                self.tracker
                    .record_signup(txn, &mut referrer, new_user, now)?;

                txn.put_account(&user)?;
                txn.put_account(&referrer)?;
                Ok((referrer_id, bonus))
            })?;

            tracing::info!(
                referrer = %referrer_id,
                new_user = %new_user,
                code,
                bonus,
                "Referral processed"
            );
            Ok(bonus)
        })
    }

    /// Pay the referrer of `buyer`, if a reward is still pending
    pub fn credit_referral_reward(&self, buyer: &UserId) -> Result<RewardOutcome> {
        self.observe("credit_referral_reward", || {
            let outcome = self
                .storage
                .transact("credit_referral_reward", |txn| self.reward_in_txn(txn, buyer))?;
            self.log_reward(buyer, &outcome);
            Ok(outcome)
        })
    }

    /// React to one outbox event, consuming it in the same transaction
    ///
    /// An event whose reaction fails with a non-transient error would fail
    /// the same way on every sweep; it is logged and dropped from the outbox
    /// in a transaction of its own before the error is returned. Transient
    /// failures leave the event for the next sweep.
    pub fn process_purchase_event(&self, event: &PurchaseEvent) -> Result<RewardOutcome> {
        self.observe("credit_referral_reward", || {
            let result = self.storage.transact("credit_referral_reward", |txn| {
                if txn.event(event.event_id)?.is_none() {
                    return Ok(RewardOutcome::Skipped(SkipReason::EventConsumed));
                }
                txn.delete_event(event.event_id)?;
                self.reward_in_txn(txn, &event.buyer_id)
            });

            match result {
                Ok(outcome) => {
                    self.log_reward(&event.buyer_id, &outcome);
                    Ok(outcome)
                }
                Err(err) if !err.is_transient() => {
                    tracing::error!(
                        event_id = %event.event_id,
                        buyer = %event.buyer_id,
                        error = %err,
                        "Discarding purchase event that cannot be processed"
                    );
                    self.storage
                        .transact("discard_purchase_event", |txn| {
                            txn.delete_event(event.event_id)
                        })?;
                    self.metrics.record_event_discarded();
                    Err(err)
                }
                Err(err) => Err(err),
            }
        })
    }

    fn reward_in_txn(&self, txn: &StoreTxn<'_>, buyer: &UserId) -> Result<RewardOutcome> {
        let Some(buyer_account) = txn.account(buyer)? else {
            return Ok(RewardOutcome::Skipped(SkipReason::BuyerMissing));
        };
        let Some(referrer_id) = buyer_account.referred_by else {
            return Ok(RewardOutcome::Skipped(SkipReason::NotReferred));
        };
        let Some(mut referrer) = txn.account(&referrer_id)? else {
            return Ok(RewardOutcome::Skipped(SkipReason::ReferrerMissing));
        };
        let Some((seq, record)) = self.tracker.find_uncredited(txn, &referrer, buyer)? else {
            return Ok(RewardOutcome::Skipped(SkipReason::NothingPending));
        };

        let amount = self
            .tracker
            .settle(txn, &mut referrer, seq, record, Utc::now())?;
        txn.put_account(&referrer)?;

        Ok(RewardOutcome::Credited {
            referrer: referrer_id,
            amount,
        })
    }

    fn log_reward(&self, buyer: &UserId, outcome: &RewardOutcome) {
        match outcome {
            RewardOutcome::Credited { referrer, amount } => {
                self.metrics.record_reward_credited();
                tracing::info!(
                    referrer = %referrer,
                    buyer = %buyer,
                    reward = amount,
                    "Referral reward credited"
                );
            }
            RewardOutcome::Skipped(reason) => {
                tracing::debug!(buyer = %buyer, ?reason, "No referral reward due");
            }
        }
    }

    /// Whether `user_id` has ever bought `product_id`
    pub fn has_purchased(&self, user_id: &UserId, product_id: &ProductId) -> Result<bool> {
        self.account(user_id)?;
        let purchases = self.storage.get_purchases(user_id)?;
        Ok(purchases.iter().any(|p| p.product_id == *product_id))
    }

    /// Committed account state
    pub fn account(&self, user_id: &UserId) -> Result<Account> {
        self.storage
            .get_account(user_id)?
            .ok_or_else(|| Error::NotFound(format!("User {}", user_id)))
    }

    /// Committed product state
    pub fn product(&self, product_id: &ProductId) -> Result<Product> {
        self.storage
            .get_product(product_id)?
            .ok_or_else(|| Error::NotFound(format!("Product {}", product_id)))
    }

    /// Transaction history, oldest first
    pub fn transaction_history(&self, user_id: &UserId) -> Result<Vec<TransactionRecord>> {
        self.account(user_id)?;
        self.storage.get_transactions(user_id)
    }

    /// Purchase history, oldest first
    pub fn purchase_history(&self, user_id: &UserId) -> Result<Vec<Purchase>> {
        self.account(user_id)?;
        self.storage.get_purchases(user_id)
    }

    /// Referral history, oldest first
    pub fn referral_history(&self, user_id: &UserId) -> Result<Vec<ReferralRecord>> {
        self.account(user_id)?;
        self.storage.get_referrals(user_id)
    }
}
