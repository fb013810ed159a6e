//! Account store on RocksDB optimistic transactions
//!
//! # Column Families
//!
//! - `accounts` - Account records (key: user_id)
//! - `products` - Catalog entries the ledger prices against (key: product_id)
//! - `transactions` - Append-only transaction rows (key: account || seq)
//! - `purchases` - Append-only purchase rows (key: account || seq)
//! - `referrals` - Referral rows owned by the referrer (key: account || seq)
//! - `indices` - Secondary indices (referral code -> user_id)
//! - `outbox` - Purchase events awaiting the reward reactor (key: event_id)
//!
//! # Transactions
//!
//! Every read that a transaction later writes against goes through
//! `get_for_update`, so a commit fails with `Busy` when another writer
//! touched the same key in between. [`Storage::transact`] reruns the whole
//! closure on such conflicts, up to `storage.max_txn_retries` attempts.

use crate::{
    error::{Error, Result},
    metrics::Metrics,
    types::{
        Account, Product, ProductId, Purchase, PurchaseEvent, ReferralRecord, TransactionRecord,
        UserId,
    },
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, OptimisticTransactionDB,
    Options, Transaction,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_PRODUCTS: &str = "products";
const CF_TRANSACTIONS: &str = "transactions";
const CF_PURCHASES: &str = "purchases";
const CF_REFERRALS: &str = "referrals";
const CF_INDICES: &str = "indices";
const CF_OUTBOX: &str = "outbox";

const COLUMN_FAMILIES: [&str; 7] = [
    CF_ACCOUNTS,
    CF_PRODUCTS,
    CF_TRANSACTIONS,
    CF_PURCHASES,
    CF_REFERRALS,
    CF_INDICES,
    CF_OUTBOX,
];

/// Storage wrapper for RocksDB
pub struct Storage {
    db: OptimisticTransactionDB,
    max_txn_retries: u32,
    metrics: Metrics,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("max_txn_retries", &self.max_txn_retries)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config, metrics: Metrics) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.storage.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.storage.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.storage.max_background_jobs);

        if config.storage.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db = OptimisticTransactionDB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = COLUMN_FAMILIES.len(),
            "Opened account store"
        );

        Ok(Self {
            db,
            max_txn_retries: config.storage.max_txn_retries.max(1),
            metrics,
        })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            // History rows are written once and read in bulk
            CF_TRANSACTIONS | CF_PURCHASES | CF_REFERRALS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            CF_INDICES => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Run `op` as one atomic transaction, retrying it on write conflicts
    ///
    /// The closure may run several times, so it must derive everything it
    /// writes from what it reads through the transaction.
    pub fn transact<T, F>(&self, name: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut(&StoreTxn<'_>) -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            let txn = StoreTxn {
                txn: self.db.transaction(),
                storage: self,
            };

            let outcome = match op(&txn) {
                Ok(value) => txn.commit().map(|()| value),
                Err(err) => Err(err),
            };

            match outcome {
                Err(err) if err.is_retryable() && attempt < self.max_txn_retries => {
                    self.metrics.record_txn_retry(name);
                    tracing::debug!(op = name, attempt, error = %err, "Transaction conflict, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    // Committed reads

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_prefix<T: DeserializeOwned>(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let cf = self.cf_handle(cf_name)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    /// Get account by user ID
    pub fn get_account(&self, user_id: &UserId) -> Result<Option<Account>> {
        self.get(CF_ACCOUNTS, user_id.as_str().as_bytes())
    }

    /// Get product by ID
    pub fn get_product(&self, product_id: &ProductId) -> Result<Option<Product>> {
        self.get(CF_PRODUCTS, product_id.as_str().as_bytes())
    }

    /// Transaction history in insertion order
    pub fn get_transactions(&self, user_id: &UserId) -> Result<Vec<TransactionRecord>> {
        self.scan_prefix(CF_TRANSACTIONS, &history_prefix(user_id)?)
    }

    /// Purchase history in insertion order
    pub fn get_purchases(&self, user_id: &UserId) -> Result<Vec<Purchase>> {
        self.scan_prefix(CF_PURCHASES, &history_prefix(user_id)?)
    }

    /// Referral history in insertion order
    pub fn get_referrals(&self, user_id: &UserId) -> Result<Vec<ReferralRecord>> {
        self.scan_prefix(CF_REFERRALS, &history_prefix(user_id)?)
    }

    /// Outbox events in creation order
    pub fn pending_events(&self) -> Result<Vec<PurchaseEvent>> {
        self.scan_prefix(CF_OUTBOX, &[])
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_accounts: self.approximate_count(CF_ACCOUNTS)?,
            total_products: self.approximate_count(CF_PRODUCTS)?,
            total_transactions: self.approximate_count(CF_TRANSACTIONS)?,
            pending_events: self.approximate_count(CF_OUTBOX)?,
        })
    }

    fn approximate_count(&self, cf_name: &str) -> Result<u64> {
        let cf = self.cf_handle(cf_name)?;
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(prop)
    }
}

/// One attempt of a store transaction
///
/// Reads are `get_for_update` so that every key the transaction depends on
/// participates in conflict detection at commit.
pub struct StoreTxn<'a> {
    txn: Transaction<'a, OptimisticTransactionDB>,
    storage: &'a Storage,
}

impl std::fmt::Debug for StoreTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTxn")
            .field("storage", self.storage)
            .finish_non_exhaustive()
    }
}

impl<'a> StoreTxn<'a> {
    fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }

    fn read<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.storage.cf_handle(cf_name)?;
        match self.txn.get_for_update_cf(cf, key, true)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.storage.cf_handle(cf_name)?;
        let bytes = bincode::serialize(value)?;
        self.txn.put_cf(cf, key, bytes)?;
        Ok(())
    }

    /// Read account
    pub fn account(&self, user_id: &UserId) -> Result<Option<Account>> {
        self.read(CF_ACCOUNTS, user_id.as_str().as_bytes())
    }

    /// Read account, `NotFound` if missing
    pub fn require_account(&self, user_id: &UserId, role: &str) -> Result<Account> {
        self.account(user_id)?
            .ok_or_else(|| Error::NotFound(format!("{} {}", role, user_id)))
    }

    /// Write account
    pub fn put_account(&self, account: &Account) -> Result<()> {
        self.write(CF_ACCOUNTS, account.id.as_str().as_bytes(), account)
    }

    /// Read product
    pub fn product(&self, product_id: &ProductId) -> Result<Option<Product>> {
        self.read(CF_PRODUCTS, product_id.as_str().as_bytes())
    }

    /// Write product
    pub fn put_product(&self, product: &Product) -> Result<()> {
        self.write(CF_PRODUCTS, product.id.as_str().as_bytes(), product)
    }

    /// Resolve referral code
    pub fn user_for_code(&self, code: &str) -> Result<Option<UserId>> {
        self.read(CF_INDICES, &code_key(code))
    }

    /// Claim referral code for a user
    pub fn put_code(&self, code: &str, user_id: &UserId) -> Result<()> {
        self.write(CF_INDICES, &code_key(code), user_id)
    }

    /// Append a transaction row, advancing the account's cursor
    ///
    /// The caller still has to `put_account` for the cursor to persist.
    pub fn append_transaction(
        &self,
        account: &mut Account,
        record: &TransactionRecord,
    ) -> Result<u64> {
        let seq = account.next_transaction_seq;
        self.write(CF_TRANSACTIONS, &history_key(&account.id, seq)?, record)?;
        account.next_transaction_seq += 1;
        Ok(seq)
    }

    /// Append a purchase row, advancing the account's cursor
    pub fn append_purchase(&self, account: &mut Account, purchase: &Purchase) -> Result<u64> {
        let seq = account.next_purchase_seq;
        self.write(CF_PURCHASES, &history_key(&account.id, seq)?, purchase)?;
        account.next_purchase_seq += 1;
        Ok(seq)
    }

    /// Append a referral row, advancing the account's cursor
    pub fn append_referral(&self, account: &mut Account, record: &ReferralRecord) -> Result<u64> {
        let seq = account.next_referral_seq;
        self.write(CF_REFERRALS, &history_key(&account.id, seq)?, record)?;
        account.next_referral_seq += 1;
        Ok(seq)
    }

    /// Read one referral row
    pub fn referral(&self, referrer: &UserId, seq: u64) -> Result<Option<ReferralRecord>> {
        self.read(CF_REFERRALS, &history_key(referrer, seq)?)
    }

    /// Overwrite one referral row in place
    pub fn put_referral(&self, referrer: &UserId, seq: u64, record: &ReferralRecord) -> Result<()> {
        self.write(CF_REFERRALS, &history_key(referrer, seq)?, record)
    }

    /// Enqueue a purchase event
    pub fn put_event(&self, event: &PurchaseEvent) -> Result<()> {
        self.write(CF_OUTBOX, event.event_id.as_bytes(), event)
    }

    /// Read a purchase event
    pub fn event(&self, event_id: Uuid) -> Result<Option<PurchaseEvent>> {
        self.read(CF_OUTBOX, event_id.as_bytes())
    }

    /// Consume a purchase event
    pub fn delete_event(&self, event_id: Uuid) -> Result<()> {
        let cf = self.storage.cf_handle(CF_OUTBOX)?;
        self.txn.delete_cf(cf, event_id.as_bytes())?;
        Ok(())
    }
}

// Key helpers

/// `len(u16) || user_id`, so no id is a byte prefix of another id's rows
///
/// Ids whose length does not fit the `u16` are refused, never truncated.
fn history_prefix(user_id: &UserId) -> Result<Vec<u8>> {
    let id = user_id.as_str().as_bytes();
    let len = u16::try_from(id.len()).map_err(|_| {
        Error::InvalidArgument(format!("User ID of {} bytes is too long", id.len()))
    })?;
    let mut key = Vec::with_capacity(2 + id.len() + 8);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(id);
    Ok(key)
}

fn history_key(user_id: &UserId, seq: u64) -> Result<Vec<u8>> {
    let mut key = history_prefix(user_id)?;
    key.extend_from_slice(&seq.to_be_bytes());
    Ok(key)
}

fn code_key(code: &str) -> Vec<u8> {
    let mut key = b"code|".to_vec();
    key.extend_from_slice(code.as_bytes());
    key
}

/// Storage statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    /// Estimated number of accounts
    pub total_accounts: u64,
    /// Estimated number of products
    pub total_products: u64,
    /// Estimated number of transaction rows
    pub total_transactions: u64,
    /// Estimated number of undelivered purchase events
    pub pending_events: u64,
}
