//! Marketplace Credit Ledger
//!
//! Credit balances, transfers, product purchases and referral rewards for
//! a digital-goods marketplace, persisted in RocksDB.
//!
//! # Architecture
//!
//! - **Transactional store**: every operation is one optimistic transaction
//! - **Normalized history**: transactions, purchases and referrals are
//!   append-only rows, never rewritten arrays
//! - **Reward reactor**: purchases emit outbox events consumed by one task
//! - **Thin handlers**: identity and argument checks before any store access
//!
//! # Invariants
//!
//! - Conservation: transfers and purchases never create or destroy credits
//! - Balances never go negative
//! - A referral record is credited at most once
//! - Paired history records are written together or not at all

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod error;
pub mod config;
pub mod metrics;
pub mod storage;
pub mod referral;
pub mod engine;
pub mod reactor;
pub mod ledger;
pub mod handlers;

// Re-exports
pub use config::Config;
pub use engine::{LedgerEngine, PurchaseReceipt, RewardOutcome, SkipReason};
pub use error::{Error, ErrorKind, Result};
pub use handlers::RequestHandlers;
pub use ledger::Ledger;
pub use metrics::Metrics;
pub use types::{
    Account, Product, ProductId, ProductStatus, Purchase, ReferralRecord, TransactionKind,
    TransactionRecord, UserId, MAX_ID_LEN,
};
