//! Core types for the credit ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode for storage, camelCase JSON for callers)
//! - Integer arithmetic only (credits are whole, non-negative units)
//! - Immutable history (records are appended, never rewritten)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Longest user or product id accepted, in bytes
pub const MAX_ID_LEN: usize = 256;

fn validate_id(id: &str, what: &str) -> crate::Result<()> {
    if id.is_empty() {
        return Err(crate::Error::InvalidArgument(format!("{} required", what)));
    }
    if id.len() > MAX_ID_LEN {
        return Err(crate::Error::InvalidArgument(format!(
            "{} longer than {} bytes",
            what, MAX_ID_LEN
        )));
    }
    Ok(())
}

/// User identifier issued by the auth provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create new user ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `InvalidArgument` unless the id is non-empty and at most [`MAX_ID_LEN`] bytes
    pub fn validate(&self, what: &str) -> crate::Result<()> {
        validate_id(&self.0, what)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Product identifier from the catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Create new product ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `InvalidArgument` unless the id is non-empty and at most [`MAX_ID_LEN`] bytes
    pub fn validate(&self, what: &str) -> crate::Result<()> {
        validate_id(&self.0, what)
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-user balance record
///
/// Histories are not embedded: transactions, purchases and referral records
/// live in their own column families keyed by account and sequence. The
/// `next_*_seq` fields are the append cursors for those rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Owner
    pub id: UserId,
    /// Current balance
    pub credits: u64,
    /// Code other users present at signup
    pub referral_code: String,
    /// Referrer, set at most once
    pub referred_by: Option<UserId>,
    /// Number of referral registrations against this account
    pub total_referrals: u64,
    /// Rewards actually paid out
    pub credits_from_referrals: u64,
    /// Rewards reserved for referred users who have not purchased yet
    pub pending_referral_credits: u64,
    /// Account creation time
    pub created_at: DateTime<Utc>,
    /// Next transaction row
    pub next_transaction_seq: u64,
    /// Next purchase row
    pub next_purchase_seq: u64,
    /// Next referral row
    pub next_referral_seq: u64,
}

impl Account {
    /// Fresh account with the starting grant and empty histories
    pub fn new(id: UserId, referral_code: String, starting_credits: u64) -> Self {
        Self {
            id,
            credits: starting_credits,
            referral_code,
            referred_by: None,
            total_referrals: 0,
            credits_from_referrals: 0,
            pending_referral_credits: 0,
            created_at: Utc::now(),
            next_transaction_seq: 0,
            next_purchase_seq: 0,
            next_referral_seq: 0,
        }
    }

    /// Debit the balance; fails without touching it if the balance is short
    pub fn debit(&mut self, amount: u64) -> crate::Result<()> {
        self.credits = self
            .credits
            .checked_sub(amount)
            .ok_or(crate::Error::InsufficientFunds {
                available: self.credits,
                required: amount,
            })?;
        Ok(())
    }

    /// Credit the balance
    pub fn credit(&mut self, amount: u64) -> crate::Result<()> {
        self.credits = self.credits.checked_add(amount).ok_or_else(|| {
            crate::Error::InvariantViolation(format!("balance overflow on {}", self.id))
        })?;
        Ok(())
    }
}

/// Kind of balance-affecting event, from one account's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Credits sent to another user
    Transfer,
    /// Credits received from another user
    Received,
    /// Product bought
    Purchase,
    /// Product sold
    Sale,
    /// Bonus or reward granted by the platform
    Earned,
}

/// Immutable history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// Time-derived id; paired records share the base and differ by suffix
    pub id: String,
    /// Event kind
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    /// Credits moved
    pub amount: u64,
    /// Sender side of a transfer
    pub from_user_id: Option<UserId>,
    /// Receiving side of a transfer
    pub to_user_id: Option<UserId>,
    /// Buyer, on sale records
    pub buyer_id: Option<UserId>,
    /// Product, on purchase and sale records
    pub product_id: Option<ProductId>,
    /// Product title at the time of the event
    pub product_title: Option<String>,
    /// Event time
    pub timestamp: DateTime<Utc>,
    /// Human-readable summary
    pub description: String,
}

impl TransactionRecord {
    /// Record with only the mandatory fields set
    pub fn new(
        id: impl Into<String>,
        kind: TransactionKind,
        amount: u64,
        timestamp: DateTime<Utc>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            amount,
            from_user_id: None,
            to_user_id: None,
            buyer_id: None,
            product_id: None,
            product_title: None,
            timestamp,
            description: description.into(),
        }
    }
}

/// Base id for a group of paired transaction records
pub fn new_transaction_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Immutable record of what a buyer acquired
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    /// Product bought
    pub product_id: ProductId,
    /// Title at purchase time
    pub product_title: String,
    /// Seller
    pub creator_id: UserId,
    /// Seller display name at purchase time
    pub creator_name: String,
    /// Price paid
    pub price: u64,
    /// Purchase time
    pub timestamp: DateTime<Utc>,
    /// Files the buyer is entitled to, frozen at purchase time
    pub product_files: Vec<String>,
}

/// Referrer-side record of one referred signup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralRecord {
    /// New user who used the code
    pub referred_user_id: UserId,
    /// Registration time
    pub timestamp: DateTime<Utc>,
    /// Bonus granted to the referred user
    pub signup_bonus: u64,
    /// Reward reserved for the referrer at registration, paid on settlement
    pub reward: u64,
    /// Whether the referrer has been paid for this referral
    pub credited: bool,
    /// When the reward was paid
    pub credited_at: Option<DateTime<Utc>>,
}

/// Catalog review status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    /// Being edited by the creator
    Draft,
    /// Waiting for review
    Pending,
    /// Listed and purchasable
    Approved,
    /// Refused by review
    Rejected,
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProductStatus::Draft => "draft",
            ProductStatus::Pending => "pending",
            ProductStatus::Approved => "approved",
            ProductStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Catalog entry the ledger reads prices from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    /// Product ID
    pub id: ProductId,
    /// Seller
    pub creator_id: UserId,
    /// Seller display name
    pub creator_name: String,
    /// Title
    pub title: String,
    /// Price in credits (0 = free)
    pub price: u64,
    /// Review status
    pub status: ProductStatus,
    /// Completed purchases
    #[serde(default)]
    pub purchase_count: u64,
    /// Deliverable file references
    #[serde(default)]
    pub product_files: Vec<String>,
}

/// Pending "purchase record created" notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseEvent {
    /// Outbox key
    pub event_id: Uuid,
    /// Buyer whose purchase history grew
    pub buyer_id: UserId,
    /// Sequence of the new purchase row
    pub purchase_seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_length_bounds() {
        assert!(UserId::new("u".repeat(MAX_ID_LEN)).validate("User ID").is_ok());
        assert!(matches!(
            UserId::new("u".repeat(MAX_ID_LEN + 1)).validate("User ID"),
            Err(crate::Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ProductId::new("").validate("Product ID"),
            Err(crate::Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_debit_never_goes_negative() {
        let mut account = Account::new(UserId::new("a"), "CODE0001".into(), 10);
        let err = account.debit(30).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::InsufficientFunds { available: 10, required: 30 }
        ));
        assert_eq!(account.credits, 10);

        account.debit(10).unwrap();
        assert_eq!(account.credits, 0);
    }

    #[test]
    fn test_transaction_record_json_shape() {
        let record = TransactionRecord::new("abc", TransactionKind::Received, 30, Utc::now(), "x");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "received");
        assert_eq!(json["amount"], 30);
        assert!(json.get("fromUserId").is_some());
    }

    #[test]
    fn test_transaction_ids_are_unique() {
        let a = new_transaction_id();
        let b = new_transaction_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }
}
