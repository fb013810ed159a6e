//! Authenticated request handlers
//!
//! Each handler takes the caller identity resolved by the transport
//! (`None` when the request carried none) and a JSON-shaped request.
//! Identity is checked first, argument shape second, and only then is the
//! ledger touched.

use crate::{
    error::{Error, Result},
    ledger::Ledger,
    types::{Account, ProductId, Purchase, ReferralRecord, TransactionRecord, UserId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// `transferCredits` input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// Credits to send; any JSON number, validated by the handler
    #[serde(default)]
    pub amount: Option<Value>,
    /// Recipient account
    #[serde(default)]
    pub recipient_user_id: Option<String>,
}

/// `transferCredits` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    /// Always true on success
    pub success: bool,
    /// Sender balance after the transfer
    pub new_balance: u64,
}

/// `purchaseProduct` input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    /// Product to buy
    #[serde(default)]
    pub product_id: Option<String>,
}

/// `purchaseProduct` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseResponse {
    /// Always true on success
    pub success: bool,
    /// Buyer balance after the purchase
    pub new_balance: u64,
    /// Files snapshotted into the purchase record
    pub product_files: Vec<String>,
}

/// `processReferral` input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralRequest {
    /// Code of the referring account
    #[serde(default)]
    pub referral_code: Option<String>,
}

/// `processReferral` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralResponse {
    /// Always true on success
    pub success: bool,
    /// Bonus granted to the caller
    pub bonus_credits: u64,
}

/// `validatePurchaseAccess` input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequest {
    /// Product to check
    #[serde(default)]
    pub product_id: Option<String>,
}

/// `validatePurchaseAccess` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessResponse {
    /// Whether the caller owns the product
    pub has_purchased: bool,
}

/// Public view of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    /// Account owner
    pub user_id: UserId,
    /// Spendable balance
    pub credits: u64,
    /// Code others register to be referred by this account
    pub referral_code: String,
    /// Referrer, once a code was registered
    pub referred_by: Option<UserId>,
    /// Users who registered this account's code
    pub total_referrals: u64,
    /// Rewards paid out so far
    pub credits_from_referrals: u64,
    /// Rewards awaiting the referred users' first purchases
    pub pending_referral_credits: u64,
    /// Signup time
    pub created_at: DateTime<Utc>,
}

impl From<Account> for AccountSummary {
    fn from(account: Account) -> Self {
        Self {
            user_id: account.id,
            credits: account.credits,
            referral_code: account.referral_code,
            referred_by: account.referred_by,
            total_referrals: account.total_referrals,
            credits_from_referrals: account.credits_from_referrals,
            pending_referral_credits: account.pending_referral_credits,
            created_at: account.created_at,
        }
    }
}

/// `openAccount` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAccountResponse {
    /// Always true on success
    pub success: bool,
    /// The (possibly pre-existing) account
    pub account: AccountSummary,
}

/// Handlers shared by every transport
#[derive(Debug, Clone)]
pub struct RequestHandlers {
    ledger: Arc<Ledger>,
}

impl RequestHandlers {
    /// Wrap a ledger
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Ledger behind the handlers
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Open the caller's account (idempotent)
    pub async fn open_account(&self, caller: Option<&UserId>) -> Result<OpenAccountResponse> {
        let caller = authenticated(caller)?;
        let account = self.ledger.open_account(caller.clone()).await?;
        Ok(OpenAccountResponse {
            success: true,
            account: account.into(),
        })
    }

    /// `transferCredits`: the caller sends credits to another account
    pub async fn transfer_credits(
        &self,
        caller: Option<&UserId>,
        request: TransferRequest,
    ) -> Result<TransferResponse> {
        let sender = authenticated(caller)?;
        let amount = parse_amount(request.amount.as_ref())?;
        let recipient = required(request.recipient_user_id, "Recipient user ID")?;
        let recipient = UserId::new(recipient);

        let new_balance = self.ledger.transfer(sender.clone(), recipient, amount).await?;
        Ok(TransferResponse {
            success: true,
            new_balance,
        })
    }

    /// `purchaseProduct`: the caller buys an approved product
    pub async fn purchase_product(
        &self,
        caller: Option<&UserId>,
        request: PurchaseRequest,
    ) -> Result<PurchaseResponse> {
        let buyer = authenticated(caller)?;
        let product_id = ProductId::new(required(request.product_id, "Product ID")?);

        let receipt = self.ledger.purchase(buyer.clone(), product_id).await?;
        Ok(PurchaseResponse {
            success: true,
            new_balance: receipt.new_balance,
            product_files: receipt.product_files,
        })
    }

    /// `processReferral`: the caller registers someone else's code
    pub async fn process_referral(
        &self,
        caller: Option<&UserId>,
        request: ReferralRequest,
    ) -> Result<ReferralResponse> {
        let new_user = authenticated(caller)?;
        let code = required(request.referral_code, "Referral code")?;

        let bonus_credits = self.ledger.register_referral(new_user.clone(), code).await?;
        Ok(ReferralResponse {
            success: true,
            bonus_credits,
        })
    }

    /// `validatePurchaseAccess`: whether the caller owns a product
    pub async fn validate_purchase_access(
        &self,
        caller: Option<&UserId>,
        request: AccessRequest,
    ) -> Result<AccessResponse> {
        let user = authenticated(caller)?;
        let product_id = ProductId::new(required(request.product_id, "Product ID")?);

        let has_purchased = self.ledger.has_purchased(user.clone(), product_id).await?;
        Ok(AccessResponse { has_purchased })
    }

    /// Caller's account
    pub async fn account_summary(&self, caller: Option<&UserId>) -> Result<AccountSummary> {
        let user = authenticated(caller)?;
        Ok(self.ledger.account(user.clone()).await?.into())
    }

    /// Caller's transaction history
    pub async fn transactions(&self, caller: Option<&UserId>) -> Result<Vec<TransactionRecord>> {
        let user = authenticated(caller)?;
        self.ledger.transaction_history(user.clone()).await
    }

    /// Caller's purchase history
    pub async fn purchases(&self, caller: Option<&UserId>) -> Result<Vec<Purchase>> {
        let user = authenticated(caller)?;
        self.ledger.purchase_history(user.clone()).await
    }

    /// Caller's referral history
    pub async fn referrals(&self, caller: Option<&UserId>) -> Result<Vec<ReferralRecord>> {
        let user = authenticated(caller)?;
        self.ledger.referral_history(user.clone()).await
    }
}

fn authenticated(caller: Option<&UserId>) -> Result<&UserId> {
    match caller {
        Some(user) if !user.as_str().is_empty() => {
            user.validate("Caller ID")?;
            Ok(user)
        }
        _ => Err(Error::Unauthenticated),
    }
}

fn required(value: Option<String>, what: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::InvalidArgument(format!("{} required", what))),
    }
}

/// Accept a positive whole number of credits
///
/// JSON clients may send `30` or `30.0`; fractions, strings and anything
/// not above zero are rejected.
pub fn parse_amount(value: Option<&Value>) -> Result<u64> {
    let invalid = || Error::InvalidArgument("Valid amount required".to_string());

    let number = match value {
        Some(Value::Number(n)) => n,
        _ => return Err(invalid()),
    };

    if let Some(amount) = number.as_u64() {
        return if amount > 0 { Ok(amount) } else { Err(invalid()) };
    }

    match number.as_f64() {
        Some(f) if f > 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => Ok(f as u64),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Product, ProductStatus};
    use crate::{Config, ErrorKind};
    use serde_json::json;

    async fn create_handlers(temp_dir: &tempfile::TempDir) -> RequestHandlers {
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        RequestHandlers::new(Arc::new(Ledger::open(config).await.unwrap()))
    }

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount(Some(&json!(30))).unwrap(), 30);
        assert_eq!(parse_amount(Some(&json!(30.0))).unwrap(), 30);
        assert!(parse_amount(None).is_err());
        assert!(parse_amount(Some(&json!(0))).is_err());
        assert!(parse_amount(Some(&json!(-5))).is_err());
        assert!(parse_amount(Some(&json!(2.5))).is_err());
        assert!(parse_amount(Some(&json!("30"))).is_err());
        assert!(parse_amount(Some(&Value::Null)).is_err());
    }

    #[tokio::test]
    async fn test_unauthenticated_before_validation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let handlers = create_handlers(&temp_dir).await;

        // Invalid payloads still report the missing identity first
        let err = handlers
            .transfer_credits(None, TransferRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);

        let err = handlers
            .purchase_product(None, PurchaseRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);

        let err = handlers
            .process_referral(None, ReferralRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);

        let err = handlers
            .validate_purchase_access(Some(&user("")), AccessRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn test_oversized_caller_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let handlers = create_handlers(&temp_dir).await;
        let oversized = user(&format!("a{}", "x".repeat(65_536)));

        let err = handlers.open_account(Some(&oversized)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = handlers
            .validate_purchase_access(
                Some(&oversized),
                AccessRequest {
                    product_id: Some("p1".into()),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_transfer_scenario() {
        let temp_dir = tempfile::tempdir().unwrap();
        let handlers = create_handlers(&temp_dir).await;
        let (a, b) = (user("a"), user("b"));
        handlers.open_account(Some(&a)).await.unwrap();
        handlers.open_account(Some(&b)).await.unwrap();

        let response = handlers
            .transfer_credits(
                Some(&a),
                TransferRequest {
                    amount: Some(json!(30)),
                    recipient_user_id: Some("b".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            response,
            TransferResponse {
                success: true,
                new_balance: 70
            }
        );
        assert_eq!(handlers.account_summary(Some(&b)).await.unwrap().credits, 130);

        let err = handlers
            .transfer_credits(
                Some(&a),
                TransferRequest {
                    amount: Some(json!(30)),
                    recipient_user_id: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = handlers
            .transfer_credits(
                Some(&a),
                TransferRequest {
                    amount: Some(json!(30)),
                    recipient_user_id: Some("a".into()),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = handlers
            .transfer_credits(
                Some(&a),
                TransferRequest {
                    amount: Some(json!(500)),
                    recipient_user_id: Some("b".into()),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(handlers.account_summary(Some(&a)).await.unwrap().credits, 70);
    }

    #[tokio::test]
    async fn test_purchase_and_access() {
        let temp_dir = tempfile::tempdir().unwrap();
        let handlers = create_handlers(&temp_dir).await;
        let (buyer, creator) = (user("buyer"), user("creator"));
        handlers.open_account(Some(&buyer)).await.unwrap();
        handlers.open_account(Some(&creator)).await.unwrap();

        handlers
            .ledger()
            .put_product(Product {
                id: ProductId::new("free-guide"),
                creator_id: creator.clone(),
                creator_name: "Creator".into(),
                title: "Free Guide".into(),
                price: 0,
                status: ProductStatus::Approved,
                purchase_count: 0,
                product_files: vec!["guide.pdf".into()],
            })
            .await
            .unwrap();

        let access = handlers
            .validate_purchase_access(
                Some(&buyer),
                AccessRequest {
                    product_id: Some("free-guide".into()),
                },
            )
            .await
            .unwrap();
        assert!(!access.has_purchased);

        let response = handlers
            .purchase_product(
                Some(&buyer),
                PurchaseRequest {
                    product_id: Some("free-guide".into()),
                },
            )
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.new_balance, 100);
        assert_eq!(response.product_files, vec!["guide.pdf".to_string()]);

        let access = handlers
            .validate_purchase_access(
                Some(&buyer),
                AccessRequest {
                    product_id: Some("free-guide".into()),
                },
            )
            .await
            .unwrap();
        assert!(access.has_purchased);

        let history = handlers.transactions(Some(&creator)).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(handlers.purchases(Some(&buyer)).await.unwrap().len(), 1);

        let err = handlers
            .validate_purchase_access(
                Some(&user("ghost")),
                AccessRequest {
                    product_id: Some("free-guide".into()),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_referral_handler() {
        let temp_dir = tempfile::tempdir().unwrap();
        let handlers = create_handlers(&temp_dir).await;
        let (referrer, newcomer) = (user("r"), user("n"));
        let code = handlers
            .open_account(Some(&referrer))
            .await
            .unwrap()
            .account
            .referral_code;
        handlers.open_account(Some(&newcomer)).await.unwrap();

        let err = handlers
            .process_referral(
                Some(&newcomer),
                ReferralRequest {
                    referral_code: Some("   ".into()),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = handlers
            .process_referral(
                Some(&referrer),
                ReferralRequest {
                    referral_code: Some(code.clone()),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let response = handlers
            .process_referral(
                Some(&newcomer),
                ReferralRequest {
                    referral_code: Some(code.clone()),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            response,
            ReferralResponse {
                success: true,
                bonus_credits: 25
            }
        );

        let err = handlers
            .process_referral(
                Some(&newcomer),
                ReferralRequest {
                    referral_code: Some(code),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyReferred);

        let referrals = handlers.referrals(Some(&referrer)).await.unwrap();
        assert_eq!(referrals.len(), 1);
        assert!(!referrals[0].credited);
    }

    #[test]
    fn test_request_json_shape() {
        let request: TransferRequest =
            serde_json::from_value(json!({"amount": 10, "recipientUserId": "b"})).unwrap();
        assert_eq!(request.recipient_user_id.as_deref(), Some("b"));

        let value = serde_json::to_value(PurchaseResponse {
            success: true,
            new_balance: 5,
            product_files: vec![],
        })
        .unwrap();
        assert_eq!(value["newBalance"], 5);
        assert!(value.get("productFiles").is_some());
    }
}
