//! Referral tracking
//!
//! Owns the referrer-side `referralHistory` rows and the three counters
//! on the referrer's account. A record only ever changes once, from
//! uncredited to credited, and that flip always lands in the same store
//! transaction as the matching counter updates and the balance credit.

use crate::{
    config::RewardConfig,
    error::{Error, Result},
    storage::StoreTxn,
    types::{new_transaction_id, Account, ReferralRecord, TransactionKind, TransactionRecord, UserId},
};
use chrono::{DateTime, Utc};
use rand::Rng;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of generated referral codes
pub const CODE_LENGTH: usize = 8;

/// Random referral code of [`CODE_LENGTH`] uppercase alphanumerics
pub fn generate_referral_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Referral counters and history, applied inside ledger transactions
#[derive(Debug, Clone)]
pub struct ReferralTracker {
    signup_bonus: u64,
    reward: u64,
}

impl ReferralTracker {
    /// Tracker using the configured bonus and reward
    pub fn new(rewards: &RewardConfig) -> Self {
        Self {
            signup_bonus: rewards.signup_bonus,
            reward: rewards.referral_reward,
        }
    }

    /// Bonus the referred user receives
    pub fn signup_bonus(&self) -> u64 {
        self.signup_bonus
    }

    /// Reward reserved for referrers on new registrations
    pub fn reward(&self) -> u64 {
        self.reward
    }

    /// Reserve a future reward for `referred` on the referrer's account
    pub fn record_signup(
        &self,
        txn: &StoreTxn<'_>,
        referrer: &mut Account,
        referred: &UserId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let record = ReferralRecord {
            referred_user_id: referred.clone(),
            timestamp: now,
            signup_bonus: self.signup_bonus,
            reward: self.reward,
            credited: false,
            credited_at: None,
        };
        txn.append_referral(referrer, &record)?;

        referrer.total_referrals = checked_add(referrer.total_referrals, 1, "totalReferrals")?;
        referrer.pending_referral_credits =
            checked_add(referrer.pending_referral_credits, self.reward, "pendingReferralCredits")?;
        Ok(())
    }

    /// Earliest uncredited record for `referred`, with its row sequence
    pub fn find_uncredited(
        &self,
        txn: &StoreTxn<'_>,
        referrer: &Account,
        referred: &UserId,
    ) -> Result<Option<(u64, ReferralRecord)>> {
        for seq in 0..referrer.next_referral_seq {
            if let Some(record) = txn.referral(&referrer.id, seq)? {
                if !record.credited && &record.referred_user_id == referred {
                    return Ok(Some((seq, record)));
                }
            }
        }
        Ok(None)
    }

    /// Pay the reward reserved on one record and mark it credited
    ///
    /// Pays `record.reward`, the amount reserved at registration, so a later
    /// change of the configured reward cannot unbalance the pending counter.
    /// The caller persists `referrer` afterwards in the same transaction.
    pub fn settle(
        &self,
        txn: &StoreTxn<'_>,
        referrer: &mut Account,
        seq: u64,
        mut record: ReferralRecord,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        if record.credited {
            return Err(Error::InvariantViolation(format!(
                "referral {} of {} already credited",
                seq, referrer.id
            )));
        }

        let reward = record.reward;
        referrer.pending_referral_credits = referrer
            .pending_referral_credits
            .checked_sub(reward)
            .ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "pendingReferralCredits of {} below reward",
                    referrer.id
                ))
            })?;
        referrer.credits_from_referrals =
            checked_add(referrer.credits_from_referrals, reward, "creditsFromReferrals")?;
        referrer.credit(reward)?;

        let entry = TransactionRecord::new(
            new_transaction_id(),
            TransactionKind::Earned,
            reward,
            now,
            format!(
                "Referral reward for {}'s first purchase",
                record.referred_user_id
            ),
        );
        txn.append_transaction(referrer, &entry)?;

        record.credited = true;
        record.credited_at = Some(now);
        txn.put_referral(&referrer.id, seq, &record)?;
        Ok(reward)
    }
}

fn checked_add(value: u64, delta: u64, field: &str) -> Result<u64> {
    value
        .checked_add(delta)
        .ok_or_else(|| Error::InvariantViolation(format!("{} overflow", field)))
}
