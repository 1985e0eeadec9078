//! # Accounts and Grant Keys
//!
//! An account is persisted as a single value. A grant key and the credit it
//! pays therefore land in one crash-consistent write.

use crate::error::{HavenError, HavenResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Longest accepted account id in bytes. Store file names are the
/// hex-encoded key, so this keeps them well under common name limits.
pub const MAX_ACCOUNT_ID_LEN: usize = 64;

/// Identifies an account. Passed explicitly into every core operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Validates and wraps an account identifier.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::InvalidRequest`] for empty ids, ids longer than
    /// [`MAX_ACCOUNT_ID_LEN`] bytes, or ids containing whitespace or control
    /// characters.
    pub fn new(id: impl Into<String>) -> HavenResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(HavenError::invalid("account id must not be empty"));
        }
        if id.len() > MAX_ACCOUNT_ID_LEN {
            return Err(HavenError::invalid(format!(
                "account id is {} bytes, at most {MAX_ACCOUNT_ID_LEN} allowed",
                id.len()
            )));
        }
        if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(HavenError::invalid(format!("account id {id:?} contains whitespace")));
        }
        Ok(Self(id))
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store key holding this account.
    pub fn store_key(&self) -> String {
        format!("account:{}", self.0)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Uniquely identifies one reward opportunity.
///
/// Once satisfied for an account it can never be satisfied again for that
/// account.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantKey(String);

impl GrantKey {
    /// `streak:<epoch-day>`
    pub fn streak(day: u64) -> Self {
        Self(format!("streak:{day}"))
    }

    /// `quest:<questId>`
    pub fn quest(quest_id: &str) -> Self {
        Self(format!("quest:{quest_id}"))
    }

    /// `referral:<code>`
    pub fn referral(code: &str) -> Self {
        Self(format!("referral:{code}"))
    }

    /// `token:<code>`
    pub fn token(code: &str) -> Self {
        Self(format!("token:{code}"))
    }

    /// The key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GrantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Daily login streak progress.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakState {
    /// Epoch day of the last successful claim.
    pub last_day: Option<u64>,
    /// Consecutive days claimed, ending at `last_day`.
    pub run: u32,
}

/// Persisted account state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account identifier.
    pub id: AccountId,
    /// Coin balance. Never negative.
    pub balance: u64,
    /// May issue tokens and read dashboard statistics.
    pub is_admin: bool,
    /// Grant keys already paid out.
    pub grants: BTreeSet<GrantKey>,
    /// Daily streak progress.
    pub streak: StreakState,
    /// This account's own referral code, once generated.
    pub referral_code: Option<String>,
    /// The referral code this account redeemed, if any.
    pub redeemed_referral: Option<String>,
    /// Unix seconds at first login.
    pub opened_at: u64,
}

impl Account {
    /// Creates a fresh account.
    pub fn new(id: AccountId, balance: u64, is_admin: bool, opened_at: u64) -> Self {
        Self {
            id,
            balance,
            is_admin,
            grants: BTreeSet::new(),
            streak: StreakState::default(),
            referral_code: None,
            redeemed_referral: None,
            opened_at,
        }
    }

    /// Returns true if `key` was already paid out.
    pub fn has_grant(&self, key: &GrantKey) -> bool {
        self.grants.contains(key)
    }

    /// Subtracts `amount` from the balance.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::InsufficientFunds`] if the balance is too low.
    pub fn withdraw(&mut self, amount: u64) -> HavenResult<u64> {
        self.balance = self.balance.checked_sub(amount).ok_or(HavenError::InsufficientFunds {
            balance: self.balance,
            required: amount,
        })?;
        Ok(self.balance)
    }

    /// Adds `amount` to the balance.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::InvalidRequest`] on overflow.
    pub fn deposit(&mut self, amount: u64) -> HavenResult<u64> {
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| HavenError::invalid("balance overflow"))?;
        Ok(self.balance)
    }

    /// Records `key` and credits `amount`, unless `key` was already paid.
    ///
    /// Returns `false` (and changes nothing) for an already-satisfied key.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::InvalidRequest`] on overflow.
    pub fn apply_grant(&mut self, key: &GrantKey, amount: u64) -> HavenResult<bool> {
        if self.grants.contains(key) {
            return Ok(false);
        }
        self.deposit(amount)?;
        self.grants.insert(key.clone());
        Ok(true)
    }
}

/// Converts a signed caller amount into a coin amount.
///
/// # Errors
///
/// Returns [`HavenError::InvalidRequest`] for negative amounts.
pub fn coins(amount: i64) -> HavenResult<u64> {
    u64::try_from(amount).map_err(|_| HavenError::invalid(format!("amount must be non-negative, got {amount}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new(AccountId::new("alice@example.com").unwrap(), 500, false, 0)
    }

    #[test]
    fn test_account_id_validation() {
        assert!(AccountId::new("").is_err());
        assert!(AccountId::new("has space").is_err());
        assert!(AccountId::new("a".repeat(MAX_ACCOUNT_ID_LEN)).is_ok());
        assert!(matches!(
            AccountId::new("a".repeat(MAX_ACCOUNT_ID_LEN + 1)),
            Err(HavenError::InvalidRequest(_))
        ));
        assert_eq!(AccountId::new("user-1").unwrap().store_key(), "account:user-1");
    }

    #[test]
    fn test_grant_key_formats() {
        assert_eq!(GrantKey::streak(19_000).as_str(), "streak:19000");
        assert_eq!(GrantKey::quest("3").as_str(), "quest:3");
        assert_eq!(GrantKey::referral("REF-ABCD").as_str(), "referral:REF-ABCD");
        assert_eq!(GrantKey::token("WELCOME100").as_str(), "token:WELCOME100");
    }

    #[test]
    fn test_withdraw_never_goes_negative() {
        let mut acc = account();
        let err = acc.withdraw(600).unwrap_err();
        assert_eq!(err, HavenError::InsufficientFunds { balance: 500, required: 600 });
        assert_eq!(acc.balance, 500);
        assert_eq!(acc.withdraw(500).unwrap(), 0);
    }

    #[test]
    fn test_apply_grant_once() {
        let mut acc = account();
        let key = GrantKey::quest("1");
        assert!(acc.apply_grant(&key, 100).unwrap());
        assert!(!acc.apply_grant(&key, 100).unwrap());
        assert_eq!(acc.balance, 600);
    }

    #[test]
    fn test_deposit_overflow() {
        let mut acc = account();
        acc.balance = u64::MAX;
        assert!(acc.deposit(1).is_err());
        assert_eq!(acc.balance, u64::MAX);
    }

    #[test]
    fn test_negative_coins_rejected() {
        assert!(coins(-5).is_err());
        assert_eq!(coins(5).unwrap(), 5);
    }
}
