//! # Coin Ledger
//!
//! **Balances and at-most-once reward grants.**
//!
//! Every mutation follows the same protocol:
//!
//! 1. Lock the account
//! 2. Apply the change to a copy
//! 3. Persist the copy (one key, crash-consistent)
//! 4. Swap the copy in
//!
//! A failed write in step 3 leaves both the store and memory on the old
//! value, so the operation is safe to retry.
//!
//! ## Locking
//!
//! One mutex per account. The account map itself sits behind an `RwLock`
//! that is only written when an account is first loaded or opened.

use crate::account::{coins, Account, AccountId, GrantKey};
use crate::error::{HavenError, HavenResult};
use crate::store::{load_json, save_json, KeyValueStore};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

type AccountSlot = Arc<Mutex<Account>>;

/// Owns every account's balance and satisfied grant keys.
pub struct Ledger {
    store: Arc<dyn KeyValueStore>,
    accounts: RwLock<HashMap<AccountId, AccountSlot>>,
}

impl Ledger {
    /// Creates a ledger over `store`. Accounts are loaded lazily.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Opens an account, creating it on first login.
    ///
    /// Returns the account and whether it was just created. Opening an
    /// existing account never changes it.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::PersistenceUnavailable`] if the new account could
    /// not be written. No account exists afterwards in that case.
    pub fn open_account(
        &self,
        id: &AccountId,
        starting_balance: u64,
        is_admin: bool,
        now: u64,
    ) -> HavenResult<(Account, bool)> {
        if let Some(slot) = self.cached(id) {
            return Ok((slot.lock().clone(), false));
        }

        let mut accounts = self.accounts.write();
        if let Some(slot) = accounts.get(id) {
            return Ok((slot.lock().clone(), false));
        }

        if let Some(existing) = load_json::<Account>(self.store.as_ref(), &id.store_key())? {
            accounts.insert(id.clone(), Arc::new(Mutex::new(existing.clone())));
            return Ok((existing, false));
        }

        let account = Account::new(id.clone(), starting_balance, is_admin, now);
        save_json(self.store.as_ref(), &id.store_key(), &account)?;
        accounts.insert(id.clone(), Arc::new(Mutex::new(account.clone())));

        tracing::info!(account = %id, balance = starting_balance, admin = is_admin, "account opened");
        Ok((account, true))
    }

    /// A copy of the account's current state.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::UnknownAccount`] if the account was never opened.
    pub fn account(&self, id: &AccountId) -> HavenResult<Account> {
        Ok(self.slot(id)?.lock().clone())
    }

    /// Current balance.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::UnknownAccount`] if the account was never opened.
    pub fn balance(&self, id: &AccountId) -> HavenResult<u64> {
        Ok(self.slot(id)?.lock().balance)
    }

    /// Returns true if `key` was already paid to this account.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::UnknownAccount`] if the account was never opened.
    pub fn has_grant(&self, id: &AccountId, key: &GrantKey) -> HavenResult<bool> {
        Ok(self.slot(id)?.lock().has_grant(key))
    }

    /// Atomically decrements the balance and returns the new balance.
    ///
    /// # Errors
    ///
    /// - [`HavenError::InvalidRequest`] for a negative amount.
    /// - [`HavenError::InsufficientFunds`] if `balance < amount`. Nothing changes.
    /// - [`HavenError::PersistenceUnavailable`] if the write fails. Nothing changes.
    pub fn debit(&self, id: &AccountId, amount: i64) -> HavenResult<u64> {
        let amount = coins(amount)?;
        self.apply(id, |account| account.withdraw(amount))
    }

    /// Atomically increments the balance and returns the new balance.
    ///
    /// # Errors
    ///
    /// - [`HavenError::InvalidRequest`] for a negative amount or overflow.
    /// - [`HavenError::PersistenceUnavailable`] if the write fails. Nothing changes.
    pub fn credit(&self, id: &AccountId, amount: i64) -> HavenResult<u64> {
        let amount = coins(amount)?;
        self.apply(id, |account| account.deposit(amount))
    }

    /// Pays `amount` under `key` unless `key` was already paid.
    ///
    /// Returns `false` for an already-satisfied key. That is the
    /// anti-double-claim guarantee: no credit, no write.
    ///
    /// # Errors
    ///
    /// - [`HavenError::InvalidRequest`] for a negative amount.
    /// - [`HavenError::PersistenceUnavailable`] if the write fails. The key stays
    ///   unclaimed.
    pub fn grant(&self, id: &AccountId, key: &GrantKey, amount: i64) -> HavenResult<bool> {
        let amount = coins(amount)?;
        let granted = self.apply(id, |account| account.apply_grant(key, amount))?;
        if granted {
            tracing::info!(account = %id, key = %key, amount, "grant paid");
        }
        Ok(granted)
    }

    /// Debits `cost`, runs `produce`, and rolls the debit back if it fails.
    ///
    /// `produce` never runs when the debit fails. The account lock is not held
    /// while `produce` runs.
    ///
    /// # Errors
    ///
    /// - Any debit error. `produce` was not invoked.
    /// - Any `produce` error, after the debit was re-credited.
    /// - [`HavenError::PersistenceUnavailable`] if the re-credit itself failed.
    pub fn purchase<T>(
        &self,
        id: &AccountId,
        cost: i64,
        produce: impl FnOnce() -> HavenResult<T>,
    ) -> HavenResult<(T, u64)> {
        let balance = self.debit(id, cost)?;

        match produce() {
            Ok(value) => Ok((value, balance)),
            Err(err) => match self.credit(id, cost) {
                Ok(_) => Err(err),
                Err(rollback) => {
                    tracing::error!(
                        account = %id,
                        cost,
                        "purchase rollback failed after {err}: {rollback}"
                    );
                    Err(HavenError::PersistenceUnavailable(format!(
                        "purchase failed ({err}) and refund of {cost} could not be written ({rollback})"
                    )))
                }
            },
        }
    }

    /// Applies `change` to one account under its lock and persists the result.
    ///
    /// If `change` fails, or the write fails, the account is left exactly as
    /// it was.
    ///
    /// # Errors
    ///
    /// Any error from `change`, [`HavenError::UnknownAccount`], or
    /// [`HavenError::PersistenceUnavailable`].
    pub fn apply<T>(&self, id: &AccountId, change: impl FnOnce(&mut Account) -> HavenResult<T>) -> HavenResult<T> {
        let slot = self.slot(id)?;
        let mut current = slot.lock();

        let mut next = current.clone();
        let out = change(&mut next)?;

        if next != *current {
            save_json(self.store.as_ref(), &id.store_key(), &next)?;
            *current = next;
        }

        Ok(out)
    }

    fn cached(&self, id: &AccountId) -> Option<AccountSlot> {
        self.accounts.read().get(id).cloned()
    }

    fn slot(&self, id: &AccountId) -> HavenResult<AccountSlot> {
        if let Some(slot) = self.cached(id) {
            return Ok(slot);
        }

        let mut accounts = self.accounts.write();
        if let Some(slot) = accounts.get(id) {
            return Ok(Arc::clone(slot));
        }

        let account = load_json::<Account>(self.store.as_ref(), &id.store_key())?
            .ok_or_else(|| HavenError::UnknownAccount(id.to_string()))?;
        let slot = Arc::new(Mutex::new(account));
        accounts.insert(id.clone(), Arc::clone(&slot));
        Ok(slot)
    }
}
