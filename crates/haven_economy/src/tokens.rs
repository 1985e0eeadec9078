//! # Token Book
//!
//! The global token key space. A token string can be redeemed by the whole
//! user base exactly once: first redeemer wins, everyone after gets
//! `AlreadyRedeemed`.
//!
//! The book holds admin-issued tokens with their values and every redemption.
//! It is persisted as one value under [`TOKENS_KEY`].
//!
//! ## Redemption Protocol
//!
//! ```text
//! lock book -> check redeemed -> persist redemption -> credit account
//!                                                        │
//!                                     write failed? <────┘
//!                                     persist revocation, surface error
//! ```
//!
//! A crash between the two writes loses the payout but never pays twice.

use crate::account::AccountId;
use crate::error::{HavenError, HavenResult};
use crate::store::{load_json, save_json, KeyValueStore};
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// Store key for the token book.
pub const TOKENS_KEY: &str = "tokens:book";

const BASE36: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Returns true for uppercase ASCII alphanumerics within the length bounds.
pub fn is_valid_token_format(code: &str, min_len: usize, max_len: usize) -> bool {
    (min_len..=max_len).contains(&code.len())
        && code.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// `prefix` followed by `random_len` random base-36 characters.
pub fn generate_code<R: Rng + ?Sized>(prefix: &str, random_len: usize, rng: &mut R) -> String {
    let mut code = String::with_capacity(prefix.len() + random_len);
    code.push_str(prefix);
    for _ in 0..random_len {
        code.push(char::from(BASE36[rng.gen_range(0..BASE36.len())]));
    }
    code
}

/// An admin-issued token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    /// The token string.
    pub code: String,
    /// Coins paid on redemption.
    pub value: u64,
    /// Admin who issued it.
    pub issued_by: AccountId,
    /// Unix seconds at issue.
    pub issued_at: u64,
}

/// A completed redemption.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    /// Redeeming account.
    pub account: AccountId,
    /// Coins paid.
    pub amount: u64,
    /// Unix seconds at redemption.
    pub redeemed_at: u64,
}

/// Renders tokens as `token,value` CSV with a header row.
pub fn tokens_to_csv(tokens: &[IssuedToken]) -> String {
    let mut csv = String::from("token,value\n");
    for token in tokens {
        let _ = writeln!(csv, "{},{}", token.code, token.value);
    }
    csv
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct BookState {
    issued: BTreeMap<String, IssuedToken>,
    redeemed: BTreeMap<String, Redemption>,
}

/// Shared, persisted token key space.
pub struct TokenBook {
    state: Mutex<BookState>,
    store: Arc<dyn KeyValueStore>,
}

impl TokenBook {
    /// Loads the book from `store`, or starts empty.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::PersistenceUnavailable`] if the store cannot be read.
    pub fn open(store: Arc<dyn KeyValueStore>) -> HavenResult<Self> {
        let state = load_json::<BookState>(store.as_ref(), TOKENS_KEY)?.unwrap_or_default();
        Ok(Self {
            state: Mutex::new(state),
            store,
        })
    }

    /// Locks the whole token key space.
    pub fn lock(&self) -> TokenGuard<'_> {
        TokenGuard {
            state: self.state.lock(),
            store: self.store.as_ref(),
        }
    }

    /// Number of admin-issued tokens.
    pub fn issued_count(&self) -> usize {
        self.state.lock().issued.len()
    }

    /// Number of redemptions, fixed and freeform tokens included.
    pub fn redeemed_count(&self) -> usize {
        self.state.lock().redeemed.len()
    }

    /// Returns true if `code` was redeemed by anyone.
    pub fn is_redeemed(&self, code: &str) -> bool {
        self.state.lock().redeemed.contains_key(code)
    }
}

/// Exclusive access to the token key space.
pub struct TokenGuard<'a> {
    state: MutexGuard<'a, BookState>,
    store: &'a dyn KeyValueStore,
}

impl TokenGuard<'_> {
    /// Returns true if `code` was redeemed by anyone.
    pub fn is_redeemed(&self, code: &str) -> bool {
        self.state.redeemed.contains_key(code)
    }

    /// Returns true if `code` was issued by an admin.
    pub fn is_issued(&self, code: &str) -> bool {
        self.state.issued.contains_key(code)
    }

    /// Value of an admin-issued token.
    pub fn issued_value(&self, code: &str) -> Option<u64> {
        self.state.issued.get(code).map(|t| t.value)
    }

    /// Durably records a redemption.
    ///
    /// # Errors
    ///
    /// - [`HavenError::AlreadyRedeemed`] if `code` was redeemed before.
    /// - [`HavenError::PersistenceUnavailable`] if the write fails. The code
    ///   stays unredeemed.
    pub fn record_redemption(&mut self, code: &str, redemption: Redemption) -> HavenResult<()> {
        if self.is_redeemed(code) {
            return Err(HavenError::AlreadyRedeemed { code: code.to_string() });
        }
        let mut next = self.state.clone();
        next.redeemed.insert(code.to_string(), redemption);
        save_json(self.store, TOKENS_KEY, &next)?;
        *self.state = next;
        Ok(())
    }

    /// Durably removes a redemption whose payout could not be written.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::PersistenceUnavailable`] if the write fails. The
    /// redemption then stays recorded and the token stays spent.
    pub fn revoke_redemption(&mut self, code: &str) -> HavenResult<()> {
        if !self.is_redeemed(code) {
            return Ok(());
        }
        let mut next = self.state.clone();
        next.redeemed.remove(code);
        save_json(self.store, TOKENS_KEY, &next)?;
        *self.state = next;
        Ok(())
    }

    /// Durably adds issued tokens.
    ///
    /// # Errors
    ///
    /// - [`HavenError::InvalidRequest`] if a code already exists.
    /// - [`HavenError::PersistenceUnavailable`] if the write fails. Nothing is issued.
    pub fn issue(&mut self, tokens: &[IssuedToken]) -> HavenResult<()> {
        let mut next = self.state.clone();
        for token in tokens {
            if next.issued.contains_key(&token.code) || next.redeemed.contains_key(&token.code) {
                return Err(HavenError::invalid(format!("token {} already exists", token.code)));
            }
            next.issued.insert(token.code.clone(), token.clone());
        }
        save_json(self.store, TOKENS_KEY, &next)?;
        *self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FlakyStore, MemoryStore};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn admin() -> AccountId {
        AccountId::new("admin@haven.local").unwrap()
    }

    fn redemption(amount: u64) -> Redemption {
        Redemption {
            account: AccountId::new("alice").unwrap(),
            amount,
            redeemed_at: 0,
        }
    }

    #[test]
    fn test_token_format() {
        assert!(is_valid_token_format("WELCOME100", 6, 32));
        assert!(!is_valid_token_format("welcome100", 6, 32));
        assert!(!is_valid_token_format("ABC", 6, 32));
        assert!(!is_valid_token_format("BONUS-200", 6, 32));
    }

    #[test]
    fn test_generate_code_shape() {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let code = generate_code("BONUS", 8, &mut rng);
        assert_eq!(code.len(), 13);
        assert!(code.starts_with("BONUS"));
        assert!(is_valid_token_format(&code, 6, 32));
    }

    #[test]
    fn test_redemption_is_global_once() {
        let book = TokenBook::open(Arc::new(MemoryStore::new())).unwrap();
        let mut guard = book.lock();
        guard.record_redemption("WELCOME100", redemption(100)).unwrap();
        let err = guard.record_redemption("WELCOME100", redemption(100)).unwrap_err();
        assert_eq!(err, HavenError::AlreadyRedeemed { code: "WELCOME100".to_string() });
        drop(guard);
        assert_eq!(book.redeemed_count(), 1);
    }

    #[test]
    fn test_book_survives_reopen() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        {
            let book = TokenBook::open(Arc::clone(&store)).unwrap();
            let mut guard = book.lock();
            guard
                .issue(&[IssuedToken { code: "PROMOABCD1234".into(), value: 300, issued_by: admin(), issued_at: 1 }])
                .unwrap();
            guard.record_redemption("BONUS200", redemption(200)).unwrap();
        }
        let book = TokenBook::open(store).unwrap();
        assert!(book.is_redeemed("BONUS200"));
        assert_eq!(book.lock().issued_value("PROMOABCD1234"), Some(300));
    }

    #[test]
    fn test_revoke_after_failed_payout() {
        let book = TokenBook::open(Arc::new(MemoryStore::new())).unwrap();
        let mut guard = book.lock();
        guard.record_redemption("FREECOIN50", redemption(50)).unwrap();
        guard.revoke_redemption("FREECOIN50").unwrap();
        assert!(!guard.is_redeemed("FREECOIN50"));
    }

    #[test]
    fn test_failed_write_leaves_code_unredeemed() {
        let flaky = Arc::new(FlakyStore::new(MemoryStore::new()));
        let book = TokenBook::open(flaky.clone()).unwrap();
        flaky.set_fail_writes(true);
        let mut guard = book.lock();
        assert!(guard.record_redemption("WELCOME100", redemption(100)).is_err());
        assert!(!guard.is_redeemed("WELCOME100"));
    }

    #[test]
    fn test_issue_rejects_duplicates() {
        let book = TokenBook::open(Arc::new(MemoryStore::new())).unwrap();
        let token = IssuedToken { code: "DUPE12345678".into(), value: 10, issued_by: admin(), issued_at: 0 };
        let mut guard = book.lock();
        guard.issue(std::slice::from_ref(&token)).unwrap();
        assert!(guard.issue(&[token]).is_err());
        assert_eq!(guard.issued_value("DUPE12345678"), Some(10));
    }

    #[test]
    fn test_csv_export() {
        let tokens = vec![
            IssuedToken { code: "AAA111".into(), value: 10, issued_by: admin(), issued_at: 0 },
            IssuedToken { code: "BBB222".into(), value: 20, issued_by: admin(), issued_at: 0 },
        ];
        assert_eq!(tokens_to_csv(&tokens), "token,value\nAAA111,10\nBBB222,20\n");
    }
}
