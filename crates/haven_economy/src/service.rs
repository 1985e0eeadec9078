//! # Haven Service
//!
//! **The single point of contact for every caller.**
//!
//! Presentation code (pages, forms, dashboards) calls in here and renders
//! whatever comes back. Each operation takes the acting account explicitly;
//! there is no ambient "current user".
//!
//! ## The Golden Path: Gacha Pull
//!
//! ```text
//! pull_gacha(account, tier)
//!        │
//!        ▼
//!   Ledger::purchase ── debit fails? ──> InsufficientFunds (nothing drawn)
//!        │
//!        ▼
//!   Allocator::allocate ── pool short? ──> refund, InsufficientSupply
//!        │
//!        ▼
//!   History::append (best effort)
//!        │
//!        ▼
//!   AllocationResult
//! ```
//!
//! ## Lock Order
//!
//! token book -> referral index -> account. The pool lock and an account
//! lock are never held together.

use crate::account::{Account, AccountId, GrantKey};
use crate::allocator::Allocator;
use crate::config::{CoinPackage, HavenConfig, QuestConfig, TierConfig};
use crate::error::{HavenError, HavenResult};
use crate::history::{AllocationBatch, History, HistoryEntry, HistoryEvent};
use crate::ledger::Ledger;
use crate::pool::{LoadReport, PoolSource, PoolStore, Record};
use crate::rewards::{self, epoch_day, Reward};
use crate::store::{load_json, save_json, KeyValueStore, MemoryStore};
use crate::tokens::{generate_code, IssuedToken, Redemption, TokenBook};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Attempts at finding a collision-free referral code before giving up.
const MAX_REFERRAL_ATTEMPTS: u32 = 16;

/// Draws allowed per requested token before issuance gives up.
const CODE_ATTEMPTS_PER_TOKEN: usize = 64;

/// Longest referral code accepted for lookup.
const MAX_REFERRAL_CODE_LEN: usize = 32;

// ============================================================================
// Clock
// ============================================================================

/// Source of the current time in Unix seconds.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now(&self) -> u64;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    /// Starts at `unix_secs`.
    pub fn new(unix_secs: u64) -> Self {
        Self(AtomicU64::new(unix_secs))
    }

    /// Jumps to `unix_secs`.
    pub fn set(&self, unix_secs: u64) {
        self.0.store(unix_secs, Ordering::SeqCst);
    }

    /// Moves forward by whole days.
    pub fn advance_days(&self, days: u64) {
        self.0.fetch_add(days * rewards::SECONDS_PER_DAY, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of a successful gacha pull.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationResult {
    /// Tier pulled.
    pub tier: String,
    /// Coins paid.
    pub cost: u64,
    /// Records drawn. Order carries no meaning.
    pub records: Vec<Record>,
    /// Balance after the pull.
    pub balance: u64,
}

/// Outcome of a successful reward claim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimResult {
    /// Grant key now satisfied.
    pub key: GrantKey,
    /// Coins paid.
    pub amount: u64,
    /// Balance after the claim.
    pub balance: u64,
}

/// A quest and whether this account completed it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuestStatus {
    /// Quest definition.
    pub quest: QuestConfig,
    /// Already paid out.
    pub completed: bool,
}

/// Where to send a buyer for a coin package.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurchaseHandoff {
    /// Package requested.
    pub package: CoinPackage,
    /// Prefilled message.
    pub message: String,
    /// Messaging link carrying the message.
    pub url: String,
}

/// Dashboard statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HavenStats {
    /// Accounts created since startup.
    pub accounts_opened: u64,
    /// Successful pulls since startup.
    pub pulls: u64,
    /// Coins spent on pulls since startup.
    pub coins_spent: u64,
    /// Grants paid since startup.
    pub grants_paid: u64,
    /// Records in the pool.
    pub records_total: usize,
    /// Records still available.
    pub records_available: usize,
    /// Admin-issued tokens.
    pub tokens_issued: usize,
    /// Tokens redeemed, any kind.
    pub tokens_redeemed: usize,
}

#[derive(Default)]
struct Counters {
    accounts_opened: AtomicU64,
    pulls: AtomicU64,
    coins_spent: AtomicU64,
    grants_paid: AtomicU64,
}

// ============================================================================
// Builder
// ============================================================================

/// Configures and opens a [`Haven`].
pub struct HavenBuilder {
    config: HavenConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    seed: Option<u64>,
}

impl HavenBuilder {
    /// Durable store. Defaults to a [`MemoryStore`].
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Time source. Defaults to [`SystemClock`].
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Fixes the RNG seed for draws and token codes. Tests only.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validates the config, fetches the pool, and restores persisted state.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::InvalidConfig`] for a bad config or unreadable
    /// source, or [`HavenError::PersistenceUnavailable`] if the store cannot be
    /// read.
    pub fn open(self, source: &dyn PoolSource) -> HavenResult<(Haven, LoadReport)> {
        self.config.validate()?;

        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let (pool, report) = PoolStore::open(source, &self.config.pool.delimiter, Arc::clone(&store))?;
        let tokens = TokenBook::open(Arc::clone(&store))?;
        let ledger = Ledger::new(Arc::clone(&store));
        let history = History::new(Arc::clone(&store), self.config.history.limit);

        let (allocator, issuance_rng) = match self.seed {
            Some(seed) => (Allocator::with_seed(seed), ChaCha20Rng::seed_from_u64(seed.wrapping_add(1))),
            None => (Allocator::new(), ChaCha20Rng::from_entropy()),
        };

        let haven = Haven {
            config: self.config,
            store,
            pool,
            allocator,
            ledger,
            tokens,
            history,
            clock,
            issuance_rng: Mutex::new(issuance_rng),
            referral_index: Mutex::new(()),
            counters: Counters::default(),
        };
        Ok((haven, report))
    }
}

// ============================================================================
// Haven
// ============================================================================

/// The caller-facing economy.
///
/// `Haven` is `Send + Sync` and meant to be shared behind an `Arc`.
pub struct Haven {
    config: HavenConfig,
    store: Arc<dyn KeyValueStore>,
    pool: PoolStore,
    allocator: Allocator,
    ledger: Ledger,
    tokens: TokenBook,
    history: History,
    clock: Arc<dyn Clock>,
    issuance_rng: Mutex<ChaCha20Rng>,
    /// Serializes check-then-write on the referral code index.
    referral_index: Mutex<()>,
    counters: Counters,
}

impl Haven {
    /// Starts configuring a service.
    pub fn builder(config: HavenConfig) -> HavenBuilder {
        HavenBuilder {
            config,
            store: None,
            clock: None,
            seed: None,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &HavenConfig {
        &self.config
    }

    /// The underlying ledger.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The shared pool.
    pub fn pool(&self) -> &PoolStore {
        &self.pool
    }

    /// Configured gacha tiers.
    pub fn tiers(&self) -> &[TierConfig] {
        &self.config.tiers.0
    }

    // ------------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------------

    /// Logs an account in, creating it with its starting balance on first login.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::PersistenceUnavailable`] if a new account could not be written.
    pub fn open_account(&self, id: &AccountId) -> HavenResult<Account> {
        let is_admin = self.config.is_admin(id.as_str());
        let starting = if is_admin {
            self.config.accounts.admin_starting_balance
        } else {
            self.config.accounts.starting_balance
        };

        let (account, created) = self.ledger.open_account(id, starting, is_admin, self.clock.now())?;
        if created {
            self.counters.accounts_opened.fetch_add(1, Ordering::Relaxed);
        }
        Ok(account)
    }

    /// Current balance.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::UnknownAccount`] if the account was never opened.
    pub fn balance(&self, id: &AccountId) -> HavenResult<u64> {
        self.ledger.balance(id)
    }

    /// Recent activity, most recent first.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::PersistenceUnavailable`] if the log cannot be read.
    pub fn history(&self, id: &AccountId) -> HavenResult<Vec<HistoryEntry>> {
        self.history.recent(id)
    }

    /// Recent token redemptions as `(at, code, amount)`, most recent first.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::PersistenceUnavailable`] if the log cannot be read.
    pub fn recent_redemptions(&self, id: &AccountId) -> HavenResult<Vec<(u64, String, u64)>> {
        self.history.recent_redemptions(id)
    }

    // ------------------------------------------------------------------------
    // Gacha
    // ------------------------------------------------------------------------

    /// Pays for a tier and draws its records.
    ///
    /// # Errors
    ///
    /// - [`HavenError::UnknownTier`] for an unconfigured tier.
    /// - [`HavenError::InsufficientFunds`]. Nothing drawn.
    /// - [`HavenError::InsufficientSupply`]. Cost refunded.
    /// - [`HavenError::PersistenceUnavailable`]. Nothing drawn, nothing charged.
    pub fn pull_gacha(&self, id: &AccountId, tier: &str) -> HavenResult<AllocationResult> {
        let tier = self
            .config
            .tier(tier)
            .ok_or_else(|| HavenError::UnknownTier(tier.to_string()))?;
        let cost = i64::try_from(tier.price)
            .map_err(|_| HavenError::InvalidConfig(format!("tier {} price too large", tier.name)))?;

        let (records, balance) = self.ledger.purchase(id, cost, || {
            self.allocator.allocate(&self.pool, i64::from(tier.records_per_pull))
        })?;

        self.counters.pulls.fetch_add(1, Ordering::Relaxed);
        self.counters.coins_spent.fetch_add(tier.price, Ordering::Relaxed);
        tracing::info!(account = %id, tier = %tier.name, cost = tier.price, drawn = records.len(), "gacha pull");

        self.history.append(
            id,
            HistoryEntry {
                at: self.clock.now(),
                event: HistoryEvent::Allocation(AllocationBatch {
                    tier: tier.name.clone(),
                    cost: tier.price,
                    records: records.clone(),
                }),
            },
        );

        Ok(AllocationResult {
            tier: tier.name.clone(),
            cost: tier.price,
            records,
            balance,
        })
    }

    /// Recent gacha pulls as `(at, batch)`, most recent first.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::PersistenceUnavailable`] if the log cannot be read.
    pub fn recent_pulls(&self, id: &AccountId) -> HavenResult<Vec<(u64, AllocationBatch)>> {
        self.history.recent_allocations(id)
    }

    // ------------------------------------------------------------------------
    // Rewards
    // ------------------------------------------------------------------------

    /// Claims today's daily streak reward.
    ///
    /// # Errors
    ///
    /// - [`HavenError::AlreadyClaimed`] if today was already claimed.
    /// - [`HavenError::PersistenceUnavailable`]. Nothing paid, still claimable.
    pub fn claim_streak(&self, id: &AccountId) -> HavenResult<ClaimResult> {
        let today = epoch_day(self.clock.now());
        let config = &self.config.streak;

        let result = self.ledger.apply(id, |account| {
            let (reward, next) = rewards::streak_reward(account.streak, today, config)?;
            let result = Self::pay_into(account, &reward)?;
            account.streak = next;
            Ok(result)
        })?;

        self.on_paid(id, &result);
        Ok(result)
    }

    /// Pays a quest's reward once.
    ///
    /// # Errors
    ///
    /// - [`HavenError::InvalidRequest`] for an unknown quest.
    /// - [`HavenError::AlreadyClaimed`] if already completed.
    pub fn complete_quest(&self, id: &AccountId, quest_id: &str) -> HavenResult<ClaimResult> {
        let reward = rewards::quest_reward(quest_id, &self.config.quests)?;
        let result = self.ledger.apply(id, |account| Self::pay_into(account, &reward))?;
        self.on_paid(id, &result);
        Ok(result)
    }

    /// Every quest with this account's completion state.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::UnknownAccount`] if the account was never opened.
    pub fn quests(&self, id: &AccountId) -> HavenResult<Vec<QuestStatus>> {
        let account = self.ledger.account(id)?;
        Ok(self
            .config
            .quests
            .0
            .iter()
            .map(|quest| QuestStatus {
                completed: account.has_grant(&GrantKey::quest(&quest.id)),
                quest: quest.clone(),
            })
            .collect())
    }

    /// Redeems a token. The first redeemer across all accounts wins.
    ///
    /// # Errors
    ///
    /// - [`HavenError::AlreadyRedeemed`] if anyone redeemed it before.
    /// - [`HavenError::InvalidRequest`] for a malformed or unknown token.
    /// - [`HavenError::PersistenceUnavailable`]. Nothing paid, token still redeemable.
    pub fn redeem_token(&self, id: &AccountId, code: &str) -> HavenResult<ClaimResult> {
        let code = code.trim();
        // Fail on unknown accounts before the token is touched.
        self.ledger.balance(id)?;

        let mut book = self.tokens.lock();
        if book.is_redeemed(code) {
            return Err(HavenError::AlreadyRedeemed { code: code.to_string() });
        }

        let reward = rewards::token_reward(code, book.issued_value(code), &self.config.tokens)?;
        let now = self.clock.now();
        book.record_redemption(
            code,
            Redemption {
                account: id.clone(),
                amount: reward.amount,
                redeemed_at: now,
            },
        )?;

        match self.ledger.apply(id, |account| Self::pay_into(account, &reward)) {
            Ok(result) => {
                drop(book);
                self.on_paid(id, &result);
                self.history.append(
                    id,
                    HistoryEntry {
                        at: now,
                        event: HistoryEvent::TokenRedeemed {
                            code: code.to_string(),
                            amount: reward.amount,
                        },
                    },
                );
                Ok(result)
            }
            // The account already holds this token's key: keep the token spent.
            Err(HavenError::AlreadyClaimed { .. }) => Err(HavenError::AlreadyRedeemed { code: code.to_string() }),
            Err(err) => {
                if let Err(revoke) = book.revoke_redemption(code) {
                    tracing::error!(account = %id, code, "token spent without payout: {err}; revoke failed: {revoke}");
                }
                Err(err)
            }
        }
    }

    /// This account's referral code, generated on first request.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::UnknownAccount`] or [`HavenError::PersistenceUnavailable`].
    pub fn referral_code(&self, id: &AccountId) -> HavenResult<String> {
        if let Some(code) = self.ledger.account(id)?.referral_code {
            return Ok(code);
        }

        let _index = self.referral_index.lock();
        let mut chosen = None;
        for attempt in 0..MAX_REFERRAL_ATTEMPTS {
            let code = rewards::referral_code(id, attempt, &self.config.referral);
            match self.referral_owner(&code)? {
                Some(owner) if owner != *id => continue,
                Some(_) => {}
                None => save_json(self.store.as_ref(), &Self::referral_key(&code), id)?,
            }
            chosen = Some(code);
            break;
        }
        let code = chosen.ok_or_else(|| {
            HavenError::InvalidConfig("referral code space exhausted, change referral.secret".to_string())
        })?;

        self.ledger
            .apply(id, |account| Ok(account.referral_code.get_or_insert(code).clone()))
    }

    /// Redeems another account's referral code. One referral per account.
    ///
    /// # Errors
    ///
    /// - [`HavenError::InvalidRequest`] for a malformed or unknown code, or one's own code.
    /// - [`HavenError::AlreadyClaimed`] if this account already used a referral.
    pub fn redeem_referral(&self, id: &AccountId, code: &str) -> HavenResult<ClaimResult> {
        let code = code.trim();
        if code.is_empty() || code.len() > MAX_REFERRAL_CODE_LEN || !code.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(HavenError::invalid("referral code is malformed"));
        }
        let owner = self
            .referral_owner(code)?
            .ok_or_else(|| HavenError::invalid(format!("unknown referral code {code:?}")))?;
        if owner == *id {
            return Err(HavenError::invalid("cannot redeem your own referral code"));
        }

        let reward = rewards::referral_reward(code, &self.config.referral);
        let result = self.ledger.apply(id, |account| {
            if account.redeemed_referral.is_some() {
                return Err(HavenError::AlreadyClaimed { key: reward.key.as_str().to_string() });
            }
            let result = Self::pay_into(account, &reward)?;
            account.redeemed_referral = Some(code.to_string());
            Ok(result)
        })?;

        self.on_paid(id, &result);
        Ok(result)
    }

    // ------------------------------------------------------------------------
    // Admin
    // ------------------------------------------------------------------------

    /// Issues `count` new tokens worth `value` each, named `PREFIX` + random base-36.
    ///
    /// # Errors
    ///
    /// - [`HavenError::InvalidRequest`] for non-admins or out-of-range input.
    /// - [`HavenError::PersistenceUnavailable`]. Nothing issued.
    pub fn generate_tokens(
        &self,
        admin: &AccountId,
        prefix: &str,
        count: u32,
        value: u64,
    ) -> HavenResult<Vec<IssuedToken>> {
        self.require_admin(admin)?;

        let issuance = &self.config.issuance;
        let format = &self.config.tokens;
        if count == 0 || count > issuance.max_count {
            return Err(HavenError::invalid(format!("token count must be in 1..={}", issuance.max_count)));
        }
        if !(issuance.min_value..=issuance.max_value).contains(&value) {
            return Err(HavenError::invalid(format!(
                "token value must be in {}..={}",
                issuance.min_value, issuance.max_value
            )));
        }

        let prefix = prefix.trim().to_ascii_uppercase();
        let code_len = prefix.len() + issuance.random_len;
        if !prefix.bytes().all(|b| b.is_ascii_alphanumeric()) || !(format.min_len..=format.max_len).contains(&code_len) {
            return Err(HavenError::invalid(format!("prefix {prefix:?} does not yield a valid token")));
        }

        let now = self.clock.now();
        let mut book = self.tokens.lock();
        let mut rng = self.issuance_rng.lock();
        let mut fresh = HashSet::new();
        let wanted = count as usize;
        let mut issued = Vec::with_capacity(wanted);

        for _ in 0..wanted * CODE_ATTEMPTS_PER_TOKEN {
            if issued.len() == wanted {
                break;
            }
            let code = generate_code(&prefix, issuance.random_len, &mut *rng);
            let taken = format.fixed.contains_key(&code) || book.is_issued(&code) || book.is_redeemed(&code);
            if taken || !fresh.insert(code.clone()) {
                continue;
            }
            issued.push(IssuedToken {
                code,
                value,
                issued_by: admin.clone(),
                issued_at: now,
            });
        }
        if issued.len() < wanted {
            tracing::warn!(admin = %admin, prefix = %prefix, wanted, found = issued.len(), "token code space exhausted");
            return Err(HavenError::invalid(format!(
                "token code space exhausted for prefix {prefix:?}, use a longer prefix"
            )));
        }

        book.issue(&issued)?;
        tracing::info!(admin = %admin, count, value, prefix = %prefix, "tokens issued");
        Ok(issued)
    }

    /// Dashboard statistics. Admin only.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::InvalidRequest`] for non-admins.
    pub fn stats(&self, viewer: &AccountId) -> HavenResult<HavenStats> {
        self.require_admin(viewer)?;
        Ok(HavenStats {
            accounts_opened: self.counters.accounts_opened.load(Ordering::Relaxed),
            pulls: self.counters.pulls.load(Ordering::Relaxed),
            coins_spent: self.counters.coins_spent.load(Ordering::Relaxed),
            grants_paid: self.counters.grants_paid.load(Ordering::Relaxed),
            records_total: self.pool.len(),
            records_available: self.pool.available_count(),
            tokens_issued: self.tokens.issued_count(),
            tokens_redeemed: self.tokens.redeemed_count(),
        })
    }

    // ------------------------------------------------------------------------
    // Coin purchases
    // ------------------------------------------------------------------------

    /// Builds the messaging link a buyer follows to purchase a coin package.
    ///
    /// No payment happens here; coins are credited by an operator afterwards.
    ///
    /// # Errors
    ///
    /// - [`HavenError::InvalidRequest`] for an unknown package.
    /// - [`HavenError::InvalidConfig`] if the handoff base URL is malformed.
    pub fn purchase_handoff(&self, id: &AccountId, package_id: &str) -> HavenResult<PurchaseHandoff> {
        let handoff = &self.config.handoff;
        let package = handoff
            .packages
            .iter()
            .find(|p| p.id == package_id)
            .ok_or_else(|| HavenError::invalid(format!("unknown coin package {package_id:?}")))?;

        let message = format!(
            "Hello, I would like to buy {} coins ({}) for account {id}.",
            package.coins, package.price_label
        );
        let base = format!("{}{}", handoff.base_url, handoff.contact);
        let url = url::Url::parse_with_params(&base, &[("text", message.as_str())])
            .map_err(|e| HavenError::InvalidConfig(format!("handoff url {base:?}: {e}")))?;

        Ok(PurchaseHandoff {
            package: package.clone(),
            message,
            url: url.into(),
        })
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn pay_into(account: &mut Account, reward: &Reward) -> HavenResult<ClaimResult> {
        if !account.apply_grant(&reward.key, reward.amount)? {
            return Err(HavenError::AlreadyClaimed { key: reward.key.as_str().to_string() });
        }
        Ok(ClaimResult {
            key: reward.key.clone(),
            amount: reward.amount,
            balance: account.balance,
        })
    }

    fn on_paid(&self, id: &AccountId, result: &ClaimResult) {
        self.counters.grants_paid.fetch_add(1, Ordering::Relaxed);
        tracing::info!(account = %id, key = %result.key, amount = result.amount, "reward claimed");
    }

    fn require_admin(&self, id: &AccountId) -> HavenResult<()> {
        if self.ledger.account(id)?.is_admin {
            Ok(())
        } else {
            Err(HavenError::invalid(format!("{id} is not an admin")))
        }
    }

    fn referral_key(code: &str) -> String {
        format!("referral-code:{code}")
    }

    fn referral_owner(&self, code: &str) -> HavenResult<Option<AccountId>> {
        load_json(self.store.as_ref(), &Self::referral_key(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::InlineSource;

    fn haven(records: usize) -> (Haven, Arc<ManualClock>) {
        let text: String = (1..=records).map(|i| format!("alt{i}@mail.test:pw{i}\n")).collect();
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let (haven, _) = Haven::builder(HavenConfig::default())
            .clock(clock.clone())
            .seed(99)
            .open(&InlineSource(text))
            .unwrap();
        (haven, clock)
    }

    fn user(name: &str) -> AccountId {
        AccountId::new(name).unwrap()
    }

    #[test]
    fn test_first_login_balances() {
        let (haven, _) = haven(1);
        assert_eq!(haven.open_account(&user("alice")).unwrap().balance, 500);
        let admin = haven.open_account(&user("admin@haven.local")).unwrap();
        assert!(admin.is_admin);
        assert_eq!(admin.balance, 9999);
    }

    #[test]
    fn test_pull_charges_and_draws() {
        let (haven, _) = haven(10);
        let alice = user("alice");
        haven.open_account(&alice).unwrap();

        let result = haven.pull_gacha(&alice, "Rare").unwrap();
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.balance, 400);
        assert_eq!(haven.recent_pulls(&alice).unwrap().len(), 1);
    }

    #[test]
    fn test_pull_unknown_tier() {
        let (haven, _) = haven(10);
        let alice = user("alice");
        haven.open_account(&alice).unwrap();
        assert!(matches!(haven.pull_gacha(&alice, "ultra"), Err(HavenError::UnknownTier(_))));
        assert_eq!(haven.balance(&alice).unwrap(), 500);
    }

    #[test]
    fn test_pull_exhausted_pool_refunds() {
        let (haven, _) = haven(1);
        let alice = user("alice");
        haven.open_account(&alice).unwrap();

        let err = haven.pull_gacha(&alice, "rare").unwrap_err();
        assert_eq!(err, HavenError::InsufficientSupply { requested: 2, available: 1 });
        assert_eq!(haven.balance(&alice).unwrap(), 500);
        assert_eq!(haven.pool().available_count(), 1);
    }

    #[test]
    fn test_streak_progression() {
        let (haven, clock) = haven(1);
        let alice = user("alice");
        haven.open_account(&alice).unwrap();

        assert_eq!(haven.claim_streak(&alice).unwrap().amount, 50);
        clock.advance_days(1);
        assert_eq!(haven.claim_streak(&alice).unwrap().amount, 100);
        clock.advance_days(1);
        let third = haven.claim_streak(&alice).unwrap();
        assert_eq!(third.amount, 150);

        let err = haven.claim_streak(&alice).unwrap_err();
        assert!(matches!(err, HavenError::AlreadyClaimed { .. }));
        assert_eq!(haven.balance(&alice).unwrap(), third.balance);
    }

    #[test]
    fn test_quest_once() {
        let (haven, _) = haven(1);
        let alice = user("alice");
        haven.open_account(&alice).unwrap();

        assert_eq!(haven.complete_quest(&alice, "3").unwrap().balance, 700);
        assert!(matches!(haven.complete_quest(&alice, "3"), Err(HavenError::AlreadyClaimed { .. })));
        assert!(matches!(haven.complete_quest(&alice, "nope"), Err(HavenError::InvalidRequest(_))));

        let statuses = haven.quests(&alice).unwrap();
        assert!(statuses.iter().find(|s| s.quest.id == "3").unwrap().completed);
        assert!(!statuses.iter().find(|s| s.quest.id == "1").unwrap().completed);
    }

    #[test]
    fn test_referral_flow() {
        let (haven, _) = haven(1);
        let (alice, bob, carol) = (user("alice"), user("bob"), user("carol"));
        for id in [&alice, &bob, &carol] {
            haven.open_account(id).unwrap();
        }

        let code = haven.referral_code(&alice).unwrap();
        assert_eq!(code, haven.referral_code(&alice).unwrap());

        assert!(matches!(haven.redeem_referral(&alice, &code), Err(HavenError::InvalidRequest(_))));
        assert!(matches!(haven.redeem_referral(&bob, "REFNOPE0000"), Err(HavenError::InvalidRequest(_))));
        assert!(matches!(haven.redeem_referral(&bob, ""), Err(HavenError::InvalidRequest(_))));
        assert!(matches!(haven.redeem_referral(&bob, &"R".repeat(4096)), Err(HavenError::InvalidRequest(_))));

        assert_eq!(haven.redeem_referral(&bob, &code).unwrap().amount, 100);
        assert!(matches!(haven.redeem_referral(&bob, &code), Err(HavenError::AlreadyClaimed { .. })));

        // One referral per account, whoever the referrer is.
        let carol_code = haven.referral_code(&carol).unwrap();
        assert!(matches!(haven.redeem_referral(&bob, &carol_code), Err(HavenError::AlreadyClaimed { .. })));
    }

    #[test]
    fn test_token_first_redeemer_wins() {
        let (haven, _) = haven(1);
        let (alice, bob) = (user("alice"), user("bob"));
        haven.open_account(&alice).unwrap();
        haven.open_account(&bob).unwrap();

        assert_eq!(haven.redeem_token(&alice, "WELCOME100").unwrap().balance, 600);
        let err = haven.redeem_token(&bob, "WELCOME100").unwrap_err();
        assert_eq!(err, HavenError::AlreadyRedeemed { code: "WELCOME100".to_string() });
        assert_eq!(haven.balance(&bob).unwrap(), 500);
        assert_eq!(haven.recent_redemptions(&alice).unwrap()[0].1, "WELCOME100");
    }

    #[test]
    fn test_redeem_token_unknown_account_does_not_spend_token() {
        let (haven, _) = haven(1);
        let ghost = user("ghost");
        assert!(matches!(haven.redeem_token(&ghost, "BONUS200"), Err(HavenError::UnknownAccount(_))));

        let alice = user("alice");
        haven.open_account(&alice).unwrap();
        assert_eq!(haven.redeem_token(&alice, "BONUS200").unwrap().amount, 200);
    }

    #[test]
    fn test_admin_token_generation() {
        let (haven, _) = haven(1);
        let admin = user("admin@haven.local");
        let alice = user("alice");
        haven.open_account(&admin).unwrap();
        haven.open_account(&alice).unwrap();

        assert!(matches!(
            haven.generate_tokens(&alice, "BONUS", 5, 100),
            Err(HavenError::InvalidRequest(_))
        ));
        assert!(haven.generate_tokens(&admin, "BONUS", 0, 100).is_err());
        assert!(haven.generate_tokens(&admin, "BONUS", 5, 5).is_err());

        let tokens = haven.generate_tokens(&admin, "promo", 5, 300).unwrap();
        assert_eq!(tokens.len(), 5);
        assert!(tokens.iter().all(|t| t.code.starts_with("PROMO") && t.code.len() == 13));

        let paid = haven.redeem_token(&alice, &tokens[0].code).unwrap();
        assert_eq!(paid.amount, 300);

        let stats = haven.stats(&admin).unwrap();
        assert_eq!(stats.tokens_issued, 5);
        assert_eq!(stats.tokens_redeemed, 1);
        assert!(haven.stats(&alice).is_err());
    }

    #[test]
    fn test_token_generation_stops_when_code_space_runs_out() {
        let mut config = HavenConfig::default();
        config.issuance.random_len = 1;
        config.issuance.max_count = 36;
        let (haven, _) = Haven::builder(config)
            .seed(7)
            .open(&InlineSource("alt1@mail.test:pw1\n".to_string()))
            .unwrap();
        let admin = user("admin@haven.local");
        haven.open_account(&admin).unwrap();

        assert_eq!(haven.generate_tokens(&admin, "BONUS", 30, 100).unwrap().len(), 30);
        let err = haven.generate_tokens(&admin, "BONUS", 30, 100).unwrap_err();
        assert!(matches!(err, HavenError::InvalidRequest(ref msg) if msg.contains("exhausted")));
        assert_eq!(haven.stats(&admin).unwrap().tokens_issued, 30);
    }

    #[test]
    fn test_admin_match_is_exact() {
        let (haven, _) = haven(1);
        let shadow = haven.open_account(&user("ADMIN@haven.local")).unwrap();
        assert!(!shadow.is_admin);
        assert_eq!(shadow.balance, 500);
        assert!(haven.stats(&user("ADMIN@haven.local")).is_err());
    }

    #[test]
    fn test_purchase_handoff_link() {
        let (haven, _) = haven(1);
        let alice = user("alice");
        let handoff = haven.purchase_handoff(&alice, "small").unwrap();
        assert_eq!(handoff.package.coins, 500);
        assert!(handoff.url.starts_with("https://wa.me/0000000000?text="));
        assert!(handoff.message.contains("alice"));
        assert!(haven.purchase_handoff(&alice, "huge").is_err());
    }
}
