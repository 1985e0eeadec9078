//! # Haven Economy
//!
//! Coin economy for a gacha reward site: a shared pool of credential records
//! handed out by random draw, paid for in coins earned through streaks,
//! quests, referrals, and tokens.
//!
//! ## Design Principles
//!
//! 1. **No double allocation** - A record leaves the pool once, ever, across every account
//! 2. **At-most-once rewards** - Every grant key pays at most once per account
//! 3. **Persist before commit** - State changes in memory only after the store accepted them
//! 4. **External configuration** - All balance data in one TOML file
//!
//! ## Thread Safety
//!
//! [`Haven`] is `Send + Sync`. Pulls serialize on the pool; everything else
//! serializes per account or on the token book.
//!
//! ## Example
//!
//! ```rust,ignore
//! use haven_economy::{AccountId, FileSource, FileStore, Haven, HavenConfig};
//! use std::sync::Arc;
//!
//! let config = HavenConfig::from_toml_file("data/haven.toml")?;
//! let store = Arc::new(FileStore::open("state")?);
//! let (haven, report) = Haven::builder(config)
//!     .store(store)
//!     .open(&FileSource::new("data/pool.txt"))?;
//!
//! let alice = AccountId::new("alice@example.com")?;
//! haven.open_account(&alice)?;
//! let pull = haven.pull_gacha(&alice, "rare")?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod account;
pub mod allocator;
pub mod config;
pub mod error;
pub mod history;
pub mod ledger;
pub mod pool;
pub mod rewards;
pub mod store;
pub mod tokens;

pub use account::{Account, AccountId, GrantKey, StreakState};
pub use allocator::Allocator;
pub use config::{CoinPackage, HavenConfig, QuestConfig, TierConfig};
pub use error::{HavenError, HavenResult};
pub use history::{AllocationBatch, History, HistoryEntry, HistoryEvent};
pub use ledger::Ledger;
pub use pool::{FileSource, InlineSource, LoadReport, PoolSource, PoolStore, Record, RecordIndex};
pub use rewards::Reward;
pub use store::{FileStore, FlakyStore, KeyValueStore, MemoryStore};
pub use tokens::{tokens_to_csv, IssuedToken, Redemption, TokenBook};
pub mod service;

pub use service::{
    AllocationResult, ClaimResult, Clock, Haven, HavenBuilder, HavenStats, ManualClock, PurchaseHandoff,
    QuestStatus, SystemClock,
};
