//! # Economy Configuration
//!
//! All balance data lives in one TOML file, loaded once at startup.
//! Every section has defaults, so an empty file is a valid configuration.
//!
//! ```toml
//! [accounts]
//! starting_balance = 500
//! admins = ["admin@haven.local"]
//!
//! [[tiers]]
//! name = "common"
//! price = 50
//! records_per_pull = 1
//! chance_bp = 2000
//!
//! [[quests]]
//! id = "1"
//! title = "Follow on TikTok"
//! reward = 100
//! ```

use crate::error::{HavenError, HavenResult};
use crate::tokens::is_valid_token_format;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HavenConfig {
    /// Pool source parsing.
    pub pool: PoolConfig,
    /// Account creation.
    pub accounts: AccountConfig,
    /// Gacha case types.
    pub tiers: TierList,
    /// Daily streak rewards.
    pub streak: StreakConfig,
    /// Quest catalog.
    pub quests: QuestList,
    /// Referral rewards.
    pub referral: ReferralConfig,
    /// Token redemption.
    pub tokens: TokenConfig,
    /// Admin token issuance bounds.
    pub issuance: IssuanceConfig,
    /// History log bounds.
    pub history: HistoryConfig,
    /// Coin purchase handoff.
    pub handoff: HandoffConfig,
}

impl HavenConfig {
    /// Loads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::InvalidConfig`] if the file cannot be read,
    /// parsed, or fails validation.
    pub fn from_toml_file(path: impl AsRef<Path>) -> HavenResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| HavenError::InvalidConfig(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Parses and validates TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::InvalidConfig`] on parse or validation failure.
    pub fn from_toml_str(text: &str) -> HavenResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| HavenError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::InvalidConfig`] describing the first violation.
    pub fn validate(&self) -> HavenResult<()> {
        let bad = |msg: String| Err(HavenError::InvalidConfig(msg));

        if self.pool.delimiter.is_empty() {
            return bad("pool.delimiter must not be empty".to_string());
        }

        if self.tiers.0.is_empty() {
            return bad("at least one tier is required".to_string());
        }
        let mut names = HashSet::new();
        for tier in &self.tiers.0 {
            if !names.insert(tier.name.to_ascii_lowercase()) {
                return bad(format!("duplicate tier {:?}", tier.name));
            }
            if tier.records_per_pull == 0 {
                return bad(format!("tier {:?} must draw at least one record", tier.name));
            }
            if tier.chance_bp > 10_000 {
                return bad(format!("tier {:?} chance exceeds 100%", tier.name));
            }
        }

        let mut quest_ids = HashSet::new();
        for quest in &self.quests.0 {
            if quest.id.is_empty() || !quest_ids.insert(quest.id.as_str()) {
                return bad(format!("quest id {:?} is empty or duplicated", quest.id));
            }
        }

        if self.streak.cycle_days == 0 {
            return bad("streak.cycle_days must be at least 1".to_string());
        }

        let tokens = &self.tokens;
        if tokens.min_len == 0 || tokens.min_len > tokens.max_len {
            return bad("tokens.min_len must be in 1..=max_len".to_string());
        }
        if tokens.freeform_min > tokens.freeform_max {
            return bad("tokens.freeform_min exceeds freeform_max".to_string());
        }
        for code in tokens.fixed.keys() {
            if !is_valid_token_format(code, tokens.min_len, tokens.max_len) {
                return bad(format!("fixed token {code:?} does not match the token format"));
            }
        }

        let issuance = &self.issuance;
        if issuance.max_count == 0 || issuance.min_value > issuance.max_value || issuance.random_len == 0 {
            return bad("issuance bounds are inconsistent".to_string());
        }
        let code_space = u32::try_from(issuance.random_len)
            .ok()
            .and_then(|len| 36u64.checked_pow(len));
        if code_space.is_some_and(|space| space < u64::from(issuance.max_count)) {
            return bad(format!(
                "issuance.random_len {} cannot yield {} distinct codes",
                issuance.random_len, issuance.max_count
            ));
        }

        if self.history.limit == 0 {
            return bad("history.limit must be at least 1".to_string());
        }

        Ok(())
    }

    /// Looks up a tier by case-insensitive name.
    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.0.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Looks up a quest by id.
    pub fn quest(&self, id: &str) -> Option<&QuestConfig> {
        self.quests.0.iter().find(|q| q.id == id)
    }

    /// Returns true if `id` is a configured admin account. Account ids are
    /// case-sensitive, so the match is exact.
    pub fn is_admin(&self, id: &str) -> bool {
        self.accounts.admins.iter().any(|a| a == id)
    }
}

/// Pool source parsing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Separator between identifier and secret.
    pub delimiter: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { delimiter: ":".to_string() }
    }
}

/// Account creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Coins granted on first login.
    pub starting_balance: u64,
    /// Coins granted to admins on first login.
    pub admin_starting_balance: u64,
    /// Account ids with admin rights.
    pub admins: Vec<String>,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            starting_balance: 500,
            admin_starting_balance: 9999,
            admins: vec!["admin@haven.local".to_string()],
        }
    }
}

/// One gacha case type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Case name, matched case-insensitively.
    pub name: String,
    /// Coins per pull.
    pub price: u64,
    /// Records drawn per pull.
    pub records_per_pull: u32,
    /// Advertised chance in basis points. Display only.
    pub chance_bp: u32,
}

/// Ordered tier list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierList(pub Vec<TierConfig>);

impl Default for TierList {
    fn default() -> Self {
        let tier = |name: &str, price, records_per_pull, chance_bp| TierConfig {
            name: name.to_string(),
            price,
            records_per_pull,
            chance_bp,
        };
        Self(vec![
            tier("common", 50, 1, 2000),
            tier("rare", 100, 2, 1000),
            tier("epic", 200, 3, 500),
            tier("legendary", 500, 5, 100),
            tier("mythic", 1000, 10, 10),
        ])
    }
}

/// Daily streak rewards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreakConfig {
    /// Coins per streak day: day N pays `N * multiplier`.
    pub multiplier: u64,
    /// Streak length before the run restarts at day 1.
    pub cycle_days: u32,
}

impl Default for StreakConfig {
    fn default() -> Self {
        Self { multiplier: 50, cycle_days: 7 }
    }
}

/// One quest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestConfig {
    /// Stable quest identifier.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Flat coin reward.
    pub reward: u64,
}

/// Quest catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuestList(pub Vec<QuestConfig>);

impl Default for QuestList {
    fn default() -> Self {
        let quest = |id: &str, title: &str, reward| QuestConfig {
            id: id.to_string(),
            title: title.to_string(),
            reward,
        };
        Self(vec![
            quest("1", "Follow on TikTok", 100),
            quest("2", "Follow on Instagram", 150),
            quest("3", "Subscribe on YouTube", 200),
            quest("4", "Watch an Ad", 50),
        ])
    }
}

/// Referral rewards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferralConfig {
    /// Coins paid to the account redeeming a referral code.
    pub reward: u64,
    /// Prefix of generated codes.
    pub prefix: String,
    /// SipHash key for code derivation.
    pub secret: [u64; 2],
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            reward: 100,
            prefix: "REF".to_string(),
            secret: [0x6861_7665_6e5f_7265, 0x6665_7272_616c_0001],
        }
    }
}

/// Token redemption.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Named tokens with fixed rewards.
    pub fixed: BTreeMap<String, u64>,
    /// Accept well-formed unknown tokens with a pseudo-random reward.
    pub allow_freeform: bool,
    /// Minimum freeform reward.
    pub freeform_min: u64,
    /// Maximum freeform reward.
    pub freeform_max: u64,
    /// Minimum token length.
    pub min_len: usize,
    /// Maximum token length.
    pub max_len: usize,
    /// SipHash key for freeform rewards.
    pub secret: [u64; 2],
}

impl Default for TokenConfig {
    fn default() -> Self {
        let fixed = [("WELCOME100", 100), ("BONUS200", 200), ("FREECOIN50", 50)]
            .into_iter()
            .map(|(code, value)| (code.to_string(), value))
            .collect();
        Self {
            fixed,
            allow_freeform: true,
            freeform_min: 10,
            freeform_max: 100,
            min_len: 6,
            max_len: 32,
            secret: [0x6861_7665_6e5f_746f, 0x6b65_6e73_0000_0001],
        }
    }
}

/// Admin token issuance bounds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuanceConfig {
    /// Most tokens per batch.
    pub max_count: u32,
    /// Smallest value per token.
    pub min_value: u64,
    /// Largest value per token.
    pub max_value: u64,
    /// Random base-36 characters appended to the prefix.
    pub random_len: usize,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            max_count: 50,
            min_value: 10,
            max_value: 1000,
            random_len: 8,
        }
    }
}

/// History log bounds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Entries kept per account, most recent first.
    pub limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { limit: 20 }
    }
}

/// Coin purchase handoff to an external messaging channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Chat link base, the contact is appended.
    pub base_url: String,
    /// Seller contact handle.
    pub contact: String,
    /// Purchasable coin packages.
    pub packages: Vec<CoinPackage>,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        let package = |id: &str, coins, price_label: &str| CoinPackage {
            id: id.to_string(),
            coins,
            price_label: price_label.to_string(),
        };
        Self {
            base_url: "https://wa.me/".to_string(),
            contact: "0000000000".to_string(),
            packages: vec![
                package("small", 500, "Rp 10.000"),
                package("medium", 1200, "Rp 20.000"),
                package("large", 3000, "Rp 45.000"),
            ],
        }
    }
}

/// A coin bundle sold through the handoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinPackage {
    /// Package identifier.
    pub id: String,
    /// Coins delivered.
    pub coins: u64,
    /// Human-readable price.
    pub price_label: String,
}
