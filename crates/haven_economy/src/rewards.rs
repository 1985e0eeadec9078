//! # Reward Rules
//!
//! Stateless policy. Given a reward type and its inputs, compute the grant
//! key and the amount. Nothing here touches the ledger or the store.
//!
//! | Reward   | Key                  | Amount                              |
//! |----------|----------------------|-------------------------------------|
//! | Streak   | `streak:<epoch-day>` | `run * multiplier`                  |
//! | Quest    | `quest:<id>`         | configured flat amount              |
//! | Referral | `referral:<code>`    | configured flat amount              |
//! | Token    | `token:<code>`       | fixed table, issued value, or hash  |
//!
//! Every opportunity moves `Unclaimed -> Claimed` once and never back.

use crate::account::{AccountId, GrantKey, StreakState};
use crate::config::{QuestList, ReferralConfig, StreakConfig, TokenConfig};
use crate::error::{HavenError, HavenResult};
use crate::tokens::is_valid_token_format;
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

/// Seconds per epoch day.
pub const SECONDS_PER_DAY: u64 = 86_400;

const BASE36: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Random characters in a referral code after the prefix.
const REFERRAL_CODE_LEN: usize = 8;

/// A computed reward: what to record and what to pay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reward {
    /// Grant key guarding this opportunity.
    pub key: GrantKey,
    /// Coins to pay.
    pub amount: u64,
}

/// Days since the Unix epoch.
#[inline]
#[must_use]
pub const fn epoch_day(unix_secs: u64) -> u64 {
    unix_secs / SECONDS_PER_DAY
}

/// Computes today's streak reward and the streak state after claiming it.
///
/// Claiming the day after the previous claim extends the run. A gap resets it
/// to day 1, and so does finishing a full cycle.
///
/// # Errors
///
/// - [`HavenError::AlreadyClaimed`] if today was already claimed.
/// - [`HavenError::InvalidRequest`] if `today` is before the last claim.
pub fn streak_reward(state: StreakState, today: u64, config: &StreakConfig) -> HavenResult<(Reward, StreakState)> {
    let key = GrantKey::streak(today);

    let run = match state.last_day {
        Some(last) if last == today => {
            return Err(HavenError::AlreadyClaimed { key: key.as_str().to_string() });
        }
        Some(last) if last > today => {
            return Err(HavenError::invalid(format!("streak day {today} precedes last claim on day {last}")));
        }
        Some(last) if last.checked_add(1) == Some(today) && state.run < config.cycle_days => state.run + 1,
        _ => 1,
    };

    let amount = u64::from(run)
        .checked_mul(config.multiplier)
        .ok_or_else(|| HavenError::invalid("streak reward overflow"))?;

    Ok((
        Reward { key, amount },
        StreakState { last_day: Some(today), run },
    ))
}

/// Flat reward for completing a quest.
///
/// # Errors
///
/// Returns [`HavenError::InvalidRequest`] for an unknown quest id.
pub fn quest_reward(quest_id: &str, quests: &QuestList) -> HavenResult<Reward> {
    let quest = quests
        .0
        .iter()
        .find(|q| q.id == quest_id)
        .ok_or_else(|| HavenError::invalid(format!("unknown quest {quest_id:?}")))?;
    Ok(Reward {
        key: GrantKey::quest(&quest.id),
        amount: quest.reward,
    })
}

/// Derives the referral code for `account`.
///
/// Deterministic: the same account, attempt, and secret always give the same
/// code. `attempt` is bumped only when an earlier attempt collided with
/// another account's code.
pub fn referral_code(account: &AccountId, attempt: u32, config: &ReferralConfig) -> String {
    let mut hasher = SipHasher24::new_with_keys(config.secret[0], config.secret[1]);
    hasher.write(account.as_str().as_bytes());
    hasher.write_u32(attempt);
    let mut hash = hasher.finish();

    let mut code = String::with_capacity(config.prefix.len() + REFERRAL_CODE_LEN);
    code.push_str(&config.prefix);
    for _ in 0..REFERRAL_CODE_LEN {
        code.push(char::from(BASE36[(hash % 36) as usize]));
        hash /= 36;
    }
    code
}

/// Flat reward for redeeming someone's referral code.
pub fn referral_reward(code: &str, config: &ReferralConfig) -> Reward {
    Reward {
        key: GrantKey::referral(code),
        amount: config.reward,
    }
}

/// Reward for a token string.
///
/// Lookup order: the fixed table, then admin-issued tokens, then (if
/// enabled) a freeform reward derived from a keyed hash of the token, bounded
/// by `freeform_min..=freeform_max`.
///
/// # Errors
///
/// Returns [`HavenError::InvalidRequest`] for a malformed token, or an
/// unknown token when freeform tokens are disabled.
pub fn token_reward(code: &str, issued_value: Option<u64>, config: &TokenConfig) -> HavenResult<Reward> {
    if !is_valid_token_format(code, config.min_len, config.max_len) {
        return Err(HavenError::invalid(format!("malformed token {code:?}")));
    }

    let key = GrantKey::token(code);

    if let Some(&amount) = config.fixed.get(code) {
        return Ok(Reward { key, amount });
    }
    if let Some(amount) = issued_value {
        return Ok(Reward { key, amount });
    }
    if !config.allow_freeform {
        return Err(HavenError::invalid(format!("unknown token {code:?}")));
    }

    let mut hasher = SipHasher24::new_with_keys(config.secret[0], config.secret[1]);
    hasher.write(code.as_bytes());
    let span = (config.freeform_max - config.freeform_min).saturating_add(1);
    let amount = config.freeform_min + hasher.finish() % span;

    Ok(Reward { key, amount })
}
