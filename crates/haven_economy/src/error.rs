//! # Economy Error Types
//!
//! All errors that can occur in the pool, ledger, and reward systems.

use thiserror::Error;

/// Errors that can occur in the economy system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HavenError {
    /// A debit exceeds the account balance. Nothing was changed.
    #[error("insufficient funds: need {required} coins, have {balance}")]
    InsufficientFunds {
        /// Current balance.
        balance: u64,
        /// Amount the operation needed.
        required: u64,
    },

    /// The pool cannot satisfy the requested draw. Any prior debit was rolled back.
    #[error("insufficient supply: requested {requested} records, {available} available")]
    InsufficientSupply {
        /// Records requested.
        requested: usize,
        /// Records still available.
        available: usize,
    },

    /// The grant key was already satisfied for this account.
    #[error("already claimed: {key}")]
    AlreadyClaimed {
        /// The grant key.
        key: String,
    },

    /// The token was already redeemed by some account.
    #[error("token already redeemed: {code}")]
    AlreadyRedeemed {
        /// The token code.
        code: String,
    },

    /// Malformed input from the caller.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A pool source line could not be split into its fields.
    #[error("malformed record at line {line}: {reason}")]
    MalformedRecord {
        /// 1-based line number in the pool source.
        line: u32,
        /// Why the line was rejected.
        reason: String,
    },

    /// The durable store could not be read or written.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// No account with this id has been opened.
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    /// No gacha tier with this name is configured.
    #[error("unknown tier: {0}")]
    UnknownTier(String),

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HavenError {
    /// Returns true if retrying the same call may succeed.
    ///
    /// Only store outages qualify. Everything else either reflects current
    /// state (funds, supply, claims) or a caller mistake.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::PersistenceUnavailable(_))
    }

    /// Shorthand for an [`HavenError::InvalidRequest`].
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }
}

/// Result type for economy operations.
pub type HavenResult<T> = Result<T, HavenError>;
