//! Error taxonomy for the replay core.
//!
//! Matching and ledger operations return [`ReplayResult`]; the episode
//! controller decides whether a failure rejects one order, drops one sample,
//! or aborts the whole episode.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use thiserror::Error;

/// Typed failures raised inside one episode.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplayError {
    /// The historical source has no more events. Normal end of an episode.
    #[error("historical data exhausted")]
    DataExhausted,

    #[error("insufficient position in {symbol}: requested {requested}, available {available}")]
    InsufficientPosition {
        symbol: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("insufficient cash: required {required}, available {available}")]
    InsufficientCash { required: Decimal, available: Decimal },

    /// A sample violating OHLC consistency or chronological order.
    #[error("invalid sample for {symbol} at {timestamp}: {reason}")]
    InvalidBar {
        symbol: String,
        timestamp: NaiveDateTime,
        reason: String,
    },

    /// Cash/position bookkeeping no longer adds up. Fatal to the episode.
    #[error("ledger invariant violated: {0}")]
    LedgerInvariantViolation(String),

    /// Max-drawdown breach. Controlled early termination.
    #[error("knocked out: {0}")]
    KnockOut(String),

    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("order rejected: {0}")]
    OrderRejected(String),
}

impl ReplayError {
    /// Errors that reject a single order without harming the episode.
    pub fn is_order_rejection(&self) -> bool {
        matches!(
            self,
            Self::InsufficientPosition { .. } | Self::InsufficientCash { .. } | Self::OrderRejected(_)
        )
    }

    /// Errors after which the episode output can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LedgerInvariantViolation(_))
    }
}

pub type ReplayResult<T> = std::result::Result<T, ReplayError>;
