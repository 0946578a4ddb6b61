//! Contribution Error Types
//!
//! `ContributionError` is what every fallible call returns; `LedgerResult` is
//! the result code handed back to callers and written into terminal steps.

use thiserror::Error;

use super::step::ContributionStep;

/// Result codes reported to the original caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerResult {
    Ok,
    /// Insufficient balance across all backends or insufficient unblinded tokens
    NotEnoughFunds,
    /// No eligible publishers for auto-contribute
    AcTableEmpty,
    /// Transient: corrupted/unreadable persisted state, let the timer re-attempt
    Retry,
    /// Unexpected empty field, storage failure, defect
    Error,
}

impl LedgerResult {
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, LedgerResult::Ok)
    }

    /// Terminal step written when a contribution finishes with this result
    pub fn into_step(self) -> ContributionStep {
        match self {
            LedgerResult::Ok => ContributionStep::Completed,
            LedgerResult::NotEnoughFunds => ContributionStep::NotEnoughFunds,
            LedgerResult::AcTableEmpty => ContributionStep::AcTableEmpty,
            LedgerResult::Retry | LedgerResult::Error => ContributionStep::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerResult::Ok => "LEDGER_OK",
            LedgerResult::NotEnoughFunds => "NOT_ENOUGH_FUNDS",
            LedgerResult::AcTableEmpty => "AC_TABLE_EMPTY",
            LedgerResult::Retry => "RETRY",
            LedgerResult::Error => "LEDGER_ERROR",
        }
    }
}

impl std::fmt::Display for LedgerResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug, Clone)]
pub enum ContributionError {
    // === Storage ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Persisted record is corrupted: {0}")]
    Corrupted(String),

    // === Validation ===
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Order {order_id} has {items} items, exactly one expected")]
    InvalidOrder { order_id: String, items: usize },

    #[error("Invalid step transition: {0}")]
    InvalidStateTransition(String),

    // === Funds ===
    #[error("Balance unavailable: {0}")]
    BalanceUnavailable(String),

    #[error("Not enough funds")]
    NotEnoughFunds,

    #[error("Auto-contribute table is empty")]
    AcTableEmpty,

    #[error("No processor registered for wallet: {0}")]
    NoProcessor(String),

    // === Collaborators ===
    /// Explicit failure, safe to mark the contribution FAILED
    #[error("Rejected by {service}: {reason}")]
    Rejected { service: &'static str, reason: String },

    /// Unknown outcome (timeout, network), must NOT fail the contribution
    #[error("{service} unavailable: {reason}")]
    Unavailable { service: &'static str, reason: String },
}

impl ContributionError {
    /// Map into the caller-facing taxonomy
    pub fn result(&self) -> LedgerResult {
        match self {
            ContributionError::NotEnoughFunds => LedgerResult::NotEnoughFunds,
            ContributionError::AcTableEmpty => LedgerResult::AcTableEmpty,
            ContributionError::Corrupted(_) | ContributionError::Unavailable { .. } => {
                LedgerResult::Retry
            }
            _ => LedgerResult::Error,
        }
    }

    /// Step to persist when this error ends a contribution.
    ///
    /// `None` leaves the contribution at its current step for the retry timer.
    pub fn terminal_step(&self) -> Option<ContributionStep> {
        match self {
            ContributionError::NotEnoughFunds => Some(ContributionStep::NotEnoughFunds),
            ContributionError::AcTableEmpty => Some(ContributionStep::AcTableEmpty),
            ContributionError::Rejected { .. } => Some(ContributionStep::Failed),
            _ => None,
        }
    }

    /// Defects abort the pipeline of one contribution without touching its step
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            ContributionError::InvalidOrder { .. } | ContributionError::InvalidStateTransition(_)
        )
    }
}

impl From<sqlx::Error> for ContributionError {
    fn from(e: sqlx::Error) -> Self {
        ContributionError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_mapping() {
        assert_eq!(
            ContributionError::NotEnoughFunds.result(),
            LedgerResult::NotEnoughFunds
        );
        assert_eq!(
            ContributionError::AcTableEmpty.result(),
            LedgerResult::AcTableEmpty
        );
        assert_eq!(
            ContributionError::Corrupted("queue".into()).result(),
            LedgerResult::Retry
        );
        assert_eq!(
            ContributionError::Storage("io".into()).result(),
            LedgerResult::Error
        );
    }

    #[test]
    fn test_explicit_fail_rule() {
        let rejected = ContributionError::Rejected {
            service: "custodial",
            reason: "insufficient".into(),
        };
        assert_eq!(rejected.terminal_step(), Some(ContributionStep::Failed));

        let unknown = ContributionError::Unavailable {
            service: "custodial",
            reason: "timeout".into(),
        };
        assert_eq!(unknown.terminal_step(), None);
        assert_eq!(ContributionError::Storage("x".into()).terminal_step(), None);
    }

    #[test]
    fn test_defects() {
        let err = ContributionError::InvalidOrder {
            order_id: "o-1".into(),
            items: 2,
        };
        assert!(err.is_defect());
        assert_eq!(err.terminal_step(), None);
        assert_eq!(err.to_string(), "Order o-1 has 2 items, exactly one expected");
    }

    #[test]
    fn test_ledger_result_into_step() {
        assert_eq!(LedgerResult::Ok.into_step(), ContributionStep::Completed);
        assert_eq!(
            LedgerResult::NotEnoughFunds.into_step(),
            ContributionStep::NotEnoughFunds
        );
        assert_eq!(LedgerResult::Error.into_step(), ContributionStep::Failed);
    }
}
