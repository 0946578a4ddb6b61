//! Contribution Step Definitions
//!
//! Step IDs are stored as SMALLINT in `contribution_info.step`.

use std::fmt;

/// Persisted contribution steps
///
/// Terminal steps carry non-positive IDs:
/// COMPLETED (0), FAILED (-1), NOT_ENOUGH_FUNDS (-3), AC_TABLE_EMPTY (-4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum ContributionStep {
    /// Record created, executor not yet confirmed anything
    Start = 2,

    /// SKU order exists and external settlement was requested (persist-before-call)
    ExternalTransaction = 5,

    /// Credential issuance for the settled order succeeded, redemption pending
    Creds = 6,

    /// Terminal: every publisher share redeemed
    Completed = 0,

    /// Terminal: explicit rejection by a collaborator
    Failed = -1,

    /// Terminal: backend could not cover the amount
    NotEnoughFunds = -3,

    /// Terminal: auto-contribute had no eligible publishers
    AcTableEmpty = -4,
}

impl ContributionStep {
    /// Check if this is a terminal step (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContributionStep::Completed
                | ContributionStep::Failed
                | ContributionStep::NotEnoughFunds
                | ContributionStep::AcTableEmpty
        )
    }

    /// Position in the forward-only sequence
    fn rank(&self) -> u8 {
        match self {
            ContributionStep::Start => 0,
            ContributionStep::ExternalTransaction => 1,
            ContributionStep::Creds => 2,
            _ => 3,
        }
    }

    /// Steps only move forward; nothing leaves a terminal step or re-enters START.
    pub fn can_advance_to(&self, next: ContributionStep) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Get the numeric step ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from PostgreSQL step ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            2 => Some(ContributionStep::Start),
            5 => Some(ContributionStep::ExternalTransaction),
            6 => Some(ContributionStep::Creds),
            0 => Some(ContributionStep::Completed),
            -1 => Some(ContributionStep::Failed),
            -3 => Some(ContributionStep::NotEnoughFunds),
            -4 => Some(ContributionStep::AcTableEmpty),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContributionStep::Start => "START",
            ContributionStep::ExternalTransaction => "EXTERNAL_TRANSACTION",
            ContributionStep::Creds => "CREDS",
            ContributionStep::Completed => "COMPLETED",
            ContributionStep::Failed => "FAILED",
            ContributionStep::NotEnoughFunds => "NOT_ENOUGH_FUNDS",
            ContributionStep::AcTableEmpty => "AC_TABLE_EMPTY",
        }
    }
}

impl fmt::Display for ContributionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for ContributionStep {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        ContributionStep::from_id(value).ok_or(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ContributionStep; 7] = [
        ContributionStep::Start,
        ContributionStep::ExternalTransaction,
        ContributionStep::Creds,
        ContributionStep::Completed,
        ContributionStep::Failed,
        ContributionStep::NotEnoughFunds,
        ContributionStep::AcTableEmpty,
    ];

    #[test]
    fn test_terminal_steps() {
        assert!(ContributionStep::Completed.is_terminal());
        assert!(ContributionStep::Failed.is_terminal());
        assert!(ContributionStep::NotEnoughFunds.is_terminal());
        assert!(ContributionStep::AcTableEmpty.is_terminal());

        assert!(!ContributionStep::Start.is_terminal());
        assert!(!ContributionStep::ExternalTransaction.is_terminal());
        assert!(!ContributionStep::Creds.is_terminal());
    }

    #[test]
    fn test_forward_only() {
        use ContributionStep::*;

        assert!(Start.can_advance_to(ExternalTransaction));
        assert!(Start.can_advance_to(Completed));
        assert!(ExternalTransaction.can_advance_to(Creds));
        assert!(Creds.can_advance_to(Completed));
        assert!(Creds.can_advance_to(Failed));

        // Nothing re-enters START
        for step in ALL {
            assert!(!step.can_advance_to(Start), "{} -> START allowed", step);
        }
        assert!(!Creds.can_advance_to(ExternalTransaction));
        assert!(!Creds.can_advance_to(Creds));

        // Terminal steps are final
        for step in ALL.iter().filter(|s| s.is_terminal()) {
            for next in ALL {
                assert!(!step.can_advance_to(next));
            }
        }
    }

    #[test]
    fn test_step_id_roundtrip() {
        for step in ALL {
            assert_eq!(ContributionStep::from_id(step.id()), Some(step));
        }
        assert!(ContributionStep::from_id(1).is_none());
        assert!(ContributionStep::try_from(99).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(ContributionStep::Start.to_string(), "START");
        assert_eq!(
            ContributionStep::ExternalTransaction.to_string(),
            "EXTERNAL_TRANSACTION"
        );
        assert_eq!(ContributionStep::AcTableEmpty.to_string(), "AC_TABLE_EMPTY");
    }
}
