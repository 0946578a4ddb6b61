//! Fund Splitter
//!
//! Splits one queue entry against one backend balance into the part processed
//! now (a new START contribution) and the remainder left in the queue.

use std::collections::HashSet;

use rust_decimal::{Decimal, RoundingStrategy};

use super::error::ContributionError;
use super::types::{
    ContributionId, ContributionInfo, ContributionPublisher, ContributionQueue, QueuePublisher,
    WalletType,
};

/// Publisher shares are truncated to this many decimal places
const SHARE_DP: u32 = 8;

/// Outcome of splitting an entry against one backend
#[derive(Debug, Clone)]
pub struct Apportioned {
    /// Record for the part processed now, step START
    pub contribution: ContributionInfo,
    /// Entry carrying whatever the backend could not cover
    pub remainder: ContributionQueue,
}

impl Apportioned {
    /// Remainder is satisfied (or unsatisfiable) and must be deleted, not requeued
    pub fn remainder_is_empty(&self) -> bool {
        self.remainder.amount <= Decimal::ZERO || self.remainder.publishers.is_empty()
    }
}

/// Split `queue` against the balance of `wallet`.
///
/// Returns `Ok(None)` when the backend has nothing: the entry moves to the
/// next backend unchanged.
pub fn apportion(
    queue: &ContributionQueue,
    wallet: WalletType,
    wallet_balance: Decimal,
) -> Result<Option<Apportioned>, ContributionError> {
    validate_publishers(queue)?;

    if wallet_balance <= Decimal::ZERO {
        return Ok(None);
    }

    let processed = queue.amount.min(wallet_balance);
    let remaining = queue.amount - processed;

    let contribution_id = ContributionId::new();
    let mut contribution = ContributionInfo::new(
        contribution_id,
        processed,
        queue.rewards_type,
        wallet.into(),
    );

    let scale = percent_scale(&queue.publishers);
    contribution.publishers = queue
        .publishers
        .iter()
        .map(|p| ContributionPublisher {
            contribution_id,
            publisher_key: p.publisher_key.clone(),
            total_amount: share(processed, p.amount_percent, scale),
            contributed_amount: Decimal::ZERO,
        })
        .collect();

    let mut remainder = queue.clone();
    remainder.amount = remaining;
    remainder.publishers = if remaining <= Decimal::ZERO {
        Vec::new()
    } else if queue.rewards_type.is_tip() {
        publishers_left(&queue.publishers)
    } else {
        // Auto-contribute weights are not proportional to the amount
        queue.publishers.clone()
    };

    Ok(Some(Apportioned {
        contribution,
        remainder,
    }))
}

/// Publishers still owed a share of the remainder.
///
/// A pro-rata split leaves every publisher's relative share unchanged, so the
/// remainder keeps the same percentages minus publishers owed nothing.
fn publishers_left(publishers: &[QueuePublisher]) -> Vec<QueuePublisher> {
    publishers
        .iter()
        .filter(|p| p.amount_percent > Decimal::ZERO)
        .cloned()
        .collect()
}

/// Keys must be present and unique; one key maps to one stored publisher row
fn validate_publishers(queue: &ContributionQueue) -> Result<(), ContributionError> {
    let mut seen = HashSet::with_capacity(queue.publishers.len());
    for publisher in &queue.publishers {
        if publisher.publisher_key.is_empty() {
            return Err(ContributionError::InvalidRequest(format!(
                "queue {} has a publisher without key",
                queue.id
            )));
        }
        if publisher.amount_percent < Decimal::ZERO {
            return Err(ContributionError::InvalidRequest(format!(
                "queue {} publisher {} has negative share",
                queue.id, publisher.publisher_key
            )));
        }
        if !seen.insert(publisher.publisher_key.as_str()) {
            return Err(ContributionError::InvalidRequest(format!(
                "queue {} lists publisher {} twice",
                queue.id, publisher.publisher_key
            )));
        }
    }
    Ok(())
}

/// Shares summing above 100 % are scaled down so the sum never exceeds the amount
fn percent_scale(publishers: &[QueuePublisher]) -> Decimal {
    let sum: Decimal = publishers.iter().map(|p| p.amount_percent).sum();
    if sum > Decimal::ONE_HUNDRED {
        sum
    } else {
        Decimal::ONE_HUNDRED
    }
}

fn share(amount: Decimal, percent: Decimal, scale: Decimal) -> Decimal {
    (amount * percent / scale).round_dp_with_strategy(SHARE_DP, RoundingStrategy::ToZero)
}
