//! Monthly reconcile kickoff
//!
//! Turns recurring tips and the auto-contribute budget into queue entries and
//! computes the next reconcile stamp.

use rust_decimal::Decimal;
use tracing::{debug, info};

use super::error::ContributionError;
use super::types::{ContributionQueue, QueueId, RewardsType};
use crate::store::ContributionStore;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Next reconcile time after `now`
pub fn next_reconcile_stamp(now: i64, interval_days: u32) -> i64 {
    now + i64::from(interval_days.max(1)) * SECONDS_PER_DAY
}

/// One non-partial entry per recurring tip; returns how many were queued
pub async fn enqueue_recurring_tips(
    store: &dyn ContributionStore,
) -> Result<usize, ContributionError> {
    let tips = store.get_recurring_tips().await?;

    let mut queued = 0;
    for tip in tips {
        if tip.amount <= Decimal::ZERO || tip.publisher_key.is_empty() {
            debug!(publisher_key = %tip.publisher_key, "Skipping empty recurring tip");
            continue;
        }

        let entry = ContributionQueue::single(RewardsType::RecurringTip, tip.publisher_key, tip.amount);
        let id = store.save_contribution_queue(&entry).await?;
        debug!(queue_id = id, amount = %entry.amount, "Recurring tip queued");
        queued += 1;
    }

    info!(count = queued, "Recurring tips queued");
    Ok(queued)
}

/// Queue one partial auto-contribute entry over the activity publisher list.
///
/// Fails with `AcTableEmpty` and queues nothing when no publisher is eligible.
pub async fn enqueue_auto_contribute(
    store: &dyn ContributionStore,
    amount: Decimal,
) -> Result<QueueId, ContributionError> {
    if amount <= Decimal::ZERO {
        return Err(ContributionError::InvalidRequest(
            "auto-contribute amount must be positive".to_string(),
        ));
    }

    let publishers: Vec<_> = store
        .get_ac_publishers()
        .await?
        .into_iter()
        .filter(|p| p.amount_percent > Decimal::ZERO)
        .collect();
    if publishers.is_empty() {
        return Err(ContributionError::AcTableEmpty);
    }

    let count = publishers.len();
    let entry = ContributionQueue::new(RewardsType::AutoContribute, amount, true, publishers);
    let id = store.save_contribution_queue(&entry).await?;

    info!(queue_id = id, publishers = count, amount = %amount, "Auto-contribute queued");
    Ok(id)
}

/// Whether the total balance covers every recurring tip
pub async fn has_sufficient_balance(
    store: &dyn ContributionStore,
    total_balance: Decimal,
) -> Result<bool, ContributionError> {
    let required: Decimal = store
        .get_recurring_tips()
        .await?
        .iter()
        .map(|t| t.amount)
        .sum();
    Ok(total_balance >= required)
}
