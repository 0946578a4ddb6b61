//! Contribution Engine
//!
//! Owns the queue processor, drives contributions through their steps and
//! exposes the operations embedders call: `initialize`,
//! `process_contribution_queue`, `one_time_tip`, `has_sufficient_balance`,
//! `retry` and `on_timer`.
//!
//! One engine instance must be the only writer of its store. Queue cycles are
//! single-flight; a cycle requested while another runs is a no-op. A
//! contribution is driven by one caller at a time: a retry of a contribution
//! the queue cycle (or another retry) is driving returns RETRY untouched.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Datelike;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::balance::{BalanceSource, have_enough_funds_to_contribute, per_wallet_balance};
use super::credentials::CredentialsRegistry;
use super::error::{ContributionError, LedgerResult};
use super::executors::{TokenScope, UnblindedExecutor};
use super::monthly;
use super::router::{ExecutorRegistry, ProcessorChain};
use super::scheduler::{
    TARGET_TIMER, TimerId, TimerKind, Timers, queue_delay, reconcile_delay,
};
use super::sku::{SkuPipeline, SkuService};
use super::splitter::apportion;
use super::types::{
    ContributionId, ContributionInfo, ContributionQueue, QueueId, ReportType, RewardsType,
    SkuOrder, SkuOrderItem, WalletType,
};
use crate::config::{EngineConfig, SkuConfig};
use crate::store::{ContributionStore, QueueUpdate};

/// Non-terminal contributions re-driven by `initialize`; the recovery worker picks up the rest
const RESUME_BATCH: usize = 500;

/// What one queue cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Another cycle is in flight
    Busy,
    /// Queue is empty
    Idle,
    /// Oldest entry handled with this result
    Processed(LedgerResult),
}

/// Clears the in-flight flag when the cycle ends, however it ends
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Contributions currently being driven
#[derive(Default)]
struct Driving(Mutex<HashSet<ContributionId>>);

impl Driving {
    fn ids(&self) -> MutexGuard<'_, HashSet<ContributionId>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, id: ContributionId) -> Option<DriveClaim<'_>> {
        if !self.ids().insert(id) {
            return None;
        }
        Some(DriveClaim { driving: self, id })
    }
}

/// Releases a claimed contribution on drop
struct DriveClaim<'a> {
    driving: &'a Driving,
    id: ContributionId,
}

impl Drop for DriveClaim<'_> {
    fn drop(&mut self) {
        self.driving.ids().remove(&self.id);
    }
}

pub struct ContributionEngine {
    store: Arc<dyn ContributionStore>,
    balance: Arc<dyn BalanceSource>,
    chain: ProcessorChain,
    executors: ExecutorRegistry,
    unblinded: Arc<UnblindedExecutor>,
    sku: SkuPipeline,
    timers: Timers,
    config: EngineConfig,
    queue_in_progress: AtomicBool,
    driving: Driving,
}

impl ContributionEngine {
    /// Build an engine; the unblinded executor is created here and registered
    /// alongside `executors`.
    ///
    /// Returns the engine and the channel fired timer ids arrive on; feed it to
    /// [`ContributionEngine::run_timers`].
    pub fn new(
        store: Arc<dyn ContributionStore>,
        balance: Arc<dyn BalanceSource>,
        sku_service: Arc<dyn SkuService>,
        credentials: CredentialsRegistry,
        executors: ExecutorRegistry,
        config: EngineConfig,
        sku_config: SkuConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TimerId>) {
        let unblinded = Arc::new(UnblindedExecutor::new(store.clone(), credentials.clone()));
        let executors = executors.register(unblinded.clone());
        let sku = SkuPipeline::new(
            store.clone(),
            sku_service,
            credentials,
            unblinded.clone(),
            sku_config,
        );
        let (timers, fired) = Timers::new(config.timer_fallback_mean_secs);

        let engine = Self {
            store,
            balance,
            chain: ProcessorChain::new(config.processor_chain.clone()),
            executors,
            unblinded,
            sku,
            timers,
            config,
            queue_in_progress: AtomicBool::new(false),
            driving: Driving::default(),
        };
        (engine, fired)
    }

    pub fn store(&self) -> &Arc<dyn ContributionStore> {
        &self.store
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    // ========================================================================
    // Startup & timers
    // ========================================================================

    /// Arm both timers and resume every contribution left mid-pipeline.
    ///
    /// Returns how many contributions were re-driven.
    pub async fn initialize(&self) -> Result<usize, ContributionError> {
        self.check_contribution_queue();
        self.set_reconcile_timer().await?;

        let pending = self.store.get_not_completed_contributions(RESUME_BATCH).await?;
        info!(count = pending.len(), "Resuming unfinished contributions");

        for contribution in &pending {
            let result = self.retry(contribution).await;
            debug!(
                contribution_id = %contribution.contribution_id,
                result = %result,
                "Resumed contribution"
            );
        }
        Ok(pending.len())
    }

    /// Dispatch a fired timer. Unknown ids are ignored.
    pub async fn on_timer(&self, id: TimerId) -> Option<TimerKind> {
        let kind = self.timers.on_timer(id)?;
        debug!(target: TARGET_TIMER, timer_id = id, ?kind, "Timer fired");

        match kind {
            TimerKind::Reconcile => self.start_monthly_contribution().await,
            TimerKind::Queue => {
                let outcome = self.process_contribution_queue().await;
                debug!(?outcome, "Queue cycle finished");
            }
        }
        Some(kind)
    }

    /// Deliver fired timers until the engine is dropped
    pub async fn run_timers(self: Arc<Self>, mut fired: mpsc::UnboundedReceiver<TimerId>) {
        while let Some(id) = fired.recv().await {
            self.on_timer(id).await;
        }
    }

    /// Arm the queue timer unless it is already pending
    fn check_contribution_queue(&self) {
        let delay = queue_delay(self.config.testing, self.config.queue_delay_mean_secs);
        self.timers.set_timer(TimerKind::Queue, delay);
    }

    async fn set_reconcile_timer(&self) -> Result<(), ContributionError> {
        if self.timers.is_armed(TimerKind::Reconcile) {
            return Ok(());
        }
        let stamp = self.store.get_reconcile_stamp().await?;
        let delay = reconcile_delay(stamp, chrono::Utc::now().timestamp());
        self.timers.set_timer(TimerKind::Reconcile, delay);
        Ok(())
    }

    // ========================================================================
    // Monthly reconcile
    // ========================================================================

    async fn start_monthly_contribution(&self) {
        if !self.config.rewards_enabled {
            info!("Rewards disabled, skipping monthly contribution");
            self.reset_reconcile_stamp().await;
            return;
        }
        info!("Starting monthly contribution");

        if let Err(e) = monthly::enqueue_recurring_tips(self.store.as_ref()).await {
            warn!(error = %e, "Monthly recurring tips failed");
        }

        match monthly::enqueue_auto_contribute(
            self.store.as_ref(),
            self.config.auto_contribute_amount,
        )
        .await
        {
            Ok(_) => {}
            Err(ContributionError::AcTableEmpty) => {
                info!(result = %LedgerResult::AcTableEmpty, "No publishers for auto-contribute")
            }
            Err(e) => warn!(error = %e, "Auto-contribute was not queued"),
        }

        self.reset_reconcile_stamp().await;
        self.check_contribution_queue();
    }

    async fn reset_reconcile_stamp(&self) {
        let stamp = monthly::next_reconcile_stamp(
            chrono::Utc::now().timestamp(),
            self.config.reconcile_interval_days,
        );
        if let Err(e) = self.store.set_reconcile_stamp(stamp).await {
            error!(error = %e, "Failed to reset reconcile stamp");
        }
        if let Err(e) = self.set_reconcile_timer().await {
            error!(error = %e, "Failed to arm reconcile timer");
        }
    }

    /// Whether the current total balance covers every recurring tip
    pub async fn has_sufficient_balance(&self) -> Result<bool, ContributionError> {
        let balance = self.balance.fetch_balance().await?;
        monthly::has_sufficient_balance(self.store.as_ref(), balance.total).await
    }

    // ========================================================================
    // Enqueue surfaces
    // ========================================================================

    /// Queue a one-off tip to `publisher_key` and arm the queue timer.
    ///
    /// Fails early with NOT_ENOUGH_FUNDS when the total balance cannot cover it.
    pub async fn one_time_tip(&self, publisher_key: &str, amount: Decimal) -> LedgerResult {
        if publisher_key.is_empty() || amount <= Decimal::ZERO {
            warn!(publisher_key, amount = %amount, "Invalid one-time tip");
            return LedgerResult::Error;
        }

        let balance = match self.balance.fetch_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                error!(error = %e, "Balance unavailable for tip");
                return e.result();
            }
        };
        if have_enough_funds_to_contribute(amount, false, balance.total).is_none() {
            info!(publisher_key, amount = %amount, total = %balance.total, "Tip exceeds balance");
            return LedgerResult::NotEnoughFunds;
        }

        let entry = ContributionQueue::single(RewardsType::OneTimeTip, publisher_key, amount);
        match self.store.save_contribution_queue(&entry).await {
            Ok(queue_id) => {
                info!(queue_id, publisher_key, amount = %amount, "One-time tip queued");
                self.check_contribution_queue();
                LedgerResult::Ok
            }
            Err(e) => {
                error!(error = %e, "Failed to queue tip");
                e.result()
            }
        }
    }

    /// Buy `items` from `destination` through `wallet`, outside the queue
    pub async fn process_sku(
        &self,
        items: Vec<SkuOrderItem>,
        destination: &str,
        wallet: WalletType,
    ) -> Result<SkuOrder, ContributionError> {
        let (executor, _) = self.executors.processor_for(wallet)?;
        let order = self.sku.purchase(items, destination, &executor).await?;
        info!(order_id = %order.order_id, wallet = %wallet, "SKU purchase processed");
        Ok(order)
    }

    // ========================================================================
    // Queue processor
    // ========================================================================

    /// Process the oldest queue entry, then re-arm while entries remain
    pub async fn process_contribution_queue(&self) -> QueueOutcome {
        let Some(_in_flight) = InFlight::acquire(&self.queue_in_progress) else {
            debug!("Queue cycle already in progress");
            return QueueOutcome::Busy;
        };

        let entry = match self.store.get_first_contribution_queue().await {
            Ok(Some(entry)) => entry,
            Ok(None) => return QueueOutcome::Idle,
            Err(e) => {
                error!(error = %e, "Failed to read contribution queue");
                return QueueOutcome::Processed(e.result());
            }
        };

        let result = self.process_entry(entry).await;

        match self.store.get_first_contribution_queue().await {
            Ok(Some(_)) => self.check_contribution_queue(),
            Ok(None) => debug!("Contribution queue drained"),
            Err(e) => warn!(error = %e, "Could not check for remaining entries"),
        }

        QueueOutcome::Processed(result)
    }

    async fn process_entry(&self, entry: ContributionQueue) -> LedgerResult {
        let queue_id = entry.id;

        if entry.amount <= Decimal::ZERO || entry.publishers.is_empty() {
            warn!(queue_id, amount = %entry.amount, "Queue entry has nothing to contribute");
            self.delete_entry(queue_id).await;
            return LedgerResult::Error;
        }

        let balance = match self.balance.fetch_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                error!(queue_id, error = %e, "Balance unavailable, entry left in queue");
                return e.result();
            }
        };

        let Some(amount) =
            have_enough_funds_to_contribute(entry.amount, entry.partial, balance.total)
        else {
            info!(
                queue_id,
                amount = %entry.amount,
                total = %balance.total,
                "Not enough funds for queue entry"
            );
            self.delete_entry(queue_id).await;
            return LedgerResult::NotEnoughFunds;
        };

        let mut entry = entry;
        entry.amount = amount;

        let mut result = LedgerResult::Ok;
        let mut wallet = self.chain.next_processor(None);

        while let Some(current) = wallet {
            wallet = self.chain.next_processor(Some(current));

            if !self.executors.contains(current) {
                warn!(queue_id, wallet = %current, "No executor for backend, skipping");
                continue;
            }

            let available = per_wallet_balance(current, &balance.wallets);
            let split = match apportion(&entry, current, available) {
                Ok(Some(split)) => split,
                Ok(None) => {
                    debug!(queue_id, wallet = %current, "Backend has no balance, deferring");
                    continue;
                }
                Err(e) => {
                    error!(queue_id, error = %e, "Malformed queue entry removed");
                    self.delete_entry(queue_id).await;
                    return LedgerResult::Retry;
                }
            };

            // Claimed before the record is visible to retries
            let _claim = self.driving.claim(split.contribution.contribution_id);

            let done = split.remainder_is_empty();
            let update = if done {
                QueueUpdate::Delete(queue_id)
            } else {
                QueueUpdate::Save(split.remainder.clone())
            };

            if let Err(e) = self
                .store
                .save_contribution_and_queue(&split.contribution, &update)
                .await
            {
                error!(queue_id, error = %e, "Contribution was not saved, entry left in queue");
                return e.result();
            }

            info!(
                queue_id,
                contribution_id = %split.contribution.contribution_id,
                wallet = %current,
                amount = %split.contribution.amount,
                remaining = %split.remainder.amount,
                "Contribution created"
            );

            let outcome = self.drive(&split.contribution).await;
            let contribution_result = self.finish(&split.contribution, outcome).await;
            if !contribution_result.is_ok() {
                result = contribution_result;
            }

            if done {
                return result;
            }
            entry = split.remainder;
        }

        info!(queue_id, remaining = %entry.amount, "Processor chain exhausted");
        self.delete_entry(queue_id).await;
        LedgerResult::NotEnoughFunds
    }

    async fn delete_entry(&self, id: QueueId) {
        if id == 0 {
            return;
        }
        match self.store.delete_contribution_queue(id).await {
            Ok(()) => debug!(queue_id = id, "Queue entry deleted"),
            Err(e) => error!(queue_id = id, error = %e, "Failed to delete queue entry"),
        }
    }

    // ========================================================================
    // State machine driver
    // ========================================================================

    /// Re-drive a contribution from its persisted step.
    ///
    /// Only the stored record is consulted; `contribution` identifies it.
    /// Returns RETRY without touching it while another caller drives it.
    pub async fn retry(&self, contribution: &ContributionInfo) -> LedgerResult {
        let id = contribution.contribution_id;

        let Some(_claim) = self.driving.claim(id) else {
            debug!(contribution_id = %id, "Contribution already being driven");
            return LedgerResult::Retry;
        };

        let current = match self.store.get_contribution_info(id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                warn!(contribution_id = %id, "Retry for unknown contribution");
                return LedgerResult::Error;
            }
            Err(e) => {
                error!(contribution_id = %id, error = %e, "Failed to load contribution");
                return e.result();
            }
        };

        if current.step.is_terminal() {
            debug!(contribution_id = %id, step = %current.step, "Contribution already finished");
            return LedgerResult::Error;
        }

        let retry_count = current.retry_count.max(0) + 1;
        match self
            .store
            .update_contribution_retry_count(id, current.step, retry_count)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    contribution_id = %id,
                    step = %current.step,
                    "Contribution moved on before retry"
                );
                return LedgerResult::Retry;
            }
            Err(e) => {
                error!(contribution_id = %id, error = %e, "Failed to record retry");
                return e.result();
            }
        }

        info!(
            contribution_id = %id,
            step = %current.step,
            processor = ?current.processor,
            retry_count,
            "Retrying contribution"
        );

        let outcome = self.drive(&current).await;
        self.finish(&current, outcome).await
    }

    /// Continue the action that matches the persisted step
    async fn drive(&self, contribution: &ContributionInfo) -> Result<(), ContributionError> {
        let wallet = contribution.processor.wallet_type().ok_or_else(|| {
            ContributionError::Corrupted(format!(
                "contribution {} has no processor",
                contribution.contribution_id
            ))
        })?;
        let (executor, _) = self.executors.processor_for(wallet)?;

        if executor.requires_sku_order() {
            return self.sku.run(contribution, &executor).await;
        }

        self.unblinded
            .redeem_contribution(contribution, &TokenScope::Promotion)
            .await
            .map(|_| ())
    }

    /// Write the terminal step for logically terminal outcomes; everything
    /// else stays at its step for the next retry.
    async fn finish(
        &self,
        contribution: &ContributionInfo,
        outcome: Result<(), ContributionError>,
    ) -> LedgerResult {
        let id = contribution.contribution_id;
        match outcome {
            Ok(()) => self.contribution_completed(contribution, LedgerResult::Ok).await,
            Err(e) if e.terminal_step().is_some() => {
                info!(contribution_id = %id, error = %e, "Contribution ended");
                self.contribution_completed(contribution, e.result()).await
            }
            Err(e) if e.is_defect() => {
                error!(contribution_id = %id, error = %e, "Contribution pipeline aborted");
                e.result()
            }
            Err(e) => {
                warn!(contribution_id = %id, error = %e, "Contribution left for retry");
                e.result()
            }
        }
    }

    /// Persist the terminal step for `result` and book completed amounts
    pub async fn contribution_completed(
        &self,
        contribution: &ContributionInfo,
        result: LedgerResult,
    ) -> LedgerResult {
        let id = contribution.contribution_id;
        let step = result.into_step();

        let current = match self.store.get_contribution_info(id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                error!(contribution_id = %id, "Completed contribution is missing");
                return LedgerResult::Error;
            }
            Err(e) => return e.result(),
        };

        if !current.step.can_advance_to(step) {
            error!(
                contribution_id = %id,
                from = %current.step,
                to = %step,
                "Refusing terminal step"
            );
            return LedgerResult::Error;
        }

        if let Err(e) = self
            .store
            .update_contribution_info_step_and_count(id, step, -1)
            .await
        {
            error!(contribution_id = %id, error = %e, "Contribution step and count failed");
            return e.result();
        }

        info!(
            contribution_id = %id,
            from = %current.step,
            to = %step,
            result = %result,
            "Contribution step saved"
        );

        if result.is_ok() {
            let now = chrono::Utc::now();
            let amount = current.contributed_total();
            if let Err(e) = self
                .store
                .add_balance_report_item(
                    now.year(),
                    now.month(),
                    ReportType::from(current.rewards_type),
                    amount,
                )
                .await
            {
                warn!(contribution_id = %id, error = %e, "Balance report not updated");
            }
        }

        result
    }
}
