//! Persistence Gateway
//!
//! Durable store for queue entries, contribution records, SKU orders and
//! transactions, unblinded tokens and the monthly bookkeeping the engine
//! reads. Every method fails with `ContributionError::Storage` on I/O
//! failure; callers must not advance state when a write fails.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgContributionStore;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::contribution::error::ContributionError;
use crate::contribution::step::ContributionStep;
use crate::contribution::types::{
    ContributionId, ContributionInfo, ContributionQueue, QueueId, QueuePublisher, RecurringTip,
    ReportType, SkuOrder, SkuOrderStatus, SkuTransaction, UnblindedToken,
};

pub type StoreResult<T> = Result<T, ContributionError>;

/// What happens to a queue entry when its contribution is handed off
#[derive(Debug, Clone, PartialEq)]
pub enum QueueUpdate {
    /// Entry keeps a remainder for the next backend
    Save(ContributionQueue),
    /// Entry is consumed or unsatisfiable
    Delete(QueueId),
}

#[async_trait]
pub trait ContributionStore: Send + Sync {
    // === Queue ===

    /// Insert when `queue.id == 0`, otherwise replace; returns the entry id
    async fn save_contribution_queue(&self, queue: &ContributionQueue) -> StoreResult<QueueId>;

    /// Oldest entry, publishers in their original order
    async fn get_first_contribution_queue(&self) -> StoreResult<Option<ContributionQueue>>;

    async fn delete_contribution_queue(&self, id: QueueId) -> StoreResult<()>;

    // === Contributions ===

    async fn save_contribution_info(&self, info: &ContributionInfo) -> StoreResult<()>;

    /// New contribution and queue update in one transaction
    async fn save_contribution_and_queue(
        &self,
        info: &ContributionInfo,
        queue: &QueueUpdate,
    ) -> StoreResult<()>;

    async fn get_contribution_info(
        &self,
        id: ContributionId,
    ) -> StoreResult<Option<ContributionInfo>>;

    /// Atomic CAS: update only if the persisted step equals `expected`.
    ///
    /// Returns false when another writer moved the step first.
    async fn update_contribution_info_step(
        &self,
        id: ContributionId,
        expected: ContributionStep,
        new: ContributionStep,
    ) -> StoreResult<bool>;

    /// Atomic CAS: set the retry count only while the step is still `expected`
    async fn update_contribution_retry_count(
        &self,
        id: ContributionId,
        expected: ContributionStep,
        retry_count: i32,
    ) -> StoreResult<bool>;

    /// Unconditional step + retry count write (completion bookkeeping)
    async fn update_contribution_info_step_and_count(
        &self,
        id: ContributionId,
        step: ContributionStep,
        retry_count: i32,
    ) -> StoreResult<()>;

    /// Delete spent tokens and set the publisher's contributed amount in one transaction
    async fn record_publisher_redemption(
        &self,
        id: ContributionId,
        publisher_key: &str,
        contributed_amount: Decimal,
        spent_token_ids: &[u64],
    ) -> StoreResult<()>;

    /// Non-terminal contributions, oldest first
    async fn get_not_completed_contributions(
        &self,
        limit: usize,
    ) -> StoreResult<Vec<ContributionInfo>>;

    // === SKU ===

    async fn save_sku_order(&self, order: &SkuOrder) -> StoreResult<()>;

    async fn update_sku_order_status(&self, order_id: &str, status: SkuOrderStatus)
    -> StoreResult<()>;

    async fn get_sku_order(&self, order_id: &str) -> StoreResult<Option<SkuOrder>>;

    async fn get_sku_order_by_contribution_id(
        &self,
        id: ContributionId,
    ) -> StoreResult<Option<SkuOrder>>;

    async fn save_sku_transaction(&self, transaction: &SkuTransaction) -> StoreResult<()>;

    /// Record the settled external id and complete the transaction.
    ///
    /// Rejects empty ids. Completing an already completed transaction with the
    /// same external id is a no-op; with a different one it is an error.
    async fn save_external_transaction(
        &self,
        transaction_id: &str,
        external_transaction_id: &str,
    ) -> StoreResult<()>;

    async fn get_sku_transaction_by_order_id(
        &self,
        order_id: &str,
    ) -> StoreResult<Option<SkuTransaction>>;

    // === Unblinded tokens ===

    /// Tokens already stored (same `token_value`) are skipped
    async fn save_unblinded_tokens(&self, tokens: &[UnblindedToken]) -> StoreResult<()>;

    /// Tokens ordered by id
    async fn get_all_unblinded_tokens(&self) -> StoreResult<Vec<UnblindedToken>>;

    async fn delete_unblinded_tokens(&self, ids: &[u64]) -> StoreResult<()>;

    // === Monthly reconcile ===

    async fn get_recurring_tips(&self) -> StoreResult<Vec<RecurringTip>>;

    /// Auto-contribute publisher list with percent shares
    async fn get_ac_publishers(&self) -> StoreResult<Vec<QueuePublisher>>;

    /// Next reconcile time (unix seconds), 0 when never set
    async fn get_reconcile_stamp(&self) -> StoreResult<i64>;

    async fn set_reconcile_stamp(&self, stamp: i64) -> StoreResult<()>;

    async fn add_balance_report_item(
        &self,
        year: i32,
        month: u32,
        report_type: ReportType,
        amount: Decimal,
    ) -> StoreResult<()>;
}
