//! In-process store
//!
//! Same semantics as the PostgreSQL store, held behind one mutex so every
//! method is atomic. Backs dry runs and tests; `set_fail_writes` makes every
//! write fail with a storage error.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::{ContributionStore, QueueUpdate, StoreResult};
use crate::contribution::error::ContributionError;
use crate::contribution::step::ContributionStep;
use crate::contribution::types::{
    ContributionId, ContributionInfo, ContributionQueue, QueueId, QueuePublisher, RecurringTip,
    ReportType, SkuOrder, SkuOrderStatus, SkuTransaction, SkuTransactionStatus, UnblindedToken,
};

#[derive(Default)]
struct Inner {
    last_queue_id: QueueId,
    queue: BTreeMap<QueueId, ContributionQueue>,
    contributions: HashMap<ContributionId, ContributionInfo>,
    orders: HashMap<String, SkuOrder>,
    transactions: HashMap<String, SkuTransaction>,
    last_token_id: u64,
    tokens: BTreeMap<u64, UnblindedToken>,
    recurring_tips: Vec<RecurringTip>,
    ac_publishers: Vec<QueuePublisher>,
    reconcile_stamp: i64,
    balance_report: HashMap<(i32, u32, ReportType), Decimal>,
}

impl Inner {
    fn put_queue(&mut self, queue: &ContributionQueue) -> QueueId {
        let mut entry = queue.clone();
        if entry.id == 0 {
            self.last_queue_id += 1;
            entry.id = self.last_queue_id;
        } else {
            self.last_queue_id = self.last_queue_id.max(entry.id);
        }
        let id = entry.id;
        self.queue.insert(id, entry);
        id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn add_recurring_tip(&self, publisher_key: impl Into<String>, amount: Decimal) {
        self.lock().recurring_tips.push(RecurringTip {
            publisher_key: publisher_key.into(),
            amount,
        });
    }

    pub fn set_ac_publishers(&self, publishers: Vec<QueuePublisher>) {
        self.lock().ac_publishers = publishers;
    }

    /// Queue entries ordered oldest first
    pub fn queue_entries(&self) -> Vec<ContributionQueue> {
        self.lock().queue.values().cloned().collect()
    }

    pub fn contributions(&self) -> Vec<ContributionInfo> {
        let mut all: Vec<_> = self.lock().contributions.values().cloned().collect();
        all.sort_by_key(|c| (c.created_at, c.contribution_id));
        all
    }

    pub fn sku_transactions(&self) -> Vec<SkuTransaction> {
        self.lock().transactions.values().cloned().collect()
    }

    pub fn balance_report_item(&self, year: i32, month: u32, report_type: ReportType) -> Decimal {
        self.lock()
            .balance_report
            .get(&(year, month, report_type))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn writable(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ContributionError::Storage("write rejected".to_string()));
        }
        Ok(self.lock())
    }
}

#[async_trait]
impl ContributionStore for MemoryStore {
    async fn save_contribution_queue(&self, queue: &ContributionQueue) -> StoreResult<QueueId> {
        Ok(self.writable()?.put_queue(queue))
    }

    async fn get_first_contribution_queue(&self) -> StoreResult<Option<ContributionQueue>> {
        Ok(self.lock().queue.values().next().cloned())
    }

    async fn delete_contribution_queue(&self, id: QueueId) -> StoreResult<()> {
        self.writable()?.queue.remove(&id);
        Ok(())
    }

    async fn save_contribution_info(&self, info: &ContributionInfo) -> StoreResult<()> {
        self.writable()?
            .contributions
            .insert(info.contribution_id, info.clone());
        Ok(())
    }

    async fn save_contribution_and_queue(
        &self,
        info: &ContributionInfo,
        queue: &QueueUpdate,
    ) -> StoreResult<()> {
        let mut inner = self.writable()?;
        inner.contributions.insert(info.contribution_id, info.clone());
        match queue {
            QueueUpdate::Save(entry) => {
                inner.put_queue(entry);
            }
            QueueUpdate::Delete(id) => {
                inner.queue.remove(id);
            }
        }
        Ok(())
    }

    async fn get_contribution_info(
        &self,
        id: ContributionId,
    ) -> StoreResult<Option<ContributionInfo>> {
        Ok(self.lock().contributions.get(&id).cloned())
    }

    async fn update_contribution_info_step(
        &self,
        id: ContributionId,
        expected: ContributionStep,
        new: ContributionStep,
    ) -> StoreResult<bool> {
        let mut inner = self.writable()?;
        match inner.contributions.get_mut(&id) {
            Some(info) if info.step == expected => {
                info.step = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_contribution_retry_count(
        &self,
        id: ContributionId,
        expected: ContributionStep,
        retry_count: i32,
    ) -> StoreResult<bool> {
        let mut inner = self.writable()?;
        match inner.contributions.get_mut(&id) {
            Some(info) if info.step == expected => {
                info.retry_count = retry_count;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_contribution_info_step_and_count(
        &self,
        id: ContributionId,
        step: ContributionStep,
        retry_count: i32,
    ) -> StoreResult<()> {
        let mut inner = self.writable()?;
        let info = inner
            .contributions
            .get_mut(&id)
            .ok_or_else(|| ContributionError::NotFound(format!("contribution {}", id)))?;
        info.step = step;
        info.retry_count = retry_count;
        Ok(())
    }

    async fn record_publisher_redemption(
        &self,
        id: ContributionId,
        publisher_key: &str,
        contributed_amount: Decimal,
        spent_token_ids: &[u64],
    ) -> StoreResult<()> {
        let mut inner = self.writable()?;
        let publisher = inner
            .contributions
            .get_mut(&id)
            .and_then(|c| {
                c.publishers
                    .iter_mut()
                    .find(|p| p.publisher_key == publisher_key)
            })
            .ok_or_else(|| {
                ContributionError::NotFound(format!("publisher {} of {}", publisher_key, id))
            })?;
        publisher.contributed_amount = contributed_amount;

        for token_id in spent_token_ids {
            inner.tokens.remove(token_id);
        }
        Ok(())
    }

    async fn get_not_completed_contributions(
        &self,
        limit: usize,
    ) -> StoreResult<Vec<ContributionInfo>> {
        let mut pending: Vec<_> = self
            .lock()
            .contributions
            .values()
            .filter(|c| !c.step.is_terminal())
            .cloned()
            .collect();
        pending.sort_by_key(|c| (c.created_at, c.contribution_id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn save_sku_order(&self, order: &SkuOrder) -> StoreResult<()> {
        self.writable()?
            .orders
            .insert(order.order_id.clone(), order.clone());
        Ok(())
    }

    async fn update_sku_order_status(
        &self,
        order_id: &str,
        status: SkuOrderStatus,
    ) -> StoreResult<()> {
        let mut inner = self.writable()?;
        let order = inner
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ContributionError::NotFound(format!("order {}", order_id)))?;
        order.status = status;
        Ok(())
    }

    async fn get_sku_order(&self, order_id: &str) -> StoreResult<Option<SkuOrder>> {
        Ok(self.lock().orders.get(order_id).cloned())
    }

    async fn get_sku_order_by_contribution_id(
        &self,
        id: ContributionId,
    ) -> StoreResult<Option<SkuOrder>> {
        Ok(self
            .lock()
            .orders
            .values()
            .find(|o| o.contribution_id == Some(id))
            .cloned())
    }

    async fn save_sku_transaction(&self, transaction: &SkuTransaction) -> StoreResult<()> {
        if transaction.transaction_id.is_empty() {
            return Err(ContributionError::InvalidRequest(
                "transaction id is empty".to_string(),
            ));
        }
        self.writable()?
            .transactions
            .insert(transaction.transaction_id.clone(), transaction.clone());
        Ok(())
    }

    async fn save_external_transaction(
        &self,
        transaction_id: &str,
        external_transaction_id: &str,
    ) -> StoreResult<()> {
        if transaction_id.is_empty() || external_transaction_id.is_empty() {
            return Err(ContributionError::InvalidRequest(
                "transaction id or external transaction id is empty".to_string(),
            ));
        }

        let mut inner = self.writable()?;
        let transaction = inner
            .transactions
            .get_mut(transaction_id)
            .ok_or_else(|| ContributionError::NotFound(format!("transaction {}", transaction_id)))?;

        match transaction.status {
            SkuTransactionStatus::Completed
                if transaction.external_transaction_id == external_transaction_id =>
            {
                Ok(())
            }
            SkuTransactionStatus::Completed => Err(ContributionError::InvalidStateTransition(
                format!("transaction {} already completed", transaction_id),
            )),
            SkuTransactionStatus::Pending => {
                transaction.external_transaction_id = external_transaction_id.to_string();
                transaction.status = SkuTransactionStatus::Completed;
                Ok(())
            }
        }
    }

    async fn get_sku_transaction_by_order_id(
        &self,
        order_id: &str,
    ) -> StoreResult<Option<SkuTransaction>> {
        Ok(self
            .lock()
            .transactions
            .values()
            .find(|t| t.order_id == order_id)
            .cloned())
    }

    async fn save_unblinded_tokens(&self, tokens: &[UnblindedToken]) -> StoreResult<()> {
        let mut inner = self.writable()?;
        for token in tokens {
            if inner
                .tokens
                .values()
                .any(|t| t.token_value == token.token_value)
            {
                continue;
            }
            inner.last_token_id += 1;
            let mut stored = token.clone();
            stored.token_id = inner.last_token_id;
            inner.tokens.insert(stored.token_id, stored);
        }
        Ok(())
    }

    async fn get_all_unblinded_tokens(&self) -> StoreResult<Vec<UnblindedToken>> {
        Ok(self.lock().tokens.values().cloned().collect())
    }

    async fn delete_unblinded_tokens(&self, ids: &[u64]) -> StoreResult<()> {
        let mut inner = self.writable()?;
        for id in ids {
            inner.tokens.remove(id);
        }
        Ok(())
    }

    async fn get_recurring_tips(&self) -> StoreResult<Vec<RecurringTip>> {
        Ok(self.lock().recurring_tips.clone())
    }

    async fn get_ac_publishers(&self) -> StoreResult<Vec<QueuePublisher>> {
        Ok(self.lock().ac_publishers.clone())
    }

    async fn get_reconcile_stamp(&self) -> StoreResult<i64> {
        Ok(self.lock().reconcile_stamp)
    }

    async fn set_reconcile_stamp(&self, stamp: i64) -> StoreResult<()> {
        self.writable()?.reconcile_stamp = stamp;
        Ok(())
    }

    async fn add_balance_report_item(
        &self,
        year: i32,
        month: u32,
        report_type: ReportType,
        amount: Decimal,
    ) -> StoreResult<()> {
        *self
            .writable()?
            .balance_report
            .entry((year, month, report_type))
            .or_insert(Decimal::ZERO) += amount;
        Ok(())
    }
}
