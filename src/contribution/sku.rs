//! SKU Order & Credential Pipeline
//!
//! Backends that cannot redeem tokens directly buy a SKU order worth the
//! contribution, pay it through their executor, then have credentials issued
//! for the settled order and redeem those tokens to the publishers.
//!
//! ```text
//!   START ──order+pending tx──▶ EXTERNAL_TRANSACTION ──settled, issued──▶ CREDS ──redeemed──▶ done
//! ```
//!
//! Every step is persisted before the call that continues from it.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, error, info};

use super::credentials::CredentialsRegistry;
use super::error::ContributionError;
use super::executors::{TokenScope, TransferExecutor, UnblindedExecutor};
use super::step::ContributionStep;
use super::types::{
    ContributionId, ContributionInfo, CredentialsTrigger, CredsBatchType, RewardsType, SkuOrder,
    SkuOrderItem, SkuOrderItemType, SkuOrderStatus, SkuTransaction, SkuTransactionStatus,
    WalletType,
};
use crate::config::SkuConfig;
use crate::store::ContributionStore;

/// Order service
#[async_trait]
pub trait SkuService: Send + Sync {
    /// Create an order for `items` payable to `destination`
    async fn create_order(
        &self,
        destination: &str,
        items: &[SkuOrderItem],
        contribution_id: Option<ContributionId>,
    ) -> Result<SkuOrder, ContributionError>;

    /// Report the settled payment; returns the order once the merchant confirms it
    async fn send_external_transaction(
        &self,
        order: &SkuOrder,
        transaction: &SkuTransaction,
    ) -> Result<SkuOrder, ContributionError>;
}

/// Number of votes `amount` buys at `vote_price`, rounded down
pub fn votes_from_amount(amount: Decimal, vote_price: Decimal) -> u32 {
    if vote_price <= Decimal::ZERO || amount <= Decimal::ZERO {
        return 0;
    }
    (amount / vote_price).floor().to_u32().unwrap_or(u32::MAX)
}

/// Credential request for a settled order; the order must hold exactly one item
pub fn credential_trigger(order: &SkuOrder) -> Result<CredentialsTrigger, ContributionError> {
    let [item] = order.items.as_slice() else {
        return Err(ContributionError::InvalidOrder {
            order_id: order.order_id.clone(),
            items: order.items.len(),
        });
    };

    Ok(CredentialsTrigger {
        id: order.order_id.clone(),
        size: item.quantity,
        batch_type: CredsBatchType::Sku,
        data: vec![
            item.order_item_id.clone(),
            item.item_type.id().to_string(),
        ],
    })
}

pub struct SkuPipeline {
    store: Arc<dyn ContributionStore>,
    sku: Arc<dyn SkuService>,
    credentials: CredentialsRegistry,
    unblinded: Arc<UnblindedExecutor>,
    config: SkuConfig,
}

impl SkuPipeline {
    pub fn new(
        store: Arc<dyn ContributionStore>,
        sku: Arc<dyn SkuService>,
        credentials: CredentialsRegistry,
        unblinded: Arc<UnblindedExecutor>,
        config: SkuConfig,
    ) -> Self {
        Self {
            store,
            sku,
            credentials,
            unblinded,
            config,
        }
    }

    /// SKU and settlement destination for a contribution paid through `wallet`
    pub fn order_target(
        &self,
        rewards_type: RewardsType,
        wallet: WalletType,
    ) -> Result<(&str, &str), ContributionError> {
        match (rewards_type, wallet) {
            (_, WalletType::UnblindedTokens) => Err(ContributionError::InvalidRequest(
                "unblinded tokens do not buy SKU orders".to_string(),
            )),
            (RewardsType::AutoContribute, _) => Ok((
                self.config.ac_sku.as_str(),
                self.config.ac_destination.as_str(),
            )),
            (_, WalletType::AnonymousCard) => Ok((
                self.config.user_funds_sku.as_str(),
                self.config.anon_card_destination.as_str(),
            )),
            (_, WalletType::CustodialWallet) => Ok((
                self.config.user_funds_sku.as_str(),
                self.config.custodial_destination.as_str(),
            )),
        }
    }

    /// Drive a contribution from its persisted step to the end of the pipeline.
    ///
    /// `Ok` means every publisher share was redeemed as far as the issued
    /// tokens allow; the caller writes the terminal step.
    pub async fn run(
        &self,
        contribution: &ContributionInfo,
        executor: &Arc<dyn TransferExecutor>,
    ) -> Result<(), ContributionError> {
        match contribution.step {
            ContributionStep::Start => self.start(contribution, executor).await,
            ContributionStep::ExternalTransaction => {
                let order = self.existing_order(contribution.contribution_id).await?;
                self.settle(contribution, order, executor).await
            }
            ContributionStep::Creds => {
                let order = self.existing_order(contribution.contribution_id).await?;
                self.redeem(contribution, &order).await
            }
            step => Err(ContributionError::InvalidStateTransition(format!(
                "{} is already {}",
                contribution.contribution_id, step
            ))),
        }
    }

    async fn start(
        &self,
        contribution: &ContributionInfo,
        executor: &Arc<dyn TransferExecutor>,
    ) -> Result<(), ContributionError> {
        let wallet = executor.wallet_type();

        let order = match self
            .store
            .get_sku_order_by_contribution_id(contribution.contribution_id)
            .await?
        {
            Some(order) => {
                debug!(
                    contribution_id = %contribution.contribution_id,
                    order_id = %order.order_id,
                    "Reusing existing order"
                );
                order
            }
            None => self.create_order(contribution, wallet).await?,
        };

        if self
            .store
            .get_sku_transaction_by_order_id(&order.order_id)
            .await?
            .is_none()
        {
            let transaction = SkuTransaction::pending(&order, wallet.into());
            self.store.save_sku_transaction(&transaction).await?;
        }

        advance(
            self.store.as_ref(),
            contribution,
            ContributionStep::Start,
            ContributionStep::ExternalTransaction,
        )
        .await?;

        self.settle(contribution, order, executor).await
    }

    async fn create_order(
        &self,
        contribution: &ContributionInfo,
        wallet: WalletType,
    ) -> Result<SkuOrder, ContributionError> {
        let (sku, destination) = self.order_target(contribution.rewards_type, wallet)?;

        let quantity = votes_from_amount(contribution.amount, self.config.vote_price);
        if quantity == 0 {
            info!(
                contribution_id = %contribution.contribution_id,
                amount = %contribution.amount,
                "Amount does not buy a single vote"
            );
            return Err(ContributionError::NotEnoughFunds);
        }

        let item = SkuOrderItem {
            order_item_id: String::new(),
            order_id: String::new(),
            sku: sku.to_string(),
            quantity,
            price: self.config.vote_price,
            item_type: SkuOrderItemType::SingleUse,
        };

        let order = self
            .sku
            .create_order(destination, &[item], Some(contribution.contribution_id))
            .await?;
        if order.order_id.is_empty() {
            return Err(ContributionError::InvalidRequest(
                "order service returned an empty order id".to_string(),
            ));
        }

        let mut order = order;
        order.contribution_id = Some(contribution.contribution_id);
        self.store.save_sku_order(&order).await?;

        info!(
            contribution_id = %contribution.contribution_id,
            order_id = %order.order_id,
            votes = quantity,
            "SKU order created"
        );
        Ok(order)
    }

    /// Pay the order if still pending, confirm settlement, issue credentials
    async fn settle(
        &self,
        contribution: &ContributionInfo,
        order: SkuOrder,
        executor: &Arc<dyn TransferExecutor>,
    ) -> Result<(), ContributionError> {
        let transaction = self.pay(&order, executor).await?;
        let settled = self.sku.send_external_transaction(&order, &transaction).await?;

        if settled.status != SkuOrderStatus::Paid {
            return Err(ContributionError::Unavailable {
                service: "sku",
                reason: format!("order {} not settled yet", order.order_id),
            });
        }
        self.store
            .update_sku_order_status(&order.order_id, SkuOrderStatus::Paid)
            .await?;

        let trigger = match credential_trigger(&settled) {
            Ok(trigger) => trigger,
            Err(e) => {
                error!(
                    contribution_id = %contribution.contribution_id,
                    order_id = %settled.order_id,
                    error = %e,
                    "Settled order is malformed, halting pipeline"
                );
                return Err(e);
            }
        };

        let mut tokens = self
            .credentials
            .get(trigger.batch_type)?
            .start(&trigger)
            .await?;
        // Only this order's CREDS stage may spend them
        for token in &mut tokens {
            token.creds_id = trigger.id.clone();
            token.batch_type = trigger.batch_type;
        }
        self.store.save_unblinded_tokens(&tokens).await?;

        advance(
            self.store.as_ref(),
            contribution,
            ContributionStep::ExternalTransaction,
            ContributionStep::Creds,
        )
        .await?;

        self.redeem(contribution, &settled).await
    }

    /// Complete the order's transaction through `executor`, exactly once
    async fn pay(
        &self,
        order: &SkuOrder,
        executor: &Arc<dyn TransferExecutor>,
    ) -> Result<SkuTransaction, ContributionError> {
        let mut transaction = match self
            .store
            .get_sku_transaction_by_order_id(&order.order_id)
            .await?
        {
            Some(transaction) => transaction,
            None => {
                let transaction = SkuTransaction::pending(order, executor.wallet_type().into());
                self.store.save_sku_transaction(&transaction).await?;
                transaction
            }
        };

        if transaction.status == SkuTransactionStatus::Completed {
            debug!(order_id = %order.order_id, "Order already paid");
            return Ok(transaction);
        }

        let external_id = executor
            .transfer_funds(&transaction, &order.location)
            .await?;
        self.store
            .save_external_transaction(&transaction.transaction_id, &external_id)
            .await?;

        transaction.external_transaction_id = external_id;
        transaction.status = SkuTransactionStatus::Completed;
        info!(
            order_id = %order.order_id,
            external_id = %transaction.external_transaction_id,
            wallet = %executor.wallet_type(),
            "Order paid"
        );
        Ok(transaction)
    }

    async fn redeem(
        &self,
        contribution: &ContributionInfo,
        order: &SkuOrder,
    ) -> Result<(), ContributionError> {
        // Publisher progress may have moved since the caller loaded the record
        let current = self
            .store
            .get_contribution_info(contribution.contribution_id)
            .await?
            .ok_or_else(|| {
                ContributionError::NotFound(format!("contribution {}", contribution.contribution_id))
            })?;

        self.unblinded
            .redeem_contribution(&current, &TokenScope::Order(order.order_id.clone()))
            .await?;
        Ok(())
    }

    async fn existing_order(&self, id: ContributionId) -> Result<SkuOrder, ContributionError> {
        self.store
            .get_sku_order_by_contribution_id(id)
            .await?
            .ok_or_else(|| ContributionError::NotFound(format!("order for contribution {}", id)))
    }

    /// Buy `items` from `destination` outside any contribution
    pub async fn purchase(
        &self,
        items: Vec<SkuOrderItem>,
        destination: &str,
        executor: &Arc<dyn TransferExecutor>,
    ) -> Result<SkuOrder, ContributionError> {
        if items.is_empty() {
            return Err(ContributionError::InvalidRequest("no items".to_string()));
        }

        let order = self.sku.create_order(destination, &items, None).await?;
        self.store.save_sku_order(&order).await?;

        let transaction = self.pay(&order, executor).await?;
        let settled = self.sku.send_external_transaction(&order, &transaction).await?;
        self.store
            .update_sku_order_status(&order.order_id, settled.status)
            .await?;
        Ok(settled)
    }
}

/// CAS a step forward; losing the race is a defect for this contribution
pub(crate) async fn advance(
    store: &dyn ContributionStore,
    contribution: &ContributionInfo,
    from: ContributionStep,
    to: ContributionStep,
) -> Result<(), ContributionError> {
    if !from.can_advance_to(to) {
        return Err(ContributionError::InvalidStateTransition(format!(
            "{} -> {}",
            from, to
        )));
    }

    if !store
        .update_contribution_info_step(contribution.contribution_id, from, to)
        .await?
    {
        return Err(ContributionError::InvalidStateTransition(format!(
            "{} is no longer {}",
            contribution.contribution_id, from
        )));
    }

    info!(
        contribution_id = %contribution.contribution_id,
        from = %from,
        to = %to,
        "Contribution step saved"
    );
    Ok(())
}

/// Mock order service for testing
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub struct MockSkuService {
        create_count: AtomicUsize,
        settle_count: AtomicUsize,
        /// Extra items appended to settled orders
        extra_items: Mutex<usize>,
        unsettled: Mutex<bool>,
    }

    impl MockSkuService {
        pub fn new() -> Self {
            Self {
                create_count: AtomicUsize::new(0),
                settle_count: AtomicUsize::new(0),
                extra_items: Mutex::new(0),
                unsettled: Mutex::new(false),
            }
        }

        pub fn set_extra_items(&self, extra: usize) {
            *self.extra_items.lock().unwrap() = extra;
        }

        pub fn set_unsettled(&self, unsettled: bool) {
            *self.unsettled.lock().unwrap() = unsettled;
        }

        pub fn create_count(&self) -> usize {
            self.create_count.load(Ordering::SeqCst)
        }

        pub fn settle_count(&self) -> usize {
            self.settle_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SkuService for MockSkuService {
        async fn create_order(
            &self,
            destination: &str,
            items: &[SkuOrderItem],
            contribution_id: Option<ContributionId>,
        ) -> Result<SkuOrder, ContributionError> {
            let n = self.create_count.fetch_add(1, Ordering::SeqCst);
            let order_id = format!("order-{}", n + 1);
            let items: Vec<_> = items
                .iter()
                .enumerate()
                .map(|(i, item)| SkuOrderItem {
                    order_item_id: format!("{}-item-{}", order_id, i),
                    order_id: order_id.clone(),
                    ..item.clone()
                })
                .collect();

            Ok(SkuOrder {
                total_amount: items
                    .iter()
                    .map(|i| i.price * Decimal::from(i.quantity))
                    .sum(),
                order_id,
                location: destination.to_string(),
                status: SkuOrderStatus::Pending,
                items,
                contribution_id,
            })
        }

        async fn send_external_transaction(
            &self,
            order: &SkuOrder,
            _transaction: &SkuTransaction,
        ) -> Result<SkuOrder, ContributionError> {
            self.settle_count.fetch_add(1, Ordering::SeqCst);

            let mut settled = order.clone();
            if !*self.unsettled.lock().unwrap() {
                settled.status = SkuOrderStatus::Paid;
            }
            for _ in 0..*self.extra_items.lock().unwrap() {
                if let Some(first) = order.items.first() {
                    settled.items.push(first.clone());
                }
            }
            Ok(settled)
        }
    }
}

#[cfg(test)]
pub use mock::MockSkuService;
