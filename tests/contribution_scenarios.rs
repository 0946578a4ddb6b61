//! Black-box scenarios against the public engine API.
//!
//! Collaborators are local stubs; the store is the in-process `MemoryStore`.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;

use contribution_engine::config::{EngineConfig, Environment, SkuConfig};
use contribution_engine::contribution::types::{
    CredentialsRedeem, CredentialsTrigger, CredsBatchType, SkuOrderStatus,
};
use contribution_engine::contribution::{
    Balance, ContributionError, ContributionId, ContributionStep, Credentials,
    CredentialsRegistry, ExecutorRegistry, FixedBalance, LedgerResult, QueueOutcome, SkuOrder,
    SkuOrderItem, SkuService, SkuTransaction, TransferExecutor, UnblindedToken, WalletType,
};
use contribution_engine::{ContributionEngine, ContributionStore, MemoryStore};

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

struct StubSku {
    orders: AtomicUsize,
}

#[async_trait]
impl SkuService for StubSku {
    async fn create_order(
        &self,
        destination: &str,
        items: &[SkuOrderItem],
        contribution_id: Option<ContributionId>,
    ) -> Result<SkuOrder, ContributionError> {
        let n = self.orders.fetch_add(1, Ordering::SeqCst) + 1;
        let order_id = format!("stub-order-{}", n);
        let items: Vec<_> = items
            .iter()
            .map(|item| SkuOrderItem {
                order_item_id: format!("{}-item", order_id),
                order_id: order_id.clone(),
                ..item.clone()
            })
            .collect();
        Ok(SkuOrder {
            total_amount: items.iter().map(|i| i.price * Decimal::from(i.quantity)).sum(),
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
        let mut settled = order.clone();
        settled.status = SkuOrderStatus::Paid;
        Ok(settled)
    }
}

struct StubCredentials {
    redeemed: AtomicUsize,
}

#[async_trait]
impl Credentials for StubCredentials {
    async fn start(
        &self,
        trigger: &CredentialsTrigger,
    ) -> Result<Vec<UnblindedToken>, ContributionError> {
        Ok((0..trigger.size)
            .map(|i| UnblindedToken {
                token_id: 0,
                token_value: format!("{}-{}", trigger.id, i),
                public_key: "stub".to_string(),
                value: dec("0.25"),
                creds_id: trigger.id.clone(),
                batch_type: trigger.batch_type,
                expires_at: 0,
            })
            .collect())
    }

    async fn redeem_tokens(&self, _redeem: &CredentialsRedeem) -> Result<(), ContributionError> {
        self.redeemed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct StubCard;

#[async_trait]
impl TransferExecutor for StubCard {
    fn wallet_type(&self) -> WalletType {
        WalletType::AnonymousCard
    }

    async fn transfer_funds(
        &self,
        transaction: &SkuTransaction,
        _destination: &str,
    ) -> Result<String, ContributionError> {
        Ok(format!("card-{}", transaction.transaction_id))
    }
}

fn engine(store: Arc<MemoryStore>, balance: Balance) -> (ContributionEngine, Arc<StubCredentials>) {
    let credentials = Arc::new(StubCredentials {
        redeemed: AtomicUsize::new(0),
    });
    let (engine, _fired) = ContributionEngine::new(
        store,
        Arc::new(FixedBalance::new(balance)),
        Arc::new(StubSku {
            orders: AtomicUsize::new(0),
        }),
        CredentialsRegistry::new().register(CredsBatchType::Sku, credentials.clone()),
        ExecutorRegistry::new().register(Arc::new(StubCard)),
        EngineConfig {
            testing: true,
            ..EngineConfig::default()
        },
        SkuConfig::for_environment(Environment::Development),
    );
    (engine, credentials)
}

#[tokio::test]
async fn one_time_tip_settles_through_anonymous_card() {
    let store = Arc::new(MemoryStore::new());
    let (engine, credentials) = engine(
        store.clone(),
        Balance::with_wallets([(WalletType::AnonymousCard, dec("3"))]),
    );

    assert_eq!(engine.one_time_tip("publisher.com", dec("2")).await, LedgerResult::Ok);
    assert_eq!(
        engine.process_contribution_queue().await,
        QueueOutcome::Processed(LedgerResult::Ok)
    );

    let pending = store.get_not_completed_contributions(10).await.unwrap();
    assert!(pending.is_empty());
    assert!(store.get_first_contribution_queue().await.unwrap().is_none());
    assert_eq!(credentials.redeemed.load(Ordering::SeqCst), 1);

    let contribution = &store.contributions()[0];
    assert_eq!(contribution.step, ContributionStep::Completed);
    assert_eq!(contribution.contributed_total(), dec("2"));
}

#[tokio::test]
async fn tip_larger_than_balance_is_refused() {
    let store = Arc::new(MemoryStore::new());
    let (engine, _) = engine(
        store.clone(),
        Balance::with_wallets([(WalletType::AnonymousCard, dec("1"))]),
    );

    assert_eq!(
        engine.one_time_tip("publisher.com", dec("2")).await,
        LedgerResult::NotEnoughFunds
    );
    assert_eq!(engine.process_contribution_queue().await, QueueOutcome::Idle);
}

#[tokio::test]
async fn monthly_tips_gate_on_total_balance() {
    let store = Arc::new(MemoryStore::new());
    store.add_recurring_tip("a.com", dec("1"));
    store.add_recurring_tip("b.com", dec("1.5"));
    let (engine, _) = engine(
        store,
        Balance::with_wallets([(WalletType::AnonymousCard, dec("2"))]),
    );

    assert!(!engine.has_sufficient_balance().await.unwrap());
}
