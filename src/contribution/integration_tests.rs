//! Integration Tests for the Contribution Engine
//!
//! Full queue-to-completion flows against `MemoryStore` with mock
//! collaborators for balance, orders, credentials and transfer backends.

#[cfg(test)]
mod integration_tests {
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::Duration;

    use rust_decimal::Decimal;
    use tokio::sync::mpsc;

    use crate::config::{EngineConfig, Environment, SkuConfig};
    use crate::contribution::balance::FixedBalance;
    use crate::contribution::credentials::{CredentialsRegistry, MockCredentials};
    use crate::contribution::engine::{ContributionEngine, QueueOutcome};
    use crate::contribution::error::LedgerResult;
    use crate::contribution::executors::MockExecutor;
    use crate::contribution::router::ExecutorRegistry;
    use crate::contribution::scheduler::{TimerId, TimerKind};
    use crate::contribution::sku::MockSkuService;
    use crate::contribution::step::ContributionStep;
    use crate::contribution::types::{
        Balance, ContributionInfo, ContributionQueue, CredsBatchType, QueuePublisher,
        RewardsType, SkuOrderItem, SkuOrderItemType, UnblindedToken, WalletType,
    };
    use crate::contribution::worker::{RecoveryWorker, WorkerConfig};
    use crate::store::{ContributionStore, MemoryStore};

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    struct TestHarness {
        engine: Arc<ContributionEngine>,
        fired: mpsc::UnboundedReceiver<TimerId>,
        store: Arc<MemoryStore>,
        balance: Arc<FixedBalance>,
        card: Arc<MockExecutor>,
        custodial: Arc<MockExecutor>,
        sku: Arc<MockSkuService>,
        sku_credentials: Arc<MockCredentials>,
        promotion_credentials: Arc<MockCredentials>,
    }

    impl TestHarness {
        fn new(chain: Vec<WalletType>, balance: Balance) -> Self {
            Self::with_config(
                EngineConfig {
                    testing: true,
                    processor_chain: chain,
                    ..EngineConfig::default()
                },
                balance,
            )
        }

        fn with_config(config: EngineConfig, balance: Balance) -> Self {
            let store = Arc::new(MemoryStore::new());
            let balance = Arc::new(FixedBalance::new(balance));
            let card = Arc::new(MockExecutor::new(WalletType::AnonymousCard));
            let custodial = Arc::new(MockExecutor::new(WalletType::CustodialWallet));
            let sku = Arc::new(MockSkuService::new());
            let sku_credentials = Arc::new(MockCredentials::new(CredsBatchType::Sku, dec("0.25")));
            let promotion_credentials =
                Arc::new(MockCredentials::new(CredsBatchType::Promotion, dec("0.25")));

            let credentials = CredentialsRegistry::new()
                .register(CredsBatchType::Sku, sku_credentials.clone())
                .register(CredsBatchType::Promotion, promotion_credentials.clone());
            let executors = ExecutorRegistry::new()
                .register(card.clone())
                .register(custodial.clone());

            let (engine, fired) = ContributionEngine::new(
                store.clone(),
                balance.clone(),
                sku.clone(),
                credentials,
                executors,
                config,
                SkuConfig::for_environment(Environment::Development),
            );

            Self {
                engine: Arc::new(engine),
                fired,
                store,
                balance,
                card,
                custodial,
                sku,
                sku_credentials,
                promotion_credentials,
            }
        }

        async fn enqueue(&self, entry: ContributionQueue) {
            self.store.save_contribution_queue(&entry).await.unwrap();
        }

        async fn reload(&self, contribution: &ContributionInfo) -> ContributionInfo {
            self.store
                .get_contribution_info(contribution.contribution_id)
                .await
                .unwrap()
                .unwrap()
        }

        async fn give_promotion_tokens(&self, count: usize, value: &str) {
            let tokens: Vec<_> = (0..count)
                .map(|i| UnblindedToken {
                    token_id: 0,
                    token_value: format!("promo-{}", i),
                    public_key: "key".to_string(),
                    value: dec(value),
                    creds_id: "promotion-1".to_string(),
                    batch_type: CredsBatchType::Promotion,
                    expires_at: 0,
                })
                .collect();
            self.store.save_unblinded_tokens(&tokens).await.unwrap();
        }

        /// Sum of contributed amounts never exceeds the contribution amount
        fn assert_sum_invariant(&self) {
            for c in self.store.contributions() {
                assert!(
                    c.contributed_total() <= c.amount,
                    "{} contributed {} of {}",
                    c.contribution_id,
                    c.contributed_total(),
                    c.amount
                );
            }
        }
    }

    fn card_and_custodial(card: &str, custodial: &str) -> Balance {
        Balance::with_wallets([
            (WalletType::AnonymousCard, dec(card)),
            (WalletType::CustodialWallet, dec(custodial)),
        ])
    }

    // ========================================================================
    // Queue processing
    // ========================================================================

    /// Tip of 10 against a backend holding 4: 4 is processed there, the
    /// remaining 6 goes to the next backend.
    #[tokio::test]
    async fn test_tip_split_across_backends() {
        let h = TestHarness::new(
            vec![WalletType::AnonymousCard, WalletType::CustodialWallet],
            card_and_custodial("4", "6"),
        );
        h.enqueue(ContributionQueue::single(RewardsType::OneTimeTip, "P1", dec("10")))
            .await;

        assert_eq!(
            h.engine.process_contribution_queue().await,
            QueueOutcome::Processed(LedgerResult::Ok)
        );

        let contributions = h.store.contributions();
        assert_eq!(contributions.len(), 2);

        let by_card = contributions
            .iter()
            .find(|c| c.processor.wallet_type() == Some(WalletType::AnonymousCard))
            .unwrap();
        assert_eq!(by_card.amount, dec("4"));
        assert_eq!(by_card.publishers[0].publisher_key, "P1");
        assert_eq!(by_card.publishers[0].total_amount, dec("4"));

        let by_custodial = contributions
            .iter()
            .find(|c| c.processor.wallet_type() == Some(WalletType::CustodialWallet))
            .unwrap();
        assert_eq!(by_custodial.amount, dec("6"));
        assert_eq!(by_custodial.publishers[0].total_amount, dec("6"));

        assert!(contributions.iter().all(|c| c.step == ContributionStep::Completed));
        assert!(h.store.queue_entries().is_empty());
        assert_eq!(h.card.transfer_count(), 1);
        assert_eq!(h.custodial.transfer_count(), 1);
        h.assert_sum_invariant();
    }

    /// Remainder is re-queued, not discarded, when the next backend cannot
    /// settle yet.
    #[tokio::test]
    async fn test_remainder_requeued_before_next_backend_runs() {
        let h = TestHarness::new(
            vec![WalletType::AnonymousCard, WalletType::CustodialWallet],
            card_and_custodial("4", "6"),
        );
        h.custodial.set_pending_transfer(true);
        h.enqueue(ContributionQueue::single(RewardsType::OneTimeTip, "P1", dec("10")))
            .await;

        h.engine.process_contribution_queue().await;

        // Both hand-offs committed; the custodial one waits at EXTERNAL_TRANSACTION
        let contributions = h.store.contributions();
        assert_eq!(contributions.len(), 2);
        let waiting = contributions
            .iter()
            .find(|c| c.processor.wallet_type() == Some(WalletType::CustodialWallet))
            .unwrap();
        assert_eq!(waiting.step, ContributionStep::ExternalTransaction);
        assert_eq!(waiting.amount, dec("6"));
        assert!(h.store.queue_entries().is_empty());
    }

    #[tokio::test]
    async fn test_processor_exhaustion_deletes_entry_once() {
        // Custodial funds exist but the chain never reaches them
        let h = TestHarness::new(vec![WalletType::AnonymousCard], card_and_custodial("4", "6"));
        h.enqueue(ContributionQueue::single(RewardsType::OneTimeTip, "P1", dec("10")))
            .await;

        assert_eq!(
            h.engine.process_contribution_queue().await,
            QueueOutcome::Processed(LedgerResult::NotEnoughFunds)
        );

        let contributions = h.store.contributions();
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].amount, dec("4"));
        assert!(contributions.iter().all(|c| c.amount > Decimal::ZERO));
        assert!(h.store.queue_entries().is_empty());

        assert_eq!(h.engine.process_contribution_queue().await, QueueOutcome::Idle);
    }

    #[tokio::test]
    async fn test_full_entry_over_total_balance() {
        let h = TestHarness::new(
            vec![WalletType::AnonymousCard, WalletType::CustodialWallet],
            card_and_custodial("4", "5"),
        );
        h.enqueue(ContributionQueue::single(RewardsType::RecurringTip, "P1", dec("10")))
            .await;

        assert_eq!(
            h.engine.process_contribution_queue().await,
            QueueOutcome::Processed(LedgerResult::NotEnoughFunds)
        );
        assert!(h.store.contributions().is_empty());
        assert!(h.store.queue_entries().is_empty());
    }

    #[tokio::test]
    async fn test_partial_auto_contribute_clamped_to_total() {
        let h = TestHarness::new(
            vec![WalletType::AnonymousCard, WalletType::CustodialWallet],
            card_and_custodial("2", "1"),
        );
        h.enqueue(ContributionQueue::new(
            RewardsType::AutoContribute,
            dec("20"),
            true,
            vec![
                QueuePublisher::new("A", dec("50")),
                QueuePublisher::new("B", dec("50")),
            ],
        ))
        .await;

        assert_eq!(
            h.engine.process_contribution_queue().await,
            QueueOutcome::Processed(LedgerResult::Ok)
        );

        let contributions = h.store.contributions();
        let total: Decimal = contributions.iter().map(|c| c.amount).sum();
        assert_eq!(total, dec("3"));
        // Auto-contribute keeps every publisher on each backend
        assert!(contributions.iter().all(|c| c.publishers.len() == 2));
        assert!(h.store.queue_entries().is_empty());
        h.assert_sum_invariant();
    }

    #[tokio::test]
    async fn test_duplicate_publishers_entry_removed() {
        let h = TestHarness::new(vec![WalletType::AnonymousCard], card_and_custodial("5", "0"));
        h.enqueue(ContributionQueue::new(
            RewardsType::RecurringTip,
            dec("1"),
            false,
            vec![
                QueuePublisher::new("A", dec("50")),
                QueuePublisher::new("A", dec("50")),
            ],
        ))
        .await;
        h.enqueue(ContributionQueue::single(RewardsType::OneTimeTip, "P2", dec("1")))
            .await;

        assert_eq!(
            h.engine.process_contribution_queue().await,
            QueueOutcome::Processed(LedgerResult::Retry)
        );
        assert!(h.store.contributions().is_empty());

        // The entry behind it is not blocked
        assert_eq!(
            h.engine.process_contribution_queue().await,
            QueueOutcome::Processed(LedgerResult::Ok)
        );
        assert!(h.store.queue_entries().is_empty());
    }

    #[tokio::test]
    async fn test_queue_drains_one_entry_per_cycle() {
        let h = TestHarness::new(
            vec![WalletType::AnonymousCard],
            card_and_custodial("10", "0"),
        );
        h.enqueue(ContributionQueue::single(RewardsType::OneTimeTip, "P1", dec("1")))
            .await;
        h.enqueue(ContributionQueue::single(RewardsType::OneTimeTip, "P2", dec("1")))
            .await;

        h.engine.process_contribution_queue().await;
        assert_eq!(h.store.queue_entries().len(), 1);
        assert!(h.engine.timers().is_armed(TimerKind::Queue));

        h.engine.process_contribution_queue().await;
        assert!(h.store.queue_entries().is_empty());
        assert_eq!(h.store.contributions().len(), 2);
    }

    /// Shares that are not whole votes still spend every token the order bought
    #[tokio::test]
    async fn test_uneven_shares_leave_no_order_tokens() {
        let h = TestHarness::new(vec![WalletType::AnonymousCard], card_and_custodial("5", "0"));
        h.enqueue(ContributionQueue::new(
            RewardsType::RecurringTip,
            dec("1"),
            false,
            vec![
                QueuePublisher::new("A", dec("34")),
                QueuePublisher::new("B", dec("33")),
                QueuePublisher::new("C", dec("33")),
            ],
        ))
        .await;

        assert_eq!(
            h.engine.process_contribution_queue().await,
            QueueOutcome::Processed(LedgerResult::Ok)
        );

        let contribution = h.store.contributions().remove(0);
        assert_eq!(contribution.step, ContributionStep::Completed);
        assert!(contribution.publishers.iter().all(|p| p.contributed_amount > Decimal::ZERO));
        assert!(h.store.get_all_unblinded_tokens().await.unwrap().is_empty());
        assert_eq!(h.card.transfer_count(), 1);
        h.assert_sum_invariant();
    }

    // ========================================================================
    // Unblinded tokens
    // ========================================================================

    #[tokio::test]
    async fn test_unblinded_tokens_redeemed_directly() {
        let h = TestHarness::new(
            vec![WalletType::UnblindedTokens, WalletType::AnonymousCard],
            Balance::with_wallets([(WalletType::UnblindedTokens, dec("1"))]),
        );
        h.give_promotion_tokens(4, "0.25").await;
        h.enqueue(ContributionQueue::single(RewardsType::OneTimeTip, "P1", dec("1")))
            .await;

        assert_eq!(
            h.engine.process_contribution_queue().await,
            QueueOutcome::Processed(LedgerResult::Ok)
        );

        let contribution = h.store.contributions().remove(0);
        assert_eq!(contribution.step, ContributionStep::Completed);
        assert_eq!(contribution.publishers[0].contributed_amount, dec("1"));
        assert_eq!(h.promotion_credentials.redeem_count(), 1);
        assert!(h.store.get_all_unblinded_tokens().await.unwrap().is_empty());
        assert_eq!(h.sku.create_count(), 0);
    }

    #[tokio::test]
    async fn test_unblinded_shortfall_consumes_nothing() {
        let h = TestHarness::new(
            vec![WalletType::UnblindedTokens],
            Balance::with_wallets([(WalletType::UnblindedTokens, dec("1"))]),
        );
        // Tokens larger than the share cannot be split
        h.give_promotion_tokens(1, "2").await;
        h.enqueue(ContributionQueue::single(RewardsType::OneTimeTip, "P1", dec("1")))
            .await;

        assert_eq!(
            h.engine.process_contribution_queue().await,
            QueueOutcome::Processed(LedgerResult::NotEnoughFunds)
        );
        assert_eq!(
            h.store.contributions()[0].step,
            ContributionStep::NotEnoughFunds
        );
        assert_eq!(h.store.get_all_unblinded_tokens().await.unwrap().len(), 1);
        assert_eq!(h.promotion_credentials.redeem_count(), 0);
    }

    /// Merchant payment needs 5.0, tokens sum to 3.0
    #[tokio::test]
    async fn test_merchant_payment_not_enough_tokens() {
        let h = TestHarness::new(vec![WalletType::UnblindedTokens], Balance::default());
        h.give_promotion_tokens(3, "1").await;

        let item = SkuOrderItem {
            order_item_id: String::new(),
            order_id: String::new(),
            sku: "merchant-sku".to_string(),
            quantity: 1,
            price: dec("5"),
            item_type: SkuOrderItemType::SingleUse,
        };
        let result = h
            .engine
            .process_sku(vec![item], "merchant", WalletType::UnblindedTokens)
            .await;

        assert_eq!(
            result.as_ref().map_err(|e| e.result()).err(),
            Some(LedgerResult::NotEnoughFunds)
        );
        assert_eq!(h.store.get_all_unblinded_tokens().await.unwrap().len(), 3);
        assert_eq!(h.promotion_credentials.redeem_count(), 0);
    }

    #[tokio::test]
    async fn test_merchant_payment_settles_order() {
        let h = TestHarness::new(vec![WalletType::UnblindedTokens], Balance::default());
        h.give_promotion_tokens(3, "1").await;

        let item = SkuOrderItem {
            order_item_id: String::new(),
            order_id: String::new(),
            sku: "merchant-sku".to_string(),
            quantity: 2,
            price: dec("1"),
            item_type: SkuOrderItemType::SingleUse,
        };
        let order = h
            .engine
            .process_sku(vec![item], "merchant", WalletType::UnblindedTokens)
            .await
            .unwrap();

        assert_eq!(order.location, "merchant");
        assert_eq!(h.store.get_all_unblinded_tokens().await.unwrap().len(), 1);
        let redeemed = h.promotion_credentials.redeemed();
        assert_eq!(redeemed.len(), 1);
        assert_eq!(redeemed[0].rewards_type, RewardsType::Payment);
        assert_eq!(redeemed[0].publisher_key, "merchant");
    }

    // ========================================================================
    // Retry & recovery
    // ========================================================================

    #[tokio::test]
    async fn test_retry_at_creds_is_driven_by_persisted_step() {
        let h = TestHarness::new(vec![WalletType::AnonymousCard], card_and_custodial("5", "0"));
        h.sku_credentials.set_unavailable_redeem(true);
        h.enqueue(ContributionQueue::single(RewardsType::OneTimeTip, "P1", dec("1")))
            .await;

        assert_eq!(
            h.engine.process_contribution_queue().await,
            QueueOutcome::Processed(LedgerResult::Retry)
        );
        let contribution = h.store.contributions().remove(0);
        assert_eq!(contribution.step, ContributionStep::Creds);

        // Still unavailable: stays at CREDS, retry counted
        assert_eq!(h.engine.retry(&contribution).await, LedgerResult::Retry);
        let after = h.reload(&contribution).await;
        assert_eq!(after.step, ContributionStep::Creds);
        assert_eq!(after.retry_count, 1);

        // A stale in-memory copy does not matter, only the stored step does
        h.sku_credentials.set_unavailable_redeem(false);
        assert_eq!(h.engine.retry(&contribution).await, LedgerResult::Ok);
        assert_eq!(h.engine.retry(&contribution).await, LedgerResult::Error);

        let done = h.reload(&contribution).await;
        assert_eq!(done.step, ContributionStep::Completed);
        assert_eq!(done.retry_count, -1);
        assert_eq!(done.publishers[0].contributed_amount, dec("1"));
        assert_eq!(h.sku_credentials.start_count(), 1);
        assert_eq!(h.card.transfer_count(), 1);
        assert_eq!(h.sku.create_count(), 1);
        h.assert_sum_invariant();
    }

    #[tokio::test]
    async fn test_explicit_rejection_fails_contribution() {
        let h = TestHarness::new(vec![WalletType::CustodialWallet], card_and_custodial("0", "5"));
        h.custodial.set_fail_transfer(true);
        h.enqueue(ContributionQueue::single(RewardsType::OneTimeTip, "P1", dec("1")))
            .await;

        assert_eq!(
            h.engine.process_contribution_queue().await,
            QueueOutcome::Processed(LedgerResult::Error)
        );
        assert_eq!(h.store.contributions()[0].step, ContributionStep::Failed);
    }

    #[tokio::test]
    async fn test_unknown_outcome_recovered_by_worker() {
        let h = TestHarness::new(vec![WalletType::CustodialWallet], card_and_custodial("0", "5"));
        h.custodial.set_pending_transfer(true);
        h.enqueue(ContributionQueue::single(RewardsType::OneTimeTip, "P1", dec("1")))
            .await;

        assert_eq!(
            h.engine.process_contribution_queue().await,
            QueueOutcome::Processed(LedgerResult::Retry)
        );
        assert_eq!(
            h.store.contributions()[0].step,
            ContributionStep::ExternalTransaction
        );

        let worker = RecoveryWorker::new(
            h.engine.clone(),
            WorkerConfig {
                scan_interval: Duration::from_secs(1),
                batch_size: 10,
                retry_warn_threshold: 3,
            },
        );

        // Still unknown: nothing finishes
        assert_eq!(worker.scan_and_recover().await.unwrap(), 0);

        h.custodial.set_pending_transfer(false);
        assert_eq!(worker.scan_and_recover().await.unwrap(), 1);
        assert_eq!(h.store.contributions()[0].step, ContributionStep::Completed);
        assert_eq!(worker.scan_and_recover().await.unwrap(), 0);

        // Same order, paid through the same pending transaction
        assert_eq!(h.sku.create_count(), 1);
        assert_eq!(h.store.sku_transactions().len(), 1);
    }

    /// A recovery scan overlapping a queue cycle leaves the cycle's
    /// contribution alone; the order is paid once.
    #[tokio::test(start_paused = true)]
    async fn test_recovery_scan_skips_contribution_in_flight() {
        let h = TestHarness::new(vec![WalletType::AnonymousCard], card_and_custodial("5", "0"));
        h.card.set_transfer_delay(Duration::from_millis(200));
        h.enqueue(ContributionQueue::single(RewardsType::OneTimeTip, "P1", dec("1")))
            .await;

        let engine = h.engine.clone();
        let cycle = tokio::spawn(async move { engine.process_contribution_queue().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let worker = RecoveryWorker::new(
            h.engine.clone(),
            WorkerConfig {
                scan_interval: Duration::from_secs(1),
                batch_size: 10,
                retry_warn_threshold: 3,
            },
        );
        assert_eq!(worker.scan_and_recover().await.unwrap(), 0);
        assert_eq!(h.engine.initialize().await.unwrap(), 1);

        assert_eq!(
            cycle.await.unwrap(),
            QueueOutcome::Processed(LedgerResult::Ok)
        );
        assert_eq!(h.card.transfer_count(), 1);

        let contribution = h.store.contributions().remove(0);
        assert_eq!(contribution.step, ContributionStep::Completed);
        assert_eq!(contribution.retry_count, -1);
        assert_eq!(h.sku_credentials.start_count(), 1);
    }

    #[tokio::test]
    async fn test_settled_order_with_two_items_halts() {
        let h = TestHarness::new(vec![WalletType::AnonymousCard], card_and_custodial("5", "0"));
        h.sku.set_extra_items(1);
        h.enqueue(ContributionQueue::single(RewardsType::OneTimeTip, "P1", dec("1")))
            .await;

        assert_eq!(
            h.engine.process_contribution_queue().await,
            QueueOutcome::Processed(LedgerResult::Error)
        );
        let contribution = h.store.contributions().remove(0);
        assert_eq!(contribution.step, ContributionStep::ExternalTransaction);
        assert_eq!(h.sku_credentials.start_count(), 0);

        // The engine keeps serving other work
        h.sku.set_extra_items(0);
        h.enqueue(ContributionQueue::single(RewardsType::OneTimeTip, "P2", dec("1")))
            .await;
        assert_eq!(
            h.engine.process_contribution_queue().await,
            QueueOutcome::Processed(LedgerResult::Ok)
        );
    }

    #[tokio::test]
    async fn test_initialize_resumes_unfinished() {
        let h = TestHarness::new(vec![WalletType::AnonymousCard], card_and_custodial("5", "0"));
        h.card.set_pending_transfer(true);
        h.enqueue(ContributionQueue::single(RewardsType::OneTimeTip, "P1", dec("1")))
            .await;
        h.engine.process_contribution_queue().await;

        h.card.set_pending_transfer(false);
        assert_eq!(h.engine.initialize().await.unwrap(), 1);
        assert_eq!(h.store.contributions()[0].step, ContributionStep::Completed);
        assert!(h.engine.timers().is_armed(TimerKind::Queue));
        assert!(h.engine.timers().is_armed(TimerKind::Reconcile));
    }

    // ========================================================================
    // Monthly reconcile & timers
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_timer_queues_monthly_entries() {
        let mut h = TestHarness::new(vec![WalletType::AnonymousCard], card_and_custodial("50", "0"));
        h.store.add_recurring_tip("P1", dec("2"));
        h.store.set_ac_publishers(vec![
            QueuePublisher::new("A", dec("60")),
            QueuePublisher::new("B", dec("40")),
        ]);

        h.engine.initialize().await.unwrap();

        let mut reconciled = false;
        for _ in 0..4 {
            let id = h.fired.recv().await.unwrap();
            if h.engine.on_timer(id).await == Some(TimerKind::Reconcile) {
                reconciled = true;
                break;
            }
        }
        assert!(reconciled);

        let entries = h.store.queue_entries();
        assert!(entries.iter().any(|e| e.rewards_type == RewardsType::RecurringTip && !e.partial));
        assert!(entries.iter().any(|e| e.rewards_type == RewardsType::AutoContribute && e.partial));

        let stamp = h.store.get_reconcile_stamp().await.unwrap();
        assert!(stamp > chrono::Utc::now().timestamp());
        assert!(h.engine.timers().is_armed(TimerKind::Reconcile));
        assert!(h.engine.timers().is_armed(TimerKind::Queue));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_with_rewards_disabled_only_moves_stamp() {
        let mut h = TestHarness::with_config(
            EngineConfig {
                testing: true,
                rewards_enabled: false,
                processor_chain: vec![WalletType::AnonymousCard],
                ..EngineConfig::default()
            },
            card_and_custodial("50", "0"),
        );
        h.store.add_recurring_tip("P1", dec("2"));
        h.store.set_ac_publishers(vec![QueuePublisher::new("A", dec("100"))]);

        h.engine.initialize().await.unwrap();

        let mut reconciled = false;
        for _ in 0..4 {
            let id = h.fired.recv().await.unwrap();
            if h.engine.on_timer(id).await == Some(TimerKind::Reconcile) {
                reconciled = true;
                break;
            }
        }
        assert!(reconciled);

        assert!(h.store.queue_entries().is_empty());
        let stamp = h.store.get_reconcile_stamp().await.unwrap();
        assert!(stamp > chrono::Utc::now().timestamp());
        assert!(h.engine.timers().is_armed(TimerKind::Reconcile));
    }

    #[tokio::test]
    async fn test_has_sufficient_balance() {
        let h = TestHarness::new(vec![WalletType::AnonymousCard], card_and_custodial("3", "0"));
        h.store.add_recurring_tip("P1", dec("2"));
        assert!(h.engine.has_sufficient_balance().await.unwrap());

        h.store.add_recurring_tip("P2", dec("2"));
        assert!(!h.engine.has_sufficient_balance().await.unwrap());

        h.balance.set_unavailable();
        assert!(h.engine.has_sufficient_balance().await.is_err());
    }
}
