//! Anonymous card executor

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::TransferExecutor;
use crate::contribution::error::ContributionError;
use crate::contribution::types::{SkuTransaction, WalletType};

/// Anonymous card payment service
#[async_trait]
pub trait AnonCardProvider: Send + Sync {
    /// Send `amount` for `order_id` to `destination`, returning the transaction id
    async fn send_transaction(
        &self,
        amount: Decimal,
        order_id: &str,
        destination: &str,
    ) -> Result<String, ContributionError>;
}

pub struct AnonCardExecutor {
    provider: Arc<dyn AnonCardProvider>,
}

impl AnonCardExecutor {
    pub fn new(provider: Arc<dyn AnonCardProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl TransferExecutor for AnonCardExecutor {
    fn wallet_type(&self) -> WalletType {
        WalletType::AnonymousCard
    }

    async fn transfer_funds(
        &self,
        transaction: &SkuTransaction,
        destination: &str,
    ) -> Result<String, ContributionError> {
        if transaction.amount <= Decimal::ZERO {
            return Err(ContributionError::InvalidRequest(format!(
                "transaction {} has no amount",
                transaction.transaction_id
            )));
        }

        debug!(
            order_id = %transaction.order_id,
            amount = %transaction.amount,
            "Sending anonymous card transaction"
        );

        let external_id = self
            .provider
            .send_transaction(transaction.amount, &transaction.order_id, destination)
            .await?;

        if external_id.is_empty() {
            warn!(order_id = %transaction.order_id, "Anonymous card returned no transaction id");
            return Err(ContributionError::Unavailable {
                service: "anon_card",
                reason: "empty transaction id".to_string(),
            });
        }

        Ok(external_id)
    }
}
