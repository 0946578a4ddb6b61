//! Custodial wallet executor
//!
//! Transfers go through the user's linked custodial wallet, which must be
//! verified.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::TransferExecutor;
use crate::contribution::error::ContributionError;
use crate::contribution::types::{ExternalWallet, SkuTransaction, WalletStatus, WalletType};

/// Custodial wallet provider
#[async_trait]
pub trait CustodialProvider: Send + Sync {
    /// Currently linked wallet
    async fn wallet(&self) -> Result<ExternalWallet, ContributionError>;

    /// Transfer `amount` from `wallet` to `destination`, returning the transaction id
    async fn transfer(
        &self,
        wallet: &ExternalWallet,
        amount: Decimal,
        destination: &str,
    ) -> Result<String, ContributionError>;
}

pub struct CustodialWalletExecutor {
    provider: Arc<dyn CustodialProvider>,
}

impl CustodialWalletExecutor {
    pub fn new(provider: Arc<dyn CustodialProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl TransferExecutor for CustodialWalletExecutor {
    fn wallet_type(&self) -> WalletType {
        WalletType::CustodialWallet
    }

    async fn transfer_funds(
        &self,
        transaction: &SkuTransaction,
        destination: &str,
    ) -> Result<String, ContributionError> {
        let wallet = self.provider.wallet().await?;

        if wallet.status != WalletStatus::Verified {
            return Err(ContributionError::Rejected {
                service: "custodial",
                reason: format!("wallet is {:?}", wallet.status),
            });
        }
        if wallet.token.is_empty() {
            return Err(ContributionError::Rejected {
                service: "custodial",
                reason: "wallet has no token".to_string(),
            });
        }

        debug!(
            order_id = %transaction.order_id,
            amount = %transaction.amount,
            "Transferring from custodial wallet"
        );

        let external_id = self
            .provider
            .transfer(&wallet, transaction.amount, destination)
            .await?;

        info!(
            order_id = %transaction.order_id,
            external_id = %external_id,
            "Custodial transfer settled"
        );
        Ok(external_id)
    }
}
