//! Transfer Executors
//!
//! One executor per backend, all behind the same transfer contract. The
//! router looks them up by wallet type.

pub mod anon_card;
pub mod custodial;
pub mod unblinded;

pub use anon_card::{AnonCardExecutor, AnonCardProvider};
pub use custodial::{CustodialProvider, CustodialWalletExecutor};
pub use unblinded::{TokenScope, UnblindedExecutor};

use async_trait::async_trait;

use super::error::ContributionError;
use super::types::{SkuTransaction, WalletType};

/// Uniform settlement contract for a payment backend
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    /// Backend this executor settles through
    fn wallet_type(&self) -> WalletType;

    /// Whether contributions on this backend buy a SKU order first.
    ///
    /// Unblinded tokens are redeemed directly.
    fn requires_sku_order(&self) -> bool {
        true
    }

    /// Pay `transaction.amount` for `transaction.order_id` to `destination`.
    ///
    /// Returns the external transaction id. `Rejected` is an explicit failure;
    /// `Unavailable` means the outcome is unknown and the call may be repeated.
    async fn transfer_funds(
        &self,
        transaction: &SkuTransaction,
        destination: &str,
    ) -> Result<String, ContributionError>;
}


#[cfg(test)]
pub use mock::MockExecutor;
