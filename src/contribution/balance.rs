//! Balance Resolver
//!
//! Balance is fetched fresh before every queue entry; the per-wallet share
//! decides how much one backend can cover.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::error::ContributionError;
use super::types::{Balance, WalletType};

/// Source of the user's balance across backends
#[async_trait]
pub trait BalanceSource: Send + Sync {
    /// Fails with `BalanceUnavailable`, never with a zero balance
    async fn fetch_balance(&self) -> Result<Balance, ContributionError>;
}

/// Portion of the total balance held by `wallet` (missing or negative -> 0)
pub fn per_wallet_balance(wallet: WalletType, wallets: &HashMap<WalletType, Decimal>) -> Decimal {
    wallets
        .get(&wallet)
        .copied()
        .unwrap_or(Decimal::ZERO)
        .max(Decimal::ZERO)
}

/// Gate an entry against the total balance.
///
/// Returns the amount to contribute, or `None` when the entry cannot be funded:
/// - zero total balance funds nothing
/// - partial entries are clamped to the total
/// - full entries need the whole amount
pub fn have_enough_funds_to_contribute(
    amount: Decimal,
    partial: bool,
    total: Decimal,
) -> Option<Decimal> {
    if total <= Decimal::ZERO {
        return None;
    }

    if partial {
        return Some(amount.min(total));
    }

    if amount > total {
        return None;
    }

    Some(amount)
}

/// Balance source returning a preset snapshot
///
/// Used for dry runs and tests; `set_unavailable` simulates a fetch failure.
#[derive(Debug, Default)]
pub struct FixedBalance {
    balance: Mutex<Option<Balance>>,
}

impl FixedBalance {
    pub fn new(balance: Balance) -> Self {
        Self {
            balance: Mutex::new(Some(balance)),
        }
    }

    pub fn set(&self, balance: Balance) {
        *self.lock() = Some(balance);
    }

    pub fn set_unavailable(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Balance>> {
        self.balance.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BalanceSource for FixedBalance {
    async fn fetch_balance(&self) -> Result<Balance, ContributionError> {
        self.lock()
            .clone()
            .ok_or_else(|| ContributionError::BalanceUnavailable("no balance configured".into()))
    }
}
