//! Unblinded token executor
//!
//! Two paths:
//! - contribution redemption: every publisher share is paid with locally held
//!   tokens, either the user's promotion tokens or the tokens issued for a
//!   settled SKU order
//! - merchant payment: an order is paid with greedily selected tokens

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::TransferExecutor;
use crate::contribution::credentials::CredentialsRegistry;
use crate::contribution::error::ContributionError;
use crate::contribution::types::{
    ContributionInfo, ContributionProcessor, CredentialsRedeem, CredsBatchType, RewardsType,
    SkuTransaction, UnblindedToken, WalletType,
};
use crate::store::ContributionStore;

/// Tokens a contribution may spend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenScope {
    /// The user's own unblinded wallet
    Promotion,
    /// Tokens issued for this SKU order
    Order(String),
}

impl TokenScope {
    fn admits(&self, token: &UnblindedToken) -> bool {
        match self {
            TokenScope::Promotion => token.batch_type == CredsBatchType::Promotion,
            TokenScope::Order(order_id) => {
                token.batch_type == CredsBatchType::Sku && &token.creds_id == order_id
            }
        }
    }

    fn batch_type(&self) -> CredsBatchType {
        match self {
            TokenScope::Promotion => CredsBatchType::Promotion,
            TokenScope::Order(_) => CredsBatchType::Sku,
        }
    }

    /// Tokens bought for an order are all spent on its contribution
    fn spends_all(&self) -> bool {
        matches!(self, TokenScope::Order(_))
    }

    fn order_id(&self) -> Option<String> {
        match self {
            TokenScope::Promotion => None,
            TokenScope::Order(order_id) => Some(order_id.clone()),
        }
    }
}

/// Tokens reserved for one publisher
struct Reservation<'a> {
    publisher_key: &'a str,
    already_contributed: Decimal,
    total_amount: Decimal,
    owed: Decimal,
    tokens: Vec<UnblindedToken>,
}

impl Reservation<'_> {
    fn value(&self) -> Decimal {
        self.tokens.iter().map(|t| t.value).sum()
    }
}

pub struct UnblindedExecutor {
    store: Arc<dyn ContributionStore>,
    credentials: CredentialsRegistry,
}

impl UnblindedExecutor {
    pub fn new(store: Arc<dyn ContributionStore>, credentials: CredentialsRegistry) -> Self {
        Self { store, credentials }
    }

    /// Redeem the outstanding publisher shares of `contribution`.
    ///
    /// Tokens are reserved for every publisher before anything is redeemed and
    /// recorded amounts never exceed a publisher's share. Promotion tokens are
    /// only spent where they fit; order tokens are all spent. Fails with
    /// `NotEnoughFunds` without consuming tokens when nothing can be covered.
    /// Returns the token value redeemed by this call.
    pub async fn redeem_contribution(
        &self,
        contribution: &ContributionInfo,
        scope: &TokenScope,
    ) -> Result<Decimal, ContributionError> {
        let outstanding: Decimal = contribution.publishers.iter().map(|p| p.outstanding()).sum();
        if outstanding <= Decimal::ZERO {
            debug!(contribution_id = %contribution.contribution_id, "Nothing left to redeem");
            return Ok(Decimal::ZERO);
        }

        let mut pool: Vec<UnblindedToken> = self
            .store
            .get_all_unblinded_tokens()
            .await?
            .into_iter()
            .filter(|t| scope.admits(t))
            .collect();

        let reservations = reserve(contribution, &mut pool, scope.spends_all());
        let reserved: Decimal = reservations.iter().map(|r| r.value()).sum();

        if reserved <= Decimal::ZERO {
            warn!(
                contribution_id = %contribution.contribution_id,
                outstanding = %outstanding,
                "Unblinded tokens cannot cover any publisher share"
            );
            return Err(ContributionError::NotEnoughFunds);
        }

        let credentials = self.credentials.get(scope.batch_type())?;
        for reservation in &reservations {
            let redeem = CredentialsRedeem {
                publisher_key: reservation.publisher_key.to_string(),
                rewards_type: contribution.rewards_type,
                processor: contribution.processor,
                token_list: reservation.tokens.clone(),
                order_id: scope.order_id(),
                contribution_id: Some(contribution.contribution_id),
            };
            credentials.redeem_tokens(&redeem).await?;

            let contributed =
                (reservation.already_contributed + redeem.value()).min(reservation.total_amount);
            let spent: Vec<u64> = reservation.tokens.iter().map(|t| t.token_id).collect();
            self.store
                .record_publisher_redemption(
                    contribution.contribution_id,
                    reservation.publisher_key,
                    contributed,
                    &spent,
                )
                .await?;

            debug!(
                contribution_id = %contribution.contribution_id,
                publisher_key = reservation.publisher_key,
                tokens = spent.len(),
                contributed = %contributed,
                "Publisher share redeemed"
            );
        }

        info!(
            contribution_id = %contribution.contribution_id,
            redeemed = %reserved,
            outstanding = %outstanding,
            "Contribution redeemed with unblinded tokens"
        );
        Ok(reserved)
    }
}

/// Reserve tokens per publisher, first only where they fit the outstanding
/// share. With `spend_all`, the tokens left over then go one at a time to
/// whichever publisher is still owed the most.
fn reserve<'a>(
    contribution: &'a ContributionInfo,
    pool: &mut Vec<UnblindedToken>,
    spend_all: bool,
) -> Vec<Reservation<'a>> {
    let mut reservations: Vec<Reservation<'a>> = contribution
        .publishers
        .iter()
        .filter(|p| p.outstanding() > Decimal::ZERO)
        .map(|p| Reservation {
            publisher_key: &p.publisher_key,
            already_contributed: p.contributed_amount,
            total_amount: p.total_amount,
            owed: p.outstanding(),
            tokens: Vec::new(),
        })
        .collect();

    for reservation in &mut reservations {
        let owed = reservation.owed;
        let mut picked = Decimal::ZERO;
        pool.retain(|token| {
            if picked + token.value <= owed {
                picked += token.value;
                reservation.tokens.push(token.clone());
                false
            } else {
                true
            }
        });
    }

    if spend_all {
        while !pool.is_empty() {
            let Some(neediest) = reservations
                .iter_mut()
                .min_by_key(|r| r.value() - r.owed)
            else {
                break;
            };
            neediest.tokens.push(pool.remove(0));
        }
    }

    reservations.retain(|r| !r.tokens.is_empty());
    reservations
}

#[async_trait]
impl TransferExecutor for UnblindedExecutor {
    fn wallet_type(&self) -> WalletType {
        WalletType::UnblindedTokens
    }

    fn requires_sku_order(&self) -> bool {
        false
    }

    /// Merchant payment: the user's promotion tokens are accumulated in order
    /// until they cover the transaction amount, then redeemed as a payment to
    /// the order location. Tokens bought for contributions are never touched.
    async fn transfer_funds(
        &self,
        transaction: &SkuTransaction,
        destination: &str,
    ) -> Result<String, ContributionError> {
        let scope = TokenScope::Promotion;
        let tokens: Vec<UnblindedToken> = self
            .store
            .get_all_unblinded_tokens()
            .await?
            .into_iter()
            .filter(|t| scope.admits(t))
            .collect();
        if tokens.is_empty() {
            return Err(ContributionError::InvalidRequest(
                "no unblinded tokens".to_string(),
            ));
        }

        let mut current = Decimal::ZERO;
        let mut token_list = Vec::new();
        for token in tokens {
            if current >= transaction.amount {
                break;
            }
            current += token.value;
            token_list.push(token);
        }

        if current < transaction.amount {
            warn!(
                order_id = %transaction.order_id,
                required = %transaction.amount,
                available = %current,
                "Not enough unblinded tokens for merchant payment"
            );
            return Err(ContributionError::NotEnoughFunds);
        }

        let order = self
            .store
            .get_sku_order(&transaction.order_id)
            .await?
            .ok_or_else(|| ContributionError::NotFound(format!("order {}", transaction.order_id)))?;

        debug!(
            order_id = %order.order_id,
            location = %order.location,
            destination,
            tokens = token_list.len(),
            "Redeeming tokens for merchant order"
        );

        let redeem = CredentialsRedeem {
            publisher_key: order.location.clone(),
            rewards_type: RewardsType::Payment,
            processor: ContributionProcessor::UnblindedTokens,
            token_list,
            order_id: Some(order.order_id.clone()),
            contribution_id: order.contribution_id,
        };
        self.credentials
            .get(scope.batch_type())?
            .redeem_tokens(&redeem)
            .await?;

        let spent: Vec<u64> = redeem.token_list.iter().map(|t| t.token_id).collect();
        self.store.delete_unblinded_tokens(&spent).await?;

        Ok(transaction.transaction_id.clone())
    }
}
