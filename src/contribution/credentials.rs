//! Credentials Collaborator
//!
//! Credential issuance and token redemption are delegated to one
//! implementation per batch type. The blinding protocol lives behind this
//! trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::error::ContributionError;
use super::types::{CredentialsRedeem, CredentialsTrigger, CredsBatchType, UnblindedToken};

/// Credential service for one batch type
///
/// Both calls may be repeated after a restart; idempotence per `trigger.id`
/// is the implementation's responsibility.
#[async_trait]
pub trait Credentials: Send + Sync {
    /// Issue credentials for a settled order, returning the unblinded tokens
    async fn start(
        &self,
        trigger: &CredentialsTrigger,
    ) -> Result<Vec<UnblindedToken>, ContributionError>;

    /// Redeem `redeem.token_list` for `redeem.publisher_key`
    async fn redeem_tokens(&self, redeem: &CredentialsRedeem) -> Result<(), ContributionError>;
}

/// Credential services keyed by batch type
#[derive(Default, Clone)]
pub struct CredentialsRegistry {
    services: HashMap<CredsBatchType, Arc<dyn Credentials>>,
}

impl CredentialsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, batch_type: CredsBatchType, service: Arc<dyn Credentials>) -> Self {
        self.services.insert(batch_type, service);
        self
    }

    pub fn get(&self, batch_type: CredsBatchType) -> Result<&Arc<dyn Credentials>, ContributionError> {
        self.services.get(&batch_type).ok_or_else(|| {
            ContributionError::NoProcessor(format!("credentials for {:?} batch", batch_type))
        })
    }
}


#[cfg(test)]
pub use mock::MockCredentials;
