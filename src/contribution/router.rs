//! Processor Router
//!
//! The priority chain is plain data; settlement strategies are looked up in a
//! registry keyed by wallet type.

use std::collections::HashMap;
use std::sync::Arc;

use super::error::ContributionError;
use super::executors::TransferExecutor;
use super::types::{ContributionProcessor, WalletType};

/// Ordered list of backends tried for every queue entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorChain {
    order: Vec<WalletType>,
}

impl Default for ProcessorChain {
    fn default() -> Self {
        Self::new(vec![
            WalletType::UnblindedTokens,
            WalletType::AnonymousCard,
            WalletType::CustodialWallet,
        ])
    }
}

impl ProcessorChain {
    /// Duplicates are dropped, first occurrence wins
    pub fn new(order: Vec<WalletType>) -> Self {
        let mut unique = Vec::with_capacity(order.len());
        for wallet in order {
            if !unique.contains(&wallet) {
                unique.push(wallet);
            }
        }
        Self { order: unique }
    }

    /// Backend after `current`; `None` starts the chain.
    ///
    /// Returns `None` once the chain is exhausted or `current` is not part of it.
    pub fn next_processor(&self, current: Option<WalletType>) -> Option<WalletType> {
        match current {
            None => self.order.first().copied(),
            Some(wallet) => {
                let position = self.order.iter().position(|w| *w == wallet)?;
                self.order.get(position + 1).copied()
            }
        }
    }
}

/// Transfer executors keyed by backend
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<WalletType, Arc<dyn TransferExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered under the executor's own wallet type
    pub fn register(mut self, executor: Arc<dyn TransferExecutor>) -> Self {
        self.executors.insert(executor.wallet_type(), executor);
        self
    }

    pub fn contains(&self, wallet: WalletType) -> bool {
        self.executors.contains_key(&wallet)
    }

    /// Executor and canonical processor for a backend
    pub fn processor_for(
        &self,
        wallet: WalletType,
    ) -> Result<(Arc<dyn TransferExecutor>, ContributionProcessor), ContributionError> {
        let executor = self
            .executors
            .get(&wallet)
            .cloned()
            .ok_or_else(|| ContributionError::NoProcessor(wallet.to_string()))?;
        Ok((executor, ContributionProcessor::from(wallet)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contribution::executors::MockExecutor;

    #[test]
    fn test_chain_walk() {
        let chain = ProcessorChain::default();

        assert_eq!(chain.next_processor(None), Some(WalletType::UnblindedTokens));
        assert_eq!(
            chain.next_processor(Some(WalletType::UnblindedTokens)),
            Some(WalletType::AnonymousCard)
        );
        assert_eq!(
            chain.next_processor(Some(WalletType::AnonymousCard)),
            Some(WalletType::CustodialWallet)
        );
        assert_eq!(chain.next_processor(Some(WalletType::CustodialWallet)), None);
    }

    #[test]
    fn test_chain_not_found() {
        let chain = ProcessorChain::new(vec![WalletType::AnonymousCard]);
        assert_eq!(chain.next_processor(Some(WalletType::UnblindedTokens)), None);
        assert!(ProcessorChain::new(vec![]).next_processor(None).is_none());
    }

    #[test]
    fn test_chain_drops_duplicates() {
        let chain = ProcessorChain::new(vec![
            WalletType::AnonymousCard,
            WalletType::UnblindedTokens,
            WalletType::AnonymousCard,
        ]);
        assert_eq!(chain.next_processor(None), Some(WalletType::AnonymousCard));
        assert_eq!(
            chain.next_processor(Some(WalletType::AnonymousCard)),
            Some(WalletType::UnblindedTokens)
        );
        assert_eq!(chain.next_processor(Some(WalletType::UnblindedTokens)), None);
    }

    #[test]
    fn test_processor_for() {
        let registry = ExecutorRegistry::new()
            .register(Arc::new(MockExecutor::new(WalletType::CustodialWallet)));

        let (executor, processor) = registry.processor_for(WalletType::CustodialWallet).unwrap();
        assert_eq!(executor.wallet_type(), WalletType::CustodialWallet);
        assert_eq!(processor, ContributionProcessor::CustodialWallet);

        assert!(matches!(
            registry.processor_for(WalletType::AnonymousCard),
            Err(ContributionError::NoProcessor(_))
        ));
    }
}
