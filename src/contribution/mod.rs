//! Contribution Reconciliation Engine
//!
//! Turns queued payment intents (tips, recurring tips, auto-contribute) into
//! settled publisher contributions across several payment backends.
//!
//! # Architecture
//!
//! Each queue entry is gated against the total balance, then walked along the
//! processor chain. Every backend with funds takes the part it can cover as a
//! new contribution; the remainder stays queued for the next backend. The
//! contribution record and the queue update are committed together before
//! any executor runs.
//!
//! # State Machine
//!
//! ```text
//! START → EXTERNAL_TRANSACTION → CREDS → COMPLETED
//!   ↓              ↓               ↓
//!   └──────────────┴───────────────┴──→ FAILED | NOT_ENOUGH_FUNDS | AC_TABLE_EMPTY
//! ```
//!
//! Unblinded-token contributions go from START straight to a terminal step.
//!
//! # Safety Invariants
//!
//! 1. **Persist-Before-Call**: the step is saved before the call that continues from it
//! 2. **Explicit Fail Rule**: only an explicit rejection fails a contribution, never an unknown outcome
//! 3. **Resume From Storage**: `retry` decides from the persisted step alone
//! 4. **Bounded Shares**: contributed amounts never exceed the contribution amount

pub mod balance;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod executors;
pub mod monthly;
pub mod router;
pub mod scheduler;
pub mod sku;
pub mod splitter;
pub mod step;
pub mod types;
pub mod worker;

#[cfg(test)]
mod integration_tests;

// Re-exports for convenience
pub use balance::{BalanceSource, FixedBalance};
pub use credentials::{Credentials, CredentialsRegistry};
pub use engine::{ContributionEngine, QueueOutcome};
pub use error::{ContributionError, LedgerResult};
pub use executors::{
    AnonCardExecutor, AnonCardProvider, CustodialProvider, CustodialWalletExecutor,
    TransferExecutor, UnblindedExecutor,
};
pub use router::{ExecutorRegistry, ProcessorChain};
pub use scheduler::{TimerId, TimerKind};
pub use sku::{SkuPipeline, SkuService};
pub use step::ContributionStep;
pub use types::{
    Balance, ContributionId, ContributionInfo, ContributionProcessor, ContributionPublisher,
    ContributionQueue, QueuePublisher, RewardsType, SkuOrder, SkuOrderItem, SkuTransaction,
    UnblindedToken, WalletType,
};
pub use worker::{RecoveryWorker, WorkerConfig};
