//! Contribution Engine
//!
//! Reconciles queued payment intents into publisher contributions, settled
//! across a priority chain of payment backends.
//!
//! # Modules
//!
//! - [`contribution`] - Queue processor, contribution FSM, SKU pipeline, timers
//! - [`store`] - Persistence gateway (PostgreSQL and in-memory)
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod contribution;
pub mod logging;
pub mod store;

// Convenient re-exports at crate root
pub use config::{AppConfig, EngineConfig, Environment, SkuConfig};
pub use contribution::{
    ContributionEngine, ContributionError, ContributionInfo, ContributionQueue, ContributionStep,
    LedgerResult, RecoveryWorker, WalletType,
};
pub use store::{ContributionStore, MemoryStore, PgContributionStore};
