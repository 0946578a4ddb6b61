//! Contribution Core Types
//!
//! Queue entries, contribution records, SKU orders/transactions and the
//! values passed to the credential collaborator.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::step::ContributionStep;

/// Queue entry ID (`BIGSERIAL`); 0 means "not yet persisted"
pub type QueueId = u64;

/// Contribution ID - ULID-based opaque token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContributionId(ulid::Ulid);

impl ContributionId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for ContributionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContributionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContributionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// What a queue entry / contribution pays for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum RewardsType {
    AutoContribute = 2,
    OneTimeTip = 8,
    RecurringTip = 16,
    /// Merchant purchase paid with unblinded tokens
    Payment = 32,
}

impl RewardsType {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            2 => Some(RewardsType::AutoContribute),
            8 => Some(RewardsType::OneTimeTip),
            16 => Some(RewardsType::RecurringTip),
            32 => Some(RewardsType::Payment),
            _ => None,
        }
    }

    /// Tips split their publishers pro-rata when a backend covers only part
    #[inline]
    pub fn is_tip(&self) -> bool {
        matches!(self, RewardsType::OneTimeTip | RewardsType::RecurringTip)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RewardsType::AutoContribute => "AUTO_CONTRIBUTE",
            RewardsType::OneTimeTip => "ONE_TIME_TIP",
            RewardsType::RecurringTip => "RECURRING_TIP",
            RewardsType::Payment => "PAYMENT",
        }
    }
}

impl fmt::Display for RewardsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment backend identifier (a link of the processor chain)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalletType {
    /// Locally held unblinded tokens
    #[serde(rename = "unblinded")]
    UnblindedTokens,
    /// Anonymous card (custodial destination, no verified wallet)
    #[serde(rename = "anonymous")]
    AnonymousCard,
    /// Custodial wallet provider
    #[serde(rename = "custodial")]
    CustodialWallet,
}

impl WalletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletType::UnblindedTokens => "unblinded",
            WalletType::AnonymousCard => "anonymous",
            WalletType::CustodialWallet => "custodial",
        }
    }
}

impl fmt::Display for WalletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WalletType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unblinded" => Ok(WalletType::UnblindedTokens),
            "anonymous" => Ok(WalletType::AnonymousCard),
            "custodial" => Ok(WalletType::CustodialWallet),
            other => Err(format!("unknown wallet type: {}", other)),
        }
    }
}

/// Canonical processor stored on a contribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum ContributionProcessor {
    None = 0,
    UnblindedTokens = 1,
    CustodialWallet = 2,
    AnonymousCard = 3,
}

impl ContributionProcessor {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(ContributionProcessor::None),
            1 => Some(ContributionProcessor::UnblindedTokens),
            2 => Some(ContributionProcessor::CustodialWallet),
            3 => Some(ContributionProcessor::AnonymousCard),
            _ => None,
        }
    }

    /// Backend that settles contributions owned by this processor
    pub fn wallet_type(&self) -> Option<WalletType> {
        match self {
            ContributionProcessor::None => None,
            ContributionProcessor::UnblindedTokens => Some(WalletType::UnblindedTokens),
            ContributionProcessor::CustodialWallet => Some(WalletType::CustodialWallet),
            ContributionProcessor::AnonymousCard => Some(WalletType::AnonymousCard),
        }
    }
}

impl From<WalletType> for ContributionProcessor {
    fn from(wallet: WalletType) -> Self {
        match wallet {
            WalletType::UnblindedTokens => ContributionProcessor::UnblindedTokens,
            WalletType::AnonymousCard => ContributionProcessor::AnonymousCard,
            WalletType::CustodialWallet => ContributionProcessor::CustodialWallet,
        }
    }
}

/// Publisher share of a queue entry
#[derive(Debug, Clone, PartialEq)]
pub struct QueuePublisher {
    pub publisher_key: String,
    /// Share of the entry amount, 0..=100
    pub amount_percent: Decimal,
}

impl QueuePublisher {
    pub fn new(publisher_key: impl Into<String>, amount_percent: Decimal) -> Self {
        Self {
            publisher_key: publisher_key.into(),
            amount_percent,
        }
    }
}

/// Pending contribution request
#[derive(Debug, Clone, PartialEq)]
pub struct ContributionQueue {
    pub id: QueueId,
    pub rewards_type: RewardsType,
    pub amount: Decimal,
    /// Entry may be satisfied with less than `amount`
    pub partial: bool,
    pub publishers: Vec<QueuePublisher>,
    pub created_at: i64,
}

impl ContributionQueue {
    /// Unsaved entry (id assigned by the store)
    pub fn new(
        rewards_type: RewardsType,
        amount: Decimal,
        partial: bool,
        publishers: Vec<QueuePublisher>,
    ) -> Self {
        Self {
            id: 0,
            rewards_type,
            amount,
            partial,
            publishers,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Single publisher entry receiving 100 %
    pub fn single(
        rewards_type: RewardsType,
        publisher_key: impl Into<String>,
        amount: Decimal,
    ) -> Self {
        Self::new(
            rewards_type,
            amount,
            false,
            vec![QueuePublisher::new(publisher_key, Decimal::ONE_HUNDRED)],
        )
    }
}

/// Publisher share of a contribution
#[derive(Debug, Clone, PartialEq)]
pub struct ContributionPublisher {
    pub contribution_id: ContributionId,
    pub publisher_key: String,
    pub total_amount: Decimal,
    pub contributed_amount: Decimal,
}

impl ContributionPublisher {
    /// Amount still owed to this publisher
    #[inline]
    pub fn outstanding(&self) -> Decimal {
        (self.total_amount - self.contributed_amount).max(Decimal::ZERO)
    }
}

/// Contribution record, persisted after every step transition
#[derive(Debug, Clone, PartialEq)]
pub struct ContributionInfo {
    pub contribution_id: ContributionId,
    pub amount: Decimal,
    pub rewards_type: RewardsType,
    pub step: ContributionStep,
    pub retry_count: i32,
    pub created_at: i64,
    pub processor: ContributionProcessor,
    pub publishers: Vec<ContributionPublisher>,
}

impl ContributionInfo {
    /// Fresh record at START with `retry_count = -1`
    pub fn new(
        contribution_id: ContributionId,
        amount: Decimal,
        rewards_type: RewardsType,
        processor: ContributionProcessor,
    ) -> Self {
        Self {
            contribution_id,
            amount,
            rewards_type,
            step: ContributionStep::Start,
            retry_count: -1,
            created_at: chrono::Utc::now().timestamp(),
            processor,
            publishers: Vec::new(),
        }
    }

    pub fn contributed_total(&self) -> Decimal {
        self.publishers.iter().map(|p| p.contributed_amount).sum()
    }
}

impl fmt::Display for ContributionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Contribution[{}] type={} amount={} processor={:?} step={} retries={}",
            self.contribution_id,
            self.rewards_type,
            self.amount,
            self.processor,
            self.step,
            self.retry_count
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum SkuOrderItemType {
    SingleUse = 1,
}

impl SkuOrderItemType {
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(SkuOrderItemType::SingleUse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkuOrderItem {
    pub order_item_id: String,
    pub order_id: String,
    pub sku: String,
    pub quantity: u32,
    pub price: Decimal,
    pub item_type: SkuOrderItemType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum SkuOrderStatus {
    Pending = 1,
    Paid = 2,
}

impl SkuOrderStatus {
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(SkuOrderStatus::Pending),
            2 => Some(SkuOrderStatus::Paid),
            _ => None,
        }
    }
}

/// Order for redeemable items bought on behalf of a contribution
#[derive(Debug, Clone, PartialEq)]
pub struct SkuOrder {
    pub order_id: String,
    pub total_amount: Decimal,
    /// Merchant / publisher key the order settles to
    pub location: String,
    pub status: SkuOrderStatus,
    pub items: Vec<SkuOrderItem>,
    pub contribution_id: Option<ContributionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum SkuTransactionType {
    CustodialWallet = 1,
    AnonymousCard = 2,
    Tokens = 3,
}

impl SkuTransactionType {
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(SkuTransactionType::CustodialWallet),
            2 => Some(SkuTransactionType::AnonymousCard),
            3 => Some(SkuTransactionType::Tokens),
            _ => None,
        }
    }
}

impl From<WalletType> for SkuTransactionType {
    fn from(wallet: WalletType) -> Self {
        match wallet {
            WalletType::UnblindedTokens => SkuTransactionType::Tokens,
            WalletType::AnonymousCard => SkuTransactionType::AnonymousCard,
            WalletType::CustodialWallet => SkuTransactionType::CustodialWallet,
        }
    }
}

/// PENDING -> COMPLETED exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum SkuTransactionStatus {
    Pending = 1,
    Completed = 2,
}

impl SkuTransactionStatus {
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(SkuTransactionStatus::Pending),
            2 => Some(SkuTransactionStatus::Completed),
            _ => None,
        }
    }
}

/// Payment of an order through one backend
#[derive(Debug, Clone, PartialEq)]
pub struct SkuTransaction {
    pub transaction_id: String,
    pub order_id: String,
    /// Empty until the external transfer settles
    pub external_transaction_id: String,
    pub transaction_type: SkuTransactionType,
    pub amount: Decimal,
    pub status: SkuTransactionStatus,
}

impl SkuTransaction {
    pub fn pending(order: &SkuOrder, transaction_type: SkuTransactionType) -> Self {
        Self {
            transaction_id: ulid::Ulid::new().to_string(),
            order_id: order.order_id.clone(),
            external_transaction_id: String::new(),
            transaction_type,
            amount: order.total_amount,
            status: SkuTransactionStatus::Pending,
        }
    }
}

/// Fresh balance snapshot, never cached across queue entries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Balance {
    pub total: Decimal,
    pub wallets: HashMap<WalletType, Decimal>,
}

impl Balance {
    pub fn with_wallets(wallets: impl IntoIterator<Item = (WalletType, Decimal)>) -> Self {
        let wallets: HashMap<_, _> = wallets.into_iter().collect();
        Self {
            total: wallets.values().copied().sum(),
            wallets,
        }
    }
}

/// Locally held redeemable token; `token_id` is 0 until stored
#[derive(Debug, Clone, PartialEq)]
pub struct UnblindedToken {
    pub token_id: u64,
    pub token_value: String,
    pub public_key: String,
    pub value: Decimal,
    /// Issuing credential batch; the order id for SKU tokens
    pub creds_id: String,
    pub batch_type: CredsBatchType,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletStatus {
    NotConnected,
    Connected,
    Verified,
}

/// Externally linked wallet handed to the custodial executor
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalWallet {
    pub wallet_type: WalletType,
    pub token: String,
    pub address: String,
    pub status: WalletStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum CredsBatchType {
    Promotion = 1,
    Sku = 2,
}

impl CredsBatchType {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(CredsBatchType::Promotion),
            2 => Some(CredsBatchType::Sku),
            _ => None,
        }
    }
}

/// Credential issuance request for a settled order
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialsTrigger {
    pub id: String,
    pub size: u32,
    pub batch_type: CredsBatchType,
    pub data: Vec<String>,
}

/// Token redemption request
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialsRedeem {
    pub publisher_key: String,
    pub rewards_type: RewardsType,
    pub processor: ContributionProcessor,
    pub token_list: Vec<UnblindedToken>,
    pub order_id: Option<String>,
    pub contribution_id: Option<ContributionId>,
}

impl CredentialsRedeem {
    pub fn value(&self) -> Decimal {
        self.token_list.iter().map(|t| t.value).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecurringTip {
    pub publisher_key: String,
    pub amount: Decimal,
}

/// Monthly balance report bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum ReportType {
    AutoContribution = 1,
    Tip = 2,
    TipRecurring = 3,
    Payment = 4,
}

impl From<RewardsType> for ReportType {
    fn from(rewards_type: RewardsType) -> Self {
        match rewards_type {
            RewardsType::AutoContribute => ReportType::AutoContribution,
            RewardsType::OneTimeTip => ReportType::Tip,
            RewardsType::RecurringTip => ReportType::TipRecurring,
            RewardsType::Payment => ReportType::Payment,
        }
    }
}
