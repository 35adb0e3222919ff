//! Inbound domain events as delivered by the chain extractor and the order
//! gateway.

use {
    crate::{
        TokenPair,
        order::{FillAmounts, OrderData, OrderHash},
        u256_decimal,
    },
    alloy::primitives::{Address, B256, U256},
    serde::{Deserialize, Serialize},
    strum::{AsRefStr, EnumIter},
};

/// Confirmation state of the transaction an event was observed in.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "snake_case")]
pub enum TxStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

/// Transaction context every chain event carries.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInfo {
    /// Exchange contract that emitted the event.
    pub protocol: Address,
    pub from: Address,
    pub to: Address,
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    pub block_time: u64,
    pub status: TxStatus,
}

/// An order accepted by the gateway.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub order: OrderData,
    pub created_at: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    #[serde(flatten)]
    pub tx: TxInfo,
    pub token: Address,
    pub owner: Address,
    pub spender: Address,
    #[serde(with = "u256_decimal")]
    pub amount: U256,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    #[serde(flatten)]
    pub tx: TxInfo,
    pub token: Address,
    pub sender: Address,
    pub receiver: Address,
    #[serde(with = "u256_decimal")]
    pub amount: U256,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WethDeposit {
    #[serde(flatten)]
    pub tx: TxInfo,
    pub dst: Address,
    #[serde(with = "u256_decimal")]
    pub amount: U256,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WethWithdrawal {
    #[serde(flatten)]
    pub tx: TxInfo,
    pub src: Address,
    #[serde(with = "u256_decimal")]
    pub amount: U256,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EthTransfer {
    #[serde(flatten)]
    pub tx: TxInfo,
    pub sender: Address,
    pub receiver: Address,
    #[serde(with = "u256_decimal")]
    pub amount: U256,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFilled {
    #[serde(flatten)]
    pub tx: TxInfo,
    pub ring_hash: B256,
    pub ring_index: u64,
    pub fill_index: u64,
    pub order_hash: OrderHash,
    pub owner: Address,
    pub token_s: Address,
    pub token_b: Address,
    #[serde(with = "u256_decimal")]
    pub amount_s: U256,
    #[serde(with = "u256_decimal")]
    pub amount_b: U256,
    #[serde(with = "u256_decimal")]
    pub split_s: U256,
    #[serde(with = "u256_decimal")]
    pub split_b: U256,
    pub market: String,
}

impl OrderFilled {
    pub fn amounts(&self) -> FillAmounts {
        FillAmounts {
            amount_s: self.amount_s,
            amount_b: self.amount_b,
            split_s: self.split_s,
            split_b: self.split_b,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    #[serde(flatten)]
    pub tx: TxInfo,
    pub order_hash: OrderHash,
    #[serde(with = "u256_decimal")]
    pub amount_cancelled: U256,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CutoffAll {
    #[serde(flatten)]
    pub tx: TxInfo,
    pub owner: Address,
    /// Orders created at or before this unix timestamp are invalid.
    pub cutoff: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CutoffPair {
    #[serde(flatten)]
    pub tx: TxInfo,
    pub owner: Address,
    pub token1: Address,
    pub token2: Address,
    pub cutoff: u64,
}

impl CutoffPair {
    pub fn token_pair(&self) -> Option<TokenPair> {
        TokenPair::new(self.token1, self.token2)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RingMined {
    #[serde(flatten)]
    pub tx: TxInfo,
    pub ring_index: u64,
    pub ring_hash: B256,
    pub miner: Address,
    pub fee_recipient: Address,
}

/// A `submitRing` call observed in a transaction, carrying the orders it
/// tries to settle.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRingMethod {
    #[serde(flatten)]
    pub tx: TxInfo,
    pub ring_hash: B256,
    pub order_hashes: Vec<OrderHash>,
    pub miner: Address,
    pub fee_recipient: Address,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockNew {
    pub block_number: u64,
    pub block_hash: B256,
    pub parent_hash: B256,
    pub block_time: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockEnd {
    pub block_number: u64,
    pub block_hash: B256,
}

/// Blocks after `fork_block` up to and including `detected_block` are no
/// longer canonical.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainFork {
    pub fork_block: u64,
    pub detected_block: u64,
}

/// Tag of an [`Event`], used to route events to their subscribers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, AsRefStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    NewOrder,
    Approval,
    Transfer,
    WethDeposit,
    WethWithdrawal,
    EthTransfer,
    OrderFilled,
    OrderCancelled,
    CutoffAll,
    CutoffPair,
    RingMined,
    SubmitRingMethod,
    BlockNew,
    BlockEnd,
    ChainForkDetected,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize, derive_more::From)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    NewOrder(NewOrder),
    Approval(Approval),
    Transfer(Transfer),
    WethDeposit(WethDeposit),
    WethWithdrawal(WethWithdrawal),
    EthTransfer(EthTransfer),
    OrderFilled(OrderFilled),
    OrderCancelled(OrderCancelled),
    CutoffAll(CutoffAll),
    CutoffPair(CutoffPair),
    RingMined(RingMined),
    SubmitRingMethod(SubmitRingMethod),
    BlockNew(BlockNew),
    BlockEnd(BlockEnd),
    ChainForkDetected(ChainFork),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewOrder(_) => EventKind::NewOrder,
            Self::Approval(_) => EventKind::Approval,
            Self::Transfer(_) => EventKind::Transfer,
            Self::WethDeposit(_) => EventKind::WethDeposit,
            Self::WethWithdrawal(_) => EventKind::WethWithdrawal,
            Self::EthTransfer(_) => EventKind::EthTransfer,
            Self::OrderFilled(_) => EventKind::OrderFilled,
            Self::OrderCancelled(_) => EventKind::OrderCancelled,
            Self::CutoffAll(_) => EventKind::CutoffAll,
            Self::CutoffPair(_) => EventKind::CutoffPair,
            Self::RingMined(_) => EventKind::RingMined,
            Self::SubmitRingMethod(_) => EventKind::SubmitRingMethod,
            Self::BlockNew(_) => EventKind::BlockNew,
            Self::BlockEnd(_) => EventKind::BlockEnd,
            Self::ChainForkDetected(_) => EventKind::ChainForkDetected,
        }
    }

    /// The transaction context for events that originate from a transaction.
    pub fn tx(&self) -> Option<&TxInfo> {
        match self {
            Self::Approval(e) => Some(&e.tx),
            Self::Transfer(e) => Some(&e.tx),
            Self::WethDeposit(e) => Some(&e.tx),
            Self::WethWithdrawal(e) => Some(&e.tx),
            Self::EthTransfer(e) => Some(&e.tx),
            Self::OrderFilled(e) => Some(&e.tx),
            Self::OrderCancelled(e) => Some(&e.tx),
            Self::CutoffAll(e) => Some(&e.tx),
            Self::CutoffPair(e) => Some(&e.tx),
            Self::RingMined(e) => Some(&e.tx),
            Self::SubmitRingMethod(e) => Some(&e.tx),
            Self::NewOrder(_)
            | Self::BlockNew(_)
            | Self::BlockEnd(_)
            | Self::ChainForkDetected(_) => None,
        }
    }

    /// Events without a transaction count as confirmed.
    pub fn status(&self) -> TxStatus {
        self.tx().map(|tx| tx.status).unwrap_or(TxStatus::Success)
    }
}
