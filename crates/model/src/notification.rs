//! Outbound notifications fanned out to the gateway and push services.

use {
    crate::{
        event::{BlockEnd, CutoffAll, CutoffPair, OrderFilled},
        order::Order,
    },
    alloy::primitives::Address,
    serde::{Deserialize, Serialize},
};

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Notification {
    /// Some cached balance or allowance of the owner changed.
    BalanceUpdate { owner: Address },
    OrderUpdate(Box<Order>),
    OrderFilled(OrderFilled),
    Cutoff(CutoffAll),
    CutoffPair(CutoffPair),
    /// Signals dependent services that a block was fully processed.
    RelayBlockEnd(BlockEnd),
}

impl Notification {
    pub fn label(&self) -> &'static str {
        match self {
            Self::BalanceUpdate { .. } => "balance_update",
            Self::OrderUpdate(_) => "order_update",
            Self::OrderFilled(_) => "order_filled",
            Self::Cutoff(_) => "cutoff",
            Self::CutoffPair(_) => "cutoff_pair",
            Self::RelayBlockEnd(_) => "relay_block_end",
        }
    }
}
