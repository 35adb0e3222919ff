//! Contains the order type as described by the exchange protocol together with
//! the off-chain settlement state derived from chain events.

use {
    crate::{TokenPair, u256_decimal},
    alloy::primitives::{Address, B256, U256, keccak256},
    serde::{Deserialize, Serialize},
    strum::{AsRefStr, EnumString},
};

/// Content addressed digest of the signed order terms.
pub type OrderHash = B256;

/// Which side of the market an order is on.
#[derive(
    Eq, PartialEq, Clone, Copy, Debug, Default, Deserialize, Serialize, Hash, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Side {
    #[default]
    Buy,
    Sell,
}

/// Lifecycle status of an order.
///
/// `Pending`, `Cancelling` and `Cutoffing` are provisional markers used while
/// a transaction touching the order is observed but not yet confirmed.
#[derive(
    Eq, PartialEq, Clone, Copy, Debug, Default, Deserialize, Serialize, Hash, AsRefStr, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Unknown,
    #[default]
    New,
    Partial,
    Finished,
    Cancel,
    Cutoff,
    FlexCancel,
    Pending,
    Cancelling,
    Cutoffing,
}

impl OrderStatus {
    /// Fills against orders in these states are rejected.
    pub fn rejects_fills(self) -> bool {
        matches!(self, Self::Cutoff | Self::Finished | Self::Unknown)
    }

    /// States that a confirmed cutoff moves to `Cutoff`.
    pub const CUTOFF_ELIGIBLE: &'static [OrderStatus] = &[
        Self::New,
        Self::Partial,
        Self::Pending,
        Self::Cancelling,
        Self::Cutoffing,
    ];

    /// States from which an order can still be cancelled off-chain.
    pub const FLEX_CANCELLABLE: &'static [OrderStatus] = &[Self::New, Self::Partial];

    pub fn is_provisional(self) -> bool {
        matches!(self, Self::Pending | Self::Cancelling | Self::Cutoffing)
    }

    /// Derives the status from the settled totals.
    ///
    /// Nothing settled means the order is still new. Otherwise an order whose
    /// remainder is still worth trading is partially filled, and a dust
    /// remainder finishes the order, or cancels it when the triggering event
    /// was a cancellation.
    pub fn recompute(settled: U256, remaining_is_dust: bool, cancellation: bool) -> Self {
        if settled.is_zero() {
            Self::New
        } else if !remaining_is_dust {
            Self::Partial
        } else if cancellation {
            Self::Cancel
        } else {
            Self::Finished
        }
    }
}

/// How a status change gets decided.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transition {
    /// Derive the status from the amounts. `cancellation` selects the
    /// `Cancel` branch for a fully settled order.
    Recompute { cancellation: bool },
    /// Force a status regardless of the amounts (cutoffs, flex cancels,
    /// provisional markers).
    Override(OrderStatus),
}

impl Transition {
    pub fn resolve(self, settled: U256, remaining_is_dust: bool) -> OrderStatus {
        match self {
            Self::Recompute { cancellation } => {
                OrderStatus::recompute(settled, remaining_is_dust, cancellation)
            }
            Self::Override(status) => status,
        }
    }
}

/// The signed terms of an order.
#[derive(Eq, PartialEq, Clone, Debug, Default, Deserialize, Serialize, Hash)]
#[serde(rename_all = "camelCase")]
pub struct OrderData {
    pub protocol: Address,
    pub delegate: Address,
    pub owner: Address,
    pub token_s: Address,
    pub token_b: Address,
    #[serde(with = "u256_decimal")]
    pub amount_s: U256,
    #[serde(with = "u256_decimal")]
    pub amount_b: U256,
    pub valid_since: u64,
    pub valid_until: u64,
    /// Selects the buy side as the side that accumulates settlement.
    pub buy_no_more_than_amount_b: bool,
    pub market: String,
    pub side: Side,
}

impl OrderData {
    /// Keccak digest over the tightly packed order terms. Derived attributes
    /// (market, side) are not part of the digest.
    pub fn hash(&self) -> OrderHash {
        let mut buffer = Vec::with_capacity(5 * 20 + 4 * 32 + 1);
        buffer.extend_from_slice(self.protocol.as_slice());
        buffer.extend_from_slice(self.delegate.as_slice());
        buffer.extend_from_slice(self.owner.as_slice());
        buffer.extend_from_slice(self.token_s.as_slice());
        buffer.extend_from_slice(self.token_b.as_slice());
        buffer.extend_from_slice(&self.amount_s.to_be_bytes::<32>());
        buffer.extend_from_slice(&self.amount_b.to_be_bytes::<32>());
        buffer.extend_from_slice(&U256::from(self.valid_since).to_be_bytes::<32>());
        buffer.extend_from_slice(&U256::from(self.valid_until).to_be_bytes::<32>());
        buffer.push(self.buy_no_more_than_amount_b.into());
        keccak256(buffer)
    }

    pub fn token_pair(&self) -> Option<TokenPair> {
        TokenPair::new(self.token_s, self.token_b)
    }
}

/// Settlement state of an order derived from chain events.
#[derive(Eq, PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMetadata {
    pub hash: OrderHash,
    /// Unix timestamp of when the order was accepted by the gateway.
    pub created_at: u64,
    #[serde(with = "u256_decimal")]
    pub dealt_amount_s: U256,
    #[serde(with = "u256_decimal")]
    pub dealt_amount_b: U256,
    #[serde(with = "u256_decimal")]
    pub split_amount_s: U256,
    #[serde(with = "u256_decimal")]
    pub split_amount_b: U256,
    #[serde(with = "u256_decimal")]
    pub cancelled_amount_s: U256,
    #[serde(with = "u256_decimal")]
    pub cancelled_amount_b: U256,
    pub updated_block: u64,
    pub status: OrderStatus,
}

/// Amounts a fill adds to an order.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FillAmounts {
    pub amount_s: U256,
    pub amount_b: U256,
    pub split_s: U256,
    pub split_b: U256,
}

#[derive(Eq, PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct Order {
    #[serde(flatten)]
    pub metadata: OrderMetadata,
    #[serde(flatten)]
    pub data: OrderData,
}

impl Order {
    /// A freshly submitted order with nothing settled.
    pub fn new(data: OrderData, created_at: u64) -> Self {
        Self {
            metadata: OrderMetadata {
                hash: data.hash(),
                created_at,
                status: OrderStatus::New,
                ..Default::default()
            },
            data,
        }
    }

    /// The original amount of the side that accumulates settlement.
    pub fn original_amount(&self) -> U256 {
        if self.data.buy_no_more_than_amount_b {
            self.data.amount_b
        } else {
            self.data.amount_s
        }
    }

    /// Dealt, split and cancelled amounts of the settled side.
    pub fn settled_amount(&self) -> U256 {
        let m = &self.metadata;
        if self.data.buy_no_more_than_amount_b {
            m.dealt_amount_b
                .saturating_add(m.split_amount_b)
                .saturating_add(m.cancelled_amount_b)
        } else {
            m.dealt_amount_s
                .saturating_add(m.split_amount_s)
                .saturating_add(m.cancelled_amount_s)
        }
    }

    pub fn remaining_amount(&self) -> U256 {
        self.original_amount().saturating_sub(self.settled_amount())
    }

    /// Whether more has been settled than the order allowed.
    pub fn is_oversettled(&self) -> bool {
        self.settled_amount() > self.original_amount()
    }

    pub fn add_fill(&mut self, fill: &FillAmounts) {
        let m = &mut self.metadata;
        m.dealt_amount_s = m.dealt_amount_s.saturating_add(fill.amount_s);
        m.dealt_amount_b = m.dealt_amount_b.saturating_add(fill.amount_b);
        m.split_amount_s = m.split_amount_s.saturating_add(fill.split_s);
        m.split_amount_b = m.split_amount_b.saturating_add(fill.split_b);
    }

    /// Reverts a previously added fill, e.g. because its block got forked.
    pub fn remove_fill(&mut self, fill: &FillAmounts) {
        let m = &mut self.metadata;
        m.dealt_amount_s = m.dealt_amount_s.saturating_sub(fill.amount_s);
        m.dealt_amount_b = m.dealt_amount_b.saturating_sub(fill.amount_b);
        m.split_amount_s = m.split_amount_s.saturating_sub(fill.split_s);
        m.split_amount_b = m.split_amount_b.saturating_sub(fill.split_b);
    }

    /// Cancellations only ever apply to the settled side.
    pub fn add_cancelled(&mut self, amount: U256) {
        let m = &mut self.metadata;
        if self.data.buy_no_more_than_amount_b {
            m.cancelled_amount_b = m.cancelled_amount_b.saturating_add(amount);
        } else {
            m.cancelled_amount_s = m.cancelled_amount_s.saturating_add(amount);
        }
    }

    pub fn remove_cancelled(&mut self, amount: U256) {
        let m = &mut self.metadata;
        if self.data.buy_no_more_than_amount_b {
            m.cancelled_amount_b = m.cancelled_amount_b.saturating_sub(amount);
        } else {
            m.cancelled_amount_s = m.cancelled_amount_s.saturating_sub(amount);
        }
    }

    /// Applies a transition and returns the new status.
    pub fn settle(&mut self, transition: Transition, remaining_is_dust: bool) -> OrderStatus {
        self.metadata.status = transition.resolve(self.settled_amount(), remaining_is_dust);
        self.metadata.status
    }
}

#[cfg(test)]
mod tests {
    use {super::*, maplit::hashset};

    fn order(amount_s: u64, amount_b: u64, buy_no_more_than_amount_b: bool) -> Order {
        Order::new(
            OrderData {
                owner: Address::repeat_byte(1),
                token_s: Address::repeat_byte(2),
                token_b: Address::repeat_byte(3),
                amount_s: U256::from(amount_s),
                amount_b: U256::from(amount_b),
                buy_no_more_than_amount_b,
                ..Default::default()
            },
            0,
        )
    }

    #[test]
    fn recompute_branches() {
        let zero = U256::ZERO;
        let some = U256::from(1);
        assert_eq!(OrderStatus::recompute(zero, true, true), OrderStatus::New);
        assert_eq!(OrderStatus::recompute(zero, false, false), OrderStatus::New);
        assert_eq!(OrderStatus::recompute(some, false, true), OrderStatus::Partial);
        assert_eq!(OrderStatus::recompute(some, true, true), OrderStatus::Cancel);
        assert_eq!(OrderStatus::recompute(some, true, false), OrderStatus::Finished);
    }

    #[test]
    fn override_bypasses_amounts() {
        let mut order = order(100, 300, false);
        let status = order.settle(Transition::Override(OrderStatus::Cutoff), false);
        assert_eq!(status, OrderStatus::Cutoff);
        assert_eq!(order.metadata.status, OrderStatus::Cutoff);
    }

    #[test]
    fn settled_side_follows_flag() {
        let fill = FillAmounts {
            amount_s: U256::from(40),
            amount_b: U256::from(120),
            split_s: U256::from(1),
            split_b: U256::from(2),
        };

        let mut sell = order(100, 300, false);
        sell.add_fill(&fill);
        assert_eq!(sell.settled_amount(), U256::from(41));
        assert_eq!(sell.remaining_amount(), U256::from(59));

        let mut buy = order(100, 300, true);
        buy.add_fill(&fill);
        buy.add_cancelled(U256::from(8));
        assert_eq!(buy.settled_amount(), U256::from(130));
        assert_eq!(buy.metadata.cancelled_amount_s, U256::ZERO);
        assert_eq!(buy.remaining_amount(), U256::from(170));
    }

    #[test]
    fn removing_a_fill_restores_amounts() {
        let fill = FillAmounts {
            amount_s: U256::from(40),
            ..Default::default()
        };
        let mut order = order(100, 300, false);
        order.add_fill(&fill);
        order.remove_fill(&fill);
        assert_eq!(order.settled_amount(), U256::ZERO);
        assert_eq!(
            order.settle(Transition::Recompute { cancellation: false }, false),
            OrderStatus::New
        );
    }

    #[test]
    fn oversettlement_saturates_remaining() {
        let mut order = order(100, 300, false);
        order.add_fill(&FillAmounts {
            amount_s: U256::from(150),
            ..Default::default()
        });
        assert!(order.is_oversettled());
        assert_eq!(order.remaining_amount(), U256::ZERO);
    }

    #[test]
    fn hash_covers_terms_only() {
        let a = order(100, 300, false);
        let mut b = a.clone();
        b.data.market = "LRC-WETH".to_string();
        b.data.side = Side::Sell;
        assert_eq!(a.data.hash(), b.data.hash());
        b.data.amount_s = U256::from(101);
        assert_ne!(a.data.hash(), b.data.hash());
        assert_eq!(a.metadata.hash, a.data.hash());
    }

    #[test]
    fn terminal_states_reject_fills() {
        let rejecting = OrderStatus::CUTOFF_ELIGIBLE
            .iter()
            .chain(OrderStatus::FLEX_CANCELLABLE)
            .filter(|status| status.rejects_fills())
            .collect::<Vec<_>>();
        assert!(rejecting.is_empty());
        let terminal = hashset! {OrderStatus::Cutoff, OrderStatus::Finished, OrderStatus::Unknown};
        assert!(terminal.iter().all(|status| status.rejects_fills()));
    }

    #[test]
    fn status_strings() {
        assert_eq!(OrderStatus::FlexCancel.as_ref(), "FLEX_CANCEL");
        assert_eq!("CUTOFFING".parse::<OrderStatus>().unwrap(), OrderStatus::Cutoffing);
        assert_eq!(Side::Sell.as_ref(), "sell");
    }
}
