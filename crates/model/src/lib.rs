//! Contains models that are shared between the relay state synchronization
//! components and the persistence layer.

pub mod event;
pub mod notification;
pub mod order;
pub mod u256_decimal;

use {
    alloy::primitives::Address,
    serde::{Deserialize, Serialize},
};

/// Erc20 token pair specified by two contract addresses.
///
/// Cutoffs for a pair apply regardless of which side of an order a token is
/// on, so the pair is normalized on construction.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct TokenPair(Address, Address);

impl TokenPair {
    /// Create a new token pair from two addresses.
    /// The addresses must not be the equal.
    pub fn new(token_a: Address, token_b: Address) -> Option<Self> {
        match token_a.cmp(&token_b) {
            std::cmp::Ordering::Less => Some(Self(token_a, token_b)),
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Greater => Some(Self(token_b, token_a)),
        }
    }

    /// Used to determine if `token` is among the pair.
    pub fn contains(&self, token: &Address) -> bool {
        self.0 == *token || self.1 == *token
    }

    /// The first address is always the lower one.
    /// The addresses are never equal.
    pub fn get(&self) -> (Address, Address) {
        (self.0, self.1)
    }
}

impl IntoIterator for TokenPair {
    type IntoIter = std::iter::Chain<std::iter::Once<Address>, std::iter::Once<Address>>;
    type Item = Address;

    fn into_iter(self) -> Self::IntoIter {
        std::iter::once(self.0).chain(std::iter::once(self.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_pair_is_sorted() {
        let token_a = Address::repeat_byte(0);
        let token_b = Address::repeat_byte(1);
        let pair_0 = TokenPair::new(token_a, token_b).unwrap();
        let pair_1 = TokenPair::new(token_b, token_a).unwrap();
        assert_eq!(pair_0, pair_1);
        assert_eq!(pair_0.get(), (token_a, token_b));
    }

    #[test]
    fn token_pair_cannot_be_equal() {
        let token = Address::repeat_byte(1);
        assert_eq!(TokenPair::new(token, token), None);
    }

    #[test]
    fn token_pair_contains() {
        let pair = TokenPair::new(Address::repeat_byte(1), Address::repeat_byte(2)).unwrap();
        assert!(pair.contains(&Address::repeat_byte(2)));
        assert!(!pair.contains(&Address::repeat_byte(3)));
        assert_eq!(pair.into_iter().count(), 2);
    }
}
