//! Cache key layout. Keys and binary members are shared with other services
//! reading the same store and must not change.

use {
    crate::chain::{AllowanceQuery, BalanceQuery},
    alloy::primitives::Address,
};

/// Set of `owner ‖ token` members touched in a block.
pub fn dirty_balances(block: u64) -> String {
    format!("block_balance_{block}")
}

/// Set of `owner ‖ token ‖ spender` members touched in a block.
pub fn dirty_allowances(block: u64) -> String {
    format!("block_allowance_{block}")
}

/// Highest block whose dirty sets were purged, as a decimal string.
pub fn dirty_purged() -> String {
    "block_dirty_purged".to_string()
}

/// Hash of token address to balance.
pub fn balances(owner: &Address) -> String {
    format!("balance_{owner}")
}

pub fn native_balance(owner: &Address) -> String {
    format!("balance_eth_{owner}")
}

/// Hash of `token ‖ spender` to allowance.
pub fn allowances(owner: &Address) -> String {
    format!("allowance_{owner}")
}

pub fn unlock(owner: &Address) -> String {
    format!("unlock_{owner}")
}

pub fn allowance_field(token: &Address, spender: &Address) -> Vec<u8> {
    [token.as_slice(), spender.as_slice()].concat()
}

pub fn encode_balance(query: &BalanceQuery) -> Vec<u8> {
    [query.owner.as_slice(), query.token.as_slice()].concat()
}

pub fn decode_balance(member: &[u8]) -> Option<BalanceQuery> {
    if member.len() != 40 {
        return None;
    }
    Some(BalanceQuery {
        owner: Address::from_slice(&member[..20]),
        token: Address::from_slice(&member[20..]),
    })
}

pub fn encode_allowance(query: &AllowanceQuery) -> Vec<u8> {
    [
        query.owner.as_slice(),
        query.token.as_slice(),
        query.spender.as_slice(),
    ]
    .concat()
}

pub fn decode_allowance(member: &[u8]) -> Option<AllowanceQuery> {
    if member.len() != 60 {
        return None;
    }
    Some(AllowanceQuery {
        owner: Address::from_slice(&member[..20]),
        token: Address::from_slice(&member[20..40]),
        spender: Address::from_slice(&member[40..]),
    })
}
