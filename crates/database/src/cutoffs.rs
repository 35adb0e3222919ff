//! Cutoffs invalidate every order of an owner created at or before a
//! timestamp, either for all markets or for a single token pair. Both kinds
//! live in their own table but share the row layout apart from the pair.

use {
    crate::{Address, OrderHash, TransactionHash},
    sqlx::PgConnection,
};

#[derive(Clone, Debug, Default, Eq, PartialEq, sqlx::FromRow)]
pub struct Cutoff {
    pub tx_hash: TransactionHash,
    pub log_index: i64,
    pub block_number: i64,
    pub protocol: Address,
    pub owner: Address,
    pub cutoff: i64,
    /// Orders whose status was changed by this cutoff.
    pub affected_orders: Vec<OrderHash>,
    pub forked: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, sqlx::FromRow)]
pub struct CutoffPair {
    pub tx_hash: TransactionHash,
    pub log_index: i64,
    pub block_number: i64,
    pub protocol: Address,
    pub owner: Address,
    /// The lower address of the pair.
    pub token1: Address,
    pub token2: Address,
    pub cutoff: i64,
    pub affected_orders: Vec<OrderHash>,
    pub forked: bool,
}

/// Returns whether the cutoff was new or revived a forked one.
pub async fn insert(ex: &mut PgConnection, cutoff: &Cutoff) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO cutoffs (tx_hash, log_index, block_number, protocol, owner, cutoff, affected_orders)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (tx_hash) DO UPDATE
SET
    log_index = EXCLUDED.log_index,
    block_number = EXCLUDED.block_number,
    affected_orders = EXCLUDED.affected_orders,
    forked = false
WHERE cutoffs.forked
    "#;
    let result = sqlx::query(QUERY)
        .bind(cutoff.tx_hash)
        .bind(cutoff.log_index)
        .bind(cutoff.block_number)
        .bind(cutoff.protocol)
        .bind(cutoff.owner)
        .bind(cutoff.cutoff)
        .bind(&cutoff.affected_orders)
        .execute(ex)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Returns whether the pair cutoff was new.
pub async fn insert_pair(ex: &mut PgConnection, cutoff: &CutoffPair) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO cutoff_pairs (
    tx_hash, log_index, block_number, protocol, owner, token1, token2, cutoff, affected_orders
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
ON CONFLICT (tx_hash) DO UPDATE
SET
    log_index = EXCLUDED.log_index,
    block_number = EXCLUDED.block_number,
    affected_orders = EXCLUDED.affected_orders,
    forked = false
WHERE cutoff_pairs.forked
    "#;
    let result = sqlx::query(QUERY)
        .bind(cutoff.tx_hash)
        .bind(cutoff.log_index)
        .bind(cutoff.block_number)
        .bind(cutoff.protocol)
        .bind(cutoff.owner)
        .bind(cutoff.token1)
        .bind(cutoff.token2)
        .bind(cutoff.cutoff)
        .bind(&cutoff.affected_orders)
        .execute(ex)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Whether a live cutoff of either kind was recorded for the transaction.
pub async fn exists(ex: &mut PgConnection, tx_hash: &TransactionHash) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
SELECT EXISTS (SELECT 1 FROM cutoffs WHERE tx_hash = $1 AND NOT forked)
    OR EXISTS (SELECT 1 FROM cutoff_pairs WHERE tx_hash = $1 AND NOT forked)
    "#;
    sqlx::query_scalar(QUERY).bind(tx_hash).fetch_one(ex).await
}

/// The highest cutoff timestamp of the owner that was not forked away.
pub async fn latest(
    ex: &mut PgConnection,
    protocol: &Address,
    owner: &Address,
) -> Result<Option<i64>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT MAX(cutoff) FROM cutoffs
WHERE protocol = $1 AND owner = $2 AND NOT forked
    "#;
    sqlx::query_scalar(QUERY)
        .bind(protocol)
        .bind(owner)
        .fetch_one(ex)
        .await
}

/// Like [`latest`] but for a normalized token pair.
pub async fn latest_pair(
    ex: &mut PgConnection,
    protocol: &Address,
    owner: &Address,
    token1: &Address,
    token2: &Address,
) -> Result<Option<i64>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT MAX(cutoff) FROM cutoff_pairs
WHERE protocol = $1 AND owner = $2 AND token1 = $3 AND token2 = $4 AND NOT forked
    "#;
    sqlx::query_scalar(QUERY)
        .bind(protocol)
        .bind(owner)
        .bind(token1)
        .bind(token2)
        .fetch_one(ex)
        .await
}

pub async fn mark_forked(
    ex: &mut PgConnection,
    after_block: i64,
    up_to_block: i64,
) -> Result<Vec<Cutoff>, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE cutoffs SET forked = true
WHERE block_number > $1 AND block_number <= $2 AND NOT forked
RETURNING *
    "#;
    let mut cutoffs: Vec<Cutoff> = sqlx::query_as(QUERY)
        .bind(after_block)
        .bind(up_to_block)
        .fetch_all(ex)
        .await?;
    cutoffs.sort_by_key(|cutoff| std::cmp::Reverse((cutoff.block_number, cutoff.log_index)));
    Ok(cutoffs)
}

pub async fn mark_pairs_forked(
    ex: &mut PgConnection,
    after_block: i64,
    up_to_block: i64,
) -> Result<Vec<CutoffPair>, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE cutoff_pairs SET forked = true
WHERE block_number > $1 AND block_number <= $2 AND NOT forked
RETURNING *
    "#;
    let mut cutoffs: Vec<CutoffPair> = sqlx::query_as(QUERY)
        .bind(after_block)
        .bind(up_to_block)
        .fetch_all(ex)
        .await?;
    cutoffs.sort_by_key(|cutoff| std::cmp::Reverse((cutoff.block_number, cutoff.log_index)));
    Ok(cutoffs)
}
