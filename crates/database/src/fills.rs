use {
    crate::{Address, OrderHash, TransactionHash},
    bigdecimal::BigDecimal,
    sqlx::PgConnection,
};

/// Audit record of one order's share of a mined ring.
#[derive(Clone, Debug, Default, Eq, PartialEq, sqlx::FromRow)]
pub struct Fill {
    pub tx_hash: TransactionHash,
    pub fill_index: i64,
    pub log_index: i64,
    pub block_number: i64,
    pub ring_hash: crate::ByteArray<32>,
    pub ring_index: i64,
    pub order_hash: OrderHash,
    pub owner: Address,
    pub token_s: Address,
    pub token_b: Address,
    pub amount_s: BigDecimal,
    pub amount_b: BigDecimal,
    pub split_s: BigDecimal,
    pub split_b: BigDecimal,
    pub market: String,
    pub forked: bool,
}

/// Returns whether the fill was new. A forked fill that got mined again is
/// revived and counts as new.
pub async fn insert(ex: &mut PgConnection, fill: &Fill) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO fills (
    tx_hash,
    fill_index,
    log_index,
    block_number,
    ring_hash,
    ring_index,
    order_hash,
    owner,
    token_s,
    token_b,
    amount_s,
    amount_b,
    split_s,
    split_b,
    market
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
ON CONFLICT (tx_hash, fill_index) DO UPDATE
SET log_index = EXCLUDED.log_index, block_number = EXCLUDED.block_number, forked = false
WHERE fills.forked
    "#;
    let result = sqlx::query(QUERY)
        .bind(fill.tx_hash)
        .bind(fill.fill_index)
        .bind(fill.log_index)
        .bind(fill.block_number)
        .bind(fill.ring_hash)
        .bind(fill.ring_index)
        .bind(fill.order_hash)
        .bind(fill.owner)
        .bind(fill.token_s)
        .bind(fill.token_b)
        .bind(&fill.amount_s)
        .bind(&fill.amount_b)
        .bind(&fill.split_s)
        .bind(&fill.split_b)
        .bind(&fill.market)
        .execute(ex)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn exists(
    ex: &mut PgConnection,
    tx_hash: &TransactionHash,
    fill_index: i64,
) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
SELECT EXISTS (
    SELECT 1 FROM fills
    WHERE tx_hash = $1 AND fill_index = $2 AND NOT forked
)
    "#;
    sqlx::query_scalar(QUERY)
        .bind(tx_hash)
        .bind(fill_index)
        .fetch_one(ex)
        .await
}

/// Flags all fills mined in `(after_block, up_to_block]` as forked and returns
/// them in reverse chain order so callers can undo them newest first.
pub async fn mark_forked(
    ex: &mut PgConnection,
    after_block: i64,
    up_to_block: i64,
) -> Result<Vec<Fill>, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE fills SET forked = true
WHERE block_number > $1 AND block_number <= $2 AND NOT forked
RETURNING *
    "#;
    let mut fills: Vec<Fill> = sqlx::query_as(QUERY)
        .bind(after_block)
        .bind(up_to_block)
        .fetch_all(ex)
        .await?;
    fills.sort_by_key(|fill| std::cmp::Reverse((fill.block_number, fill.log_index)));
    Ok(fills)
}
