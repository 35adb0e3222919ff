use {
    crate::{Address, TransactionHash, TxStatus},
    sqlx::PgConnection,
};

#[derive(Clone, Debug, Default, Eq, PartialEq, sqlx::FromRow)]
pub struct RingMined {
    pub tx_hash: TransactionHash,
    pub block_number: i64,
    pub ring_hash: crate::ByteArray<32>,
    pub ring_index: i64,
    pub miner: Address,
    pub fee_recipient: Address,
    pub status: TxStatus,
    pub forked: bool,
}

pub async fn fetch(
    ex: &mut PgConnection,
    tx_hash: &TransactionHash,
) -> Result<Option<RingMined>, sqlx::Error> {
    const QUERY: &str = "SELECT * FROM ring_mined WHERE tx_hash = $1";
    sqlx::query_as(QUERY).bind(tx_hash).fetch_optional(ex).await
}

/// Inserts the ring or moves an existing row to the new status. A ring that
/// reached a final status keeps it.
pub async fn upsert(ex: &mut PgConnection, ring: &RingMined) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO ring_mined (tx_hash, block_number, ring_hash, ring_index, miner, fee_recipient, status)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (tx_hash) DO UPDATE
SET block_number = EXCLUDED.block_number, status = EXCLUDED.status, forked = false
WHERE ring_mined.status = 'pending' OR ring_mined.forked
    "#;
    sqlx::query(QUERY)
        .bind(ring.tx_hash)
        .bind(ring.block_number)
        .bind(ring.ring_hash)
        .bind(ring.ring_index)
        .bind(ring.miner)
        .bind(ring.fee_recipient)
        .bind(ring.status)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn mark_forked(
    ex: &mut PgConnection,
    after_block: i64,
    up_to_block: i64,
) -> Result<Vec<RingMined>, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE ring_mined SET forked = true
WHERE block_number > $1 AND block_number <= $2 AND NOT forked
RETURNING *
    "#;
    sqlx::query_as(QUERY)
        .bind(after_block)
        .bind(up_to_block)
        .fetch_all(ex)
        .await
}
