//! Orders are moved into a provisional status as soon as a transaction
//! touching them is seen in the mempool. The status they had before is kept
//! here so a failed or confirmed transaction can restore it.

use {
    crate::{OrderHash, OrderStatus, TransactionHash},
    sqlx::PgConnection,
};

#[derive(Clone, Debug, Default, Eq, PartialEq, sqlx::FromRow)]
pub struct PendingTransaction {
    pub tx_hash: TransactionHash,
    pub order_hash: OrderHash,
    pub prior_status: OrderStatus,
}

/// Returns whether the record was new. A transaction seen twice keeps the
/// status recorded the first time.
pub async fn insert(
    ex: &mut PgConnection,
    pending: &PendingTransaction,
) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO pending_transactions (tx_hash, order_hash, prior_status)
VALUES ($1, $2, $3)
ON CONFLICT DO NOTHING
    "#;
    let result = sqlx::query(QUERY)
        .bind(pending.tx_hash)
        .bind(pending.order_hash)
        .bind(pending.prior_status)
        .execute(ex)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Removes all records of the transaction and returns them.
pub async fn take(
    ex: &mut PgConnection,
    tx_hash: &TransactionHash,
) -> Result<Vec<PendingTransaction>, sqlx::Error> {
    const QUERY: &str = r#"
DELETE FROM pending_transactions WHERE tx_hash = $1
RETURNING *
    "#;
    sqlx::query_as(QUERY).bind(tx_hash).fetch_all(ex).await
}
