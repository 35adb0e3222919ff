use {
    crate::{OrderHash, TransactionHash},
    bigdecimal::BigDecimal,
    sqlx::PgConnection,
};

#[derive(Clone, Debug, Default, Eq, PartialEq, sqlx::FromRow)]
pub struct Cancel {
    pub tx_hash: TransactionHash,
    pub log_index: i64,
    pub block_number: i64,
    pub order_hash: OrderHash,
    pub amount_cancelled: BigDecimal,
    pub forked: bool,
}

/// Returns whether the cancellation was new or revived a forked one.
pub async fn insert(ex: &mut PgConnection, cancel: &Cancel) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO cancels (tx_hash, log_index, block_number, order_hash, amount_cancelled)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (tx_hash) DO UPDATE
SET log_index = EXCLUDED.log_index, block_number = EXCLUDED.block_number, forked = false
WHERE cancels.forked
    "#;
    let result = sqlx::query(QUERY)
        .bind(cancel.tx_hash)
        .bind(cancel.log_index)
        .bind(cancel.block_number)
        .bind(cancel.order_hash)
        .bind(&cancel.amount_cancelled)
        .execute(ex)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn exists(ex: &mut PgConnection, tx_hash: &TransactionHash) -> Result<bool, sqlx::Error> {
    const QUERY: &str = "SELECT EXISTS (SELECT 1 FROM cancels WHERE tx_hash = $1 AND NOT forked)";
    sqlx::query_scalar(QUERY).bind(tx_hash).fetch_one(ex).await
}

pub async fn mark_forked(
    ex: &mut PgConnection,
    after_block: i64,
    up_to_block: i64,
) -> Result<Vec<Cancel>, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE cancels SET forked = true
WHERE block_number > $1 AND block_number <= $2 AND NOT forked
RETURNING *
    "#;
    let mut cancels: Vec<Cancel> = sqlx::query_as(QUERY)
        .bind(after_block)
        .bind(up_to_block)
        .fetch_all(ex)
        .await?;
    cancels.sort_by_key(|cancel| std::cmp::Reverse((cancel.block_number, cancel.log_index)));
    Ok(cancels)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::ByteArray,
        sqlx::{Connection, PgConnection},
    };

    #[tokio::test]
    #[ignore]
    async fn postgres_cancel_roundtrip() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let cancel = Cancel {
            tx_hash: ByteArray([1; 32]),
            block_number: 3,
            order_hash: ByteArray([2; 32]),
            amount_cancelled: 7.into(),
            ..Default::default()
        };
        assert!(insert(&mut db, &cancel).await.unwrap());
        assert!(!insert(&mut db, &cancel).await.unwrap());
        assert!(exists(&mut db, &cancel.tx_hash).await.unwrap());

        assert!(mark_forked(&mut db, 3, 10).await.unwrap().is_empty());
        let forked = mark_forked(&mut db, 2, 10).await.unwrap();
        assert_eq!(
            forked,
            vec![Cancel {
                forked: true,
                ..cancel
            }]
        );
    }
}
