use {
    crate::{Address, OrderHash, OrderStatus},
    bigdecimal::BigDecimal,
    sqlx::{PgConnection, QueryBuilder},
};

#[derive(Clone, Debug, Default, Eq, PartialEq, sqlx::FromRow)]
pub struct Order {
    pub order_hash: OrderHash,
    pub protocol: Address,
    pub delegate: Address,
    pub owner: Address,
    pub token_s: Address,
    pub token_b: Address,
    pub amount_s: BigDecimal,
    pub amount_b: BigDecimal,
    pub valid_since: i64,
    pub valid_until: i64,
    pub buy_no_more_than_amount_b: bool,
    pub market: String,
    pub side: String,
    pub created_at: i64,
    pub dealt_amount_s: BigDecimal,
    pub dealt_amount_b: BigDecimal,
    pub split_amount_s: BigDecimal,
    pub split_amount_b: BigDecimal,
    pub cancelled_amount_s: BigDecimal,
    pub cancelled_amount_b: BigDecimal,
    pub updated_block: i64,
    pub status: OrderStatus,
}

/// Fails with a unique violation if the order exists already.
pub async fn insert_order(ex: &mut PgConnection, order: &Order) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO orders (
    order_hash,
    protocol,
    delegate,
    owner,
    token_s,
    token_b,
    amount_s,
    amount_b,
    valid_since,
    valid_until,
    buy_no_more_than_amount_b,
    market,
    side,
    created_at,
    dealt_amount_s,
    dealt_amount_b,
    split_amount_s,
    split_amount_b,
    cancelled_amount_s,
    cancelled_amount_b,
    updated_block,
    status
)
VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
    $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22
)
    "#;
    sqlx::query(QUERY)
        .bind(order.order_hash)
        .bind(order.protocol)
        .bind(order.delegate)
        .bind(order.owner)
        .bind(order.token_s)
        .bind(order.token_b)
        .bind(&order.amount_s)
        .bind(&order.amount_b)
        .bind(order.valid_since)
        .bind(order.valid_until)
        .bind(order.buy_no_more_than_amount_b)
        .bind(&order.market)
        .bind(&order.side)
        .bind(order.created_at)
        .bind(&order.dealt_amount_s)
        .bind(&order.dealt_amount_b)
        .bind(&order.split_amount_s)
        .bind(&order.split_amount_b)
        .bind(&order.cancelled_amount_s)
        .bind(&order.cancelled_amount_b)
        .bind(order.updated_block)
        .bind(order.status)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn single_order(
    ex: &mut PgConnection,
    hash: &OrderHash,
) -> Result<Option<Order>, sqlx::Error> {
    const QUERY: &str = "SELECT * FROM orders WHERE order_hash = $1";
    sqlx::query_as(QUERY).bind(hash).fetch_optional(ex).await
}

/// Locks the row until the surrounding transaction finishes so concurrent
/// read-modify-write cycles on the same order serialize.
pub async fn single_order_for_update(
    ex: &mut PgConnection,
    hash: &OrderHash,
) -> Result<Option<Order>, sqlx::Error> {
    const QUERY: &str = "SELECT * FROM orders WHERE order_hash = $1 FOR UPDATE";
    sqlx::query_as(QUERY).bind(hash).fetch_optional(ex).await
}

/// Writes the settlement columns of an order. The signed terms never change.
pub async fn update_settlement(ex: &mut PgConnection, order: &Order) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
UPDATE orders SET
    dealt_amount_s = $2,
    dealt_amount_b = $3,
    split_amount_s = $4,
    split_amount_b = $5,
    cancelled_amount_s = $6,
    cancelled_amount_b = $7,
    updated_block = $8,
    status = $9
WHERE order_hash = $1
    "#;
    sqlx::query(QUERY)
        .bind(order.order_hash)
        .bind(&order.dealt_amount_s)
        .bind(&order.dealt_amount_b)
        .bind(&order.split_amount_s)
        .bind(&order.split_amount_b)
        .bind(&order.cancelled_amount_s)
        .bind(&order.cancelled_amount_b)
        .bind(order.updated_block)
        .bind(order.status)
        .execute(ex)
        .await?;
    Ok(())
}

/// Selection criteria for bulk status changes. Unset fields do not filter.
#[derive(Clone, Debug, Default)]
pub struct OrderFilter {
    pub order_hash: Option<OrderHash>,
    pub protocol: Option<Address>,
    pub owner: Option<Address>,
    /// Matches orders trading the two tokens in either direction.
    pub token_pair: Option<(Address, Address)>,
    pub created_at_or_before: Option<i64>,
    pub statuses: Vec<OrderStatus>,
}

pub async fn find_orders(
    ex: &mut PgConnection,
    filter: &OrderFilter,
) -> Result<Vec<Order>, sqlx::Error> {
    let mut builder = QueryBuilder::new("SELECT * FROM orders WHERE true");
    if let Some(hash) = filter.order_hash {
        builder.push(" AND order_hash = ").push_bind(hash);
    }
    if let Some(protocol) = filter.protocol {
        builder.push(" AND protocol = ").push_bind(protocol);
    }
    if let Some(owner) = filter.owner {
        builder.push(" AND owner = ").push_bind(owner);
    }
    if let Some((token1, token2)) = filter.token_pair {
        builder
            .push(" AND ((token_s = ")
            .push_bind(token1)
            .push(" AND token_b = ")
            .push_bind(token2)
            .push(") OR (token_s = ")
            .push_bind(token2)
            .push(" AND token_b = ")
            .push_bind(token1)
            .push("))");
    }
    if let Some(created_at) = filter.created_at_or_before {
        builder.push(" AND created_at <= ").push_bind(created_at);
    }
    if !filter.statuses.is_empty() {
        builder
            .push(" AND status = ANY(")
            .push_bind(filter.statuses.clone())
            .push(")");
    }
    builder.push(" ORDER BY created_at, order_hash");
    builder.build_query_as().fetch_all(ex).await
}

pub async fn user_orders(
    ex: &mut PgConnection,
    owner: &Address,
    statuses: &[OrderStatus],
    offset: i64,
    limit: i64,
) -> Result<Vec<Order>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT * FROM orders
WHERE owner = $1 AND (cardinality($2::OrderStatus[]) = 0 OR status = ANY($2))
ORDER BY created_at DESC, order_hash
LIMIT $3 OFFSET $4
    "#;
    sqlx::query_as(QUERY)
        .bind(owner)
        .bind(statuses)
        .bind(limit)
        .bind(offset)
        .fetch_all(ex)
        .await
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        sqlx::{Connection, PgConnection},
    };

    fn order(hash: u8, owner: u8, created_at: i64) -> Order {
        Order {
            order_hash: crate::ByteArray([hash; 32]),
            owner: crate::ByteArray([owner; 20]),
            token_s: crate::ByteArray([10; 20]),
            token_b: crate::ByteArray([11; 20]),
            amount_s: 100.into(),
            amount_b: 300.into(),
            side: "sell".to_string(),
            created_at,
            ..Default::default()
        }
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_insert_and_update_order() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let mut order = order(1, 2, 10);
        insert_order(&mut db, &order).await.unwrap();
        let err = insert_order(&mut db, &order).await.unwrap_err();
        assert!(crate::is_duplicate_record_error(&err));

        order.dealt_amount_s = 40.into();
        order.status = OrderStatus::Partial;
        order.updated_block = 7;
        update_settlement(&mut db, &order).await.unwrap();
        let stored = single_order(&mut db, &order.order_hash).await.unwrap();
        assert_eq!(stored, Some(order));
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_find_orders_by_filter() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let early = order(1, 2, 10);
        let late = order(2, 2, 20);
        let mut reversed = order(3, 2, 5);
        std::mem::swap(&mut reversed.token_s, &mut reversed.token_b);
        let mut finished = order(4, 2, 1);
        finished.status = OrderStatus::Finished;
        let other_owner = order(5, 3, 1);
        for order in [&early, &late, &reversed, &finished, &other_owner] {
            insert_order(&mut db, order).await.unwrap();
        }

        let filter = OrderFilter {
            owner: Some(crate::ByteArray([2; 20])),
            token_pair: Some((crate::ByteArray([10; 20]), crate::ByteArray([11; 20]))),
            created_at_or_before: Some(10),
            statuses: vec![OrderStatus::New, OrderStatus::Partial],
            ..Default::default()
        };
        let found = find_orders(&mut db, &filter).await.unwrap();
        assert_eq!(found, vec![reversed, early.clone()]);

        let page = user_orders(&mut db, &crate::ByteArray([2; 20]), &[], 0, 2)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0], late);
    }
}
