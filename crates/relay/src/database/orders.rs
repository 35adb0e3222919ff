use {
    super::Postgres,
    crate::cutoff_cache::CutoffKey,
    alloy::primitives::{Address, B256, U256},
    anyhow::{Context, Result},
    database::byte_array::ByteArray,
    model::{
        TokenPair,
        event::{OrderCancelled, OrderFilled, TxInfo, TxStatus},
        order::{FillAmounts, Order, OrderData, OrderHash, OrderMetadata, OrderStatus},
    },
    number::conversions::{big_decimal_to_u256, u256_to_big_decimal},
    sqlx::PgConnection,
};

/// Persistence of orders and the audit rows of the events that changed them.
///
/// Methods that save an audit row together with orders do so atomically and
/// return `false` without writing anything if a live row with the same
/// idempotency key exists already.
#[async_trait::async_trait]
pub trait OrderStoring: Send + Sync {
    async fn insert_order(&self, order: &Order) -> Result<(), InsertionError>;
    async fn order(&self, hash: &OrderHash) -> Result<Option<Order>>;
    /// Orders of the owner, newest first. Empty `statuses` match any status.
    async fn orders_by_owner(
        &self,
        owner: &Address,
        statuses: &[OrderStatus],
        page: Page,
    ) -> Result<Vec<Order>>;
    async fn find_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>>;
    async fn update_orders(&self, orders: &[Order]) -> Result<()>;

    async fn fill_exists(&self, tx_hash: &B256, fill_index: u64) -> Result<bool>;
    async fn save_fill(&self, fill: &OrderFilled, order: &Order) -> Result<bool>;
    async fn cancel_exists(&self, tx_hash: &B256) -> Result<bool>;
    async fn save_cancel(&self, cancel: &OrderCancelled, order: &Order) -> Result<bool>;
    async fn cutoff_exists(&self, tx_hash: &B256) -> Result<bool>;
    async fn save_cutoff(&self, cutoff: &CutoffRecord, orders: &[Order]) -> Result<bool>;
    /// Highest cutoff of the key that was not forked away.
    async fn latest_cutoff(&self, key: &CutoffKey) -> Result<Option<u64>>;
    /// A ring that reached a final status keeps it unless it got forked.
    async fn upsert_ring_mined(&self, ring: &RingMinedRecord) -> Result<()>;

    /// Moves the `New` or `Partial` orders among `orders` to the provisional
    /// `marker` and remembers their status for the transaction. Returns the
    /// changed orders.
    async fn mark_provisional(
        &self,
        tx_hash: &B256,
        orders: &[OrderHash],
        marker: OrderStatus,
    ) -> Result<Vec<Order>>;
    /// Restores the remembered status of every order the transaction marked
    /// that still carries a provisional marker. Returns the changed orders.
    async fn revert_provisional(&self, tx_hash: &B256) -> Result<Vec<Order>>;

    /// Flags every live audit row of a block in `(after, up_to]` as forked.
    async fn mark_forked(&self, after: u64, up_to: u64) -> Result<ForkedRecords>;
}

#[derive(Debug, thiserror::Error)]
pub enum InsertionError {
    #[error("order already exists")]
    DuplicatedRecord,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for InsertionError {
    fn from(err: sqlx::Error) -> Self {
        Self::Other(err.into())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

/// Selection of orders. Unset fields do not filter.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OrderFilter {
    pub hash: Option<OrderHash>,
    pub protocol: Option<Address>,
    pub owner: Option<Address>,
    /// Orders trading the pair in either direction.
    pub pair: Option<TokenPair>,
    pub created_at_or_before: Option<u64>,
    /// Empty matches any status.
    pub statuses: Vec<OrderStatus>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        self.hash.is_none_or(|hash| order.metadata.hash == hash)
            && self.protocol.is_none_or(|protocol| order.data.protocol == protocol)
            && self.owner.is_none_or(|owner| order.data.owner == owner)
            && self.pair.is_none_or(|pair| order.data.token_pair() == Some(pair))
            && self
                .created_at_or_before
                .is_none_or(|time| order.metadata.created_at <= time)
            && (self.statuses.is_empty() || self.statuses.contains(&order.metadata.status))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CutoffRecord {
    pub tx: TxInfo,
    pub key: CutoffKey,
    pub cutoff: u64,
    /// Orders moved to `Cutoff` by this event.
    pub affected_orders: Vec<OrderHash>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RingMinedRecord {
    pub tx_hash: B256,
    pub block_number: u64,
    pub ring_hash: B256,
    pub ring_index: u64,
    pub miner: Address,
    pub fee_recipient: Address,
    pub status: TxStatus,
}

/// Audit rows that got flagged as forked, newest first.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ForkedRecords {
    pub fills: Vec<ForkedFill>,
    pub cancels: Vec<ForkedCancel>,
    pub cutoffs: Vec<ForkedCutoff>,
    pub ring_mined: usize,
}

impl ForkedRecords {
    pub fn is_empty(&self) -> bool {
        self.fills.is_empty()
            && self.cancels.is_empty()
            && self.cutoffs.is_empty()
            && self.ring_mined == 0
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ForkedFill {
    pub order_hash: OrderHash,
    pub amounts: FillAmounts,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ForkedCancel {
    pub order_hash: OrderHash,
    pub amount: U256,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ForkedCutoff {
    pub key: CutoffKey,
    pub affected_orders: Vec<OrderHash>,
}

#[async_trait::async_trait]
impl OrderStoring for Postgres {
    async fn insert_order(&self, order: &Order) -> Result<(), InsertionError> {
        let _timer = super::Metrics::get()
            .database_queries
            .with_label_values(&["insert_order"])
            .start_timer();

        let row = order_into_row(order)?;
        let mut ex = self.pool.acquire().await?;
        database::orders::insert_order(&mut ex, &row)
            .await
            .map_err(|err| {
                if database::is_duplicate_record_error(&err) {
                    InsertionError::DuplicatedRecord
                } else {
                    InsertionError::from(err)
                }
            })
    }

    async fn order(&self, hash: &OrderHash) -> Result<Option<Order>> {
        let _timer = super::Metrics::get()
            .database_queries
            .with_label_values(&["order"])
            .start_timer();

        let mut ex = self.pool.acquire().await?;
        database::orders::single_order(&mut ex, &ByteArray(hash.0))
            .await?
            .map(order_from_row)
            .transpose()
    }

    async fn orders_by_owner(
        &self,
        owner: &Address,
        statuses: &[OrderStatus],
        page: Page,
    ) -> Result<Vec<Order>> {
        let _timer = super::Metrics::get()
            .database_queries
            .with_label_values(&["orders_by_owner"])
            .start_timer();

        let statuses = statuses.iter().copied().map(status_into).collect::<Vec<_>>();
        let mut ex = self.pool.acquire().await?;
        database::orders::user_orders(
            &mut ex,
            &ByteArray(owner.0.0),
            &statuses,
            i64::try_from(page.offset).context("offset")?,
            i64::try_from(page.limit).context("limit")?,
        )
        .await?
        .into_iter()
        .map(order_from_row)
        .collect()
    }

    async fn find_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>> {
        let _timer = super::Metrics::get()
            .database_queries
            .with_label_values(&["find_orders"])
            .start_timer();

        let filter = database::orders::OrderFilter {
            order_hash: filter.hash.map(|hash| ByteArray(hash.0)),
            protocol: filter.protocol.map(|protocol| ByteArray(protocol.0.0)),
            owner: filter.owner.map(|owner| ByteArray(owner.0.0)),
            token_pair: filter.pair.map(|pair| {
                let (token1, token2) = pair.get();
                (ByteArray(token1.0.0), ByteArray(token2.0.0))
            }),
            created_at_or_before: filter
                .created_at_or_before
                .map(|time| i64::try_from(time).unwrap_or(i64::MAX)),
            statuses: filter.statuses.iter().copied().map(status_into).collect(),
        };
        let mut ex = self.pool.acquire().await?;
        database::orders::find_orders(&mut ex, &filter)
            .await?
            .into_iter()
            .map(order_from_row)
            .collect()
    }

    async fn update_orders(&self, orders: &[Order]) -> Result<()> {
        let _timer = super::Metrics::get()
            .database_queries
            .with_label_values(&["update_orders"])
            .start_timer();

        let mut ex = self.pool.begin().await?;
        update_settlements(&mut ex, orders).await?;
        ex.commit().await?;
        Ok(())
    }

    async fn fill_exists(&self, tx_hash: &B256, fill_index: u64) -> Result<bool> {
        let mut ex = self.pool.acquire().await?;
        Ok(database::fills::exists(
            &mut ex,
            &ByteArray(tx_hash.0),
            i64::try_from(fill_index).context("fill index")?,
        )
        .await?)
    }

    async fn save_fill(&self, fill: &OrderFilled, order: &Order) -> Result<bool> {
        let _timer = super::Metrics::get()
            .database_queries
            .with_label_values(&["save_fill"])
            .start_timer();

        let row = database::fills::Fill {
            tx_hash: ByteArray(fill.tx.tx_hash.0),
            fill_index: i64::try_from(fill.fill_index).context("fill index")?,
            log_index: i64::try_from(fill.tx.log_index).context("log index")?,
            block_number: i64::try_from(fill.tx.block_number).context("block number")?,
            ring_hash: ByteArray(fill.ring_hash.0),
            ring_index: i64::try_from(fill.ring_index).context("ring index")?,
            order_hash: ByteArray(fill.order_hash.0),
            owner: ByteArray(fill.owner.0.0),
            token_s: ByteArray(fill.token_s.0.0),
            token_b: ByteArray(fill.token_b.0.0),
            amount_s: u256_to_big_decimal(&fill.amount_s),
            amount_b: u256_to_big_decimal(&fill.amount_b),
            split_s: u256_to_big_decimal(&fill.split_s),
            split_b: u256_to_big_decimal(&fill.split_b),
            market: fill.market.clone(),
            forked: false,
        };
        let mut ex = self.pool.begin().await?;
        if !database::fills::insert(&mut ex, &row).await? {
            return Ok(false);
        }
        update_settlements(&mut ex, std::slice::from_ref(order)).await?;
        ex.commit().await?;
        Ok(true)
    }

    async fn cancel_exists(&self, tx_hash: &B256) -> Result<bool> {
        let mut ex = self.pool.acquire().await?;
        Ok(database::cancels::exists(&mut ex, &ByteArray(tx_hash.0)).await?)
    }

    async fn save_cancel(&self, cancel: &OrderCancelled, order: &Order) -> Result<bool> {
        let _timer = super::Metrics::get()
            .database_queries
            .with_label_values(&["save_cancel"])
            .start_timer();

        let row = database::cancels::Cancel {
            tx_hash: ByteArray(cancel.tx.tx_hash.0),
            log_index: i64::try_from(cancel.tx.log_index).context("log index")?,
            block_number: i64::try_from(cancel.tx.block_number).context("block number")?,
            order_hash: ByteArray(cancel.order_hash.0),
            amount_cancelled: u256_to_big_decimal(&cancel.amount_cancelled),
            forked: false,
        };
        let mut ex = self.pool.begin().await?;
        if !database::cancels::insert(&mut ex, &row).await? {
            return Ok(false);
        }
        update_settlements(&mut ex, std::slice::from_ref(order)).await?;
        ex.commit().await?;
        Ok(true)
    }

    async fn cutoff_exists(&self, tx_hash: &B256) -> Result<bool> {
        let mut ex = self.pool.acquire().await?;
        Ok(database::cutoffs::exists(&mut ex, &ByteArray(tx_hash.0)).await?)
    }

    async fn save_cutoff(&self, cutoff: &CutoffRecord, orders: &[Order]) -> Result<bool> {
        let _timer = super::Metrics::get()
            .database_queries
            .with_label_values(&["save_cutoff"])
            .start_timer();

        let tx_hash = ByteArray(cutoff.tx.tx_hash.0);
        let log_index = i64::try_from(cutoff.tx.log_index).context("log index")?;
        let block_number = i64::try_from(cutoff.tx.block_number).context("block number")?;
        let protocol = ByteArray(cutoff.key.protocol.0.0);
        let owner = ByteArray(cutoff.key.owner.0.0);
        let timestamp = i64::try_from(cutoff.cutoff).context("cutoff")?;
        let affected_orders = cutoff
            .affected_orders
            .iter()
            .map(|hash| ByteArray(hash.0))
            .collect();

        let mut ex = self.pool.begin().await?;
        let inserted = match cutoff.key.pair {
            None => {
                database::cutoffs::insert(&mut ex, &database::cutoffs::Cutoff {
                    tx_hash,
                    log_index,
                    block_number,
                    protocol,
                    owner,
                    cutoff: timestamp,
                    affected_orders,
                    forked: false,
                })
                .await?
            }
            Some(pair) => {
                let (token1, token2) = pair.get();
                database::cutoffs::insert_pair(&mut ex, &database::cutoffs::CutoffPair {
                    tx_hash,
                    log_index,
                    block_number,
                    protocol,
                    owner,
                    token1: ByteArray(token1.0.0),
                    token2: ByteArray(token2.0.0),
                    cutoff: timestamp,
                    affected_orders,
                    forked: false,
                })
                .await?
            }
        };
        if !inserted {
            return Ok(false);
        }
        update_settlements(&mut ex, orders).await?;
        ex.commit().await?;
        Ok(true)
    }

    async fn latest_cutoff(&self, key: &CutoffKey) -> Result<Option<u64>> {
        let _timer = super::Metrics::get()
            .database_queries
            .with_label_values(&["latest_cutoff"])
            .start_timer();

        let protocol = ByteArray(key.protocol.0.0);
        let owner = ByteArray(key.owner.0.0);
        let mut ex = self.pool.acquire().await?;
        let latest = match key.pair {
            None => database::cutoffs::latest(&mut ex, &protocol, &owner).await?,
            Some(pair) => {
                let (token1, token2) = pair.get();
                database::cutoffs::latest_pair(
                    &mut ex,
                    &protocol,
                    &owner,
                    &ByteArray(token1.0.0),
                    &ByteArray(token2.0.0),
                )
                .await?
            }
        };
        latest
            .map(|cutoff| u64::try_from(cutoff).context("negative cutoff"))
            .transpose()
    }

    async fn upsert_ring_mined(&self, ring: &RingMinedRecord) -> Result<()> {
        let _timer = super::Metrics::get()
            .database_queries
            .with_label_values(&["upsert_ring_mined"])
            .start_timer();

        let row = database::ring_mined::RingMined {
            tx_hash: ByteArray(ring.tx_hash.0),
            block_number: i64::try_from(ring.block_number).context("block number")?,
            ring_hash: ByteArray(ring.ring_hash.0),
            ring_index: i64::try_from(ring.ring_index).context("ring index")?,
            miner: ByteArray(ring.miner.0.0),
            fee_recipient: ByteArray(ring.fee_recipient.0.0),
            status: tx_status_into(ring.status),
            forked: false,
        };
        let mut ex = self.pool.acquire().await?;
        Ok(database::ring_mined::upsert(&mut ex, &row).await?)
    }

    async fn mark_provisional(
        &self,
        tx_hash: &B256,
        orders: &[OrderHash],
        marker: OrderStatus,
    ) -> Result<Vec<Order>> {
        let _timer = super::Metrics::get()
            .database_queries
            .with_label_values(&["mark_provisional"])
            .start_timer();

        let tx_hash = ByteArray(tx_hash.0);
        let mut ex = self.pool.begin().await?;
        let mut changed = Vec::new();
        for hash in orders {
            let hash = ByteArray(hash.0);
            let Some(mut row) = database::orders::single_order_for_update(&mut ex, &hash).await?
            else {
                continue;
            };
            if !OrderStatus::FLEX_CANCELLABLE.contains(&status_from(row.status)) {
                continue;
            }
            let pending = database::pending_transactions::PendingTransaction {
                tx_hash,
                order_hash: hash,
                prior_status: row.status,
            };
            if !database::pending_transactions::insert(&mut ex, &pending).await? {
                continue;
            }
            row.status = status_into(marker);
            database::orders::update_settlement(&mut ex, &row).await?;
            changed.push(order_from_row(row)?);
        }
        ex.commit().await?;
        Ok(changed)
    }

    async fn revert_provisional(&self, tx_hash: &B256) -> Result<Vec<Order>> {
        let _timer = super::Metrics::get()
            .database_queries
            .with_label_values(&["revert_provisional"])
            .start_timer();

        let mut ex = self.pool.begin().await?;
        let pending = database::pending_transactions::take(&mut ex, &ByteArray(tx_hash.0)).await?;
        let mut changed = Vec::new();
        for pending in pending {
            let Some(mut row) =
                database::orders::single_order_for_update(&mut ex, &pending.order_hash).await?
            else {
                continue;
            };
            if !status_from(row.status).is_provisional() {
                continue;
            }
            row.status = pending.prior_status;
            database::orders::update_settlement(&mut ex, &row).await?;
            changed.push(order_from_row(row)?);
        }
        ex.commit().await?;
        Ok(changed)
    }

    async fn mark_forked(&self, after: u64, up_to: u64) -> Result<ForkedRecords> {
        let _timer = super::Metrics::get()
            .database_queries
            .with_label_values(&["mark_forked"])
            .start_timer();

        let after = i64::try_from(after).context("fork block")?;
        let up_to = i64::try_from(up_to).context("detected block")?;
        let mut ex = self.pool.begin().await?;
        let fills = database::fills::mark_forked(&mut ex, after, up_to).await?;
        let cancels = database::cancels::mark_forked(&mut ex, after, up_to).await?;
        let cutoffs = database::cutoffs::mark_forked(&mut ex, after, up_to).await?;
        let pairs = database::cutoffs::mark_pairs_forked(&mut ex, after, up_to).await?;
        let rings = database::ring_mined::mark_forked(&mut ex, after, up_to).await?;
        ex.commit().await?;

        let fills = fills
            .into_iter()
            .map(|fill| {
                Ok(ForkedFill {
                    order_hash: B256::new(fill.order_hash.0),
                    amounts: FillAmounts {
                        amount_s: decimal_into_u256(&fill.amount_s)?,
                        amount_b: decimal_into_u256(&fill.amount_b)?,
                        split_s: decimal_into_u256(&fill.split_s)?,
                        split_b: decimal_into_u256(&fill.split_b)?,
                    },
                })
            })
            .collect::<Result<_>>()?;
        let cancels = cancels
            .into_iter()
            .map(|cancel| {
                Ok(ForkedCancel {
                    order_hash: B256::new(cancel.order_hash.0),
                    amount: decimal_into_u256(&cancel.amount_cancelled)?,
                })
            })
            .collect::<Result<_>>()?;
        let cutoffs = cutoffs
            .into_iter()
            .map(|cutoff| ForkedCutoff {
                key: CutoffKey::all(Address::new(cutoff.protocol.0), Address::new(cutoff.owner.0)),
                affected_orders: hashes_from_rows(&cutoff.affected_orders),
            })
            .chain(pairs.into_iter().filter_map(|cutoff| {
                let pair =
                    TokenPair::new(Address::new(cutoff.token1.0), Address::new(cutoff.token2.0))?;
                Some(ForkedCutoff {
                    key: CutoffKey::pair(
                        Address::new(cutoff.protocol.0),
                        Address::new(cutoff.owner.0),
                        pair,
                    ),
                    affected_orders: hashes_from_rows(&cutoff.affected_orders),
                })
            }))
            .collect();
        Ok(ForkedRecords {
            fills,
            cancels,
            cutoffs,
            ring_mined: rings.len(),
        })
    }
}

async fn update_settlements(ex: &mut PgConnection, orders: &[Order]) -> Result<()> {
    for order in orders {
        database::orders::update_settlement(ex, &order_into_row(order)?).await?;
    }
    Ok(())
}

fn hashes_from_rows(hashes: &[database::OrderHash]) -> Vec<OrderHash> {
    hashes.iter().map(|hash| B256::new(hash.0)).collect()
}

fn decimal_into_u256(value: &bigdecimal::BigDecimal) -> Result<U256> {
    big_decimal_to_u256(value).with_context(|| format!("{value} is not a valid U256"))
}

fn order_into_row(order: &Order) -> Result<database::orders::Order> {
    let (data, metadata) = (&order.data, &order.metadata);
    Ok(database::orders::Order {
        order_hash: ByteArray(metadata.hash.0),
        protocol: ByteArray(data.protocol.0.0),
        delegate: ByteArray(data.delegate.0.0),
        owner: ByteArray(data.owner.0.0),
        token_s: ByteArray(data.token_s.0.0),
        token_b: ByteArray(data.token_b.0.0),
        amount_s: u256_to_big_decimal(&data.amount_s),
        amount_b: u256_to_big_decimal(&data.amount_b),
        valid_since: i64::try_from(data.valid_since).context("valid since")?,
        valid_until: i64::try_from(data.valid_until).context("valid until")?,
        buy_no_more_than_amount_b: data.buy_no_more_than_amount_b,
        market: data.market.clone(),
        side: data.side.as_ref().to_owned(),
        created_at: i64::try_from(metadata.created_at).context("created at")?,
        dealt_amount_s: u256_to_big_decimal(&metadata.dealt_amount_s),
        dealt_amount_b: u256_to_big_decimal(&metadata.dealt_amount_b),
        split_amount_s: u256_to_big_decimal(&metadata.split_amount_s),
        split_amount_b: u256_to_big_decimal(&metadata.split_amount_b),
        cancelled_amount_s: u256_to_big_decimal(&metadata.cancelled_amount_s),
        cancelled_amount_b: u256_to_big_decimal(&metadata.cancelled_amount_b),
        updated_block: i64::try_from(metadata.updated_block).context("updated block")?,
        status: status_into(metadata.status),
    })
}

fn order_from_row(row: database::orders::Order) -> Result<Order> {
    Ok(Order {
        metadata: OrderMetadata {
            hash: B256::new(row.order_hash.0),
            created_at: u64::try_from(row.created_at).context("created at")?,
            dealt_amount_s: decimal_into_u256(&row.dealt_amount_s)?,
            dealt_amount_b: decimal_into_u256(&row.dealt_amount_b)?,
            split_amount_s: decimal_into_u256(&row.split_amount_s)?,
            split_amount_b: decimal_into_u256(&row.split_amount_b)?,
            cancelled_amount_s: decimal_into_u256(&row.cancelled_amount_s)?,
            cancelled_amount_b: decimal_into_u256(&row.cancelled_amount_b)?,
            updated_block: u64::try_from(row.updated_block).context("updated block")?,
            status: status_from(row.status),
        },
        data: OrderData {
            protocol: Address::new(row.protocol.0),
            delegate: Address::new(row.delegate.0),
            owner: Address::new(row.owner.0),
            token_s: Address::new(row.token_s.0),
            token_b: Address::new(row.token_b.0),
            amount_s: decimal_into_u256(&row.amount_s)?,
            amount_b: decimal_into_u256(&row.amount_b)?,
            valid_since: u64::try_from(row.valid_since).context("valid since")?,
            valid_until: u64::try_from(row.valid_until).context("valid until")?,
            buy_no_more_than_amount_b: row.buy_no_more_than_amount_b,
            market: row.market,
            side: row
                .side
                .parse()
                .with_context(|| format!("unknown side {}", row.side))?,
        },
    })
}

fn status_into(status: OrderStatus) -> database::OrderStatus {
    match status {
        OrderStatus::Unknown => database::OrderStatus::Unknown,
        OrderStatus::New => database::OrderStatus::New,
        OrderStatus::Partial => database::OrderStatus::Partial,
        OrderStatus::Finished => database::OrderStatus::Finished,
        OrderStatus::Cancel => database::OrderStatus::Cancel,
        OrderStatus::Cutoff => database::OrderStatus::Cutoff,
        OrderStatus::FlexCancel => database::OrderStatus::FlexCancel,
        OrderStatus::Pending => database::OrderStatus::Pending,
        OrderStatus::Cancelling => database::OrderStatus::Cancelling,
        OrderStatus::Cutoffing => database::OrderStatus::Cutoffing,
    }
}

fn status_from(status: database::OrderStatus) -> OrderStatus {
    match status {
        database::OrderStatus::Unknown => OrderStatus::Unknown,
        database::OrderStatus::New => OrderStatus::New,
        database::OrderStatus::Partial => OrderStatus::Partial,
        database::OrderStatus::Finished => OrderStatus::Finished,
        database::OrderStatus::Cancel => OrderStatus::Cancel,
        database::OrderStatus::Cutoff => OrderStatus::Cutoff,
        database::OrderStatus::FlexCancel => OrderStatus::FlexCancel,
        database::OrderStatus::Pending => OrderStatus::Pending,
        database::OrderStatus::Cancelling => OrderStatus::Cancelling,
        database::OrderStatus::Cutoffing => OrderStatus::Cutoffing,
    }
}

fn tx_status_into(status: TxStatus) -> database::TxStatus {
    match status {
        TxStatus::Pending => database::TxStatus::Pending,
        TxStatus::Success => database::TxStatus::Success,
        TxStatus::Failed => database::TxStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use {super::*, model::order::Side};

    fn order() -> Order {
        let mut order = Order::new(
            OrderData {
                protocol: Address::repeat_byte(9),
                owner: Address::repeat_byte(1),
                token_s: Address::repeat_byte(2),
                token_b: Address::repeat_byte(3),
                amount_s: U256::from(10).pow(U256::from(18)),
                amount_b: U256::from(3000) * U256::from(10).pow(U256::from(18)),
                valid_since: 1_600_000_000,
                market: "LRC-WETH".to_string(),
                side: Side::Sell,
                ..Default::default()
            },
            1_600_000_100,
        );
        order.metadata.dealt_amount_s = U256::from(7);
        order.metadata.status = OrderStatus::Partial;
        order
    }

    #[test]
    fn order_row_conversion() {
        let order = order();
        let row = order_into_row(&order).unwrap();
        assert_eq!(row.side, "sell");
        assert_eq!(row.status, database::OrderStatus::Partial);
        assert_eq!(row.created_at, 1_600_000_100);
        assert_eq!(order_from_row(row).unwrap(), order);
    }

    #[test]
    fn out_of_range_timestamps_are_rejected() {
        let mut order = order();
        order.data.valid_until = u64::MAX;
        assert!(order_into_row(&order).is_err());
    }

    #[test]
    fn filter_matches() {
        let order = order();
        assert!(OrderFilter::default().matches(&order));
        let pair = TokenPair::new(Address::repeat_byte(3), Address::repeat_byte(2)).unwrap();
        assert!(
            OrderFilter {
                owner: Some(Address::repeat_byte(1)),
                pair: Some(pair),
                created_at_or_before: Some(1_600_000_100),
                statuses: OrderStatus::CUTOFF_ELIGIBLE.to_vec(),
                ..Default::default()
            }
            .matches(&order)
        );
        assert!(
            !OrderFilter {
                created_at_or_before: Some(1_600_000_099),
                ..Default::default()
            }
            .matches(&order)
        );
        assert!(
            !OrderFilter {
                statuses: vec![OrderStatus::New],
                ..Default::default()
            }
            .matches(&order)
        );
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_fill_roundtrip() {
        let db = Postgres::new("postgresql://").unwrap();
        database::clear_DANGER(&db.pool).await.unwrap();

        let mut order = order();
        order.metadata.dealt_amount_s = U256::ZERO;
        order.metadata.status = OrderStatus::New;
        db.insert_order(&order).await.unwrap();
        assert!(matches!(
            db.insert_order(&order).await,
            Err(InsertionError::DuplicatedRecord)
        ));

        let fill = OrderFilled {
            tx: TxInfo {
                tx_hash: B256::repeat_byte(5),
                block_number: 10,
                ..Default::default()
            },
            order_hash: order.metadata.hash,
            amount_s: U256::from(4),
            ..Default::default()
        };
        order.add_fill(&fill.amounts());
        order.metadata.status = OrderStatus::Partial;
        assert!(db.save_fill(&fill, &order).await.unwrap());
        assert!(!db.save_fill(&fill, &order).await.unwrap());
        assert!(db.fill_exists(&fill.tx.tx_hash, 0).await.unwrap());
        assert_eq!(db.order(&order.metadata.hash).await.unwrap(), Some(order.clone()));

        let forked = db.mark_forked(9, 10).await.unwrap();
        assert_eq!(forked.fills, vec![ForkedFill {
            order_hash: order.metadata.hash,
            amounts: fill.amounts(),
        }]);
        assert!(!db.fill_exists(&fill.tx.tx_hash, 0).await.unwrap());
        database::clear_DANGER(&db.pool).await.unwrap();
    }
}
