use {
    super::orders::{
        CutoffRecord,
        ForkedCancel,
        ForkedCutoff,
        ForkedFill,
        ForkedRecords,
        InsertionError,
        OrderFilter,
        OrderStoring,
        Page,
        RingMinedRecord,
    },
    crate::cutoff_cache::CutoffKey,
    alloy::primitives::{Address, B256},
    anyhow::Result,
    model::{
        event::{OrderCancelled, OrderFilled, TxStatus},
        order::{Order, OrderHash, OrderStatus},
    },
    std::{cmp::Reverse, collections::HashMap, sync::Mutex},
};

/// [`OrderStoring`] keeping everything in process memory. Used when no
/// database is configured.
#[derive(Default)]
pub struct InMemoryOrderStore(Mutex<State>);

#[derive(Default)]
struct State {
    orders: HashMap<OrderHash, Order>,
    fills: HashMap<(B256, u64), Row<OrderFilled>>,
    cancels: HashMap<B256, Row<OrderCancelled>>,
    cutoffs: HashMap<B256, Row<CutoffRecord>>,
    rings: HashMap<B256, Row<RingMinedRecord>>,
    /// Prior status of orders marked provisional, per transaction.
    pending: HashMap<B256, Vec<(OrderHash, OrderStatus)>>,
}

struct Row<T> {
    record: T,
    forked: bool,
}

impl<T> Row<T> {
    fn live(record: T) -> Self {
        Self {
            record,
            forked: false,
        }
    }
}

/// Writes the record unless a live one with the same key exists.
fn insert_audit_row<K, T>(rows: &mut HashMap<K, Row<T>>, key: K, record: T) -> bool
where
    K: std::hash::Hash + Eq,
{
    match rows.get(&key) {
        Some(row) if !row.forked => false,
        _ => {
            rows.insert(key, Row::live(record));
            true
        }
    }
}

/// Flags the live rows of blocks in `(after, up_to]` and returns them.
fn fork_rows<'a, T: Clone + 'a>(
    rows: impl Iterator<Item = &'a mut Row<T>>,
    after: u64,
    up_to: u64,
    position: impl Fn(&T) -> (u64, u64),
) -> Vec<T> {
    let mut forked = Vec::new();
    for row in rows {
        let (block, _) = position(&row.record);
        if !row.forked && block > after && block <= up_to {
            row.forked = true;
            forked.push(row.record.clone());
        }
    }
    forked.sort_by_key(|record| Reverse(position(record)));
    forked
}

impl State {
    fn update(&mut self, orders: &[Order]) {
        for order in orders {
            self.orders.insert(order.metadata.hash, order.clone());
        }
    }
}

#[async_trait::async_trait]
impl OrderStoring for InMemoryOrderStore {
    async fn insert_order(&self, order: &Order) -> Result<(), InsertionError> {
        let mut state = self.0.lock().unwrap();
        if state.orders.contains_key(&order.metadata.hash) {
            return Err(InsertionError::DuplicatedRecord);
        }
        state.orders.insert(order.metadata.hash, order.clone());
        Ok(())
    }

    async fn order(&self, hash: &OrderHash) -> Result<Option<Order>> {
        Ok(self.0.lock().unwrap().orders.get(hash).cloned())
    }

    async fn orders_by_owner(
        &self,
        owner: &Address,
        statuses: &[OrderStatus],
        page: Page,
    ) -> Result<Vec<Order>> {
        let filter = OrderFilter {
            owner: Some(*owner),
            statuses: statuses.to_vec(),
            ..Default::default()
        };
        let mut orders = self.find_orders(&filter).await?;
        orders.sort_by_key(|order| (Reverse(order.metadata.created_at), order.metadata.hash));
        Ok(orders
            .into_iter()
            .skip(usize::try_from(page.offset).unwrap_or(usize::MAX))
            .take(usize::try_from(page.limit).unwrap_or(usize::MAX))
            .collect())
    }

    async fn find_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>> {
        let state = self.0.lock().unwrap();
        let mut orders = state
            .orders
            .values()
            .filter(|order| filter.matches(order))
            .cloned()
            .collect::<Vec<_>>();
        orders.sort_by_key(|order| (order.metadata.created_at, order.metadata.hash));
        Ok(orders)
    }

    async fn update_orders(&self, orders: &[Order]) -> Result<()> {
        self.0.lock().unwrap().update(orders);
        Ok(())
    }

    async fn fill_exists(&self, tx_hash: &B256, fill_index: u64) -> Result<bool> {
        let state = self.0.lock().unwrap();
        Ok(state
            .fills
            .get(&(*tx_hash, fill_index))
            .is_some_and(|row| !row.forked))
    }

    async fn save_fill(&self, fill: &OrderFilled, order: &Order) -> Result<bool> {
        let mut state = self.0.lock().unwrap();
        let key = (fill.tx.tx_hash, fill.fill_index);
        if !insert_audit_row(&mut state.fills, key, fill.clone()) {
            return Ok(false);
        }
        state.update(std::slice::from_ref(order));
        Ok(true)
    }

    async fn cancel_exists(&self, tx_hash: &B256) -> Result<bool> {
        let state = self.0.lock().unwrap();
        Ok(state.cancels.get(tx_hash).is_some_and(|row| !row.forked))
    }

    async fn save_cancel(&self, cancel: &OrderCancelled, order: &Order) -> Result<bool> {
        let mut state = self.0.lock().unwrap();
        if !insert_audit_row(&mut state.cancels, cancel.tx.tx_hash, cancel.clone()) {
            return Ok(false);
        }
        state.update(std::slice::from_ref(order));
        Ok(true)
    }

    async fn cutoff_exists(&self, tx_hash: &B256) -> Result<bool> {
        let state = self.0.lock().unwrap();
        Ok(state.cutoffs.get(tx_hash).is_some_and(|row| !row.forked))
    }

    async fn save_cutoff(&self, cutoff: &CutoffRecord, orders: &[Order]) -> Result<bool> {
        let mut state = self.0.lock().unwrap();
        if !insert_audit_row(&mut state.cutoffs, cutoff.tx.tx_hash, cutoff.clone()) {
            return Ok(false);
        }
        state.update(orders);
        Ok(true)
    }

    async fn latest_cutoff(&self, key: &CutoffKey) -> Result<Option<u64>> {
        let state = self.0.lock().unwrap();
        Ok(state
            .cutoffs
            .values()
            .filter(|row| !row.forked && row.record.key == *key)
            .map(|row| row.record.cutoff)
            .max())
    }

    async fn upsert_ring_mined(&self, ring: &RingMinedRecord) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        match state.rings.get_mut(&ring.tx_hash) {
            Some(row) if row.forked || row.record.status == TxStatus::Pending => {
                row.record.block_number = ring.block_number;
                row.record.status = ring.status;
                row.forked = false;
            }
            Some(_) => (),
            None => {
                state.rings.insert(ring.tx_hash, Row::live(ring.clone()));
            }
        }
        Ok(())
    }

    async fn mark_provisional(
        &self,
        tx_hash: &B256,
        orders: &[OrderHash],
        marker: OrderStatus,
    ) -> Result<Vec<Order>> {
        let mut state = self.0.lock().unwrap();
        let state = &mut *state;
        let pending = state.pending.entry(*tx_hash).or_default();
        let mut changed = Vec::new();
        for hash in orders {
            let Some(order) = state.orders.get_mut(hash) else {
                continue;
            };
            if !OrderStatus::FLEX_CANCELLABLE.contains(&order.metadata.status)
                || pending.iter().any(|(marked, _)| marked == hash)
            {
                continue;
            }
            pending.push((*hash, order.metadata.status));
            order.metadata.status = marker;
            changed.push(order.clone());
        }
        Ok(changed)
    }

    async fn revert_provisional(&self, tx_hash: &B256) -> Result<Vec<Order>> {
        let mut state = self.0.lock().unwrap();
        let pending = state.pending.remove(tx_hash).unwrap_or_default();
        let mut changed = Vec::new();
        for (hash, prior) in pending {
            let Some(order) = state.orders.get_mut(&hash) else {
                continue;
            };
            if order.metadata.status.is_provisional() {
                order.metadata.status = prior;
                changed.push(order.clone());
            }
        }
        Ok(changed)
    }

    async fn mark_forked(&self, after: u64, up_to: u64) -> Result<ForkedRecords> {
        let mut state = self.0.lock().unwrap();
        let fills = fork_rows(state.fills.values_mut(), after, up_to, |fill| {
            (fill.tx.block_number, fill.tx.log_index)
        });
        let cancels = fork_rows(state.cancels.values_mut(), after, up_to, |cancel| {
            (cancel.tx.block_number, cancel.tx.log_index)
        });
        let cutoffs = fork_rows(state.cutoffs.values_mut(), after, up_to, |cutoff| {
            (cutoff.tx.block_number, cutoff.tx.log_index)
        });
        let rings = fork_rows(state.rings.values_mut(), after, up_to, |ring| {
            (ring.block_number, ring.ring_index)
        });
        Ok(ForkedRecords {
            fills: fills
                .into_iter()
                .map(|fill| ForkedFill {
                    order_hash: fill.order_hash,
                    amounts: fill.amounts(),
                })
                .collect(),
            cancels: cancels
                .into_iter()
                .map(|cancel| ForkedCancel {
                    order_hash: cancel.order_hash,
                    amount: cancel.amount_cancelled,
                })
                .collect(),
            cutoffs: cutoffs
                .into_iter()
                .map(|cutoff| ForkedCutoff {
                    key: cutoff.key,
                    affected_orders: cutoff.affected_orders,
                })
                .collect(),
            ring_mined: rings.len(),
        })
    }
}

#[cfg(test)]
impl InMemoryOrderStore {
    /// Number of live and forked fill rows.
    pub fn fill_rows(&self) -> (usize, usize) {
        let state = self.0.lock().unwrap();
        let forked = state.fills.values().filter(|row| row.forked).count();
        (state.fills.len() - forked, forked)
    }

    pub fn cancel_rows(&self) -> usize {
        self.0.lock().unwrap().cancels.len()
    }

    pub fn cutoff_rows(&self) -> Vec<(CutoffRecord, bool)> {
        let state = self.0.lock().unwrap();
        state
            .cutoffs
            .values()
            .map(|row| (row.record.clone(), row.forked))
            .collect()
    }

    pub fn ring(&self, tx_hash: &B256) -> Option<(RingMinedRecord, bool)> {
        let state = self.0.lock().unwrap();
        state
            .rings
            .get(tx_hash)
            .map(|row| (row.record.clone(), row.forked))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        alloy::primitives::U256,
        model::{event::TxInfo, order::OrderData},
    };

    fn order(owner: u8, created_at: u64) -> Order {
        Order::new(
            OrderData {
                owner: Address::repeat_byte(owner),
                amount_s: U256::from(created_at),
                ..Default::default()
            },
            created_at,
        )
    }

    fn fill(tx: u8, block_number: u64, order: &Order) -> OrderFilled {
        OrderFilled {
            tx: TxInfo {
                tx_hash: B256::repeat_byte(tx),
                block_number,
                ..Default::default()
            },
            order_hash: order.metadata.hash,
            amount_s: U256::from(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn duplicate_orders_are_rejected() {
        let store = InMemoryOrderStore::default();
        let order = order(1, 10);
        store.insert_order(&order).await.unwrap();
        assert!(matches!(
            store.insert_order(&order).await,
            Err(InsertionError::DuplicatedRecord)
        ));
    }

    #[tokio::test]
    async fn owner_orders_are_paged_newest_first() {
        let store = InMemoryOrderStore::default();
        for created_at in [10, 30, 20] {
            store.insert_order(&order(1, created_at)).await.unwrap();
        }
        store.insert_order(&order(2, 40)).await.unwrap();

        let page = store
            .orders_by_owner(&Address::repeat_byte(1), &[], Page {
                offset: 1,
                limit: 5,
            })
            .await
            .unwrap();
        assert_eq!(
            page.iter()
                .map(|order| order.metadata.created_at)
                .collect::<Vec<_>>(),
            vec![20, 10]
        );
    }

    #[tokio::test]
    async fn forked_fill_can_be_saved_again() {
        let store = InMemoryOrderStore::default();
        let order = order(1, 10);
        store.insert_order(&order).await.unwrap();
        let first = fill(1, 5, &order);
        let second = fill(2, 6, &order);

        assert!(store.save_fill(&first, &order).await.unwrap());
        assert!(!store.save_fill(&first, &order).await.unwrap());
        assert!(store.save_fill(&second, &order).await.unwrap());

        let forked = store.mark_forked(4, 6).await.unwrap();
        // Newest first.
        assert_eq!(forked.fills.len(), 2);
        assert_eq!(store.fill_rows(), (0, 2));
        assert!(!store.fill_exists(&first.tx.tx_hash, 0).await.unwrap());

        assert!(store.save_fill(&first, &order).await.unwrap());
        assert_eq!(store.fill_rows(), (1, 1));
        assert_eq!(store.mark_forked(4, 6).await.unwrap().fills.len(), 1);
    }

    #[tokio::test]
    async fn final_ring_status_is_kept() {
        let store = InMemoryOrderStore::default();
        let mut ring = RingMinedRecord {
            tx_hash: B256::repeat_byte(1),
            block_number: 0,
            status: TxStatus::Pending,
            ..Default::default()
        };
        store.upsert_ring_mined(&ring).await.unwrap();
        ring.status = TxStatus::Success;
        ring.block_number = 7;
        store.upsert_ring_mined(&ring).await.unwrap();
        ring.status = TxStatus::Failed;
        store.upsert_ring_mined(&ring).await.unwrap();

        let (stored, forked) = store.ring(&ring.tx_hash).unwrap();
        assert_eq!(stored.status, TxStatus::Success);
        assert_eq!(stored.block_number, 7);
        assert!(!forked);
    }
}
