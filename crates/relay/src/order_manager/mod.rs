//! Applies order related events to the persisted orders.
//!
//! Statuses are always derived through [`Transition`]s: amount changing
//! events recompute the status from the settled totals while cutoffs, flex
//! cancellations and provisional markers override it.

mod events;

use {
    crate::{
        cutoff_cache::{CutoffCache, CutoffKey},
        database::orders::{
            CutoffRecord,
            ForkedRecords,
            InsertionError,
            OrderFilter,
            OrderStoring,
            Page,
            RingMinedRecord,
        },
        dust::DustEvaluating,
        notifier::Notifying,
    },
    alloy::primitives::{Address, B256},
    anyhow::Result,
    model::{
        TokenPair,
        event::{CutoffAll, CutoffPair, NewOrder, OrderCancelled, OrderFilled, TxInfo},
        notification::Notification,
        order::{Order, OrderHash, OrderStatus, Transition},
    },
    std::{collections::HashMap, sync::Arc},
    tracing::instrument,
};

/// Off-chain cancellation requested through the gateway.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlexCancel {
    ByHash(OrderHash),
    ByOwner(Address),
    ByOwnerAndPair {
        owner: Address,
        token_s: Address,
        token_b: Address,
    },
    /// Every order of the owner created at or before the timestamp.
    ByCutoffTime { owner: Address, cutoff: u64 },
}

pub struct OrderManager {
    store: Arc<dyn OrderStoring>,
    cutoffs: Arc<CutoffCache>,
    dust: Arc<dyn DustEvaluating>,
    notifier: Arc<dyn Notifying>,
    /// Exchange contracts whose events get applied. Empty accepts all.
    protocols: Vec<Address>,
    /// Handlers of different event kinds run concurrently. Every
    /// read-modify-write of orders holds this lock.
    writes: tokio::sync::Mutex<()>,
}

impl OrderManager {
    pub fn new(
        store: Arc<dyn OrderStoring>,
        cutoffs: Arc<CutoffCache>,
        dust: Arc<dyn DustEvaluating>,
        notifier: Arc<dyn Notifying>,
        protocols: Vec<Address>,
    ) -> Self {
        Self {
            store,
            cutoffs,
            dust,
            notifier,
            protocols,
            writes: Default::default(),
        }
    }

    fn accepts(&self, protocol: &Address) -> bool {
        self.protocols.is_empty() || self.protocols.contains(protocol)
    }

    fn settle(&self, order: &mut Order, transition: Transition) -> OrderStatus {
        let dust = self.dust.is_dust(order);
        order.settle(transition, dust)
    }

    fn notify_orders(&self, orders: impl IntoIterator<Item = Order>) {
        for order in orders {
            self.notifier
                .notify(Notification::OrderUpdate(Box::new(order)));
        }
    }

    pub async fn order(&self, hash: &OrderHash) -> Result<Option<Order>> {
        self.store.order(hash).await
    }

    pub async fn orders_by_owner(
        &self,
        owner: &Address,
        statuses: &[OrderStatus],
        page: Page,
    ) -> Result<Vec<Order>> {
        self.store.orders_by_owner(owner, statuses, page).await
    }

    /// Stores a gateway submitted order. Returns `None` for a resubmission.
    #[instrument(skip_all, fields(order = %event.order.hash()))]
    pub async fn new_order(&self, event: &NewOrder) -> Result<Option<Order>> {
        let order = Order::new(event.order.clone(), event.created_at);
        match self.store.insert_order(&order).await {
            Ok(()) => {
                tracing::debug!("new order");
                self.notify_orders([order.clone()]);
                Ok(Some(order))
            }
            Err(InsertionError::DuplicatedRecord) => {
                Metrics::get().skipped("duplicate_order");
                tracing::debug!("order exists already");
                Ok(None)
            }
            Err(InsertionError::Other(err)) => Err(err),
        }
    }

    /// Adds a confirmed fill to its order. Returns the updated order or
    /// `None` if the fill was applied before or rejected.
    #[instrument(skip_all, fields(tx = %fill.tx.tx_hash, order = %fill.order_hash))]
    pub async fn fill(&self, fill: &OrderFilled) -> Result<Option<Order>> {
        let _guard = self.writes.lock().await;
        if self
            .store
            .fill_exists(&fill.tx.tx_hash, fill.fill_index)
            .await?
        {
            Metrics::get().skipped("duplicate_fill");
            tracing::debug!("fill applied already");
            return Ok(None);
        }
        let Some(mut order) = self.store.order(&fill.order_hash).await? else {
            Metrics::get().skipped("unknown_order");
            tracing::warn!("fill for unknown order");
            return Ok(None);
        };
        if order.metadata.status.rejects_fills() {
            Metrics::get().skipped("rejected_fill");
            tracing::warn!(status = ?order.metadata.status, "order does not accept fills");
            return Ok(None);
        }

        order.add_fill(&fill.amounts());
        if order.is_oversettled() {
            tracing::warn!(
                settled = %order.settled_amount(),
                original = %order.original_amount(),
                "order is oversettled"
            );
        }
        order.metadata.updated_block = fill.tx.block_number;
        let transition = sticky(&order, Transition::Recompute {
            cancellation: false,
        });
        let status = self.settle(&mut order, transition);
        if !self.store.save_fill(fill, &order).await? {
            return Ok(None);
        }
        tracing::debug!(?status, "applied fill");
        self.notify_orders([order.clone()]);
        self.notifier.notify(Notification::OrderFilled(fill.clone()));
        Ok(Some(order))
    }

    /// Adds a confirmed on-chain cancellation to its order.
    #[instrument(skip_all, fields(tx = %cancel.tx.tx_hash, order = %cancel.order_hash))]
    pub async fn cancel(&self, cancel: &OrderCancelled) -> Result<Option<Order>> {
        let _guard = self.writes.lock().await;
        if self.store.cancel_exists(&cancel.tx.tx_hash).await? {
            Metrics::get().skipped("duplicate_cancel");
            tracing::debug!("cancellation applied already");
            return Ok(None);
        }
        let Some(mut order) = self.store.order(&cancel.order_hash).await? else {
            Metrics::get().skipped("unknown_order");
            tracing::warn!("cancellation of unknown order");
            return Ok(None);
        };

        order.add_cancelled(cancel.amount_cancelled);
        order.metadata.updated_block = cancel.tx.block_number;
        let transition = sticky(&order, Transition::Recompute {
            cancellation: true,
        });
        let status = self.settle(&mut order, transition);
        if !self.store.save_cancel(cancel, &order).await? {
            return Ok(None);
        }
        tracing::debug!(?status, "applied cancellation");
        self.notify_orders([order.clone()]);
        Ok(Some(order))
    }

    /// Applies a confirmed cutoff of all markets of the owner.
    pub async fn cutoff_all(&self, event: &CutoffAll) -> Result<Option<Vec<Order>>> {
        let key = CutoffKey::all(event.tx.protocol, event.owner);
        let affected = self.cutoff(&event.tx, key, event.cutoff).await?;
        if affected.is_some() {
            self.notifier.notify(Notification::Cutoff(event.clone()));
        }
        Ok(affected)
    }

    /// Applies a confirmed cutoff of a single market of the owner.
    pub async fn cutoff_pair(&self, event: &CutoffPair) -> Result<Option<Vec<Order>>> {
        let Some(pair) = event.token_pair() else {
            tracing::warn!(tx = %event.tx.tx_hash, "cutoff for a pair of equal tokens");
            return Ok(None);
        };
        let key = CutoffKey::pair(event.tx.protocol, event.owner, pair);
        let affected = self.cutoff(&event.tx, key, event.cutoff).await?;
        if affected.is_some() {
            self.notifier.notify(Notification::CutoffPair(event.clone()));
        }
        Ok(affected)
    }

    /// Raises the watermark of `key` and moves every eligible order created
    /// at or before it to `Cutoff`. Returns `None` if the event was applied
    /// before or is not newer than the watermark.
    #[instrument(skip_all, fields(tx = %tx.tx_hash, owner = %key.owner, cutoff))]
    async fn cutoff(&self, tx: &TxInfo, key: CutoffKey, cutoff: u64) -> Result<Option<Vec<Order>>> {
        let _guard = self.writes.lock().await;
        if self.store.cutoff_exists(&tx.tx_hash).await? {
            Metrics::get().skipped("duplicate_cutoff");
            tracing::debug!("cutoff applied already");
            return Ok(None);
        }

        let watermark = self.watermark(&key).await?;
        if cutoff <= watermark {
            Metrics::get().skipped("stale_cutoff");
            tracing::debug!(watermark, "cutoff is not newer than the watermark");
            let record = CutoffRecord {
                tx: tx.clone(),
                key,
                cutoff,
                affected_orders: Vec::new(),
            };
            self.store.save_cutoff(&record, &[]).await?;
            return Ok(None);
        }

        let mut orders = self
            .store
            .find_orders(&OrderFilter {
                protocol: Some(key.protocol),
                owner: Some(key.owner),
                pair: key.pair,
                created_at_or_before: Some(cutoff),
                statuses: OrderStatus::CUTOFF_ELIGIBLE.to_vec(),
                ..Default::default()
            })
            .await?;
        for order in &mut orders {
            self.settle(order, Transition::Override(OrderStatus::Cutoff));
            order.metadata.updated_block = tx.block_number;
        }
        let record = CutoffRecord {
            tx: tx.clone(),
            key,
            cutoff,
            affected_orders: orders.iter().map(|order| order.metadata.hash).collect(),
        };
        if !self.store.save_cutoff(&record, &orders).await? {
            return Ok(None);
        }
        self.cutoffs.update(key, cutoff);
        tracing::debug!(affected = orders.len(), "applied cutoff");
        self.notify_orders(orders.clone());
        Ok(Some(orders))
    }

    /// The cached watermark, seeded from the store on a miss so restarts do
    /// not apply old cutoffs again.
    async fn watermark(&self, key: &CutoffKey) -> Result<u64> {
        if let Some(watermark) = self.cutoffs.cached(key) {
            return Ok(watermark);
        }
        let watermark = self.store.latest_cutoff(key).await?.unwrap_or_default();
        self.cutoffs.update(*key, watermark);
        Ok(watermark)
    }

    pub async fn ring_mined(&self, ring: &RingMinedRecord) -> Result<()> {
        let _guard = self.writes.lock().await;
        self.store.upsert_ring_mined(ring).await
    }

    /// Moves the `New` and `Partial` orders among `orders` to a provisional
    /// marker while the transaction is unconfirmed.
    #[instrument(skip_all, fields(tx = %tx_hash, ?marker))]
    pub async fn mark_pending(
        &self,
        tx_hash: &B256,
        orders: &[OrderHash],
        marker: OrderStatus,
    ) -> Result<Vec<Order>> {
        let _guard = self.writes.lock().await;
        let changed = self.store.mark_provisional(tx_hash, orders, marker).await?;
        tracing::debug!(changed = changed.len(), "marked orders provisional");
        self.notify_orders(changed.clone());
        Ok(changed)
    }

    /// Marks the orders an unconfirmed cutoff would invalidate as
    /// `Cutoffing`.
    pub async fn mark_pending_cutoff(
        &self,
        tx_hash: &B256,
        key: CutoffKey,
        cutoff: u64,
    ) -> Result<Vec<Order>> {
        let orders = self
            .store
            .find_orders(&OrderFilter {
                protocol: Some(key.protocol),
                owner: Some(key.owner),
                pair: key.pair,
                created_at_or_before: Some(cutoff),
                statuses: OrderStatus::FLEX_CANCELLABLE.to_vec(),
                ..Default::default()
            })
            .await?;
        let hashes = orders
            .iter()
            .map(|order| order.metadata.hash)
            .collect::<Vec<_>>();
        self.mark_pending(tx_hash, &hashes, OrderStatus::Cutoffing)
            .await
    }

    /// Restores the orders the transaction marked provisional.
    #[instrument(skip_all, fields(tx = %tx_hash))]
    pub async fn revert_pending(&self, tx_hash: &B256) -> Result<Vec<Order>> {
        let _guard = self.writes.lock().await;
        let changed = self.store.revert_provisional(tx_hash).await?;
        if !changed.is_empty() {
            tracing::debug!(changed = changed.len(), "reverted provisional orders");
        }
        self.notify_orders(changed.clone());
        Ok(changed)
    }

    /// Moves every matching `New` or `Partial` order to `FlexCancel`.
    /// Returns the hashes of the cancelled orders.
    #[instrument(skip_all, fields(?request))]
    pub async fn flex_cancel(&self, request: FlexCancel) -> Result<Vec<OrderHash>> {
        let mut filter = OrderFilter {
            statuses: OrderStatus::FLEX_CANCELLABLE.to_vec(),
            ..Default::default()
        };
        let mut direction = None;
        match request {
            FlexCancel::ByHash(hash) => filter.hash = Some(hash),
            FlexCancel::ByOwner(owner) => filter.owner = Some(owner),
            FlexCancel::ByOwnerAndPair {
                owner,
                token_s,
                token_b,
            } => {
                let Some(pair) = TokenPair::new(token_s, token_b) else {
                    return Ok(Vec::new());
                };
                filter.owner = Some(owner);
                filter.pair = Some(pair);
                direction = Some((token_s, token_b));
            }
            FlexCancel::ByCutoffTime { owner, cutoff } => {
                filter.owner = Some(owner);
                filter.created_at_or_before = Some(cutoff);
            }
        }

        let _guard = self.writes.lock().await;
        let mut orders = self.store.find_orders(&filter).await?;
        if let Some((token_s, token_b)) = direction {
            orders.retain(|order| order.data.token_s == token_s && order.data.token_b == token_b);
        }
        for order in &mut orders {
            self.settle(order, Transition::Override(OrderStatus::FlexCancel));
        }
        self.store.update_orders(&orders).await?;
        tracing::debug!(cancelled = orders.len(), "flex cancelled orders");
        let hashes = orders.iter().map(|order| order.metadata.hash).collect();
        self.notify_orders(orders);
        Ok(hashes)
    }

    /// Flags the audit rows of the blocks in `(fork_block, detected_block]`
    /// as forked and undoes their effects on orders. Handlers that are
    /// writing when this gets called finish before any row is flagged.
    /// Returns the flagged rows and the restored orders.
    #[instrument(skip_all, fields(fork_block, detected_block))]
    pub async fn fork(
        &self,
        fork_block: u64,
        detected_block: u64,
    ) -> Result<(ForkedRecords, Vec<Order>)> {
        let _guard = self.writes.lock().await;
        let forked = self.store.mark_forked(fork_block, detected_block).await?;
        if forked.is_empty() {
            return Ok((forked, Vec::new()));
        }
        let restored = self.rollback(&forked).await?;
        Ok((forked, restored))
    }

    /// Undoes the effects of audit rows that got forked away and returns the
    /// restored orders. Callers hold the write lock.
    async fn rollback(&self, forked: &ForkedRecords) -> Result<Vec<Order>> {
        let mut touched = HashMap::<OrderHash, Order>::new();
        let mut uncut = Vec::new();

        for fill in &forked.fills {
            if let Some(order) = self.load(&mut touched, &fill.order_hash).await? {
                order.remove_fill(&fill.amounts);
            }
        }
        for cancel in &forked.cancels {
            if let Some(order) = self.load(&mut touched, &cancel.order_hash).await? {
                order.remove_cancelled(cancel.amount);
            }
        }
        for cutoff in &forked.cutoffs {
            // The next cutoff event of the key reseeds it from the store.
            self.cutoffs.remove(&cutoff.key);
            for hash in &cutoff.affected_orders {
                if self.load(&mut touched, hash).await?.is_some() {
                    uncut.push(*hash);
                }
            }
        }

        let mut orders = touched.into_values().collect::<Vec<_>>();
        for order in &mut orders {
            let recompute = Transition::Recompute {
                cancellation: has_cancellation(order),
            };
            let transition = if uncut.contains(&order.metadata.hash)
                && order.metadata.status == OrderStatus::Cutoff
            {
                recompute
            } else {
                sticky(order, recompute)
            };
            self.settle(order, transition);
        }
        self.store.update_orders(&orders).await?;
        tracing::info!(
            fills = forked.fills.len(),
            cancels = forked.cancels.len(),
            cutoffs = forked.cutoffs.len(),
            orders = orders.len(),
            "rolled back forked order events"
        );
        self.notify_orders(orders.clone());
        Ok(orders)
    }

    async fn load<'a>(
        &self,
        touched: &'a mut HashMap<OrderHash, Order>,
        hash: &OrderHash,
    ) -> Result<Option<&'a mut Order>> {
        if !touched.contains_key(hash) {
            match self.store.order(hash).await? {
                Some(order) => {
                    touched.insert(*hash, order);
                }
                None => {
                    tracing::warn!(order = %hash, "forked event of unknown order");
                    return Ok(None);
                }
            }
        }
        Ok(touched.get_mut(hash))
    }
}

/// Cutoffs and flex cancellations are final for amount based transitions.
fn sticky(order: &Order, transition: Transition) -> Transition {
    match order.metadata.status {
        status @ (OrderStatus::Cutoff | OrderStatus::FlexCancel) => Transition::Override(status),
        _ => transition,
    }
}

fn has_cancellation(order: &Order) -> bool {
    !(order.metadata.cancelled_amount_s.is_zero() && order.metadata.cancelled_amount_b.is_zero())
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "order_manager")]
struct Metrics {
    /// Events that did not change any order, by reason.
    #[metric(labels("reason"))]
    skipped_events: prometheus::IntCounterVec,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }

    fn skipped(&self, reason: &str) {
        self.skipped_events.with_label_values(&[reason]).inc();
    }
}
