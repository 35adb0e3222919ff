//! Recovery from chain reorganizations.
//!
//! While a fork gets replayed every subscriber except the fork handler is
//! detached from the event bus. The dirty keys of the reorganized blocks are
//! resolved again, audit rows of those blocks are flagged as forked and the
//! order state they produced is rolled back.

use {
    crate::{
        account_balances::AccountBalances,
        database::orders::ForkedRecords,
        event_bus::{Subscriber, Suspension},
        notifier::Notifying,
        order_manager::OrderManager,
    },
    alloy::primitives::Address,
    anyhow::Result,
    model::{
        event::{ChainFork, Event, EventKind},
        notification::Notification,
    },
    std::{
        collections::HashSet,
        sync::{
            Arc,
            Mutex,
            atomic::{AtomicBool, Ordering},
        },
    },
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::Instrument,
};

/// We expect that there is never a reorg that changes more than the last n
/// blocks.
pub const MAX_REORG_BLOCK_COUNT: u64 = 64;

#[derive(Debug, thiserror::Error)]
pub enum ForkError {
    #[error("fork from block {fork_block} to {detected_block} detected while replaying a fork")]
    NestedFork { fork_block: u64, detected_block: u64 },
    #[error("fork of {depth} blocks exceeds the maximum of {max}")]
    TooDeep { depth: u64, max: u64 },
    #[error("fork replay failed")]
    Replay(#[source] anyhow::Error),
}

/// Reports errors after which the relay must not keep processing events.
#[derive(Clone)]
pub struct FatalSignal(mpsc::UnboundedSender<ForkError>);

impl FatalSignal {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ForkError>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self(sender), receiver)
    }

    pub fn raise(&self, err: ForkError) {
        tracing::error!(?err, "fatal error");
        if self.0.send(err).is_err() {
            tracing::error!("nobody listens for fatal errors");
        }
    }
}

#[derive(Debug)]
pub struct ForkReport {
    pub depth: u64,
    /// Owners with dirty keys in the reorganized blocks.
    pub owners: HashSet<Address>,
    pub forked: ForkedRecords,
    pub restored_orders: usize,
}

pub struct Config {
    pub max_depth: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_depth: MAX_REORG_BLOCK_COUNT,
        }
    }
}

#[derive(Clone)]
pub struct ForkProcessor(Arc<Inner>);

struct Inner {
    balances: Arc<AccountBalances>,
    orders: Arc<OrderManager>,
    notifier: Arc<dyn Notifying>,
    suspension: Suspension,
    fatal: FatalSignal,
    config: Config,
    replaying: AtomicBool,
    replay_task: Mutex<Option<JoinHandle<()>>>,
}

impl ForkProcessor {
    pub const KINDS: &'static [EventKind] = &[EventKind::ChainForkDetected];

    pub fn new(
        balances: Arc<AccountBalances>,
        orders: Arc<OrderManager>,
        notifier: Arc<dyn Notifying>,
        suspension: Suspension,
        fatal: FatalSignal,
        config: Config,
    ) -> Self {
        Self(Arc::new(Inner {
            balances,
            orders,
            notifier,
            suspension,
            fatal,
            config,
            replaying: AtomicBool::new(false),
            replay_task: Mutex::new(None),
        }))
    }

    /// Replays the blocks of the fork with live event processing suspended.
    /// Returns `None` for an empty block range. A failed replay leaves event
    /// processing halted.
    pub async fn replay(&self, fork: &ChainFork) -> Result<Option<ForkReport>, ForkError> {
        if fork.fork_block >= fork.detected_block {
            tracing::warn!(?fork, "ignoring fork without reorganized blocks");
            return Ok(None);
        }
        let depth = fork.detected_block - fork.fork_block;
        if depth > self.0.config.max_depth {
            Metrics::get().replays.with_label_values(&["too_deep"]).inc();
            return Err(ForkError::TooDeep {
                depth,
                max: self.0.config.max_depth,
            });
        }

        self.0.suspension.suspend();
        tracing::info!(depth, "suspended event processing for fork replay");
        let result = self.replay_blocks(fork).await;
        match &result {
            Ok(_) => self.0.suspension.resume(),
            Err(_) => self.0.suspension.halt(),
        }

        let outcome = if result.is_ok() { "success" } else { "error" };
        Metrics::get().replays.with_label_values(&[outcome]).inc();
        let report = result.map_err(ForkError::Replay)?;
        tracing::info!(
            depth,
            owners = report.owners.len(),
            restored_orders = report.restored_orders,
            "replayed fork"
        );
        Ok(Some(report))
    }

    async fn replay_blocks(&self, fork: &ChainFork) -> Result<ForkReport> {
        let owners = self
            .0
            .balances
            .replay(fork.fork_block..=fork.detected_block)
            .await?;
        Metrics::get()
            .replayed_blocks
            .inc_by(fork.detected_block - fork.fork_block + 1);

        let (forked, restored) = self
            .0
            .orders
            .fork(fork.fork_block, fork.detected_block)
            .await?;
        let restored_orders = restored.len();

        for owner in &owners {
            self.0
                .notifier
                .notify(Notification::BalanceUpdate { owner: *owner });
        }
        Ok(ForkReport {
            depth: fork.detected_block - fork.fork_block,
            owners,
            forked,
            restored_orders,
        })
    }

    /// Stops all event processing and reports the error.
    fn fail(&self, err: ForkError) {
        self.0.suspension.halt();
        self.0.fatal.raise(err);
    }
}

#[async_trait::async_trait]
impl Subscriber for ForkProcessor {
    /// The replay runs in its own task so a fork reported while replaying is
    /// noticed.
    async fn on_success(&self, event: &Event) -> Result<()> {
        let Event::ChainForkDetected(fork) = event else {
            return Ok(());
        };
        if self.0.replaying.swap(true, Ordering::SeqCst) {
            self.fail(ForkError::NestedFork {
                fork_block: fork.fork_block,
                detected_block: fork.detected_block,
            });
            if let Some(replay) = self.0.replay_task.lock().unwrap().take() {
                replay.abort();
            }
            return Ok(());
        }

        let processor = self.clone();
        let fork = fork.clone();
        let span = tracing::info_span!(
            "fork_replay",
            fork_block = fork.fork_block,
            detected_block = fork.detected_block
        );
        let task = tokio::spawn(
            async move {
                if let Err(err) = processor.replay(&fork).await {
                    processor.fail(err);
                }
                processor.0.replaying.store(false, Ordering::SeqCst);
            }
            .instrument(span),
        );
        *self.0.replay_task.lock().unwrap() = Some(task);
        Ok(())
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "fork")]
struct Metrics {
    /// Fork replays by outcome.
    #[metric(labels("outcome"))]
    replays: prometheus::IntCounterVec,

    /// Blocks whose dirty keys got resolved again.
    replayed_blocks: prometheus::IntCounter,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            account_balances,
            cache_store::InMemoryCacheStore,
            chain::MockChainAccessor,
            cutoff_cache::{CutoffCache, CutoffKey},
            database::{
                InMemoryOrderStore,
                orders::{
                    CutoffRecord,
                    InsertionError,
                    OrderFilter,
                    OrderStoring,
                    Page,
                    RingMinedRecord,
                },
            },
            dust::FractionDust,
            notifier::BroadcastNotifier,
        },
        alloy::primitives::{B256, U256},
        model::{
            event::{NewOrder, OrderCancelled, OrderFilled, TxInfo},
            order::{Order, OrderData, OrderHash, OrderStatus},
        },
        num::BigRational,
        std::time::Duration,
        tokio::sync::{Notify, broadcast},
    };

    const OWNER: Address = Address::new([0xaa; 20]);
    const TOKEN: Address = Address::new([0x01; 20]);

    struct Setup {
        balances: Arc<AccountBalances>,
        store: Arc<InMemoryOrderStore>,
        orders: Arc<OrderManager>,
        suspension: Suspension,
        processor: ForkProcessor,
        fatal: mpsc::UnboundedReceiver<ForkError>,
        notifications: broadcast::Receiver<Notification>,
    }

    fn setup(chain: MockChainAccessor) -> Setup {
        let store = Arc::new(InMemoryOrderStore::default());
        setup_with_store(chain, store.clone(), store)
    }

    fn setup_with_store(
        chain: MockChainAccessor,
        store: Arc<InMemoryOrderStore>,
        orders_store: Arc<dyn OrderStoring>,
    ) -> Setup {
        let balances = Arc::new(AccountBalances::new(
            Arc::new(InMemoryCacheStore::default()),
            Arc::new(chain),
            account_balances::Config {
                supported_tokens: vec![TOKEN],
                spenders: vec![],
                cache_duration: Duration::from_secs(3600),
                dirty_block_window: 500,
            },
        ));
        let notifier = Arc::new(BroadcastNotifier::new(64));
        let notifications = notifier.subscribe();
        let orders = Arc::new(OrderManager::new(
            orders_store,
            Arc::new(CutoffCache::new(Duration::from_secs(3600))),
            Arc::new(FractionDust::new(BigRational::new(1.into(), 100.into()))),
            notifier.clone(),
            vec![],
        ));
        let suspension = Suspension::default();
        let (signal, fatal) = FatalSignal::new();
        let processor = ForkProcessor::new(
            balances.clone(),
            orders.clone(),
            notifier,
            suspension.clone(),
            signal,
            Config::default(),
        );
        Setup {
            balances,
            store,
            orders,
            suspension,
            processor,
            fatal,
            notifications,
        }
    }

    fn fork(fork_block: u64, detected_block: u64) -> ChainFork {
        ChainFork {
            fork_block,
            detected_block,
        }
    }

    #[tokio::test]
    async fn replay_refreshes_balances_and_forks_rows() {
        let mut chain = MockChainAccessor::new();
        let mut seq = mockall::Sequence::new();
        chain
            .expect_balances()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![U256::from(10)]));
        chain
            .expect_balances()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![U256::from(7)]));
        let mut setup = setup(chain);

        setup.balances.balances(OWNER, &[TOKEN]).await.unwrap();
        setup
            .balances
            .dirty()
            .mark_balance(100, OWNER, TOKEN)
            .await
            .unwrap();
        let order = setup
            .orders
            .new_order(&NewOrder {
                order: OrderData {
                    owner: OWNER,
                    token_s: TOKEN,
                    token_b: Address::repeat_byte(2),
                    amount_s: U256::from(100),
                    amount_b: U256::from(300),
                    ..Default::default()
                },
                created_at: 1,
            })
            .await
            .unwrap()
            .unwrap();
        setup
            .orders
            .fill(&OrderFilled {
                tx: TxInfo {
                    tx_hash: B256::repeat_byte(1),
                    block_number: 99,
                    ..Default::default()
                },
                order_hash: order.metadata.hash,
                amount_s: U256::from(40),
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();
        while setup.notifications.try_recv().is_ok() {}

        let report = setup.processor.replay(&fork(98, 100)).await.unwrap().unwrap();
        assert_eq!(report.depth, 2);
        assert_eq!(report.owners, HashSet::from([OWNER]));
        assert_eq!(report.forked.fills.len(), 1);
        assert_eq!(report.restored_orders, 1);

        // Served from the cache, the mock allows no further calls.
        let cached = setup.balances.balances(OWNER, &[TOKEN]).await.unwrap();
        assert_eq!(cached[&TOKEN].amount, U256::from(7));
        assert_eq!(setup.store.fill_rows(), (0, 1));
        let restored = setup.orders.order(&order.metadata.hash).await.unwrap().unwrap();
        assert_eq!(restored.metadata.status, OrderStatus::New);
        assert!(!setup.suspension.is_suspended());

        let notifications = std::iter::from_fn(|| setup.notifications.try_recv().ok())
            .collect::<Vec<_>>();
        assert!(notifications.contains(&Notification::BalanceUpdate { owner: OWNER }));
    }

    #[tokio::test]
    async fn empty_range_is_ignored() {
        let setup = setup(MockChainAccessor::new());
        assert!(setup.processor.replay(&fork(100, 100)).await.unwrap().is_none());
        assert!(!setup.suspension.is_suspended());
    }

    #[tokio::test]
    async fn too_deep_forks_are_rejected() {
        let setup = setup(MockChainAccessor::new());
        let err = setup.processor.replay(&fork(0, 100)).await.unwrap_err();
        assert!(matches!(err, ForkError::TooDeep { depth: 100, max: 64 }));
        assert!(!setup.suspension.is_suspended());
    }

    #[tokio::test]
    async fn nested_fork_is_fatal() {
        let mut setup = setup(MockChainAccessor::new());
        setup.processor.0.replaying.store(true, Ordering::SeqCst);
        setup
            .processor
            .on_success(&Event::ChainForkDetected(fork(98, 100)))
            .await
            .unwrap();
        assert!(matches!(
            setup.fatal.recv().await,
            Some(ForkError::NestedFork {
                fork_block: 98,
                detected_block: 100
            })
        ));
        // The outer replay resuming must not restart processing.
        setup.suspension.resume();
        assert!(setup.suspension.is_halted());
        assert!(setup.suspension.is_suspended());
    }

    #[tokio::test]
    async fn failed_replay_is_fatal_and_halts() {
        let mut chain = MockChainAccessor::new();
        let mut seq = mockall::Sequence::new();
        chain
            .expect_balances()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![U256::from(10)]));
        chain
            .expect_balances()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow::anyhow!("node unavailable")));
        let mut setup = setup(chain);
        setup.balances.balances(OWNER, &[TOKEN]).await.unwrap();
        setup
            .balances
            .dirty()
            .mark_balance(100, OWNER, TOKEN)
            .await
            .unwrap();

        setup
            .processor
            .on_success(&Event::ChainForkDetected(fork(98, 100)))
            .await
            .unwrap();
        assert!(matches!(setup.fatal.recv().await, Some(ForkError::Replay(_))));
        assert!(setup.suspension.is_halted());
        // Nothing got flagged because the replay stopped early.
        assert!(setup.store.fill_rows() == (0, 0));
    }

    /// Holds fills in `save_fill` until released, with the order manager's
    /// write lock taken.
    struct GatedFills {
        inner: Arc<InMemoryOrderStore>,
        entered: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl OrderStoring for GatedFills {
        async fn insert_order(&self, order: &Order) -> Result<(), InsertionError> {
            self.inner.insert_order(order).await
        }

        async fn order(&self, hash: &OrderHash) -> Result<Option<Order>> {
            self.inner.order(hash).await
        }

        async fn orders_by_owner(
            &self,
            owner: &Address,
            statuses: &[OrderStatus],
            page: Page,
        ) -> Result<Vec<Order>> {
            self.inner.orders_by_owner(owner, statuses, page).await
        }

        async fn find_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>> {
            self.inner.find_orders(filter).await
        }

        async fn update_orders(&self, orders: &[Order]) -> Result<()> {
            self.inner.update_orders(orders).await
        }

        async fn fill_exists(&self, tx_hash: &B256, fill_index: u64) -> Result<bool> {
            self.inner.fill_exists(tx_hash, fill_index).await
        }

        async fn save_fill(&self, fill: &OrderFilled, order: &Order) -> Result<bool> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.save_fill(fill, order).await
        }

        async fn cancel_exists(&self, tx_hash: &B256) -> Result<bool> {
            self.inner.cancel_exists(tx_hash).await
        }

        async fn save_cancel(&self, cancel: &OrderCancelled, order: &Order) -> Result<bool> {
            self.inner.save_cancel(cancel, order).await
        }

        async fn cutoff_exists(&self, tx_hash: &B256) -> Result<bool> {
            self.inner.cutoff_exists(tx_hash).await
        }

        async fn save_cutoff(&self, cutoff: &CutoffRecord, orders: &[Order]) -> Result<bool> {
            self.inner.save_cutoff(cutoff, orders).await
        }

        async fn latest_cutoff(&self, key: &CutoffKey) -> Result<Option<u64>> {
            self.inner.latest_cutoff(key).await
        }

        async fn upsert_ring_mined(&self, ring: &RingMinedRecord) -> Result<()> {
            self.inner.upsert_ring_mined(ring).await
        }

        async fn mark_provisional(
            &self,
            tx_hash: &B256,
            orders: &[OrderHash],
            marker: OrderStatus,
        ) -> Result<Vec<Order>> {
            self.inner.mark_provisional(tx_hash, orders, marker).await
        }

        async fn revert_provisional(&self, tx_hash: &B256) -> Result<Vec<Order>> {
            self.inner.revert_provisional(tx_hash).await
        }

        async fn mark_forked(&self, after: u64, up_to: u64) -> Result<ForkedRecords> {
            self.inner.mark_forked(after, up_to).await
        }
    }

    #[tokio::test]
    async fn fill_in_flight_during_replay_gets_rolled_back() {
        let inner = Arc::new(InMemoryOrderStore::default());
        let gated = Arc::new(GatedFills {
            inner: inner.clone(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let setup = setup_with_store(MockChainAccessor::new(), inner, gated.clone());
        let order = setup
            .orders
            .new_order(&NewOrder {
                order: OrderData {
                    owner: OWNER,
                    token_s: TOKEN,
                    token_b: Address::repeat_byte(2),
                    amount_s: U256::from(100),
                    amount_b: U256::from(300),
                    ..Default::default()
                },
                created_at: 1,
            })
            .await
            .unwrap()
            .unwrap();

        let orders = setup.orders.clone();
        let fill = OrderFilled {
            tx: TxInfo {
                tx_hash: B256::repeat_byte(1),
                block_number: 100,
                ..Default::default()
            },
            order_hash: order.metadata.hash,
            amount_s: U256::from(40),
            ..Default::default()
        };
        let filling = tokio::spawn(async move { orders.fill(&fill).await });
        gated.entered.notified().await;

        let processor = setup.processor.clone();
        let replay = tokio::spawn(async move { processor.replay(&fork(98, 100)).await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!replay.is_finished());
        gated.release.notify_one();

        filling.await.unwrap().unwrap().unwrap();
        let report = replay.await.unwrap().unwrap().unwrap();
        assert_eq!(report.forked.fills.len(), 1);
        assert_eq!(report.restored_orders, 1);
        let stored = setup.orders.order(&order.metadata.hash).await.unwrap().unwrap();
        assert_eq!(stored.metadata.dealt_amount_s, U256::ZERO);
        assert_eq!(stored.metadata.status, OrderStatus::New);
        assert_eq!(setup.store.fill_rows(), (0, 1));
    }
}
