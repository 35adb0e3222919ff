//! In-process routing of inbound events to their subscribers.
//!
//! Every event kind gets its own bounded queue and worker so subscribers of
//! one kind see events strictly in arrival order while different kinds are
//! processed concurrently.

use {
    anyhow::{Result, anyhow},
    model::event::{Event, EventKind, TxStatus},
    std::{
        collections::HashMap,
        sync::{
            Arc,
            RwLock,
            atomic::{AtomicBool, Ordering},
        },
    },
    strum::IntoEnumIterator,
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::Instrument,
};

/// Handles events of the kinds it got subscribed to. Which method gets
/// called depends on the status of the transaction the event was observed
/// in. Events without a transaction count as successful.
#[async_trait::async_trait]
pub trait Subscriber: Send + Sync {
    async fn on_pending(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn on_failed(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn on_success(&self, _event: &Event) -> Result<()> {
        Ok(())
    }
}

type Subscribers = Arc<RwLock<HashMap<EventKind, Vec<Arc<dyn Subscriber>>>>>;

/// Detaches all subscribers except the ones of fork events while set.
#[derive(Clone, Debug, Default)]
pub struct Suspension(Arc<SuspensionState>);

#[derive(Debug, Default)]
struct SuspensionState {
    suspended: AtomicBool,
    halted: AtomicBool,
}

impl Suspension {
    pub fn suspend(&self) {
        self.0.suspended.store(true, Ordering::SeqCst);
    }

    /// Has no effect once halted.
    pub fn resume(&self) {
        self.0.suspended.store(false, Ordering::SeqCst);
    }

    /// Detaches every subscriber for good, fork handlers included.
    pub fn halt(&self) {
        self.0.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.is_halted() || self.0.suspended.load(Ordering::SeqCst)
    }

    pub fn is_halted(&self) -> bool {
        self.0.halted.load(Ordering::SeqCst)
    }
}

pub struct EventBus {
    senders: HashMap<EventKind, mpsc::Sender<Event>>,
    subscribers: Subscribers,
    suspension: Suspension,
    workers: Vec<JoinHandle<()>>,
}

impl EventBus {
    /// Spawns one worker per event kind, each buffering up to `queue_size`
    /// events before [`Self::publish`] waits.
    pub fn new(queue_size: usize) -> Self {
        let subscribers = Subscribers::default();
        let suspension = Suspension::default();
        let mut senders = HashMap::new();
        let mut workers = Vec::new();
        for kind in EventKind::iter() {
            let (sender, receiver) = mpsc::channel(queue_size.max(1));
            senders.insert(kind, sender);
            workers.push(tokio::spawn(
                work(kind, receiver, subscribers.clone(), suspension.clone())
                    .instrument(tracing::info_span!("event_worker", kind = kind.as_ref())),
            ));
        }
        Self {
            senders,
            subscribers,
            suspension,
            workers,
        }
    }

    pub fn subscribe(&self, kind: EventKind, subscriber: Arc<dyn Subscriber>) {
        self.subscribers
            .write()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(subscriber);
    }

    pub fn subscribe_all(&self, kinds: &[EventKind], subscriber: Arc<dyn Subscriber>) {
        for kind in kinds {
            self.subscribe(*kind, subscriber.clone());
        }
    }

    pub async fn publish(&self, event: Event) -> Result<()> {
        let kind = event.kind();
        self.senders
            .get(&kind)
            .ok_or_else(|| anyhow!("no queue for {}", kind.as_ref()))?
            .send(event)
            .await
            .map_err(|_| anyhow!("event worker for {} stopped", kind.as_ref()))
    }

    pub fn suspension(&self) -> Suspension {
        self.suspension.clone()
    }

    /// Stops accepting events and waits until all queued events have been
    /// handled.
    pub async fn shutdown(self) {
        drop(self.senders);
        for worker in self.workers {
            if let Err(err) = worker.await {
                tracing::error!(?err, "event worker panicked");
            }
        }
    }

    /// Stops processing right away. Queued events are discarded and handlers
    /// that are running get cancelled at their next await point.
    pub async fn abort(self) {
        self.suspension.halt();
        drop(self.senders);
        for worker in &self.workers {
            worker.abort();
        }
        for worker in self.workers {
            match worker.await {
                Err(err) if err.is_panic() => tracing::error!(?err, "event worker panicked"),
                _ => (),
            }
        }
    }
}

async fn work(
    kind: EventKind,
    mut receiver: mpsc::Receiver<Event>,
    subscribers: Subscribers,
    suspension: Suspension,
) {
    let metrics = Metrics::get();
    while let Some(event) = receiver.recv().await {
        if suspension.is_halted() {
            metrics
                .events_dropped
                .with_label_values(&[kind.as_ref()])
                .inc();
            continue;
        }
        if suspension.is_suspended() && kind != EventKind::ChainForkDetected {
            tracing::debug!("dropping event while suspended");
            metrics
                .events_dropped
                .with_label_values(&[kind.as_ref()])
                .inc();
            continue;
        }

        let subscribers = subscribers
            .read()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        let status = event.status();
        for subscriber in subscribers {
            let result = match status {
                TxStatus::Pending => subscriber.on_pending(&event).await,
                TxStatus::Failed => subscriber.on_failed(&event).await,
                TxStatus::Success => subscriber.on_success(&event).await,
            };
            let outcome = match result {
                Ok(()) => "success",
                Err(err) => {
                    tracing::error!(?err, status = status.as_ref(), "event handler failed");
                    "error"
                }
            };
            metrics
                .events_handled
                .with_label_values(&[kind.as_ref(), outcome])
                .inc();
        }
    }
    tracing::debug!("event worker stopped");
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "event_bus")]
struct Metrics {
    /// Handler invocations by event kind and outcome.
    #[metric(labels("kind", "outcome"))]
    events_handled: prometheus::IntCounterVec,

    /// Events discarded because processing was suspended.
    #[metric(labels("kind"))]
    events_dropped: prometheus::IntCounterVec,
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
        model::event::{BlockEnd, ChainFork, Transfer, TxInfo},
        std::sync::Mutex,
    };

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(TxStatus, Event)>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<(TxStatus, Event)> {
            self.seen.lock().unwrap().clone()
        }

        fn record(&self, status: TxStatus, event: &Event) -> Result<()> {
            self.seen.lock().unwrap().push((status, event.clone()));
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Subscriber for Recorder {
        async fn on_pending(&self, event: &Event) -> Result<()> {
            self.record(TxStatus::Pending, event)
        }

        async fn on_failed(&self, event: &Event) -> Result<()> {
            self.record(TxStatus::Failed, event)
        }

        async fn on_success(&self, event: &Event) -> Result<()> {
            self.record(TxStatus::Success, event)
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl Subscriber for Failing {
        async fn on_success(&self, _: &Event) -> Result<()> {
            Err(anyhow!("boom"))
        }
    }

    fn transfer(log_index: u64, status: TxStatus) -> Event {
        Event::Transfer(Transfer {
            tx: TxInfo {
                log_index,
                status,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn block_end(block_number: u64) -> Event {
        Event::BlockEnd(BlockEnd {
            block_number,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn same_kind_is_delivered_in_order_by_status() {
        let bus = EventBus::new(4);
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(EventKind::Transfer, recorder.clone());

        let events = [
            transfer(0, TxStatus::Pending),
            transfer(1, TxStatus::Success),
            transfer(2, TxStatus::Failed),
            transfer(3, TxStatus::Success),
        ];
        for event in events.clone() {
            bus.publish(event).await.unwrap();
        }
        // Not subscribed, goes nowhere.
        bus.publish(block_end(1)).await.unwrap();
        bus.shutdown().await;

        let seen = recorder.seen();
        assert_eq!(
            seen.iter().map(|(status, _)| *status).collect::<Vec<_>>(),
            [
                TxStatus::Pending,
                TxStatus::Success,
                TxStatus::Failed,
                TxStatus::Success
            ]
        );
        assert_eq!(seen.into_iter().map(|(_, event)| event).collect::<Vec<_>>(), events);
    }

    #[tokio::test]
    async fn events_without_transaction_are_successful() {
        let bus = EventBus::new(1);
        let recorder = Arc::new(Recorder::default());
        bus.subscribe_all(&[EventKind::BlockEnd, EventKind::ChainForkDetected], recorder.clone());
        bus.publish(block_end(7)).await.unwrap();
        bus.shutdown().await;
        assert_eq!(recorder.seen(), vec![(TxStatus::Success, block_end(7))]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_worker() {
        let bus = EventBus::new(4);
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(EventKind::BlockEnd, Arc::new(Failing));
        bus.subscribe(EventKind::BlockEnd, recorder.clone());
        bus.publish(block_end(1)).await.unwrap();
        bus.publish(block_end(2)).await.unwrap();
        bus.shutdown().await;
        assert_eq!(recorder.seen().len(), 2);
    }

    #[tokio::test]
    async fn suspension_only_lets_forks_through() {
        let bus = EventBus::new(4);
        let recorder = Arc::new(Recorder::default());
        bus.subscribe_all(
            &[EventKind::Transfer, EventKind::ChainForkDetected],
            recorder.clone(),
        );
        let suspension = bus.suspension();

        suspension.suspend();
        let fork = Event::ChainForkDetected(ChainFork {
            fork_block: 1,
            detected_block: 2,
        });
        bus.publish(transfer(0, TxStatus::Success)).await.unwrap();
        bus.publish(fork.clone()).await.unwrap();
        // Wait for both workers to have seen their event.
        while recorder.seen().is_empty() {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        suspension.resume();
        bus.publish(transfer(1, TxStatus::Success)).await.unwrap();
        bus.shutdown().await;

        assert_eq!(
            recorder.seen(),
            vec![
                (TxStatus::Success, fork),
                (TxStatus::Success, transfer(1, TxStatus::Success)),
            ]
        );
    }

    #[tokio::test]
    async fn halted_bus_stays_detached() {
        let bus = EventBus::new(4);
        let recorder = Arc::new(Recorder::default());
        bus.subscribe_all(
            &[EventKind::Transfer, EventKind::ChainForkDetected],
            recorder.clone(),
        );
        let suspension = bus.suspension();

        suspension.suspend();
        suspension.halt();
        suspension.resume();
        assert!(suspension.is_suspended());

        bus.publish(transfer(0, TxStatus::Success)).await.unwrap();
        bus.publish(Event::ChainForkDetected(ChainFork {
            fork_block: 1,
            detected_block: 2,
        }))
        .await
        .unwrap();
        bus.shutdown().await;
        assert!(recorder.seen().is_empty());
    }

    /// Records the event and then never finishes handling it.
    #[derive(Default)]
    struct Stuck {
        recorder: Recorder,
    }

    #[async_trait::async_trait]
    impl Subscriber for Stuck {
        async fn on_success(&self, event: &Event) -> Result<()> {
            self.recorder.record(TxStatus::Success, event)?;
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn abort_discards_queued_events() {
        let bus = EventBus::new(4);
        let stuck = Arc::new(Stuck::default());
        bus.subscribe(EventKind::BlockEnd, stuck.clone());
        bus.publish(block_end(1)).await.unwrap();
        bus.publish(block_end(2)).await.unwrap();
        while stuck.recorder.seen().is_empty() {
            tokio::task::yield_now().await;
        }

        let suspension = bus.suspension();
        bus.abort().await;
        assert!(suspension.is_halted());
        assert_eq!(stuck.recorder.seen(), vec![(TxStatus::Success, block_end(1))]);
    }
}
