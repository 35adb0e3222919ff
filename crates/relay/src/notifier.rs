use {
    model::notification::Notification,
    tokio::sync::broadcast,
    tracing::Instrument,
};

/// Fire-and-forget fan out of state changes to downstream services.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
pub trait Notifying: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Delivers notifications to every live receiver. Receivers that lag behind
/// lose the oldest notifications.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Notifying for BroadcastNotifier {
    fn notify(&self, notification: Notification) {
        Metrics::get()
            .notifications
            .with_label_values(&[notification.label()])
            .inc();
        // Sending only fails if nobody listens which is fine.
        let _ = self.sender.send(notification);
    }
}

/// Logs every notification. Stands in for the push services when running
/// the relay on its own.
pub fn spawn_logger(
    mut receiver: broadcast::Receiver<Notification>,
) -> tokio::task::JoinHandle<()> {
    let task = async move {
        loop {
            match receiver.recv().await {
                Ok(notification) => {
                    tracing::debug!(kind = notification.label(), ?notification, "notification")
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "notification logger lagged behind")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    tokio::spawn(task.instrument(tracing::info_span!("notifications")))
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "notifier")]
struct Metrics {
    /// Notifications emitted by kind.
    #[metric(labels("kind"))]
    notifications: prometheus::IntCounterVec,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}
