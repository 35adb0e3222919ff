use {
    crate::{
        account_balances::{self, AccountBalances, BalanceEvents},
        arguments::Arguments,
        cache_store::{CacheStore, InMemoryCacheStore},
        chain::{ChainAccessor, Node},
        cutoff_cache::CutoffCache,
        database::{InMemoryOrderStore, Postgres, orders::OrderStoring},
        dust::FractionDust,
        event_bus::EventBus,
        event_source::EventSource,
        fork::{self, FatalSignal, ForkProcessor},
        notifier::{self, BroadcastNotifier},
        order_manager::OrderManager,
    },
    anyhow::{Context, Result},
    clap::Parser,
    observe::metrics::LivenessChecking,
    std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Notifications a slow downstream consumer may lag behind before it misses
/// some.
const NOTIFICATION_CAPACITY: usize = 4096;

#[derive(Default)]
struct Liveness {
    stopping: AtomicBool,
}

#[async_trait::async_trait]
impl LivenessChecking for Liveness {
    async fn is_alive(&self) -> bool {
        !self.stopping.load(Ordering::Relaxed)
    }
}

pub async fn start(args: impl Iterator<Item = String>) {
    let args = Arguments::parse_from(args);
    let obs_config = observe::Config::new(
        args.log_filter.as_str(),
        args.log_stderr_threshold,
        args.use_json_logs,
    );
    observe::tracing::initialize(&obs_config);
    tracing::info!("running relay with validated arguments:\n{}", args);
    observe::metrics::setup_registry(Some("relay".into()), None);

    if let Err(err) = run(args).await {
        tracing::error!(?err, "relay stopped");
        std::process::exit(1);
    }
}

/// Assumes tracing and metrics registry have already been set up.
pub async fn run(args: Arguments) -> Result<()> {
    let liveness = Arc::new(Liveness::default());
    observe::metrics::serve_metrics(liveness.clone(), args.metrics_address);

    let store: Arc<dyn OrderStoring> = match &args.db_url {
        Some(url) => Arc::new(Postgres::new(url.as_str()).context("connect to database")?),
        None => {
            tracing::warn!("no database configured, orders are only kept in memory");
            Arc::new(InMemoryOrderStore::default())
        }
    };
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::default());
    let chain: Arc<dyn ChainAccessor> = Arc::new(Node::connect(&args.node_url));
    let notifier = Arc::new(BroadcastNotifier::new(NOTIFICATION_CAPACITY));
    notifier::spawn_logger(notifier.subscribe());

    let cutoffs = Arc::new(CutoffCache::new(args.cutoff_cache_ttl));
    cutoffs.spawn_sweep_task(args.cutoff_sweep_interval);

    let balances = Arc::new(AccountBalances::new(
        cache,
        chain,
        account_balances::Config {
            supported_tokens: args.supported_tokens.clone(),
            spenders: vec![args.delegate_address],
            cache_duration: args.cache_duration,
            dirty_block_window: args.dirty_block_window,
        },
    ));
    let orders = Arc::new(OrderManager::new(
        store,
        cutoffs,
        Arc::new(FractionDust::new(args.dust_threshold.clone())),
        notifier.clone(),
        args.protocol.clone(),
    ));

    let bus = EventBus::new(args.event_queue_size);
    let (fatal, mut fatal_errors) = FatalSignal::new();
    let forks = ForkProcessor::new(
        balances.clone(),
        orders.clone(),
        notifier.clone(),
        bus.suspension(),
        fatal,
        fork::Config {
            max_depth: args.max_fork_depth,
        },
    );
    bus.subscribe_all(OrderManager::KINDS, orders);
    bus.subscribe_all(
        BalanceEvents::KINDS,
        Arc::new(BalanceEvents::new(balances, notifier, args.weth_address)),
    );
    bus.subscribe_all(ForkProcessor::KINDS, Arc::new(forks));

    let source = EventSource::new(args.event_source.clone());
    let result = tokio::select! {
        result = source.forward(&bus) => result.map(|_| ()),
        Some(err) = fatal_errors.recv() => Err(err.into()),
        _ = shutdown_signal() => {
            tracing::info!("received shutdown signal");
            Ok(())
        }
    };

    liveness.stopping.store(true, Ordering::Relaxed);
    if let Err(err) = result {
        tracing::info!("discarding queued events");
        bus.abort().await;
        return Err(err);
    }
    tracing::info!("draining queued events");
    bus.shutdown().await;
    // Handlers of queued events may still have failed fatally.
    match fatal_errors.try_recv() {
        Ok(err) => Err(err.into()),
        Err(_) => Ok(()),
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    // Intercept signals for graceful shutdown. Kubernetes sends sigterm, Ctrl-C
    // sends sigint.
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .unwrap()
            .recv()
            .await
    };
    let sigint = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .unwrap()
            .recv()
            .await;
    };
    futures::pin_mut!(sigint);
    futures::pin_mut!(sigterm);
    futures::future::select(sigterm, sigint).await;
}

#[cfg(windows)]
async fn shutdown_signal() {
    // No support for signal handling on Windows.
    std::future::pending().await
}
