//! Latest cutoff watermark per owner or per owner and token pair.

use {
    alloy::primitives::Address,
    model::TokenPair,
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    },
    tokio::time::Instant,
    tracing::Instrument,
};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CutoffKey {
    pub protocol: Address,
    pub owner: Address,
    /// `None` for cutoffs covering every market of the owner.
    pub pair: Option<TokenPair>,
}

impl CutoffKey {
    pub fn all(protocol: Address, owner: Address) -> Self {
        Self {
            protocol,
            owner,
            pair: None,
        }
    }

    pub fn pair(protocol: Address, owner: Address, pair: TokenPair) -> Self {
        Self {
            protocol,
            owner,
            pair: Some(pair),
        }
    }
}

struct Entry {
    cutoff: u64,
    touched: Instant,
}

pub struct CutoffCache {
    entries: Mutex<HashMap<CutoffKey, Entry>>,
    ttl: Duration,
}

impl CutoffCache {
    /// Entries not read or written for `ttl` get removed by [`Self::sweep`].
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Default::default(),
            ttl,
        }
    }

    /// The cached watermark or zero.
    pub fn get(&self, key: &CutoffKey) -> u64 {
        self.cached(key).unwrap_or_default()
    }

    /// Like [`Self::get`] but tells a miss apart from a zero watermark.
    pub fn cached(&self, key: &CutoffKey) -> Option<u64> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(key)?;
        entry.touched = Instant::now();
        Some(entry.cutoff)
    }

    /// Raises the watermark. Older timestamps never lower it.
    pub fn update(&self, key: CutoffKey, cutoff: u64) {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let entry = entries.entry(key).or_insert(Entry {
            cutoff,
            touched: now,
        });
        entry.cutoff = entry.cutoff.max(cutoff);
        entry.touched = now;
        Metrics::get().set_entries(entries.len());
    }

    pub fn remove(&self, key: &CutoffKey) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(key);
        Metrics::get().set_entries(entries.len());
    }

    /// Removes idle entries and returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, entry| now.duration_since(entry.touched) < self.ttl);
        Metrics::get().set_entries(entries.len());
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweeps the cache every `interval` for as long as the cache is alive.
    pub fn spawn_sweep_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let task = async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep();
                if removed > 0 {
                    tracing::debug!(removed, remaining = cache.len(), "swept cutoff cache");
                }
            }
        };
        tokio::spawn(task.instrument(tracing::info_span!("cutoff_cache_sweep")))
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "cutoff_cache")]
struct Metrics {
    /// Number of cached cutoff watermarks.
    entries: prometheus::IntGauge,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }

    fn set_entries(&self, len: usize) {
        self.entries.set(i64::try_from(len).unwrap_or(i64::MAX));
    }
}
