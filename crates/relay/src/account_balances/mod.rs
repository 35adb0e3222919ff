//! Cache-aside projection of token balances and allowances per owner.
//!
//! Entries are only ever filled on demand (a read miss or an account unlock).
//! Events mark the keys they touch as dirty for their block and the block end
//! refreshes exactly the dirty keys that are cached. Keys nobody asked for
//! are never fetched from the chain.

mod dirty_blocks;
mod events;
pub mod keys;

pub use self::{dirty_blocks::DirtyBlocks, events::BalanceEvents};
use {
    crate::{
        cache_store::CacheStore,
        chain::{AllowanceQuery, BalanceQuery, ChainAccessor},
    },
    alloy::primitives::{Address, U256},
    anyhow::{Context, Result},
    itertools::Itertools,
    model::u256_decimal,
    serde::{Deserialize, Serialize},
    std::{
        collections::{HashMap, HashSet},
        ops::RangeInclusive,
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::Duration,
    },
};

/// Cached amount together with the block it is known to be valid for.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedAmount {
    pub block_number: u64,
    #[serde(with = "u256_decimal")]
    pub amount: U256,
}

impl CachedAmount {
    fn encode(&self) -> Vec<u8> {
        // Serializing a struct of plain fields can't fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Tokens fetched when a caller does not ask for specific ones.
    pub supported_tokens: Vec<Address>,
    /// Spenders whose allowances get warmed on unlock and marked on fills.
    pub spenders: Vec<Address>,
    pub cache_duration: Duration,
    pub dirty_block_window: u64,
}

pub struct AccountBalances {
    store: Arc<dyn CacheStore>,
    chain: Arc<dyn ChainAccessor>,
    dirty: DirtyBlocks,
    config: Config,
    latest_block: AtomicU64,
}

/// Which owners a refresh of dirty keys reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Report {
    /// Owners with at least one cached value that changed.
    Changed,
    /// Every owner with a dirty key, cached or not.
    Touched,
}

impl AccountBalances {
    pub fn new(store: Arc<dyn CacheStore>, chain: Arc<dyn ChainAccessor>, config: Config) -> Self {
        let dirty = DirtyBlocks::new(
            store.clone(),
            config.dirty_block_window,
            config.cache_duration,
        );
        Self {
            store,
            chain,
            dirty,
            config,
            latest_block: AtomicU64::new(0),
        }
    }

    pub fn dirty(&self) -> &DirtyBlocks {
        &self.dirty
    }

    pub fn spenders(&self) -> &[Address] {
        &self.config.spenders
    }

    /// Records the newest block seen so values fetched on a read miss carry
    /// a block number.
    pub fn observe_block(&self, block: u64) {
        self.latest_block.fetch_max(block, Ordering::SeqCst);
    }

    fn latest_block(&self) -> u64 {
        self.latest_block.load(Ordering::SeqCst)
    }

    fn ttl(&self) -> Option<Duration> {
        Some(self.config.cache_duration)
    }

    /// Token balances of `owner`, all supported tokens if `tokens` is empty.
    ///
    /// Misses are fetched in a single chain call and written back. A failing
    /// chain call leaves the cache untouched.
    pub async fn balances(
        &self,
        owner: Address,
        tokens: &[Address],
    ) -> Result<HashMap<Address, CachedAmount>> {
        let tokens = self.requested(tokens);
        let key = keys::balances(&owner);
        let fields = tokens.iter().map(|token| token.to_vec()).collect_vec();
        let cached = self.read_fields(&key, &fields).await;

        let (mut found, missing): (HashMap<_, _>, Vec<_>) = tokens
            .iter()
            .zip(cached)
            .partition_map(|(token, cached)| match cached {
                Some(amount) => itertools::Either::Left((*token, amount)),
                None => itertools::Either::Right(BalanceQuery {
                    owner,
                    token: *token,
                }),
            });
        if missing.is_empty() {
            return Ok(found);
        }

        let block_number = self.latest_block();
        let amounts = self.fetch_balances(&missing).await?;
        let fetched = missing
            .iter()
            .zip(amounts)
            .map(|(query, amount)| {
                (query.token, CachedAmount {
                    block_number,
                    amount,
                })
            })
            .collect_vec();
        self.write_fields(
            &key,
            fetched
                .iter()
                .map(|(token, amount)| (token.to_vec(), amount.encode()))
                .collect(),
        )
        .await;
        found.extend(fetched);
        Ok(found)
    }

    /// Allowances `owner` granted `spender`, see [`Self::balances`].
    pub async fn allowances(
        &self,
        owner: Address,
        spender: Address,
        tokens: &[Address],
    ) -> Result<HashMap<Address, CachedAmount>> {
        let tokens = self.requested(tokens);
        let key = keys::allowances(&owner);
        let fields = tokens
            .iter()
            .map(|token| keys::allowance_field(token, &spender))
            .collect_vec();
        let cached = self.read_fields(&key, &fields).await;

        let (mut found, missing): (HashMap<_, _>, Vec<_>) = tokens
            .iter()
            .zip(cached)
            .partition_map(|(token, cached)| match cached {
                Some(amount) => itertools::Either::Left((*token, amount)),
                None => itertools::Either::Right(AllowanceQuery {
                    owner,
                    token: *token,
                    spender,
                }),
            });
        if missing.is_empty() {
            return Ok(found);
        }

        let block_number = self.latest_block();
        let amounts = self.fetch_allowances(&missing).await?;
        let fetched = missing
            .iter()
            .zip(amounts)
            .map(|(query, amount)| {
                (*query, CachedAmount {
                    block_number,
                    amount,
                })
            })
            .collect_vec();
        self.write_fields(
            &key,
            fetched
                .iter()
                .map(|(query, amount)| {
                    (
                        keys::allowance_field(&query.token, &query.spender),
                        amount.encode(),
                    )
                })
                .collect(),
        )
        .await;
        found.extend(fetched.into_iter().map(|(query, amount)| (query.token, amount)));
        Ok(found)
    }

    /// Native asset balance. Kept under its own key because it is fetched
    /// with a different call and never marked dirty.
    pub async fn native_balance(&self, owner: Address) -> Result<CachedAmount> {
        let key = keys::native_balance(&owner);
        match self.store.get(&key).await {
            Ok(Some(bytes)) => {
                if let Some(amount) = CachedAmount::decode(&bytes) {
                    return Ok(amount);
                }
                tracing::warn!(%owner, "malformed cached native balance");
            }
            Ok(None) => (),
            Err(err) => tracing::warn!(?err, %owner, "failed to read native balance"),
        }

        let block_number = self.latest_block();
        let amount = self
            .chain
            .native_balance(owner)
            .await
            .inspect_err(|_| Metrics::get().chain_read_failed("native_balance"))?;
        let amount = CachedAmount {
            block_number,
            amount,
        };
        if let Err(err) = self.store.set(&key, amount.encode(), self.ttl()).await {
            tracing::warn!(?err, %owner, "failed to cache native balance");
        }
        Ok(amount)
    }

    /// Drops the cached native balances so the next read refetches them.
    pub async fn invalidate_native(&self, owners: &[Address]) -> Result<()> {
        let keys = owners.iter().map(keys::native_balance).collect_vec();
        self.store.delete(&keys).await
    }

    /// Flags the account as active and warms its balances and allowances so
    /// block ends keep them fresh from now on.
    pub async fn unlock(&self, owner: Address) -> Result<()> {
        self.store
            .set(&keys::unlock(&owner), b"1".to_vec(), self.ttl())
            .await?;
        self.balances(owner, &[])
            .await
            .context("warm balances")?;
        for spender in &self.config.spenders {
            self.allowances(owner, *spender, &[])
                .await
                .context("warm allowances")?;
        }
        Ok(())
    }

    pub async fn is_unlocked(&self, owner: Address) -> Result<bool> {
        self.store.exists(&keys::unlock(&owner)).await
    }

    /// Refreshes the cached keys marked dirty in `block` and returns the
    /// owners whose cached values changed. Afterwards dirty sets that fell
    /// out of the window are purged.
    pub async fn resync(&self, block: u64) -> Result<HashSet<Address>> {
        self.observe_block(block);
        let dirty_balances = self.dirty.balances(block).await?;
        let dirty_allowances = self.dirty.allowances(block).await?;
        let changed = self
            .refresh(dirty_balances, dirty_allowances, block, Report::Changed)
            .await?;
        self.dirty.purge(block).await?;
        Metrics::get()
            .changed_owners
            .inc_by(u64::try_from(changed.len()).unwrap_or(u64::MAX));
        Ok(changed)
    }

    /// Re-resolves the cached keys marked dirty in any of the reorganized
    /// `blocks` and returns every owner with a dirty key in them. Each key is
    /// read once and stamped with the last block of the range.
    pub async fn replay(&self, blocks: RangeInclusive<u64>) -> Result<HashSet<Address>> {
        let head = *blocks.end();
        let mut dirty_balances = HashSet::new();
        let mut dirty_allowances = HashSet::new();
        for block in blocks.rev() {
            dirty_balances.extend(self.dirty.balances(block).await?);
            dirty_allowances.extend(self.dirty.allowances(block).await?);
        }
        self.refresh(
            dirty_balances.into_iter().collect(),
            dirty_allowances.into_iter().collect(),
            head,
            Report::Touched,
        )
        .await
    }

    /// Fetches the cached ones among the dirty keys and writes them back
    /// stamped with `block`.
    async fn refresh(
        &self,
        dirty_balances: Vec<BalanceQuery>,
        dirty_allowances: Vec<AllowanceQuery>,
        block: u64,
        report: Report,
    ) -> Result<HashSet<Address>> {
        let mut owners = match report {
            Report::Changed => HashSet::new(),
            Report::Touched => dirty_balances
                .iter()
                .map(|query| query.owner)
                .chain(dirty_allowances.iter().map(|query| query.owner))
                .collect(),
        };

        let balances = self.cached_balances(dirty_balances).await?;
        let allowances = self.cached_allowances(dirty_allowances).await?;
        let balance_queries = balances.iter().map(|(query, _)| *query).collect_vec();
        let allowance_queries = allowances.iter().map(|(query, _)| *query).collect_vec();
        let (new_balances, new_allowances) = futures::try_join!(
            async {
                if balance_queries.is_empty() {
                    return Ok(Vec::new());
                }
                self.fetch_balances(&balance_queries).await
            },
            async {
                if allowance_queries.is_empty() {
                    return Ok(Vec::new());
                }
                self.fetch_allowances(&allowance_queries).await
            },
        )?;
        Metrics::get()
            .resynced_keys
            .with_label_values(&["balance"])
            .inc_by(u64::try_from(balance_queries.len()).unwrap_or(u64::MAX));
        Metrics::get()
            .resynced_keys
            .with_label_values(&["allowance"])
            .inc_by(u64::try_from(allowance_queries.len()).unwrap_or(u64::MAX));

        let mut balance_writes: HashMap<Address, Vec<_>> = HashMap::new();
        for ((query, old), amount) in balances.into_iter().zip(new_balances) {
            if old.amount != amount {
                owners.insert(query.owner);
            }
            let value = CachedAmount {
                block_number: block,
                amount,
            };
            balance_writes
                .entry(query.owner)
                .or_default()
                .push((query.token.to_vec(), value.encode()));
        }
        let mut allowance_writes: HashMap<Address, Vec<_>> = HashMap::new();
        for ((query, old), amount) in allowances.into_iter().zip(new_allowances) {
            if old.amount != amount {
                owners.insert(query.owner);
            }
            let value = CachedAmount {
                block_number: block,
                amount,
            };
            allowance_writes.entry(query.owner).or_default().push((
                keys::allowance_field(&query.token, &query.spender),
                value.encode(),
            ));
        }

        for (owner, entries) in balance_writes {
            self.store
                .hmset(&keys::balances(&owner), entries, self.ttl())
                .await?;
        }
        for (owner, entries) in allowance_writes {
            self.store
                .hmset(&keys::allowances(&owner), entries, self.ttl())
                .await?;
        }
        tracing::debug!(
            block,
            balances = balance_queries.len(),
            allowances = allowance_queries.len(),
            owners = owners.len(),
            "refreshed dirty keys"
        );
        Ok(owners)
    }

    /// Keeps the queries whose value is currently cached.
    async fn cached_balances(
        &self,
        queries: Vec<BalanceQuery>,
    ) -> Result<Vec<(BalanceQuery, CachedAmount)>> {
        let mut cached = Vec::new();
        for (owner, queries) in queries.into_iter().into_group_map_by(|query| query.owner) {
            let fields = queries.iter().map(|query| query.token.to_vec()).collect_vec();
            let values = self.store.hmget(&keys::balances(&owner), &fields).await?;
            cached.extend(
                queries
                    .into_iter()
                    .zip(values)
                    .filter_map(|(query, value)| Some((query, CachedAmount::decode(&value?)?))),
            );
        }
        Ok(cached)
    }

    async fn cached_allowances(
        &self,
        queries: Vec<AllowanceQuery>,
    ) -> Result<Vec<(AllowanceQuery, CachedAmount)>> {
        let mut cached = Vec::new();
        for (owner, queries) in queries.into_iter().into_group_map_by(|query| query.owner) {
            let fields = queries
                .iter()
                .map(|query| keys::allowance_field(&query.token, &query.spender))
                .collect_vec();
            let values = self.store.hmget(&keys::allowances(&owner), &fields).await?;
            cached.extend(
                queries
                    .into_iter()
                    .zip(values)
                    .filter_map(|(query, value)| Some((query, CachedAmount::decode(&value?)?))),
            );
        }
        Ok(cached)
    }

    fn requested(&self, tokens: &[Address]) -> Vec<Address> {
        let tokens = if tokens.is_empty() {
            &self.config.supported_tokens
        } else {
            tokens
        };
        tokens.iter().copied().unique().collect()
    }

    /// Store failures count as misses.
    async fn read_fields(&self, key: &str, fields: &[Vec<u8>]) -> Vec<Option<CachedAmount>> {
        match self.store.hmget(key, fields).await {
            Ok(values) => values
                .into_iter()
                .map(|value| value.as_deref().and_then(CachedAmount::decode))
                .collect(),
            Err(err) => {
                tracing::warn!(?err, key, "failed to read cached amounts");
                vec![None; fields.len()]
            }
        }
    }

    async fn write_fields(&self, key: &str, entries: Vec<(Vec<u8>, Vec<u8>)>) {
        if let Err(err) = self.store.hmset(key, entries, self.ttl()).await {
            tracing::warn!(?err, key, "failed to cache amounts");
        }
    }

    async fn fetch_balances(&self, queries: &[BalanceQuery]) -> Result<Vec<U256>> {
        let amounts = self
            .chain
            .balances(queries)
            .await
            .inspect_err(|_| Metrics::get().chain_read_failed("balances"))?;
        anyhow::ensure!(amounts.len() == queries.len(), "balance batch size mismatch");
        Ok(amounts)
    }

    async fn fetch_allowances(&self, queries: &[AllowanceQuery]) -> Result<Vec<U256>> {
        let amounts = self
            .chain
            .allowances(queries)
            .await
            .inspect_err(|_| Metrics::get().chain_read_failed("allowances"))?;
        anyhow::ensure!(amounts.len() == queries.len(), "allowance batch size mismatch");
        Ok(amounts)
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "account_balances")]
struct Metrics {
    /// Cached keys refreshed from the chain because an event touched them.
    #[metric(labels("kind"))]
    resynced_keys: prometheus::IntCounterVec,

    /// Owners whose cached balances or allowances changed at a block end.
    changed_owners: prometheus::IntCounter,

    /// Failed chain reads by call.
    #[metric(labels("call"))]
    chain_read_failures: prometheus::IntCounterVec,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }

    fn chain_read_failed(&self, call: &str) {
        self.chain_read_failures.with_label_values(&[call]).inc();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{cache_store::InMemoryCacheStore, chain::MockChainAccessor},
        maplit::hashset,
    };

    const OWNER: Address = Address::new([0xaa; 20]);
    const SPENDER: Address = Address::new([0xdd; 20]);

    fn token(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn config() -> Config {
        Config {
            supported_tokens: vec![token(1), token(2), token(3)],
            spenders: vec![SPENDER],
            cache_duration: Duration::from_secs(3600),
            dirty_block_window: 500,
        }
    }

    fn balances(chain: MockChainAccessor) -> (Arc<InMemoryCacheStore>, AccountBalances) {
        let store = Arc::new(InMemoryCacheStore::default());
        let balances = AccountBalances::new(store.clone(), Arc::new(chain), config());
        (store, balances)
    }

    #[tokio::test]
    async fn miss_fetches_all_tokens_in_one_call() {
        let mut chain = MockChainAccessor::new();
        chain
            .expect_balances()
            .times(1)
            .withf(|queries| {
                queries.len() == 3 && queries.iter().all(|query| query.owner == OWNER)
            })
            .returning(|queries| {
                Ok(queries
                    .iter()
                    .map(|query| U256::from(query.token.0[0]))
                    .collect())
            });
        let (_, balances) = balances(chain);
        balances.observe_block(10);

        let first = balances.balances(OWNER, &[]).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first[&token(2)].amount, U256::from(2));
        assert_eq!(first[&token(2)].block_number, 10);

        // Served from the cache, the mock would panic on a second call.
        let second = balances.balances(OWNER, &[token(3), token(1)]).await.unwrap();
        assert_eq!(second[&token(3)].amount, U256::from(3));
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn partial_miss_only_fetches_missing_tokens() {
        let mut chain = MockChainAccessor::new();
        let mut seq = mockall::Sequence::new();
        chain
            .expect_balances()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|queries| queries.len() == 1 && queries[0].token == token(1))
            .returning(|_| Ok(vec![U256::from(5)]));
        chain
            .expect_balances()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|queries| queries.len() == 1 && queries[0].token == token(2))
            .returning(|_| Ok(vec![U256::from(6)]));
        let (_, balances) = balances(chain);

        balances.balances(OWNER, &[token(1)]).await.unwrap();
        let both = balances
            .balances(OWNER, &[token(1), token(2)])
            .await
            .unwrap();
        assert_eq!(both[&token(1)].amount, U256::from(5));
        assert_eq!(both[&token(2)].amount, U256::from(6));
    }

    #[tokio::test]
    async fn failed_fetch_keeps_cache_intact() {
        let mut chain = MockChainAccessor::new();
        let mut seq = mockall::Sequence::new();
        chain
            .expect_balances()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![U256::from(1)]));
        chain
            .expect_balances()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow::anyhow!("node down")));
        let (store, balances) = balances(chain);

        balances.balances(OWNER, &[token(1)]).await.unwrap();
        assert!(balances.balances(OWNER, &[token(1), token(2)]).await.is_err());

        let cached = store.hget_all(&keys::balances(&OWNER)).await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].0, token(1).to_vec());
    }

    #[tokio::test]
    async fn resync_refreshes_cached_dirty_keys_only() {
        let mut chain = MockChainAccessor::new();
        let mut seq = mockall::Sequence::new();
        // Warm up of the owner's token 1 balance.
        chain
            .expect_balances()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![U256::from(100)]));
        // Block end only reads the cached key.
        chain
            .expect_balances()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|queries| {
                queries.to_vec()
                    == vec![BalanceQuery {
                        owner: OWNER,
                        token: token(1),
                    }]
            })
            .returning(|_| Ok(vec![U256::from(70)]));
        chain.expect_allowances().never();
        let (store, balances) = balances(chain);

        balances.balances(OWNER, &[token(1)]).await.unwrap();
        let stranger = Address::repeat_byte(0xbb);
        balances.dirty().mark_balance(7, OWNER, token(1)).await.unwrap();
        balances.dirty().mark_balance(7, stranger, token(1)).await.unwrap();
        balances
            .dirty()
            .mark_allowance(7, AllowanceQuery {
                owner: stranger,
                token: token(1),
                spender: SPENDER,
            })
            .await
            .unwrap();

        let changed = balances.resync(7).await.unwrap();
        assert_eq!(changed, hashset! {OWNER});
        let cached = balances.balances(OWNER, &[token(1)]).await.unwrap();
        assert_eq!(
            cached[&token(1)],
            CachedAmount {
                block_number: 7,
                amount: U256::from(70)
            }
        );
        // Uncached keys are not warmed.
        assert!(!store.exists(&keys::balances(&stranger)).await.unwrap());
    }

    #[tokio::test]
    async fn replay_reads_each_key_once_at_the_head() {
        let mut chain = MockChainAccessor::new();
        let mut seq = mockall::Sequence::new();
        chain
            .expect_balances()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![U256::from(100)]));
        chain
            .expect_balances()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|queries| queries.len() == 1)
            .returning(|_| Ok(vec![U256::from(40)]));
        let (_, balances) = balances(chain);

        balances.balances(OWNER, &[token(1)]).await.unwrap();
        let stranger = Address::repeat_byte(0xbb);
        for block in [98, 100] {
            balances
                .dirty()
                .mark_balance(block, OWNER, token(1))
                .await
                .unwrap();
        }
        balances.dirty().mark_balance(99, stranger, token(2)).await.unwrap();

        let touched = balances.replay(98..=100).await.unwrap();
        assert_eq!(touched, hashset! {OWNER, stranger});
        let cached = balances.balances(OWNER, &[token(1)]).await.unwrap();
        assert_eq!(
            cached[&token(1)],
            CachedAmount {
                block_number: 100,
                amount: U256::from(40)
            }
        );
    }

    #[tokio::test]
    async fn unchanged_values_are_not_reported() {
        let mut chain = MockChainAccessor::new();
        chain
            .expect_allowances()
            .times(2)
            .returning(|queries| Ok(vec![U256::from(9); queries.len()]));
        let (_, balances) = balances(chain);

        balances.allowances(OWNER, SPENDER, &[token(1)]).await.unwrap();
        balances
            .dirty()
            .mark_allowance(3, AllowanceQuery {
                owner: OWNER,
                token: token(1),
                spender: SPENDER,
            })
            .await
            .unwrap();
        assert!(balances.resync(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn native_balance_is_cached_separately() {
        let mut chain = MockChainAccessor::new();
        chain
            .expect_native_balance()
            .times(2)
            .returning(|_| Ok(U256::from(42)));
        chain.expect_balances().never();
        let (store, balances) = balances(chain);

        assert_eq!(
            balances.native_balance(OWNER).await.unwrap().amount,
            U256::from(42)
        );
        assert!(store.exists(&keys::native_balance(&OWNER)).await.unwrap());
        balances.native_balance(OWNER).await.unwrap();

        balances.invalidate_native(&[OWNER]).await.unwrap();
        assert!(!store.exists(&keys::native_balance(&OWNER)).await.unwrap());
        balances.native_balance(OWNER).await.unwrap();
    }

    #[tokio::test]
    async fn unlock_warms_supported_tokens() {
        let mut chain = MockChainAccessor::new();
        chain
            .expect_balances()
            .times(1)
            .withf(|queries| queries.len() == 3)
            .returning(|queries| Ok(vec![U256::ZERO; queries.len()]));
        chain
            .expect_allowances()
            .times(1)
            .withf(|queries| queries.len() == 3 && queries.iter().all(|q| q.spender == SPENDER))
            .returning(|queries| Ok(vec![U256::MAX; queries.len()]));
        let (store, balances) = balances(chain);

        assert!(!balances.is_unlocked(OWNER).await.unwrap());
        balances.unlock(OWNER).await.unwrap();
        assert!(balances.is_unlocked(OWNER).await.unwrap());
        assert_eq!(
            store.hget_all(&keys::allowances(&OWNER)).await.unwrap().len(),
            3
        );
    }

    #[test]
    fn cached_amount_json() {
        let amount = CachedAmount {
            block_number: 12,
            amount: U256::from(1_000_000_000_000_000_000u128),
        };
        assert_eq!(
            String::from_utf8(amount.encode()).unwrap(),
            r#"{"blockNumber":12,"amount":"1000000000000000000"}"#
        );
        assert_eq!(CachedAmount::decode(&amount.encode()), Some(amount));
    }
}
