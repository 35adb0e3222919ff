//! Per block sets of balance and allowance keys that events touched.

use {
    super::keys,
    crate::{
        cache_store::CacheStore,
        chain::{AllowanceQuery, BalanceQuery},
    },
    alloy::primitives::Address,
    anyhow::Result,
    std::{sync::Arc, time::Duration},
    tokio::sync::Mutex,
};

/// Number of blocks whose sets get deleted in one store call.
const PURGE_CHUNK: u64 = 256;

pub struct DirtyBlocks {
    store: Arc<dyn CacheStore>,
    /// Number of blocks a dirty set is kept for after its block ended.
    window: u64,
    ttl: Duration,
    /// Highest block whose sets were purged.
    last_purged: Mutex<Option<u64>>,
}

impl DirtyBlocks {
    pub fn new(store: Arc<dyn CacheStore>, window: u64, ttl: Duration) -> Self {
        Self {
            store,
            window,
            ttl,
            last_purged: Default::default(),
        }
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    pub async fn mark_balance(&self, block: u64, owner: Address, token: Address) -> Result<()> {
        self.mark_balances(block, &[BalanceQuery { owner, token }])
            .await
    }

    pub async fn mark_balances(&self, block: u64, queries: &[BalanceQuery]) -> Result<()> {
        if queries.is_empty() {
            return Ok(());
        }
        let members = queries.iter().map(keys::encode_balance).collect();
        self.store
            .sadd(&keys::dirty_balances(block), members, Some(self.ttl))
            .await
    }

    pub async fn mark_allowance(&self, block: u64, query: AllowanceQuery) -> Result<()> {
        self.store
            .sadd(
                &keys::dirty_allowances(block),
                vec![keys::encode_allowance(&query)],
                Some(self.ttl),
            )
            .await
    }

    pub async fn balances(&self, block: u64) -> Result<Vec<BalanceQuery>> {
        let members = self.store.smembers(&keys::dirty_balances(block)).await?;
        Ok(decode_all(&members, keys::decode_balance, block))
    }

    pub async fn allowances(&self, block: u64) -> Result<Vec<AllowanceQuery>> {
        let members = self.store.smembers(&keys::dirty_allowances(block)).await?;
        Ok(decode_all(&members, keys::decode_allowance, block))
    }

    /// Drops the sets of every block that fell out of the window after block
    /// `end` ended, starting after the last purged block. The highest purged
    /// block is persisted so a restart resumes from it. Without a record the
    /// first call drops the block just before the window and the window end.
    pub async fn purge(&self, end: u64) -> Result<()> {
        let Some(newest) = end.checked_sub(self.window) else {
            return Ok(());
        };
        let mut last_purged = self.last_purged.lock().await;
        if last_purged.is_none() {
            *last_purged = self.stored_purge_marker().await?;
        }
        let oldest = match *last_purged {
            Some(last) if last >= newest => return Ok(()),
            Some(last) => last + 1,
            None => newest.saturating_sub(1),
        };
        let mut from = oldest;
        while from <= newest {
            let to = newest.min(from.saturating_add(PURGE_CHUNK - 1));
            let keys = (from..=to)
                .flat_map(|block| [keys::dirty_balances(block), keys::dirty_allowances(block)])
                .collect::<Vec<_>>();
            self.store.delete(&keys).await?;
            self.store
                .set(&keys::dirty_purged(), to.to_string().into_bytes(), None)
                .await?;
            *last_purged = Some(to);
            from = to + 1;
        }
        tracing::trace!(oldest, newest, "purged dirty block sets");
        Ok(())
    }

    async fn stored_purge_marker(&self) -> Result<Option<u64>> {
        let Some(value) = self.store.get(&keys::dirty_purged()).await? else {
            return Ok(None);
        };
        let marker = std::str::from_utf8(&value)
            .ok()
            .and_then(|value| value.parse().ok());
        if marker.is_none() {
            tracing::warn!(len = value.len(), "malformed dirty purge marker");
        }
        Ok(marker)
    }
}

fn decode_all<T>(members: &[Vec<u8>], decode: fn(&[u8]) -> Option<T>, block: u64) -> Vec<T> {
    members
        .iter()
        .filter_map(|member| {
            let decoded = decode(member);
            if decoded.is_none() {
                tracing::warn!(block, len = member.len(), "malformed dirty set member");
            }
            decoded
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::cache_store::InMemoryCacheStore,
        maplit::hashset,
        std::collections::HashSet,
    };

    fn tracker(window: u64) -> (Arc<InMemoryCacheStore>, DirtyBlocks) {
        let store = Arc::new(InMemoryCacheStore::default());
        let dirty = DirtyBlocks::new(store.clone(), window, Duration::from_secs(3600));
        (store, dirty)
    }

    #[tokio::test]
    async fn marks_are_deduplicated_per_block() {
        let (_, dirty) = tracker(10);
        let owner = Address::repeat_byte(1);
        let token = Address::repeat_byte(2);
        dirty.mark_balance(5, owner, token).await.unwrap();
        dirty.mark_balance(5, owner, token).await.unwrap();
        dirty.mark_balance(6, owner, token).await.unwrap();
        let spender = Address::repeat_byte(3);
        dirty
            .mark_allowance(
                5,
                AllowanceQuery {
                    owner,
                    token,
                    spender,
                },
            )
            .await
            .unwrap();

        assert_eq!(
            dirty.balances(5).await.unwrap(),
            vec![BalanceQuery { owner, token }]
        );
        assert_eq!(dirty.allowances(5).await.unwrap().len(), 1);
        assert!(dirty.allowances(6).await.unwrap().is_empty());
    }

    async fn live_blocks(
        store: &InMemoryCacheStore,
        blocks: std::ops::RangeInclusive<u64>,
    ) -> HashSet<u64> {
        let mut live = HashSet::new();
        for block in blocks {
            if store.exists(&keys::dirty_balances(block)).await.unwrap() {
                live.insert(block);
            }
        }
        live
    }

    #[tokio::test]
    async fn purge_keeps_window() {
        let (store, dirty) = tracker(3);
        let owner = Address::repeat_byte(1);
        for block in 1..=10 {
            dirty.mark_balance(block, owner, owner).await.unwrap();
        }

        dirty.purge(8).await.unwrap();
        // The block at `end - window` and the one before it are gone.
        assert_eq!(
            live_blocks(&store, 1..=10).await,
            hashset! {1, 2, 3, 6, 7, 8, 9, 10}
        );

        dirty.purge(10).await.unwrap();
        assert_eq!(live_blocks(&store, 1..=10).await, hashset! {1, 2, 3, 8, 9, 10});

        // Going backwards after a fork does not purge again.
        dirty.purge(9).await.unwrap();
        assert_eq!(live_blocks(&store, 1..=10).await, hashset! {1, 2, 3, 8, 9, 10});
    }

    #[tokio::test]
    async fn purge_catches_up_after_a_gap() {
        let (store, dirty) = tracker(3);
        for block in 1..=30 {
            dirty.mark_balance(block, Address::ZERO, Address::ZERO).await.unwrap();
        }
        dirty.purge(8).await.unwrap();
        dirty.purge(30).await.unwrap();
        assert_eq!(live_blocks(&store, 1..=30).await, hashset! {1, 2, 3, 28, 29, 30});
    }

    #[tokio::test]
    async fn purge_resumes_after_restart() {
        let (store, dirty) = tracker(3);
        for block in 1..=30 {
            dirty.mark_balance(block, Address::ZERO, Address::ZERO).await.unwrap();
        }
        dirty.purge(8).await.unwrap();
        drop(dirty);

        let restarted = DirtyBlocks::new(store.clone(), 3, Duration::from_secs(3600));
        restarted.purge(30).await.unwrap();
        assert_eq!(live_blocks(&store, 1..=30).await, hashset! {1, 2, 3, 28, 29, 30});
        assert_eq!(
            store.get(&keys::dirty_purged()).await.unwrap(),
            Some(b"27".to_vec())
        );
    }

    #[tokio::test]
    async fn long_gaps_are_purged_in_chunks() {
        let (store, dirty) = tracker(3);
        for block in [4, 300, 600, 700] {
            dirty.mark_balance(block, Address::ZERO, Address::ZERO).await.unwrap();
        }
        dirty.purge(8).await.unwrap();
        dirty.purge(702).await.unwrap();
        assert_eq!(live_blocks(&store, 1..=702).await, hashset! {700});
    }

    #[tokio::test]
    async fn purge_before_window_is_full_is_a_noop() {
        let (store, dirty) = tracker(500);
        dirty
            .mark_balance(3, Address::ZERO, Address::ZERO)
            .await
            .unwrap();
        dirty.purge(100).await.unwrap();
        assert!(store.exists(&keys::dirty_balances(3)).await.unwrap());
    }

    #[tokio::test]
    async fn resynced_block_minus_window_minus_one_is_absent() {
        let window = 5;
        let (store, dirty) = tracker(window);
        for block in 0..=40 {
            dirty
                .mark_balance(block, Address::ZERO, Address::ZERO)
                .await
                .unwrap();
        }
        for end in [20, 21, 25, 40] {
            dirty.purge(end).await.unwrap();
            assert!(
                !store
                    .exists(&keys::dirty_balances(end - window - 1))
                    .await
                    .unwrap()
            );
            assert!(!store.exists(&keys::dirty_balances(end - window)).await.unwrap());
            assert!(
                store
                    .exists(&keys::dirty_balances(end - window + 1))
                    .await
                    .unwrap()
            );
        }
    }
}
