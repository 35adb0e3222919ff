//! Key value store used as the cache-aside layer in front of the chain.
//!
//! The operations mirror the subset of a redis-like store the relay needs:
//! plain values, hashes and sets, each with an optional expiry on the key.
//! The store is advisory. Anything read from it may be gone on the next call.

use {
    anyhow::{Result, anyhow},
    std::{
        collections::{HashMap, HashSet, hash_map::Entry},
        sync::Mutex,
        time::Duration,
    },
    tokio::time::Instant,
};

#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<()>;

    async fn hget_all(&self, key: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Returns one entry per requested field in the same order.
    async fn hmget(&self, key: &str, fields: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Merges the entries into the hash. A `ttl` applies to the whole key.
    async fn hmset(
        &self,
        key: &str,
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> Result<()>;

    async fn sadd(&self, key: &str, members: Vec<Vec<u8>>, ttl: Option<Duration>) -> Result<()>;

    async fn smembers(&self, key: &str) -> Result<Vec<Vec<u8>>>;
}

enum Value {
    Bytes(Vec<u8>),
    Hash(HashMap<Vec<u8>, Vec<u8>>),
    Set(HashSet<Vec<u8>>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "string",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
        }
    }
}

struct Item {
    value: Value,
    expires_at: Option<Instant>,
}

impl Item {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Process local [`CacheStore`]. Expired keys are dropped lazily when they
/// get accessed.
#[derive(Default)]
pub struct InMemoryCacheStore {
    items: Mutex<HashMap<String, Item>>,
}

impl InMemoryCacheStore {
    fn with_live<T>(&self, key: &str, f: impl FnOnce(Option<&Value>) -> Result<T>) -> Result<T> {
        let mut items = self.items.lock().unwrap();
        if items
            .get(key)
            .is_some_and(|item| item.is_expired(Instant::now()))
        {
            items.remove(key);
        }
        f(items.get(key).map(|item| &item.value))
    }

    /// Gets the live value stored at `key` or creates it with `default`.
    fn upsert(
        &self,
        key: &str,
        ttl: Option<Duration>,
        default: impl FnOnce() -> Value,
        f: impl FnOnce(&mut Value) -> Result<()>,
    ) -> Result<()> {
        let now = Instant::now();
        let mut items = self.items.lock().unwrap();
        let item = match items.entry(key.to_string()) {
            Entry::Occupied(entry) if entry.get().is_expired(now) => {
                let item = entry.into_mut();
                *item = Item {
                    value: default(),
                    expires_at: None,
                };
                item
            }
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(Item {
                value: default(),
                expires_at: None,
            }),
        };
        f(&mut item.value)?;
        if let Some(ttl) = ttl {
            item.expires_at = Some(now + ttl);
        }
        Ok(())
    }
}

fn wrong_type(key: &str, value: &Value) -> anyhow::Error {
    anyhow!("key {key} holds a {} value", value.kind())
}

#[async_trait::async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        self.with_live(key, |value| Ok(value.is_some()))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_live(key, |value| match value {
            None => Ok(None),
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(other) => Err(wrong_type(key, other)),
        })
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut items = self.items.lock().unwrap();
        items.insert(
            key.to_string(),
            Item {
                value: Value::Bytes(value),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut items = self.items.lock().unwrap();
        for key in keys {
            items.remove(key);
        }
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.with_live(key, |value| match value {
            None => Ok(Vec::new()),
            Some(Value::Hash(hash)) => Ok(hash
                .iter()
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect()),
            Some(other) => Err(wrong_type(key, other)),
        })
    }

    async fn hmget(&self, key: &str, fields: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        self.with_live(key, |value| match value {
            None => Ok(vec![None; fields.len()]),
            Some(Value::Hash(hash)) => Ok(fields
                .iter()
                .map(|field| hash.get(field).cloned())
                .collect()),
            Some(other) => Err(wrong_type(key, other)),
        })
    }

    async fn hmset(
        &self,
        key: &str,
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.upsert(
            key,
            ttl,
            || Value::Hash(Default::default()),
            |value| match value {
                Value::Hash(hash) => {
                    hash.extend(entries);
                    Ok(())
                }
                other => Err(wrong_type(key, other)),
            },
        )
    }

    async fn sadd(&self, key: &str, members: Vec<Vec<u8>>, ttl: Option<Duration>) -> Result<()> {
        self.upsert(
            key,
            ttl,
            || Value::Set(Default::default()),
            |value| match value {
                Value::Set(set) => {
                    set.extend(members);
                    Ok(())
                }
                other => Err(wrong_type(key, other)),
            },
        )
    }

    async fn smembers(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        self.with_live(key, |value| match value {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(other) => Err(wrong_type(key, other)),
        })
    }
}
