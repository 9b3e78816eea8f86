//! In-process [`SharedStore`] backed by a sharded map and a broadcast
//! channel.
//!
//! Serves single-instance deployments and tests. Expiry is lazy: an expired
//! key is dropped the next time anything touches it. Timestamps use
//! `tokio::time::Instant` so paused-clock tests can drive TTLs.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{BrokerMessage, BrokerSubscription, SharedStore};
use crate::errors::{Result, StoreError};

const DEFAULT_CHANNEL_CAPACITY: usize = 4_096;

enum Data {
    Str(String),
    Set(HashSet<String>),
    List(VecDeque<String>),
}

struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(data: Data, ttl: Option<Duration>) -> Self {
        Self {
            data,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory broker + KV store.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    tx: broadcast::Sender<BrokerMessage>,
    offline: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create an empty store whose broker buffers up to `capacity` messages
    /// per slow receiver.
    pub fn with_channel_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: DashMap::new(),
            tx,
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate an unreachable store: every operation fails until reset.
    #[cfg(any(test, feature = "test-util"))]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn purge_if_expired(&self, key: &str) {
        let now = Instant::now();
        let _ = self.entries.remove_if(key, |_, e| e.is_expired(now));
    }

    /// Prepare a key for an operation: fail when offline, drop it if expired.
    fn touch(&self, key: &str) -> Result<()> {
        self.check_online()?;
        self.purge_if_expired(key);
        Ok(())
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.touch(key)?;
        match self.entries.get(key).as_deref() {
            None => Ok(None),
            Some(Entry {
                data: Data::Str(s), ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check_online()?;
        let _ = self
            .entries
            .insert(key.to_owned(), Entry::new(Data::Str(value.to_owned()), ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.touch(key)?;
        Ok(self.entries.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.touch(key)?;
        Ok(match self.entries.get_mut(key) {
            Some(mut e) => {
                e.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        })
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        self.touch(key)?;
        match self.entries.entry(key.to_owned()) {
            MapEntry::Vacant(v) => {
                let _ = v.insert(Entry::new(Data::Str("1".into()), Some(ttl)));
                Ok(1)
            }
            MapEntry::Occupied(mut o) => {
                let Data::Str(s) = &mut o.get_mut().data else {
                    return Err(StoreError::WrongType(key.to_owned()));
                };
                let n = s
                    .parse::<i64>()
                    .map_err(|_| StoreError::WrongType(key.to_owned()))?
                    + 1;
                *s = n.to_string();
                Ok(n)
            }
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.touch(key)?;
        let mut entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(Data::Set(HashSet::new()), None));
        match &mut entry.data {
            Data::Set(set) => Ok(set.insert(member.to_owned())),
            _ => Err(StoreError::WrongType(key.to_owned())),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.touch(key)?;
        let (removed, now_empty) = match self.entries.get_mut(key) {
            None => return Ok(false),
            Some(mut entry) => match &mut entry.data {
                Data::Set(set) => (set.remove(member), set.is_empty()),
                _ => return Err(StoreError::WrongType(key.to_owned())),
            },
        };
        if now_empty {
            // Redis drops empty sets.
            let _ = self
                .entries
                .remove_if(key, |_, e| matches!(&e.data, Data::Set(s) if s.is_empty()));
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.touch(key)?;
        match self.entries.get(key).as_deref() {
            None => Ok(Vec::new()),
            Some(Entry {
                data: Data::Set(set),
                ..
            }) => {
                let mut members: Vec<String> = set.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
        }
    }

    async fn lpush_capped(&self, key: &str, value: &str, cap: usize) -> Result<()> {
        self.touch(key)?;
        let mut entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(Data::List(VecDeque::new()), None));
        match &mut entry.data {
            Data::List(list) => {
                list.push_front(value.to_owned());
                list.truncate(cap);
                Ok(())
            }
            _ => Err(StoreError::WrongType(key.to_owned())),
        }
    }

    async fn lrange(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        self.touch(key)?;
        match self.entries.get(key).as_deref() {
            None => Ok(Vec::new()),
            Some(Entry {
                data: Data::List(list),
                ..
            }) => Ok(list.iter().take(limit).cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        self.check_online()?;
        let msg = BrokerMessage {
            channel: channel.to_owned(),
            payload: payload.to_owned(),
        };
        // No receivers is not an error for pub/sub.
        Ok(self.tx.send(msg).unwrap_or(0))
    }

    fn psubscribe(&self, prefix: &str) -> BrokerSubscription {
        BrokerSubscription::new(prefix, self.tx.subscribe())
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
