//! In-process [`CoordBackend`] fake backed by a `Mutex`-guarded map.
//!
//! Used by `workflow-core`'s own test suite (see its `dag`, `readiness`,
//! and `planstate` unit tests) and by downstream integrators who want to
//! exercise scheduling logic without a live etcd cluster.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{Mutex, Notify};

use crate::error::CoordError;
use crate::store::{CoordBackend, KvEntry, LeaseId};

#[derive(Default)]
struct Inner {
    kv: BTreeMap<String, (Vec<u8>, i64)>,
    leased_keys: HashMap<LeaseId, Vec<String>>,
    queues: HashMap<String, VecDeque<Vec<u8>>>,
}

/// An in-memory stand-in for an etcd cluster. Leases are advisory: nothing
/// expires them on a timer (there is no wall clock to race against in
/// tests), but [`InMemoryCoordStore::expire_lease`] lets a test simulate
/// expiry deterministically.
pub struct InMemoryCoordStore {
    inner: Mutex<Inner>,
    revision: AtomicI64,
    next_lease: AtomicI64,
    queue_notify: Notify,
}

impl InMemoryCoordStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            revision: AtomicI64::new(1),
            next_lease: AtomicI64::new(1),
            queue_notify: Notify::new(),
        })
    }

    fn next_revision(&self) -> i64 {
        self.revision.fetch_add(1, Ordering::SeqCst)
    }

    /// Simulate lease expiry: deletes every key tagged with `lease` and
    /// forgets it. Intended for tests of recovery paths.
    pub async fn expire_lease(&self, lease: LeaseId) {
        let mut inner = self.inner.lock().await;
        if let Some(keys) = inner.leased_keys.remove(&lease) {
            for key in keys {
                inner.kv.remove(&key);
            }
        }
    }
}

impl Default for Arc<InMemoryCoordStore> {
    fn default() -> Self {
        InMemoryCoordStore::new()
    }
}

#[async_trait]
impl CoordBackend for InMemoryCoordStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, CoordError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .kv
            .get(key)
            .map(|(value, revision)| KvEntry {
                value: value.clone(),
                revision: *revision,
            }))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, KvEntry)>, CoordError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .kv
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (value, revision))| {
                (
                    k.clone(),
                    KvEntry {
                        value: value.clone(),
                        revision: *revision,
                    },
                )
            })
            .collect())
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<(), CoordError> {
        let revision = self.next_revision();
        let mut inner = self.inner.lock().await;
        inner.kv.insert(key.to_owned(), (value, revision));
        if let Some(lease) = lease {
            inner
                .leased_keys
                .entry(lease)
                .or_default()
                .push(key.to_owned());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoordError> {
        let mut inner = self.inner.lock().await;
        inner.kv.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CoordError> {
        let mut inner = self.inner.lock().await;
        let keys: Vec<String> = inner
            .kv
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            inner.kv.remove(key);
        }
        Ok(keys.len() as u64)
    }

    async fn txn_cas(
        &self,
        reads: &[(String, i64)],
        writes: &[(String, Vec<u8>)],
    ) -> Result<bool, CoordError> {
        let mut inner = self.inner.lock().await;
        for (key, expected_rev) in reads {
            let actual_rev = inner.kv.get(key).map(|(_, rev)| *rev).unwrap_or(0);
            if actual_rev != *expected_rev {
                return Ok(false);
            }
        }
        drop(inner);
        for (key, value) in writes {
            let revision = self.next_revision();
            let mut inner = self.inner.lock().await;
            inner.kv.insert(key.clone(), (value.clone(), revision));
        }
        Ok(true)
    }

    async fn lease_grant(&self, _ttl: Duration) -> Result<LeaseId, CoordError> {
        Ok(self.next_lease.fetch_add(1, Ordering::SeqCst))
    }

    async fn lease_keep_alive(
        &self,
        _lease: LeaseId,
    ) -> Result<BoxStream<'static, Result<(), CoordError>>, CoordError> {
        // The in-memory fake never fails a keepalive on its own; it acks
        // forever until the handle is dropped.
        Ok(stream::repeat(Ok(())).boxed())
    }

    async fn enqueue(&self, prefix: &str, value: Vec<u8>) -> Result<(), CoordError> {
        let mut inner = self.inner.lock().await;
        inner
            .queues
            .entry(prefix.to_owned())
            .or_default()
            .push_back(value);
        drop(inner);
        self.queue_notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, prefix: &str) -> Result<Vec<u8>, CoordError> {
        loop {
            // Register as a waiter before checking the queue, not after --
            // otherwise an enqueue's notify_waiters() landing between the
            // unlock below and the await could be missed.
            let notified = self.queue_notify.notified();
            {
                let mut inner = self.inner.lock().await;
                if let Some(queue) = inner.queues.get_mut(prefix) {
                    if let Some(value) = queue.pop_front() {
                        return Ok(value);
                    }
                }
            }
            notified.await;
        }
    }
}
