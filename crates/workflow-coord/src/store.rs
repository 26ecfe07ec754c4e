//! The [`CoordStore`] contract: typed-ish key/value access, optimistic
//! multi-key transactions, lease grants, and a distributed FIFO queue.
//!
//! The object-safe [`CoordBackend`] trait carries the primitives a
//! concrete backend (etcd, or an in-memory fake) must provide.
//! [`CoordStore`] is a thin, `Clone`-able handle around `Arc<dyn
//! CoordBackend>` that layers the generic [`CoordStore::stm`] helper on
//! top, since a generic method can't live on a trait object.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CoordError;

/// Opaque lease identifier returned by [`CoordBackend::lease_grant`].
pub type LeaseId = i64;

/// A stored value together with the backend revision it was last written
/// at. The revision is the basis for optimistic-concurrency STM commits.
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub value: Vec<u8>,
    pub revision: i64,
}

/// Primitive, object-safe operations a coordination backend must provide.
#[async_trait]
pub trait CoordBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, CoordError>;
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, KvEntry)>, CoordError>;
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<(), CoordError>;
    async fn delete(&self, key: &str) -> Result<(), CoordError>;
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CoordError>;

    /// Compare-and-swap a read-set against writes. `reads` is the set of
    /// keys an STM attempt observed, together with the revision at which
    /// it observed them (as returned by [`Self::get`]/[`Self::get_prefix`]
    /// through the view). Returns `Ok(true)` if every read key's revision
    /// still matched at commit time and the writes were applied,
    /// `Ok(false)` if any read key had moved (the caller should retry).
    async fn txn_cas(
        &self,
        reads: &[(String, i64)],
        writes: &[(String, Vec<u8>)],
    ) -> Result<bool, CoordError>;

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, CoordError>;

    /// Stream of keepalive acknowledgements for a granted lease. The
    /// stream ends (or yields an `Err`) when the keepalive channel is
    /// lost, at which point the lease will expire on its own TTL.
    async fn lease_keep_alive(
        &self,
        lease: LeaseId,
    ) -> Result<BoxStream<'static, Result<(), CoordError>>, CoordError>;

    async fn enqueue(&self, prefix: &str, value: Vec<u8>) -> Result<(), CoordError>;

    /// Block until a value is available under `prefix` and pop it in FIFO
    /// order.
    async fn dequeue(&self, prefix: &str) -> Result<Vec<u8>, CoordError>;
}

/// Accumulates the read-set and write-set of one STM attempt.
///
/// Handed to the closure passed to [`CoordStore::stm`]; reads and writes
/// made through it are buffered in memory and committed atomically (or
/// discarded and retried) when the closure returns.
pub struct StmView<'a> {
    backend: &'a dyn CoordBackend,
    reads: HashMap<String, i64>,
    writes: HashMap<String, Vec<u8>>,
}

impl<'a> StmView<'a> {
    fn new(backend: &'a dyn CoordBackend) -> Self {
        Self {
            backend,
            reads: HashMap::new(),
            writes: HashMap::new(),
        }
    }

    /// Read a key, recording its revision in the read-set. A key already
    /// written within this attempt is served from the local write-set
    /// without touching the backend.
    pub async fn get<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, CoordError> {
        if let Some(raw) = self.writes.get(key) {
            return decode(key, raw);
        }
        match self.backend.get(key).await? {
            Some(entry) => {
                self.reads.insert(key.to_owned(), entry.revision);
                decode(key, &entry.value)
            }
            None => {
                // Absence is also a fact worth protecting: record revision
                // 0 so a concurrent create of this key aborts the commit.
                self.reads.entry(key.to_owned()).or_insert(0);
                Ok(None)
            }
        }
    }

    /// Scan a prefix, recording every observed key's revision in the
    /// read-set.
    pub async fn get_prefix<T: DeserializeOwned>(
        &mut self,
        prefix: &str,
    ) -> Result<Vec<(String, T)>, CoordError> {
        let rows = self.backend.get_prefix(prefix).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, entry) in rows {
            self.reads.insert(key.clone(), entry.revision);
            if let Some(value) = decode(&key, &entry.value)? {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    /// Stage a write. Not visible to the backend (or other STM attempts)
    /// until the whole closure commits.
    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), CoordError> {
        let raw = serde_json::to_vec(value).map_err(|source| CoordError::Decode {
            key: key.to_owned(),
            source,
        })?;
        self.writes.insert(key.to_owned(), raw);
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: &[u8]) -> Result<Option<T>, CoordError> {
    serde_json::from_slice(raw)
        .map(Some)
        .map_err(|source| CoordError::Decode {
            key: key.to_owned(),
            source,
        })
}

/// Handle to a distributed FIFO queue rooted at a key prefix.
#[derive(Clone)]
pub struct Queue {
    backend: Arc<dyn CoordBackend>,
    prefix: String,
}

impl Queue {
    pub async fn enqueue<T: Serialize>(&self, value: &T) -> Result<(), CoordError> {
        let raw = serde_json::to_vec(value).map_err(|source| CoordError::Decode {
            key: self.prefix.clone(),
            source,
        })?;
        self.backend.enqueue(&self.prefix, raw).await
    }

    /// Block until a value is available and return it, FIFO.
    pub async fn dequeue<T: DeserializeOwned>(&self) -> Result<T, CoordError> {
        let raw = self.backend.dequeue(&self.prefix).await?;
        decode(&self.prefix, &raw)?.ok_or_else(|| CoordError::QueueClosed(self.prefix.clone()))
    }
}

/// Stream of keepalive acknowledgements; yields `()` on every successful
/// renewal and ends (or errors) when the lease can no longer be renewed.
pub type KeepAliveStream = BoxStream<'static, Result<(), CoordError>>;

/// High-level coordination-store handle. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct CoordStore {
    backend: Arc<dyn CoordBackend>,
    stm_retry_limit: u32,
    stm_retry_backoff: Duration,
}

impl CoordStore {
    pub fn new(backend: Arc<dyn CoordBackend>) -> Self {
        Self {
            backend,
            stm_retry_limit: 5,
            stm_retry_backoff: Duration::from_millis(20),
        }
    }

    pub fn with_retry_policy(mut self, limit: u32, backoff: Duration) -> Self {
        self.stm_retry_limit = limit;
        self.stm_retry_backoff = backoff;
        self
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CoordError> {
        match self.backend.get(key).await? {
            Some(entry) => decode(key, &entry.value),
            None => Ok(None),
        }
    }

    pub async fn get_prefix<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, T)>, CoordError> {
        let rows = self.backend.get_prefix(prefix).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, entry) in rows {
            if let Some(value) = decode(&key, &entry.value)? {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        lease: Option<LeaseId>,
    ) -> Result<(), CoordError> {
        let raw = serde_json::to_vec(value).map_err(|source| CoordError::Decode {
            key: key.to_owned(),
            source,
        })?;
        self.backend.put(key, raw, lease).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), CoordError> {
        self.backend.delete(key).await
    }

    pub async fn delete_prefix(&self, prefix: &str) -> Result<u64, CoordError> {
        self.backend.delete_prefix(prefix).await
    }

    pub async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, CoordError> {
        self.backend.lease_grant(ttl).await
    }

    pub async fn lease_keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, CoordError> {
        self.backend.lease_keep_alive(lease).await
    }

    pub fn queue(&self, prefix: impl Into<String>) -> Queue {
        Queue {
            backend: Arc::clone(&self.backend),
            prefix: prefix.into(),
        }
    }

    /// Execute `f` against a transactional view, retrying on conflict.
    ///
    /// `f` reads and writes keys through the [`StmView`] it is handed; the
    /// final write-set is committed in one linearizable transaction
    /// conditioned on every read key's revision being unchanged. On
    /// conflict the whole closure is re-run (so it must be idempotent
    /// with respect to re-execution) up to `stm_retry_limit` times.
    pub async fn stm<F, Fut, T>(&self, f: F) -> Result<T, CoordError>
    where
        F: Fn(&mut StmView<'_>) -> Fut,
        Fut: Future<Output = Result<T, CoordError>>,
    {
        let mut attempt = 0u32;
        loop {
            let mut view = StmView::new(self.backend.as_ref());
            let result = f(&mut view).await?;

            let reads: Vec<(String, i64)> =
                view.reads.iter().map(|(k, v)| (k.clone(), *v)).collect();
            let writes: Vec<(String, Vec<u8>)> =
                view.writes.into_iter().collect::<Vec<_>>();

            if writes.is_empty() {
                // Read-only transaction: nothing to commit, no conflict
                // possible.
                return Ok(result);
            }

            let committed = self.backend.txn_cas(&reads, &writes).await?;
            if committed {
                return Ok(result);
            }

            attempt += 1;
            if attempt >= self.stm_retry_limit {
                return Err(CoordError::Conflict { attempts: attempt });
            }
            tokio::time::sleep(self.stm_retry_backoff * attempt).await;
        }
    }
}

/// Convenience alias used by callers that only need to name the boxed
/// future type for `stm` closures written as plain `async move` blocks.
pub type StmFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CoordError>> + Send + 'a>>;
