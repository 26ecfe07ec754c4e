//! [`CoordBackend`] implementation over a live etcd cluster via
//! `etcd-client`.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp, TxnOpResponse,
};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::Mutex;

use crate::error::CoordError;
use crate::store::{CoordBackend, KvEntry, LeaseId};

/// Namespaces every key under `namespace` before it reaches etcd, the way
/// `EtcdClient::new(namespace, client)` namespaces cluster-state keys.
pub struct EtcdCoordStore {
    client: Mutex<Client>,
}

impl EtcdCoordStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self, CoordError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|err| CoordError::Unavailable(err.to_string()))?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

#[async_trait]
impl CoordBackend for EtcdCoordStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, CoordError> {
        let mut client = self.client.lock().await;
        let resp = client
            .get(key, None)
            .await
            .map_err(|err| CoordError::Backend(err.to_string()))?;
        Ok(resp.kvs().first().map(|kv| KvEntry {
            value: kv.value().to_vec(),
            revision: kv.mod_revision(),
        }))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, KvEntry)>, CoordError> {
        let mut client = self.client.lock().await;
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|err| CoordError::Backend(err.to_string()))?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).into_owned(),
                    KvEntry {
                        value: kv.value().to_vec(),
                        revision: kv.mod_revision(),
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
        let mut client = self.client.lock().await;
        let opts = lease.map(|id| PutOptions::new().with_lease(id));
        client
            .put(key, value, opts)
            .await
            .map_err(|err| CoordError::Backend(err.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoordError> {
        let mut client = self.client.lock().await;
        client
            .delete(key, None)
            .await
            .map_err(|err| CoordError::Backend(err.to_string()))?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CoordError> {
        let mut client = self.client.lock().await;
        let resp = client
            .delete(prefix, Some(etcd_client::DeleteOptions::new().with_prefix()))
            .await
            .map_err(|err| CoordError::Backend(err.to_string()))?;
        Ok(resp.deleted() as u64)
    }

    async fn txn_cas(
        &self,
        reads: &[(String, i64)],
        writes: &[(String, Vec<u8>)],
    ) -> Result<bool, CoordError> {
        let compares: Vec<Compare> = reads
            .iter()
            .map(|(key, revision)| {
                Compare::mod_revision(key.clone(), CompareOp::Equal, *revision)
            })
            .collect();
        let puts: Vec<TxnOp> = writes
            .iter()
            .map(|(key, value)| TxnOp::put(key.clone(), value.clone(), None))
            .collect();

        let mut client = self.client.lock().await;
        let resp = client
            .txn(Txn::new().when(compares).and_then(puts))
            .await
            .map_err(|err| CoordError::Backend(err.to_string()))?;
        Ok(resp.succeeded())
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, CoordError> {
        let mut client = self.client.lock().await;
        let resp = client
            .lease_grant(ttl.as_secs() as i64, None)
            .await
            .map_err(|err| CoordError::Backend(err.to_string()))?;
        Ok(resp.id())
    }

    async fn lease_keep_alive(
        &self,
        lease: LeaseId,
    ) -> Result<BoxStream<'static, Result<(), CoordError>>, CoordError> {
        let mut client = self.client.lock().await;
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease)
            .await
            .map_err(|err| CoordError::Backend(err.to_string()))?;
        drop(client);

        let ticks = async_stream::stream! {
            loop {
                if keeper.keep_alive().await.is_err() {
                    yield Err(CoordError::LeaseExpired(lease));
                    break;
                }
                match stream.message().await {
                    Ok(Some(_)) => yield Ok(()),
                    Ok(None) | Err(_) => {
                        yield Err(CoordError::LeaseExpired(lease));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(ticks))
    }

    async fn enqueue(&self, prefix: &str, value: Vec<u8>) -> Result<(), CoordError> {
        // A lease-free, monotonically increasing key under `prefix` gives
        // FIFO order for free from etcd's own key ordering.
        let mut client = self.client.lock().await;
        let seq = client
            .get(prefix, Some(GetOptions::new().with_prefix().with_count_only()))
            .await
            .map_err(|err| CoordError::Backend(err.to_string()))?
            .count();
        let key = format!("{prefix}{seq:020}");
        client
            .put(key, value, None)
            .await
            .map_err(|err| CoordError::Backend(err.to_string()))?;
        Ok(())
    }

    async fn dequeue(&self, prefix: &str) -> Result<Vec<u8>, CoordError> {
        loop {
            let front = {
                let mut client = self.client.lock().await;
                client
                    .get(
                        prefix,
                        Some(GetOptions::new().with_prefix().with_sort(
                            etcd_client::SortTarget::Key,
                            etcd_client::SortOrder::Ascend,
                        )),
                    )
                    .await
                    .map_err(|err| CoordError::Backend(err.to_string()))?
                    .kvs()
                    .first()
                    .map(|kv| (kv.key().to_vec(), kv.value().to_vec()))
            };
            match front {
                Some((key, value)) => {
                    let mut client = self.client.lock().await;
                    let taken = client
                        .txn(Txn::new().when(vec![]).and_then(vec![
                            TxnOp::delete(key.clone(), None),
                        ]))
                        .await
                        .map_err(|err| CoordError::Backend(err.to_string()))?;
                    if taken
                        .op_responses()
                        .into_iter()
                        .any(|r| matches!(r, TxnOpResponse::Delete(d) if d.deleted() > 0))
                    {
                        return Ok(value);
                    }
                }
                None => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }
}
