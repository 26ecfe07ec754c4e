//! Agent-side lease-backed registration loop (spec §4.7).
//!
//! For each project an agent serves, a dedicated task grants a lease,
//! publishes `ClientInfo` at `/register/{project_id}/{ip}` tagged with
//! that lease, and keeps it alive. Losing the keepalive stream re-grants
//! a fresh lease and retries after a short delay; the old key simply
//! expires, so other replicas observe the departure without an explicit
//! deregister.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use workflow_coord::{CoordStore, KeySchema};

use crate::model::ClientInfo;

const LEASE_TTL: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Run the registration loop for one `project_id` until `cancel` fires.
/// Never returns otherwise.
pub async fn run_registrar(
    coord: CoordStore,
    schema: KeySchema,
    project_id: i64,
    mut client: ClientInfo,
    cancel: CancellationToken,
) {
    client.project_id = project_id;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let lease = match coord.lease_grant(LEASE_TTL).await {
            Ok(lease) => lease,
            Err(error) => {
                tracing::warn!(project_id, %error, "lease grant failed, retrying");
                if sleep_or_cancelled(&cancel).await {
                    return;
                }
                continue;
            }
        };

        let key = schema.register(project_id, &client.ip);
        let mut info = client.clone();
        info.registered_at = Utc::now().timestamp();
        if let Err(error) = coord.put(&key, &info, Some(lease)).await {
            tracing::warn!(project_id, %error, "failed to publish agent presence, retrying");
            if sleep_or_cancelled(&cancel).await {
                return;
            }
            continue;
        }

        let mut keepalive = match coord.lease_keep_alive(lease).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(project_id, %error, "keepalive start failed, retrying");
                if sleep_or_cancelled(&cancel).await {
                    return;
                }
                continue;
            }
        };

        tracing::info!(project_id, ip = %client.ip, "agent registered");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(project_id, "registrar cancelled, presence will expire via lease TTL");
                    return;
                }
                ack = keepalive.next() => {
                    match ack {
                        Some(Ok(())) => continue,
                        Some(Err(error)) => {
                            tracing::warn!(project_id, %error, "keepalive ack lost, re-registering");
                            break;
                        }
                        None => {
                            tracing::warn!(project_id, "keepalive stream closed, re-registering");
                            break;
                        }
                    }
                }
            }
        }

        if sleep_or_cancelled(&cancel).await {
            return;
        }
    }
}

/// Sleep `RETRY_DELAY`, returning early (with `true`) if cancelled
/// mid-sleep.
async fn sleep_or_cancelled(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(RETRY_DELAY) => false,
        _ = cancel.cancelled() => true,
    }
}

/// Tracks one registrar task per project an agent currently serves, each
/// independently cancellable via [`RegistrarSet::remove_project`].
pub struct RegistrarSet {
    coord: CoordStore,
    schema: KeySchema,
    client: ClientInfo,
    handles: DashMap<i64, (CancellationToken, JoinHandle<()>)>,
}

impl RegistrarSet {
    pub fn new(coord: CoordStore, schema: KeySchema, client: ClientInfo) -> Self {
        Self {
            coord,
            schema,
            client,
            handles: DashMap::new(),
        }
    }

    /// Start a registrar for `project_id`, a no-op if one is already
    /// running.
    pub fn add_project(&self, project_id: i64) {
        if self.handles.contains_key(&project_id) {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_registrar(
            self.coord.clone(),
            self.schema.clone(),
            project_id,
            self.client.clone(),
            cancel.clone(),
        ));
        self.handles.insert(project_id, (cancel, handle));
    }

    /// External "remove project" signal (spec §4.7): cancel the
    /// keepalive loop and let the lease expire naturally.
    pub fn remove_project(&self, project_id: i64) {
        if let Some((_, (cancel, _handle))) = self.handles.remove(&project_id) {
            cancel.cancel();
        }
    }

    pub fn active_projects(&self) -> Vec<i64> {
        self.handles.iter().map(|e| *e.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_coord::InMemoryCoordStore;

    fn client() -> ClientInfo {
        ClientInfo {
            project_id: 0,
            ip: "10.0.0.1".to_owned(),
            hostname: "agent-1".to_owned(),
            registered_at: 0,
            capabilities: vec!["rust".to_owned()],
        }
    }

    #[tokio::test]
    async fn registrar_publishes_client_info_under_lease() {
        let coord = CoordStore::new(InMemoryCoordStore::new());
        let schema = KeySchema::new("/workflow");
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_registrar(
            coord.clone(),
            schema.clone(),
            7,
            client(),
            cancel.clone(),
        ));

        // Give the registrar a tick to publish before cancelling.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let _ = handle.await;

        let key = schema.register(7, "10.0.0.1");
        let stored: Option<ClientInfo> = coord.get(&key).await.unwrap();
        assert!(stored.is_some());
        assert_eq!(stored.unwrap().project_id, 7);
    }

    #[tokio::test]
    async fn remove_project_cancels_its_registrar() {
        let coord = CoordStore::new(InMemoryCoordStore::new());
        let schema = KeySchema::new("/workflow");
        let set = RegistrarSet::new(coord, schema, client());

        set.add_project(1);
        assert_eq!(set.active_projects(), vec![1]);
        set.remove_project(1);
        assert!(set.active_projects().is_empty());
    }
}
