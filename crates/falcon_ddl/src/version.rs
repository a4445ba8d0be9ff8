//! Schema version propagation.
//!
//! Each node runs a [`SchemaVersionSyncer`]. It follows the store's schema
//! version, invokes the version-changed hook once per version in order, and
//! acknowledges the version it has loaded under its own node key. After
//! publishing a version, the owner waits (bounded by the sync lease) until
//! every live node has acknowledged it, so no node is ever more than one
//! state behind.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};

use falcon_common::error::FalconResult;
use falcon_common::types::{NodeId, SchemaVersion};

use crate::callback::DdlCallback;
use crate::meta::{KeyRange, MetaKey, MetaStore};
use crate::owner::now_millis;
use crate::txn::{MetaTxn, SchemaDiff};

/// A node's acknowledgement of the schema version it has loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeVersion {
    pub node_id: NodeId,
    pub version: SchemaVersion,
    pub updated_at_ms: u64,
}

struct Loaded {
    version: SchemaVersion,
    acked_at_ms: u64,
}

pub struct SchemaVersionSyncer {
    node_id: NodeId,
    store: Arc<dyn MetaStore>,
    callback: Arc<dyn DdlCallback>,
    node_ttl: Duration,
    loaded: Mutex<Loaded>,
    current: watch::Sender<SchemaVersion>,
}

impl SchemaVersionSyncer {
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn MetaStore>,
        callback: Arc<dyn DdlCallback>,
        node_ttl: Duration,
    ) -> Self {
        let (current, _) = watch::channel(SchemaVersion::ZERO);
        Self {
            node_id,
            store,
            callback,
            node_ttl,
            loaded: Mutex::new(Loaded {
                version: SchemaVersion::ZERO,
                acked_at_ms: 0,
            }),
            current,
        }
    }

    /// Version this node has loaded.
    pub fn current(&self) -> SchemaVersion {
        *self.current.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchemaVersion> {
        self.current.subscribe()
    }

    /// Catch up with the store: fire the version hook for every version
    /// between the loaded one and the latest, then acknowledge.
    pub async fn refresh(&self) -> FalconResult<SchemaVersion> {
        let mut loaded = self.loaded.lock().await;
        let latest = {
            let mut txn = MetaTxn::new(self.store.clone());
            txn.schema_version().await?
        };
        let now = now_millis();
        let heartbeat_due = now.saturating_sub(loaded.acked_at_ms) >= self.heartbeat_ms();
        if latest <= loaded.version && !heartbeat_due {
            return Ok(loaded.version);
        }

        let mut v = loaded.version;
        while v < latest {
            v = v.next();
            self.callback.on_schema_version_changed(v);
        }
        if latest > loaded.version {
            tracing::debug!(node = %self.node_id, from = %loaded.version, to = %latest, "schema version loaded");
            falcon_observability::record_schema_version(latest.0);
        }
        loaded.version = latest.max(loaded.version);
        self.current.send_replace(loaded.version);

        let mut txn = MetaTxn::new(self.store.clone());
        txn.put(
            MetaKey::NodeVersion(self.node_id),
            &NodeVersion {
                node_id: self.node_id,
                version: loaded.version,
                updated_at_ms: now,
            },
        )?;
        txn.commit().await?;
        loaded.acked_at_ms = now;
        Ok(loaded.version)
    }

    fn heartbeat_ms(&self) -> u64 {
        (self.node_ttl.as_millis() as u64 / 3).max(1)
    }

    /// Follow the store until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.store.subscribe();
        let heartbeat = Duration::from_millis(self.heartbeat_ms());
        loop {
            if let Err(e) = self.refresh().await {
                tracing::warn!(node = %self.node_id, error = %e, "schema version refresh failed");
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(heartbeat) => {}
            }
        }
        tracing::debug!(node = %self.node_id, "schema version syncer stopped");
    }

    /// Wait until every live node has acknowledged `version`, or `lease`
    /// elapses. Returns whether all live nodes caught up.
    pub async fn wait_synced(&self, version: SchemaVersion, lease: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + lease;
        let mut changes = self.store.subscribe();
        loop {
            match self.lagging_nodes(version).await {
                Ok(lagging) if lagging.is_empty() => return true,
                Ok(lagging) => {
                    tracing::debug!(version = %version, lagging = ?lagging, "waiting for schema sync");
                }
                Err(e) => tracing::warn!(error = %e, "schema sync check failed"),
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => {
                    tracing::warn!(version = %version, "schema sync lease elapsed before all nodes acknowledged");
                    return false;
                }
            }
        }
    }

    /// Live nodes whose acknowledged version is below `version`.
    pub async fn lagging_nodes(&self, version: SchemaVersion) -> FalconResult<Vec<NodeId>> {
        let now = now_millis();
        let ttl = self.node_ttl.as_millis() as u64;
        let acks = self.store.scan(KeyRange::NodeVersions).await?;
        let mut lagging = Vec::new();
        for (_, v) in acks {
            let ack: NodeVersion = serde_json::from_slice(&v.value)?;
            let live = now.saturating_sub(ack.updated_at_ms) <= ttl;
            if live && ack.version < version {
                lagging.push(ack.node_id);
            }
        }
        Ok(lagging)
    }

    /// Audit record of the change that produced `version`.
    pub async fn schema_diff(&self, version: SchemaVersion) -> FalconResult<Option<SchemaDiff>> {
        MetaTxn::new(self.store.clone()).get_schema_diff(version).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::BaseCallback;
    use crate::job::{ActionType, Job, JobArgs};
    use crate::meta::MemMetaStore;
    use falcon_common::types::{JobId, SchemaId, TableId};
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct Recording(SyncMutex<Vec<SchemaVersion>>);

    impl DdlCallback for Recording {
        fn on_schema_version_changed(&self, version: SchemaVersion) {
            self.0.lock().push(version);
        }
    }

    async fn bump(store: &Arc<dyn MetaStore>, n: usize) {
        let job = Job::new(JobId(1), ActionType::DropTable, SchemaId(1), TableId(2), JobArgs::DropTable);
        for _ in 0..n {
            let mut txn = MetaTxn::new(store.clone());
            txn.bump_schema_version(SchemaDiff::for_job(&job)).await.unwrap();
            txn.commit().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_refresh_fires_once_per_version_in_order() {
        let store: Arc<dyn MetaStore> = Arc::new(MemMetaStore::new());
        let rec = Arc::new(Recording::default());
        let syncer = SchemaVersionSyncer::new(NodeId(1), store.clone(), rec.clone(), Duration::from_secs(10));

        bump(&store, 3).await;
        assert_eq!(syncer.refresh().await.unwrap(), SchemaVersion(3));
        bump(&store, 1).await;
        syncer.refresh().await.unwrap();
        syncer.refresh().await.unwrap();

        assert_eq!(
            *rec.0.lock(),
            vec![SchemaVersion(1), SchemaVersion(2), SchemaVersion(3), SchemaVersion(4)]
        );
        assert_eq!(syncer.current(), SchemaVersion(4));
    }

    #[tokio::test]
    async fn test_wait_synced_tracks_lagging_nodes() {
        let store: Arc<dyn MetaStore> = Arc::new(MemMetaStore::new());
        let a = SchemaVersionSyncer::new(NodeId(1), store.clone(), Arc::new(BaseCallback), Duration::from_secs(10));
        let b = Arc::new(SchemaVersionSyncer::new(NodeId(2), store.clone(), Arc::new(BaseCallback), Duration::from_secs(10)));
        a.refresh().await.unwrap();
        b.refresh().await.unwrap();

        bump(&store, 1).await;
        a.refresh().await.unwrap();
        assert_eq!(a.lagging_nodes(SchemaVersion(1)).await.unwrap(), vec![NodeId(2)]);
        assert!(!a.wait_synced(SchemaVersion(1), Duration::from_millis(30)).await);

        let (_tx, rx) = watch::channel(false);
        let runner = tokio::spawn(b.clone().run(rx));
        assert!(a.wait_synced(SchemaVersion(1), Duration::from_secs(2)).await);
        runner.abort();
    }
}
