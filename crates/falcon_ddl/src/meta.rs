//! Versioned metadata store.
//!
//! Every key carries the revision of the commit that last wrote it. A
//! [`WriteBatch`] names the revisions its transaction observed; the store
//! applies the batch only if none of them moved, so two transactions that
//! read-modify-write the same key can never both commit.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use falcon_common::error::MetaError;
use falcon_common::types::{JobId, NodeId, SchemaId, SchemaVersion, TableId};

/// Logical key in the metadata keyspace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetaKey {
    /// Fencing record: changes only when ownership moves to another term.
    OwnerTerm,
    /// Lease record: rewritten on every renewal.
    OwnerLease,
    SchemaVersion,
    GlobalId,
    Database(SchemaId),
    Table(SchemaId, TableId),
    Job(JobId),
    History(JobId),
    SchemaDiff(SchemaVersion),
    NodeVersion(NodeId),
}

impl fmt::Display for MetaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaKey::OwnerTerm => write!(f, "ddl/owner_term"),
            MetaKey::OwnerLease => write!(f, "ddl/owner_lease"),
            MetaKey::SchemaVersion => write!(f, "schema_version"),
            MetaKey::GlobalId => write!(f, "global_id"),
            MetaKey::Database(id) => write!(f, "db/{}", id.0),
            MetaKey::Table(db, tbl) => write!(f, "db/{}/table/{}", db.0, tbl.0),
            MetaKey::Job(id) => write!(f, "ddl/job/{}", id.0),
            MetaKey::History(id) => write!(f, "ddl/history/{}", id.0),
            MetaKey::SchemaDiff(v) => write!(f, "schema_diff/{}", v.0),
            MetaKey::NodeVersion(n) => write!(f, "ddl/node_version/{}", n.0),
        }
    }
}

/// Contiguous key range for scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRange {
    Databases,
    Tables(SchemaId),
    Jobs,
    History,
    SchemaDiffs,
    NodeVersions,
}

impl KeyRange {
    pub fn contains(&self, key: &MetaKey) -> bool {
        match (self, key) {
            (KeyRange::Databases, MetaKey::Database(_)) => true,
            (KeyRange::Tables(db), MetaKey::Table(k, _)) => db == k,
            (KeyRange::Jobs, MetaKey::Job(_)) => true,
            (KeyRange::History, MetaKey::History(_)) => true,
            (KeyRange::SchemaDiffs, MetaKey::SchemaDiff(_)) => true,
            (KeyRange::NodeVersions, MetaKey::NodeVersion(_)) => true,
            _ => false,
        }
    }

    fn bounds(&self) -> (MetaKey, MetaKey) {
        match self {
            KeyRange::Databases => (
                MetaKey::Database(SchemaId(0)),
                MetaKey::Database(SchemaId(u64::MAX)),
            ),
            KeyRange::Tables(db) => (
                MetaKey::Table(*db, TableId(0)),
                MetaKey::Table(*db, TableId(u64::MAX)),
            ),
            KeyRange::Jobs => (MetaKey::Job(JobId(0)), MetaKey::Job(JobId(u64::MAX))),
            KeyRange::History => (
                MetaKey::History(JobId(0)),
                MetaKey::History(JobId(u64::MAX)),
            ),
            KeyRange::SchemaDiffs => (
                MetaKey::SchemaDiff(SchemaVersion(0)),
                MetaKey::SchemaDiff(SchemaVersion(u64::MAX)),
            ),
            KeyRange::NodeVersions => (
                MetaKey::NodeVersion(NodeId(0)),
                MetaKey::NodeVersion(NodeId(u64::MAX)),
            ),
        }
    }
}

/// A value together with the revision of the commit that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub revision: u64,
}

/// An atomic, conditional write.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    /// Keys the transaction read, with the revision it saw (`None` = absent).
    pub checks: Vec<(MetaKey, Option<u64>)>,
    pub puts: Vec<(MetaKey, Vec<u8>)>,
    pub deletes: Vec<MetaKey>,
}

impl WriteBatch {
    pub fn is_read_only(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }

    fn touches(&self, pred: impl Fn(&MetaKey) -> bool) -> bool {
        self.puts.iter().any(|(k, _)| pred(k)) || self.deletes.iter().any(&pred)
    }
}

/// Transactional key-value store holding the catalog, the job queue, the
/// history log and the schema version.
#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    async fn get(&self, key: &MetaKey) -> Result<Option<Versioned>, MetaError>;

    /// All keys in `range`, in key order.
    async fn scan(&self, range: KeyRange) -> Result<Vec<(MetaKey, Versioned)>, MetaError>;

    /// Apply `batch` atomically if every checked key still has the observed
    /// revision. Returns the store revision after the commit.
    async fn commit(&self, batch: WriteBatch) -> Result<u64, MetaError>;

    /// Receiver of the store revision; changes after every write commit.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

// ── In-memory store ──────────────────────────────────────────────────

struct StoreInner {
    data: BTreeMap<MetaKey, Versioned>,
    revision: u64,
}

/// Fault injection knobs for [`MemMetaStore`].
#[derive(Debug, Default)]
pub struct MetaFaults {
    fail_commits: AtomicU64,
    fail_table_writes: AtomicU64,
}

impl MetaFaults {
    fn take(counter: &AtomicU64) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-process [`MetaStore`] shared by every node of a test or demo cluster.
pub struct MemMetaStore {
    inner: Mutex<StoreInner>,
    notify: watch::Sender<u64>,
    faults: MetaFaults,
}

impl MemMetaStore {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            inner: Mutex::new(StoreInner {
                data: BTreeMap::new(),
                revision: 0,
            }),
            notify,
            faults: MetaFaults::default(),
        }
    }

    /// Fail the next `n` write commits with `Unavailable`.
    pub fn fail_next_commits(&self, n: u64) {
        self.faults.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` commits that write a table key. Commits that only
    /// touch job records still succeed, so error accounting keeps working.
    pub fn fail_next_table_writes(&self, n: u64) {
        self.faults.fail_table_writes.store(n, Ordering::SeqCst);
    }

    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }

    /// Raw bytes stored under `key`, bypassing revision tracking.
    pub fn raw(&self, key: &MetaKey) -> Option<Vec<u8>> {
        self.inner.lock().data.get(key).map(|v| v.value.clone())
    }

    /// Overwrite raw bytes under `key` outside any transaction.
    pub fn put_raw(&self, key: MetaKey, value: Vec<u8>) {
        let rev = {
            let mut inner = self.inner.lock();
            inner.revision += 1;
            let rev = inner.revision;
            inner.data.insert(
                key,
                Versioned {
                    value,
                    revision: rev,
                },
            );
            rev
        };
        self.notify.send_replace(rev);
    }

    fn check_faults(&self, batch: &WriteBatch) -> Result<(), MetaError> {
        if batch.is_read_only() {
            return Ok(());
        }
        if MetaFaults::take(&self.faults.fail_commits) {
            return Err(MetaError::Unavailable("injected commit failure".into()));
        }
        if batch.touches(|k| matches!(k, MetaKey::Table(..)))
            && MetaFaults::take(&self.faults.fail_table_writes)
        {
            return Err(MetaError::Unavailable("injected table write failure".into()));
        }
        Ok(())
    }
}

impl Default for MemMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetaStore for MemMetaStore {
    async fn get(&self, key: &MetaKey) -> Result<Option<Versioned>, MetaError> {
        Ok(self.inner.lock().data.get(key).cloned())
    }

    async fn scan(&self, range: KeyRange) -> Result<Vec<(MetaKey, Versioned)>, MetaError> {
        let (lo, hi) = range.bounds();
        let inner = self.inner.lock();
        Ok(inner
            .data
            .range(lo..=hi)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<u64, MetaError> {
        self.check_faults(&batch)?;
        let rev = {
            let mut inner = self.inner.lock();
            for (key, expected) in &batch.checks {
                let actual = inner.data.get(key).map(|v| v.revision);
                if actual != *expected {
                    return Err(MetaError::VersionConflict {
                        key: key.to_string(),
                        expected: *expected,
                        actual,
                    });
                }
            }
            if batch.is_read_only() {
                return Ok(inner.revision);
            }
            inner.revision += 1;
            let rev = inner.revision;
            for (key, value) in batch.puts {
                inner.data.insert(
                    key,
                    Versioned {
                        value,
                        revision: rev,
                    },
                );
            }
            for key in batch.deletes {
                inner.data.remove(&key);
            }
            rev
        };
        self.notify.send_replace(rev);
        Ok(rev)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: MetaKey, value: &str) -> WriteBatch {
        WriteBatch {
            puts: vec![(key, value.as_bytes().to_vec())],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_commit_assigns_revision() {
        let store = MemMetaStore::new();
        let rev = store.commit(put(MetaKey::GlobalId, "1")).await.unwrap();
        assert_eq!(rev, 1);
        let v = store.get(&MetaKey::GlobalId).await.unwrap().unwrap();
        assert_eq!(v.revision, 1);
        assert_eq!(v.value, b"1");
    }

    #[tokio::test]
    async fn test_stale_check_conflicts() {
        let store = MemMetaStore::new();
        store.commit(put(MetaKey::GlobalId, "1")).await.unwrap();

        let mut batch = put(MetaKey::GlobalId, "2");
        batch.checks.push((MetaKey::GlobalId, None));
        let err = store.commit(batch).await.unwrap_err();
        assert!(matches!(err, MetaError::VersionConflict { actual: Some(1), .. }));

        let mut batch = put(MetaKey::GlobalId, "2");
        batch.checks.push((MetaKey::GlobalId, Some(1)));
        assert_eq!(store.commit(batch).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_scan_range_is_bounded() {
        let store = MemMetaStore::new();
        store.commit(put(MetaKey::Job(JobId(3)), "a")).await.unwrap();
        store.commit(put(MetaKey::Job(JobId(1)), "b")).await.unwrap();
        store.commit(put(MetaKey::History(JobId(2)), "c")).await.unwrap();

        let jobs = store.scan(KeyRange::Jobs).await.unwrap();
        let ids: Vec<_> = jobs.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(ids, vec![MetaKey::Job(JobId(1)), MetaKey::Job(JobId(3))]);
    }

    #[tokio::test]
    async fn test_subscribe_sees_commits() {
        let store = MemMetaStore::new();
        let mut rx = store.subscribe();
        store.commit(put(MetaKey::GlobalId, "1")).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }

    #[tokio::test]
    async fn test_table_write_fault_spares_job_writes() {
        let store = MemMetaStore::new();
        store.fail_next_table_writes(1);
        store.commit(put(MetaKey::Job(JobId(1)), "j")).await.unwrap();
        let err = store
            .commit(put(MetaKey::Table(SchemaId(1), TableId(2)), "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::Unavailable(_)));
        store
            .commit(put(MetaKey::Table(SchemaId(1), TableId(2)), "t"))
            .await
            .unwrap();
    }
}
