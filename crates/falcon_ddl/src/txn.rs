//! Optimistic read-modify-write transactions over a [`MetaStore`].
//!
//! A [`MetaTxn`] buffers writes locally and records the revision of every
//! key it reads. `commit` turns the read set into revision checks, so the
//! whole step (catalog change, job record, schema version bump) lands
//! atomically or not at all.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use falcon_common::error::{ClusterError, FalconError, FalconResult, MetaError};
use falcon_common::schema::{DatabaseInfo, TableInfo};
use falcon_common::types::{JobId, NodeId, SchemaId, SchemaVersion, TableId};

use crate::job::{ActionType, Job};
use crate::meta::{KeyRange, MetaKey, MetaStore, WriteBatch};

/// Audit record written alongside every schema version bump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub version: SchemaVersion,
    pub job_id: JobId,
    pub action: ActionType,
    pub schema_id: SchemaId,
    pub table_id: TableId,
    /// Table replaced by this change (truncate).
    #[serde(default)]
    pub old_table_id: Option<TableId>,
}

impl SchemaDiff {
    pub fn for_job(job: &Job) -> Self {
        Self {
            version: SchemaVersion::ZERO,
            job_id: job.id,
            action: job.action,
            schema_id: job.schema_id,
            table_id: job.table_id,
            old_table_id: None,
        }
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitInfo {
    pub revision: u64,
    /// Set when the transaction bumped the schema version.
    pub schema_version: Option<SchemaVersion>,
}

pub struct MetaTxn {
    store: Arc<dyn MetaStore>,
    reads: BTreeMap<MetaKey, Option<u64>>,
    writes: BTreeMap<MetaKey, Option<Vec<u8>>>,
    bumped: Option<SchemaVersion>,
}

impl MetaTxn {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self {
            store,
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
            bumped: None,
        }
    }

    pub fn has_writes(&self) -> bool {
        !self.writes.is_empty()
    }

    pub fn bumped_version(&self) -> Option<SchemaVersion> {
        self.bumped
    }

    // ── Raw access ───────────────────────────────────────────────────

    async fn get_bytes(&mut self, key: &MetaKey) -> FalconResult<Option<Vec<u8>>> {
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        let found = self.store.get(key).await?;
        self.reads
            .entry(key.clone())
            .or_insert(found.as_ref().map(|v| v.revision));
        Ok(found.map(|v| v.value))
    }

    pub async fn get<T: DeserializeOwned>(&mut self, key: &MetaKey) -> FalconResult<Option<T>> {
        match self.get_bytes(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&mut self, key: MetaKey, value: &T) -> FalconResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.writes.insert(key, Some(bytes));
        Ok(())
    }

    pub fn delete(&mut self, key: MetaKey) {
        self.writes.insert(key, None);
    }

    /// Scan `range`, overlaying this transaction's own buffered writes.
    pub async fn scan<T: DeserializeOwned>(
        &mut self,
        range: KeyRange,
    ) -> FalconResult<Vec<(MetaKey, T)>> {
        let mut merged: BTreeMap<MetaKey, Vec<u8>> = BTreeMap::new();
        for (key, v) in self.store.scan(range).await? {
            self.reads.entry(key.clone()).or_insert(Some(v.revision));
            merged.insert(key, v.value);
        }
        for (key, w) in self.writes.iter().filter(|(k, _)| range.contains(k)) {
            match w {
                Some(bytes) => {
                    merged.insert(key.clone(), bytes.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        let mut out = Vec::with_capacity(merged.len());
        for (key, bytes) in merged {
            out.push((key, serde_json::from_slice(&bytes)?));
        }
        Ok(out)
    }

    /// Commit buffered writes, conditional on every read key being unchanged.
    pub async fn commit(self) -> FalconResult<CommitInfo> {
        let mut batch = WriteBatch {
            checks: self.reads.into_iter().collect(),
            ..Default::default()
        };
        for (key, w) in self.writes {
            match w {
                Some(bytes) => batch.puts.push((key, bytes)),
                None => batch.deletes.push(key),
            }
        }
        let revision = self.store.commit(batch).await.map_err(fence_conflict)?;
        Ok(CommitInfo {
            revision,
            schema_version: self.bumped,
        })
    }

    // ── Global counters ──────────────────────────────────────────────

    pub async fn gen_global_id(&mut self) -> FalconResult<u64> {
        let current: u64 = self.get(&MetaKey::GlobalId).await?.unwrap_or(0);
        let next = current + 1;
        self.put(MetaKey::GlobalId, &next)?;
        Ok(next)
    }

    pub async fn gen_global_ids(&mut self, n: usize) -> FalconResult<Vec<u64>> {
        let current: u64 = self.get(&MetaKey::GlobalId).await?.unwrap_or(0);
        let ids: Vec<u64> = (1..=n as u64).map(|i| current + i).collect();
        self.put(MetaKey::GlobalId, &(current + n as u64))?;
        Ok(ids)
    }

    pub async fn schema_version(&mut self) -> FalconResult<SchemaVersion> {
        Ok(self
            .get::<SchemaVersion>(&MetaKey::SchemaVersion)
            .await?
            .unwrap_or(SchemaVersion::ZERO))
    }

    /// Bump the schema version by one and record `diff` under the new
    /// version. At most once per transaction.
    pub async fn bump_schema_version(&mut self, mut diff: SchemaDiff) -> FalconResult<SchemaVersion> {
        if let Some(v) = self.bumped {
            return Err(FalconError::internal_bug(
                "DDL-TXN-001",
                "schema version bumped twice in one transaction",
                format!("already bumped to {v} by job {}", diff.job_id.0),
            ));
        }
        let next = self.schema_version().await?.next();
        diff.version = next;
        self.put(MetaKey::SchemaVersion, &next)?;
        self.put(MetaKey::SchemaDiff(next), &diff)?;
        self.bumped = Some(next);
        Ok(next)
    }

    pub async fn get_schema_diff(&mut self, version: SchemaVersion) -> FalconResult<Option<SchemaDiff>> {
        self.get(&MetaKey::SchemaDiff(version)).await
    }

    // ── Catalog ──────────────────────────────────────────────────────

    pub async fn get_database(&mut self, id: SchemaId) -> FalconResult<Option<DatabaseInfo>> {
        self.get(&MetaKey::Database(id)).await
    }

    pub async fn must_get_database(&mut self, id: SchemaId) -> FalconResult<DatabaseInfo> {
        self.get_database(id)
            .await?
            .ok_or_else(|| MetaError::DatabaseNotFound(id).into())
    }

    pub fn put_database(&mut self, db: &DatabaseInfo) -> FalconResult<()> {
        self.put(MetaKey::Database(db.id), db)
    }

    pub fn delete_database(&mut self, id: SchemaId) {
        self.delete(MetaKey::Database(id));
    }

    pub async fn list_databases(&mut self) -> FalconResult<Vec<DatabaseInfo>> {
        Ok(self
            .scan::<DatabaseInfo>(KeyRange::Databases)
            .await?
            .into_iter()
            .map(|(_, db)| db)
            .collect())
    }

    pub async fn get_table(
        &mut self,
        schema_id: SchemaId,
        table_id: TableId,
    ) -> FalconResult<Option<TableInfo>> {
        self.get(&MetaKey::Table(schema_id, table_id)).await
    }

    /// Load a table, failing if its database or the table itself is gone.
    pub async fn must_get_table(
        &mut self,
        schema_id: SchemaId,
        table_id: TableId,
    ) -> FalconResult<TableInfo> {
        self.must_get_database(schema_id).await?;
        self.get_table(schema_id, table_id)
            .await?
            .ok_or_else(|| MetaError::TableNotFound(schema_id, table_id).into())
    }

    pub fn put_table(&mut self, table: &TableInfo) -> FalconResult<()> {
        self.put(MetaKey::Table(table.schema_id, table.id), table)
    }

    pub fn delete_table(&mut self, schema_id: SchemaId, table_id: TableId) {
        self.delete(MetaKey::Table(schema_id, table_id));
    }

    pub async fn list_tables(&mut self, schema_id: SchemaId) -> FalconResult<Vec<TableInfo>> {
        Ok(self
            .scan::<TableInfo>(KeyRange::Tables(schema_id))
            .await?
            .into_iter()
            .map(|(_, t)| t)
            .collect())
    }

    // ── Job queue and history ────────────────────────────────────────

    pub async fn get_job(&mut self, id: JobId) -> FalconResult<Option<Job>> {
        self.get(&MetaKey::Job(id)).await
    }

    pub fn put_job(&mut self, job: &Job) -> FalconResult<()> {
        self.put(MetaKey::Job(job.id), job)
    }

    pub async fn list_jobs(&mut self) -> FalconResult<Vec<Job>> {
        Ok(self
            .scan::<Job>(KeyRange::Jobs)
            .await?
            .into_iter()
            .map(|(_, j)| j)
            .collect())
    }

    pub async fn get_history_job(&mut self, id: JobId) -> FalconResult<Option<Job>> {
        self.get(&MetaKey::History(id)).await
    }

    /// Move a terminal job from the queue into the history log.
    pub fn finish_job(&mut self, job: &Job) -> FalconResult<()> {
        self.delete(MetaKey::Job(job.id));
        self.put(MetaKey::History(job.id), job)
    }

    /// Drop the oldest history records beyond `capacity` (0 keeps all).
    pub async fn trim_history(&mut self, capacity: usize) -> FalconResult<usize> {
        if capacity == 0 {
            return Ok(0);
        }
        let keys: Vec<MetaKey> = self
            .store
            .scan(KeyRange::History)
            .await?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        // The job being finished in this transaction is not in the scan yet.
        let pending = self
            .writes
            .iter()
            .filter(|(k, w)| matches!(k, MetaKey::History(_)) && w.is_some())
            .filter(|(k, _)| !keys.contains(k))
            .count();
        let total = keys.len() + pending;
        if total <= capacity {
            return Ok(0);
        }
        let excess = (total - capacity).min(keys.len());
        for key in keys.into_iter().take(excess) {
            self.delete(key);
        }
        Ok(excess)
    }

    // ── Owner fencing ────────────────────────────────────────────────

    /// Fail unless `node` still holds ownership term `term`. The read joins
    /// the transaction's read set, so a takeover racing with this
    /// transaction makes the commit fail.
    pub async fn check_owner(&mut self, node: NodeId, term: u64) -> FalconResult<()> {
        let record: Option<crate::owner::OwnerTerm> = self.get(&MetaKey::OwnerTerm).await?;
        match record {
            Some(r) if r.node_id == node && r.term == term => Ok(()),
            _ => Err(ClusterError::NotOwner(node).into()),
        }
    }
}

/// A commit that lost a race on the fencing key means ownership moved.
fn fence_conflict(err: MetaError) -> FalconError {
    match &err {
        MetaError::VersionConflict { key, .. } if *key == MetaKey::OwnerTerm.to_string() => {
            FalconError::Cluster(ClusterError::LeaseExpired)
        }
        _ => err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MemMetaStore;

    fn store() -> Arc<dyn MetaStore> {
        Arc::new(MemMetaStore::new())
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let s = store();
        let mut txn = MetaTxn::new(s.clone());
        let db = DatabaseInfo::new(SchemaId(1), "test");
        txn.put_database(&db).unwrap();
        assert_eq!(txn.get_database(SchemaId(1)).await.unwrap(), Some(db));
        assert_eq!(txn.list_databases().await.unwrap().len(), 1);
        txn.commit().await.unwrap();

        let mut txn = MetaTxn::new(s);
        assert!(txn.get_database(SchemaId(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_read_modify_write_conflicts() {
        let s = store();
        let mut a = MetaTxn::new(s.clone());
        let mut b = MetaTxn::new(s.clone());
        assert_eq!(a.gen_global_id().await.unwrap(), 1);
        assert_eq!(b.gen_global_id().await.unwrap(), 1);
        a.commit().await.unwrap();
        let err = b.commit().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_bump_writes_diff_once() {
        let s = store();
        let mut txn = MetaTxn::new(s.clone());
        let job = Job::new(
            JobId(3),
            ActionType::DropTable,
            SchemaId(1),
            TableId(2),
            crate::job::JobArgs::DropTable,
        );
        let v = txn.bump_schema_version(SchemaDiff::for_job(&job)).await.unwrap();
        assert_eq!(v, SchemaVersion(1));
        assert!(txn.bump_schema_version(SchemaDiff::for_job(&job)).await.is_err());
        let info = txn.commit().await.unwrap();
        assert_eq!(info.schema_version, Some(SchemaVersion(1)));

        let mut txn = MetaTxn::new(s);
        let diff = txn.get_schema_diff(SchemaVersion(1)).await.unwrap().unwrap();
        assert_eq!(diff.job_id, JobId(3));
        assert_eq!(diff.version, SchemaVersion(1));
    }

    #[tokio::test]
    async fn test_must_get_table_reports_missing_database() {
        let mut txn = MetaTxn::new(store());
        let err = txn.must_get_table(SchemaId(9), TableId(1)).await.unwrap_err();
        assert!(matches!(err, FalconError::Meta(MetaError::DatabaseNotFound(_))));
    }

    #[tokio::test]
    async fn test_trim_history_keeps_newest() {
        let s = store();
        for id in 1..=3u64 {
            let mut txn = MetaTxn::new(s.clone());
            let mut job = Job::new(
                JobId(id),
                ActionType::DropTable,
                SchemaId(1),
                TableId(2),
                crate::job::JobArgs::DropTable,
            );
            job.state = crate::job::JobState::Done;
            txn.finish_job(&job).unwrap();
            txn.trim_history(2).await.unwrap();
            txn.commit().await.unwrap();
        }
        let left = s.scan(KeyRange::History).await.unwrap();
        let ids: Vec<_> = left.into_iter().map(|(k, _)| k).collect();
        assert_eq!(ids, vec![MetaKey::History(JobId(2)), MetaKey::History(JobId(3))]);
    }
}
