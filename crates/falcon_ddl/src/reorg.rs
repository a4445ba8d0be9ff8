//! Backfill (reorganization) workers.
//!
//! A job in `WriteReorganization` hands the actual data migration to a
//! [`ReorgWorkerPool`] and polls it with a bounded wait on every step. The
//! pool is keyed by job id and is idempotent: a new owner that finds no
//! record of a started backfill simply starts it again from the persisted
//! snapshot version.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use falcon_common::error::FalconResult;
use falcon_common::types::{IndexId, JobId, PartitionId, SchemaId, TableId};

/// What a backfill migrates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorgElement {
    Index {
        index_id: IndexId,
        name: String,
        columns: Vec<String>,
        unique: bool,
    },
    /// Copy `from` into the hidden column `to`, converting to `new_type`.
    Column {
        from: String,
        to: String,
        new_type: String,
    },
    Partitions {
        dropping: Vec<PartitionId>,
        adding: Vec<PartitionId>,
    },
    /// Verify existing rows against a CHECK expression.
    CheckConstraint { name: String, expr: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillRequest {
    pub job_id: JobId,
    pub schema_id: SchemaId,
    pub table_id: TableId,
    pub element: ReorgElement,
    /// Schema version the backfill reads existing data at.
    pub snapshot_ver: u64,
}

/// Terminal result of one backfill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorgResult {
    Completed { rows: u64 },
    Failed(String),
    Cancelled,
}

/// Answer to a bounded wait on a backfill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorgWait {
    Done(ReorgResult),
    /// Still running when the wait timed out.
    Pending,
    /// The pool has no record of the job (never started, or started by a
    /// previous owner).
    Unknown,
}

#[async_trait]
pub trait ReorgWorkerPool: Send + Sync + 'static {
    /// Start the backfill for `req.job_id`. A no-op when one with the same
    /// snapshot is already tracked.
    async fn start_backfill(&self, req: BackfillRequest) -> FalconResult<()>;

    /// Wait up to `timeout` for the job's backfill to finish.
    async fn wait_result(&self, job_id: JobId, timeout: Duration) -> ReorgWait;

    /// Ask the job's backfill to stop and wait up to `timeout` for it to
    /// exit. Returns whether it has exited.
    async fn stop(&self, job_id: JobId, timeout: Duration) -> bool;

    /// Forget the job's backfill, aborting it if it is still running.
    fn release(&self, job_id: JobId);

    fn is_tracked(&self, job_id: JobId) -> bool;
}

/// Does the data work of one backfill.
#[async_trait]
pub trait BackfillExecutor: Send + Sync + 'static {
    /// Migrate rows for `req`; return the number of rows processed. Should
    /// return early when `stop` becomes `true`.
    async fn backfill(
        &self,
        req: &BackfillRequest,
        stop: watch::Receiver<bool>,
    ) -> Result<u64, String>;
}

/// Executor for a catalog without row data: every backfill succeeds at once.
pub struct NoopBackfill;

#[async_trait]
impl BackfillExecutor for NoopBackfill {
    async fn backfill(
        &self,
        _req: &BackfillRequest,
        _stop: watch::Receiver<bool>,
    ) -> Result<u64, String> {
        Ok(0)
    }
}

struct ReorgTask {
    snapshot_ver: u64,
    stop: watch::Sender<bool>,
    result: watch::Receiver<Option<ReorgResult>>,
    handle: JoinHandle<()>,
}

/// In-process [`ReorgWorkerPool`] running backfills as tokio tasks, at most
/// `concurrency` at a time.
pub struct LocalReorgPool {
    executor: Arc<dyn BackfillExecutor>,
    limit: Arc<Semaphore>,
    tasks: Mutex<HashMap<JobId, ReorgTask>>,
}

impl LocalReorgPool {
    pub fn new(executor: Arc<dyn BackfillExecutor>, concurrency: usize) -> Self {
        Self {
            executor,
            limit: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Abort every backfill. Used when the hosting node goes away.
    pub fn shutdown(&self) {
        for (_, task) in self.tasks.lock().drain() {
            task.handle.abort();
        }
    }

    pub fn tracked_jobs(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Drop for LocalReorgPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl ReorgWorkerPool for LocalReorgPool {
    async fn start_backfill(&self, req: BackfillRequest) -> FalconResult<()> {
        let mut tasks = self.tasks.lock();
        if let Some(existing) = tasks.get(&req.job_id) {
            if existing.snapshot_ver == req.snapshot_ver {
                return Ok(());
            }
            existing.handle.abort();
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (result_tx, result_rx) = watch::channel(None);
        let executor = self.executor.clone();
        let limit = self.limit.clone();
        let job_id = req.job_id;
        let snapshot_ver = req.snapshot_ver;
        let handle = tokio::spawn(async move {
            let Ok(_permit) = limit.acquire_owned().await else {
                let _ = result_tx.send(Some(ReorgResult::Cancelled));
                return;
            };
            if *stop_rx.borrow() {
                let _ = result_tx.send(Some(ReorgResult::Cancelled));
                return;
            }
            tracing::info!(job = %req.job_id, element = ?req.element, snapshot = req.snapshot_ver, "backfill started");
            let outcome = executor.backfill(&req, stop_rx.clone()).await;
            let result = match outcome {
                _ if *stop_rx.borrow() => ReorgResult::Cancelled,
                Ok(rows) => ReorgResult::Completed { rows },
                Err(msg) => ReorgResult::Failed(msg),
            };
            tracing::info!(job = %req.job_id, result = ?result, "backfill finished");
            let _ = result_tx.send(Some(result));
        });
        tasks.insert(
            job_id,
            ReorgTask {
                snapshot_ver,
                stop: stop_tx,
                result: result_rx,
                handle,
            },
        );
        Ok(())
    }

    async fn wait_result(&self, job_id: JobId, timeout: Duration) -> ReorgWait {
        let rx = match self.tasks.lock().get(&job_id) {
            Some(task) => task.result.clone(),
            None => return ReorgWait::Unknown,
        };
        wait_for_result(rx, timeout).await
    }

    async fn stop(&self, job_id: JobId, timeout: Duration) -> bool {
        let rx = match self.tasks.lock().get(&job_id) {
            Some(task) => {
                let _ = task.stop.send(true);
                task.result.clone()
            }
            None => return true,
        };
        !matches!(wait_for_result(rx, timeout).await, ReorgWait::Pending)
    }

    fn release(&self, job_id: JobId) {
        if let Some(task) = self.tasks.lock().remove(&job_id) {
            task.handle.abort();
        }
    }

    fn is_tracked(&self, job_id: JobId) -> bool {
        self.tasks.lock().contains_key(&job_id)
    }
}

async fn wait_for_result(mut rx: watch::Receiver<Option<ReorgResult>>, timeout: Duration) -> ReorgWait {
    let waited = tokio::time::timeout(timeout, rx.wait_for(|r| r.is_some())).await;
    match waited {
        Ok(Ok(result)) => match result.clone() {
            Some(r) => ReorgWait::Done(r),
            None => ReorgWait::Pending,
        },
        // Sender dropped without a result: the task was aborted.
        Ok(Err(_)) => ReorgWait::Done(ReorgResult::Cancelled),
        Err(_) => ReorgWait::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowBackfill(Duration);

    #[async_trait]
    impl BackfillExecutor for SlowBackfill {
        async fn backfill(
            &self,
            _req: &BackfillRequest,
            mut stop: watch::Receiver<bool>,
        ) -> Result<u64, String> {
            tokio::select! {
                _ = tokio::time::sleep(self.0) => Ok(42),
                _ = stop.wait_for(|s| *s) => Ok(0),
            }
        }
    }

    struct FailingBackfill;

    #[async_trait]
    impl BackfillExecutor for FailingBackfill {
        async fn backfill(
            &self,
            _req: &BackfillRequest,
            _stop: watch::Receiver<bool>,
        ) -> Result<u64, String> {
            Err("duplicate entry '7' for key 'idx_a'".into())
        }
    }

    fn req(job: u64) -> BackfillRequest {
        BackfillRequest {
            job_id: JobId(job),
            schema_id: SchemaId(1),
            table_id: TableId(2),
            element: ReorgElement::Index {
                index_id: IndexId(3),
                name: "idx_a".into(),
                columns: vec!["a".into()],
                unique: true,
            },
            snapshot_ver: 5,
        }
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let pool = LocalReorgPool::new(Arc::new(NoopBackfill), 1);
        assert_eq!(
            pool.wait_result(JobId(1), Duration::from_millis(10)).await,
            ReorgWait::Unknown
        );
    }

    #[tokio::test]
    async fn test_pending_then_completed() {
        let pool = LocalReorgPool::new(Arc::new(SlowBackfill(Duration::from_millis(80))), 2);
        pool.start_backfill(req(1)).await.unwrap();
        // Idempotent for the same snapshot.
        pool.start_backfill(req(1)).await.unwrap();
        assert_eq!(pool.tracked_jobs(), 1);

        assert_eq!(
            pool.wait_result(JobId(1), Duration::from_millis(5)).await,
            ReorgWait::Pending
        );
        assert_eq!(
            pool.wait_result(JobId(1), Duration::from_secs(2)).await,
            ReorgWait::Done(ReorgResult::Completed { rows: 42 })
        );
        pool.release(JobId(1));
        assert!(!pool.is_tracked(JobId(1)));
    }

    #[tokio::test]
    async fn test_failure_is_reported() {
        let pool = LocalReorgPool::new(Arc::new(FailingBackfill), 1);
        pool.start_backfill(req(2)).await.unwrap();
        match pool.wait_result(JobId(2), Duration::from_secs(2)).await {
            ReorgWait::Done(ReorgResult::Failed(msg)) => assert!(msg.contains("duplicate")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_cancels_running_backfill() {
        let pool = LocalReorgPool::new(Arc::new(SlowBackfill(Duration::from_secs(30))), 1);
        pool.start_backfill(req(3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.stop(JobId(3), Duration::from_secs(2)).await);
        assert_eq!(
            pool.wait_result(JobId(3), Duration::from_millis(10)).await,
            ReorgWait::Done(ReorgResult::Cancelled)
        );
    }
}
