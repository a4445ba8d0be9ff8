//! DdlController: the per-node entry point of the schema-change subsystem.
//!
//! Every node runs one controller. Any node accepts requests (submit,
//! status, cancel, pause, resume, wait); only the elected owner runs jobs.
//! Three background tasks make up a running controller:
//!
//! - the schema version watcher, which reloads the local schema for every
//!   published version and acknowledges it;
//! - the owner campaign, which acquires and renews the owner lease;
//! - the scheduler, which (on the owner only) hands queued jobs to a
//!   bounded pool of workers.
//!
//! Usage:
//! ```ignore
//! let ctl = Arc::new(DdlController::new(config, store, election, reorg, callback)?);
//! ctl.start();
//! let id = ctl.submit_job(ActionType::AddColumn, db, tbl, args).await?;
//! let status = ctl.wait_job(id, Duration::from_secs(10)).await?;
//! ctl.stop().await;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;

use falcon_common::config::DdlNodeConfig;
use falcon_common::error::{DdlError, FalconError, FalconResult, MetaError};
use falcon_common::types::{JobId, NodeId, SchemaId, SchemaVersion, TableId};

use crate::callback::{CallbackRegistry, DdlCallback, SchemaReloader};
use crate::job::{ActionType, Job, JobArgs, JobState, JobStatus};
use crate::meta::{KeyRange, MetaStore};
use crate::owner::{now_millis, OwnerElection};
use crate::policy::is_job_rollbackable;
use crate::reorg::ReorgWorkerPool;
use crate::step::check_sub_jobs;
use crate::txn::{MetaTxn, SchemaDiff};
use crate::version::SchemaVersionSyncer;
use crate::worker::{JobExit, Worker};

/// Attempts for request-side read-modify-write transactions.
const MAX_REQUEST_RETRIES: usize = 16;

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job is now `Cancelling`; the owner decides how to unwind it.
    Requested,
    /// A cancel is already in progress.
    AlreadyCancelling,
    /// The job is past its point of no return and will run to completion.
    Refused,
}

pub struct DdlController {
    config: Arc<DdlNodeConfig>,
    store: Arc<dyn MetaStore>,
    election: Arc<dyn OwnerElection>,
    callback: Arc<dyn DdlCallback>,
    syncer: Arc<SchemaVersionSyncer>,
    worker: Arc<Worker>,
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<Mutex<HashMap<JobId, JoinHandle<()>>>>,
}

impl DdlController {
    pub fn new(
        config: DdlNodeConfig,
        store: Arc<dyn MetaStore>,
        election: Arc<dyn OwnerElection>,
        reorg: Arc<dyn ReorgWorkerPool>,
        callback: Arc<dyn DdlCallback>,
    ) -> FalconResult<Self> {
        config
            .validate()
            .map_err(|e| FalconError::validation(format!("invalid DDL config: {e}")))?;
        let config = Arc::new(config);
        let syncer = Arc::new(SchemaVersionSyncer::new(
            config.node_id(),
            store.clone(),
            callback.clone(),
            Duration::from_millis(config.schema_sync.node_ttl_ms),
        ));
        let worker = Arc::new(Worker {
            config: config.clone(),
            store: store.clone(),
            election: election.clone(),
            reorg: reorg.clone(),
            callback: callback.clone(),
            syncer: syncer.clone(),
        });
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            store,
            election,
            callback,
            syncer,
            worker,
            wake: Arc::new(Notify::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            running: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Build a controller whose hook is looked up by the configured
    /// `ddl.callback_hook` name.
    pub fn with_registry(
        config: DdlNodeConfig,
        store: Arc<dyn MetaStore>,
        election: Arc<dyn OwnerElection>,
        reorg: Arc<dyn ReorgWorkerPool>,
        registry: &CallbackRegistry,
        reloader: Arc<dyn SchemaReloader>,
    ) -> FalconResult<Self> {
        let callback = registry.build(&config.ddl.callback_hook, reloader)?;
        Self::new(config, store, election, reorg, callback)
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id()
    }

    pub fn is_owner(&self) -> bool {
        self.election.is_owner()
    }

    /// Spawn the version watcher, the owner campaign and the scheduler.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(tokio::spawn(
            self.syncer.clone().run(self.shutdown.subscribe()),
        ));
        let ctl = self.clone();
        tasks.push(tokio::spawn(async move { ctl.campaign_loop().await }));
        let ctl = self.clone();
        tasks.push(tokio::spawn(async move { ctl.schedule_loop().await }));
        tracing::info!(node = %self.node_id(), "DDL controller started");
    }

    /// Graceful stop: give up ownership, let running steps finish and join
    /// the background tasks.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.wake.notify_waiters();
        if self.election.is_owner() {
            if let Err(e) = self.election.resign().await {
                tracing::warn!(node = %self.node_id(), error = %e, "resign DDL owner failed");
            }
            falcon_observability::record_ddl_owner(false);
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for t in tasks {
            let _ = t.await;
        }
        let workers: Vec<JoinHandle<()>> = self.running.lock().drain().map(|(_, h)| h).collect();
        for w in workers {
            let _ = w.await;
        }
        tracing::info!(node = %self.node_id(), "DDL controller stopped");
    }

    /// Kill every task without resigning, as if the process crashed. The
    /// lease is left to expire.
    pub fn abort(&self) {
        let _ = self.shutdown.send(true);
        for t in self.tasks.lock().drain(..) {
            t.abort();
        }
        for (_, w) in self.running.lock().drain() {
            w.abort();
        }
        tracing::warn!(node = %self.node_id(), "DDL controller aborted");
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Queue a new job. `CreateSchema`/`CreateTable` with a zero target id
    /// get a fresh id allocated here.
    pub async fn submit_job(
        &self,
        action: ActionType,
        schema_id: SchemaId,
        table_id: TableId,
        args: JobArgs,
    ) -> FalconResult<JobId> {
        if !args.matches(action) {
            return Err(DdlError::InvalidJobArgs(format!("arguments do not match action {action}")).into());
        }
        if let JobArgs::MultiSchemaChange { sub_jobs } = &args {
            check_sub_jobs(sub_jobs)?;
        }

        let job = self
            .retry_request(|mut txn| {
                let args = args.clone();
                async move {
                    let id = JobId(txn.gen_global_id().await?);
                    let (mut schema_id, mut table_id) = (schema_id, table_id);
                    match action {
                        ActionType::CreateSchema if schema_id.0 == 0 => {
                            schema_id = SchemaId(txn.gen_global_id().await?);
                        }
                        ActionType::CreateTable if table_id.0 == 0 => {
                            table_id = TableId(txn.gen_global_id().await?);
                        }
                        _ => {}
                    }
                    let mut job = Job::new(id, action, schema_id, table_id, args);
                    job.submitted_at_ms = now_millis();
                    txn.put_job(&job)?;
                    txn.commit().await?;
                    Ok(job)
                }
            })
            .await?;

        falcon_observability::record_ddl_job_submitted(action.as_str());
        tracing::info!("submit DDL job {}", job);
        self.wake.notify_one();
        Ok(job.id)
    }

    /// Status of a queued or finished job.
    pub async fn get_job(&self, id: JobId) -> FalconResult<JobStatus> {
        Ok(self.get_job_record(id).await?.status())
    }

    /// Full job record, from the queue or the history.
    pub async fn get_job_record(&self, id: JobId) -> FalconResult<Job> {
        let mut txn = MetaTxn::new(self.store.clone());
        if let Some(job) = txn.get_job(id).await? {
            return Ok(job);
        }
        txn.get_history_job(id)
            .await?
            .ok_or_else(|| DdlError::JobNotFound(id).into())
    }

    /// Ask the owner to stop `id`. Whether it is cancelled outright or
    /// rolled back is decided by the owner at the next step.
    pub async fn cancel_job(&self, id: JobId) -> FalconResult<CancelOutcome> {
        let outcome = self
            .retry_request(|mut txn| async move {
                let mut job = load_queued(&mut txn, id).await?;
                let outcome = match job.state {
                    JobState::Cancelling | JobState::Rollingback => CancelOutcome::AlreadyCancelling,
                    _ if !is_job_rollbackable(&job) => CancelOutcome::Refused,
                    _ => {
                        job.state = JobState::Cancelling;
                        txn.put_job(&job)?;
                        txn.commit().await?;
                        CancelOutcome::Requested
                    }
                };
                Ok(outcome)
            })
            .await?;
        tracing::info!(job = %id, outcome = ?outcome, "cancel DDL job");
        if outcome == CancelOutcome::Requested {
            self.wake.notify_one();
        }
        Ok(outcome)
    }

    pub async fn pause_job(&self, id: JobId) -> FalconResult<()> {
        self.retry_request(|mut txn| async move {
            let mut job = load_queued(&mut txn, id).await?;
            job.state = match job.state {
                JobState::Queueing => JobState::Paused,
                JobState::Running if is_job_rollbackable(&job) => JobState::Pausing,
                JobState::Pausing | JobState::Paused => return Ok(()),
                other => {
                    return Err(DdlError::CannotPause {
                        job_id: id,
                        state: other.to_string(),
                    }
                    .into())
                }
            };
            txn.put_job(&job)?;
            txn.commit().await?;
            Ok(())
        })
        .await?;
        tracing::info!(job = %id, "pause DDL job");
        self.wake.notify_one();
        Ok(())
    }

    pub async fn resume_job(&self, id: JobId) -> FalconResult<()> {
        self.retry_request(|mut txn| async move {
            let mut job = load_queued(&mut txn, id).await?;
            if job.state != JobState::Paused {
                return Err(DdlError::CannotResume {
                    job_id: id,
                    state: job.state.to_string(),
                }
                .into());
            }
            job.state = JobState::Queueing;
            txn.put_job(&job)?;
            txn.commit().await?;
            Ok(())
        })
        .await?;
        tracing::info!(job = %id, "resume DDL job");
        self.wake.notify_one();
        Ok(())
    }

    /// Block until `id` reaches a terminal state, or `timeout` elapses.
    pub async fn wait_job(&self, id: JobId, timeout: Duration) -> FalconResult<JobStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut changes = self.store.subscribe();
        loop {
            let job = self.get_job_record(id).await?;
            if job.is_finished() {
                return Ok(job.status());
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(MetaError::Unavailable("metadata store closed".into()).into()),
                Err(_) => return Err(DdlError::WaitTimeout(id).into()),
            }
        }
    }

    /// Jobs still in the queue, oldest first.
    pub async fn list_jobs(&self) -> FalconResult<Vec<Job>> {
        let mut jobs = MetaTxn::new(self.store.clone()).list_jobs().await?;
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    /// Up to `limit` finished jobs, newest first.
    pub async fn list_history(&self, limit: usize) -> FalconResult<Vec<Job>> {
        let mut txn = MetaTxn::new(self.store.clone());
        let history: Vec<(_, Job)> = txn.scan(KeyRange::History).await?;
        Ok(history
            .into_iter()
            .rev()
            .take(limit)
            .map(|(_, job)| job)
            .collect())
    }

    /// Latest published schema version.
    pub async fn schema_version(&self) -> FalconResult<SchemaVersion> {
        MetaTxn::new(self.store.clone()).schema_version().await
    }

    /// Version loaded by this node.
    pub fn loaded_schema_version(&self) -> SchemaVersion {
        self.syncer.current()
    }

    pub fn subscribe_schema_version(&self) -> watch::Receiver<SchemaVersion> {
        self.syncer.subscribe()
    }

    pub async fn schema_diff(&self, version: SchemaVersion) -> FalconResult<Option<SchemaDiff>> {
        self.syncer.schema_diff(version).await
    }

    /// Run `op` in a fresh transaction, retrying optimistic conflicts.
    async fn retry_request<T, F, Fut>(&self, op: F) -> FalconResult<T>
    where
        F: Fn(MetaTxn) -> Fut,
        Fut: std::future::Future<Output = FalconResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op(MetaTxn::new(self.store.clone())).await {
                Err(e) if e.is_retryable() && attempt < MAX_REQUEST_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(e.retry_after_ms())).await;
                }
                other => return other,
            }
        }
    }

    // ── Background loops ─────────────────────────────────────────────

    async fn campaign_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let delay = if self.election.is_owner() {
                if let Err(e) = self.election.renew().await {
                    tracing::warn!(node = %self.node_id(), error = %e, "DDL owner lease lost");
                    falcon_observability::record_ddl_owner(false);
                    self.config.campaign_interval()
                } else {
                    self.config.renew_interval()
                }
            } else {
                match self.election.try_acquire().await {
                    Ok(true) => {
                        tracing::info!(node = %self.node_id(), "became DDL owner");
                        falcon_observability::record_ddl_owner(true);
                        self.callback.on_watched();
                        self.wake.notify_one();
                        self.config.renew_interval()
                    }
                    Ok(false) => self.config.campaign_interval(),
                    Err(e) => {
                        tracing::debug!(node = %self.node_id(), error = %e, "DDL owner campaign failed");
                        self.config.campaign_interval()
                    }
                }
            };
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::debug!(node = %self.node_id(), "DDL owner campaign stopped");
    }

    async fn schedule_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let permits = Arc::new(Semaphore::new(self.config.ddl.worker_pool_size));
        loop {
            if self.election.is_owner() {
                if let Err(e) = self.schedule_once(&permits).await {
                    tracing::warn!(node = %self.node_id(), error = %e, "DDL scheduling failed");
                }
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.scheduler_tick()) => {}
            }
        }
        tracing::debug!(node = %self.node_id(), "DDL scheduler stopped");
    }

    /// Hand every runnable job to a worker, as long as permits last.
    async fn schedule_once(&self, permits: &Arc<Semaphore>) -> FalconResult<()> {
        self.callback.on_get_job_before();
        let jobs = self.list_jobs().await?;
        self.callback.on_get_job_after(&jobs);

        for job in runnable(&jobs) {
            if self.running.lock().contains_key(&job.id) {
                continue;
            }
            let Ok(permit) = permits.clone().try_acquire_owned() else {
                break;
            };
            let id = job.id;
            let worker = self.worker.clone();
            let running = self.running.clone();
            let wake = self.wake.clone();
            let mut guard = self.running.lock();
            let handle = tokio::spawn(async move {
                let exit = worker.run_job(id).await;
                tracing::debug!(job = %id, exit = ?exit, "DDL worker released job");
                drop(permit);
                let mut running = running.lock();
                running.remove(&id);
                falcon_observability::record_ddl_running_jobs(running.len());
                if exit != JobExit::OwnerLost {
                    wake.notify_one();
                }
            });
            guard.insert(id, handle);
            falcon_observability::record_ddl_running_jobs(guard.len());
        }
        Ok(())
    }
}

/// Load a job that is still in the queue; a finished one is an error.
async fn load_queued(txn: &mut MetaTxn, id: JobId) -> FalconResult<Job> {
    if let Some(job) = txn.get_job(id).await? {
        if job.is_finished() {
            return Err(DdlError::JobFinished(id).into());
        }
        return Ok(job);
    }
    if txn.get_history_job(id).await?.is_some() {
        return Err(DdlError::JobFinished(id).into());
    }
    Err(DdlError::JobNotFound(id).into())
}

/// Whether `a` and `b` touch the same object. A zero table id stands for
/// the whole schema.
fn conflicts(a: &Job, b: &Job) -> bool {
    a.schema_id == b.schema_id
        && (a.table_id == b.table_id || a.table_id.0 == 0 || b.table_id.0 == 0)
}

/// Jobs that may run now: not paused, and no older unfinished job on the
/// same object. `jobs` is sorted by id.
fn runnable(jobs: &[Job]) -> Vec<&Job> {
    jobs.iter()
        .enumerate()
        .filter(|(_, j)| j.state != JobState::Paused)
        .filter(|(i, j)| !jobs[..*i].iter().any(|older| !older.is_finished() && conflicts(older, j)))
        .map(|(_, j)| j)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::BaseCallback;
    use crate::job::ColumnSpec;
    use crate::meta::MemMetaStore;
    use crate::owner::StoreLeaseElection;
    use crate::reorg::{LocalReorgPool, NoopBackfill};

    fn add_column(name: &str) -> JobArgs {
        JobArgs::AddColumn {
            column: ColumnSpec {
                name: name.into(),
                data_type: "int".into(),
                nullable: true,
                default_value: None,
            },
        }
    }

    fn controller() -> DdlController {
        let store: Arc<dyn MetaStore> = Arc::new(MemMetaStore::new());
        let mut config = DdlNodeConfig::default();
        config.owner.lease_ms = 300;
        config.owner.renew_interval_ms = 100;
        let election = Arc::new(StoreLeaseElection::new(
            config.node_id(),
            store.clone(),
            config.owner_lease(),
        ));
        let reorg = Arc::new(LocalReorgPool::new(Arc::new(NoopBackfill), 2));
        DdlController::new(config, store, election, reorg, Arc::new(BaseCallback)).unwrap()
    }

    fn job(id: u64, schema: u64, table: u64) -> Job {
        Job::new(
            JobId(id),
            ActionType::AddColumn,
            SchemaId(schema),
            TableId(table),
            add_column("c"),
        )
    }

    #[test]
    fn test_runnable_serializes_same_table() {
        let jobs = vec![job(1, 1, 2), job(2, 1, 2), job(3, 1, 3), job(4, 2, 0)];
        let ids: Vec<u64> = runnable(&jobs).iter().map(|j| j.id.0).collect();
        assert_eq!(ids, vec![1, 3, 4]);
    }

    #[test]
    fn test_schema_wide_job_blocks_its_tables() {
        let mut drop_schema = job(1, 1, 0);
        drop_schema.action = ActionType::DropSchema;
        let jobs = vec![drop_schema, job(2, 1, 2), job(3, 9, 2)];
        let ids: Vec<u64> = runnable(&jobs).iter().map(|j| j.id.0).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_paused_job_is_not_scheduled() {
        let mut paused = job(1, 1, 2);
        paused.state = JobState::Paused;
        let jobs = vec![paused, job(2, 1, 3)];
        let ids: Vec<u64> = runnable(&jobs).iter().map(|j| j.id.0).collect();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn test_submit_rejects_mismatched_args() {
        let ctl = controller();
        let err = ctl
            .submit_job(ActionType::DropColumn, SchemaId(1), TableId(2), add_column("c"))
            .await
            .unwrap_err();
        assert!(err.is_user_error());
        assert!(ctl.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_allocates_ids_for_create_schema() {
        let ctl = controller();
        let id = ctl
            .submit_job(
                ActionType::CreateSchema,
                SchemaId(0),
                TableId(0),
                JobArgs::CreateSchema {
                    name: "shop".into(),
                    charset: String::new(),
                    collate: String::new(),
                },
            )
            .await
            .unwrap();
        let job = ctl.get_job_record(id).await.unwrap();
        assert_ne!(job.schema_id.0, 0);
        assert_ne!(job.schema_id.0, id.0);
        assert_eq!(job.state, JobState::Queueing);
    }

    #[tokio::test]
    async fn test_cancel_pause_resume_requests() {
        let ctl = controller();
        let id = ctl
            .submit_job(ActionType::AddColumn, SchemaId(1), TableId(2), add_column("c"))
            .await
            .unwrap();

        ctl.pause_job(id).await.unwrap();
        assert_eq!(ctl.get_job(id).await.unwrap().state, JobState::Paused);
        let err = ctl.resume_job(JobId(999)).await.unwrap_err();
        assert!(matches!(err, FalconError::Ddl(DdlError::JobNotFound(_))));
        ctl.resume_job(id).await.unwrap();
        assert_eq!(ctl.get_job(id).await.unwrap().state, JobState::Queueing);
        assert!(ctl.resume_job(id).await.is_err());

        assert_eq!(ctl.cancel_job(id).await.unwrap(), CancelOutcome::Requested);
        assert_eq!(ctl.cancel_job(id).await.unwrap(), CancelOutcome::AlreadyCancelling);
        let err = ctl.pause_job(id).await.unwrap_err();
        assert!(matches!(err, FalconError::Ddl(DdlError::CannotPause { .. })));
    }

    #[tokio::test]
    async fn test_cancel_refused_past_point_of_no_return() {
        let ctl = controller();
        let id = ctl
            .submit_job(
                ActionType::DropColumn,
                SchemaId(1),
                TableId(2),
                JobArgs::DropColumn { name: "a".into() },
            )
            .await
            .unwrap();
        let mut txn = MetaTxn::new(ctl.store.clone());
        let mut job = txn.get_job(id).await.unwrap().unwrap();
        job.state = JobState::Running;
        job.schema_state = falcon_common::schema::SchemaState::WriteOnly;
        txn.put_job(&job).unwrap();
        txn.commit().await.unwrap();

        assert_eq!(ctl.cancel_job(id).await.unwrap(), CancelOutcome::Refused);
        assert_eq!(ctl.get_job(id).await.unwrap().state, JobState::Running);
    }

    #[tokio::test]
    async fn test_wait_job_times_out_without_owner() {
        let ctl = controller();
        let id = ctl
            .submit_job(ActionType::AddColumn, SchemaId(1), TableId(2), add_column("c"))
            .await
            .unwrap();
        let err = ctl.wait_job(id, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, FalconError::Ddl(DdlError::WaitTimeout(_))));
        assert_eq!(ctl.get_job(id).await.unwrap().state, JobState::Queueing);
    }
}
