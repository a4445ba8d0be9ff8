//! Job worker: runs the steps of one job on the owner.
//!
//! Every step is one optimistic transaction: fence on the owner term, load
//! the job, run the state machine, write object + job (+ version bump and
//! diff), commit. Failed steps are accounted for in a separate transaction
//! so the step's partial writes are never persisted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use falcon_common::config::DdlNodeConfig;
use falcon_common::error::{DdlError, DdlErrorClass, FalconError, FalconResult, MetaError};
use falcon_common::types::{JobId, SchemaVersion};

use crate::callback::DdlCallback;
use crate::job::{Job, JobError, JobErrorCode, JobState};
use crate::meta::MetaStore;
use crate::owner::OwnerElection;
use crate::policy::{is_forward_transition, is_job_rollbackable};
use crate::reorg::ReorgWorkerPool;
use crate::step::{run_step, StepContext, StepOutcome};
use crate::txn::MetaTxn;
use crate::version::SchemaVersionSyncer;

/// Why [`Worker::run_job`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobExit {
    /// The job reached a terminal state (or left the queue).
    Finished,
    /// The job is paused, or is waiting on a backfill; reschedule later.
    Yielded,
    /// This node is no longer the owner.
    OwnerLost,
}

/// Result of one step attempt.
#[derive(Debug)]
enum StepResult {
    Advanced,
    Finished,
    Yield,
    /// Retry after the given back-off.
    Backoff(Duration),
    OwnerLost,
}

pub(crate) struct Worker {
    pub config: Arc<DdlNodeConfig>,
    pub store: Arc<dyn MetaStore>,
    pub election: Arc<dyn OwnerElection>,
    pub reorg: Arc<dyn ReorgWorkerPool>,
    pub callback: Arc<dyn DdlCallback>,
    pub syncer: Arc<SchemaVersionSyncer>,
}

impl Worker {
    /// Step `id` until it finishes, yields, or ownership is lost.
    pub(crate) async fn run_job(&self, id: JobId) -> JobExit {
        loop {
            if !self.election.is_owner() {
                return JobExit::OwnerLost;
            }
            match self.run_one_step(id).await {
                StepResult::Advanced => {}
                StepResult::Finished => return JobExit::Finished,
                StepResult::Yield => return JobExit::Yielded,
                StepResult::Backoff(delay) => tokio::time::sleep(delay).await,
                StepResult::OwnerLost => {
                    self.reorg.release(id);
                    return JobExit::OwnerLost;
                }
            }
        }
    }

    fn step_context<'a>(&'a self, txn: &'a mut MetaTxn) -> StepContext<'a> {
        StepContext {
            txn,
            reorg: self.reorg.as_ref(),
            reorg_wait: self.config.reorg_wait_timeout(),
            reorg_stop: self.config.reorg_stop_timeout(),
        }
    }

    async fn run_one_step(&self, id: JobId) -> StepResult {
        let mut txn = MetaTxn::new(self.store.clone());
        if let Err(e) = self.election.fence(&mut txn).await {
            return self.on_infra_error(id, e);
        }
        let mut job = match txn.get_job(id).await {
            Ok(Some(job)) => job,
            Ok(None) => return StepResult::Finished,
            Err(e) => return self.on_infra_error(id, e),
        };
        match job.state {
            JobState::Paused => return StepResult::Yield,
            s if s.is_terminal() => {
                // Terminal but still queued: a previous owner died between
                // deciding and archiving. Archive now.
                return match self.commit_step(txn, &job).await {
                    Ok(_) => {
                        self.reorg.release(id);
                        StepResult::Finished
                    }
                    Err(e) => self.on_infra_error(id, e),
                };
            }
            JobState::Queueing => job.state = JobState::Running,
            _ => {}
        }

        self.callback.on_job_run_before(&job).await;
        let before = (job.state, job.schema_state);
        let snapshot_before = job.snapshot_ver;
        let started = Instant::now();
        let outcome = {
            let mut ctx = self.step_context(&mut txn);
            run_step(&mut ctx, &mut job).await
        };
        self.callback.on_job_run_after(&job);
        falcon_observability::record_ddl_step_duration_us(
            job.action.as_str(),
            started.elapsed().as_micros() as u64,
        );

        match outcome {
            StepOutcome::Continue => {
                if let Err(e) = check_monotonic(&job, before) {
                    tracing::error!(job = %job, error = %e, "step violated state monotonicity");
                    self.discard_step(&job, snapshot_before);
                    return self.record_step_error(id, e).await;
                }
                match self.commit_step(txn, &job).await {
                    Ok(version) => {
                        falcon_observability::record_ddl_step(
                            job.action.as_str(),
                            job.schema_state.to_string().as_str(),
                            "continue",
                        );
                        self.after_commit(&job, version).await;
                        if job.is_finished() {
                            StepResult::Finished
                        } else if job.state == JobState::Paused {
                            StepResult::Yield
                        } else {
                            StepResult::Advanced
                        }
                    }
                    Err(e) => {
                        self.discard_step(&job, snapshot_before);
                        if is_commit_conflict(&e) {
                            // Someone else wrote the job (cancel, pause) or
                            // its table; reload and run the step again.
                            tracing::debug!(job = %id, error = %e, "DDL job step lost a commit race, retrying");
                            return StepResult::Backoff(backoff(&e));
                        }
                        self.record_step_error(id, e).await
                    }
                }
            }
            StepOutcome::Cancelled(err) => {
                drop(txn);
                self.discard_step(&job, snapshot_before);
                falcon_observability::record_ddl_step(
                    job.action.as_str(),
                    before.1.to_string().as_str(),
                    "cancelled",
                );
                self.cancel_after_failure(id, err).await
            }
            StepOutcome::Retry(e) => {
                drop(txn);
                self.discard_step(&job, snapshot_before);
                self.record_step_error(id, e).await
            }
        }
    }

    /// A step that launched a backfill was not persisted, so the stored job
    /// still has no snapshot version. Forget the backfill; the step starts
    /// it again once its launch commits.
    fn discard_step(&self, job: &Job, snapshot_before: u64) {
        if snapshot_before == 0 && job.snapshot_ver != 0 {
            tracing::info!(job = %job.id, "dropping backfill of an uncommitted step");
            self.reorg.release(job.id);
        }
    }

    /// Persist the step: archive terminal jobs, otherwise rewrite the
    /// record. Returns the schema version published by the step, if any.
    async fn commit_step(&self, mut txn: MetaTxn, job: &Job) -> FalconResult<Option<SchemaVersion>> {
        if job.is_finished() {
            txn.finish_job(job)?;
            let trimmed = txn.trim_history(self.config.ddl.history_capacity).await?;
            if trimmed > 0 {
                tracing::debug!(trimmed, "trimmed DDL history");
            }
        } else {
            txn.put_job(job)?;
        }
        let info = txn.commit().await?;
        Ok(info.schema_version)
    }

    async fn after_commit(&self, job: &Job, version: Option<SchemaVersion>) {
        self.callback.on_job_updated(job);
        if let Some(version) = version {
            self.publish(version).await;
        }
        if job.is_finished() {
            self.reorg.release(job.id);
            self.finished(job);
        }
    }

    /// Load the new version locally and give the other nodes a bounded
    /// window to catch up before the next state is entered.
    async fn publish(&self, version: SchemaVersion) {
        falcon_observability::record_schema_version(version.0);
        if let Err(e) = self.syncer.refresh().await {
            tracing::warn!(version = %version, error = %e, "local schema reload failed");
        }
        if !self
            .syncer
            .wait_synced(version, self.config.schema_sync_lease())
            .await
        {
            tracing::warn!(version = %version, "proceeding before every node loaded the schema");
        }
    }

    fn finished(&self, job: &Job) {
        falcon_observability::record_ddl_job_finished(job.action.as_str(), job.state.as_str());
        let err = job
            .error
            .as_ref()
            .filter(|_| job.state != JobState::Done)
            .map(|e| FalconError::Internal(e.message.clone()));
        self.callback.on_changed(err.as_ref());
        tracing::info!(
            "finish DDL job ID:{}, Type:{}, State:{}, ErrorCount:{}",
            job.id.0,
            job.action,
            job.state,
            job.error_count
        );
    }

    /// Errors that are not about the job itself.
    fn on_infra_error(&self, id: JobId, e: FalconError) -> StepResult {
        if e.ddl_class() == DdlErrorClass::OwnerLost {
            tracing::info!(job = %id, error = %e, "stopping job, ownership lost");
            return StepResult::OwnerLost;
        }
        tracing::warn!(job = %id, error = %e, "DDL job step could not run");
        StepResult::Backoff(backoff(&e))
    }

    /// A step found the job cannot proceed. A job that has changed nothing
    /// yet is cancelled outright; anything already visible is handed to
    /// the rollback converter. A failing rollback is cancelled for good.
    async fn cancel_after_failure(&self, id: JobId, err: JobError) -> StepResult {
        let mut txn = MetaTxn::new(self.store.clone());
        let loaded = match self.election.fence(&mut txn).await {
            Ok(()) => txn.get_job(id).await,
            Err(e) => Err(e),
        };
        let mut job = match loaded {
            Ok(Some(job)) => job,
            Ok(None) => return StepResult::Finished,
            Err(e) => return self.on_infra_error(id, e),
        };
        job.error_count += 1;
        job.error = Some(err);

        match job.state {
            JobState::Rollingback | JobState::Cancelling => {
                self.reorg.release(id);
                job.state = JobState::Cancelled;
            }
            _ if can_cancel_outright(&job) => job.state = JobState::Cancelled,
            _ => job.state = JobState::Cancelling,
        }
        tracing::warn!(
            job = %job.id,
            state = %job.state,
            error = ?job.error,
            "DDL job step failed validation"
        );
        match self.commit_step(txn, &job).await {
            Ok(version) => {
                self.after_commit(&job, version).await;
                if job.is_finished() {
                    StepResult::Finished
                } else {
                    StepResult::Advanced
                }
            }
            Err(e) => self.on_infra_error(id, e),
        }
    }

    /// Count a failed attempt. Past the limit, a running job is cancelled
    /// and a job that is already unwinding is given up on.
    async fn record_step_error(&self, id: JobId, e: FalconError) -> StepResult {
        match e.ddl_class() {
            DdlErrorClass::OwnerLost => return self.on_infra_error(id, e),
            _ if matches!(e, FalconError::Ddl(DdlError::ReorgPending(_))) => {
                return StepResult::Yield;
            }
            _ => {}
        }
        let delay = backoff(&e);
        let limit = self.config.ddl.error_count_limit;

        let mut txn = MetaTxn::new(self.store.clone());
        let loaded = match self.election.fence(&mut txn).await {
            Ok(()) => txn.get_job(id).await,
            Err(fence) => Err(fence),
        };
        let mut job = match loaded {
            Ok(Some(job)) => job,
            Ok(None) => return StepResult::Finished,
            Err(err) => return self.on_infra_error(id, err),
        };
        job.error_count += 1;
        job.error = Some(JobError::from(&e));
        tracing::warn!(
            "run DDL job error, job ID:{}, state:{}, error count:{}, err:{}",
            job.id.0,
            job.state,
            job.error_count,
            e
        );
        falcon_observability::record_ddl_step(job.action.as_str(), job.schema_state.to_string().as_str(), "retry");

        if job.error_count > limit {
            match job.state {
                JobState::Running if is_job_rollbackable(&job) => {
                    tracing::warn!(job = %job.id, limit, "DDL job error count exceed the limit, cancelling it");
                    job.state = JobState::Cancelling;
                }
                JobState::Cancelling | JobState::Rollingback => {
                    tracing::warn!(
                        job = %job.id,
                        limit,
                        "rollback DDL job error count exceed the limit, cancelled it now"
                    );
                    let exhausted = DdlError::RollbackExhausted { job_id: job.id, limit };
                    job.error = Some(JobError::new(JobErrorCode::RollbackExhausted, exhausted.to_string()));
                    job.state = JobState::Cancelled;
                    self.reorg.release(id);
                }
                _ => {}
            }
        }

        match self.commit_step(txn, &job).await {
            Ok(version) => {
                self.after_commit(&job, version).await;
                if job.is_finished() {
                    StepResult::Finished
                } else {
                    StepResult::Backoff(delay)
                }
            }
            Err(err) => self.on_infra_error(id, err),
        }
    }
}

/// An optimistic conflict on something other than the owner term. Owner
/// term conflicts are already mapped to ownership loss.
fn is_commit_conflict(e: &FalconError) -> bool {
    matches!(e, FalconError::Meta(MetaError::VersionConflict { .. }))
}

fn backoff(e: &FalconError) -> Duration {
    Duration::from_millis(e.retry_after_ms().max(10))
}

/// Nothing about the job is visible yet: its object is still at the
/// initial state, no backfill was launched and no sub-job has started.
fn can_cancel_outright(job: &Job) -> bool {
    if job.schema_state != job.action.policy().initial_state() || job.snapshot_ver != 0 {
        return false;
    }
    job.multi_schema_info.as_ref().map_or(true, |info| {
        info.sub_jobs
            .iter()
            .all(|s| matches!(s.state, JobState::Queueing | JobState::Cancelled))
    })
}

/// Running jobs only move forward along their sequence; rolling-back jobs
/// never make an object more visible.
fn check_monotonic(job: &Job, before: (JobState, falcon_common::schema::SchemaState)) -> FalconResult<()> {
    let (state_before, schema_before) = before;
    let ok = match (state_before, job.state) {
        (JobState::Running, JobState::Running | JobState::Done) => {
            is_forward_transition(job.action, schema_before, job.schema_state)
        }
        (JobState::Rollingback, JobState::Rollingback | JobState::RollbackDone) => {
            job.schema_state.visibility_rank() <= schema_before.visibility_rank()
        }
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(FalconError::internal_bug(
            "DDL-STEP-001",
            format!(
                "job {} moved {} -> {} while {}",
                job.id, schema_before, job.schema_state, state_before
            ),
            job.to_string(),
        ))
    }
}
