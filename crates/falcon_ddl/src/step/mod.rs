//! Single-step state machine.
//!
//! A step reads the job's target objects inside the caller's transaction,
//! advances them by at most one schema state, bumps the schema version when
//! something visible changed, and mutates the job record. The caller commits
//! everything atomically, so a crash between steps leaves the job exactly at
//! its last committed state and re-running the step is safe.

mod column;
mod constraint;
mod index;
mod multi;
mod partition;
mod schema;
mod table;

use std::time::Duration;

use falcon_common::error::{DdlError, DdlErrorClass, FalconError, FalconResult};
use falcon_common::schema::TableInfo;

use crate::job::{ActionType, DeleteRange, Job, JobError, JobState};
use crate::reorg::{BackfillRequest, ReorgElement, ReorgResult, ReorgWait, ReorgWorkerPool};
use crate::txn::{MetaTxn, SchemaDiff};

pub(crate) use column::needs_data_change;
pub(crate) use multi::check_sub_jobs;

/// Result of one step.
#[derive(Debug)]
pub enum StepOutcome {
    /// The job advanced (or is waiting); commit and continue.
    Continue,
    /// The step found the job cannot proceed. Step writes are discarded; the
    /// worker decides between cancelling outright and rolling back.
    Cancelled(JobError),
    /// Transient failure. Step writes are discarded and the step is retried.
    Retry(FalconError),
}

/// What a step may touch besides the job itself.
pub struct StepContext<'a> {
    pub txn: &'a mut MetaTxn,
    pub reorg: &'a dyn ReorgWorkerPool,
    pub reorg_wait: Duration,
    pub reorg_stop: Duration,
}

impl StepContext<'_> {
    /// Bump the schema version for `job` and remember it on the job.
    pub(crate) async fn bump(&mut self, job: &mut Job) -> FalconResult<()> {
        self.bump_with(job, SchemaDiff::for_job(job)).await
    }

    pub(crate) async fn bump_with(&mut self, job: &mut Job, diff: SchemaDiff) -> FalconResult<()> {
        let v = self.txn.bump_schema_version(diff).await?;
        job.schema_version = v;
        Ok(())
    }

    /// Persist `table`, bumping the version first when `bump` is set.
    pub(crate) async fn update_table(&mut self, job: &mut Job, table: &TableInfo, bump: bool) -> FalconResult<()> {
        if bump {
            self.bump(job).await?;
        }
        self.txn.put_table(table)
    }

    /// Load the job's table. A missing table is a validation failure, which
    /// cancels the job.
    pub(crate) async fn table_or_cancel(&mut self, job: &Job) -> FalconResult<TableInfo> {
        self.txn.must_get_table(job.schema_id, job.table_id).await
    }

    /// Inside a revertible multi-schema change, stop the sub-job right
    /// before its point of no return and mark it non-revertible. Returns
    /// `true` when the caller must return without taking the step.
    pub(crate) fn hold_before_point_of_no_return(&self, job: &mut Job) -> bool {
        match job.proxy.as_mut() {
            Some(proxy) if proxy.revertible => {
                proxy.revertible = false;
                true
            }
            _ => false,
        }
    }
}

/// Run one step of `job`, classifying failures.
pub async fn run_step(ctx: &mut StepContext<'_>, job: &mut Job) -> StepOutcome {
    match dispatch(ctx, job).await {
        Ok(()) => StepOutcome::Continue,
        Err(e) => match e.ddl_class() {
            DdlErrorClass::Validation | DdlErrorClass::ReorgWorker => {
                StepOutcome::Cancelled(JobError::from(&e))
            }
            _ => StepOutcome::Retry(e),
        },
    }
}

pub(crate) async fn dispatch(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    match job.state {
        JobState::Cancelling => return crate::rollback::convert_job_to_rollback(ctx, job).await,
        JobState::Pausing => return pause(ctx, job).await,
        _ => {}
    }
    if !job.args.matches(job.action) && !job.is_rolling_back() {
        return Err(DdlError::InvalidJobArgs(format!(
            "arguments do not match action {}",
            job.action
        ))
        .into());
    }
    let rolling_back = job.is_rolling_back();
    match job.action {
        ActionType::CreateSchema => schema::on_create_schema(ctx, job).await,
        ActionType::DropSchema => schema::on_drop_schema(ctx, job).await,
        ActionType::ModifySchemaCharsetAndCollate => schema::on_modify_schema_charset(ctx, job).await,
        ActionType::CreateTable => table::on_create_table(ctx, job).await,
        ActionType::DropTable => table::on_drop_table(ctx, job).await,
        ActionType::TruncateTable => table::on_truncate_table(ctx, job).await,
        ActionType::RenameTable => table::on_rename_table(ctx, job).await,
        ActionType::RebaseAutoId => table::on_rebase_auto_id(ctx, job).await,
        ActionType::ShardRowId => table::on_shard_row_id(ctx, job).await,
        ActionType::ModifyTableCharsetAndCollate => table::on_modify_table_charset(ctx, job).await,
        ActionType::ModifyTableAutoIdCache => table::on_modify_table_auto_id_cache(ctx, job).await,
        ActionType::AddColumn if rolling_back => column::on_drop_column(ctx, job).await,
        ActionType::AddColumn => column::on_add_column(ctx, job).await,
        ActionType::DropColumn => column::on_drop_column(ctx, job).await,
        ActionType::ModifyColumn => column::on_modify_column(ctx, job).await,
        ActionType::AddIndex | ActionType::AddPrimaryKey if rolling_back => {
            index::on_drop_index(ctx, job).await
        }
        ActionType::AddIndex => index::on_create_index(ctx, job, false).await,
        ActionType::AddPrimaryKey => index::on_create_index(ctx, job, true).await,
        ActionType::DropIndex | ActionType::DropPrimaryKey => index::on_drop_index(ctx, job).await,
        ActionType::RenameIndex => index::on_rename_index(ctx, job).await,
        ActionType::AlterIndexVisibility => index::on_alter_index_visibility(ctx, job).await,
        ActionType::AddTablePartition | ActionType::ReorganizePartition if rolling_back => {
            partition::on_drop_adding_partitions(ctx, job).await
        }
        ActionType::AddTablePartition => partition::on_add_table_partition(ctx, job).await,
        ActionType::DropTablePartition => partition::on_drop_table_partition(ctx, job).await,
        ActionType::TruncateTablePartition => partition::on_truncate_table_partition(ctx, job).await,
        ActionType::ReorganizePartition => partition::on_reorganize_partition(ctx, job).await,
        ActionType::AddCheckConstraint if rolling_back => {
            constraint::on_drop_check_constraint(ctx, job).await
        }
        ActionType::AddCheckConstraint => constraint::on_add_check_constraint(ctx, job).await,
        ActionType::DropCheckConstraint => constraint::on_drop_check_constraint(ctx, job).await,
        ActionType::AlterCheckConstraint => constraint::on_alter_check_constraint(ctx, job).await,
        ActionType::AddForeignKey => constraint::on_add_foreign_key(ctx, job).await,
        ActionType::DropForeignKey => constraint::on_drop_foreign_key(ctx, job).await,
        ActionType::MultiSchemaChange => multi::on_multi_schema_change(ctx, job).await,
    }
}

/// Whether the job has backfill workers that must be stopped before its
/// metadata is rolled back or the job is parked.
pub(crate) fn needs_stop_reorg(job: &Job) -> bool {
    job.action.policy().needs_reorg
        && job.schema_state == falcon_common::schema::SchemaState::WriteReorganization
        && job.snapshot_ver != 0
        && job.proxy.map_or(true, |p| p.revertible)
}

async fn pause(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    if needs_stop_reorg(job) || ctx.reorg.is_tracked(job.id) {
        if !ctx.reorg.stop(job.id, ctx.reorg_stop).await {
            tracing::warn!(job = %job.id, "backfill did not stop in time, pausing anyway");
        }
        ctx.reorg.release(job.id);
    }
    job.state = JobState::Paused;
    tracing::info!(job = %job.id, "DDL job paused");
    Ok(())
}

/// Progress of the backfill phase.
pub(crate) enum ReorgProgress {
    /// Workers were just launched; the snapshot version is now recorded.
    Started,
    Completed,
}

/// Drive the backfill of `element`. Launches workers on first entry,
/// otherwise waits (bounded) for their result. Yields the worker with
/// `ReorgPending` while the backfill is still running.
pub(crate) async fn run_reorg(
    ctx: &mut StepContext<'_>,
    job: &mut Job,
    element: ReorgElement,
) -> FalconResult<ReorgProgress> {
    // A sub-job parked at its last revertible point already backfilled.
    if job.proxy.is_some_and(|p| !p.revertible) {
        return Ok(ReorgProgress::Completed);
    }
    if job.snapshot_ver == 0 {
        let snapshot = ctx.txn.schema_version().await?.0.max(1);
        ctx.reorg
            .start_backfill(request(job, element, snapshot))
            .await?;
        job.snapshot_ver = snapshot;
        return Ok(ReorgProgress::Started);
    }
    match ctx.reorg.wait_result(job.id, ctx.reorg_wait).await {
        ReorgWait::Unknown => {
            // Started by a previous owner; pick it up from the recorded snapshot.
            tracing::info!(job = %job.id, snapshot = job.snapshot_ver, "restarting backfill");
            ctx.reorg
                .start_backfill(request(job, element, job.snapshot_ver))
                .await?;
            Err(DdlError::ReorgPending(job.id).into())
        }
        ReorgWait::Pending => Err(DdlError::ReorgPending(job.id).into()),
        ReorgWait::Done(ReorgResult::Completed { rows }) => {
            ctx.reorg.release(job.id);
            job.row_count = rows;
            Ok(ReorgProgress::Completed)
        }
        ReorgWait::Done(ReorgResult::Failed(msg)) => {
            ctx.reorg.release(job.id);
            Err(DdlError::Reorg(msg).into())
        }
        ReorgWait::Done(ReorgResult::Cancelled) => {
            ctx.reorg.release(job.id);
            Err(DdlError::Reorg("reorganization was cancelled".into()).into())
        }
    }
}

fn request(job: &Job, element: ReorgElement, snapshot_ver: u64) -> BackfillRequest {
    BackfillRequest {
        job_id: job.id,
        schema_id: job.schema_id,
        table_id: job.table_id,
        element,
        snapshot_ver,
    }
}

pub(crate) fn delete_range(physical_id: u64) -> DeleteRange {
    DeleteRange {
        physical_id,
        index_id: None,
    }
}

pub(crate) fn index_delete_ranges(table: &TableInfo, index_id: u64) -> Vec<DeleteRange> {
    table
        .physical_ids()
        .into_iter()
        .map(|physical_id| DeleteRange {
            physical_id,
            index_id: Some(index_id),
        })
        .collect()
}

pub(crate) fn invalid_args(job: &Job) -> FalconError {
    DdlError::InvalidJobArgs(format!("job {} ({}) has unexpected arguments", job.id, job.action)).into()
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use falcon_common::schema::{ColumnInfo, DatabaseInfo, IndexInfo, SchemaState, TableInfo};
    use falcon_common::types::{ColumnId, IndexId, JobId, SchemaId, TableId};

    use super::*;
    use crate::job::JobArgs;
    use crate::meta::{MemMetaStore, MetaStore};
    use crate::reorg::{LocalReorgPool, NoopBackfill};

    pub struct Harness {
        pub mem: Arc<MemMetaStore>,
        pub store: Arc<dyn MetaStore>,
        pub pool: LocalReorgPool,
    }

    impl Harness {
        pub async fn new() -> Self {
            let mem = Arc::new(MemMetaStore::new());
            let store: Arc<dyn MetaStore> = mem.clone();
            let mut txn = MetaTxn::new(store.clone());
            txn.put_database(&DatabaseInfo::new(SchemaId(1), "test")).unwrap();
            let mut t = TableInfo::new(TableId(2), SchemaId(1), "t");
            t.state = SchemaState::Public;
            t.columns.push(ColumnInfo::new(ColumnId(3), "id", "bigint").not_null().with_state(SchemaState::Public));
            t.columns.push(ColumnInfo::new(ColumnId(4), "a", "int").with_state(SchemaState::Public));
            t.indices.push(IndexInfo {
                id: IndexId(5),
                name: "idx_a".into(),
                columns: vec!["a".into()],
                unique: false,
                primary: false,
                invisible: false,
                state: SchemaState::Public,
            });
            txn.put_table(&t).unwrap();
            txn.put(crate::meta::MetaKey::GlobalId, &100u64).unwrap();
            txn.commit().await.unwrap();
            Self {
                mem,
                store,
                pool: LocalReorgPool::new(Arc::new(NoopBackfill), 2),
            }
        }

        pub fn job(&self, action: ActionType, args: JobArgs) -> Job {
            let mut job = Job::new(JobId(50), action, SchemaId(1), TableId(2), args);
            job.state = JobState::Running;
            job
        }

        /// Run one step and commit it if it continued.
        pub async fn step(&self, job: &mut Job) -> StepOutcome {
            let mut txn = MetaTxn::new(self.store.clone());
            let outcome = {
                let mut ctx = StepContext {
                    txn: &mut txn,
                    reorg: &self.pool,
                    reorg_wait: Duration::from_secs(2),
                    reorg_stop: Duration::from_secs(2),
                };
                run_step(&mut ctx, job).await
            };
            if matches!(outcome, StepOutcome::Continue) {
                txn.commit().await.unwrap();
            }
            outcome
        }

        /// Step until the job is finished, failing after `limit` steps.
        pub async fn run_to_end(&self, job: &mut Job, limit: usize) {
            for _ in 0..limit {
                if job.is_finished() {
                    return;
                }
                match self.step(job).await {
                    StepOutcome::Continue => {}
                    StepOutcome::Retry(e) if e.ddl_class() == DdlErrorClass::TransientStore => {}
                    other => panic!("unexpected outcome {other:?} for {job}"),
                }
            }
            assert!(job.is_finished(), "job did not finish: {job}");
        }

        pub async fn table(&self) -> TableInfo {
            MetaTxn::new(self.store.clone())
                .must_get_table(SchemaId(1), TableId(2))
                .await
                .unwrap()
        }

        pub async fn version(&self) -> u64 {
            MetaTxn::new(self.store.clone()).schema_version().await.unwrap().0
        }
    }
}
