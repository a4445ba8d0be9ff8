//! Rollback converter.
//!
//! Runs when a job is `Cancelling`. Looks up the action's
//! [`RollbackPolicy`] and, with the current catalog in hand, decides
//! between cancelling outright (nothing to undo), converting the job into
//! its inverse and driving it backwards, or refusing because the job is
//! already past its point of no return.

use falcon_common::error::{DdlError, FalconError, FalconResult};
use falcon_common::schema::{SchemaState, TableInfo};

use crate::job::{Job, JobArgs, JobError, JobState};
use crate::policy::RollbackPolicy;
use crate::step::{needs_stop_reorg, StepContext};

pub use crate::policy::is_job_rollbackable;

const ROLLBACK_MSG_PREFIX: &str = "DDL job rollback, error msg: ";

/// What the converter decided for a cancelling job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackDecision {
    /// Nothing visible was changed; the job ends `Cancelled`.
    Cancelled,
    /// The job now runs its inverse as `Rollingback`.
    RolledBack,
    /// Too late to undo; the job goes back to `Running`.
    Refused,
}

impl RollbackDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            RollbackDecision::Cancelled => "cancelled",
            RollbackDecision::RolledBack => "rolled_back",
            RollbackDecision::Refused => "refused",
        }
    }
}

/// Decide and apply the compensating path for a `Cancelling` job. Errors
/// are left to the worker, which counts them and gives up past the limit.
pub(crate) async fn convert_job_to_rollback(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    if needs_stop_reorg(job) || ctx.reorg.is_tracked(job.id) {
        if !ctx.reorg.stop(job.id, ctx.reorg_stop).await {
            tracing::warn!(job = %job.id, "backfill has not stopped yet, retrying rollback later");
            return Err(DdlError::ReorgPending(job.id).into());
        }
        ctx.reorg.release(job.id);
    }

    let decision = decide(ctx, job).await?;
    match decision {
        RollbackDecision::Cancelled => job.state = JobState::Cancelled,
        RollbackDecision::RolledBack => job.state = JobState::Rollingback,
        RollbackDecision::Refused => job.state = JobState::Running,
    }
    if decision != RollbackDecision::Refused {
        job.error_count += 1;
        annotate_error(job);
    }

    falcon_observability::record_ddl_rollback_decision(job.action.as_str(), decision.as_str());
    tracing::info!(
        job = %job.id,
        action = %job.action,
        decision = decision.as_str(),
        schema_state = %job.schema_state,
        "rollback decision"
    );
    Ok(())
}

/// A plain cancel records "Cancelled DDL job"; a job unwound because of
/// an error keeps that error, prefixed once.
fn annotate_error(job: &mut Job) {
    match job.error.as_mut() {
        None => job.error = Some(JobError::cancelled()),
        Some(err) if !err.is_plain_cancel() && !err.message.starts_with(ROLLBACK_MSG_PREFIX) => {
            err.message = format!("{ROLLBACK_MSG_PREFIX}{}", err.message);
        }
        Some(_) => {}
    }
}

async fn decide(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<RollbackDecision> {
    use RollbackDecision::*;

    match job.action.policy().rollback {
        RollbackPolicy::CancelDirectly => Ok(Cancelled),
        RollbackPolicy::CancelOnlyNotHandled {
            initial,
            check_table,
        } => {
            if job.schema_state != initial {
                return Ok(Refused);
            }
            if check_table {
                if let Err(e) = ctx.txn.must_get_table(job.schema_id, job.table_id).await {
                    job.record_error_if_none(JobError::from(&e));
                }
            }
            Ok(Cancelled)
        }
        RollbackPolicy::AddColumn => rollback_add_column(ctx, job).await,
        RollbackPolicy::AddIndex { primary } => rollback_add_index(ctx, job, primary).await,
        RollbackPolicy::AddTablePartition => rollback_adding_partitions(ctx, job).await,
        RollbackPolicy::ReorganizePartition => {
            if job.schema_state == SchemaState::None {
                return Ok(Cancelled);
            }
            rollback_adding_partitions(ctx, job).await
        }
        RollbackPolicy::ModifyColumn => rollback_modify_column(ctx, job).await,
        RollbackPolicy::AddCheckConstraint => rollback_add_check(ctx, job).await,
        RollbackPolicy::DropColumn => {
            let JobArgs::DropColumn { name } = job.args.clone() else {
                return Err(unexpected_args(job));
            };
            let Some(table) = load_table(ctx, job).await? else {
                return Ok(Cancelled);
            };
            let Some(col) = table.column(&name) else {
                return Ok(Cancelled);
            };
            let dependent_moving = table
                .single_column_indices(&name)
                .iter()
                .filter_map(|i| table.index(i))
                .any(|i| i.state != SchemaState::Public);
            if dependent_moving {
                return Ok(Refused);
            }
            Ok(if col.state == SchemaState::Public {
                Cancelled
            } else {
                Refused
            })
        }
        RollbackPolicy::DropIndex => {
            let JobArgs::DropIndex { name, .. } = job.args.clone() else {
                return Err(unexpected_args(job));
            };
            let Some(table) = load_table(ctx, job).await? else {
                return Ok(Cancelled);
            };
            match table.index(&name).map(|i| i.state) {
                None => Ok(Cancelled),
                Some(SchemaState::Public) => Ok(Cancelled),
                Some(
                    SchemaState::WriteOnly
                    | SchemaState::DeleteOnly
                    | SchemaState::DeleteReorganization
                    | SchemaState::None,
                ) => Ok(Refused),
                Some(other) => Err(DdlError::InvalidDdlState {
                    object: "index",
                    state: other,
                }
                .into()),
            }
        }
        RollbackPolicy::DropTable => {
            let Some(table) = load_table(ctx, job).await? else {
                return Ok(Cancelled);
            };
            Ok(if table.state == SchemaState::Public {
                Cancelled
            } else {
                Refused
            })
        }
        RollbackPolicy::DropSchema => match ctx.txn.get_database(job.schema_id).await? {
            Some(db) if db.state != SchemaState::Public => Ok(Refused),
            _ => Ok(Cancelled),
        },
        RollbackPolicy::DropCheckConstraint => {
            let JobArgs::DropCheckConstraint { name } = job.args.clone() else {
                return Err(unexpected_args(job));
            };
            let Some(table) = load_table(ctx, job).await? else {
                return Ok(Cancelled);
            };
            match table.constraint(&name).map(|c| c.state) {
                Some(SchemaState::Public) | None => Ok(Cancelled),
                Some(_) => Ok(Refused),
            }
        }
        RollbackPolicy::RenameIndex => {
            let JobArgs::RenameIndex { from, .. } = job.args.clone() else {
                return Err(unexpected_args(job));
            };
            let Some(table) = load_table(ctx, job).await? else {
                return Ok(Cancelled);
            };
            Ok(match table.index(&from).map(|i| i.state) {
                Some(SchemaState::Public) => Cancelled,
                _ => Refused,
            })
        }
        RollbackPolicy::MultiSchemaChange => rollback_multi_schema_change(job),
    }
}

/// Load the job's table. A table that has disappeared leaves nothing to
/// undo; its not-found error is recorded on the job.
async fn load_table(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<Option<TableInfo>> {
    match ctx.txn.must_get_table(job.schema_id, job.table_id).await {
        Ok(t) => Ok(Some(t)),
        Err(e @ FalconError::Meta(_)) if e.is_user_error() => {
            job.record_error_if_none(JobError::from(&e));
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn unexpected_args(job: &Job) -> FalconError {
    DdlError::InvalidJobArgs(format!(
        "cannot roll back job {} ({}): unexpected arguments",
        job.id, job.action
    ))
    .into()
}

async fn rollback_add_column(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<RollbackDecision> {
    let name = match &job.args {
        JobArgs::AddColumn { column } => column.name.clone(),
        JobArgs::DropColumn { name } => name.clone(),
        _ => return Err(unexpected_args(job)),
    };
    let Some(mut table) = load_table(ctx, job).await? else {
        return Ok(RollbackDecision::Cancelled);
    };
    let Some(state) = table.column(&name).map(|c| c.state) else {
        return Ok(RollbackDecision::Cancelled);
    };
    job.args = JobArgs::DropColumn { name: name.clone() };
    job.schema_state = SchemaState::DeleteOnly;
    if state != SchemaState::DeleteOnly {
        if let Some(c) = table.column_mut(&name) {
            c.state = SchemaState::DeleteOnly;
        }
        ctx.update_table(job, &table, true).await?;
    }
    Ok(RollbackDecision::RolledBack)
}

async fn rollback_add_index(
    ctx: &mut StepContext<'_>,
    job: &mut Job,
    primary: bool,
) -> FalconResult<RollbackDecision> {
    let name = match &job.args {
        JobArgs::AddIndex { name, .. } | JobArgs::DropIndex { name, .. } => name.clone(),
        _ => return Err(unexpected_args(job)),
    };
    let Some(mut table) = load_table(ctx, job).await? else {
        return Ok(RollbackDecision::Cancelled);
    };
    let Some((state, columns)) = table.index(&name).map(|i| (i.state, i.columns.clone())) else {
        return Ok(RollbackDecision::Cancelled);
    };
    job.args = JobArgs::DropIndex {
        name: name.clone(),
        if_exists: false,
        partition_ids: Vec::new(),
    };
    job.schema_state = SchemaState::DeleteOnly;

    let mut changed = state != SchemaState::DeleteOnly;
    if let Some(i) = table.index_mut(&name) {
        i.state = SchemaState::DeleteOnly;
    }
    if primary {
        for c in &columns {
            if let Some(col) = table.column_mut(c) {
                if col.prevent_null_insert {
                    col.prevent_null_insert = false;
                    changed = true;
                }
            }
        }
    }
    if changed {
        ctx.update_table(job, &table, true).await?;
    }
    Ok(RollbackDecision::RolledBack)
}

async fn rollback_adding_partitions(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<RollbackDecision> {
    let Some(table) = load_table(ctx, job).await? else {
        return Ok(RollbackDecision::Cancelled);
    };
    let adding: Vec<String> = table
        .partition
        .as_ref()
        .map(|p| p.adding_definitions.iter().map(|d| d.name.clone()).collect())
        .unwrap_or_default();
    if adding.is_empty() {
        return Ok(RollbackDecision::Cancelled);
    }
    job.args = JobArgs::DropPartitions { names: adding };
    job.schema_state = SchemaState::DeleteOnly;
    ctx.bump(job).await?;
    Ok(RollbackDecision::RolledBack)
}

async fn rollback_modify_column(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<RollbackDecision> {
    let JobArgs::ModifyColumn { name, new_type, .. } = job.args.clone() else {
        return Err(unexpected_args(job));
    };
    let Some(table) = load_table(ctx, job).await? else {
        return Ok(RollbackDecision::Cancelled);
    };
    let Some(col) = table.column(&name) else {
        return Ok(RollbackDecision::Cancelled);
    };
    if crate::step::needs_data_change(col, &new_type) {
        return Ok(if table.changing_column_of(&name).is_some() {
            RollbackDecision::RolledBack
        } else {
            RollbackDecision::Cancelled
        });
    }
    Ok(match job.schema_state {
        SchemaState::None if col.prevent_null_insert => RollbackDecision::RolledBack,
        SchemaState::None => RollbackDecision::Cancelled,
        _ => RollbackDecision::Refused,
    })
}

async fn rollback_add_check(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<RollbackDecision> {
    let name = match &job.args {
        JobArgs::AddCheckConstraint { name, .. } | JobArgs::DropCheckConstraint { name } => name.clone(),
        _ => return Err(unexpected_args(job)),
    };
    let Some(mut table) = load_table(ctx, job).await? else {
        return Ok(RollbackDecision::Cancelled);
    };
    let Some(state) = table.constraint(&name).map(|c| c.state) else {
        return Ok(RollbackDecision::Cancelled);
    };
    job.args = JobArgs::DropCheckConstraint { name: name.clone() };
    job.schema_state = SchemaState::WriteOnly;
    if state != SchemaState::WriteOnly {
        if let Some(c) = table.constraint_mut(&name) {
            c.state = SchemaState::WriteOnly;
        }
        ctx.update_table(job, &table, true).await?;
    }
    Ok(RollbackDecision::RolledBack)
}

/// Flip every started sub-job to `Cancelling` and every queued one to
/// `Cancelled`; the composite then unwinds them in reverse order.
fn rollback_multi_schema_change(job: &mut Job) -> FalconResult<RollbackDecision> {
    let Some(info) = job.multi_schema_info.as_mut() else {
        return Err(unexpected_args(job));
    };
    if !info.revertible {
        return Ok(RollbackDecision::Refused);
    }
    let started = info
        .sub_jobs
        .iter()
        .any(|s| !matches!(s.state, JobState::Queueing | JobState::Cancelled));
    for sub in &mut info.sub_jobs {
        sub.state = match sub.state {
            JobState::Queueing => JobState::Cancelled,
            JobState::Running => JobState::Cancelling,
            other => other,
        };
    }
    Ok(if started {
        RollbackDecision::RolledBack
    } else {
        RollbackDecision::Cancelled
    })
}
