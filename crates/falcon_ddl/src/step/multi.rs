//! Composite ALTER TABLE: several sub-jobs applied under one job id.
//!
//! Sub-jobs run through a transient proxy job so the single-object step
//! functions can drive them unchanged. While the composite is revertible,
//! each sub-job is advanced only up to its last revertible point; once all
//! of them are parked there the composite becomes non-revertible and the
//! sub-jobs are finished one by one. Rollback unwinds them in reverse order.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use falcon_common::error::{DdlError, FalconError, FalconResult};
use falcon_common::schema::SchemaState;

use super::StepContext;
use crate::job::{Job, JobArgs, JobState, MultiSchemaInfo, ProxyInfo, SubJob, SubJobSpec};

type StepFuture<'a> = Pin<Box<dyn Future<Output = FalconResult<()>> + Send + 'a>>;

/// Sub-job steps re-enter the dispatcher; boxing breaks the async cycle.
fn dispatch_boxed<'a, 'b>(ctx: &'a mut StepContext<'b>, job: &'a mut Job) -> StepFuture<'a> {
    Box::pin(super::dispatch(ctx, job))
}

/// Reject composite requests that cannot be run as one job.
pub(crate) fn check_sub_jobs(specs: &[SubJobSpec]) -> FalconResult<()> {
    if specs.is_empty() {
        return Err(DdlError::InvalidJobArgs("multi-schema change without sub-jobs".into()).into());
    }
    let mut touched = HashSet::new();
    for spec in specs {
        if !spec.action.allowed_in_multi_schema_change() {
            return Err(DdlError::InvalidJobArgs(format!(
                "{} is not supported in a multi-schema change",
                spec.action
            ))
            .into());
        }
        if !spec.args.matches(spec.action) {
            return Err(DdlError::InvalidJobArgs(format!(
                "arguments do not match sub-job action {}",
                spec.action
            ))
            .into());
        }
        for (kind, name) in targets(&spec.args) {
            if !touched.insert((kind, name.to_ascii_lowercase())) {
                return Err(DdlError::InvalidJobArgs(format!(
                    "{kind} {name} is changed more than once"
                ))
                .into());
            }
        }
    }
    Ok(())
}

fn targets(args: &JobArgs) -> Vec<(&'static str, &str)> {
    match args {
        JobArgs::AddColumn { column } => vec![("column", column.name.as_str())],
        JobArgs::DropColumn { name } | JobArgs::ModifyColumn { name, .. } => {
            vec![("column", name.as_str())]
        }
        JobArgs::AddIndex { name, .. }
        | JobArgs::DropIndex { name, .. }
        | JobArgs::AlterIndexVisibility { name, .. } => vec![("index", name.as_str())],
        JobArgs::RenameIndex { from, to } => vec![("index", from.as_str()), ("index", to.as_str())],
        _ => Vec::new(),
    }
}

fn to_proxy(parent: &Job, index: usize, sub: &SubJob) -> Job {
    let mut proxy = Job::new(parent.id, sub.action, parent.schema_id, parent.table_id, sub.args.clone());
    proxy.schema_state = sub.schema_state;
    proxy.state = match sub.state {
        JobState::Queueing => JobState::Running,
        other => other,
    };
    proxy.snapshot_ver = sub.snapshot_ver;
    proxy.row_count = sub.row_count;
    proxy.error_count = parent.error_count;
    proxy.schema_version = parent.schema_version;
    proxy.submitted_at_ms = parent.submitted_at_ms;
    proxy.proxy = Some(ProxyInfo {
        sub_index: index,
        revertible: sub.revertible,
    });
    proxy
}

fn from_proxy(parent: &mut Job, sub: &mut SubJob, proxy: Job) {
    sub.schema_state = proxy.schema_state;
    sub.state = proxy.state;
    sub.args = proxy.args;
    sub.snapshot_ver = proxy.snapshot_ver;
    sub.row_count = proxy.row_count;
    if let Some(p) = proxy.proxy {
        sub.revertible = p.revertible;
    }
    parent.schema_version = parent.schema_version.max(proxy.schema_version);
    parent.delete_ranges.extend(proxy.delete_ranges);
    if let Some(err) = proxy.error {
        parent.record_error_if_none(err);
    }
}

/// Take one step of sub-job `index`.
async fn run_sub_job(ctx: &mut StepContext<'_>, parent: &mut Job, index: usize) -> FalconResult<()> {
    let Some(info) = parent.multi_schema_info.as_ref() else {
        return Err(missing_info(parent));
    };
    let Some(sub) = info.sub_jobs.get(index) else {
        return Err(missing_info(parent));
    };
    let mut proxy = to_proxy(parent, index, sub);
    let result = dispatch_boxed(ctx, &mut proxy).await;
    tracing::debug!(
        job = %parent.id,
        sub_job = index,
        action = %proxy.action,
        state = %proxy.state,
        schema_state = %proxy.schema_state,
        "sub-job step"
    );
    result?;
    let mut info = parent.multi_schema_info.take().ok_or_else(|| missing_info(parent))?;
    if let Some(sub) = info.sub_jobs.get_mut(index) {
        from_proxy(parent, sub, proxy);
    }
    parent.multi_schema_info = Some(info);
    Ok(())
}

fn missing_info(job: &Job) -> FalconError {
    DdlError::InvalidJobArgs(format!("job {} has no multi-schema info", job.id)).into()
}

fn is_finished(sub: &SubJob) -> bool {
    sub.state.is_terminal()
}

pub(super) async fn on_multi_schema_change(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let info: MultiSchemaInfo = job.multi_schema_info.clone().ok_or_else(|| missing_info(job))?;

    if job.is_rolling_back() {
        let next = (0..info.sub_jobs.len())
            .rev()
            .find(|&i| !is_finished(&info.sub_jobs[i]));
        return match next {
            Some(i) => run_sub_job(ctx, job, i).await,
            None => {
                job.finish(JobState::RollbackDone, SchemaState::None);
                Ok(())
            }
        };
    }

    if info.revertible {
        // Advance the first sub-job that has not reached its last
        // revertible point.
        let next = info
            .sub_jobs
            .iter()
            .position(|s| s.revertible && !is_finished(s));
        return match next {
            Some(i) => run_sub_job(ctx, job, i).await,
            None => {
                if let Some(info) = job.multi_schema_info.as_mut() {
                    info.revertible = false;
                }
                tracing::info!(job = %job.id, "multi-schema change is no longer revertible");
                Ok(())
            }
        };
    }

    match info.sub_jobs.iter().position(|s| !is_finished(s)) {
        Some(i) => run_sub_job(ctx, job, i).await,
        None => {
            job.finish(JobState::Done, SchemaState::Public);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::Harness;
    use super::super::StepOutcome;
    use super::*;
    use crate::job::{ActionType, ColumnSpec};

    fn add_column(name: &str) -> SubJobSpec {
        SubJobSpec {
            action: ActionType::AddColumn,
            args: JobArgs::AddColumn {
                column: ColumnSpec {
                    name: name.into(),
                    data_type: "int".into(),
                    nullable: true,
                    default_value: None,
                },
            },
        }
    }

    fn add_index(name: &str, col: &str) -> SubJobSpec {
        SubJobSpec {
            action: ActionType::AddIndex,
            args: JobArgs::AddIndex {
                name: name.into(),
                columns: vec![col.into()],
                unique: false,
            },
        }
    }

    #[test]
    fn test_check_sub_jobs_rejects_duplicates_and_unsupported() {
        assert!(check_sub_jobs(&[add_column("b"), add_column("c")]).is_ok());
        assert!(check_sub_jobs(&[add_column("b"), add_column("B")]).is_err());
        let drop_table = SubJobSpec {
            action: ActionType::DropTable,
            args: JobArgs::DropTable,
        };
        assert!(check_sub_jobs(&[drop_table]).is_err());
        assert!(check_sub_jobs(&[]).is_err());
    }

    #[tokio::test]
    async fn test_sub_jobs_park_then_finish_together() {
        let h = Harness::new().await;
        let specs = vec![add_column("b"), add_index("idx_id", "id")];
        let mut job = h.job(
            ActionType::MultiSchemaChange,
            JobArgs::MultiSchemaChange { sub_jobs: specs },
        );

        // Revertible phase: neither sub-job becomes public.
        while job.multi_schema_info.as_ref().unwrap().revertible {
            match h.step(&mut job).await {
                StepOutcome::Continue => {}
                StepOutcome::Retry(_) => {}
                other => panic!("unexpected {other:?}"),
            }
            let t = h.table().await;
            assert_ne!(t.column("b").map(|c| c.state), Some(SchemaState::Public));
            assert_ne!(t.index("idx_id").map(|i| i.state), Some(SchemaState::Public));
        }
        let info = job.multi_schema_info.as_ref().unwrap();
        assert!(info.sub_jobs.iter().all(|s| !s.revertible));
        assert_eq!(info.sub_jobs[0].schema_state, SchemaState::WriteReorganization);

        h.run_to_end(&mut job, 10).await;
        assert_eq!(job.state, JobState::Done);
        let t = h.table().await;
        assert_eq!(t.column("b").unwrap().state, SchemaState::Public);
        assert_eq!(t.index("idx_id").unwrap().state, SchemaState::Public);
    }

    #[tokio::test]
    async fn test_failing_sub_job_surfaces_as_cancel() {
        let h = Harness::new().await;
        let specs = vec![add_column("b"), add_index("idx_x", "nope")];
        let mut job = h.job(
            ActionType::MultiSchemaChange,
            JobArgs::MultiSchemaChange { sub_jobs: specs },
        );
        let mut outcome = h.step(&mut job).await;
        for _ in 0..10 {
            if !matches!(outcome, StepOutcome::Continue) {
                break;
            }
            outcome = h.step(&mut job).await;
        }
        assert!(matches!(outcome, StepOutcome::Cancelled(_)));
        // The first sub-job is parked, never public.
        let info = job.multi_schema_info.as_ref().unwrap();
        assert!(!info.sub_jobs[0].revertible);
        assert_eq!(h.table().await.column("b").unwrap().state, SchemaState::WriteReorganization);
    }
}
