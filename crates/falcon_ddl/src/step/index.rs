use falcon_common::error::{DdlError, FalconResult};
use falcon_common::schema::{IndexInfo, SchemaState, TableInfo};
use falcon_common::types::IndexId;

use super::{index_delete_ranges, invalid_args, run_reorg, ReorgProgress, StepContext};
use crate::job::{Job, JobArgs};
use crate::reorg::ReorgElement;

fn check_index_columns(table: &TableInfo, columns: &[String]) -> FalconResult<()> {
    if columns.is_empty() {
        return Err(DdlError::Validation("index needs at least one column".into()).into());
    }
    for c in columns {
        match table.column(c) {
            Some(col) if col.state == SchemaState::Public => {}
            _ => return Err(DdlError::ColumnNotFound(c.clone()).into()),
        }
    }
    Ok(())
}

// ── ADD INDEX / ADD PRIMARY KEY ──────────────────────────────────────

pub(super) async fn on_create_index(
    ctx: &mut StepContext<'_>,
    job: &mut Job,
    is_pk: bool,
) -> FalconResult<()> {
    let JobArgs::AddIndex {
        name,
        columns,
        unique,
    } = job.args.clone()
    else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;

    let state = match table.index(&name) {
        Some(idx) if idx.state == SchemaState::Public => {
            return Err(DdlError::IndexExists(name).into());
        }
        Some(idx) => idx.state,
        None => SchemaState::None,
    };

    match state {
        SchemaState::None => {
            check_index_columns(&table, &columns)?;
            if is_pk && table.primary_index().is_some() {
                return Err(DdlError::Validation("multiple primary key defined".into()).into());
            }
            let id = ctx.txn.gen_global_id().await?;
            if is_pk {
                // Reject NULL writes into key columns while the index builds.
                for c in &columns {
                    if let Some(col) = table.column_mut(c) {
                        if col.nullable {
                            col.prevent_null_insert = true;
                        }
                    }
                }
            }
            table.indices.push(IndexInfo {
                id: IndexId(id),
                name,
                columns,
                unique: unique || is_pk,
                primary: is_pk,
                invisible: false,
                state: SchemaState::DeleteOnly,
            });
            job.schema_state = SchemaState::DeleteOnly;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::DeleteOnly => {
            set_index_state(&mut table, &name, SchemaState::WriteOnly);
            job.schema_state = SchemaState::WriteOnly;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::WriteOnly => {
            set_index_state(&mut table, &name, SchemaState::WriteReorganization);
            job.schema_state = SchemaState::WriteReorganization;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::WriteReorganization => {
            let Some(index_id) = table.index(&name).map(|i| i.id) else {
                return Err(DdlError::IndexNotFound(name).into());
            };
            let element = ReorgElement::Index {
                index_id,
                name: name.clone(),
                columns: columns.clone(),
                unique: unique || is_pk,
            };
            match run_reorg(ctx, job, element).await? {
                ReorgProgress::Started => return Ok(()),
                ReorgProgress::Completed => {}
            }
            if ctx.hold_before_point_of_no_return(job) {
                return Ok(());
            }
            set_index_state(&mut table, &name, SchemaState::Public);
            if is_pk {
                for c in &columns {
                    if let Some(col) = table.column_mut(c) {
                        col.nullable = false;
                        col.prevent_null_insert = false;
                    }
                }
            }
            ctx.update_table(job, &table, true).await?;
            job.finish_forward_or_rollback(SchemaState::Public);
            tracing::info!(job = %job.id, index = %name, rows = job.row_count, "index is public");
            Ok(())
        }
        other => Err(DdlError::InvalidDdlState {
            object: "index",
            state: other,
        }
        .into()),
    }
}

fn set_index_state(table: &mut TableInfo, name: &str, state: SchemaState) {
    if let Some(i) = table.index_mut(name) {
        i.state = state;
    }
}

// ── DROP INDEX (and ADD INDEX rollback) ──────────────────────────────

pub(super) async fn on_drop_index(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::DropIndex { name, if_exists, .. } = job.args.clone() else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;
    let Some((state, primary)) = table.index(&name).map(|i| (i.state, i.primary)) else {
        if if_exists && !job.is_rolling_back() {
            job.finish_forward_or_rollback(SchemaState::None);
            return Ok(());
        }
        return Err(DdlError::IndexNotFound(name).into());
    };

    match state {
        SchemaState::Public => {
            let wants_pk = job.action == crate::job::ActionType::DropPrimaryKey;
            if primary != wants_pk {
                return Err(DdlError::Validation(if primary {
                    format!("index {name} is the primary key; use DROP PRIMARY KEY")
                } else {
                    format!("index {name} is not the primary key")
                })
                .into());
            }
            if ctx.hold_before_point_of_no_return(job) {
                return Ok(());
            }
            set_index_state(&mut table, &name, SchemaState::WriteOnly);
            job.schema_state = SchemaState::WriteOnly;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::WriteOnly | SchemaState::WriteReorganization => {
            set_index_state(&mut table, &name, SchemaState::DeleteOnly);
            job.schema_state = SchemaState::DeleteOnly;
            ctx.update_table(job, &table, true).await
        }
        // An index being rolled back was never readable; remove it from
        // DeleteOnly directly.
        SchemaState::DeleteOnly if !job.is_rolling_back() => {
            set_index_state(&mut table, &name, SchemaState::DeleteReorganization);
            job.schema_state = SchemaState::DeleteReorganization;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::DeleteOnly | SchemaState::DeleteReorganization => {
            if let Some(removed) = table.remove_index(&name) {
                job.delete_ranges.extend(index_delete_ranges(&table, removed.id.0));
            }
            ctx.update_table(job, &table, true).await?;
            job.finish_forward_or_rollback(SchemaState::None);
            Ok(())
        }
        other => Err(DdlError::InvalidDdlState {
            object: "index",
            state: other,
        }
        .into()),
    }
}

// ── RENAME INDEX / ALTER INDEX VISIBILITY ────────────────────────────

pub(super) async fn on_rename_index(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::RenameIndex { from, to } = job.args.clone() else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;
    if table.index(&from).map(|i| i.state) != Some(SchemaState::Public) {
        return Err(DdlError::IndexNotFound(from).into());
    }
    if !from.eq_ignore_ascii_case(&to) && table.index(&to).is_some() {
        return Err(DdlError::IndexExists(to).into());
    }
    if ctx.hold_before_point_of_no_return(job) {
        return Ok(());
    }
    if let Some(idx) = table.index_mut(&from) {
        idx.name = to;
    }
    ctx.update_table(job, &table, true).await?;
    job.finish_forward_or_rollback(SchemaState::Public);
    Ok(())
}

pub(super) async fn on_alter_index_visibility(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::AlterIndexVisibility { name, invisible } = job.args.clone() else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;
    match table.index(&name) {
        Some(idx) if idx.state == SchemaState::Public => {
            if idx.primary && invisible {
                return Err(DdlError::Validation("primary key cannot be invisible".into()).into());
            }
        }
        _ => return Err(DdlError::IndexNotFound(name).into()),
    }
    if ctx.hold_before_point_of_no_return(job) {
        return Ok(());
    }
    if let Some(idx) = table.index_mut(&name) {
        idx.invisible = invisible;
    }
    ctx.update_table(job, &table, true).await?;
    job.finish_forward_or_rollback(SchemaState::Public);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testutil::Harness;
    use super::super::StepOutcome;
    use crate::job::{ActionType, JobArgs, JobState};
    use falcon_common::schema::SchemaState;

    fn add_idx(name: &str, col: &str) -> JobArgs {
        JobArgs::AddIndex {
            name: name.into(),
            columns: vec![col.into()],
            unique: false,
        }
    }

    #[tokio::test]
    async fn test_add_index_backfills_then_publishes() {
        let h = Harness::new().await;
        let mut job = h.job(ActionType::AddIndex, add_idx("idx_id", "id"));
        for _ in 0..3 {
            h.step(&mut job).await;
        }
        assert_eq!(job.schema_state, SchemaState::WriteReorganization);
        assert_eq!(job.snapshot_ver, 0);

        // Launching the backfill records the snapshot without a version bump.
        let before = h.version().await;
        h.step(&mut job).await;
        assert_ne!(job.snapshot_ver, 0);
        assert_eq!(h.version().await, before);

        h.run_to_end(&mut job, 10).await;
        assert_eq!(job.state, JobState::Done);
        assert_eq!(h.table().await.index("idx_id").unwrap().state, SchemaState::Public);
    }

    #[tokio::test]
    async fn test_add_primary_key_tightens_nullability() {
        let h = Harness::new().await;
        let mut job = h.job(ActionType::AddPrimaryKey, add_idx("PRIMARY", "a"));
        h.step(&mut job).await;
        assert!(h.table().await.column("a").unwrap().prevent_null_insert);
        h.run_to_end(&mut job, 10).await;
        let t = h.table().await;
        let a = t.column("a").unwrap();
        assert!(!a.nullable);
        assert!(!a.prevent_null_insert);
        assert!(t.primary_index().is_some());
    }

    #[tokio::test]
    async fn test_add_index_on_missing_column_cancels() {
        let h = Harness::new().await;
        let mut job = h.job(ActionType::AddIndex, add_idx("idx_x", "nope"));
        assert!(matches!(h.step(&mut job).await, StepOutcome::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_drop_index_sequence() {
        let h = Harness::new().await;
        let mut job = h.job(
            ActionType::DropIndex,
            JobArgs::DropIndex {
                name: "idx_a".into(),
                if_exists: false,
                partition_ids: vec![],
            },
        );
        let mut seen = vec![];
        while !job.is_finished() {
            h.step(&mut job).await;
            seen.push(job.schema_state);
        }
        assert_eq!(
            seen,
            vec![
                SchemaState::WriteOnly,
                SchemaState::DeleteOnly,
                SchemaState::DeleteReorganization,
                SchemaState::None
            ]
        );
        assert!(h.table().await.index("idx_a").is_none());
        assert_eq!(job.delete_ranges.len(), 1);
    }

    #[tokio::test]
    async fn test_drop_index_rejects_primary_key_path() {
        let h = Harness::new().await;
        let mut job = h.job(
            ActionType::DropPrimaryKey,
            JobArgs::DropIndex {
                name: "idx_a".into(),
                if_exists: false,
                partition_ids: vec![],
            },
        );
        assert!(matches!(h.step(&mut job).await, StepOutcome::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_rename_and_hide_index() {
        let h = Harness::new().await;
        let mut job = h.job(
            ActionType::RenameIndex,
            JobArgs::RenameIndex {
                from: "idx_a".into(),
                to: "idx_b".into(),
            },
        );
        h.run_to_end(&mut job, 2).await;
        let mut job = h.job(
            ActionType::AlterIndexVisibility,
            JobArgs::AlterIndexVisibility {
                name: "idx_b".into(),
                invisible: true,
            },
        );
        h.run_to_end(&mut job, 2).await;
        let t = h.table().await;
        assert!(t.index("idx_a").is_none());
        assert!(t.index("idx_b").unwrap().invisible);
    }
}
