use falcon_common::error::{DdlError, FalconResult};
use falcon_common::schema::{ColumnInfo, SchemaState, TableInfo};
use falcon_common::types::ColumnId;

use super::{index_delete_ranges, invalid_args, run_reorg, ReorgProgress, StepContext};
use crate::job::{Job, JobArgs};
use crate::reorg::ReorgElement;

// ── ADD COLUMN ───────────────────────────────────────────────────────

pub(super) async fn on_add_column(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::AddColumn { column } = job.args.clone() else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;

    let state = match table.column(&column.name) {
        Some(c) if c.state == SchemaState::Public => {
            return Err(DdlError::ColumnExists(column.name).into());
        }
        Some(c) => c.state,
        None => SchemaState::None,
    };

    match state {
        SchemaState::None => {
            let id = ctx.txn.gen_global_id().await?;
            let mut info = ColumnInfo::new(ColumnId(id), column.name, column.data_type);
            info.nullable = column.nullable;
            info.default_value = column.default_value;
            info.state = SchemaState::DeleteOnly;
            table.columns.push(info);
            job.schema_state = SchemaState::DeleteOnly;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::DeleteOnly => {
            set_column_state(&mut table, &column.name, SchemaState::WriteOnly);
            job.schema_state = SchemaState::WriteOnly;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::WriteOnly => {
            set_column_state(&mut table, &column.name, SchemaState::WriteReorganization);
            job.schema_state = SchemaState::WriteReorganization;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::WriteReorganization => {
            if ctx.hold_before_point_of_no_return(job) {
                return Ok(());
            }
            set_column_state(&mut table, &column.name, SchemaState::Public);
            ctx.update_table(job, &table, true).await?;
            job.finish_forward_or_rollback(SchemaState::Public);
            Ok(())
        }
        other => Err(DdlError::InvalidDdlState {
            object: "column",
            state: other,
        }
        .into()),
    }
}

fn set_column_state(table: &mut TableInfo, name: &str, state: SchemaState) {
    if let Some(c) = table.column_mut(name) {
        c.state = state;
    }
}

/// Set the column and the indexes that go away with it.
fn set_column_and_indices_state(table: &mut TableInfo, name: &str, state: SchemaState) {
    set_column_state(table, name, state);
    for idx in table.single_column_indices(name) {
        if let Some(i) = table.index_mut(&idx) {
            i.state = state;
        }
    }
}

// ── DROP COLUMN (and ADD COLUMN rollback) ────────────────────────────

pub(super) async fn on_drop_column(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::DropColumn { name } = job.args.clone() else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;
    let Some(state) = table.column(&name).map(|c| c.state) else {
        return Err(DdlError::ColumnNotFound(name).into());
    };

    match state {
        SchemaState::Public => {
            check_drop_column(&table, &name)?;
            if ctx.hold_before_point_of_no_return(job) {
                return Ok(());
            }
            set_column_and_indices_state(&mut table, &name, SchemaState::WriteOnly);
            job.schema_state = SchemaState::WriteOnly;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::WriteOnly | SchemaState::WriteReorganization => {
            set_column_and_indices_state(&mut table, &name, SchemaState::DeleteOnly);
            job.schema_state = SchemaState::DeleteOnly;
            ctx.update_table(job, &table, true).await
        }
        // Rolling back an added column: its data was never readable, so it
        // can be removed straight from DeleteOnly.
        SchemaState::DeleteOnly if !job.is_rolling_back() => {
            set_column_and_indices_state(&mut table, &name, SchemaState::DeleteReorganization);
            job.schema_state = SchemaState::DeleteReorganization;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::DeleteOnly | SchemaState::DeleteReorganization => {
            for idx in table.single_column_indices(&name) {
                if let Some(removed) = table.remove_index(&idx) {
                    job.delete_ranges.extend(index_delete_ranges(&table, removed.id.0));
                }
            }
            table.remove_column(&name);
            ctx.update_table(job, &table, true).await?;
            job.finish_forward_or_rollback(SchemaState::None);
            Ok(())
        }
        other => Err(DdlError::InvalidDdlState {
            object: "column",
            state: other,
        }
        .into()),
    }
}

fn check_drop_column(table: &TableInfo, name: &str) -> FalconResult<()> {
    if table.public_columns().count() <= 1 {
        return Err(DdlError::Validation(format!(
            "can't drop only column {name} in table {}",
            table.name
        ))
        .into());
    }
    if let Some(pk) = table.primary_index() {
        if pk.columns.iter().any(|c| c.eq_ignore_ascii_case(name)) {
            return Err(DdlError::Validation(format!(
                "can't drop column {name} with primary key covered now"
            ))
            .into());
        }
    }
    let composite = table
        .indices
        .iter()
        .filter(|i| i.columns.len() > 1)
        .any(|i| i.columns.iter().any(|c| c.eq_ignore_ascii_case(name)));
    if composite {
        return Err(DdlError::Validation(format!(
            "can't drop column {name} with composite index covered"
        ))
        .into());
    }
    Ok(())
}

// ── MODIFY COLUMN ────────────────────────────────────────────────────

/// Whether changing `old` to `new_type` rewrites stored values.
pub(crate) fn needs_data_change(old: &ColumnInfo, new_type: &str) -> bool {
    !old.data_type.trim().eq_ignore_ascii_case(new_type.trim())
}

pub(crate) fn changing_column_name(name: &str, job: &Job) -> String {
    format!("_Col$_{name}_{}", job.id.0)
}

pub(super) async fn on_modify_column(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::ModifyColumn {
        name,
        new_type,
        nullable,
    } = job.args.clone()
    else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;
    let Some(old) = table.column(&name).cloned() else {
        return Err(DdlError::ColumnNotFound(name).into());
    };
    if old.state != SchemaState::Public {
        return Err(DdlError::InvalidDdlState {
            object: "column",
            state: old.state,
        }
        .into());
    }

    if job.is_rolling_back() {
        return rollback_modify_column(ctx, job, table, &name).await;
    }

    if !needs_data_change(&old, &new_type) {
        return modify_column_metadata(ctx, job, table, &name, &new_type, nullable).await;
    }

    let changing = table.changing_column_of(&name).map(|c| (c.name.clone(), c.state));
    match changing {
        None => {
            if job.schema_state != SchemaState::None {
                return Err(DdlError::InvalidDdlState {
                    object: "changing column",
                    state: job.schema_state,
                }
                .into());
            }
            let id = ctx.txn.gen_global_id().await?;
            let mut hidden = ColumnInfo::new(ColumnId(id), changing_column_name(&name, job), new_type);
            hidden.nullable = nullable;
            hidden.default_value = old.default_value.clone();
            hidden.state = SchemaState::DeleteOnly;
            hidden.changing_of = Some(old.name.clone());
            table.columns.push(hidden);
            job.schema_state = SchemaState::DeleteOnly;
            ctx.update_table(job, &table, true).await
        }
        Some((hidden, SchemaState::DeleteOnly)) => {
            set_column_state(&mut table, &hidden, SchemaState::WriteOnly);
            job.schema_state = SchemaState::WriteOnly;
            ctx.update_table(job, &table, true).await
        }
        Some((hidden, SchemaState::WriteOnly)) => {
            set_column_state(&mut table, &hidden, SchemaState::WriteReorganization);
            job.schema_state = SchemaState::WriteReorganization;
            ctx.update_table(job, &table, true).await
        }
        Some((hidden, SchemaState::WriteReorganization)) => {
            let element = ReorgElement::Column {
                from: old.name.clone(),
                to: hidden.clone(),
                new_type,
            };
            match run_reorg(ctx, job, element).await? {
                ReorgProgress::Started => return Ok(()),
                ReorgProgress::Completed => {}
            }
            if ctx.hold_before_point_of_no_return(job) {
                return Ok(());
            }
            // Swap the hidden column in under the original name and position.
            let Some(pos) = table.find_column(&old.name) else {
                return Err(DdlError::ColumnNotFound(old.name).into());
            };
            let Some(mut replacement) = table.remove_column(&hidden) else {
                return Err(DdlError::ColumnNotFound(hidden).into());
            };
            replacement.name = old.name.clone();
            replacement.changing_of = None;
            replacement.state = SchemaState::Public;
            table.columns[pos] = replacement;
            ctx.update_table(job, &table, true).await?;
            job.finish_forward_or_rollback(SchemaState::Public);
            Ok(())
        }
        Some((_, other)) => Err(DdlError::InvalidDdlState {
            object: "changing column",
            state: other,
        }
        .into()),
    }
}

async fn modify_column_metadata(
    ctx: &mut StepContext<'_>,
    job: &mut Job,
    mut table: TableInfo,
    name: &str,
    new_type: &str,
    nullable: bool,
) -> FalconResult<()> {
    let Some(col) = table.column(name) else {
        return Err(DdlError::ColumnNotFound(name.to_string()).into());
    };
    // NULL -> NOT NULL first rejects new NULL writes, then flips the flag.
    if col.nullable && !nullable && !col.prevent_null_insert {
        if let Some(c) = table.column_mut(name) {
            c.prevent_null_insert = true;
        }
        return ctx.update_table(job, &table, true).await;
    }
    if ctx.hold_before_point_of_no_return(job) {
        return Ok(());
    }
    if let Some(c) = table.column_mut(name) {
        c.nullable = nullable;
        c.prevent_null_insert = false;
        c.data_type = new_type.to_string();
    }
    ctx.update_table(job, &table, true).await?;
    job.finish_forward_or_rollback(SchemaState::Public);
    Ok(())
}

async fn rollback_modify_column(
    ctx: &mut StepContext<'_>,
    job: &mut Job,
    mut table: TableInfo,
    name: &str,
) -> FalconResult<()> {
    if let Some(hidden) = table.changing_column_of(name).map(|c| c.name.clone()) {
        table.remove_column(&hidden);
    }
    if let Some(c) = table.column_mut(name) {
        c.prevent_null_insert = false;
    }
    ctx.update_table(job, &table, true).await?;
    job.finish_forward_or_rollback(SchemaState::None);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testutil::Harness;
    use super::super::StepOutcome;
    use crate::job::{ActionType, ColumnSpec, JobArgs, JobState};
    use falcon_common::schema::SchemaState;

    fn add_email() -> JobArgs {
        JobArgs::AddColumn {
            column: ColumnSpec {
                name: "email".into(),
                data_type: "varchar(64)".into(),
                nullable: true,
                default_value: None,
            },
        }
    }

    #[tokio::test]
    async fn test_add_column_walks_states() {
        let h = Harness::new().await;
        let mut job = h.job(ActionType::AddColumn, add_email());
        let mut seen = vec![];
        while !job.is_finished() {
            assert!(matches!(h.step(&mut job).await, StepOutcome::Continue));
            seen.push(job.schema_state);
        }
        assert_eq!(
            seen,
            vec![
                SchemaState::DeleteOnly,
                SchemaState::WriteOnly,
                SchemaState::WriteReorganization,
                SchemaState::Public
            ]
        );
        assert_eq!(job.state, JobState::Done);
        assert_eq!(h.version().await, 4);
        assert_eq!(h.table().await.column("email").unwrap().state, SchemaState::Public);
    }

    #[tokio::test]
    async fn test_add_existing_column_cancels() {
        let h = Harness::new().await;
        let mut job = h.job(
            ActionType::AddColumn,
            JobArgs::AddColumn {
                column: ColumnSpec {
                    name: "A".into(),
                    data_type: "int".into(),
                    nullable: true,
                    default_value: None,
                },
            },
        );
        match h.step(&mut job).await {
            StepOutcome::Cancelled(err) => assert!(err.message.contains("Column already exists")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.version().await, 0);
    }

    #[tokio::test]
    async fn test_drop_column_removes_single_column_index() {
        let h = Harness::new().await;
        let mut job = h.job(ActionType::DropColumn, JobArgs::DropColumn { name: "a".into() });
        h.run_to_end(&mut job, 10).await;
        assert_eq!(job.state, JobState::Done);
        let t = h.table().await;
        assert!(t.column("a").is_none());
        assert!(t.index("idx_a").is_none());
        assert_eq!(job.delete_ranges.len(), 1);
        // Public -> WriteOnly -> DeleteOnly -> DeleteReorg -> removed.
        assert_eq!(h.version().await, 4);
    }

    #[tokio::test]
    async fn test_drop_only_primary_key_column_rejected() {
        let h = Harness::new().await;
        let mut t = h.table().await;
        t.indices.push(falcon_common::schema::IndexInfo {
            id: falcon_common::types::IndexId(9),
            name: "PRIMARY".into(),
            columns: vec!["id".into()],
            unique: true,
            primary: true,
            invisible: false,
            state: SchemaState::Public,
        });
        let mut txn = crate::txn::MetaTxn::new(h.store.clone());
        txn.put_table(&t).unwrap();
        txn.commit().await.unwrap();

        let mut job = h.job(ActionType::DropColumn, JobArgs::DropColumn { name: "id".into() });
        assert!(matches!(h.step(&mut job).await, StepOutcome::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_modify_column_type_swaps_hidden_column() {
        let h = Harness::new().await;
        let mut job = h.job(
            ActionType::ModifyColumn,
            JobArgs::ModifyColumn {
                name: "a".into(),
                new_type: "bigint".into(),
                nullable: true,
            },
        );
        h.step(&mut job).await;
        let t = h.table().await;
        assert!(t.changing_column_of("a").is_some());
        assert_eq!(job.schema_state, SchemaState::DeleteOnly);

        h.run_to_end(&mut job, 20).await;
        assert_eq!(job.state, JobState::Done);
        assert_ne!(job.snapshot_ver, 0);
        let t = h.table().await;
        let a = t.column("a").unwrap();
        assert_eq!(a.data_type, "bigint");
        assert_eq!(a.state, SchemaState::Public);
        assert!(t.changing_column_of("a").is_none());
        assert_eq!(t.find_column("a"), Some(1));
    }

    #[tokio::test]
    async fn test_modify_column_not_null_is_metadata_only() {
        let h = Harness::new().await;
        let mut job = h.job(
            ActionType::ModifyColumn,
            JobArgs::ModifyColumn {
                name: "a".into(),
                new_type: "INT".into(),
                nullable: false,
            },
        );
        h.step(&mut job).await;
        assert!(h.table().await.column("a").unwrap().prevent_null_insert);
        assert_eq!(job.schema_state, SchemaState::None);

        h.run_to_end(&mut job, 5).await;
        let a = h.table().await.column("a").cloned().unwrap();
        assert!(!a.nullable);
        assert!(!a.prevent_null_insert);
        assert_eq!(job.snapshot_ver, 0);
    }
}
