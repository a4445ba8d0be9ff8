use falcon_common::error::{DdlError, FalconError, FalconResult};
use falcon_common::schema::{ConstraintInfo, ForeignKeyInfo, SchemaState, TableInfo};

use super::{invalid_args, run_reorg, ReorgProgress, StepContext};
use crate::job::{Job, JobArgs};
use crate::reorg::ReorgElement;

fn set_constraint_state(table: &mut TableInfo, name: &str, state: SchemaState) {
    if let Some(c) = table.constraint_mut(name) {
        c.state = state;
    }
}

// ── CHECK constraints ────────────────────────────────────────────────

pub(super) async fn on_add_check_constraint(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::AddCheckConstraint {
        name,
        expr,
        enforced,
    } = job.args.clone()
    else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;

    let state = match table.constraint(&name) {
        Some(c) if c.state == SchemaState::Public => {
            return Err(DdlError::ConstraintExists(name).into());
        }
        Some(c) => c.state,
        None => SchemaState::None,
    };

    match state {
        SchemaState::None => {
            if expr.trim().is_empty() {
                return Err(FalconError::validation(format!(
                    "check constraint {name} has an empty expression"
                )));
            }
            let id = ctx.txn.gen_global_id().await?;
            table.constraints.push(ConstraintInfo {
                id,
                name,
                expr,
                enforced,
                state: SchemaState::WriteOnly,
            });
            job.schema_state = SchemaState::WriteOnly;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::WriteOnly => {
            set_constraint_state(&mut table, &name, SchemaState::WriteReorganization);
            job.schema_state = SchemaState::WriteReorganization;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::WriteReorganization => {
            // Existing rows are only verified for enforced constraints.
            if enforced {
                let element = ReorgElement::CheckConstraint {
                    name: name.clone(),
                    expr,
                };
                match run_reorg(ctx, job, element).await? {
                    ReorgProgress::Started => return Ok(()),
                    ReorgProgress::Completed => {}
                }
            }
            set_constraint_state(&mut table, &name, SchemaState::Public);
            ctx.update_table(job, &table, true).await?;
            job.finish_forward_or_rollback(SchemaState::Public);
            Ok(())
        }
        other => Err(DdlError::InvalidDdlState {
            object: "constraint",
            state: other,
        }
        .into()),
    }
}

/// Also the rollback path of ADD CHECK: a constraint that never became
/// public is removed straight from write-only.
pub(super) async fn on_drop_check_constraint(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::DropCheckConstraint { name } = job.args.clone() else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;
    let Some(state) = table.constraint(&name).map(|c| c.state) else {
        return Err(DdlError::ConstraintNotFound(name).into());
    };

    match state {
        SchemaState::Public => {
            set_constraint_state(&mut table, &name, SchemaState::WriteOnly);
            job.schema_state = SchemaState::WriteOnly;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::WriteOnly | SchemaState::WriteReorganization => {
            table.remove_constraint(&name);
            ctx.update_table(job, &table, true).await?;
            job.finish_forward_or_rollback(SchemaState::None);
            Ok(())
        }
        other => Err(DdlError::InvalidDdlState {
            object: "constraint",
            state: other,
        }
        .into()),
    }
}

pub(super) async fn on_alter_check_constraint(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::AlterCheckConstraint { name, enforced } = job.args.clone() else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;
    match table.constraint_mut(&name) {
        Some(c) if c.state == SchemaState::Public => {
            if c.enforced == enforced {
                job.finish_forward_or_rollback(SchemaState::Public);
                return Ok(());
            }
            c.enforced = enforced;
        }
        _ => return Err(DdlError::ConstraintNotFound(name).into()),
    }
    ctx.update_table(job, &table, true).await?;
    job.finish_forward_or_rollback(SchemaState::Public);
    Ok(())
}

// ── FOREIGN KEY ──────────────────────────────────────────────────────

pub(super) async fn on_add_foreign_key(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::AddForeignKey {
        name,
        columns,
        ref_table,
        ref_columns,
    } = job.args.clone()
    else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;
    if table.foreign_key(&name).is_some() {
        return Err(DdlError::ConstraintExists(name).into());
    }
    if columns.is_empty() || columns.len() != ref_columns.len() {
        return Err(FalconError::validation(format!(
            "foreign key {name}: column count does not match referenced column count"
        )));
    }
    for c in &columns {
        if table.column(c).map(|c| c.state) != Some(SchemaState::Public) {
            return Err(DdlError::ColumnNotFound(c.clone()).into());
        }
    }
    let parent = if ref_table.eq_ignore_ascii_case(&table.name) {
        table.clone()
    } else {
        ctx.txn
            .list_tables(job.schema_id)
            .await?
            .into_iter()
            .find(|t| t.name.eq_ignore_ascii_case(&ref_table))
            .ok_or_else(|| FalconError::validation(format!("referenced table {ref_table} not found")))?
    };
    for c in &ref_columns {
        if parent.column(c).map(|c| c.state) != Some(SchemaState::Public) {
            return Err(DdlError::ColumnNotFound(format!("{ref_table}.{c}")).into());
        }
    }

    let id = ctx.txn.gen_global_id().await?;
    table.foreign_keys.push(ForeignKeyInfo {
        id,
        name,
        columns,
        ref_table,
        ref_columns,
        state: SchemaState::Public,
    });
    ctx.update_table(job, &table, true).await?;
    job.finish_forward_or_rollback(SchemaState::Public);
    Ok(())
}

pub(super) async fn on_drop_foreign_key(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::DropForeignKey { name } = job.args.clone() else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;
    if table.foreign_key(&name).is_none() {
        return Err(DdlError::ConstraintNotFound(name).into());
    }
    table.foreign_keys.retain(|fk| !fk.name.eq_ignore_ascii_case(&name));
    ctx.update_table(job, &table, true).await?;
    job.finish_forward_or_rollback(SchemaState::None);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testutil::Harness;
    use super::super::StepOutcome;
    use super::*;
    use crate::job::{ActionType, JobState};

    fn add_check(enforced: bool) -> JobArgs {
        JobArgs::AddCheckConstraint {
            name: "chk_a".into(),
            expr: "a > 0".into(),
            enforced,
        }
    }

    #[tokio::test]
    async fn test_add_enforced_check_runs_validation_scan() {
        let h = Harness::new().await;
        let mut job = h.job(ActionType::AddCheckConstraint, add_check(true));
        h.step(&mut job).await;
        h.step(&mut job).await;
        assert_eq!(job.schema_state, SchemaState::WriteReorganization);
        h.step(&mut job).await;
        assert_ne!(job.snapshot_ver, 0);
        h.run_to_end(&mut job, 5).await;
        assert_eq!(job.state, JobState::Done);
        assert_eq!(h.table().await.constraint("chk_a").unwrap().state, SchemaState::Public);
    }

    #[tokio::test]
    async fn test_add_unenforced_check_skips_scan() {
        let h = Harness::new().await;
        let mut job = h.job(ActionType::AddCheckConstraint, add_check(false));
        h.run_to_end(&mut job, 3).await;
        assert_eq!(job.snapshot_ver, 0);
        assert_eq!(job.state, JobState::Done);
    }

    #[tokio::test]
    async fn test_drop_check_constraint() {
        let h = Harness::new().await;
        let mut job = h.job(ActionType::AddCheckConstraint, add_check(false));
        h.run_to_end(&mut job, 3).await;

        let mut job = h.job(
            ActionType::DropCheckConstraint,
            JobArgs::DropCheckConstraint {
                name: "chk_a".into(),
            },
        );
        h.step(&mut job).await;
        assert_eq!(job.schema_state, SchemaState::WriteOnly);
        h.run_to_end(&mut job, 2).await;
        assert!(h.table().await.constraint("chk_a").is_none());
    }

    #[tokio::test]
    async fn test_alter_check_enforcement() {
        let h = Harness::new().await;
        let mut job = h.job(ActionType::AddCheckConstraint, add_check(false));
        h.run_to_end(&mut job, 3).await;
        let mut job = h.job(
            ActionType::AlterCheckConstraint,
            JobArgs::AlterCheckConstraint {
                name: "chk_a".into(),
                enforced: true,
            },
        );
        h.run_to_end(&mut job, 2).await;
        assert!(h.table().await.constraint("chk_a").unwrap().enforced);
    }

    #[tokio::test]
    async fn test_foreign_key_validates_columns() {
        let h = Harness::new().await;
        let mut job = h.job(
            ActionType::AddForeignKey,
            JobArgs::AddForeignKey {
                name: "fk_self".into(),
                columns: vec!["a".into()],
                ref_table: "t".into(),
                ref_columns: vec!["missing".into()],
            },
        );
        assert!(matches!(h.step(&mut job).await, StepOutcome::Cancelled(_)));

        let mut job = h.job(
            ActionType::AddForeignKey,
            JobArgs::AddForeignKey {
                name: "fk_self".into(),
                columns: vec!["a".into()],
                ref_table: "t".into(),
                ref_columns: vec!["id".into()],
            },
        );
        h.run_to_end(&mut job, 2).await;
        assert!(h.table().await.foreign_key("fk_self").is_some());

        let mut job = h.job(
            ActionType::DropForeignKey,
            JobArgs::DropForeignKey {
                name: "fk_self".into(),
            },
        );
        h.run_to_end(&mut job, 2).await;
        assert!(h.table().await.foreign_key("fk_self").is_none());
    }
}
