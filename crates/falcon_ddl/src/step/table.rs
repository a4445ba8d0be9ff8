use falcon_common::error::{DdlError, FalconError, FalconResult, MetaError};
use falcon_common::schema::{SchemaState, TableInfo};
use falcon_common::types::{PartitionId, SchemaId, TableId};

use super::{delete_range, invalid_args, StepContext};
use crate::job::{Job, JobArgs};
use crate::txn::SchemaDiff;

const MAX_SHARD_ROW_ID_BITS: u64 = 15;

async fn check_table_name_free(
    ctx: &mut StepContext<'_>,
    schema_id: SchemaId,
    name: &str,
    except: Option<TableId>,
) -> FalconResult<()> {
    let taken = ctx
        .txn
        .list_tables(schema_id)
        .await?
        .iter()
        .any(|t| t.name.eq_ignore_ascii_case(name) && Some(t.id) != except);
    if taken {
        return Err(MetaError::TableExists(name.to_string()).into());
    }
    Ok(())
}

pub(super) async fn on_create_table(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::CreateTable { table } = job.args.clone() else {
        return Err(invalid_args(job));
    };
    let db = ctx.txn.must_get_database(job.schema_id).await?;
    if db.state != SchemaState::Public {
        return Err(MetaError::DatabaseNotFound(job.schema_id).into());
    }
    if ctx.txn.get_table(job.schema_id, job.table_id).await?.is_some() {
        // Re-entry after the table was already written by this job.
        job.finish_forward_or_rollback(SchemaState::Public);
        return Ok(());
    }
    check_table_name_free(ctx, job.schema_id, &table.name, None).await?;
    if table.columns.is_empty() {
        return Err(FalconError::validation(format!(
            "table {} must have at least one column",
            table.name
        )));
    }

    let mut table = table;
    table.id = job.table_id;
    table.schema_id = job.schema_id;
    table.state = SchemaState::Public;
    for c in &mut table.columns {
        c.state = SchemaState::Public;
    }
    for i in &mut table.indices {
        i.state = SchemaState::Public;
    }
    ctx.update_table(job, &table, true).await?;
    job.finish_forward_or_rollback(SchemaState::Public);
    tracing::info!(job = %job.id, table = %table.name, "table created");
    Ok(())
}

pub(super) async fn on_drop_table(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let mut table = ctx.table_or_cancel(job).await?;
    match table.state {
        SchemaState::Public => {
            table.state = SchemaState::WriteOnly;
            job.schema_state = SchemaState::WriteOnly;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::WriteOnly => {
            table.state = SchemaState::DeleteOnly;
            job.schema_state = SchemaState::DeleteOnly;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::DeleteOnly => {
            ctx.bump(job).await?;
            ctx.txn.delete_table(table.schema_id, table.id);
            job.delete_ranges
                .extend(table.physical_ids().into_iter().map(delete_range));
            job.finish_forward_or_rollback(SchemaState::None);
            Ok(())
        }
        other => Err(DdlError::InvalidDdlState {
            object: "table",
            state: other,
        }
        .into()),
    }
}

/// Swap in an empty table under a fresh id. The old physical data is left
/// to the delete-range GC.
pub(super) async fn on_truncate_table(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::TruncateTable { .. } = job.args else {
        return Err(invalid_args(job));
    };
    let old = ctx.table_or_cancel(job).await?;
    let new_id = TableId(ctx.txn.gen_global_id().await?);

    let mut table = old.clone();
    table.id = new_id;
    table.auto_inc_base = 0;
    if let Some(info) = table.partition.as_mut() {
        let ids = ctx.txn.gen_global_ids(info.definitions.len()).await?;
        for (def, id) in info.definitions.iter_mut().zip(ids) {
            def.id = PartitionId(id);
        }
    }

    let mut diff = SchemaDiff::for_job(job);
    diff.table_id = new_id;
    diff.old_table_id = Some(old.id);
    ctx.bump_with(job, diff).await?;
    ctx.txn.delete_table(old.schema_id, old.id);
    ctx.txn.put_table(&table)?;

    job.delete_ranges
        .extend(old.physical_ids().into_iter().map(delete_range));
    job.args = JobArgs::TruncateTable {
        new_table_id: Some(new_id),
    };
    job.finish_forward_or_rollback(SchemaState::Public);
    Ok(())
}

pub(super) async fn on_rename_table(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::RenameTable { new_name } = job.args.clone() else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;
    check_table_name_free(ctx, job.schema_id, &new_name, Some(table.id)).await?;
    table.name = new_name;
    ctx.update_table(job, &table, true).await?;
    job.finish_forward_or_rollback(SchemaState::Public);
    Ok(())
}

pub(super) async fn on_rebase_auto_id(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::RebaseAutoId { new_base } = job.args else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;
    // Rebasing never moves the allocator backwards.
    table.auto_inc_base = table.auto_inc_base.max(new_base);
    ctx.update_table(job, &table, true).await?;
    job.finish_forward_or_rollback(SchemaState::Public);
    Ok(())
}

pub(super) async fn on_shard_row_id(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::ShardRowId { bits } = job.args else {
        return Err(invalid_args(job));
    };
    if bits > MAX_SHARD_ROW_ID_BITS {
        return Err(FalconError::validation(format!(
            "shard_row_id_bits {bits} exceeds {MAX_SHARD_ROW_ID_BITS}"
        )));
    }
    let mut table = ctx.table_or_cancel(job).await?;
    if bits > 0 && table.primary_index().is_some() {
        return Err(FalconError::validation(
            "unsupported shard_row_id_bits for table with primary key as row id",
        ));
    }
    table.shard_row_id_bits = bits;
    ctx.update_table(job, &table, true).await?;
    job.finish_forward_or_rollback(SchemaState::Public);
    Ok(())
}

pub(super) async fn on_modify_table_charset(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::ModifyTableCharset { charset, collate } = job.args.clone() else {
        return Err(invalid_args(job));
    };
    if charset.is_empty() {
        return Err(FalconError::validation("charset must not be empty"));
    }
    let mut table = ctx.table_or_cancel(job).await?;
    if table.charset.eq_ignore_ascii_case(&charset) && table.collate.eq_ignore_ascii_case(&collate) {
        job.finish_forward_or_rollback(SchemaState::Public);
        return Ok(());
    }
    table.charset = charset;
    table.collate = collate;
    ctx.update_table(job, &table, true).await?;
    job.finish_forward_or_rollback(SchemaState::Public);
    Ok(())
}

pub(super) async fn on_modify_table_auto_id_cache(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::ModifyTableAutoIdCache { cache } = job.args else {
        return Err(invalid_args(job));
    };
    if cache == 0 {
        return Err(FalconError::validation("auto_id_cache must be positive"));
    }
    let mut table = ctx.table_or_cancel(job).await?;
    table.auto_id_cache = cache;
    ctx.update_table(job, &table, true).await?;
    job.finish_forward_or_rollback(SchemaState::Public);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testutil::Harness;
    use super::super::StepOutcome;
    use super::*;
    use crate::job::{ActionType, JobState};
    use crate::txn::MetaTxn;
    use falcon_common::schema::ColumnInfo;
    use falcon_common::types::{ColumnId, JobId};

    #[tokio::test]
    async fn test_create_table_publishes_in_one_step() {
        let h = Harness::new().await;
        let mut t = TableInfo::new(TableId(0), SchemaId(0), "orders");
        t.columns.push(ColumnInfo::new(ColumnId(1), "id", "bigint"));
        let mut job = Job::new(
            JobId(60),
            ActionType::CreateTable,
            SchemaId(1),
            TableId(61),
            JobArgs::CreateTable { table: t },
        );
        job.state = JobState::Running;
        let before = h.version().await;
        h.step(&mut job).await;
        assert_eq!(job.state, JobState::Done);
        assert_eq!(h.version().await, before + 1);
        let created = MetaTxn::new(h.store.clone())
            .must_get_table(SchemaId(1), TableId(61))
            .await
            .unwrap();
        assert_eq!(created.state, SchemaState::Public);
        assert_eq!(created.columns[0].state, SchemaState::Public);
    }

    #[tokio::test]
    async fn test_create_table_duplicate_name_cancels() {
        let h = Harness::new().await;
        let mut t = TableInfo::new(TableId(0), SchemaId(0), "T");
        t.columns.push(ColumnInfo::new(ColumnId(1), "id", "bigint"));
        let mut job = Job::new(
            JobId(60),
            ActionType::CreateTable,
            SchemaId(1),
            TableId(61),
            JobArgs::CreateTable { table: t },
        );
        job.state = JobState::Running;
        assert!(matches!(h.step(&mut job).await, StepOutcome::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_drop_table_three_bumps() {
        let h = Harness::new().await;
        let before = h.version().await;
        let mut job = h.job(ActionType::DropTable, JobArgs::DropTable);
        h.run_to_end(&mut job, 5).await;
        assert_eq!(job.state, JobState::Done);
        assert_eq!(h.version().await, before + 3);
        assert_eq!(job.delete_ranges, vec![delete_range(2)]);
        let gone = MetaTxn::new(h.store.clone())
            .get_table(SchemaId(1), TableId(2))
            .await
            .unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_truncate_table_records_old_id_in_diff() {
        let h = Harness::new().await;
        let mut job = h.job(
            ActionType::TruncateTable,
            JobArgs::TruncateTable { new_table_id: None },
        );
        h.run_to_end(&mut job, 2).await;
        let JobArgs::TruncateTable {
            new_table_id: Some(new_id),
        } = job.args
        else {
            panic!("new table id not recorded");
        };
        let mut txn = MetaTxn::new(h.store.clone());
        let diff = txn
            .get_schema_diff(job.schema_version)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(diff.old_table_id, Some(TableId(2)));
        assert_eq!(diff.table_id, new_id);
        assert!(txn.get_table(SchemaId(1), new_id).await.unwrap().is_some());
        assert!(txn.get_table(SchemaId(1), TableId(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rebase_auto_id_never_moves_backwards() {
        let h = Harness::new().await;
        let mut job = h.job(ActionType::RebaseAutoId, JobArgs::RebaseAutoId { new_base: 500 });
        h.run_to_end(&mut job, 2).await;
        let mut job = h.job(ActionType::RebaseAutoId, JobArgs::RebaseAutoId { new_base: 10 });
        h.run_to_end(&mut job, 2).await;
        assert_eq!(h.table().await.auto_inc_base, 500);
    }

    #[tokio::test]
    async fn test_shard_row_id_bits_bounded() {
        let h = Harness::new().await;
        let mut job = h.job(ActionType::ShardRowId, JobArgs::ShardRowId { bits: 16 });
        assert!(matches!(h.step(&mut job).await, StepOutcome::Cancelled(_)));
        let mut job = h.job(ActionType::ShardRowId, JobArgs::ShardRowId { bits: 4 });
        h.run_to_end(&mut job, 2).await;
        assert_eq!(h.table().await.shard_row_id_bits, 4);
    }

    #[tokio::test]
    async fn test_rename_table() {
        let h = Harness::new().await;
        let mut job = h.job(
            ActionType::RenameTable,
            JobArgs::RenameTable {
                new_name: "t2".into(),
            },
        );
        h.run_to_end(&mut job, 2).await;
        assert_eq!(h.table().await.name, "t2");
    }
}
