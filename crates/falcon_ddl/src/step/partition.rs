use std::collections::HashSet;

use falcon_common::error::{DdlError, FalconError, FalconResult};
use falcon_common::schema::{PartitionDef, PartitionInfo, SchemaState, TableInfo};
use falcon_common::types::PartitionId;

use super::{delete_range, invalid_args, run_reorg, ReorgProgress, StepContext};
use crate::job::{Job, JobArgs, PartitionSpec};
use crate::reorg::ReorgElement;

fn partition_info(table: &TableInfo) -> FalconResult<&PartitionInfo> {
    table
        .partition
        .as_ref()
        .ok_or_else(|| FalconError::validation(format!("table {} is not partitioned", table.name)))
}

fn partition_info_mut(table: &mut TableInfo) -> FalconResult<&mut PartitionInfo> {
    let name = table.name.clone();
    table
        .partition
        .as_mut()
        .ok_or_else(|| FalconError::validation(format!("table {name} is not partitioned")))
}

/// Allocate ids for new definitions, rejecting names already in use.
async fn new_definitions(
    ctx: &mut StepContext<'_>,
    info: &PartitionInfo,
    specs: &[PartitionSpec],
    replacing: &[String],
) -> FalconResult<Vec<PartitionDef>> {
    if specs.is_empty() {
        return Err(FalconError::validation("no partitions given"));
    }
    let mut seen = HashSet::new();
    for spec in specs {
        let lower = spec.name.to_ascii_lowercase();
        let taken = info.find(&spec.name).is_some()
            && !replacing.iter().any(|r| r.eq_ignore_ascii_case(&spec.name));
        if taken || !seen.insert(lower) {
            return Err(DdlError::PartitionExists(spec.name.clone()).into());
        }
    }
    let ids = ctx.txn.gen_global_ids(specs.len()).await?;
    Ok(specs
        .iter()
        .zip(ids)
        .map(|(spec, id)| PartitionDef {
            id: PartitionId(id),
            name: spec.name.clone(),
            less_than: spec.less_than.clone(),
        })
        .collect())
}

fn find_all<'a>(info: &'a PartitionInfo, names: &[String]) -> FalconResult<Vec<&'a PartitionDef>> {
    names
        .iter()
        .map(|n| {
            info.find(n)
                .ok_or_else(|| FalconError::from(DdlError::PartitionNotFound(n.clone())))
        })
        .collect()
}

// ── ADD PARTITION ────────────────────────────────────────────────────

pub(super) async fn on_add_table_partition(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::AddPartitions { partitions } = job.args.clone() else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;

    match job.schema_state {
        SchemaState::None => {
            let defs = new_definitions(ctx, partition_info(&table)?, &partitions, &[]).await?;
            partition_info_mut(&mut table)?.adding_definitions = defs;
            job.schema_state = SchemaState::ReplicaOnly;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::ReplicaOnly => {
            let info = partition_info_mut(&mut table)?;
            let adding = std::mem::take(&mut info.adding_definitions);
            info.definitions.extend(adding);
            ctx.update_table(job, &table, true).await?;
            job.finish_forward_or_rollback(SchemaState::Public);
            Ok(())
        }
        other => Err(DdlError::InvalidDdlState {
            object: "partition",
            state: other,
        }
        .into()),
    }
}

/// Rollback of ADD / REORGANIZE PARTITION: discard every definition that
/// was being added. The public definitions were never touched.
pub(super) async fn on_drop_adding_partitions(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let mut table = ctx.table_or_cancel(job).await?;
    let info = partition_info_mut(&mut table)?;
    let adding = std::mem::take(&mut info.adding_definitions);
    job.delete_ranges.extend(adding.iter().map(|d| delete_range(d.id.0)));
    ctx.update_table(job, &table, true).await?;
    job.finish_forward_or_rollback(SchemaState::None);
    Ok(())
}

// ── DROP PARTITION ───────────────────────────────────────────────────

pub(super) async fn on_drop_table_partition(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::DropPartitions { names } = job.args.clone() else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;

    match job.schema_state {
        SchemaState::Public => {
            let info = partition_info(&table)?;
            let dropping: Vec<PartitionId> = find_all(info, &names)?.iter().map(|d| d.id).collect();
            if dropping.len() >= info.definitions.len() {
                return Err(FalconError::validation(
                    "cannot remove all partitions, use DROP TABLE instead",
                ));
            }
            let info = partition_info_mut(&mut table)?;
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut info.definitions)
                .into_iter()
                .partition(|d| dropping.contains(&d.id));
            info.definitions = kept;
            info.dropping_definitions = gone;
            job.schema_state = SchemaState::DeleteOnly;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::DeleteOnly => {
            job.schema_state = SchemaState::DeleteReorganization;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::DeleteReorganization => {
            let info = partition_info_mut(&mut table)?;
            let gone = std::mem::take(&mut info.dropping_definitions);
            job.delete_ranges.extend(gone.iter().map(|d| delete_range(d.id.0)));
            ctx.update_table(job, &table, true).await?;
            job.finish_forward_or_rollback(SchemaState::None);
            Ok(())
        }
        other => Err(DdlError::InvalidDdlState {
            object: "partition",
            state: other,
        }
        .into()),
    }
}

// ── TRUNCATE PARTITION ───────────────────────────────────────────────

pub(super) async fn on_truncate_table_partition(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::TruncatePartitions { names } = job.args.clone() else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;
    let old: Vec<PartitionId> = find_all(partition_info(&table)?, &names)?
        .iter()
        .map(|d| d.id)
        .collect();
    let new_ids = ctx.txn.gen_global_ids(old.len()).await?;
    let info = partition_info_mut(&mut table)?;
    for (old_id, new_id) in old.iter().zip(new_ids) {
        if let Some(def) = info.definitions.iter_mut().find(|d| d.id == *old_id) {
            def.id = PartitionId(new_id);
        }
    }
    job.delete_ranges.extend(old.iter().map(|id| delete_range(id.0)));
    ctx.update_table(job, &table, true).await?;
    job.finish_forward_or_rollback(SchemaState::Public);
    Ok(())
}

// ── REORGANIZE PARTITION ─────────────────────────────────────────────

pub(super) async fn on_reorganize_partition(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::ReorganizePartitions { drop, add } = job.args.clone() else {
        return Err(invalid_args(job));
    };
    let mut table = ctx.table_or_cancel(job).await?;

    match job.schema_state {
        SchemaState::None => {
            let info = partition_info(&table)?;
            find_all(info, &drop)?;
            let defs = new_definitions(ctx, info, &add, &drop).await?;
            partition_info_mut(&mut table)?.adding_definitions = defs;
            job.schema_state = SchemaState::DeleteOnly;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::DeleteOnly => {
            job.schema_state = SchemaState::WriteOnly;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::WriteOnly => {
            job.schema_state = SchemaState::WriteReorganization;
            ctx.update_table(job, &table, true).await
        }
        SchemaState::WriteReorganization => {
            let info = partition_info(&table)?;
            let dropping: Vec<PartitionId> = find_all(info, &drop)?.iter().map(|d| d.id).collect();
            let element = ReorgElement::Partitions {
                dropping: dropping.clone(),
                adding: info.adding_definitions.iter().map(|d| d.id).collect(),
            };
            match run_reorg(ctx, job, element).await? {
                ReorgProgress::Started => return Ok(()),
                ReorgProgress::Completed => {}
            }
            let info = partition_info_mut(&mut table)?;
            let insert_at = info
                .definitions
                .iter()
                .position(|d| dropping.contains(&d.id))
                .unwrap_or(info.definitions.len());
            let adding = std::mem::take(&mut info.adding_definitions);
            info.definitions.retain(|d| !dropping.contains(&d.id));
            let tail = info.definitions.split_off(insert_at.min(info.definitions.len()));
            info.definitions.extend(adding);
            info.definitions.extend(tail);
            job.delete_ranges.extend(dropping.iter().map(|id| delete_range(id.0)));
            ctx.update_table(job, &table, true).await?;
            job.finish_forward_or_rollback(SchemaState::Public);
            Ok(())
        }
        other => Err(DdlError::InvalidDdlState {
            object: "partition",
            state: other,
        }
        .into()),
    }
}
