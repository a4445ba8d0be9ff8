use falcon_common::error::{DdlError, FalconError, FalconResult, MetaError};
use falcon_common::schema::{DatabaseInfo, SchemaState};

use super::{delete_range, invalid_args, StepContext};
use crate::job::{Job, JobArgs};

pub(super) async fn on_create_schema(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::CreateSchema {
        name,
        charset,
        collate,
    } = job.args.clone()
    else {
        return Err(invalid_args(job));
    };
    if ctx.txn.get_database(job.schema_id).await?.is_some() {
        job.finish_forward_or_rollback(SchemaState::Public);
        return Ok(());
    }
    let taken = ctx
        .txn
        .list_databases()
        .await?
        .iter()
        .any(|db| db.name.eq_ignore_ascii_case(&name));
    if taken {
        return Err(MetaError::DatabaseExists(name).into());
    }

    let mut db = DatabaseInfo::new(job.schema_id, name);
    if !charset.is_empty() {
        db.charset = charset;
    }
    if !collate.is_empty() {
        db.collate = collate;
    }
    ctx.bump(job).await?;
    ctx.txn.put_database(&db)?;
    job.finish_forward_or_rollback(SchemaState::Public);
    tracing::info!(job = %job.id, db = %db.name, "database created");
    Ok(())
}

/// Take the database down through write-only and delete-only; the last
/// step removes it together with every table it holds.
pub(super) async fn on_drop_schema(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let mut db = ctx.txn.must_get_database(job.schema_id).await?;
    match db.state {
        SchemaState::Public => {
            db.state = SchemaState::WriteOnly;
            job.schema_state = SchemaState::WriteOnly;
            ctx.bump(job).await?;
            ctx.txn.put_database(&db)
        }
        SchemaState::WriteOnly => {
            db.state = SchemaState::DeleteOnly;
            job.schema_state = SchemaState::DeleteOnly;
            ctx.bump(job).await?;
            ctx.txn.put_database(&db)
        }
        SchemaState::DeleteOnly => {
            let tables = ctx.txn.list_tables(db.id).await?;
            ctx.bump(job).await?;
            for t in &tables {
                job.delete_ranges
                    .extend(t.physical_ids().into_iter().map(delete_range));
                ctx.txn.delete_table(t.schema_id, t.id);
            }
            ctx.txn.delete_database(db.id);
            job.finish_forward_or_rollback(SchemaState::None);
            tracing::info!(job = %job.id, db = %db.name, tables = tables.len(), "database dropped");
            Ok(())
        }
        other => Err(DdlError::InvalidDdlState {
            object: "database",
            state: other,
        }
        .into()),
    }
}

pub(super) async fn on_modify_schema_charset(ctx: &mut StepContext<'_>, job: &mut Job) -> FalconResult<()> {
    let JobArgs::ModifySchemaCharset { charset, collate } = job.args.clone() else {
        return Err(invalid_args(job));
    };
    if charset.is_empty() {
        return Err(FalconError::validation("charset must not be empty"));
    }
    let mut db = ctx.txn.must_get_database(job.schema_id).await?;
    if db.state != SchemaState::Public {
        return Err(MetaError::DatabaseNotFound(job.schema_id).into());
    }
    db.charset = charset;
    db.collate = collate;
    ctx.bump(job).await?;
    ctx.txn.put_database(&db)?;
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
    use falcon_common::types::{JobId, SchemaId, TableId};

    fn create(name: &str, id: u64) -> Job {
        let mut job = Job::new(
            JobId(70),
            ActionType::CreateSchema,
            SchemaId(id),
            TableId(0),
            JobArgs::CreateSchema {
                name: name.into(),
                charset: String::new(),
                collate: String::new(),
            },
        );
        job.state = JobState::Running;
        job
    }

    #[tokio::test]
    async fn test_create_schema() {
        let h = Harness::new().await;
        let mut job = create("shop", 71);
        h.step(&mut job).await;
        assert_eq!(job.state, JobState::Done);
        let db = MetaTxn::new(h.store.clone())
            .must_get_database(SchemaId(71))
            .await
            .unwrap();
        assert_eq!(db.name, "shop");
        assert_eq!(db.charset, "utf8mb4");
    }

    #[tokio::test]
    async fn test_create_schema_name_taken_cancels() {
        let h = Harness::new().await;
        let mut job = create("TEST", 71);
        assert!(matches!(h.step(&mut job).await, StepOutcome::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_drop_schema_drops_its_tables() {
        let h = Harness::new().await;
        let before = h.version().await;
        let mut job = h.job(ActionType::DropSchema, JobArgs::DropSchema);
        h.run_to_end(&mut job, 5).await;
        assert_eq!(job.state, JobState::Done);
        assert_eq!(h.version().await, before + 3);
        assert_eq!(job.delete_ranges, vec![delete_range(2)]);
        let mut txn = MetaTxn::new(h.store.clone());
        assert!(txn.get_database(SchemaId(1)).await.unwrap().is_none());
        assert!(txn.list_tables(SchemaId(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_modify_schema_charset() {
        let h = Harness::new().await;
        let mut job = h.job(
            ActionType::ModifySchemaCharsetAndCollate,
            JobArgs::ModifySchemaCharset {
                charset: "latin1".into(),
                collate: "latin1_bin".into(),
            },
        );
        h.run_to_end(&mut job, 2).await;
        let db = MetaTxn::new(h.store.clone())
            .must_get_database(SchemaId(1))
            .await
            .unwrap();
        assert_eq!(db.charset, "latin1");
    }
}
