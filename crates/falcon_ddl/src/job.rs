//! Schema-change job record.
//!
//! A [`Job`] is both the request (action + arguments) and its execution
//! record (lifecycle state, object visibility phase, backfill marker, error
//! accounting). The record is persisted as JSON in the metadata store; fields
//! written by newer nodes that this build does not know are kept in
//! [`Job::extra`] and written back unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use falcon_common::error::{DdlErrorClass, FalconError};
use falcon_common::schema::{SchemaState, TableInfo};
use falcon_common::types::{JobId, SchemaId, SchemaVersion, TableId};

// ── Action types ─────────────────────────────────────────────────────

/// The closed set of schema changes the controller knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    CreateSchema,
    DropSchema,
    ModifySchemaCharsetAndCollate,
    CreateTable,
    DropTable,
    TruncateTable,
    RenameTable,
    RebaseAutoId,
    ShardRowId,
    ModifyTableCharsetAndCollate,
    ModifyTableAutoIdCache,
    AddColumn,
    DropColumn,
    ModifyColumn,
    AddIndex,
    AddPrimaryKey,
    DropIndex,
    DropPrimaryKey,
    RenameIndex,
    AlterIndexVisibility,
    AddTablePartition,
    DropTablePartition,
    TruncateTablePartition,
    ReorganizePartition,
    AddCheckConstraint,
    DropCheckConstraint,
    AlterCheckConstraint,
    AddForeignKey,
    DropForeignKey,
    MultiSchemaChange,
}

impl ActionType {
    pub const ALL: [ActionType; 30] = [
        ActionType::CreateSchema,
        ActionType::DropSchema,
        ActionType::ModifySchemaCharsetAndCollate,
        ActionType::CreateTable,
        ActionType::DropTable,
        ActionType::TruncateTable,
        ActionType::RenameTable,
        ActionType::RebaseAutoId,
        ActionType::ShardRowId,
        ActionType::ModifyTableCharsetAndCollate,
        ActionType::ModifyTableAutoIdCache,
        ActionType::AddColumn,
        ActionType::DropColumn,
        ActionType::ModifyColumn,
        ActionType::AddIndex,
        ActionType::AddPrimaryKey,
        ActionType::DropIndex,
        ActionType::DropPrimaryKey,
        ActionType::RenameIndex,
        ActionType::AlterIndexVisibility,
        ActionType::AddTablePartition,
        ActionType::DropTablePartition,
        ActionType::TruncateTablePartition,
        ActionType::ReorganizePartition,
        ActionType::AddCheckConstraint,
        ActionType::DropCheckConstraint,
        ActionType::AlterCheckConstraint,
        ActionType::AddForeignKey,
        ActionType::DropForeignKey,
        ActionType::MultiSchemaChange,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::CreateSchema => "create schema",
            ActionType::DropSchema => "drop schema",
            ActionType::ModifySchemaCharsetAndCollate => "modify schema charset and collate",
            ActionType::CreateTable => "create table",
            ActionType::DropTable => "drop table",
            ActionType::TruncateTable => "truncate table",
            ActionType::RenameTable => "rename table",
            ActionType::RebaseAutoId => "rebase auto_increment ID",
            ActionType::ShardRowId => "shard row ID",
            ActionType::ModifyTableCharsetAndCollate => "modify table charset and collate",
            ActionType::ModifyTableAutoIdCache => "modify auto id cache",
            ActionType::AddColumn => "add column",
            ActionType::DropColumn => "drop column",
            ActionType::ModifyColumn => "modify column",
            ActionType::AddIndex => "add index",
            ActionType::AddPrimaryKey => "add primary key",
            ActionType::DropIndex => "drop index",
            ActionType::DropPrimaryKey => "drop primary key",
            ActionType::RenameIndex => "rename index",
            ActionType::AlterIndexVisibility => "alter index visibility",
            ActionType::AddTablePartition => "add partition",
            ActionType::DropTablePartition => "drop partition",
            ActionType::TruncateTablePartition => "truncate partition",
            ActionType::ReorganizePartition => "alter table reorganize partition",
            ActionType::AddCheckConstraint => "add check constraint",
            ActionType::DropCheckConstraint => "drop check constraint",
            ActionType::AlterCheckConstraint => "alter check constraint",
            ActionType::AddForeignKey => "add foreign key",
            ActionType::DropForeignKey => "drop foreign key",
            ActionType::MultiSchemaChange => "alter table multi-schema change",
        }
    }

    /// Actions that may appear as sub-jobs of a multi-schema change.
    pub fn allowed_in_multi_schema_change(self) -> bool {
        matches!(
            self,
            ActionType::AddColumn
                | ActionType::DropColumn
                | ActionType::ModifyColumn
                | ActionType::AddIndex
                | ActionType::DropIndex
                | ActionType::RenameIndex
                | ActionType::AlterIndexVisibility
        )
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Job lifecycle ────────────────────────────────────────────────────

/// Lifecycle state of the job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum JobState {
    #[default]
    Queueing,
    Running,
    Rollingback,
    Done,
    RollbackDone,
    Cancelling,
    Cancelled,
    Pausing,
    Paused,
}

impl JobState {
    /// Terminal jobs live in the history log and are never mutated again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Done | JobState::RollbackDone | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queueing => "queueing",
            JobState::Running => "running",
            JobState::Rollingback => "rollingback",
            JobState::Done => "done",
            JobState::RollbackDone => "rollback done",
            JobState::Cancelling => "cancelling",
            JobState::Cancelled => "cancelled",
            JobState::Pausing => "pausing",
            JobState::Paused => "paused",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Arguments ────────────────────────────────────────────────────────

/// Column definition carried by ADD COLUMN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub default_value: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Partition definition carried by partition DDL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub name: String,
    pub less_than: String,
}

/// A sub-job request inside a multi-schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubJobSpec {
    pub action: ActionType,
    pub args: JobArgs,
}

/// Type-specific job payload.
///
/// The rollback converter rewrites a job's arguments to the inverse
/// operation (e.g. `AddColumn` becomes `DropColumn`) before it drives the
/// job backwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobArgs {
    CreateSchema {
        name: String,
        #[serde(default)]
        charset: String,
        #[serde(default)]
        collate: String,
    },
    DropSchema,
    ModifySchemaCharset {
        charset: String,
        collate: String,
    },
    CreateTable {
        table: TableInfo,
    },
    DropTable,
    TruncateTable {
        /// Allocated by the step that swaps the table in.
        #[serde(default)]
        new_table_id: Option<TableId>,
    },
    RenameTable {
        new_name: String,
    },
    RebaseAutoId {
        new_base: i64,
    },
    ShardRowId {
        bits: u64,
    },
    ModifyTableCharset {
        charset: String,
        collate: String,
    },
    ModifyTableAutoIdCache {
        cache: u64,
    },
    AddColumn {
        column: ColumnSpec,
    },
    DropColumn {
        name: String,
    },
    ModifyColumn {
        name: String,
        new_type: String,
        nullable: bool,
    },
    AddIndex {
        name: String,
        columns: Vec<String>,
        #[serde(default)]
        unique: bool,
    },
    DropIndex {
        name: String,
        #[serde(default)]
        if_exists: bool,
        #[serde(default)]
        partition_ids: Vec<u64>,
    },
    RenameIndex {
        from: String,
        to: String,
    },
    AlterIndexVisibility {
        name: String,
        invisible: bool,
    },
    AddPartitions {
        partitions: Vec<PartitionSpec>,
    },
    DropPartitions {
        names: Vec<String>,
    },
    TruncatePartitions {
        names: Vec<String>,
    },
    ReorganizePartitions {
        drop: Vec<String>,
        add: Vec<PartitionSpec>,
    },
    AddCheckConstraint {
        name: String,
        expr: String,
        #[serde(default = "default_true")]
        enforced: bool,
    },
    DropCheckConstraint {
        name: String,
    },
    AlterCheckConstraint {
        name: String,
        enforced: bool,
    },
    AddForeignKey {
        name: String,
        columns: Vec<String>,
        ref_table: String,
        ref_columns: Vec<String>,
    },
    DropForeignKey {
        name: String,
    },
    MultiSchemaChange {
        sub_jobs: Vec<SubJobSpec>,
    },
}

impl JobArgs {
    /// Whether these arguments are a valid submission payload for `action`.
    pub fn matches(&self, action: ActionType) -> bool {
        matches!(
            (action, self),
            (ActionType::CreateSchema, JobArgs::CreateSchema { .. })
                | (ActionType::DropSchema, JobArgs::DropSchema)
                | (ActionType::ModifySchemaCharsetAndCollate, JobArgs::ModifySchemaCharset { .. })
                | (ActionType::CreateTable, JobArgs::CreateTable { .. })
                | (ActionType::DropTable, JobArgs::DropTable)
                | (ActionType::TruncateTable, JobArgs::TruncateTable { .. })
                | (ActionType::RenameTable, JobArgs::RenameTable { .. })
                | (ActionType::RebaseAutoId, JobArgs::RebaseAutoId { .. })
                | (ActionType::ShardRowId, JobArgs::ShardRowId { .. })
                | (ActionType::ModifyTableCharsetAndCollate, JobArgs::ModifyTableCharset { .. })
                | (ActionType::ModifyTableAutoIdCache, JobArgs::ModifyTableAutoIdCache { .. })
                | (ActionType::AddColumn, JobArgs::AddColumn { .. })
                | (ActionType::DropColumn, JobArgs::DropColumn { .. })
                | (ActionType::ModifyColumn, JobArgs::ModifyColumn { .. })
                | (ActionType::AddIndex, JobArgs::AddIndex { .. })
                | (ActionType::AddPrimaryKey, JobArgs::AddIndex { .. })
                | (ActionType::DropIndex, JobArgs::DropIndex { .. })
                | (ActionType::DropPrimaryKey, JobArgs::DropIndex { .. })
                | (ActionType::RenameIndex, JobArgs::RenameIndex { .. })
                | (ActionType::AlterIndexVisibility, JobArgs::AlterIndexVisibility { .. })
                | (ActionType::AddTablePartition, JobArgs::AddPartitions { .. })
                | (ActionType::DropTablePartition, JobArgs::DropPartitions { .. })
                | (ActionType::TruncateTablePartition, JobArgs::TruncatePartitions { .. })
                | (ActionType::ReorganizePartition, JobArgs::ReorganizePartitions { .. })
                | (ActionType::AddCheckConstraint, JobArgs::AddCheckConstraint { .. })
                | (ActionType::DropCheckConstraint, JobArgs::DropCheckConstraint { .. })
                | (ActionType::AlterCheckConstraint, JobArgs::AlterCheckConstraint { .. })
                | (ActionType::AddForeignKey, JobArgs::AddForeignKey { .. })
                | (ActionType::DropForeignKey, JobArgs::DropForeignKey { .. })
                | (ActionType::MultiSchemaChange, JobArgs::MultiSchemaChange { .. })
        )
    }
}

// ── Errors recorded on the job ───────────────────────────────────────

/// Persisted classification of the last job error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobErrorCode {
    Validation,
    TransientStore,
    ReorgWorker,
    OwnerLost,
    RollbackExhausted,
    Cancelled,
    Internal,
}

impl From<DdlErrorClass> for JobErrorCode {
    fn from(class: DdlErrorClass) -> Self {
        match class {
            DdlErrorClass::Validation => JobErrorCode::Validation,
            DdlErrorClass::TransientStore => JobErrorCode::TransientStore,
            DdlErrorClass::ReorgWorker => JobErrorCode::ReorgWorker,
            DdlErrorClass::OwnerLost => JobErrorCode::OwnerLost,
            DdlErrorClass::RollbackExhausted => JobErrorCode::RollbackExhausted,
            DdlErrorClass::Cancelled => JobErrorCode::Cancelled,
            DdlErrorClass::Internal => JobErrorCode::Internal,
        }
    }
}

/// Last error observed by a job, with a user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: JobErrorCode,
    pub message: String,
}

impl JobError {
    pub fn new(code: JobErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The plain "Cancelled DDL job" error.
    pub fn cancelled() -> Self {
        Self::new(
            JobErrorCode::Cancelled,
            falcon_common::error::DdlError::CancelledJob.to_string(),
        )
    }

    pub fn is_plain_cancel(&self) -> bool {
        self.code == JobErrorCode::Cancelled
    }
}

impl From<&FalconError> for JobError {
    fn from(err: &FalconError) -> Self {
        Self::new(err.ddl_class().into(), err.to_string())
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

// ── Multi-schema change ──────────────────────────────────────────────

/// Execution record of one sub-job of a multi-schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubJob {
    pub action: ActionType,
    pub args: JobArgs,
    pub schema_state: SchemaState,
    pub state: JobState,
    #[serde(default)]
    pub snapshot_ver: u64,
    #[serde(default)]
    pub row_count: u64,
    /// Cleared once the sub-job has reached its last revertible point.
    pub revertible: bool,
}

/// Composite job bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiSchemaInfo {
    pub sub_jobs: Vec<SubJob>,
    /// Cleared once every sub-job is past its last revertible point; from
    /// then on the remaining sub-jobs are run to completion.
    pub revertible: bool,
}

impl MultiSchemaInfo {
    pub fn from_specs(specs: &[SubJobSpec]) -> Self {
        Self {
            sub_jobs: specs
                .iter()
                .map(|s| SubJob {
                    action: s.action,
                    args: s.args.clone(),
                    schema_state: s.action.policy().initial_state(),
                    state: JobState::Queueing,
                    snapshot_ver: 0,
                    row_count: 0,
                    revertible: true,
                })
                .collect(),
            revertible: true,
        }
    }
}

/// Marks a transient job built from a sub-job so the step functions know
/// whether they may cross the sub-job's point of no return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyInfo {
    pub sub_index: usize,
    pub revertible: bool,
}

/// Physical key range left behind by a drop; reclaimed asynchronously by GC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRange {
    /// Table or partition id owning the range.
    pub physical_id: u64,
    /// Index id when only an index range is dropped.
    #[serde(default)]
    pub index_id: Option<u64>,
}

// ── Job ──────────────────────────────────────────────────────────────

/// A schema-change request and its execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub action: ActionType,
    pub schema_id: SchemaId,
    pub table_id: TableId,
    pub schema_state: SchemaState,
    pub state: JobState,
    pub args: JobArgs,
    /// Zero until backfill workers are launched. Non-zero marks the job as
    /// no longer cancellable outright.
    #[serde(default)]
    pub snapshot_ver: u64,
    #[serde(default)]
    pub error: Option<JobError>,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub row_count: u64,
    /// Last schema version this job published.
    #[serde(default)]
    pub schema_version: SchemaVersion,
    #[serde(default)]
    pub multi_schema_info: Option<MultiSchemaInfo>,
    #[serde(default)]
    pub delete_ranges: Vec<DeleteRange>,
    /// Wall-clock submission time in unix milliseconds.
    #[serde(default)]
    pub submitted_at_ms: u64,
    #[serde(skip)]
    pub proxy: Option<ProxyInfo>,
    /// Fields unknown to this build, preserved across re-serialization.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Job {
    pub fn new(
        id: JobId,
        action: ActionType,
        schema_id: SchemaId,
        table_id: TableId,
        args: JobArgs,
    ) -> Self {
        let multi_schema_info = match &args {
            JobArgs::MultiSchemaChange { sub_jobs } => Some(MultiSchemaInfo::from_specs(sub_jobs)),
            _ => None,
        };
        Self {
            id,
            action,
            schema_id,
            table_id,
            schema_state: action.policy().initial_state(),
            state: JobState::Queueing,
            args,
            snapshot_ver: 0,
            error: None,
            error_count: 0,
            row_count: 0,
            schema_version: SchemaVersion::ZERO,
            multi_schema_info,
            delete_ranges: Vec::new(),
            submitted_at_ms: 0,
            proxy: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn is_rolling_back(&self) -> bool {
        self.state == JobState::Rollingback
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Finish the job in `state`, leaving the object at `schema_state`.
    pub fn finish(&mut self, state: JobState, schema_state: SchemaState) {
        self.state = state;
        self.schema_state = schema_state;
    }

    /// Finish a table job: `Done` going forward, `RollbackDone` when
    /// unwinding.
    pub fn finish_forward_or_rollback(&mut self, schema_state: SchemaState) {
        let state = if self.is_rolling_back() {
            JobState::RollbackDone
        } else {
            JobState::Done
        };
        self.finish(state, schema_state);
    }

    /// Record `err` unless an earlier error is already recorded.
    pub fn record_error_if_none(&mut self, err: JobError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id,
            action: self.action,
            state: self.state,
            schema_state: self.schema_state,
            error: self.error.clone(),
            error_count: self.error_count,
            snapshot_ver: self.snapshot_ver,
            schema_version: self.schema_version,
        }
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ID:{}, Type:{}, State:{}, SchemaState:{}, SchemaID:{}, TableID:{}, RowCount:{}, SnapshotVersion:{}, ErrorCount:{}",
            self.id.0,
            self.action,
            self.state,
            self.schema_state,
            self.schema_id.0,
            self.table_id.0,
            self.row_count,
            self.snapshot_ver,
            self.error_count
        )
    }
}

/// What a submitter can poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub action: ActionType,
    pub state: JobState,
    pub schema_state: SchemaState,
    pub error: Option<JobError>,
    pub error_count: u64,
    pub snapshot_ver: u64,
    pub schema_version: SchemaVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_column_job() -> Job {
        Job::new(
            JobId(5),
            ActionType::AddColumn,
            SchemaId(1),
            TableId(2),
            JobArgs::AddColumn {
                column: ColumnSpec {
                    name: "email".into(),
                    data_type: "varchar(64)".into(),
                    nullable: true,
                    default_value: None,
                },
            },
        )
    }

    #[test]
    fn test_new_job_starts_queueing_at_initial_state() {
        let job = add_column_job();
        assert_eq!(job.state, JobState::Queueing);
        assert_eq!(job.schema_state, SchemaState::None);

        let drop = Job::new(
            JobId(6),
            ActionType::DropColumn,
            SchemaId(1),
            TableId(2),
            JobArgs::DropColumn { name: "email".into() },
        );
        assert_eq!(drop.schema_state, SchemaState::Public);
    }

    #[test]
    fn test_unknown_fields_survive_reserialize() {
        let job = add_column_job();
        let mut value = serde_json::to_value(&job).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("placement_policy".into(), serde_json::json!({"region": "eu"}));

        let decoded: Job = serde_json::from_value(value).unwrap();
        assert_eq!(
            decoded.extra.get("placement_policy"),
            Some(&serde_json::json!({"region": "eu"}))
        );

        let again = serde_json::to_value(&decoded).unwrap();
        assert_eq!(again["placement_policy"]["region"], "eu");
        assert_eq!(again["action"], "AddColumn");
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let job = add_column_job();
        let mut value = serde_json::to_value(&job).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("row_count");
        obj.remove("delete_ranges");
        obj.remove("error_count");
        let decoded: Job = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.row_count, 0);
        assert!(decoded.delete_ranges.is_empty());
    }

    #[test]
    fn test_args_match_action() {
        let job = add_column_job();
        assert!(job.args.matches(ActionType::AddColumn));
        assert!(!job.args.matches(ActionType::DropColumn));
        assert!(JobArgs::AddIndex {
            name: "PRIMARY".into(),
            columns: vec!["id".into()],
            unique: true
        }
        .matches(ActionType::AddPrimaryKey));
    }

    #[test]
    fn test_multi_schema_info_built_from_args() {
        let job = Job::new(
            JobId(9),
            ActionType::MultiSchemaChange,
            SchemaId(1),
            TableId(2),
            JobArgs::MultiSchemaChange {
                sub_jobs: vec![
                    SubJobSpec {
                        action: ActionType::AddColumn,
                        args: add_column_job().args,
                    },
                    SubJobSpec {
                        action: ActionType::DropIndex,
                        args: JobArgs::DropIndex {
                            name: "idx_a".into(),
                            if_exists: false,
                            partition_ids: vec![],
                        },
                    },
                ],
            },
        );
        let info = job.multi_schema_info.unwrap();
        assert!(info.revertible);
        assert_eq!(info.sub_jobs.len(), 2);
        assert_eq!(info.sub_jobs[0].schema_state, SchemaState::None);
        assert_eq!(info.sub_jobs[1].schema_state, SchemaState::Public);
        assert!(info.sub_jobs.iter().all(|s| s.state == JobState::Queueing));
    }

    #[test]
    fn test_finish_forward_or_rollback() {
        let mut job = add_column_job();
        job.state = JobState::Rollingback;
        job.finish_forward_or_rollback(SchemaState::None);
        assert_eq!(job.state, JobState::RollbackDone);

        let mut job = add_column_job();
        job.state = JobState::Running;
        job.finish_forward_or_rollback(SchemaState::Public);
        assert_eq!(job.state, JobState::Done);
        assert!(job.is_finished());
    }
}
