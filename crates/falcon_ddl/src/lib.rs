//! Online schema-change controller.
//!
//! Schema changes run as persisted jobs that move one object through a
//! fixed sequence of intermediate states (`None → DeleteOnly → WriteOnly →
//! WriteReorganization → Public` and back), one state per metadata
//! transaction and one schema version bump per visible change. Only the
//! elected owner runs jobs; any node may submit, cancel or poll them.

pub mod callback;
pub mod ddl;
pub mod job;
pub mod meta;
pub mod owner;
pub mod policy;
pub mod reorg;
pub mod rollback;
pub mod step;
pub mod txn;
pub mod version;
mod worker;

pub use callback::{
    BaseCallback, CallbackRegistry, ColumnTypeChangeCallback, DdlCallback, DefaultCallback,
    NoopReloader, SchemaReloader,
};
pub use ddl::{CancelOutcome, DdlController};
pub use job::{
    ActionType, ColumnSpec, Job, JobArgs, JobError, JobErrorCode, JobState, JobStatus,
    PartitionSpec, SubJobSpec,
};
pub use meta::{MemMetaStore, MetaKey, MetaStore};
pub use owner::{OwnerElection, StoreLeaseElection};
pub use policy::{is_job_rollbackable, RollbackPolicy};
pub use reorg::{
    BackfillExecutor, BackfillRequest, LocalReorgPool, NoopBackfill, ReorgElement, ReorgResult,
    ReorgWorkerPool,
};
pub use rollback::RollbackDecision;
pub use txn::{MetaTxn, SchemaDiff};
pub use version::SchemaVersionSyncer;
