use thiserror::Error;

use crate::schema::SchemaState;
use crate::types::{JobId, NodeId, SchemaId, TableId};

/// Convenience alias for `Result<T, FalconError>`.
pub type FalconResult<T> = Result<T, FalconError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`:   job arguments inconsistent with the catalog, bad request
/// - `Retryable`:   optimistic conflict, ownership change; retry the step
/// - `Transient`:   store unavailable, timeout; retry after back-off
/// - `InternalBug`: should never happen; triggers alert + diagnostic dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// How a step-level error affects the DDL job that hit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlErrorClass {
    /// Arguments no longer match the catalog. Fatal to the job.
    Validation,
    /// Store hiccup or optimistic conflict. Retried, counted.
    TransientStore,
    /// Backfill failed; partially migrated data must be rolled back.
    ReorgWorker,
    /// This node stopped being the DDL owner. Not a job error.
    OwnerLost,
    /// Rollback kept failing past the configured limit.
    RollbackExhausted,
    /// The job was cancelled on request.
    Cancelled,
    Internal,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum FalconError {
    #[error("Metadata error: {0}")]
    Meta(#[from] MetaError),

    #[error("DDL error: {0}")]
    Ddl(#[from] DdlError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Transient resource/backpressure error.
    #[error("Transient: {reason} (retry after {retry_after_ms}ms)")]
    Transient { reason: String, retry_after_ms: u64 },

    /// Internal bug: should never occur in production.
    /// Always carries a unique `error_code` and `debug_context` for post-mortem.
    #[error("InternalBug [{error_code}]: {message} | context: {debug_context}")]
    InternalBug {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

/// Metadata store errors.
#[derive(Error, Debug)]
pub enum MetaError {
    #[error("Database not found: {0}")]
    DatabaseNotFound(SchemaId),

    #[error("Table not found: {1} in {0}")]
    TableNotFound(SchemaId, TableId),

    #[error("Database already exists: {0}")]
    DatabaseExists(String),

    #[error("Table already exists: {0}")]
    TableExists(String),

    /// Optimistic version check failed at commit: another transaction changed
    /// a key this one read.
    #[error("Write conflict on {key}: expected revision {expected:?}, found {actual:?}")]
    VersionConflict {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Schema-change errors.
#[derive(Error, Debug)]
pub enum DdlError {
    #[error("Invalid DDL job: {0}")]
    Validation(String),

    #[error("Column already exists: {0}")]
    ColumnExists(String),

    #[error("Unknown column: {0}")]
    ColumnNotFound(String),

    #[error("Index already exists: {0}")]
    IndexExists(String),

    #[error("Unknown index: {0}")]
    IndexNotFound(String),

    #[error("Constraint already exists: {0}")]
    ConstraintExists(String),

    #[error("Unknown constraint: {0}")]
    ConstraintNotFound(String),

    #[error("Partition already exists: {0}")]
    PartitionExists(String),

    #[error("Unknown partition: {0}")]
    PartitionNotFound(String),

    #[error("Invalid {object} state: {state}")]
    InvalidDdlState {
        object: &'static str,
        state: SchemaState,
    },

    #[error("Invalid DDL job arguments: {0}")]
    InvalidJobArgs(String),

    #[error("DDL job {0} not found")]
    JobNotFound(JobId),

    #[error("DDL job {0} is already finished")]
    JobFinished(JobId),

    #[error("Cancelled DDL job")]
    CancelledJob,

    #[error("DDL job {job_id} cannot be cancelled now: {reason}")]
    CannotCancel { job_id: JobId, reason: String },

    #[error("DDL job {job_id} cannot be paused in state {state}")]
    CannotPause { job_id: JobId, state: String },

    #[error("DDL job {job_id} cannot be resumed in state {state}")]
    CannotResume { job_id: JobId, state: String },

    #[error("Reorganization failed: {0}")]
    Reorg(String),

    /// The backfill has not finished within the wait window. The step is
    /// re-entered later; this is not a job error.
    #[error("Timeout waiting for reorganization of {0}")]
    ReorgPending(JobId),

    #[error("rollback DDL job error count exceed the limit {limit}, cancelled it now")]
    RollbackExhausted { job_id: JobId, limit: u64 },

    #[error("DDL hook `{0}` is not found in hook registered map")]
    UnknownHook(String),

    #[error("Timeout waiting for DDL job {0}")]
    WaitTimeout(JobId),
}

/// Ownership / coordination errors.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("{0} is not the DDL owner")]
    NotOwner(NodeId),

    #[error("{0} lost DDL ownership")]
    OwnerLost(NodeId),

    #[error("Owner lease expired")]
    LeaseExpired,
}

// ── FalconError classification & helpers ─────────────────────────────────────

impl FalconError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FalconError::Meta(MetaError::DatabaseNotFound(_)) => ErrorKind::UserError,
            FalconError::Meta(MetaError::TableNotFound(_, _)) => ErrorKind::UserError,
            FalconError::Meta(MetaError::DatabaseExists(_)) => ErrorKind::UserError,
            FalconError::Meta(MetaError::TableExists(_)) => ErrorKind::UserError,
            FalconError::Meta(MetaError::VersionConflict { .. }) => ErrorKind::Retryable,
            FalconError::Meta(MetaError::Unavailable(_)) => ErrorKind::Transient,
            FalconError::Meta(MetaError::Serialization(_)) => ErrorKind::InternalBug,

            FalconError::Ddl(DdlError::ReorgPending(_)) => ErrorKind::Transient,
            FalconError::Ddl(DdlError::WaitTimeout(_)) => ErrorKind::Transient,
            FalconError::Ddl(DdlError::RollbackExhausted { .. }) => ErrorKind::InternalBug,
            FalconError::Ddl(DdlError::InvalidDdlState { .. }) => ErrorKind::InternalBug,
            FalconError::Ddl(_) => ErrorKind::UserError,

            FalconError::Cluster(_) => ErrorKind::Retryable,

            FalconError::Transient { .. } => ErrorKind::Transient,
            FalconError::InternalBug { .. } => ErrorKind::InternalBug,
            FalconError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    /// Map this error onto the DDL job error taxonomy.
    pub fn ddl_class(&self) -> DdlErrorClass {
        match self {
            FalconError::Meta(MetaError::VersionConflict { .. })
            | FalconError::Meta(MetaError::Unavailable(_))
            | FalconError::Transient { .. }
            | FalconError::Ddl(DdlError::ReorgPending(_))
            | FalconError::Ddl(DdlError::WaitTimeout(_)) => DdlErrorClass::TransientStore,

            FalconError::Meta(MetaError::DatabaseNotFound(_))
            | FalconError::Meta(MetaError::TableNotFound(_, _))
            | FalconError::Meta(MetaError::DatabaseExists(_))
            | FalconError::Meta(MetaError::TableExists(_))
            | FalconError::Ddl(DdlError::Validation(_))
            | FalconError::Ddl(DdlError::ColumnExists(_))
            | FalconError::Ddl(DdlError::ColumnNotFound(_))
            | FalconError::Ddl(DdlError::IndexExists(_))
            | FalconError::Ddl(DdlError::IndexNotFound(_))
            | FalconError::Ddl(DdlError::ConstraintExists(_))
            | FalconError::Ddl(DdlError::ConstraintNotFound(_))
            | FalconError::Ddl(DdlError::PartitionExists(_))
            | FalconError::Ddl(DdlError::PartitionNotFound(_))
            | FalconError::Ddl(DdlError::InvalidJobArgs(_)) => DdlErrorClass::Validation,

            FalconError::Ddl(DdlError::Reorg(_)) => DdlErrorClass::ReorgWorker,
            FalconError::Ddl(DdlError::RollbackExhausted { .. }) => {
                DdlErrorClass::RollbackExhausted
            }
            FalconError::Ddl(DdlError::CancelledJob) => DdlErrorClass::Cancelled,
            FalconError::Cluster(_) => DdlErrorClass::OwnerLost,
            _ => DdlErrorClass::Internal,
        }
    }

    /// Returns true if the caller should retry this operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Returns true if this is a user/input error.
    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    /// Returns true if this is a transient resource/backpressure error.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Returns true if this is an internal bug that should never occur.
    pub fn is_internal_bug(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalBug)
    }

    /// Suggested retry delay in milliseconds (0 = retry immediately).
    pub fn retry_after_ms(&self) -> u64 {
        match self {
            FalconError::Transient { retry_after_ms, .. } => *retry_after_ms,
            FalconError::Meta(MetaError::Unavailable(_)) => 50,
            FalconError::Meta(MetaError::VersionConflict { .. }) => 10,
            _ => 0,
        }
    }

    /// Construct a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        FalconError::Ddl(DdlError::Validation(msg.into()))
    }

    /// Construct a transient backpressure error.
    pub fn transient(reason: impl Into<String>, retry_after_ms: u64) -> Self {
        FalconError::Transient {
            reason: reason.into(),
            retry_after_ms,
        }
    }

    /// Construct an internal bug error with error code and context.
    pub fn internal_bug(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        FalconError::InternalBug {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }

    /// Add context string to an error, **preserving error classification**.
    ///
    /// For structured variants (`Transient`, `InternalBug`), the context is
    /// prepended to the `reason`/`message` field. For `Internal`, it is
    /// prepended to the string. Every other variant already carries its own
    /// classification and is returned unchanged, with the context logged.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            FalconError::Internal(msg) => FalconError::Internal(format!("{ctx}: {msg}")),
            FalconError::Transient {
                reason,
                retry_after_ms,
            } => FalconError::Transient {
                reason: format!("{ctx}: {reason}"),
                retry_after_ms,
            },
            FalconError::InternalBug {
                error_code,
                message,
                debug_context,
            } => FalconError::InternalBug {
                error_code,
                message: format!("{ctx}: {message}"),
                debug_context,
            },
            other => {
                tracing::debug!(context = %ctx, error = %other, "error context");
                other
            }
        }
    }
}

impl From<serde_json::Error> for FalconError {
    fn from(e: serde_json::Error) -> Self {
        FalconError::Meta(MetaError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_conflict_is_retryable_transient_store() {
        let err = FalconError::Meta(MetaError::VersionConflict {
            key: "table/1/2".into(),
            expected: Some(3),
            actual: Some(4),
        });
        assert!(err.is_retryable());
        assert_eq!(err.ddl_class(), DdlErrorClass::TransientStore);
        assert_eq!(err.retry_after_ms(), 10);
    }

    #[test]
    fn test_validation_classification() {
        let err: FalconError = DdlError::ColumnExists("email".into()).into();
        assert!(err.is_user_error());
        assert_eq!(err.ddl_class(), DdlErrorClass::Validation);

        let err: FalconError = MetaError::TableNotFound(SchemaId(1), TableId(9)).into();
        assert_eq!(err.ddl_class(), DdlErrorClass::Validation);
    }

    #[test]
    fn test_reorg_and_owner_classes() {
        let err: FalconError = DdlError::Reorg("duplicate entry".into()).into();
        assert_eq!(err.ddl_class(), DdlErrorClass::ReorgWorker);

        let err: FalconError = ClusterError::OwnerLost(NodeId(2)).into();
        assert_eq!(err.ddl_class(), DdlErrorClass::OwnerLost);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_rollback_exhausted_message_cites_limit() {
        let err: FalconError = DdlError::RollbackExhausted {
            job_id: JobId(7),
            limit: 3,
        }
        .into();
        assert_eq!(err.ddl_class(), DdlErrorClass::RollbackExhausted);
        assert!(err.to_string().contains("exceed the limit 3"));
    }

    #[test]
    fn test_with_context_preserves_transient() {
        let err = FalconError::transient("store busy", 25).with_context("step job:4");
        assert!(err.is_transient());
        assert_eq!(err.retry_after_ms(), 25);
        assert!(err.to_string().contains("step job:4: store busy"));
    }

    #[test]
    fn test_with_context_keeps_structured_variant() {
        let err: FalconError = DdlError::IndexNotFound("idx_a".into()).into();
        let err = err.with_context("drop index");
        assert_eq!(err.ddl_class(), DdlErrorClass::Validation);
    }
}
