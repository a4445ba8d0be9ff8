//! Per-action execution and rollback policy.
//!
//! Every [`ActionType`] maps to exactly one [`ActionPolicy`]. The match is
//! exhaustive so a new action cannot be added without deciding how it
//! advances and how it is cancelled.

use falcon_common::schema::SchemaState;

use crate::job::{ActionType, Job, JobState};

use SchemaState as S;

const ADD_WITH_REORG: &[SchemaState] = &[S::None, S::DeleteOnly, S::WriteOnly, S::WriteReorganization, S::Public];
const ADD_PARTITION: &[SchemaState] = &[S::None, S::ReplicaOnly, S::Public];
const ADD_CONSTRAINT: &[SchemaState] = &[S::None, S::WriteOnly, S::WriteReorganization, S::Public];
const DROP_OBJECT: &[SchemaState] = &[S::Public, S::WriteOnly, S::DeleteOnly, S::DeleteReorganization, S::None];
const DROP_TABLE: &[SchemaState] = &[S::Public, S::WriteOnly, S::DeleteOnly, S::None];
const DROP_PARTITION: &[SchemaState] = &[S::Public, S::DeleteOnly, S::DeleteReorganization, S::None];
const DROP_CONSTRAINT: &[SchemaState] = &[S::Public, S::WriteOnly, S::None];
const DROP_IN_ONE_STEP: &[SchemaState] = &[S::Public, S::None];
const ONE_STEP: &[SchemaState] = &[S::None, S::Public];
const REORGANIZE_PARTITION: &[SchemaState] =
    &[S::None, S::DeleteOnly, S::WriteOnly, S::WriteReorganization, S::Public];

/// How the rollback converter treats a cancelled job of a given action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackPolicy {
    /// Nothing is visible before the single step; cancel outright.
    CancelDirectly,
    /// Cancellable only while the job has not left `initial`.
    CancelOnlyNotHandled { initial: SchemaState, check_table: bool },
    /// Turn the added column into a drop and run it backwards.
    AddColumn,
    /// Stop backfill, then turn the added index into a drop.
    AddIndex { primary: bool },
    AddTablePartition,
    ReorganizePartition,
    ModifyColumn,
    AddCheckConstraint,
    DropColumn,
    DropIndex,
    DropTable,
    DropSchema,
    DropCheckConstraint,
    RenameIndex,
    MultiSchemaChange,
}

/// Forward state sequence, reorg requirement and rollback policy of an action.
#[derive(Debug, Clone, Copy)]
pub struct ActionPolicy {
    /// Object states the job passes through, in order.
    pub states: &'static [SchemaState],
    /// Whether the forward path backfills existing data.
    pub needs_reorg: bool,
    pub rollback: RollbackPolicy,
}

impl ActionPolicy {
    pub fn initial_state(&self) -> SchemaState {
        self.states.first().copied().unwrap_or(S::None)
    }

    pub fn final_state(&self) -> SchemaState {
        self.states.last().copied().unwrap_or(S::None)
    }

    /// Position of `state` in the forward sequence.
    pub fn position(&self, state: SchemaState) -> Option<usize> {
        self.states.iter().position(|s| *s == state)
    }
}

impl ActionType {
    pub fn policy(self) -> ActionPolicy {
        let (states, needs_reorg, rollback) = match self {
            ActionType::CreateSchema | ActionType::CreateTable => {
                (ONE_STEP, false, RollbackPolicy::CancelDirectly)
            }
            ActionType::DropSchema => (DROP_TABLE, false, RollbackPolicy::DropSchema),
            ActionType::DropTable => (DROP_TABLE, false, RollbackPolicy::DropTable),
            ActionType::TruncateTable => (
                ONE_STEP,
                false,
                RollbackPolicy::CancelOnlyNotHandled {
                    initial: S::None,
                    check_table: true,
                },
            ),
            ActionType::ModifySchemaCharsetAndCollate
            | ActionType::RenameTable
            | ActionType::RebaseAutoId
            | ActionType::ShardRowId
            | ActionType::ModifyTableCharsetAndCollate
            | ActionType::ModifyTableAutoIdCache
            | ActionType::TruncateTablePartition
            | ActionType::AddForeignKey => (
                ONE_STEP,
                false,
                RollbackPolicy::CancelOnlyNotHandled {
                    initial: S::None,
                    check_table: false,
                },
            ),
            ActionType::AlterIndexVisibility | ActionType::AlterCheckConstraint => (
                ONE_STEP,
                false,
                RollbackPolicy::CancelOnlyNotHandled {
                    initial: S::None,
                    check_table: false,
                },
            ),
            ActionType::AddColumn => (ADD_WITH_REORG, false, RollbackPolicy::AddColumn),
            ActionType::DropColumn => (DROP_OBJECT, false, RollbackPolicy::DropColumn),
            ActionType::ModifyColumn => (ADD_WITH_REORG, true, RollbackPolicy::ModifyColumn),
            ActionType::AddIndex => (
                ADD_WITH_REORG,
                true,
                RollbackPolicy::AddIndex { primary: false },
            ),
            ActionType::AddPrimaryKey => (
                ADD_WITH_REORG,
                true,
                RollbackPolicy::AddIndex { primary: true },
            ),
            ActionType::DropIndex | ActionType::DropPrimaryKey => {
                (DROP_OBJECT, false, RollbackPolicy::DropIndex)
            }
            ActionType::RenameIndex => (ONE_STEP, false, RollbackPolicy::RenameIndex),
            ActionType::AddTablePartition => {
                (ADD_PARTITION, false, RollbackPolicy::AddTablePartition)
            }
            ActionType::DropTablePartition => (
                DROP_PARTITION,
                false,
                RollbackPolicy::CancelOnlyNotHandled {
                    initial: S::Public,
                    check_table: true,
                },
            ),
            ActionType::ReorganizePartition => (
                REORGANIZE_PARTITION,
                true,
                RollbackPolicy::ReorganizePartition,
            ),
            ActionType::AddCheckConstraint => {
                (ADD_CONSTRAINT, true, RollbackPolicy::AddCheckConstraint)
            }
            ActionType::DropCheckConstraint => {
                (DROP_CONSTRAINT, false, RollbackPolicy::DropCheckConstraint)
            }
            ActionType::DropForeignKey => (
                DROP_IN_ONE_STEP,
                false,
                RollbackPolicy::CancelOnlyNotHandled {
                    initial: S::Public,
                    check_table: false,
                },
            ),
            ActionType::MultiSchemaChange => {
                (ONE_STEP, false, RollbackPolicy::MultiSchemaChange)
            }
        };
        ActionPolicy {
            states,
            needs_reorg,
            rollback,
        }
    }
}

/// Cheap pre-check used by the cancel API: whether the job can still be
/// cancelled given its persisted state alone. The converter makes the final
/// decision with the catalog in hand.
pub fn is_job_rollbackable(job: &Job) -> bool {
    match job.action {
        ActionType::DropIndex | ActionType::DropPrimaryKey => !matches!(
            job.schema_state,
            S::DeleteOnly | S::DeleteReorganization | S::WriteOnly
        ),
        ActionType::AddTablePartition => matches!(job.schema_state, S::None | S::ReplicaOnly),
        ActionType::DropColumn
        | ActionType::DropSchema
        | ActionType::DropTable
        | ActionType::DropForeignKey
        | ActionType::DropTablePartition => job.schema_state == S::Public,
        ActionType::RebaseAutoId
        | ActionType::ShardRowId
        | ActionType::TruncateTable
        | ActionType::AddForeignKey
        | ActionType::RenameTable
        | ActionType::ModifyTableCharsetAndCollate
        | ActionType::TruncateTablePartition
        | ActionType::ModifySchemaCharsetAndCollate
        | ActionType::ModifyTableAutoIdCache => job.schema_state == S::None,
        ActionType::MultiSchemaChange => match &job.multi_schema_info {
            Some(info) => {
                info.revertible
                    && info
                        .sub_jobs
                        .iter()
                        .filter(|s| !matches!(s.state, JobState::Queueing | JobState::Cancelled))
                        .all(|s| s.revertible)
            }
            None => false,
        },
        _ => true,
    }
}

/// Whether a step from `before` to `after` moves forward for a running job
/// (or stays put). Rolling-back jobs are checked by visibility rank instead.
pub fn is_forward_transition(action: ActionType, before: SchemaState, after: SchemaState) -> bool {
    let policy = action.policy();
    match (policy.position(before), policy.position(after)) {
        (Some(b), Some(a)) => a >= b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobArgs, SubJobSpec};
    use falcon_common::types::{JobId, SchemaId, TableId};

    #[test]
    fn test_every_action_has_a_sequence() {
        for action in ActionType::ALL {
            let p = action.policy();
            assert!(p.states.len() >= 2, "{action} has no transitions");
            assert_ne!(p.initial_state(), p.final_state(), "{action}");
        }
    }

    #[test]
    fn test_drop_sequences_start_public() {
        for action in [
            ActionType::DropColumn,
            ActionType::DropIndex,
            ActionType::DropTable,
            ActionType::DropSchema,
            ActionType::DropTablePartition,
            ActionType::DropCheckConstraint,
            ActionType::DropForeignKey,
        ] {
            assert_eq!(action.policy().initial_state(), S::Public, "{action}");
            assert_eq!(action.policy().final_state(), S::None, "{action}");
        }
    }

    #[test]
    fn test_reorg_actions() {
        assert!(ActionType::AddIndex.policy().needs_reorg);
        assert!(ActionType::ModifyColumn.policy().needs_reorg);
        assert!(!ActionType::AddColumn.policy().needs_reorg);
        assert!(!ActionType::DropIndex.policy().needs_reorg);
    }

    #[test]
    fn test_forward_transition_by_position() {
        assert!(is_forward_transition(ActionType::DropColumn, S::Public, S::WriteOnly));
        assert!(is_forward_transition(ActionType::DropColumn, S::DeleteOnly, S::DeleteReorganization));
        assert!(!is_forward_transition(ActionType::DropColumn, S::DeleteOnly, S::WriteOnly));
        assert!(is_forward_transition(ActionType::AddIndex, S::WriteOnly, S::WriteReorganization));
        assert!(!is_forward_transition(ActionType::AddIndex, S::Public, S::DeleteOnly));
    }

    fn job(action: ActionType, state: SchemaState) -> Job {
        let args = match action {
            ActionType::DropIndex => JobArgs::DropIndex {
                name: "i".into(),
                if_exists: false,
                partition_ids: vec![],
            },
            ActionType::AddTablePartition => JobArgs::AddPartitions { partitions: vec![] },
            _ => JobArgs::DropColumn { name: "c".into() },
        };
        let mut j = Job::new(JobId(1), action, SchemaId(1), TableId(2), args);
        j.schema_state = state;
        j
    }

    #[test]
    fn test_rollbackable_precheck() {
        assert!(is_job_rollbackable(&job(ActionType::DropIndex, S::Public)));
        assert!(!is_job_rollbackable(&job(ActionType::DropIndex, S::WriteOnly)));
        assert!(is_job_rollbackable(&job(ActionType::DropColumn, S::Public)));
        assert!(!is_job_rollbackable(&job(ActionType::DropColumn, S::DeleteOnly)));
        assert!(is_job_rollbackable(&job(ActionType::AddTablePartition, S::ReplicaOnly)));
        assert!(!is_job_rollbackable(&job(ActionType::AddTablePartition, S::Public)));
        assert!(is_job_rollbackable(&job(ActionType::AddColumn, S::WriteReorganization)));
    }

    #[test]
    fn test_multi_schema_change_refused_once_a_started_sub_job_is_final() {
        let mut j = Job::new(
            JobId(1),
            ActionType::MultiSchemaChange,
            SchemaId(1),
            TableId(2),
            JobArgs::MultiSchemaChange {
                sub_jobs: vec![
                    SubJobSpec {
                        action: ActionType::DropColumn,
                        args: JobArgs::DropColumn { name: "a".into() },
                    },
                    SubJobSpec {
                        action: ActionType::DropColumn,
                        args: JobArgs::DropColumn { name: "b".into() },
                    },
                ],
            },
        );
        assert!(is_job_rollbackable(&j));
        if let Some(info) = j.multi_schema_info.as_mut() {
            info.sub_jobs[0].state = JobState::Running;
            info.sub_jobs[0].revertible = false;
        }
        assert!(!is_job_rollbackable(&j));
    }
}
