//! Lifecycle hooks around job execution.
//!
//! Hooks are installed by name from the `[ddl] callback_hook` setting. The
//! registry ships `default_hook`, which reloads the local schema on every
//! version change, and `ctc_hook`, which additionally slows down column type
//! changes so concurrent DML can be observed in each intermediate state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use falcon_common::error::{DdlError, FalconError, FalconResult};
use falcon_common::schema::SchemaState;
use falcon_common::types::SchemaVersion;

use crate::job::{ActionType, Job};

/// Reloads a node's in-memory schema from the metadata store.
pub trait SchemaReloader: Send + Sync + 'static {
    fn reload(&self, version: SchemaVersion) -> FalconResult<()>;
}

/// Reloader for nodes that keep no schema cache.
pub struct NoopReloader;

impl SchemaReloader for NoopReloader {
    fn reload(&self, _version: SchemaVersion) -> FalconResult<()> {
        Ok(())
    }
}

/// Hooks invoked by the controller. Every method defaults to a no-op.
#[async_trait]
pub trait DdlCallback: Send + Sync + 'static {
    /// A job reached a terminal state.
    fn on_changed(&self, _err: Option<&FalconError>) {}

    /// This node loaded `version`. Fired once per version, in order.
    fn on_schema_version_changed(&self, _version: SchemaVersion) {}

    /// Before a step of `job` runs.
    async fn on_job_run_before(&self, _job: &Job) {}

    /// After a step of `job` ran, before it is committed.
    fn on_job_run_after(&self, _job: &Job) {}

    /// After a step of `job` was committed.
    fn on_job_updated(&self, _job: &Job) {}

    /// This node became owner and started scheduling.
    fn on_watched(&self) {}

    fn on_get_job_before(&self) {}

    fn on_get_job_after(&self, _jobs: &[Job]) {}
}

/// Hook that does nothing.
pub struct BaseCallback;

impl DdlCallback for BaseCallback {}

/// Reloads the local schema whenever the version moves.
pub struct DefaultCallback {
    reloader: Arc<dyn SchemaReloader>,
}

impl DefaultCallback {
    pub fn new(reloader: Arc<dyn SchemaReloader>) -> Self {
        Self { reloader }
    }
}

#[async_trait]
impl DdlCallback for DefaultCallback {
    fn on_changed(&self, err: Option<&FalconError>) {
        if let Some(err) = err {
            tracing::debug!(error = %err, "DDL job finished with error");
        }
    }

    fn on_schema_version_changed(&self, version: SchemaVersion) {
        if let Err(e) = self.reloader.reload(version) {
            tracing::error!(version = %version, error = %e, "reload schema failed");
        }
    }
}

/// Column-type-change hook: like [`DefaultCallback`] but pauses before each
/// intermediate step of MODIFY COLUMN.
pub struct ColumnTypeChangeCallback {
    inner: DefaultCallback,
    delay: Duration,
}

impl ColumnTypeChangeCallback {
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(500);

    pub fn new(reloader: Arc<dyn SchemaReloader>, delay: Duration) -> Self {
        Self {
            inner: DefaultCallback::new(reloader),
            delay,
        }
    }
}

#[async_trait]
impl DdlCallback for ColumnTypeChangeCallback {
    fn on_changed(&self, err: Option<&FalconError>) {
        self.inner.on_changed(err);
    }

    fn on_schema_version_changed(&self, version: SchemaVersion) {
        self.inner.on_schema_version_changed(version);
    }

    async fn on_job_run_before(&self, job: &Job) {
        if job.action != ActionType::ModifyColumn {
            return;
        }
        if matches!(
            job.schema_state,
            SchemaState::DeleteOnly | SchemaState::WriteOnly | SchemaState::WriteReorganization
        ) {
            tracing::info!(job = %job.id, state = %job.schema_state, "ctc hook delaying step");
            tokio::time::sleep(self.delay).await;
        }
    }
}

/// Builds a hook around the node's schema reloader.
pub type CallbackFactory = fn(Arc<dyn SchemaReloader>) -> Arc<dyn DdlCallback>;

pub struct CallbackRegistry {
    factories: HashMap<String, CallbackFactory>,
}

impl CallbackRegistry {
    pub const DEFAULT_HOOK: &'static str = "default_hook";
    pub const CTC_HOOK: &'static str = "ctc_hook";

    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in hooks.
    pub fn with_builtin() -> Self {
        let mut r = Self::new();
        r.register(Self::DEFAULT_HOOK, |reloader| {
            Arc::new(DefaultCallback::new(reloader)) as Arc<dyn DdlCallback>
        });
        r.register(Self::CTC_HOOK, |reloader| {
            Arc::new(ColumnTypeChangeCallback::new(
                reloader,
                ColumnTypeChangeCallback::DEFAULT_DELAY,
            )) as Arc<dyn DdlCallback>
        });
        r
    }

    /// Hook names are matched case-insensitively, ignoring surrounding blanks.
    pub fn register(&mut self, name: &str, factory: CallbackFactory) {
        self.factories.insert(normalize(name), factory);
    }

    pub fn get(&self, name: &str) -> FalconResult<CallbackFactory> {
        self.factories
            .get(&normalize(name))
            .copied()
            .ok_or_else(|| DdlError::UnknownHook(name.to_string()).into())
    }

    /// Build the hook named `name`.
    pub fn build(&self, name: &str, reloader: Arc<dyn SchemaReloader>) -> FalconResult<Arc<dyn DdlCallback>> {
        Ok(self.get(name)?(reloader))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ColumnSpec, JobArgs};
    use falcon_common::types::{JobId, SchemaId, TableId};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CountingReloader(Mutex<Vec<SchemaVersion>>);

    impl SchemaReloader for CountingReloader {
        fn reload(&self, version: SchemaVersion) -> FalconResult<()> {
            self.0.lock().push(version);
            Ok(())
        }
    }

    #[test]
    fn test_registry_builtin_hooks() {
        assert!(CallbackRegistry::new().names().is_empty());
        let r = CallbackRegistry::with_builtin();
        assert_eq!(r.names(), vec!["ctc_hook".to_string(), "default_hook".to_string()]);
        assert!(r.get("default_hook").is_ok());
        assert!(r.get(" CTC_Hook ").is_ok());
    }

    #[test]
    fn test_unknown_hook_rejected() {
        let r = CallbackRegistry::with_builtin();
        let err = r.build("nope", Arc::new(NoopReloader)).err().unwrap();
        assert!(err.to_string().contains("`nope` is not found"));
    }

    #[test]
    fn test_default_hook_reloads_on_version_change() {
        let reloader = Arc::new(CountingReloader::default());
        let hook = CallbackRegistry::with_builtin()
            .build("default_hook", reloader.clone())
            .unwrap();
        hook.on_schema_version_changed(SchemaVersion(3));
        hook.on_schema_version_changed(SchemaVersion(4));
        assert_eq!(*reloader.0.lock(), vec![SchemaVersion(3), SchemaVersion(4)]);
    }

    #[tokio::test]
    async fn test_ctc_hook_only_delays_modify_column() {
        let hook = ColumnTypeChangeCallback::new(Arc::new(NoopReloader), Duration::from_millis(50));
        let mut job = Job::new(
            JobId(1),
            ActionType::AddColumn,
            SchemaId(1),
            TableId(2),
            JobArgs::AddColumn {
                column: ColumnSpec {
                    name: "c".into(),
                    data_type: "int".into(),
                    nullable: true,
                    default_value: None,
                },
            },
        );
        job.schema_state = SchemaState::WriteOnly;
        let start = std::time::Instant::now();
        hook.on_job_run_before(&job).await;
        assert!(start.elapsed() < Duration::from_millis(50));

        job.action = ActionType::ModifyColumn;
        let start = std::time::Instant::now();
        hook.on_job_run_before(&job).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
