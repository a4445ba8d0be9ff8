use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FalconError, FalconResult};
use crate::types::NodeId;

/// Top-level configuration of a node running the DDL controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DdlNodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub ddl: DdlSection,
    #[serde(default)]
    pub owner: OwnerSection,
    #[serde(default)]
    pub schema_sync: SchemaSyncSection,
    #[serde(default)]
    pub reorg: ReorgSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Node ID in cluster.
    pub node_id: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self { node_id: 1 }
    }
}

/// `[ddl]` section: job execution knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DdlSection {
    /// Number of jobs the owner executes concurrently.
    pub worker_pool_size: usize,
    /// Step failures tolerated per job before a running job is cancelled
    /// and a rolling-back job is force-cancelled.
    pub error_count_limit: u64,
    /// Scheduler poll interval in milliseconds. Submissions also wake the
    /// scheduler directly; the tick only bounds latency for remote submits.
    pub scheduler_tick_ms: u64,
    /// Finished jobs retained in the history log (0 = unlimited).
    pub history_capacity: usize,
    /// Name of the callback hook installed at start-up.
    pub callback_hook: String,
}

impl Default for DdlSection {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            error_count_limit: 512,
            scheduler_tick_ms: 100,
            history_capacity: 1000,
            callback_hook: "default_hook".into(),
        }
    }
}

/// `[owner]` section: owner lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnerSection {
    pub lease_ms: u64,
    pub renew_interval_ms: u64,
    /// How often a non-owner retries acquisition.
    pub campaign_interval_ms: u64,
}

impl Default for OwnerSection {
    fn default() -> Self {
        Self {
            lease_ms: 3000,
            renew_interval_ms: 1000,
            campaign_interval_ms: 200,
        }
    }
}

/// `[schema_sync]` section: schema version propagation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaSyncSection {
    /// Upper bound the owner waits for live nodes to acknowledge a new
    /// schema version before it moves on.
    pub lease_ms: u64,
    /// A node whose acknowledgement is older than this is not considered live.
    pub node_ttl_ms: u64,
}

impl Default for SchemaSyncSection {
    fn default() -> Self {
        Self {
            lease_ms: 2000,
            node_ttl_ms: 10_000,
        }
    }
}

/// `[reorg]` section: backfill supervision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReorgSection {
    /// How long one step waits for a backfill result before yielding its
    /// worker.
    pub wait_timeout_ms: u64,
    /// Backfills run in parallel by the local reorg pool.
    pub concurrency: usize,
    /// How long the rollback converter waits for stopped backfill workers.
    pub stop_timeout_ms: u64,
}

impl Default for ReorgSection {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 500,
            concurrency: 4,
            stop_timeout_ms: 1000,
        }
    }
}

impl DdlNodeConfig {
    pub fn node_id(&self) -> NodeId {
        NodeId(self.node.node_id)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.ddl.scheduler_tick_ms)
    }

    pub fn owner_lease(&self) -> Duration {
        Duration::from_millis(self.owner.lease_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.owner.renew_interval_ms)
    }

    pub fn campaign_interval(&self) -> Duration {
        Duration::from_millis(self.owner.campaign_interval_ms)
    }

    pub fn schema_sync_lease(&self) -> Duration {
        Duration::from_millis(self.schema_sync.lease_ms)
    }

    pub fn reorg_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.reorg.wait_timeout_ms)
    }

    pub fn reorg_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.reorg.stop_timeout_ms)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.ddl.worker_pool_size == 0 {
            return Err("ddl.worker_pool_size must be > 0".into());
        }
        if self.ddl.error_count_limit == 0 {
            return Err("ddl.error_count_limit must be > 0".into());
        }
        if self.ddl.scheduler_tick_ms == 0 {
            return Err("ddl.scheduler_tick_ms must be > 0".into());
        }
        if self.owner.renew_interval_ms >= self.owner.lease_ms {
            return Err(format!(
                "owner.renew_interval_ms ({}) must be shorter than owner.lease_ms ({})",
                self.owner.renew_interval_ms, self.owner.lease_ms
            ));
        }
        if self.reorg.concurrency == 0 {
            return Err("reorg.concurrency must be > 0".into());
        }
        Ok(())
    }

    /// Parse a TOML document and validate it.
    pub fn from_toml_str(text: &str) -> FalconResult<Self> {
        let config: DdlNodeConfig = toml::from_str(text)
            .map_err(|e| FalconError::Internal(format!("invalid config: {e}")))?;
        config.validate().map_err(FalconError::Internal)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> FalconResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| FalconError::Internal(format!("failed to serialize config: {e}")))
    }
}

/// Load config from `path`; a missing file yields the defaults.
pub fn load_config(path: &Path) -> FalconResult<DdlNodeConfig> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let config = DdlNodeConfig::from_toml_str(&content)?;
            tracing::info!("Loaded config from {}", path.display());
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("Config file {} not found, using defaults", path.display());
            Ok(DdlNodeConfig::default())
        }
        Err(e) => Err(FalconError::Internal(format!(
            "failed to read config {}: {e}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_valid() {
        assert!(DdlNodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_pool_rejected() {
        let mut c = DdlNodeConfig::default();
        c.ddl.worker_pool_size = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_renew_interval_must_be_below_lease() {
        let mut c = DdlNodeConfig::default();
        c.owner.renew_interval_ms = c.owner.lease_ms;
        let err = c.validate().unwrap_err();
        assert!(err.contains("renew_interval_ms"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let c = DdlNodeConfig::from_toml_str(
            r#"
            [node]
            node_id = 7

            [ddl]
            worker_pool_size = 2
            error_count_limit = 5
            "#,
        )
        .unwrap();
        assert_eq!(c.node_id(), NodeId(7));
        assert_eq!(c.ddl.worker_pool_size, 2);
        assert_eq!(c.ddl.error_count_limit, 5);
        assert_eq!(c.ddl.callback_hook, "default_hook");
        assert_eq!(c.owner.lease_ms, 3000);
    }

    #[test]
    fn test_default_roundtrips_through_toml() {
        let text = DdlNodeConfig::default().to_toml_string().unwrap();
        let back = DdlNodeConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.ddl.worker_pool_size, 4);
        assert_eq!(back.schema_sync.lease_ms, 2000);
    }

    #[test]
    fn test_load_config_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let c = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(c.node.node_id, 1);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("falcon_ddl.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[reorg]\nwait_timeout_ms = 50\nconcurrency = 1").unwrap();
        let c = load_config(&path).unwrap();
        assert_eq!(c.reorg.wait_timeout_ms, 50);
        assert_eq!(c.reorg.concurrency, 1);
    }

    #[test]
    fn test_load_config_invalid_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[ddl]\nworker_pool_size = 0\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
