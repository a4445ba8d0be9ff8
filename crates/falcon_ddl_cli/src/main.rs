//! `falcon-ddl`: schema-change controller node tooling.
//!
//! `falcon-ddl check-config` validates a node config; `falcon-ddl demo`
//! runs an in-process cluster that shares one metadata store and walks a
//! few schema changes through it, optionally killing the owner halfway
//! through a backfill.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use falcon_common::config::{load_config, DdlNodeConfig};
use falcon_common::error::FalconResult;
use falcon_common::schema::{ColumnInfo, TableInfo};
use falcon_common::types::{ColumnId, JobId, NodeId, SchemaId, SchemaVersion, TableId};
use falcon_ddl::{
    ActionType, BackfillExecutor, BackfillRequest, CallbackRegistry, ColumnSpec, DdlController,
    JobArgs, LocalReorgPool, MemMetaStore, MetaStore, SchemaReloader, StoreLeaseElection,
};

#[derive(Parser, Debug)]
#[command(name = "falcon-ddl", about = "FalconDB online schema-change controller")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "falcon_ddl.toml")]
    config: PathBuf,

    /// Metrics listen address; metrics are off when unset.
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate the config file, then print it.
    CheckConfig,
    /// Run schema changes on an in-process cluster.
    Demo {
        /// Number of nodes sharing the metadata store.
        #[arg(long, default_value = "2")]
        nodes: u64,
        /// Rows each backfill copies.
        #[arg(long, default_value = "500")]
        rows: u64,
        /// Kill the owner while the index backfill is running.
        #[arg(long)]
        crash_owner: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        println!("{}", DdlNodeConfig::default().to_toml_string()?);
        return Ok(());
    }

    falcon_observability::init_tracing();
    if let Some(addr) = &cli.metrics_addr {
        if let Err(e) = falcon_observability::init_metrics(addr) {
            tracing::warn!("Failed to initialize metrics: {}", e);
        }
    }

    let config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command.unwrap_or(Command::CheckConfig) {
        Command::CheckConfig => {
            println!("{}", config.to_toml_string()?);
            Ok(())
        }
        Command::Demo {
            nodes,
            rows,
            crash_owner,
        } => run_demo(config, nodes, rows, crash_owner).await,
    }
}

/// Schema reloader of a demo node: there is no statement cache, so a
/// reload is only logged.
struct LoggingReloader(NodeId);

impl SchemaReloader for LoggingReloader {
    fn reload(&self, version: SchemaVersion) -> FalconResult<()> {
        tracing::debug!(node = %self.0, version = %version, "schema reloaded");
        Ok(())
    }
}

/// Backfill that copies `rows` rows in small timed batches.
struct PacedBackfill {
    rows: u64,
    batch_delay: Duration,
}

#[async_trait]
impl BackfillExecutor for PacedBackfill {
    async fn backfill(&self, req: &BackfillRequest, stop: watch::Receiver<bool>) -> Result<u64, String> {
        let mut done = 0;
        while done < self.rows {
            if *stop.borrow() {
                return Err(format!("backfill of job {} stopped at row {done}", req.job_id));
            }
            tokio::time::sleep(self.batch_delay).await;
            done = (done + 50).min(self.rows);
        }
        Ok(done)
    }
}

struct DemoNode {
    ctl: Arc<DdlController>,
    pool: Arc<LocalReorgPool>,
}

fn demo_node(base: &DdlNodeConfig, id: u64, store: Arc<dyn MetaStore>, rows: u64) -> Result<DemoNode> {
    let mut config = base.clone();
    config.node.node_id = id;
    let registry = CallbackRegistry::with_builtin();
    let election = Arc::new(StoreLeaseElection::new(
        NodeId(id),
        store.clone(),
        config.owner_lease(),
    ));
    let executor = Arc::new(PacedBackfill {
        rows,
        batch_delay: Duration::from_millis(20),
    });
    let pool = Arc::new(LocalReorgPool::new(executor, config.reorg.concurrency));
    let ctl = DdlController::with_registry(
        config,
        store,
        election,
        pool.clone(),
        &registry,
        Arc::new(LoggingReloader(NodeId(id))),
    )?;
    Ok(DemoNode {
        ctl: Arc::new(ctl),
        pool,
    })
}

async fn run_demo(config: DdlNodeConfig, nodes: u64, rows: u64, crash_owner: bool) -> Result<()> {
    if nodes == 0 {
        bail!("--nodes must be at least 1");
    }
    if crash_owner && nodes < 2 {
        bail!("--crash-owner needs at least two nodes");
    }
    let store: Arc<dyn MetaStore> = Arc::new(MemMetaStore::new());
    let cluster = (1..=nodes)
        .map(|id| demo_node(&config, id, store.clone(), rows))
        .collect::<Result<Vec<_>>>()?;
    for n in &cluster {
        n.ctl.start();
    }
    let wait = Duration::from_secs(30);
    let entry = &cluster[cluster.len() - 1];

    let db_args = JobArgs::CreateSchema {
        name: "demo".into(),
        charset: String::new(),
        collate: String::new(),
    };
    let id = entry
        .ctl
        .submit_job(ActionType::CreateSchema, SchemaId(0), TableId(0), db_args)
        .await?;
    entry.ctl.wait_job(id, wait).await?;
    let db = entry.ctl.get_job_record(id).await?.schema_id;

    let mut table = TableInfo::new(TableId(0), db, "orders");
    table.columns.push(ColumnInfo::new(ColumnId(1), "id", "bigint").not_null());
    table.columns.push(ColumnInfo::new(ColumnId(2), "amount", "int"));
    let id = entry
        .ctl
        .submit_job(ActionType::CreateTable, db, TableId(0), JobArgs::CreateTable { table })
        .await?;
    entry.ctl.wait_job(id, wait).await?;
    let tbl = entry.ctl.get_job_record(id).await?.table_id;

    let column = JobArgs::AddColumn {
        column: ColumnSpec {
            name: "note".into(),
            data_type: "varchar(64)".into(),
            nullable: true,
            default_value: None,
        },
    };
    let add_column = entry.ctl.submit_job(ActionType::AddColumn, db, tbl, column).await?;
    let index = JobArgs::AddIndex {
        name: "idx_amount".into(),
        columns: vec!["amount".into()],
        unique: false,
    };
    let add_index = entry.ctl.submit_job(ActionType::AddIndex, db, tbl, index).await?;

    if crash_owner {
        crash_owner_during_backfill(&cluster, add_index, wait).await?;
    }

    for id in [add_column, add_index] {
        let status = entry.ctl.wait_job(id, wait).await?;
        println!("{}", serde_json::to_string_pretty(&status)?);
    }
    println!("schema version: {}", entry.ctl.schema_version().await?);
    for job in entry.ctl.list_history(10).await? {
        println!("history: {job}");
    }

    for n in &cluster {
        n.ctl.stop().await;
    }
    Ok(())
}

async fn crash_owner_during_backfill(cluster: &[DemoNode], job: JobId, wait: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let status = cluster[0].ctl.get_job(job).await?;
        if status.snapshot_ver != 0 || status.state.is_terminal() {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            bail!("backfill of job {job} never started");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let Some(owner) = cluster.iter().find(|n| n.ctl.is_owner()) else {
        bail!("no DDL owner while job {job} is running");
    };
    tracing::warn!(node = %owner.ctl.node_id(), job = %job, "killing the DDL owner");
    owner.ctl.abort();
    owner.pool.shutdown();
    Ok(())
}
