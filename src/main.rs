//! Cadence - upgrade scheduler for fleets of managed clusters
//!
//! The binary runs scheduling cycles from a fleet-snapshot file against a
//! file-backed ledger directory. The live cluster-management API and the
//! policy REST layer are external collaborators; this harness stands in for
//! them with a JSON snapshot and a logging policy broker, which is enough to
//! run, inspect, and replay scheduling decisions locally.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cadence::cycle::{FleetSource, PolicyBroker, Scheduler, SchedulerConfig};
use cadence::engine::UpgradeDecision;
use cadence::fleet::Organization;
use cadence::ledger::{FileBackend, VersionDataStore};
use cadence::Error;

/// Cadence - fleet upgrade scheduler
#[derive(Parser, Debug)]
#[command(name = "cadence", version, about, long_about = None)]
struct Cli {
    /// Path to the fleet snapshot JSON file (re-read every cycle)
    #[arg(short = 'f', long = "fleet-file", env = "CADENCE_FLEET_FILE")]
    fleet_file: PathBuf,

    /// Directory holding one ledger JSON file per organization
    #[arg(long = "ledger-dir", env = "CADENCE_LEDGER_DIR", default_value = "./ledger")]
    ledger_dir: PathBuf,

    /// Seconds between cycles; also the soak fallback interval
    #[arg(long, env = "CADENCE_INTERVAL_SECS", default_value_t = cadence::DEFAULT_TICK_INTERVAL_SECS)]
    interval_secs: u64,

    /// Bound on concurrently processed organizations
    #[arg(long, default_value_t = cadence::DEFAULT_MAX_CONCURRENT_ORGS)]
    max_concurrent_orgs: usize,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

/// On-disk fleet snapshot: organizations plus the mutexes their in-flight
/// upgrade policies currently hold
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FleetFile {
    organizations: Vec<Organization>,
    held_mutexes: BTreeMap<String, BTreeSet<String>>,
}

/// Fleet source reading the snapshot file fresh each cycle
struct FileFleetSource {
    path: PathBuf,
}

impl FileFleetSource {
    async fn read(&self) -> Result<FleetFile, Error> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| Error::snapshot(format!("read {}: {e}", self.path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::snapshot(format!("parse {}: {e}", self.path.display())))
    }
}

#[async_trait]
impl FleetSource for FileFleetSource {
    async fn snapshot(&self) -> Result<Vec<Organization>, Error> {
        Ok(self.read().await?.organizations)
    }

    async fn held_mutexes(&self, org_id: &str) -> Result<BTreeSet<String>, Error> {
        let mut file = self.read().await?;
        Ok(file.held_mutexes.remove(org_id).unwrap_or_default())
    }
}

/// Policy broker that logs decisions instead of calling a policy API
struct LogPolicyBroker;

#[async_trait]
impl PolicyBroker for LogPolicyBroker {
    async fn create_upgrade_policy(
        &self,
        org_id: &str,
        decision: &UpgradeDecision,
    ) -> Result<(), Error> {
        info!(
            org = %org_id,
            cluster = %decision.cluster_name,
            target = %decision.target.as_ref().map(ToString::to_string).unwrap_or_default(),
            "would create upgrade policy"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let interval = Duration::from_secs(cli.interval_secs);

    let scheduler = Scheduler::new(
        Arc::new(FileFleetSource {
            path: cli.fleet_file,
        }),
        Arc::new(LogPolicyBroker),
        Arc::new(VersionDataStore::new(FileBackend::new(cli.ledger_dir))),
        SchedulerConfig {
            tick_interval: interval,
            max_concurrent_orgs: cli.max_concurrent_orgs,
        },
    );

    if cli.once {
        let report = scheduler.run_cycle().await?;
        info!(
            orgs = report.outcomes.len(),
            decisions = report.decisions().count(),
            "cycle complete"
        );
        return Ok(());
    }

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match scheduler.run_cycle().await {
                    Ok(report) => info!(
                        orgs = report.outcomes.len(),
                        decisions = report.decisions().count(),
                        "cycle complete"
                    ),
                    Err(e) => tracing::error!(error = %e, "cycle failed, retrying next interval"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return Ok(());
            }
        }
    }
}
