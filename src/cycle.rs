//! Scheduling cycle orchestration
//!
//! One cycle: fetch the fleet snapshot, then for each organization load its
//! ledger, advance soak accounting, combine inherited ledgers, evaluate every
//! cluster, hand eligible decisions to the policy broker, and persist the
//! updated ledger. Organizations are independent units of work: they share no
//! mutable state (inheritance reads another organization's persisted ledger
//! but never writes it), are processed through a bounded worker pool, and no
//! failure crosses an organization boundary.
//!
//! Within an organization everything is sequential and deterministic; the
//! only suspension points are the external ones (ledger load/save, snapshot
//! retrieval, held-mutex query, policy creation).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::engine::{UpgradeDecision, UpgradeDecisionEngine};
use crate::fleet::Organization;
use crate::ledger::{StorageBackend, VersionDataStore};
use crate::mutex::MutexAllocator;
use crate::sector::SectorGraph;
use crate::soak::{self, SoakTracker};
use crate::Error;

/// Source of fleet state, backed by the external cluster-management API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FleetSource: Send + Sync {
    /// Fetch the current fleet snapshot for every organization
    async fn snapshot(&self) -> Result<Vec<Organization>, Error>;

    /// Mutex names currently held by in-flight upgrade policies in an
    /// organization, derived fresh from the live policy state
    async fn held_mutexes(&self, org_id: &str) -> Result<BTreeSet<String>, Error>;
}

/// Sink for eligible decisions; creates the actual upgrade policies.
///
/// Implementations must be idempotent: creating a policy for a
/// cluster/version that already has one is a no-op.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyBroker: Send + Sync {
    /// Create an upgrade policy for an eligible decision
    async fn create_upgrade_policy(
        &self,
        org_id: &str,
        decision: &UpgradeDecision,
    ) -> Result<(), Error>;
}

/// Tuning for the scheduling cycle
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Assumed interval between cycles; the soak fallback when a ledger has
    /// no tick timestamp
    pub tick_interval: Duration,
    /// Bound on concurrently processed organizations
    pub max_concurrent_orgs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(crate::DEFAULT_TICK_INTERVAL_SECS),
            max_concurrent_orgs: crate::DEFAULT_MAX_CONCURRENT_ORGS,
        }
    }
}

/// Outcome of one organization's pass within a cycle
#[derive(Debug)]
pub enum OrgStatus {
    /// The pass completed; decisions were emitted (possibly none)
    Completed(Vec<UpgradeDecision>),
    /// A previous cycle still holds the organization's run-lock
    Skipped,
    /// The pass failed; zero decisions were emitted
    Failed(Error),
}

/// Per-organization outcomes of one cycle, ordered by organization id
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Organization id paired with its outcome
    pub outcomes: Vec<(String, OrgStatus)>,
}

impl CycleReport {
    /// All decisions from organizations that completed
    pub fn decisions(&self) -> impl Iterator<Item = &UpgradeDecision> {
        self.outcomes.iter().flat_map(|(_, status)| match status {
            OrgStatus::Completed(decisions) => decisions.as_slice(),
            _ => &[],
        })
    }

    /// Outcome for a specific organization, if it was in the snapshot
    pub fn status(&self, org_id: &str) -> Option<&OrgStatus> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == org_id)
            .map(|(_, status)| status)
    }
}

/// Drives scheduling cycles over all organizations
pub struct Scheduler<F, P, B> {
    fleet: Arc<F>,
    broker: Arc<P>,
    store: Arc<VersionDataStore<B>>,
    config: SchedulerConfig,
    // overlapping cycles for the same organization serialize here; a busy
    // organization is skipped rather than queued
    run_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl<F, P, B> Clone for Scheduler<F, P, B> {
    fn clone(&self) -> Self {
        Self {
            fleet: Arc::clone(&self.fleet),
            broker: Arc::clone(&self.broker),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            run_locks: Arc::clone(&self.run_locks),
        }
    }
}

impl<F, P, B> Scheduler<F, P, B>
where
    F: FleetSource + 'static,
    P: PolicyBroker + 'static,
    B: StorageBackend + 'static,
{
    /// Create a scheduler over the given collaborators
    pub fn new(
        fleet: Arc<F>,
        broker: Arc<P>,
        store: Arc<VersionDataStore<B>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            fleet,
            broker,
            store,
            config,
            run_locks: Arc::new(DashMap::new()),
        }
    }

    /// Run one full cycle.
    ///
    /// # Errors
    ///
    /// Only a failed snapshot fetch errors the whole cycle (there is nothing
    /// to schedule without one); every per-organization failure is captured
    /// in the report instead.
    #[instrument(skip_all)]
    pub async fn run_cycle(&self) -> Result<CycleReport, Error> {
        let orgs = self.fleet.snapshot().await?;
        info!(orgs = orgs.len(), "starting scheduling cycle");

        // Inheritance is an org-level relation; resolve (and validate) it
        // against the whole snapshot before the per-org passes fan out.
        let by_id: BTreeMap<&str, &Organization> =
            orgs.iter().map(|org| (org.id.as_str(), org)).collect();
        let resolved: Vec<(Organization, Result<BTreeSet<String>, Error>)> = orgs
            .iter()
            .map(|org| (org.clone(), soak::inheritance_closure(org, &by_id)))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_orgs.max(1)));
        let mut tasks = JoinSet::new();
        for (org, sources) in resolved {
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                // closed only on runtime shutdown; treat as a skipped org
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (org.id.clone(), OrgStatus::Skipped),
                };
                let status = this.run_organization(&org, sources).await;
                (org.id, status)
            });
        }

        let mut report = CycleReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(e) => error!(error = %e, "organization task panicked"),
            }
        }
        report.outcomes.sort_by(|(a, _), (b, _)| a.cmp(b));

        for (org_id, status) in &report.outcomes {
            if let OrgStatus::Failed(e) = status {
                error!(org = %org_id, error = %e, "organization cycle failed");
            }
        }
        Ok(report)
    }

    #[instrument(skip_all, fields(org = %org.id))]
    async fn run_organization(
        &self,
        org: &Organization,
        sources: Result<BTreeSet<String>, Error>,
    ) -> OrgStatus {
        let lock = self
            .run_locks
            .entry(org.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let Ok(_guard) = lock.try_lock_owned() else {
            warn!(org = %org.id, "previous cycle still running, skipping");
            return OrgStatus::Skipped;
        };

        let sources = match sources {
            Ok(sources) => sources,
            Err(e) => return OrgStatus::Failed(e),
        };
        match self.decision_pass(org, &sources).await {
            Ok(decisions) => OrgStatus::Completed(decisions),
            Err(e) => OrgStatus::Failed(e),
        }
    }

    async fn decision_pass(
        &self,
        org: &Organization,
        sources: &BTreeSet<String>,
    ) -> Result<Vec<UpgradeDecision>, Error> {
        // fail closed on bad sector declarations before touching anything
        let graph = SectorGraph::new(&org.sector_deps)?;

        let previous = self.store.load(&org.id).await?;
        let tracker = SoakTracker::new(self.config.tick_interval);
        let ticked = tracker.tick(&previous, &org.clusters, Utc::now());

        // inherited ledgers are read-only; an absent source simply
        // contributes nothing
        let mut inherited = Vec::with_capacity(sources.len());
        for source in sources {
            inherited.push(self.store.load(source).await?);
        }
        let effective = soak::effective(&ticked, &inherited);

        let held = self.fleet.held_mutexes(&org.id).await?;
        let engine = UpgradeDecisionEngine::new(org, &effective, &graph);
        let mut allocator = MutexAllocator::new(held);
        let decisions = engine.decide(&mut allocator);

        for decision in decisions.iter().filter(|d| d.target.is_some()) {
            // idempotent on the broker side; a failure here does not roll
            // back the decision, it was computed from last-known-good state
            if let Err(e) = self.broker.create_upgrade_policy(&org.id, decision).await {
                error!(
                    org = %org.id,
                    cluster = %decision.cluster_name,
                    error = %e,
                    "upgrade policy creation failed"
                );
            }
        }

        // own observations only - inherited soak must never be written back,
        // or it would double-count on the next combination
        if let Err(e) = self.store.save(&org.id, &ticked).await {
            // decisions stand; this cycle's soak is simply not recorded,
            // which only delays future eligibility
            warn!(org = %org.id, error = %e, "ledger save failed, soak for this cycle not recorded");
        }

        Ok(decisions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Rationale;
    use crate::fleet::{Cluster, UpgradeConditions};
    use crate::ledger::{MemoryBackend, VersionData};
    use mockall::predicate::eq;

    fn cluster(name: &str, current: &str, available: &[&str]) -> Cluster {
        Cluster {
            id: format!("id-{name}"),
            name: name.to_string(),
            current_version: current.to_string(),
            workloads: vec!["workload-a".to_string()],
            available_upgrades: available.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        }
    }

    fn org(id: &str, clusters: Vec<Cluster>) -> Organization {
        Organization {
            id: id.to_string(),
            name: id.to_string(),
            clusters,
            ..Default::default()
        }
    }

    fn scheduler(
        fleet: MockFleetSource,
        broker: MockPolicyBroker,
    ) -> Scheduler<MockFleetSource, MockPolicyBroker, MemoryBackend> {
        Scheduler::new(
            Arc::new(fleet),
            Arc::new(broker),
            Arc::new(VersionDataStore::new(MemoryBackend::new())),
            SchedulerConfig::default(),
        )
    }

    fn fleet_returning(orgs: Vec<Organization>) -> MockFleetSource {
        let mut fleet = MockFleetSource::new();
        fleet.expect_snapshot().returning(move || Ok(orgs.clone()));
        fleet
            .expect_held_mutexes()
            .returning(|_| Ok(BTreeSet::new()));
        fleet
    }

    #[tokio::test]
    async fn test_cycle_emits_decisions_and_creates_policies() {
        let orgs = vec![org("org-a", vec![cluster("c1", "4.12.0", &["4.13.0"])])];
        let fleet = fleet_returning(orgs);

        let mut broker = MockPolicyBroker::new();
        broker
            .expect_create_upgrade_policy()
            .with(eq("org-a"), mockall::predicate::always())
            .times(1)
            .returning(|_, _| Ok(()));

        let report = scheduler(fleet, broker).run_cycle().await.unwrap();
        let decisions: Vec<_> = report.decisions().collect();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].rationale, Rationale::Eligible);
    }

    #[tokio::test]
    async fn test_sector_cycle_fails_one_org_not_the_cycle() {
        let mut bad = org("org-bad", vec![cluster("c1", "4.12.0", &["4.13.0"])]);
        bad.sector_deps = BTreeMap::from([
            ("a".to_string(), vec!["b".to_string()]),
            ("b".to_string(), vec!["c".to_string()]),
            ("c".to_string(), vec!["a".to_string()]),
        ]);
        let good = org("org-good", vec![cluster("c1", "4.12.0", &["4.13.0"])]);
        let fleet = fleet_returning(vec![bad, good]);

        let mut broker = MockPolicyBroker::new();
        broker
            .expect_create_upgrade_policy()
            .with(eq("org-good"), mockall::predicate::always())
            .times(1)
            .returning(|_, _| Ok(()));

        let report = scheduler(fleet, broker).run_cycle().await.unwrap();
        assert!(matches!(
            report.status("org-bad"),
            Some(OrgStatus::Failed(Error::SectorCycle(_)))
        ));
        assert!(matches!(
            report.status("org-good"),
            Some(OrgStatus::Completed(d)) if d.len() == 1
        ));
    }

    #[tokio::test]
    async fn test_inheritance_cycle_fails_member_orgs_only() {
        let mut a = org("org-a", vec![]);
        a.inherits_from = vec!["org-b".to_string()];
        let mut b = org("org-b", vec![]);
        b.inherits_from = vec!["org-a".to_string()];
        let c = org("org-c", vec![cluster("c1", "4.12.0", &["4.13.0"])]);
        let fleet = fleet_returning(vec![a, b, c]);

        let mut broker = MockPolicyBroker::new();
        broker
            .expect_create_upgrade_policy()
            .returning(|_, _| Ok(()));

        let report = scheduler(fleet, broker).run_cycle().await.unwrap();
        assert!(matches!(
            report.status("org-a"),
            Some(OrgStatus::Failed(Error::InheritanceCycle(_)))
        ));
        assert!(matches!(
            report.status("org-b"),
            Some(OrgStatus::Failed(Error::InheritanceCycle(_)))
        ));
        assert!(matches!(
            report.status("org-c"),
            Some(OrgStatus::Completed(_))
        ));
    }

    #[tokio::test]
    async fn test_inherited_soak_satisfies_threshold() {
        // org-a requires 1 soak day it has not observed; org-b's ledger has
        let mut needs_soak = cluster("c1", "4.12.0", &["4.13.0"]);
        needs_soak.conditions = UpgradeConditions {
            soak_days: BTreeMap::from([("workload-a".to_string(), 1.0)]),
            ..Default::default()
        };
        let mut a = org("org-a", vec![needs_soak]);
        a.inherits_from = vec!["org-b".to_string()];
        let b = org("org-b", vec![]);

        let store = Arc::new(VersionDataStore::new(MemoryBackend::new()));
        let mut seed = VersionData::default();
        seed.entry_mut("4.13.0", "workload-a").soak_seconds = 2.0 * 86_400.0;
        store.save("org-b", &seed).await.unwrap();

        let fleet = fleet_returning(vec![a, b]);
        let mut broker = MockPolicyBroker::new();
        broker
            .expect_create_upgrade_policy()
            .times(1)
            .returning(|_, _| Ok(()));

        let scheduler = Scheduler::new(
            Arc::new(fleet),
            Arc::new(broker),
            store.clone(),
            SchedulerConfig::default(),
        );
        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.decisions().count(), 1);

        // org-b's ledger was read, never written: still exactly the seed
        // except it was never ticked (org-b has no clusters reporting)
        let b_ledger = store.load("org-b").await.unwrap();
        assert_eq!(b_ledger.soak_seconds("4.13.0", "workload-a"), 2.0 * 86_400.0);
        // org-a's own ledger does not contain the inherited value
        let a_ledger = store.load("org-a").await.unwrap();
        assert!(a_ledger.soak_seconds("4.13.0", "workload-a") < 86_400.0);
    }

    #[tokio::test]
    async fn test_snapshot_failure_errors_the_cycle() {
        let mut fleet = MockFleetSource::new();
        fleet
            .expect_snapshot()
            .returning(|| Err(Error::snapshot("API unavailable")));
        let broker = MockPolicyBroker::new();
        let err = scheduler(fleet, broker).run_cycle().await.unwrap_err();
        assert!(matches!(err, Error::Snapshot(_)));
    }

    #[tokio::test]
    async fn test_held_mutex_failure_isolated_to_org() {
        let orgs = vec![
            org("org-a", vec![cluster("c1", "4.12.0", &["4.13.0"])]),
            org("org-b", vec![cluster("c1", "4.12.0", &["4.13.0"])]),
        ];
        let mut fleet = MockFleetSource::new();
        fleet.expect_snapshot().returning(move || Ok(orgs.clone()));
        fleet.expect_held_mutexes().returning(|org_id| {
            if org_id == "org-a" {
                Err(Error::snapshot("policy list failed"))
            } else {
                Ok(BTreeSet::new())
            }
        });
        let mut broker = MockPolicyBroker::new();
        broker
            .expect_create_upgrade_policy()
            .with(eq("org-b"), mockall::predicate::always())
            .times(1)
            .returning(|_, _| Ok(()));

        let report = scheduler(fleet, broker).run_cycle().await.unwrap();
        assert!(matches!(report.status("org-a"), Some(OrgStatus::Failed(_))));
        assert!(matches!(
            report.status("org-b"),
            Some(OrgStatus::Completed(d)) if d.len() == 1
        ));
    }

    #[tokio::test]
    async fn test_policy_failure_does_not_fail_the_org() {
        let orgs = vec![org("org-a", vec![cluster("c1", "4.12.0", &["4.13.0"])])];
        let fleet = fleet_returning(orgs);
        let mut broker = MockPolicyBroker::new();
        broker
            .expect_create_upgrade_policy()
            .returning(|_, _| Err(Error::policy("HTTP 500")));

        let report = scheduler(fleet, broker).run_cycle().await.unwrap();
        // the decision was computed and stands even though the hand-off failed
        assert_eq!(report.decisions().count(), 1);
    }

    #[tokio::test]
    async fn test_ledger_persisted_after_pass() {
        let orgs = vec![org("org-a", vec![cluster("c1", "4.12.0", &[])])];
        let fleet = fleet_returning(orgs);
        let broker = MockPolicyBroker::new();

        let store = Arc::new(VersionDataStore::new(MemoryBackend::new()));
        let scheduler = Scheduler::new(
            Arc::new(fleet),
            Arc::new(broker),
            store.clone(),
            SchedulerConfig::default(),
        );
        scheduler.run_cycle().await.unwrap();

        let ledger = store.load("org-a").await.unwrap();
        assert!(ledger.recorded_at.is_some());
        assert!(ledger.soak_seconds("4.12.0", "workload-a") > 0.0);
    }
}
