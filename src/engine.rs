//! Upgrade decision engine
//!
//! Combines the soak ledger, sector clearance, and mutex availability into a
//! per-cluster verdict: upgrade to version X now, or no action with the first
//! blocking rationale. Clusters are evaluated in ascending name order so that
//! mutex contention within a pass resolves deterministically and tests are
//! reproducible.

use semver::Version;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::fleet::{parse_version, Cluster, Organization, ScheduleType};
use crate::ledger::VersionData;
use crate::mutex::MutexAllocator;
use crate::sector::SectorGraph;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Why a cluster did (or did not) receive an upgrade this cycle
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rationale {
    /// An upgrade target was selected
    Eligible,
    /// The first obstacle was an administratively blocked version
    Blocked,
    /// The first obstacle was unmet soak time for some workload
    InsufficientSoak,
    /// The first obstacle was an ancestor sector not yet on the version
    SectorBlocked,
    /// The first obstacle was a required mutex held elsewhere
    MutexUnavailable,
}

/// Verdict for one cluster in one cycle
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeDecision {
    /// Cluster identifier
    pub cluster_id: String,
    /// Cluster name
    pub cluster_name: String,
    /// Selected upgrade target; `None` for a no-action verdict
    pub target: Option<Version>,
    /// Why this verdict was reached
    pub rationale: Rationale,
}

/// Per-organization decision pass over an immutable snapshot.
///
/// The engine is pure apart from logging: it reads the effective ledger and
/// sector graph, threads mutex grants through the pass, and returns the
/// decision list. Creating the actual upgrade policies is the caller's
/// concern (and is expected to be idempotent).
#[derive(Debug)]
pub struct UpgradeDecisionEngine<'a> {
    org: &'a Organization,
    ledger: &'a VersionData,
    graph: &'a SectorGraph,
}

impl<'a> UpgradeDecisionEngine<'a> {
    /// Create an engine over an organization's snapshot, its effective
    /// (inheritance-combined) ledger, and its validated sector graph
    pub fn new(org: &'a Organization, ledger: &'a VersionData, graph: &'a SectorGraph) -> Self {
        Self { org, ledger, graph }
    }

    /// Run the decision pass.
    ///
    /// `allocator` must be seeded with the mutexes held by in-flight upgrade
    /// policies; grants made here persist for the remainder of the pass.
    ///
    /// Clusters with a manual schedule are skipped (they are evaluated only
    /// on explicit administrator request, outside this cycle). Clusters whose
    /// current version fails to parse are skipped with a warning; the rest of
    /// the organization proceeds. Clusters with nothing to upgrade to produce
    /// no record.
    #[instrument(skip_all, fields(org = %self.org.id))]
    pub fn decide(&self, allocator: &mut MutexAllocator) -> Vec<UpgradeDecision> {
        let mut clusters: Vec<&Cluster> = self.org.clusters.iter().collect();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));

        let mut decisions = Vec::new();
        for cluster in clusters {
            if cluster.schedule == ScheduleType::Manual {
                debug!(cluster = %cluster.name, "manual schedule, not evaluated");
                continue;
            }
            let current = match cluster.current() {
                Ok(current) => current,
                Err(e) => {
                    warn!(cluster = %cluster.name, error = %e, "skipping cluster");
                    continue;
                }
            };
            if let Some(decision) = self.decide_cluster(cluster, &current, allocator) {
                decisions.push(decision);
            }
        }
        decisions
    }

    fn decide_cluster(
        &self,
        cluster: &Cluster,
        current: &Version,
        allocator: &mut MutexAllocator,
    ) -> Option<UpgradeDecision> {
        let candidates = self.candidates(cluster, current);
        if candidates.is_empty() {
            return None;
        }

        // Scan ascending, remembering the first blocking condition for the
        // verdict, but select the HIGHEST candidate that passes everything:
        // a later version with adequate soak lets the cluster skip
        // intermediate hops.
        let mut first_block: Option<Rationale> = None;
        let mut best: Option<Version> = None;
        for candidate in candidates {
            match self.check(cluster, &candidate, allocator) {
                Rationale::Eligible => best = Some(candidate),
                blocked => {
                    first_block.get_or_insert(blocked);
                }
            }
        }

        match best {
            Some(target) => {
                // is_free held during check; the full set is now marked held
                // so later clusters in this pass observe the contention
                allocator.acquire(&cluster.conditions.mutexes);
                info!(
                    cluster = %cluster.name,
                    from = %current,
                    to = %target,
                    "cluster eligible for upgrade"
                );
                Some(UpgradeDecision {
                    cluster_id: cluster.id.clone(),
                    cluster_name: cluster.name.clone(),
                    target: Some(target),
                    rationale: Rationale::Eligible,
                })
            }
            None => {
                let rationale = first_block?;
                debug!(cluster = %cluster.name, rationale = ?rationale, "no upgrade this cycle");
                Some(UpgradeDecision {
                    cluster_id: cluster.id.clone(),
                    cluster_name: cluster.name.clone(),
                    target: None,
                    rationale,
                })
            }
        }
    }

    /// Versions strictly above the current one, ascending. Unparseable
    /// entries are skipped with a warning; blocked versions stay in the list
    /// so the scan can report them as the blocking rationale.
    fn candidates(&self, cluster: &Cluster, current: &Version) -> Vec<Version> {
        let mut candidates: Vec<Version> = cluster
            .available_upgrades
            .iter()
            .filter_map(|raw| match parse_version(raw) {
                Ok(version) => Some(version),
                Err(e) => {
                    warn!(cluster = %cluster.name, version = %raw, error = %e, "unparseable available upgrade");
                    None
                }
            })
            .filter(|version| version > current)
            .collect();
        candidates.sort();
        candidates.dedup();
        candidates
    }

    fn check(
        &self,
        cluster: &Cluster,
        candidate: &Version,
        allocator: &MutexAllocator,
    ) -> Rationale {
        if cluster.is_blocked(candidate) {
            return Rationale::Blocked;
        }
        if !self.soak_satisfied(cluster, candidate) {
            return Rationale::InsufficientSoak;
        }
        if !self.graph.is_cleared(cluster, &self.org.clusters, candidate) {
            return Rationale::SectorBlocked;
        }
        if !allocator.is_free(&cluster.conditions.mutexes) {
            return Rationale::MutexUnavailable;
        }
        Rationale::Eligible
    }

    /// Every workload on the cluster must have accumulated at least its
    /// configured soak-day threshold for the candidate version. Workloads
    /// with no configured threshold require none.
    fn soak_satisfied(&self, cluster: &Cluster, candidate: &Version) -> bool {
        let version = candidate.to_string();
        cluster.workloads.iter().all(|workload| {
            let required_days = cluster
                .conditions
                .soak_days
                .get(workload)
                .copied()
                .unwrap_or(0.0);
            self.ledger.soak_seconds(&version, workload) >= required_days * SECONDS_PER_DAY
        })
    }
}
