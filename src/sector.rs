//! Sector dependency graph
//!
//! Sectors stage a rollout: a cluster in sector `prod` with `prod` depending
//! on `canary` may only receive a version after every cluster in `canary`
//! (and any further ancestors) already runs it. Root sectors have no
//! ancestors and act as the canaries of the fleet.
//!
//! The declared edges must form a DAG. A cycle is a configuration error that
//! fails the whole organization's cycle closed - silently ignoring sector
//! ordering could roll an unvalidated version fleet-wide.

use std::collections::{BTreeMap, BTreeSet};

use semver::Version;
use tracing::warn;

use crate::fleet::Cluster;
use crate::Error;

/// Validated sector dependency graph for one organization.
///
/// Construction proves acyclicity and precomputes the transitive ancestor
/// closure, so clearance queries are pure lookups.
#[derive(Clone, Debug, Default)]
pub struct SectorGraph {
    ancestors: BTreeMap<String, BTreeSet<String>>,
}

impl SectorGraph {
    /// Build the graph from declared edges (sector name -> direct
    /// dependencies). Sectors that appear only as dependencies are implied
    /// root sectors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SectorCycle`] naming the cycle path when the declared
    /// edges are not a DAG.
    pub fn new(deps: &BTreeMap<String, Vec<String>>) -> Result<Self, Error> {
        // collect every sector name, declared or only referenced
        let mut sectors: BTreeSet<&str> = deps.keys().map(String::as_str).collect();
        for targets in deps.values() {
            sectors.extend(targets.iter().map(String::as_str));
        }

        let mut ancestors = BTreeMap::new();
        for sector in &sectors {
            let mut closure = BTreeSet::new();
            let mut path = vec![sector.to_string()];
            collect_ancestors(sector, deps, &mut closure, &mut path)?;
            ancestors.insert(sector.to_string(), closure);
        }
        Ok(Self { ancestors })
    }

    /// Transitive ancestor sectors of `sector`; empty for root sectors and
    /// for sectors unknown to the graph
    pub fn ancestors(&self, sector: &str) -> &BTreeSet<String> {
        static EMPTY: BTreeSet<String> = BTreeSet::new();
        self.ancestors.get(sector).unwrap_or(&EMPTY)
    }

    /// Whether `cluster` is clear to move to `target`.
    ///
    /// Holds iff every cluster in `fleet` that belongs to an ancestor sector
    /// and shares at least one workload with `cluster` already runs a version
    /// `>= target` (semver ordering). Clusters without a sector and sectors
    /// without ancestors are always cleared. An ancestor cluster whose
    /// version cannot be parsed blocks clearance - the conservative reading
    /// of unknown state.
    pub fn is_cleared(&self, cluster: &Cluster, fleet: &[Cluster], target: &Version) -> bool {
        let Some(sector) = cluster.sector() else {
            return true;
        };
        let ancestors = self.ancestors(sector);
        if ancestors.is_empty() {
            return true;
        }

        for other in fleet {
            let in_ancestor_sector = other
                .sector()
                .is_some_and(|s| ancestors.contains(s));
            if !in_ancestor_sector || !other.shares_workload_with(cluster) {
                continue;
            }
            match other.current() {
                Ok(running) if running >= *target => {}
                Ok(running) => {
                    tracing::debug!(
                        cluster = %cluster.name,
                        blocker = %other.name,
                        running = %running,
                        target = %target,
                        "sector ancestor has not validated target version"
                    );
                    return false;
                }
                Err(e) => {
                    warn!(
                        cluster = %cluster.name,
                        blocker = %other.name,
                        error = %e,
                        "ancestor cluster version unparseable, withholding clearance"
                    );
                    return false;
                }
            }
        }
        true
    }
}

fn collect_ancestors(
    sector: &str,
    deps: &BTreeMap<String, Vec<String>>,
    closure: &mut BTreeSet<String>,
    path: &mut Vec<String>,
) -> Result<(), Error> {
    let Some(direct) = deps.get(sector) else {
        return Ok(()); // implied root sector
    };
    for dep in direct {
        if path.contains(dep) {
            path.push(dep.clone());
            return Err(Error::SectorCycle(path.join(" -> ")));
        }
        if !closure.insert(dep.clone()) {
            continue; // diamond: already collected via another path
        }
        path.push(dep.clone());
        collect_ancestors(dep, deps, closure, path)?;
        path.pop();
    }
    Ok(())
}
