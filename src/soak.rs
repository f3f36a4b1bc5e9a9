//! Soak-time accounting
//!
//! A version earns trust by running: every tick adds the elapsed wall-clock
//! interval to each (version, workload) pair some cluster currently reports.
//! Accumulation is purely additive - a version abandoned by the fleet keeps
//! its accumulated soak frozen rather than reset, so it regains eligibility
//! immediately if clusters return to it (the install base existed for that
//! duration either way).
//!
//! Organizations may inherit another organization's ledger: the effective
//! soak for a pair is the `max` of own and inherited values, combined over
//! the transitive closure of the (acyclic) inheritance relation.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::fleet::{Cluster, Organization};
use crate::ledger::VersionData;
use crate::Error;

/// Produces the next ledger from the previous one and a fleet snapshot
#[derive(Clone, Debug)]
pub struct SoakTracker {
    fallback_interval: Duration,
}

impl SoakTracker {
    /// Create a tracker.
    ///
    /// `fallback_interval` stands in for elapsed time when the previous
    /// ledger carries no tick timestamp (first cycle for the organization).
    pub fn new(fallback_interval: Duration) -> Self {
        Self { fallback_interval }
    }

    /// Advance the ledger by one tick.
    ///
    /// Elapsed time is `now` minus the previous tick timestamp, clamped
    /// non-negative; reporting sets are rebuilt from the snapshot. A cluster
    /// whose current version fails to parse is skipped with a warning and
    /// affects no other cluster's accounting.
    pub fn tick(&self, previous: &VersionData, clusters: &[Cluster], now: DateTime<Utc>) -> VersionData {
        let elapsed = self.elapsed_since(previous, now);
        let mut next = previous.clone();
        next.clear_reporting();

        for cluster in clusters {
            let version = match cluster.current() {
                Ok(version) => version.to_string(),
                Err(e) => {
                    warn!(cluster = %cluster.name, error = %e, "skipping cluster in soak accounting");
                    continue;
                }
            };
            for workload in &cluster.workloads {
                let soak = next.entry_mut(&version, workload);
                soak.soak_seconds += elapsed.as_secs_f64();
                soak.reporting.insert(cluster.name.clone());
            }
        }

        next.recorded_at = Some(now);
        next
    }

    fn elapsed_since(&self, previous: &VersionData, now: DateTime<Utc>) -> Duration {
        match previous.recorded_at {
            Some(recorded_at) => (now - recorded_at).to_std().unwrap_or_else(|_| {
                // clock went backwards; count nothing rather than a fallback
                // interval that never elapsed
                warn!("ledger timestamp is in the future, counting zero elapsed time");
                Duration::ZERO
            }),
            None => {
                debug!("ledger has no tick timestamp, assuming fallback interval");
                self.fallback_interval
            }
        }
    }
}

/// Combine an organization's own ledger with inherited ones.
///
/// Effective soak per (version, workload) is the `max` over own and every
/// inherited ledger - never double-counted, never below own observations.
pub fn effective(own: &VersionData, inherited: &[VersionData]) -> VersionData {
    let mut combined = own.clone();
    for ledger in inherited {
        combined.max_merge(ledger);
    }
    combined
}

/// Transitive closure of an organization's inheritance sources.
///
/// Walks `inherits_from` edges depth-first across the snapshot. Sources
/// missing from the snapshot are skipped with a warning (their ledgers are
/// simply unavailable this cycle).
///
/// # Errors
///
/// Returns [`Error::InheritanceCycle`] when the walk revisits an
/// organization already on the path - the effective value would be
/// ill-defined, so every organization reaching the cycle fails its cycle.
pub fn inheritance_closure(
    org: &Organization,
    all: &BTreeMap<&str, &Organization>,
) -> Result<BTreeSet<String>, Error> {
    let mut closure = BTreeSet::new();
    let mut path = vec![org.id.clone()];
    walk(org, all, &mut closure, &mut path)?;
    Ok(closure)
}

fn walk(
    org: &Organization,
    all: &BTreeMap<&str, &Organization>,
    closure: &mut BTreeSet<String>,
    path: &mut Vec<String>,
) -> Result<(), Error> {
    for source_id in &org.inherits_from {
        if path.contains(source_id) {
            path.push(source_id.clone());
            return Err(Error::InheritanceCycle(path.join(" -> ")));
        }
        if !closure.insert(source_id.clone()) {
            continue; // diamond: already visited via another path
        }
        let Some(source) = all.get(source_id.as_str()).copied() else {
            warn!(org = %org.id, source = %source_id, "inheritance source not in snapshot, skipping");
            continue;
        };
        path.push(source_id.clone());
        walk(source, all, closure, path)?;
        path.pop();
    }
    Ok(())
}
