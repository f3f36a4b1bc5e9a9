//! Fleet data model
//!
//! Typed snapshot of the managed fleet as consumed from the external
//! cluster-management collaborators: organizations, their member clusters,
//! and the per-cluster upgrade policy conditions. The engine never mutates a
//! snapshot; each scheduling cycle works from a fresh one.

use std::collections::BTreeMap;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::Error;

/// How a cluster's upgrades are initiated
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    /// Upgrades are scheduled automatically by the recurring cycle
    #[default]
    Automatic,
    /// Upgrades happen only on explicit administrator request; the cycle
    /// never evaluates these clusters spontaneously
    Manual,
}

/// Conditions a cluster's upgrade policy imposes before any upgrade
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpgradeConditions {
    /// Minimum soak time in days, per workload the cluster runs
    pub soak_days: BTreeMap<String, f64>,
    /// Mutex names that must all be free for this cluster to upgrade
    pub mutexes: Vec<String>,
    /// Rollout sector this cluster belongs to; `None` means the cluster is
    /// unconstrained by sector ordering
    pub sector: Option<String>,
}

/// A managed cluster as seen in the fleet snapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Cluster {
    /// Unique cluster identifier (stable across cycles)
    pub id: String,
    /// Human-readable cluster name; also the deterministic evaluation key
    pub name: String,
    /// Version the cluster currently runs
    pub current_version: String,
    /// Upgrade channel the cluster subscribes to
    pub channel: String,
    /// Workload tags the cluster runs; grouping keys for soak accounting
    pub workloads: Vec<String>,
    /// How upgrades are initiated for this cluster
    pub schedule: ScheduleType,
    /// Upgrade policy conditions (soak thresholds, mutexes, sector)
    pub conditions: UpgradeConditions,
    /// Versions the cluster may upgrade to, in non-decreasing semver order
    pub available_upgrades: Vec<String>,
    /// Versions administratively excluded as upgrade targets
    pub blocked_versions: Vec<String>,
}

impl Cluster {
    /// Parse the cluster's current version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Version`] naming this cluster when the version string
    /// is unparseable. The caller isolates the failure to this cluster.
    pub fn current(&self) -> crate::Result<Version> {
        parse_version(&self.current_version).map_err(|source| Error::Version {
            cluster: self.name.clone(),
            version: self.current_version.clone(),
            source,
        })
    }

    /// Rollout sector the cluster belongs to, if any
    pub fn sector(&self) -> Option<&str> {
        self.conditions.sector.as_deref()
    }

    /// Whether `version` is on the cluster's blocked list.
    ///
    /// Blocked entries that fail to parse are compared as raw strings so a
    /// typo in the block list still blocks exactly what it names.
    pub fn is_blocked(&self, version: &Version) -> bool {
        self.blocked_versions.iter().any(|b| match parse_version(b) {
            Ok(blocked) => blocked == *version,
            Err(_) => b.trim_start_matches(['v', 'V']) == version.to_string(),
        })
    }

    /// Whether this cluster shares at least one workload with `other`
    pub fn shares_workload_with(&self, other: &Cluster) -> bool {
        self.workloads.iter().any(|w| other.workloads.contains(w))
    }
}

/// An organization: the administrative unit sharing one soak ledger and one
/// sector graph
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Organization {
    /// Unique organization identifier; keys the persisted ledger
    pub id: String,
    /// Human-readable organization name
    pub name: String,
    /// Member clusters
    pub clusters: Vec<Cluster>,
    /// Sector dependency declarations: sector name to the sectors it depends
    /// on. Must form a DAG; validated each cycle.
    pub sector_deps: BTreeMap<String, Vec<String>>,
    /// Organizations whose ledgers seed this one's soak computation.
    /// One-way and acyclic; validated across the whole snapshot each cycle.
    pub inherits_from: Vec<String>,
}

/// Parse a version string leniently.
///
/// Accepts an optional `v`/`V` prefix and short forms (`4` or `4.12`), which
/// the cluster-management API emits for channel heads. Everything else defers
/// to strict semver parsing.
pub fn parse_version(s: &str) -> Result<Version, semver::Error> {
    let s = s.trim().trim_start_matches(['v', 'V']);
    match s.chars().filter(|c| *c == '.').count() {
        0 => Version::parse(&format!("{s}.0.0")),
        1 => Version::parse(&format!("{s}.0")),
        _ => Version::parse(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        parse_version(s).unwrap()
    }

    #[test]
    fn test_parse_version_lenient_forms() {
        assert_eq!(v("4.12.19"), Version::new(4, 12, 19));
        assert_eq!(v("v1.1"), Version::new(1, 1, 0));
        assert_eq!(v("2"), Version::new(2, 0, 0));
        assert_eq!(v(" 4.14.0 "), Version::new(4, 14, 0));
        assert!(parse_version("not-a-version").is_err());
    }

    #[test]
    fn test_semver_ordering_not_lexical() {
        // 4.9 sorts before 4.10 numerically even though "4.9" > "4.10"
        // lexically - the whole point of parsing instead of comparing strings
        assert!(v("4.9.0") < v("4.10.0"));
        assert!(v("4.10.2") > v("4.10.0"));
    }

    #[test]
    fn test_current_version_error_names_cluster() {
        let cluster = Cluster {
            name: "staging-1".to_string(),
            current_version: "garbage".to_string(),
            ..Default::default()
        };
        let err = cluster.current().unwrap_err();
        assert!(err.to_string().contains("staging-1"));
        assert!(err.to_string().contains("garbage"));
    }

    #[test]
    fn test_blocked_versions_match_parsed_and_raw() {
        let cluster = Cluster {
            blocked_versions: vec!["v4.12.19".to_string(), "oops".to_string()],
            ..Default::default()
        };
        assert!(cluster.is_blocked(&v("4.12.19")));
        assert!(!cluster.is_blocked(&v("4.12.20")));
    }

    #[test]
    fn test_shares_workload() {
        let a = Cluster {
            workloads: vec!["workload-a".to_string(), "workload-b".to_string()],
            ..Default::default()
        };
        let b = Cluster {
            workloads: vec!["workload-b".to_string()],
            ..Default::default()
        };
        let c = Cluster {
            workloads: vec!["workload-c".to_string()],
            ..Default::default()
        };
        assert!(a.shares_workload_with(&b));
        assert!(!a.shares_workload_with(&c));
    }

    #[test]
    fn test_snapshot_roundtrip_camel_case() {
        let json = r#"{
            "id": "c-1",
            "name": "canary-1",
            "currentVersion": "4.12.0",
            "schedule": "manual",
            "conditions": {"soakDays": {"workload-a": 7.0}, "mutexes": ["m1"], "sector": "canary"},
            "availableUpgrades": ["4.12.19"],
            "blockedVersions": []
        }"#;
        let cluster: Cluster = serde_json::from_str(json).unwrap();
        assert_eq!(cluster.schedule, ScheduleType::Manual);
        assert_eq!(cluster.sector(), Some("canary"));
        assert_eq!(cluster.conditions.soak_days["workload-a"], 7.0);
    }
}
