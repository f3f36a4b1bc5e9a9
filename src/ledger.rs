//! Persistent soak ledger
//!
//! Each organization owns one [`VersionData`] ledger: accumulated soak time
//! per (version, workload) pair plus the set of clusters currently reporting
//! that pair. The ledger survives across scheduling cycles through a
//! [`StorageBackend`]; reads and writes are whole-ledger, and callers follow
//! a read-modify-write discipline once per cycle.
//!
//! Only [`VersionDataStore`] writes ledgers; every other component receives
//! them by value or shared reference.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Error;

/// Accumulated soak state for one (version, workload) pair
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkloadSoak {
    /// Total seconds this version has soaked on clusters running the workload
    pub soak_seconds: f64,
    /// Names of clusters currently reporting this (version, workload) pair.
    /// Rebuilt every tick; informational, not part of soak arithmetic.
    pub reporting: BTreeSet<String>,
}

/// Per-organization soak ledger: version -> workload -> accumulated soak.
///
/// Monotonic history: accumulated seconds only grow (or freeze when no
/// cluster reports a pair); entries are never deleted by the engine.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VersionData {
    /// When the last successful tick was recorded; `None` for a ledger that
    /// has never ticked (first cycle), in which case a configured fallback
    /// interval stands in for elapsed time
    pub recorded_at: Option<DateTime<Utc>>,
    /// version (normalized semver string) -> workload -> soak state
    pub versions: BTreeMap<String, BTreeMap<String, WorkloadSoak>>,
}

impl VersionData {
    /// Accumulated soak seconds for a (version, workload) pair; zero when the
    /// pair has never been observed
    pub fn soak_seconds(&self, version: &str, workload: &str) -> f64 {
        self.versions
            .get(version)
            .and_then(|workloads| workloads.get(workload))
            .map_or(0.0, |soak| soak.soak_seconds)
    }

    /// Mutable soak entry for a (version, workload) pair, created on demand
    pub fn entry_mut(&mut self, version: &str, workload: &str) -> &mut WorkloadSoak {
        self.versions
            .entry(version.to_string())
            .or_default()
            .entry(workload.to_string())
            .or_default()
    }

    /// Clear every reporting set, keeping accumulated seconds untouched.
    ///
    /// Called at the start of each tick so the sets mean "currently
    /// reporting" rather than "ever reported".
    pub fn clear_reporting(&mut self) {
        for workloads in self.versions.values_mut() {
            for soak in workloads.values_mut() {
                soak.reporting.clear();
            }
        }
    }

    /// Fold another ledger in by per-pair `max` of accumulated seconds.
    ///
    /// This is the inheritance combination rule: the result never decreases
    /// this ledger's own observations and never double-counts the source's.
    /// Reporting sets are unioned for visibility only.
    pub fn max_merge(&mut self, other: &VersionData) {
        for (version, workloads) in &other.versions {
            for (workload, theirs) in workloads {
                let ours = self.entry_mut(version, workload);
                if theirs.soak_seconds > ours.soak_seconds {
                    ours.soak_seconds = theirs.soak_seconds;
                }
                ours.reporting.extend(theirs.reporting.iter().cloned());
            }
        }
    }
}

/// Durable key-value backend for ledger bytes, keyed by organization id.
///
/// Absence is not an error: `load` returns `None` for a key that has never
/// been written, and the store materializes it as an empty ledger.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Load the raw ledger bytes for a key, or `None` if absent
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Durably store the raw ledger bytes for a key
    async fn save(&self, key: &str, value: &[u8]) -> Result<(), Error>;
}

/// In-memory backend for tests and the local harness
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryBackend {
    /// Create an empty in-memory backend
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.entries.get(key).map(|entry| entry.clone()))
    }

    async fn save(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// File-backed backend: one JSON file per organization under a directory.
///
/// Writes go through a temporary file and rename so a crashed save never
/// leaves a truncated ledger behind.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Create a backend rooted at `dir`. The directory is created on first
    /// save if it does not exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(format!("read ledger for {key}: {e}"))),
        }
    }

    async fn save(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::storage(format!("create ledger dir: {e}")))?;
        let path = self.path_for(key);
        let tmp = self.dir.join(format!("{key}.json.tmp"));
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| Error::storage(format!("write ledger for {key}: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::storage(format!("commit ledger for {key}: {e}")))?;
        Ok(())
    }
}

/// Read-modify-write facade over a [`StorageBackend`].
///
/// The sole writer of ledgers. A failed save does not invalidate the
/// in-memory ledger the caller computed decisions from; only the next
/// cycle's soak accounting is affected.
#[derive(Debug)]
pub struct VersionDataStore<B> {
    backend: B,
}

impl<B: StorageBackend> VersionDataStore<B> {
    /// Create a store over the given backend
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Load the ledger for an organization.
    ///
    /// An absent key yields an empty ledger (first cycle for the
    /// organization); only backend or decode failures error.
    pub async fn load(&self, org_id: &str) -> Result<VersionData, Error> {
        match self.backend.load(org_id).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => {
                debug!(org = %org_id, "no ledger found, starting empty");
                Ok(VersionData::default())
            }
        }
    }

    /// Persist the ledger for an organization
    pub async fn save(&self, org_id: &str, ledger: &VersionData) -> Result<(), Error> {
        let bytes = serde_json::to_vec(ledger)?;
        self.backend.save(org_id, &bytes).await
    }
}
