//! Error types for the Cadence scheduler
//!
//! Errors are isolated to the smallest affected unit: a data error fails a
//! single cluster, a configuration or I/O error fails a single organization's
//! cycle, and no error crosses organization boundaries.

use thiserror::Error;

/// Main error type for Cadence operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Sector dependency declarations contain a cycle.
    ///
    /// Fatal for the affected organization's cycle: scheduling fails closed
    /// and emits zero decisions rather than ignoring sector ordering.
    #[error("sector dependency cycle detected: {0}")]
    SectorCycle(String),

    /// Version-data inheritance declarations between organizations contain a
    /// cycle. Fatal for every organization on the cycle.
    #[error("version-data inheritance cycle detected: {0}")]
    InheritanceCycle(String),

    /// A version string could not be parsed. Fatal for the single affected
    /// cluster only; other clusters in the organization proceed normally.
    #[error("invalid version {version:?} on cluster {cluster:?}: {source}")]
    Version {
        /// Cluster the bad version was observed on
        cluster: String,
        /// The offending version string
        version: String,
        /// Underlying semver parse error
        source: semver::Error,
    },

    /// Fleet snapshot retrieval failed. Fatal for the current cycle of the
    /// organizations concerned; retried on the next scheduled cycle.
    #[error("fleet snapshot error: {0}")]
    Snapshot(String),

    /// Ledger persistence backend failure (load or save)
    #[error("ledger storage error: {0}")]
    Storage(String),

    /// Upgrade policy creation failed after a decision was computed.
    /// Decisions already handed off are not rolled back.
    #[error("policy creation error: {0}")]
    Policy(String),

    /// Ledger serialization/deserialization error
    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a snapshot error with the given message
    pub fn snapshot(msg: impl Into<String>) -> Self {
        Self::Snapshot(msg.into())
    }

    /// Create a storage error with the given message
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a policy error with the given message
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy(msg.into())
    }

    /// Whether this error is a configuration error (operator must fix the
    /// declarations; retrying the cycle unchanged cannot succeed).
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::SectorCycle(_) | Self::InheritanceCycle(_))
    }
}
