//! Cadence - upgrade scheduler for fleets of managed Kubernetes/OpenShift clusters
//!
//! Cadence decides, on a recurring cycle, which clusters in each organization
//! may be upgraded to which version right now. Three independent constraints
//! gate every decision:
//!
//! - **Soak time**: a version must have accumulated a minimum run time on
//!   clusters sharing a workload before it is trusted for wider rollout.
//! - **Sector ordering**: named rollout sectors form a DAG; a downstream
//!   sector receives a version only after every cluster in its ancestor
//!   sectors already runs it.
//! - **Mutexes**: named exclusion locks; clusters sharing a mutex never
//!   upgrade concurrently.
//!
//! # Architecture
//!
//! The engine consumes typed fleet snapshots from external collaborators and
//! emits per-cluster decisions; it performs no network I/O itself. All
//! constraint computation is pure and synchronous - suspension points exist
//! only at the external boundary (ledger persistence, snapshot retrieval,
//! policy creation).
//!
//! # Modules
//!
//! - [`fleet`] - Fleet data model (organizations, clusters, upgrade conditions)
//! - [`ledger`] - Persistent per-organization soak ledger and its storage
//! - [`soak`] - Soak-time accounting and cross-organization inheritance
//! - [`sector`] - Sector dependency graph and rollout clearance
//! - [`mutex`] - Per-pass mutual-exclusion allocator
//! - [`engine`] - Per-cluster upgrade decision engine
//! - [`cycle`] - Scheduling cycle orchestration over all organizations
//! - [`error`] - Error types for the scheduler

#![deny(missing_docs)]

pub mod cycle;
pub mod engine;
pub mod error;
pub mod fleet;
pub mod ledger;
pub mod mutex;
pub mod sector;
pub mod soak;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralizing these here keeps the binary defaults, scheduler config, and
// test fixtures consistent.

/// Default assumed interval between scheduling cycles, in seconds.
///
/// Used as the elapsed-time fallback for soak accounting when a previous
/// ledger carries no tick timestamp, and as the default sleep between cycles
/// in the binary.
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 600;

/// Default bound on how many organizations are processed concurrently.
///
/// Sized conservatively to respect external API rate limits; within an
/// organization, cluster evaluation is always sequential.
pub const DEFAULT_MAX_CONCURRENT_ORGS: usize = 4;
