//! Mutual-exclusion allocator
//!
//! Mutexes are names shared between clusters with a common operational
//! concern; two clusters declaring the same mutex never upgrade at the same
//! time. The allocator is seeded once per cycle with the mutexes held by
//! in-flight upgrade policies (recomputed fresh from the live policy
//! snapshot, never persisted), then tracks grants made during the current
//! decision pass so two candidates in the same pass cannot both claim a
//! mutex.
//!
//! Grants are all-or-nothing over a candidate's full required set. There is
//! no queueing and no priority; a denied candidate is simply re-evaluated
//! next cycle.

use std::collections::BTreeSet;

use tracing::debug;

/// Per-pass mutex allocator for one organization
#[derive(Clone, Debug, Default)]
pub struct MutexAllocator {
    held: BTreeSet<String>,
}

impl MutexAllocator {
    /// Create an allocator seeded with the mutexes currently held by
    /// in-flight upgrade policies
    pub fn new(held: impl IntoIterator<Item = String>) -> Self {
        Self {
            held: held.into_iter().collect(),
        }
    }

    /// Whether every mutex in `required` is currently free
    pub fn is_free(&self, required: &[String]) -> bool {
        required.iter().all(|m| !self.held.contains(m))
    }

    /// Acquire the full required set, or nothing.
    ///
    /// Returns `true` and marks every mutex held for the remainder of the
    /// pass iff none of them is already held.
    pub fn acquire(&mut self, required: &[String]) -> bool {
        if !self.is_free(required) {
            debug!(required = ?required, "mutex set unavailable");
            return false;
        }
        self.held.extend(required.iter().cloned());
        true
    }

    /// Mutexes currently held (seeded plus granted this pass)
    pub fn held(&self) -> &BTreeSet<String> {
        &self.held
    }
}
