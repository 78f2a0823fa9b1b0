//! Incremental membership reconciliation.
//!
//! Reconciliation is a set union: candidates that are not yet members form the delta, and the
//! updated membership is the current one plus the delta. Nothing is ever removed here, which is
//! what makes re-processing a redelivered task harmless. Removal is a separate, audited operation
//! in [`crate::prune`].

use crate::types::{Membership, RequestId};

/// Result of reconciling a membership against a candidate set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Membership after the merge.
    pub updated: Membership,
    /// Candidates that were not members yet.
    pub delta: Membership,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.delta.is_empty()
    }

    /// Greatest id of the delta.
    ///
    /// Membership has no insertion order, so the greatest id stands in for the most recently
    /// added member.
    pub fn last_request_id(&self) -> Option<RequestId> {
        self.delta.last()
    }
}

/// Computes `delta = candidates - current` and `updated = current ∪ delta`.
pub fn reconcile<I>(current: &Membership, candidates: I) -> Reconciliation
where
    I: IntoIterator<Item = RequestId>,
{
    let delta: Membership = candidates
        .into_iter()
        .filter(|id| !current.contains(*id))
        .collect();
    let updated = merge(current, &delta);

    Reconciliation { updated, delta }
}

/// Returns `current ∪ delta`.
pub fn merge(current: &Membership, delta: &Membership) -> Membership {
    let mut updated = current.clone();
    updated.extend(delta.iter());
    updated
}
