//! Core domain types of the audience pipeline.

use std::collections::BTreeSet;
use std::collections::btree_set;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filter::AudienceFilter;
use crate::messages::ChangeStatus;

/// Identifier of an audience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AudienceId(i64);

impl AudienceId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn into_inner(self) -> i64 {
        self.0
    }
}

impl fmt::Display for AudienceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for AudienceId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl FromStr for AudienceId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Identifier of a lead/application request in the analytical database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(i64);

impl RequestId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn into_inner(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Set of request ids belonging to an audience.
///
/// Ordered so that iteration, logging and serialized output are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Membership(BTreeSet<RequestId>);

impl Membership {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.0.contains(&id)
    }

    /// Inserts `id`, returning whether it was new.
    pub fn insert(&mut self, id: RequestId) -> bool {
        self.0.insert(id)
    }

    /// Removes `id`, returning whether it was present.
    pub fn remove(&mut self, id: RequestId) -> bool {
        self.0.remove(&id)
    }

    /// Returns the greatest id of the set.
    pub fn last(&self) -> Option<RequestId> {
        self.0.last().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.0.iter().copied()
    }

    pub fn is_subset(&self, other: &Membership) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Returns the ids as raw integers, in ascending order.
    pub fn to_raw_ids(&self) -> Vec<i64> {
        self.0.iter().map(|id| id.into_inner()).collect()
    }
}

impl FromIterator<RequestId> for Membership {
    fn from_iter<I: IntoIterator<Item = RequestId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<RequestId> for Membership {
    fn extend<I: IntoIterator<Item = RequestId>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for Membership {
    type Item = RequestId;
    type IntoIter = btree_set::IntoIter<RequestId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// An audience as read from the audience store.
#[derive(Debug, Clone, PartialEq)]
pub struct Audience {
    pub id: AudienceId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub filter: AudienceFilter,
    pub membership: Membership,
    /// Change committed to the store whose message was not published yet.
    pub pending_change: Option<PendingChange>,
}

/// A membership change waiting to be announced.
///
/// Recorded together with the change itself and cleared once the message announcing the
/// change at `updated_at` was published, so a lost message is sent again by the next
/// reconciliation of the audience.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingChange {
    pub status: ChangeStatus,
    /// Greatest id appended by the pending changes, `None` for removals.
    pub last_request_id: Option<RequestId>,
}

impl PendingChange {
    /// Merges a new change into the pending one.
    ///
    /// Consecutive appends keep the greatest appended id, otherwise the latest change wins.
    pub fn merge(pending: Option<PendingChange>, change: PendingChange) -> PendingChange {
        match (pending, change.status) {
            (
                Some(PendingChange {
                    status: ChangeStatus::Updated,
                    last_request_id,
                }),
                ChangeStatus::Updated,
            ) => PendingChange {
                status: ChangeStatus::Updated,
                last_request_id: last_request_id.max(change.last_request_id),
            },
            _ => change,
        }
    }
}

/// A lead/application row returned by the analytical source.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRecord {
    pub id: RequestId,
    pub created_at: DateTime<Utc>,
    pub status: String,
    /// Rejection or non-target reason name, if the request carries one.
    pub reason: Option<String>,
    /// Manager responsible for the request.
    pub owner_id: Option<i64>,
}

/// Consistent view of an audience handed to exporters.
#[derive(Debug, Clone, PartialEq)]
pub struct AudienceSnapshot {
    pub audience: Audience,
    /// Ad cabinets the audience is synchronized to.
    pub integrations: Vec<String>,
    pub taken_at: DateTime<Utc>,
}

/// Result of appending members to an audience.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendOutcome {
    /// Ids that were not members before the append, ascending.
    pub inserted: Vec<RequestId>,
    /// Membership size after the append.
    pub member_count: u64,
    /// `updated_at` of the audience after the append.
    pub updated_at: DateTime<Utc>,
}

impl AppendOutcome {
    /// Returns the greatest inserted id.
    pub fn last_inserted(&self) -> Option<RequestId> {
        self.inserted.iter().max().copied()
    }
}

/// Result of explicitly removing members from an audience.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovalOutcome {
    /// Ids that were members and have been removed, ascending.
    pub removed: Vec<RequestId>,
    pub member_count: u64,
    pub updated_at: DateTime<Utc>,
}
