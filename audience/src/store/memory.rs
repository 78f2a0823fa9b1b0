use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;

use crate::bail;
use crate::error::{AudienceResult, ErrorKind};
use crate::filter::AudienceFilter;
use crate::messages::ChangeStatus;
use crate::store::AudienceStore;
use crate::types::{
    AppendOutcome, Audience, AudienceId, AudienceSnapshot, Membership, PendingChange,
    RemovalOutcome, RequestId,
};

/// Audit entry of an explicit member removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRemoval {
    pub audience_id: AudienceId,
    pub request_id: RequestId,
    pub reason: String,
    pub removed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct StoredAudience {
    audience: Audience,
    integrations: Vec<String>,
    /// When the pending change was last claimed for announcing it.
    pending_claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    audiences: BTreeMap<AudienceId, StoredAudience>,
    removals: Vec<MemberRemoval>,
    next_id: i64,
}

impl Inner {
    fn get_mut(&mut self, audience_id: AudienceId) -> AudienceResult<&mut StoredAudience> {
        match self.audiences.get_mut(&audience_id) {
            Some(stored) => Ok(stored),
            None => bail!(
                ErrorKind::AudienceNotFound,
                "Audience not found",
                format!("audience {audience_id} does not exist")
            ),
        }
    }
}

/// Returns a timestamp strictly after `previous`, so every change has its own `updated_at`.
fn next_updated_at(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous + TimeDelta::microseconds(1))
}

/// In-memory audience store for tests and local development.
///
/// A single lock guards every audience, which trivially serializes writes per audience.
#[derive(Debug, Clone, Default)]
pub struct MemoryAudienceStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryAudienceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new audience with `filter` and an initial membership.
    pub async fn create_audience(
        &self,
        name: &str,
        filter: AudienceFilter,
        membership: Membership,
    ) -> AudienceId {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = AudienceId::new(inner.next_id);
        let now = Utc::now();

        inner.audiences.insert(
            id,
            StoredAudience {
                audience: Audience {
                    id,
                    name: name.to_string(),
                    created_at: now,
                    updated_at: now,
                    filter,
                    membership,
                    pending_change: None,
                },
                integrations: Vec::new(),
                pending_claimed_at: None,
            },
        );

        id
    }

    pub async fn add_integration(
        &self,
        audience_id: AudienceId,
        cabinet_name: &str,
    ) -> AudienceResult<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner.get_mut(audience_id)?;
        if !stored.integrations.iter().any(|name| name == cabinet_name) {
            stored.integrations.push(cabinet_name.to_string());
        }

        Ok(())
    }

    /// Returns the membership of an audience, or `None` if it does not exist.
    pub async fn membership(&self, audience_id: AudienceId) -> Option<Membership> {
        let inner = self.inner.lock().await;
        inner
            .audiences
            .get(&audience_id)
            .map(|stored| stored.audience.membership.clone())
    }

    /// Releases every claim on a pending change, as if their workers died and the lease ran out.
    pub async fn expire_pending_claims(&self) {
        let mut inner = self.inner.lock().await;
        for stored in inner.audiences.values_mut() {
            stored.pending_claimed_at = None;
        }
    }

    /// Returns every recorded member removal.
    pub async fn removals(&self) -> Vec<MemberRemoval> {
        self.inner.lock().await.removals.clone()
    }
}

impl AudienceStore for MemoryAudienceStore {
    async fn list_audience_ids(&self) -> AudienceResult<Vec<AudienceId>> {
        let inner = self.inner.lock().await;

        Ok(inner.audiences.keys().copied().collect())
    }

    async fn get_audience(&self, audience_id: AudienceId) -> AudienceResult<Audience> {
        let mut inner = self.inner.lock().await;

        Ok(inner.get_mut(audience_id)?.audience.clone())
    }

    async fn get_snapshot(&self, audience_id: AudienceId) -> AudienceResult<AudienceSnapshot> {
        let mut inner = self.inner.lock().await;
        let stored = inner.get_mut(audience_id)?;

        Ok(AudienceSnapshot {
            audience: stored.audience.clone(),
            integrations: stored.integrations.clone(),
            taken_at: Utc::now(),
        })
    }

    async fn get_integration_names(&self, audience_id: AudienceId) -> AudienceResult<Vec<String>> {
        let mut inner = self.inner.lock().await;

        Ok(inner.get_mut(audience_id)?.integrations.clone())
    }

    async fn append_members(
        &self,
        audience_id: AudienceId,
        request_ids: &[RequestId],
    ) -> AudienceResult<AppendOutcome> {
        let mut inner = self.inner.lock().await;
        let stored = inner.get_mut(audience_id)?;
        let audience = &mut stored.audience;

        let mut inserted: Vec<RequestId> = request_ids
            .iter()
            .copied()
            .filter(|id| audience.membership.insert(*id))
            .collect();
        inserted.sort_unstable();

        if !inserted.is_empty() {
            audience.updated_at = next_updated_at(audience.updated_at);
            audience.pending_change = Some(PendingChange::merge(
                audience.pending_change,
                PendingChange {
                    status: ChangeStatus::Updated,
                    last_request_id: inserted.last().copied(),
                },
            ));
            stored.pending_claimed_at = Some(Utc::now());
        }

        Ok(AppendOutcome {
            inserted,
            member_count: audience.membership.len() as u64,
            updated_at: audience.updated_at,
        })
    }

    async fn remove_members(
        &self,
        audience_id: AudienceId,
        request_ids: &[RequestId],
        reason: &str,
    ) -> AudienceResult<RemovalOutcome> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let stored = inner.get_mut(audience_id)?;
        let audience = &mut stored.audience;

        let mut removed: Vec<RequestId> = request_ids
            .iter()
            .copied()
            .filter(|id| audience.membership.remove(*id))
            .collect();
        removed.sort_unstable();

        if !removed.is_empty() {
            audience.updated_at = next_updated_at(audience.updated_at);
            audience.pending_change = Some(PendingChange {
                status: ChangeStatus::Pruned,
                last_request_id: None,
            });
            stored.pending_claimed_at = Some(now);
        }
        let outcome = RemovalOutcome {
            removed,
            member_count: audience.membership.len() as u64,
            updated_at: audience.updated_at,
        };

        inner
            .removals
            .extend(outcome.removed.iter().map(|request_id| MemberRemoval {
                audience_id,
                request_id: *request_id,
                reason: reason.to_string(),
                removed_at: now,
            }));

        Ok(outcome)
    }

    async fn claim_pending_change(
        &self,
        audience_id: AudienceId,
        updated_at: DateTime<Utc>,
        lease: Duration,
    ) -> AudienceResult<bool> {
        let mut inner = self.inner.lock().await;
        let stored = inner.get_mut(audience_id)?;
        let now = Utc::now();

        if stored.audience.updated_at != updated_at || stored.audience.pending_change.is_none() {
            return Ok(false);
        }
        let lease = TimeDelta::from_std(lease).unwrap_or(TimeDelta::MAX);
        if let Some(claimed_at) = stored.pending_claimed_at
            && now.signed_duration_since(claimed_at) <= lease
        {
            return Ok(false);
        }
        stored.pending_claimed_at = Some(now);

        Ok(true)
    }

    async fn settle_pending_change(
        &self,
        audience_id: AudienceId,
        updated_at: DateTime<Utc>,
        published: bool,
    ) -> AudienceResult<bool> {
        let mut inner = self.inner.lock().await;
        let stored = inner.get_mut(audience_id)?;

        if stored.audience.updated_at != updated_at || stored.audience.pending_change.is_none() {
            return Ok(false);
        }
        if published {
            stored.audience.pending_change = None;
        }
        stored.pending_claimed_at = None;

        Ok(true)
    }

    async fn delete_audience(&self, audience_id: AudienceId) -> AudienceResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.audiences.remove(&audience_id).is_none() {
            bail!(
                ErrorKind::AudienceNotFound,
                "Audience not found",
                format!("audience {audience_id} does not exist")
            );
        }

        Ok(())
    }
}
