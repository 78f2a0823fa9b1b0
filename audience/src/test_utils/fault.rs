//! Failure injection wrappers.
//!
//! Each wrapper delegates to an inner implementation and fails selected operations with a chosen
//! [`ErrorKind`] a given number of times. Clones share their fault plan.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::audience_error;
use crate::error::{AudienceResult, ErrorKind};
use crate::filter::AudienceFilter;
use crate::messages::{AudienceChangeMessage, ReconciliationTask};
use crate::queue::{ChangePublisher, TaskQueue};
use crate::source::AnalyticalSource;
use crate::store::AudienceStore;
use crate::types::{
    AppendOutcome, Audience, AudienceId, AudienceSnapshot, CandidateRecord, Membership,
    RemovalOutcome, RequestId,
};

/// Queue of errors the next calls of one operation fail with.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    pending: Arc<Mutex<VecDeque<ErrorKind>>>,
    injected: Arc<Mutex<u64>>,
}

impl Faults {
    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<ErrorKind>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `times` calls fail with `kind`.
    pub fn fail_next(&self, kind: ErrorKind, times: usize) {
        self.lock_pending()
            .extend(std::iter::repeat_n(kind, times));
    }

    /// Number of failures injected so far.
    pub fn injected(&self) -> u64 {
        *self.injected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, operation: &'static str) -> AudienceResult<()> {
        let Some(kind) = self.lock_pending().pop_front() else {
            return Ok(());
        };
        *self.injected.lock().unwrap_or_else(PoisonError::into_inner) += 1;

        Err(audience_error!(kind, "Injected fault", operation))
    }
}

/// Analytical source failing candidate queries on demand.
#[derive(Debug, Clone)]
pub struct FaultySource<S> {
    inner: S,
    queries: Faults,
}

impl<S> FaultySource<S> {
    pub fn wrap(inner: S) -> Self {
        Self {
            inner,
            queries: Faults::default(),
        }
    }

    /// Faults applied to `find_matching`, `find_new` and `find_out_of_scope`.
    pub fn queries(&self) -> &Faults {
        &self.queries
    }

    pub fn get_inner(&self) -> &S {
        &self.inner
    }
}

impl<S> AnalyticalSource for FaultySource<S>
where
    S: AnalyticalSource + Sync,
{
    fn name() -> &'static str {
        S::name()
    }

    async fn find_matching(&self, filter: &AudienceFilter) -> AudienceResult<Vec<CandidateRecord>> {
        self.queries.check("find_matching")?;
        self.inner.find_matching(filter).await
    }

    async fn find_new(
        &self,
        filter: &AudienceFilter,
        exclude: &Membership,
    ) -> AudienceResult<Vec<CandidateRecord>> {
        self.queries.check("find_new")?;
        self.inner.find_new(filter, exclude).await
    }

    async fn find_out_of_scope(
        &self,
        filter: &AudienceFilter,
        members: &Membership,
    ) -> AudienceResult<Vec<RequestId>> {
        self.queries.check("find_out_of_scope")?;
        self.inner.find_out_of_scope(filter, members).await
    }
}

/// Audience store failing listings, reads and writes on demand.
#[derive(Debug, Clone)]
pub struct FaultyStore<S> {
    inner: S,
    lists: Faults,
    reads: Faults,
    writes: Faults,
}

impl<S> FaultyStore<S> {
    pub fn wrap(inner: S) -> Self {
        Self {
            inner,
            lists: Faults::default(),
            reads: Faults::default(),
            writes: Faults::default(),
        }
    }

    /// Faults applied to `list_audience_ids`.
    pub fn lists(&self) -> &Faults {
        &self.lists
    }

    /// Faults applied to `get_audience` and `get_snapshot`.
    pub fn reads(&self) -> &Faults {
        &self.reads
    }

    /// Faults applied to `append_members` and `remove_members`, before anything is written.
    pub fn writes(&self) -> &Faults {
        &self.writes
    }

    pub fn get_inner(&self) -> &S {
        &self.inner
    }
}

impl<S> AudienceStore for FaultyStore<S>
where
    S: AudienceStore + Sync,
{
    async fn list_audience_ids(&self) -> AudienceResult<Vec<AudienceId>> {
        self.lists.check("list_audience_ids")?;
        self.inner.list_audience_ids().await
    }

    async fn get_audience(&self, audience_id: AudienceId) -> AudienceResult<Audience> {
        self.reads.check("get_audience")?;
        self.inner.get_audience(audience_id).await
    }

    async fn get_snapshot(&self, audience_id: AudienceId) -> AudienceResult<AudienceSnapshot> {
        self.reads.check("get_snapshot")?;
        self.inner.get_snapshot(audience_id).await
    }

    async fn get_integration_names(&self, audience_id: AudienceId) -> AudienceResult<Vec<String>> {
        self.inner.get_integration_names(audience_id).await
    }

    async fn append_members(
        &self,
        audience_id: AudienceId,
        request_ids: &[RequestId],
    ) -> AudienceResult<AppendOutcome> {
        self.writes.check("append_members")?;
        self.inner.append_members(audience_id, request_ids).await
    }

    async fn remove_members(
        &self,
        audience_id: AudienceId,
        request_ids: &[RequestId],
        reason: &str,
    ) -> AudienceResult<RemovalOutcome> {
        self.writes.check("remove_members")?;
        self.inner
            .remove_members(audience_id, request_ids, reason)
            .await
    }

    async fn claim_pending_change(
        &self,
        audience_id: AudienceId,
        updated_at: DateTime<Utc>,
        lease: Duration,
    ) -> AudienceResult<bool> {
        self.inner
            .claim_pending_change(audience_id, updated_at, lease)
            .await
    }

    async fn settle_pending_change(
        &self,
        audience_id: AudienceId,
        updated_at: DateTime<Utc>,
        published: bool,
    ) -> AudienceResult<bool> {
        self.inner
            .settle_pending_change(audience_id, updated_at, published)
            .await
    }

    async fn delete_audience(&self, audience_id: AudienceId) -> AudienceResult<()> {
        self.inner.delete_audience(audience_id).await
    }
}

/// Queue failing task publishes for chosen audiences and change publishes on demand.
#[derive(Debug, Clone)]
pub struct FaultyQueue<Q> {
    inner: Q,
    unreachable_audiences: Arc<Mutex<BTreeSet<AudienceId>>>,
    changes: Faults,
}

impl<Q> FaultyQueue<Q> {
    pub fn wrap(inner: Q) -> Self {
        Self {
            inner,
            unreachable_audiences: Arc::default(),
            changes: Faults::default(),
        }
    }

    /// Makes every task publish for `audience_id` fail.
    pub fn fail_tasks_for(&self, audience_id: AudienceId) {
        self.unreachable_audiences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(audience_id);
    }

    /// Faults applied to `publish_change`.
    pub fn changes(&self) -> &Faults {
        &self.changes
    }

    pub fn get_inner(&self) -> &Q {
        &self.inner
    }
}

impl<Q> TaskQueue for FaultyQueue<Q>
where
    Q: TaskQueue + Sync,
{
    type Consumer = Q::Consumer;

    async fn publish_task(&self, task: &ReconciliationTask) -> AudienceResult<()> {
        let unreachable = self
            .unreachable_audiences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&task.audience_id);
        if unreachable {
            return Err(audience_error!(
                ErrorKind::QueueOperationFailed,
                "Injected fault",
                format!("publish_task for audience {}", task.audience_id)
            ));
        }

        self.inner.publish_task(task).await
    }

    async fn consumer(&self, tag: &str) -> AudienceResult<Q::Consumer> {
        self.inner.consumer(tag).await
    }
}

impl<Q> ChangePublisher for FaultyQueue<Q>
where
    Q: ChangePublisher + Sync,
{
    async fn publish_change(&self, message: &AudienceChangeMessage) -> AudienceResult<()> {
        self.changes.check("publish_change")?;
        self.inner.publish_change(message).await
    }
}
