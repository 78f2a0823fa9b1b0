use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::AudienceResult;
use crate::types::{
    AppendOutcome, Audience, AudienceId, AudienceSnapshot, RemovalOutcome, RequestId,
};

/// Trait for storing audiences and their membership.
///
/// Writes to one audience must be serialized: concurrent appends for the same audience both
/// have to land, and an id appended twice must be stored once. Audiences are independent of
/// each other and must never be touched by an operation on another audience.
///
/// Operations on an unknown audience fail with
/// [`crate::error::ErrorKind::AudienceNotFound`].
pub trait AudienceStore {
    /// Returns the ids of every audience.
    fn list_audience_ids(&self) -> impl Future<Output = AudienceResult<Vec<AudienceId>>> + Send;

    /// Returns the audience with its filter and membership.
    fn get_audience(
        &self,
        audience_id: AudienceId,
    ) -> impl Future<Output = AudienceResult<Audience>> + Send;

    /// Returns the audience and its integrations as observed by a single consistent read.
    ///
    /// A snapshot never observes a half-applied append or removal.
    fn get_snapshot(
        &self,
        audience_id: AudienceId,
    ) -> impl Future<Output = AudienceResult<AudienceSnapshot>> + Send;

    /// Returns the names of the ad cabinets the audience is synchronized to.
    fn get_integration_names(
        &self,
        audience_id: AudienceId,
    ) -> impl Future<Output = AudienceResult<Vec<String>>> + Send;

    /// Appends `request_ids` to the membership atomically and bumps `updated_at`.
    ///
    /// Ids that are already members are skipped. The outcome lists only the ids this call
    /// actually inserted, which is empty when a concurrent append won the race. When ids were
    /// inserted, the same write records an `updated` [`crate::types::PendingChange`] claimed by
    /// the caller.
    fn append_members(
        &self,
        audience_id: AudienceId,
        request_ids: &[RequestId],
    ) -> impl Future<Output = AudienceResult<AppendOutcome>> + Send;

    /// Removes `request_ids` from the membership atomically, recording one audit entry per
    /// removed id with `reason` and a `pruned` [`crate::types::PendingChange`] claimed by the caller.
    ///
    /// This is never called by reconciliation.
    fn remove_members(
        &self,
        audience_id: AudienceId,
        request_ids: &[RequestId],
        reason: &str,
    ) -> impl Future<Output = AudienceResult<RemovalOutcome>> + Send;

    /// Claims the pending change announced at `updated_at` for announcing it.
    ///
    /// Fails with `false` if the change was announced or superseded already, or if another
    /// claim is younger than `lease`. A claim older than `lease` belongs to a worker that died
    /// before settling it and is taken over.
    fn claim_pending_change(
        &self,
        audience_id: AudienceId,
        updated_at: DateTime<Utc>,
        lease: Duration,
    ) -> impl Future<Output = AudienceResult<bool>> + Send;

    /// Settles the claim on the pending change announced at `updated_at`.
    ///
    /// A published change is cleared, otherwise the claim is released so the next
    /// reconciliation announces it. Returns `false` if the audience changed after `updated_at`,
    /// in which case the newer change stays pending untouched.
    fn settle_pending_change(
        &self,
        audience_id: AudienceId,
        updated_at: DateTime<Utc>,
        published: bool,
    ) -> impl Future<Output = AudienceResult<bool>> + Send;

    /// Deletes the audience together with its filter, membership and integrations.
    fn delete_audience(
        &self,
        audience_id: AudienceId,
    ) -> impl Future<Output = AudienceResult<()>> + Send;
}
