//! Explicit removal of members that left the scope of their audience filter.
//!
//! Reconciliation never removes members. Pruning is a separate administrative operation: it asks
//! the analytical source which members no longer carry one of the filter statuses, removes them
//! in one store transaction that also writes an audit row per removed member, and announces the
//! change with a `pruned` message.

use metrics::counter;
use tracing::info;

use crate::error::AudienceResult;
use crate::messages::AudienceChangeMessage;
use crate::metrics::AUDIENCE_MEMBERS_REMOVED_TOTAL;
use crate::queue::ChangePublisher;
use crate::source::AnalyticalSource;
use crate::store::AudienceStore;
use crate::types::{AudienceId, RequestId};
use crate::workers::task::publish_change;

/// Reason recorded in the audit trail of pruned members.
pub const PRUNE_REASON: &str = "status out of filter scope";

/// Summary of one prune.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub audience_id: AudienceId,
    /// Members the source reported as out of scope.
    pub out_of_scope: Vec<RequestId>,
    /// Members actually removed. Always empty for a dry run.
    pub removed: Vec<RequestId>,
    pub member_count: u64,
    pub published: bool,
    pub dry_run: bool,
}

/// Removes the members of `audience_id` whose status left the filter's status set.
///
/// With `dry_run` the out-of-scope members are only reported.
pub async fn prune_audience<St, So, P>(
    store: &St,
    source: &So,
    publisher: &P,
    audience_id: AudienceId,
    dry_run: bool,
) -> AudienceResult<PruneReport>
where
    St: AudienceStore + Sync,
    So: AnalyticalSource + Sync,
    P: ChangePublisher + Sync,
{
    let audience = store.get_audience(audience_id).await?;
    let out_of_scope = source
        .find_out_of_scope(&audience.filter, &audience.membership)
        .await?;

    let mut report = PruneReport {
        audience_id,
        out_of_scope,
        removed: Vec::new(),
        member_count: audience.membership.len() as u64,
        published: false,
        dry_run,
    };

    if dry_run || report.out_of_scope.is_empty() {
        info!(
            %audience_id,
            out_of_scope = report.out_of_scope.len(),
            dry_run,
            "nothing removed"
        );
        return Ok(report);
    }

    let removal = store
        .remove_members(audience_id, &report.out_of_scope, PRUNE_REASON)
        .await?;
    counter!(AUDIENCE_MEMBERS_REMOVED_TOTAL).increment(removal.removed.len() as u64);
    info!(
        %audience_id,
        removed = removal.removed.len(),
        member_count = removal.member_count,
        "pruned audience members"
    );

    report.member_count = removal.member_count;
    if !removal.removed.is_empty() {
        let message = AudienceChangeMessage::pruned(
            audience_id,
            removal.updated_at,
            removal.member_count,
            audience.filter,
            Vec::new(),
        );
        report.published = publish_change(store, publisher, message).await;
    }
    report.removed = removal.removed;

    Ok(report)
}
