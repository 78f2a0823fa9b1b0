use std::future::Future;

use crate::error::AudienceResult;
use crate::filter::AudienceFilter;
use crate::types::{CandidateRecord, Membership, RequestId};

/// Read-only query layer over the analytical database.
///
/// The analytical database may be a loosely consistent replica. A stale answer only delays
/// members to the next cycle, since reconciliation never removes anything based on it.
///
/// Implementations must validate the filter with [`AudienceFilter::validate`] before issuing
/// any query and fail with [`crate::error::ErrorKind::InvalidFilter`] when it is rejected.
/// Connectivity failures are reported as [`crate::error::ErrorKind::SourceUnavailable`] or
/// [`crate::error::ErrorKind::SourceTimeout`], everything else reported by the database as
/// [`crate::error::ErrorKind::SourceQueryFailed`].
pub trait AnalyticalSource {
    /// Returns the name of the source, used in logs.
    fn name() -> &'static str;

    /// Returns every record currently matching `filter`.
    fn find_matching(
        &self,
        filter: &AudienceFilter,
    ) -> impl Future<Output = AudienceResult<Vec<CandidateRecord>>> + Send;

    /// Returns the records matching `filter` whose id is not in `exclude`.
    ///
    /// Semantically `find_matching(filter) \ exclude`. Implementations are free to push the
    /// exclusion into the query.
    fn find_new(
        &self,
        filter: &AudienceFilter,
        exclude: &Membership,
    ) -> impl Future<Output = AudienceResult<Vec<CandidateRecord>>> + Send;

    /// Returns the members whose current status is no longer one of the filter's statuses.
    ///
    /// A filter without statuses accepts every status, so nothing is out of scope for it.
    /// Members unknown to the source are not reported.
    fn find_out_of_scope(
        &self,
        filter: &AudienceFilter,
        members: &Membership,
    ) -> impl Future<Output = AudienceResult<Vec<RequestId>>> + Send;
}
