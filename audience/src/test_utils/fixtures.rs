use chrono::{DateTime, TimeZone, Utc};

use crate::filter::AudienceFilter;
use crate::types::{CandidateRecord, Membership, RequestId};

/// Status matched by [`fixture_filter`].
pub const FIXTURE_STATUS: &str = "rejected";

/// Rejection reason carried by [`fixture_candidate`].
pub const FIXTURE_REASON: &str = "no_budget";

/// Creation time of [`fixture_candidate`], inside the range of [`fixture_filter`].
pub fn fixture_created_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

/// Filter matching `rejected` requests created in the first half of 2025.
pub fn fixture_filter() -> AudienceFilter {
    let mut filter = AudienceFilter {
        creation_date_from: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
        creation_date_to: Some(Utc.with_ymd_and_hms(2025, 6, 30, 23, 59, 59).unwrap()),
        ..Default::default()
    };
    filter.statuses.insert(FIXTURE_STATUS.to_string());

    filter
}

/// Candidate matched by [`fixture_filter`].
pub fn fixture_candidate(id: i64) -> CandidateRecord {
    CandidateRecord {
        id: RequestId::new(id),
        created_at: fixture_created_at(),
        status: FIXTURE_STATUS.to_string(),
        reason: Some(FIXTURE_REASON.to_string()),
        owner_id: Some(1),
    }
}

pub fn fixture_candidates(ids: &[i64]) -> Vec<CandidateRecord> {
    ids.iter().copied().map(fixture_candidate).collect()
}

pub fn membership(ids: &[i64]) -> Membership {
    ids.iter().copied().map(RequestId::new).collect()
}

pub fn request_ids(ids: &[i64]) -> Vec<RequestId> {
    ids.iter().copied().map(RequestId::new).collect()
}
