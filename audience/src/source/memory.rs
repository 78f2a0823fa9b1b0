use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::AudienceResult;
use crate::filter::AudienceFilter;
use crate::source::AnalyticalSource;
use crate::types::{CandidateRecord, Membership, RequestId};

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<RequestId, CandidateRecord>,
    queries: u64,
    evaluated_at: Option<DateTime<Utc>>,
}

/// In-memory analytical source for tests and local development.
///
/// Filters are evaluated with [`AudienceFilter::matches`], so the memory source and the MySQL
/// source agree on matching semantics. [`MemoryAnalyticalSource::queries`] counts only the
/// queries that passed filter validation.
#[derive(Debug, Clone, Default)]
pub struct MemoryAnalyticalSource {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryAnalyticalSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces records.
    pub async fn upsert_records<I>(&self, records: I)
    where
        I: IntoIterator<Item = CandidateRecord>,
    {
        let mut inner = self.inner.lock().await;
        for record in records {
            inner.records.insert(record.id, record);
        }
    }

    /// Changes the status of an existing record, returning whether it exists.
    pub async fn set_status(&self, id: RequestId, status: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.records.get_mut(&id) {
            Some(record) => {
                record.status = status.to_string();
                true
            }
            None => false,
        }
    }

    /// Pins the evaluation time used for open-ended filters.
    pub async fn set_evaluation_time(&self, evaluated_at: DateTime<Utc>) {
        self.inner.lock().await.evaluated_at = Some(evaluated_at);
    }

    /// Number of queries that reached the data.
    pub async fn queries(&self) -> u64 {
        self.inner.lock().await.queries
    }

    async fn matching(
        &self,
        filter: &AudienceFilter,
        exclude: Option<&Membership>,
    ) -> AudienceResult<Vec<CandidateRecord>> {
        let mut inner = self.inner.lock().await;
        let range = filter.validate(inner.evaluated_at.unwrap_or_else(Utc::now))?;
        inner.queries += 1;

        Ok(inner
            .records
            .values()
            .filter(|record| exclude.is_none_or(|exclude| !exclude.contains(record.id)))
            .filter(|record| filter.matches(&range, record))
            .cloned()
            .collect())
    }
}

impl AnalyticalSource for MemoryAnalyticalSource {
    fn name() -> &'static str {
        "memory"
    }

    async fn find_matching(&self, filter: &AudienceFilter) -> AudienceResult<Vec<CandidateRecord>> {
        self.matching(filter, None).await
    }

    async fn find_new(
        &self,
        filter: &AudienceFilter,
        exclude: &Membership,
    ) -> AudienceResult<Vec<CandidateRecord>> {
        self.matching(filter, Some(exclude)).await
    }

    async fn find_out_of_scope(
        &self,
        filter: &AudienceFilter,
        members: &Membership,
    ) -> AudienceResult<Vec<RequestId>> {
        if filter.statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut inner = self.inner.lock().await;
        inner.queries += 1;

        Ok(members
            .iter()
            .filter(|id| {
                inner
                    .records
                    .get(id)
                    .is_some_and(|record| !filter.statuses.contains(&record.status))
            })
            .collect())
    }
}
