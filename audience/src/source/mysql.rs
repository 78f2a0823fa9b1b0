use std::time::{Duration, Instant};

use chrono::{NaiveDateTime, Utc};
use config::shared::{IntoConnectOptions, SourceConfig};
use metrics::histogram;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::{MySql, MySqlPool, QueryBuilder, Row};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::audience_error;
use crate::error::{AudienceError, AudienceResult, ErrorKind};
use crate::filter::{AudienceFilter, DateRange};
use crate::metrics::{AUDIENCE_SOURCE_QUERY_DURATION_SECONDS, QUERY_LABEL};
use crate::source::AnalyticalSource;
use crate::types::{CandidateRecord, Membership, RequestId};

const CANDIDATE_COLUMNS: &str = "SELECT CAST(eb.id AS SIGNED) AS id, \
     eb.date_added AS date_added, \
     eb.status_name AS status_name, \
     CAST(COALESCE(eb.manager_id, -1) AS SIGNED) AS manager_id, \
     ebrs.name AS reason_name \
     FROM estate_buys eb \
     LEFT JOIN estate_statuses_reasons ebrs ON ebrs.status_reason_id = eb.status_reason_id";

/// Analytical source backed by the MySQL lead database.
///
/// Every filter value is sent as a bound parameter. Queries are bounded by the configured
/// timeout so that a stuck query cannot hold a worker indefinitely.
#[derive(Debug, Clone)]
pub struct MySqlAnalyticalSource {
    pool: MySqlPool,
    query_timeout: Duration,
    max_pushed_exclusions: usize,
}

impl MySqlAnalyticalSource {
    pub fn new(pool: MySqlPool, config: &SourceConfig) -> Self {
        Self {
            pool,
            query_timeout: Duration::from_millis(config.query_timeout_ms),
            // A zero limit would make id chunking impossible.
            max_pushed_exclusions: config
                .max_pushed_exclusions
                .clamp(1, SourceConfig::MAX_PUSHED_EXCLUSIONS_LIMIT),
        }
    }

    /// Builds a source whose pool opens no connection until the first query.
    ///
    /// Used by processes that never query the source, such as a scheduler-only deployment.
    pub fn connect_lazy(config: &SourceConfig) -> Self {
        let pool = MySqlPoolOptions::new()
            .min_connections(0)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.query_timeout_ms))
            .connect_lazy_with(config.connection.with_db());

        Self::new(pool, config)
    }

    /// Connects the source pool, retrying up to `connect_max_retries` times.
    pub async fn connect(config: &SourceConfig) -> AudienceResult<Self> {
        let retry_interval = Duration::from_millis(config.connect_retry_interval_ms);
        let mut attempt = 1;

        loop {
            let result = MySqlPoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(Duration::from_millis(config.query_timeout_ms))
                .connect_with(config.connection.with_db())
                .await;

            match result {
                Ok(pool) => {
                    info!(attempt, "connected to analytical source");
                    return Ok(Self::new(pool, config));
                }
                Err(err) if attempt < config.connect_max_retries => {
                    warn!(
                        attempt,
                        max_retries = config.connect_max_retries,
                        error = %err,
                        "failed to connect to analytical source, retrying"
                    );
                    attempt += 1;
                    sleep(retry_interval).await;
                }
                Err(err) => {
                    return Err(audience_error!(
                        ErrorKind::SourceUnavailable,
                        "Failed to connect to the analytical source",
                        format!("gave up after {attempt} attempts: {err}"),
                        source: err
                    ));
                }
            }
        }
    }

    async fn fetch_candidates(
        &self,
        query_name: &'static str,
        mut builder: QueryBuilder<'static, MySql>,
    ) -> AudienceResult<Vec<CandidateRecord>> {
        let rows = self.fetch_rows(query_name, &mut builder).await?;
        rows.iter().map(candidate_from_row).collect()
    }

    async fn fetch_rows(
        &self,
        query_name: &'static str,
        builder: &mut QueryBuilder<'static, MySql>,
    ) -> AudienceResult<Vec<MySqlRow>> {
        let started = Instant::now();
        let result = timeout(self.query_timeout, builder.build().fetch_all(&self.pool)).await;
        histogram!(AUDIENCE_SOURCE_QUERY_DURATION_SECONDS, QUERY_LABEL => query_name)
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(Ok(rows)) => {
                debug!(query = query_name, rows = rows.len(), "analytical query completed");
                Ok(rows)
            }
            Ok(Err(err)) => Err(classify_source_error(err)),
            Err(_) => Err(audience_error!(
                ErrorKind::SourceTimeout,
                "Analytical source query timed out",
                format!("query '{query_name}' exceeded {:?}", self.query_timeout)
            )),
        }
    }
}

impl AnalyticalSource for MySqlAnalyticalSource {
    fn name() -> &'static str {
        "mysql"
    }

    async fn find_matching(&self, filter: &AudienceFilter) -> AudienceResult<Vec<CandidateRecord>> {
        let range = filter.validate(Utc::now())?;
        let builder = build_candidate_query(&range, filter, &[]);

        self.fetch_candidates("find_matching", builder).await
    }

    async fn find_new(
        &self,
        filter: &AudienceFilter,
        exclude: &Membership,
    ) -> AudienceResult<Vec<CandidateRecord>> {
        let range = filter.validate(Utc::now())?;

        if pushes_exclusions(filter, exclude.len(), self.max_pushed_exclusions) {
            let builder = build_candidate_query(&range, filter, &exclude.to_raw_ids());
            return self.fetch_candidates("find_new", builder).await;
        }

        debug!(
            exclusions = exclude.len(),
            max_pushed_exclusions = self.max_pushed_exclusions,
            "exclusion set too large to push down, filtering candidates locally"
        );
        let builder = build_candidate_query(&range, filter, &[]);
        let candidates = self.fetch_candidates("find_new", builder).await?;

        Ok(candidates
            .into_iter()
            .filter(|candidate| !exclude.contains(candidate.id))
            .collect())
    }

    async fn find_out_of_scope(
        &self,
        filter: &AudienceFilter,
        members: &Membership,
    ) -> AudienceResult<Vec<RequestId>> {
        if filter.statuses.is_empty() || members.is_empty() {
            return Ok(Vec::new());
        }

        let member_ids = members.to_raw_ids();
        let chunk_size = self
            .max_pushed_exclusions
            .min(MYSQL_MAX_PLACEHOLDERS.saturating_sub(filter.statuses.len()))
            .max(1);
        let mut out_of_scope = Vec::new();
        for chunk in member_ids.chunks(chunk_size) {
            let mut builder = build_out_of_scope_query(filter, chunk);
            let rows = self.fetch_rows("find_out_of_scope", &mut builder).await?;
            for row in &rows {
                let id: i64 = row.try_get("id").map_err(classify_source_error)?;
                out_of_scope.push(RequestId::new(id));
            }
        }

        out_of_scope.sort_unstable();
        Ok(out_of_scope)
    }
}

/// Placeholders MySQL accepts in one prepared statement.
const MYSQL_MAX_PLACEHOLDERS: usize = u16::MAX as usize;

/// Whether `exclusions` ids fit into the candidate query of `filter` as bound parameters.
fn pushes_exclusions(
    filter: &AudienceFilter,
    exclusions: usize,
    max_pushed_exclusions: usize,
) -> bool {
    // Date range bounds plus one placeholder per status and reason.
    let filter_placeholders = 2 + filter.statuses.len() + filter.reasons().len();

    exclusions <= max_pushed_exclusions
        && exclusions + filter_placeholders <= MYSQL_MAX_PLACEHOLDERS
}

/// Builds the candidate query for `range` and `filter`, excluding `exclude` ids.
fn build_candidate_query(
    range: &DateRange,
    filter: &AudienceFilter,
    exclude: &[i64],
) -> QueryBuilder<'static, MySql> {
    let mut builder = QueryBuilder::new(CANDIDATE_COLUMNS);

    // DATETIME columns hold UTC wall-clock values.
    builder.push(" WHERE eb.date_added >= ");
    builder.push_bind(range.from.naive_utc());
    builder.push(" AND eb.date_added <= ");
    builder.push_bind(range.to.naive_utc());

    if !filter.statuses.is_empty() {
        builder.push(" AND eb.status_name IN (");
        let mut separated = builder.separated(", ");
        for status in &filter.statuses {
            separated.push_bind(status.clone());
        }
        separated.push_unseparated(")");
    }

    let reasons = filter.reasons();
    if !reasons.is_empty() {
        builder.push(" AND ebrs.name IN (");
        let mut separated = builder.separated(", ");
        for reason in reasons {
            separated.push_bind(reason.to_string());
        }
        separated.push_unseparated(")");
    }

    if !exclude.is_empty() {
        builder.push(" AND eb.id NOT IN (");
        let mut separated = builder.separated(", ");
        for id in exclude {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
    }

    builder.push(" ORDER BY eb.id");
    builder
}

fn build_out_of_scope_query(
    filter: &AudienceFilter,
    member_ids: &[i64],
) -> QueryBuilder<'static, MySql> {
    let mut builder =
        QueryBuilder::new("SELECT CAST(eb.id AS SIGNED) AS id FROM estate_buys eb WHERE eb.id IN (");
    let mut separated = builder.separated(", ");
    for id in member_ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");

    // A missing status is out of every status set.
    builder.push(" AND (eb.status_name IS NULL OR eb.status_name NOT IN (");
    let mut separated = builder.separated(", ");
    for status in &filter.statuses {
        separated.push_bind(status.clone());
    }
    separated.push_unseparated("))");

    builder
}

fn candidate_from_row(row: &MySqlRow) -> AudienceResult<CandidateRecord> {
    let id: i64 = row.try_get("id").map_err(classify_source_error)?;
    let date_added: NaiveDateTime = row.try_get("date_added").map_err(classify_source_error)?;
    let status: Option<String> = row.try_get("status_name").map_err(classify_source_error)?;
    let manager_id: i64 = row.try_get("manager_id").map_err(classify_source_error)?;
    let reason: Option<String> = row.try_get("reason_name").map_err(classify_source_error)?;

    Ok(CandidateRecord {
        id: RequestId::new(id),
        created_at: date_added.and_utc(),
        status: status.unwrap_or_default(),
        reason,
        owner_id: (manager_id >= 0).then_some(manager_id),
    })
}

/// Classifies a driver error of the analytical source.
///
/// Transport and pool failures are transient and worth a retry, everything else points at the
/// query itself or the data it returned.
fn classify_source_error(err: sqlx::Error) -> AudienceError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => audience_error!(
            ErrorKind::SourceUnavailable,
            "Analytical source is unavailable",
            err.to_string(),
            source: err
        ),
        _ => audience_error!(
            ErrorKind::SourceQueryFailed,
            "Analytical source query failed",
            err.to_string(),
            source: err
        ),
    }
}
