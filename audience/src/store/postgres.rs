use std::time::Duration;

use chrono::{DateTime, Utc};
use config::shared::{IntoConnectOptions, StoreConfig};
use postgres::audience::{self, AudienceFilterRow};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use crate::bail;
use crate::error::{AudienceResult, ErrorKind};
use crate::filter::AudienceFilter;
use crate::messages::ChangeStatus;
use crate::store::AudienceStore;
use crate::types::{
    AppendOutcome, Audience, AudienceId, AudienceSnapshot, Membership, PendingChange,
    RemovalOutcome, RequestId,
};

/// Creates a lazily connected pool for the audience store.
///
/// No connection is opened until the first query, connections idle for longer than the
/// configured timeout are closed.
pub fn create_store_pool(config: &StoreConfig) -> PgPool {
    PgPoolOptions::new()
        .min_connections(0)
        .max_connections(config.max_connections)
        .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
        .connect_lazy_with(config.connection.with_db())
}

/// Maps a stored filter row to the canonical filter.
pub fn filter_from_row(row: AudienceFilterRow) -> AudienceFilter {
    AudienceFilter {
        creation_date_from: row.creation_date_from,
        creation_date_to: row.creation_date_to,
        statuses: row.statuses.into_iter().collect(),
        rejection_reasons: row.rejection_reasons.into_iter().collect(),
        non_target_reasons: row.non_target_reasons.into_iter().collect(),
    }
}

/// Maps the canonical filter to a row for storage.
pub fn filter_to_row(filter: &AudienceFilter) -> AudienceFilterRow {
    AudienceFilterRow {
        creation_date_from: filter.creation_date_from,
        creation_date_to: filter.creation_date_to,
        statuses: filter.statuses.iter().cloned().collect(),
        rejection_reasons: filter.rejection_reasons.iter().cloned().collect(),
        non_target_reasons: filter.non_target_reasons.iter().cloned().collect(),
    }
}

/// Maps the stored pending change columns to a [`PendingChange`].
///
/// An unknown change name is announced as `updated`, which is always safe to send.
pub fn pending_change_from_row(
    change: Option<&str>,
    last_request_id: Option<i64>,
) -> Option<PendingChange> {
    let status = match change? {
        "pruned" => ChangeStatus::Pruned,
        _ => ChangeStatus::Updated,
    };

    Some(PendingChange {
        status,
        last_request_id: last_request_id.map(RequestId::new),
    })
}

/// Audience store backed by Postgres.
///
/// Writes to an audience lock its row with `SELECT ... FOR UPDATE` for the duration of the
/// transaction, and membership inserts rely on the `(audience_id, request_id)` primary key with
/// `ON CONFLICT DO NOTHING`, so racing workers serialize per audience and never duplicate ids.
#[derive(Debug, Clone)]
pub struct PostgresAudienceStore {
    pool: PgPool,
}

impl PostgresAudienceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates a new audience with `filter` and returns its id.
    pub async fn create_audience(
        &self,
        name: &str,
        filter: &AudienceFilter,
    ) -> AudienceResult<AudienceId> {
        let id = audience::insert_audience(&self.pool, name, &filter_to_row(filter)).await?;

        Ok(AudienceId::new(id))
    }

    pub async fn add_integration(
        &self,
        audience_id: AudienceId,
        cabinet_name: &str,
    ) -> AudienceResult<()> {
        audience::insert_integration(&self.pool, audience_id.into_inner(), cabinet_name).await?;

        Ok(())
    }

    /// Begins a read-only transaction that sees one consistent state of the store.
    async fn begin_consistent_read(&self) -> AudienceResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("set transaction isolation level repeatable read, read only")
            .execute(&mut *tx)
            .await?;

        Ok(tx)
    }

    async fn read_audience(
        tx: &mut Transaction<'static, Postgres>,
        audience_id: AudienceId,
    ) -> AudienceResult<Audience> {
        let id = audience_id.into_inner();

        let Some(row) = audience::get_audience_row(&mut **tx, id).await? else {
            bail!(
                ErrorKind::AudienceNotFound,
                "Audience not found",
                format!("audience {audience_id} does not exist")
            );
        };
        let filter_row = audience::get_audience_filter_row(&mut **tx, id)
            .await?
            .unwrap_or_default();
        let membership: Membership = audience::get_member_ids(&mut **tx, id)
            .await?
            .into_iter()
            .map(RequestId::new)
            .collect();

        Ok(Audience {
            id: audience_id,
            name: row.name,
            created_at: row.created_at,
            updated_at: row.updated_at,
            filter: filter_from_row(filter_row),
            membership,
            pending_change: pending_change_from_row(
                row.pending_change.as_deref(),
                row.pending_last_request_id,
            ),
        })
    }

    async fn lock_or_not_found(
        tx: &mut Transaction<'static, Postgres>,
        audience_id: AudienceId,
    ) -> AudienceResult<()> {
        if !audience::lock_audience(&mut **tx, audience_id.into_inner()).await? {
            bail!(
                ErrorKind::AudienceNotFound,
                "Audience not found",
                format!("audience {audience_id} does not exist")
            );
        }

        Ok(())
    }
}

impl AudienceStore for PostgresAudienceStore {
    async fn list_audience_ids(&self) -> AudienceResult<Vec<AudienceId>> {
        let ids = audience::list_audience_ids(&self.pool).await?;

        Ok(ids.into_iter().map(AudienceId::new).collect())
    }

    async fn get_audience(&self, audience_id: AudienceId) -> AudienceResult<Audience> {
        let mut tx = self.begin_consistent_read().await?;
        let audience = Self::read_audience(&mut tx, audience_id).await?;
        tx.commit().await?;

        Ok(audience)
    }

    async fn get_snapshot(&self, audience_id: AudienceId) -> AudienceResult<AudienceSnapshot> {
        let mut tx = self.begin_consistent_read().await?;
        let audience = Self::read_audience(&mut tx, audience_id).await?;
        let integrations =
            audience::get_integration_names(&mut *tx, audience_id.into_inner()).await?;
        tx.commit().await?;

        Ok(AudienceSnapshot {
            audience,
            integrations,
            taken_at: Utc::now(),
        })
    }

    async fn get_integration_names(&self, audience_id: AudienceId) -> AudienceResult<Vec<String>> {
        let mut conn = self.pool.acquire().await?;

        Ok(audience::get_integration_names(&mut conn, audience_id.into_inner()).await?)
    }

    async fn append_members(
        &self,
        audience_id: AudienceId,
        request_ids: &[RequestId],
    ) -> AudienceResult<AppendOutcome> {
        let id = audience_id.into_inner();
        let raw_ids: Vec<i64> = request_ids.iter().map(|id| id.into_inner()).collect();

        let mut tx = self.pool.begin().await?;
        Self::lock_or_not_found(&mut tx, audience_id).await?;

        let mut inserted: Vec<RequestId> = if raw_ids.is_empty() {
            Vec::new()
        } else {
            audience::insert_members(&mut tx, id, &raw_ids)
                .await?
                .into_iter()
                .map(RequestId::new)
                .collect()
        };
        inserted.sort_unstable();

        // The audience only changes when something was inserted.
        let updated_at = if inserted.is_empty() {
            match audience::get_audience_row(&mut tx, id).await? {
                Some(row) => row.updated_at,
                None => bail!(
                    ErrorKind::AudienceNotFound,
                    "Audience not found",
                    format!("audience {audience_id} does not exist")
                ),
            }
        } else {
            let last_inserted = inserted.last().map(|id| id.into_inner());
            audience::mark_audience_changed(
                &mut tx,
                id,
                ChangeStatus::Updated.as_str(),
                last_inserted,
            )
            .await?
        };
        let member_count = audience::count_members(&mut tx, id).await?;

        tx.commit().await?;

        debug!(
            %audience_id,
            requested = raw_ids.len(),
            inserted = inserted.len(),
            member_count,
            "appended audience members"
        );

        Ok(AppendOutcome {
            inserted,
            member_count: member_count.max(0) as u64,
            updated_at,
        })
    }

    async fn remove_members(
        &self,
        audience_id: AudienceId,
        request_ids: &[RequestId],
        reason: &str,
    ) -> AudienceResult<RemovalOutcome> {
        let id = audience_id.into_inner();
        let raw_ids: Vec<i64> = request_ids.iter().map(|id| id.into_inner()).collect();

        let mut tx = self.pool.begin().await?;
        Self::lock_or_not_found(&mut tx, audience_id).await?;

        let mut removed = if raw_ids.is_empty() {
            Vec::new()
        } else {
            audience::delete_members(&mut tx, id, &raw_ids).await?
        };
        removed.sort_unstable();

        let updated_at = if removed.is_empty() {
            match audience::get_audience_row(&mut tx, id).await? {
                Some(row) => row.updated_at,
                None => bail!(
                    ErrorKind::AudienceNotFound,
                    "Audience not found",
                    format!("audience {audience_id} does not exist")
                ),
            }
        } else {
            audience::insert_member_removals(&mut tx, id, &removed, reason).await?;
            audience::mark_audience_changed(&mut tx, id, ChangeStatus::Pruned.as_str(), None)
                .await?
        };
        let member_count = audience::count_members(&mut tx, id).await?;

        tx.commit().await?;

        Ok(RemovalOutcome {
            removed: removed.into_iter().map(RequestId::new).collect(),
            member_count: member_count.max(0) as u64,
            updated_at,
        })
    }

    async fn claim_pending_change(
        &self,
        audience_id: AudienceId,
        updated_at: DateTime<Utc>,
        lease: Duration,
    ) -> AudienceResult<bool> {
        let claimed = audience::claim_pending_change(
            &self.pool,
            audience_id.into_inner(),
            updated_at,
            lease.as_secs_f64(),
        )
        .await?;

        Ok(claimed)
    }

    async fn settle_pending_change(
        &self,
        audience_id: AudienceId,
        updated_at: DateTime<Utc>,
        published: bool,
    ) -> AudienceResult<bool> {
        let id = audience_id.into_inner();
        let settled = if published {
            audience::clear_pending_change(&self.pool, id, updated_at).await?
        } else {
            audience::release_pending_change(&self.pool, id, updated_at).await?
        };

        Ok(settled)
    }

    async fn delete_audience(&self, audience_id: AudienceId) -> AudienceResult<()> {
        let mut tx = self.pool.begin().await?;
        if !audience::delete_audience(&mut tx, audience_id.into_inner()).await? {
            bail!(
                ErrorKind::AudienceNotFound,
                "Audience not found",
                format!("audience {audience_id} does not exist")
            );
        }
        tx.commit().await?;

        Ok(())
    }
}
