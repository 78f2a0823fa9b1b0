use chrono::{DateTime, Utc};
use sqlx::prelude::FromRow;
use sqlx::{PgConnection, PgPool};

/// A row from the `audiences` table.
#[derive(Debug, Clone, FromRow)]
pub struct AudienceRow {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Kind of change not announced yet, `updated` or `pruned`.
    pub pending_change: Option<String>,
    pub pending_last_request_id: Option<i64>,
}

/// A row from the `audience_filters` table.
#[derive(Debug, Clone, Default, FromRow)]
pub struct AudienceFilterRow {
    pub creation_date_from: Option<DateTime<Utc>>,
    pub creation_date_to: Option<DateTime<Utc>>,
    pub statuses: Vec<String>,
    pub rejection_reasons: Vec<String>,
    pub non_target_reasons: Vec<String>,
}

/// Returns the ids of every audience, ordered by id.
pub async fn list_audience_ids(pool: &PgPool) -> sqlx::Result<Vec<i64>> {
    sqlx::query_scalar(
        r#"
        select id from audiences order by id
        "#,
    )
    .fetch_all(pool)
    .await
}

pub async fn get_audience_row(
    conn: &mut PgConnection,
    audience_id: i64,
) -> sqlx::Result<Option<AudienceRow>> {
    sqlx::query_as::<_, AudienceRow>(
        r#"
        select id, name, created_at, updated_at, pending_change, pending_last_request_id
        from audiences
        where id = $1
        "#,
    )
    .bind(audience_id)
    .fetch_optional(conn)
    .await
}

/// Returns the filter of an audience, or `None` if the audience has no filter row.
pub async fn get_audience_filter_row(
    conn: &mut PgConnection,
    audience_id: i64,
) -> sqlx::Result<Option<AudienceFilterRow>> {
    sqlx::query_as::<_, AudienceFilterRow>(
        r#"
        select creation_date_from, creation_date_to, statuses, rejection_reasons, non_target_reasons
        from audience_filters
        where audience_id = $1
        "#,
    )
    .bind(audience_id)
    .fetch_optional(conn)
    .await
}

pub async fn get_member_ids(conn: &mut PgConnection, audience_id: i64) -> sqlx::Result<Vec<i64>> {
    sqlx::query_scalar(
        r#"
        select request_id from audience_requests where audience_id = $1
        "#,
    )
    .bind(audience_id)
    .fetch_all(conn)
    .await
}

pub async fn count_members(conn: &mut PgConnection, audience_id: i64) -> sqlx::Result<i64> {
    sqlx::query_scalar(
        r#"
        select count(*) from audience_requests where audience_id = $1
        "#,
    )
    .bind(audience_id)
    .fetch_one(conn)
    .await
}

pub async fn get_integration_names(
    conn: &mut PgConnection,
    audience_id: i64,
) -> sqlx::Result<Vec<String>> {
    sqlx::query_scalar(
        r#"
        select cabinet_name from audience_integrations
        where audience_id = $1
        order by cabinet_name
        "#,
    )
    .bind(audience_id)
    .fetch_all(conn)
    .await
}

/// Locks the audience row until the end of the surrounding transaction.
///
/// Returns `false` if the audience does not exist. Every membership write takes this lock
/// first, which serializes writers of the same audience.
pub async fn lock_audience(conn: &mut PgConnection, audience_id: i64) -> sqlx::Result<bool> {
    let locked: Option<i64> = sqlx::query_scalar(
        r#"
        select id from audiences where id = $1 for update
        "#,
    )
    .bind(audience_id)
    .fetch_optional(conn)
    .await?;

    Ok(locked.is_some())
}

/// Inserts members, skipping ids already present, and returns only the ids inserted.
pub async fn insert_members(
    conn: &mut PgConnection,
    audience_id: i64,
    request_ids: &[i64],
) -> sqlx::Result<Vec<i64>> {
    sqlx::query_scalar(
        r#"
        insert into audience_requests (audience_id, request_id)
        select $1, unnest($2::bigint[])
        on conflict (audience_id, request_id) do nothing
        returning request_id
        "#,
    )
    .bind(audience_id)
    .bind(request_ids)
    .fetch_all(conn)
    .await
}

/// Deletes the given members and returns the ids that were actually present.
pub async fn delete_members(
    conn: &mut PgConnection,
    audience_id: i64,
    request_ids: &[i64],
) -> sqlx::Result<Vec<i64>> {
    sqlx::query_scalar(
        r#"
        delete from audience_requests
        where audience_id = $1 and request_id = any($2::bigint[])
        returning request_id
        "#,
    )
    .bind(audience_id)
    .bind(request_ids)
    .fetch_all(conn)
    .await
}

/// Records one audit row per removed member.
pub async fn insert_member_removals(
    conn: &mut PgConnection,
    audience_id: i64,
    request_ids: &[i64],
    reason: &str,
) -> sqlx::Result<u64> {
    let result = sqlx::query(
        r#"
        insert into audience_member_removals (audience_id, request_id, reason)
        select $1, unnest($2::bigint[]), $3
        "#,
    )
    .bind(audience_id)
    .bind(request_ids)
    .bind(reason)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Advances `updated_at`, records the change as pending and claimed by the caller and returns
/// the new `updated_at`.
///
/// The clock is read after the row lock was taken and `updated_at` strictly increases, so every
/// change of an audience has its own timestamp.
/// Consecutive pending `updated` changes keep the greatest `last_request_id`, any other
/// combination is replaced by the latest change.
pub async fn mark_audience_changed(
    conn: &mut PgConnection,
    audience_id: i64,
    change: &str,
    last_request_id: Option<i64>,
) -> sqlx::Result<DateTime<Utc>> {
    sqlx::query_scalar(
        r#"
        update audiences
        set updated_at = greatest(clock_timestamp(), updated_at + interval '1 microsecond'),
            pending_change = $2,
            pending_last_request_id = case
                when $2 = 'updated' and pending_change = 'updated'
                    then greatest(pending_last_request_id, $3)
                else $3
            end,
            pending_claimed_at = clock_timestamp()
        where id = $1
        returning updated_at
        "#,
    )
    .bind(audience_id)
    .bind(change)
    .bind(last_request_id)
    .fetch_one(conn)
    .await
}

/// Claims the pending change announced at `updated_at` unless another claim is younger than
/// `lease_secs`.
///
/// Returns `false` if the change is gone, was superseded or is claimed.
pub async fn claim_pending_change(
    pool: &PgPool,
    audience_id: i64,
    updated_at: DateTime<Utc>,
    lease_secs: f64,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        update audiences
        set pending_claimed_at = clock_timestamp()
        where id = $1
            and updated_at = $2
            and pending_change is not null
            and (
                pending_claimed_at is null
                or pending_claimed_at < clock_timestamp() - make_interval(secs => $3)
            )
        "#,
    )
    .bind(audience_id)
    .bind(updated_at)
    .bind(lease_secs)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Clears the pending change announced at `updated_at`.
///
/// Does nothing if the audience changed again since.
pub async fn clear_pending_change(
    pool: &PgPool,
    audience_id: i64,
    updated_at: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        update audiences
        set pending_change = null, pending_last_request_id = null, pending_claimed_at = null
        where id = $1 and updated_at = $2 and pending_change is not null
        "#,
    )
    .bind(audience_id)
    .bind(updated_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Releases the claim on the pending change announced at `updated_at`, so the next
/// reconciliation can announce it.
pub async fn release_pending_change(
    pool: &PgPool,
    audience_id: i64,
    updated_at: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        update audiences
        set pending_claimed_at = null
        where id = $1 and updated_at = $2 and pending_change is not null
        "#,
    )
    .bind(audience_id)
    .bind(updated_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Returns the audit rows of removals from an audience as `(request_id, reason)`, oldest first.
pub async fn get_member_removals(
    conn: &mut PgConnection,
    audience_id: i64,
) -> sqlx::Result<Vec<(i64, String)>> {
    sqlx::query_as(
        r#"
        select request_id, reason from audience_member_removals
        where audience_id = $1
        order by id
        "#,
    )
    .bind(audience_id)
    .fetch_all(conn)
    .await
}

/// Deletes an audience together with its filter, members and integrations.
///
/// Returns `false` if the audience did not exist.
pub async fn delete_audience(conn: &mut PgConnection, audience_id: i64) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        delete from audiences where id = $1
        "#,
    )
    .bind(audience_id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Creates an audience with its filter and returns the new id.
pub async fn insert_audience(
    pool: &PgPool,
    name: &str,
    filter: &AudienceFilterRow,
) -> sqlx::Result<i64> {
    let mut tx = pool.begin().await?;

    let audience_id: i64 = sqlx::query_scalar(
        r#"
        insert into audiences (name) values ($1) returning id
        "#,
    )
    .bind(name)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        insert into audience_filters
            (audience_id, creation_date_from, creation_date_to, statuses, rejection_reasons, non_target_reasons)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(audience_id)
    .bind(filter.creation_date_from)
    .bind(filter.creation_date_to)
    .bind(&filter.statuses)
    .bind(&filter.rejection_reasons)
    .bind(&filter.non_target_reasons)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(audience_id)
}

pub async fn insert_integration(
    pool: &PgPool,
    audience_id: i64,
    cabinet_name: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        insert into audience_integrations (audience_id, cabinet_name)
        values ($1, $2)
        on conflict (audience_id, cabinet_name) do nothing
        "#,
    )
    .bind(audience_id)
    .bind(cabinet_name)
    .execute(pool)
    .await?;

    Ok(())
}
