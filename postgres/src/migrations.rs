use sqlx::PgPool;
use sqlx::migrate::{MigrateError, Migrator};
use tracing::info;

/// Audience store schema migrations, embedded at compile time.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Applies all pending audience store migrations.
pub async fn migrate_audience_store(pool: &PgPool) -> Result<(), MigrateError> {
    info!("running audience store migrations");
    MIGRATOR.run(pool).await?;
    info!("audience store migrations applied");

    Ok(())
}
