//! Throwaway Postgres audience stores.
//!
//! Every [`StoreDatabase`] lives in its own freshly created database with all store migrations
//! applied, and the database is dropped together with the value. Tests using it need a
//! multi-threaded runtime and a reachable Postgres configured through:
//!
//! - `TESTS_DATABASE_HOST`: Postgres server hostname (required)
//! - `TESTS_DATABASE_PORT`: Postgres server port (required)
//! - `TESTS_DATABASE_USERNAME`: Database user (required)
//! - `TESTS_DATABASE_PASSWORD`: Database password (optional)

use config::shared::{PgConnectionConfig, StoreConfig, TlsConfig};
use postgres::migrations::migrate_audience_store;
use postgres::test_utils::{create_pg_database, drop_pg_database};
use tokio::runtime::Handle;

use crate::store::postgres::PostgresAudienceStore;

fn local_pg_connection_config() -> PgConnectionConfig {
    PgConnectionConfig {
        host: std::env::var("TESTS_DATABASE_HOST").expect("TESTS_DATABASE_HOST must be set"),
        port: std::env::var("TESTS_DATABASE_PORT")
            .expect("TESTS_DATABASE_PORT must be set")
            .parse()
            .expect("TESTS_DATABASE_PORT must be a valid port number"),
        // Unique per test, so tests never see each other's audiences.
        name: format!("audience_test_{:016x}", rand::random::<u64>()),
        username: std::env::var("TESTS_DATABASE_USERNAME")
            .expect("TESTS_DATABASE_USERNAME must be set"),
        password: std::env::var("TESTS_DATABASE_PASSWORD")
            .ok()
            .map(Into::into),
        tls: TlsConfig::disabled(),
    }
}

/// A migrated audience store in a database of its own.
#[derive(Debug)]
pub struct StoreDatabase {
    pub config: StoreConfig,
    pub store: PostgresAudienceStore,
}

impl Drop for StoreDatabase {
    fn drop(&mut self) {
        tokio::task::block_in_place(move || {
            Handle::current()
                .block_on(async move { drop_pg_database(&self.config.connection).await });
        });
    }
}

/// Creates a database with a random name, applies the store migrations and returns a store
/// connected to it.
///
/// # Panics
///
/// Panics if the database cannot be created or migrated.
pub async fn spawn_store_database() -> StoreDatabase {
    let config = StoreConfig {
        connection: local_pg_connection_config(),
        max_connections: StoreConfig::DEFAULT_MAX_CONNECTIONS,
        idle_timeout_secs: StoreConfig::DEFAULT_IDLE_TIMEOUT_SECS,
    };

    let pool = create_pg_database(&config.connection).await;
    migrate_audience_store(&pool)
        .await
        .expect("Failed to run audience store migrations");

    StoreDatabase {
        config,
        store: PostgresAudienceStore::new(pool),
    }
}
