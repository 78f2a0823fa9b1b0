//! SQL access to the Postgres audience store.
//!
//! Functions in [`audience`] take a `&mut PgConnection` so callers decide the transaction
//! boundaries. [`migrations`] embeds the schema migrations. With `test-utils`, `test_utils`
//! creates and drops throwaway databases.

pub mod audience;
pub mod migrations;
#[cfg(feature = "test-utils")]
pub mod test_utils;
