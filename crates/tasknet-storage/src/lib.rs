// PostgreSQL persistence for the workflow engine
//
// Implements the store contract (Store, StoreTx) over a PgPool with
// SERIALIZABLE transactions. Schema bootstrap is embedded; call
// `PgStore::migrate()` once at startup.

mod models;
mod postgres;
mod schema;

pub use postgres::PgStore;
