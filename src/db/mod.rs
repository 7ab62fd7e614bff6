//! Database module for PostgreSQL connection and operations
//!
//! Connection pooling and the pgvector-backed datastore used by the query executor.

pub mod connection;
pub mod pg_datastore;

pub use connection::init_pool;
pub use pg_datastore::PgDatastore;
