//! Execution Layer
//!
//! The datastore contract, the guarded executor in front of it, and the result type
//! handed on to answer synthesis.

pub mod datastore;
pub mod error_classifier;
pub mod executor;
pub mod result;

pub use datastore::Datastore;
pub use error_classifier::classify_sqlx_error;
pub use executor::QueryExecutor;
pub use result::{ResultSet, Row};
