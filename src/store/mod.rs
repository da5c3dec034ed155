//! Local analytical store
//!
//! A single SQLite file holding one table per ingested remote table, the
//! staging tables of in-flight ingestions, and a refresh catalog.

mod local;
pub mod schema;

pub use local::*;
