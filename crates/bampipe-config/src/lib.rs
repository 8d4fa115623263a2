//! Load-time pipe table.
//!
//! A pipe table is a JSON document listing every pipe the manager owns,
//! plus controller-wide properties. Loading runs in three stages and stops
//! at the first failure, so a manager is never built from a partial table:
//! 1. JSON Schema validation against [`PIPE_TABLE_SCHEMA`]
//! 2. typed deserialization into [`PipeTable`]
//! 3. cross-field checks ([`PipeTable::validate`])

pub mod config;
pub mod error;
pub mod schema;
pub mod table;

pub use config::LoadLimits;
pub use error::{ConfigError, Result};
pub use schema::PIPE_TABLE_SCHEMA;
pub use table::{PipeDescriptor, PipeTable};
