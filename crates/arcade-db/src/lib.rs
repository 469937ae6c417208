//! Postgres persistence layer: connection management, migrations, and typed
//! query modules for the agents table, the task queue, the task-record
//! ledger, and pipeline/job/step definitions.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
