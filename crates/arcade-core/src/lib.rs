//! Control-plane and agent business logic, independent of transport:
//! the DAG engine, retry policy, task queue broker/worker, ledger, agent
//! auth, pipeline compiler/executor, builtin step runners, cron scheduler,
//! metrics, and the process lifecycle supervisor.
//!
//! `arcade-rpc` and the `arcade-server`/`arcade-agent` binaries sit on top
//! of this crate; it has no knowledge of HTTP or the wire format.

pub mod auth;
pub mod cron;
pub mod dag;
pub mod ledger;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod steps;

pub use dag::{Dag, DagError, NodeIndex};
pub use ledger::{Ledger, NullLedger, PgLedger};
pub use retry::{Backoff, Jitter, RetryError, RetryOptions, do_with_retry};
