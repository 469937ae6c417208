//! Task dispatch / priority queue (C4/C5): enqueue, claim, and a worker
//! loop with a bounded concurrency pool and at-least-once delivery via
//! ack/nack against the Postgres-backed broker.

pub mod broker;
pub mod worker;

pub use broker::Broker;
pub use worker::{HandlerRegistry, TaskHandler, Worker, WorkerConfig};
