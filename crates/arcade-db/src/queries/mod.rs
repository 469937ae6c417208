pub mod agents;
pub mod ledger;
pub mod pipelines;
pub mod queue;
pub mod steps;
