//! The `StepRunner` trait -- the adapter interface for builtin step kinds.
//!
//! Each concrete runner (shell script, artifact transfer, ...) implements
//! this trait. The trait is intentionally object-safe so it can be stored
//! as `Box<dyn StepRunner>` in [`super::StepRegistry`].

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::types::{StepContext, StepOutcome};

/// Adapter interface for executing a single pipeline step.
///
/// Implementors parse `params` (the step's JSON configuration), carry out
/// the action, and report a [`StepOutcome`]. A runner returning `Err`
/// indicates a setup failure (bad params, missing shell); a runtime
/// failure of the underlying command is still `Ok` with
/// `StepOutcome::success == false`.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// The step `type` string this runner handles (e.g. `"shell_script"`).
    fn kind(&self) -> &str;

    /// Execute the step with the given JSON params under `ctx`.
    async fn run(&self, ctx: &StepContext, params: &Value) -> Result<StepOutcome>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn StepRunner) {}
};
