//! Builtin step runners (C13) -- the adapter interface for pipeline step
//! kinds, plus a registry for looking them up by name.
//!
//! Each concrete step kind (shell script, artifact transfer, ...)
//! implements [`StepRunner`]. The trait is object-safe so runners can be
//! stored as `Box<dyn StepRunner>` in [`StepRegistry`].

pub mod registry;
pub mod runners;
pub mod trait_def;
pub mod types;

pub use registry::StepRegistry;
pub use trait_def::StepRunner;
pub use types::{StepContext, StepOutcome};
