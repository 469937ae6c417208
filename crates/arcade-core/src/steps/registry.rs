//! Step registry -- a named collection of available step runners.
//!
//! The pipeline executor looks up runners by the step's `type` string at
//! dispatch time.

use std::collections::HashMap;

use super::trait_def::StepRunner;

#[derive(Default)]
pub struct StepRegistry {
    runners: HashMap<String, Box<dyn StepRunner>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step runner. Stored under the name returned by
    /// [`StepRunner::kind`]. Replaces and returns any runner already
    /// registered under that name.
    pub fn register(&mut self, runner: impl StepRunner + 'static) -> Option<Box<dyn StepRunner>> {
        let kind = runner.kind().to_string();
        self.runners.insert(kind, Box::new(runner))
    }

    pub fn get(&self, kind: &str) -> Option<&dyn StepRunner> {
        self.runners.get(kind).map(|b| b.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.runners.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// A registry pre-populated with all builtin runners.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(super::runners::ShellScriptRunner);
        registry.register(super::runners::ShellCommandRunner);
        registry.register(super::runners::ArtifactsUploadRunner);
        registry.register(super::runners::ArtifactsDownloadRunner);
        registry.register(super::runners::ReportsDotenvRunner);
        registry.register(super::runners::StdoutNotifyRunner);
        registry
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("runners", &self.runners.keys().collect::<Vec<_>>())
            .finish()
    }
}
