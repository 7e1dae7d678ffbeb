//! Step executor contract: named step methods resolved through an explicit
//! registry.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{HostLayout, StepError};

/// Whether a step's effect requires a proxy reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectClass {
    /// Mutates bench/site files only.
    Host,
    /// Changes routing-relevant state; the runner publishes a reload request
    /// after the step succeeds.
    Routing,
}

/// What a step method can see of the job it runs for.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub job_id: &'a str,
    pub resource_id: &'a str,
    pub layout: &'a HostLayout,
}

/// One named operation. Implementations must be safe to re-run: a job
/// re-queued after a worker crash executes every step again.
#[async_trait(?Send)]
pub trait StepMethod {
    fn name(&self) -> &'static str;

    fn effect(&self) -> EffectClass;

    /// Lock key for host-wide state this method read-modify-writes whatever
    /// the job's resource. The runner holds it for the duration of the step.
    fn shared_lock(&self) -> Option<&'static str> {
        None
    }

    /// Apply the step. `Ok` carries optional output for the step record.
    async fn execute(&self, ctx: &StepContext<'_>, args: &Value) -> Result<Option<String>, StepError>;
}

/// Method names compare with `-` and `_` treated alike.
pub fn canonical_method(name: &str) -> String {
    name.trim().replace('-', "_")
}

/// Name → method map.
#[derive(Default)]
pub struct StepRegistry {
    methods: BTreeMap<String, Box<dyn StepMethod>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method, replacing any previous method of the same name.
    pub fn register(&mut self, method: Box<dyn StepMethod>) {
        self.methods.insert(canonical_method(method.name()), method);
    }

    #[must_use]
    pub fn with(mut self, method: impl StepMethod + 'static) -> Self {
        self.register(Box::new(method));
        self
    }

    /// # Errors
    ///
    /// Returns `UnknownMethod` when nothing is registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<&dyn StepMethod, StepError> {
        self.methods
            .get(&canonical_method(name))
            .map(|method| &**method)
            .ok_or_else(|| StepError::UnknownMethod(name.to_string()))
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
