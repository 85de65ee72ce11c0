use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::job::{JobBody, Target};

/// Symbol table mapping persisted target names to executable bodies.
///
/// Used when building the initial roster and when a snapshot is restored.
#[derive(Debug, Clone, Default)]
pub struct Catalogue {
    targets: BTreeMap<String, Target>,
}

impl Catalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `body` under `name`, replacing any previous entry.
    /// Returns the target so callers can build jobs from it directly.
    pub fn register(&mut self, name: impl Into<String>, body: Arc<dyn JobBody>) -> Target {
        let target = Target::new(name, body);
        debug!(target = %target.name(), "job target registered");
        self.targets.insert(target.name().to_string(), target.clone());
        target
    }

    pub fn get(&self, name: &str) -> Option<Target> {
        self.targets.get(name).cloned()
    }

    /// Like [`get`](Self::get) but reports a missing name as an error.
    pub fn resolve(&self, name: &str) -> Result<Target> {
        self.get(name).ok_or_else(|| SchedulerError::UnknownTarget {
            name: name.to_string(),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
