use super::{HookRegistry, Plugin};
use crate::error::PluginError;

/// A plugin that can be toggled in configuration but has no implementation.
///
/// Enabling it fails at startup rather than silently doing nothing.
#[derive(Debug, Clone, Copy)]
pub struct Unsupported {
    name: &'static str,
}

impl Unsupported {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Plugin for Unsupported {
    fn name(&self) -> &'static str {
        self.name
    }

    fn register(&self, _registry: &mut HookRegistry) {}

    fn ensure_supported(&self) -> Result<(), PluginError> {
        Err(PluginError::NotImplemented {
            name: self.name.to_string(),
        })
    }
}
