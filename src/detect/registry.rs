use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ConfigurationError;

use super::backend::DetectorBackend;

type BackendFactory = Arc<dyn Fn() -> Result<Box<dyn DetectorBackend>, ConfigurationError> + Send + Sync>;

/// Registry of detector backend factories.
///
/// Each source gets its own backend instance, so no detector state is shared
/// between processing loops. The first registered backend becomes the default.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend factory under `name`.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn DetectorBackend>, ConfigurationError> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<(), ConfigurationError> {
        if !self.factories.contains_key(name) {
            return Err(ConfigurationError::UnknownBackend(name.to_string()));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// Build a fresh backend instance.
    pub fn create(&self, name: &str) -> Result<Box<dyn DetectorBackend>, ConfigurationError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownBackend(name.to_string()))?;
        factory()
    }

    /// Build an instance of the default backend.
    pub fn create_default(&self) -> Result<Box<dyn DetectorBackend>, ConfigurationError> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| ConfigurationError::UnknownBackend("<default>".to_string()))?;
        self.create(name)
    }

    /// List registered backends, sorted by name.
    pub fn list(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ScriptedBackend;

    #[test]
    fn first_registered_backend_is_default() {
        let mut registry = BackendRegistry::new();
        registry.register("scripted", || Ok(Box::new(ScriptedBackend::empty())));
        registry.register("other", || Ok(Box::new(ScriptedBackend::empty())));

        assert_eq!(registry.default_name(), Some("scripted"));
        assert_eq!(registry.list(), vec!["other".to_string(), "scripted".to_string()]);
        assert_eq!(registry.create_default().unwrap().name(), "scripted");
    }

    #[test]
    fn unknown_backend_is_configuration_error() {
        let mut registry = BackendRegistry::new();
        registry.register("scripted", || Ok(Box::new(ScriptedBackend::empty())));
        assert!(matches!(
            registry.create("missing"),
            Err(ConfigurationError::UnknownBackend(_))
        ));
        assert!(registry.set_default("missing").is_err());
    }
}
