use std::collections::HashMap;

use {async_trait::async_trait, serde_json::Value};

use crate::error::PluginError;

/// Builds a handler from the `params` table of a manifest.
pub type Factory<H> = Box<dyn Fn(&Value) -> anyhow::Result<H> + Send + Sync>;

/// A registry that plugins are loaded into.
#[async_trait]
pub trait HandlerSink<H: Send + 'static>: Send + Sync {
    async fn add_handler(&self, handler: H) -> anyhow::Result<()>;
}

/// Compiled-in factories, keyed by the name manifests refer to.
pub struct PluginCatalog<H> {
    factories: HashMap<String, Factory<H>>,
}

impl<H> Default for PluginCatalog<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> PluginCatalog<H> {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory. A later registration under the same name wins.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> anyhow::Result<H> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<H> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the named factory against `params`.
    pub fn build(&self, name: &str, params: &Value) -> Result<H, PluginError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PluginError::UnknownHandler(name.to_string()))?;
        factory(params).map_err(|source| PluginError::Factory {
            name: name.to_string(),
            source,
        })
    }
}
