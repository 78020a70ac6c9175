//! Operation type name to factory mapping

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use skyhost_core::{Error, Result};

use crate::operation::{CreateOperation, Operation, OperationFactory};
use crate::ops;

#[derive(Clone, Default)]
pub struct OperationRegistry {
    factories: HashMap<String, Arc<dyn OperationFactory>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in operation; runtime downloads
    /// install into `binaries`
    pub fn with_defaults(http: reqwest::Client, binaries: &Path) -> Self {
        let mut registry = Self::new();
        for factory in ops::builtin_factories(http, binaries) {
            registry.register(factory);
        }
        registry
    }

    /// Add or replace a factory under its key
    pub fn register(&mut self, factory: Arc<dyn OperationFactory>) {
        self.factories.insert(factory.key().to_lowercase(), factory);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(&kind.to_lowercase())
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn OperationFactory>> {
        self.factories
            .get(&kind.to_lowercase())
            .cloned()
            .ok_or_else(|| Error::MissingFactory(kind.to_string()))
    }

    /// Look up the factory and build the operation
    pub fn create(&self, kind: &str, op: CreateOperation) -> Result<Box<dyn Operation>> {
        let factory = self.get(kind)?;
        factory.create(op).map_err(|e| match e {
            e @ Error::FactoryError { .. } => e,
            e => Error::factory(kind, e),
        })
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry").field("kinds", &self.kinds()).finish()
    }
}
