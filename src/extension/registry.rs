//! Name → constructor map.
//!
//! Built-ins register themselves in [`ExtensionRegistry::with_builtins`]; callers may
//! add their own integrations with [`ExtensionRegistry::register`] before any
//! supervisor is built. The registry is read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use super::{builtin, Extension, ExtensionContext, ExtensionSpec, RegistryError};

pub type Constructor = Arc<
    dyn Fn(&ExtensionSpec, &ExtensionContext) -> Result<Box<dyn Extension>, RegistryError>
        + Send
        + Sync,
>;

#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    // 대소문자 무시 조회
    constructors: HashMap<String, (String, Constructor)>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register (or replace) a constructor under `name`.
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&ExtensionSpec, &ExtensionContext) -> Result<Box<dyn Extension>, RegistryError>
            + Send
            + Sync
            + 'static,
    {
        if self
            .constructors
            .insert(name.to_lowercase(), (name.to_string(), Arc::new(constructor)))
            .is_some()
        {
            tracing::warn!("Extension constructor '{}' replaced", name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(&name.to_lowercase())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.values().map(|(n, _)| n.clone()).collect();
        names.sort();
        names
    }

    /// Build the extension for `spec`, validating base and extension-specific keys.
    pub fn instantiate(
        &self,
        spec: &ExtensionSpec,
        ctx: &ExtensionContext,
    ) -> Result<Box<dyn Extension>, RegistryError> {
        let (_, constructor) = self
            .constructors
            .get(&spec.name.to_lowercase())
            .ok_or_else(|| RegistryError::NotFound(spec.name.clone()))?;
        spec.options.validate_base(&spec.name)?;
        constructor(spec, ctx)
    }
}

/// 같은 (name, scope, owner) 선언이 여러 번이면 나중 것이 앞의 것을 제자리에서 대체.
pub fn dedup_specs(specs: Vec<ExtensionSpec>) -> Vec<ExtensionSpec> {
    let mut out: Vec<ExtensionSpec> = Vec::with_capacity(specs.len());
    for spec in specs {
        let key = spec.key();
        match out.iter_mut().find(|s| s.key() == key) {
            Some(existing) => {
                tracing::warn!("Duplicate extension '{}' replaces earlier declaration", key);
                *existing = spec;
            }
            None => out.push(spec),
        }
    }
    out
}
