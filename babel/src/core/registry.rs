// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Opaque service handle. The registry never owns the underlying storage;
/// the registering component keeps its own `Arc`.
pub type ServiceHandle = Arc<dyn Any + Send + Sync>;

/// String-keyed discovery surface for dynamically registered services.
///
/// The typed fields of the core context are the primary access path; this
/// registry exists for services wired up at runtime (host shims,
/// collectors) that the context cannot know statically.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, ServiceHandle>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under `name`. Idempotent on the name:
    /// re-registration replaces the previous handle.
    pub fn register(&self, name: impl Into<String>, handle: ServiceHandle) {
        self.services.write().unwrap().insert(name.into(), handle);
    }

    pub fn lookup(&self, name: &str) -> Option<ServiceHandle> {
        self.services.read().unwrap().get(name).cloned()
    }

    /// Typed accessor: look up and downcast in one step.
    pub fn lookup_as<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.lookup(name).and_then(|h| h.downcast::<T>().ok())
    }

    pub fn remove(&self, name: &str) -> Option<ServiceHandle> {
        self.services.write().unwrap().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent_on_name() {
        let registry = ServiceRegistry::new();
        registry.register("collector", Arc::new(1u32));
        registry.register("collector", Arc::new(2u32));
        assert_eq!(*registry.lookup_as::<u32>("collector").unwrap(), 2);
        assert_eq!(registry.names(), ["collector"]);
    }

    #[test]
    fn typed_lookup_checks_the_type() {
        let registry = ServiceRegistry::new();
        registry.register("collector", Arc::new(String::from("x")));
        assert!(registry.lookup_as::<u32>("collector").is_none());
        assert!(registry.lookup_as::<String>("collector").is_some());
        assert!(registry.lookup("absent").is_none());
    }
}
