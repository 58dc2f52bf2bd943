// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use babel_shared::ident::Identifier;
use babel_shared::CallSeq;

use crate::call_error;
use crate::errors::{ExecutionError, Result};

use super::Bridge;

/// A registered bridge plus the registry-side bookkeeping the gateway
/// needs: the attribution identifier minted at registration and the
/// monotonically increasing call counter.
pub struct BridgeEntry {
    bridge: Box<dyn Bridge>,
    registered: Identifier,
    calls: AtomicU64,
}

impl BridgeEntry {
    pub fn bridge(&self) -> &dyn Bridge {
        &*self.bridge
    }

    pub fn registered_ident(&self) -> Identifier {
        self.registered
    }

    /// Bump and return the call sequence number for a new call.
    pub fn next_call(&self) -> CallSeq {
        self.calls.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn call_count(&self) -> CallSeq {
        self.calls.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Inner {
    bridges: HashMap<String, Arc<BridgeEntry>>,
    /// Registration order, for reverse-order cleanup.
    order: Vec<String>,
}

/// Mapping from language name to bridge, bounded by the configured
/// capacity. Lookups take the reader lock only; registration and call
/// never block each other for reads.
pub struct BridgeRegistry {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl BridgeRegistry {
    pub fn new(capacity: usize) -> Self {
        BridgeRegistry {
            capacity,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Register a bridge, initializing it on success. Exactly one bridge
    /// per language; the capacity bound is enforced here, at registration
    /// time.
    pub fn register(&self, bridge: Box<dyn Bridge>) -> Result<Identifier> {
        let language = bridge.language().to_owned();
        if language.is_empty() {
            return Err(call_error!(InvalidParameter; "bridge language name is empty").into());
        }
        if !bridge.capabilities().is_complete() {
            return Err(call_error!(
                InvalidParameter;
                "bridge {} is missing required capabilities", language
            )
            .into());
        }

        // Initialize outside the lock so a slow host init never blocks
        // concurrent lookups, then re-check under the write lock.
        {
            let inner = self.inner.read().unwrap();
            if inner.bridges.contains_key(&language) {
                return Err(call_error!(
                    AlreadyRegistered;
                    "a bridge for {} is already registered", language
                )
                .into());
            }
            if inner.bridges.len() >= self.capacity {
                return Err(call_error!(
                    BridgeLimitExceeded;
                    "bridge registry is at capacity ({})", self.capacity
                )
                .into());
            }
        }

        bridge.init()?;

        let mut inner = self.inner.write().unwrap();
        if inner.bridges.contains_key(&language) {
            let _ = bridge.cleanup();
            return Err(call_error!(
                AlreadyRegistered;
                "a bridge for {} is already registered", language
            )
            .into());
        }
        if inner.bridges.len() >= self.capacity {
            let _ = bridge.cleanup();
            return Err(call_error!(
                BridgeLimitExceeded;
                "bridge registry is at capacity ({})", self.capacity
            )
            .into());
        }

        let ident = Identifier::random();
        inner.bridges.insert(
            language.clone(),
            Arc::new(BridgeEntry {
                bridge,
                registered: ident,
                calls: AtomicU64::new(0),
            }),
        );
        inner.order.push(language.clone());
        log::debug!("registered bridge {}", language);
        Ok(ident)
    }

    pub fn find(&self, language: &str) -> Option<Arc<BridgeEntry>> {
        self.inner.read().unwrap().bridges.get(language).cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().bridges.len()
    }

    pub fn languages(&self) -> Vec<String> {
        self.inner.read().unwrap().order.clone()
    }

    /// Tell every bridge to clean up, in reverse registration order, and
    /// empty the registry. Cleanup errors are collected and returned,
    /// never dropped.
    pub fn cleanup_all(&self) -> Vec<(String, ExecutionError)> {
        let mut inner = self.inner.write().unwrap();
        let mut failures = Vec::new();
        for language in inner.order.drain(..).rev().collect::<Vec<_>>() {
            if let Some(entry) = inner.bridges.remove(&language) {
                if let Err(e) = entry.bridge.cleanup() {
                    log::warn!("bridge {} failed to clean up: {}", language, e);
                    failures.push((language, e));
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use babel_shared::error::ErrorCode;

    use crate::bridge::NativeBridge;

    use super::*;

    fn echo_bridge(language: &str) -> Box<NativeBridge> {
        let bridge = NativeBridge::new(language);
        bridge.export("echo", |payload| Ok(payload.clone()));
        Box::new(bridge)
    }

    #[test]
    fn one_bridge_per_language() {
        let registry = BridgeRegistry::new(4);
        registry.register(echo_bridge("py")).unwrap();
        let err = registry.register(echo_bridge("py")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyRegistered);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn capacity_is_enforced_at_registration() {
        let registry = BridgeRegistry::new(1);
        registry.register(echo_bridge("py")).unwrap();
        let err = registry.register(echo_bridge("js")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BridgeLimitExceeded);
    }

    #[test]
    fn find_returns_the_registered_bridge() {
        let registry = BridgeRegistry::new(4);
        registry.register(echo_bridge("py")).unwrap();
        let entry = registry.find("py").unwrap();
        assert_eq!(entry.bridge().language(), "py");
        assert!(registry.find("rb").is_none());
    }

    #[test]
    fn cleanup_runs_in_reverse_order() {
        use std::sync::Mutex;

        let order = std::sync::Arc::new(Mutex::new(Vec::new()));
        let registry = BridgeRegistry::new(4);
        for language in ["py", "go", "js"] {
            let bridge = NativeBridge::new(language);
            let order = order.clone();
            let name = language.to_owned();
            bridge.on_cleanup(move || {
                order.lock().unwrap().push(name.clone());
                Ok(())
            });
            registry.register(Box::new(bridge)).unwrap();
        }
        let failures = registry.cleanup_all();
        assert!(failures.is_empty());
        assert_eq!(*order.lock().unwrap(), ["js", "go", "py"]);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn call_counter_is_monotonic() {
        let registry = BridgeRegistry::new(4);
        registry.register(echo_bridge("py")).unwrap();
        let entry = registry.find("py").unwrap();
        assert_eq!(entry.next_call(), 1);
        assert_eq!(entry.next_call(), 2);
        assert_eq!(entry.call_count(), 2);
    }
}
