// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Adapters and the topology registry.
//!
//! An adapter is the per-language facade that positions operating-system
//! threads inside its host's runtime region: taking the interpreter lock,
//! opening an event-loop handle scope, or pinning to the green-thread
//! host's callback thread. Exactly one adapter serves each topology
//! layer.

mod hosts;
mod manager;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use babel_shared::event::TraceEvent;
use babel_shared::topology::{Layer, LAYER_COUNT};

pub use hosts::{GoAdapter, NodeAdapter, PythonAdapter};
pub use manager::{PositionGuard, TopologyManager};

use crate::call_error;
use crate::errors::Result;

/// Key identifying an operating-system thread for affinity checks and
/// position tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadKey(std::thread::ThreadId);

impl ThreadKey {
    pub fn current() -> Self {
        ThreadKey(std::thread::current().id())
    }
}

/// Per-language runtime facade, bound to exactly one topology layer.
///
/// `exit_layer` must be idempotent: the orchestrator calls it on error
/// unwind paths where the thread may already be outside the layer.
pub trait Adapter: Send + Sync + 'static {
    /// The layer this adapter serves.
    fn layer(&self) -> Layer;

    /// Bind to the manager and acquire host startup resources.
    fn init(&self, manager: &TopologyManager) -> Result<()>;

    /// Acquire the host tickets `thread` needs inside `target`, then
    /// execute the transition.
    fn enter_layer(&self, thread: ThreadKey, target: Layer) -> Result<()>;

    /// Release tickets acquired by `enter_layer`. Idempotent.
    fn exit_layer(&self, thread: ThreadKey) -> Result<()>;

    /// Per-host legality override. `None` defers to the global transition
    /// matrix.
    fn validate_transition(&self, _from: Layer, _to: Layer) -> Option<bool> {
        None
    }

    /// Optional sink for adapter-visible events.
    fn emit_trace(&self, _event: &TraceEvent) {}

    /// Release everything `init` acquired.
    fn cleanup(&self) -> Result<()>;
}

/// Shared handle around an adapter. Dropping the last handle runs cleanup,
/// which preserves the old reference-counting contract without a
/// hand-written counter. Explicit [`AdapterHandle::cleanup`] calls after
/// the first fail with `NotInitialized`.
pub struct AdapterHandle {
    adapter: Box<dyn Adapter>,
    cleaned: AtomicBool,
}

impl AdapterHandle {
    fn new(adapter: Box<dyn Adapter>) -> Self {
        AdapterHandle {
            adapter,
            cleaned: AtomicBool::new(false),
        }
    }

    pub fn adapter(&self) -> &dyn Adapter {
        &*self.adapter
    }

    pub fn cleanup(&self) -> Result<()> {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return Err(call_error!(
                NotInitialized;
                "adapter for {} cleaned up twice", self.adapter.layer()
            )
            .into());
        }
        self.adapter.cleanup()
    }
}

impl Drop for AdapterHandle {
    fn drop(&mut self) {
        if !self.cleaned.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.adapter.cleanup() {
                log::warn!("adapter for {} failed to clean up: {}", self.adapter.layer(), e);
            }
        }
    }
}

/// Fixed-size adapter table indexed by layer. Reads never block reads;
/// writes happen at initialization and shutdown.
pub(crate) struct AdapterRegistry {
    slots: RwLock<[Option<Arc<AdapterHandle>>; LAYER_COUNT]>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        AdapterRegistry {
            slots: RwLock::new(std::array::from_fn(|_| None)),
        }
    }

    /// Install an adapter at its layer. Replacing releases the previous
    /// occupant's registry reference (cleanup runs once every outstanding
    /// handle is gone).
    pub fn register(&self, adapter: Box<dyn Adapter>) -> Arc<AdapterHandle> {
        let layer = adapter.layer();
        let handle = Arc::new(AdapterHandle::new(adapter));
        let previous = {
            let mut slots = self.slots.write().unwrap();
            slots[layer.index()].replace(handle.clone())
        };
        if previous.is_some() {
            log::debug!("replaced adapter at layer {}", layer);
        }
        handle
    }

    pub fn get(&self, layer: Layer) -> Option<Arc<AdapterHandle>> {
        self.slots.read().unwrap()[layer.index()].clone()
    }

    /// Remove the adapter at `layer`, releasing the registry reference.
    pub fn remove(&self, layer: Layer) -> Option<Arc<AdapterHandle>> {
        self.slots.write().unwrap()[layer.index()].take()
    }

    /// Drop every slot, in reverse layer order.
    pub fn clear(&self) {
        let mut slots = self.slots.write().unwrap();
        for slot in slots.iter_mut().rev() {
            *slot = None;
        }
    }
}
