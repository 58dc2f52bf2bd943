// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The three host adapters.
//!
//! Host embeddings are out of scope, so each adapter models its host's
//! threading contract with process-local state: the interpreter lock is a
//! real reentrant ticket lock, the event-loop host keeps a handle-scope
//! depth and an async wake counter, and the green-thread host pins itself
//! to the thread that initialized it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use babel_shared::topology::Layer;
use lazy_static::lazy_static;

use crate::call_error;
use crate::errors::Result;

use super::{Adapter, ThreadKey, TopologyManager};

/// Process-wide stand-in for the interpreter's global lock. Reentrant:
/// the owning thread may acquire again, and must release once per
/// acquisition.
pub(crate) struct InterpreterLock {
    state: Mutex<LockState>,
    condv: Condvar,
}

#[derive(Default)]
struct LockState {
    owner: Option<ThreadKey>,
    depth: u32,
}

impl InterpreterLock {
    fn new() -> Self {
        InterpreterLock {
            state: Mutex::new(LockState::default()),
            condv: Condvar::new(),
        }
    }

    /// Acquire for `thread`, blocking while another thread holds the lock.
    /// Returns the resulting reentry depth, the ticket `release` consumes.
    fn acquire(&self, thread: ThreadKey) -> u32 {
        let mut state = self
            .condv
            .wait_while(self.state.lock().unwrap(), |s| {
                s.owner.is_some() && s.owner != Some(thread)
            })
            .unwrap();
        state.owner = Some(thread);
        state.depth += 1;
        state.depth
    }

    fn release(&self, thread: ThreadKey) {
        let mut state = self.state.lock().unwrap();
        if state.owner != Some(thread) {
            return;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.condv.notify_one();
        }
    }

    #[cfg(test)]
    fn holder(&self) -> Option<ThreadKey> {
        self.state.lock().unwrap().owner
    }
}

lazy_static! {
    static ref INTERPRETER_LOCK: InterpreterLock = InterpreterLock::new();
}

/// Adapter for the interpreter-lock host. `enter_layer` takes the
/// interpreter lock and stores the resulting ticket; `exit_layer`
/// releases it. Concurrent calls serialize at the lock.
pub struct PythonAdapter {
    initialized: AtomicBool,
    /// Outstanding lock tickets by thread.
    tickets: Mutex<HashMap<ThreadKey, u32>>,
}

impl PythonAdapter {
    pub fn new() -> Self {
        PythonAdapter {
            initialized: AtomicBool::new(false),
            tickets: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for PythonAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Adapter for PythonAdapter {
    fn layer(&self) -> Layer {
        Layer::Python
    }

    fn init(&self, _manager: &TopologyManager) -> Result<()> {
        // Touch the lock so it exists before the first enter.
        lazy_static::initialize(&INTERPRETER_LOCK);
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn enter_layer(&self, thread: ThreadKey, _target: Layer) -> Result<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(call_error!(NotInitialized; "python adapter not initialized").into());
        }
        let ticket = INTERPRETER_LOCK.acquire(thread);
        self.tickets.lock().unwrap().insert(thread, ticket);
        Ok(())
    }

    fn exit_layer(&self, thread: ThreadKey) -> Result<()> {
        // Idempotent: no ticket means the thread already left.
        if self.tickets.lock().unwrap().remove(&thread).is_some() {
            INTERPRETER_LOCK.release(thread);
        }
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return Err(call_error!(NotInitialized; "python adapter cleaned up twice").into());
        }
        let mut tickets = self.tickets.lock().unwrap();
        for (thread, _) in tickets.drain() {
            INTERPRETER_LOCK.release(thread);
        }
        Ok(())
    }
}

/// Adapter for the GC'd green-thread host. Every layer operation must run
/// on the OS thread that ran `init`; a mismatch is a
/// `ThreadAffinityViolation`. The transition itself takes no locks.
pub struct GoAdapter {
    initialized: AtomicBool,
    owner: Mutex<Option<ThreadKey>>,
}

impl GoAdapter {
    pub fn new() -> Self {
        GoAdapter {
            initialized: AtomicBool::new(false),
            owner: Mutex::new(None),
        }
    }

    fn check_affinity(&self, thread: ThreadKey, op: &str) -> Result<()> {
        let owner = *self.owner.lock().unwrap();
        match owner {
            Some(owner) if owner == thread => Ok(()),
            Some(_) => Err(call_error!(
                ThreadAffinityViolation;
                "{} must run on the go adapter's init thread", op
            )
            .into()),
            None => Err(call_error!(NotInitialized; "go adapter not initialized").into()),
        }
    }
}

impl Default for GoAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Adapter for GoAdapter {
    fn layer(&self) -> Layer {
        Layer::Go
    }

    fn init(&self, _manager: &TopologyManager) -> Result<()> {
        // Prime the host's thread-local state: the init thread becomes the
        // callback thread.
        *self.owner.lock().unwrap() = Some(ThreadKey::current());
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn enter_layer(&self, thread: ThreadKey, _target: Layer) -> Result<()> {
        self.check_affinity(thread, "enter_layer")
    }

    fn exit_layer(&self, thread: ThreadKey) -> Result<()> {
        self.check_affinity(thread, "exit_layer")
    }

    fn cleanup(&self) -> Result<()> {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return Err(call_error!(NotInitialized; "go adapter cleaned up twice").into());
        }
        *self.owner.lock().unwrap() = None;
        Ok(())
    }
}

/// Adapter for the single-threaded event-loop host. `enter_layer` opens a
/// handle scope, runs the transition, signals the async wake handle on
/// success and closes the scope on all exit paths. `exit_layer` is a
/// no-op; the loop is cooperative.
pub struct NodeAdapter {
    initialized: AtomicBool,
    scope_depth: Mutex<u32>,
    wake_signals: AtomicU64,
}

impl NodeAdapter {
    pub fn new() -> Self {
        NodeAdapter {
            initialized: AtomicBool::new(false),
            scope_depth: Mutex::new(0),
            wake_signals: AtomicU64::new(0),
        }
    }

    /// Number of times the async wake handle has been signalled.
    pub fn wake_signals(&self) -> u64 {
        self.wake_signals.load(Ordering::Relaxed)
    }
}

impl Default for NodeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Adapter for NodeAdapter {
    fn layer(&self) -> Layer {
        Layer::Node
    }

    fn init(&self, _manager: &TopologyManager) -> Result<()> {
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn enter_layer(&self, _thread: ThreadKey, _target: Layer) -> Result<()> {
        // Open the handle scope; the guard closes it on every exit path.
        let mut depth = self.scope_depth.lock().unwrap();
        *depth += 1;
        drop(depth);
        let _scope = ScopeGuard(&self.scope_depth);

        if !self.initialized.load(Ordering::Acquire) {
            return Err(call_error!(NotInitialized; "node adapter not initialized").into());
        }

        self.wake_signals.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn exit_layer(&self, _thread: ThreadKey) -> Result<()> {
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return Err(call_error!(NotInitialized; "node adapter cleaned up twice").into());
        }
        Ok(())
    }
}

struct ScopeGuard<'a>(&'a Mutex<u32>);

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        let mut depth = self.0.lock().unwrap();
        *depth = depth.saturating_sub(1);
    }
}
