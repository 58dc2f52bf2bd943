// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use babel_shared::error::ErrorCode;
use babel_shared::event::TraceEvent;
use babel_shared::ident::Identifier;
use babel_shared::topology::{Layer, TransitionMatrix};

use crate::call::CallContext;
use crate::call_error;
use crate::errors::Result;
use crate::externs::Externs;

use super::{Adapter, AdapterHandle, AdapterRegistry, ThreadKey};

/// Namespace for derived transition identifiers.
const TOPOLOGY_NS: &str = "topology";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadPosition {
    In(Layer),
    /// A rollback failed on this thread; refuse everything until restart.
    Corrupt,
}

/// Orchestrates thread movement between topology layers.
///
/// Every transition resolves both adapters under a reader lock, exits the
/// source, then enters the destination. If entering fails, the source is
/// re-entered before the error surfaces; if that restoration fails too,
/// the thread's topology state is marked corrupt and the error is
/// promoted to Fatal.
pub struct TopologyManager {
    adapters: AdapterRegistry,
    matrix: RwLock<TransitionMatrix>,
    positions: Mutex<HashMap<ThreadKey, ThreadPosition>>,
    event_seq: AtomicU32,
    externs: Arc<dyn Externs>,
}

impl TopologyManager {
    pub fn new(matrix: TransitionMatrix, externs: Arc<dyn Externs>) -> Self {
        TopologyManager {
            adapters: AdapterRegistry::new(),
            matrix: RwLock::new(matrix),
            positions: Mutex::new(HashMap::new()),
            event_seq: AtomicU32::new(0),
            externs,
        }
    }

    /// Initialize and install an adapter at its layer.
    pub fn register_adapter(&self, adapter: Box<dyn Adapter>) -> Result<Arc<AdapterHandle>> {
        adapter.init(self)?;
        Ok(self.adapters.register(adapter))
    }

    /// Release the adapter at `layer`, e.g. after its component failed
    /// fatally.
    pub fn release_adapter(&self, layer: Layer) {
        self.adapters.remove(layer);
    }

    pub fn adapter(&self, layer: Layer) -> Option<Arc<AdapterHandle>> {
        self.adapters.get(layer)
    }

    pub fn set_matrix(&self, matrix: TransitionMatrix) {
        *self.matrix.write().unwrap() = matrix;
    }

    pub fn allow_transition(&self, from: Layer, to: Layer) {
        self.matrix.write().unwrap().allow(from, to);
    }

    /// The layer `thread` currently occupies, if any.
    pub fn current(&self, thread: ThreadKey) -> Option<Layer> {
        match self.positions.lock().unwrap().get(&thread) {
            Some(ThreadPosition::In(layer)) => Some(*layer),
            _ => None,
        }
    }

    pub fn is_corrupt(&self, thread: ThreadKey) -> bool {
        matches!(
            self.positions.lock().unwrap().get(&thread),
            Some(ThreadPosition::Corrupt)
        )
    }

    /// Move `thread` from `from` to `to`.
    pub fn orchestrate(
        &self,
        thread: ThreadKey,
        from: Layer,
        to: Layer,
        ctx: Option<&CallContext>,
    ) -> Result<()> {
        if self.is_corrupt(thread) {
            return Err(call_error!(
                TopologyCorrupt;
                "thread topology state is corrupt; restart required"
            )
            .into());
        }

        let source = self
            .adapters
            .get(from)
            .ok_or_else(|| call_error!(UnknownLayer; "no adapter at layer {}", from))?;
        let dest = self
            .adapters
            .get(to)
            .ok_or_else(|| call_error!(UnknownLayer; "no adapter at layer {}", to))?;

        // Per-host overrides replace the matrix for edges they have an
        // opinion on; the source adapter is consulted first.
        let allowed = source
            .adapter()
            .validate_transition(from, to)
            .or_else(|| dest.adapter().validate_transition(from, to))
            .unwrap_or_else(|| self.matrix.read().unwrap().is_allowed(from, to));
        if !allowed {
            return Err(call_error!(
                AuthorizationDenied;
                "transition {} -> {} is not permitted", from, to
            )
            .into());
        }

        if let Some(ctx) = ctx {
            ctx.check_yield()?;
        }

        source.adapter().exit_layer(thread)?;
        self.trace_exit(&source, from);

        // Cancellation observed between exit and enter behaves like an
        // enter failure: restore the source, surface the original error.
        let enter_result = match ctx.map(CallContext::check_yield).unwrap_or(Ok(())) {
            Ok(()) => dest.adapter().enter_layer(thread, to),
            Err(e) => Err(e),
        };

        match enter_result {
            Ok(()) => {
                self.set_position(thread, ThreadPosition::In(to));
                self.trace_enter(&dest, to);
                Ok(())
            }
            Err(original) => match source.adapter().enter_layer(thread, from) {
                Ok(()) => {
                    self.set_position(thread, ThreadPosition::In(from));
                    self.trace_enter(&source, from);
                    Err(original)
                }
                Err(restore_err) => {
                    self.set_position(thread, ThreadPosition::Corrupt);
                    log::error!(
                        "failed to restore layer {} after aborted transition to {}: {}",
                        from,
                        to,
                        restore_err
                    );
                    Err(original.promote(ErrorCode::TopologyCorrupt))
                }
            },
        }
    }

    /// Enter `layer` on a thread that currently occupies none.
    pub fn enter(&self, thread: ThreadKey, layer: Layer, ctx: Option<&CallContext>) -> Result<()> {
        if self.is_corrupt(thread) {
            return Err(call_error!(
                TopologyCorrupt;
                "thread topology state is corrupt; restart required"
            )
            .into());
        }
        let handle = self
            .adapters
            .get(layer)
            .ok_or_else(|| call_error!(UnknownLayer; "no adapter at layer {}", layer))?;
        if let Some(ctx) = ctx {
            ctx.check_yield()?;
        }
        handle.adapter().enter_layer(thread, layer)?;
        self.set_position(thread, ThreadPosition::In(layer));
        self.trace_enter(&handle, layer);
        Ok(())
    }

    /// Exit whatever layer `thread` occupies.
    pub fn exit(&self, thread: ThreadKey) -> Result<()> {
        let Some(layer) = self.current(thread) else {
            return Ok(());
        };
        let handle = self
            .adapters
            .get(layer)
            .ok_or_else(|| call_error!(UnknownLayer; "no adapter at layer {}", layer))?;
        handle.adapter().exit_layer(thread)?;
        self.positions.lock().unwrap().remove(&thread);
        self.trace_exit(&handle, layer);
        Ok(())
    }

    /// Position `thread` for a call into `target`, returning a guard that
    /// restores the previous position when dropped.
    pub fn position_for_call<'a>(
        &'a self,
        thread: ThreadKey,
        target: Layer,
        ctx: &CallContext,
    ) -> Result<PositionGuard<'a>> {
        match self.current(thread) {
            Some(current) if current == target => Ok(PositionGuard {
                manager: self,
                thread,
                restore: Restore::Nothing,
            }),
            Some(current) => {
                self.orchestrate(thread, current, target, Some(ctx))?;
                Ok(PositionGuard {
                    manager: self,
                    thread,
                    restore: Restore::Back {
                        from: target,
                        to: current,
                    },
                })
            }
            None => {
                self.enter(thread, target, Some(ctx))?;
                Ok(PositionGuard {
                    manager: self,
                    thread,
                    restore: Restore::ExitOnly,
                })
            }
        }
    }

    /// Drop every adapter, in reverse layer order. Threads still inside a
    /// layer keep their positions; they will fail with `UnknownLayer` on
    /// next use, which is the honest answer after shutdown.
    pub fn cleanup(&self) {
        self.adapters.clear();
    }

    fn set_position(&self, thread: ThreadKey, position: ThreadPosition) {
        self.positions.lock().unwrap().insert(thread, position);
    }

    fn next_event(&self) -> u32 {
        self.event_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn trace_enter(&self, handle: &AdapterHandle, layer: Layer) {
        let event = TraceEvent::TopologyEnter {
            ident: Identifier::derive(TOPOLOGY_NS, layer as u32, self.next_event()),
            layer,
        };
        handle.adapter().emit_trace(&event);
        self.externs.emit(event);
    }

    fn trace_exit(&self, handle: &AdapterHandle, layer: Layer) {
        let event = TraceEvent::TopologyExit {
            ident: Identifier::derive(TOPOLOGY_NS, layer as u32, self.next_event()),
            layer,
        };
        handle.adapter().emit_trace(&event);
        self.externs.emit(event);
    }
}

enum Restore {
    Nothing,
    ExitOnly,
    Back { from: Layer, to: Layer },
}

/// Scoped positioning for one call. Dropping the guard un-positions the
/// thread on every exit path, including unwinds.
pub struct PositionGuard<'a> {
    manager: &'a TopologyManager,
    thread: ThreadKey,
    restore: Restore,
}

impl Drop for PositionGuard<'_> {
    fn drop(&mut self) {
        let result = match self.restore {
            Restore::Nothing => Ok(()),
            Restore::ExitOnly => self.manager.exit(self.thread),
            Restore::Back { from, to } => {
                self.manager.orchestrate(self.thread, from, to, None)
            }
        };
        if let Err(e) = result {
            log::error!("failed to un-position thread after call: {}", e);
        }
    }
}
