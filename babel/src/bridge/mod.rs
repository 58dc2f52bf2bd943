// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Bridges: one per host language.
//!
//! A bridge adapts the gateway's payload values to and from its host
//! language's native types and executes calls against functions the host
//! exports. The gateway never marshals; a bridge that cannot represent a
//! payload variant rejects it with `TypeConversionFailed`.

mod native;
mod registry;

use babel_shared::caps::BridgeCaps;
use babel_shared::event::TraceEvent;
use babel_shared::payload::Value;
use babel_shared::topology::Layer;

pub use native::NativeBridge;
pub use registry::{BridgeEntry, BridgeRegistry};

use crate::call::CallContext;
use crate::errors::Result;

/// One host language's representation inside the gateway.
///
/// `init` and `cleanup` bracket the bridge's lifetime; `call` is the only
/// operation on the hot path. Implementations must check the call
/// context's yield points before and after delegating to host code, so
/// cancellation and deadlines are observed even around long host calls.
pub trait Bridge: Send + Sync + 'static {
    /// Unique language name, e.g. `"py"`.
    fn language(&self) -> &str;

    /// Declared capability set. Must contain [`BridgeCaps::REQUIRED`].
    fn capabilities(&self) -> BridgeCaps;

    /// The topology layer a calling thread must occupy while this bridge
    /// runs, if the host has one.
    fn layer(&self) -> Option<Layer>;

    /// Acquire host-side startup resources.
    fn init(&self) -> Result<()>;

    /// Execute `function` with `payload` under `ctx`.
    fn call(&self, function: &str, payload: &Value, ctx: &CallContext) -> Result<Value>;

    /// Release everything `init` acquired. Called exactly once, during
    /// gateway cleanup or bridge replacement.
    fn cleanup(&self) -> Result<()>;

    /// Per-bridge transition legality override, consulted before the
    /// calling thread is positioned when the capability set contains
    /// `VALIDATE_TRANSITION`. `None` defers to the orchestrator.
    fn validate_transition(&self, _from: Layer, _to: Layer) -> Option<bool> {
        None
    }

    /// Optional sink for bridge-visible trace events. Only consulted when
    /// the capability set contains `EMIT_TRACE`.
    fn emit_trace(&self, _event: &TraceEvent) {}
}
