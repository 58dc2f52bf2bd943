// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

// Each scenario file compiles its own view of this harness.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use babel::core::{CoreConfig, CoreContext};
use babel::errors::Result;
use babel::externs::{Clock, Externs, TraceSink};
use babel::topology::{Adapter, ThreadKey, TopologyManager};
use babel::{Gateway, NativeBridge};
use babel_shared::error::ErrorCode;
use babel_shared::event::TraceEvent;
use babel_shared::payload::Value;
use babel_shared::topology::Layer;

/// Externs recording every emitted trace event.
#[derive(Default)]
pub struct RecordingExterns {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingExterns {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().unwrap().clone()
    }
}

/// Local newtype so we can implement the (foreign) `Externs` traits on a
/// shared handle without running afoul of the orphan rules for `Arc<T>`.
#[derive(Clone)]
struct ExternsHandle(Arc<RecordingExterns>);

impl TraceSink for ExternsHandle {
    fn emit(&self, event: TraceEvent) {
        self.0.events.lock().unwrap().push(event);
    }
}

impl Clock for ExternsHandle {}
impl Externs for ExternsHandle {}

/// Shared operation log for scripted adapters.
pub type OpLog = Arc<Mutex<Vec<String>>>;

/// A scripted adapter: records enter/exit calls into a shared log and can
/// be told to fail its next enters with a fixed code.
pub struct ScriptedAdapter {
    layer: Layer,
    log: OpLog,
    fail_enter: Arc<Mutex<Option<ErrorCode>>>,
    initialized: AtomicBool,
}

impl ScriptedAdapter {
    pub fn new(layer: Layer, log: OpLog) -> Self {
        ScriptedAdapter {
            layer,
            log,
            fail_enter: Arc::new(Mutex::new(None)),
            initialized: AtomicBool::new(false),
        }
    }

    /// Handle to flip enter failures on and off after registration.
    pub fn failure_switch(&self) -> Arc<Mutex<Option<ErrorCode>>> {
        self.fail_enter.clone()
    }

    fn record(&self, op: &str) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.layer, op));
    }
}

impl Adapter for ScriptedAdapter {
    fn layer(&self) -> Layer {
        self.layer
    }

    fn init(&self, _manager: &TopologyManager) -> Result<()> {
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn enter_layer(&self, _thread: ThreadKey, _target: Layer) -> Result<()> {
        self.record("enter");
        if let Some(code) = *self.fail_enter.lock().unwrap() {
            return Err(babel::errors::CallError("scripted failure".into(), code).into());
        }
        Ok(())
    }

    fn exit_layer(&self, _thread: ThreadKey) -> Result<()> {
        self.record("exit");
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return Err(
                babel::errors::CallError("double cleanup".into(), ErrorCode::NotInitialized)
                    .into(),
            );
        }
        self.record("cleanup");
        Ok(())
    }
}

pub struct Harness {
    pub ctx: CoreContext,
    pub externs: Arc<RecordingExterns>,
}

/// Build an initialized core with recording externs.
pub fn new_harness(config: CoreConfig) -> Harness {
    let externs = RecordingExterns::new();
    let ctx = CoreContext::new(config, ExternsHandle(externs.clone())).expect("core context");
    ctx.gateway().initialize().expect("gateway init");
    Harness { ctx, externs }
}

/// An echo bridge for `language`, optionally bound to a layer.
pub fn echo_bridge(language: &str, layer: Option<Layer>) -> Box<NativeBridge> {
    let mut bridge = NativeBridge::new(language);
    if let Some(layer) = layer {
        bridge = bridge.with_layer(layer);
    }
    bridge.export("echo", |payload: &Value| Ok(payload.clone()));
    Box::new(bridge)
}
