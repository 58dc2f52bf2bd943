// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use babel_shared::caps::BridgeCaps;
use babel_shared::payload::Value;
use babel_shared::topology::Layer;

use crate::call::CallContext;
use crate::call_error;
use crate::errors::Result;

use super::Bridge;

type NativeFn = Box<dyn Fn(&Value) -> Result<Value> + Send + Sync>;
type NativeCtxFn = Box<dyn Fn(&Value, &CallContext) -> Result<Value> + Send + Sync>;
type CleanupHook = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// A bridge whose host language is Rust itself: exported functions are
/// plain closures. The gateway treats it like any other bridge, which
/// makes it the reference implementation of the [`Bridge`] contract and
/// the workhorse of the test suite.
pub struct NativeBridge {
    language: String,
    layer: Option<Layer>,
    functions: RwLock<HashMap<String, NativeFn>>,
    /// Exports that see the call context, e.g. to derive nested calls.
    ctx_functions: RwLock<HashMap<String, NativeCtxFn>>,
    cleanup_hook: Mutex<Option<CleanupHook>>,
    initialized: AtomicBool,
}

impl NativeBridge {
    pub fn new(language: impl Into<String>) -> Self {
        NativeBridge {
            language: language.into(),
            layer: None,
            functions: RwLock::new(HashMap::new()),
            ctx_functions: RwLock::new(HashMap::new()),
            cleanup_hook: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Bind the bridge to a topology layer; calls will be positioned there
    /// before dispatch.
    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layer = Some(layer);
        self
    }

    /// Export a function under `name`. Re-exporting replaces.
    pub fn export(
        &self,
        name: impl Into<String>,
        f: impl Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    ) {
        self.functions
            .write()
            .unwrap()
            .insert(name.into(), Box::new(f));
    }

    /// Export a function that also receives the call context, typically to
    /// derive nested calls from it. Takes precedence over a plain export
    /// of the same name.
    pub fn export_with_ctx(
        &self,
        name: impl Into<String>,
        f: impl Fn(&Value, &CallContext) -> Result<Value> + Send + Sync + 'static,
    ) {
        self.ctx_functions
            .write()
            .unwrap()
            .insert(name.into(), Box::new(f));
    }

    /// Install a hook observed during cleanup, before the function table
    /// is dropped.
    pub fn on_cleanup(&self, hook: impl Fn() -> Result<()> + Send + Sync + 'static) {
        *self.cleanup_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Reject payload shapes the host cannot represent: foreign-owned
    /// handles and arrays of mixed element kinds.
    fn check_representable(&self, payload: &Value) -> Result<()> {
        match payload {
            Value::Handle(h) if h.owner != self.language => Err(call_error!(
                TypeConversionFailed;
                "handle owned by bridge {} cannot cross into {}", h.owner, self.language
            )
            .into()),
            Value::Array(elements) => {
                if !payload.is_homogeneous() {
                    return Err(call_error!(
                        TypeConversionFailed;
                        "mixed-kind array is not representable in {}", self.language
                    )
                    .into());
                }
                elements.iter().try_for_each(|e| self.check_representable(e))
            }
            _ => Ok(()),
        }
    }
}

impl Bridge for NativeBridge {
    fn language(&self) -> &str {
        &self.language
    }

    fn capabilities(&self) -> BridgeCaps {
        BridgeCaps::REQUIRED | BridgeCaps::EMIT_TRACE
    }

    fn layer(&self) -> Option<Layer> {
        self.layer
    }

    fn init(&self) -> Result<()> {
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn call(&self, function: &str, payload: &Value, ctx: &CallContext) -> Result<Value> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(call_error!(NotInitialized; "bridge {} is not initialized", self.language)
                .into());
        }
        ctx.check_yield()?;
        self.check_representable(payload)?;

        let result = {
            let ctx_functions = self.ctx_functions.read().unwrap();
            if let Some(f) = ctx_functions.get(function) {
                f(payload, ctx)
            } else {
                drop(ctx_functions);
                let functions = self.functions.read().unwrap();
                let f = functions.get(function).ok_or_else(|| {
                    call_error!(
                        BridgeCallFailed;
                        "{} exports no function {:?}", self.language, function
                    )
                })?;
                f(payload)
            }
        };

        ctx.check_yield()?;
        result
    }

    fn cleanup(&self) -> Result<()> {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return Err(call_error!(NotInitialized; "bridge {} cleaned up twice", self.language)
                .into());
        }
        let hook = self.cleanup_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook()?;
        }
        self.functions.write().unwrap().clear();
        self.ctx_functions.write().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use babel_shared::error::ErrorCode;
    use babel_shared::payload::Handle;

    use super::*;

    fn ready(language: &str) -> NativeBridge {
        let bridge = NativeBridge::new(language);
        bridge.init().unwrap();
        bridge
    }

    #[test]
    fn exported_functions_are_callable() {
        let bridge = ready("py");
        bridge.export("double", |v| match v {
            Value::Int(n) => Ok(Value::Int(n * 2)),
            other => Err(call_error!(
                TypeConversionFailed;
                "double wants an int, got {}", other.kind()
            )
            .into()),
        });

        let ctx = CallContext::new("alice", "py", "double", Value::Int(21));
        assert_eq!(
            bridge.call("double", &Value::Int(21), &ctx).unwrap(),
            Value::Int(42)
        );
        let err = bridge.call("missing", &Value::Null, &ctx).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BridgeCallFailed);
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let bridge = ready("py");
        bridge.export("id", |v| Ok(v.clone()));
        let ctx = CallContext::new("alice", "py", "id", Value::Null);

        let foreign = Value::Handle(Handle {
            owner: "js".into(),
            raw: 7,
        });
        let err = bridge.call("id", &foreign, &ctx).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TypeConversionFailed);

        let own = Value::Handle(Handle {
            owner: "py".into(),
            raw: 7,
        });
        assert!(bridge.call("id", &own, &ctx).is_ok());
    }

    #[test]
    fn cancellation_is_observed_before_dispatch() {
        let bridge = ready("py");
        bridge.export("echo", |v| Ok(v.clone()));
        let ctx = CallContext::new("alice", "py", "echo", Value::Null);
        ctx.cancel();
        let err = bridge.call("echo", &Value::Null, &ctx).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }

    #[test]
    fn cleanup_is_once() {
        let bridge = ready("py");
        bridge.cleanup().unwrap();
        let err = bridge.cleanup().unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotInitialized);
    }
}
