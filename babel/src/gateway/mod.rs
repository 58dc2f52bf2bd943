// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The FFI gateway: the single entry point for cross-language calls.
//!
//! The gateway routes by target-language name to the registered bridge
//! and never marshals payloads itself. It holds no per-call state; two
//! concurrent calls to different bridges proceed in parallel, and calls
//! to the same bridge follow that bridge's own discipline.

pub mod backtrace;
mod default;

use std::collections::HashSet;

use babel_shared::component::IsolationLevel;
use babel_shared::ident::Identifier;
use babel_shared::payload::Value;
use babel_shared::{CallSeq, Response};
use serde::Deserialize;

pub use backtrace::CallTrace;
pub use default::DefaultGateway;

use crate::bridge::Bridge;
use crate::call::CallContext;
use crate::errors::Result;

/// Gateway section of the configuration tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bridge-registry capacity bound (`bridges.capacity`).
    pub bridge_capacity: usize,
    /// Languages refusing registration (`bridges.<language>.enabled =
    /// false`). Unmentioned languages are accepted.
    pub disabled_languages: HashSet<String>,
    /// Gate every call on a non-empty, verified auth result
    /// (`security.require_auth`).
    pub require_auth: bool,
    /// Reject calls arriving over non-secure channels
    /// (`security.enforce_encryption`).
    pub enforce_encryption: bool,
    /// Isolation level stamped on newly registered language components
    /// (`security.isolation_level`).
    pub default_isolation: IsolationLevel,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            bridge_capacity: 8,
            disabled_languages: HashSet::new(),
            require_auth: false,
            enforce_encryption: false,
            default_isolation: IsolationLevel::None,
        }
    }
}

/// The gateway contract exposed to external callers.
pub trait Gateway: Send + Sync {
    /// Bring the gateway up. Calling twice without an intervening
    /// [`Gateway::cleanup`] fails with `AlreadyInitialized`.
    fn initialize(&self) -> Result<()>;

    /// Register a bridge for its language. Fails with `AlreadyRegistered`
    /// for duplicate languages, `BridgeLimitExceeded` at the capacity
    /// bound, and `InvalidParameter` for empty names, incomplete
    /// capability sets, or languages disabled by configuration.
    fn register_bridge(&self, bridge: Box<dyn Bridge>) -> Result<Identifier>;

    /// Execute a cross-language call, returning the full per-call report.
    fn apply(&self, ctx: CallContext) -> Result<CallReport>;

    /// Execute a cross-language call, returning just the result value.
    fn call(&self, ctx: CallContext) -> Result<Value> {
        let report = self.apply(ctx)?;
        report.into_result()
    }

    /// Number of registered bridges.
    fn bridge_count(&self) -> usize;

    /// Tell every bridge to clean up, in reverse registration order.
    /// Cleanup errors are aggregated into the returned error, never
    /// dropped.
    fn cleanup(&self) -> Result<()>;
}

/// Everything one call produced: the response, attribution, and failure
/// detail for debugging.
#[derive(Debug)]
pub struct CallReport {
    pub response: Response,
    /// The bridge's call sequence number for this call.
    pub call_seq: CallSeq,
    /// Correlation identifier of the call context.
    pub correlation: Identifier,
    /// Populated on failure: the chain of call contexts crossed.
    pub failure_info: Option<CallTrace>,
}

impl CallReport {
    /// Collapse into the plain result surface.
    pub fn into_result(self) -> Result<Value> {
        match self.response.code {
            None => Ok(self.response.return_value.unwrap_or(Value::Null)),
            Some(code) => {
                let message = self
                    .failure_info
                    .as_ref()
                    .and_then(|t| t.cause.as_ref())
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| code.to_string());
                Err(crate::errors::CallError(message, code).into())
            }
        }
    }
}
