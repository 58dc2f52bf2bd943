// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use babel_shared::caps::BridgeCaps;
use babel_shared::error::Severity;
use babel_shared::event::TraceEvent;
use babel_shared::ident::Identifier;
use babel_shared::Response;

use crate::bridge::{Bridge, BridgeRegistry};
use crate::call::CallContext;
use crate::call_error;
use crate::errors::{ExecutionError, Result};
use crate::errsys::{ErrorEntry, ErrorSystem};
use crate::externs::Externs;
use crate::policy::PolicyEngine;
use crate::resource::{ResourceManager, UsageDuration};
use crate::topology::{ThreadKey, TopologyManager};

use super::backtrace::{Cause, Frame};
use super::{CallReport, CallTrace, Gateway, GatewayConfig};

const STATE_NEW: u8 = 0;
const STATE_READY: u8 = 1;

/// The default [`Gateway`] implementation.
///
/// On `call`: verify the gateway is initialized, gate on the security
/// configuration, find the bridge under a reader lock, position the
/// calling thread in the topology, and delegate. The lookup is wait-free
/// from the caller's perspective; registration and calls never block each
/// other for reads.
pub struct DefaultGateway {
    state: AtomicU8,
    config: GatewayConfig,
    bridges: BridgeRegistry,
    topology: Arc<TopologyManager>,
    policy: Arc<PolicyEngine>,
    resources: Arc<ResourceManager>,
    errsys: Arc<ErrorSystem>,
    externs: Arc<dyn Externs>,
}

impl DefaultGateway {
    pub fn new(
        config: GatewayConfig,
        topology: Arc<TopologyManager>,
        policy: Arc<PolicyEngine>,
        resources: Arc<ResourceManager>,
        errsys: Arc<ErrorSystem>,
        externs: Arc<dyn Externs>,
    ) -> Self {
        let bridges = BridgeRegistry::new(config.bridge_capacity);
        DefaultGateway {
            state: AtomicU8::new(STATE_NEW),
            config,
            bridges,
            topology,
            policy,
            resources,
            errsys,
            externs,
        }
    }

    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    /// Registered languages, in registration order.
    pub fn languages(&self) -> Vec<String> {
        self.bridges.languages()
    }

    fn check_ready(&self) -> Result<()> {
        if self.state.load(Ordering::Acquire) != STATE_READY {
            return Err(call_error!(NotInitialized; "gateway is not initialized").into());
        }
        Ok(())
    }

    /// Security gates that run before any bridge is resolved.
    fn check_security(&self, ctx: &CallContext) -> Result<()> {
        if self.config.enforce_encryption && !ctx.secure_channel {
            return Err(call_error!(
                AuthorizationDenied;
                "calls must arrive over a secure channel"
            )
            .into());
        }

        if self.config.require_auth {
            let auth = ctx
                .auth
                .as_ref()
                .filter(|a| a.authenticated)
                .ok_or_else(|| call_error!(AuthenticationFailed; "call is not authenticated"))?;
            if let Some(expires) = auth.expires {
                if self.externs.now() > expires {
                    return Err(
                        call_error!(TokenExpired; "authentication expired mid-session").into(),
                    );
                }
            }
        }

        // Authorization runs whenever evidence is present, even in
        // deployments that do not require it.
        if let Some(auth) = ctx.auth.as_ref().filter(|a| a.authenticated) {
            let resource = format!("bridge:{}", ctx.language);
            self.policy.authorize(&auth.identity, &resource, "call")?;
        }
        Ok(())
    }

    fn trace_of(&self, ctx: &CallContext, err: &ExecutionError) -> CallTrace {
        let mut trace = CallTrace::default();
        let code = err.code();
        trace.cause = Some(match err {
            ExecutionError::Failure(e) => Cause::Error {
                code,
                message: e.message().to_owned(),
            },
            ExecutionError::Fatal(_) => Cause::Fatal {
                message: err.message(),
            },
        });
        trace.frames.push(Frame {
            language: ctx.language.clone(),
            function: ctx.function.clone(),
            code,
        });
        let mut up = ctx.parent();
        while let Some(link) = up {
            trace.frames.push(Frame {
                language: link.language.clone(),
                function: link.function.clone(),
                code,
            });
            up = link.parent.as_deref();
        }
        trace
    }

    /// Record a failed call in the error system and release the failed
    /// component's adapter if the failure was fatal.
    fn record_failure(&self, ctx: &CallContext, err: &ExecutionError) {
        let severity = if err.is_fatal() {
            Severity::Fatal
        } else {
            Severity::Error
        };
        self.errsys.raise(ErrorEntry::new(
            ctx.language.clone(),
            "gateway",
            err.code(),
            severity,
            err.message(),
        ));
        if err.is_fatal() {
            if let Some(entry) = self.bridges.find(&ctx.language) {
                if let Some(layer) = entry.bridge().layer() {
                    self.topology.release_adapter(layer);
                }
            }
        }
    }
}

impl Gateway for DefaultGateway {
    fn initialize(&self) -> Result<()> {
        match self
            .state
            .compare_exchange(STATE_NEW, STATE_READY, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                log::debug!("gateway initialized");
                Ok(())
            }
            Err(_) => Err(call_error!(AlreadyInitialized; "gateway already initialized").into()),
        }
    }

    fn register_bridge(&self, bridge: Box<dyn Bridge>) -> Result<Identifier> {
        let language = bridge.language().to_owned();
        if self.config.disabled_languages.contains(&language) {
            return Err(call_error!(
                InvalidParameter;
                "registration for {} is disabled by configuration", language
            )
            .into());
        }
        if !self.errsys.is_routable(&language) {
            return Err(call_error!(
                BridgeCallFailed;
                "component {} previously failed; restart required", language
            )
            .into());
        }
        let ident = self.bridges.register(bridge)?;
        // Every language becomes a component under the gateway in the
        // error hierarchy; a duplicate registration after cleanup is fine.
        if self.errsys.state(&language).is_none() {
            if let Err(e) = self.errsys.register_component(
                &language,
                crate::errsys::ROOT_COMPONENT,
                self.config.default_isolation,
            ) {
                log::warn!("could not register component {}: {}", language, e);
            }
        }
        self.externs.emit(TraceEvent::BridgeRegistered {
            ident,
            language,
        });
        Ok(ident)
    }

    fn apply(&self, ctx: CallContext) -> Result<CallReport> {
        self.check_ready()?;
        ctx.check_yield()?;
        self.check_security(&ctx)?;

        if !self.errsys.is_routable(&ctx.language) {
            return Err(call_error!(
                BridgeCallFailed;
                "component {} previously failed; restart required", ctx.language
            )
            .into());
        }

        let entry = self.bridges.find(&ctx.language).ok_or_else(
            || call_error!(UnknownLanguage; "no bridge registered for {}", ctx.language),
        )?;

        // Call-scoped resource accounting. The grant releases on every
        // exit path, so the limiter balances even when the call fails.
        let limiter = self.resources.limiter(&ctx.language);
        let _grant = limiter.alloc_memory(ctx.payload.approx_size())?;
        limiter.charge_io(1)?;

        // Position the calling thread before the bridge runs; the guard
        // un-positions it after.
        let thread = ThreadKey::current();
        let _position = match entry.bridge().layer() {
            Some(target) => {
                if entry.bridge().capabilities().contains(BridgeCaps::VALIDATE_TRANSITION) {
                    if let Some(current) = self.topology.current(thread) {
                        if current != target
                            && entry.bridge().validate_transition(current, target)
                                == Some(false)
                        {
                            return Err(call_error!(
                                AuthorizationDenied;
                                "transition {} -> {} is not permitted", current, target
                            )
                            .into());
                        }
                    }
                }
                Some(self.topology.position_for_call(thread, target, &ctx)?)
            }
            None => None,
        };

        let call_seq = entry.next_call();
        let start = TraceEvent::CallStart {
            ident: ctx.correlation,
            language: ctx.language.clone(),
            function: ctx.function.clone(),
        };
        if entry.bridge().capabilities().contains(BridgeCaps::EMIT_TRACE) {
            entry.bridge().emit_trace(&start);
        }
        self.externs.emit(start);

        let mut cpu = UsageDuration::default();
        let result = {
            let _cpu_scope = limiter.time_cpu(&mut cpu);
            entry.bridge().call(&ctx.function, &ctx.payload, &ctx)
        };
        // Yield point after delegating: a deadline that lapsed inside the
        // host surfaces as Timeout even if the host returned a value.
        let result = result.and_then(|value| ctx.check_yield().map(|()| value));

        let end = TraceEvent::CallEnd {
            ident: ctx.correlation,
            language: ctx.language.clone(),
            function: ctx.function.clone(),
            code: result.as_ref().err().map(|e| e.code()),
        };
        if entry.bridge().capabilities().contains(BridgeCaps::EMIT_TRACE) {
            entry.bridge().emit_trace(&end);
        }
        self.externs.emit(end);

        match result {
            Ok(value) => Ok(CallReport {
                response: Response::ok(Some(value)),
                call_seq,
                correlation: ctx.correlation,
                failure_info: None,
            }),
            Err(err) => {
                self.record_failure(&ctx, &err);
                if err.is_fatal() {
                    return Err(err);
                }
                Ok(CallReport {
                    response: Response::failure(err.code()),
                    call_seq,
                    correlation: ctx.correlation,
                    failure_info: Some(self.trace_of(&ctx, &err)),
                })
            }
        }
    }

    fn bridge_count(&self) -> usize {
        self.bridges.count()
    }

    fn cleanup(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(STATE_READY, STATE_NEW, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(call_error!(NotInitialized; "gateway is not initialized").into());
        }

        let failures = self.bridges.cleanup_all();
        if failures.is_empty() {
            return Ok(());
        }
        for (language, err) in &failures {
            self.errsys.raise(ErrorEntry::new(
                language.clone(),
                "gateway",
                err.code(),
                Severity::Warning,
                err.message(),
            ));
        }
        let summary = failures
            .iter()
            .map(|(language, err)| format!("{language}: {err}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(call_error!(BridgeCallFailed; "cleanup failures: {}", summary).into())
    }
}
