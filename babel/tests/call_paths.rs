// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
mod common;

use std::time::Duration;

use babel::call::CallContext;
use babel::core::CoreConfig;
use babel::errors::ExecutionError;
use babel::{Gateway, NativeBridge};
use babel_shared::error::ErrorCode;
use babel_shared::event::{TraceEvent, UsageKind};
use babel_shared::payload::Value;
use common::{echo_bridge, new_harness};
use pretty_assertions::assert_eq;

#[test]
fn register_and_call() {
    let h = new_harness(CoreConfig::default());
    let gateway = h.ctx.gateway();

    gateway.register_bridge(echo_bridge("py", None)).unwrap();
    assert_eq!(gateway.bridge_count(), 1);

    let ctx = CallContext::new("alice", "py", "echo", Value::from("hello"));
    let result = gateway.call(ctx).unwrap();
    assert_eq!(result, Value::from("hello"));

    // The call produced start and end events carrying the same ident.
    let events = h.externs.events();
    let start = events
        .iter()
        .find_map(|e| match e {
            TraceEvent::CallStart { ident, function, .. } if function == "echo" => Some(*ident),
            _ => None,
        })
        .expect("call start traced");
    assert!(events.iter().any(|e| matches!(
        e,
        TraceEvent::CallEnd { ident, code: None, .. } if *ident == start
    )));
}

#[test]
fn unknown_language() {
    let h = new_harness(CoreConfig::default());
    let gateway = h.ctx.gateway();

    let ctx = CallContext::new("alice", "rb", "echo", Value::Null);
    let err = gateway.call(ctx).unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownLanguage);
    assert_eq!(gateway.bridge_count(), 0);
}

#[test]
fn initialize_is_once() {
    let h = new_harness(CoreConfig::default());
    let err = h.ctx.gateway().initialize().unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyInitialized);

    // After cleanup the gateway can come back up.
    h.ctx.gateway().cleanup().unwrap();
    h.ctx.gateway().initialize().unwrap();
}

#[test]
fn calls_require_initialization() {
    let h = new_harness(CoreConfig::default());
    h.ctx.gateway().cleanup().unwrap();
    let err = h
        .ctx
        .gateway()
        .call(CallContext::new("alice", "py", "echo", Value::Null))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotInitialized);
}

#[test]
fn limiter_balances_on_success_and_failure() {
    let h = new_harness(CoreConfig::default());
    let gateway = h.ctx.gateway();
    let bridge = NativeBridge::new("py");
    bridge.export("echo", |v: &Value| Ok(v.clone()));
    bridge.export("boom", |_: &Value| {
        Err(babel::errors::CallError("host raised".into(), ErrorCode::BridgeCallFailed).into())
    });
    gateway.register_bridge(Box::new(bridge)).unwrap();

    let limiter = h.ctx.resources().limiter("py");
    let before = limiter.usage(UsageKind::Memory).current;

    gateway
        .call(CallContext::new("alice", "py", "echo", Value::from("x".repeat(64))))
        .unwrap();
    assert_eq!(limiter.usage(UsageKind::Memory).current, before);

    let err = gateway
        .call(CallContext::new("alice", "py", "boom", Value::from("x".repeat(64))))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BridgeCallFailed);
    assert_eq!(limiter.usage(UsageKind::Memory).current, before);
}

#[test]
fn deadline_is_observed_after_host_delegation() {
    let h = new_harness(CoreConfig::default());
    let gateway = h.ctx.gateway();
    let bridge = NativeBridge::new("py");
    bridge.export("slow", |v: &Value| {
        std::thread::sleep(Duration::from_millis(20));
        Ok(v.clone())
    });
    gateway.register_bridge(Box::new(bridge)).unwrap();

    let ctx = CallContext::new("alice", "py", "slow", Value::Null)
        .with_timeout(Duration::from_millis(5));
    let err = gateway.call(ctx).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);
}

#[test]
fn cancellation_fails_before_dispatch() {
    let h = new_harness(CoreConfig::default());
    let gateway = h.ctx.gateway();
    gateway.register_bridge(echo_bridge("py", None)).unwrap();

    let ctx = CallContext::new("alice", "py", "echo", Value::Null);
    ctx.cancel();
    let err = gateway.call(ctx).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Cancelled);
}

#[test]
fn fatal_failures_poison_the_component() {
    let h = new_harness(CoreConfig::default());
    let gateway = h.ctx.gateway();
    let bridge = NativeBridge::new("py");
    bridge.export("corrupt", |_: &Value| {
        Err(ExecutionError::Fatal(anyhow::anyhow!("host heap corrupt")))
    });
    gateway.register_bridge(Box::new(bridge)).unwrap();

    let err = gateway
        .call(CallContext::new("alice", "py", "corrupt", Value::Null))
        .unwrap_err();
    assert!(err.is_fatal());

    // The gateway refuses further routing until restart.
    let err = gateway
        .call(CallContext::new("alice", "py", "echo", Value::Null))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BridgeCallFailed);
    assert!(!h.ctx.errors().is_routable("py"));
}

#[test]
fn nested_calls_chain_contexts() {
    let h = new_harness(CoreConfig::default());
    let gateway = h.ctx.gateway().clone();

    let outer = NativeBridge::new("py");
    {
        let gateway = gateway.clone();
        outer.export_with_ctx("relay", move |payload: &Value, ctx| {
            let child = ctx.child("js", "echo", payload.clone());
            gateway.call(child)
        });
    }
    gateway.register_bridge(Box::new(outer)).unwrap();
    gateway.register_bridge(echo_bridge("js", None)).unwrap();

    let result = gateway
        .call(CallContext::new("alice", "py", "relay", Value::from("ping")))
        .unwrap();
    assert_eq!(result, Value::from("ping"));

    // A failing derived call reports the chain of contexts it crossed,
    // innermost first.
    let root = CallContext::new("alice", "py", "relay", Value::Null);
    let child = root.child("js", "missing", Value::Null);
    let report = gateway.apply(child).unwrap();
    assert_eq!(report.response.code, Some(ErrorCode::BridgeCallFailed));
    let trace = report.failure_info.expect("failure trace");
    let frames: Vec<(String, String)> = trace
        .frames
        .iter()
        .map(|f| (f.language.clone(), f.function.clone()))
        .collect();
    assert_eq!(
        frames,
        [
            ("js".to_owned(), "missing".to_owned()),
            ("py".to_owned(), "relay".to_owned())
        ]
    );
}

#[test]
fn calls_to_different_bridges_run_in_parallel() {
    use std::sync::{Arc, Barrier};

    let h = new_harness(CoreConfig::default());
    let gateway = h.ctx.gateway().clone();

    let barrier = Arc::new(Barrier::new(2));
    let blocking = NativeBridge::new("py");
    {
        let barrier = barrier.clone();
        blocking.export("wait", move |v: &Value| {
            barrier.wait();
            Ok(v.clone())
        });
    }
    gateway.register_bridge(Box::new(blocking)).unwrap();
    gateway.register_bridge(echo_bridge("js", None)).unwrap();

    let waiter = {
        let gateway = gateway.clone();
        std::thread::spawn(move || {
            gateway.call(CallContext::new("alice", "py", "wait", Value::Null))
        })
    };

    // The js call completes while the py call is still parked inside its
    // bridge; only then is the py call released.
    let result = gateway
        .call(CallContext::new("alice", "js", "echo", Value::from(1i64)))
        .unwrap();
    assert_eq!(result, Value::Int(1));
    barrier.wait();
    waiter.join().unwrap().unwrap();
}

#[test]
fn cleanup_aggregates_failures_in_reverse_order() {
    let h = new_harness(CoreConfig::default());
    let gateway = h.ctx.gateway();

    for language in ["py", "go"] {
        let bridge = NativeBridge::new(language);
        let name = language.to_owned();
        bridge.on_cleanup(move || {
            Err(babel::errors::CallError(
                format!("{name} refused to shut down"),
                ErrorCode::BridgeCallFailed,
            )
            .into())
        });
        gateway.register_bridge(Box::new(bridge)).unwrap();
    }

    let err = gateway.cleanup().unwrap_err();
    assert_eq!(err.code(), ErrorCode::BridgeCallFailed);
    let message = err.message();
    assert!(message.contains("py refused"), "{message}");
    assert!(message.contains("go refused"), "{message}");
    assert_eq!(gateway.bridge_count(), 0);
}

#[test]
fn disabled_languages_refuse_registration() {
    let config: CoreConfig = serde_json::from_str(
        r#"{
            "bridges": {
                "capacity": 4,
                "languages": { "rb": { "enabled": false } }
            }
        }"#,
    )
    .unwrap();
    let h = new_harness(config);

    let err = h
        .ctx
        .gateway()
        .register_bridge(echo_bridge("rb", None))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidParameter);
    h.ctx.gateway().register_bridge(echo_bridge("py", None)).unwrap();
}
