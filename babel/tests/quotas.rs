// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use babel::core::CoreConfig;
use babel_shared::error::ErrorCode;
use babel_shared::event::{TraceEvent, UsageKind};
use common::new_harness;
use pretty_assertions::assert_eq;

fn bank_config() -> CoreConfig {
    serde_json::from_str(
        r#"{ "resource": { "bank": { "memory_quota": 1024 } } }"#,
    )
    .unwrap()
}

#[test]
fn quota_enforcement_end_to_end() {
    let h = new_harness(bank_config());
    let limiter = h.ctx.resources().limiter("bank");

    let fired = Arc::new(AtomicU64::new(0));
    let seen = Arc::new(Mutex::new(None));
    {
        let fired = fired.clone();
        let seen = seen.clone();
        limiter.on_threshold(UsageKind::Memory, 75, move |event| {
            fired.fetch_add(1, Ordering::SeqCst);
            *seen.lock().unwrap() = Some((event.current, event.limit));
        });
    }

    let grant = limiter.alloc_memory(800).unwrap();
    let err = limiter.alloc_memory(300).unwrap_err();
    assert_eq!(err.code(), ErrorCode::QuotaExceeded);

    assert_eq!(limiter.usage(UsageKind::Memory).peak, 800);
    assert_eq!(limiter.violations(), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(*seen.lock().unwrap(), Some((800, 1024)));

    drop(grant);
    assert_eq!(limiter.usage(UsageKind::Memory).current, 0);
}

#[test]
fn threshold_crossings_are_traced() {
    let h = new_harness(bank_config());
    let limiter = h.ctx.resources().limiter("bank");
    limiter.on_threshold(UsageKind::Memory, 50, |_| {});

    let _grant = limiter.alloc_memory(600).unwrap();
    assert!(h.externs.events().iter().any(|e| matches!(
        e,
        TraceEvent::ThresholdCrossed { component, current: 600, limit: 1024, .. }
            if component == "bank"
    )));
}

#[test]
fn unconfigured_components_are_unlimited() {
    let h = new_harness(bank_config());
    let limiter = h.ctx.resources().limiter("other");
    let _grant = limiter.alloc_memory(10_000_000).unwrap();
    assert_eq!(limiter.violations(), 0);
}

#[test]
fn raising_observer_is_forwarded_to_the_error_journal() {
    let h = new_harness(bank_config());
    let limiter = h.ctx.resources().limiter("bank");
    limiter.on_threshold(UsageKind::Memory, 10, |_| panic!("observer bug"));

    let _grant = limiter.alloc_memory(500).unwrap();

    // The limiter treated the raising callback as a no-op and forwarded
    // the failure to the component's error handling.
    assert_eq!(limiter.usage(UsageKind::Memory).current, 500);
    let journal = h.ctx.errors().drain_journal();
    assert!(journal.iter().any(|entry| entry.component == "bank"));
}
