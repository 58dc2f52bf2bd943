// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-component resource quotas.
//!
//! Every component gets a [`ComponentLimiter`] tracking memory, CPU time
//! and I/O units against configured quotas. Usage is tracked
//! monotonically (peaks never go down); quota comparisons happen under the
//! limiter's lock; threshold callbacks run with the lock released, in
//! registration order.

mod timer;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

#[cfg(test)]
use babel_shared::error::ErrorCode;
use babel_shared::event::{TraceEvent, UsageKind};
use babel_shared::ident::Identifier;

pub use timer::{UsageDuration, UsageTimer};

use crate::call_error;
use crate::errors::Result;
use crate::externs::Externs;

/// Namespace for derived threshold-crossing identifiers.
const RESOURCE_NS: &str = "resource";

/// Quotas for one component, in bytes (memory) and arbitrary units (CPU,
/// I/O). `u64::MAX` means unlimited.
#[derive(Debug, Clone, Copy)]
pub struct Quotas {
    pub memory: u64,
    pub cpu: u64,
    pub io: u64,
}

impl Default for Quotas {
    fn default() -> Self {
        Quotas {
            memory: u64::MAX,
            cpu: u64::MAX,
            io: u64::MAX,
        }
    }
}

impl Quotas {
    fn get(&self, kind: UsageKind) -> u64 {
        match kind {
            UsageKind::Memory => self.memory,
            UsageKind::Cpu => self.cpu,
            UsageKind::Io => self.io,
        }
    }
}

/// Snapshot of a limiter's counters, for status reporting and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub current: u64,
    pub peak: u64,
}

/// Payload handed to threshold callbacks.
#[derive(Debug, Clone)]
pub struct ThresholdEvent {
    pub component: String,
    pub kind: UsageKind,
    pub current: u64,
    pub limit: u64,
}

type ThresholdFn = Arc<dyn Fn(&ThresholdEvent) + Send + Sync>;

struct Threshold {
    kind: UsageKind,
    /// Percent of quota at which the callback fires.
    percent: u8,
    /// Fires on the crossing, not on every allocation above it.
    fired: bool,
    callback: ThresholdFn,
}

/// Forwarding hook for callback failures; wired to the error system by the
/// core context.
type ErrorForward = Box<dyn Fn(&str, String) + Send + Sync>;

#[derive(Default)]
struct LimiterInner {
    quotas: Quotas,
    current: [u64; 3],
    peak: [u64; 3],
    violations: u64,
    allocations: u64,
    frees: u64,
    enforcing: bool,
    tracking: bool,
}

fn slot(kind: UsageKind) -> usize {
    match kind {
        UsageKind::Memory => 0,
        UsageKind::Cpu => 1,
        UsageKind::Io => 2,
    }
}

/// Per-component resource limiter.
pub struct ComponentLimiter {
    name: String,
    inner: Mutex<LimiterInner>,
    thresholds: Mutex<Vec<Threshold>>,
    error_forward: RwLock<Option<ErrorForward>>,
    sink: RwLock<Option<Arc<dyn Externs>>>,
    crossings: AtomicU32,
}

impl ComponentLimiter {
    pub fn new(name: impl Into<String>, quotas: Quotas) -> Self {
        ComponentLimiter {
            name: name.into(),
            inner: Mutex::new(LimiterInner {
                quotas,
                enforcing: true,
                tracking: true,
                ..Default::default()
            }),
            thresholds: Mutex::new(Vec::new()),
            error_forward: RwLock::new(None),
            sink: RwLock::new(None),
            crossings: AtomicU32::new(0),
        }
    }

    pub fn component(&self) -> &str {
        &self.name
    }

    /// Toggle quota enforcement. With enforcement off, usage is still
    /// recorded and thresholds still fire, but requests never fail.
    pub fn set_enforcing(&self, on: bool) {
        self.inner.lock().unwrap().enforcing = on;
    }

    /// Toggle usage tracking. With tracking off, requests succeed without
    /// being recorded at all.
    pub fn set_tracking(&self, on: bool) {
        self.inner.lock().unwrap().tracking = on;
    }

    /// Register a callback fired when usage of `kind` crosses `percent` of
    /// its quota. Callbacks run in registration order, with the limiter
    /// lock released.
    pub fn on_threshold(
        &self,
        kind: UsageKind,
        percent: u8,
        callback: impl Fn(&ThresholdEvent) + Send + Sync + 'static,
    ) {
        self.thresholds.lock().unwrap().push(Threshold {
            kind,
            percent,
            fired: false,
            callback: Arc::new(callback),
        });
    }

    pub(crate) fn set_error_forward(&self, forward: ErrorForward) {
        *self.error_forward.write().unwrap() = Some(forward);
    }

    pub(crate) fn set_trace_sink(&self, sink: Arc<dyn Externs>) {
        *self.sink.write().unwrap() = Some(sink);
    }

    pub fn usage(&self, kind: UsageKind) -> UsageSnapshot {
        let inner = self.inner.lock().unwrap();
        UsageSnapshot {
            current: inner.current[slot(kind)],
            peak: inner.peak[slot(kind)],
        }
    }

    pub fn violations(&self) -> u64 {
        self.inner.lock().unwrap().violations
    }

    /// Allocation and free counters, kept separately for leak accounting.
    pub fn allocation_counters(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.allocations, inner.frees)
    }

    /// Account a memory allocation of `size` bytes, returning a grant that
    /// releases the accounting when dropped. Fails with `QuotaExceeded`
    /// when enforcement is on and the quota would be exceeded.
    pub fn alloc_memory(self: &Arc<Self>, size: u64) -> Result<MemoryGrant> {
        self.charge(UsageKind::Memory, size)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.tracking {
            inner.allocations += 1;
        }
        drop(inner);
        Ok(MemoryGrant {
            limiter: self.clone(),
            size,
        })
    }

    /// Charge `units` of CPU time.
    pub fn charge_cpu(&self, units: u64) -> Result<()> {
        self.charge(UsageKind::Cpu, units)
    }

    /// Charge `units` of I/O.
    pub fn charge_io(&self, units: u64) -> Result<()> {
        self.charge(UsageKind::Io, units)
    }

    /// Time a CPU-bound scope; the elapsed microseconds are charged when
    /// the returned timer stops. Late charges never fail, but they count
    /// violations and fire thresholds like any other.
    pub fn time_cpu(&self, duration: &mut UsageDuration) -> CpuScope<'_> {
        CpuScope {
            limiter: self,
            timer: Some(UsageTimer::new(duration)),
        }
    }

    fn charge(&self, kind: UsageKind, amount: u64) -> Result<()> {
        let fired = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.tracking {
                return Ok(());
            }
            let quota = inner.quotas.get(kind);
            let idx = slot(kind);
            let desired = inner.current[idx].saturating_add(amount);
            if desired > quota && inner.enforcing {
                inner.violations += 1;
                drop(inner);
                log::trace!(
                    "{}: {} quota exceeded (requested {})",
                    self.name,
                    kind,
                    amount
                );
                return Err(call_error!(
                    QuotaExceeded;
                    "component {} exceeded its {} quota", self.name, kind
                )
                .into());
            }
            inner.current[idx] = desired;
            if desired > inner.peak[idx] {
                inner.peak[idx] = desired;
            }
            self.crossed_thresholds(kind, desired, quota)
        };
        self.fire(fired);
        Ok(())
    }

    /// Absorb a late (unenforceable) charge, e.g. from a CPU scope.
    fn absorb(&self, kind: UsageKind, amount: u64) {
        let fired = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.tracking {
                return;
            }
            let quota = inner.quotas.get(kind);
            let idx = slot(kind);
            let desired = inner.current[idx].saturating_add(amount);
            if desired > quota && inner.enforcing {
                inner.violations += 1;
            }
            inner.current[idx] = desired;
            if desired > inner.peak[idx] {
                inner.peak[idx] = desired;
            }
            self.crossed_thresholds(kind, desired, quota)
        };
        self.fire(fired);
    }

    fn free_memory(&self, size: u64) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.tracking {
            return;
        }
        let idx = slot(UsageKind::Memory);
        inner.current[idx] = inner.current[idx].saturating_sub(size);
        inner.frees += 1;
    }

    /// Collect the callbacks whose threshold this usage move crosses, in
    /// registration order. Must not invoke them; the caller fires with all
    /// locks released.
    fn crossed_thresholds(
        &self,
        kind: UsageKind,
        current: u64,
        quota: u64,
    ) -> Vec<(ThresholdFn, ThresholdEvent)> {
        if quota == u64::MAX {
            return Vec::new();
        }
        let mut thresholds = self.thresholds.lock().unwrap();
        let mut fired = Vec::new();
        for t in thresholds.iter_mut() {
            if t.kind != kind || t.fired {
                continue;
            }
            let mark = quota / 100 * u64::from(t.percent);
            if current >= mark {
                t.fired = true;
                fired.push((
                    t.callback.clone(),
                    ThresholdEvent {
                        component: self.name.clone(),
                        kind,
                        current,
                        limit: quota,
                    },
                ));
            }
        }
        fired
    }

    fn fire(&self, fired: Vec<(ThresholdFn, ThresholdEvent)>) {
        // A raising callback is a no-op for the limiter; its error goes to
        // the component's error handler.
        for (callback, event) in fired {
            if let Some(sink) = self.sink.read().unwrap().as_ref() {
                let seq = self.crossings.fetch_add(1, Ordering::Relaxed);
                sink.emit(TraceEvent::ThresholdCrossed {
                    ident: Identifier::derive(RESOURCE_NS, slot(event.kind) as u32, seq),
                    component: event.component.clone(),
                    kind: event.kind,
                    current: event.current,
                    limit: event.limit,
                });
            }
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                let msg = panic_message(panic);
                log::warn!("{}: threshold callback raised: {}", self.name, msg);
                if let Some(forward) = self.error_forward.read().unwrap().as_ref() {
                    forward(&self.name, msg);
                }
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// RAII accounting for one memory allocation. Dropping the grant returns
/// the bytes to the component on every exit path, including unwinds.
#[must_use]
#[derive(Debug)]
pub struct MemoryGrant {
    limiter: Arc<ComponentLimiter>,
    size: u64,
}

impl MemoryGrant {
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for MemoryGrant {
    fn drop(&mut self) {
        self.limiter.free_memory(self.size);
    }
}

impl std::fmt::Debug for ComponentLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentLimiter")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A scope charging measured CPU time to a limiter on drop.
pub struct CpuScope<'a> {
    limiter: &'a ComponentLimiter,
    timer: Option<UsageTimer>,
}

impl CpuScope<'_> {
    /// Stop the scope and charge the elapsed microseconds.
    pub fn finish(mut self) -> std::time::Duration {
        self.settle()
    }

    fn settle(&mut self) -> std::time::Duration {
        match self.timer.take() {
            Some(timer) => {
                let elapsed = timer.stop();
                self.limiter
                    .absorb(UsageKind::Cpu, elapsed.as_micros() as u64);
                elapsed
            }
            None => std::time::Duration::ZERO,
        }
    }
}

impl Drop for CpuScope<'_> {
    fn drop(&mut self) {
        self.settle();
    }
}

type SharedErrorForward = Arc<dyn Fn(&str, String) + Send + Sync>;

/// Registry of limiters, one per component, created from configuration.
#[derive(Default)]
pub struct ResourceManager {
    limiters: RwLock<HashMap<String, Arc<ComponentLimiter>>>,
    default_quotas: Quotas,
    forward: RwLock<Option<SharedErrorForward>>,
    trace_sink: RwLock<Option<Arc<dyn Externs>>>,
}

impl ResourceManager {
    pub fn new(default_quotas: Quotas) -> Self {
        ResourceManager {
            limiters: RwLock::new(HashMap::new()),
            default_quotas,
            forward: RwLock::new(None),
            trace_sink: RwLock::new(None),
        }
    }

    /// Route callback failures from every limiter (current and future)
    /// into the given hook. The core context wires this to the error
    /// system.
    pub fn set_error_forward(&self, forward: impl Fn(&str, String) + Send + Sync + 'static) {
        let forward: SharedErrorForward = Arc::new(forward);
        for limiter in self.limiters.read().unwrap().values() {
            let f = forward.clone();
            limiter.set_error_forward(Box::new(move |component, msg| f(component, msg)));
        }
        *self.forward.write().unwrap() = Some(forward);
    }

    /// Emit threshold-crossing trace events from every limiter (current
    /// and future) into the given sink.
    pub fn set_trace_sink(&self, sink: Arc<dyn Externs>) {
        for limiter in self.limiters.read().unwrap().values() {
            limiter.set_trace_sink(sink.clone());
        }
        *self.trace_sink.write().unwrap() = Some(sink);
    }

    fn wire(&self, limiter: &ComponentLimiter) {
        if let Some(forward) = self.forward.read().unwrap().as_ref() {
            let f = forward.clone();
            limiter.set_error_forward(Box::new(move |component, msg| f(component, msg)));
        }
        if let Some(sink) = self.trace_sink.read().unwrap().as_ref() {
            limiter.set_trace_sink(sink.clone());
        }
    }

    /// Install a limiter with explicit quotas, replacing any existing one.
    pub fn configure(&self, component: impl Into<String>, quotas: Quotas) -> Arc<ComponentLimiter> {
        let component = component.into();
        let limiter = Arc::new(ComponentLimiter::new(component.clone(), quotas));
        self.wire(&limiter);
        self.limiters
            .write()
            .unwrap()
            .insert(component, limiter.clone());
        limiter
    }

    /// Fetch the limiter for a component, creating one with the default
    /// quotas on first use.
    pub fn limiter(&self, component: &str) -> Arc<ComponentLimiter> {
        if let Some(limiter) = self.limiters.read().unwrap().get(component) {
            return limiter.clone();
        }
        let limiter = Arc::new(ComponentLimiter::new(component, self.default_quotas));
        self.wire(&limiter);
        self.limiters
            .write()
            .unwrap()
            .entry(component.to_owned())
            .or_insert(limiter)
            .clone()
    }

    pub fn components(&self) -> Vec<String> {
        self.limiters.read().unwrap().keys().cloned().collect()
    }
}
