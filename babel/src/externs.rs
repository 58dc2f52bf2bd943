// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! External collaborator interfaces.
//!
//! The core emits trace events and consults wall-clock time, but storing
//! events and deciding what "now" means belong to the embedder. Implement
//! [`Externs`] and hand it to the core context at construction.

use std::time::SystemTime;

use babel_shared::event::TraceEvent;

/// A sink for trace events. The core only emits; retention, batching and
/// reporting live behind this trait.
pub trait TraceSink {
    /// Sink one event. Must not block for long; the core calls this on the
    /// thread that produced the event.
    fn emit(&self, event: TraceEvent);
}

/// Wall-clock source, split out so tests can pin token expiry.
pub trait Clock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// All APIs the embedder supplies to the core.
pub trait Externs: TraceSink + Clock + Send + Sync + 'static {}

/// Externs that discard every event and use the real clock. The default
/// for embedders that bring their own telemetry pipeline later.
pub struct NoopExterns;

impl TraceSink for NoopExterns {
    fn emit(&self, _event: TraceEvent) {}
}

impl Clock for NoopExterns {}

impl Externs for NoopExterns {}
