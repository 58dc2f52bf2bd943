// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Trace events emitted by the core.
//!
//! The core only emits; sinking is delegated to an external trace
//! collector. Every event carries the identifier that attributes it.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, Severity};
use crate::ident::Identifier;
use crate::topology::Layer;

/// Resource dimension named in threshold events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    Memory,
    Cpu,
    Io,
}

impl UsageKind {
    pub fn name(self) -> &'static str {
        match self {
            UsageKind::Memory => "memory",
            UsageKind::Cpu => "cpu",
            UsageKind::Io => "io",
        }
    }
}

impl std::fmt::Display for UsageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An event that happened inside the core.
///
/// Marked `non_exhaustive` so additional event types can be introduced
/// without breaking collectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TraceEvent {
    BridgeRegistered {
        ident: Identifier,
        language: String,
    },
    CallStart {
        ident: Identifier,
        language: String,
        function: String,
    },
    CallEnd {
        ident: Identifier,
        language: String,
        function: String,
        code: Option<ErrorCode>,
    },
    TopologyEnter {
        ident: Identifier,
        layer: Layer,
    },
    TopologyExit {
        ident: Identifier,
        layer: Layer,
    },
    PolicyDecision {
        ident: Identifier,
        identity: String,
        resource: String,
        action: String,
        allowed: bool,
    },
    ThresholdCrossed {
        ident: Identifier,
        component: String,
        kind: UsageKind,
        current: u64,
        limit: u64,
    },
    ErrorRaised {
        ident: Identifier,
        component: String,
        code: ErrorCode,
        severity: Severity,
    },
}

impl TraceEvent {
    /// The identifier attributing this event.
    pub fn ident(&self) -> Identifier {
        match self {
            TraceEvent::BridgeRegistered { ident, .. }
            | TraceEvent::CallStart { ident, .. }
            | TraceEvent::CallEnd { ident, .. }
            | TraceEvent::TopologyEnter { ident, .. }
            | TraceEvent::TopologyExit { ident, .. }
            | TraceEvent::PolicyDecision { ident, .. }
            | TraceEvent::ThresholdCrossed { ident, .. }
            | TraceEvent::ErrorRaised { ident, .. } => *ident,
        }
    }
}
