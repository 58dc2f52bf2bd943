// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Component metadata: lifecycle state, isolation level, error propagation
//! mode and the security context attached to every named component.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Init,
    Ready,
    Running,
    Stopped,
    /// Terminal until restart; the gateway refuses routing to components in
    /// this state.
    Error,
}

/// How strictly a component is separated from its siblings at runtime.
///
/// Ordered by strictness: `None < Thread < Process < Container`. The core
/// does not implement OS-level isolation; the level is a flag consumed by
/// launchers and sandbox tooling, and by the policy layer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    None,
    Thread,
    Process,
    Container,
}

/// Per-handler choice of where a recorded error travels next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PropagationMode {
    /// Terminate at this component.
    #[default]
    None,
    /// Notify the parent, recursively.
    Upward,
    /// Notify the children, recursively.
    Downward,
    /// Both directions.
    Bidirectional,
}

bitflags! {
    /// Unix-flavored permission bits of a component's security context.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Permissions: u16 {
        const OWNER_READ  = 0o400;
        const OWNER_WRITE = 0o200;
        const OWNER_EXEC  = 0o100;
        const GROUP_READ  = 0o040;
        const GROUP_WRITE = 0o020;
        const GROUP_EXEC  = 0o010;
        const OTHER_READ  = 0o004;
        const OTHER_WRITE = 0o002;
        const OTHER_EXEC  = 0o001;
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions::OWNER_READ | Permissions::OWNER_WRITE | Permissions::GROUP_READ
    }
}

/// Security context attached to a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SecurityContext {
    pub owner: String,
    pub group: String,
    pub permissions: Permissions,
    /// Free-form security label for external sandbox tooling.
    pub label: String,
}
