// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt::Formatter;

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ErrorCode is the stable, typed failure code crossing the external
/// surface of the core. The numeric values are part of the public contract:
/// the CLI collaborator maps them one-for-one onto process exit codes, so
/// they must never be renumbered.
///
/// Codes are grouped in bands of 16 by failure kind (precondition,
/// capacity, operational, security, fatal).
#[repr(u32)]
#[derive(
    PartialEq, Eq, Debug, Clone, Copy, Hash, FromPrimitive, Serialize, Deserialize, Error,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // -------Precondition failures-------
    /// A parameter was empty, out of range, or otherwise malformed.
    InvalidParameter = 1,

    /// The operation requires initialization that has not happened (or has
    /// already been undone by cleanup).
    NotInitialized = 2,

    /// Initialization was attempted a second time.
    AlreadyInitialized = 3,

    /// A bridge (or other uniquely named entity) is already registered
    /// under the given name.
    AlreadyRegistered = 4,

    /// No bridge is registered for the requested language.
    UnknownLanguage = 5,

    /// No adapter is registered at the requested topology layer.
    UnknownLayer = 6,

    /// An identifier string matched none of the four accepted renderings.
    InvalidFormat = 7,

    // -------Capacity failures-------
    /// The bridge registry is at its configured capacity bound.
    BridgeLimitExceeded = 16,

    /// A component-scoped resource request exceeded the component's quota.
    QuotaExceeded = 17,

    /// An authentication result carried more scopes than the bounded
    /// capacity admits.
    TooManyScopes = 18,

    /// An authentication result carried more roles than the bounded
    /// capacity admits.
    TooManyRoles = 19,

    // -------Operational failures-------
    /// The target bridge accepted the call but failed while executing it.
    /// The underlying cause is preserved alongside this code.
    BridgeCallFailed = 32,

    /// A bridge rejected a payload variant it cannot represent natively.
    TypeConversionFailed = 33,

    /// An adapter operation ran on a different OS thread than the one that
    /// initialized the adapter, for a host that requires affinity.
    ThreadAffinityViolation = 34,

    /// The call context's cancellation flag was observed at a yield point.
    Cancelled = 35,

    /// The call context's deadline had passed at a yield point.
    Timeout = 36,

    // -------Security failures-------
    /// Credentials or challenge response did not verify.
    AuthenticationFailed = 48,

    /// Policy evaluation denied the request.
    AuthorizationDenied = 49,

    /// The identity exists but has been deactivated.
    IdentityDisabled = 50,

    /// The presented token's expiry has passed.
    TokenExpired = 51,

    // -------Fatal failures-------
    /// A topology rollback failed and the thread's layer state can no
    /// longer be trusted.
    TopologyCorrupt = 64,

    /// An internal invariant was violated. Always a bug.
    InternalInvariantViolated = 65,
}

impl ErrorCode {
    /// Returns true for precondition failures. These are never retried
    /// automatically.
    pub fn is_precondition(self) -> bool {
        (self as u32) < 16
    }

    /// Returns true for capacity failures.
    pub fn is_capacity(self) -> bool {
        (16..32).contains(&(self as u32))
    }

    /// Returns true for operational failures, which are locally returnable
    /// and propagate up the call stack.
    pub fn is_operational(self) -> bool {
        (32..48).contains(&(self as u32))
    }

    /// Returns true for security failures.
    pub fn is_security(self) -> bool {
        (48..64).contains(&(self as u32))
    }

    /// Returns true for fatal failures. Fatal failures cannot be recovered
    /// in place; the affected component transitions to its Error state.
    pub fn is_fatal(self) -> bool {
        (self as u32) >= 64
    }

    /// The process exit code the CLI collaborator reports for this failure.
    /// Success is exit code 0, which no ErrorCode maps to.
    pub fn exit_code(self) -> u32 {
        self as u32
    }

    /// Stable snake_case name for trace events and log lines.
    pub fn name(self) -> &'static str {
        use ErrorCode::*;
        match self {
            InvalidParameter => "invalid_parameter",
            NotInitialized => "not_initialized",
            AlreadyInitialized => "already_initialized",
            AlreadyRegistered => "already_registered",
            UnknownLanguage => "unknown_language",
            UnknownLayer => "unknown_layer",
            InvalidFormat => "invalid_format",
            BridgeLimitExceeded => "bridge_limit_exceeded",
            QuotaExceeded => "quota_exceeded",
            TooManyScopes => "too_many_scopes",
            TooManyRoles => "too_many_roles",
            BridgeCallFailed => "bridge_call_failed",
            TypeConversionFailed => "type_conversion_failed",
            ThreadAffinityViolation => "thread_affinity_violation",
            Cancelled => "cancelled",
            Timeout => "timeout",
            AuthenticationFailed => "authentication_failed",
            AuthorizationDenied => "authorization_denied",
            IdentityDisabled => "identity_disabled",
            TokenExpired => "token_expired",
            TopologyCorrupt => "topology_corrupt",
            InternalInvariantViolated => "internal_invariant_violated",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), *self as u32)
    }
}

/// Severity of a recorded error. The order is total: `Info < Warning <
/// Error < Fatal`, and comparisons on it drive the hierarchical error
/// system's routing decisions.
#[repr(u8)]
#[derive(
    PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash, FromPrimitive, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Not an error; traced only.
    Info = 0,
    /// The operation continues.
    Warning = 1,
    /// The operation aborts; the component remains live.
    Error = 2,
    /// The component cannot recover.
    Fatal = 3,
}

impl Severity {
    pub fn name(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
