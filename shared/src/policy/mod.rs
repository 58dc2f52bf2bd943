// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Policy statements and pattern matching.
//!
//! Statements are pure data; the evaluation engine lives in the core
//! crate. Matching is segment-wise over `:`-separated patterns, with `*`
//! as the wildcard segment. Effects follow "deny wins": a matching deny
//! dominates any number of matching allows.

use serde::{Deserialize, Serialize};

/// Bounded capacity of the scope list in an authentication result.
pub const MAX_SCOPES: usize = 16;

/// Bounded capacity of the role list in an authentication result.
pub const MAX_ROLES: usize = 8;

/// Effect of a matching statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
}

/// A single `(resource pattern, action pattern, effect)` triple. Policies
/// are ordered lists of statements; statement order never matters because
/// deny dominates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    pub resource: String,
    pub action: String,
    pub effect: Effect,
}

impl PolicyStatement {
    pub fn allow(resource: impl Into<String>, action: impl Into<String>) -> Self {
        PolicyStatement {
            resource: resource.into(),
            action: action.into(),
            effect: Effect::Allow,
        }
    }

    pub fn deny(resource: impl Into<String>, action: impl Into<String>) -> Self {
        PolicyStatement {
            resource: resource.into(),
            action: action.into(),
            effect: Effect::Deny,
        }
    }

    /// Returns true when this statement applies to the request.
    pub fn matches(&self, resource: &str, action: &str) -> bool {
        pattern_matches(&self.resource, resource) && pattern_matches(&self.action, action)
    }
}

/// Segment-wise wildcard match. `*` matches exactly one segment, except in
/// the trailing position where it matches one or more remaining segments,
/// so `resource:*` covers both `resource:logs` and `resource:logs:archive`.
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    let mut pat = pattern.split(':').peekable();
    let mut val = value.split(':').peekable();

    loop {
        match (pat.next(), val.next()) {
            (None, None) => return true,
            (None, Some(_)) | (Some(_), None) => return false,
            (Some(p), Some(v)) => {
                if p == "*" {
                    if pat.peek().is_none() {
                        // Trailing wildcard swallows the rest.
                        return true;
                    }
                } else if p != v {
                    return false;
                }
            }
        }
    }
}
