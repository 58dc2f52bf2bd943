// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Zero-trust policy engine.
//!
//! Identities own roles, roles own policies, policies are lists of
//! statements. Evaluation is side-effect free (the decision stream is
//! observability, not state) and follows "deny wins": one matching deny
//! statement anywhere in the identity's role graph denies the request, no
//! matter how many allows also match.

mod auth;
mod identity;
mod secured;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use babel_shared::event::TraceEvent;
use babel_shared::ident::Identifier;
use babel_shared::policy::{Effect, PolicyStatement};

pub use auth::{verify_response, AuthResult, AuthToken, Challenge, CHALLENGE_LEN};
pub use identity::IdentityStore;
pub use secured::Secured;

use crate::call_error;
use crate::errors::Result;
use crate::externs::Externs;

/// The verdict of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

struct Role {
    /// Names of attached policies.
    policies: Vec<String>,
    /// Names of included roles; evaluation walks these with a revisit
    /// guard, so cycles terminate.
    includes: Vec<String>,
}

struct Policy {
    statements: Vec<PolicyStatement>,
}

/// Roles, policies and the evaluator. Identity records live in the
/// embedded [`IdentityStore`].
pub struct PolicyEngine {
    identities: IdentityStore,
    roles: RwLock<HashMap<String, Role>>,
    policies: RwLock<HashMap<String, Policy>>,
    externs: Arc<dyn Externs>,
}

impl PolicyEngine {
    pub fn new(externs: Arc<dyn Externs>) -> Self {
        PolicyEngine {
            identities: IdentityStore::new(),
            roles: RwLock::new(HashMap::new()),
            policies: RwLock::new(HashMap::new()),
            externs,
        }
    }

    pub fn identities(&self) -> &IdentityStore {
        &self.identities
    }

    pub fn add_role(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(call_error!(InvalidParameter; "role name is empty").into());
        }
        let mut roles = self.roles.write().unwrap();
        if roles.contains_key(name) {
            return Err(call_error!(AlreadyRegistered; "role {} already exists", name).into());
        }
        roles.insert(
            name.to_owned(),
            Role {
                policies: Vec::new(),
                includes: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn remove_role(&self, name: &str) -> Result<()> {
        self.roles
            .write()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| call_error!(InvalidParameter; "unknown role {}", name).into())
    }

    pub fn add_policy(&self, name: &str, statements: Vec<PolicyStatement>) -> Result<()> {
        if name.is_empty() {
            return Err(call_error!(InvalidParameter; "policy name is empty").into());
        }
        let mut policies = self.policies.write().unwrap();
        if policies.contains_key(name) {
            return Err(call_error!(AlreadyRegistered; "policy {} already exists", name).into());
        }
        policies.insert(name.to_owned(), Policy { statements });
        Ok(())
    }

    pub fn attach_policy(&self, role: &str, policy: &str) -> Result<()> {
        if !self.policies.read().unwrap().contains_key(policy) {
            return Err(call_error!(InvalidParameter; "unknown policy {}", policy).into());
        }
        let mut roles = self.roles.write().unwrap();
        let entry = roles
            .get_mut(role)
            .ok_or_else(|| call_error!(InvalidParameter; "unknown role {}", role))?;
        if !entry.policies.iter().any(|p| p == policy) {
            entry.policies.push(policy.to_owned());
        }
        Ok(())
    }

    pub fn detach_policy(&self, role: &str, policy: &str) -> Result<()> {
        let mut roles = self.roles.write().unwrap();
        let entry = roles
            .get_mut(role)
            .ok_or_else(|| call_error!(InvalidParameter; "unknown role {}", role))?;
        entry.policies.retain(|p| p != policy);
        Ok(())
    }

    /// Let `role` inherit everything attached to `included`.
    pub fn include_role(&self, role: &str, included: &str) -> Result<()> {
        let mut roles = self.roles.write().unwrap();
        if !roles.contains_key(included) {
            return Err(call_error!(InvalidParameter; "unknown role {}", included).into());
        }
        let entry = roles
            .get_mut(role)
            .ok_or_else(|| call_error!(InvalidParameter; "unknown role {}", role))?;
        if !entry.includes.iter().any(|r| r == included) {
            entry.includes.push(included.to_owned());
        }
        Ok(())
    }

    pub fn assign_role(&self, identity: &str, role: &str) -> Result<()> {
        if !self.roles.read().unwrap().contains_key(role) {
            return Err(call_error!(InvalidParameter; "unknown role {}", role).into());
        }
        self.identities.assign_role(identity, role)
    }

    /// Evaluate `(identity, resource, action)`.
    ///
    /// Unknown and deactivated identities are denied before any statement
    /// is consulted. The walk over included roles carries a visited set,
    /// so cyclic role structures terminate.
    pub fn evaluate(&self, identity: &str, resource: &str, action: &str) -> Decision {
        let decision = self.evaluate_quiet(identity, resource, action);
        self.externs.emit(TraceEvent::PolicyDecision {
            ident: Identifier::random(),
            identity: identity.to_owned(),
            resource: resource.to_owned(),
            action: action.to_owned(),
            allowed: decision == Decision::Allow,
        });
        decision
    }

    fn evaluate_quiet(&self, identity: &str, resource: &str, action: &str) -> Decision {
        if !self.identities.is_active(identity) {
            return Decision::Deny;
        }

        let roles = self.roles.read().unwrap();
        let policies = self.policies.read().unwrap();

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: Vec<String> = self.identities.roles_of(identity);
        let mut allowed = false;

        while let Some(role_name) = queue.pop() {
            if !visited.insert(role_name.clone()) {
                continue;
            }
            let Some(role) = roles.get(&role_name) else {
                // Assigned but since-removed roles contribute nothing.
                continue;
            };
            for policy_name in &role.policies {
                let Some(policy) = policies.get(policy_name) else {
                    continue;
                };
                for statement in &policy.statements {
                    if !statement.matches(resource, action) {
                        continue;
                    }
                    match statement.effect {
                        Effect::Deny => return Decision::Deny,
                        Effect::Allow => allowed = true,
                    }
                }
            }
            queue.extend(role.includes.iter().cloned());
        }

        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }

    /// Evaluate and convert a deny into `AuthorizationDenied`. The message
    /// names the request, never the statements that decided it.
    pub fn authorize(&self, identity: &str, resource: &str, action: &str) -> Result<()> {
        match self.evaluate(identity, resource, action) {
            Decision::Allow => Ok(()),
            Decision::Deny => Err(call_error!(
                AuthorizationDenied;
                "{} may not {} {}", identity, action, resource
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use babel_shared::error::ErrorCode;

    use crate::externs::NoopExterns;

    use super::*;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(Arc::new(NoopExterns))
    }

    fn engine_with_alice() -> PolicyEngine {
        let engine = engine();
        engine
            .identities()
            .register("alice", "pw", Default::default())
            .unwrap();
        engine
    }

    #[test]
    fn deny_wins_over_allow() {
        let engine = engine_with_alice();
        engine.add_role("reader").unwrap();
        engine.add_role("quarantine").unwrap();
        engine
            .add_policy("read-logs", vec![PolicyStatement::allow("resource:logs", "read")])
            .unwrap();
        engine
            .add_policy("quarantined", vec![PolicyStatement::deny("resource:*", "*")])
            .unwrap();
        engine.attach_policy("reader", "read-logs").unwrap();
        engine.attach_policy("quarantine", "quarantined").unwrap();
        engine.assign_role("alice", "reader").unwrap();
        engine.assign_role("alice", "quarantine").unwrap();

        assert_eq!(
            engine.evaluate("alice", "resource:logs", "read"),
            Decision::Deny
        );
    }

    #[test]
    fn default_is_deny() {
        let engine = engine_with_alice();
        assert_eq!(
            engine.evaluate("alice", "resource:logs", "read"),
            Decision::Deny
        );
        assert_eq!(
            engine.evaluate("nobody", "resource:logs", "read"),
            Decision::Deny
        );
    }

    #[test]
    fn allows_apply_when_nothing_denies() {
        let engine = engine_with_alice();
        engine.add_role("reader").unwrap();
        engine
            .add_policy("read-logs", vec![PolicyStatement::allow("resource:logs", "read")])
            .unwrap();
        engine.attach_policy("reader", "read-logs").unwrap();
        engine.assign_role("alice", "reader").unwrap();

        assert_eq!(
            engine.evaluate("alice", "resource:logs", "read"),
            Decision::Allow
        );
        assert_eq!(
            engine.evaluate("alice", "resource:logs", "write"),
            Decision::Deny
        );
    }

    #[test]
    fn deactivated_identities_are_denied() {
        let engine = engine_with_alice();
        engine.add_role("reader").unwrap();
        engine
            .add_policy("read-logs", vec![PolicyStatement::allow("resource:logs", "read")])
            .unwrap();
        engine.attach_policy("reader", "read-logs").unwrap();
        engine.assign_role("alice", "reader").unwrap();
        engine.identities().deactivate("alice").unwrap();

        assert_eq!(
            engine.evaluate("alice", "resource:logs", "read"),
            Decision::Deny
        );
    }

    #[test]
    fn cyclic_role_inclusion_terminates() {
        let engine = engine_with_alice();
        engine.add_role("a").unwrap();
        engine.add_role("b").unwrap();
        engine.include_role("a", "b").unwrap();
        engine.include_role("b", "a").unwrap();
        engine
            .add_policy("read-logs", vec![PolicyStatement::allow("resource:logs", "read")])
            .unwrap();
        engine.attach_policy("b", "read-logs").unwrap();
        engine.assign_role("alice", "a").unwrap();

        // Terminates, and the included role's allow is honored.
        assert_eq!(
            engine.evaluate("alice", "resource:logs", "read"),
            Decision::Allow
        );
    }

    #[test]
    fn detach_removes_grants() {
        let engine = engine_with_alice();
        engine.add_role("reader").unwrap();
        engine
            .add_policy("read-logs", vec![PolicyStatement::allow("resource:logs", "read")])
            .unwrap();
        engine.attach_policy("reader", "read-logs").unwrap();
        engine.assign_role("alice", "reader").unwrap();
        engine.detach_policy("reader", "read-logs").unwrap();

        assert_eq!(
            engine.evaluate("alice", "resource:logs", "read"),
            Decision::Deny
        );
    }

    #[test]
    fn authorize_does_not_leak_statements() {
        let engine = engine_with_alice();
        let err = engine
            .authorize("alice", "resource:logs", "read")
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthorizationDenied);
        assert!(!err.message().contains("deny"));
        assert!(!err.message().contains("statement"));
    }
}
