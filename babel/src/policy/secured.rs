// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use babel_shared::payload::Value;

use crate::errors::Result;

use super::PolicyEngine;

/// A callable guarded by the policy engine.
///
/// Wrapping evaluates the policy once, so a caller that was never going
/// to be allowed finds out at wrap time; every invocation re-evaluates,
/// so revoked roles and deactivated identities take effect immediately
/// on live wrappers.
pub struct Secured<F> {
    engine: Arc<PolicyEngine>,
    identity: String,
    resource: String,
    action: String,
    target: F,
}

impl<F> Secured<F>
where
    F: Fn(&Value) -> Result<Value>,
{
    /// Wrap `target`, evaluating `(identity, resource, action)` up front.
    pub fn wrap(
        engine: Arc<PolicyEngine>,
        identity: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
        target: F,
    ) -> Result<Self> {
        let identity = identity.into();
        let resource = resource.into();
        let action = action.into();
        engine.authorize(&identity, &resource, &action)?;
        Ok(Secured {
            engine,
            identity,
            resource,
            action,
            target,
        })
    }

    /// Re-evaluate the policy, then invoke the target.
    pub fn call(&self, payload: &Value) -> Result<Value> {
        self.engine
            .authorize(&self.identity, &self.resource, &self.action)?;
        (self.target)(payload)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

#[cfg(test)]
mod tests {
    use babel_shared::error::ErrorCode;
    use babel_shared::policy::PolicyStatement;

    use crate::externs::NoopExterns;

    use super::*;

    fn engine_allowing(identity: &str, resource: &str, action: &str) -> Arc<PolicyEngine> {
        let engine = Arc::new(PolicyEngine::new(Arc::new(NoopExterns)));
        engine
            .identities()
            .register(identity, "pw", Default::default())
            .unwrap();
        engine.add_role("holder").unwrap();
        engine
            .add_policy("grant", vec![PolicyStatement::allow(resource, action)])
            .unwrap();
        engine.attach_policy("holder", "grant").unwrap();
        engine.assign_role(identity, "holder").unwrap();
        engine
    }

    #[test]
    fn wrap_time_denial_never_builds_the_wrapper() {
        let engine = Arc::new(PolicyEngine::new(Arc::new(NoopExterns)));
        let err = Secured::wrap(engine, "nobody", "vault:keys", "read", |v: &Value| {
            Ok(v.clone())
        })
        .err()
        .expect("wrap must fail");
        assert_eq!(err.code(), ErrorCode::AuthorizationDenied);
    }

    #[test]
    fn revocation_applies_to_live_wrappers() {
        let engine = engine_allowing("alice", "vault:keys", "read");
        let secured = Secured::wrap(
            engine.clone(),
            "alice",
            "vault:keys",
            "read",
            |v: &Value| Ok(v.clone()),
        )
        .unwrap();

        assert_eq!(secured.call(&Value::Int(1)).unwrap(), Value::Int(1));

        engine.identities().deactivate("alice").unwrap();
        let err = secured.call(&Value::Int(1)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthorizationDenied);
    }
}
