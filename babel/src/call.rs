// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-invocation call contexts.
//!
//! A call context exists for exactly the duration of one cross-language
//! call. It carries the caller's identity, the target, the payload, the
//! cancellation flag and the deadline, plus the correlation identifier
//! that attributes every event the call produces. Nested calls hold a
//! parent pointer and share the root's cancellation flag, so cancelling a
//! call cancels everything beneath it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use babel_shared::ident::Identifier;
use babel_shared::payload::Value;
use babel_shared::IdentityName;

use crate::call_error;
use crate::errors::{CallError, Result};
use crate::policy::AuthResult;

/// Where a nested call came from: the chain of enclosing call contexts,
/// innermost first.
#[derive(Debug, Clone)]
pub struct ParentLink {
    pub language: String,
    pub function: String,
    pub correlation: Identifier,
    pub parent: Option<Box<ParentLink>>,
}

/// Per-invocation record. Construct one per gateway call; drop it on every
/// exit path (the resource grants it holds release themselves).
#[derive(Debug)]
pub struct CallContext {
    /// Opaque identity of the caller, as authenticated at the boundary.
    pub caller: IdentityName,
    /// Target language name.
    pub language: String,
    /// Target function name.
    pub function: String,
    /// Argument payload.
    pub payload: Value,
    /// Requested timeout; fixed into `deadline` at construction.
    pub timeout: Option<Duration>,
    /// Correlation identifier stamped on every event of this call.
    pub correlation: Identifier,
    /// Authentication evidence, when the deployment requires it.
    pub auth: Option<AuthResult>,
    /// Whether the call arrived over a secure channel. In-process callers
    /// are secure by definition; transports set this honestly.
    pub secure_channel: bool,
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
    parent: Option<ParentLink>,
}

impl CallContext {
    pub fn new(
        caller: impl Into<IdentityName>,
        language: impl Into<String>,
        function: impl Into<String>,
        payload: Value,
    ) -> Self {
        CallContext {
            caller: caller.into(),
            language: language.into(),
            function: function.into(),
            payload,
            timeout: None,
            deadline: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            correlation: Identifier::random(),
            auth: None,
            secure_channel: true,
            parent: None,
        }
    }

    /// Attach authentication evidence.
    pub fn with_auth(mut self, auth: AuthResult) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Mark the call as having arrived over a non-secure channel.
    pub fn via_insecure_channel(mut self) -> Self {
        self.secure_channel = false;
        self
    }

    /// Fix the deadline to `now + timeout`. Timeouts are deadlines, not
    /// sleep-then-check: the call fails at the next yield point after the
    /// wall clock passes this instant. On a derived context the inherited
    /// deadline still applies when it is tighter.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        let deadline = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Derive a nested call context. The child gets its own correlation
    /// identifier and target, shares the cancellation flag, and never
    /// outlives the parent's deadline (the tighter deadline wins).
    pub fn child(
        &self,
        language: impl Into<String>,
        function: impl Into<String>,
        payload: Value,
    ) -> CallContext {
        CallContext {
            caller: self.caller.clone(),
            language: language.into(),
            function: function.into(),
            payload,
            timeout: self.timeout,
            deadline: self.deadline,
            cancelled: self.cancelled.clone(),
            correlation: Identifier::random(),
            auth: self.auth.clone(),
            secure_channel: self.secure_channel,
            parent: Some(ParentLink {
                language: self.language.clone(),
                function: self.function.clone(),
                correlation: self.correlation,
                parent: self.parent.clone().map(Box::new),
            }),
        }
    }

    pub fn parent(&self) -> Option<&ParentLink> {
        self.parent.as_ref()
    }

    /// Request cancellation. Observed at the next yield point of this call
    /// and of every nested call sharing the flag.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Yield point: fail with `Cancelled` if the flag is set, `Timeout` if
    /// the deadline has passed. Bridges call this before and after
    /// delegating to host code; adapters call it at transition boundaries.
    pub fn check_yield(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(call_error!(Cancelled; "call {} cancelled", self.correlation).into());
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(CallError::new(
                    babel_shared::error::ErrorCode::Timeout,
                    format!("call {} exceeded its deadline", self.correlation),
                )
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use babel_shared::error::ErrorCode;

    use super::*;

    #[test]
    fn yield_points_observe_cancellation() {
        let ctx = CallContext::new("alice", "py", "echo", Value::Null);
        assert!(ctx.check_yield().is_ok());
        ctx.cancel();
        assert_eq!(ctx.check_yield().unwrap_err().code(), ErrorCode::Cancelled);
    }

    #[test]
    fn deadlines_fail_at_the_next_yield_point() {
        let ctx = CallContext::new("alice", "py", "echo", Value::Null)
            .with_timeout(Duration::from_secs(0));
        assert_eq!(ctx.check_yield().unwrap_err().code(), ErrorCode::Timeout);
    }

    #[test]
    fn children_share_the_cancellation_flag() {
        let root = CallContext::new("alice", "py", "echo", Value::Null);
        let child = root.child("js", "render", Value::Null);
        root.cancel();
        assert!(child.is_cancelled());
        assert_eq!(child.parent().unwrap().correlation, root.correlation);
        assert_ne!(child.correlation, root.correlation);

        let grandchild = child.child("go", "persist", Value::Null);
        let link = grandchild.parent().unwrap();
        assert_eq!(link.language, "js");
        assert_eq!(link.parent.as_ref().unwrap().language, "py");
    }
}
