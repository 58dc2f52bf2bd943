// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::time::{Duration, SystemTime};

use babel_shared::error::ErrorCode;
use babel_shared::policy::{MAX_ROLES, MAX_SCOPES};
use babel_shared::IdentityName;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::call_error;
use crate::errors::Result;

/// Width of challenges, token secrets and responses.
pub const CHALLENGE_LEN: usize = 32;

/// The outcome of an authentication attempt. Scope and role lists are
/// bounded; overflow fails the authentication rather than truncating.
/// Lifetime is bounded by the call context that carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub authenticated: bool,
    pub identity: IdentityName,
    scopes: Vec<String>,
    roles: Vec<String>,
    pub expires: Option<SystemTime>,
    pub error: Option<ErrorCode>,
}

impl AuthResult {
    pub fn success(identity: impl Into<IdentityName>, expires: SystemTime) -> Self {
        AuthResult {
            authenticated: true,
            identity: identity.into(),
            scopes: Vec::new(),
            roles: Vec::new(),
            expires: Some(expires),
            error: None,
        }
    }

    pub fn failure(code: ErrorCode) -> Self {
        AuthResult {
            authenticated: false,
            identity: IdentityName::new(),
            scopes: Vec::new(),
            roles: Vec::new(),
            expires: None,
            error: Some(code),
        }
    }

    pub fn push_scope(&mut self, scope: impl Into<String>) -> Result<()> {
        if self.scopes.len() >= MAX_SCOPES {
            return Err(call_error!(
                TooManyScopes;
                "authentication result holds at most {} scopes", MAX_SCOPES
            )
            .into());
        }
        self.scopes.push(scope.into());
        Ok(())
    }

    pub fn push_role(&mut self, role: impl Into<String>) -> Result<()> {
        if self.roles.len() >= MAX_ROLES {
            return Err(call_error!(
                TooManyRoles;
                "authentication result holds at most {} roles", MAX_ROLES
            )
            .into());
        }
        self.roles.push(role.into());
        Ok(())
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }
}

/// A bearer token minted for one identity. The secret never leaves the
/// process; clients prove possession through challenge responses.
#[derive(Clone)]
pub struct AuthToken {
    pub identity: IdentityName,
    pub expires: SystemTime,
    pub scopes: Vec<String>,
    secret: [u8; CHALLENGE_LEN],
}

impl AuthToken {
    /// Mint a token. The secret comes from the OS entropy source.
    pub fn mint(
        identity: impl Into<IdentityName>,
        scopes: Vec<String>,
        ttl: Duration,
        now: SystemTime,
    ) -> Self {
        let mut secret = [0u8; CHALLENGE_LEN];
        OsRng.fill_bytes(&mut secret);
        AuthToken {
            identity: identity.into(),
            expires: now + ttl,
            scopes,
            secret,
        }
    }

    /// Compute the response binding this token to `challenge`. This is
    /// what a well-behaved client sends back.
    pub fn respond(&self, challenge: &Challenge) -> [u8; CHALLENGE_LEN] {
        keyed_digest(&self.secret, &challenge.nonce)
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The secret stays out of logs.
        f.debug_struct("AuthToken")
            .field("identity", &self.identity)
            .field("expires", &self.expires)
            .finish_non_exhaustive()
    }
}

/// A one-shot random challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Challenge {
    nonce: [u8; CHALLENGE_LEN],
}

impl Challenge {
    /// Issue a fresh challenge from the OS entropy source.
    pub fn issue() -> Self {
        let mut nonce = [0u8; CHALLENGE_LEN];
        OsRng.fill_bytes(&mut nonce);
        Challenge { nonce }
    }
}

/// Verify a challenge response against a presented token.
///
/// The expected response is a BLAKE2b keyed digest of the nonce under the
/// token secret; comparison is constant-time (via `blake2b_simd`'s hash
/// equality). The result's expiry derives from the token.
pub fn verify_response(
    token: &AuthToken,
    challenge: &Challenge,
    response: &[u8],
    now: SystemTime,
) -> AuthResult {
    if now > token.expires {
        return AuthResult::failure(ErrorCode::TokenExpired);
    }

    let expected = blake2b_simd::Params::new()
        .hash_length(CHALLENGE_LEN)
        .key(&token.secret)
        .hash(&challenge.nonce);
    let presented = blake2b_simd::Params::new()
        .hash_length(CHALLENGE_LEN)
        .hash(response);
    let rehashed = blake2b_simd::Params::new()
        .hash_length(CHALLENGE_LEN)
        .hash(expected.as_bytes());
    // Compare digests of digests so the comparison is constant-time even
    // for wrong-length responses.
    if presented != rehashed {
        return AuthResult::failure(ErrorCode::AuthenticationFailed);
    }

    let mut result = AuthResult::success(token.identity.clone(), token.expires);
    for scope in &token.scopes {
        if let Err(e) = result.push_scope(scope.clone()) {
            return AuthResult::failure(e.code());
        }
    }
    result
}

fn keyed_digest(key: &[u8], data: &[u8]) -> [u8; CHALLENGE_LEN] {
    let digest = blake2b_simd::Params::new()
        .hash_length(CHALLENGE_LEN)
        .key(key)
        .hash(data);
    let mut out = [0u8; CHALLENGE_LEN];
    out.copy_from_slice(digest.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn challenge_response_round_trip() {
        let token = AuthToken::mint("alice", vec!["call".into()], Duration::from_secs(60), now());
        let challenge = Challenge::issue();
        let response = token.respond(&challenge);

        let result = verify_response(&token, &challenge, &response, now());
        assert!(result.authenticated);
        assert_eq!(result.identity, "alice");
        assert_eq!(result.expires, Some(token.expires));
        assert_eq!(result.scopes(), ["call".to_owned()]);
    }

    #[test]
    fn wrong_response_fails() {
        let token = AuthToken::mint("alice", vec![], Duration::from_secs(60), now());
        let challenge = Challenge::issue();
        let mut response = token.respond(&challenge);
        response[0] ^= 1;

        let result = verify_response(&token, &challenge, &response, now());
        assert!(!result.authenticated);
        assert_eq!(result.error, Some(ErrorCode::AuthenticationFailed));
    }

    #[test]
    fn responses_do_not_transfer_between_challenges() {
        let token = AuthToken::mint("alice", vec![], Duration::from_secs(60), now());
        let first = Challenge::issue();
        let second = Challenge::issue();
        let response = token.respond(&first);
        assert!(!verify_response(&token, &second, &response, now()).authenticated);
    }

    #[test]
    fn expiry_derives_from_the_token() {
        let token = AuthToken::mint("alice", vec![], Duration::from_secs(60), now());
        let challenge = Challenge::issue();
        let response = token.respond(&challenge);

        let late = now() + Duration::from_secs(120);
        let result = verify_response(&token, &challenge, &response, late);
        assert!(!result.authenticated);
        assert_eq!(result.error, Some(ErrorCode::TokenExpired));
    }

    #[test]
    fn bounded_lists_fail_closed() {
        let mut result = AuthResult::success("alice", now());
        for i in 0..babel_shared::policy::MAX_SCOPES {
            result.push_scope(format!("scope{i}")).unwrap();
        }
        let err = result.push_scope("one-too-many").unwrap_err();
        assert_eq!(err.code(), ErrorCode::TooManyScopes);

        for i in 0..babel_shared::policy::MAX_ROLES {
            result.push_role(format!("role{i}")).unwrap();
        }
        let err = result.push_role("one-too-many").unwrap_err();
        assert_eq!(err.code(), ErrorCode::TooManyRoles);
    }
}
