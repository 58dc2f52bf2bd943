// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

use crate::call_error;
use crate::errors::Result;

/// One registered identity. Passwords arrive in plaintext at the boundary
/// and are stored only as an Argon2id PHC string (hash, salt and
/// parameters together).
struct IdentityRecord {
    attributes: HashMap<String, String>,
    password: String,
    active: bool,
    roles: HashSet<String>,
}

/// The identity database.
#[derive(Default)]
pub struct IdentityStore {
    identities: RwLock<HashMap<String, IdentityRecord>>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: &str,
        password: &str,
        attributes: HashMap<String, String>,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(call_error!(InvalidParameter; "identity name is empty").into());
        }
        let hashed = hash_password(password)?;
        let mut identities = self.identities.write().unwrap();
        if identities.contains_key(name) {
            return Err(call_error!(AlreadyRegistered; "identity {} already exists", name).into());
        }
        identities.insert(
            name.to_owned(),
            IdentityRecord {
                attributes,
                password: hashed,
                active: true,
                roles: HashSet::new(),
            },
        );
        Ok(())
    }

    pub fn attributes(&self, name: &str) -> Result<HashMap<String, String>> {
        let identities = self.identities.read().unwrap();
        let record = identities
            .get(name)
            .ok_or_else(|| call_error!(InvalidParameter; "unknown identity {}", name))?;
        Ok(record.attributes.clone())
    }

    pub fn update_attributes(&self, name: &str, attributes: HashMap<String, String>) -> Result<()> {
        let mut identities = self.identities.write().unwrap();
        let record = identities
            .get_mut(name)
            .ok_or_else(|| call_error!(InvalidParameter; "unknown identity {}", name))?;
        record.attributes.extend(attributes);
        Ok(())
    }

    /// Change a password, verifying the old one first.
    pub fn change_password(&self, name: &str, old: &str, new: &str) -> Result<()> {
        self.verify_password(name, old)?;
        self.reset_password(name, new)
    }

    /// Administrative reset: no old password required.
    pub fn reset_password(&self, name: &str, new: &str) -> Result<()> {
        let hashed = hash_password(new)?;
        let mut identities = self.identities.write().unwrap();
        let record = identities
            .get_mut(name)
            .ok_or_else(|| call_error!(InvalidParameter; "unknown identity {}", name))?;
        record.password = hashed;
        Ok(())
    }

    pub fn deactivate(&self, name: &str) -> Result<()> {
        self.set_active(name, false)
    }

    pub fn reactivate(&self, name: &str) -> Result<()> {
        self.set_active(name, true)
    }

    fn set_active(&self, name: &str, active: bool) -> Result<()> {
        let mut identities = self.identities.write().unwrap();
        let record = identities
            .get_mut(name)
            .ok_or_else(|| call_error!(InvalidParameter; "unknown identity {}", name))?;
        record.active = active;
        Ok(())
    }

    /// Is the identity known and active? Unknown identities answer false
    /// rather than erroring, for the evaluator's default-deny path.
    pub fn is_active(&self, name: &str) -> bool {
        self.identities
            .read()
            .unwrap()
            .get(name)
            .map(|r| r.active)
            .unwrap_or(false)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.identities.read().unwrap().contains_key(name)
    }

    /// Verify a plaintext password. Unknown identities fail exactly like
    /// wrong passwords, so the error does not confirm existence.
    pub fn verify_password(&self, name: &str, password: &str) -> Result<()> {
        let identities = self.identities.read().unwrap();
        let record = identities
            .get(name)
            .ok_or_else(|| call_error!(AuthenticationFailed; "credentials did not verify"))?;
        if !record.active {
            return Err(call_error!(IdentityDisabled; "identity {} is deactivated", name).into());
        }
        let parsed = PasswordHash::new(&record.password)
            .map_err(|_| call_error!(AuthenticationFailed; "credentials did not verify"))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| call_error!(AuthenticationFailed; "credentials did not verify"))?;
        Ok(())
    }

    pub fn assign_role(&self, name: &str, role: &str) -> Result<()> {
        let mut identities = self.identities.write().unwrap();
        let record = identities
            .get_mut(name)
            .ok_or_else(|| call_error!(InvalidParameter; "unknown identity {}", name))?;
        record.roles.insert(role.to_owned());
        Ok(())
    }

    pub fn unassign_role(&self, name: &str, role: &str) -> Result<()> {
        let mut identities = self.identities.write().unwrap();
        let record = identities
            .get_mut(name)
            .ok_or_else(|| call_error!(InvalidParameter; "unknown identity {}", name))?;
        record.roles.remove(role);
        Ok(())
    }

    pub fn roles_of(&self, name: &str) -> Vec<String> {
        self.identities
            .read()
            .unwrap()
            .get(name)
            .map(|r| {
                let mut roles: Vec<String> = r.roles.iter().cloned().collect();
                roles.sort();
                roles
            })
            .unwrap_or_default()
    }
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| call_error!(InvalidParameter; "password not hashable: {}", e).into())
}

#[cfg(test)]
mod tests {
    use babel_shared::error::ErrorCode;

    use super::*;

    fn store_with(name: &str, password: &str) -> IdentityStore {
        let store = IdentityStore::new();
        store.register(name, password, HashMap::new()).unwrap();
        store
    }

    #[test]
    fn passwords_are_stored_hashed() {
        let store = store_with("alice", "hunter2");
        store.verify_password("alice", "hunter2").unwrap();
        assert_eq!(
            store.verify_password("alice", "wrong").unwrap_err().code(),
            ErrorCode::AuthenticationFailed
        );
        // The stored string is a PHC string, not the password.
        let identities = store.identities.read().unwrap();
        let stored = &identities.get("alice").unwrap().password;
        assert!(stored.starts_with("$argon2"));
        assert!(!stored.contains("hunter2"));
    }

    #[test]
    fn unknown_identities_do_not_leak() {
        let store = store_with("alice", "hunter2");
        assert_eq!(
            store.verify_password("bob", "hunter2").unwrap_err().code(),
            ErrorCode::AuthenticationFailed
        );
    }

    #[test]
    fn deactivation_gates_verification() {
        let store = store_with("alice", "hunter2");
        store.deactivate("alice").unwrap();
        assert_eq!(
            store.verify_password("alice", "hunter2").unwrap_err().code(),
            ErrorCode::IdentityDisabled
        );
        store.reactivate("alice").unwrap();
        store.verify_password("alice", "hunter2").unwrap();
    }

    #[test]
    fn password_change_requires_the_old_one() {
        let store = store_with("alice", "hunter2");
        assert!(store.change_password("alice", "wrong", "next").is_err());
        store.change_password("alice", "hunter2", "next").unwrap();
        store.verify_password("alice", "next").unwrap();

        // Administrative reset skips verification.
        store.reset_password("alice", "fresh").unwrap();
        store.verify_password("alice", "fresh").unwrap();
    }

    #[test]
    fn role_assignment_round_trips() {
        let store = store_with("alice", "pw");
        store.assign_role("alice", "reader").unwrap();
        store.assign_role("alice", "writer").unwrap();
        store.unassign_role("alice", "writer").unwrap();
        assert_eq!(store.roles_of("alice"), vec!["reader".to_owned()]);
    }
}
