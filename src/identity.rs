use std::collections::{HashMap, HashSet};

use subtle::ConstantTimeEq;

use crate::error::ProxyError;

/// A named `(name, token)` credential pair. Unique by name, immutable
/// after load.
#[derive(Clone)]
pub struct Identity {
    pub name: String,
    token: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self { name: name.into(), token: token.into() }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").field("name", &self.name).field("token", &"***").finish()
    }
}

/// Read-only identity allowlist, shared across all queues.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    by_name: HashMap<String, Identity>,
}

impl IdentityMap {
    pub fn new(identities: Vec<Identity>) -> Self {
        Self { by_name: identities.into_iter().map(|i| (i.name.clone(), i)).collect() }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Enforce a queue's identity allowlist against the two request
    /// headers. An empty `allowed` set means the route is unrestricted.
    ///
    /// Any failure is `FORBIDDEN`, including missing headers on a
    /// restricted queue, so enumerating restricted queues is never
    /// easier than enumerating valid tokens.
    pub fn check(&self, allowed: &HashSet<String>, identity: Option<&str>, token: Option<&str>) -> Result<(), ProxyError> {
        if allowed.is_empty() {
            return Ok(());
        }

        let (identity, token) = match (identity, token) {
            (Some(i), Some(t)) => (i, t),
            _ => return Err(ProxyError::Forbidden),
        };

        if !allowed.contains(identity) {
            return Err(ProxyError::Forbidden);
        }

        let stored = match self.by_name.get(identity) {
            Some(i) => i,
            None => return Err(ProxyError::Forbidden),
        };

        if tokens_match(token, &stored.token) {
            Ok(())
        } else {
            Err(ProxyError::Forbidden)
        }
    }
}

/// Constant-time token comparison. Compares against a same-length dummy
/// first so that a length mismatch never short-circuits the timing
/// behavior of the real comparison.
fn tokens_match(presented: &str, stored: &str) -> bool {
    if presented.len() != stored.len() {
        let dummy = vec![0u8; presented.len()];
        let _ = dummy.as_slice().ct_eq(presented.as_bytes());
        return false;
    }

    presented.as_bytes().ct_eq(stored.as_bytes()).into()
}
