//! Caller identity and token resolution.

use std::collections::HashMap;
use std::fmt;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Opaque identity of an authenticated caller. Sessions are owned by one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerIdentity(String);

impl CallerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves bearer tokens to caller identities.
pub trait IdentityProvider: Send + Sync {
    /// Returns `None` for unknown or revoked tokens.
    fn authenticate<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Option<CallerIdentity>>;
}

/// Fixed token table, loaded from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenProvider {
    tokens: HashMap<String, CallerIdentity>,
}

impl StaticTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a token; a repeated token replaces the earlier identity.
    pub fn with_token(mut self, token: impl Into<String>, identity: impl Into<String>) -> Self {
        self.tokens
            .insert(token.into(), CallerIdentity::new(identity));
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityProvider for StaticTokenProvider {
    fn authenticate<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Option<CallerIdentity>> {
        let found = self.tokens.get(token).cloned();
        Box::pin(async move { found })
    }
}
