//! Bridge to the external identity service.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A verified user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

/// Resolves bearer tokens to identities.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// `None` means the token is invalid.
    async fn verify(&self, token: &str) -> Option<Identity>;
}

/// Rejects every token. Used when no identity service is configured, so
/// rooms requiring login simply cannot be joined.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAllVerifier;

#[async_trait]
impl TokenVerifier for RejectAllVerifier {
    async fn verify(&self, _token: &str) -> Option<Identity> {
        None
    }
}

/// Fixed token table, loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `{"<token>": {"user_id": "...", "username": "..."}, ...}`.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let tokens: HashMap<String, Identity> = serde_json::from_str(json)?;
        Ok(Self { tokens })
    }

    pub fn insert(&mut self, token: impl Into<String>, identity: Identity) {
        self.tokens.insert(token.into(), identity);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).cloned()
    }
}
