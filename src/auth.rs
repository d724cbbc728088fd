//! Identity collaborator
//!
//! Token issuance lives outside this service. Every exchange-mutating call
//! resolves its bearer token through an [`IdentityProvider`] first.
use crate::exchange::UserId;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

impl User {
    pub fn new(id: impl Into<UserId>, username: &str) -> Self {
        Self {
            id: id.into(),
            username: username.to_owned(),
        }
    }
}

pub trait IdentityProvider: Send + Sync {
    /// The user a token belongs to, or `None` for unknown tokens.
    fn current_user(&self, token: &str) -> Option<User>;
}

/// Fixed token table, fed from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentity {
    users: HashMap<String, User>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: &str, user: User) -> Self {
        self.users.insert(token.to_owned(), user);
        self
    }

    /// Parse comma separated `token:user_id:username` entries.
    pub fn parse(entries: &str) -> anyhow::Result<Self> {
        let mut identity = Self::new();
        for entry in entries.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut fields = entry.splitn(3, ':');
            match (fields.next(), fields.next(), fields.next()) {
                (Some(token), Some(id), Some(username))
                    if !token.is_empty() && !id.is_empty() && !username.is_empty() =>
                {
                    identity = identity.with_token(token, User::new(id, username));
                }
                _ => anyhow::bail!(
                    "malformed identity entry '{entry}', expected token:user_id:username"
                ),
            }
        }
        Ok(identity)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self, token: &str) -> Option<User> {
        self.users.get(token).cloned()
    }
}
