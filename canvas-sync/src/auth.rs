//! Identity and access collaborators.
//!
//! Token issuance and authorization policy live elsewhere; the gateway only
//! consumes their decisions through these traits. The static implementations
//! back tests and the development server.

use futures_util::future::BoxFuture;
use std::collections::HashMap;

use crate::error::{AuthError, ConfigError};

/// Identity behind a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUser {
    pub user_id: String,
    pub username: String,
}

impl VerifiedUser {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

/// Outcome of a canvas access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl AccessDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Verifies bearer tokens. Fails on invalid or expired tokens.
pub trait TokenVerifier: Send + Sync {
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<VerifiedUser, AuthError>>;
}

/// Decides whether a user may open a canvas.
pub trait AccessAuthorizer: Send + Sync {
    fn check<'a>(&'a self, user_id: &'a str, canvas_id: &'a str) -> BoxFuture<'a, AccessDecision>;
}

/// Fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, VerifiedUser>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user: VerifiedUser) -> Self {
        self.tokens.insert(token.into(), user);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, user: VerifiedUser) {
        self.tokens.insert(token.into(), user);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Parse `token=userId:username,token2=userId2:username2`.
    ///
    /// The username defaults to the user id when omitted.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut verifier = Self::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let invalid = |reason: &str| ConfigError::Invalid {
                key: "CANVAS_SYNC_TOKENS",
                reason: format!("{reason} in entry {entry:?}"),
            };
            let (token, identity) = entry.split_once('=').ok_or_else(|| invalid("missing '='"))?;
            let (user_id, username) = identity.split_once(':').unwrap_or((identity, identity));
            if token.is_empty() || user_id.is_empty() {
                return Err(invalid("empty token or user id"));
            }
            verifier.insert(token, VerifiedUser::new(user_id, username));
        }
        Ok(verifier)
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<VerifiedUser, AuthError>> {
        Box::pin(async move {
            if token.is_empty() {
                return Err(AuthError("missing token".into()));
            }
            self.tokens
                .get(token)
                .cloned()
                .ok_or_else(|| AuthError("invalid or expired token".into()))
        })
    }
}

/// Grants every user access to every canvas.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllAuthorizer;

impl AccessAuthorizer for AllowAllAuthorizer {
    fn check<'a>(&'a self, _user_id: &'a str, _canvas_id: &'a str) -> BoxFuture<'a, AccessDecision> {
        Box::pin(async { AccessDecision::allow() })
    }
}
