//! Session token provider.
//!
//! Use [`SessionProvider`] to supply tokens lazily. It is called whenever the
//! cached token is stale and before every reconnect attempt. This is the
//! right place for:
//! - OAuth / OIDC refresh flows
//! - Tokens fetched from secure storage
//!
//! ```rust,no_run
//! use course_link::{SessionProvider, SessionToken};
//!
//! struct MyTokenStore { /* ... */ }
//!
//! #[async_trait::async_trait]
//! impl SessionProvider for MyTokenStore {
//!     async fn get_session_token(&self) -> course_link::Result<SessionToken> {
//!         // fetch / refresh token here
//!         Ok(SessionToken::new("fresh-token"))
//!     }
//! }
//! ```

use crate::error::{CourseLinkError, Result};
use std::sync::Arc;
use std::time::Duration;

/// An access token plus its expiry, if known.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub access_token: String,
    /// Millis since Unix epoch. `None` means unknown, which is treated as
    /// stale so the provider is asked again on the next open.
    pub expires_at_ms: Option<u64>,
}

impl SessionToken {
    /// Token without a known expiry.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at_ms: None,
        }
    }

    pub fn with_expiry(access_token: impl Into<String>, expires_at_ms: u64) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at_ms: Some(expires_at_ms),
        }
    }

    /// Whether the token expires within `skew` of `now_ms`.
    pub fn is_stale(&self, now_ms: u64, skew: Duration) -> bool {
        match self.expires_at_ms {
            Some(expires_at) => expires_at <= now_ms.saturating_add(skew.as_millis() as u64),
            None => true,
        }
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("access_token", &"<redacted>")
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

/// Async session provider called whenever a fresh token is needed.
#[async_trait::async_trait]
pub trait SessionProvider: Send + Sync + 'static {
    /// Return the current (or freshly refreshed) token.
    async fn get_session_token(&self) -> Result<SessionToken>;
}

/// A reference-counted [`SessionProvider`].
pub type ArcSessionProvider = Arc<dyn SessionProvider>;

/// Provider returning a fixed token, for service accounts and tests.
#[derive(Debug, Clone)]
pub struct StaticSessionProvider {
    token: Option<SessionToken>,
}

impl StaticSessionProvider {
    pub fn new(token: SessionToken) -> Self {
        Self { token: Some(token) }
    }

    /// Provider that always fails, as a signed-out session does.
    pub fn signed_out() -> Self {
        Self { token: None }
    }
}

#[async_trait::async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn get_session_token(&self) -> Result<SessionToken> {
        self.token
            .clone()
            .ok_or_else(|| CourseLinkError::AuthenticationError("No active session".to_string()))
    }
}
