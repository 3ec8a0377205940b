use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use super::provider::{ArcSessionProvider, SessionToken};
use crate::error::Result;
use crate::transport::RealtimeTransport;

#[inline]
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Keeps the transport's channel auth in step with the session provider.
///
/// Refreshes are serialized: concurrent callers wait for the one in flight
/// and then reuse its token if it is still fresh.
pub struct AuthBridge {
    provider: ArcSessionProvider,
    transport: Arc<dyn RealtimeTransport>,
    current: Mutex<Option<SessionToken>>,
    refresh_skew: Duration,
}

impl AuthBridge {
    pub fn new(
        provider: ArcSessionProvider,
        transport: Arc<dyn RealtimeTransport>,
        refresh_skew: Duration,
    ) -> Self {
        Self {
            provider,
            transport,
            current: Mutex::new(None),
            refresh_skew,
        }
    }

    /// Return the cached token, refreshing it first if stale.
    pub async fn ensure_fresh(&self) -> Result<SessionToken> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref() {
            if !token.is_stale(now_ms(), self.refresh_skew) {
                return Ok(token.clone());
            }
        }
        let token = self.fetch_and_install().await?;
        *current = Some(token.clone());
        Ok(token)
    }

    /// Always ask the provider for a new token and install it.
    pub async fn refresh(&self) -> Result<SessionToken> {
        let mut current = self.current.lock().await;
        let token = self.fetch_and_install().await?;
        *current = Some(token.clone());
        Ok(token)
    }

    async fn fetch_and_install(&self) -> Result<SessionToken> {
        log::debug!("[course-link] Refreshing session token");
        let token = self.provider.get_session_token().await?;
        self.transport.set_auth(&token).await?;
        Ok(token)
    }
}
