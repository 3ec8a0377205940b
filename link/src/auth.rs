//! Session token bridging between the auth provider and the realtime
//! transport.
//!
//! - [`SessionProvider`]: supplies the current (or freshly refreshed) token
//! - [`AuthBridge`]: caches the token, refreshes it when stale and hands it
//!   to the transport (`set_auth`) before any channel is opened
//! - [`is_token_expiry_message`]: recognizes channel errors caused by an
//!   expired token so they are answered with a refresh instead of backoff

mod bridge;
mod provider;

pub use bridge::AuthBridge;
pub use provider::{ArcSessionProvider, SessionProvider, SessionToken, StaticSessionProvider};

/// Substrings (lowercase) that identify a token-expiry channel error.
const TOKEN_EXPIRY_SIGNATURES: &[&str] = &[
    "token has expired",
    "token is expired",
    "jwt expired",
    "invalid jwt",
    "invalidjwttoken",
    "expired token",
];

/// Whether a channel error message reports an expired session token.
pub fn is_token_expiry_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TOKEN_EXPIRY_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_expiry_detection() {
        assert!(is_token_expiry_message("Token has expired 12 seconds ago"));
        assert!(is_token_expiry_message("InvalidJWTToken: signature"));
        assert!(is_token_expiry_message("realtime: JWT expired"));
        assert!(!is_token_expiry_message("connection reset by peer"));
        assert!(!is_token_expiry_message(""));
    }
}
