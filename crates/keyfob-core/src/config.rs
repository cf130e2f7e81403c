//! Per-device protocol configuration.

use keyfob_crypto::{AuthorityPublicKey, SharedSecret};
use std::time::Duration;

/// Explicit protocol configuration, handed to each device at construction.
///
/// # Example
///
/// ```
/// use keyfob_core::SessionConfig;
/// use keyfob_crypto::{AuthorityKeyPair, SharedSecret};
/// use std::time::Duration;
///
/// let authority = AuthorityKeyPair::generate();
/// let config = SessionConfig::new(authority.public_key())
///     .with_secret(SharedSecret::generate())
///     .with_timeout(Some(Duration::from_secs(2)));
/// assert!(config.shared_secret.is_some());
/// ```
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Board-link key. `None` on an unpaired fob.
    pub shared_secret: Option<SharedSecret>,
    /// Feature authority verification key.
    pub authority_key: AuthorityPublicKey,
    /// Longest wait for the next message of an in-progress protocol run.
    /// `None` waits forever.
    pub protocol_timeout: Option<Duration>,
}

impl SessionConfig {
    /// Configuration with no shared secret and no timeout.
    pub fn new(authority_key: AuthorityPublicKey) -> Self {
        Self {
            shared_secret: None,
            authority_key,
            protocol_timeout: None,
        }
    }

    /// Sets the board-link key.
    pub fn with_secret(mut self, secret: SharedSecret) -> Self {
        self.shared_secret = Some(secret);
        self
    }

    /// Sets the protocol timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.protocol_timeout = timeout;
        self
    }
}
