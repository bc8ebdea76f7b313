//! Session configuration.

use std::collections::HashSet;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::DEFAULT_PORT;

/// Set of 32-character hex tokens that are refused at open time.
///
/// Matching ignores case. The default set holds the placeholder tokens
/// reported by devices that have not been provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct TokenDenylist {
    tokens: HashSet<String>,
}

impl TokenDenylist {
    /// Build a denylist from the given tokens.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(|token| token.as_ref().trim().to_ascii_lowercase())
                .collect(),
        }
    }

    /// An empty denylist.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            tokens: HashSet::new(),
        }
    }

    /// Add a token.
    pub fn insert(&mut self, token: &str) {
        self.tokens.insert(token.trim().to_ascii_lowercase());
    }

    /// Whether the token is refused.
    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains(&token.trim().to_ascii_lowercase())
    }

    /// Number of refused tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether nothing is refused.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Default for TokenDenylist {
    fn default() -> Self {
        Self::new([
            "00000000000000000000000000000000",
            "ffffffffffffffffffffffffffffffff",
        ])
    }
}

/// Session configuration options.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct SessionConfig {
    /// Device host name or IP address (a broadcast address works for pings).
    pub host: String,
    /// Device UDP port.
    pub port: u16,
    /// Token as configured: 16 raw characters, 32 hex or 96 hex characters.
    pub token: String,
    /// Device id as 8 hex characters; learned from the handshake when absent.
    pub device_id: Option<String>,
    /// Receive timeout for every datagram exchange.
    pub timeout: Duration,
    /// Consecutive timeouts tolerated before connectivity escalates.
    pub max_errors: u32,
    /// Largest command id before the counter wraps.
    pub max_id: u32,
    /// Last id used by a previous session; the first command gets `initial_id + 1`.
    pub initial_id: u32,
    /// Discovery datagrams sent per handshake.
    pub handshake_attempts: u32,
    /// Receive buffer size in bytes.
    pub buffer_size: usize,
    /// Tokens refused at open time.
    pub denylist: TokenDenylist,
}

impl SessionConfig {
    /// Configuration for `host` with `token` and defaults elsewhere.
    pub fn new(host: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            token: token.into(),
            ..Self::default()
        }
    }

    /// Set a known device id (8 hex characters).
    #[must_use]
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Set the receive timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the device port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Replace the token denylist.
    #[must_use]
    pub fn with_denylist(mut self, denylist: TokenDenylist) -> Self {
        self.denylist = denylist;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            token: String::new(),
            device_id: None,
            timeout: Duration::from_secs(15),
            max_errors: 3,
            max_id: 15_000,
            initial_id: 0,
            handshake_attempts: 3,
            buffer_size: 2048,
            denylist: TokenDenylist::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::new("10.0.0.2", "abcdefghijklmnop");
        assert_eq!(config.port, 54321);
        assert_eq!(config.max_errors, 3);
        assert_eq!(config.max_id, 15_000);
        assert_eq!(config.handshake_attempts, 3);
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert!(config.device_id.is_none());
        assert_eq!(config.denylist.len(), 2);
    }

    #[test]
    fn test_builder_helpers() {
        let config = SessionConfig::new("10.0.0.2", "abcdefghijklmnop")
            .with_device_id("00112233")
            .with_port(4000)
            .with_timeout(Duration::from_millis(250))
            .with_denylist(TokenDenylist::empty());
        assert_eq!(config.device_id.as_deref(), Some("00112233"));
        assert_eq!(config.port, 4000);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert!(config.denylist.is_empty());
    }

    #[test]
    fn test_denylist_ignores_case() {
        let mut denylist = TokenDenylist::empty();
        denylist.insert("ABCDEF0123456789ABCDEF0123456789");
        assert!(denylist.contains("abcdef0123456789abcdef0123456789"));
        assert!(!denylist.contains("00000000000000000000000000000000"));
    }
}
