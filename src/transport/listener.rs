//! Observer seam between the session engine and its owner.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::protocol::PendingCommand;

/// Connection status reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Connectivity {
    /// No successful handshake yet.
    #[default]
    Disconnected,
    /// Device answers.
    Connected,
    /// Handshake failed; device unreachable.
    CommunicationError,
    /// Device reachable but commands keep failing, or the configuration is unusable.
    ConfigurationError,
}

impl Connectivity {
    /// Whether the device is considered online.
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Callbacks invoked on the dispatch worker.
///
/// Listeners are held weakly by the session; dropping the last strong
/// reference unregisters implicitly. A panicking callback is logged and the
/// worker keeps going.
pub trait SessionListener: Send + Sync {
    /// A command completed, successfully or not.
    fn on_result(&self, command: &PendingCommand);

    /// Connectivity changed.
    fn on_connectivity_change(&self, status: Connectivity) {
        let _ = status;
    }
}
