//! Mi IO - client for the Xiaomi local device-control protocol
//!
//! This library speaks the UDP protocol used by Xiaomi smart-home devices: a
//! fixed 32-byte header with an MD5 checksum, an AES-128-CBC encrypted
//! JSON-RPC payload and a discovery handshake that learns the device id and
//! clock offset before commands are sent.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use miio::{Connectivity, PendingCommand, Session, SessionConfig, SessionListener};
//!
//! struct Printer;
//!
//! impl SessionListener for Printer {
//!     fn on_result(&self, command: &PendingCommand) {
//!         println!("{} -> {:?}", command.id(), command.response());
//!     }
//!
//!     fn on_connectivity_change(&self, status: Connectivity) {
//!         println!("device is now {status:?}");
//!     }
//! }
//!
//! let config = SessionConfig::new("192.168.1.20", "0102030405060708090a0b0c0d0e0f10");
//! let session = Session::open(config)?;
//! let listener: Arc<dyn SessionListener> = Arc::new(Printer);
//! session.register_listener(&listener);
//!
//! let id = session.enqueue("miIO.info", serde_json::json!([]));
//! assert_ne!(id, 0);
//! # Ok::<(), miio::Error>(())
//! ```
//!
//! # Features
//!
//! - **Wire codec** - build and parse packets, keyed MD5 checksum
//! - **Token crypto** - key/IV derivation, payload encryption, vendor token unlock
//! - **Session engine** - FIFO command queue, single dispatch worker, handshake,
//!   connectivity tracking and listener fan-out

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod protocol;
pub mod transport;

pub use protocol::{
    CHECKSUM_SIZE, CommandError, DeviceId, Error, HEADER_SIZE, HELLO_PACKET, MAGIC, Method,
    MetricsSnapshot, Packet, PendingCommand, Result, parse_command_line,
};
pub use transport::{
    Connectivity, Session, SessionConfig, SessionListener, Token, TokenDenylist, ping,
};

/// Default Mi IO UDP port
pub const DEFAULT_PORT: u16 = 54321;

/// Snapshot of the process-wide protocol counters.
#[must_use]
pub fn metrics() -> MetricsSnapshot {
    protocol::metrics::Metrics::totals()
}
