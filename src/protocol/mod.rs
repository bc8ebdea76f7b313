//! Mi IO protocol core implementation
//!
//! This module provides the wire format, the keyed checksum, the command model
//! and the error types shared by the transport.

mod codec;
mod command;
mod error;
pub(crate) mod metrics;
mod packet;

pub use codec::{build, checksum, keyed_digest, parse};
pub use command::{Method, PendingCommand, parse_command_line};
pub use error::{CommandError, Error, Result};
pub use metrics::MetricsSnapshot;
pub use packet::{DeviceId, Packet};

/// Mi IO magic number: `0x2131`
pub const MAGIC: [u8; 2] = [0x21, 0x31];

/// Header size in bytes, checksum included
pub const HEADER_SIZE: usize = 32;

/// Size of the leading header part covered by the checksum
pub const PREFIX_SIZE: usize = 16;

/// Checksum size in bytes
pub const CHECKSUM_SIZE: usize = 16;

/// Discovery datagram: a bare header with every field past the length set to `0xff`.
pub const HELLO_PACKET: [u8; HEADER_SIZE] = [
    0x21, 0x31, 0x00, 0x20, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];
