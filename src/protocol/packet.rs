//! Mi IO packet
//!
//! Every datagram starts with a 32-byte header; the payload follows directly.

use core::fmt;
use std::str::FromStr;

use bytes::Bytes;

use super::{CHECKSUM_SIZE, Error, HEADER_SIZE, MAGIC, PREFIX_SIZE};

/// Four-byte device identifier carried in every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceId([u8; 4]);

impl DeviceId {
    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Borrow as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Device id as a big-endian integer
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

impl From<u32> for DeviceId {
    fn from(value: u32) -> Self {
        Self(value.to_be_bytes())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 8 {
            return Err(Error::ConfigurationInvalid(format!(
                "device id must be 8 hex characters, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 4];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|err| Error::ConfigurationInvalid(format!("device id: {err}")))?;
        Ok(Self(bytes))
    }
}

/// Parsed Mi IO packet
///
/// # Wire Format
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Magic (0x2131)        |        Packet Length          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Reserved (4)                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Device ID (4)                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Timestamp (4, BE)                       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// +                        Checksum (16)                          +
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Payload (variable)                       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    magic: [u8; 2],
    length: u16,
    reserved: [u8; 4],
    device_id: DeviceId,
    timestamp: u32,
    checksum: [u8; CHECKSUM_SIZE],
    payload: Bytes,
}

impl Packet {
    /// Slice the fixed fields out of a datagram.
    ///
    /// Input shorter than the header is zero-padded, so this never fails. The
    /// payload runs from byte 32 to the declared length, clamped to the bytes
    /// actually received.
    #[must_use]
    pub fn from_datagram(raw: &[u8]) -> Self {
        let mut head = [0u8; HEADER_SIZE];
        let available = raw.len().min(HEADER_SIZE);
        head[..available].copy_from_slice(&raw[..available]);

        let length = u16::from_be_bytes([head[2], head[3]]);
        let end = usize::from(length).clamp(HEADER_SIZE, raw.len().max(HEADER_SIZE));
        let payload = if raw.len() > HEADER_SIZE {
            Bytes::copy_from_slice(&raw[HEADER_SIZE..end])
        } else {
            Bytes::new()
        };

        Self {
            magic: [head[0], head[1]],
            length,
            reserved: head[4..8].try_into().unwrap_or_default(),
            device_id: DeviceId(head[8..12].try_into().unwrap_or_default()),
            timestamp: u32::from_be_bytes([head[12], head[13], head[14], head[15]]),
            checksum: head[16..32].try_into().unwrap_or_default(),
            payload,
        }
    }

    /// Get magic bytes
    #[must_use]
    pub const fn magic(&self) -> [u8; 2] {
        self.magic
    }

    /// Whether the magic matches the protocol constant
    #[must_use]
    pub fn has_valid_magic(&self) -> bool {
        self.magic == MAGIC
    }

    /// Declared total packet length
    #[must_use]
    pub const fn length(&self) -> u16 {
        self.length
    }

    /// Get reserved bytes
    #[must_use]
    pub const fn reserved(&self) -> [u8; 4] {
        self.reserved
    }

    /// Get device id
    #[must_use]
    pub const fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Device clock in seconds
    #[must_use]
    pub const fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Get checksum field
    #[must_use]
    pub const fn checksum(&self) -> &[u8; CHECKSUM_SIZE] {
        &self.checksum
    }

    /// Get payload
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The 16 header bytes that precede the checksum.
    #[must_use]
    pub fn prefix(&self) -> [u8; PREFIX_SIZE] {
        let mut bytes = [0u8; PREFIX_SIZE];
        bytes[0..2].copy_from_slice(&self.magic);
        bytes[2..4].copy_from_slice(&self.length.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.reserved);
        bytes[8..12].copy_from_slice(self.device_id.as_bytes());
        bytes[12..16].copy_from_slice(&self.timestamp.to_be_bytes());
        bytes
    }

    /// Recompute the keyed digest and compare it with the stored checksum.
    #[must_use]
    pub fn verify_checksum(&self, token: &[u8]) -> bool {
        super::checksum(&self.prefix(), token, &self.payload) == self.checksum
    }

    /// Render the packet as spaced upper-case hex, for packet dumps.
    #[must_use]
    pub fn to_spaced_hex(&self) -> String {
        let mut raw = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        raw.extend_from_slice(&self.prefix());
        raw.extend_from_slice(&self.checksum);
        raw.extend_from_slice(&self.payload);
        raw.iter()
            .map(|byte| format!("{byte:02X}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "packet(len={}, device={}, ts={}, payload={}B)",
            self.length,
            self.device_id,
            self.timestamp,
            self.payload.len()
        )
    }
}
