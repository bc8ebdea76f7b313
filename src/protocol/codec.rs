//! Mi IO packet codec (build/parse)
//!
//! The checksum is an MD5 digest over the 16-byte header prefix, the device
//! token and the payload; it is stored in header bytes 16..32.

use md5::{Digest, Md5};

use super::{CHECKSUM_SIZE, DeviceId, HEADER_SIZE, MAGIC, PREFIX_SIZE, Packet};

/// MD5 over the concatenation of `parts`.
#[must_use]
pub fn keyed_digest(parts: &[&[u8]]) -> [u8; CHECKSUM_SIZE] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Packet checksum: `md5(prefix ‖ token ‖ payload)`.
#[must_use]
pub fn checksum(prefix: &[u8; PREFIX_SIZE], token: &[u8], payload: &[u8]) -> [u8; CHECKSUM_SIZE] {
    keyed_digest(&[prefix.as_slice(), token, payload])
}

/// Build a packet around `payload`
///
/// # Format
///
/// ```text
/// [MAGIC (2)] [LENGTH (2)] [ZERO (4)] [DEVICE ID (4)] [TIMESTAMP (4)] [CHECKSUM (16)] [PAYLOAD]
/// ```
///
/// The payload must fit in a single UDP datagram; the length field saturates
/// at `u16::MAX` otherwise.
#[must_use]
pub fn build(payload: &[u8], token: &[u8], device_id: DeviceId, timestamp: u32) -> Vec<u8> {
    let length = u16::try_from(HEADER_SIZE + payload.len()).unwrap_or(u16::MAX);

    let mut prefix = [0u8; PREFIX_SIZE];
    prefix[0..2].copy_from_slice(&MAGIC);
    prefix[2..4].copy_from_slice(&length.to_be_bytes());
    prefix[8..12].copy_from_slice(device_id.as_bytes());
    prefix[12..16].copy_from_slice(&timestamp.to_be_bytes());

    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.extend_from_slice(&prefix);
    bytes.extend_from_slice(&checksum(&prefix, token, payload));
    bytes.extend_from_slice(payload);
    bytes
}

/// Parse a received datagram. Never fails; see [`Packet::from_datagram`].
#[must_use]
pub fn parse(raw: &[u8]) -> Packet {
    Packet::from_datagram(raw)
}
