use alloc::string::String;
use alloc::vec::Vec;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use sha2::{Digest, Sha256};

/// Size in bytes of a `SHA-256` digest.
pub const HASH_SIZE: usize = 32;

/// A `SHA-256` digest.
pub type Hash = [u8; HASH_SIZE];

/// The digest preceding the first packet of a transfer.
pub const FIRST_PACKET_PREVIOUS_HASH: Hash = [0; HASH_SIZE];

/// Computes the `SHA-256` digest of some content.
#[must_use]
pub fn content_hash(content: &[u8]) -> Hash {
    Sha256::digest(content).into()
}

/// Encodes a digest in the transport-safe `Base64` text form.
#[must_use]
pub fn encode_hash(hash: &[u8]) -> String {
    STANDARD.encode(hash)
}

/// Decodes the transport-safe `Base64` text form of a `SHA-256` digest.
///
/// Returns [`None`] when the text is not valid `Base64` or does not decode
/// into exactly [`HASH_SIZE`] bytes.
#[must_use]
pub fn decode_hash(text: &str) -> Option<Hash> {
    let bytes = STANDARD.decode(text).ok()?;
    bytes.try_into().ok()
}

/// Reasons for rejecting a binary packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// The packet is too short to contain both digests.
    TooShort,
    /// The packet digest does not match its data.
    HashMismatch,
}

impl core::fmt::Display for PacketError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::TooShort => "packet too short",
            Self::HashMismatch => "packet hash does not match its data",
        })
    }
}

/// A binary packet of a chunked transfer.
///
/// On the wire a packet is the concatenation of:
///
/// - the digest of the previous packet data, all zeros for the first packet
/// - the packet data
/// - the digest of the packet data
#[derive(Debug, PartialEq, Eq)]
pub struct BinaryPacket<'a> {
    previous_hash: &'a [u8],
    data: &'a [u8],
    hash: &'a [u8],
}

impl<'a> BinaryPacket<'a> {
    /// Parses and validates a [`BinaryPacket`] from raw bytes.
    ///
    /// # Errors
    ///
    /// Fails when the bytes cannot contain both digests, or when the trailing
    /// digest does not match the packet data.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, PacketError> {
        if bytes.len() < 2 * HASH_SIZE {
            return Err(PacketError::TooShort);
        }

        let (previous_hash, rest) = bytes.split_at(HASH_SIZE);
        let (data, hash) = rest.split_at(rest.len() - HASH_SIZE);

        if content_hash(data).as_slice() != hash {
            return Err(PacketError::HashMismatch);
        }

        Ok(Self {
            previous_hash,
            data,
            hash,
        })
    }

    /// Encodes a packet from the previous digest and the packet data.
    #[must_use]
    pub fn encode(previous_hash: &Hash, data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(data.len() + 2 * HASH_SIZE);
        bytes.extend_from_slice(previous_hash);
        bytes.extend_from_slice(data);
        bytes.extend_from_slice(&content_hash(data));
        bytes
    }

    /// Returns the digest of the previous packet data.
    #[must_use]
    #[inline]
    pub fn previous_hash(&self) -> &'a [u8] {
        self.previous_hash
    }

    /// Returns the packet data.
    #[must_use]
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Returns the digest of the packet data.
    #[must_use]
    #[inline]
    pub fn hash(&self) -> &'a [u8] {
        self.hash
    }
}
