//! tether wire format: the public header every hop can read.
//!
//! A packet on the wire is
//!
//! ```text
//! [public_header_len: u8][public header][payload]
//! ```
//!
//! The public header is a fixed 98-byte block followed by optional chunk
//! fields. It carries everything a relay or an admission filter needs and is
//! never encrypted. The payload is interpreted by `envelope`.
//!
//! Integer fields are big-endian. The fixed block is #[repr(C, packed)] and
//! uses zerocopy for allocation-free parsing. There is no unsafe code in this
//! module.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, I32, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Identifiers ───────────────────────────────────────────────────────────────

/// X25519 public key identifying a node on the overlay.
///
/// The all-zero key is reserved and means "no recipient". It is only used by
/// local-network discovery announcements sent to the multicast group.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub const NONE: PublicKey = PublicKey([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

impl FromStr for PublicKey {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| WireError::InvalidPublicKey(s.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| WireError::InvalidPublicKey(s.to_string()))?;
        Ok(PublicKey(key))
    }
}

impl From<[u8; 32]> for PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// 24-byte random message id.
///
/// Doubles as the XChaCha20-Poly1305 nonce when the message is armed, so it
/// must never be reused for two different messages from the same sender.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce(pub [u8; 24]);

impl Nonce {
    pub fn random() -> Self {
        let mut id = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut id);
        Nonce(id)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", hex::encode(&self.0[..6]))
    }
}

/// Proof-of-work nonce bound to a public key. See `identity` for validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProofOfWork(pub u32);

// ── Message Type ──────────────────────────────────────────────────────────────

/// The single byte of the private header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// User payload. Always encrypted when armed.
    Application = 0x01,

    /// Ping. Answered with an Acknowledgement carrying the ping's id.
    Discovery = 0x02,

    /// Pong for a previously sent Discovery.
    Acknowledgement = 0x03,

    /// Rendezvous hint from a super peer: "this peer is reachable here".
    Unite = 0x04,
}

impl MessageType {
    /// Control messages are rate limited and only authenticated when armed.
    pub fn is_control(self) -> bool {
        !matches!(self, MessageType::Application)
    }

    /// Whether arming encrypts the content of this message class.
    pub fn is_encrypted_when_armed(self) -> bool {
        matches!(self, MessageType::Application | MessageType::Unite)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Application),
            0x02 => Ok(MessageType::Discovery),
            0x03 => Ok(MessageType::Acknowledgement),
            0x04 => Ok(MessageType::Unite),
            other => Err(WireError::InvalidMessageFormat(format!(
                "unknown message type: 0x{other:02x}"
            ))),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

// ── Fixed Header ──────────────────────────────────────────────────────────────

/// The fixed part of the public header.
///
/// Wire size: 98 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FixedHeader {
    /// Overlay network id. Nodes drop traffic from other networks.
    pub network_id: I32<NetworkEndian>,

    /// Sender's public key.
    pub sender: [u8; 32],

    /// Sender's proof of work. Validated by every receiving hop.
    pub proof_of_work: U32<NetworkEndian>,

    /// Recipient's public key. All zero for multicast announcements.
    pub recipient: [u8; 32],

    /// Incremented by every hop on the outbound path.
    pub hop_count: u8,

    /// Random message id.
    pub id: [u8; 24],

    /// Bit flags:
    ///   bit 0: chunk (chunk fields follow the fixed block)
    ///   bit 1: armed (payload starts with a 16-byte signature)
    ///   bit 2: encrypted (armed content is sealed, not just authenticated)
    ///   bits 3-7: reserved, must be zero
    pub flags: u8,
}

assert_eq_size!(FixedHeader, [u8; 98]);

// ── Chunk Position ────────────────────────────────────────────────────────────

/// Where a chunk sits in its composed message.
///
/// Only the head chunk knows how many chunks there are. The others only
/// carry their own index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPosition {
    Head { total_chunks: u16 },
    Follow { chunk_no: u16 },
}

impl ChunkPosition {
    pub fn chunk_no(self) -> u16 {
        match self {
            ChunkPosition::Head { .. } => 0,
            ChunkPosition::Follow { chunk_no } => chunk_no,
        }
    }

    pub fn total_chunks(self) -> Option<u16> {
        match self {
            ChunkPosition::Head { total_chunks } => Some(total_chunks),
            ChunkPosition::Follow { .. } => None,
        }
    }

    fn wire_len(self) -> usize {
        match self {
            ChunkPosition::Head { .. } => 4,
            ChunkPosition::Follow { .. } => 2,
        }
    }
}

// ── Public Header ─────────────────────────────────────────────────────────────

/// Decoded public header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicHeader {
    pub network_id: i32,
    pub sender: PublicKey,
    pub proof_of_work: ProofOfWork,
    pub recipient: PublicKey,
    pub hop_count: u8,
    pub id: Nonce,
    pub armed: bool,
    pub encrypted: bool,
    pub chunk: Option<ChunkPosition>,
}

impl PublicHeader {
    /// Header for a fresh, unarmed, unchunked message with a random id.
    pub fn new(
        network_id: i32,
        sender: PublicKey,
        proof_of_work: ProofOfWork,
        recipient: PublicKey,
    ) -> Self {
        Self {
            network_id,
            sender,
            proof_of_work,
            recipient,
            hop_count: 0,
            id: Nonce::random(),
            armed: false,
            encrypted: false,
            chunk: None,
        }
    }

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.chunk.is_some() {
            flags |= FLAG_CHUNK;
        }
        if self.armed {
            flags |= FLAG_ARMED;
        }
        if self.encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        flags
    }

    /// Length of the header block excluding the leading length byte.
    pub fn header_len(&self) -> usize {
        FIXED_HEADER_LEN + self.chunk.map_or(0, ChunkPosition::wire_len)
    }

    /// Length including the leading length byte.
    pub fn encoded_len(&self) -> usize {
        1 + self.header_len()
    }

    fn fixed(&self) -> FixedHeader {
        FixedHeader {
            network_id: I32::new(self.network_id),
            sender: self.sender.0,
            proof_of_work: U32::new(self.proof_of_work.0),
            recipient: self.recipient.0,
            hop_count: self.hop_count,
            id: self.id.0,
            flags: self.flags(),
        }
    }

    /// Append `[len][fixed][chunk fields]` to `out`.
    pub fn write_to(&self, out: &mut BytesMut) {
        out.reserve(self.encoded_len());
        out.put_u8(self.header_len() as u8);
        out.extend_from_slice(self.fixed().as_bytes());
        match self.chunk {
            Some(ChunkPosition::Head { total_chunks }) => {
                out.put_u16(0);
                out.put_u16(total_chunks);
            }
            Some(ChunkPosition::Follow { chunk_no }) => out.put_u16(chunk_no),
            None => {}
        }
    }

    /// Bytes bound into the arming signature.
    ///
    /// Hop count is zeroed because relays increment it after the sender
    /// armed the message.
    pub fn associated_data(&self) -> Vec<u8> {
        let mut header = self.clone();
        header.hop_count = 0;
        let mut out = BytesMut::with_capacity(header.encoded_len());
        header.write_to(&mut out);
        out.to_vec()
    }

    /// Parse the header from the start of a packet.
    ///
    /// Returns the header and the number of bytes consumed (including the
    /// length byte).
    pub fn read_from(packet: &[u8]) -> Result<(Self, usize), WireError> {
        let (&len, rest) = packet
            .split_first()
            .ok_or(WireError::MalformedEnvelope("empty packet"))?;
        let len = len as usize;
        if len < FIXED_HEADER_LEN {
            return Err(WireError::MalformedEnvelope("public header too short"));
        }
        let block = rest
            .get(..len)
            .ok_or(WireError::MalformedEnvelope("public header truncated"))?;
        let fixed = FixedHeader::read_from_prefix(block)
            .ok_or(WireError::MalformedEnvelope("public header truncated"))?;

        let flags = fixed.flags;
        if flags & FLAGS_RESERVED != 0 {
            return Err(WireError::MalformedEnvelope("reserved flags set"));
        }

        let mut cursor = FIXED_HEADER_LEN;
        let chunk = if flags & FLAG_CHUNK != 0 {
            let chunk_no = read_u16(block, &mut cursor)?;
            if chunk_no == 0 {
                let total_chunks = read_u16(block, &mut cursor)?;
                if total_chunks == 0 {
                    return Err(WireError::MalformedEnvelope("head chunk declares zero chunks"));
                }
                Some(ChunkPosition::Head { total_chunks })
            } else {
                Some(ChunkPosition::Follow { chunk_no })
            }
        } else {
            None
        };

        if cursor != len {
            return Err(WireError::MalformedEnvelope("public header length mismatch"));
        }

        let header = PublicHeader {
            network_id: fixed.network_id.get(),
            sender: PublicKey(fixed.sender),
            proof_of_work: ProofOfWork(fixed.proof_of_work.get()),
            recipient: PublicKey(fixed.recipient),
            hop_count: fixed.hop_count,
            id: Nonce(fixed.id),
            armed: flags & FLAG_ARMED != 0,
            encrypted: flags & FLAG_ENCRYPTED != 0,
            chunk,
        };
        Ok((header, 1 + len))
    }
}

fn read_u16(block: &[u8], cursor: &mut usize) -> Result<u16, WireError> {
    let bytes = block
        .get(*cursor..*cursor + 2)
        .ok_or(WireError::MalformedEnvelope("chunk fields truncated"))?;
    *cursor += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of the fixed public header block.
pub const FIXED_HEADER_LEN: usize = 98;

/// Worst-case public header overhead of a chunk: length byte, fixed block,
/// chunk number and total chunks.
pub const CHUNK_HEADER_OVERHEAD: usize = 1 + FIXED_HEADER_LEN + 4;

/// Poly1305 tag length prepended to armed payloads.
pub const SIGNATURE_LEN: usize = 16;

pub const FLAG_CHUNK: u8 = 0b0000_0001;
pub const FLAG_ARMED: u8 = 0b0000_0010;
pub const FLAG_ENCRYPTED: u8 = 0b0000_0100;
const FLAGS_RESERVED: u8 = !(FLAG_CHUNK | FLAG_ARMED | FLAG_ENCRYPTED);

/// Well-known IPv4 group for local-network discovery.
pub const MULTICAST_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 22, 5, 27), 22527);

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The public header cannot be parsed. Raised eagerly on decode.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),

    /// The private header or body cannot be parsed. Raised lazily on first access.
    #[error("invalid message format: {0}")]
    InvalidMessageFormat(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
