//! Envelopes: a public header plus a payload whose interpretation depends on
//! the header flags.
//!
//! Payload layouts:
//!
//! ```text
//! plain   [private_header_len: u8][message_type: u8][body]
//! armed   [signature: 16][sealed or authenticated content]
//! chunk   [slice of the complete composed packet]
//! ```
//!
//! Decoding is two-phase. `Envelope::decode` parses the public header and
//! fails with `MalformedEnvelope`. The private header and body are parsed on
//! first access and the result is cached; errors surface as
//! `InvalidMessageFormat` at that point.
//!
//! An envelope is immutable. Operations that change it (hop count, arming)
//! consume it and return a new one.

use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::OnceLock;

use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::{
    ChunkPosition, MessageType, Nonce, ProofOfWork, PublicHeader, PublicKey, WireError,
    SIGNATURE_LEN,
};

// ── Body ──────────────────────────────────────────────────────────────────────

/// Typed message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Application(Bytes),

    /// `children_time` is non-zero when the sender asks a super peer to
    /// adopt it as a child.
    Discovery { children_time: u64 },

    Acknowledgement { corresponding_id: Nonce },

    /// `public_key` can be reached at `address`.
    Unite { public_key: PublicKey, address: SocketAddr },
}

impl Body {
    pub fn message_type(&self) -> MessageType {
        match self {
            Body::Application(_) => MessageType::Application,
            Body::Discovery { .. } => MessageType::Discovery,
            Body::Acknowledgement { .. } => MessageType::Acknowledgement,
            Body::Unite { .. } => MessageType::Unite,
        }
    }

    fn write_to(&self, out: &mut BytesMut) {
        match self {
            Body::Application(payload) => out.extend_from_slice(payload),
            Body::Discovery { children_time } => out.put_u64(*children_time),
            Body::Acknowledgement { corresponding_id } => out.extend_from_slice(&corresponding_id.0),
            Body::Unite { public_key, address } => {
                out.extend_from_slice(&public_key.0);
                out.put_u16(address.port());
                match address.ip() {
                    IpAddr::V4(ip) => {
                        out.put_u8(4);
                        out.extend_from_slice(&ip.octets());
                    }
                    IpAddr::V6(ip) => {
                        out.put_u8(16);
                        out.extend_from_slice(&ip.octets());
                    }
                }
            }
        }
    }

    fn parse(message_type: MessageType, body: Bytes) -> Result<Body, WireError> {
        match message_type {
            MessageType::Application => Ok(Body::Application(body)),
            MessageType::Discovery => {
                let raw: [u8; 8] = body[..]
                    .try_into()
                    .map_err(|_| invalid("discovery body must be 8 bytes"))?;
                Ok(Body::Discovery {
                    children_time: u64::from_be_bytes(raw),
                })
            }
            MessageType::Acknowledgement => {
                let raw: [u8; 24] = body[..]
                    .try_into()
                    .map_err(|_| invalid("acknowledgement body must be 24 bytes"))?;
                Ok(Body::Acknowledgement {
                    corresponding_id: Nonce(raw),
                })
            }
            MessageType::Unite => {
                if body.len() < 35 {
                    return Err(invalid("unite body truncated"));
                }
                let mut key = [0u8; 32];
                key.copy_from_slice(&body[..32]);
                let port = u16::from_be_bytes([body[32], body[33]]);
                let ip_len = body[34] as usize;
                let ip_bytes = &body[35..];
                if ip_bytes.len() != ip_len {
                    return Err(invalid("unite address length mismatch"));
                }
                let ip = match ip_len {
                    4 => {
                        let octets: [u8; 4] = ip_bytes.try_into().map_err(|_| invalid("ipv4"))?;
                        IpAddr::V4(Ipv4Addr::from(octets))
                    }
                    16 => {
                        let octets: [u8; 16] = ip_bytes.try_into().map_err(|_| invalid("ipv6"))?;
                        IpAddr::V6(Ipv6Addr::from(octets))
                    }
                    _ => return Err(invalid("unite address must be 4 or 16 bytes")),
                };
                Ok(Body::Unite {
                    public_key: PublicKey(key),
                    address: SocketAddr::new(ip, port),
                })
            }
        }
    }
}

fn invalid(reason: &str) -> WireError {
    WireError::InvalidMessageFormat(reason.to_string())
}

// ── Payload ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Payload {
    /// Private header and body, parsed on first access.
    Plain {
        content: Bytes,
        parsed: OnceLock<Result<Body, WireError>>,
    },
    Armed {
        signature: [u8; SIGNATURE_LEN],
        content: Bytes,
    },
    Chunk(Bytes),
}

impl Payload {
    fn plain(content: Bytes) -> Self {
        Payload::Plain {
            content,
            parsed: OnceLock::new(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Payload::Plain { content, .. } => content.len(),
            Payload::Armed { content, .. } => SIGNATURE_LEN + content.len(),
            Payload::Chunk(slice) => slice.len(),
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A message in transit. Equality and hashing are by message id.
#[derive(Debug, Clone)]
pub struct Envelope {
    header: PublicHeader,
    payload: Payload,
}

impl Envelope {
    /// Build an unarmed envelope with a fresh random id and hop count 0.
    pub fn new(
        network_id: i32,
        sender: PublicKey,
        proof_of_work: ProofOfWork,
        recipient: PublicKey,
        body: Body,
    ) -> Self {
        Self::with_header(
            PublicHeader::new(network_id, sender, proof_of_work, recipient),
            body,
        )
    }

    /// Build an unarmed envelope with an explicit header.
    ///
    /// Arming and chunk flags in `header` are cleared.
    pub fn with_header(mut header: PublicHeader, body: Body) -> Self {
        header.armed = false;
        header.encrypted = false;
        header.chunk = None;

        let message_type = body.message_type();
        let mut content = BytesMut::new();
        content.put_u8(1);
        content.put_u8(message_type.into());
        body.write_to(&mut content);

        let parsed = OnceLock::new();
        let _ = parsed.set(Ok(body));
        Self {
            header,
            payload: Payload::Plain {
                content: content.freeze(),
                parsed,
            },
        }
    }

    /// A chunk of a composed message. `header` is the composed message's
    /// header; arming flags are cleared on the chunk itself.
    pub fn chunk(header: &PublicHeader, position: ChunkPosition, slice: Bytes) -> Self {
        let mut header = header.clone();
        header.armed = false;
        header.encrypted = false;
        header.chunk = Some(position);
        Self {
            header,
            payload: Payload::Chunk(slice),
        }
    }

    /// Assemble an unarmed envelope from already serialized content
    /// (`[private_header_len][message_type][body]`). Used by disarming.
    pub fn from_plain_content(mut header: PublicHeader, content: Bytes) -> Self {
        header.armed = false;
        header.encrypted = false;
        Self {
            header,
            payload: Payload::plain(content),
        }
    }

    /// Assemble an armed envelope. `header` must already carry the arming flags.
    pub fn from_armed_content(
        header: PublicHeader,
        signature: [u8; SIGNATURE_LEN],
        content: Bytes,
    ) -> Self {
        Self {
            header,
            payload: Payload::Armed { signature, content },
        }
    }

    /// Parse a packet. Only the public header is validated here.
    pub fn decode(packet: Bytes) -> Result<Self, WireError> {
        let (header, consumed) = PublicHeader::read_from(&packet)?;
        let rest = packet.slice(consumed..);

        let payload = if header.chunk.is_some() {
            Payload::Chunk(rest)
        } else if header.armed {
            if rest.len() < SIGNATURE_LEN {
                return Err(WireError::MalformedEnvelope("armed payload shorter than signature"));
            }
            let mut signature = [0u8; SIGNATURE_LEN];
            signature.copy_from_slice(&rest[..SIGNATURE_LEN]);
            Payload::Armed {
                signature,
                content: rest.slice(SIGNATURE_LEN..),
            }
        } else {
            Payload::plain(rest)
        };

        Ok(Self { header, payload })
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        self.header.write_to(&mut out);
        match &self.payload {
            Payload::Plain { content, .. } => out.extend_from_slice(content),
            Payload::Armed { signature, content } => {
                out.extend_from_slice(signature);
                out.extend_from_slice(content);
            }
            Payload::Chunk(slice) => out.extend_from_slice(slice),
        }
        out.freeze()
    }

    pub fn encoded_len(&self) -> usize {
        self.header.encoded_len() + self.payload.len()
    }

    // ── Public header accessors ──────────────────────────────────────────────

    pub fn header(&self) -> &PublicHeader {
        &self.header
    }

    pub fn id(&self) -> Nonce {
        self.header.id
    }

    pub fn network_id(&self) -> i32 {
        self.header.network_id
    }

    pub fn sender(&self) -> PublicKey {
        self.header.sender
    }

    pub fn proof_of_work(&self) -> ProofOfWork {
        self.header.proof_of_work
    }

    pub fn recipient(&self) -> PublicKey {
        self.header.recipient
    }

    pub fn hop_count(&self) -> u8 {
        self.header.hop_count
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.payload, Payload::Armed { .. })
    }

    pub fn is_chunk(&self) -> bool {
        self.header.chunk.is_some()
    }

    /// `Some` only when `is_chunk()`.
    pub fn chunk_position(&self) -> Option<ChunkPosition> {
        self.header.chunk
    }

    pub fn chunk_no(&self) -> Option<u16> {
        self.header.chunk.map(ChunkPosition::chunk_no)
    }

    /// `Some` only on the head chunk.
    pub fn total_chunks(&self) -> Option<u16> {
        self.header.chunk.and_then(ChunkPosition::total_chunks)
    }

    /// Same envelope one hop further.
    pub fn increment_hop_count(mut self) -> Self {
        self.header.hop_count = self.header.hop_count.saturating_add(1);
        self
    }

    // ── Lazy content accessors ───────────────────────────────────────────────

    /// The decoded body. Parsed on first call.
    pub fn body(&self) -> Result<&Body, WireError> {
        match &self.payload {
            Payload::Plain { content, parsed } => parsed
                .get_or_init(|| parse_content(content))
                .as_ref()
                .map_err(Clone::clone),
            Payload::Armed { .. } => Err(invalid("envelope is armed")),
            Payload::Chunk(_) => Err(invalid("envelope is a chunk")),
        }
    }

    pub fn message_type(&self) -> Result<MessageType, WireError> {
        self.body().map(Body::message_type)
    }

    /// Message type readable without disarming: from unarmed content or
    /// from armed content that is only authenticated. `None` for chunks and
    /// encrypted content.
    pub fn visible_message_type(&self) -> Option<MessageType> {
        let content = match &self.payload {
            Payload::Plain { content, .. } => content,
            Payload::Armed { content, .. } if !self.header.encrypted => content,
            _ => return None,
        };
        MessageType::try_from(*content.get(1)?).ok()
    }

    /// Serialized private header and body of an unarmed envelope.
    pub fn plain_content(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Plain { content, .. } => Some(content),
            _ => None,
        }
    }

    /// Signature and content of an armed envelope.
    pub fn armed_content(&self) -> Option<(&[u8; SIGNATURE_LEN], &Bytes)> {
        match &self.payload {
            Payload::Armed { signature, content } => Some((signature, content)),
            _ => None,
        }
    }

    /// Raw slice carried by a chunk.
    pub fn chunk_payload(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Chunk(slice) => Some(slice),
            _ => None,
        }
    }
}

fn parse_content(content: &Bytes) -> Result<Body, WireError> {
    let header_len = *content.first().ok_or_else(|| invalid("private header missing"))? as usize;
    if header_len == 0 || content.len() < 1 + header_len {
        return Err(invalid("private header truncated"));
    }
    let message_type = MessageType::try_from(content[1])?;
    Body::parse(message_type, content.slice(1 + header_len..))
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.header.id == other.header.id
    }
}

impl Eq for Envelope {}

impl Hash for Envelope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.header.id.hash(state);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: PublicKey = PublicKey([0xa1; 32]);
    const BOB: PublicKey = PublicKey([0xb0; 32]);

    fn envelope(body: Body) -> Envelope {
        Envelope::new(1, ALICE, ProofOfWork(42), BOB, body)
    }

    #[test]
    fn decode_restores_public_header_and_body() {
        let original = envelope(Body::Application(Bytes::from_static(b"hello")));
        let decoded = Envelope::decode(original.encode()).unwrap();

        assert_eq!(decoded, original);
        assert_eq!(decoded.header(), original.header());
        assert_eq!(decoded.message_type().unwrap(), MessageType::Application);
        assert_eq!(
            decoded.body().unwrap(),
            &Body::Application(Bytes::from_static(b"hello"))
        );
    }

    #[test]
    fn control_bodies_survive_the_wire() {
        let ack = Nonce::random();
        let bodies = [
            Body::Discovery { children_time: 1_700_000_000_000 },
            Body::Acknowledgement { corresponding_id: ack },
            Body::Unite {
                public_key: PublicKey([0x33; 32]),
                address: "192.0.2.7:22527".parse().unwrap(),
            },
            Body::Unite {
                public_key: PublicKey([0x44; 32]),
                address: "[2001:db8::1]:9000".parse().unwrap(),
            },
        ];
        for body in bodies {
            let decoded = Envelope::decode(envelope(body.clone()).encode()).unwrap();
            assert_eq!(decoded.body().unwrap(), &body);
        }
    }

    #[test]
    fn corrupt_body_fails_lazily() {
        let mut packet = BytesMut::from(&envelope(Body::Discovery { children_time: 0 }).encode()[..]);
        packet.truncate(packet.len() - 3);

        let decoded = Envelope::decode(packet.freeze()).expect("public header is intact");
        assert_eq!(decoded.sender(), ALICE);
        assert!(matches!(
            decoded.body(),
            Err(WireError::InvalidMessageFormat(_))
        ));
        // cached: same answer on the second call
        assert!(decoded.message_type().is_err());
    }

    #[test]
    fn unknown_message_type_fails_lazily() {
        let original = envelope(Body::Application(Bytes::new()));
        let mut packet = BytesMut::from(&original.encode()[..]);
        let type_offset = original.header().encoded_len() + 1;
        packet[type_offset] = 0x7f;

        let decoded = Envelope::decode(packet.freeze()).unwrap();
        assert!(decoded.body().unwrap_err().to_string().contains("0x7f"));
    }

    #[test]
    fn truncated_packet_is_malformed() {
        let packet = envelope(Body::Application(Bytes::new())).encode();
        assert!(matches!(
            Envelope::decode(packet.slice(..40)),
            Err(WireError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn hop_count_increment_leaves_identity() {
        let original = envelope(Body::Application(Bytes::from_static(b"x")));
        let id = original.id();
        let forwarded = original.clone().increment_hop_count().increment_hop_count();
        assert_eq!(forwarded.hop_count(), 2);
        assert_eq!(original.hop_count(), 0);
        assert_eq!(forwarded.id(), id);

        let decoded = Envelope::decode(forwarded.encode()).unwrap();
        assert_eq!(decoded.hop_count(), 2);
    }

    #[test]
    fn chunk_accessors_only_on_chunks() {
        let original = envelope(Body::Application(Bytes::from_static(b"abc")));
        assert!(!original.is_chunk());
        assert_eq!(original.chunk_no(), None);

        let head = Envelope::chunk(
            original.header(),
            ChunkPosition::Head { total_chunks: 2 },
            Bytes::from_static(b"ab"),
        );
        let decoded = Envelope::decode(head.encode()).unwrap();
        assert_eq!(decoded.chunk_no(), Some(0));
        assert_eq!(decoded.total_chunks(), Some(2));
        assert_eq!(decoded.chunk_payload().unwrap().as_ref(), b"ab");
        assert!(decoded.body().is_err());
    }

    #[test]
    fn equality_is_by_id() {
        let a = envelope(Body::Application(Bytes::from_static(b"a")));
        let b = Envelope::with_header(a.header().clone(), Body::Application(Bytes::from_static(b"b")));
        let c = envelope(Body::Application(Bytes::from_static(b"a")));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
