//! Cryptographic primitives for tether.
//!
//! Provides two things:
//!   1. BLAKE3 hashing, used for proof of work and key derivation
//!   2. Envelope arming: end-to-end authentication and encryption between
//!      the sender and the recipient named in the public header
//!
//! Arming derives a pairwise key from a static X25519 exchange between the
//! sender's private key and the recipient's public key:
//!
//!   key = BLAKE3-derive-key(ARMING_CONTEXT, X25519(sender_secret, recipient_public))
//!
//! and seals with XChaCha20-Poly1305, using the 24-byte message id as nonce
//! and the public header (hop count zeroed) as associated data. Application
//! and Unite contents are encrypted. Discovery and Acknowledgement contents
//! stay readable and are only authenticated.
//!
//! All key material is zeroized when dropped.

use bytes::Bytes;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::envelope::Envelope;
use crate::wire::{PublicKey, SIGNATURE_LEN};

/// Domain separation for the pairwise arming key. Changing it breaks
/// interoperability with every deployed node.
const ARMING_CONTEXT: &str = "tether 2024-01-01 envelope arming v1";

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A node's long-term static X25519 keypair.
///
/// The public key is the node's address on the overlay. The private key
/// never leaves this struct.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    private: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = X25519Public::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the private key.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = X25519Public::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.public)
    }

    /// Symmetric key shared with `peer`. Both sides derive the same key.
    ///
    /// Fails for low-order peer keys, which would yield an all-zero secret.
    fn pairwise_key(&self, peer: &PublicKey) -> Option<Zeroizing<[u8; 32]>> {
        let secret = StaticSecret::from(*self.private);
        let shared = secret.diffie_hellman(&X25519Public::from(peer.0));
        if !shared.was_contributory() {
            return None;
        }
        Some(Zeroizing::new(blake3::derive_key(
            ARMING_CONTEXT,
            shared.as_bytes(),
        )))
    }

    fn cipher_for(&self, peer: &PublicKey) -> Option<XChaCha20Poly1305> {
        let key = self.pairwise_key(peer)?;
        Some(XChaCha20Poly1305::new(Key::from_slice(key.as_slice())))
    }
}

// ── Arming ────────────────────────────────────────────────────────────────────

/// Arm an unarmed, unchunked envelope sent by `keypair`'s owner.
///
/// The returned envelope has the same id and public header fields, with the
/// armed flag set (and the encrypted flag for Application and Unite).
pub fn arm(envelope: Envelope, keypair: &Keypair) -> Result<Envelope, CryptoError> {
    if envelope.is_chunk() {
        return Err(CryptoError::ArmingFailed("chunks cannot be armed"));
    }
    let content = envelope
        .plain_content()
        .ok_or(CryptoError::ArmingFailed("envelope is already armed"))?;
    if envelope.sender() != keypair.public_key() {
        return Err(CryptoError::ArmingFailed("sender does not match keypair"));
    }
    let message_type = envelope
        .message_type()
        .map_err(|_| CryptoError::ArmingFailed("content does not parse"))?;

    let encrypt = message_type.is_encrypted_when_armed();
    let mut header = envelope.header().clone();
    header.armed = true;
    header.encrypted = encrypt;

    let cipher = keypair
        .cipher_for(&header.recipient)
        .ok_or(CryptoError::ArmingFailed("invalid recipient key"))?;
    let nonce = XNonce::from_slice(&header.id.0);
    let mut aad = header.associated_data();

    let (tag, sealed) = if encrypt {
        let mut buffer = content.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(nonce, &aad, &mut buffer)
            .map_err(|_| CryptoError::ArmingFailed("encryption failed"))?;
        (tag, Bytes::from(buffer))
    } else {
        aad.extend_from_slice(content);
        let tag = cipher
            .encrypt_in_place_detached(nonce, &aad, &mut [])
            .map_err(|_| CryptoError::ArmingFailed("signing failed"))?;
        (tag, content.clone())
    };

    let mut signature = [0u8; SIGNATURE_LEN];
    signature.copy_from_slice(tag.as_slice());
    Ok(Envelope::from_armed_content(header, signature, sealed))
}

/// Verify and decrypt an armed envelope addressed to `keypair`'s owner.
pub fn disarm(envelope: Envelope, keypair: &Keypair) -> Result<Envelope, CryptoError> {
    let (signature, content) = envelope
        .armed_content()
        .ok_or(CryptoError::DisarmingFailed("envelope is not armed"))?;
    let header = envelope.header();
    if header.recipient != keypair.public_key() {
        return Err(CryptoError::DisarmingFailed("wrong recipient"));
    }

    let cipher = keypair
        .cipher_for(&header.sender)
        .ok_or(CryptoError::DisarmingFailed("invalid sender key"))?;
    let nonce = XNonce::from_slice(&header.id.0);
    let tag = Tag::from_slice(signature);
    let mut aad = header.associated_data();

    let plain = if header.encrypted {
        let mut buffer = content.to_vec();
        cipher
            .decrypt_in_place_detached(nonce, &aad, &mut buffer, tag)
            .map_err(|_| CryptoError::DisarmingFailed("signature mismatch"))?;
        Bytes::from(buffer)
    } else {
        aad.extend_from_slice(content);
        cipher
            .decrypt_in_place_detached(nonce, &aad, &mut [], tag)
            .map_err(|_| CryptoError::DisarmingFailed("signature mismatch"))?;
        content.clone()
    };

    Ok(Envelope::from_plain_content(header.clone(), plain))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("arming failed: {0}")]
    ArmingFailed(&'static str),

    #[error("disarming failed: {0}")]
    DisarmingFailed(&'static str),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
