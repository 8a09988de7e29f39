//! Node identity: a static keypair plus a proof of work bound to its public key.
//!
//! The proof of work is the cost of entering the network. A proof is valid
//! for a difficulty `d` when BLAKE3(public_key || pow as big-endian u32)
//! starts with `d` zero hex nibbles. Every hop checks it before doing any
//! other work on a message.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{hash, Keypair};
use crate::wire::{ProofOfWork, PublicKey};

/// Default difficulty for newly joined networks.
pub const DEFAULT_POW_DIFFICULTY: u8 = 6;

// ── Proof of Work ─────────────────────────────────────────────────────────────

impl ProofOfWork {
    pub fn is_valid(self, key: &PublicKey, difficulty: u8) -> bool {
        leading_zero_nibbles(&pow_hash(key, self.0)) >= difficulty
    }

    /// Search nonces from 0 upwards until one satisfies `difficulty`.
    ///
    /// Expected work is 16^difficulty hashes. Difficulties above 8 may
    /// not be satisfiable within the u32 nonce space.
    pub fn generate(key: &PublicKey, difficulty: u8) -> Self {
        let mut nonce: u32 = 0;
        loop {
            if ProofOfWork(nonce).is_valid(key, difficulty) {
                return ProofOfWork(nonce);
            }
            nonce = nonce.wrapping_add(1);
        }
    }
}

fn pow_hash(key: &PublicKey, nonce: u32) -> [u8; 32] {
    let mut input = [0u8; 36];
    input[..32].copy_from_slice(&key.0);
    input[32..].copy_from_slice(&nonce.to_be_bytes());
    hash(&input)
}

fn leading_zero_nibbles(digest: &[u8; 32]) -> u8 {
    let mut count = 0;
    for byte in digest {
        if *byte == 0 {
            count += 2;
            continue;
        }
        if byte >> 4 == 0 {
            count += 1;
        }
        break;
    }
    count
}

// ── Identity ──────────────────────────────────────────────────────────────────

pub struct Identity {
    keypair: Keypair,
    proof_of_work: ProofOfWork,
}

impl Identity {
    pub fn new(keypair: Keypair, proof_of_work: ProofOfWork) -> Self {
        Self {
            keypair,
            proof_of_work,
        }
    }

    /// Fresh keypair with a proof of work for `difficulty`.
    pub fn generate(difficulty: u8) -> Self {
        let keypair = Keypair::generate();
        let proof_of_work = ProofOfWork::generate(&keypair.public_key(), difficulty);
        Self::new(keypair, proof_of_work)
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn proof_of_work(&self) -> ProofOfWork {
        self.proof_of_work
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Load the identity stored at `path`, or generate and store one.
    ///
    /// A stored proof of work that no longer satisfies `difficulty` is
    /// recomputed and written back. The key itself is never replaced.
    pub fn load_or_generate(path: &Path, difficulty: u8) -> Result<Self, IdentityError> {
        if !path.exists() {
            let identity = Self::generate(difficulty);
            identity.save(path)?;
            tracing::info!(path = %path.display(), public_key = %identity.public_key(), "generated new identity");
            return Ok(identity);
        }

        let text = Zeroizing::new(
            std::fs::read_to_string(path)
                .map_err(|e| IdentityError::ReadFailed(path.to_path_buf(), e))?,
        );
        let stored: IdentityFile = toml::from_str(&text)
            .map_err(|_| IdentityError::Invalid(path.to_path_buf(), "not an identity file"))?;
        let private = Zeroizing::new(
            hex::decode(&stored.private_key)
                .map_err(|_| IdentityError::Invalid(path.to_path_buf(), "private key is not hex"))?,
        );
        let private: [u8; 32] = private
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::Invalid(path.to_path_buf(), "private key must be 32 bytes"))?;

        let keypair = Keypair::from_private(private);
        let mut proof_of_work = ProofOfWork(stored.proof_of_work);
        let valid = proof_of_work.is_valid(&keypair.public_key(), difficulty);
        if !valid {
            tracing::warn!(difficulty, "stored proof of work too weak, recomputing");
            proof_of_work = ProofOfWork::generate(&keypair.public_key(), difficulty);
        }

        let identity = Self::new(keypair, proof_of_work);
        if !valid {
            identity.save(path)?;
        }
        Ok(identity)
    }

    fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IdentityError::WriteFailed(path.to_path_buf(), e))?;
        }
        let stored = IdentityFile {
            private_key: hex::encode(*self.keypair.private_bytes()),
            proof_of_work: self.proof_of_work.0,
        };
        let text = Zeroizing::new(
            toml::to_string(&stored)
                .map_err(|_| IdentityError::Invalid(path.to_path_buf(), "serialization failed"))?,
        );
        std::fs::write(path, text.as_bytes())
            .map_err(|e| IdentityError::WriteFailed(path.to_path_buf(), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| IdentityError::WriteFailed(path.to_path_buf(), e))?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    private_key: String,
    proof_of_work: u32,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("invalid identity file {0}: {1}")]
    Invalid(PathBuf, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_proof_satisfies_difficulty() {
        let key = PublicKey([0x5a; 32]);
        let pow = ProofOfWork::generate(&key, 3);
        assert!(pow.is_valid(&key, 3));
        assert!(pow.is_valid(&key, 0));
    }

    #[test]
    fn nibble_counting() {
        let mut digest = [0xffu8; 32];
        assert_eq!(leading_zero_nibbles(&digest), 0);
        digest[0] = 0x0f;
        assert_eq!(leading_zero_nibbles(&digest), 1);
        digest[0] = 0x00;
        digest[1] = 0x01;
        assert_eq!(leading_zero_nibbles(&digest), 3);
    }

    #[test]
    fn identity_persists_across_loads() {
        let dir = std::env::temp_dir().join(format!("tether-identity-test-{}", std::process::id()));
        let path = dir.join("identity.toml");
        let _ = std::fs::remove_dir_all(&dir);

        let first = Identity::load_or_generate(&path, 1).expect("generate");
        let second = Identity::load_or_generate(&path, 1).expect("load");
        assert_eq!(first.public_key(), second.public_key());
        assert_eq!(first.proof_of_work(), second.proof_of_work());

        // raising the difficulty keeps the key and upgrades the proof
        let third = Identity::load_or_generate(&path, 2).expect("upgrade");
        assert_eq!(third.public_key(), first.public_key());
        assert!(third.proof_of_work().is_valid(&third.public_key(), 2));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn garbage_identity_file_is_rejected() {
        let dir = std::env::temp_dir().join(format!("tether-identity-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("identity.toml");
        std::fs::write(&path, "private_key = \"zz\"\nproof_of_work = 1\n").unwrap();

        assert!(matches!(
            Identity::load_or_generate(&path, 0),
            Err(IdentityError::Invalid(_, _))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
