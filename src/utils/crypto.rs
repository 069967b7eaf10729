//! # Session Crypto
//!
//! Primitives that seal and open packet bodies.
//!
//! ## Components
//! - **ECDH**: X25519 key pairs and shared secrets for the key exchange
//! - **Tea**: 16-round TEA in the chained, randomly padded mode used by legacy packets
//! - **Aes**: AES-256-GCM used by current packets
//! - **Cipher**: selects one of the two by protocol version
//!
//! Both symmetric ciphers take the same 32-byte key; TEA uses its first 16 bytes.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::{ProtocolError, Result};

/// 32-byte symmetric key shared by both ciphers
pub type SymmetricKey = [u8; 32];

/// Compiled-in server public key that bootstraps the very first exchange
pub const INITIAL_PUBLIC_KEY: [u8; 32] = [
    0x04, 0xEB, 0xCA, 0x94, 0xD7, 0x33, 0xE3, 0x99, 0xB2, 0xDB, 0x96, 0xEA, 0xCD, 0xD3, 0xF6,
    0x9A, 0x8B, 0xB0, 0xF7, 0x42, 0x24, 0xE2, 0xB4, 0x4E, 0x33, 0x57, 0xFF, 0xD9, 0x03, 0x0F,
    0xF2, 0x46,
];

/// An X25519 key pair; the private half is wiped on drop
#[derive(Clone)]
pub struct KeyPair {
    private: StaticSecret,
    public: [u8; 32],
}

impl KeyPair {
    pub fn from_private(private: StaticSecret) -> Self {
        let public = PublicKey::from(&private).to_bytes();
        Self { private, public }
    }

    pub fn private(&self) -> &StaticSecret {
        &self.private
    }

    pub fn public(&self) -> &[u8; 32] {
        &self.public
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

pub fn generate_key_pair() -> KeyPair {
    KeyPair::from_private(StaticSecret::random_from_rng(OsRng))
}

/// X25519 agreement; symmetric in the two parties
pub fn compute_shared_secret(own_private: &StaticSecret, peer_public: &[u8; 32]) -> [u8; 32] {
    own_private
        .diffie_hellman(&PublicKey::from(*peer_public))
        .to_bytes()
}

/// SHA-256 over a label and the given parts
pub fn derive_key(label: &[u8], parts: &[&[u8]]) -> SymmetricKey {
    let mut hasher = Sha256::new();
    hasher.update(label);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub(crate) fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut out = [0u8; N];
    getrandom::fill(&mut out).map_err(|_| ProtocolError::EncryptionFailure)?;
    Ok(out)
}

/// Symmetric cipher selected by the envelope's version marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    Tea,
    Aes,
}

impl Cipher {
    pub fn encrypt(self, key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            Cipher::Tea => Tea::new(key).encrypt(plaintext),
            Cipher::Aes => Aes::new(key)?.encrypt(plaintext),
        }
    }

    pub fn decrypt(self, key: &SymmetricKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self {
            Cipher::Tea => Tea::new(key).decrypt(ciphertext),
            Cipher::Aes => Aes::new(key)?.decrypt(ciphertext),
        }
    }
}

const TEA_DELTA: u32 = 0x9E37_79B9;
const TEA_ROUNDS: u32 = 16;
const TEA_BLOCK: usize = 8;
const TEA_TRAILER: usize = 7;
const TEA_SALT: usize = 2;

/// TEA block cipher with chained blocks and random-fill padding.
///
/// Layout before encryption:
/// `[rand & 0xF8 | fill] [fill random] [2 random] [plaintext] [7 zero]`, padded so the
/// total is a multiple of eight.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct Tea {
    key: [u32; 4],
}

impl Tea {
    pub fn new(key: &[u8]) -> Self {
        let mut words = [0u32; 4];
        for (word, chunk) in words.iter_mut().zip(key.chunks_exact(4)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self { key: words }
    }

    fn encipher(&self, block: u64) -> u64 {
        let k = &self.key;
        let mut y = (block >> 32) as u32;
        let mut z = block as u32;
        let mut sum = 0u32;
        for _ in 0..TEA_ROUNDS {
            sum = sum.wrapping_add(TEA_DELTA);
            y = y.wrapping_add(
                (z << 4).wrapping_add(k[0]) ^ z.wrapping_add(sum) ^ (z >> 5).wrapping_add(k[1]),
            );
            z = z.wrapping_add(
                (y << 4).wrapping_add(k[2]) ^ y.wrapping_add(sum) ^ (y >> 5).wrapping_add(k[3]),
            );
        }
        (u64::from(y) << 32) | u64::from(z)
    }

    fn decipher(&self, block: u64) -> u64 {
        let k = &self.key;
        let mut y = (block >> 32) as u32;
        let mut z = block as u32;
        let mut sum = TEA_DELTA.wrapping_mul(TEA_ROUNDS);
        for _ in 0..TEA_ROUNDS {
            z = z.wrapping_sub(
                (y << 4).wrapping_add(k[2]) ^ y.wrapping_add(sum) ^ (y >> 5).wrapping_add(k[3]),
            );
            y = y.wrapping_sub(
                (z << 4).wrapping_add(k[0]) ^ z.wrapping_add(sum) ^ (z >> 5).wrapping_add(k[1]),
            );
            sum = sum.wrapping_sub(TEA_DELTA);
        }
        (u64::from(y) << 32) | u64::from(z)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let fill = (TEA_BLOCK - (plaintext.len() + 1 + TEA_SALT + TEA_TRAILER) % TEA_BLOCK)
            % TEA_BLOCK;
        let total = 1 + fill + TEA_SALT + plaintext.len() + TEA_TRAILER;

        let noise = random_bytes::<{ 1 + TEA_BLOCK + TEA_SALT }>()?;
        let mut buf = Vec::with_capacity(total);
        buf.push((noise[0] & 0xF8) | fill as u8);
        buf.extend_from_slice(&noise[1..1 + fill + TEA_SALT]);
        buf.extend_from_slice(plaintext);
        buf.resize(total, 0);

        let mut prev_plain = 0u64;
        let mut prev_cipher = 0u64;
        for block in buf.chunks_exact_mut(TEA_BLOCK) {
            let p = u64::from_be_bytes(to_block(block));
            let mixed = p ^ prev_cipher;
            let c = self.encipher(mixed) ^ prev_plain;
            block.copy_from_slice(&c.to_be_bytes());
            prev_plain = mixed;
            prev_cipher = c;
        }
        Ok(buf)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() % TEA_BLOCK != 0 || ciphertext.len() < 2 * TEA_BLOCK {
            return Err(ProtocolError::DecryptionFailure);
        }

        let mut out = ciphertext.to_vec();
        let mut prev_mixed = 0u64;
        let mut prev_cipher = 0u64;
        for block in out.chunks_exact_mut(TEA_BLOCK) {
            let c = u64::from_be_bytes(to_block(block));
            let mixed = self.decipher(c ^ prev_mixed);
            block.copy_from_slice(&(mixed ^ prev_cipher).to_be_bytes());
            prev_mixed = mixed;
            prev_cipher = c;
        }

        let fill = usize::from(out[0] & 0x07);
        let start = 1 + fill + TEA_SALT;
        let end = out.len() - TEA_TRAILER;
        if start > end || out[end..].iter().any(|&b| b != 0) {
            return Err(ProtocolError::DecryptionFailure);
        }
        Ok(out[start..end].to_vec())
    }
}

fn to_block(bytes: &[u8]) -> [u8; TEA_BLOCK] {
    let mut block = [0u8; TEA_BLOCK];
    block.copy_from_slice(bytes);
    block
}

const AES_NONCE_LEN: usize = 12;

/// AES-256-GCM with a random 12-byte nonce prepended to the ciphertext
pub struct Aes {
    cipher: Aes256Gcm,
}

impl Aes {
    pub fn new(key: &SymmetricKey) -> Result<Self> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| ProtocolError::EncryptionFailure)?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = random_bytes::<AES_NONCE_LEN>()?;
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ProtocolError::EncryptionFailure)?;
        let mut out = Vec::with_capacity(AES_NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < AES_NONCE_LEN {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce, sealed) = ciphertext.split_at(AES_NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}
