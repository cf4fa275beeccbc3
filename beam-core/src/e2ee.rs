//! End-to-end encryption for one transfer: ephemeral X25519 agreement, HKDF-SHA256 key
//! derivation, short fingerprints, per-chunk ChaCha20-Poly1305 with a random 96-bit nonce.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroize;

/// Nonce prepended to every sealed chunk.
pub const NONCE_LEN: usize = 12;
/// Poly1305 tag appended by the cipher.
pub const TAG_LEN: usize = 16;
/// Bytes a sealed chunk carries on top of its plaintext.
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

const KEY_INFO: &[u8] = b"beam-chunk-key-v1";

/// Ephemeral key pair for one transfer negotiation. Consumed by `complete`.
pub struct Handshake {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl Handshake {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key as carried in `file_offer` / `file_response` (`pubkey`, base64).
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Agree with the peer's public key and derive the transfer's session.
    pub fn complete(self, peer_public_b64: &str) -> Result<E2eeSession, E2eeError> {
        let raw = BASE64
            .decode(peer_public_b64.trim())
            .map_err(|_| E2eeError::InvalidPublicKey)?;
        let bytes: [u8; 32] = raw.try_into().map_err(|_| E2eeError::InvalidPublicKey)?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(bytes));
        if !shared.was_contributory() {
            return Err(E2eeError::InvalidPublicKey);
        }
        let mut secret = shared.to_bytes();
        let key = derive_session_key(&secret);
        let local_fingerprint = fingerprint(&secret);
        secret.zeroize();
        Ok(E2eeSession {
            key: key?,
            local_fingerprint,
            remote_fingerprint: None,
        })
    }
}

/// Derive the 32-byte chunk key from the raw shared secret.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> Result<[u8; 32], E2eeError> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hk.expand(KEY_INFO, &mut key).map_err(|_| E2eeError::Key)?;
    Ok(key)
}

/// Human-comparable digest of the shared secret: first 8 bytes of SHA-256, `AB-CD-..`.
pub fn fingerprint(shared_secret: &[u8; 32]) -> String {
    let digest = Sha256::digest(shared_secret);
    digest[..8]
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join("-")
}

/// Encrypt a chunk: `nonce || ciphertext+tag`.
pub fn seal_chunk(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, E2eeError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| E2eeError::Key)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| E2eeError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a chunk produced by `seal_chunk`. Any tampering or wrong key is an error.
pub fn open_chunk(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, E2eeError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(E2eeError::Truncated(sealed.len()));
    }
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| E2eeError::Key)?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| E2eeError::Decrypt)
}

/// Encryption state bound to a single transfer. The key is wiped when the session drops.
pub struct E2eeSession {
    key: [u8; 32],
    local_fingerprint: String,
    remote_fingerprint: Option<String>,
}

impl E2eeSession {
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, E2eeError> {
        seal_chunk(&self.key, plaintext)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, E2eeError> {
        open_chunk(&self.key, sealed)
    }

    pub fn local_fingerprint(&self) -> &str {
        &self.local_fingerprint
    }

    pub fn remote_fingerprint(&self) -> Option<&str> {
        self.remote_fingerprint.as_deref()
    }

    pub fn set_remote_fingerprint(&mut self, fingerprint: String) {
        self.remote_fingerprint = Some(fingerprint);
    }

    /// Advisory only: a mismatch is reported, transfers are not blocked on it.
    pub fn is_verified(&self) -> bool {
        self.remote_fingerprint.as_deref() == Some(self.local_fingerprint.as_str())
    }
}

impl Drop for E2eeSession {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for E2eeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("E2eeSession")
            .field("local_fingerprint", &self.local_fingerprint)
            .field("remote_fingerprint", &self.remote_fingerprint)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum E2eeError {
    #[error("invalid peer public key")]
    InvalidPublicKey,
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("sealed chunk too short ({0} bytes)")]
    Truncated(usize),
}
