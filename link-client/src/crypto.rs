//! Cryptographic primitives for phonelink.
//!
//! This module provides:
//! - Per-message data keys with XChaCha20-Poly1305 (192-bit nonces)
//! - X25519 keypairs for devices and sync groups
//! - Data-key wrapping: ephemeral-static X25519, HKDF-SHA256, XChaCha20-Poly1305
//! - Sealing arbitrary bytes (key bundles) for one public key
//!
//! # Security Notes
//!
//! - A data key is generated fresh for every message and never reused
//! - XChaCha20 uses 192-bit nonces (24 bytes), safe for random generation
//! - Each wrap uses a fresh ephemeral key, so wrapped keys are unlinkable
//! - Key-encryption keys are bound to both public keys via the HKDF info

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use link_types::{EnvelopeVersion, ErrorKind, KeyBundle, PublicKey, SyncGroupId, WrappedKey};
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XChaCha20-Poly1305 and X25519 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

const WRAP_SALT: &[u8] = b"phonelink-wrap-v1";

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Invalid nonce length.
    #[error("invalid nonce length: expected {NONCE_SIZE}, got {0}")]
    InvalidNonceLength(usize),

    /// Key agreement produced an unusable secret (low-order public key).
    #[error("key agreement failed: recipient key is not contributory")]
    WeakPublicKey,

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),
}

impl CryptoError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}

// ============================================================================
// Data keys
// ============================================================================

/// A symmetric per-message key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey([u8; KEY_SIZE]);

impl DataKey {
    /// Generate a fresh random key.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Create from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encrypt data using XChaCha20-Poly1305.
    ///
    /// Returns (ciphertext, nonce). The nonce is random.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes).expect("getrandom failed");
        let nonce = XNonce::from_slice(&nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

        Ok((ciphertext, nonce_bytes))
    }

    /// Decrypt data using XChaCha20-Poly1305.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength(nonce.len()));
        }
        let nonce = XNonce::from_slice(nonce);

        let cipher = XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

// Don't leak keys in debug output
impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataKey([REDACTED])")
    }
}

// ============================================================================
// Keypairs
// ============================================================================

/// An X25519 keypair (a device key or the shared sync-group key).
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: X25519Public,
}

impl KeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    /// Restore from private key bytes.
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let mut arr: [u8; KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            })?;
        let secret = StaticSecret::from(arr);
        arr.zeroize();
        let public = X25519Public::from(&secret);
        Ok(Self { secret, public })
    }

    /// Public half.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_bytes(self.public.to_bytes())
    }

    /// Private key bytes, zeroized when dropped.
    pub fn private_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Package this keypair for hand-off to another device.
    pub fn to_bundle(&self, version: EnvelopeVersion, sync_group_id: Option<SyncGroupId>) -> KeyBundle {
        KeyBundle {
            version,
            sync_group_id,
            private_key: self.private_bytes().to_vec(),
            public_key: self.public.as_bytes().to_vec(),
        }
    }

    /// Restore from a received bundle, checking the public half matches.
    pub fn from_bundle(bundle: &KeyBundle) -> Result<Self, CryptoError> {
        let pair = Self::from_private_bytes(&bundle.private_key)?;
        if pair.public.as_bytes().as_slice() != bundle.public_key.as_slice() {
            return Err(CryptoError::KeyDerivationFailed(
                "bundle public key does not match private key".into(),
            ));
        }
        Ok(pair)
    }

    fn agree(&self, their_public: &[u8; KEY_SIZE]) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
        let shared = self.secret.diffie_hellman(&X25519Public::from(*their_public));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakPublicKey);
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

// Don't leak keys in debug output
impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

// ============================================================================
// Wrapping
// ============================================================================

/// Derive the key-encryption key for one wrap.
fn derive_kek(
    shared: &[u8; KEY_SIZE],
    epk: &[u8; KEY_SIZE],
    recipient: &[u8; KEY_SIZE],
) -> Result<DataKey, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(WRAP_SALT), shared);
    let mut info = [0u8; KEY_SIZE * 2];
    info[..KEY_SIZE].copy_from_slice(epk);
    info[KEY_SIZE..].copy_from_slice(recipient);

    let mut kek = [0u8; KEY_SIZE];
    hkdf.expand(&info, &mut kek)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    let key = DataKey(kek);
    kek.zeroize();
    Ok(key)
}

/// Wrap a data key for one recipient public key.
pub fn wrap_key(recipient: &PublicKey, key: &DataKey) -> Result<WrappedKey, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let epk = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&X25519Public::from(*recipient.as_bytes()));
    if !shared.was_contributory() {
        return Err(CryptoError::WeakPublicKey);
    }

    let kek = derive_kek(shared.as_bytes(), epk.as_bytes(), recipient.as_bytes())?;
    let (ct, nonce) = kek.encrypt(key.as_bytes())?;

    Ok(WrappedKey {
        epk: epk.as_bytes().to_vec(),
        nonce: nonce.to_vec(),
        ct,
    })
}

/// Recover a data key wrapped for `keypair`'s public key.
pub fn unwrap_key(keypair: &KeyPair, wrapped: &WrappedKey) -> Result<DataKey, CryptoError> {
    let epk: [u8; KEY_SIZE] =
        wrapped
            .epk
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: wrapped.epk.len(),
            })?;

    let shared = keypair.agree(&epk)?;
    let kek = derive_kek(&shared, &epk, keypair.public.as_bytes())?;
    let raw = Zeroizing::new(kek.decrypt(&wrapped.ct, &wrapped.nonce)?);
    DataKey::from_slice(&raw)
}

/// Bytes sealed for one public key: a wrapped data key plus the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBytes {
    /// Data key wrapped for the recipient.
    pub wrapped_key: WrappedKey,
    /// Payload nonce.
    pub nonce: Vec<u8>,
    /// Payload ciphertext.
    pub ciphertext: Vec<u8>,
}

/// Seal arbitrary bytes so that only `recipient` can open them.
pub fn seal_for(recipient: &PublicKey, plaintext: &[u8]) -> Result<SealedBytes, CryptoError> {
    let key = DataKey::random();
    let wrapped_key = wrap_key(recipient, &key)?;
    let (ciphertext, nonce) = key.encrypt(plaintext)?;
    Ok(SealedBytes {
        wrapped_key,
        nonce: nonce.to_vec(),
        ciphertext,
    })
}

/// Open bytes sealed with [`seal_for`].
pub fn open_sealed(
    keypair: &KeyPair,
    wrapped_key: &WrappedKey,
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let key = unwrap_key(keypair, wrapped_key)?;
    Ok(Zeroizing::new(key.decrypt(ciphertext, nonce)?))
}
