//! Cryptographic error types for `coffre-crypto-core`.

use thiserror::Error;

/// Errors produced by cryptographic and secure-memory operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Password key derivation failed (Argon2id parameter validation, memory allocation).
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Symmetric encryption failure (AES-256-GCM).
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Authentication tag verification failed: ciphertext tampered or wrong key.
    #[error("decryption failed: authentication tag mismatch")]
    Decryption,

    /// ECDSA key generation, signing or verification failure.
    #[error("signature error: {0}")]
    Signature(String),

    /// Invalid key material (wrong length, unparseable PKCS#8, corrupted bytes).
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Secure memory allocation failure (CSPRNG, mlock, invalid UTF-8 secret).
    #[error("secure memory error: {0}")]
    SecureMemory(String),
}

/// A caller-supplied destination was too small for the bytes being handed over.
///
/// `required` is the exact size needed, so the caller can reallocate and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("buffer too small: {required} bytes required, {capacity} available")]
pub struct CapacityError {
    pub required: usize,
    pub capacity: usize,
}
