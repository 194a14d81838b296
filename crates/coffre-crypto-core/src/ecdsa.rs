//! ECDSA over NIST P-256 / P-384.
//!
//! Hardware key stores only ever hand out the public half of a key pair, as
//! an uncompressed SEC1 point (`0x04 || X || Y`). [`verify`] checks any
//! signature a backend produces against that point. [`SoftwareKeyPair`] is
//! the same key in process memory, for the in-memory backend and tests.
//!
//! Signatures are ASN.1 DER (X9.62). The digest follows the curve size:
//! SHA-256 for P-256 and SHA-384 for P-384.

use crate::error::CryptoError;
use crate::memory::SecretBuffer;
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Curve size of a signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeySizeClass {
    P256,
    P384,
}

/// Digest and encoding a signature is produced with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    /// `ecdsaSignatureMessageX962SHA256` / `SHA256withECDSA`.
    EcdsaSha256,
    /// `ecdsaSignatureMessageX962SHA384` / `SHA384withECDSA`.
    EcdsaSha384,
}

impl KeySizeClass {
    #[must_use]
    pub const fn bits(self) -> u16 {
        match self {
            Self::P256 => 256,
            Self::P384 => 384,
        }
    }

    /// Length of the uncompressed SEC1 public point.
    #[must_use]
    pub const fn public_key_len(self) -> usize {
        match self {
            Self::P256 => 65,
            Self::P384 => 97,
        }
    }

    #[must_use]
    pub const fn signature_algorithm(self) -> SignatureAlgorithm {
        match self {
            Self::P256 => SignatureAlgorithm::EcdsaSha256,
            Self::P384 => SignatureAlgorithm::EcdsaSha384,
        }
    }

    /// Infer the curve from the length of an uncompressed public point.
    #[must_use]
    pub const fn from_public_key_len(len: usize) -> Option<Self> {
        match len {
            65 => Some(Self::P256),
            97 => Some(Self::P384),
            _ => None,
        }
    }

    fn signing_alg(self) -> &'static signature::EcdsaSigningAlgorithm {
        match self {
            Self::P256 => &signature::ECDSA_P256_SHA256_ASN1_SIGNING,
            Self::P384 => &signature::ECDSA_P384_SHA384_ASN1_SIGNING,
        }
    }

    fn verification_alg(self) -> &'static signature::EcdsaVerificationAlgorithm {
        match self {
            Self::P256 => &signature::ECDSA_P256_SHA256_ASN1,
            Self::P384 => &signature::ECDSA_P384_SHA384_ASN1,
        }
    }
}

impl fmt::Display for KeySizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::P256 => f.write_str("P-256"),
            Self::P384 => f.write_str("P-384"),
        }
    }
}

/// Verify an ASN.1 DER signature against an uncompressed public point.
///
/// # Errors
///
/// Returns `CryptoError::InvalidKeyMaterial` if `public_key` has the wrong
/// length for `size`, and `CryptoError::Signature` if the signature does not
/// verify.
pub fn verify(
    size: KeySizeClass,
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    if public_key.len() != size.public_key_len() {
        return Err(CryptoError::InvalidKeyMaterial(format!(
            "{size} public key must be {} bytes, got {}",
            size.public_key_len(),
            public_key.len()
        )));
    }
    signature::UnparsedPublicKey::new(size.verification_alg(), public_key)
        .verify(message, signature)
        .map_err(|_| CryptoError::Signature("signature verification failed".into()))
}

/// ECDSA key pair held in process memory.
///
/// The PKCS#8 document stays in a [`SecretBuffer`]; the parsed ring key is
/// rebuilt for each signature so no second copy lingers.
pub struct SoftwareKeyPair {
    size: KeySizeClass,
    pkcs8: SecretBuffer,
    public_key: Vec<u8>,
}

impl SoftwareKeyPair {
    /// Generate a fresh key pair.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Signature` if ring fails to generate or parse the key.
    pub fn generate(size: KeySizeClass) -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let doc = EcdsaKeyPair::generate_pkcs8(size.signing_alg(), &rng)
            .map_err(|_| CryptoError::Signature(format!("{size} key generation failed")))?;
        Self::from_pkcs8(size, doc.as_ref())
    }

    /// Load a key pair from a PKCS#8 v1 document.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyMaterial` if the document is not a
    /// key on `size`'s curve.
    pub fn from_pkcs8(size: KeySizeClass, pkcs8: &[u8]) -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let pair = EcdsaKeyPair::from_pkcs8(size.signing_alg(), pkcs8, &rng)
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("{size} PKCS#8 rejected: {e}")))?;
        Ok(Self {
            size,
            public_key: pair.public_key().as_ref().to_vec(),
            pkcs8: SecretBuffer::new(pkcs8)?,
        })
    }

    #[must_use]
    pub const fn size(&self) -> KeySizeClass {
        self.size
    }

    /// Uncompressed SEC1 public point.
    #[must_use]
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Sign `message`, returning an ASN.1 DER signature.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Signature` if ring reports a failure.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let rng = SystemRandom::new();
        let pair = EcdsaKeyPair::from_pkcs8(self.size.signing_alg(), self.pkcs8.expose(), &rng)
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("stored PKCS#8 rejected: {e}")))?;
        pair.sign(&rng, message)
            .map(|sig| sig.as_ref().to_vec())
            .map_err(|_| CryptoError::Signature("ECDSA signing failed".into()))
    }
}

impl fmt::Debug for SoftwareKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareKeyPair")
            .field("size", &self.size)
            .field("pkcs8", &"***")
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_is_uncompressed_point() {
        for size in [KeySizeClass::P256, KeySizeClass::P384] {
            let pair = SoftwareKeyPair::generate(size).expect("generate should succeed");
            assert_eq!(pair.public_key().len(), size.public_key_len());
            assert_eq!(pair.public_key()[0], 0x04);
            assert_eq!(
                KeySizeClass::from_public_key_len(pair.public_key().len()),
                Some(size)
            );
        }
    }

    #[test]
    fn signature_verifies_against_public_key() {
        for size in [KeySizeClass::P256, KeySizeClass::P384] {
            let pair = SoftwareKeyPair::generate(size).expect("generate should succeed");
            let sig = pair.sign(b"challenge").expect("sign should succeed");
            verify(size, pair.public_key(), b"challenge", &sig).expect("verify should succeed");
        }
    }

    #[test]
    fn verify_rejects_other_message_and_other_key() {
        let a = SoftwareKeyPair::generate(KeySizeClass::P256).expect("generate should succeed");
        let b = SoftwareKeyPair::generate(KeySizeClass::P256).expect("generate should succeed");
        let sig = a.sign(b"message").expect("sign should succeed");
        assert!(verify(KeySizeClass::P256, a.public_key(), b"massage", &sig).is_err());
        assert!(verify(KeySizeClass::P256, b.public_key(), b"message", &sig).is_err());
    }

    #[test]
    fn verify_rejects_wrong_point_length() {
        let a = SoftwareKeyPair::generate(KeySizeClass::P256).expect("generate should succeed");
        let sig = a.sign(b"m").expect("sign should succeed");
        let err = verify(KeySizeClass::P384, a.public_key(), b"m", &sig).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKeyMaterial(_)));
    }

    #[test]
    fn pkcs8_for_wrong_curve_rejected() {
        let rng = SystemRandom::new();
        let doc = EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .expect("generate should succeed");
        assert!(SoftwareKeyPair::from_pkcs8(KeySizeClass::P384, doc.as_ref()).is_err());
        assert!(SoftwareKeyPair::from_pkcs8(KeySizeClass::P256, doc.as_ref()).is_ok());
    }

    #[test]
    fn debug_hides_private_key() {
        let pair = SoftwareKeyPair::generate(KeySizeClass::P256).expect("generate should succeed");
        let dbg = format!("{pair:?}");
        assert!(dbg.contains("P256"));
        assert!(dbg.contains("***"));
    }

    #[test]
    fn digest_follows_curve() {
        assert_eq!(
            KeySizeClass::P256.signature_algorithm(),
            SignatureAlgorithm::EcdsaSha256
        );
        assert_eq!(
            KeySizeClass::P384.signature_algorithm(),
            SignatureAlgorithm::EcdsaSha384
        );
        assert_eq!(KeySizeClass::P384.to_string(), "P-384");
    }
}
