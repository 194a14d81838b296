//! AES-256-GCM sealing for software-held keys.
//!
//! Used where no hardware key store holds the key: the application-password
//! envelope and the in-memory backend's symmetric keys.
//!
//! Wire format: `nonce (12) || ciphertext || tag (16)`.

use crate::error::CryptoError;
use crate::memory::{SecretBuffer, SecretBytes};
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead;
use zeroize::Zeroize;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// Bytes added to a plaintext by [`seal`].
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

fn cipher(key: &SecretBytes<KEY_LEN>) -> Result<aead::LessSafeKey, CryptoError> {
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, key.expose())
        .map_err(|_| CryptoError::Encryption("AES-256-GCM key rejected".into()))?;
    Ok(aead::LessSafeKey::new(unbound))
}

/// Encrypt `buf` in place, turning a plaintext into the sealed wire format.
///
/// # Errors
///
/// Returns `CryptoError::Encryption` if sealing fails; `buf` is wiped in that case.
pub fn seal_in_place(
    key: &SecretBytes<KEY_LEN>,
    aad: &[u8],
    buf: &mut Vec<u8>,
) -> Result<(), CryptoError> {
    let sealing = cipher(key)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| CryptoError::Encryption(format!("nonce generation failed: {e}")))?;

    let Ok(tag) = sealing.seal_in_place_separate_tag(
        aead::Nonce::assume_unique_for_key(nonce),
        aead::Aad::from(aad),
        buf,
    ) else {
        buf.zeroize();
        return Err(CryptoError::Encryption("AES-256-GCM seal failed".into()));
    };

    let mut wire = Vec::with_capacity(buf.len().saturating_add(SEAL_OVERHEAD));
    wire.extend_from_slice(&nonce);
    wire.extend_from_slice(buf);
    wire.extend_from_slice(tag.as_ref());
    *buf = wire;
    Ok(())
}

/// Decrypt a sealed `buf` in place, leaving only the plaintext.
///
/// # Errors
///
/// Returns `CryptoError::Decryption` if the input is truncated, was produced
/// under another key or AAD, or has been modified.
pub fn open_in_place(
    key: &SecretBytes<KEY_LEN>,
    aad: &[u8],
    buf: &mut Vec<u8>,
) -> Result<(), CryptoError> {
    if buf.len() < SEAL_OVERHEAD {
        return Err(CryptoError::Decryption);
    }
    let opening = cipher(key)?;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&buf[..NONCE_LEN]);

    let plain_len = opening
        .open_within(
            aead::Nonce::assume_unique_for_key(nonce),
            aead::Aad::from(aad),
            buf,
            NONCE_LEN..,
        )
        .map_err(|_| CryptoError::Decryption)?
        .len();
    buf.truncate(plain_len);
    Ok(())
}

/// Seal a copy of `plaintext`.
///
/// # Errors
///
/// See [`seal_in_place`].
pub fn seal(
    key: &SecretBytes<KEY_LEN>,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut buf = plaintext.to_vec();
    seal_in_place(key, aad, &mut buf)?;
    Ok(buf)
}

/// Open `sealed` into a fresh [`SecretBuffer`].
///
/// # Errors
///
/// See [`open_in_place`].
pub fn open(
    key: &SecretBytes<KEY_LEN>,
    aad: &[u8],
    sealed: &[u8],
) -> Result<SecretBuffer, CryptoError> {
    let mut buf = sealed.to_vec();
    match open_in_place(key, aad, &mut buf) {
        Ok(()) => Ok(SecretBuffer::from_vec(buf)),
        Err(e) => {
            buf.zeroize();
            Err(e)
        }
    }
}
