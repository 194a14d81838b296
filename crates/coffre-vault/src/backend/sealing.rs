//! Application-password envelope.
//!
//! Where a store cannot bind an item to a password itself, the payload is
//! sealed with AES-256-GCM under an Argon2id key derived from the password
//! captured by the prompt. Salt and cost parameters travel with the
//! ciphertext so a later config change does not strand old items.

use coffre_crypto_core::{
    derive_password_key, generate_salt, open, seal, CryptoError, ManagedBuffer, PasswordKdfParams,
    VaultOwned, SALT_LEN,
};
use serde::{Deserialize, Serialize};

use super::BackendError;
use crate::gate::AuthToken;

const AAD_PREFIX: &[u8] = b"coffre.app-password.v1:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PasswordEnvelope {
    pub salt: [u8; SALT_LEN],
    pub params: PasswordKdfParams,
    pub sealed: Vec<u8>,
}

fn aad(service: &str) -> Vec<u8> {
    [AAD_PREFIX, service.as_bytes()].concat()
}

fn password(auth: Option<&AuthToken>) -> Result<&[u8], BackendError> {
    match auth {
        Some(token) if !token.expose().is_empty() => Ok(token.expose()),
        _ => Err(BackendError::AuthenticationFailed),
    }
}

/// Seal `payload` under the password carried by `auth`.
///
/// # Errors
///
/// `AuthenticationFailed` without a password; crypto faults otherwise.
pub(crate) fn seal_with_password(
    auth: Option<&AuthToken>,
    params: PasswordKdfParams,
    service: &str,
    payload: &[u8],
) -> Result<PasswordEnvelope, BackendError> {
    let salt = generate_salt()?;
    let key = derive_password_key(password(auth)?, &salt, params)?;
    Ok(PasswordEnvelope {
        salt,
        params,
        sealed: seal(&key, &aad(service), payload)?,
    })
}

/// Open an envelope. A wrong password is an authentication failure, not a
/// crypto fault.
///
/// # Errors
///
/// `AuthenticationFailed` for a missing or wrong password.
pub(crate) fn open_with_password(
    auth: Option<&AuthToken>,
    service: &str,
    envelope: &PasswordEnvelope,
) -> Result<ManagedBuffer<VaultOwned>, BackendError> {
    let key = derive_password_key(password(auth)?, &envelope.salt, envelope.params)?;
    match open(&key, &aad(service), &envelope.sealed) {
        Ok(plain) => Ok(ManagedBuffer::from_secret(plain)),
        Err(CryptoError::Decryption) => Err(BackendError::AuthenticationFailed),
        Err(e) => Err(e.into()),
    }
}
