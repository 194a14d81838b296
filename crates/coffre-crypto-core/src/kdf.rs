//! Argon2id derivation of a wrapping key from an application password.
//!
//! Backs the `ApplicationPassword` policy wherever the platform key store
//! cannot bind an item to a password on its own.

use crate::error::CryptoError;
use crate::memory::SecretBytes;
use crate::symmetric::KEY_LEN;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Salt length stored next to every password-sealed item.
pub const SALT_LEN: usize = 16;

/// Argon2id cost parameters, in the `argon2` crate's units.
///
/// `m_cost` is in KiB. The defaults (19 MiB, 2 passes, 1 lane) keep an
/// interactive unlock well under a second on phone-class hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PasswordKdfParams {
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for PasswordKdfParams {
    fn default() -> Self {
        Self {
            m_cost: 19_456,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

impl PasswordKdfParams {
    fn to_argon2(self) -> Result<argon2::Params, CryptoError> {
        argon2::Params::new(self.m_cost, self.t_cost, self.p_cost, Some(KEY_LEN))
            .map_err(|e| CryptoError::KeyDerivation(format!("invalid argon2 params: {e}")))
    }

    /// Check the parameters without running a derivation.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyDerivation` if `argon2` rejects them.
    pub fn validate(self) -> Result<(), CryptoError> {
        self.to_argon2().map(|_| ())
    }
}

/// Fresh random salt for a new password-sealed item.
///
/// # Errors
///
/// Returns `CryptoError::SecureMemory` if the CSPRNG fails.
pub fn generate_salt() -> Result<[u8; SALT_LEN], CryptoError> {
    SecretBytes::<SALT_LEN>::random().map(|s| *s.expose())
}

/// Derive the 256-bit AES key for `password` and `salt`.
///
/// # Errors
///
/// Returns `CryptoError::KeyDerivation` if the salt is shorter than
/// [`SALT_LEN`], the parameters are invalid, or Argon2 fails to allocate.
pub fn derive_password_key(
    password: &[u8],
    salt: &[u8],
    params: PasswordKdfParams,
) -> Result<SecretBytes<KEY_LEN>, CryptoError> {
    if salt.len() < SALT_LEN {
        return Err(CryptoError::KeyDerivation(format!(
            "salt too short: {} bytes (minimum {SALT_LEN})",
            salt.len()
        )));
    }
    let argon2 = argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        params.to_argon2()?,
    );

    let mut out = [0u8; KEY_LEN];
    let derived = argon2.hash_password_into(password, salt, &mut out);
    let key = SecretBytes::new(out);
    out.zeroize();
    derived.map_err(|e| CryptoError::KeyDerivation(format!("argon2id failed: {e}")))?;
    Ok(key)
}
