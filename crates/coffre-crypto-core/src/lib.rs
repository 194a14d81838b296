//! `coffre-crypto-core`: secure memory, buffer ownership and software crypto
//! primitives for the coffre credential vault.
//!
//! No I/O, no async, no platform bindings. Everything that touches a native
//! key store lives in `coffre-vault`.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod error;
pub mod memory;
pub mod ownership;

pub mod ecdsa;
pub mod kdf;
pub mod symmetric;

pub use ecdsa::{verify, KeySizeClass, SignatureAlgorithm, SoftwareKeyPair};
pub use error::{CapacityError, CryptoError};
pub use kdf::{derive_password_key, generate_salt, PasswordKdfParams, SALT_LEN};
pub use memory::{disable_core_dumps, LockedRegion, SecretBuffer, SecretBytes};
pub use ownership::{CallerOwned, ManagedBuffer, ManagedString, Owner, Ownership, VaultOwned};
pub use symmetric::{open, open_in_place, seal, seal_in_place, KEY_LEN, SEAL_OVERHEAD};
