//! Storage backends: the capability interface the vault drives.
//!
//! ```text
//! Backend (sealed trait, Presenter supertrait)
//! ├── AppleBackend<K: KeychainServices>   (Keychain, Secure Enclave, LocalAuthentication)
//! ├── AndroidBackend<K: KeystoreBridge>   (Android Keystore, BiometricPrompt, prefs store)
//! └── MemoryBackend                       (in-process, scripted prompts, fault injection)
//! ```
//!
//! The set is closed: `Backend` cannot be implemented outside this crate.
//! Native glue plugs in one level lower, through each platform backend's
//! bridge trait, which speaks in native status codes.

pub mod android;
pub mod apple;
pub mod memory;
pub(crate) mod sealing;

use coffre_crypto_core::{CryptoError, KeySizeClass, ManagedBuffer, PasswordKdfParams, VaultOwned};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gate::{AuthToken, Presenter};
use crate::policy::{AccessControlPolicy, PlatformProfile};

pub use android::{AndroidBackend, KeystoreBridge, KeystoreError};
pub use apple::{AppleBackend, KeychainServices, OsStatus};
pub use memory::{FaultPoint, MemoryBackend, ScriptedResponse};

// ---------------------------------------------------------------------------
// Shared types
// ---------------------------------------------------------------------------

/// Failure reported by a backend, already translated from native codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Duplicate,
    #[error("user cancelled")]
    Cancelled,
    #[error("authentication failed")]
    AuthenticationFailed,
    /// Key permanently invalidated (biometric enrollment changed).
    #[error("key invalidated")]
    Invalidated,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("platform status {code}: {message}")]
    Platform { code: i64, message: String },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Identity of a credential item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub service: String,
    pub account: String,
    pub access_group: Option<String>,
}

impl ItemKey {
    #[must_use]
    pub fn new(service: &str, account: &str, access_group: Option<&str>) -> Self {
        Self {
            service: service.to_owned(),
            account: account.to_owned(),
            access_group: access_group.map(str::to_owned),
        }
    }

    /// Same service and group, different account.
    #[must_use]
    pub fn with_account(&self, account: &str) -> Self {
        Self {
            service: self.service.clone(),
            account: account.to_owned(),
            access_group: self.access_group.clone(),
        }
    }

    /// Whether this key falls under a `(service, group)` scope. A `None`
    /// group scope matches every group.
    #[must_use]
    pub fn in_scope(&self, service: &str, access_group: Option<&str>) -> bool {
        self.service == service
            && access_group.is_none_or(|g| self.access_group.as_deref() == Some(g))
    }
}

/// A credential to write.
#[derive(Debug)]
pub struct NewItem<'a> {
    pub key: ItemKey,
    pub payload: &'a [u8],
    pub policy: AccessControlPolicy,
    pub synchronizable: bool,
}

/// Everything known about an item without reading its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMeta {
    pub policy: AccessControlPolicy,
    pub synchronizable: bool,
    pub access_group: Option<String>,
    /// Unix seconds.
    pub created_at: u64,
    /// Unix seconds.
    pub modified_at: u64,
    /// The protecting key was invalidated by a biometric enrollment change.
    pub invalidated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    Signing,
    Symmetric,
}

/// Parameters of a key to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    pub tag: String,
    pub kind: KeyKind,
    /// Curve for signing keys; `None` for AES-256 symmetric keys.
    pub size: Option<KeySizeClass>,
    pub policy: AccessControlPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMeta {
    pub tag: String,
    pub kind: KeyKind,
    pub size: Option<KeySizeClass>,
    pub policy: AccessControlPolicy,
    pub hardware_backed: bool,
    /// Unix seconds.
    pub created_at: u64,
    pub invalidated: bool,
}

/// Where a key's private material lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityLevel {
    Software,
    TrustedEnvironment,
    StrongBox,
    SecureEnclave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAttestation {
    pub security_level: SecurityLevel,
    /// DER certificates, leaf first. Empty where the platform has none.
    pub certificate_chain: Vec<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Capability interface
// ---------------------------------------------------------------------------

mod sealed {
    pub trait Sealed {}
    impl<K: super::KeychainServices> Sealed for super::AppleBackend<K> {}
    impl<K: super::KeystoreBridge> Sealed for super::AndroidBackend<K> {}
    impl Sealed for super::MemoryBackend {}
}

/// Storage, key and prompt capabilities of one platform.
///
/// Implementations do not run the gate; the vault does that first and
/// passes the resulting token in `auth`.
pub trait Backend: Presenter + sealed::Sealed {
    fn profile(&self) -> PlatformProfile;

    /// Argon2id cost for emulated application passwords. Backends that
    /// seal natively ignore it.
    fn set_password_kdf(&mut self, _kdf: PasswordKdfParams) {}

    // -- credential items ---------------------------------------------------

    /// Insert a new item. Fails with `Duplicate` if the key is taken.
    ///
    /// # Errors
    ///
    /// Any [`BackendError`] the platform reports.
    fn add_item(&self, item: &NewItem<'_>, auth: Option<&AuthToken>) -> Result<(), BackendError>;

    /// # Errors
    ///
    /// Any [`BackendError`] the platform reports.
    fn item_meta(&self, key: &ItemKey) -> Result<Option<ItemMeta>, BackendError>;

    /// Read an item's payload into vault-owned storage.
    ///
    /// # Errors
    ///
    /// `NotFound`, an authentication failure, or a platform fault.
    fn copy_item(
        &self,
        key: &ItemKey,
        auth: Option<&AuthToken>,
    ) -> Result<ManagedBuffer<VaultOwned>, BackendError>;

    /// Replace an item's payload, keeping its policy.
    ///
    /// # Errors
    ///
    /// `NotFound`, an authentication failure, or a platform fault.
    fn update_item(
        &self,
        key: &ItemKey,
        payload: &[u8],
        auth: Option<&AuthToken>,
    ) -> Result<(), BackendError>;

    /// Move an item to another account under the same service and group.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Duplicate` if the target exists, or a platform fault.
    fn rename_item(&self, key: &ItemKey, new_account: &str) -> Result<(), BackendError>;

    /// Returns whether an item was removed.
    ///
    /// # Errors
    ///
    /// Platform faults only; absence is `Ok(false)`.
    fn delete_item(&self, key: &ItemKey) -> Result<bool, BackendError>;

    /// Raw account names under a service, staging entries included.
    ///
    /// # Errors
    ///
    /// Platform faults only.
    fn accounts(&self, service: &str, access_group: Option<&str>)
        -> Result<Vec<String>, BackendError>;

    // -- keys ---------------------------------------------------------------

    /// Create a signing key and return its uncompressed public point.
    ///
    /// # Errors
    ///
    /// `Duplicate` if the tag is taken, or a platform fault.
    fn generate_key(&self, spec: &KeySpec) -> Result<Vec<u8>, BackendError>;

    /// Create an AES-256 key.
    ///
    /// # Errors
    ///
    /// `Unsupported` where the platform has no symmetric key store.
    fn generate_symmetric_key(&self, spec: &KeySpec) -> Result<(), BackendError>;

    /// # Errors
    ///
    /// Platform faults only.
    fn key_meta(&self, tag: &str) -> Result<Option<KeyMeta>, BackendError>;

    /// Every key tag this backend manages.
    ///
    /// # Errors
    ///
    /// Platform faults only.
    fn key_tags(&self) -> Result<Vec<String>, BackendError>;

    /// # Errors
    ///
    /// `NotFound`, an authentication failure, or a platform fault.
    fn sign(
        &self,
        tag: &str,
        message: &[u8],
        auth: Option<&AuthToken>,
    ) -> Result<Vec<u8>, BackendError>;

    /// Returns whether a key was removed.
    ///
    /// # Errors
    ///
    /// Platform faults only.
    fn delete_key(&self, tag: &str) -> Result<bool, BackendError>;

    /// Encrypt `buf` in place with a symmetric key.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Unsupported`, an authentication failure, or a crypto fault.
    fn encrypt_in_place(
        &self,
        tag: &str,
        buf: &mut Vec<u8>,
        auth: Option<&AuthToken>,
    ) -> Result<(), BackendError>;

    /// Decrypt `buf` in place with a symmetric key.
    ///
    /// # Errors
    ///
    /// As [`Self::encrypt_in_place`]; tampered input is a crypto fault.
    fn decrypt_in_place(
        &self,
        tag: &str,
        buf: &mut Vec<u8>,
        auth: Option<&AuthToken>,
    ) -> Result<(), BackendError>;

    /// # Errors
    ///
    /// `NotFound` or a platform fault.
    fn attestation(&self, tag: &str) -> Result<KeyAttestation, BackendError>;
}

/// Seconds since the Unix epoch, saturating to zero on a clock before it.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_matching() {
        let key = ItemKey::new("wallet", "seed", Some("team.shared"));
        assert!(key.in_scope("wallet", None));
        assert!(key.in_scope("wallet", Some("team.shared")));
        assert!(!key.in_scope("wallet", Some("other")));
        assert!(!key.in_scope("mail", None));
        assert!(!ItemKey::new("wallet", "seed", None).in_scope("wallet", Some("team.shared")));
    }

    #[test]
    fn with_account_keeps_service_and_group() {
        let key = ItemKey::new("wallet", "seed", Some("g"));
        let moved = key.with_account("other");
        assert_eq!(moved.service, "wallet");
        assert_eq!(moved.account, "other");
        assert_eq!(moved.access_group.as_deref(), Some("g"));
    }
}
