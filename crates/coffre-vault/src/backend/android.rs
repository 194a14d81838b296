//! Android backend: Keystore keys, BiometricPrompt, and a preferences store.
//!
//! Credential payloads do not live in the Keystore itself. Each item gets
//! its own AES-256-GCM Keystore key carrying the item's user-authentication
//! parameters; the ciphertext goes into a private preferences file as a
//! JSON record keyed by service and account.
//!
//! ```text
//! prefs["coffre.item:<b64 service>:<b64 account>"] = {alias, policy, sealed, ..}
//! keystore[alias]                                   = AES key (auth-bound)
//! ```

use std::sync::Arc;

use coffre_crypto_core::{
    CryptoError, KeySizeClass, ManagedBuffer, PasswordKdfParams, SecretBuffer, VaultOwned,
};
use data_encoding::{BASE64, BASE64URL_NOPAD, HEXLOWER};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::sealing::{open_with_password, seal_with_password, PasswordEnvelope};
use super::{
    unix_now, Backend, BackendError, ItemKey, ItemMeta, KeyAttestation, KeyKind, KeyMeta,
    KeySpec, NewItem, SecurityLevel,
};
use crate::gate::{
    AuthToken, AvailabilityStatus, BiometricKind, PromptHandle, PromptOutcome, PromptRequest,
    PromptResponder, Presenter,
};
use crate::policy::{
    resolve, AccessControlPolicy, AndroidProtection, Authenticators, PlatformProfile,
    PlatformProtection,
};

/// `BiometricPrompt.ERROR_*` codes.
pub mod biometric_error {
    pub const HW_UNAVAILABLE: i32 = 1;
    pub const UNABLE_TO_PROCESS: i32 = 2;
    pub const TIMEOUT: i32 = 3;
    pub const NO_SPACE: i32 = 4;
    pub const CANCELED: i32 = 5;
    pub const LOCKOUT: i32 = 7;
    pub const VENDOR: i32 = 8;
    pub const LOCKOUT_PERMANENT: i32 = 9;
    pub const USER_CANCELED: i32 = 10;
    pub const NO_BIOMETRICS: i32 = 11;
    pub const HW_NOT_PRESENT: i32 = 12;
    pub const NEGATIVE_BUTTON: i32 = 13;
    pub const NO_DEVICE_CREDENTIAL: i32 = 14;
    pub const SECURITY_UPDATE_REQUIRED: i32 = 15;
}

/// `BiometricManager.canAuthenticate` results.
pub mod can_authenticate {
    pub const SUCCESS: i32 = 0;
    pub const HW_UNAVAILABLE: i32 = 1;
    pub const NONE_ENROLLED: i32 = 11;
    pub const NO_HARDWARE: i32 = 12;
    pub const SECURITY_UPDATE_REQUIRED: i32 = 15;
}

/// Java exception classes the backend distinguishes.
pub mod exception {
    pub const KEY_PERMANENTLY_INVALIDATED: &str =
        "android.security.keystore.KeyPermanentlyInvalidatedException";
    pub const USER_NOT_AUTHENTICATED: &str =
        "android.security.keystore.UserNotAuthenticatedException";
    pub const STRONGBOX_UNAVAILABLE: &str =
        "android.security.keystore.StrongBoxUnavailableException";
    pub const AEAD_BAD_TAG: &str = "javax.crypto.AEADBadTagException";
}

const FEATURE_FINGERPRINT: &str = "android.hardware.fingerprint";
const FEATURE_FACE: &str = "android.hardware.biometrics.face";
const FEATURE_IRIS: &str = "android.hardware.biometrics.iris";

const ITEM_PREFIX: &str = "coffre.item:";
const KEY_PREFIX: &str = "coffre.key:";

// DER SubjectPublicKeyInfo prefixes in front of the uncompressed point.
const P256_SPKI_HEADER: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08,
    0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];
const P384_SPKI_HEADER: [u8; 23] = [
    0x30, 0x76, 0x30, 0x10, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x05,
    0x2b, 0x81, 0x04, 0x00, 0x22, 0x03, 0x62, 0x00,
];

// ---------------------------------------------------------------------------
// Bridge types
// ---------------------------------------------------------------------------

/// A Java exception surfaced through the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class}: {message}")]
pub struct KeystoreError {
    pub class: String,
    pub message: String,
}

impl KeystoreError {
    pub fn new(class: &str, message: impl Into<String>) -> Self {
        Self {
            class: class.to_owned(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is(&self, class: &str) -> bool {
        self.class == class
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    /// EC key pair, `PURPOSE_SIGN`.
    Sign,
    /// AES-256-GCM key, `PURPOSE_ENCRYPT | PURPOSE_DECRYPT`.
    EncryptDecrypt,
}

/// `KeyGenParameterSpec` fields the backend sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGenParameters {
    pub alias: String,
    pub purpose: KeyPurpose,
    pub curve: Option<KeySizeClass>,
    pub protection: AndroidProtection,
    pub strongbox: bool,
    pub attestation_challenge: Option<Vec<u8>>,
}

/// `KeyInfo` of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeystoreKeyInfo {
    pub security_level: SecurityLevel,
    /// Initialising an operation threw `KeyPermanentlyInvalidatedException`.
    pub invalidated: bool,
}

/// `BiometricPrompt.PromptInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiometricPromptInfo {
    pub title: String,
    pub negative_button: Option<String>,
    pub authenticators: Authenticators,
    pub confirmation_required: bool,
    /// Show a password field instead of a biometric prompt.
    pub password_entry: bool,
}

pub enum BiometricGrant {
    /// Handle of the authenticated operation session.
    Session(u64),
    Password(SecretBuffer),
}

/// `AuthenticationCallback` terminal events.
pub enum PromptCallback {
    Succeeded(BiometricGrant),
    Error(i32),
}

pub type PromptReply = Box<dyn FnOnce(PromptCallback) + Send>;

/// Keystore, BiometricPrompt and SharedPreferences calls.
///
/// Implemented by the host's JNI glue. Failures arrive as the Java
/// exception that was thrown.
pub trait KeystoreBridge: Send + Sync + 'static {
    /// `BiometricManager.canAuthenticate`.
    fn can_authenticate(&self, authenticators: Authenticators) -> i32;

    /// `PackageManager.hasSystemFeature`.
    fn has_system_feature(&self, feature: &str) -> bool;

    /// Show a prompt; the returned handle cancels it.
    ///
    /// # Errors
    ///
    /// The exception thrown while building the prompt.
    fn authenticate(
        &self,
        info: &BiometricPromptInfo,
        reply: PromptReply,
    ) -> Result<u64, KeystoreError>;

    /// `CancellationSignal.cancel`.
    fn cancel_authentication(&self, prompt: u64);

    /// Generate an EC pair; returns the DER `SubjectPublicKeyInfo`.
    ///
    /// # Errors
    ///
    /// The exception thrown by `KeyPairGenerator`.
    fn generate_key_pair(&self, params: &KeyGenParameters) -> Result<Vec<u8>, KeystoreError>;

    /// # Errors
    ///
    /// The exception thrown by `KeyGenerator`.
    fn generate_secret_key(&self, params: &KeyGenParameters) -> Result<(), KeystoreError>;

    /// # Errors
    ///
    /// The exception thrown by `KeyStore.getEntry`.
    fn key_info(&self, alias: &str) -> Result<Option<KeystoreKeyInfo>, KeystoreError>;

    /// `Signature.getInstance(algorithm)` over `message`, DER-encoded.
    ///
    /// # Errors
    ///
    /// The exception thrown by `Signature`.
    fn sign(
        &self,
        alias: &str,
        algorithm: &str,
        message: &[u8],
        session: Option<u64>,
    ) -> Result<Vec<u8>, KeystoreError>;

    /// AES/GCM/NoPadding; returns IV followed by ciphertext and tag.
    ///
    /// # Errors
    ///
    /// The exception thrown by `Cipher`.
    fn encrypt(
        &self,
        alias: &str,
        plaintext: &[u8],
        session: Option<u64>,
    ) -> Result<Vec<u8>, KeystoreError>;

    /// # Errors
    ///
    /// The exception thrown by `Cipher`.
    fn decrypt(
        &self,
        alias: &str,
        ciphertext: &[u8],
        session: Option<u64>,
    ) -> Result<SecretBuffer, KeystoreError>;

    /// # Errors
    ///
    /// The exception thrown by `KeyStore.deleteEntry`.
    fn delete_entry(&self, alias: &str) -> Result<(), KeystoreError>;

    /// DER certificates, leaf first.
    ///
    /// # Errors
    ///
    /// The exception thrown by `KeyStore.getCertificateChain`.
    fn certificate_chain(&self, alias: &str) -> Result<Vec<Vec<u8>>, KeystoreError>;

    /// # Errors
    ///
    /// The exception thrown while reading preferences.
    fn prefs_get(&self, name: &str) -> Result<Option<String>, KeystoreError>;

    /// Write and `commit()`.
    ///
    /// # Errors
    ///
    /// The exception thrown while committing.
    fn prefs_put(&self, name: &str, value: &str) -> Result<(), KeystoreError>;

    /// # Errors
    ///
    /// The exception thrown while committing.
    fn prefs_remove(&self, name: &str) -> Result<(), KeystoreError>;

    /// # Errors
    ///
    /// The exception thrown while reading preferences.
    fn prefs_keys(&self) -> Result<Vec<String>, KeystoreError>;
}

// ---------------------------------------------------------------------------
// Code translation
// ---------------------------------------------------------------------------

fn map_exception(e: KeystoreError) -> BackendError {
    match e.class.as_str() {
        exception::KEY_PERMANENTLY_INVALIDATED => BackendError::Invalidated,
        exception::USER_NOT_AUTHENTICATED => BackendError::AuthenticationFailed,
        exception::AEAD_BAD_TAG => BackendError::Crypto(CryptoError::Decryption),
        _ => BackendError::Platform {
            code: -1,
            message: e.to_string(),
        },
    }
}

fn outcome_for_error(code: i32) -> PromptOutcome {
    use biometric_error as e;
    match code {
        // TIMEOUT is the system dismissing the prompt, not a failed match.
        e::CANCELED | e::USER_CANCELED | e::NEGATIVE_BUTTON | e::TIMEOUT => {
            PromptOutcome::Cancelled
        }
        e::HW_UNAVAILABLE
        | e::LOCKOUT
        | e::LOCKOUT_PERMANENT
        | e::NO_BIOMETRICS
        | e::HW_NOT_PRESENT
        | e::NO_DEVICE_CREDENTIAL
        | e::SECURITY_UPDATE_REQUIRED => PromptOutcome::Unavailable,
        e::UNABLE_TO_PROCESS | e::NO_SPACE | e::VENDOR => PromptOutcome::Denied,
        other => {
            tracing::warn!(code = other, "unrecognised BiometricPrompt error");
            PromptOutcome::Denied
        }
    }
}

const fn availability_for(code: i32) -> AvailabilityStatus {
    match code {
        can_authenticate::SUCCESS => AvailabilityStatus::Available,
        can_authenticate::NONE_ENROLLED => AvailabilityStatus::NotEnrolled,
        _ => AvailabilityStatus::HardwareUnavailable,
    }
}

/// Strip the DER header from an EC `SubjectPublicKeyInfo`.
fn spki_to_point(size: KeySizeClass, der: &[u8]) -> Result<Vec<u8>, BackendError> {
    let header: &[u8] = match size {
        KeySizeClass::P256 => &P256_SPKI_HEADER,
        KeySizeClass::P384 => &P384_SPKI_HEADER,
    };
    match der.strip_prefix(header) {
        Some(point) if point.len() == size.public_key_len() && point.first() == Some(&0x04) => {
            Ok(point.to_vec())
        }
        _ => Err(BackendError::Platform {
            code: -1,
            message: format!("unexpected {size} SubjectPublicKeyInfo ({} bytes)", der.len()),
        }),
    }
}

const fn signature_algorithm(size: KeySizeClass) -> &'static str {
    match size {
        KeySizeClass::P256 => "SHA256withECDSA",
        KeySizeClass::P384 => "SHA384withECDSA",
    }
}

// ---------------------------------------------------------------------------
// Preference records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemRecord {
    service: String,
    account: String,
    access_group: Option<String>,
    alias: String,
    policy: u8,
    synchronizable: bool,
    created_at: u64,
    modified_at: u64,
    /// Base64 of the Keystore ciphertext.
    sealed: String,
    /// The plaintext under `sealed` is a JSON password envelope.
    #[serde(default)]
    password_sealed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyRecord {
    alias: String,
    kind: KeyKind,
    size: Option<KeySizeClass>,
    policy: u8,
    created_at: u64,
}

fn item_pref(service: &str, account: &str) -> String {
    format!(
        "{}{}",
        service_prefix(service),
        BASE64URL_NOPAD.encode(account.as_bytes())
    )
}

fn service_prefix(service: &str) -> String {
    format!("{ITEM_PREFIX}{}:", BASE64URL_NOPAD.encode(service.as_bytes()))
}

fn fresh_alias(prefix: &str) -> String {
    let mut id = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut id);
    format!("{prefix}.{}", HEXLOWER.encode(&id))
}

fn corrupt(what: &str, e: impl std::fmt::Display) -> BackendError {
    BackendError::Platform {
        code: -1,
        message: format!("corrupt {what} record: {e}"),
    }
}

fn session(auth: Option<&AuthToken>) -> Option<u64> {
    let bytes: [u8; 8] = auth?.expose().try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct AndroidBackend<K: KeystoreBridge> {
    bridge: Arc<K>,
    profile: PlatformProfile,
    kdf: PasswordKdfParams,
}

impl<K: KeystoreBridge> AndroidBackend<K> {
    /// `emulate_application_password` enables password-sealed items.
    pub fn new(bridge: K, emulate_application_password: bool) -> Self {
        Self {
            bridge: Arc::new(bridge),
            profile: PlatformProfile::android(emulate_application_password),
            kdf: PasswordKdfParams::default(),
        }
    }

    #[must_use]
    pub const fn with_kdf(mut self, kdf: PasswordKdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    #[must_use]
    pub const fn password_kdf(&self) -> PasswordKdfParams {
        self.kdf
    }

    pub fn bridge(&self) -> &K {
        &self.bridge
    }

    fn protection(
        &self,
        policy: AccessControlPolicy,
        profile: &PlatformProfile,
    ) -> Result<AndroidProtection, BackendError> {
        match resolve(policy, profile) {
            Ok(PlatformProtection::Android(p)) => Ok(p),
            Ok(PlatformProtection::Apple(_)) | Err(_) => Err(BackendError::Unsupported(format!(
                "{policy} cannot be expressed in the Android Keystore"
            ))),
        }
    }

    fn read_item(&self, key: &ItemKey) -> Result<Option<ItemRecord>, BackendError> {
        let Some(raw) = self
            .bridge
            .prefs_get(&item_pref(&key.service, &key.account))
            .map_err(map_exception)?
        else {
            return Ok(None);
        };
        let record: ItemRecord = serde_json::from_str(&raw).map_err(|e| corrupt("item", e))?;
        let visible = key.access_group.is_none() || record.access_group == key.access_group;
        Ok(visible.then_some(record))
    }

    fn write_item(&self, record: &ItemRecord) -> Result<(), BackendError> {
        let json = serde_json::to_string(record).map_err(|e| corrupt("item", e))?;
        self.bridge
            .prefs_put(&item_pref(&record.service, &record.account), &json)
            .map_err(map_exception)
    }

    fn read_key(&self, tag: &str) -> Result<Option<KeyRecord>, BackendError> {
        self.bridge
            .prefs_get(&format!("{KEY_PREFIX}{tag}"))
            .map_err(map_exception)?
            .map(|raw| serde_json::from_str(&raw).map_err(|e| corrupt("key", e)))
            .transpose()
    }

    fn write_key(&self, tag: &str, record: &KeyRecord) -> Result<(), BackendError> {
        let json = serde_json::to_string(record).map_err(|e| corrupt("key", e))?;
        self.bridge
            .prefs_put(&format!("{KEY_PREFIX}{tag}"), &json)
            .map_err(map_exception)
    }

    fn policy_of(code: u8) -> Result<AccessControlPolicy, BackendError> {
        AccessControlPolicy::from_code(code).ok_or_else(|| corrupt("policy", code))
    }

    fn is_invalidated(&self, alias: &str) -> Result<bool, BackendError> {
        Ok(self
            .bridge
            .key_info(alias)
            .map_err(map_exception)?
            .is_some_and(|info| info.invalidated))
    }

    /// Generate with StrongBox first, falling back to the TEE.
    fn generate(
        &self,
        mut params: KeyGenParameters,
        generate: impl Fn(&K, &KeyGenParameters) -> Result<Vec<u8>, KeystoreError>,
    ) -> Result<Vec<u8>, BackendError> {
        let bridge: &K = &self.bridge;
        params.strongbox = true;
        match generate(bridge, &params) {
            Err(e) if e.is(exception::STRONGBOX_UNAVAILABLE) => {
                tracing::debug!(alias = %params.alias, "StrongBox unavailable, using TEE");
                params.strongbox = false;
                generate(bridge, &params).map_err(map_exception)
            }
            other => other.map_err(map_exception),
        }
    }

    /// Keystore plaintext for a new payload: the payload itself, or a JSON
    /// password envelope around it.
    fn item_plaintext(
        &self,
        service: &str,
        protection: AndroidProtection,
        payload: &[u8],
        auth: Option<&AuthToken>,
    ) -> Result<SecretBuffer, BackendError> {
        if protection.password_sealed {
            let envelope = seal_with_password(auth, self.kdf, service, payload)?;
            serde_json::to_vec(&envelope)
                .map(SecretBuffer::from_vec)
                .map_err(|e| corrupt("envelope", e))
        } else {
            Ok(SecretBuffer::from_vec(payload.to_vec()))
        }
    }

    fn seal_record(
        &self,
        record: &ItemRecord,
        payload: &[u8],
        auth: Option<&AuthToken>,
    ) -> Result<String, BackendError> {
        let policy = Self::policy_of(record.policy)?;
        let protection = self.protection(policy, &self.profile)?;
        let plaintext = self.item_plaintext(&record.service, protection, payload, auth)?;
        let op = if protection.user_authentication_required {
            session(auth)
        } else {
            None
        };
        let sealed = self
            .bridge
            .encrypt(&record.alias, plaintext.expose(), op)
            .map_err(map_exception)?;
        Ok(BASE64.encode(&sealed))
    }

    fn open_record(
        &self,
        record: &ItemRecord,
        auth: Option<&AuthToken>,
    ) -> Result<ManagedBuffer<VaultOwned>, BackendError> {
        if self.is_invalidated(&record.alias)? {
            return Err(BackendError::Invalidated);
        }
        let sealed = BASE64
            .decode(record.sealed.as_bytes())
            .map_err(|e| corrupt("item", e))?;
        let op = if record.password_sealed { None } else { session(auth) };
        let plain = self
            .bridge
            .decrypt(&record.alias, &sealed, op)
            .map_err(map_exception)?;
        if !record.password_sealed {
            return Ok(ManagedBuffer::from_secret(plain));
        }
        let envelope: PasswordEnvelope =
            serde_json::from_slice(plain.expose()).map_err(|e| corrupt("envelope", e))?;
        open_with_password(auth, &record.service, &envelope)
    }
}

impl<K: KeystoreBridge> Presenter for AndroidBackend<K> {
    fn availability(&self) -> AvailabilityStatus {
        availability_for(self.bridge.can_authenticate(Authenticators::BIOMETRIC_STRONG))
    }

    fn biometric_kinds(&self) -> Vec<BiometricKind> {
        [
            (FEATURE_FINGERPRINT, BiometricKind::Fingerprint),
            (FEATURE_FACE, BiometricKind::Face),
            (FEATURE_IRIS, BiometricKind::Iris),
        ]
        .into_iter()
        .filter(|(feature, _)| self.bridge.has_system_feature(feature))
        .map(|(_, kind)| kind)
        .collect()
    }

    fn present(
        &self,
        request: &PromptRequest,
        responder: PromptResponder,
    ) -> Result<PromptHandle, BackendError> {
        let authenticators = if request.allow_device_credential {
            Authenticators::BIOMETRIC_STRONG | Authenticators::DEVICE_CREDENTIAL
        } else {
            Authenticators::BIOMETRIC_STRONG
        };
        let info = BiometricPromptInfo {
            title: request.title.clone(),
            // A negative button is not allowed alongside DEVICE_CREDENTIAL.
            negative_button: if request.allow_device_credential {
                None
            } else {
                request.fallback_title.clone()
            },
            authenticators,
            confirmation_required: request.require_explicit_confirmation,
            password_entry: request.capture_password,
        };
        let reply: PromptReply = Box::new(move |callback| {
            let outcome = match callback {
                PromptCallback::Succeeded(BiometricGrant::Session(handle)) => {
                    PromptOutcome::Approved(Some(AuthToken::new(&handle.to_le_bytes())))
                }
                PromptCallback::Succeeded(BiometricGrant::Password(password)) => {
                    PromptOutcome::Approved(Some(AuthToken::new(password.expose())))
                }
                PromptCallback::Error(code) => outcome_for_error(code),
            };
            responder.respond(outcome);
        });
        let prompt = self
            .bridge
            .authenticate(&info, reply)
            .map_err(map_exception)?;
        let bridge = Arc::clone(&self.bridge);
        Ok(PromptHandle::new(move || bridge.cancel_authentication(prompt)))
    }
}

impl<K: KeystoreBridge> Backend for AndroidBackend<K> {
    fn profile(&self) -> PlatformProfile {
        self.profile
    }

    fn set_password_kdf(&mut self, kdf: PasswordKdfParams) {
        self.kdf = kdf;
    }

    fn add_item(&self, item: &NewItem<'_>, auth: Option<&AuthToken>) -> Result<(), BackendError> {
        let name = item_pref(&item.key.service, &item.key.account);
        if self.bridge.prefs_get(&name).map_err(map_exception)?.is_some() {
            return Err(BackendError::Duplicate);
        }
        let protection = self.protection(item.policy, &self.profile)?;
        let alias = fresh_alias("coffre.item");
        self.generate(
            KeyGenParameters {
                alias: alias.clone(),
                purpose: KeyPurpose::EncryptDecrypt,
                curve: None,
                protection,
                strongbox: false,
                attestation_challenge: None,
            },
            |bridge, params| bridge.generate_secret_key(params).map(|()| Vec::new()),
        )?;

        let now = unix_now();
        let mut record = ItemRecord {
            service: item.key.service.clone(),
            account: item.key.account.clone(),
            access_group: item.key.access_group.clone(),
            alias: alias.clone(),
            policy: item.policy.code(),
            synchronizable: item.synchronizable,
            created_at: now,
            modified_at: now,
            sealed: String::new(),
            password_sealed: protection.password_sealed,
        };
        let written = self
            .seal_record(&record, item.payload, auth)
            .and_then(|sealed| {
                record.sealed = sealed;
                self.write_item(&record)
            });
        if written.is_err() {
            // Do not leave an orphaned key behind a failed write.
            if let Err(e) = self.bridge.delete_entry(&alias) {
                tracing::warn!(alias = %alias, error = %e, "orphaned item key not deleted");
            }
        }
        written
    }

    fn item_meta(&self, key: &ItemKey) -> Result<Option<ItemMeta>, BackendError> {
        let Some(record) = self.read_item(key)? else {
            return Ok(None);
        };
        Ok(Some(ItemMeta {
            policy: Self::policy_of(record.policy)?,
            synchronizable: record.synchronizable,
            invalidated: self.is_invalidated(&record.alias)?,
            access_group: record.access_group,
            created_at: record.created_at,
            modified_at: record.modified_at,
        }))
    }

    fn copy_item(
        &self,
        key: &ItemKey,
        auth: Option<&AuthToken>,
    ) -> Result<ManagedBuffer<VaultOwned>, BackendError> {
        let record = self.read_item(key)?.ok_or(BackendError::NotFound)?;
        self.open_record(&record, auth)
    }

    fn update_item(
        &self,
        key: &ItemKey,
        payload: &[u8],
        auth: Option<&AuthToken>,
    ) -> Result<(), BackendError> {
        let mut record = self.read_item(key)?.ok_or(BackendError::NotFound)?;
        if record.password_sealed {
            // The new password must open the old payload.
            self.open_record(&record, auth)?.free();
        }
        record.sealed = self.seal_record(&record, payload, auth)?;
        record.modified_at = unix_now();
        self.write_item(&record)
    }

    fn rename_item(&self, key: &ItemKey, new_account: &str) -> Result<(), BackendError> {
        let mut record = self.read_item(key)?.ok_or(BackendError::NotFound)?;
        let target = item_pref(&key.service, new_account);
        if self.bridge.prefs_get(&target).map_err(map_exception)?.is_some() {
            return Err(BackendError::Duplicate);
        }
        record.account = new_account.to_owned();
        record.modified_at = unix_now();
        self.write_item(&record)?;
        self.bridge
            .prefs_remove(&item_pref(&key.service, &key.account))
            .map_err(map_exception)
    }

    fn delete_item(&self, key: &ItemKey) -> Result<bool, BackendError> {
        let Some(record) = self.read_item(key)? else {
            return Ok(false);
        };
        self.bridge
            .prefs_remove(&item_pref(&key.service, &key.account))
            .map_err(map_exception)?;
        if let Err(e) = self.bridge.delete_entry(&record.alias) {
            tracing::warn!(alias = %record.alias, error = %e, "item key not deleted");
        }
        Ok(true)
    }

    fn accounts(
        &self,
        service: &str,
        access_group: Option<&str>,
    ) -> Result<Vec<String>, BackendError> {
        let prefix = service_prefix(service);
        let mut accounts = Vec::new();
        for name in self.bridge.prefs_keys().map_err(map_exception)? {
            if !name.starts_with(&prefix) {
                continue;
            }
            let Some(raw) = self.bridge.prefs_get(&name).map_err(map_exception)? else {
                continue;
            };
            match serde_json::from_str::<ItemRecord>(&raw) {
                Ok(record)
                    if access_group.is_none_or(|g| record.access_group.as_deref() == Some(g)) =>
                {
                    accounts.push(record.account);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(pref = %name, error = %e, "skipping corrupt item record"),
            }
        }
        Ok(accounts)
    }

    fn generate_key(&self, spec: &KeySpec) -> Result<Vec<u8>, BackendError> {
        let size = spec
            .size
            .ok_or_else(|| BackendError::Unsupported("signing key without a curve".into()))?;
        if self.read_key(&spec.tag)?.is_some() {
            return Err(BackendError::Duplicate);
        }
        let protection = self.protection(spec.policy, &self.profile.for_keys())?;
        let mut challenge = vec![0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut challenge);
        let alias = fresh_alias("coffre.key");
        let spki = self.generate(
            KeyGenParameters {
                alias: alias.clone(),
                purpose: KeyPurpose::Sign,
                curve: Some(size),
                protection,
                strongbox: false,
                attestation_challenge: Some(challenge),
            },
            |bridge, params| bridge.generate_key_pair(params),
        )?;
        let stored = spki_to_point(size, &spki).and_then(|point| {
            self.write_key(
                &spec.tag,
                &KeyRecord {
                    alias: alias.clone(),
                    kind: KeyKind::Signing,
                    size: Some(size),
                    policy: spec.policy.code(),
                    created_at: unix_now(),
                },
            )?;
            Ok(point)
        });
        if stored.is_err() {
            if let Err(e) = self.bridge.delete_entry(&alias) {
                tracing::warn!(alias = %alias, error = %e, "orphaned key not deleted");
            }
        }
        stored
    }

    fn generate_symmetric_key(&self, spec: &KeySpec) -> Result<(), BackendError> {
        if self.read_key(&spec.tag)?.is_some() {
            return Err(BackendError::Duplicate);
        }
        let protection = self.protection(spec.policy, &self.profile.for_keys())?;
        let alias = fresh_alias("coffre.key");
        self.generate(
            KeyGenParameters {
                alias: alias.clone(),
                purpose: KeyPurpose::EncryptDecrypt,
                curve: None,
                protection,
                strongbox: false,
                attestation_challenge: None,
            },
            |bridge, params| bridge.generate_secret_key(params).map(|()| Vec::new()),
        )?;
        let stored = self.write_key(
            &spec.tag,
            &KeyRecord {
                alias: alias.clone(),
                kind: KeyKind::Symmetric,
                size: None,
                policy: spec.policy.code(),
                created_at: unix_now(),
            },
        );
        if stored.is_err() {
            if let Err(e) = self.bridge.delete_entry(&alias) {
                tracing::warn!(alias = %alias, error = %e, "orphaned key not deleted");
            }
        }
        stored
    }

    fn key_meta(&self, tag: &str) -> Result<Option<KeyMeta>, BackendError> {
        let Some(record) = self.read_key(tag)? else {
            return Ok(None);
        };
        let info = self.bridge.key_info(&record.alias).map_err(map_exception)?;
        Ok(Some(KeyMeta {
            tag: tag.to_owned(),
            kind: record.kind,
            size: record.size,
            policy: Self::policy_of(record.policy)?,
            hardware_backed: info.is_some_and(|i| i.security_level != SecurityLevel::Software),
            created_at: record.created_at,
            invalidated: info.is_some_and(|i| i.invalidated),
        }))
    }

    fn key_tags(&self) -> Result<Vec<String>, BackendError> {
        Ok(self
            .bridge
            .prefs_keys()
            .map_err(map_exception)?
            .into_iter()
            .filter_map(|name| name.strip_prefix(KEY_PREFIX).map(str::to_owned))
            .collect())
    }

    fn sign(
        &self,
        tag: &str,
        message: &[u8],
        auth: Option<&AuthToken>,
    ) -> Result<Vec<u8>, BackendError> {
        let record = self.read_key(tag)?.ok_or(BackendError::NotFound)?;
        let size = match (record.kind, record.size) {
            (KeyKind::Signing, Some(size)) => size,
            _ => return Err(BackendError::Unsupported("not a signing key".into())),
        };
        self.bridge
            .sign(&record.alias, signature_algorithm(size), message, session(auth))
            .map_err(map_exception)
    }

    fn delete_key(&self, tag: &str) -> Result<bool, BackendError> {
        let Some(record) = self.read_key(tag)? else {
            return Ok(false);
        };
        // The index goes last so a key that survives stays listed.
        self.bridge
            .delete_entry(&record.alias)
            .map_err(map_exception)?;
        self.bridge
            .prefs_remove(&format!("{KEY_PREFIX}{tag}"))
            .map_err(map_exception)?;
        Ok(true)
    }

    fn encrypt_in_place(
        &self,
        tag: &str,
        buf: &mut Vec<u8>,
        auth: Option<&AuthToken>,
    ) -> Result<(), BackendError> {
        let record = self.symmetric(tag)?;
        let sealed = self
            .bridge
            .encrypt(&record.alias, buf, session(auth))
            .map_err(map_exception)?;
        zeroize::Zeroize::zeroize(buf);
        *buf = sealed;
        Ok(())
    }

    fn decrypt_in_place(
        &self,
        tag: &str,
        buf: &mut Vec<u8>,
        auth: Option<&AuthToken>,
    ) -> Result<(), BackendError> {
        let record = self.symmetric(tag)?;
        let plain = self
            .bridge
            .decrypt(&record.alias, buf, session(auth))
            .map_err(map_exception)?;
        buf.clear();
        buf.extend_from_slice(plain.expose());
        Ok(())
    }

    fn attestation(&self, tag: &str) -> Result<KeyAttestation, BackendError> {
        let record = self.read_key(tag)?.ok_or(BackendError::NotFound)?;
        let info = self
            .bridge
            .key_info(&record.alias)
            .map_err(map_exception)?
            .ok_or(BackendError::NotFound)?;
        Ok(KeyAttestation {
            security_level: info.security_level,
            certificate_chain: self
                .bridge
                .certificate_chain(&record.alias)
                .map_err(map_exception)?,
        })
    }
}

impl<K: KeystoreBridge> AndroidBackend<K> {
    fn symmetric(&self, tag: &str) -> Result<KeyRecord, BackendError> {
        let record = self.read_key(tag)?.ok_or(BackendError::NotFound)?;
        if record.kind == KeyKind::Symmetric {
            Ok(record)
        } else {
            Err(BackendError::Unsupported("not a symmetric key".into()))
        }
    }
}
