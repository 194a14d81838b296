//! Apple backend: Keychain items, Secure Enclave keys, LocalAuthentication.
//!
//! ```text
//! AppleBackend<K>
//! └── K: KeychainServices   SecItem*, SecKey*, LAContext (native glue)
//! ```
//!
//! The bridge speaks raw `OSStatus` and `LAError` codes; this module owns
//! the translation into [`BackendError`] and [`PromptOutcome`].

use std::sync::Arc;

use coffre_crypto_core::{KeySizeClass, ManagedBuffer, SecretBuffer, VaultOwned};

use super::{
    Backend, BackendError, ItemKey, ItemMeta, KeyAttestation, KeyKind, KeyMeta, KeySpec, NewItem,
    SecurityLevel,
};
use crate::gate::{
    AuthToken, AvailabilityStatus, BiometricKind, PromptHandle, PromptOutcome, PromptRequest,
    PromptResponder, Presenter,
};
use crate::policy::{
    resolve, AccessControlPolicy, Accessibility, AppleProtection, PlatformProfile,
    PlatformProtection, SecAccessFlags,
};

/// `OSStatus` as returned by Security.framework.
pub type OsStatus = i32;

/// Security.framework result codes the backend distinguishes.
pub mod status {
    use super::OsStatus;

    pub const SUCCESS: OsStatus = 0;
    pub const USER_CANCELED: OsStatus = -128;
    pub const PARAM: OsStatus = -50;
    pub const NOT_AVAILABLE: OsStatus = -25291;
    pub const AUTH_FAILED: OsStatus = -25293;
    pub const DUPLICATE_ITEM: OsStatus = -25299;
    pub const ITEM_NOT_FOUND: OsStatus = -25300;
    pub const INTERACTION_NOT_ALLOWED: OsStatus = -25308;
}

/// `LAError` codes.
pub mod la_error {
    pub const AUTHENTICATION_FAILED: i64 = -1;
    pub const USER_CANCEL: i64 = -2;
    pub const USER_FALLBACK: i64 = -3;
    pub const SYSTEM_CANCEL: i64 = -4;
    pub const PASSCODE_NOT_SET: i64 = -5;
    pub const BIOMETRY_NOT_AVAILABLE: i64 = -6;
    pub const BIOMETRY_NOT_ENROLLED: i64 = -7;
    pub const BIOMETRY_LOCKOUT: i64 = -8;
    pub const APP_CANCEL: i64 = -9;
    pub const INVALID_CONTEXT: i64 = -10;
}

// ---------------------------------------------------------------------------
// Bridge types
// ---------------------------------------------------------------------------

/// `LAPolicy` to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaPolicy {
    DeviceOwnerAuthenticationWithBiometrics,
    DeviceOwnerAuthentication,
    /// Collect an application password for `LAContext.setCredential`.
    ApplicationPassword,
}

/// `LABiometryType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiometryType {
    None,
    TouchId,
    FaceId,
    OpticId,
}

/// What a successful evaluation yields.
pub enum LaGrant {
    /// An evaluated `LAContext`, by handle.
    Context(u64),
    /// The password the user typed.
    ApplicationPassword(SecretBuffer),
}

/// Called once with the evaluation result or an `LAError` code.
pub type LaReply = Box<dyn FnOnce(Result<LaGrant, i64>) + Send>;

/// Authorisation passed to a SecItem/SecKey call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaCredential<'a> {
    Context(u64),
    ApplicationPassword(&'a [u8]),
}

/// Attributes of a generic-password item on write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeychainItem {
    pub service: String,
    pub account: String,
    pub access_group: Option<String>,
    pub accessibility: Accessibility,
    pub access_flags: SecAccessFlags,
    pub synchronizable: bool,
    /// `kSecAttrType`: the policy code, so reads know how the item is gated.
    pub policy_code: u8,
    /// `kSecAttrGeneric`: biometric domain state at write time.
    pub domain_state: Option<Vec<u8>>,
}

/// `kSecClassGenericPassword` match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeychainQuery<'a> {
    pub service: &'a str,
    /// `None` matches every account.
    pub account: Option<&'a str>,
    /// `None` matches every group.
    pub access_group: Option<&'a str>,
}

/// Attributes returned by `SecItemCopyMatching` without data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeychainRecord {
    pub account: String,
    pub access_group: Option<String>,
    pub synchronizable: bool,
    pub policy_code: u8,
    pub domain_state: Option<Vec<u8>>,
    pub created_at: u64,
    pub modified_at: u64,
}

/// `SecKeyCreateRandomKey` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecKeyParams {
    pub tag: String,
    pub size: KeySizeClass,
    pub access_flags: SecAccessFlags,
    pub secure_enclave: bool,
    pub policy_code: u8,
    pub domain_state: Option<Vec<u8>>,
}

/// Attributes of a stored private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecKeyRecord {
    pub size: KeySizeClass,
    pub secure_enclave: bool,
    pub policy_code: u8,
    pub domain_state: Option<Vec<u8>>,
    pub created_at: u64,
}

/// `kSecKeyAlgorithmECDSASignatureMessageX962*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecKeyAlgorithm {
    EcdsaMessageX962Sha256,
    EcdsaMessageX962Sha384,
}

impl SecKeyAlgorithm {
    /// The digest follows the curve.
    #[must_use]
    pub const fn for_size(size: KeySizeClass) -> Self {
        match size {
            KeySizeClass::P256 => Self::EcdsaMessageX962Sha256,
            KeySizeClass::P384 => Self::EcdsaMessageX962Sha384,
        }
    }
}

/// Native Keychain, Secure Enclave and LocalAuthentication calls.
///
/// Implemented by the host's FFI glue. Every method mirrors one framework
/// call and reports failures as the framework's own code.
pub trait KeychainServices: Send + Sync + 'static {
    /// `canEvaluatePolicy`; `Err` carries the `LAError` code.
    ///
    /// # Errors
    ///
    /// The `LAError` code explaining why evaluation is impossible.
    fn can_evaluate_policy(&self, policy: LaPolicy) -> Result<(), i64>;

    fn biometry_type(&self) -> BiometryType;

    /// `evaluatedPolicyDomainState` of a fresh context.
    fn domain_state(&self) -> Option<Vec<u8>>;

    /// Start `evaluatePolicy` and return the context handle immediately.
    ///
    /// # Errors
    ///
    /// An `OSStatus` if the context could not be created.
    fn evaluate_policy(
        &self,
        policy: LaPolicy,
        reason: &str,
        fallback_title: Option<&str>,
        reply: LaReply,
    ) -> Result<u64, OsStatus>;

    /// `LAContext.invalidate`: dismisses a prompt still on screen.
    fn invalidate_context(&self, context: u64);

    /// `SecItemAdd`.
    ///
    /// # Errors
    ///
    /// The framework's `OSStatus`.
    fn add_item(
        &self,
        item: &KeychainItem,
        data: &[u8],
        credential: Option<LaCredential<'_>>,
    ) -> Result<(), OsStatus>;

    /// `SecItemCopyMatching` returning attributes only.
    ///
    /// # Errors
    ///
    /// The framework's `OSStatus`; `ITEM_NOT_FOUND` when nothing matches.
    fn copy_attributes(&self, query: &KeychainQuery<'_>) -> Result<Vec<KeychainRecord>, OsStatus>;

    /// `SecItemCopyMatching` returning data.
    ///
    /// # Errors
    ///
    /// The framework's `OSStatus`.
    fn copy_data(
        &self,
        query: &KeychainQuery<'_>,
        credential: Option<LaCredential<'_>>,
    ) -> Result<SecretBuffer, OsStatus>;

    /// `SecItemUpdate` of `kSecValueData`.
    ///
    /// # Errors
    ///
    /// The framework's `OSStatus`.
    fn update_data(
        &self,
        query: &KeychainQuery<'_>,
        data: &[u8],
        credential: Option<LaCredential<'_>>,
    ) -> Result<(), OsStatus>;

    /// `SecItemUpdate` of `kSecAttrAccount`.
    ///
    /// # Errors
    ///
    /// The framework's `OSStatus`.
    fn update_account(&self, query: &KeychainQuery<'_>, account: &str) -> Result<(), OsStatus>;

    /// `SecItemDelete`.
    ///
    /// # Errors
    ///
    /// The framework's `OSStatus`.
    fn delete_item(&self, query: &KeychainQuery<'_>) -> Result<(), OsStatus>;

    /// `SecKeyCreateRandomKey` then `SecKeyCopyExternalRepresentation` of
    /// the public key (ANSI X9.63).
    ///
    /// # Errors
    ///
    /// The framework's `OSStatus`.
    fn create_key(&self, params: &SecKeyParams) -> Result<Vec<u8>, OsStatus>;

    /// # Errors
    ///
    /// The framework's `OSStatus`; `ITEM_NOT_FOUND` for an unknown tag.
    fn copy_key(&self, tag: &str) -> Result<SecKeyRecord, OsStatus>;

    /// Tags of every key this application created.
    ///
    /// # Errors
    ///
    /// The framework's `OSStatus`.
    fn key_tags(&self) -> Result<Vec<String>, OsStatus>;

    /// `SecKeyCreateSignature`, DER-encoded.
    ///
    /// # Errors
    ///
    /// The framework's `OSStatus`.
    fn create_signature(
        &self,
        tag: &str,
        algorithm: SecKeyAlgorithm,
        message: &[u8],
        credential: Option<LaCredential<'_>>,
    ) -> Result<Vec<u8>, OsStatus>;

    /// # Errors
    ///
    /// The framework's `OSStatus`.
    fn delete_key(&self, tag: &str) -> Result<(), OsStatus>;
}

// ---------------------------------------------------------------------------
// Code translation
// ---------------------------------------------------------------------------

fn describe(code: OsStatus) -> &'static str {
    match code {
        status::USER_CANCELED => "user canceled",
        status::PARAM => "invalid parameter",
        status::NOT_AVAILABLE => "keychain not available",
        status::AUTH_FAILED => "authentication failed",
        status::DUPLICATE_ITEM => "duplicate item",
        status::ITEM_NOT_FOUND => "item not found",
        status::INTERACTION_NOT_ALLOWED => "interaction not allowed",
        _ => "unrecognised status",
    }
}

fn map_status(code: OsStatus) -> BackendError {
    match code {
        status::ITEM_NOT_FOUND => BackendError::NotFound,
        status::DUPLICATE_ITEM => BackendError::Duplicate,
        status::USER_CANCELED => BackendError::Cancelled,
        status::AUTH_FAILED => BackendError::AuthenticationFailed,
        _ => BackendError::Platform {
            code: i64::from(code),
            message: describe(code).to_owned(),
        },
    }
}

fn outcome_for_la_error(code: i64) -> PromptOutcome {
    match code {
        la_error::AUTHENTICATION_FAILED => PromptOutcome::Denied,
        la_error::USER_CANCEL
        | la_error::USER_FALLBACK
        | la_error::SYSTEM_CANCEL
        | la_error::APP_CANCEL
        | la_error::INVALID_CONTEXT => PromptOutcome::Cancelled,
        la_error::PASSCODE_NOT_SET
        | la_error::BIOMETRY_NOT_AVAILABLE
        | la_error::BIOMETRY_NOT_ENROLLED
        | la_error::BIOMETRY_LOCKOUT => PromptOutcome::Unavailable,
        other => {
            tracing::warn!(code = other, "unrecognised LAError, treating as denial");
            PromptOutcome::Denied
        }
    }
}

const fn availability_for_la_error(code: i64) -> AvailabilityStatus {
    match code {
        la_error::BIOMETRY_NOT_ENROLLED => AvailabilityStatus::NotEnrolled,
        la_error::BIOMETRY_LOCKOUT => AvailabilityStatus::LockedOut,
        _ => AvailabilityStatus::HardwareUnavailable,
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct AppleBackend<K: KeychainServices> {
    services: Arc<K>,
}

impl<K: KeychainServices> AppleBackend<K> {
    pub fn new(services: K) -> Self {
        Self {
            services: Arc::new(services),
        }
    }

    /// The native glue, for hosts that need it directly.
    pub fn services(&self) -> &K {
        &self.services
    }

    fn protection(policy: AccessControlPolicy) -> Result<AppleProtection, BackendError> {
        match resolve(policy, &PlatformProfile::apple()) {
            Ok(PlatformProtection::Apple(p)) => Ok(p),
            Ok(PlatformProtection::Android(_)) | Err(_) => Err(BackendError::Unsupported(
                format!("{policy} cannot be expressed in the keychain"),
            )),
        }
    }

    fn domain_state_for(&self, policy: AccessControlPolicy) -> Option<Vec<u8>> {
        (policy == AccessControlPolicy::BiometricCurrentEnrollment)
            .then(|| self.services.domain_state())
            .flatten()
    }

    /// A current-enrollment item is stale once the enrolled set differs
    /// from the one recorded at write time.
    fn is_stale(&self, policy: AccessControlPolicy, recorded: Option<&[u8]>) -> bool {
        policy == AccessControlPolicy::BiometricCurrentEnrollment
            && self.services.domain_state().as_deref() != recorded
    }

    fn query(key: &ItemKey) -> KeychainQuery<'_> {
        KeychainQuery {
            service: &key.service,
            account: Some(&key.account),
            access_group: key.access_group.as_deref(),
        }
    }

    fn record(&self, key: &ItemKey) -> Result<Option<KeychainRecord>, BackendError> {
        match self.services.copy_attributes(&Self::query(key)) {
            Ok(records) => Ok(records.into_iter().next()),
            Err(status::ITEM_NOT_FOUND) => Ok(None),
            Err(code) => Err(map_status(code)),
        }
    }

    fn policy_of(code: u8) -> Result<AccessControlPolicy, BackendError> {
        AccessControlPolicy::from_code(code).ok_or_else(|| BackendError::Platform {
            code: i64::from(code),
            message: "unknown policy code on keychain item".into(),
        })
    }
}

/// Decode the credential a prompt produced for a call on `policy` material.
fn credential(policy: AccessControlPolicy, auth: Option<&AuthToken>) -> Option<LaCredential<'_>> {
    let token = auth?;
    if policy == AccessControlPolicy::ApplicationPassword {
        return Some(LaCredential::ApplicationPassword(token.expose()));
    }
    let bytes: [u8; 8] = token.expose().try_into().ok()?;
    Some(LaCredential::Context(u64::from_le_bytes(bytes)))
}

impl<K: KeychainServices> Presenter for AppleBackend<K> {
    fn availability(&self) -> AvailabilityStatus {
        match self
            .services
            .can_evaluate_policy(LaPolicy::DeviceOwnerAuthenticationWithBiometrics)
        {
            Ok(()) => AvailabilityStatus::Available,
            Err(code) => availability_for_la_error(code),
        }
    }

    fn biometric_kinds(&self) -> Vec<BiometricKind> {
        match self.services.biometry_type() {
            BiometryType::None => Vec::new(),
            BiometryType::TouchId => vec![BiometricKind::TouchId],
            BiometryType::FaceId => vec![BiometricKind::FaceId],
            BiometryType::OpticId => vec![BiometricKind::OpticId],
        }
    }

    fn present(
        &self,
        request: &PromptRequest,
        responder: PromptResponder,
    ) -> Result<PromptHandle, BackendError> {
        let policy = if request.capture_password {
            LaPolicy::ApplicationPassword
        } else if request.allow_device_credential {
            LaPolicy::DeviceOwnerAuthentication
        } else {
            LaPolicy::DeviceOwnerAuthenticationWithBiometrics
        };
        let reply: LaReply = Box::new(move |result| {
            let outcome = match result {
                Ok(LaGrant::Context(handle)) => {
                    PromptOutcome::Approved(Some(AuthToken::new(&handle.to_le_bytes())))
                }
                Ok(LaGrant::ApplicationPassword(password)) => {
                    PromptOutcome::Approved(Some(AuthToken::new(password.expose())))
                }
                Err(code) => outcome_for_la_error(code),
            };
            responder.respond(outcome);
        });
        let context = self
            .services
            .evaluate_policy(
                policy,
                &request.title,
                request.fallback_title.as_deref(),
                reply,
            )
            .map_err(map_status)?;
        let services = Arc::clone(&self.services);
        Ok(PromptHandle::new(move || services.invalidate_context(context)))
    }
}

impl<K: KeychainServices> Backend for AppleBackend<K> {
    fn profile(&self) -> PlatformProfile {
        PlatformProfile::apple()
    }

    fn add_item(&self, item: &NewItem<'_>, auth: Option<&AuthToken>) -> Result<(), BackendError> {
        let protection = Self::protection(item.policy)?;
        let record = KeychainItem {
            service: item.key.service.clone(),
            account: item.key.account.clone(),
            access_group: item.key.access_group.clone(),
            accessibility: protection.accessibility(item.synchronizable),
            access_flags: protection.flags,
            synchronizable: item.synchronizable,
            policy_code: item.policy.code(),
            domain_state: self.domain_state_for(item.policy),
        };
        self.services
            .add_item(&record, item.payload, credential(item.policy, auth))
            .map_err(map_status)
    }

    fn item_meta(&self, key: &ItemKey) -> Result<Option<ItemMeta>, BackendError> {
        let Some(record) = self.record(key)? else {
            return Ok(None);
        };
        let policy = Self::policy_of(record.policy_code)?;
        Ok(Some(ItemMeta {
            policy,
            synchronizable: record.synchronizable,
            invalidated: self.is_stale(policy, record.domain_state.as_deref()),
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
        let record = self.record(key)?.ok_or(BackendError::NotFound)?;
        let policy = Self::policy_of(record.policy_code)?;
        if self.is_stale(policy, record.domain_state.as_deref()) {
            return Err(BackendError::Invalidated);
        }
        self.services
            .copy_data(&Self::query(key), credential(policy, auth))
            .map(ManagedBuffer::from_secret)
            .map_err(map_status)
    }

    fn update_item(
        &self,
        key: &ItemKey,
        payload: &[u8],
        auth: Option<&AuthToken>,
    ) -> Result<(), BackendError> {
        let record = self.record(key)?.ok_or(BackendError::NotFound)?;
        let policy = Self::policy_of(record.policy_code)?;
        self.services
            .update_data(&Self::query(key), payload, credential(policy, auth))
            .map_err(map_status)
    }

    fn rename_item(&self, key: &ItemKey, new_account: &str) -> Result<(), BackendError> {
        self.services
            .update_account(&Self::query(key), new_account)
            .map_err(map_status)
    }

    fn delete_item(&self, key: &ItemKey) -> Result<bool, BackendError> {
        match self.services.delete_item(&Self::query(key)) {
            Ok(()) => Ok(true),
            Err(status::ITEM_NOT_FOUND) => Ok(false),
            Err(code) => Err(map_status(code)),
        }
    }

    fn accounts(
        &self,
        service: &str,
        access_group: Option<&str>,
    ) -> Result<Vec<String>, BackendError> {
        let query = KeychainQuery {
            service,
            account: None,
            access_group,
        };
        match self.services.copy_attributes(&query) {
            Ok(records) => Ok(records.into_iter().map(|r| r.account).collect()),
            Err(status::ITEM_NOT_FOUND) => Ok(Vec::new()),
            Err(code) => Err(map_status(code)),
        }
    }

    fn generate_key(&self, spec: &KeySpec) -> Result<Vec<u8>, BackendError> {
        let size = spec
            .size
            .ok_or_else(|| BackendError::Unsupported("signing key without a curve".into()))?;
        let protection = Self::protection(spec.policy)?;
        let access_flags = if protection.flags.is_empty() {
            SecAccessFlags::PRIVATE_KEY_USAGE
        } else {
            protection.flags | SecAccessFlags::PRIVATE_KEY_USAGE
        };
        let params = SecKeyParams {
            tag: spec.tag.clone(),
            size,
            access_flags,
            // The Secure Enclave only holds P-256 keys.
            secure_enclave: size == KeySizeClass::P256,
            policy_code: spec.policy.code(),
            domain_state: self.domain_state_for(spec.policy),
        };
        let public_key = self.services.create_key(&params).map_err(map_status)?;
        if public_key.len() != size.public_key_len() {
            // Roll back so the tag is not left holding a key we cannot describe.
            if let Err(code) = self.services.delete_key(&spec.tag) {
                tracing::warn!(tag = %spec.tag, status = code, "mismatched key not deleted");
            }
            return Err(BackendError::Platform {
                code: i64::from(status::PARAM),
                message: format!(
                    "public key is {} bytes, expected {} for {size}",
                    public_key.len(),
                    size.public_key_len()
                ),
            });
        }
        Ok(public_key)
    }

    fn generate_symmetric_key(&self, _spec: &KeySpec) -> Result<(), BackendError> {
        Err(BackendError::Unsupported(
            "the keychain has no symmetric key class; store the key as an item".into(),
        ))
    }

    fn key_meta(&self, tag: &str) -> Result<Option<KeyMeta>, BackendError> {
        let record = match self.services.copy_key(tag) {
            Ok(record) => record,
            Err(status::ITEM_NOT_FOUND) => return Ok(None),
            Err(code) => return Err(map_status(code)),
        };
        let policy = Self::policy_of(record.policy_code)?;
        Ok(Some(KeyMeta {
            tag: tag.to_owned(),
            kind: KeyKind::Signing,
            size: Some(record.size),
            policy,
            hardware_backed: record.secure_enclave,
            created_at: record.created_at,
            invalidated: self.is_stale(policy, record.domain_state.as_deref()),
        }))
    }

    fn key_tags(&self) -> Result<Vec<String>, BackendError> {
        self.services.key_tags().map_err(map_status)
    }

    fn sign(
        &self,
        tag: &str,
        message: &[u8],
        auth: Option<&AuthToken>,
    ) -> Result<Vec<u8>, BackendError> {
        let record = self.services.copy_key(tag).map_err(map_status)?;
        let policy = Self::policy_of(record.policy_code)?;
        if self.is_stale(policy, record.domain_state.as_deref()) {
            return Err(BackendError::Invalidated);
        }
        self.services
            .create_signature(
                tag,
                SecKeyAlgorithm::for_size(record.size),
                message,
                credential(policy, auth),
            )
            .map_err(map_status)
    }

    fn delete_key(&self, tag: &str) -> Result<bool, BackendError> {
        match self.services.delete_key(tag) {
            Ok(()) => Ok(true),
            Err(status::ITEM_NOT_FOUND) => Ok(false),
            Err(code) => Err(map_status(code)),
        }
    }

    fn encrypt_in_place(
        &self,
        _tag: &str,
        _buf: &mut Vec<u8>,
        _auth: Option<&AuthToken>,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("no symmetric keys in the keychain".into()))
    }

    fn decrypt_in_place(
        &self,
        _tag: &str,
        _buf: &mut Vec<u8>,
        _auth: Option<&AuthToken>,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("no symmetric keys in the keychain".into()))
    }

    fn attestation(&self, tag: &str) -> Result<KeyAttestation, BackendError> {
        let record = self.services.copy_key(tag).map_err(map_status)?;
        Ok(KeyAttestation {
            security_level: if record.secure_enclave {
                SecurityLevel::SecureEnclave
            } else {
                SecurityLevel::Software
            },
            certificate_chain: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use coffre_crypto_core::{verify, SoftwareKeyPair};

    use crate::gate::{AuthResult, BiometricGate};

    #[derive(Default)]
    struct State {
        items: BTreeMap<(String, String), (KeychainItem, Vec<u8>)>,
        keys: BTreeMap<String, (SecKeyParams, SoftwareKeyPair)>,
        domain_state: Vec<u8>,
        invalidated: Vec<u64>,
        last_credential: Option<String>,
        short_public_key: bool,
    }

    /// Keychain double holding items in a map and keys as software pairs.
    struct FakeKeychain {
        state: Mutex<State>,
        la_result: Mutex<Option<Result<u64, i64>>>,
        can_evaluate: Mutex<Result<(), i64>>,
    }

    impl Default for FakeKeychain {
        fn default() -> Self {
            Self {
                state: Mutex::default(),
                la_result: Mutex::new(None),
                can_evaluate: Mutex::new(Ok(())),
            }
        }
    }

    impl FakeKeychain {
        fn state(&self) -> std::sync::MutexGuard<'_, State> {
            self.state.lock().unwrap()
        }

        fn matches(item: &KeychainItem, q: &KeychainQuery<'_>) -> bool {
            item.service == q.service
                && q.account.is_none_or(|a| a == item.account)
                && q.access_group.is_none_or(|g| item.access_group.as_deref() == Some(g))
        }

        fn note(&self, credential: Option<LaCredential<'_>>) {
            self.state().last_credential = credential.map(|c| format!("{c:?}"));
        }
    }

    impl KeychainServices for FakeKeychain {
        fn can_evaluate_policy(&self, _policy: LaPolicy) -> Result<(), i64> {
            *self.can_evaluate.lock().unwrap()
        }

        fn biometry_type(&self) -> BiometryType {
            BiometryType::FaceId
        }

        fn domain_state(&self) -> Option<Vec<u8>> {
            Some(self.state().domain_state.clone())
        }

        fn evaluate_policy(
            &self,
            _policy: LaPolicy,
            _reason: &str,
            _fallback_title: Option<&str>,
            reply: LaReply,
        ) -> Result<u64, OsStatus> {
            match *self.la_result.lock().unwrap() {
                Some(Ok(handle)) => {
                    std::thread::spawn(move || reply(Ok(LaGrant::Context(handle))));
                    Ok(handle)
                }
                Some(Err(code)) => {
                    std::thread::spawn(move || reply(Err(code)));
                    Ok(0)
                }
                // Leave the prompt up.
                None => {
                    std::mem::forget(reply);
                    Ok(99)
                }
            }
        }

        fn invalidate_context(&self, context: u64) {
            self.state().invalidated.push(context);
        }

        fn add_item(
            &self,
            item: &KeychainItem,
            data: &[u8],
            credential: Option<LaCredential<'_>>,
        ) -> Result<(), OsStatus> {
            self.note(credential);
            let mut state = self.state();
            let slot = (item.service.clone(), item.account.clone());
            if state.items.contains_key(&slot) {
                return Err(status::DUPLICATE_ITEM);
            }
            state.items.insert(slot, (item.clone(), data.to_vec()));
            Ok(())
        }

        fn copy_attributes(
            &self,
            query: &KeychainQuery<'_>,
        ) -> Result<Vec<KeychainRecord>, OsStatus> {
            let records: Vec<_> = self
                .state()
                .items
                .values()
                .filter(|(item, _)| Self::matches(item, query))
                .map(|(item, _)| KeychainRecord {
                    account: item.account.clone(),
                    access_group: item.access_group.clone(),
                    synchronizable: item.synchronizable,
                    policy_code: item.policy_code,
                    domain_state: item.domain_state.clone(),
                    created_at: 1,
                    modified_at: 1,
                })
                .collect();
            if records.is_empty() {
                Err(status::ITEM_NOT_FOUND)
            } else {
                Ok(records)
            }
        }

        fn copy_data(
            &self,
            query: &KeychainQuery<'_>,
            credential: Option<LaCredential<'_>>,
        ) -> Result<SecretBuffer, OsStatus> {
            self.note(credential);
            let state = self.state();
            let (item, data) = state
                .items
                .values()
                .find(|(item, _)| Self::matches(item, query))
                .ok_or(status::ITEM_NOT_FOUND)?;
            if !item.access_flags.is_empty() && credential.is_none() {
                return Err(status::AUTH_FAILED);
            }
            Ok(SecretBuffer::from_vec(data.clone()))
        }

        fn update_data(
            &self,
            query: &KeychainQuery<'_>,
            data: &[u8],
            _credential: Option<LaCredential<'_>>,
        ) -> Result<(), OsStatus> {
            let mut state = self.state();
            let (_, stored) = state
                .items
                .values_mut()
                .find(|(item, _)| Self::matches(item, query))
                .ok_or(status::ITEM_NOT_FOUND)?;
            *stored = data.to_vec();
            Ok(())
        }

        fn update_account(&self, query: &KeychainQuery<'_>, account: &str) -> Result<(), OsStatus> {
            let mut state = self.state();
            let slot = (query.service.to_owned(), query.account.unwrap_or_default().to_owned());
            let (mut item, data) = state.items.remove(&slot).ok_or(status::ITEM_NOT_FOUND)?;
            item.account = account.to_owned();
            state
                .items
                .insert((query.service.to_owned(), account.to_owned()), (item, data));
            Ok(())
        }

        fn delete_item(&self, query: &KeychainQuery<'_>) -> Result<(), OsStatus> {
            let mut state = self.state();
            let before = state.items.len();
            state.items.retain(|_, (item, _)| !Self::matches(item, query));
            if state.items.len() == before {
                Err(status::ITEM_NOT_FOUND)
            } else {
                Ok(())
            }
        }

        fn create_key(&self, params: &SecKeyParams) -> Result<Vec<u8>, OsStatus> {
            let mut state = self.state();
            if state.keys.contains_key(&params.tag) {
                return Err(status::DUPLICATE_ITEM);
            }
            let pair = SoftwareKeyPair::generate(params.size).map_err(|_| status::PARAM)?;
            let mut public = pair.public_key().to_vec();
            if state.short_public_key {
                public.truncate(32);
            }
            state.keys.insert(params.tag.clone(), (params.clone(), pair));
            Ok(public)
        }

        fn copy_key(&self, tag: &str) -> Result<SecKeyRecord, OsStatus> {
            let state = self.state();
            let (params, _) = state.keys.get(tag).ok_or(status::ITEM_NOT_FOUND)?;
            Ok(SecKeyRecord {
                size: params.size,
                secure_enclave: params.secure_enclave,
                policy_code: params.policy_code,
                domain_state: params.domain_state.clone(),
                created_at: 1,
            })
        }

        fn key_tags(&self) -> Result<Vec<String>, OsStatus> {
            Ok(self.state().keys.keys().cloned().collect())
        }

        fn create_signature(
            &self,
            tag: &str,
            algorithm: SecKeyAlgorithm,
            message: &[u8],
            _credential: Option<LaCredential<'_>>,
        ) -> Result<Vec<u8>, OsStatus> {
            let state = self.state();
            let (params, pair) = state.keys.get(tag).ok_or(status::ITEM_NOT_FOUND)?;
            assert_eq!(algorithm, SecKeyAlgorithm::for_size(params.size));
            pair.sign(message).map_err(|_| status::PARAM)
        }

        fn delete_key(&self, tag: &str) -> Result<(), OsStatus> {
            self.state()
                .keys
                .remove(tag)
                .map(|_| ())
                .ok_or(status::ITEM_NOT_FOUND)
        }
    }

    fn backend() -> AppleBackend<FakeKeychain> {
        AppleBackend::new(FakeKeychain::default())
    }

    fn item<'a>(account: &str, payload: &'a [u8], policy: AccessControlPolicy) -> NewItem<'a> {
        NewItem {
            key: ItemKey::new("svc", account, None),
            payload,
            policy,
            synchronizable: false,
        }
    }

    #[test]
    fn status_codes_map_to_backend_errors() {
        assert_eq!(map_status(status::ITEM_NOT_FOUND), BackendError::NotFound);
        assert_eq!(map_status(status::DUPLICATE_ITEM), BackendError::Duplicate);
        assert_eq!(map_status(status::USER_CANCELED), BackendError::Cancelled);
        assert_eq!(map_status(status::AUTH_FAILED), BackendError::AuthenticationFailed);
        assert!(matches!(
            map_status(status::INTERACTION_NOT_ALLOWED),
            BackendError::Platform { code: -25308, .. }
        ));
    }

    #[test]
    fn la_errors_map_to_outcomes() {
        assert!(matches!(outcome_for_la_error(-1), PromptOutcome::Denied));
        for code in [-2, -3, -4, -9] {
            assert!(matches!(outcome_for_la_error(code), PromptOutcome::Cancelled));
        }
        for code in [-5, -6, -7, -8] {
            assert!(matches!(outcome_for_la_error(code), PromptOutcome::Unavailable));
        }
        assert_eq!(availability_for_la_error(-7), AvailabilityStatus::NotEnrolled);
        assert_eq!(availability_for_la_error(-8), AvailabilityStatus::LockedOut);
        assert_eq!(availability_for_la_error(-6), AvailabilityStatus::HardwareUnavailable);
    }

    #[test]
    fn items_carry_access_flags_and_policy_code() {
        let b = backend();
        b.add_item(&item("a", b"secret", AccessControlPolicy::BiometricOrPasscode), None)
            .unwrap();
        let state = b.services().state();
        let (stored, _) = &state.items[&("svc".to_owned(), "a".to_owned())];
        assert_eq!(stored.access_flags.bits(), 2 | (1 << 14) | 16);
        assert_eq!(stored.accessibility, Accessibility::WhenUnlockedThisDeviceOnly);
        assert_eq!(stored.policy_code, AccessControlPolicy::BiometricOrPasscode.code());
    }

    #[test]
    fn context_token_becomes_la_credential() {
        let b = backend();
        b.add_item(&item("a", b"secret", AccessControlPolicy::BiometricAny), None)
            .unwrap();
        let key = ItemKey::new("svc", "a", None);
        assert_eq!(
            b.copy_item(&key, None).unwrap_err(),
            BackendError::AuthenticationFailed
        );
        let token = AuthToken::new(&7u64.to_le_bytes());
        assert_eq!(b.copy_item(&key, Some(&token)).unwrap().expose(), b"secret");
        assert_eq!(
            b.services().state().last_credential.as_deref(),
            Some("Context(7)")
        );
    }

    #[test]
    fn enrollment_change_marks_current_set_items_stale() {
        let b = backend();
        b.add_item(
            &item("a", b"s", AccessControlPolicy::BiometricCurrentEnrollment),
            None,
        )
        .unwrap();
        let key = ItemKey::new("svc", "a", None);
        assert!(!b.item_meta(&key).unwrap().unwrap().invalidated);
        b.services().state().domain_state = vec![1, 2, 3];
        assert!(b.item_meta(&key).unwrap().unwrap().invalidated);
        let token = AuthToken::new(&1u64.to_le_bytes());
        assert_eq!(
            b.copy_item(&key, Some(&token)).unwrap_err(),
            BackendError::Invalidated
        );
    }

    #[test]
    fn delete_of_missing_item_is_not_an_error() {
        let b = backend();
        assert!(!b.delete_item(&ItemKey::new("svc", "nope", None)).unwrap());
        assert!(b.accounts("svc", None).unwrap().is_empty());
    }

    #[test]
    fn keys_sign_with_curve_digest() {
        let b = backend();
        for (tag, size) in [("k256", KeySizeClass::P256), ("k384", KeySizeClass::P384)] {
            let spec = KeySpec {
                tag: tag.into(),
                kind: KeyKind::Signing,
                size: Some(size),
                policy: AccessControlPolicy::None,
            };
            let public = b.generate_key(&spec).unwrap();
            assert_eq!(public.len(), size.public_key_len());
            let sig = b.sign(tag, b"msg", None).unwrap();
            verify(size, &public, b"msg", &sig).unwrap();
        }
        assert_eq!(
            b.attestation("k256").unwrap().security_level,
            SecurityLevel::SecureEnclave
        );
        assert_eq!(
            b.attestation("k384").unwrap().security_level,
            SecurityLevel::Software
        );
        let state = b.services().state();
        assert!(state.keys["k256"]
            .0
            .access_flags
            .contains(SecAccessFlags::PRIVATE_KEY_USAGE));
    }

    #[test]
    fn symmetric_keys_are_unsupported() {
        let b = backend();
        let spec = KeySpec {
            tag: "aes".into(),
            kind: KeyKind::Symmetric,
            size: None,
            policy: AccessControlPolicy::None,
        };
        assert!(matches!(
            b.generate_symmetric_key(&spec),
            Err(BackendError::Unsupported(_))
        ));
    }

    #[test]
    fn prompt_results_flow_through_the_gate() {
        let b = backend();
        let gate = BiometricGate::new(Duration::from_secs(5)).unwrap();
        let req = PromptRequest::new("Unlock");

        *b.services().la_result.lock().unwrap() = Some(Ok(42));
        let AuthResult::Approved(Some(token)) = gate.authenticate(&b, &req) else {
            panic!("expected approval");
        };
        assert_eq!(token.expose(), &42u64.to_le_bytes());

        *b.services().la_result.lock().unwrap() = Some(Err(la_error::USER_CANCEL));
        assert!(matches!(gate.authenticate(&b, &req), AuthResult::Cancelled));
    }

    #[test]
    fn timed_out_prompt_invalidates_its_context() {
        let b = backend();
        let gate = BiometricGate::new(Duration::from_millis(30)).unwrap();
        assert!(matches!(
            gate.authenticate(&b, &PromptRequest::new("Unlock")),
            AuthResult::TimedOut
        ));
        assert_eq!(b.services().state().invalidated, vec![99]);
    }

    #[test]
    fn malformed_public_key_rolls_the_key_back() {
        let b = backend();
        b.services().state().short_public_key = true;
        let spec = KeySpec {
            tag: "k".into(),
            kind: KeyKind::Signing,
            size: Some(KeySizeClass::P256),
            policy: AccessControlPolicy::None,
        };
        assert!(matches!(
            b.generate_key(&spec),
            Err(BackendError::Platform { code, .. }) if code == i64::from(status::PARAM)
        ));
        assert!(b.key_tags().unwrap().is_empty());
    }

    #[test]
    fn availability_reads_la_error() {
        let b = backend();
        assert_eq!(b.availability(), AvailabilityStatus::Available);
        *b.services().can_evaluate.lock().unwrap() = Err(la_error::BIOMETRY_LOCKOUT);
        assert_eq!(b.availability(), AvailabilityStatus::LockedOut);
        assert_eq!(b.biometric_kinds(), vec![BiometricKind::FaceId]);
    }
}
