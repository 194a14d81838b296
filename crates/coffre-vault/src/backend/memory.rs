//! In-process backend for tests and for hosts without a hardware key store.
//!
//! Items live in memory, signing keys are software ECDSA keys, and the
//! prompt is scripted: each presentation consumes the next
//! [`ScriptedResponse`] (or the default) and answers from a helper thread,
//! just as a native callback would. The backend enforces the same rules a
//! hardware store does: gated material needs an approval token, and
//! current-enrollment material is invalidated by
//! [`MemoryBackend::change_biometric_enrollment`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use coffre_crypto_core::{
    open_in_place, seal_in_place, ManagedBuffer, PasswordKdfParams, SecretBuffer, SecretBytes,
    SoftwareKeyPair, VaultOwned, KEY_LEN,
};

use super::sealing::{open_with_password, seal_with_password, PasswordEnvelope};
use super::{
    unix_now, Backend, BackendError, ItemKey, ItemMeta, KeyAttestation, KeyKind, KeyMeta,
    KeySpec, NewItem, SecurityLevel,
};
use crate::gate::{
    AuthToken, AvailabilityStatus, BiometricKind, PromptHandle, PromptOutcome, PromptRequest,
    PromptResponder, Presenter,
};
use crate::policy::{AccessControlPolicy, Platform, PlatformProfile};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Scripting and fault injection
// ---------------------------------------------------------------------------

/// How the scripted prompt answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedResponse {
    /// Approve with a generic approval token.
    Approve,
    /// Approve with these token bytes (e.g. a captured application password).
    ApproveWithToken(Vec<u8>),
    Deny,
    Cancel,
    Unavailable,
    /// Never answer; only a dismiss ends the prompt.
    NoResponse,
    /// Drop the responder without answering.
    Abandon,
}

/// Backend operations that [`MemoryBackend::fail_next`] can break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Present,
    AddItem,
    CopyItem,
    UpdateItem,
    RenameItem,
    DeleteItem,
    GenerateKey,
    Sign,
    DeleteKey,
}

/// Token bytes handed out by [`ScriptedResponse::Approve`].
pub const APPROVAL_TOKEN: &[u8] = b"memory-backend-approval";

#[derive(Default)]
struct PromptBook {
    script: VecDeque<ScriptedResponse>,
    // Responders of prompts still on screen. Removing an entry is the single
    // point where a prompt ends, whether answered or dismissed.
    pending: HashMap<u64, PromptResponder>,
    last_request: Option<PromptRequest>,
    shown: usize,
}

struct Prompts {
    book: Mutex<PromptBook>,
    default: Mutex<ScriptedResponse>,
    delay: Mutex<Duration>,
    next_id: AtomicU64,
}

impl Prompts {
    fn take_pending(&self, id: u64) -> Option<PromptResponder> {
        lock(&self.book).pending.remove(&id)
    }
}

// ---------------------------------------------------------------------------
// Stored state
// ---------------------------------------------------------------------------

enum Payload {
    Plain(SecretBuffer),
    Password(PasswordEnvelope),
}

struct StoredItem {
    payload: Payload,
    policy: AccessControlPolicy,
    synchronizable: bool,
    access_group: Option<String>,
    created_at: u64,
    modified_at: u64,
    enrollment: u64,
}

enum KeyMaterial {
    Signing(SoftwareKeyPair),
    Symmetric(SecretBytes<KEY_LEN>),
}

struct StoredKey {
    material: KeyMaterial,
    meta: KeyMeta,
    enrollment: u64,
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct MemoryBackend {
    profile: PlatformProfile,
    kdf: PasswordKdfParams,
    items: Mutex<BTreeMap<(String, String), StoredItem>>,
    keys: Mutex<BTreeMap<String, StoredKey>>,
    enrollment: AtomicU64,
    availability: Mutex<AvailabilityStatus>,
    prompts: Arc<Prompts>,
    faults: Mutex<Vec<(FaultPoint, BackendError)>>,
    probes: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Apple-profile backend whose prompts approve by default.
    #[must_use]
    pub fn new() -> Self {
        Self::with_profile(PlatformProfile::apple())
    }

    #[must_use]
    pub fn with_profile(profile: PlatformProfile) -> Self {
        Self {
            profile,
            kdf: PasswordKdfParams::default(),
            items: Mutex::new(BTreeMap::new()),
            keys: Mutex::new(BTreeMap::new()),
            enrollment: AtomicU64::new(0),
            availability: Mutex::new(AvailabilityStatus::Available),
            prompts: Arc::new(Prompts {
                book: Mutex::new(PromptBook::default()),
                default: Mutex::new(ScriptedResponse::Approve),
                delay: Mutex::new(Duration::ZERO),
                next_id: AtomicU64::new(0),
            }),
            faults: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
        }
    }

    /// Argon2id cost for application-password items.
    #[must_use]
    pub const fn with_kdf(mut self, kdf: PasswordKdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    #[must_use]
    pub const fn password_kdf(&self) -> PasswordKdfParams {
        self.kdf
    }

    // -- prompt scripting ---------------------------------------------------

    /// Queue responses for the next prompts, in order.
    pub fn script(&self, responses: impl IntoIterator<Item = ScriptedResponse>) {
        lock(&self.prompts.book).script.extend(responses);
    }

    /// Response used once the queue is empty.
    pub fn set_default_response(&self, response: ScriptedResponse) {
        *lock(&self.prompts.default) = response;
    }

    /// Delay before each scripted answer.
    pub fn set_response_delay(&self, delay: Duration) {
        *lock(&self.prompts.delay) = delay;
    }

    pub fn set_availability(&self, status: AvailabilityStatus) {
        *lock(&self.availability) = status;
    }

    /// Prompts currently on screen.
    #[must_use]
    pub fn presenting_count(&self) -> usize {
        lock(&self.prompts.book).pending.len()
    }

    /// Prompts shown since construction.
    #[must_use]
    pub fn prompts_shown(&self) -> usize {
        lock(&self.prompts.book).shown
    }

    #[must_use]
    pub fn last_prompt(&self) -> Option<PromptRequest> {
        lock(&self.prompts.book).last_request.clone()
    }

    /// Answer every prompt left on screen (e.g. parked by `NoResponse`).
    pub fn respond_to_pending(&self, outcome: impl Fn() -> PromptOutcome) -> usize {
        let drained: Vec<_> = lock(&self.prompts.book).pending.drain().collect();
        drained
            .into_iter()
            .filter(|(_, responder)| responder.is_waiting())
            .map(|(_, responder)| responder.respond(outcome()))
            .filter(|delivered| *delivered)
            .count()
    }

    // -- device events ------------------------------------------------------

    /// Simulate the user enrolling or removing a biometric.
    pub fn change_biometric_enrollment(&self) {
        self.enrollment.fetch_add(1, Ordering::SeqCst);
    }

    /// Make the next call to `point` fail with `error`.
    pub fn fail_next(&self, point: FaultPoint, error: BackendError) {
        lock(&self.faults).push((point, error));
    }

    /// Number of `availability` probes answered, for asserting gate ordering.
    #[must_use]
    pub fn availability_probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    // -- inspection ---------------------------------------------------------

    #[must_use]
    pub fn item_count(&self) -> usize {
        lock(&self.items).len()
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        lock(&self.keys).len()
    }

    /// Stored payload of an ungated item, bypassing every check.
    #[must_use]
    pub fn peek_payload(&self, service: &str, account: &str) -> Option<Vec<u8>> {
        match &lock(&self.items).get(&(service.to_owned(), account.to_owned()))?.payload {
            Payload::Plain(bytes) => Some(bytes.expose().to_vec()),
            Payload::Password(_) => None,
        }
    }

    // -- internals ----------------------------------------------------------

    fn fault(&self, point: FaultPoint) -> Result<(), BackendError> {
        let mut faults = lock(&self.faults);
        match faults.iter().position(|(p, _)| *p == point) {
            Some(i) => Err(faults.remove(i).1),
            None => Ok(()),
        }
    }

    fn current_enrollment(&self) -> u64 {
        self.enrollment.load(Ordering::SeqCst)
    }

    fn is_invalidated(&self, policy: AccessControlPolicy, enrollment: u64) -> bool {
        policy == AccessControlPolicy::BiometricCurrentEnrollment
            && enrollment != self.current_enrollment()
    }

    fn authorize(
        &self,
        policy: AccessControlPolicy,
        enrollment: u64,
        auth: Option<&AuthToken>,
    ) -> Result<(), BackendError> {
        if self.is_invalidated(policy, enrollment) {
            return Err(BackendError::Invalidated);
        }
        if policy.requires_gate() && auth.is_none() {
            return Err(BackendError::AuthenticationFailed);
        }
        Ok(())
    }

    fn seal_payload(
        &self,
        key: &ItemKey,
        policy: AccessControlPolicy,
        payload: &[u8],
        auth: Option<&AuthToken>,
    ) -> Result<Payload, BackendError> {
        if policy == AccessControlPolicy::ApplicationPassword {
            seal_with_password(auth, self.kdf, &key.service, payload).map(Payload::Password)
        } else {
            Ok(Payload::Plain(SecretBuffer::from_vec(payload.to_vec())))
        }
    }

    fn slot(key: &ItemKey) -> (String, String) {
        (key.service.clone(), key.account.clone())
    }

    fn in_group(item: &StoredItem, key: &ItemKey) -> bool {
        key.access_group.is_none() || item.access_group == key.access_group
    }
}

impl Presenter for MemoryBackend {
    fn availability(&self) -> AvailabilityStatus {
        self.probes.fetch_add(1, Ordering::SeqCst);
        *lock(&self.availability)
    }

    fn biometric_kinds(&self) -> Vec<BiometricKind> {
        match self.profile.platform {
            Platform::Apple => vec![BiometricKind::TouchId, BiometricKind::FaceId],
            Platform::Android => vec![BiometricKind::Fingerprint, BiometricKind::Face],
        }
    }

    fn present(
        &self,
        request: &PromptRequest,
        responder: PromptResponder,
    ) -> Result<PromptHandle, BackendError> {
        self.fault(FaultPoint::Present)?;
        let id = self.prompts.next_id.fetch_add(1, Ordering::SeqCst);
        let response = {
            let mut book = lock(&self.prompts.book);
            book.shown = book.shown.saturating_add(1);
            book.last_request = Some(request.clone());
            book.pending.insert(id, responder);
            book.script
                .pop_front()
                .unwrap_or_else(|| lock(&self.prompts.default).clone())
        };

        let outcome = match response {
            ScriptedResponse::Approve => Some(PromptOutcome::Approved(Some(AuthToken::new(
                APPROVAL_TOKEN,
            )))),
            ScriptedResponse::ApproveWithToken(bytes) => {
                Some(PromptOutcome::Approved(Some(AuthToken::new(&bytes))))
            }
            ScriptedResponse::Deny => Some(PromptOutcome::Denied),
            ScriptedResponse::Cancel => Some(PromptOutcome::Cancelled),
            ScriptedResponse::Unavailable => Some(PromptOutcome::Unavailable),
            ScriptedResponse::Abandon => None,
            ScriptedResponse::NoResponse => {
                let prompts = Arc::clone(&self.prompts);
                return Ok(PromptHandle::new(move || {
                    drop(prompts.take_pending(id));
                }));
            }
        };

        let delay = *lock(&self.prompts.delay);
        let prompts = Arc::clone(&self.prompts);
        thread::spawn(move || {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            if let Some(responder) = prompts.take_pending(id) {
                if let Some(outcome) = outcome {
                    responder.respond(outcome);
                }
            }
        });
        let prompts = Arc::clone(&self.prompts);
        Ok(PromptHandle::new(move || {
            drop(prompts.take_pending(id));
        }))
    }
}

impl Backend for MemoryBackend {
    fn profile(&self) -> PlatformProfile {
        self.profile
    }

    fn set_password_kdf(&mut self, kdf: PasswordKdfParams) {
        self.kdf = kdf;
    }

    fn add_item(&self, item: &NewItem<'_>, auth: Option<&AuthToken>) -> Result<(), BackendError> {
        self.fault(FaultPoint::AddItem)?;
        let slot = Self::slot(&item.key);
        if lock(&self.items).contains_key(&slot) {
            return Err(BackendError::Duplicate);
        }
        let payload = self.seal_payload(&item.key, item.policy, item.payload, auth)?;
        let now = unix_now();
        let stored = StoredItem {
            payload,
            policy: item.policy,
            synchronizable: item.synchronizable,
            access_group: item.key.access_group.clone(),
            created_at: now,
            modified_at: now,
            enrollment: self.current_enrollment(),
        };
        let mut items = lock(&self.items);
        if items.contains_key(&slot) {
            return Err(BackendError::Duplicate);
        }
        items.insert(slot, stored);
        Ok(())
    }

    fn item_meta(&self, key: &ItemKey) -> Result<Option<ItemMeta>, BackendError> {
        let items = lock(&self.items);
        Ok(items
            .get(&Self::slot(key))
            .filter(|item| Self::in_group(item, key))
            .map(|item| ItemMeta {
                policy: item.policy,
                synchronizable: item.synchronizable,
                access_group: item.access_group.clone(),
                created_at: item.created_at,
                modified_at: item.modified_at,
                invalidated: self.is_invalidated(item.policy, item.enrollment),
            }))
    }

    fn copy_item(
        &self,
        key: &ItemKey,
        auth: Option<&AuthToken>,
    ) -> Result<ManagedBuffer<VaultOwned>, BackendError> {
        self.fault(FaultPoint::CopyItem)?;
        let items = lock(&self.items);
        let item = items
            .get(&Self::slot(key))
            .filter(|item| Self::in_group(item, key))
            .ok_or(BackendError::NotFound)?;
        self.authorize(item.policy, item.enrollment, auth)?;
        match &item.payload {
            Payload::Plain(bytes) => Ok(ManagedBuffer::from_slice(bytes.expose())),
            Payload::Password(envelope) => open_with_password(auth, &key.service, envelope),
        }
    }

    fn update_item(
        &self,
        key: &ItemKey,
        payload: &[u8],
        auth: Option<&AuthToken>,
    ) -> Result<(), BackendError> {
        self.fault(FaultPoint::UpdateItem)?;
        let mut items = lock(&self.items);
        let item = items
            .get_mut(&Self::slot(key))
            .filter(|item| Self::in_group(item, key))
            .ok_or(BackendError::NotFound)?;
        self.authorize(item.policy, item.enrollment, auth)?;
        if let Payload::Password(envelope) = &item.payload {
            open_with_password(auth, &key.service, envelope)?.free();
        }
        item.payload = self.seal_payload(key, item.policy, payload, auth)?;
        item.modified_at = unix_now();
        Ok(())
    }

    fn rename_item(&self, key: &ItemKey, new_account: &str) -> Result<(), BackendError> {
        self.fault(FaultPoint::RenameItem)?;
        let mut items = lock(&self.items);
        let target = (key.service.clone(), new_account.to_owned());
        if items.contains_key(&target) {
            return Err(BackendError::Duplicate);
        }
        let slot = Self::slot(key);
        if !items.get(&slot).is_some_and(|item| Self::in_group(item, key)) {
            return Err(BackendError::NotFound);
        }
        let mut item = items.remove(&slot).ok_or(BackendError::NotFound)?;
        item.modified_at = unix_now();
        items.insert(target, item);
        Ok(())
    }

    fn delete_item(&self, key: &ItemKey) -> Result<bool, BackendError> {
        self.fault(FaultPoint::DeleteItem)?;
        let mut items = lock(&self.items);
        let slot = Self::slot(key);
        if items.get(&slot).is_some_and(|item| Self::in_group(item, key)) {
            items.remove(&slot);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn accounts(
        &self,
        service: &str,
        access_group: Option<&str>,
    ) -> Result<Vec<String>, BackendError> {
        let items = lock(&self.items);
        Ok(items
            .iter()
            .filter(|((s, _), item)| {
                s == service
                    && access_group.is_none_or(|g| item.access_group.as_deref() == Some(g))
            })
            .map(|((_, account), _)| account.clone())
            .collect())
    }

    fn generate_key(&self, spec: &KeySpec) -> Result<Vec<u8>, BackendError> {
        self.fault(FaultPoint::GenerateKey)?;
        let size = spec
            .size
            .ok_or_else(|| BackendError::Unsupported("signing key without a curve".into()))?;
        let pair = SoftwareKeyPair::generate(size)?;
        let public_key = pair.public_key().to_vec();
        self.insert_key(spec, Some(size), KeyMaterial::Signing(pair))?;
        Ok(public_key)
    }

    fn generate_symmetric_key(&self, spec: &KeySpec) -> Result<(), BackendError> {
        self.fault(FaultPoint::GenerateKey)?;
        let key = SecretBytes::<KEY_LEN>::random()?;
        self.insert_key(spec, None, KeyMaterial::Symmetric(key))
    }

    fn key_meta(&self, tag: &str) -> Result<Option<KeyMeta>, BackendError> {
        Ok(lock(&self.keys).get(tag).map(|k| KeyMeta {
            invalidated: self.is_invalidated(k.meta.policy, k.enrollment),
            ..k.meta.clone()
        }))
    }

    fn key_tags(&self) -> Result<Vec<String>, BackendError> {
        Ok(lock(&self.keys).keys().cloned().collect())
    }

    fn sign(
        &self,
        tag: &str,
        message: &[u8],
        auth: Option<&AuthToken>,
    ) -> Result<Vec<u8>, BackendError> {
        self.fault(FaultPoint::Sign)?;
        let keys = lock(&self.keys);
        let key = keys.get(tag).ok_or(BackendError::NotFound)?;
        self.authorize(key.meta.policy, key.enrollment, auth)?;
        match &key.material {
            KeyMaterial::Signing(pair) => Ok(pair.sign(message)?),
            KeyMaterial::Symmetric(_) => Err(BackendError::Unsupported(
                "symmetric keys cannot sign".into(),
            )),
        }
    }

    fn delete_key(&self, tag: &str) -> Result<bool, BackendError> {
        self.fault(FaultPoint::DeleteKey)?;
        Ok(lock(&self.keys).remove(tag).is_some())
    }

    fn encrypt_in_place(
        &self,
        tag: &str,
        buf: &mut Vec<u8>,
        auth: Option<&AuthToken>,
    ) -> Result<(), BackendError> {
        let keys = lock(&self.keys);
        let key = keys.get(tag).ok_or(BackendError::NotFound)?;
        self.authorize(key.meta.policy, key.enrollment, auth)?;
        match &key.material {
            KeyMaterial::Symmetric(secret) => Ok(seal_in_place(secret, tag.as_bytes(), buf)?),
            KeyMaterial::Signing(_) => Err(BackendError::Unsupported(
                "signing keys cannot encrypt".into(),
            )),
        }
    }

    fn decrypt_in_place(
        &self,
        tag: &str,
        buf: &mut Vec<u8>,
        auth: Option<&AuthToken>,
    ) -> Result<(), BackendError> {
        let keys = lock(&self.keys);
        let key = keys.get(tag).ok_or(BackendError::NotFound)?;
        self.authorize(key.meta.policy, key.enrollment, auth)?;
        match &key.material {
            KeyMaterial::Symmetric(secret) => Ok(open_in_place(secret, tag.as_bytes(), buf)?),
            KeyMaterial::Signing(_) => Err(BackendError::Unsupported(
                "signing keys cannot decrypt".into(),
            )),
        }
    }

    fn attestation(&self, tag: &str) -> Result<KeyAttestation, BackendError> {
        if lock(&self.keys).contains_key(tag) {
            Ok(KeyAttestation {
                security_level: SecurityLevel::Software,
                certificate_chain: Vec::new(),
            })
        } else {
            Err(BackendError::NotFound)
        }
    }
}

impl MemoryBackend {
    fn insert_key(
        &self,
        spec: &KeySpec,
        size: Option<coffre_crypto_core::KeySizeClass>,
        material: KeyMaterial,
    ) -> Result<(), BackendError> {
        let mut keys = lock(&self.keys);
        if keys.contains_key(&spec.tag) {
            return Err(BackendError::Duplicate);
        }
        let kind = match material {
            KeyMaterial::Signing(_) => KeyKind::Signing,
            KeyMaterial::Symmetric(_) => KeyKind::Symmetric,
        };
        keys.insert(
            spec.tag.clone(),
            StoredKey {
                material,
                meta: KeyMeta {
                    tag: spec.tag.clone(),
                    kind,
                    size,
                    policy: spec.policy,
                    hardware_backed: false,
                    created_at: unix_now(),
                    invalidated: false,
                },
                enrollment: self.current_enrollment(),
            },
        );
        Ok(())
    }
}
