//! Explicit vault context: one backend, one gate, one configuration.
//!
//! Built with [`VaultContext::new`], torn down with [`VaultContext::close`]
//! (or by dropping it). There is no process-wide state; two contexts over
//! two backends are fully independent.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use coffre_crypto_core::{disable_core_dumps, ManagedBuffer, VaultOwned};

use crate::backend::{Backend, ItemKey};
use crate::config::VaultConfig;
use crate::error::VaultError;
use crate::gate::{
    AuthResult, AuthToken, AvailabilityStatus, BiometricGate, BiometricKind, PromptRequest,
};
use crate::keys::SecureKeyManager;
use crate::policy::AccessControlPolicy;
use crate::vault::CredentialVault;

/// A secret that did not fit the caller's buffer, held for the retry.
struct Stash {
    key: ItemKey,
    bytes: ManagedBuffer<VaultOwned>,
    expires: Instant,
}

pub struct VaultContext<B: Backend> {
    backend: B,
    gate: BiometricGate,
    config: VaultConfig,
    stash: Mutex<Option<Stash>>,
}

impl<B: Backend> VaultContext<B> {
    /// Validate `config`, optionally harden the process, and start the gate.
    ///
    /// # Errors
    ///
    /// [`VaultError::Config`] for invalid settings, [`VaultError::Crypto`]
    /// if core dumps cannot be disabled, [`VaultError::Io`] if the gate's
    /// timer cannot start.
    pub fn new(mut backend: B, config: VaultConfig) -> Result<Self, VaultError> {
        config.validate()?;
        if let Some(kdf) = config.password_kdf {
            backend.set_password_kdf(kdf);
        }
        if config.harden_process {
            disable_core_dumps()?;
        }
        let gate = BiometricGate::new(config.gate_timeout())?;
        tracing::info!(
            platform = %backend.profile().platform,
            gate_timeout_secs = config.gate_timeout().as_secs(),
            "vault context ready"
        );
        Ok(Self {
            backend,
            gate,
            config,
            stash: Mutex::new(None),
        })
    }

    /// Credential CRUD over this context's backend.
    #[must_use]
    pub const fn credentials(&self) -> CredentialVault<'_, B> {
        CredentialVault::new(self)
    }

    /// Key lifecycle over this context's backend.
    #[must_use]
    pub const fn keys(&self) -> SecureKeyManager<'_, B> {
        SecureKeyManager::new(self)
    }

    #[must_use]
    pub const fn gate(&self) -> &BiometricGate {
        &self.gate
    }

    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub const fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Biometric availability, as the platform reports it.
    #[must_use]
    pub fn check_availability(&self) -> AvailabilityStatus {
        self.gate.check_availability(&self.backend)
    }

    /// Run a prompt that is not tied to a vault operation.
    #[must_use]
    pub fn authenticate(&self, request: &PromptRequest) -> AuthResult {
        self.gate.authenticate(&self.backend, request)
    }

    #[must_use]
    pub fn supported_biometric_kinds(&self) -> Vec<BiometricKind> {
        self.backend.biometric_kinds()
    }

    /// Abandon any prompt in flight, drop stashed secrets, and hand the
    /// backend back.
    pub fn close(self) -> B {
        self.gate.shutdown();
        self.clear_stash();
        tracing::debug!("vault context closed");
        self.backend
    }

    // ── Shared by the vault and key manager views ──────────────────

    /// Gate an operation on material protected by `policy`.
    ///
    /// Biometric-only policies check availability first and report it
    /// verbatim; the others can still fall back to a passcode or password.
    pub(crate) fn gate_for(
        &self,
        policy: AccessControlPolicy,
    ) -> Result<Option<AuthToken>, VaultError> {
        if !policy.requires_gate() {
            return Ok(None);
        }
        if policy.has_biometric_component() {
            let status = self.check_availability();
            if status != AvailabilityStatus::Available {
                if policy.is_biometric_only() {
                    tracing::debug!(%policy, %status, "gate unavailable");
                    return Err(VaultError::GateUnavailable(status));
                }
                tracing::debug!(%policy, %status, "biometrics unavailable, passcode fallback");
            }
        }
        let request = self
            .config
            .prompt()
            .allow_device_credential(policy.allows_device_credential())
            .capture_password(policy == AccessControlPolicy::ApplicationPassword);
        self.gate.authenticate(&self.backend, &request).into_token()
    }

    fn stash_slot(&self) -> MutexGuard<'_, Option<Stash>> {
        self.stash.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the stashed secret for `key`, if any and still fresh.
    pub(crate) fn take_stash(&self, key: &ItemKey) -> Option<ManagedBuffer<VaultOwned>> {
        let mut slot = self.stash_slot();
        match slot.take() {
            Some(stash) if stash.key == *key && stash.expires > Instant::now() => {
                Some(stash.bytes)
            }
            Some(other) if other.key != *key && other.expires > Instant::now() => {
                *slot = Some(other);
                None
            }
            // Expired: dropped here, which zeroizes it.
            _ => None,
        }
    }

    /// Hold `bytes` for a retry. Returns them freed if stashing is off.
    pub(crate) fn put_stash(&self, key: ItemKey, bytes: ManagedBuffer<VaultOwned>) {
        let ttl = self.config.stash_ttl();
        let expires = match Instant::now().checked_add(ttl) {
            Some(expires) if !ttl.is_zero() => expires,
            _ => {
                bytes.free();
                return;
            }
        };
        *self.stash_slot() = Some(Stash {
            key,
            bytes,
            expires,
        });
    }

    /// Forget a stashed secret after its item changed.
    pub(crate) fn invalidate_stash(&self, key: &ItemKey) {
        let mut slot = self.stash_slot();
        if slot
            .as_ref()
            .is_some_and(|s| s.key.service == key.service && s.key.account == key.account)
        {
            *slot = None;
        }
    }

    pub(crate) fn clear_stash(&self) {
        *self.stash_slot() = None;
    }
}

impl<B: Backend> fmt::Debug for VaultContext<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultContext")
            .field("platform", &self.backend.profile().platform)
            .field("gate", &self.gate)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
