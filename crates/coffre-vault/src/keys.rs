//! Hardware key lifecycle: generate, sign, delete, and purge after a
//! biometric enrollment change.
//!
//! Private keys never leave the backend. Public keys and signatures come
//! back as independent caller-owned buffers.

use coffre_crypto_core::{CallerOwned, KeySizeClass, ManagedBuffer, SecretBuffer, VaultOwned};
use serde::Serialize;

use crate::backend::{Backend, BackendError, KeyAttestation, KeyKind, KeyMeta, KeySpec};
use crate::context::VaultContext;
use crate::error::VaultError;
use crate::policy::{resolve, AccessControlPolicy};

/// Outcome of [`SecureKeyManager::invalidate_biometric_keys`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationReport {
    /// Tags that were deleted.
    pub deleted: Vec<String>,
    /// Tags whose deletion failed; they are still present.
    pub failed: Vec<String>,
}

fn validate_tag(tag: &str) -> Result<(), VaultError> {
    if tag.is_empty() || tag.contains('\0') {
        return Err(VaultError::InvalidInput(
            "key tag must be non-empty and NUL-free".into(),
        ));
    }
    Ok(())
}

/// Key operations over a [`VaultContext`].
pub struct SecureKeyManager<'a, B: Backend> {
    ctx: &'a VaultContext<B>,
}

impl<'a, B: Backend> SecureKeyManager<'a, B> {
    pub(crate) const fn new(ctx: &'a VaultContext<B>) -> Self {
        Self { ctx }
    }

    fn backend(&self) -> &B {
        self.ctx.backend()
    }

    /// Create an ECDSA key pair under `tag` and return the uncompressed
    /// public point (65 bytes for P-256, 97 for P-384).
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidAccessControl`] if the policy has no key
    ///   equivalent on this platform.
    /// - [`VaultError::DuplicateTag`] if `tag` is taken.
    /// - [`VaultError::KeyGenFailed`] for any platform failure.
    pub fn generate_key(
        &self,
        tag: &str,
        size: KeySizeClass,
        access_control: AccessControlPolicy,
    ) -> Result<ManagedBuffer<CallerOwned>, VaultError> {
        validate_tag(tag)?;
        resolve(access_control, &self.backend().profile().for_keys())?;
        if self.lookup(tag)?.is_some() {
            return Err(VaultError::DuplicateTag(tag.to_owned()));
        }
        let spec = KeySpec {
            tag: tag.to_owned(),
            kind: KeyKind::Signing,
            size: Some(size),
            policy: access_control,
        };
        let public = self
            .backend()
            .generate_key(&spec)
            .map_err(|e| keygen_error(e, tag))?;
        tracing::info!(tag, %size, policy = %access_control, "key generated");
        Ok(ManagedBuffer::<VaultOwned>::from_slice(&public).into_caller())
    }

    /// Create an AES-256 key under `tag`, for
    /// [`Self::encrypt_in_place`] and [`Self::decrypt_in_place`].
    ///
    /// # Errors
    ///
    /// As [`Self::generate_key`], plus [`VaultError::Unsupported`] where
    /// the platform keeps no symmetric keys.
    pub fn generate_symmetric_key(
        &self,
        tag: &str,
        access_control: AccessControlPolicy,
    ) -> Result<(), VaultError> {
        validate_tag(tag)?;
        resolve(access_control, &self.backend().profile().for_keys())?;
        if self.lookup(tag)?.is_some() {
            return Err(VaultError::DuplicateTag(tag.to_owned()));
        }
        let spec = KeySpec {
            tag: tag.to_owned(),
            kind: KeyKind::Symmetric,
            size: None,
            policy: access_control,
        };
        self.backend()
            .generate_symmetric_key(&spec)
            .map_err(|e| keygen_error(e, tag))?;
        tracing::info!(tag, policy = %access_control, "symmetric key generated");
        Ok(())
    }

    /// Sign `message` with the key under `tag`, prompting first if the key
    /// is gated. The digest follows the curve: SHA-256 for P-256, SHA-384
    /// for P-384. Returns a DER-encoded signature.
    ///
    /// # Errors
    ///
    /// - [`VaultError::KeyNotFound`] if there is no key under `tag`.
    /// - [`VaultError::KeyKindMismatch`] for a symmetric key.
    /// - [`VaultError::AuthenticationInvalidated`] if the key died with an
    ///   enrollment change.
    /// - Gate failures.
    /// - [`VaultError::SigningFailed`] for any platform failure.
    pub fn sign(
        &self,
        tag: &str,
        message: &[u8],
    ) -> Result<ManagedBuffer<CallerOwned>, VaultError> {
        let meta = self.usable(tag, KeyKind::Signing)?;
        let token = self.ctx.gate_for(meta.policy)?;
        let signature = self
            .backend()
            .sign(tag, message, token.as_ref())
            .map_err(|e| match e {
                BackendError::Platform { .. } | BackendError::Crypto(_) => {
                    tracing::error!(tag, error = %e, "signing failed");
                    VaultError::SigningFailed(e.to_string())
                }
                other => VaultError::from_key(other, tag),
            })?;
        tracing::debug!(tag, "message signed");
        Ok(ManagedBuffer::<VaultOwned>::from_secret(SecretBuffer::from_vec(signature)).into_caller())
    }

    /// Encrypt `buf` in place with the symmetric key under `tag`. The
    /// buffer grows by the nonce and tag.
    ///
    /// # Errors
    ///
    /// As [`Self::sign`], with [`VaultError::KeyKindMismatch`] for a signing
    /// key.
    pub fn encrypt_in_place(&self, tag: &str, buf: &mut Vec<u8>) -> Result<(), VaultError> {
        let meta = self.usable(tag, KeyKind::Symmetric)?;
        let token = self.ctx.gate_for(meta.policy)?;
        self.backend()
            .encrypt_in_place(tag, buf, token.as_ref())
            .map_err(|e| VaultError::from_key(e, tag))
    }

    /// Decrypt `buf` in place with the symmetric key under `tag`.
    ///
    /// # Errors
    ///
    /// As [`Self::encrypt_in_place`]; tampered input is
    /// [`VaultError::Crypto`].
    pub fn decrypt_in_place(&self, tag: &str, buf: &mut Vec<u8>) -> Result<(), VaultError> {
        let meta = self.usable(tag, KeyKind::Symmetric)?;
        let token = self.ctx.gate_for(meta.policy)?;
        self.backend()
            .decrypt_in_place(tag, buf, token.as_ref())
            .map_err(|e| VaultError::from_key(e, tag))
    }

    /// Remove the key under `tag`. Absent keys are not an error.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidInput`] or a platform fault.
    pub fn delete_key(&self, tag: &str) -> Result<(), VaultError> {
        validate_tag(tag)?;
        let removed = self
            .backend()
            .delete_key(tag)
            .map_err(|e| VaultError::from_key(e, tag))?;
        if removed {
            tracing::info!(tag, "key deleted");
        }
        Ok(())
    }

    /// Whether a key exists under `tag`. Never prompts.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidInput`] or a platform fault.
    pub fn key_exists(&self, tag: &str) -> Result<bool, VaultError> {
        validate_tag(tag)?;
        Ok(self.lookup(tag)?.is_some())
    }

    /// # Errors
    ///
    /// [`VaultError::KeyNotFound`] if there is no key under `tag`.
    pub fn key_info(&self, tag: &str) -> Result<KeyMeta, VaultError> {
        validate_tag(tag)?;
        self.lookup(tag)?
            .ok_or_else(|| VaultError::KeyNotFound(tag.to_owned()))
    }

    /// Where the key lives, with the platform's certificate chain if any.
    ///
    /// # Errors
    ///
    /// [`VaultError::KeyNotFound`] if there is no key under `tag`.
    pub fn key_attestation(&self, tag: &str) -> Result<KeyAttestation, VaultError> {
        validate_tag(tag)?;
        self.backend()
            .attestation(tag)
            .map_err(|e| VaultError::from_key(e, tag))
    }

    /// Every key tag this context manages, sorted.
    ///
    /// # Errors
    ///
    /// Platform faults only.
    pub fn list_keys(&self) -> Result<Vec<String>, VaultError> {
        let mut tags = self.backend().key_tags().map_err(VaultError::from_item)?;
        tags.sort_unstable();
        tags.dedup();
        Ok(tags)
    }

    /// Delete every managed key. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// The first platform fault; keys deleted before it stay deleted.
    pub fn clear_all_keys(&self) -> Result<usize, VaultError> {
        let mut removed = 0_usize;
        for tag in self.list_keys()? {
            if self
                .backend()
                .delete_key(&tag)
                .map_err(|e| VaultError::from_key(e, &tag))?
            {
                removed = removed.saturating_add(1);
            }
        }
        tracing::info!(removed, "all keys cleared");
        Ok(removed)
    }

    /// Delete every key whose policy involves biometrics. Call after the
    /// user's enrollment changed.
    ///
    /// Per-key failures are collected in the report rather than stopping
    /// the sweep.
    ///
    /// # Errors
    ///
    /// Only if the key list itself cannot be read.
    pub fn invalidate_biometric_keys(&self) -> Result<InvalidationReport, VaultError> {
        let mut report = InvalidationReport::default();
        for tag in self.list_keys()? {
            let meta = match self.backend().key_meta(&tag) {
                Ok(Some(meta)) => meta,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(tag = %tag, error = %e, "cannot read key");
                    report.failed.push(tag);
                    continue;
                }
            };
            if !meta.policy.has_biometric_component() {
                continue;
            }
            match self.backend().delete_key(&tag) {
                Ok(_) => {
                    tracing::warn!(
                        tag = %tag,
                        policy = %meta.policy,
                        "biometric key deleted after enrollment change"
                    );
                    report.deleted.push(tag);
                }
                Err(e) => {
                    tracing::error!(tag = %tag, error = %e, "biometric key deletion failed");
                    report.failed.push(tag);
                }
            }
        }
        Ok(report)
    }

    // -- internals ----------------------------------------------------------

    fn lookup(&self, tag: &str) -> Result<Option<KeyMeta>, VaultError> {
        self.backend()
            .key_meta(tag)
            .map_err(|e| VaultError::from_key(e, tag))
    }

    /// Metadata of a key that exists, has `kind`, and is still valid.
    fn usable(&self, tag: &str, kind: KeyKind) -> Result<KeyMeta, VaultError> {
        validate_tag(tag)?;
        let meta = self
            .lookup(tag)?
            .ok_or_else(|| VaultError::KeyNotFound(tag.to_owned()))?;
        if meta.kind != kind {
            return Err(VaultError::KeyKindMismatch(tag.to_owned()));
        }
        if meta.invalidated {
            tracing::warn!(tag, "key invalidated by enrollment change");
            return Err(VaultError::AuthenticationInvalidated);
        }
        Ok(meta)
    }
}

fn keygen_error(err: BackendError, tag: &str) -> VaultError {
    match err {
        BackendError::Duplicate => VaultError::DuplicateTag(tag.to_owned()),
        BackendError::Unsupported(what) => VaultError::Unsupported(what),
        other => {
            tracing::error!(tag, error = %other, "key generation failed");
            VaultError::KeyGenFailed(other.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FaultPoint, MemoryBackend, ScriptedResponse};
    use crate::config::VaultConfig;
    use crate::policy::PlatformProfile;
    use coffre_crypto_core::ecdsa;

    fn context() -> VaultContext<MemoryBackend> {
        VaultContext::new(MemoryBackend::new(), VaultConfig::default()).unwrap()
    }

    #[test]
    fn generate_returns_uncompressed_point() {
        let ctx = context();
        let keys = ctx.keys();
        let p256 = keys
            .generate_key("k256", KeySizeClass::P256, AccessControlPolicy::None)
            .unwrap();
        assert_eq!(p256.len(), 65);
        assert_eq!(p256.expose()[0], 0x04);
        let p384 = keys
            .generate_key("k384", KeySizeClass::P384, AccessControlPolicy::None)
            .unwrap();
        assert_eq!(p384.len(), 97);
    }

    #[test]
    fn duplicate_tag_is_rejected() {
        let ctx = context();
        let keys = ctx.keys();
        keys.generate_key("k", KeySizeClass::P256, AccessControlPolicy::None)
            .unwrap();
        assert!(matches!(
            keys.generate_key("k", KeySizeClass::P384, AccessControlPolicy::None),
            Err(VaultError::DuplicateTag(t)) if t == "k"
        ));
    }

    #[test]
    fn backend_failure_is_keygen_failed() {
        let ctx = context();
        ctx.backend().fail_next(
            FaultPoint::GenerateKey,
            BackendError::Platform {
                code: -4,
                message: "enclave busy".into(),
            },
        );
        assert!(matches!(
            ctx.keys()
                .generate_key("k", KeySizeClass::P256, AccessControlPolicy::None),
            Err(VaultError::KeyGenFailed(_))
        ));
        assert!(!ctx.keys().key_exists("k").unwrap());
    }

    #[test]
    fn signature_verifies_against_returned_public_key() {
        let ctx = context();
        let keys = ctx.keys();
        for (tag, size) in [("a", KeySizeClass::P256), ("b", KeySizeClass::P384)] {
            let public = keys
                .generate_key(tag, size, AccessControlPolicy::BiometricAny)
                .unwrap();
            let sig = keys.sign(tag, b"payload").unwrap();
            ecdsa::verify(size, public.expose(), b"payload", sig.expose()).unwrap();
            assert!(ecdsa::verify(size, public.expose(), b"other", sig.expose()).is_err());
        }
    }

    #[test]
    fn sign_missing_key_is_key_not_found() {
        let ctx = context();
        assert!(matches!(
            ctx.keys().sign("ghost", b"m"),
            Err(VaultError::KeyNotFound(t)) if t == "ghost"
        ));
    }

    #[test]
    fn sign_cancelled_prompt() {
        let ctx = context();
        let keys = ctx.keys();
        keys.generate_key("k", KeySizeClass::P256, AccessControlPolicy::DevicePasscode)
            .unwrap();
        ctx.backend().script([ScriptedResponse::Cancel]);
        assert!(matches!(
            keys.sign("k", b"m"),
            Err(VaultError::AuthenticationCancelled)
        ));
    }

    #[test]
    fn sign_platform_fault_is_signing_failed() {
        let ctx = context();
        let keys = ctx.keys();
        keys.generate_key("k", KeySizeClass::P256, AccessControlPolicy::None)
            .unwrap();
        ctx.backend().fail_next(
            FaultPoint::Sign,
            BackendError::Platform {
                code: 7,
                message: "boom".into(),
            },
        );
        assert!(matches!(keys.sign("k", b"m"), Err(VaultError::SigningFailed(_))));
    }

    #[test]
    fn delete_is_idempotent() {
        let ctx = context();
        let keys = ctx.keys();
        keys.generate_key("k", KeySizeClass::P256, AccessControlPolicy::None)
            .unwrap();
        keys.delete_key("k").unwrap();
        keys.delete_key("k").unwrap();
        assert!(!keys.key_exists("k").unwrap());
    }

    #[test]
    fn enrollment_change_purges_biometric_keys_only() {
        let ctx = context();
        let keys = ctx.keys();
        keys.generate_key("bio", KeySizeClass::P256, AccessControlPolicy::BiometricAny)
            .unwrap();
        keys.generate_key("cur", KeySizeClass::P256, AccessControlPolicy::BiometricCurrentEnrollment)
            .unwrap();
        keys.generate_key("pin", KeySizeClass::P256, AccessControlPolicy::DevicePasscode)
            .unwrap();
        keys.generate_key("open", KeySizeClass::P256, AccessControlPolicy::None)
            .unwrap();
        ctx.backend().change_biometric_enrollment();
        assert!(matches!(
            keys.sign("cur", b"m"),
            Err(VaultError::AuthenticationInvalidated)
        ));

        let report = keys.invalidate_biometric_keys().unwrap();
        assert_eq!(report.deleted, ["bio", "cur"]);
        assert!(report.failed.is_empty());
        assert_eq!(keys.list_keys().unwrap(), ["open", "pin"]);
    }

    #[test]
    fn failed_deletions_are_reported() {
        let ctx = context();
        let keys = ctx.keys();
        keys.generate_key("bio", KeySizeClass::P256, AccessControlPolicy::BiometricAny)
            .unwrap();
        ctx.backend().fail_next(
            FaultPoint::DeleteKey,
            BackendError::Platform {
                code: 1,
                message: "locked".into(),
            },
        );
        let report = keys.invalidate_biometric_keys().unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(report.failed, ["bio"]);
        assert!(keys.key_exists("bio").unwrap());
    }

    #[test]
    fn symmetric_keys_round_trip_and_kinds_are_checked() {
        let ctx = context();
        let keys = ctx.keys();
        keys.generate_symmetric_key("aes", AccessControlPolicy::None)
            .unwrap();
        let mut buf = b"plaintext".to_vec();
        keys.encrypt_in_place("aes", &mut buf).unwrap();
        assert_ne!(buf, b"plaintext");
        keys.decrypt_in_place("aes", &mut buf).unwrap();
        assert_eq!(buf, b"plaintext");

        assert!(matches!(
            keys.sign("aes", b"m"),
            Err(VaultError::KeyKindMismatch(_))
        ));
        keys.generate_key("ec", KeySizeClass::P256, AccessControlPolicy::None)
            .unwrap();
        assert!(matches!(
            keys.encrypt_in_place("ec", &mut buf),
            Err(VaultError::KeyKindMismatch(_))
        ));
    }

    #[test]
    fn clear_all_keys_counts() {
        let ctx = context();
        let keys = ctx.keys();
        keys.generate_key("a", KeySizeClass::P256, AccessControlPolicy::None)
            .unwrap();
        keys.generate_symmetric_key("b", AccessControlPolicy::None)
            .unwrap();
        assert_eq!(keys.clear_all_keys().unwrap(), 2);
        assert_eq!(ctx.backend().key_count(), 0);
    }

    #[test]
    fn application_password_keys_follow_key_profile() {
        let backend = MemoryBackend::with_profile(PlatformProfile::android(true));
        let ctx = VaultContext::new(backend, VaultConfig::default()).unwrap();
        assert!(matches!(
            ctx.keys()
                .generate_key("k", KeySizeClass::P256, AccessControlPolicy::ApplicationPassword),
            Err(VaultError::InvalidAccessControl(_))
        ));
    }
}
