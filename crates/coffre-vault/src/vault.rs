//! Credential CRUD keyed by `(service, account)`.
//!
//! Every operation on gated material runs the [`BiometricGate`] first and
//! hands the resulting token to the backend. Secrets come back in
//! caller-owned buffers; nothing the vault keeps outlives the call except a
//! short-lived stash for [`CredentialVault::retrieve_into`] retries.
//!
//! [`BiometricGate`]: crate::gate::BiometricGate

use coffre_crypto_core::{CallerOwned, ManagedBuffer, ManagedString, VaultOwned};

use crate::backend::{Backend, ItemKey, ItemMeta, NewItem};
use crate::context::VaultContext;
use crate::error::VaultError;
use crate::gate::AuthToken;
use crate::policy::{check_sync, resolve, AccessControlPolicy};

/// Account suffix of the hidden copy written while an overwrite commits.
/// Caller-supplied accounts may not end with it.
pub const STAGING_SUFFIX: &str = "#coffre-staging";

// ---------------------------------------------------------------------------
// Entry builder
// ---------------------------------------------------------------------------

/// A credential to store.
#[derive(Clone, Copy)]
pub struct CredentialEntry<'a> {
    service: &'a str,
    account: &'a str,
    payload: &'a [u8],
    access_control: AccessControlPolicy,
    synchronizable: bool,
    access_group: Option<&'a str>,
}

impl<'a> CredentialEntry<'a> {
    /// An ungated, device-local entry.
    #[must_use]
    pub const fn new(service: &'a str, account: &'a str, payload: &'a [u8]) -> Self {
        Self {
            service,
            account,
            payload,
            access_control: AccessControlPolicy::None,
            synchronizable: false,
            access_group: None,
        }
    }

    #[must_use]
    pub const fn access_control(mut self, policy: AccessControlPolicy) -> Self {
        self.access_control = policy;
        self
    }

    /// Allow the platform to sync the entry. Only valid with
    /// [`AccessControlPolicy::None`].
    #[must_use]
    pub const fn synchronizable(mut self, sync: bool) -> Self {
        self.synchronizable = sync;
        self
    }

    #[must_use]
    pub const fn access_group(mut self, group: &'a str) -> Self {
        self.access_group = Some(group);
        self
    }
}

impl std::fmt::Debug for CredentialEntry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialEntry")
            .field("service", &self.service)
            .field("account", &self.account)
            .field("payload", &format_args!("[{} bytes]", self.payload.len()))
            .field("access_control", &self.access_control)
            .field("synchronizable", &self.synchronizable)
            .field("access_group", &self.access_group)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_id(field: &str, value: &str) -> Result<(), VaultError> {
    if value.is_empty() {
        return Err(VaultError::InvalidInput(format!("{field} must not be empty")));
    }
    if value.contains('\0') {
        return Err(VaultError::InvalidInput(format!(
            "{field} must not contain NUL"
        )));
    }
    if value.ends_with(STAGING_SUFFIX) {
        return Err(VaultError::InvalidInput(format!(
            "{field} uses the reserved suffix {STAGING_SUFFIX}"
        )));
    }
    Ok(())
}

fn validate_group(group: Option<&str>) -> Result<(), VaultError> {
    match group {
        Some(g) if g.is_empty() || g.contains('\0') => Err(VaultError::InvalidInput(
            "access group must be non-empty and NUL-free".into(),
        )),
        _ => Ok(()),
    }
}

fn validate_key(service: &str, account: &str, group: Option<&str>) -> Result<ItemKey, VaultError> {
    validate_id("service", service)?;
    validate_id("account", account)?;
    validate_group(group)?;
    Ok(ItemKey::new(service, account, group))
}

fn validate_payload(payload: &[u8]) -> Result<(), VaultError> {
    if payload.is_empty() {
        return Err(VaultError::InvalidInput("payload must not be empty".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// Credential operations over a [`VaultContext`].
pub struct CredentialVault<'a, B: Backend> {
    ctx: &'a VaultContext<B>,
}

impl<'a, B: Backend> CredentialVault<'a, B> {
    pub(crate) const fn new(ctx: &'a VaultContext<B>) -> Self {
        Self { ctx }
    }

    fn backend(&self) -> &B {
        self.ctx.backend()
    }

    /// Store a credential.
    ///
    /// With `overwrite`, an existing entry is replaced. The new value is
    /// written under a hidden staging account first; the old entry is only
    /// removed once that write succeeded.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidInput`] for empty or reserved identifiers or
    ///   an empty payload.
    /// - [`VaultError::InvalidAccessControl`] if the policy cannot be
    ///   expressed on this platform or is combined with sync.
    /// - [`VaultError::DuplicateItem`] if the entry exists and `overwrite`
    ///   is false.
    /// - Gate failures for gated policies.
    pub fn store(&self, entry: &CredentialEntry<'_>, overwrite: bool) -> Result<(), VaultError> {
        let key = validate_key(entry.service, entry.account, entry.access_group)?;
        validate_payload(entry.payload)?;
        let policy = entry.access_control;
        check_sync(policy, entry.synchronizable)?;
        resolve(policy, &self.backend().profile())?;

        // Uniqueness is on (service, account), whatever the group.
        let existing = self
            .backend()
            .item_meta(&ItemKey::new(entry.service, entry.account, None))
            .map_err(VaultError::from_item)?;
        if existing.is_some() && !overwrite {
            return Err(VaultError::DuplicateItem);
        }

        let token = self.ctx.gate_for(policy)?;
        self.ctx.invalidate_stash(&key);

        match existing {
            None => self
                .backend()
                .add_item(
                    &NewItem {
                        key: key.clone(),
                        payload: entry.payload,
                        policy,
                        synchronizable: entry.synchronizable,
                    },
                    token.as_ref(),
                )
                .map_err(VaultError::from_item)?,
            Some(meta) => {
                let current = ItemKey {
                    access_group: meta.access_group.clone(),
                    ..key.clone()
                };
                let same_group =
                    key.access_group.is_none() || key.access_group == meta.access_group;
                if same_group && can_update_in_place(&meta, policy, entry.synchronizable) {
                    self.backend()
                        .update_item(&current, entry.payload, token.as_ref())
                        .map_err(VaultError::from_item)?;
                } else {
                    let target = ItemKey {
                        access_group: key.access_group.or(meta.access_group),
                        ..key
                    };
                    self.replace(
                        &current,
                        &target,
                        entry.payload,
                        policy,
                        entry.synchronizable,
                        token.as_ref(),
                    )?;
                }
            }
        }

        tracing::info!(
            service = entry.service,
            account = entry.account,
            policy = %policy,
            overwrite,
            "credential stored"
        );
        Ok(())
    }

    /// Store UTF-8 text.
    ///
    /// # Errors
    ///
    /// As [`Self::store`].
    pub fn store_string(
        &self,
        service: &str,
        account: &str,
        secret: &str,
        access_control: AccessControlPolicy,
        overwrite: bool,
    ) -> Result<(), VaultError> {
        let entry =
            CredentialEntry::new(service, account, secret.as_bytes()).access_control(access_control);
        self.store(&entry, overwrite)
    }

    /// Read a credential into a fresh caller-owned buffer.
    ///
    /// `access_group` of `None` matches an entry in any group.
    ///
    /// # Errors
    ///
    /// - [`VaultError::ItemNotFound`] if there is no such entry.
    /// - [`VaultError::AuthenticationInvalidated`] if the entry's key died
    ///   with a biometric enrollment change.
    /// - [`VaultError::GateUnavailable`] with the platform's status when a
    ///   biometric-only entry cannot be unlocked right now.
    /// - Gate failures.
    pub fn retrieve(
        &self,
        service: &str,
        account: &str,
        access_group: Option<&str>,
    ) -> Result<ManagedBuffer<CallerOwned>, VaultError> {
        let key = validate_key(service, account, access_group)?;
        let secret = self.fetch(&key)?;
        tracing::debug!(service, account, "credential retrieved");
        Ok(secret.into_caller())
    }

    /// Read a UTF-8 credential.
    ///
    /// # Errors
    ///
    /// As [`Self::retrieve`], plus [`VaultError::Crypto`] if the stored
    /// bytes are not UTF-8.
    pub fn retrieve_string(
        &self,
        service: &str,
        account: &str,
        access_group: Option<&str>,
    ) -> Result<ManagedString<CallerOwned>, VaultError> {
        let bytes = self.retrieve(service, account, access_group)?;
        Ok(ManagedString::from_utf8(bytes)?)
    }

    /// Copy a credential into `dest`, returning the number of bytes
    /// written.
    ///
    /// A secret larger than `dest` fails with
    /// [`VaultError::BufferTooSmall`] and is held (zeroized on expiry) so
    /// the retry with a larger buffer does not prompt again.
    ///
    /// # Errors
    ///
    /// As [`Self::retrieve`], plus [`VaultError::BufferTooSmall`].
    pub fn retrieve_into(
        &self,
        service: &str,
        account: &str,
        access_group: Option<&str>,
        dest: &mut [u8],
    ) -> Result<usize, VaultError> {
        let key = validate_key(service, account, access_group)?;
        let secret = match self.ctx.take_stash(&key) {
            Some(stashed) => self.recheck_stash(&key, stashed)?,
            None => self.fetch(&key)?,
        };
        match secret.copy_into(dest) {
            Ok(written) => {
                secret.free();
                Ok(written)
            }
            Err(capacity) => {
                tracing::debug!(
                    service,
                    account,
                    required = capacity.required,
                    "caller buffer too small, stashing for retry"
                );
                self.ctx.put_stash(key, secret);
                Err(capacity.into())
            }
        }
    }

    /// Replace an existing credential's payload, and optionally its policy.
    ///
    /// Gated entries prompt under their current policy before anything
    /// changes. A policy change rewrites the entry through the same staged
    /// path as an overwriting [`Self::store`] and prompts once more for a
    /// gated target policy.
    ///
    /// # Errors
    ///
    /// [`VaultError::ItemNotFound`] if the entry is absent; otherwise as
    /// [`Self::store`].
    pub fn update(
        &self,
        service: &str,
        account: &str,
        payload: &[u8],
        access_control: Option<AccessControlPolicy>,
    ) -> Result<(), VaultError> {
        let key = validate_key(service, account, None)?;
        validate_payload(payload)?;
        let meta = self.meta(&key)?;
        let target = access_control.unwrap_or(meta.policy);
        check_sync(target, meta.synchronizable)?;
        resolve(target, &self.backend().profile())?;

        if meta.invalidated && target == meta.policy {
            return Err(VaultError::AuthenticationInvalidated);
        }

        let key = ItemKey {
            access_group: meta.access_group.clone(),
            ..key
        };
        if !meta.invalidated {
            // Authorise the change against the current protection.
            let current = self.ctx.gate_for(meta.policy)?;
            if target == meta.policy {
                self.ctx.invalidate_stash(&key);
                self.backend()
                    .update_item(&key, payload, current.as_ref())
                    .map_err(VaultError::from_item)?;
                tracing::info!(service, account, "credential updated");
                return Ok(());
            }
        }

        let token = self.ctx.gate_for(target)?;
        self.ctx.invalidate_stash(&key);
        self.replace(&key, &key, payload, target, meta.synchronizable, token.as_ref())?;
        tracing::info!(
            service,
            account,
            from = %meta.policy,
            to = %target,
            "credential updated with new access control"
        );
        Ok(())
    }

    /// Remove a credential. Absent entries are not an error.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidInput`] or a platform fault.
    pub fn delete(
        &self,
        service: &str,
        account: &str,
        access_group: Option<&str>,
    ) -> Result<(), VaultError> {
        let key = validate_key(service, account, access_group)?;
        self.ctx.invalidate_stash(&key);
        let removed = self
            .backend()
            .delete_item(&key)
            .map_err(VaultError::from_item)?;
        if removed {
            tracing::info!(service, account, "credential deleted");
        }
        Ok(())
    }

    /// Whether an entry exists. Never prompts.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidInput`] or a platform fault.
    pub fn contains(
        &self,
        service: &str,
        account: &str,
        access_group: Option<&str>,
    ) -> Result<bool, VaultError> {
        let key = validate_key(service, account, access_group)?;
        Ok(self
            .backend()
            .item_meta(&key)
            .map_err(VaultError::from_item)?
            .is_some())
    }

    /// Policy, sync flag and timestamps of an entry. Never prompts.
    ///
    /// # Errors
    ///
    /// [`VaultError::ItemNotFound`] if the entry is absent.
    pub fn item_info(
        &self,
        service: &str,
        account: &str,
        access_group: Option<&str>,
    ) -> Result<ItemMeta, VaultError> {
        let key = validate_key(service, account, access_group)?;
        self.meta(&key)
    }

    /// Account names under `service`, sorted, without duplicates.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidInput`] or a platform fault.
    pub fn list_accounts(
        &self,
        service: &str,
        access_group: Option<&str>,
    ) -> Result<Vec<String>, VaultError> {
        validate_id("service", service)?;
        validate_group(access_group)?;
        let mut accounts: Vec<String> = self
            .backend()
            .accounts(service, access_group)
            .map_err(VaultError::from_item)?
            .into_iter()
            .filter(|a| !a.ends_with(STAGING_SUFFIX))
            .collect();
        accounts.sort_unstable();
        accounts.dedup();
        Ok(accounts)
    }

    /// Delete every entry under `service`, including leftover staging
    /// copies. Returns the number of visible entries removed.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidInput`] or the first platform fault.
    pub fn clear_all(
        &self,
        service: &str,
        access_group: Option<&str>,
    ) -> Result<usize, VaultError> {
        validate_id("service", service)?;
        validate_group(access_group)?;
        self.ctx.clear_stash();
        let mut removed = 0_usize;
        for account in self
            .backend()
            .accounts(service, access_group)
            .map_err(VaultError::from_item)?
        {
            let key = ItemKey::new(service, &account, access_group);
            let gone = self
                .backend()
                .delete_item(&key)
                .map_err(VaultError::from_item)?;
            if gone && !account.ends_with(STAGING_SUFFIX) {
                removed = removed.saturating_add(1);
            }
        }
        tracing::info!(service, removed, "service cleared");
        Ok(removed)
    }

    // -- internals ----------------------------------------------------------

    fn meta(&self, key: &ItemKey) -> Result<ItemMeta, VaultError> {
        self.backend()
            .item_meta(key)
            .map_err(VaultError::from_item)?
            .ok_or(VaultError::ItemNotFound)
    }

    /// Gate and read, leaving the secret vault-owned.
    fn fetch(&self, key: &ItemKey) -> Result<ManagedBuffer<VaultOwned>, VaultError> {
        let meta = self.meta(key)?;
        if meta.invalidated {
            tracing::warn!(
                service = %key.service,
                account = %key.account,
                "credential invalidated by enrollment change"
            );
            return Err(VaultError::AuthenticationInvalidated);
        }
        let token = self.ctx.gate_for(meta.policy)?;
        self.backend()
            .copy_item(key, token.as_ref())
            .map_err(VaultError::from_item)
    }

    /// A stashed secret is only handed out while its entry is still there
    /// and still valid for the enrolled biometrics.
    fn recheck_stash(
        &self,
        key: &ItemKey,
        stashed: ManagedBuffer<VaultOwned>,
    ) -> Result<ManagedBuffer<VaultOwned>, VaultError> {
        match self.meta(key) {
            Ok(meta) if !meta.invalidated => Ok(stashed),
            Ok(_) => {
                stashed.free();
                tracing::warn!(
                    service = %key.service,
                    account = %key.account,
                    "stashed credential dropped after enrollment change"
                );
                Err(VaultError::AuthenticationInvalidated)
            }
            Err(e) => {
                stashed.free();
                Err(e)
            }
        }
    }

    /// Stage-then-commit replacement of an existing entry.
    ///
    /// `current` names the entry as stored; `key` is where the new value
    /// lands, which may be another access group. A failure while staging
    /// leaves the old entry untouched. A failure after the old entry is gone
    /// removes the staged copy as well, so no stale value survives.
    fn replace(
        &self,
        current: &ItemKey,
        key: &ItemKey,
        payload: &[u8],
        policy: AccessControlPolicy,
        synchronizable: bool,
        token: Option<&AuthToken>,
    ) -> Result<(), VaultError> {
        let staging = key.with_account(&format!("{}{STAGING_SUFFIX}", key.account));
        // Leftover from an interrupted commit.
        self.backend()
            .delete_item(&staging)
            .map_err(VaultError::from_item)?;

        self.backend()
            .add_item(
                &NewItem {
                    key: staging.clone(),
                    payload,
                    policy,
                    synchronizable,
                },
                token,
            )
            .map_err(VaultError::from_item)?;

        if let Err(e) = self.backend().delete_item(current) {
            self.discard_staging(&staging);
            return Err(VaultError::from_item(e));
        }
        if let Err(e) = self.backend().rename_item(&staging, &key.account) {
            tracing::error!(
                service = %key.service,
                account = %key.account,
                error = %e,
                "overwrite failed after removing the old entry"
            );
            self.discard_staging(&staging);
            return Err(VaultError::from_item(e));
        }
        Ok(())
    }

    fn discard_staging(&self, staging: &ItemKey) {
        if let Err(e) = self.backend().delete_item(staging) {
            tracing::warn!(service = %staging.service, error = %e, "could not remove staged copy");
        }
    }
}

/// Whether an overwrite can keep the existing item and swap its payload.
fn can_update_in_place(meta: &ItemMeta, policy: AccessControlPolicy, sync: bool) -> bool {
    !meta.invalidated
        && meta.policy == policy
        && meta.synchronizable == sync
        // A new application password must reseal, not reuse the old one.
        && policy != AccessControlPolicy::ApplicationPassword
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, FaultPoint, MemoryBackend, ScriptedResponse};
    use crate::config::VaultConfig;
    use crate::gate::AvailabilityStatus;

    fn context() -> VaultContext<MemoryBackend> {
        VaultContext::new(MemoryBackend::new(), VaultConfig::default()).unwrap()
    }

    fn platform_fault() -> BackendError {
        BackendError::Platform {
            code: -34,
            message: "disk full".into(),
        }
    }

    #[test]
    fn identifiers_are_validated() {
        let ctx = context();
        let vault = ctx.credentials();
        for (service, account) in [("", "a"), ("s", ""), ("s\0x", "a"), ("s", "a#coffre-staging")] {
            assert!(matches!(
                vault.store(&CredentialEntry::new(service, account, b"x"), false),
                Err(VaultError::InvalidInput(_))
            ));
        }
        assert!(matches!(
            vault.store(&CredentialEntry::new("s", "a", b""), false),
            Err(VaultError::InvalidInput(_))
        ));
        assert!(matches!(
            vault.list_accounts("", None),
            Err(VaultError::InvalidInput(_))
        ));
    }

    #[test]
    fn sync_with_gated_policy_is_refused_before_storage() {
        let ctx = context();
        let entry = CredentialEntry::new("s", "a", b"x")
            .access_control(AccessControlPolicy::DevicePasscode)
            .synchronizable(true);
        assert!(matches!(
            ctx.credentials().store(&entry, false),
            Err(VaultError::InvalidAccessControl(_))
        ));
        assert_eq!(ctx.backend().item_count(), 0);
        assert_eq!(ctx.backend().prompts_shown(), 0);
    }

    #[test]
    fn duplicate_without_overwrite_keeps_old_value() {
        let ctx = context();
        let vault = ctx.credentials();
        vault.store(&CredentialEntry::new("s", "a", b"one"), false).unwrap();
        assert!(matches!(
            vault.store(&CredentialEntry::new("s", "a", b"two"), false),
            Err(VaultError::DuplicateItem)
        ));
        assert_eq!(vault.retrieve("s", "a", None).unwrap().expose(), b"one");
    }

    #[test]
    fn policy_changing_overwrite_goes_through_staging() {
        let ctx = context();
        let vault = ctx.credentials();
        vault.store(&CredentialEntry::new("s", "a", b"one"), false).unwrap();
        let entry = CredentialEntry::new("s", "a", b"two")
            .access_control(AccessControlPolicy::BiometricAny);
        vault.store(&entry, true).unwrap();
        assert_eq!(ctx.backend().item_count(), 1);
        assert_eq!(
            vault.item_info("s", "a", None).unwrap().policy,
            AccessControlPolicy::BiometricAny
        );
        assert_eq!(vault.retrieve("s", "a", None).unwrap().expose(), b"two");
    }

    #[test]
    fn failed_staging_leaves_old_entry() {
        let ctx = context();
        let vault = ctx.credentials();
        vault.store(&CredentialEntry::new("s", "a", b"one"), false).unwrap();
        ctx.backend().fail_next(FaultPoint::AddItem, platform_fault());
        let entry = CredentialEntry::new("s", "a", b"two")
            .access_control(AccessControlPolicy::DevicePasscode);
        assert!(matches!(
            vault.store(&entry, true),
            Err(VaultError::Platform { code: -34, .. })
        ));
        assert_eq!(vault.retrieve("s", "a", None).unwrap().expose(), b"one");
        assert_eq!(vault.list_accounts("s", None).unwrap(), ["a"]);
    }

    #[test]
    fn failed_commit_leaves_nothing_stale() {
        let ctx = context();
        let vault = ctx.credentials();
        vault.store(&CredentialEntry::new("s", "a", b"one"), false).unwrap();
        ctx.backend().fail_next(FaultPoint::RenameItem, platform_fault());
        let entry = CredentialEntry::new("s", "a", b"two")
            .access_control(AccessControlPolicy::DevicePasscode);
        assert!(vault.store(&entry, true).is_err());
        assert!(matches!(
            vault.retrieve("s", "a", None),
            Err(VaultError::ItemNotFound)
        ));
        assert_eq!(ctx.backend().item_count(), 0);
    }

    #[test]
    fn staging_entries_are_hidden_and_cleared() {
        let ctx = context();
        let vault = ctx.credentials();
        vault.store(&CredentialEntry::new("s", "b", b"x"), false).unwrap();
        vault.store(&CredentialEntry::new("s", "a", b"x"), false).unwrap();
        ctx.backend()
            .add_item(
                &NewItem {
                    key: ItemKey::new("s", "a#coffre-staging", None),
                    payload: b"left over",
                    policy: AccessControlPolicy::None,
                    synchronizable: false,
                },
                None,
            )
            .unwrap();
        assert_eq!(vault.list_accounts("s", None).unwrap(), ["a", "b"]);
        assert_eq!(vault.clear_all("s", None).unwrap(), 2);
        assert_eq!(ctx.backend().item_count(), 0);
    }

    #[test]
    fn retrieve_checks_invalidation_before_prompting() {
        let ctx = context();
        let vault = ctx.credentials();
        let entry = CredentialEntry::new("s", "a", b"x")
            .access_control(AccessControlPolicy::BiometricCurrentEnrollment);
        vault.store(&entry, false).unwrap();
        let shown = ctx.backend().prompts_shown();
        ctx.backend().change_biometric_enrollment();
        assert!(matches!(
            vault.retrieve("s", "a", None),
            Err(VaultError::AuthenticationInvalidated)
        ));
        assert_eq!(ctx.backend().prompts_shown(), shown);
    }

    #[test]
    fn retrieve_reports_unavailable_gate_verbatim() {
        let ctx = context();
        let vault = ctx.credentials();
        let entry = CredentialEntry::new("s", "a", b"x")
            .access_control(AccessControlPolicy::BiometricAny);
        vault.store(&entry, false).unwrap();
        ctx.backend().set_availability(AvailabilityStatus::NotEnrolled);
        assert!(matches!(
            vault.retrieve("s", "a", None),
            Err(VaultError::GateUnavailable(AvailabilityStatus::NotEnrolled))
        ));
    }

    #[test]
    fn retrieve_into_reuses_the_stash() {
        let ctx = context();
        let vault = ctx.credentials();
        let entry = CredentialEntry::new("s", "a", b"0123456789")
            .access_control(AccessControlPolicy::DevicePasscode);
        vault.store(&entry, false).unwrap();
        let before = ctx.backend().prompts_shown();

        let mut small = [0_u8; 4];
        assert!(matches!(
            vault.retrieve_into("s", "a", None, &mut small),
            Err(VaultError::BufferTooSmall {
                required: 10,
                capacity: 4
            })
        ));
        let mut big = [0_u8; 16];
        assert_eq!(vault.retrieve_into("s", "a", None, &mut big).unwrap(), 10);
        assert_eq!(&big[..10], b"0123456789");
        assert_eq!(ctx.backend().prompts_shown(), before + 1);
    }

    #[test]
    fn delete_drops_the_stash() {
        let ctx = context();
        let vault = ctx.credentials();
        vault.store(&CredentialEntry::new("s", "a", b"0123456789"), false).unwrap();
        let mut small = [0_u8; 2];
        assert!(vault.retrieve_into("s", "a", None, &mut small).is_err());
        vault.delete("s", "a", None).unwrap();
        let mut big = [0_u8; 16];
        assert!(matches!(
            vault.retrieve_into("s", "a", None, &mut big),
            Err(VaultError::ItemNotFound)
        ));
    }

    #[test]
    fn update_prompts_under_the_current_policy() {
        let ctx = context();
        let vault = ctx.credentials();
        let entry = CredentialEntry::new("s", "a", b"one")
            .access_control(AccessControlPolicy::DevicePasscode);
        vault.store(&entry, false).unwrap();
        ctx.backend().script([ScriptedResponse::Cancel]);
        assert!(matches!(
            vault.update("s", "a", b"two", None),
            Err(VaultError::AuthenticationCancelled)
        ));
        assert_eq!(ctx.backend().peek_payload("s", "a").unwrap(), b"one");

        vault.update("s", "a", b"two", None).unwrap();
        assert_eq!(vault.retrieve("s", "a", None).unwrap().expose(), b"two");
    }

    #[test]
    fn update_can_relax_policy() {
        let ctx = context();
        let vault = ctx.credentials();
        let entry = CredentialEntry::new("s", "a", b"one")
            .access_control(AccessControlPolicy::BiometricAny);
        vault.store(&entry, false).unwrap();
        vault
            .update("s", "a", b"two", Some(AccessControlPolicy::None))
            .unwrap();
        let before = ctx.backend().prompts_shown();
        assert_eq!(vault.retrieve("s", "a", None).unwrap().expose(), b"two");
        assert_eq!(ctx.backend().prompts_shown(), before);
    }

    #[test]
    fn update_missing_entry_is_not_found() {
        let ctx = context();
        assert!(matches!(
            ctx.credentials().update("s", "nobody", b"x", None),
            Err(VaultError::ItemNotFound)
        ));
    }

    #[test]
    fn strings_round_trip() {
        let ctx = context();
        let vault = ctx.credentials();
        vault
            .store_string("s", "a", "hunter2", AccessControlPolicy::None, false)
            .unwrap();
        assert_eq!(vault.retrieve_string("s", "a", None).unwrap().expose(), "hunter2");
    }

    #[test]
    fn entry_debug_masks_payload() {
        let entry = CredentialEntry::new("s", "a", b"topsecret");
        let debug = format!("{entry:?}");
        assert!(!debug.contains("topsecret"));
        assert!(debug.contains("9 bytes"));
    }
}
