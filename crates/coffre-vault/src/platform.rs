//! One-shot probe of what the current device offers.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::Serialize;

use crate::backend::Backend;
use crate::gate::{AvailabilityStatus, BiometricKind};
use crate::policy::{resolve, AccessControlPolicy, Platform};

/// Device capabilities, detected once at startup.
///
/// Biometric availability can change during a session (lockout, new
/// enrollment); query [`VaultContext::check_availability`] before relying
/// on it for a specific operation.
///
/// [`VaultContext::check_availability`]: crate::VaultContext::check_availability
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformCapabilities {
    pub platform: Platform,
    pub availability: AvailabilityStatus,
    pub biometric_kinds: Vec<BiometricKind>,
    /// Whether credentials may use [`AccessControlPolicy::ApplicationPassword`].
    pub application_password: bool,
}

/// Probe `backend` for its capabilities.
///
/// Native probes can panic on stripped OS images or in emulators; a
/// panicking probe reads as "unavailable" instead of taking the process
/// down.
#[must_use]
pub fn detect_platform_capabilities<B: Backend>(backend: &B) -> PlatformCapabilities {
    let profile = backend.profile();

    let availability = catch_unwind(AssertUnwindSafe(|| backend.availability()))
        .unwrap_or_else(|_| {
            tracing::warn!("availability probe panicked, treating as unavailable");
            AvailabilityStatus::HardwareUnavailable
        });

    let biometric_kinds = catch_unwind(AssertUnwindSafe(|| backend.biometric_kinds()))
        .unwrap_or_else(|_| {
            tracing::warn!("biometric kind probe panicked, reporting none");
            Vec::new()
        });

    let application_password = resolve(AccessControlPolicy::ApplicationPassword, &profile).is_ok();

    tracing::info!(
        platform = %profile.platform,
        availability = %availability,
        biometric_kinds = ?biometric_kinds,
        application_password,
        "platform capabilities detected"
    );

    PlatformCapabilities {
        platform: profile.platform,
        availability,
        biometric_kinds,
        application_password,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::policy::PlatformProfile;

    #[test]
    fn apple_profile_has_application_passwords() {
        let caps = detect_platform_capabilities(&MemoryBackend::new());
        assert_eq!(caps.platform, Platform::Apple);
        assert_eq!(caps.availability, AvailabilityStatus::Available);
        assert!(caps.application_password);
        assert!(!caps.biometric_kinds.is_empty());
    }

    #[test]
    fn android_needs_emulation_for_application_passwords() {
        let plain = MemoryBackend::with_profile(PlatformProfile::android(false));
        assert!(!detect_platform_capabilities(&plain).application_password);
        let emulated = MemoryBackend::with_profile(PlatformProfile::android(true));
        assert!(detect_platform_capabilities(&emulated).application_password);
    }

    #[test]
    fn reports_current_availability() {
        let backend = MemoryBackend::new();
        backend.set_availability(AvailabilityStatus::LockedOut);
        assert_eq!(
            detect_platform_capabilities(&backend).availability,
            AvailabilityStatus::LockedOut
        );
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_string(&detect_platform_capabilities(&MemoryBackend::new()))
            .unwrap();
        assert!(json.contains("biometricKinds"));
        assert!(json.contains("applicationPassword"));
    }
}
