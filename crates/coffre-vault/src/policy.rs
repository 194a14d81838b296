//! Access-control policies and their mapping onto native protection classes.
//!
//! [`resolve`] is a pure function: it never touches a key store. Each
//! backend turns the returned [`PlatformProtection`] into the attributes its
//! native API expects.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// User verification required before a secret or key may be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessControlPolicy {
    #[default]
    None,
    /// Any enrolled biometric, surviving enrollment changes.
    BiometricAny,
    /// Bound to the biometric set enrolled at write time.
    BiometricCurrentEnrollment,
    DevicePasscode,
    BiometricOrPasscode,
    /// A password supplied by the application at prompt time.
    ApplicationPassword,
}

impl AccessControlPolicy {
    pub const ALL: [Self; 6] = [
        Self::None,
        Self::BiometricAny,
        Self::BiometricCurrentEnrollment,
        Self::DevicePasscode,
        Self::BiometricOrPasscode,
        Self::ApplicationPassword,
    ];

    /// Every policy except `None` runs the gate before storage is touched.
    #[must_use]
    pub const fn requires_gate(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Whether a biometric enrollment change concerns this policy.
    #[must_use]
    pub const fn has_biometric_component(self) -> bool {
        matches!(
            self,
            Self::BiometricAny | Self::BiometricCurrentEnrollment | Self::BiometricOrPasscode
        )
    }

    /// Biometric with no passcode fallback: the gate cannot run without an
    /// enrolled, unlocked sensor.
    #[must_use]
    pub const fn is_biometric_only(self) -> bool {
        matches!(self, Self::BiometricAny | Self::BiometricCurrentEnrollment)
    }

    /// Whether the prompt may offer the device passcode.
    #[must_use]
    pub const fn allows_device_credential(self) -> bool {
        matches!(self, Self::DevicePasscode | Self::BiometricOrPasscode)
    }

    /// Stable numeric code, shared with the native bridges.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::BiometricAny => 1,
            Self::BiometricCurrentEnrollment => 2,
            Self::DevicePasscode => 3,
            Self::BiometricOrPasscode => 4,
            Self::ApplicationPassword => 5,
        }
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::BiometricAny),
            2 => Some(Self::BiometricCurrentEnrollment),
            3 => Some(Self::DevicePasscode),
            4 => Some(Self::BiometricOrPasscode),
            5 => Some(Self::ApplicationPassword),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::BiometricAny => "biometric-any",
            Self::BiometricCurrentEnrollment => "biometric-current-enrollment",
            Self::DevicePasscode => "device-passcode",
            Self::BiometricOrPasscode => "biometric-or-passcode",
            Self::ApplicationPassword => "application-password",
        }
    }
}

impl fmt::Display for AccessControlPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Platform profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    Apple,
    Android,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apple => f.write_str("apple"),
            Self::Android => f.write_str("android"),
        }
    }
}

/// What the active backend can express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformProfile {
    pub platform: Platform,
    /// Android only: emulate `ApplicationPassword` with an Argon2id-derived
    /// key instead of rejecting it.
    pub emulate_application_password: bool,
}

impl PlatformProfile {
    #[must_use]
    pub const fn apple() -> Self {
        Self {
            platform: Platform::Apple,
            emulate_application_password: false,
        }
    }

    #[must_use]
    pub const fn android(emulate_application_password: bool) -> Self {
        Self {
            platform: Platform::Android,
            emulate_application_password,
        }
    }

    /// Same platform, without password emulation. Hardware keys cannot be
    /// sealed under a derived key, so key policies resolve against this.
    #[must_use]
    pub const fn for_keys(self) -> Self {
        Self {
            platform: self.platform,
            emulate_application_password: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Native protection classes
// ---------------------------------------------------------------------------

/// `SecAccessControlCreateFlags` bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SecAccessFlags(u32);

impl SecAccessFlags {
    pub const EMPTY: Self = Self(0);
    pub const USER_PRESENCE: Self = Self(1 << 0);
    pub const BIOMETRY_ANY: Self = Self(1 << 1);
    pub const BIOMETRY_CURRENT_SET: Self = Self(1 << 3);
    pub const DEVICE_PASSCODE: Self = Self(1 << 4);
    pub const OR: Self = Self(1 << 14);
    pub const AND: Self = Self(1 << 15);
    pub const PRIVATE_KEY_USAGE: Self = Self(1 << 30);
    pub const APPLICATION_PASSWORD: Self = Self(1 << 31);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SecAccessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// `kSecAttrAccessible*` class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Accessibility {
    WhenUnlocked,
    WhenUnlockedThisDeviceOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppleProtection {
    pub flags: SecAccessFlags,
    /// Gated items never migrate to another device.
    pub device_bound: bool,
}

impl AppleProtection {
    /// Accessibility class for an item with the given sync flag.
    #[must_use]
    pub const fn accessibility(self, synchronizable: bool) -> Accessibility {
        if self.device_bound || !synchronizable {
            Accessibility::WhenUnlockedThisDeviceOnly
        } else {
            Accessibility::WhenUnlocked
        }
    }
}

/// `BiometricManager.Authenticators` bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Authenticators(u32);

impl Authenticators {
    pub const NONE: Self = Self(0);
    pub const BIOMETRIC_STRONG: Self = Self(0x000F);
    pub const BIOMETRIC_WEAK: Self = Self(0x00FF);
    pub const DEVICE_CREDENTIAL: Self = Self(0x8000);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Authenticators {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AndroidProtection {
    /// `setUserAuthenticationRequired`.
    pub user_authentication_required: bool,
    /// `setUserAuthenticationParameters(0, ..)`: authorise every use.
    pub authenticators: Authenticators,
    /// `setInvalidatedByBiometricEnrollment`.
    pub invalidated_by_enrollment: bool,
    /// Payload sealed under a key derived from an application password.
    pub password_sealed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformProtection {
    Apple(AppleProtection),
    Android(AndroidProtection),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("{policy} has no equivalent on {platform}")]
    Unsupported {
        policy: AccessControlPolicy,
        platform: Platform,
    },
    /// Only ungated entries may be synchronised off the device.
    #[error("{policy} entries cannot be synchronizable")]
    SyncNotPermitted { policy: AccessControlPolicy },
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Map a policy onto the protection class of `profile`'s platform.
///
/// # Errors
///
/// Returns [`PolicyError::Unsupported`] when the platform has no primitive
/// for the policy. Nothing is ever downgraded to `None`.
pub fn resolve(
    policy: AccessControlPolicy,
    profile: &PlatformProfile,
) -> Result<PlatformProtection, PolicyError> {
    match profile.platform {
        Platform::Apple => Ok(PlatformProtection::Apple(resolve_apple(policy))),
        Platform::Android => resolve_android(policy, profile).map(PlatformProtection::Android),
    }
}

/// Reject a sync flag the policy cannot carry.
///
/// # Errors
///
/// Returns [`PolicyError::SyncNotPermitted`] for a gated, synchronizable entry.
pub const fn check_sync(
    policy: AccessControlPolicy,
    synchronizable: bool,
) -> Result<(), PolicyError> {
    if synchronizable && policy.requires_gate() {
        Err(PolicyError::SyncNotPermitted { policy })
    } else {
        Ok(())
    }
}

const fn resolve_apple(policy: AccessControlPolicy) -> AppleProtection {
    let flags = match policy {
        AccessControlPolicy::None => SecAccessFlags::EMPTY,
        AccessControlPolicy::BiometricAny => SecAccessFlags::BIOMETRY_ANY,
        AccessControlPolicy::BiometricCurrentEnrollment => SecAccessFlags::BIOMETRY_CURRENT_SET,
        AccessControlPolicy::DevicePasscode => SecAccessFlags::DEVICE_PASSCODE,
        AccessControlPolicy::BiometricOrPasscode => SecAccessFlags(
            SecAccessFlags::BIOMETRY_ANY.0 | SecAccessFlags::OR.0 | SecAccessFlags::DEVICE_PASSCODE.0,
        ),
        AccessControlPolicy::ApplicationPassword => SecAccessFlags::APPLICATION_PASSWORD,
    };
    AppleProtection {
        flags,
        device_bound: policy.requires_gate(),
    }
}

fn resolve_android(
    policy: AccessControlPolicy,
    profile: &PlatformProfile,
) -> Result<AndroidProtection, PolicyError> {
    let gated = |authenticators, invalidated_by_enrollment| AndroidProtection {
        user_authentication_required: true,
        authenticators,
        invalidated_by_enrollment,
        password_sealed: false,
    };
    Ok(match policy {
        AccessControlPolicy::None => AndroidProtection {
            user_authentication_required: false,
            authenticators: Authenticators::NONE,
            invalidated_by_enrollment: false,
            password_sealed: false,
        },
        AccessControlPolicy::BiometricAny => gated(Authenticators::BIOMETRIC_STRONG, false),
        AccessControlPolicy::BiometricCurrentEnrollment => {
            gated(Authenticators::BIOMETRIC_STRONG, true)
        }
        AccessControlPolicy::DevicePasscode => gated(Authenticators::DEVICE_CREDENTIAL, false),
        AccessControlPolicy::BiometricOrPasscode => gated(
            Authenticators::BIOMETRIC_STRONG | Authenticators::DEVICE_CREDENTIAL,
            false,
        ),
        AccessControlPolicy::ApplicationPassword if profile.emulate_application_password => {
            AndroidProtection {
                user_authentication_required: false,
                authenticators: Authenticators::NONE,
                invalidated_by_enrollment: false,
                password_sealed: true,
            }
        }
        AccessControlPolicy::ApplicationPassword => {
            return Err(PolicyError::Unsupported {
                policy,
                platform: Platform::Android,
            })
        }
    })
}
