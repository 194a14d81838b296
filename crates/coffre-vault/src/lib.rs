//! `coffre-vault`: hardware-backed credential vault.
//!
//! Stores secrets and ECDSA keys in the platform key store (Keychain and
//! Secure Enclave on Apple, Keystore on Android) behind per-item access
//! policies, with a biometric gate in front of every gated read, write and
//! signature.
//!
//! Everything hangs off an explicit [`VaultContext`]; there is no global
//! state.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod keys;
pub mod platform;
pub mod policy;
pub mod vault;

pub use backend::{
    AndroidBackend, AppleBackend, Backend, BackendError, ItemMeta, KeyAttestation, KeyKind,
    KeyMeta, KeystoreBridge, KeychainServices, MemoryBackend, SecurityLevel,
};
pub use config::VaultConfig;
pub use context::VaultContext;
pub use error::VaultError;
pub use gate::{
    AuthResult, AuthToken, AvailabilityStatus, BiometricGate, BiometricKind, CancellationToken,
    GateState, Presenter, PromptHandle, PromptOutcome, PromptRequest, PromptResponder,
};
pub use keys::{InvalidationReport, SecureKeyManager};
pub use platform::{detect_platform_capabilities, PlatformCapabilities};
pub use policy::{AccessControlPolicy, Platform, PlatformProfile, PolicyError};
pub use vault::{CredentialEntry, CredentialVault, STAGING_SUFFIX};

pub use coffre_crypto_core::{
    CallerOwned, KeySizeClass, ManagedBuffer, ManagedString, Owner, VaultOwned,
};
