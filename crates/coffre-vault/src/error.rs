//! Vault error types for `coffre-vault`.

use coffre_crypto_core::{CapacityError, CryptoError};
use thiserror::Error;

use crate::backend::BackendError;
use crate::gate::AvailabilityStatus;
use crate::policy::PolicyError;

/// Errors produced by credential vault and key manager operations.
///
/// Grouped the way callers react to them: input, capability,
/// authentication, not-found, capacity and platform faults.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Malformed identifier or empty required field. Nothing was touched.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The access-control policy cannot be honoured on this platform.
    #[error("invalid access control: {0}")]
    InvalidAccessControl(#[from] PolicyError),

    /// Presence verification cannot run right now (status reported verbatim).
    #[error("authentication unavailable: {0}")]
    GateUnavailable(AvailabilityStatus),

    #[error("authentication cancelled")]
    AuthenticationCancelled,

    /// Wrong biometric, wrong passcode or wrong application password.
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("authentication timed out")]
    AuthenticationTimedOut,

    /// The enrolled biometric set changed since the item or key was written.
    #[error("authentication invalidated by a biometric enrollment change")]
    AuthenticationInvalidated,

    #[error("item not found")]
    ItemNotFound,

    #[error("item already exists")]
    DuplicateItem,

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("a key with tag {0:?} already exists")]
    DuplicateTag(String),

    /// A signing key was used for encryption or the other way round.
    #[error("key {0:?} does not support this operation")]
    KeyKindMismatch(String),

    #[error("key generation failed: {0}")]
    KeyGenFailed(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    /// The caller's buffer is too small; `required` is the exact size needed.
    #[error("buffer too small: {required} bytes required, {capacity} available")]
    BufferTooSmall { required: usize, capacity: usize },

    /// The backend has no counterpart for this operation.
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),

    /// Unexpected native status, surfaced opaquely.
    #[error("platform fault (code {code}): {message}")]
    Platform { code: i64, message: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<CapacityError> for VaultError {
    fn from(e: CapacityError) -> Self {
        Self::BufferTooSmall {
            required: e.required,
            capacity: e.capacity,
        }
    }
}

impl VaultError {
    /// Map a backend failure on a credential item.
    pub(crate) fn from_item(err: BackendError) -> Self {
        match err {
            BackendError::NotFound => Self::ItemNotFound,
            BackendError::Duplicate => Self::DuplicateItem,
            other => Self::from_common(other),
        }
    }

    /// Map a backend failure on a key. `tag` names the key in the error.
    pub(crate) fn from_key(err: BackendError, tag: &str) -> Self {
        match err {
            BackendError::NotFound => Self::KeyNotFound(tag.to_owned()),
            BackendError::Duplicate => Self::DuplicateTag(tag.to_owned()),
            other => Self::from_common(other),
        }
    }

    fn from_common(err: BackendError) -> Self {
        match err {
            BackendError::NotFound => Self::ItemNotFound,
            BackendError::Duplicate => Self::DuplicateItem,
            BackendError::Cancelled => Self::AuthenticationCancelled,
            BackendError::AuthenticationFailed => Self::AuthenticationFailed,
            BackendError::Invalidated => Self::AuthenticationInvalidated,
            BackendError::Unsupported(what) => Self::Unsupported(what),
            BackendError::Platform { code, message } => {
                tracing::error!(code, %message, "platform fault");
                Self::Platform { code, message }
            }
            BackendError::Crypto(e) => Self::Crypto(e),
        }
    }

    /// Whether this is one of the user-authentication outcomes.
    #[must_use]
    pub const fn is_authentication(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationCancelled
                | Self::AuthenticationFailed
                | Self::AuthenticationTimedOut
                | Self::AuthenticationInvalidated
                | Self::GateUnavailable(_)
        )
    }
}
