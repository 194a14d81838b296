//! Buffer ownership protocol.
//!
//! Secret bytes cross the vault boundary as [`ManagedBuffer`] or
//! [`ManagedString`] values whose owner is part of the type:
//!
//! - `ManagedBuffer<VaultOwned>` is storage the vault allocated. Only the
//!   vault can write to it, and only the vault can [`free`](ManagedBuffer::free) it.
//! - `ManagedBuffer<CallerOwned>` is an independent copy (or a moved
//!   hand-off) the caller now owns. It has no `free`; dropping it wipes it.
//!
//! Every transfer consumes or copies, so a buffer has exactly one owner at
//! any instant. Freeing twice does not compile (`free` takes `self`), and a
//! caller cannot free vault storage because the method does not exist on
//! the caller-side type.

use crate::error::{CapacityError, CryptoError};
use crate::memory::SecretBuffer;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::marker::PhantomData;

// ---------------------------------------------------------------------------
// Owner markers
// ---------------------------------------------------------------------------

/// Runtime tag for the side that owns a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    Vault,
    Caller,
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::VaultOwned {}
    impl Sealed for super::CallerOwned {}
}

/// Type-level owner marker. Implemented only by [`VaultOwned`] and [`CallerOwned`].
pub trait Ownership: sealed::Sealed {
    const OWNER: Owner;
}

/// Marker: the vault allocated this storage and must release it.
#[derive(Debug)]
pub enum VaultOwned {}

/// Marker: the caller holds an independent copy and releases it by dropping.
#[derive(Debug)]
pub enum CallerOwned {}

impl Ownership for VaultOwned {
    const OWNER: Owner = Owner::Vault;
}

impl Ownership for CallerOwned {
    const OWNER: Owner = Owner::Caller;
}

// ---------------------------------------------------------------------------
// ManagedBuffer
// ---------------------------------------------------------------------------

/// Move-only secret byte buffer tagged with its owner.
///
/// Not `Clone`: the only ways to get a second buffer are [`Self::copy_out`]
/// (vault side) and [`Self::copy_into`] (into caller-supplied memory).
pub struct ManagedBuffer<O: Ownership> {
    bytes: SecretBuffer,
    owner: PhantomData<O>,
}

impl ManagedBuffer<VaultOwned> {
    /// Allocate `size` zeroed bytes of vault-owned storage.
    #[must_use]
    pub fn allocate(size: usize) -> Self {
        Self::wrap(SecretBuffer::zeroed(size))
    }

    /// Allocate vault storage holding a copy of `data`.
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        Self::wrap(SecretBuffer::from_vec(data.to_vec()))
    }

    /// Adopt an existing secret buffer as vault storage.
    #[must_use]
    pub fn from_secret(bytes: SecretBuffer) -> Self {
        Self::wrap(bytes)
    }

    /// Write access, reserved to the owning vault.
    pub fn expose_mut(&mut self) -> &mut [u8] {
        self.bytes.expose_mut()
    }

    /// Produce an independent caller-owned copy. `self` is left untouched.
    #[must_use]
    pub fn copy_out(&self) -> ManagedBuffer<CallerOwned> {
        ManagedBuffer::wrap(self.bytes.clone())
    }

    /// Hand the storage itself over to the caller.
    ///
    /// The vault gives up its ownership; no copy is made and no alias remains.
    #[must_use]
    pub fn into_caller(self) -> ManagedBuffer<CallerOwned> {
        ManagedBuffer::wrap(self.bytes)
    }

    /// Release vault storage. The bytes are wiped before the memory is returned.
    pub fn free(self) {
        drop(self);
    }
}

impl ManagedBuffer<CallerOwned> {
    /// Unwrap into a plain [`SecretBuffer`] the caller manages from here on.
    #[must_use]
    pub fn into_secret(self) -> SecretBuffer {
        self.bytes
    }

    /// Unwrap into a plain `Vec<u8>`. The caller takes over wiping it.
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.bytes.expose().to_vec()
    }
}

impl<O: Ownership> ManagedBuffer<O> {
    const fn wrap(bytes: SecretBuffer) -> Self {
        Self {
            bytes,
            owner: PhantomData,
        }
    }

    #[must_use]
    pub const fn owner(&self) -> Owner {
        O::OWNER
    }

    #[must_use]
    pub fn expose(&self) -> &[u8] {
        self.bytes.expose()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Copy into caller-supplied memory.
    ///
    /// Returns the number of bytes written. Nothing is written when `dest`
    /// is too small; the error reports the exact size required.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] if `dest.len() < self.len()`.
    pub fn copy_into(&self, dest: &mut [u8]) -> Result<usize, CapacityError> {
        let src = self.bytes.expose();
        let Some(head) = dest.get_mut(..src.len()) else {
            return Err(CapacityError {
                required: src.len(),
                capacity: dest.len(),
            });
        };
        head.copy_from_slice(src);
        Ok(src.len())
    }

    /// Debug-build sanity check of the backing region.
    ///
    /// Not a safety boundary: release builds compile it to nothing.
    pub fn debug_validate(&self) {
        let bytes = self.bytes.expose();
        debug_assert!(!bytes.as_ptr().is_null(), "managed buffer has a null backing pointer");
        debug_assert!(
            isize::try_from(bytes.len()).is_ok(),
            "managed buffer length exceeds isize::MAX"
        );
    }
}

impl<O: Ownership> fmt::Debug for ManagedBuffer<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManagedBuffer<{:?}>({} bytes, ***)", O::OWNER, self.len())
    }
}

// ---------------------------------------------------------------------------
// ManagedString
// ---------------------------------------------------------------------------

/// Move-only secret UTF-8 string tagged with its owner.
pub struct ManagedString<O: Ownership> {
    text: SecretString,
    owner: PhantomData<O>,
}

impl ManagedString<VaultOwned> {
    #[must_use]
    pub fn from_text(text: &str) -> Self {
        Self::wrap(SecretString::from(text.to_owned()))
    }

    #[must_use]
    pub fn copy_out(&self) -> ManagedString<CallerOwned> {
        ManagedString::wrap(SecretString::from(self.expose().to_owned()))
    }

    #[must_use]
    pub fn into_caller(self) -> ManagedString<CallerOwned> {
        ManagedString::wrap(self.text)
    }

    pub fn free(self) {
        drop(self);
    }
}

impl ManagedString<CallerOwned> {
    #[must_use]
    pub fn into_secret(self) -> SecretString {
        self.text
    }
}

impl<O: Ownership> ManagedString<O> {
    const fn wrap(text: SecretString) -> Self {
        Self {
            text,
            owner: PhantomData,
        }
    }

    /// Reinterpret a managed byte buffer as text, keeping the same owner.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::SecureMemory` if the bytes are not valid UTF-8.
    /// The source buffer is wiped either way.
    pub fn from_utf8(buf: ManagedBuffer<O>) -> Result<Self, CryptoError> {
        let text = std::str::from_utf8(buf.expose())
            .map_err(|e| CryptoError::SecureMemory(format!("secret is not valid UTF-8: {e}")))?;
        Ok(Self::wrap(SecretString::from(text.to_owned())))
    }

    #[must_use]
    pub const fn owner(&self) -> Owner {
        O::OWNER
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        self.text.expose_secret()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.expose().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }

    /// Copy the UTF-8 bytes into caller memory.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] if `dest` cannot hold every byte.
    pub fn copy_into(&self, dest: &mut [u8]) -> Result<usize, CapacityError> {
        let src = self.expose().as_bytes();
        let Some(head) = dest.get_mut(..src.len()) else {
            return Err(CapacityError {
                required: src.len(),
                capacity: dest.len(),
            });
        };
        head.copy_from_slice(src);
        Ok(src.len())
    }
}

impl<O: Ownership> fmt::Debug for ManagedString<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManagedString<{:?}>(***)", O::OWNER)
    }
}
