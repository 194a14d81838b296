//! Page-locked, zeroizing storage for secret bytes.
//!
//! Everything that carries a credential payload, a derived key or a PKCS#8
//! private key inside this workspace lives in one of the two types below:
//!
//! - [`SecretBuffer`]: heap storage of any length, used for payloads
//! - [`SecretBytes`]: fixed-size storage, used for symmetric keys and salts
//!
//! Both wipe themselves on drop, try to `mlock` their pages, and print a
//! masked placeholder from `Debug`/`Display`.

use crate::error::CryptoError;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, ExposeSecretMut, SecretSlice};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// Page locking
// ---------------------------------------------------------------------------

/// `mlock` guard released on drop.
///
/// Locking is best effort. A refused `mlock` (quota, missing privilege) leaves
/// the guard in the unlocked state and emits a single process-wide warning.
pub struct LockedRegion {
    ptr: *const u8,
    len: usize,
    locked: bool,
}

// SAFETY: the pointer is handed only to mlock/munlock, which do not read or
// write through it. The bytes themselves are owned by the enclosing buffer.
unsafe impl Send for LockedRegion {}
unsafe impl Sync for LockedRegion {}

impl LockedRegion {
    const UNLOCKED: Self = Self {
        ptr: std::ptr::null(),
        len: 0,
        locked: false,
    };

    /// Lock `len` bytes starting at `ptr`.
    ///
    /// Crate-private: the caller guarantees the region outlives the guard.
    #[must_use]
    pub(crate) fn lock(ptr: *const u8, len: usize) -> Self {
        let locked = sys::mlock(ptr, len);
        if !locked && len > 0 {
            static WARNED: std::sync::Once = std::sync::Once::new();
            WARNED.call_once(|| {
                eprintln!(
                    "[coffre-crypto-core] WARNING: mlock refused; secret pages \
                     may reach swap. Raise RLIMIT_MEMLOCK to avoid this."
                );
            });
        }
        Self { ptr, len, locked }
    }

    /// Whether `mlock` succeeded for this region.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for LockedRegion {
    fn drop(&mut self) {
        if self.locked {
            sys::munlock(self.ptr, self.len);
        }
    }
}

// ---------------------------------------------------------------------------
// SecretBuffer
// ---------------------------------------------------------------------------

/// Heap buffer for secret bytes of arbitrary length.
///
/// Backed by [`SecretSlice<u8>`]; the slice never reallocates after
/// construction, so the lock taken at construction covers it for its whole
/// life.
pub struct SecretBuffer {
    inner: SecretSlice<u8>,
    lock: LockedRegion,
}

impl SecretBuffer {
    /// Copy `data` into a fresh locked allocation.
    ///
    /// The caller remains responsible for wiping its own copy of `data`.
    ///
    /// # Errors
    ///
    /// Infallible today; the `Result` keeps the signature stable for
    /// allocators that can refuse.
    pub fn new(data: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self::from_vec(data.to_vec()))
    }

    /// Take ownership of `data` without copying it.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        let inner: SecretSlice<u8> = data.into();
        let exposed = inner.expose_secret();
        let lock = LockedRegion::lock(exposed.as_ptr(), exposed.len());
        Self { inner, lock }
    }

    /// Allocate `len` zero bytes, to be filled through [`Self::expose_mut`].
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    /// Allocate `len` bytes from the OS CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::SecureMemory` if the CSPRNG fails.
    pub fn random(len: usize) -> Result<Self, CryptoError> {
        let mut buf = Self::zeroed(len);
        OsRng
            .try_fill_bytes(buf.expose_mut())
            .map_err(|e| CryptoError::SecureMemory(format!("CSPRNG fill failed: {e}")))?;
        Ok(buf)
    }

    /// Borrow the secret bytes. Keep the borrow short-lived.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        self.inner.expose_secret()
    }

    /// Mutably borrow the secret bytes. The length cannot change.
    pub fn expose_mut(&mut self) -> &mut [u8] {
        self.inner.expose_secret_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.expose().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the backing pages are `mlock`'d.
    #[must_use]
    pub const fn is_mlocked(&self) -> bool {
        self.lock.is_locked()
    }
}

impl Clone for SecretBuffer {
    fn clone(&self) -> Self {
        Self::from_vec(self.expose().to_vec())
    }
}

impl PartialEq for SecretBuffer {
    /// Constant-time comparison.
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.expose(), other.expose());
        a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

impl Eq for SecretBuffer {}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBuffer(***)")
    }
}

impl fmt::Display for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBuffer(***)")
    }
}

// ---------------------------------------------------------------------------
// SecretBytes<N>
// ---------------------------------------------------------------------------

/// Fixed-size secret, e.g. an AES-256 key or an Argon2 salt.
///
/// The `mlock` is taken at the address the value has inside [`Self::new`].
/// Moving the value afterwards leaves the guard pointing at the old address;
/// `munlock` of a stale range is harmless and the wipe on drop does not
/// depend on it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes<const N: usize> {
    bytes: [u8; N],
    #[zeroize(skip)]
    lock: LockedRegion,
}

impl<const N: usize> SecretBytes<N> {
    #[must_use]
    pub fn new(data: [u8; N]) -> Self {
        let mut s = Self {
            bytes: data,
            lock: LockedRegion::UNLOCKED,
        };
        s.lock = LockedRegion::lock(s.bytes.as_ptr(), N);
        s
    }

    /// Fill from the OS CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::SecureMemory` if the CSPRNG fails.
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; N];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::SecureMemory(format!("CSPRNG fill failed: {e}")))?;
        let out = Self::new(bytes);
        bytes.zeroize();
        Ok(out)
    }

    /// Build from a slice that must be exactly `N` bytes long.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyMaterial` on a length mismatch.
    pub fn from_slice(data: &[u8]) -> Result<Self, CryptoError> {
        let mut bytes: [u8; N] = data.try_into().map_err(|_| {
            CryptoError::InvalidKeyMaterial(format!("expected {N} bytes, got {}", data.len()))
        })?;
        let out = Self::new(bytes);
        bytes.zeroize();
        Ok(out)
    }

    #[must_use]
    pub const fn expose(&self) -> &[u8; N] {
        &self.bytes
    }
}

impl<const N: usize> fmt::Debug for SecretBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes<{N}>(***)")
    }
}

impl<const N: usize> fmt::Display for SecretBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes<{N}>(***)")
    }
}

impl<const N: usize> From<[u8; N]> for SecretBytes<N> {
    fn from(data: [u8; N]) -> Self {
        Self::new(data)
    }
}

// ---------------------------------------------------------------------------
// Process hardening
// ---------------------------------------------------------------------------

/// Set `RLIMIT_CORE` to zero so a crash cannot write secrets to a core file.
///
/// No-op outside Unix.
///
/// # Errors
///
/// Returns `CryptoError::SecureMemory` if `setrlimit` fails.
pub fn disable_core_dumps() -> Result<(), CryptoError> {
    sys::disable_core_dumps()
}

#[cfg(unix)]
mod sys {
    use crate::error::CryptoError;

    pub(super) fn mlock(ptr: *const u8, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        // SAFETY: mlock only inspects the page range; a bad range yields ENOMEM.
        unsafe { libc::mlock(ptr.cast(), len) == 0 }
    }

    pub(super) fn munlock(ptr: *const u8, len: usize) {
        if len == 0 {
            return;
        }
        // SAFETY: same contract as mlock; failure is ignored.
        unsafe {
            libc::munlock(ptr.cast(), len);
        }
    }

    pub(super) fn disable_core_dumps() -> Result<(), CryptoError> {
        let limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: plain POSIX call on a stack value.
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &raw const limit) };
        if ret == 0 {
            Ok(())
        } else {
            Err(CryptoError::SecureMemory(
                "setrlimit(RLIMIT_CORE, 0) failed".into(),
            ))
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use crate::error::CryptoError;

    pub(super) fn mlock(_ptr: *const u8, _len: usize) -> bool {
        false
    }

    pub(super) fn munlock(_ptr: *const u8, _len: usize) {}

    pub(super) fn disable_core_dumps() -> Result<(), CryptoError> {
        Ok(())
    }
}
