#![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

//! Property-based tests for AES-256-GCM sealing.

use coffre_crypto_core::symmetric::{open, open_in_place, seal, seal_in_place, SEAL_OVERHEAD};
use coffre_crypto_core::SecretBytes;
use proptest::prelude::*;

fn key_strategy() -> impl Strategy<Value = [u8; 32]> {
    any::<[u8; 32]>()
}

proptest! {
    #[test]
    fn open_inverts_seal(
        key in key_strategy(),
        aad in proptest::collection::vec(any::<u8>(), 0..64),
        plain in proptest::collection::vec(any::<u8>(), 0..1024),
    ) {
        let key = SecretBytes::new(key);
        let sealed = seal(&key, &aad, &plain).unwrap();
        prop_assert_eq!(sealed.len(), plain.len() + SEAL_OVERHEAD);
        let opened = open(&key, &aad, &sealed).unwrap();
        prop_assert_eq!(opened.expose(), plain.as_slice());
    }

    #[test]
    fn in_place_transform_is_reversible(
        key in key_strategy(),
        plain in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let key = SecretBytes::new(key);
        let mut buf = plain.clone();
        seal_in_place(&key, b"", &mut buf).unwrap();
        open_in_place(&key, b"", &mut buf).unwrap();
        prop_assert_eq!(buf, plain);
    }

    /// Flipping any single bit of the sealed form is detected.
    #[test]
    fn any_bit_flip_is_rejected(
        key in key_strategy(),
        plain in proptest::collection::vec(any::<u8>(), 1..128),
        pos in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let key = SecretBytes::new(key);
        let mut sealed = seal(&key, b"", &plain).unwrap();
        let i = pos.index(sealed.len());
        sealed[i] ^= 1 << bit;
        prop_assert!(open(&key, b"", &sealed).is_err());
    }
}
