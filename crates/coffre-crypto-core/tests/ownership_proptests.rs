#![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

//! Property-based tests for the buffer ownership protocol.

use coffre_crypto_core::{CapacityError, ManagedBuffer, Owner};
use proptest::prelude::*;

proptest! {
    /// `copy_into` either writes every byte or writes nothing and names the exact size.
    #[test]
    fn copy_into_is_all_or_nothing(
        data in proptest::collection::vec(any::<u8>(), 0..512),
        capacity in 0usize..600,
    ) {
        let buf = ManagedBuffer::from_slice(&data);
        let mut dest = vec![0xEEu8; capacity];
        match buf.copy_into(&mut dest) {
            Ok(written) => {
                prop_assert!(capacity >= data.len());
                prop_assert_eq!(written, data.len());
                prop_assert_eq!(&dest[..written], data.as_slice());
                prop_assert!(dest[written..].iter().all(|&b| b == 0xEE));
            }
            Err(CapacityError { required, capacity: reported }) => {
                prop_assert!(capacity < data.len());
                prop_assert_eq!(required, data.len());
                prop_assert_eq!(reported, capacity);
                prop_assert!(dest.iter().all(|&b| b == 0xEE));
            }
        }
    }

    /// Retrying with the reported size always succeeds.
    #[test]
    fn retry_with_required_size_succeeds(data in proptest::collection::vec(any::<u8>(), 1..512)) {
        let buf = ManagedBuffer::from_slice(&data);
        let err = buf.copy_into(&mut []).unwrap_err();
        let mut dest = vec![0u8; err.required];
        prop_assert_eq!(buf.copy_into(&mut dest), Ok(data.len()));
        prop_assert_eq!(dest, data);
    }

    /// A caller copy is independent of the vault buffer it came from.
    #[test]
    fn copy_out_is_independent(data in proptest::collection::vec(any::<u8>(), 1..256)) {
        let mut vault = ManagedBuffer::from_slice(&data);
        let caller = vault.copy_out();
        vault.expose_mut().fill(0);
        prop_assert_eq!(caller.owner(), Owner::Caller);
        prop_assert_eq!(caller.expose(), data.as_slice());
        vault.free();
        prop_assert_eq!(caller.into_vec(), data);
    }
}
