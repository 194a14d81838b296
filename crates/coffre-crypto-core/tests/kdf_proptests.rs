#![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

//! Property-based tests for Argon2id password-key derivation.

use coffre_crypto_core::kdf::{derive_password_key, PasswordKdfParams, SALT_LEN};
use proptest::prelude::*;

const PROP_PARAMS: PasswordKdfParams = PasswordKdfParams {
    m_cost: 32,
    t_cost: 1,
    p_cost: 1,
};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn same_inputs_same_key(
        password in proptest::collection::vec(any::<u8>(), 0..64),
        salt in proptest::collection::vec(any::<u8>(), SALT_LEN..48),
    ) {
        let a = derive_password_key(&password, &salt, PROP_PARAMS).unwrap();
        let b = derive_password_key(&password, &salt, PROP_PARAMS).unwrap();
        prop_assert_eq!(a.expose(), b.expose());
    }

    #[test]
    fn short_salt_always_rejected(salt in proptest::collection::vec(any::<u8>(), 0..SALT_LEN)) {
        prop_assert!(derive_password_key(b"pw", &salt, PROP_PARAMS).is_err());
    }
}
