//! Fuzz target for ECDSA verification with attacker-chosen inputs.
//!
//! Public keys and signatures arrive from native key stores and from
//! callers; malformed points or DER must be rejected, never panic.
//!
//! # Usage
//!
//! ```sh
//! cd crates/coffre-vault
//! cargo +nightly fuzz run signature_verify -- -max_len=512
//! ```

#![no_main]

use coffre_crypto_core::{verify, KeySizeClass, ManagedBuffer, ManagedString};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&selector, rest)) = data.split_first() else {
        return;
    };
    let size = if selector & 1 == 0 {
        KeySizeClass::P256
    } else {
        KeySizeClass::P384
    };
    let key_len = size.public_key_len().min(rest.len());
    let (public_key, rest) = rest.split_at(key_len);
    let sig_len = usize::from(selector >> 1).min(rest.len());
    let (signature, message) = rest.split_at(sig_len);
    let _ = verify(size, public_key, message, signature);
    let _ = KeySizeClass::from_public_key_len(public_key.len());

    // Stored payloads that are not UTF-8 must be refused, not mangled.
    let _ = ManagedString::from_utf8(ManagedBuffer::from_slice(message));
});
