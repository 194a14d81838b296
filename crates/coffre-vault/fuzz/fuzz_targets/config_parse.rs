//! Fuzz target for the vault configuration file.
//!
//! `coffre.json` is read from disk before a context exists; arbitrary
//! bytes must parse or fail cleanly, and anything that parses must be
//! safe to validate and turn into a prompt.
//!
//! # Usage
//!
//! ```sh
//! cargo +nightly install cargo-fuzz
//! cd crates/coffre-vault
//! cargo +nightly fuzz run config_parse -- -max_len=4096
//! ```

#![no_main]

use coffre_vault::VaultConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(config) = serde_json::from_slice::<VaultConfig>(data) {
        let _ = config.validate();
        let _ = config.gate_timeout();
        let _ = config.prompt();
    }
});
