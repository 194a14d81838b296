//! Vault configuration: plain JSON beside the application's data.
//!
//! Nothing here is secret. Loaded before a [`VaultContext`](crate::VaultContext)
//! is built so gate timeouts and prompt texts apply from the first call.

use std::fs;
use std::path::Path;
use std::time::Duration;

use coffre_crypto_core::PasswordKdfParams;
use serde::{Deserialize, Serialize};

use crate::error::VaultError;
use crate::gate::PromptRequest;

// ── Bounds ─────────────────────────────────────────────────────────

/// Shortest allowed prompt timeout.
pub const MIN_GATE_TIMEOUT_SECS: u64 = 1;
/// Longest allowed prompt timeout.
pub const MAX_GATE_TIMEOUT_SECS: u64 = 300;

// ── Config ─────────────────────────────────────────────────────────

/// Vault behaviour knobs.
///
/// Persisted to `{dir}/coffre.json`. Every field has a default, so a
/// partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    /// Seconds before an unanswered prompt resolves to `TimedOut` (1–300).
    #[serde(default = "default_gate_timeout")]
    pub gate_timeout_secs: u64,

    /// Prompt title shown for every gated operation.
    #[serde(default = "default_prompt_title")]
    pub prompt_title: String,

    /// Label of the prompt's fallback button.
    #[serde(default)]
    pub prompt_fallback_title: Option<String>,

    /// Require a confirm tap after a passive (face) match.
    #[serde(default = "default_true")]
    pub require_explicit_confirmation: bool,

    /// How long a secret that did not fit the caller's buffer is kept for
    /// the retry. 0 disables the stash; the retry then reads the store again.
    #[serde(default = "default_stash_ttl")]
    pub retrieval_stash_ttl_ms: u64,

    /// Disable core dumps when the context is built.
    #[serde(default)]
    pub harden_process: bool,

    /// Argon2id cost for password-sealed items. Applied to the backend
    /// when the context is built; unset keeps the backend's own cost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_kdf: Option<PasswordKdfParams>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            gate_timeout_secs: default_gate_timeout(),
            prompt_title: default_prompt_title(),
            prompt_fallback_title: None,
            require_explicit_confirmation: true,
            retrieval_stash_ttl_ms: default_stash_ttl(),
            harden_process: false,
            password_kdf: None,
        }
    }
}

const fn default_gate_timeout() -> u64 {
    60
}
fn default_prompt_title() -> String {
    "Authenticate to continue".into()
}
const fn default_true() -> bool {
    true
}
const fn default_stash_ttl() -> u64 {
    30_000
}

impl VaultConfig {
    /// Prompt timeout, clamped to the allowed range.
    #[must_use]
    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(
            self.gate_timeout_secs
                .clamp(MIN_GATE_TIMEOUT_SECS, MAX_GATE_TIMEOUT_SECS),
        )
    }

    #[must_use]
    pub const fn stash_ttl(&self) -> Duration {
        Duration::from_millis(self.retrieval_stash_ttl_ms)
    }

    /// Base prompt for gated operations, before policy-specific tweaks.
    #[must_use]
    pub fn prompt(&self) -> PromptRequest {
        let request = PromptRequest::new(self.prompt_title.clone())
            .require_explicit_confirmation(self.require_explicit_confirmation);
        match &self.prompt_fallback_title {
            Some(fallback) => request.with_fallback(fallback.clone()),
            None => request,
        }
    }

    /// Check values that would otherwise fail deep inside an operation.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Config`] for an empty prompt title or an
    /// invalid Argon2id cost.
    pub fn validate(&self) -> Result<(), VaultError> {
        if self.prompt_title.trim().is_empty() {
            return Err(VaultError::Config("promptTitle must not be empty".into()));
        }
        match &self.password_kdf {
            Some(kdf) => kdf
                .validate()
                .map_err(|e| VaultError::Config(format!("passwordKdf: {e}"))),
            None => Ok(()),
        }
    }
}

// ── File I/O ───────────────────────────────────────────────────────

const CONFIG_FILE: &str = "coffre.json";

impl VaultConfig {
    /// Load from `{dir}/coffre.json`.
    ///
    /// Returns [`Default::default()`] when the file is missing or is not
    /// valid JSON.
    #[must_use]
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(CONFIG_FILE);
        match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "corrupt config, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Persist to `{dir}/coffre.json` via a temporary file and rename.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Io`] if the directory is missing or the write
    /// or rename fails.
    pub fn save(&self, dir: &Path) -> Result<(), VaultError> {
        let path = dir.join(CONFIG_FILE);
        let tmp = dir.join(".coffre.json.tmp");

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| VaultError::Config(format!("serialize: {e}")))?;

        fs::write(&tmp, &json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let config = VaultConfig::default();
        assert_eq!(config.gate_timeout(), Duration::from_secs(60));
        assert_eq!(config.retrieval_stash_ttl_ms, 30_000);
        assert!(config.require_explicit_confirmation);
        assert!(!config.harden_process);
        config.validate().unwrap();
    }

    #[test]
    fn timeout_is_clamped() {
        let low = VaultConfig {
            gate_timeout_secs: 0,
            ..VaultConfig::default()
        };
        assert_eq!(low.gate_timeout(), Duration::from_secs(1));
        let high = VaultConfig {
            gate_timeout_secs: 10_000,
            ..VaultConfig::default()
        };
        assert_eq!(high.gate_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn prompt_carries_titles() {
        let config = VaultConfig {
            prompt_title: "Unlock wallet".into(),
            prompt_fallback_title: Some("Use passcode".into()),
            require_explicit_confirmation: false,
            ..VaultConfig::default()
        };
        let prompt = config.prompt();
        assert_eq!(prompt.title, "Unlock wallet");
        assert_eq!(prompt.fallback_title.as_deref(), Some("Use passcode"));
        assert!(!prompt.require_explicit_confirmation);
    }

    #[test]
    fn load_returns_default_on_missing_file() {
        let dir = TempDir::new().unwrap();
        assert_eq!(VaultConfig::load(dir.path()), VaultConfig::default());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let config = VaultConfig {
            gate_timeout_secs: 15,
            harden_process: true,
            password_kdf: Some(PasswordKdfParams {
                m_cost: 8_192,
                t_cost: 3,
                p_cost: 1,
            }),
            ..VaultConfig::default()
        };
        config.save(dir.path()).unwrap();
        assert_eq!(VaultConfig::load(dir.path()), config);
        assert!(!dir.path().join(".coffre.json.tmp").exists());
    }

    #[test]
    fn load_recovers_from_corrupt_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{ nope").unwrap();
        assert_eq!(VaultConfig::load(dir.path()), VaultConfig::default());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), r#"{"gateTimeoutSecs":5}"#).unwrap();
        let config = VaultConfig::load(dir.path());
        assert_eq!(config.gate_timeout_secs, 5);
        assert_eq!(config.retrieval_stash_ttl_ms, 30_000);
        assert_eq!(config.password_kdf, None);
    }

    #[cfg(unix)]
    #[test]
    fn save_sets_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        VaultConfig::default().save(dir.path()).unwrap();
        let mode = fs::metadata(dir.path().join(CONFIG_FILE))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn serde_uses_camel_case() {
        let config = VaultConfig {
            password_kdf: Some(PasswordKdfParams::default()),
            ..VaultConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("gateTimeoutSecs"));
        assert!(json.contains("retrievalStashTtlMs"));
        assert!(json.contains("passwordKdf"));
        assert!(json.contains("mCost"));
        assert!(!json.contains("gate_timeout_secs"));
    }

    #[test]
    fn invalid_values_are_reported() {
        let config = VaultConfig {
            prompt_title: "  ".into(),
            ..VaultConfig::default()
        };
        assert!(matches!(config.validate(), Err(VaultError::Config(_))));
    }
}
