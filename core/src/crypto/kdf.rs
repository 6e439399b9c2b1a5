//! # Vault Key Derivation
//!
//! Turns the operator's master secret into the AES-256 key that seals
//! credential fields. Argon2id, memory-hard, with a fixed versioned salt:
//! the same secret must always yield the same key or yesterday's records
//! become unreadable.
//!
//! The derived key lives in a [`Zeroizing`] buffer and is wiped on drop.

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::{
    VaultConfig, AES_KEY_LENGTH, VAULT_KDF_ITERATIONS, VAULT_KDF_MEMORY_KIB,
    VAULT_KDF_PARALLELISM, VAULT_KDF_SALT, VAULT_MIN_SECRET_LENGTH,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyDerivationError {
    #[error("master secret too short: need at least {VAULT_MIN_SECRET_LENGTH} bytes")]
    SecretTooShort,

    #[error("invalid KDF parameters: {0}")]
    InvalidParams(String),

    #[error("key derivation failed: {0}")]
    Failed(String),
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: VAULT_KDF_MEMORY_KIB,
            iterations: VAULT_KDF_ITERATIONS,
            parallelism: VAULT_KDF_PARALLELISM,
        }
    }
}

impl From<&VaultConfig> for KdfParams {
    fn from(config: &VaultConfig) -> Self {
        Self {
            memory_kib: config.kdf_memory_kib,
            iterations: config.kdf_iterations,
            parallelism: config.kdf_parallelism,
        }
    }
}

/// The symmetric key behind every sealed credential field.
pub struct VaultKey(Zeroizing<[u8; AES_KEY_LENGTH]>);

impl VaultKey {
    /// Derive from a master secret with Argon2id.
    ///
    /// Slow and memory-hungry; call it once at startup, or from
    /// `spawn_blocking` if you're on an async worker.
    pub fn derive(secret: &str, params: KdfParams) -> Result<Self, KeyDerivationError> {
        if secret.len() < VAULT_MIN_SECRET_LENGTH {
            return Err(KeyDerivationError::SecretTooShort);
        }

        let argon_params = Params::new(
            params.memory_kib,
            params.iterations,
            params.parallelism,
            Some(AES_KEY_LENGTH),
        )
        .map_err(|e| KeyDerivationError::InvalidParams(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

        let mut key = Zeroizing::new([0u8; AES_KEY_LENGTH]);
        argon2
            .hash_password_into(secret.as_bytes(), VAULT_KDF_SALT, &mut *key)
            .map_err(|e| KeyDerivationError::Failed(e.to_string()))?;

        Ok(Self(key))
    }

    /// Wrap raw key material (e.g. from an HSM export).
    pub fn from_bytes(bytes: [u8; AES_KEY_LENGTH]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// A random key that dies with the process. Development only.
    pub fn ephemeral() -> Self {
        let mut key = Zeroizing::new([0u8; AES_KEY_LENGTH]);
        rand::rngs::OsRng.fill_bytes(&mut *key);
        Self(key)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; AES_KEY_LENGTH] {
        &self.0
    }

    /// Short public identifier of the key, safe to log. Lets operators
    /// confirm two processes run with the same key without revealing it.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&*self.0);
        hex::encode(&digest[..4])
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VaultKey({})", self.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Argon2 minimums: fast enough for debug-build tests.
    fn cheap() -> KdfParams {
        KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = VaultKey::derive("correct horse battery staple", cheap()).unwrap();
        let b = VaultKey::derive("correct horse battery staple", cheap()).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn different_secrets_give_different_keys() {
        let a = VaultKey::derive("correct horse battery staple", cheap()).unwrap();
        let b = VaultKey::derive("correct horse battery stapler", cheap()).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn cost_parameters_change_the_key() {
        let a = VaultKey::derive("correct horse battery staple", cheap()).unwrap();
        let b = VaultKey::derive(
            "correct horse battery staple",
            KdfParams {
                iterations: 2,
                ..cheap()
            },
        )
        .unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn short_secret_is_refused() {
        assert_eq!(
            VaultKey::derive("hunter2", cheap()).unwrap_err(),
            KeyDerivationError::SecretTooShort
        );
    }

    #[test]
    fn bogus_params_are_refused() {
        let err = VaultKey::derive(
            "correct horse battery staple",
            KdfParams {
                memory_kib: 1,
                iterations: 1,
                parallelism: 1,
            },
        )
        .unwrap_err();
        assert!(matches!(err, KeyDerivationError::InvalidParams(_)));
    }

    #[test]
    fn debug_output_hides_key_material() {
        let key = VaultKey::from_bytes([7u8; AES_KEY_LENGTH]);
        let printed = format!("{key:?}");
        assert!(printed.starts_with("VaultKey("));
        assert!(!printed.contains("07070707"));
    }

    #[test]
    fn ephemeral_keys_differ() {
        assert_ne!(
            VaultKey::ephemeral().as_bytes(),
            VaultKey::ephemeral().as_bytes()
        );
    }
}
