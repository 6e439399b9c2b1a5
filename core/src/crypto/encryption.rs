//! # AES-256-GCM Field Encryption
//!
//! Authenticated encryption for credential fields at rest.
//!
//! Every sealed field is bound to its context through Additional
//! Authenticated Data: the owner id and the field name. Copy an encrypted
//! account number into another owner's record, or into the routing slot of
//! the same record, and decryption fails instead of quietly returning the
//! wrong secret.
//!
//! ## Nonce management
//!
//! Random 96-bit nonces from the OS CSPRNG, fresh per call. The birthday
//! bound sits around 2^48 seals per key, which a bank-credential vault will
//! not approach.
//!
//! ## Wire format
//!
//! [`seal`] returns `nonce || ciphertext || tag` as one `Vec<u8>`. [`open`]
//! expects exactly that layout back.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use thiserror::Error;

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH, AES_TAG_LENGTH};

/// Errors from sealing or opening a field.
///
/// Deliberately coarse. Whether the key was wrong, the AAD didn't match or
/// a bit flipped in storage is nobody's business but the operator's, and
/// the operator has the audit log.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed -- wrong key, wrong context or corrupted ciphertext")]
    DecryptFailed,

    #[error("sealed data too short: need at least {} bytes", AES_NONCE_LENGTH + AES_TAG_LENGTH)]
    CiphertextTooShort,
}

/// Build the AAD that binds a field to its record.
pub fn field_context(owner_id: &str, field: &str) -> Vec<u8> {
    // Length-prefix the owner so "ab"+"c" and "a"+"bc" never collide.
    let mut aad = Vec::with_capacity(8 + owner_id.len() + field.len());
    aad.extend_from_slice(&(owner_id.len() as u64).to_be_bytes());
    aad.extend_from_slice(owner_id.as_bytes());
    aad.extend_from_slice(field.as_bytes());
    aad
}

/// Encrypt `plaintext` under `key`, authenticating `aad` alongside it.
pub fn seal(
    key: &[u8; AES_KEY_LENGTH],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::EncryptFailed)?;

    let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::EncryptFailed)?;

    let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt data produced by [`seal`] with the same key and AAD.
pub fn open(
    key: &[u8; AES_KEY_LENGTH],
    sealed: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    if sealed.len() < AES_NONCE_LENGTH + AES_TAG_LENGTH {
        return Err(EncryptionError::CiphertextTooShort);
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(AES_NONCE_LENGTH);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::DecryptFailed)?;

    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; AES_KEY_LENGTH] {
        let mut key = [0u8; AES_KEY_LENGTH];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        key
    }

    #[test]
    fn seal_then_open() {
        let key = test_key();
        let aad = field_context("biz_1", "routing_number");
        let sealed = seal(&key, b"021000021", &aad).unwrap();
        assert_eq!(open(&key, &sealed, &aad).unwrap(), b"021000021");
    }

    #[test]
    fn sealed_length_is_nonce_plus_body_plus_tag() {
        let key = test_key();
        let sealed = seal(&key, b"123456789012", b"ctx").unwrap();
        assert_eq!(sealed.len(), AES_NONCE_LENGTH + 12 + AES_TAG_LENGTH);
    }

    #[test]
    fn wrong_key_fails() {
        let key = test_key();
        let sealed = seal(&key, b"secret", b"ctx").unwrap();
        let mut wrong = test_key();
        wrong[0] ^= 0xFF;
        assert_eq!(
            open(&wrong, &sealed, b"ctx"),
            Err(EncryptionError::DecryptFailed)
        );
    }

    #[test]
    fn field_moved_to_another_owner_fails() {
        let key = test_key();
        let sealed = seal(&key, b"123456789012", &field_context("biz_1", "account_number")).unwrap();
        assert!(open(&key, &sealed, &field_context("biz_2", "account_number")).is_err());
        assert!(open(&key, &sealed, &field_context("biz_1", "routing_number")).is_err());
    }

    #[test]
    fn context_is_unambiguous() {
        assert_ne!(field_context("ab", "cfield"), field_context("a", "bcfield"));
    }

    #[test]
    fn tampering_is_detected() {
        let key = test_key();
        let mut sealed = seal(&key, b"secret", b"ctx").unwrap();
        sealed[AES_NONCE_LENGTH] ^= 0x01;
        assert!(open(&key, &sealed, b"ctx").is_err());
    }

    #[test]
    fn truncated_input_is_rejected_early() {
        let key = test_key();
        assert_eq!(
            open(&key, &[0u8; 20], b"ctx"),
            Err(EncryptionError::CiphertextTooShort)
        );
    }

    #[test]
    fn nonces_are_fresh() {
        let key = test_key();
        let a = seal(&key, b"same", b"ctx").unwrap();
        let b = seal(&key, b"same", b"ctx").unwrap();
        assert_ne!(&a[..AES_NONCE_LENGTH], &b[..AES_NONCE_LENGTH]);
    }
}
