//! # Cryptographic Primitives
//!
//! Thin, typed wrappers over audited crates. Nothing here is clever and
//! nothing here should become clever.
//!
//! - **AES-256-GCM** seals credential fields, bound to owner and field.
//! - **Argon2id** derives the vault key from the operator's master secret.
//! - **SHA-256** digests bearer tokens before they touch storage.

pub mod encryption;
pub mod kdf;
pub mod token;

pub use encryption::{field_context, open, seal, EncryptionError};
pub use kdf::{KdfParams, KeyDerivationError, VaultKey};
pub use token::{mint_token, short_id, token_digest};
