//! Opaque identifiers: bearer tokens and short record ids.
//!
//! Tokens are only ever persisted as their SHA-256 digest. A copy of the
//! database is not a bag of spendable authorizations.

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::{SHORT_ID_BYTES, TOKEN_ENTROPY_BYTES, TOKEN_PREFIX};

/// Mint a fresh single-use authorization token: `x402_<64 hex chars>`.
pub fn mint_token() -> String {
    let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("{TOKEN_PREFIX}{}", hex::encode(bytes))
}

/// Storage key for a token. Hex SHA-256 of the full token string.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// `prefix_<8 hex>` ids for escrows, releases and credentials.
pub fn short_id(prefix: &str) -> String {
    let mut bytes = [0u8; SHORT_ID_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("{prefix}_{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_have_prefix_and_entropy() {
        let t = mint_token();
        assert!(t.starts_with(TOKEN_PREFIX));
        assert_eq!(t.len(), TOKEN_PREFIX.len() + TOKEN_ENTROPY_BYTES * 2);
        assert_ne!(t, mint_token());
    }

    #[test]
    fn digest_is_stable_and_hides_token() {
        let t = mint_token();
        let d = token_digest(&t);
        assert_eq!(d, token_digest(&t));
        assert_eq!(d.len(), 64);
        assert!(!d.contains(&t[TOKEN_PREFIX.len()..]));
    }

    #[test]
    fn short_ids() {
        let id = short_id("escrow");
        assert!(id.starts_with("escrow_"));
        assert_eq!(id.len(), "escrow_".len() + 8);
    }
}
