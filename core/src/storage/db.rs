//! # X402Db: Persistent Storage Engine
//!
//! The system of record for authorizations, tokens, spend accumulators,
//! escrow locks and encrypted credentials, built on sled's embedded
//! key-value store.
//!
//! ## Tree Layout
//!
//! | Tree                  | Key                          | Value                        |
//! |-----------------------|------------------------------|------------------------------|
//! | `authorizations`      | request_id                   | `bincode(AuthorizationResponse)` |
//! | `authorized_invoices` | invoice_id                   | request_id                   |
//! | `tokens`              | sha256(token) hex            | `bincode(TokenRecord)`       |
//! | `spending`            | `daily:…` / `weekly:…`       | cents (8B BE)                |
//! | `escrow_locks`        | escrow_id                    | `bincode(EscrowLock)`        |
//! | `escrow_releases`     | escrow_id                    | `bincode(EscrowRelease)`     |
//! | `escrow_by_invoice`   | invoice_id                   | escrow_id                    |
//! | `escrow_by_token`     | sha256(token) hex            | escrow_id                    |
//! | `credentials`         | owner_id                     | `bincode(StoredCredential)`  |
//! | `credential_audit`    | sequence (8B BE)             | `bincode(AuditRecord)`       |
//! | `stranded_funds`      | funding tx_reference         | `bincode(StrandedFunds)`     |
//! | `metadata`            | key (UTF-8)                  | value (bytes)                |
//!
//! Sequence numbers are big-endian so sled's lexicographic order is append
//! order, which makes the audit tree a log you can range-scan.
//!
//! ## Atomicity
//!
//! Anything that must change several trees together (commit an
//! authorization, settle an escrow) does so in a sled multi-tree
//! transaction. sled transactions are serializable: two conflicting
//! settlements of one escrow cannot both commit.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors from the storage layer. These are the "storage unavailable"
/// class: callers propagate them rather than turning them into business
/// outcomes.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt record in {tree}: {detail}")]
    Corrupt { tree: &'static str, detail: String },

    #[error("unsupported schema version {found}, expected {expected}")]
    SchemaVersion { found: u32, expected: u32 },
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<sled::transaction::TransactionError<StoreError>> for StoreError {
    fn from(err: sled::transaction::TransactionError<StoreError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(e) => StoreError::Sled(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

pub fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode a big-endian u64 counter. Missing means zero.
pub fn decode_u64(tree: &'static str, bytes: Option<&[u8]>) -> StoreResult<u64> {
    match bytes {
        None => Ok(0),
        Some(raw) => {
            let arr: [u8; 8] = raw.try_into().map_err(|_| StoreError::Corrupt {
                tree,
                detail: format!("expected 8-byte counter, found {} bytes", raw.len()),
            })?;
            Ok(u64::from_be_bytes(arr))
        }
    }
}

/// Decode a UTF-8 id stored as a value.
pub fn decode_str(tree: &'static str, bytes: &[u8]) -> StoreResult<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| StoreError::Corrupt {
        tree,
        detail: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Metadata Keys
// ---------------------------------------------------------------------------

const META_SCHEMA_VERSION: &[u8] = b"schema_version";

/// On-disk layout version. Bump when a stored type changes shape.
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// X402Db
// ---------------------------------------------------------------------------

/// Persistent storage for the authorization core.
///
/// Cheap to clone (sled handles are reference-counted) and safe to share
/// across threads without external locking.
#[derive(Debug, Clone)]
pub struct X402Db {
    db: Db,
    pub(crate) authorizations: Tree,
    pub(crate) authorized_invoices: Tree,
    pub(crate) tokens: Tree,
    pub(crate) spending: Tree,
    pub(crate) escrow_locks: Tree,
    pub(crate) escrow_releases: Tree,
    pub(crate) escrow_by_invoice: Tree,
    pub(crate) escrow_by_token: Tree,
    pub(crate) credentials: Tree,
    pub(crate) credential_audit: Tree,
    pub(crate) stranded_funds: Tree,
    metadata: Tree,
}

impl X402Db {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory database, removed when the last handle drops. For tests
    /// and throwaway demos.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let metadata = db.open_tree("metadata")?;
        match metadata.get(META_SCHEMA_VERSION)? {
            None => {
                metadata.insert(META_SCHEMA_VERSION, SCHEMA_VERSION.to_be_bytes().to_vec())?;
            }
            Some(raw) => {
                let arr: [u8; 4] = raw.as_ref().try_into().map_err(|_| StoreError::Corrupt {
                    tree: "metadata",
                    detail: "bad schema version bytes".into(),
                })?;
                let found = u32::from_be_bytes(arr);
                if found != SCHEMA_VERSION {
                    return Err(StoreError::SchemaVersion {
                        found,
                        expected: SCHEMA_VERSION,
                    });
                }
            }
        }

        Ok(Self {
            authorizations: db.open_tree("authorizations")?,
            authorized_invoices: db.open_tree("authorized_invoices")?,
            tokens: db.open_tree("tokens")?,
            spending: db.open_tree("spending")?,
            escrow_locks: db.open_tree("escrow_locks")?,
            escrow_releases: db.open_tree("escrow_releases")?,
            escrow_by_invoice: db.open_tree("escrow_by_invoice")?,
            escrow_by_token: db.open_tree("escrow_by_token")?,
            credentials: db.open_tree("credentials")?,
            credential_audit: db.open_tree("credential_audit")?,
            stranded_funds: db.open_tree("stranded_funds")?,
            metadata,
            db,
        })
    }

    /// Layout version recorded when the database was created.
    pub fn schema_version(&self) -> StoreResult<u32> {
        let raw = self.metadata.get(META_SCHEMA_VERSION)?;
        let bytes = raw.as_deref().unwrap_or(&[]);
        let arr: [u8; 4] = bytes.try_into().map_err(|_| StoreError::Corrupt {
            tree: "metadata",
            detail: "bad schema version bytes".into(),
        })?;
        Ok(u32::from_be_bytes(arr))
    }

    /// Monotonic id, unique for the life of the database.
    pub fn generate_id(&self) -> StoreResult<u64> {
        Ok(self.db.generate_id()?)
    }

    /// Typed point lookup.
    pub(crate) fn get<T: DeserializeOwned>(&self, tree: &Tree, key: &[u8]) -> StoreResult<Option<T>> {
        match tree.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Typed full scan. Fine at the volumes one business generates; a real
    /// fleet would want secondary indexes.
    pub(crate) fn scan<T: DeserializeOwned>(&self, tree: &Tree) -> StoreResult<Vec<T>> {
        tree.iter()
            .map(|entry| {
                let (_, value) = entry?;
                decode(&value)
            })
            .collect()
    }

    /// Record counts per tree, for `/health` and `x402-node stats`.
    pub fn tree_sizes(&self) -> Vec<(&'static str, usize)> {
        vec![
            ("authorizations", self.authorizations.len()),
            ("tokens", self.tokens.len()),
            ("escrow_locks", self.escrow_locks.len()),
            ("escrow_releases", self.escrow_releases.len()),
            ("credentials", self.credentials.len()),
            ("credential_audit", self.credential_audit.len()),
            ("stranded_funds", self.stranded_funds.len()),
        ]
    }

    /// Stored credential sets. Each is sealed under the vault master key.
    pub fn credential_count(&self) -> usize {
        self.credentials.len()
    }

    /// Block until all pending writes are durable.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: String,
        cents: u64,
    }

    #[test]
    fn open_temporary_database() {
        let db = X402Db::open_temporary().expect("temp db");
        assert!(db.tree_sizes().iter().all(|(_, n)| *n == 0));
    }

    #[test]
    fn reopen_persistent_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let db = X402Db::open(dir.path()).unwrap();
            db.credentials
                .insert("biz_1", encode(&Sample { id: "a".into(), cents: 5 }).unwrap())
                .unwrap();
            db.flush().unwrap();
        }
        let db = X402Db::open(dir.path()).expect("reopen");
        let back: Option<Sample> = db.get(&db.credentials, b"biz_1").unwrap();
        assert_eq!(back, Some(Sample { id: "a".into(), cents: 5 }));
    }

    #[test]
    fn schema_version_mismatch_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let raw = sled::open(dir.path()).unwrap();
            let meta = raw.open_tree("metadata").unwrap();
            meta.insert(META_SCHEMA_VERSION, 99u32.to_be_bytes().to_vec()).unwrap();
            raw.flush().unwrap();
        }
        assert!(matches!(
            X402Db::open(dir.path()),
            Err(StoreError::SchemaVersion { found: 99, .. })
        ));
    }

    #[test]
    fn typed_get_and_scan() {
        let db = X402Db::open_temporary().unwrap();
        for i in 0..3u64 {
            let s = Sample { id: format!("s{i}"), cents: i * 100 };
            db.escrow_locks.insert(s.id.as_bytes(), encode(&s).unwrap()).unwrap();
        }
        let all: Vec<Sample> = db.scan(&db.escrow_locks).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].cents, 200);
        let missing: Option<Sample> = db.get(&db.escrow_locks, b"nope").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn counters_decode() {
        assert_eq!(decode_u64("spending", None).unwrap(), 0);
        assert_eq!(
            decode_u64("spending", Some(&42u64.to_be_bytes())).unwrap(),
            42
        );
        assert!(matches!(
            decode_u64("spending", Some(b"abc")),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn schema_version_is_recorded() {
        let db = X402Db::open_temporary().unwrap();
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn generated_ids_increase() {
        let db = X402Db::open_temporary().unwrap();
        let a = db.generate_id().unwrap();
        let b = db.generate_id().unwrap();
        assert!(b > a);
    }
}
