//! Append-only record of every credential access.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::db::encode;
use crate::storage::{StoreResult, X402Db};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    Store,
    Inject,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    Success,
    /// Token verification failed; nothing was read.
    Denied,
    NotFound,
    /// Decryption or encoding failed.
    Failed,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuditAction::Store => "store",
            AuditAction::Inject => "inject",
            AuditAction::Delete => "delete",
        })
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Denied => "denied",
            AuditOutcome::NotFound => "not_found",
            AuditOutcome::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub owner_id: String,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub invoice_id: Option<String>,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// Append one record, keyed by a fresh big-endian sequence number.
pub(crate) fn append(
    db: &X402Db,
    owner_id: &str,
    action: AuditAction,
    outcome: AuditOutcome,
    invoice_id: Option<&str>,
    detail: impl Into<String>,
) -> StoreResult<AuditRecord> {
    let sequence = db.generate_id()?;
    let record = AuditRecord {
        sequence,
        owner_id: owner_id.to_string(),
        action,
        outcome,
        invoice_id: invoice_id.map(str::to_string),
        detail: detail.into(),
        timestamp: Utc::now(),
    };
    db.credential_audit
        .insert(sequence.to_be_bytes().to_vec(), encode(&record)?)?;
    Ok(record)
}

/// Records in append order, optionally for one owner.
pub(crate) fn list(db: &X402Db, owner_id: Option<&str>) -> StoreResult<Vec<AuditRecord>> {
    let records: Vec<AuditRecord> = db.scan(&db.credential_audit)?;
    Ok(match owner_id {
        Some(owner) => records.into_iter().filter(|r| r.owner_id == owner).collect(),
        None => records,
    })
}
