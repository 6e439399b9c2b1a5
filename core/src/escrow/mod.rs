//! # Escrow
//!
//! Funds committed by an authorization sit in an escrow lock until the
//! payment executor reports back: release to the payee, refund to the
//! payer, or (if nobody reports back in time) expiry.

mod lock;
mod manager;

pub use lock::{EscrowError, EscrowLock, EscrowRelease, EscrowStatus};
pub use manager::{EscrowManager, EscrowStats, NewLock, SettlementClaim};
