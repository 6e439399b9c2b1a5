//! # Storage Module
//!
//! Durable state for the authorization core. One sled database, one tree
//! per entity, bincode values. JSON is for the wire; bincode is for disk.

pub mod db;

pub use db::{StoreError, StoreResult, X402Db};
