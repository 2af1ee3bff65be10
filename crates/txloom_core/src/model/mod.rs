//! Lifecycle and change vocabulary shared by the write path and the audit trail.
//!
//! # Invariants
//! - Persisted spellings are upper snake case and never change.

pub mod change;
pub mod status;
