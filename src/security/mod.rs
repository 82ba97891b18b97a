//! Tamper-evident record of guard decisions.

pub mod audit;

pub use audit::{AuditAction, AuditEntry, append_audit_entry, read_audit_log, verify_audit_chain};
