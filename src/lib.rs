// Ledger Audit - Core Library
// Hash-chained audit log + bank reconciliation, shared by the CLI and API server

pub mod audit;          // Audit Hash Chain
pub mod config;
pub mod currency;       // Rate table lookup-and-multiply
pub mod db;
pub mod error;
pub mod reconciliation; // Reconciliation Matcher
pub mod similarity;     // Description normalization + edit distance
pub mod telemetry;

#[cfg(feature = "server")]
pub mod api;            // REST API (axum)

// Re-export commonly used types
pub use audit::{
    AuditAction, AuditChain, AuditEntry, AuditRecord, GENESIS_HASH,
    compute_hash, verify, verify_segment,
};
pub use crate::config::Config;
pub use currency::{Conversion, ExchangeRates};
pub use db::{
    BankLine, BankLineRecord, LedgerTransaction, NewTransaction,
    open_database, setup_database,
    append_audit_entry, get_audit_chain, get_audit_log, last_audit_hash, verify_audit_log,
    insert_ledger_transaction, update_ledger_transaction,
    get_ledger_transaction, get_all_ledger_transactions, unbacked_ledger_transactions, verify_count,
    load_bank_lines, import_bank_lines, get_bank_lines, pending_bank_lines, apply_reconciliation,
    load_exchange_rates, set_exchange_rate,
};
pub use error::{IntegrityError, IntegrityFailure, LedgerError, Result};
pub use reconciliation::{
    Candidate, Match, ReconciliationEngine, ReconciliationReport, ReconciliationStatus,
    match_transactions, validate_threshold,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
