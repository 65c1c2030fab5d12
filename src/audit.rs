// 🔗 Audit Hash Chain - tamper-evident change log
// Every entry commits to its own fields AND the previous entry's hash:
//
//   hash = SHA256(canonical(entity_type, entity_id, action, old_values,
//                           new_values, actor_id, timestamp, prev_hash))
//
// Editing any historical entry breaks its hash and every link after it.

use crate::error::{IntegrityError, IntegrityFailure, LedgerError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// prev_hash of the first entry in a chain
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

// ============================================================================
// AUDIT ACTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    /// Bank line matched against a ledger transaction
    Reconcile,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "CREATE",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
            AuditAction::Reconcile => "RECONCILE",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Ok(AuditAction::Create),
            "UPDATE" => Ok(AuditAction::Update),
            "DELETE" => Ok(AuditAction::Delete),
            "RECONCILE" => Ok(AuditAction::Reconcile),
            other => Err(LedgerError::InvalidInput(format!("unknown audit action: {other}"))),
        }
    }
}

// ============================================================================
// AUDIT RECORD (unsealed)
// ============================================================================

/// What happened, before it is linked into the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub entity_type: String,
    pub entity_id: String,
    pub action: AuditAction,
    pub old_values: Option<Value>,
    pub new_values: Option<Value>,
    pub actor_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>, action: AuditAction) -> Self {
        AuditRecord {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            action,
            old_values: None,
            new_values: None,
            actor_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_old_values(mut self, values: Value) -> Self {
        self.old_values = Some(values);
        self
    }

    pub fn with_new_values(mut self, values: Value) -> Self {
        self.new_values = Some(values);
        self
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ============================================================================
// AUDIT ENTRY (sealed)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Storage sequence number; None until persisted. Not part of the hash.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,

    pub entity_type: String,
    pub entity_id: String,
    pub action: AuditAction,
    pub old_values: Option<Value>,
    pub new_values: Option<Value>,
    pub actor_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    /// Link a record onto the chain whose last hash is `prev_hash`
    pub fn seal(record: AuditRecord, prev_hash: &str) -> Self {
        let hash = compute_hash(&record, prev_hash);
        AuditEntry {
            seq: None,
            entity_type: record.entity_type,
            entity_id: record.entity_id,
            action: record.action,
            old_values: record.old_values,
            new_values: record.new_values,
            actor_id: record.actor_id,
            timestamp: record.timestamp,
            prev_hash: prev_hash.to_string(),
            hash,
        }
    }

    pub fn recompute_hash(&self) -> String {
        hash_fields(
            &self.entity_type,
            &self.entity_id,
            self.action,
            self.old_values.as_ref(),
            self.new_values.as_ref(),
            self.actor_id.as_deref(),
            &self.timestamp,
            &self.prev_hash,
        )
    }

    pub fn is_intact(&self) -> bool {
        self.recompute_hash() == self.hash
    }
}

/// Hash a record as if it followed `prev_hash`
pub fn compute_hash(record: &AuditRecord, prev_hash: &str) -> String {
    hash_fields(
        &record.entity_type,
        &record.entity_id,
        record.action,
        record.old_values.as_ref(),
        record.new_values.as_ref(),
        record.actor_id.as_deref(),
        &record.timestamp,
        prev_hash,
    )
}

/// Canonical form is a compact JSON array in fixed field order.
/// serde_json keeps object keys sorted, so nested values are stable too.
#[allow(clippy::too_many_arguments)]
fn hash_fields(
    entity_type: &str,
    entity_id: &str,
    action: AuditAction,
    old_values: Option<&Value>,
    new_values: Option<&Value>,
    actor_id: Option<&str>,
    timestamp: &DateTime<Utc>,
    prev_hash: &str,
) -> String {
    let canonical = Value::Array(vec![
        Value::from(entity_type),
        Value::from(entity_id),
        Value::from(action.as_str()),
        old_values.cloned().unwrap_or(Value::Null),
        new_values.cloned().unwrap_or(Value::Null),
        actor_id.map(Value::from).unwrap_or(Value::Null),
        Value::from(timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        Value::from(prev_hash),
    ]);

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Seal `record` after `prev_hash`, or after genesis when the chain is empty
pub fn append(prev_hash: Option<&str>, record: AuditRecord) -> AuditEntry {
    AuditEntry::seal(record, prev_hash.unwrap_or(GENESIS_HASH))
}

// ============================================================================
// VERIFICATION
// ============================================================================

/// Verify a full chain starting from genesis
pub fn verify(entries: &[AuditEntry]) -> Result<(), IntegrityError> {
    verify_segment(GENESIS_HASH, entries)
}

/// Verify a run of entries whose first entry links to `anchor`.
/// Stops at the first failing index.
pub fn verify_segment(anchor: &str, entries: &[AuditEntry]) -> Result<(), IntegrityError> {
    let mut expected_prev = anchor;

    for (index, entry) in entries.iter().enumerate() {
        let recomputed = entry.recompute_hash();
        if recomputed != entry.hash {
            return Err(IntegrityError {
                index,
                reason: IntegrityFailure::HashMismatch,
                stored: entry.hash.clone(),
                expected: recomputed,
            });
        }

        if entry.prev_hash != expected_prev {
            return Err(IntegrityError {
                index,
                reason: IntegrityFailure::BrokenLink,
                stored: entry.prev_hash.clone(),
                expected: expected_prev.to_string(),
            });
        }

        expected_prev = &entry.hash;
    }

    Ok(())
}

// ============================================================================
// IN-MEMORY CHAIN
// ============================================================================

/// Append-only chain held in memory; the db module is the persistent twin
#[derive(Debug, Clone, Default)]
pub struct AuditChain {
    entries: Vec<AuditEntry>,
}

impl AuditChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_hash(&self) -> &str {
        self.entries
            .last()
            .map(|e| e.hash.as_str())
            .unwrap_or(GENESIS_HASH)
    }

    pub fn append(&mut self, record: AuditRecord) -> &AuditEntry {
        let entry = AuditEntry::seal(record, self.last_hash());
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn verify(&self) -> Result<(), IntegrityError> {
        verify(&self.entries)
    }
}

// ============================================================================
// TESTS
// ============================================================================
