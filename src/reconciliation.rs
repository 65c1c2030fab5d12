// ⚖️ Reconciliation Engine - pair bank statement lines with ledger transactions
//
// Each (bank line, ledger transaction) pair gets a score:
//   score = description_weight * similarity(descriptions)
//         + amount_weight      * [|amount_a - amount_b| <= epsilon]
// Pairs in different currencies are never candidates.
//
// Matching is greedy across ALL bank lines at once: the best pair wins,
// both sides leave the pool, repeat. Ties go to the earliest ledger date.

use crate::db::{BankLine, LedgerTransaction};
use crate::error::{LedgerError, Result};
use crate::similarity::description_similarity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// RECONCILIATION STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconciliationStatus {
    /// Not yet part of a reconciliation run
    Pending,

    /// Bank line paired with a ledger transaction
    Reconciled,

    /// Bank line with no ledger transaction above threshold
    Unreconciled,

    /// Ledger transaction no bank line accounts for
    Unbacked,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStatus::Pending => "pending",
            ReconciliationStatus::Reconciled => "reconciled",
            ReconciliationStatus::Unreconciled => "unreconciled",
            ReconciliationStatus::Unbacked => "unbacked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReconciliationStatus::Pending),
            "reconciled" => Some(ReconciliationStatus::Reconciled),
            "unreconciled" => Some(ReconciliationStatus::Unreconciled),
            "unbacked" => Some(ReconciliationStatus::Unbacked),
            _ => None,
        }
    }
}

// ============================================================================
// MATCH RESULTS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub bank_line: BankLine,
    pub ledger_transaction: LedgerTransaction,

    /// Combined score (0.0 - 1.0)
    pub score: f64,

    /// Description component alone (0.0 - 1.0)
    pub description_similarity: f64,
}

/// One ledger transaction considered for a single bank line
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub transaction: &'a LedgerTransaction,
    pub score: f64,
    pub description_similarity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub run_id: Uuid,
    pub threshold: f64,
    pub matches: Vec<Match>,
    pub unreconciled: Vec<BankLine>,
    pub unbacked: Vec<LedgerTransaction>,
    pub reconciled_at: DateTime<Utc>,
}

impl ReconciliationReport {
    /// Every bank line found a partner
    pub fn is_fully_reconciled(&self) -> bool {
        self.unreconciled.is_empty()
    }

    /// (bank external_id, ledger id) for every accepted match
    pub fn pairs(&self) -> Vec<(String, i64)> {
        self.matches
            .iter()
            .map(|m| (m.bank_line.external_id.clone(), m.ledger_transaction.id))
            .collect()
    }

    pub fn status_of(&self, external_id: &str) -> Option<ReconciliationStatus> {
        if self.matches.iter().any(|m| m.bank_line.external_id == external_id) {
            Some(ReconciliationStatus::Reconciled)
        } else if self.unreconciled.iter().any(|b| b.external_id == external_id) {
            Some(ReconciliationStatus::Unreconciled)
        } else {
            None
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Reconciliation {} at threshold {:.2}: {} matched, {} unreconciled bank lines, {} unbacked ledger transactions",
            self.run_id,
            self.threshold,
            self.matches.len(),
            self.unreconciled.len(),
            self.unbacked.len()
        )
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    /// Amounts closer than this are equal (default: 0.01)
    pub amount_epsilon: f64,

    /// Weight of description similarity (default: 0.6)
    pub description_weight: f64,

    /// Weight of amount equality (default: 0.4)
    pub amount_weight: f64,
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        ReconciliationEngine {
            amount_epsilon: 0.01,
            description_weight: 0.6,
            amount_weight: 0.4,
        }
    }

    pub fn with_epsilon(amount_epsilon: f64) -> Self {
        ReconciliationEngine {
            amount_epsilon,
            ..Self::new()
        }
    }

    /// Weights are rescaled to sum to 1
    pub fn with_weights(description_weight: f64, amount_weight: f64) -> Result<Self> {
        let total = description_weight + amount_weight;
        if description_weight < 0.0 || amount_weight < 0.0 || !(total > 0.0) {
            return Err(LedgerError::InvalidInput(format!(
                "match weights must be non-negative with a positive sum, got {description_weight} / {amount_weight}"
            )));
        }
        Ok(ReconciliationEngine {
            description_weight: description_weight / total,
            amount_weight: amount_weight / total,
            ..Self::new()
        })
    }

    /// Score one pair; None when currencies differ
    fn score_pair(&self, bank: &BankLine, tx: &LedgerTransaction) -> Option<(f64, f64)> {
        if !bank.currency.eq_ignore_ascii_case(&tx.currency) {
            return None;
        }

        let desc = description_similarity(&bank.description, &tx.description);
        let amount = if (bank.amount - tx.amount).abs() <= self.amount_epsilon {
            1.0
        } else {
            0.0
        };

        Some((self.description_weight * desc + self.amount_weight * amount, desc))
    }

    /// Combined score of one pair; 0.0 for differing currencies.
    ///
    /// A 0.0 here is ambiguous: `reconcile` and `candidates` never pair
    /// differing currencies, even at threshold 0.0, while a same-currency
    /// pair that genuinely scores 0.0 is still accepted at that threshold.
    pub fn score(&self, bank: &BankLine, tx: &LedgerTransaction) -> f64 {
        self.score_pair(bank, tx).map(|(score, _)| score).unwrap_or(0.0)
    }

    /// Ledger transactions scoring at or above `threshold` for one bank line,
    /// best first
    pub fn candidates<'a>(
        &self,
        bank: &BankLine,
        ledger: &'a [LedgerTransaction],
        threshold: f64,
    ) -> Result<Vec<Candidate<'a>>> {
        validate_threshold(threshold)?;

        let mut candidates: Vec<Candidate<'a>> = ledger
            .iter()
            .filter_map(|tx| {
                let (score, description_similarity) = self.score_pair(bank, tx)?;
                (score >= threshold).then_some(Candidate {
                    transaction: tx,
                    score,
                    description_similarity,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.transaction.date.cmp(&b.transaction.date))
        });

        Ok(candidates)
    }

    /// Pair bank lines with ledger transactions.
    ///
    /// Example:
    /// ```
    /// use chrono::NaiveDate;
    /// use ledger_audit::{BankLine, LedgerTransaction, ReconciliationEngine};
    ///
    /// let date = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
    /// let bank = vec![BankLine::new("stmt-1", date, "OFFICE RENT-MAY", 1000.0, "PKR")];
    /// let ledger = vec![LedgerTransaction::new(1, date, "Office Rent May", 1000.0, "PKR")];
    ///
    /// let report = ReconciliationEngine::new().reconcile(&bank, &ledger, 0.6).unwrap();
    /// assert_eq!(report.pairs(), vec![("stmt-1".to_string(), 1)]);
    /// ```
    pub fn reconcile(
        &self,
        bank_lines: &[BankLine],
        ledger: &[LedgerTransaction],
        threshold: f64,
    ) -> Result<ReconciliationReport> {
        validate_threshold(threshold)?;

        // (score, description similarity, bank index, ledger index)
        let mut scored: Vec<(f64, f64, usize, usize)> = Vec::new();
        for (bi, bank) in bank_lines.iter().enumerate() {
            for (li, tx) in ledger.iter().enumerate() {
                if let Some((score, desc)) = self.score_pair(bank, tx) {
                    if score >= threshold {
                        scored.push((score, desc, bi, li));
                    }
                }
            }
        }

        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| ledger[a.3].date.cmp(&ledger[b.3].date))
                .then_with(|| a.2.cmp(&b.2))
                .then_with(|| a.3.cmp(&b.3))
        });

        let mut bank_taken = vec![false; bank_lines.len()];
        let mut ledger_taken = vec![false; ledger.len()];
        let mut matches = Vec::new();

        for (score, desc, bi, li) in scored {
            if bank_taken[bi] || ledger_taken[li] {
                continue;
            }
            bank_taken[bi] = true;
            ledger_taken[li] = true;

            tracing::debug!(
                bank_line = %bank_lines[bi].external_id,
                ledger_id = ledger[li].id,
                score,
                "matched bank line"
            );

            matches.push(Match {
                bank_line: bank_lines[bi].clone(),
                ledger_transaction: ledger[li].clone(),
                score,
                description_similarity: desc,
            });
        }

        let unreconciled: Vec<BankLine> = bank_lines
            .iter()
            .zip(&bank_taken)
            .filter(|(_, taken)| !**taken)
            .map(|(b, _)| b.clone())
            .collect();

        let unbacked: Vec<LedgerTransaction> = ledger
            .iter()
            .zip(&ledger_taken)
            .filter(|(_, taken)| !**taken)
            .map(|(tx, _)| tx.clone())
            .collect();

        let report = ReconciliationReport {
            run_id: Uuid::new_v4(),
            threshold,
            matches,
            unreconciled,
            unbacked,
            reconciled_at: Utc::now(),
        };

        tracing::info!(
            run_id = %report.run_id,
            matched = report.matches.len(),
            unreconciled = report.unreconciled.len(),
            unbacked = report.unbacked.len(),
            "reconciliation complete"
        );

        Ok(report)
    }
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Threshold must be a number within [0, 1]
pub fn validate_threshold(threshold: f64) -> Result<()> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(LedgerError::InvalidThreshold(threshold))
    }
}

/// Reconcile with the default engine
pub fn match_transactions(
    bank_lines: &[BankLine],
    ledger: &[LedgerTransaction],
    threshold: f64,
) -> Result<ReconciliationReport> {
    ReconciliationEngine::new().reconcile(bank_lines, ledger, threshold)
}

// ============================================================================
// TESTS
// ============================================================================
