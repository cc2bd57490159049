use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Monetary comparison tolerance (§3, glossary "ε").
pub const EPSILON: Decimal = Decimal::new(1, 2); // 0.01

// ===== COUNTERPARTY =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CounterpartyKind {
    Customer,
    Supplier,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Counterparty {
    pub id: Uuid,
    pub kind: CounterpartyKind,
    pub denomination: String,
    pub fiscal_id: Option<String>,
    pub tax_code: Option<String>,
    pub score: Option<f64>,
}

// ===== INVOICE =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Open,
    Overdue,
    PartiallyPaid,
    FullyPaid,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub counterparty_id: Uuid,
    pub direction: Direction,
    pub doc_number: String,
    pub doc_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub payment_status: PaymentStatus,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Invoice {
    /// §3: residual = total_amount − paid_amount.
    pub fn residual(&self) -> Decimal {
        self.total_amount - self.paid_amount
    }
}

// ===== BANK TRANSACTION =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Unreconciled,
    PartiallyReconciled,
    FullyReconciled,
    ExcessReconciled,
    Ignored,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BankTransaction {
    pub id: Uuid,
    pub transaction_date: NaiveDate,
    /// Signed: positive = credit (expected for Outgoing invoices), negative
    /// = debit (expected for Incoming invoices).
    pub amount: Decimal,
    pub description: String,
    /// Absolute value, same sign convention as `amount` when added back.
    pub reconciled_amount: Decimal,
    pub reconciliation_status: ReconciliationStatus,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl BankTransaction {
    /// §3/glossary: residual = amount − reconciled_amount, sign preserved.
    pub fn residual(&self) -> Decimal {
        if self.amount.is_sign_negative() {
            self.amount + self.reconciled_amount
        } else {
            self.amount - self.reconciled_amount
        }
    }

    pub fn direction_for_match(&self) -> Direction {
        if self.amount.is_sign_negative() {
            Direction::Incoming
        } else {
            Direction::Outgoing
        }
    }
}

// ===== RECONCILIATION LINK =====

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReconciliationLink {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub transaction_id: Uuid,
    pub reconciled_amount: Decimal,
    pub created_at: DateTime<Utc>,
}

// ===== CLIENT PATTERN (derived, not persisted-authoritative) =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientPattern {
    pub counterparty_id: Uuid,
    pub payment_intervals: Vec<i64>,
    pub amount_cluster_count: usize,
    pub noise_ratio: f64,
    pub temporal_mean_days: f64,
    pub temporal_stddev_days: f64,
    pub reliability_score: f64,
    pub version: u64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct PatternPrediction {
    pub amount_cluster_match: f64,
    pub temporal_likelihood: f64,
    pub overall_confidence: f64,
}

// ===== CONFIDENCE BAND (§4.4) =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceBand {
    VeryLow,
    Low,
    Medium,
    High,
}

impl ConfidenceBand {
    pub fn from_score(score: f64, min_confidence: f64, high_confidence: f64) -> Self {
        if score >= high_confidence {
            ConfidenceBand::High
        } else if score >= 0.3 {
            ConfidenceBand::Medium
        } else if score >= min_confidence {
            ConfidenceBand::Low
        } else {
            ConfidenceBand::VeryLow
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            ConfidenceBand::VeryLow => 0,
            ConfidenceBand::Low => 1,
            ConfidenceBand::Medium => 2,
            ConfidenceBand::High => 3,
        }
    }
}
