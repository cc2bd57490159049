use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Error kinds surfaced to callers of the mutating façade operations (§7).
///
/// `Validation`, `NotFound` and `Conflict` never trigger a retry or a
/// rollback of work that hasn't happened yet — they mean the write was
/// rejected before any mutation occurred. `Transient` is retried by
/// `crate::retry::with_retry` before it ever reaches a caller.
#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invoice not found: {0}")]
    InvoiceNotFound(Uuid),

    #[error("transaction not found: {0}")]
    TransactionNotFound(Uuid),

    #[error("link not found for invoice {invoice_id} / transaction {transaction_id}")]
    LinkNotFound {
        invoice_id: Uuid,
        transaction_id: Uuid,
    },

    #[error("counterparty not found: {0}")]
    CounterpartyNotFound(Uuid),

    #[error("direction mismatch for invoice {invoice_id}: expected {direction} transaction sign")]
    DirectionMismatch { invoice_id: Uuid, direction: String },

    #[error("invoice {invoice_id} is in terminal state {status} and cannot accept new links")]
    InvoiceTerminal { invoice_id: Uuid, status: String },

    #[error("transaction {transaction_id} is in terminal state {status} and cannot accept new links")]
    TransactionTerminal {
        transaction_id: Uuid,
        status: String,
    },

    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(Decimal),

    #[error("amount {amount} exceeds invoice residual {residual}")]
    ExceedsInvoiceResidual { amount: Decimal, residual: Decimal },

    #[error("amount {amount} exceeds transaction residual {residual}")]
    ExceedsTransactionResidual { amount: Decimal, residual: Decimal },

    #[error("duplicate content hash: {0}")]
    DuplicateHash(String),

    #[error("link already exists for invoice {invoice_id} / transaction {transaction_id}")]
    DuplicateLink {
        invoice_id: Uuid,
        transaction_id: Uuid,
    },

    #[error("transient error, retried {attempts} time(s): {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: Box<ReconciliationError>,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ReconciliationError>;

/// Stable error-kind tag for the HTTP envelope (§7: mutation endpoints
/// return `{success:false, error_kind, message}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Transient,
    Internal,
}

impl ReconciliationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconciliationError::InvoiceNotFound(_)
            | ReconciliationError::TransactionNotFound(_)
            | ReconciliationError::LinkNotFound { .. }
            | ReconciliationError::CounterpartyNotFound(_) => ErrorKind::NotFound,

            ReconciliationError::DuplicateHash(_) | ReconciliationError::DuplicateLink { .. } => {
                ErrorKind::Conflict
            }

            ReconciliationError::DirectionMismatch { .. }
            | ReconciliationError::InvoiceTerminal { .. }
            | ReconciliationError::TransactionTerminal { .. }
            | ReconciliationError::NonPositiveAmount(_)
            | ReconciliationError::ExceedsInvoiceResidual { .. }
            | ReconciliationError::ExceedsTransactionResidual { .. }
            | ReconciliationError::Validation(_) => ErrorKind::Validation,

            ReconciliationError::Transient { .. } => ErrorKind::Transient,

            ReconciliationError::Database(_)
            | ReconciliationError::Migration(_)
            | ReconciliationError::Serialization(_)
            | ReconciliationError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// A SQL error is worth retrying when it looks like a lock/busy
    /// condition rather than a schema or data problem.
    pub fn is_transient_sql(&self) -> bool {
        match self {
            ReconciliationError::Database(sqlx::Error::Database(db_err)) => {
                let msg = db_err.message();
                msg.contains("locked") || msg.contains("busy")
            }
            _ => false,
        }
    }
}
