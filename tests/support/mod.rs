use chrono::{NaiveDate, Utc};
use reconciliation_engine::models::{CounterpartyKind, Direction, PaymentStatus, ReconciliationStatus};
use reconciliation_engine::repository::Repository;
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use uuid::Uuid;

pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.expect("open in-memory db");
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.expect("run migrations");
    pool
}

pub async fn insert_counterparty(pool: &SqlitePool, denomination: &str, fiscal_id: Option<&str>) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO counterparties (id, kind, denomination, fiscal_id, tax_code, score) VALUES (?, ?, ?, ?, NULL, NULL)")
        .bind(id.to_string())
        .bind("customer")
        .bind(denomination)
        .bind(fiscal_id)
        .execute(pool)
        .await
        .expect("insert counterparty");
    id
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_invoice(
    pool: &SqlitePool,
    counterparty_id: Uuid,
    direction: Direction,
    doc_number: &str,
    doc_date: NaiveDate,
    total_amount: Decimal,
    paid_amount: Decimal,
    status: PaymentStatus,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO invoices (id, counterparty_id, direction, doc_number, doc_date, due_date, total_amount, paid_amount, payment_status, content_hash, created_at) \
         VALUES (?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(counterparty_id.to_string())
    .bind(direction_str(direction))
    .bind(doc_number)
    .bind(doc_date.to_string())
    .bind(total_amount.to_string())
    .bind(paid_amount.to_string())
    .bind(status_str(status))
    .bind(format!("hash-{id}"))
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await
    .expect("insert invoice");
    id
}

pub async fn insert_transaction(
    pool: &SqlitePool,
    transaction_date: NaiveDate,
    amount: Decimal,
    description: &str,
    reconciled_amount: Decimal,
    status: ReconciliationStatus,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO bank_transactions (id, transaction_date, amount, description, reconciled_amount, reconciliation_status, content_hash, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(transaction_date.to_string())
    .bind(amount.to_string())
    .bind(description)
    .bind(reconciled_amount.to_string())
    .bind(reconciliation_status_str(status))
    .bind(format!("hash-{id}"))
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await
    .expect("insert transaction");
    id
}

pub fn repository(pool: SqlitePool) -> Repository {
    Repository::new(pool)
}

// NOTE: bound here via the string form the migration's TEXT columns expect,
// mirroring `repository.rs`'s private mapping functions (kept separate
// since those aren't exported across the crate boundary).
fn direction_str(d: Direction) -> &'static str {
    match d {
        Direction::Outgoing => "outgoing",
        Direction::Incoming => "incoming",
    }
}

fn status_str(s: PaymentStatus) -> &'static str {
    match s {
        PaymentStatus::Open => "open",
        PaymentStatus::Overdue => "overdue",
        PaymentStatus::PartiallyPaid => "partially_paid",
        PaymentStatus::FullyPaid => "fully_paid",
    }
}

fn reconciliation_status_str(s: ReconciliationStatus) -> &'static str {
    match s {
        ReconciliationStatus::Unreconciled => "unreconciled",
        ReconciliationStatus::PartiallyReconciled => "partially_reconciled",
        ReconciliationStatus::FullyReconciled => "fully_reconciled",
        ReconciliationStatus::ExcessReconciled => "excess_reconciled",
        ReconciliationStatus::Ignored => "ignored",
    }
}

#[allow(dead_code)]
pub fn counterparty_kind_customer() -> CounterpartyKind {
    CounterpartyKind::Customer
}
