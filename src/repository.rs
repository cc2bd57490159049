//! SQL persistence layer. Grounded on the teacher's `database.rs` (pool
//! construction, connectivity check) and `atomic/controller.rs` (query
//! shape, `Result<T, ClearingError>` propagation) — reworked from Postgres
//! `query_as!` compile-time macros to runtime `query_as::<_, T>()` calls,
//! since no `DATABASE_URL` is available at this crate's build time.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::cache::anagraphics::CounterpartySource;
use crate::errors::{ReconciliationError, Result};
use crate::models::{
    BankTransaction, Counterparty, Direction, Invoice, PaymentStatus, ReconciliationLink, ReconciliationStatus,
};
use crate::pattern::{HistoricalPayment, PaymentHistorySource};
use crate::retry::with_retry;
use crate::suggestion::InvoiceCandidateSource;

pub type Tx = sqlx::Transaction<'static, sqlx::Sqlite>;

#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    pub async fn begin(&self) -> Result<Tx> {
        Ok(self.pool.begin().await?)
    }

    pub async fn commit(&self, tx: Tx) -> Result<()> {
        tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(&self, tx: Tx) -> Result<()> {
        tx.rollback().await?;
        Ok(())
    }

    pub async fn get_invoice(&self, tx: &mut Tx, id: Uuid) -> Result<Invoice> {
        sqlx::query_as::<_, Invoice>("SELECT * FROM invoices WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(ReconciliationError::InvoiceNotFound(id))
    }

    pub async fn get_transaction(&self, tx: &mut Tx, id: Uuid) -> Result<BankTransaction> {
        sqlx::query_as::<_, BankTransaction>("SELECT * FROM bank_transactions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(ReconciliationError::TransactionNotFound(id))
    }

    pub async fn get_invoices_batch(&self, tx: &mut Tx, ids: &[Uuid]) -> Result<Vec<Invoice>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = placeholders(ids.len());
        let sql = format!("SELECT * FROM invoices WHERE id IN ({placeholders})");
        let mut query = sqlx::query_as::<_, Invoice>(&sql);
        for id in ids {
            query = query.bind(id.to_string());
        }
        Ok(query.fetch_all(&mut **tx).await?)
    }

    pub async fn get_transactions_batch(&self, tx: &mut Tx, ids: &[Uuid]) -> Result<Vec<BankTransaction>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = placeholders(ids.len());
        let sql = format!("SELECT * FROM bank_transactions WHERE id IN ({placeholders})");
        let mut query = sqlx::query_as::<_, BankTransaction>(&sql);
        for id in ids {
            query = query.bind(id.to_string());
        }
        Ok(query.fetch_all(&mut **tx).await?)
    }

    /// Sum-merges into an existing link for the pair if one already exists
    /// (§4.8 "upsert the link").
    pub async fn upsert_link(&self, tx: &mut Tx, invoice_id: Uuid, transaction_id: Uuid, amount: Decimal) -> Result<ReconciliationLink> {
        let existing = sqlx::query_as::<_, ReconciliationLink>(
            "SELECT * FROM reconciliation_links WHERE invoice_id = ? AND transaction_id = ?",
        )
        .bind(invoice_id.to_string())
        .bind(transaction_id.to_string())
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(link) = existing {
            let new_amount = link.reconciled_amount + amount;
            sqlx::query("UPDATE reconciliation_links SET reconciled_amount = ? WHERE id = ?")
                .bind(new_amount.to_string())
                .bind(link.id.to_string())
                .execute(&mut **tx)
                .await?;
            return Ok(ReconciliationLink {
                reconciled_amount: new_amount,
                ..link
            });
        }

        let id = Uuid::new_v4();
        let now = chrono::Utc::now();
        sqlx::query(
            "INSERT INTO reconciliation_links (id, invoice_id, transaction_id, reconciled_amount, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(invoice_id.to_string())
        .bind(transaction_id.to_string())
        .bind(amount.to_string())
        .bind(now.to_rfc3339())
        .execute(&mut **tx)
        .await?;

        Ok(ReconciliationLink {
            id,
            invoice_id,
            transaction_id,
            reconciled_amount: amount,
            created_at: now,
        })
    }

    pub async fn sum_links_for_invoice(&self, tx: &mut Tx, invoice_id: Uuid) -> Result<Decimal> {
        let row = sqlx::query("SELECT COALESCE(SUM(reconciled_amount), '0') as s FROM reconciliation_links WHERE invoice_id = ?")
            .bind(invoice_id.to_string())
            .fetch_one(&mut **tx)
            .await?;
        parse_decimal_column(&row, "s")
    }

    pub async fn sum_links_for_transaction(&self, tx: &mut Tx, transaction_id: Uuid) -> Result<Decimal> {
        let row = sqlx::query("SELECT COALESCE(SUM(reconciled_amount), '0') as s FROM reconciliation_links WHERE transaction_id = ?")
            .bind(transaction_id.to_string())
            .fetch_one(&mut **tx)
            .await?;
        parse_decimal_column(&row, "s")
    }

    /// §4.9 single-aggregate-read: one query for the whole id set.
    pub async fn aggregate_invoice_link_sums(&self, tx: &mut Tx, ids: &[Uuid]) -> Result<HashMap<Uuid, Decimal>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = placeholders(ids.len());
        let sql = format!(
            "SELECT invoice_id, COALESCE(SUM(reconciled_amount), '0') as s FROM reconciliation_links WHERE invoice_id IN ({placeholders}) GROUP BY invoice_id"
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.to_string());
        }
        let rows = query.fetch_all(&mut **tx).await?;
        let mut out = HashMap::new();
        for row in rows {
            let id: String = row.try_get("invoice_id")?;
            let sum = parse_decimal_column(&row, "s")?;
            out.insert(Uuid::parse_str(&id).map_err(|e| ReconciliationError::Internal(e.to_string()))?, sum);
        }
        Ok(out)
    }

    pub async fn aggregate_transaction_link_sums(&self, tx: &mut Tx, ids: &[Uuid]) -> Result<HashMap<Uuid, Decimal>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = placeholders(ids.len());
        let sql = format!(
            "SELECT transaction_id, COALESCE(SUM(reconciled_amount), '0') as s FROM reconciliation_links WHERE transaction_id IN ({placeholders}) GROUP BY transaction_id"
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.to_string());
        }
        let rows = query.fetch_all(&mut **tx).await?;
        let mut out = HashMap::new();
        for row in rows {
            let id: String = row.try_get("transaction_id")?;
            let sum = parse_decimal_column(&row, "s")?;
            out.insert(Uuid::parse_str(&id).map_err(|e| ReconciliationError::Internal(e.to_string()))?, sum);
        }
        Ok(out)
    }

    pub async fn links_for_invoice(&self, tx: &mut Tx, invoice_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT transaction_id FROM reconciliation_links WHERE invoice_id = ?")
            .bind(invoice_id.to_string())
            .fetch_all(&mut **tx)
            .await?;
        rows.into_iter()
            .map(|r| {
                let s: String = r.try_get("transaction_id")?;
                Uuid::parse_str(&s).map_err(|e| ReconciliationError::Internal(e.to_string()))
            })
            .collect()
    }

    pub async fn links_for_transaction(&self, tx: &mut Tx, transaction_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT invoice_id FROM reconciliation_links WHERE transaction_id = ?")
            .bind(transaction_id.to_string())
            .fetch_all(&mut **tx)
            .await?;
        rows.into_iter()
            .map(|r| {
                let s: String = r.try_get("invoice_id")?;
                Uuid::parse_str(&s).map_err(|e| ReconciliationError::Internal(e.to_string()))
            })
            .collect()
    }

    pub async fn delete_links_for_invoice(&self, tx: &mut Tx, invoice_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM reconciliation_links WHERE invoice_id = ?")
            .bind(invoice_id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn delete_links_for_transaction(&self, tx: &mut Tx, transaction_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM reconciliation_links WHERE transaction_id = ?")
            .bind(transaction_id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn set_invoice_paid_amount(&self, tx: &mut Tx, invoice_id: Uuid, paid: Decimal, status: PaymentStatus) -> Result<()> {
        sqlx::query("UPDATE invoices SET paid_amount = ?, payment_status = ? WHERE id = ?")
            .bind(paid.to_string())
            .bind(status_as_str(status))
            .bind(invoice_id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn set_transaction_reconciled_amount(
        &self,
        tx: &mut Tx,
        transaction_id: Uuid,
        reconciled: Decimal,
        status: ReconciliationStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE bank_transactions SET reconciled_amount = ?, reconciliation_status = ? WHERE id = ?")
            .bind(reconciled.to_string())
            .bind(reconciliation_status_as_str(status))
            .bind(transaction_id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn set_transaction_status(&self, tx: &mut Tx, transaction_id: Uuid, status: ReconciliationStatus) -> Result<()> {
        sqlx::query("UPDATE bank_transactions SET reconciliation_status = ? WHERE id = ?")
            .bind(reconciliation_status_as_str(status))
            .bind(transaction_id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Supplemented per SPEC_FULL §10.2: simple filtered listing. Runs
    /// outside any applier transaction, so it retries on its own rather
    /// than relying on a caller's `with_retry`.
    pub async fn list_links(&self, invoice_id: Option<Uuid>, transaction_id: Option<Uuid>) -> Result<Vec<ReconciliationLink>> {
        with_retry(|| self.do_list_links(invoice_id, transaction_id)).await
    }

    async fn do_list_links(&self, invoice_id: Option<Uuid>, transaction_id: Option<Uuid>) -> Result<Vec<ReconciliationLink>> {
        let rows = match (invoice_id, transaction_id) {
            (Some(i), Some(t)) => {
                sqlx::query_as::<_, ReconciliationLink>(
                    "SELECT * FROM reconciliation_links WHERE invoice_id = ? AND transaction_id = ?",
                )
                .bind(i.to_string())
                .bind(t.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            (Some(i), None) => {
                sqlx::query_as::<_, ReconciliationLink>("SELECT * FROM reconciliation_links WHERE invoice_id = ?")
                    .bind(i.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, Some(t)) => {
                sqlx::query_as::<_, ReconciliationLink>("SELECT * FROM reconciliation_links WHERE transaction_id = ?")
                    .bind(t.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, None) => {
                sqlx::query_as::<_, ReconciliationLink>("SELECT * FROM reconciliation_links")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows)
    }
}

#[async_trait]
impl CounterpartySource for Repository {
    async fn list_all_counterparties(&self) -> Result<Vec<Counterparty>> {
        Ok(sqlx::query_as::<_, Counterparty>("SELECT * FROM counterparties")
            .fetch_all(&self.pool)
            .await?)
    }
}

#[async_trait]
impl InvoiceCandidateSource for Repository {
    async fn candidates_near_residual(
        &self,
        direction: Direction,
        target: Decimal,
        counterparty_filter: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Invoice>> {
        let direction_str = direction_as_str(direction);
        let rows = if let Some(cp) = counterparty_filter {
            sqlx::query_as::<_, Invoice>(
                "SELECT *, ABS(total_amount - paid_amount - ?) as distance FROM invoices \
                 WHERE direction = ? AND payment_status != 'fully_paid' AND counterparty_id = ? \
                 ORDER BY distance ASC LIMIT ?",
            )
            .bind(target.to_string())
            .bind(direction_str)
            .bind(cp.to_string())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, Invoice>(
                "SELECT *, ABS(total_amount - paid_amount - ?) as distance FROM invoices \
                 WHERE direction = ? AND payment_status != 'fully_paid' \
                 ORDER BY distance ASC LIMIT ?",
            )
            .bind(target.to_string())
            .bind(direction_str)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows)
    }

    async fn candidates_in_range(
        &self,
        direction: Direction,
        low: Decimal,
        high: Decimal,
        counterparty_id: Uuid,
        target: Decimal,
        limit: usize,
    ) -> Result<Vec<Invoice>> {
        let rows = sqlx::query_as::<_, Invoice>(
            "SELECT *, ABS(total_amount - paid_amount - ?) as distance FROM invoices \
             WHERE direction = ? AND payment_status != 'fully_paid' AND counterparty_id = ? \
             AND (total_amount - paid_amount) > ? AND (total_amount - paid_amount) <= ? \
             ORDER BY distance ASC LIMIT ?",
        )
        .bind(target.to_string())
        .bind(direction_as_str(direction))
        .bind(counterparty_id.to_string())
        .bind(low.to_string())
        .bind(high.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl PaymentHistorySource for Repository {
    /// Trailing 3 years, capped at 5,000 rows (§4.7).
    async fn historical_payments(&self, counterparty_id: Uuid) -> Result<Vec<HistoricalPayment>> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(365 * 3)).date_naive();
        let rows = sqlx::query(
            "SELECT i.doc_date as invoice_date, t.transaction_date as payment_date, l.reconciled_amount as amount, \
                    t.description as description, i.doc_number as doc_number \
             FROM reconciliation_links l \
             JOIN invoices i ON i.id = l.invoice_id \
             JOIN bank_transactions t ON t.id = l.transaction_id \
             WHERE i.counterparty_id = ? AND i.doc_date >= ? \
             ORDER BY t.transaction_date DESC LIMIT 5000",
        )
        .bind(counterparty_id.to_string())
        .bind(cutoff.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut by_payment: HashMap<(String, String), Vec<String>> = HashMap::new();
        let mut out = Vec::new();
        for row in &rows {
            let invoice_date: String = row.try_get("invoice_date")?;
            let payment_date: String = row.try_get("payment_date")?;
            let doc_number: String = row.try_get("doc_number")?;
            by_payment
                .entry((invoice_date, payment_date))
                .or_default()
                .push(doc_number);
        }
        for row in rows {
            let invoice_date: chrono::NaiveDate = row
                .try_get::<String, _>("invoice_date")?
                .parse()
                .map_err(|_| ReconciliationError::Internal("bad invoice_date".to_string()))?;
            let payment_date: chrono::NaiveDate = row
                .try_get::<String, _>("payment_date")?
                .parse()
                .map_err(|_| ReconciliationError::Internal("bad payment_date".to_string()))?;
            let amount = parse_decimal_column(&row, "amount")?;
            let description: String = row.try_get("description")?;
            let key = (invoice_date.to_string(), payment_date.to_string());
            let related = by_payment.get(&key).cloned().unwrap_or_default();
            out.push(HistoricalPayment {
                invoice_date,
                payment_date,
                amount,
                description,
                related_doc_numbers: related,
            });
        }
        Ok(out)
    }
}

fn placeholders(count: usize) -> String {
    std::iter::repeat("?").take(count).collect::<Vec<_>>().join(", ")
}

fn parse_decimal_column(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Decimal> {
    let raw: String = row.try_get(column)?;
    raw.parse::<Decimal>()
        .map_err(|e| ReconciliationError::Internal(format!("invalid decimal column {column}: {e}")))
}

fn direction_as_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Outgoing => "outgoing",
        Direction::Incoming => "incoming",
    }
}

fn status_as_str(status: PaymentStatus) -> &'static str {
    match status {
        PaymentStatus::Open => "open",
        PaymentStatus::Overdue => "overdue",
        PaymentStatus::PartiallyPaid => "partially_paid",
        PaymentStatus::FullyPaid => "fully_paid",
    }
}

fn reconciliation_status_as_str(status: ReconciliationStatus) -> &'static str {
    match status {
        ReconciliationStatus::Unreconciled => "unreconciled",
        ReconciliationStatus::PartiallyReconciled => "partially_reconciled",
        ReconciliationStatus::FullyReconciled => "fully_reconciled",
        ReconciliationStatus::ExcessReconciled => "excess_reconciled",
        ReconciliationStatus::Ignored => "ignored",
    }
}
