//! C8: link applier & state reducer. Manual and batch reconciliation
//! primitives, all validate-then-mutate under a single transaction.
//! Grounded on the teacher's `atomic/controller.rs` (pre-flight checks
//! before any write, rollback-on-failure) and `atomic/operation.rs` (the
//! start/checkpoint/commit/rollback state machine each mutation goes
//! through); the per-pair outcome vector returned by the batch methods
//! here has no counterpart in the teacher and is built from spec.md's
//! own batch-reporting contract.

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::errors::{ReconciliationError, Result};
use crate::models::{
    BankTransaction, Direction, Invoice, PaymentStatus, ReconciliationLink, ReconciliationStatus, EPSILON,
};
use crate::repository::Repository;
use crate::retry::with_retry;

#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub invoice_id: Uuid,
    pub transaction_id: Uuid,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub invoice_id: Uuid,
    pub transaction_id: Uuid,
    pub success: bool,
    pub message: String,
}

pub struct LinkApplier {
    repository: Repository,
}

impl LinkApplier {
    pub fn new(repository: Repository) -> Self {
        LinkApplier { repository }
    }

    /// §4.8 manual application primitive. The whole begin-validate-mutate-
    /// commit sequence is retried on a transient SQL conflict (§5), since a
    /// partially-run transaction can't be resumed — only restarted.
    pub async fn apply_match(&self, request: ApplyRequest) -> Result<ReconciliationLink> {
        with_retry(|| self.do_apply_match(request.clone())).await
    }

    async fn do_apply_match(&self, request: ApplyRequest) -> Result<ReconciliationLink> {
        let mut tx = self.repository.begin().await?;

        let invoice = self.repository.get_invoice(&mut tx, request.invoice_id).await?;
        let transaction = self.repository.get_transaction(&mut tx, request.transaction_id).await?;

        validate_preflight(&invoice, &transaction, request.amount)?;

        let link = self
            .repository
            .upsert_link(&mut tx, request.invoice_id, request.transaction_id, request.amount)
            .await?;

        self.recompute_and_persist(&mut tx, request.invoice_id, request.transaction_id).await?;

        self.repository.commit(tx).await?;
        Ok(link)
    }

    /// §4.8 batch application: one transaction, per-pair status vector. A
    /// validation failure on one pair rolls the whole batch back but still
    /// reports a per-pair outcome vector — it fails the failing pair,
    /// leaves the rest marked not-attempted, and returns `Ok`, matching the
    /// "report a per-pair status vector" contract (spec.md §4.8). Only a
    /// genuine (transient) SQL error propagates as `Err`, and the whole
    /// sequence is retried from scratch in that case.
    pub async fn apply_batch(&self, requests: Vec<ApplyRequest>) -> Result<Vec<ApplyOutcome>> {
        with_retry(|| self.do_apply_batch(&requests)).await
    }

    async fn do_apply_batch(&self, requests: &[ApplyRequest]) -> Result<Vec<ApplyOutcome>> {
        let mut tx = self.repository.begin().await?;
        let mut outcomes = Vec::with_capacity(requests.len());

        for (index, request) in requests.iter().enumerate() {
            let step = async {
                let invoice = self.repository.get_invoice(&mut tx, request.invoice_id).await?;
                let transaction = self.repository.get_transaction(&mut tx, request.transaction_id).await?;
                validate_preflight(&invoice, &transaction, request.amount)?;
                self.repository
                    .upsert_link(&mut tx, request.invoice_id, request.transaction_id, request.amount)
                    .await?;
                self.recompute_and_persist(&mut tx, request.invoice_id, request.transaction_id).await
            }
            .await;

            match step {
                Ok(()) => outcomes.push(ApplyOutcome {
                    invoice_id: request.invoice_id,
                    transaction_id: request.transaction_id,
                    success: true,
                    message: "applied".to_string(),
                }),
                Err(e) if e.is_transient_sql() => {
                    self.repository.rollback(tx).await?;
                    return Err(e);
                }
                Err(e) => {
                    outcomes.push(ApplyOutcome {
                        invoice_id: request.invoice_id,
                        transaction_id: request.transaction_id,
                        success: false,
                        message: e.to_string(),
                    });
                    for remaining in &requests[index + 1..] {
                        outcomes.push(ApplyOutcome {
                            invoice_id: remaining.invoice_id,
                            transaction_id: remaining.transaction_id,
                            success: false,
                            message: "not attempted: batch aborted by an earlier failure".to_string(),
                        });
                    }
                    self.repository.rollback(tx).await?;
                    return Ok(outcomes);
                }
            }
        }

        self.repository.commit(tx).await?;
        Ok(outcomes)
    }

    /// §4.8 set-balanced N:M materialization: transactions ascending by
    /// absolute residual, invoices ascending by residual, greedily
    /// distributed to minimize leftover fragments. Rolled back unless every
    /// produced link validates.
    pub async fn auto_reconcile(
        &self,
        transaction_ids: Vec<Uuid>,
        invoice_ids: Vec<Uuid>,
    ) -> Result<Vec<ApplyOutcome>> {
        with_retry(|| self.do_auto_reconcile(transaction_ids.clone(), invoice_ids.clone())).await
    }

    async fn do_auto_reconcile(&self, transaction_ids: Vec<Uuid>, invoice_ids: Vec<Uuid>) -> Result<Vec<ApplyOutcome>> {
        let mut tx = self.repository.begin().await?;

        let mut transactions = Vec::new();
        for id in &transaction_ids {
            transactions.push(self.repository.get_transaction(&mut tx, *id).await?);
        }
        let mut invoices = Vec::new();
        for id in &invoice_ids {
            invoices.push(self.repository.get_invoice(&mut tx, *id).await?);
        }

        transactions.sort_by_key(|t: &BankTransaction| t.residual().abs());
        invoices.sort_by_key(|i: &Invoice| i.residual());

        let total_transactions: Decimal = transactions.iter().map(|t| t.residual().abs()).sum();
        let total_invoices: Decimal = invoices.iter().map(|i| i.residual()).sum();
        if (total_transactions - total_invoices).abs() > EPSILON {
            self.repository.rollback(tx).await?;
            return Err(ReconciliationError::Validation(format!(
                "set does not balance within epsilon: transactions={} invoices={}",
                total_transactions, total_invoices
            )));
        }

        let mut invoice_remaining: Vec<Decimal> = invoices.iter().map(|i| i.residual()).collect();
        let mut outcomes = Vec::new();

        for transaction in &transactions {
            let mut remaining = transaction.residual().abs();
            for (idx, invoice) in invoices.iter().enumerate() {
                if remaining <= EPSILON {
                    break;
                }
                if invoice_remaining[idx] <= EPSILON {
                    continue;
                }
                let amount = remaining.min(invoice_remaining[idx]);

                if let Err(e) = validate_preflight(invoice, transaction, amount) {
                    self.repository.rollback(tx).await?;
                    return Err(e);
                }

                self.repository
                    .upsert_link(&mut tx, invoice.id, transaction.id, amount)
                    .await?;
                self.recompute_and_persist(&mut tx, invoice.id, transaction.id).await?;

                invoice_remaining[idx] -= amount;
                remaining -= amount;

                outcomes.push(ApplyOutcome {
                    invoice_id: invoice.id,
                    transaction_id: transaction.id,
                    success: true,
                    message: "auto-reconciled".to_string(),
                });
            }
        }

        self.repository.commit(tx).await?;
        Ok(outcomes)
    }

    /// §4.8: marking a transaction Ignored removes all its links first
    /// (propagating recomputation to affected invoices), then sets the
    /// transaction to Ignored.
    pub async fn ignore_transaction(&self, transaction_id: Uuid) -> Result<()> {
        with_retry(|| self.do_ignore_transaction(transaction_id)).await
    }

    async fn do_ignore_transaction(&self, transaction_id: Uuid) -> Result<()> {
        let mut tx = self.repository.begin().await?;
        let invoice_ids = self.repository.links_for_transaction(&mut tx, transaction_id).await?;

        self.repository.delete_links_for_transaction(&mut tx, transaction_id).await?;
        for invoice_id in invoice_ids {
            self.recompute_invoice(&mut tx, invoice_id).await?;
        }

        self.repository
            .set_transaction_status(&mut tx, transaction_id, ReconciliationStatus::Ignored)
            .await?;

        self.repository.commit(tx).await?;
        Ok(())
    }

    pub async fn unignore_transaction(&self, transaction_id: Uuid) -> Result<()> {
        with_retry(|| self.do_unignore_transaction(transaction_id)).await
    }

    async fn do_unignore_transaction(&self, transaction_id: Uuid) -> Result<()> {
        let mut tx = self.repository.begin().await?;
        self.recompute_transaction(&mut tx, transaction_id).await?;
        self.repository.commit(tx).await?;
        Ok(())
    }

    /// §4.8: removes all links of the anchor and recomputes all touched
    /// items.
    pub async fn undo_reconciliation(&self, invoice_id: Option<Uuid>, transaction_id: Option<Uuid>) -> Result<()> {
        with_retry(|| self.do_undo_reconciliation(invoice_id, transaction_id)).await
    }

    async fn do_undo_reconciliation(&self, invoice_id: Option<Uuid>, transaction_id: Option<Uuid>) -> Result<()> {
        let mut tx = self.repository.begin().await?;

        if let Some(id) = invoice_id {
            let transaction_ids = self.repository.links_for_invoice(&mut tx, id).await?;
            self.repository.delete_links_for_invoice(&mut tx, id).await?;
            self.recompute_invoice(&mut tx, id).await?;
            for tid in transaction_ids {
                self.recompute_transaction(&mut tx, tid).await?;
            }
        }
        if let Some(id) = transaction_id {
            let invoice_ids = self.repository.links_for_transaction(&mut tx, id).await?;
            self.repository.delete_links_for_transaction(&mut tx, id).await?;
            self.recompute_transaction(&mut tx, id).await?;
            for iid in invoice_ids {
                self.recompute_invoice(&mut tx, iid).await?;
            }
        }

        self.repository.commit(tx).await?;
        Ok(())
    }

    /// Read-only pre-flight check, supplemented per SPEC_FULL §10.2.
    pub async fn validate_match(&self, request: &ApplyRequest) -> Result<()> {
        let mut tx = self.repository.begin().await?;
        let invoice = self.repository.get_invoice(&mut tx, request.invoice_id).await?;
        let transaction = self.repository.get_transaction(&mut tx, request.transaction_id).await?;
        self.repository.rollback(tx).await?;
        validate_preflight(&invoice, &transaction, request.amount)
    }

    async fn recompute_and_persist(
        &self,
        tx: &mut crate::repository::Tx,
        invoice_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<()> {
        self.recompute_invoice(tx, invoice_id).await?;
        self.recompute_transaction(tx, transaction_id).await?;
        Ok(())
    }

    async fn recompute_invoice(&self, tx: &mut crate::repository::Tx, invoice_id: Uuid) -> Result<()> {
        let invoice = self.repository.get_invoice(tx, invoice_id).await?;
        let linked = self.repository.sum_links_for_invoice(tx, invoice_id).await?;
        let status = invoice_status_for(linked, invoice.total_amount, invoice.due_date);
        self.repository.set_invoice_paid_amount(tx, invoice_id, linked, status).await
    }

    async fn recompute_transaction(&self, tx: &mut crate::repository::Tx, transaction_id: Uuid) -> Result<()> {
        let transaction = self.repository.get_transaction(tx, transaction_id).await?;
        if transaction.reconciliation_status == ReconciliationStatus::Ignored {
            return Ok(());
        }
        let linked = self.repository.sum_links_for_transaction(tx, transaction_id).await?;
        let status = transaction_status_for(linked, transaction.amount.abs());
        self.repository
            .set_transaction_reconciled_amount(tx, transaction_id, linked, status)
            .await
    }
}

fn validate_preflight(invoice: &Invoice, transaction: &BankTransaction, amount: Decimal) -> Result<()> {
    let expected_direction = transaction.direction_for_match();
    if invoice.direction != expected_direction {
        return Err(ReconciliationError::DirectionMismatch {
            invoice_id: invoice.id,
            direction: format!("{:?}", expected_direction),
        });
    }

    if invoice.payment_status == PaymentStatus::FullyPaid {
        return Err(ReconciliationError::InvoiceTerminal {
            invoice_id: invoice.id,
            status: format!("{:?}", invoice.payment_status),
        });
    }
    if matches!(
        transaction.reconciliation_status,
        ReconciliationStatus::FullyReconciled | ReconciliationStatus::ExcessReconciled | ReconciliationStatus::Ignored
    ) {
        return Err(ReconciliationError::TransactionTerminal {
            transaction_id: transaction.id,
            status: format!("{:?}", transaction.reconciliation_status),
        });
    }

    if amount <= Decimal::ZERO {
        return Err(ReconciliationError::NonPositiveAmount(amount));
    }
    let invoice_residual = invoice.residual();
    if amount > invoice_residual + EPSILON {
        return Err(ReconciliationError::ExceedsInvoiceResidual {
            amount,
            residual: invoice_residual,
        });
    }
    let transaction_residual = transaction.residual().abs();
    if amount > transaction_residual + EPSILON {
        return Err(ReconciliationError::ExceedsTransactionResidual {
            amount,
            residual: transaction_residual,
        });
    }

    Ok(())
}

/// §4.8 invoice status recomputation rules. Shared with C9's batch
/// recomputation so both paths apply the exact same thresholds.
pub(crate) fn invoice_status_for(linked: Decimal, total: Decimal, due_date: Option<chrono::NaiveDate>) -> PaymentStatus {
    if linked <= EPSILON / Decimal::from(2) {
        return match due_date {
            Some(due) if due < Utc::now().date_naive() => PaymentStatus::Overdue,
            _ => PaymentStatus::Open,
        };
    }
    if (linked - total).abs() <= EPSILON {
        return PaymentStatus::FullyPaid;
    }
    PaymentStatus::PartiallyPaid
}

/// §4.8 transaction status recomputation rules.
pub(crate) fn transaction_status_for(linked: Decimal, amount_abs: Decimal) -> ReconciliationStatus {
    if linked <= EPSILON / Decimal::from(2) {
        return ReconciliationStatus::Unreconciled;
    }
    if linked > amount_abs + EPSILON {
        return ReconciliationStatus::ExcessReconciled;
    }
    if (linked - amount_abs).abs() <= EPSILON {
        return ReconciliationStatus::FullyReconciled;
    }
    ReconciliationStatus::PartiallyReconciled
}
