//! C9: batch state processor. Set-based status recomputation after bulk
//! link changes (import, bulk undo): one aggregate read per entity kind,
//! classify in memory, write back only the rows whose computed status
//! actually changed. Grounded on the teacher's `atomic/checkpoint.rs`
//! set-oriented bookkeeping and spec.md §4.9's "O(1) queries regardless of
//! set size" design.

use uuid::Uuid;

use crate::applier::{invoice_status_for, transaction_status_for};
use crate::errors::Result;
use crate::models::ReconciliationStatus;
use crate::repository::Repository;

#[derive(Debug, Default, Clone, Copy)]
pub struct BatchRecomputeSummary {
    pub invoices_examined: usize,
    pub invoices_updated: usize,
    pub transactions_examined: usize,
    pub transactions_updated: usize,
}

pub struct BatchProcessor {
    repository: Repository,
}

impl BatchProcessor {
    pub fn new(repository: Repository) -> Self {
        BatchProcessor { repository }
    }

    /// Recomputes status for exactly the given invoice/transaction ids in
    /// two aggregate passes, independent of how many links moved.
    pub async fn recompute(&self, invoice_ids: &[Uuid], transaction_ids: &[Uuid]) -> Result<BatchRecomputeSummary> {
        let mut summary = BatchRecomputeSummary::default();

        if !invoice_ids.is_empty() {
            let mut tx = self.repository.begin().await?;
            let invoices = self.repository.get_invoices_batch(&mut tx, invoice_ids).await?;
            let sums = self.repository.aggregate_invoice_link_sums(&mut tx, invoice_ids).await?;

            summary.invoices_examined = invoices.len();
            for invoice in invoices {
                let linked = sums.get(&invoice.id).copied().unwrap_or_default();
                let computed = invoice_status_for(linked, invoice.total_amount, invoice.due_date);
                if computed != invoice.payment_status {
                    self.repository
                        .set_invoice_paid_amount(&mut tx, invoice.id, linked, computed)
                        .await?;
                    summary.invoices_updated += 1;
                }
            }
            self.repository.commit(tx).await?;
        }

        if !transaction_ids.is_empty() {
            let mut tx = self.repository.begin().await?;
            let transactions = self.repository.get_transactions_batch(&mut tx, transaction_ids).await?;
            let sums = self.repository.aggregate_transaction_link_sums(&mut tx, transaction_ids).await?;

            summary.transactions_examined = transactions.len();
            for transaction in transactions {
                if transaction.reconciliation_status == ReconciliationStatus::Ignored {
                    continue;
                }
                let linked = sums.get(&transaction.id).copied().unwrap_or_default();
                let computed = transaction_status_for(linked, transaction.amount.abs());
                if computed != transaction.reconciliation_status {
                    self.repository
                        .set_transaction_reconciled_amount(&mut tx, transaction.id, linked, computed)
                        .await?;
                    summary.transactions_updated += 1;
                }
            }
            self.repository.commit(tx).await?;
        }

        Ok(summary)
    }
}
