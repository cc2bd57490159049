mod support;

use chrono::NaiveDate;
use proptest::prelude::*;
use reconciliation_engine::applier::{ApplyRequest, LinkApplier};
use reconciliation_engine::batch::BatchProcessor;
use reconciliation_engine::models::{Direction, PaymentStatus, ReconciliationStatus};
use reconciliation_engine::numeric::{invoice_hash, quantize, transaction_hash, within_epsilon};
use rust_decimal::Decimal;
use support::*;

proptest! {
    /// Quantizing twice is the same as quantizing once.
    #[test]
    fn quantize_is_idempotent(cents in -1_000_000_000i64..1_000_000_000i64) {
        let value = Decimal::new(cents, 2);
        let once = quantize(value, 2);
        let twice = quantize(once, 2);
        prop_assert_eq!(once, twice);
    }

    /// Epsilon comparison is symmetric regardless of argument order.
    #[test]
    fn epsilon_comparison_is_symmetric(a_cents in -1_000_000i64..1_000_000i64, b_cents in -1_000_000i64..1_000_000i64) {
        let a = Decimal::new(a_cents, 2);
        let b = Decimal::new(b_cents, 2);
        prop_assert_eq!(within_epsilon(a, b), within_epsilon(b, a));
    }

    /// Hashing the same normalized invoice fields twice always yields the
    /// same digest.
    #[test]
    fn invoice_hash_is_stable(
        doc_number in "[A-Z0-9]{1,10}",
        year in 2020i32..2030i32,
        month in 1u32..13u32,
        day in 1u32..28u32,
    ) {
        let date = NaiveDate::from_ymd_opt(year, month, day).unwrap();
        let first = invoice_hash("12345678901", "09876543210", "TD01", &doc_number, date);
        let second = invoice_hash("12345678901", "09876543210", "TD01", &doc_number, date);
        prop_assert_eq!(first, second);
    }

    /// Hashing the same normalized transaction fields twice always yields
    /// the same digest.
    #[test]
    fn transaction_hash_is_stable(
        cents in -1_000_000i64..1_000_000i64,
        description in ".{0,50}",
        year in 2020i32..2030i32,
        month in 1u32..13u32,
        day in 1u32..28u32,
    ) {
        let date = NaiveDate::from_ymd_opt(year, month, day).unwrap();
        let amount = Decimal::new(cents, 2);
        let first = transaction_hash(date, amount, &description);
        let second = transaction_hash(date, amount, &description);
        prop_assert_eq!(first, second);
    }
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Law: applying a partial payment never lets paid_amount exceed
/// total_amount, and never lets reconciled_amount exceed the transaction's
/// own amount, beyond epsilon, across a range of split amounts.
#[tokio::test]
async fn paid_and_reconciled_amounts_never_exceed_their_totals() {
    for split_cents in [1000i64, 2500, 5000, 7500, 9999] {
        let pool = test_pool().await;
        let cp = insert_counterparty(&pool, "ROSSI SRL", None).await;
        let invoice_id = insert_invoice(
            &pool,
            cp,
            Direction::Outgoing,
            "1",
            day(2024, 1, 1),
            Decimal::new(10000, 2),
            Decimal::ZERO,
            PaymentStatus::Open,
        )
        .await;
        let transaction_id = insert_transaction(
            &pool,
            day(2024, 1, 5),
            Decimal::new(10000, 2),
            "Bonifico",
            Decimal::ZERO,
            ReconciliationStatus::Unreconciled,
        )
        .await;

        let applier = LinkApplier::new(repository(pool.clone()));
        applier
            .apply_match(ApplyRequest {
                invoice_id,
                transaction_id,
                amount: Decimal::new(split_cents, 2),
            })
            .await
            .unwrap();

        let remaining = Decimal::new(10000 - split_cents, 2);
        if remaining > Decimal::ZERO {
            applier
                .apply_match(ApplyRequest {
                    invoice_id,
                    transaction_id,
                    amount: remaining,
                })
                .await
                .unwrap();
        }

        let invoice: (String, String) = sqlx::query_as("SELECT paid_amount, payment_status FROM invoices WHERE id = ?")
            .bind(invoice_id.to_string())
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(invoice.0, "100.00");
        assert_eq!(invoice.1, "fully_paid");

        let transaction: (String, String) =
            sqlx::query_as("SELECT reconciled_amount, reconciliation_status FROM bank_transactions WHERE id = ?")
                .bind(transaction_id.to_string())
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(transaction.0, "100.00");
        assert_eq!(transaction.1, "fully_reconciled");
    }
}

/// Law: apply then undo restores both sides to their pre-apply state.
#[tokio::test]
async fn apply_then_undo_round_trips_to_original_state() {
    let pool = test_pool().await;
    let cp = insert_counterparty(&pool, "ROSSI SRL", None).await;
    let invoice_id = insert_invoice(
        &pool,
        cp,
        Direction::Outgoing,
        "1",
        day(2024, 1, 1),
        Decimal::new(10000, 2),
        Decimal::ZERO,
        PaymentStatus::Open,
    )
    .await;
    let transaction_id = insert_transaction(
        &pool,
        day(2024, 1, 5),
        Decimal::new(10000, 2),
        "Bonifico",
        Decimal::ZERO,
        ReconciliationStatus::Unreconciled,
    )
    .await;

    let applier = LinkApplier::new(repository(pool.clone()));
    applier
        .apply_match(ApplyRequest {
            invoice_id,
            transaction_id,
            amount: Decimal::new(10000, 2),
        })
        .await
        .unwrap();

    applier
        .undo_reconciliation(Some(invoice_id), Some(transaction_id))
        .await
        .unwrap();

    let invoice: (String, String) = sqlx::query_as("SELECT paid_amount, payment_status FROM invoices WHERE id = ?")
        .bind(invoice_id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(invoice.0, "0");
    assert_eq!(invoice.1, "open");

    let transaction: (String, String) =
        sqlx::query_as("SELECT reconciled_amount, reconciliation_status FROM bank_transactions WHERE id = ?")
            .bind(transaction_id.to_string())
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(transaction.0, "0");
    assert_eq!(transaction.1, "unreconciled");

    let links: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reconciliation_links")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(links.0, 0);
}

/// Law: recomputing status for a set that is already consistent with its
/// links is a no-op — running it twice updates nothing the second time.
#[tokio::test]
async fn status_recomputation_is_idempotent() {
    let pool = test_pool().await;
    let cp = insert_counterparty(&pool, "ROSSI SRL", None).await;
    let invoice_id = insert_invoice(
        &pool,
        cp,
        Direction::Outgoing,
        "1",
        day(2024, 1, 1),
        Decimal::new(10000, 2),
        Decimal::ZERO,
        PaymentStatus::Open,
    )
    .await;
    let transaction_id = insert_transaction(
        &pool,
        day(2024, 1, 5),
        Decimal::new(10000, 2),
        "Bonifico",
        Decimal::ZERO,
        ReconciliationStatus::Unreconciled,
    )
    .await;

    let applier = LinkApplier::new(repository(pool.clone()));
    applier
        .apply_match(ApplyRequest {
            invoice_id,
            transaction_id,
            amount: Decimal::new(6000, 2),
        })
        .await
        .unwrap();

    let batch = BatchProcessor::new(repository(pool.clone()));
    let first = batch.recompute(&[invoice_id], &[transaction_id]).await.unwrap();
    assert_eq!(first.invoices_updated, 0);
    assert_eq!(first.transactions_updated, 0);

    let second = batch.recompute(&[invoice_id], &[transaction_id]).await.unwrap();
    assert_eq!(second.invoices_examined, 1);
    assert_eq!(second.invoices_updated, 0);
    assert_eq!(second.transactions_updated, 0);
}
