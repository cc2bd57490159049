mod support;

use chrono::NaiveDate;
use reconciliation_engine::applier::{ApplyRequest, LinkApplier};
use reconciliation_engine::cache::AnagraphicsCache;
use reconciliation_engine::config::{CacheConfig, MatchConfig, PatternConfig, SearchConfig};
use reconciliation_engine::errors::ReconciliationError;
use reconciliation_engine::models::{ConfidenceBand, Direction, PaymentStatus, ReconciliationStatus};
use reconciliation_engine::pattern::PatternStore;
use reconciliation_engine::resolver::CounterpartyResolver;
use reconciliation_engine::suggestion::{MatchType, SuggestionEngine};
use rust_decimal::Decimal;
use std::sync::Arc;
use support::*;

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// S1: a full single payment fully reconciles both sides.
#[tokio::test]
async fn s1_full_single_payment_fully_reconciles_both_sides() {
    let pool = test_pool().await;
    let cp = insert_counterparty(&pool, "ROSSI SRL", Some("01234567890")).await;
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
        "Bonifico saldo fattura",
        Decimal::ZERO,
        ReconciliationStatus::Unreconciled,
    )
    .await;

    let applier = LinkApplier::new(repository(pool.clone()));
    let link = applier
        .apply_match(ApplyRequest {
            invoice_id,
            transaction_id,
            amount: Decimal::new(10000, 2),
        })
        .await
        .unwrap();
    assert_eq!(link.reconciled_amount, Decimal::new(10000, 2));

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

/// S2: two partial applications merge into one fully-paid link.
#[tokio::test]
async fn s2_two_partial_applications_merge_to_full() {
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
        "Bonifico parziale",
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

    let mid: (String, String) = sqlx::query_as("SELECT paid_amount, payment_status FROM invoices WHERE id = ?")
        .bind(invoice_id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(mid.0, "60.00");
    assert_eq!(mid.1, "partially_paid");

    let link = applier
        .apply_match(ApplyRequest {
            invoice_id,
            transaction_id,
            amount: Decimal::new(4000, 2),
        })
        .await
        .unwrap();
    assert_eq!(link.reconciled_amount, Decimal::new(10000, 2));

    let end: (String, String) = sqlx::query_as("SELECT paid_amount, payment_status FROM invoices WHERE id = ?")
        .bind(invoice_id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(end.0, "100.00");
    assert_eq!(end.1, "fully_paid");
}

/// S4: an amount exceeding the transaction's residual is rejected before
/// any write happens.
#[tokio::test]
async fn s4_amount_exceeding_transaction_residual_is_rejected() {
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
        Decimal::new(5000, 2),
        "Bonifico",
        Decimal::ZERO,
        ReconciliationStatus::Unreconciled,
    )
    .await;

    let applier = LinkApplier::new(repository(pool.clone()));
    let err = applier
        .apply_match(ApplyRequest {
            invoice_id,
            transaction_id,
            amount: Decimal::new(8000, 2),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ReconciliationError::ExceedsTransactionResidual { .. }));

    let invoice: (String,) = sqlx::query_as("SELECT paid_amount FROM invoices WHERE id = ?")
        .bind(invoice_id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(invoice.0, "0");
}

/// S5: ignoring a transaction removes its links and invoices revert.
#[tokio::test]
async fn s5_ignoring_a_transaction_removes_links_and_reverts_invoices() {
    let pool = test_pool().await;
    let cp = insert_counterparty(&pool, "ROSSI SRL", None).await;
    let invoice_a = insert_invoice(
        &pool,
        cp,
        Direction::Outgoing,
        "1",
        day(2024, 1, 1),
        Decimal::new(7000, 2),
        Decimal::ZERO,
        PaymentStatus::Open,
    )
    .await;
    let invoice_b = insert_invoice(
        &pool,
        cp,
        Direction::Outgoing,
        "2",
        day(2024, 1, 1),
        Decimal::new(3000, 2),
        Decimal::ZERO,
        PaymentStatus::Open,
    )
    .await;
    let transaction_id = insert_transaction(
        &pool,
        day(2024, 1, 5),
        Decimal::new(10000, 2),
        "Bonifico due fatture",
        Decimal::ZERO,
        ReconciliationStatus::Unreconciled,
    )
    .await;

    let applier = LinkApplier::new(repository(pool.clone()));
    applier
        .apply_match(ApplyRequest {
            invoice_id: invoice_a,
            transaction_id,
            amount: Decimal::new(7000, 2),
        })
        .await
        .unwrap();
    applier
        .apply_match(ApplyRequest {
            invoice_id: invoice_b,
            transaction_id,
            amount: Decimal::new(3000, 2),
        })
        .await
        .unwrap();

    applier.ignore_transaction(transaction_id).await.unwrap();

    let a: (String, String) = sqlx::query_as("SELECT paid_amount, payment_status FROM invoices WHERE id = ?")
        .bind(invoice_a.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(a.0, "0");
    assert_eq!(a.1, "open");

    let transaction: (String,) = sqlx::query_as("SELECT reconciliation_status FROM bank_transactions WHERE id = ?")
        .bind(transaction_id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(transaction.0, "ignored");

    let links: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reconciliation_links WHERE transaction_id = ?")
        .bind(transaction_id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(links.0, 0);
}

/// S6: the resolver finds the counterparty from a free-text description.
#[tokio::test]
async fn s6_resolver_finds_counterparty_from_description() {
    let pool = test_pool().await;
    let cp = insert_counterparty(&pool, "ROSSI SRL", None).await;

    let repo = Arc::new(repository(pool));
    let cache = Arc::new(AnagraphicsCache::new(repo, reconciliation_engine::config::CacheConfig {
        ttl_minutes: 15,
        max_size: 10_000,
        eviction_pct: 0.2,
    }));
    let resolver = CounterpartyResolver::new(cache, std::time::Duration::from_secs(60));

    let resolved = resolver.resolve("Bonifico fatt. 2024/123 ROSSI SRL").await;
    assert_eq!(resolved, Some(cp));
}

/// S3: three invoices with residuals 30/40/30 and consecutive doc numbers
/// are offered back as a single size-3 combination at High confidence.
#[tokio::test]
async fn s3_three_invoice_combination_suggested_at_high_confidence() {
    let pool = test_pool().await;
    let cp = insert_counterparty(&pool, "ROSSI SRL", None).await;
    for (doc_number, amount) in [("100", 3000i64), ("101", 4000i64), ("102", 3000i64)] {
        insert_invoice(
            &pool,
            cp,
            Direction::Outgoing,
            doc_number,
            day(2024, 1, 1),
            Decimal::new(amount, 2),
            Decimal::ZERO,
            PaymentStatus::Open,
        )
        .await;
    }
    let transaction_id = insert_transaction(
        &pool,
        day(2024, 1, 5),
        Decimal::new(10000, 2),
        "Bonifico saldo fatture 100-102",
        Decimal::ZERO,
        ReconciliationStatus::Unreconciled,
    )
    .await;
    let transaction: reconciliation_engine::models::BankTransaction =
        sqlx::query_as("SELECT * FROM bank_transactions WHERE id = ?")
            .bind(transaction_id.to_string())
            .fetch_one(&pool)
            .await
            .unwrap();

    let repo = Arc::new(repository(pool));
    let cache = Arc::new(AnagraphicsCache::new(
        repo.clone(),
        CacheConfig {
            ttl_minutes: 15,
            max_size: 10_000,
            eviction_pct: 0.2,
        },
    ));
    let resolver = Arc::new(CounterpartyResolver::new(cache, std::time::Duration::from_secs(60)));
    let patterns = Arc::new(PatternStore::new(PatternConfig {
        min_records: 5,
        ttl_hours: 2,
        max_size: 10_000,
        eviction_pct: 0.2,
    }));
    let engine = SuggestionEngine::new(
        repo,
        resolver,
        patterns,
        MatchConfig {
            min_confidence: 0.15,
            high_confidence: 0.6,
        },
        SearchConfig {
            max_combination_size: 5,
            max_wallclock_ms: 5_000,
        },
        2,
    );

    let suggestions = engine.suggest_n_to_m(&transaction, Some(cp)).await;
    let combo = suggestions
        .iter()
        .find(|s| s.invoice_ids.len() == 3 && s.match_type == MatchType::NToM)
        .expect("a size-3 combination is suggested");
    assert_eq!(combo.proposed_amount, Decimal::new(10000, 2));
    assert_eq!(combo.confidence_band, ConfidenceBand::High);
}
