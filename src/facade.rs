//! C10: orchestration façade. The only surface the HTTP adapter consumes.
//! Grounded on the teacher's `orchestrator.rs` public API shape and
//! `main.rs` wiring of its subsystems into one struct.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::applier::{ApplyOutcome, ApplyRequest, LinkApplier};
use crate::batch::BatchProcessor;
use crate::cache::AnagraphicsCache;
use crate::config::Config;
use crate::database::DbPool;
use crate::errors::{ErrorKind, Result};
use crate::models::ReconciliationLink;
use crate::pattern::PatternStore;
use crate::repository::Repository;
use crate::resolver::CounterpartyResolver;
use crate::suggestion::{Suggestion, SuggestionEngine};

#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl<T: Serialize> Envelope<T> {
    fn ok(data: T) -> Self {
        Envelope {
            success: true,
            message: "ok".to_string(),
            data: Some(data),
            error: None,
        }
    }

    fn err(e: &crate::errors::ReconciliationError) -> Self {
        Envelope {
            success: false,
            message: e.to_string(),
            data: None,
            error: Some(e.kind()),
        }
    }
}

fn wrap<T: Serialize>(result: Result<T>) -> Envelope<T> {
    match result {
        Ok(v) => Envelope::ok(v),
        Err(e) => Envelope::err(&e),
    }
}

pub struct ReconciliationFacade {
    repository: Repository,
    cache: Arc<AnagraphicsCache>,
    resolver: Arc<CounterpartyResolver>,
    patterns: Arc<PatternStore>,
    suggestions: SuggestionEngine,
    applier: LinkApplier,
    batch: BatchProcessor,
}

impl ReconciliationFacade {
    pub fn new(pool: DbPool, config: Config) -> Arc<Self> {
        let repository = Repository::new(pool);

        let cache = Arc::new(AnagraphicsCache::with_memory_limit(
            Arc::new(repository.clone()),
            config.cache.clone(),
            config.engine.memory_limit_mb,
        ));
        let resolver = Arc::new(CounterpartyResolver::new(
            Arc::clone(&cache),
            Duration::from_secs(config.cache.ttl_minutes * 60),
        ));
        let patterns = Arc::new(PatternStore::with_source(
            config.pattern.clone(),
            Arc::new(repository.clone()),
        ));

        let suggestions = SuggestionEngine::new(
            Arc::new(repository.clone()),
            Arc::clone(&resolver),
            Arc::clone(&patterns),
            config.matching.clone(),
            config.search.clone(),
            config.engine.workers,
        );
        let applier = LinkApplier::new(repository.clone());
        let batch = BatchProcessor::new(repository.clone());

        Arc::new(ReconciliationFacade {
            repository,
            cache,
            resolver,
            patterns,
            suggestions,
            applier,
            batch,
        })
    }

    pub async fn get_suggestions_1_to_1(
        &self,
        transaction_id: Uuid,
        counterparty_filter: Option<Uuid>,
    ) -> Envelope<Vec<Suggestion>> {
        let mut tx = match self.repository.begin().await {
            Ok(tx) => tx,
            Err(e) => return Envelope::err(&e),
        };
        let transaction = match self.repository.get_transaction(&mut tx, transaction_id).await {
            Ok(t) => t,
            Err(e) => {
                let _ = self.repository.rollback(tx).await;
                return Envelope::err(&e);
            }
        };
        let _ = self.repository.rollback(tx).await;

        let suggestions = self.suggestions.suggest_1_to_1(&transaction, counterparty_filter).await;
        Envelope::ok(suggestions)
    }

    pub async fn get_suggestions_n_to_m(
        &self,
        transaction_id: Uuid,
        counterparty_filter: Option<Uuid>,
    ) -> Envelope<Vec<Suggestion>> {
        let mut tx = match self.repository.begin().await {
            Ok(tx) => tx,
            Err(e) => return Envelope::err(&e),
        };
        let transaction = match self.repository.get_transaction(&mut tx, transaction_id).await {
            Ok(t) => t,
            Err(e) => {
                let _ = self.repository.rollback(tx).await;
                return Envelope::err(&e);
            }
        };
        let _ = self.repository.rollback(tx).await;

        let suggestions = self.suggestions.suggest_n_to_m(&transaction, counterparty_filter).await;
        Envelope::ok(suggestions)
    }

    pub async fn apply_match(&self, invoice_id: Uuid, transaction_id: Uuid, amount: Decimal) -> Envelope<ReconciliationLink> {
        let request = ApplyRequest {
            invoice_id,
            transaction_id,
            amount,
        };
        let result = self.applier.apply_match(request).await;
        if result.is_ok() {
            self.invalidate_pattern_for_invoice(invoice_id).await;
            self.resolver.invalidate();
        }
        wrap(result)
    }

    pub async fn apply_batch(&self, requests: Vec<ApplyRequest>) -> Envelope<Vec<ApplyOutcome>> {
        wrap(self.applier.apply_batch(requests).await)
    }

    pub async fn auto_reconcile(&self, transaction_ids: Vec<Uuid>, invoice_ids: Vec<Uuid>) -> Envelope<Vec<ApplyOutcome>> {
        wrap(self.applier.auto_reconcile(transaction_ids, invoice_ids).await)
    }

    pub async fn ignore_transaction(&self, transaction_id: Uuid) -> Envelope<()> {
        wrap(self.applier.ignore_transaction(transaction_id).await)
    }

    pub async fn undo_reconciliation(&self, invoice_id: Option<Uuid>, transaction_id: Option<Uuid>) -> Envelope<()> {
        wrap(self.applier.undo_reconciliation(invoice_id, transaction_id).await)
    }

    pub async fn list_links(&self, invoice_id: Option<Uuid>, transaction_id: Option<Uuid>) -> Envelope<Vec<ReconciliationLink>> {
        wrap(self.repository.list_links(invoice_id, transaction_id).await)
    }

    /// Supplemented per SPEC_FULL §10.2: runs C8's pre-flight validation
    /// without mutating.
    pub async fn validate_match(&self, invoice_id: Uuid, transaction_id: Uuid, amount: Decimal) -> Envelope<()> {
        let request = ApplyRequest {
            invoice_id,
            transaction_id,
            amount,
        };
        wrap(self.applier.validate_match(&request).await)
    }

    /// Recomputes status for a bulk-changed set (§4.9), e.g. after an
    /// import or a bulk undo.
    pub async fn recompute_batch(&self, invoice_ids: &[Uuid], transaction_ids: &[Uuid]) -> Envelope<crate::batch::BatchRecomputeSummary> {
        wrap(self.batch.recompute(invoice_ids, transaction_ids).await)
    }

    /// Supplemented per SPEC_FULL §10.2: cache introspection for the
    /// HTTP surface's health/metrics endpoints.
    pub fn cache_metrics(&self) -> crate::cache::CacheMetrics {
        self.cache.metrics()
    }

    /// The pattern cache is keyed by counterparty, not invoice, so an
    /// applied link needs an extra lookup to find what to invalidate.
    async fn invalidate_pattern_for_invoice(&self, invoice_id: Uuid) {
        let Ok(mut tx) = self.repository.begin().await else { return };
        let invoice = self.repository.get_invoice(&mut tx, invoice_id).await;
        let _ = self.repository.rollback(tx).await;
        if let Ok(invoice) = invoice {
            self.patterns.invalidate(invoice.counterparty_id);
        }
    }
}
