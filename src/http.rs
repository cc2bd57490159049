//! Thin actix-web adapter over the façade (§4.13/§6.2). Request/response
//! DTOs only — no business logic lives here.

use std::sync::Arc;

use actix_web::{web, HttpResponse};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::applier::ApplyRequest;
use crate::facade::ReconciliationFacade;

#[derive(Debug, Deserialize)]
pub struct SuggestionsQuery {
    pub transaction_id: Uuid,
    pub counterparty_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ApplyBody {
    pub invoice_id: Uuid,
    pub transaction_id: Uuid,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct AutoReconcileBody {
    pub transaction_ids: Vec<Uuid>,
    pub invoice_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct LinksQuery {
    pub invoice_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
}

pub async fn suggestions_1_to_1(facade: web::Data<Arc<ReconciliationFacade>>, query: web::Query<SuggestionsQuery>) -> HttpResponse {
    let envelope = facade.get_suggestions_1_to_1(query.transaction_id, query.counterparty_id).await;
    HttpResponse::Ok().json(envelope)
}

pub async fn suggestions_n_to_m(facade: web::Data<Arc<ReconciliationFacade>>, query: web::Query<SuggestionsQuery>) -> HttpResponse {
    let envelope = facade.get_suggestions_n_to_m(query.transaction_id, query.counterparty_id).await;
    HttpResponse::Ok().json(envelope)
}

pub async fn apply(facade: web::Data<Arc<ReconciliationFacade>>, body: web::Json<ApplyBody>) -> HttpResponse {
    let envelope = facade.apply_match(body.invoice_id, body.transaction_id, body.amount).await;
    HttpResponse::Ok().json(envelope)
}

pub async fn apply_batch(facade: web::Data<Arc<ReconciliationFacade>>, body: web::Json<Vec<ApplyBody>>) -> HttpResponse {
    let requests = body
        .into_inner()
        .into_iter()
        .map(|b| ApplyRequest {
            invoice_id: b.invoice_id,
            transaction_id: b.transaction_id,
            amount: b.amount,
        })
        .collect();
    let envelope = facade.apply_batch(requests).await;
    HttpResponse::Ok().json(envelope)
}

pub async fn auto_reconcile(facade: web::Data<Arc<ReconciliationFacade>>, body: web::Json<AutoReconcileBody>) -> HttpResponse {
    let envelope = facade.auto_reconcile(body.transaction_ids.clone(), body.invoice_ids.clone()).await;
    HttpResponse::Ok().json(envelope)
}

pub async fn ignore_transaction(facade: web::Data<Arc<ReconciliationFacade>>, path: web::Path<Uuid>) -> HttpResponse {
    let envelope = facade.ignore_transaction(path.into_inner()).await;
    HttpResponse::Ok().json(envelope)
}

pub async fn undo_by_invoice(facade: web::Data<Arc<ReconciliationFacade>>, path: web::Path<Uuid>) -> HttpResponse {
    let envelope = facade.undo_reconciliation(Some(path.into_inner()), None).await;
    HttpResponse::Ok().json(envelope)
}

pub async fn undo_by_transaction(facade: web::Data<Arc<ReconciliationFacade>>, path: web::Path<Uuid>) -> HttpResponse {
    let envelope = facade.undo_reconciliation(None, Some(path.into_inner())).await;
    HttpResponse::Ok().json(envelope)
}

pub async fn validate(facade: web::Data<Arc<ReconciliationFacade>>, body: web::Json<ApplyBody>) -> HttpResponse {
    let envelope = facade.validate_match(body.invoice_id, body.transaction_id, body.amount).await;
    HttpResponse::Ok().json(envelope)
}

pub async fn list_links(facade: web::Data<Arc<ReconciliationFacade>>, query: web::Query<LinksQuery>) -> HttpResponse {
    let envelope = facade.list_links(query.invoice_id, query.transaction_id).await;
    HttpResponse::Ok().json(envelope)
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

pub async fn metrics(facade: web::Data<Arc<ReconciliationFacade>>) -> HttpResponse {
    let metrics = facade.cache_metrics();
    HttpResponse::Ok().json(serde_json::json!({
        "cache_hits": metrics.hits,
        "cache_misses": metrics.misses,
        "cache_evictions": metrics.evictions,
        "cache_refreshes": metrics.refreshes,
        "cache_hit_rate": metrics.hit_rate(),
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics))
        .route("/reconciliation/suggestions/1-to-1", web::get().to(suggestions_1_to_1))
        .route("/reconciliation/suggestions/n-to-m", web::get().to(suggestions_n_to_m))
        .route("/reconciliation/apply", web::post().to(apply))
        .route("/reconciliation/apply-batch", web::post().to(apply_batch))
        .route("/reconciliation/auto", web::post().to(auto_reconcile))
        .route("/reconciliation/validate", web::post().to(validate))
        .route("/reconciliation/links", web::get().to(list_links))
        .route("/transactions/{id}/ignore", web::post().to(ignore_transaction))
        .route("/reconciliation/by-invoice/{id}", web::delete().to(undo_by_invoice))
        .route("/reconciliation/by-transaction/{id}", web::delete().to(undo_by_transaction));
}
