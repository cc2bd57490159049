use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use reconciliation_engine::config::Config;
use reconciliation_engine::database;
use reconciliation_engine::facade::ReconciliationFacade;
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "falling back to default configuration");
        Config::default()
    });

    let pool = database::create_pool(&config.database)
        .await
        .expect("failed to initialize database pool");

    let bind_addr = format!("{}:{}", config.server.host, config.server.http_port);
    let facade: Arc<ReconciliationFacade> = ReconciliationFacade::new(pool, config);

    tracing::info!(addr = %bind_addr, "starting reconciliation-engine http server");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(Arc::clone(&facade)))
            .configure(reconciliation_engine::http::configure)
    })
    .bind(bind_addr)?
    .run()
    .await
}
