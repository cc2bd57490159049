// Reconciliation Engine Library
// Invoice/bank-transaction reconciliation for FatturaPA-based accounting.

pub mod analyzer;
pub mod applier;
pub mod batch;
pub mod cache;
pub mod combination;
pub mod config;
pub mod database;
pub mod errors;
pub mod facade;
pub mod models;
pub mod parsers;
pub mod pattern;
pub mod repository;
pub mod resolver;
pub mod retry;
pub mod numeric;
pub mod suggestion;
pub mod http;

pub use errors::{ReconciliationError, Result};
pub use facade::ReconciliationFacade;
pub use models::*;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SERVICE_NAME: &str = "reconciliation-engine";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_service_name() {
        assert_eq!(SERVICE_NAME, "reconciliation-engine");
    }
}
