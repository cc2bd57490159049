//! External-collaborator parsers. The core (C1-C10) never depends on these
//! internals — only on the canonical `Invoice`/`BankTransaction` records in
//! `crate::models` — per the boundary spec.md draws between the engine and
//! its importers.

pub mod bank_csv;
pub mod fatturapa;

#[derive(Debug, Clone)]
pub struct ParsedInvoiceLine {
    pub line_number: u32,
    pub description: String,
    pub quantity: rust_decimal::Decimal,
    pub unit_price: rust_decimal::Decimal,
    pub total_amount: rust_decimal::Decimal,
    pub vat_rate: rust_decimal::Decimal,
}

#[derive(Debug, Clone)]
pub struct ParsedInvoice {
    pub counterparty_fiscal_id: String,
    pub counterparty_denomination: String,
    pub direction: crate::models::Direction,
    pub doc_type: String,
    pub doc_number: String,
    pub doc_date: chrono::NaiveDate,
    pub total_amount: rust_decimal::Decimal,
    pub lines: Vec<ParsedInvoiceLine>,
}
