//! Bank statement CSV parser. Grounded on `original_source`'s
//! `parser_csv.py` for column heuristics, expressed with the `csv` crate.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::errors::{ReconciliationError, Result};
use crate::numeric::to_decimal;

#[derive(Debug, Clone)]
pub struct ParsedTransaction {
    pub transaction_date: NaiveDate,
    pub amount: Decimal,
    pub description: String,
    pub causal_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(alias = "Data", alias = "date", alias = "Date")]
    data: String,
    #[serde(alias = "Importo", alias = "amount", alias = "Amount")]
    importo: String,
    #[serde(alias = "Descrizione", alias = "description", alias = "Description")]
    descrizione: String,
    #[serde(alias = "Causale", alias = "causal", default)]
    causale: Option<String>,
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"];

/// Parses a bank statement CSV with Italian or English column headers and
/// locale-aware numeric formatting (delegated to C1's `to_decimal`).
pub fn parse_transactions(csv_bytes: &[u8]) -> Result<Vec<ParsedTransaction>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(csv_bytes);

    let mut out = Vec::new();
    for record in reader.deserialize::<CsvRow>() {
        let row = record.map_err(|e| ReconciliationError::Validation(format!("malformed bank csv row: {e}")))?;
        let date = parse_date(&row.data)
            .ok_or_else(|| ReconciliationError::Validation(format!("unrecognized date format: {}", row.data)))?;
        let amount = to_decimal(&row.importo, Decimal::ZERO);

        out.push(ParsedTransaction {
            transaction_date: date,
            amount,
            description: row.descrizione,
            causal_code: row.causale,
        });
    }
    Ok(out)
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text.trim(), fmt).ok())
}
