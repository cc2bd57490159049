//! C1: numeric & hashing primitives.
//!
//! Grounded on `original_source/core/utils.py`'s `to_decimal`, `quantize`,
//! `calculate_invoice_hash` and `calculate_transaction_hash`: hashing and
//! decimal coercion are total functions that never raise — bad input
//! collapses to a default rather than propagating an error, because
//! importers must be able to hash every record they see.
//!
//! Text normalization before hashing is field-specific, not one rule
//! applied everywhere: `cedente_id`/`cessionario_id`/`doc_type` are only
//! trimmed and uppercased, `doc_number` additionally has all whitespace
//! removed, and free-text descriptions have runs of whitespace collapsed
//! to a single space instead. See `normalize_identity`, `normalize_doc_number`,
//! `normalize_description`.

use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::prelude::*;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use crate::models::{Direction, EPSILON};

static DATE_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}[-/]\d{1,2}[-/]\d{1,2}$|^\d{1,2}[-/]\d{1,2}[-/]\d{2,4}$").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static CURRENCY_SYMBOLS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[€$£]").unwrap());

/// Coerces arbitrary textual/numeric input to a `Decimal`, accepting both
/// Italian (`1.234,56`) and English (`1,234.56`) monetary formats. Never
/// errors: unparseable or date-shaped input returns `default`.
pub fn to_decimal(value: &str, default: Decimal) -> Decimal {
    let trimmed = value.trim();
    if trimmed.is_empty() || matches!(trimmed.to_lowercase().as_str(), "nan" | "none" | "null" | "nat") {
        return default;
    }
    if DATE_LIKE.is_match(trimmed) {
        return default;
    }

    let no_symbols = CURRENCY_SYMBOLS.replace_all(trimmed, "");
    let cleaned = clean_numeric_format(no_symbols.trim());
    if cleaned.is_empty() || matches!(cleaned.as_str(), "-" | "+" | "." | ",") {
        return default;
    }

    match Decimal::from_str(&cleaned) {
        Ok(d) if d.is_finite() => d,
        _ => default,
    }
}

/// Also accepts native numeric types directly (no string round-trip, no
/// thousands-separator ambiguity).
pub fn to_decimal_from_f64(value: f64, default: Decimal) -> Decimal {
    if !value.is_finite() {
        return default;
    }
    Decimal::from_f64(value).unwrap_or(default)
}

fn clean_numeric_format(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let is_negative = text.starts_with('-');
    let text = text.trim_start_matches(['+', '-']);

    let has_comma = text.contains(',');
    let has_dot = text.contains('.');

    let mut cleaned = if has_comma && has_dot {
        let comma_pos = text.rfind(',').unwrap();
        let dot_pos = text.rfind('.').unwrap();
        if comma_pos > dot_pos {
            // Italian: dot = thousands, comma = decimal.
            text.replace('.', "").replace(',', ".")
        } else {
            // English: comma = thousands, dot = decimal.
            text.replace(',', "")
        }
    } else if has_comma {
        let parts: Vec<&str> = text.split(',').collect();
        if parts.len() == 2 && parts[1].len() <= 2 && parts[1].chars().all(|c| c.is_ascii_digit()) {
            text.replace(',', ".")
        } else {
            text.replace(',', "")
        }
    } else {
        text.to_string()
    };

    if cleaned.matches('.').count() > 1 {
        let parts: Vec<&str> = cleaned.split('.').collect();
        let (last, head) = parts.split_last().unwrap();
        cleaned = format!("{}.{}", head.concat(), last);
    }

    if cleaned.is_empty() {
        return String::new();
    }
    if is_negative {
        format!("-{}", cleaned)
    } else {
        cleaned
    }
}

/// Quantizes to the configured precision (default 2 decimals) with
/// banker-safe half-up rounding. Non-finite input collapses to zero.
pub fn quantize(value: Decimal, precision: u32) -> Decimal {
    value.round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero)
}

/// `|a − b| <= ε`.
pub fn within_epsilon(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() <= EPSILON
}

fn normalize_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// cedente_id/cessionario_id/doc_type: trim + uppercase only. Internal
/// whitespace is left alone — `calculate_invoice_hash` applies only
/// `.strip().upper()` to these three fields, never a whitespace collapse.
fn normalize_identity(text: &str) -> String {
    text.trim().to_uppercase()
}

/// doc_number: whitespace removed entirely, then uppercased. Unlike the
/// identity fields above, `calculate_invoice_hash` runs doc_number through
/// `multiple_whitespace.sub('', ...)` — full removal, not collapse — so
/// "2024 / 001" and "2024/001" hash identically.
fn normalize_doc_number(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), "").to_uppercase()
}

/// free-text description (transaction_hash only): non-trivial whitespace
/// runs collapse to a single space rather than being removed, matching
/// `calculate_transaction_hash`'s `multiple_whitespace.sub(' ', ...)`.
fn normalize_description(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").to_uppercase()
}

/// §4.1: `SHA-256("INV|CEDENTE|CESSIONARIO|DOCTYPE|DOCNUMBER|DATE")`, the
/// canonical form used by `original_source`'s `calculate_invoice_hash`.
pub fn invoice_hash(
    cedente_id: &str,
    cessionario_id: &str,
    doc_type: &str,
    doc_number: &str,
    doc_date: NaiveDate,
) -> String {
    let input = format!(
        "INV|{}|{}|{}|{}|{}",
        normalize_identity(cedente_id),
        normalize_identity(cessionario_id),
        normalize_identity(doc_type),
        normalize_doc_number(doc_number),
        normalize_date(doc_date),
    );
    hex_sha256(&input)
}

/// §4.1: `SHA-256("TRX|DATE|AMOUNT|DESCRIPTION")`, direction encoded by the
/// sign of the quantized amount.
pub fn transaction_hash(date: NaiveDate, amount: Decimal, description: &str) -> String {
    let amount_q = quantize(amount, 2);
    let desc = normalize_description(description);
    let desc: String = desc.chars().take(200).collect();
    let input = format!("TRX|{}|{:.2}|{}", normalize_date(date), amount_q, desc);
    hex_sha256(&input)
}

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Direction an invoice must have to be matched by a transaction of the
/// given sign (§3 "sign of a link's transaction.amount matches the
/// direction of its invoice").
pub fn expected_direction(transaction_amount: Decimal) -> Direction {
    if transaction_amount.is_sign_negative() {
        Direction::Incoming
    } else {
        Direction::Outgoing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_italian_format() {
        assert_eq!(
            to_decimal("1.234,56", Decimal::ZERO),
            Decimal::new(123456, 2)
        );
    }

    #[test]
    fn parses_english_format() {
        assert_eq!(
            to_decimal("1,234.56", Decimal::ZERO),
            Decimal::new(123456, 2)
        );
    }

    #[test]
    fn rejects_date_shaped_strings() {
        assert_eq!(to_decimal("2024-01-15", Decimal::new(7, 0)), Decimal::new(7, 0));
    }

    #[test]
    fn null_like_inputs_return_default() {
        for v in ["", "nan", "NULL", "none"] {
            assert_eq!(to_decimal(v, Decimal::new(1, 0)), Decimal::new(1, 0));
        }
    }

    #[test]
    fn quantize_rounds_half_up() {
        assert_eq!(quantize(Decimal::new(1005, 3), 2), Decimal::new(101, 2));
    }

    #[test]
    fn hash_is_stable_under_whitespace_and_case() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let a = invoice_hash("it123", "it456", "TD01", "2024/001", date);
        let b = invoice_hash(" IT123 ", "IT456", "td01", "2024 / 001", date);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_is_stable_under_equivalent_dates() {
        let d1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let a = invoice_hash("A", "B", "T", "1", d1);
        let b = invoice_hash("A", "B", "T", "1", d1);
        assert_eq!(a, b);
    }

    #[test]
    fn doc_number_whitespace_is_removed_but_identity_fields_only_trim() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let a = invoice_hash("IT 123", "B", "T", "1", date);
        let b = invoice_hash("IT123", "B", "T", "1", date);
        assert_ne!(a, b, "internal whitespace in cedente_id must not be collapsed away");

        let c = invoice_hash("A", "B", "T", "2024 / 001", date);
        let d = invoice_hash("A", "B", "T", "2024/001", date);
        assert_eq!(c, d, "doc_number whitespace is removed entirely, not just collapsed");
    }

    #[test]
    fn invoice_hash_unique_per_number() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let a = invoice_hash("A", "B", "T", "1", date);
        let b = invoice_hash("A", "B", "T", "2", date);
        assert_ne!(a, b);
    }

    #[test]
    fn transaction_hash_stable_across_amount_scales() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let a = transaction_hash(date, Decimal::new(10000, 2), "Bonifico");
        let b = transaction_hash(date, Decimal::new(100, 0), "bonifico");
        assert_eq!(a, b);
    }
}
