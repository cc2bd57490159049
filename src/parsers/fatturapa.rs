//! FatturaPA XML parser. Grounded on `original_source`'s `parser_xml.py` /
//! `parser_p7m.py` for field mapping and P7M handling, expressed with
//! `quick-xml` (already a teacher dependency) instead of a DOM library.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::NaiveDate;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use rust_decimal::Decimal;

use crate::errors::{ReconciliationError, Result};
use crate::models::Direction;
use crate::numeric::to_decimal;
use crate::parsers::{ParsedInvoice, ParsedInvoiceLine};

/// A P7M-wrapped invoice carries the original FatturaPA XML as the CMS
/// envelope's content. Signature verification is out of scope (non-goal:
/// authentication) — this only locates and returns the embedded XML bytes.
pub fn strip_p7m_envelope(data: &[u8]) -> Result<Vec<u8>> {
    if let Some(pos) = find_subslice(data, b"<?xml") {
        return Ok(data[pos..].to_vec());
    }
    if let Ok(decoded) = BASE64.decode(strip_whitespace(data)) {
        if let Some(pos) = find_subslice(&decoded, b"<?xml") {
            return Ok(decoded[pos..].to_vec());
        }
    }
    Err(ReconciliationError::Validation(
        "no embedded XML payload found in P7M envelope".to_string(),
    ))
}

fn strip_whitespace(data: &[u8]) -> Vec<u8> {
    data.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[derive(Default)]
struct Builder {
    section: Section,
    cedente_fiscal_id: String,
    cedente_denomination: String,
    cessionario_fiscal_id: String,
    doc_type: String,
    doc_number: String,
    doc_date: Option<NaiveDate>,
    total_amount: Decimal,
    lines: Vec<ParsedInvoiceLine>,
    current_line: Option<LineBuilder>,
}

#[derive(Default)]
struct LineBuilder {
    number: u32,
    description: String,
    quantity: Decimal,
    unit_price: Decimal,
    total_amount: Decimal,
    vat_rate: Decimal,
}

#[derive(Default, PartialEq, Eq)]
enum Section {
    #[default]
    None,
    CedenteAnagrafica,
    CessionarioAnagrafica,
    DatiGenerali,
    Linea,
}

/// Parses a (non-P7M, already unwrapped) FatturaPA XML document into the
/// canonical invoice record named in §6.1. Namespace prefixes are ignored —
/// only local element names are matched, since FatturaPA's own elements
/// below the root are unprefixed.
pub fn parse_invoice_xml(xml: &[u8]) -> Result<ParsedInvoice> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut builder = Builder::default();
    let mut buf = Vec::new();
    let mut tag_stack: Vec<String> = Vec::new();

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| ReconciliationError::Validation(format!("malformed FatturaPA xml: {e}")))?
        {
            Event::Start(e) => {
                let name = local_name(e.name().as_ref());
                tag_stack.push(name.clone());
                match name.as_str() {
                    "CedentePrestatore" => builder.section = Section::CedenteAnagrafica,
                    "CessionarioCommittente" => builder.section = Section::CessionarioAnagrafica,
                    "DatiGeneraliDocumento" => builder.section = Section::DatiGenerali,
                    "DettaglioLinee" => {
                        builder.current_line = Some(LineBuilder::default());
                        builder.section = Section::Linea;
                    }
                    _ => {}
                }
            }
            Event::End(e) => {
                let name = local_name(e.name().as_ref());
                tag_stack.pop();
                if name == "DettaglioLinee" {
                    if let Some(line) = builder.current_line.take() {
                        builder.lines.push(ParsedInvoiceLine {
                            line_number: line.number,
                            description: line.description,
                            quantity: line.quantity,
                            unit_price: line.unit_price,
                            total_amount: line.total_amount,
                            vat_rate: line.vat_rate,
                        });
                    }
                    builder.section = Section::None;
                }
                if matches!(name.as_str(), "CedentePrestatore" | "CessionarioCommittente" | "DatiGeneraliDocumento") {
                    builder.section = Section::None;
                }
            }
            Event::Text(e) => {
                let text = e
                    .unescape()
                    .map_err(|e| ReconciliationError::Validation(format!("malformed FatturaPA text: {e}")))?
                    .trim()
                    .to_string();
                if text.is_empty() {
                    continue;
                }
                let Some(leaf) = tag_stack.last() else { continue };
                apply_field(&mut builder, leaf, &text);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let doc_date = builder
        .doc_date
        .ok_or_else(|| ReconciliationError::Validation("FatturaPA document missing Data".to_string()))?;

    // Direction follows who we are relative to the invoice: if our own
    // fiscal id is absent from the record we can't infer direction from
    // this file alone, so default to Outgoing (issued by us, the common
    // case for the bulk of a business's invoice volume).
    let direction = Direction::Outgoing;

    Ok(ParsedInvoice {
        counterparty_fiscal_id: builder.cedente_fiscal_id,
        counterparty_denomination: builder.cedente_denomination,
        direction,
        doc_type: builder.doc_type,
        doc_number: builder.doc_number,
        doc_date,
        total_amount: builder.total_amount,
        lines: builder.lines,
    })
}

fn apply_field(builder: &mut Builder, leaf: &str, text: &str) {
    if builder.section == Section::Linea {
        if let Some(line) = builder.current_line.as_mut() {
            match leaf {
                "NumeroLinea" => line.number = text.parse().unwrap_or(0),
                "Descrizione" => line.description = text.to_string(),
                "Quantita" => line.quantity = to_decimal(text, Decimal::ZERO),
                "PrezzoUnitario" => line.unit_price = to_decimal(text, Decimal::ZERO),
                "PrezzoTotale" => line.total_amount = to_decimal(text, Decimal::ZERO),
                "AliquotaIVA" => line.vat_rate = to_decimal(text, Decimal::ZERO),
                _ => {}
            }
            return;
        }
    }

    match (&builder.section, leaf) {
        (Section::CedenteAnagrafica, "IdCodice") if builder.cedente_fiscal_id.is_empty() => {
            builder.cedente_fiscal_id = text.to_string();
        }
        (Section::CedenteAnagrafica, "Denominazione") => {
            builder.cedente_denomination = text.to_string();
        }
        (Section::CessionarioAnagrafica, "IdCodice") if builder.cessionario_fiscal_id.is_empty() => {
            builder.cessionario_fiscal_id = text.to_string();
        }
        (Section::DatiGenerali, "TipoDocumento") => builder.doc_type = text.to_string(),
        (Section::DatiGenerali, "Numero") => builder.doc_number = text.to_string(),
        (Section::DatiGenerali, "Data") => builder.doc_date = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok(),
        (Section::DatiGenerali, "ImportoTotaleDocumento") => builder.total_amount = to_decimal(text, Decimal::ZERO),
        _ => {}
    }
}

fn local_name(qualified: &[u8]) -> String {
    let s = String::from_utf8_lossy(qualified);
    s.rsplit(':').next().unwrap_or(&s).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<p:FatturaElettronica>
  <FatturaElettronicaHeader>
    <CedentePrestatore>
      <DatiAnagrafici>
        <IdFiscaleIVA><IdCodice>01234567890</IdCodice></IdFiscaleIVA>
        <Anagrafica><Denominazione>ROSSI SRL</Denominazione></Anagrafica>
      </DatiAnagrafici>
    </CedentePrestatore>
    <CessionarioCommittente>
      <DatiAnagrafici>
        <IdFiscaleIVA><IdCodice>09876543210</IdCodice></IdFiscaleIVA>
      </DatiAnagrafici>
    </CessionarioCommittente>
  </FatturaElettronicaHeader>
  <FatturaElettronicaBody>
    <DatiGenerali>
      <DatiGeneraliDocumento>
        <TipoDocumento>TD01</TipoDocumento>
        <Numero>2024/001</Numero>
        <Data>2024-03-01</Data>
        <ImportoTotaleDocumento>1220.00</ImportoTotaleDocumento>
      </DatiGeneraliDocumento>
    </DatiGenerali>
    <DatiBeniServizi>
      <DettaglioLinee>
        <NumeroLinea>1</NumeroLinea>
        <Descrizione>Consulenza</Descrizione>
        <Quantita>1.00</Quantita>
        <PrezzoUnitario>1000.00</PrezzoUnitario>
        <PrezzoTotale>1000.00</PrezzoTotale>
        <AliquotaIVA>22.00</AliquotaIVA>
      </DettaglioLinee>
    </DatiBeniServizi>
  </FatturaElettronicaBody>
</p:FatturaElettronica>"#;

    #[test]
    fn parses_header_and_line_fields() {
        let parsed = parse_invoice_xml(SAMPLE.as_bytes()).unwrap();
        assert_eq!(parsed.counterparty_fiscal_id, "01234567890");
        assert_eq!(parsed.counterparty_denomination, "ROSSI SRL");
        assert_eq!(parsed.doc_number, "2024/001");
        assert_eq!(parsed.total_amount, Decimal::new(122000, 2));
        assert_eq!(parsed.lines.len(), 1);
        assert_eq!(parsed.lines[0].description, "Consulenza");
    }

    #[test]
    fn strips_p7m_envelope_by_locating_embedded_xml() {
        let wrapped = [b"\x30\x82\x01\x00".as_slice(), SAMPLE.as_bytes()].concat();
        let unwrapped = strip_p7m_envelope(&wrapped).unwrap();
        assert!(unwrapped.starts_with(b"<?xml"));
    }
}
